//! Local-job content provider
//!
//! StartLocalJob ships the workspace as a gzipped tarball. The server
//! stores it on disk and serves it over the web port; the checkout init
//! step fetches and unpacks it.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Container;

use kiln_domain::{DomainError, DomainResult};
use kiln_ports::ContentProvider;

pub struct TarballContentProvider {
    url: String,
    path: PathBuf,
}

impl TarballContentProvider {
    /// Writes the tarball for a job and returns the provider serving it.
    pub async fn store(
        content_dir: &Path,
        base_url: &str,
        name: &str,
        tarball: &[u8],
    ) -> DomainResult<Self> {
        tokio::fs::create_dir_all(content_dir)
            .await
            .map_err(|e| DomainError::Store(format!("cannot create content directory: {e}")))?;
        let path = content_dir.join(format!("{name}.tar.gz"));
        tokio::fs::write(&path, tarball)
            .await
            .map_err(|e| DomainError::Store(format!("cannot store workspace content: {e}")))?;

        Ok(TarballContentProvider {
            url: format!("{}/content/{name}", base_url.trim_end_matches('/')),
            path,
        })
    }

    /// Filename a job's tarball is stored under.
    pub fn tarball_path(content_dir: &Path, name: &str) -> PathBuf {
        content_dir.join(format!("{name}.tar.gz"))
    }
}

#[async_trait]
impl ContentProvider for TarballContentProvider {
    async fn init_container(&self) -> DomainResult<Container> {
        Ok(Container {
            image: Some("busybox:latest".to_string()),
            command: Some(vec![
                "sh".to_string(),
                "-c".to_string(),
                format!("cd /workspace && wget -q -O - {} | tar xz", self.url),
            ]),
            ..Default::default()
        })
    }

    async fn serve(&self, _job_name: &str) -> DomainResult<()> {
        if !tokio::fs::try_exists(&self.path).await.unwrap_or(false) {
            return Err(DomainError::Store(format!(
                "workspace content {} is missing",
                self.path.display()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stored_tarballs_serve_and_fetch_over_the_web_port() {
        let dir = tempfile::tempdir().unwrap();
        let provider =
            TarballContentProvider::store(dir.path(), "http://kiln.test/", "job-1", b"tar-bytes")
                .await
                .unwrap();

        provider.serve("job-1").await.unwrap();

        let container = provider.init_container().await.unwrap();
        let command = container.command.unwrap();
        assert!(command[2].contains("http://kiln.test/content/job-1"));
        assert!(command[2].contains("tar xz"));

        let stored = tokio::fs::read(dir.path().join("job-1.tar.gz")).await.unwrap();
        assert_eq!(stored, b"tar-bytes");
    }
}
