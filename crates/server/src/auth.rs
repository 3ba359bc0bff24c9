//! Request authentication
//!
//! Every method except Login carries a bearer token in the
//! `authorization` metadata. Tokens resolve against the token store;
//! lookup has to hit the database, so this is a per-call helper rather
//! than a tonic interceptor.

use tonic::{Request, Status};

use kiln_ports::TokenStore;

/// Resolves the calling user or fails with `Unauthenticated`.
pub async fn authorize<T>(tokens: &dyn TokenStore, request: &Request<T>) -> Result<String, Status> {
    let token = request
        .metadata()
        .get("authorization")
        .ok_or_else(|| Status::unauthenticated("missing authorization token"))?
        .to_str()
        .map_err(|_| Status::unauthenticated("invalid token format"))?;
    let token = token.strip_prefix("Bearer ").unwrap_or(token);

    match tokens.get(token).await {
        Ok(Some(user)) => Ok(user),
        Ok(None) => Err(Status::unauthenticated("invalid token")),
        Err(err) => Err(Status::internal(format!("cannot resolve token: {err}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use kiln_domain::DomainResult;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemTokens(Mutex<HashMap<String, String>>);

    #[async_trait]
    impl TokenStore for MemTokens {
        async fn store(&self, token: &str, user: &str) -> DomainResult<()> {
            self.0
                .lock()
                .unwrap()
                .insert(token.to_string(), user.to_string());
            Ok(())
        }

        async fn get(&self, token: &str) -> DomainResult<Option<String>> {
            Ok(self.0.lock().unwrap().get(token).cloned())
        }

        async fn prune(&self, _max_age: chrono::Duration) -> DomainResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn known_tokens_resolve_to_their_user() {
        let tokens = MemTokens::default();
        tokens.store("tok-1", "jane").await.unwrap();

        let mut request = Request::new(());
        request
            .metadata_mut()
            .insert("authorization", "tok-1".parse().unwrap());
        assert_eq!(authorize(&tokens, &request).await.unwrap(), "jane");
    }

    #[tokio::test]
    async fn bearer_prefixes_are_accepted() {
        let tokens = MemTokens::default();
        tokens.store("tok-2", "jane").await.unwrap();

        let mut request = Request::new(());
        request
            .metadata_mut()
            .insert("authorization", "Bearer tok-2".parse().unwrap());
        assert!(authorize(&tokens, &request).await.is_ok());
    }

    #[tokio::test]
    async fn unknown_and_missing_tokens_are_rejected() {
        let tokens = MemTokens::default();

        let request = Request::new(());
        let err = authorize(&tokens, &request).await.unwrap_err();
        assert_eq!(err.code(), tonic::Code::Unauthenticated);

        let mut request = Request::new(());
        request
            .metadata_mut()
            .insert("authorization", "nope".parse().unwrap());
        let err = authorize(&tokens, &request).await.unwrap_err();
        assert_eq!(err.code(), tonic::Code::Unauthenticated);
    }
}
