//! Workload log streaming
//!
//! Attaches to a pod's containers in declaration order (init containers
//! first) and forwards their combined output as one byte stream. The
//! forwarder reconnects on transient failures, skipping bytes it already
//! delivered, and ends when the last container terminates or the pod is
//! gone.

use bytes::Bytes;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, LogParams};
use futures::AsyncReadExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::StreamReader;
use tracing::debug;

use kiln_ports::LogReader;

const POLL_DELAY: std::time::Duration = std::time::Duration::from_millis(500);
const RETRY_DELAY: std::time::Duration = std::time::Duration::from_secs(1);

/// Spawns the forwarder and returns the read half.
pub(crate) fn stream(api: Api<Pod>, pod: Pod) -> LogReader {
    let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(16);
    tokio::spawn(forward_logs(api, pod, tx));
    Box::new(StreamReader::new(ReceiverStream::new(rx)))
}

enum ContainerProgress {
    NotStarted,
    Started,
    Gone,
}

async fn forward_logs(api: Api<Pod>, pod: Pod, tx: mpsc::Sender<Result<Bytes, std::io::Error>>) {
    let Some(pod_name) = pod.metadata.name.clone() else {
        return;
    };

    let spec = pod.spec.unwrap_or_default();
    let containers: Vec<String> = spec
        .init_containers
        .iter()
        .flatten()
        .chain(spec.containers.iter())
        .map(|c| c.name.clone())
        .collect();

    for container in containers {
        loop {
            match container_progress(&api, &pod_name, &container).await {
                ContainerProgress::Gone => return,
                ContainerProgress::NotStarted => tokio::time::sleep(POLL_DELAY).await,
                ContainerProgress::Started => break,
            }
        }

        // bytes of this container already delivered downstream; re-streams
        // after a reconnect skip this many
        let mut forwarded: u64 = 0;
        loop {
            let lp = LogParams {
                follow: true,
                container: Some(container.clone()),
                ..Default::default()
            };
            match api.log_stream(&pod_name, &lp).await {
                Ok(stream) => {
                    let mut reader = Box::pin(stream);
                    let mut buf = [0u8; 4096];
                    let mut seen: u64 = 0;
                    loop {
                        match reader.read(&mut buf).await {
                            Ok(0) => break,
                            Ok(n) => {
                                let end = seen + n as u64;
                                if end > forwarded {
                                    let skip = forwarded.saturating_sub(seen) as usize;
                                    let fresh = Bytes::copy_from_slice(&buf[skip..n]);
                                    if tx.send(Ok(fresh)).await.is_err() {
                                        return;
                                    }
                                    forwarded = end;
                                }
                                seen = end;
                            }
                            Err(err) => {
                                debug!(pod = %pod_name, container = %container,
                                    "log stream broke: {err}");
                                break;
                            }
                        }
                    }
                }
                Err(err) => {
                    debug!(pod = %pod_name, container = %container,
                        "cannot attach to logs: {err}");
                }
            }

            match container_finished(&api, &pod_name, &container).await {
                Some(true) | None => break,
                Some(false) => tokio::time::sleep(RETRY_DELAY).await,
            }
        }
    }
}

async fn container_progress(api: &Api<Pod>, pod_name: &str, container: &str) -> ContainerProgress {
    let pod = match api.get(pod_name).await {
        Ok(pod) => pod,
        Err(kube::Error::Api(ae)) if ae.code == 404 => return ContainerProgress::Gone,
        Err(_) => return ContainerProgress::NotStarted,
    };
    match container_state(&pod, container) {
        Some(state) if state.running.is_some() || state.terminated.is_some() => {
            ContainerProgress::Started
        }
        _ => ContainerProgress::NotStarted,
    }
}

/// None means the pod itself is gone.
async fn container_finished(api: &Api<Pod>, pod_name: &str, container: &str) -> Option<bool> {
    let pod = match api.get(pod_name).await {
        Ok(pod) => pod,
        Err(_) => return None,
    };
    if pod.metadata.deletion_timestamp.is_some() {
        return None;
    }
    Some(
        container_state(&pod, container)
            .map(|state| state.terminated.is_some())
            .unwrap_or(false),
    )
}

fn container_state(
    pod: &Pod,
    container: &str,
) -> Option<k8s_openapi::api::core::v1::ContainerState> {
    let status = pod.status.as_ref()?;
    status
        .init_container_statuses
        .iter()
        .flatten()
        .chain(status.container_statuses.iter().flatten())
        .find(|cs| cs.name == container)
        .and_then(|cs| cs.state.clone())
}
