//! Watcher and housekeeping loops
//!
//! The watcher subscribes to pod events matching the marker label and
//! recomputes the job status for every event; spurious events still reach
//! the sink. Housekeeping lists all marker pods on a timer so that missed
//! watch events cannot strand a job past its timeout.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use futures::TryStreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{DeleteParams, ListParams, PropagationPolicy, WatchEvent, WatchParams};
use tracing::{debug, info, warn};

use kiln_domain::{DomainError, JobPhase, JobStatus};

use crate::{Executor, LABEL_MARKER};

const RECONNECT_DELAY: Duration = Duration::from_secs(1);
const DELETE_GRACE_SECONDS: u32 = 5;

impl Executor {
    /// Long-lived watch loop. Reconnects forever; errors are reported,
    /// never fatal.
    pub(crate) async fn monitor(self: Arc<Self>) {
        let api = self.pods();
        let wp = WatchParams::default().labels(&format!("{LABEL_MARKER}=true"));

        loop {
            match api.watch(&wp, "0").await {
                Ok(stream) => {
                    debug!("connected to Kubernetes watch");
                    let mut stream = std::pin::pin!(stream);
                    loop {
                        match stream.try_next().await {
                            Ok(Some(
                                WatchEvent::Added(pod)
                                | WatchEvent::Modified(pod)
                                | WatchEvent::Deleted(pod),
                            )) => self.handle_pod_event(pod).await,
                            Ok(Some(WatchEvent::Bookmark(_))) => {}
                            Ok(Some(WatchEvent::Error(e))) => {
                                self.notify_error(DomainError::TransientInfra(format!(
                                    "watch error: {e}"
                                )))
                                .await;
                                break;
                            }
                            Ok(None) => break,
                            Err(e) => {
                                self.notify_error(DomainError::TransientInfra(format!(
                                    "watch stream broke: {e}"
                                )))
                                .await;
                                break;
                            }
                        }
                    }
                    warn!("lost connection to Kubernetes watch");
                }
                Err(e) => {
                    self.notify_error(DomainError::TransientInfra(format!(
                        "cannot watch workloads: {e}"
                    )))
                    .await;
                }
            }

            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    }

    async fn handle_pod_event(&self, pod: Pod) {
        let status = match crate::compute_status(&pod) {
            Ok(status) => status,
            Err(err) => {
                self.notify_error(err).await;
                return;
            }
        };
        self.write_event_trace(&status, &pod);

        self.notify_update(&pod, &status).await;

        if status.phase == JobPhase::Done {
            if let Err(err) = self.delete_workload(&pod).await {
                self.notify_error(err).await;
            }
        }
    }

    /// Deletes a finished workload. Idempotent: a vanished pod is fine.
    async fn delete_workload(&self, pod: &Pod) -> Result<(), DomainError> {
        let Some(name) = pod.metadata.name.as_deref() else {
            return Ok(());
        };
        let dp = DeleteParams {
            grace_period_seconds: Some(DELETE_GRACE_SECONDS),
            propagation_policy: Some(PropagationPolicy::Foreground),
            ..Default::default()
        };
        match self.pods().delete(name, &dp).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(DomainError::TransientInfra(format!(
                "cannot delete workload {name}: {e}"
            ))),
        }
    }

    /// Periodic sweep over all marker pods, annotating timed-out jobs as
    /// failed. Runs at half the preparation timeout.
    pub(crate) async fn housekeeping(self: Arc<Self>) {
        let period = self.config().prep_timeout / 2;
        let mut tick = tokio::time::interval(period.max(Duration::from_secs(1)));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tick.tick().await;
            if let Err(err) = self.patrol().await {
                self.notify_error(err).await;
            }
        }
    }

    async fn patrol(&self) -> Result<(), DomainError> {
        let lp = ListParams::default().labels(&format!("{LABEL_MARKER}=true"));
        let pods = self
            .pods()
            .list(&lp)
            .await
            .map_err(|e| DomainError::TransientInfra(format!("cannot perform housekeeping: {e}")))?;

        for pod in pods {
            let status = match crate::compute_status(&pod) {
                Ok(status) => status,
                Err(err) => {
                    self.notify_error(err).await;
                    continue;
                }
            };

            let ttl = match status.phase {
                JobPhase::Preparing => self.config().prep_timeout,
                JobPhase::Done | JobPhase::Cleanup => continue,
                // Starting, Running and the unknown fallback all burn the
                // total budget; no phase may sit outside the sweep
                _ => self.config().total_timeout,
            };
            let Some(created) = status.metadata.created else {
                continue;
            };
            let age = chrono::Utc::now() - created;
            if age < chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX) {
                continue;
            }

            let msg = format!("job timed out during {}", status.phase);
            info!(job = %status.name, "{msg}");
            let pod_name = pod.metadata.name.as_deref().unwrap_or(&status.name);
            if let Err(err) = self
                .add_annotations(
                    pod_name,
                    &[(crate::ANNOTATION_FAILED.to_string(), msg)],
                )
                .await
            {
                self.notify_error(err).await;
            }
        }

        Ok(())
    }

    /// Appends one JSON line per watch event to the configured trace log.
    /// Trace failures never affect operation.
    pub(crate) fn write_event_trace(&self, status: &JobStatus, pod: &Pod) {
        let Some(path) = self.config().event_trace_log.as_ref() else {
            return;
        };

        let entry = serde_json::json!({
            "time": chrono::Utc::now().to_rfc3339(),
            "status": status,
            "job": pod,
        });
        let Ok(mut line) = serde_json::to_vec(&entry) else {
            return;
        };
        line.push(b'\n');

        if path.as_os_str() == "-" {
            let _ = std::io::stdout().write_all(&line);
            return;
        }
        if let Ok(mut file) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
        {
            let _ = file.write_all(&line);
        }
    }
}
