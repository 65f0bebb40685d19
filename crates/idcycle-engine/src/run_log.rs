use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use idcycle_core::config::RetryConfig;
use idcycle_core::event::{names, Event, EventBus};
use idcycle_core::types::Plan;

/// JSONL run logger.
///
/// Consumes an [`EventBus`] stream and writes one JSON object per line. The
/// format is append-only: if the process dies mid-run every line already
/// written stays intact.
pub struct RunLogger {
    path: PathBuf,
    level: u8,
}

/// A single log entry written to the JSONL file.
#[derive(Serialize)]
struct LogEntry<'a> {
    timestamp: String,
    correlation_id: &'a str,
    sequence: u64,
    event_type: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    step: Option<&'a str>,
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<&'a serde_json::Value>,
}

/// Broadcast capacity large enough for every engine event `plan` can produce,
/// plus headroom for custom events.
pub fn event_capacity(plan: &Plan, retry: &RetryConfig) -> usize {
    let steps = plan.steps.len() + plan.on_failure_steps.len();
    // StepStarted, one StepRetrying per retry, and a terminal event per step.
    let per_step = retry.max_attempts as usize + 2;
    (4 + steps * per_step * 2).max(256)
}

impl RunLogger {
    /// Log to exactly `path`.
    ///
    /// `level` controls verbosity: 1=run summary, 2=+step outcomes,
    /// 3=+retries and custom events.
    pub fn new(path: PathBuf, level: u8) -> Self {
        Self { path, level }
    }

    /// Log under `{log_dir}/{correlation_id}/{timestamp}.jsonl`.
    pub fn in_dir(log_dir: &Path, correlation_id: &str, level: u8) -> Self {
        let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        Self::new(
            log_dir
                .join(correlation_id)
                .join(format!("{}.jsonl", timestamp)),
            level,
        )
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Subscribe now and write in a background task.
    ///
    /// Subscribing before the task starts means no event published after this
    /// call returns can be missed.
    pub fn spawn(
        self,
        event_bus: &Arc<EventBus>,
        correlation_id: String,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let rx = event_bus.subscribe();
        tokio::spawn(self.run(rx, correlation_id, cancel))
    }

    /// Write entries until cancellation, bus closure, or `RunCompleted`.
    pub async fn run(
        self,
        mut rx: broadcast::Receiver<Event>,
        correlation_id: String,
        cancel: CancellationToken,
    ) {
        if let Some(parent) = self.path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                error!(error = %e, "Failed to create log directory");
                return;
            }
        }

        let file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, path = %self.path.display(), "Failed to open log file");
                return;
            }
        };

        info!(path = %self.path.display(), "RunLogger started");

        let mut writer = tokio::io::BufWriter::new(file);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("RunLogger cancelled");
                    break;
                }
                result = rx.recv() => {
                    match result {
                        Ok(event) => {
                            if self.should_log(&event.name) {
                                let entry = to_entry(&correlation_id, &event);
                                if let Ok(json) = serde_json::to_string(&entry) {
                                    let line = format!("{}\n", json);
                                    if let Err(e) = writer.write_all(line.as_bytes()).await {
                                        error!(error = %e, "Failed to write log entry");
                                        break;
                                    }
                                    // Flush after each entry for crash resilience
                                    if let Err(e) = writer.flush().await {
                                        error!(error = %e, "Failed to flush log");
                                    }
                                }
                            }

                            if event.name == names::RUN_COMPLETED {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(
                                skipped = n,
                                path = %self.path.display(),
                                "RunLogger lagged; events missing from run log"
                            );
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            debug!("EventBus closed, RunLogger stopping");
                            break;
                        }
                    }
                }
            }
        }

        // Final flush
        writer.flush().await.ok();
        debug!(path = %self.path.display(), "RunLogger finished");
    }

    fn should_log(&self, event_name: &str) -> bool {
        match event_name {
            // L1: run summary
            names::RUN_STARTED
            | names::RUN_COMPLETED
            | names::ON_FAILURE_STARTED
            | names::ON_FAILURE_COMPLETED => true,
            // L2: step outcomes
            names::STEP_STARTED
            | names::STEP_COMPLETED
            | names::STEP_FAILED
            | names::STEP_NOT_APPLICABLE => self.level >= 2,
            // L3: retries, custom events, anything else
            _ => self.level >= 3,
        }
    }
}

fn to_entry<'a>(correlation_id: &'a str, event: &'a Event) -> LogEntry<'a> {
    LogEntry {
        timestamp: event.timestamp.to_rfc3339(),
        correlation_id,
        sequence: event.sequence,
        event_type: &event.name,
        step: event.step_name.as_deref(),
        message: &event.message,
        detail: if event.data.is_null() {
            None
        } else {
            Some(&event.data)
        },
    }
}
