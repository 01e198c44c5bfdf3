//! Command-backed cluster labels
//!
//! A dynamic label's value is the trimmed stdout of a command, re-run on
//! the label's own period.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use kubegate_types::CommandLabel;

use crate::clock::Clock;
use crate::task::join_task;

/// Longest a single label command may run before it is killed
pub const DEFAULT_LABEL_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Periodically refreshed command labels of one cluster
pub struct DynamicLabels {
    cluster_name: String,
    labels: Arc<RwLock<BTreeMap<String, CommandLabel>>>,
    clock: Arc<dyn Clock>,
    command_timeout: Duration,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DynamicLabels {
    pub fn new(
        cluster_name: impl Into<String>,
        labels: BTreeMap<String, CommandLabel>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            labels: Arc::new(RwLock::new(labels)),
            clock,
            command_timeout: DEFAULT_LABEL_COMMAND_TIMEOUT,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Run every command once and record the results
    pub async fn sync(&self) {
        let commands: Vec<(String, Vec<String>)> = self
            .labels
            .read()
            .iter()
            .map(|(key, label)| (key.clone(), label.command.clone()))
            .collect();

        for (key, command) in commands {
            let result = run_bounded(
                self.clock.as_ref(),
                self.command_timeout,
                &self.cluster_name,
                &key,
                &command,
            )
            .await;
            if let Some(label) = self.labels.write().get_mut(&key) {
                label.result = result;
            }
        }
    }

    /// Spawn one refresh task per label
    pub fn start(&self) {
        let labels: Vec<(String, CommandLabel)> = self
            .labels
            .read()
            .iter()
            .map(|(key, label)| (key.clone(), label.clone()))
            .collect();

        let mut tasks = self.tasks.lock();
        for (key, label) in labels {
            let cluster_name = self.cluster_name.clone();
            let store = Arc::clone(&self.labels);
            let clock = Arc::clone(&self.clock);
            let cancel = self.cancel.clone();
            let command_timeout = self.command_timeout;

            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = clock.sleep(label.period) => {}
                    }

                    let result = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        result = run_bounded(
                            clock.as_ref(),
                            command_timeout,
                            &cluster_name,
                            &key,
                            &label.command,
                        ) => result,
                    };
                    if let Some(entry) = store.write().get_mut(&key) {
                        entry.result = result;
                    }
                }
                debug!(cluster = %cluster_name, label = %key, "dynamic label stopped");
            }));
        }
    }

    /// Snapshot of the labels with their latest results
    pub fn get(&self) -> BTreeMap<String, CommandLabel> {
        self.labels.read().clone()
    }

    /// Stop the refresh tasks and wait for them to exit
    pub async fn close(&self) {
        self.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            join_task(&self.cluster_name, "dynamic label", task).await;
        }
    }
}

impl Drop for DynamicLabels {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Run a label command, killing it once `timeout` passes on `clock`
async fn run_bounded(
    clock: &dyn Clock,
    timeout: Duration,
    cluster_name: &str,
    key: &str,
    command: &[String],
) -> String {
    tokio::select! {
        biased;
        result = run_command(cluster_name, key, command) => result,
        _ = clock.sleep(timeout) => {
            warn!(
                cluster = %cluster_name,
                label = %key,
                timeout = ?timeout,
                "dynamic label command timed out"
            );
            format!("error: command timed out after {:?}", timeout)
        }
    }
}

async fn run_command(cluster_name: &str, key: &str, command: &[String]) -> String {
    let Some((program, args)) = command.split_first() else {
        return "error: empty command".to_string();
    };

    match tokio::process::Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .output()
        .await
    {
        Ok(output) if output.status.success() => {
            String::from_utf8_lossy(&output.stdout).trim().to_string()
        }
        Ok(output) => {
            warn!(
                cluster = %cluster_name,
                label = %key,
                status = %output.status,
                "dynamic label command failed"
            );
            format!(
                "{} output: {}",
                output.status,
                String::from_utf8_lossy(&output.stdout).trim()
            )
        }
        Err(e) => {
            warn!(
                cluster = %cluster_name,
                label = %key,
                error = %e,
                "failed to run dynamic label command"
            );
            format!("{} output: ", e)
        }
    }
}
