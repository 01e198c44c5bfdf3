//! Background task shutdown

use tokio::task::JoinHandle;
use tracing::warn;

/// Wait for a cancelled background task to exit. Returns `false` if the
/// task panicked.
pub(crate) async fn join_task(cluster_name: &str, task: &str, handle: JoinHandle<()>) -> bool {
    match handle.await {
        Ok(()) => true,
        Err(e) if e.is_panic() => {
            warn!(cluster = %cluster_name, task, error = %e, "background task panicked");
            false
        }
        Err(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_join_task_reports_panics() {
        let clean = tokio::spawn(async {});
        assert!(join_task("c1", "schema refresh", clean).await);

        let panicked = tokio::spawn(async { panic!("refresh blew up") });
        assert!(!join_task("c1", "schema refresh", panicked).await);
    }
}
