//! Supervised fire-and-forget work. Detached tasks are spawned through one
//! helper so failures always land in the log instead of vanishing.

use std::future::Future;

use async_trait::async_trait;
use tracing::{debug, error};

use loom_core::ids::SessionId;
use loom_core::model::GraphSnapshot;

/// External search-index ingestion seam. Runs off the critical path after a
/// processed message.
#[async_trait]
pub trait Indexer: Send + Sync {
    async fn ingest(
        &self,
        session_id: &SessionId,
        text: &str,
        snapshot: &GraphSnapshot,
    ) -> anyhow::Result<()>;
}

/// Spawn a detached task whose failure is logged, never silently dropped.
pub fn spawn_supervised<F>(task: &'static str, fut: F) -> tokio::task::JoinHandle<()>
where
    F: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        match fut.await {
            Ok(()) => debug!(task, "background task finished"),
            Err(e) => error!(task, error = %e, "background task failed"),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn supervised_task_runs_to_completion() {
        let handle = spawn_supervised("ok", async { Ok(()) });
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn supervised_task_failure_does_not_panic() {
        let handle = spawn_supervised("fails", async { anyhow::bail!("boom") });
        handle.await.unwrap();
    }
}
