use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::domain::{Task, TaskError, TaskKind};
use crate::extract::PageExtractor;
use crate::infrastructure::shutdown::Shutdown;
use crate::queue::RedisAdapter;

/// Consumes the render queue and routes each task through the extractor.
/// One worker instance serves the whole process; handler invocations run
/// back to back on the consumer loop.
pub struct Worker {
    queue: Arc<RedisAdapter>,
    extractor: Arc<PageExtractor>,
}

impl Worker {
    pub fn new(queue: Arc<RedisAdapter>, extractor: Arc<PageExtractor>) -> Self {
        Self { queue, extractor }
    }

    pub fn spawn(self: Arc<Self>, shutdown: Shutdown) -> JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(err) = self.run(shutdown).await {
                tracing::error!(target: "worker", error = %err, "queue consumer crashed");
            }
        })
    }

    async fn run(&self, shutdown: Shutdown) -> Result<(), TaskError> {
        self.queue
            .consume_queue(shutdown, |payload| self.handle(payload))
            .await
    }

    async fn handle(&self, payload: Vec<u8>) -> Result<(String, Vec<u8>), TaskError> {
        let task: Task = serde_json::from_slice(&payload)
            .map_err(|err| TaskError::BadRequest(format!("decode task: {err}")))?;

        let result = match task.kind {
            TaskKind::Extract => {
                let result = self.extractor.extract(&task).await?;
                serde_json::to_vec(&result).map_err(TaskError::internal)?
            }
            TaskKind::Screenshot => {
                let result = self.extractor.screenshot(&task).await?;
                serde_json::to_vec(&result).map_err(TaskError::internal)?
            }
        };
        Ok((task.cache_key(), result))
    }
}
