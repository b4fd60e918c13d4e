//! QueueListenerController - 登録された listener のワーカー群を管理
//!
//! - `register(listener, n)` で n 本のワーカーを起動する
//! - 全ワーカーは 1 つの `CancellationToken` を共有する
//! - `stop(timeout)` は停止要求を出し、timeout まで join を待つ

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::listener::QueueListener;

/// Worker group handle for queue listeners.
/// - `request_shutdown()` で全ワーカーに停止を通知
/// - `stop(timeout)` で停止 + join（timeout 付き）
pub struct QueueListenerController {
    cancel: CancellationToken,
    workers: Vec<JoinHandle<()>>,
}

impl QueueListenerController {
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            workers: Vec::new(),
        }
    }

    /// Spawn `workers` tasks running `listener`.
    pub fn register<T>(&mut self, listener: Arc<QueueListener<T>>, workers: usize)
    where
        T: DeserializeOwned + Send + Sync + 'static,
    {
        info!(listener = %listener.name(), workers, "registering queue listener");
        for worker_id in 0..workers {
            let listener = Arc::clone(&listener);
            let token = self.cancel.child_token();
            self.workers.push(tokio::spawn(listener.run(worker_id, token)));
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Stop taking new messages and cancel in-flight lease renewals.
    /// Handlers already running are left to finish.
    pub fn request_shutdown(&self) {
        self.cancel.cancel();
    }

    /// Shut down and wait up to `timeout` for every worker. Returns `false`
    /// if some worker was still busy when the time ran out.
    pub async fn stop(self, timeout: Duration) -> bool {
        self.request_shutdown();
        let count = self.workers.len();
        let joined = tokio::time::timeout(timeout, async move {
            for worker in self.workers {
                let _ = worker.await;
            }
        })
        .await
        .is_ok();
        if joined {
            info!(workers = count, "queue listeners stopped");
        } else {
            warn!(workers = count, ?timeout, "queue listeners did not stop in time");
        }
        joined
    }
}

impl Default for QueueListenerController {
    fn default() -> Self {
        Self::new()
    }
}
