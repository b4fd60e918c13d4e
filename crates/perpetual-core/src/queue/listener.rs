//! QueueListener - lease queue を handler で消化するワーカーループ
//!
//! Per message:
//! 1. a renewal task extends the lease every `heartbeat - renewal_margin`;
//! 2. the handler runs on its own task, so a panic counts as a failure;
//! 3. the renewal task is cancelled and the outcome written back.
//!
//! | handler result | retries left | action             |
//! |----------------|--------------|--------------------|
//! | `Ok`           | any          | ack                |
//! | `Err` / panic  | > 0          | requeue, retries-1 |
//! | `Err` / panic  | 0            | ack (dropped)      |
//!
//! デコードできないメッセージ（poison）は consumer 側で削除され、
//! handler には届かない。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, error, info, info_span, warn};

use super::QueueSettings;
use super::consumer::QueueConsumer;
use crate::domain::{HandlerError, MessageId, QueueError, QueueMessage};
use crate::ports::Leadership;

/// QueueHandler はメッセージ 1 件の処理
///
/// `Err` を返すか panic すると失敗扱い（retries が残っていれば requeue）。
#[async_trait]
pub trait QueueHandler<T>: Send + Sync
where
    T: Send + Sync + 'static,
{
    async fn on_message(&self, message: &QueueMessage<T>) -> Result<(), HandlerError>;
}

/// What happened to one delivered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerOutcome {
    Acked,
    Requeued { retries: u32 },
    Dropped,
}

pub struct QueueListener<T>
where
    T: Send + Sync + 'static,
{
    name: String,
    consumer: Arc<QueueConsumer<T>>,
    handler: Arc<dyn QueueHandler<T>>,
    /// Set for primary-only listeners.
    leadership: Option<Arc<dyn Leadership>>,
    settings: QueueSettings,
}

impl<T> QueueListener<T>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(
        name: impl Into<String>,
        consumer: Arc<QueueConsumer<T>>,
        handler: Arc<dyn QueueHandler<T>>,
        settings: QueueSettings,
    ) -> Self {
        Self {
            name: name.into(),
            consumer,
            handler,
            leadership: None,
            settings,
        }
    }

    /// Only consume while `leadership` reports this process as primary.
    pub fn primary_only(mut self, leadership: Arc<dyn Leadership>) -> Self {
        self.leadership = Some(leadership);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn is_standby(&self) -> bool {
        self.leadership.as_ref().is_some_and(|l| !l.is_primary())
    }

    /// Worker loop. Returns once `cancel` fires; a message already leased is
    /// processed to completion first.
    pub async fn run(self: Arc<Self>, worker_id: usize, cancel: CancellationToken) {
        info!(listener = %self.name, worker_id, "queue listener started");
        loop {
            if cancel.is_cancelled() {
                break;
            }

            if self.is_standby() {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.settings.standby_poll) => continue,
                }
            }

            let next = tokio::select! {
                _ = cancel.cancelled() => break,
                next = self.consumer.get(self.settings.get_wait, self.settings.get_poll) => next,
            };

            match next {
                Ok(Some(message)) => {
                    if let Err(err) = self.process(message, &cancel).await {
                        warn!(listener = %self.name, worker_id, error = %err, "failed to settle message");
                    }
                }
                Ok(None) => {}
                Err(QueueError::Poison { id, source }) => {
                    error!(listener = %self.name, message_id = %id, error = %source, "poison message dropped");
                }
                Err(err) => {
                    warn!(listener = %self.name, worker_id, error = %err, "queue get failed");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.settings.get_poll) => {}
                    }
                }
            }
        }
        info!(listener = %self.name, worker_id, "queue listener stopped");
    }

    /// One `get` followed by `process`. `None` when nothing was delivered.
    pub async fn poll_once(&self, cancel: &CancellationToken) -> Result<Option<ListenerOutcome>, QueueError> {
        match self
            .consumer
            .get(self.settings.get_wait, self.settings.get_poll)
            .await?
        {
            Some(message) => self.process(message, cancel).await.map(Some),
            None => Ok(None),
        }
    }

    /// Run the handler for a leased message and settle it.
    pub async fn process(
        &self,
        message: QueueMessage<T>,
        cancel: &CancellationToken,
    ) -> Result<ListenerOutcome, QueueError> {
        let span = info_span!(
            "queue_message",
            listener = %self.name,
            message_id = %message.id,
            topic = %message.topic,
            retries = message.retries,
            context = ?message.global_context,
        );
        self.settle(message, cancel).instrument(span).await
    }

    async fn settle(&self, message: QueueMessage<T>, cancel: &CancellationToken) -> Result<ListenerOutcome, QueueError> {
        let id = message.id;
        let retries = message.retries;
        let message = Arc::new(message);

        let renewal = cancel.child_token();
        let renewer = tokio::spawn(
            renew_lease(
                Arc::clone(&self.consumer),
                id,
                self.settings.renewal_period(),
                renewal.clone(),
            )
            .instrument(Span::current()),
        );

        let handler = Arc::clone(&self.handler);
        let delivered = Arc::clone(&message);
        let result = tokio::spawn(async move { handler.on_message(&delivered).await }.instrument(Span::current())).await;

        renewal.cancel();
        let _ = renewer.await;

        let failure = match result {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(err.to_string()),
            Err(join_err) => Some(format!("handler panicked: {join_err}")),
        };

        match failure {
            None => {
                self.consumer.ack(id).await?;
                debug!("message acked");
                Ok(ListenerOutcome::Acked)
            }
            Some(reason) if retries > 0 => {
                let left = retries - 1;
                self.consumer.requeue(id, left).await?;
                warn!(error = %reason, retries_left = left, "message handler failed; requeued");
                Ok(ListenerOutcome::Requeued { retries: left })
            }
            Some(reason) => {
                self.consumer.ack(id).await?;
                error!(error = %reason, "message handler failed and is out of retries; dropped");
                Ok(ListenerOutcome::Dropped)
            }
        }
    }
}

async fn renew_lease<T: DeserializeOwned>(
    consumer: Arc<QueueConsumer<T>>,
    id: MessageId,
    period: Duration,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        match consumer.extend_lease(id).await {
            Ok(true) => debug!("lease extended"),
            Ok(false) => {
                warn!("message vanished while in flight; lease renewal stopped");
                break;
            }
            Err(err) => warn!(error = %err, "lease extension failed"),
        }
    }
}
