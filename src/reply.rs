use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::engine::Engine;
use crate::errors::MessagingError;
use crate::message::{ReplyEnvelope, RpcReplyIncomingMessage};
use crate::poller::{Poller, ReplyBindings};
use crate::retry::{self, RetryPolicy};

type ReplyOutcome = Result<Value, MessagingError>;
type WaiterMap = std::sync::Mutex<HashMap<String, oneshot::Sender<ReplyOutcome>>>;

/// Singleton per client: owns the unique reply queue, consumes it in the
/// background and completes the waiter registered for each correlation id.
///
/// Every registered waiter is completed exactly once: by the reply, by the
/// caller's deadline (the caller deregisters), or by `cleanup`. Replies
/// with no registered waiter are discarded.
pub struct ReplyListener {
    engine: Arc<Engine>,
    waiters: Arc<WaiterMap>,
    inner: tokio::sync::Mutex<Option<ReplyConsumer>>,
}

struct ReplyConsumer {
    queue_name: String,
    poller: Arc<Poller>,
    pump: JoinHandle<()>,
}

impl ReplyListener {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            waiters: Arc::new(std::sync::Mutex::new(HashMap::new())),
            inner: tokio::sync::Mutex::new(None),
        }
    }

    /// Name of this client's reply queue. The first call declares the queue
    /// and starts consuming it, eagerly connecting under the given deadline
    /// so that no reply can be lost to a not-yet-declared queue.
    pub async fn reply_queue_name(
        &self,
        deadline: Option<Instant>,
    ) -> Result<String, MessagingError> {
        let mut inner = self.inner.lock().await;
        if let Some(consumer) = inner.as_ref() {
            return Ok(consumer.queue_name.clone());
        }

        let config = self.engine.config();
        let queue_name = self.engine.new_reply_queue_name();
        let poller = Arc::new(Poller::new(
            self.engine.clone(),
            config.rpc_reply_listener_prefetch_count,
            Box::new(ReplyBindings {
                queue: queue_name.clone(),
            }),
        ));
        poller.start().await;

        let policy = RetryPolicy::new(
            config.rpc_reply_retry_attempts,
            config.rpc_reply_retry_delay_duration(),
        );
        let connected = retry::run_with(policy.as_ref(), deadline, |_| true, || {
            let poller = poller.clone();
            Box::pin(async move { poller.reconnect().await })
        })
        .await;
        if let Err(e) = connected {
            poller.cleanup().await;
            return Err(e);
        }

        let pump = tokio::spawn(pump_replies(
            poller.clone(),
            self.waiters.clone(),
            self.engine.clone(),
        ));
        debug!(%queue_name, "reply listener started");
        *inner = Some(ReplyConsumer {
            queue_name: queue_name.clone(),
            poller,
            pump,
        });
        Ok(queue_name)
    }

    /// Register a completion sink for `msg_id`. The returned receiver
    /// resolves with the reply outcome when it arrives.
    pub fn register_reply_waiter(&self, msg_id: &str) -> oneshot::Receiver<ReplyOutcome> {
        let (tx, rx) = oneshot::channel();
        let mut waiters = self.waiters.lock().unwrap();
        if waiters.insert(msg_id.to_string(), tx).is_some() {
            // correlation ids are fresh uuids, this indicates a caller bug
            warn!(msg_id, "replaced existing reply waiter for correlation id");
        }
        rx
    }

    /// Remove the waiter for `msg_id`, if still present.
    pub fn deregister_reply_waiter(&self, msg_id: &str) {
        self.waiters.lock().unwrap().remove(msg_id);
    }

    /// Stop consuming replies and fail every outstanding waiter.
    pub async fn cleanup(&self) {
        let mut inner = self.inner.lock().await;
        if let Some(consumer) = inner.take() {
            consumer.pump.abort();
            consumer.poller.cleanup().await;
        }

        let mut waiters = self.waiters.lock().unwrap();
        for (msg_id, tx) in waiters.drain() {
            let _ = tx.send(Err(MessagingError::Timeout(format!(
                "reply listener cleaned up while call '{msg_id}' was outstanding"
            ))));
        }
    }
}

/// Background pump: polls the reply queue and completes waiters. Poll
/// failures trigger reconnection on the next iteration.
async fn pump_replies(poller: Arc<Poller>, waiters: Arc<WaiterMap>, engine: Arc<Engine>) {
    let allowed = engine.config().allowed_remote_exmods.clone();
    let prefetch = engine.config().rpc_reply_listener_prefetch_count as usize;
    let retry_delay = engine.config().rpc_reply_retry_delay_duration();

    loop {
        match poller.poll(Some(Duration::from_secs(1)), prefetch).await {
            Ok(batch) => {
                for raw in batch {
                    let msg_id = raw
                        .properties
                        .correlation_id()
                        .as_ref()
                        .map(|s| s.to_string());
                    match ReplyEnvelope::from_wire(&raw.body) {
                        Ok(envelope) => {
                            let message =
                                RpcReplyIncomingMessage::from_parts(msg_id, envelope, raw.ack, &allowed);
                            if let Some(ack) = &message.ack {
                                if let Err(e) = ack.ack().await {
                                    debug!(error = %e, "failed to ack reply");
                                }
                            }
                            complete_waiter(&waiters, message);
                        }
                        Err(e) => {
                            warn!(error = %e, "dropping malformed reply");
                            if let Some(ack) = raw.ack {
                                let _ = ack.nack(false).await;
                            }
                        }
                    }
                }
            }
            Err(e) => {
                debug!(error = %e, "reply poll failed, will reconnect");
                tokio::time::sleep(retry_delay).await;
            }
        }
    }
}

/// Complete the waiter registered for a reply's correlation id. Returns
/// whether a waiter was found and completed; late or unsolicited replies
/// are dropped.
fn complete_waiter(waiters: &WaiterMap, message: RpcReplyIncomingMessage) -> bool {
    let msg_id = match message.msg_id {
        Some(msg_id) => msg_id,
        None => {
            debug!("reply without correlation id discarded");
            return false;
        }
    };
    match waiters.lock().unwrap().remove(&msg_id) {
        Some(tx) => tx.send(message.outcome).is_ok(),
        None => {
            debug!(%msg_id, "late reply discarded");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::config::DriverConfig;

    fn listener() -> ReplyListener {
        let engine = Arc::new(Engine::new(DriverConfig::default()).unwrap());
        ReplyListener::new(engine)
    }

    fn reply(msg_id: &str, value: Value) -> RpcReplyIncomingMessage {
        RpcReplyIncomingMessage::from_parts(
            Some(msg_id.to_string()),
            ReplyEnvelope::Success { s: value },
            None,
            &[],
        )
    }

    #[tokio::test]
    async fn reply_completes_registered_waiter() {
        let listener = listener();
        let rx = listener.register_reply_waiter("id-1");

        assert!(complete_waiter(&listener.waiters, reply("id-1", json!("all fine"))));
        assert_eq!(rx.await.unwrap().unwrap(), json!("all fine"));
        assert!(listener.waiters.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn late_reply_is_discarded() {
        let listener = listener();
        assert!(!complete_waiter(&listener.waiters, reply("unknown", json!(1))));
    }

    #[tokio::test]
    async fn waiter_is_completed_at_most_once() {
        let listener = listener();
        let rx = listener.register_reply_waiter("id-2");

        assert!(complete_waiter(&listener.waiters, reply("id-2", json!(1))));
        assert!(!complete_waiter(&listener.waiters, reply("id-2", json!(2))));
        assert_eq!(rx.await.unwrap().unwrap(), json!(1));
    }

    #[tokio::test]
    async fn deregistered_waiter_ignores_its_reply() {
        let listener = listener();
        let rx = listener.register_reply_waiter("id-3");
        listener.deregister_reply_waiter("id-3");

        assert!(!complete_waiter(&listener.waiters, reply("id-3", json!(1))));
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn cleanup_fails_outstanding_waiters() {
        let listener = listener();
        let rx = listener.register_reply_waiter("id-4");

        listener.cleanup().await;

        match rx.await.unwrap() {
            Err(MessagingError::Timeout(_)) => {}
            other => panic!("expected timeout, got {other:?}"),
        }
    }
}
