use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lapin::ExchangeKind;
use serde_json::Value;
use tokio::time::Instant;
use tracing::warn;

use crate::config::DriverConfig;
use crate::engine::Engine;
use crate::errors::MessagingError;
use crate::message::{ContextMap, OutgoingMessage, PayloadMap, RpcOutgoingMessage};
use crate::poller::{NotificationPoller, RpcServicePoller};
use crate::reply::ReplyListener;
use crate::retry::{self, RetryPolicy};
use crate::Target;

/// The driver façade: cast/call RPC, notifications, listeners and
/// teardown, composed from the engine, the pools and the reply listener.
pub struct Driver {
    engine: Arc<Engine>,
    reply_listener: ReplyListener,
}

impl Driver {
    pub fn new(config: DriverConfig) -> Result<Self, MessagingError> {
        let engine = Arc::new(Engine::new(config)?);
        Ok(Self {
            reply_listener: ReplyListener::new(engine.clone()),
            engine,
        })
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Send an RPC message to `target`. With `wait_for_reply` this is a
    /// call: blocks until the reply arrives or `timeout` expires and
    /// returns the result (or raises the reconstructed remote failure).
    /// Without it this is a cast and `None` is returned once the message
    /// is confirmed.
    ///
    /// `retry` overrides `default_rpc_retry_attempts`; `-1` retries until
    /// the deadline, `0` disables retrying.
    pub async fn send(
        &self,
        target: &Target,
        context: ContextMap,
        message: PayloadMap,
        wait_for_reply: bool,
        timeout: Option<Duration>,
        retry: Option<i32>,
    ) -> Result<Option<Value>, MessagingError> {
        let expiration_time = timeout.map(|t| Instant::now() + t);
        let config = self.engine.config();
        let attempts = retry.unwrap_or(config.default_rpc_retry_attempts);
        let retrier = RetryPolicy::new(attempts, config.rpc_retry_delay_duration());

        let msg = RpcOutgoingMessage::new(self.engine.clone(), context, message)?;
        let reply_listener = wait_for_reply.then_some(&self.reply_listener);
        msg.send(target, false, reply_listener, expiration_time, retrier.as_ref())
            .await
            .map_err(pool_timeout_to_timeout)
    }

    /// Publish a notification. Transport failures are retried; when the
    /// broker reports the exchange or binding missing, the queue binding
    /// is re-declared before the next attempt.
    pub async fn send_notification(
        &self,
        target: &Target,
        context: ContextMap,
        message: PayloadMap,
        retry: Option<i32>,
    ) -> Result<(), MessagingError> {
        let config = self.engine.config();
        let attempts = retry.unwrap_or(config.default_notification_retry_attempts);
        let retrier = RetryPolicy::new(attempts, config.notification_retry_delay_duration());

        let msg = OutgoingMessage::new(self.engine.clone(), context, message)?;
        let exchange = self
            .engine
            .notification_exchange_name(target.exchange.as_deref());
        let persistent = config.notification_persistence;

        let needs_declare = AtomicBool::new(false);
        let needs_declare = &needs_declare;
        let msg = &msg;
        let exchange = exchange.as_str();
        let driver = self;
        retry::run_with(
            retrier.as_ref(),
            None,
            |e: &MessagingError| {
                if e.is_binding_failure() {
                    needs_declare.store(true, Ordering::SeqCst);
                    true
                } else {
                    e.is_connection_loss() || e.is_delivery_failure()
                }
            },
            move || {
                Box::pin(async move {
                    if needs_declare.swap(false, Ordering::SeqCst) {
                        if let Err(e) =
                            driver.declare_notification_queue_binding(target, None).await
                        {
                            // the publish below will flag the binding again
                            warn!(error = %e, "re-declaring notification binding failed");
                        }
                    }
                    msg.send(exchange, &target.topic, true, true, persistent, None, None)
                        .await
                })
            },
        )
        .await
        .map_err(pool_timeout_to_timeout)
    }

    async fn declare_notification_queue_binding(
        &self,
        target: &Target,
        timeout: Option<Duration>,
    ) -> Result<(), MessagingError> {
        let lease = self
            .engine
            .acquire(false, timeout)
            .await
            .map_err(pool_timeout_to_timeout)?;
        let exchange = self
            .engine
            .notification_exchange_name(target.exchange.as_deref());
        self.engine
            .declare_queue_binding_by_channel(
                lease.channel(),
                &exchange,
                &target.topic,
                &target.topic,
                ExchangeKind::Direct,
                self.engine.config().notification_persistence,
                None,
                false,
            )
            .await
    }

    /// Start consuming RPC requests addressed to `target`.
    pub async fn listen(&self, target: Target) -> RpcServicePoller {
        let poller = RpcServicePoller::new(self.engine.clone(), target);
        poller.start().await;
        poller
    }

    /// Start consuming notifications for the given (target, priority)
    /// pairs. `pool` overrides the queue name so that several processes
    /// share one work queue.
    pub async fn listen_for_notifications(
        &self,
        targets_and_priorities: Vec<(Target, String)>,
        pool: Option<String>,
    ) -> NotificationPoller {
        let poller =
            NotificationPoller::new(self.engine.clone(), targets_and_priorities, pool);
        poller.start().await;
        poller
    }

    /// Tear down the reply listener, failing outstanding calls.
    pub async fn cleanup(&self) {
        self.reply_listener.cleanup().await;
    }
}

/// The pool's own timeout kind does not escape the driver boundary.
fn pool_timeout_to_timeout(e: MessagingError) -> MessagingError {
    match e {
        MessagingError::PoolTimeout => MessagingError::Timeout(
            "timed out waiting for a pooled connection".to_string(),
        ),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_timeout_is_mapped_at_the_boundary() {
        assert!(matches!(
            pool_timeout_to_timeout(MessagingError::PoolTimeout),
            MessagingError::Timeout(_)
        ));
        assert!(matches!(
            pool_timeout_to_timeout(MessagingError::Rejected("nack".into())),
            MessagingError::Rejected(_)
        ));
    }

    #[tokio::test]
    async fn driver_builds_from_default_config() {
        let driver = Driver::new(DriverConfig::default()).unwrap();
        assert_eq!(driver.engine().config().pool_max_size, 10);
    }
}
