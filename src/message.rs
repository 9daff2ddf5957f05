use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lapin::acker::Acker;
use lapin::options::{BasicAckOptions, BasicNackOptions, BasicPublishOptions};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::BasicProperties;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::engine::Engine;
use crate::errors::{self, MessagingError};
use crate::reply::ReplyListener;
use crate::retry::{self, RetryPolicy};
use crate::Target;

/// Marker prepended to context keys on the wire so that one flat JSON
/// object can carry both the caller context and the payload.
pub const CONTEXT_KEY_MARKER: &str = "_$_";

/// Value of the `version` header on every outgoing message.
pub const ENVELOPE_VERSION: &str = "1.0";

pub type ContextMap = BTreeMap<String, Value>;
pub type PayloadMap = BTreeMap<String, Value>;

/// Logical message content: caller context plus payload. On the wire both
/// are merged into one object, context keys carrying the reserved marker.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MessageEnvelope {
    pub context: ContextMap,
    pub payload: PayloadMap,
}

impl MessageEnvelope {
    pub fn new(context: ContextMap, payload: PayloadMap) -> Self {
        Self { context, payload }
    }

    /// Serialize to the flat wire object. BTreeMap keys keep the output
    /// byte-stable across processes.
    pub fn to_wire(&self) -> Result<Vec<u8>, MessagingError> {
        let mut flat = BTreeMap::new();
        for (key, value) in &self.context {
            flat.insert(format!("{CONTEXT_KEY_MARKER}{key}"), value);
        }
        for (key, value) in &self.payload {
            flat.insert(key.clone(), value);
        }
        Ok(serde_json::to_vec(&flat)?)
    }

    /// Parse a wire body, partitioning marked keys back into the context.
    pub fn from_wire(body: &[u8]) -> Result<Self, MessagingError> {
        let flat: BTreeMap<String, Value> = serde_json::from_slice(body)?;
        let mut envelope = Self::default();
        for (key, value) in flat {
            match key.strip_prefix(CONTEXT_KEY_MARKER) {
                Some(context_key) => {
                    envelope.context.insert(context_key.to_string(), value);
                }
                None => {
                    envelope.payload.insert(key, value);
                }
            }
        }
        Ok(envelope)
    }
}

/// Failure description carried in a reply envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    /// Human readable message.
    pub s: String,
    /// Trace lines.
    pub t: Vec<String>,
    /// Failure kind (class name on the remote side).
    pub c: String,
    /// Module the kind originates from.
    pub m: String,
}

/// Reply wire body: `{"s": ...}` on success, `{"e": {...}}` on failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ReplyEnvelope {
    Failure { e: FailureRecord },
    Success { s: Value },
}

impl ReplyEnvelope {
    pub fn to_wire(&self) -> Result<Vec<u8>, MessagingError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_wire(body: &[u8]) -> Result<Self, MessagingError> {
        Ok(serde_json::from_slice(body)?)
    }
}

/// Failure information a server attaches to a negative reply.
#[derive(Debug, Clone)]
pub struct FailureInfo {
    pub class_name: String,
    pub module_name: String,
    pub message: String,
    pub trace: Vec<String>,
}

impl From<FailureInfo> for FailureRecord {
    fn from(info: FailureInfo) -> Self {
        FailureRecord {
            s: info.message,
            t: info.trace,
            c: info.class_name,
            m: info.module_name,
        }
    }
}

/// Acknowledgement handle for one delivery. Acks at most once; after the
/// owning channel was torn down (generation advanced) both operations
/// become no-ops because the old delivery tag is meaningless on a new
/// channel.
pub struct AckHandle {
    acker: Acker,
    generation: usize,
    live_generation: Arc<AtomicUsize>,
    done: AtomicBool,
}

impl AckHandle {
    pub(crate) fn new(acker: Acker, generation: usize, live_generation: Arc<AtomicUsize>) -> Self {
        Self {
            acker,
            generation,
            live_generation,
            done: AtomicBool::new(false),
        }
    }

    fn channel_is_current(&self) -> bool {
        self.generation == self.live_generation.load(Ordering::SeqCst)
    }

    pub async fn ack(&self) -> Result<(), MessagingError> {
        if self.done.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if !self.channel_is_current() {
            debug!("skipping ack for delivery from a torn down channel");
            return Ok(());
        }
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(errors::publish_error)
    }

    pub async fn nack(&self, requeue: bool) -> Result<(), MessagingError> {
        if self.done.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if !self.channel_is_current() {
            debug!("skipping nack for delivery from a torn down channel");
            return Ok(());
        }
        self.acker
            .nack(BasicNackOptions {
                requeue,
                ..Default::default()
            })
            .await
            .map_err(errors::publish_error)
    }
}

/// Raw consumed delivery as buffered by a poller, before any envelope
/// parsing.
pub struct RawDelivery {
    pub properties: BasicProperties,
    pub body: Vec<u8>,
    /// `None` for no-ack consumption.
    pub ack: Option<AckHandle>,
}

impl RawDelivery {
    pub fn needs_ack(&self) -> bool {
        self.ack.is_some()
    }
}

/// A consumed request or notification message.
pub struct IncomingMessage {
    pub context: ContextMap,
    pub payload: PayloadMap,
    ack: Option<AckHandle>,
}

impl IncomingMessage {
    pub(crate) fn from_parts(envelope: MessageEnvelope, ack: Option<AckHandle>) -> Self {
        Self {
            context: envelope.context,
            payload: envelope.payload,
            ack,
        }
    }

    /// Acknowledge the delivery. A no-op in no-ack mode.
    pub async fn acknowledge(&self) -> Result<(), MessagingError> {
        match &self.ack {
            Some(ack) => ack.ack().await,
            None => Ok(()),
        }
    }

    /// Return the delivery to the broker for redelivery. A no-op in no-ack
    /// mode.
    pub async fn requeue(&self) -> Result<(), MessagingError> {
        match &self.ack {
            Some(ack) => ack.nack(true).await,
            None => Ok(()),
        }
    }
}

/// A consumed RPC request. Carries the correlation id and reply queue of
/// the caller when a reply is expected.
pub struct RpcIncomingMessage {
    engine: Arc<Engine>,
    inner: IncomingMessage,
    msg_id: Option<String>,
    reply_q: Option<String>,
}

impl RpcIncomingMessage {
    pub(crate) fn from_parts(
        engine: Arc<Engine>,
        envelope: MessageEnvelope,
        msg_id: Option<String>,
        reply_q: Option<String>,
        ack: Option<AckHandle>,
    ) -> Self {
        Self {
            engine,
            inner: IncomingMessage::from_parts(envelope, ack),
            msg_id,
            reply_q,
        }
    }

    pub fn context(&self) -> &ContextMap {
        &self.inner.context
    }

    pub fn payload(&self) -> &PayloadMap {
        &self.inner.payload
    }

    pub fn msg_id(&self) -> Option<&str> {
        self.msg_id.as_deref()
    }

    pub fn reply_q(&self) -> Option<&str> {
        self.reply_q.as_deref()
    }

    pub async fn acknowledge(&self) -> Result<(), MessagingError> {
        self.inner.acknowledge().await
    }

    pub async fn requeue(&self) -> Result<(), MessagingError> {
        self.inner.requeue().await
    }

    /// Send the call outcome back to the caller. Cast messages carry no
    /// correlation id or reply queue and are skipped silently.
    pub async fn reply(
        &self,
        outcome: Result<Value, FailureInfo>,
    ) -> Result<(), MessagingError> {
        let (msg_id, reply_q) = match (&self.msg_id, &self.reply_q) {
            (Some(msg_id), Some(reply_q)) => (msg_id, reply_q),
            _ => {
                debug!("cast message received, no reply expected");
                return Ok(());
            }
        };

        let config = self.engine.config();
        let retrier = RetryPolicy::new(
            config.rpc_reply_retry_attempts,
            config.rpc_reply_retry_delay_duration(),
        );
        let message = RpcReplyOutgoingMessage::new(self.engine.clone(), msg_id.clone(), outcome);
        message.send(reply_q, None, retrier.as_ref()).await
    }
}

/// A consumed RPC reply, correlated back to its call by `msg_id`.
pub struct RpcReplyIncomingMessage {
    pub msg_id: Option<String>,
    pub outcome: Result<Value, MessagingError>,
    pub(crate) ack: Option<AckHandle>,
}

impl RpcReplyIncomingMessage {
    pub(crate) fn from_parts(
        msg_id: Option<String>,
        envelope: ReplyEnvelope,
        ack: Option<AckHandle>,
        allowed_remote_exmods: &[String],
    ) -> Self {
        let outcome = match envelope {
            ReplyEnvelope::Success { s } => Ok(s),
            ReplyEnvelope::Failure { e } => Err(errors::remote_error(
                &e.c,
                &e.m,
                e.s,
                e.t,
                allowed_remote_exmods,
            )),
        };
        Self {
            msg_id,
            outcome,
            ack,
        }
    }
}

/// Flags applied to one publication.
#[derive(Debug, Clone, Copy)]
struct PublishFlags {
    confirm: bool,
    mandatory: bool,
    persistent: bool,
}

/// One publication, retried as a whole. The message id is generated when
/// the outgoing message is built and stays stable across retries.
struct Publication<'a> {
    exchange: &'a str,
    routing_key: &'a str,
    body: &'a [u8],
    flags: PublishFlags,
    message_id: &'a str,
    correlation_id: Option<&'a str>,
    reply_to: Option<&'a str>,
}

fn build_properties(
    publication: &Publication<'_>,
    expiration: Option<Duration>,
) -> BasicProperties {
    let mut headers = FieldTable::default();
    headers.insert(
        ShortString::from("version"),
        AMQPValue::LongString(ENVELOPE_VERSION.into()),
    );

    let mut properties = BasicProperties::default()
        .with_content_type("application/json".into())
        .with_content_encoding("utf-8".into())
        .with_delivery_mode(if publication.flags.persistent { 2 } else { 1 })
        .with_headers(headers)
        .with_message_id(publication.message_id.into());

    if let Some(expiration) = expiration {
        properties = properties.with_expiration(expiration.as_millis().to_string().into());
    }
    if let Some(correlation_id) = publication.correlation_id {
        properties = properties.with_correlation_id(correlation_id.into());
    }
    if let Some(reply_to) = publication.reply_to {
        properties = properties.with_reply_to(reply_to.into());
    }
    properties
}

/// Remaining time until an absolute expiration instant. `Err` when the
/// deadline has already passed.
fn remaining_ttl(expiration_time: Option<Instant>) -> Result<Option<Duration>, MessagingError> {
    match expiration_time {
        None => Ok(None),
        Some(at) => {
            let now = Instant::now();
            if at <= now {
                Err(MessagingError::Timeout(
                    "deadline expired before publishing".to_string(),
                ))
            } else {
                Ok(Some(at - now))
            }
        }
    }
}

/// One publish attempt: lease a connection from the matching pool, publish
/// and (in confirm mode) wait for the broker verdict. Connectivity failures
/// invalidate the lease so the pooled connection is not reused.
async fn publish_once(
    engine: &Engine,
    publication: &Publication<'_>,
    expiration_time: Option<Instant>,
) -> Result<(), MessagingError> {
    let ttl = remaining_ttl(expiration_time)?;
    let mut lease = engine.acquire(publication.flags.confirm, ttl).await?;
    let properties = build_properties(publication, ttl);

    let publish = lease
        .channel()
        .basic_publish(
            publication.exchange,
            publication.routing_key,
            BasicPublishOptions {
                mandatory: publication.flags.mandatory,
                ..Default::default()
            },
            publication.body,
            properties,
        )
        .await;

    let confirm = match publish {
        Ok(confirm) => confirm,
        Err(e) => {
            if errors::is_connection_lost(&e) {
                lease.invalidate();
            }
            return Err(errors::publish_error(e));
        }
    };

    if !publication.flags.confirm {
        return Ok(());
    }

    match confirm.await {
        Ok(Confirmation::Nack(_)) => Err(MessagingError::Rejected(format!(
            "broker rejected publish to exchange '{}'",
            publication.exchange
        ))),
        Ok(Confirmation::Ack(Some(returned))) => Err(MessagingError::Routing(format!(
            "message to exchange '{}' with routing key '{}' was returned: {}",
            publication.exchange, publication.routing_key, returned.reply_text
        ))),
        Ok(_) => Ok(()),
        Err(e) => {
            if errors::is_connection_lost(&e) {
                lease.invalidate();
            }
            Err(errors::publish_error(e))
        }
    }
}

async fn publish_with_retry(
    engine: &Engine,
    publication: &Publication<'_>,
    expiration_time: Option<Instant>,
    retrier: Option<&RetryPolicy>,
) -> Result<(), MessagingError> {
    retry::run_with(
        retrier,
        expiration_time,
        |e| e.is_connection_loss() || e.is_delivery_failure(),
        || Box::pin(publish_once(engine, publication, expiration_time)),
    )
    .await
}

/// Outgoing request or notification message.
pub struct OutgoingMessage {
    engine: Arc<Engine>,
    body: Vec<u8>,
    msg_id: String,
}

impl OutgoingMessage {
    pub fn new(
        engine: Arc<Engine>,
        context: ContextMap,
        payload: PayloadMap,
    ) -> Result<Self, MessagingError> {
        let body = MessageEnvelope::new(context, payload).to_wire()?;
        Ok(Self {
            engine,
            body,
            msg_id: Uuid::new_v4().to_string(),
        })
    }

    pub fn msg_id(&self) -> &str {
        &self.msg_id
    }

    /// Publish to an explicit exchange and routing key, retrying transport
    /// and delivery failures per the retrier.
    #[allow(clippy::too_many_arguments)]
    pub async fn send(
        &self,
        exchange: &str,
        routing_key: &str,
        confirm: bool,
        mandatory: bool,
        persistent: bool,
        expiration_time: Option<Instant>,
        retrier: Option<&RetryPolicy>,
    ) -> Result<(), MessagingError> {
        let publication = Publication {
            exchange,
            routing_key,
            body: &self.body,
            flags: PublishFlags {
                confirm,
                mandatory,
                persistent,
            },
            message_id: &self.msg_id,
            correlation_id: None,
            reply_to: None,
        };
        publish_with_retry(&self.engine, &publication, expiration_time, retrier).await
    }
}

/// Outgoing RPC message: resolves the target topology, optionally registers
/// a reply waiter and blocks on it until the deadline.
pub struct RpcOutgoingMessage {
    inner: OutgoingMessage,
}

impl RpcOutgoingMessage {
    pub fn new(
        engine: Arc<Engine>,
        context: ContextMap,
        payload: PayloadMap,
    ) -> Result<Self, MessagingError> {
        Ok(Self {
            inner: OutgoingMessage::new(engine, context, payload)?,
        })
    }

    /// Send to `target`. With a reply listener this is a call: the reply is
    /// awaited under the deadline and its result or failure is surfaced.
    /// Without one this is a cast and `None` is returned.
    pub async fn send(
        &self,
        target: &Target,
        no_ack: bool,
        reply_listener: Option<&ReplyListener>,
        expiration_time: Option<Instant>,
        retrier: Option<&RetryPolicy>,
    ) -> Result<Option<Value>, MessagingError> {
        let engine = &self.inner.engine;
        let msg_id = self.inner.msg_id.clone();

        let mut registered = None;
        let mut reply_to = None;
        if let Some(listener) = reply_listener {
            reply_to = Some(listener.reply_queue_name(expiration_time).await?);
            registered = Some((listener, listener.register_reply_waiter(&msg_id)));
        }

        let exchange =
            engine.rpc_exchange_name(target.exchange.as_deref(), &target.topic, target.fanout, no_ack);
        let routing_key = if target.fanout {
            String::new()
        } else {
            engine.rpc_queue_name(&target.topic, target.server.as_deref(), no_ack)
        };

        let publication = Publication {
            exchange: &exchange,
            routing_key: &routing_key,
            body: &self.inner.body,
            flags: PublishFlags {
                confirm: !no_ack,
                mandatory: true,
                persistent: false,
            },
            message_id: &msg_id,
            correlation_id: registered.as_ref().map(|_| msg_id.as_str()),
            reply_to: reply_to.as_deref(),
        };

        let sent = publish_with_retry(engine, &publication, expiration_time, retrier).await;

        let (listener, waiter) = match registered {
            None => {
                sent?;
                return Ok(None);
            }
            Some((listener, waiter)) => {
                if let Err(e) = sent {
                    listener.deregister_reply_waiter(&msg_id);
                    return Err(e);
                }
                (listener, waiter)
            }
        };

        let received = match expiration_time {
            Some(at) => tokio::time::timeout_at(at, waiter).await,
            None => Ok(waiter.await),
        };
        listener.deregister_reply_waiter(&msg_id);

        match received {
            Ok(Ok(outcome)) => outcome.map(Some),
            Ok(Err(_)) => Err(MessagingError::Timeout(
                "reply listener went away before the reply arrived".to_string(),
            )),
            Err(_) => Err(MessagingError::Timeout(format!(
                "no reply to call '{}' before the deadline",
                msg_id
            ))),
        }
    }
}

/// Outgoing RPC reply, published into the reply exchange with the original
/// call's correlation id.
pub struct RpcReplyOutgoingMessage {
    engine: Arc<Engine>,
    correlation_id: String,
    outcome: Result<Value, FailureInfo>,
    msg_id: String,
}

impl RpcReplyOutgoingMessage {
    pub fn new(
        engine: Arc<Engine>,
        correlation_id: String,
        outcome: Result<Value, FailureInfo>,
    ) -> Self {
        Self {
            engine,
            correlation_id,
            outcome,
            msg_id: Uuid::new_v4().to_string(),
        }
    }

    pub async fn send(
        &self,
        reply_q: &str,
        expiration_time: Option<Instant>,
        retrier: Option<&RetryPolicy>,
    ) -> Result<(), MessagingError> {
        let envelope = match &self.outcome {
            Ok(result) => ReplyEnvelope::Success { s: result.clone() },
            Err(failure) => ReplyEnvelope::Failure {
                e: failure.clone().into(),
            },
        };
        let body = envelope.to_wire()?;

        let publication = Publication {
            exchange: self.engine.reply_exchange_name(),
            routing_key: reply_q,
            body: &body,
            flags: PublishFlags {
                confirm: true,
                mandatory: true,
                persistent: false,
            },
            message_id: &self.msg_id,
            correlation_id: Some(&self.correlation_id),
            reply_to: None,
        };

        let result =
            publish_with_retry(&self.engine, &publication, expiration_time, retrier).await;
        if let Err(ref e) = result {
            warn!(reply_q, error = %e, "failed to deliver rpc reply");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn sample_envelope() -> MessageEnvelope {
        let mut context = ContextMap::new();
        context.insert("request_id".to_string(), json!(555));
        context.insert("token".to_string(), json!("it is a token"));
        let mut payload = PayloadMap::new();
        payload.insert("msg_type".to_string(), json!(1));
        payload.insert("msg_str".to_string(), json!("hello"));
        MessageEnvelope::new(context, payload)
    }

    #[test]
    fn test_envelope_wire_format() {
        let body = sample_envelope().to_wire().unwrap();
        assert_eq!(
            body,
            br#"{"_$_request_id":555,"_$_token":"it is a token","msg_str":"hello","msg_type":1}"#
        );
    }

    #[test]
    fn test_envelope_round_trip() {
        let envelope = sample_envelope();
        let body = envelope.to_wire().unwrap();
        let parsed = MessageEnvelope::from_wire(&body).unwrap();
        assert_eq!(parsed, envelope);
    }

    #[test]
    fn test_envelope_partitions_marked_keys() {
        let body = br#"{"_$_key_context":"context_value","payload_key":"payload_value"}"#;
        let envelope = MessageEnvelope::from_wire(body).unwrap();
        assert_eq!(envelope.context.get("key_context"), Some(&json!("context_value")));
        assert_eq!(envelope.payload.get("payload_key"), Some(&json!("payload_value")));
        assert!(envelope.payload.get("_$_key_context").is_none());
    }

    #[test]
    fn test_success_reply_envelope() {
        let envelope = ReplyEnvelope::from_wire(br#"{"s": "all fine"}"#).unwrap();
        assert_eq!(envelope, ReplyEnvelope::Success { s: json!("all fine") });

        let body = ReplyEnvelope::Success { s: json!("all_fine") }.to_wire().unwrap();
        assert_eq!(body, br#"{"s":"all_fine"}"#);
    }

    #[test]
    fn test_failure_reply_envelope() {
        let body = br#"{"e": {"s": "Error message", "t": ["TRACE HERE"], "c": "MessagingException", "m": "oslo_messaging.exceptions"}}"#;
        let envelope = ReplyEnvelope::from_wire(body).unwrap();
        match envelope {
            ReplyEnvelope::Failure { e } => {
                assert_eq!(e.s, "Error message");
                assert_eq!(e.t, vec!["TRACE HERE".to_string()]);
                assert_eq!(e.c, "MessagingException");
                assert_eq!(e.m, "oslo_messaging.exceptions");
            }
            other => panic!("expected failure envelope, got {other:?}"),
        }
    }

    #[test]
    fn test_reply_failure_reconstruction() {
        let body = br#"{"e": {"s": "Error message", "t": ["TRACE HERE"], "c": "MessagingException", "m": "oslo_messaging.exceptions"}}"#;
        let envelope = ReplyEnvelope::from_wire(body).unwrap();
        let allowed = vec!["oslo_messaging.exceptions".to_string()];
        let message = RpcReplyIncomingMessage::from_parts(
            Some("123456789".to_string()),
            envelope,
            None,
            &allowed,
        );

        assert_eq!(message.msg_id.as_deref(), Some("123456789"));
        match message.outcome {
            Err(MessagingError::Remote(remote)) => {
                assert_eq!(remote.kind, "MessagingException");
                assert_eq!(remote.to_string(), "Error message\nTRACE HERE");
            }
            other => panic!("expected remote failure, got {other:?}"),
        }
    }

    #[test]
    fn test_reply_success_parsing() {
        let envelope = ReplyEnvelope::from_wire(br#"{"s": "all fine"}"#).unwrap();
        let message = RpcReplyIncomingMessage::from_parts(Some("42".to_string()), envelope, None, &[]);
        assert_eq!(message.msg_id.as_deref(), Some("42"));
        assert_eq!(message.outcome.unwrap(), json!("all fine"));
    }

    #[tokio::test]
    async fn test_stale_ack_handle_skips_broker_io() {
        let live = Arc::new(AtomicUsize::new(1));
        let handle = AckHandle::new(Acker::default(), 0, live);

        // generation 0 != live generation 1: both paths must be no-ops
        handle.ack().await.unwrap();
        handle.nack(true).await.unwrap();
    }

    #[tokio::test]
    async fn test_ack_handle_is_idempotent() {
        let live = Arc::new(AtomicUsize::new(1));
        let handle = AckHandle::new(Acker::default(), 0, live.clone());

        handle.ack().await.unwrap();
        // second ack must not reach the broker either way
        handle.ack().await.unwrap();
        handle.nack(false).await.unwrap();
    }

    #[test]
    fn test_remaining_ttl() {
        assert!(remaining_ttl(None).unwrap().is_none());

        let future = Instant::now() + Duration::from_secs(1);
        let ttl = remaining_ttl(Some(future)).unwrap().unwrap();
        assert!(ttl <= Duration::from_secs(1));

        let past = Instant::now();
        assert!(matches!(
            remaining_ttl(Some(past)),
            Err(MessagingError::Timeout(_))
        ));
    }

    #[test]
    fn test_properties_for_persistent_publication() {
        let publication = Publication {
            exchange: "e",
            routing_key: "rk",
            body: b"{}",
            flags: PublishFlags {
                confirm: true,
                mandatory: true,
                persistent: true,
            },
            message_id: "msg-1",
            correlation_id: Some("corr-1"),
            reply_to: Some("reply.q"),
        };
        let properties = build_properties(&publication, Some(Duration::from_secs(1)));

        assert_eq!(
            properties.content_type().as_ref().map(|s| s.to_string()),
            Some("application/json".to_string())
        );
        assert_eq!(
            properties.content_encoding().as_ref().map(|s| s.to_string()),
            Some("utf-8".to_string())
        );
        assert_eq!(*properties.delivery_mode(), Some(2));
        assert_eq!(
            properties.expiration().as_ref().map(|s| s.to_string()),
            Some("1000".to_string())
        );
        assert_eq!(
            properties.correlation_id().as_ref().map(|s| s.to_string()),
            Some("corr-1".to_string())
        );
        assert_eq!(
            properties.reply_to().as_ref().map(|s| s.to_string()),
            Some("reply.q".to_string())
        );
        assert_eq!(
            properties.message_id().as_ref().map(|s| s.to_string()),
            Some("msg-1".to_string())
        );
    }
}
