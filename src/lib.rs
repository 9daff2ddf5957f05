//! RPC and notification messaging over AMQP 0-9-1 (RabbitMQ).
//!
//! Applications address endpoints with a logical [`Target`] and use three
//! verbs: fire-and-forget cast, request/reply call ([`Driver::send`]) and
//! notification publish/subscribe ([`Driver::send_notification`],
//! [`Driver::listen_for_notifications`]). The driver maps these onto AMQP
//! exchanges and queues, publishes with optional broker confirms, consumes
//! with prefetch and correlates replies back to their calls.

pub mod config;
pub mod driver;
pub mod engine;
pub mod errors;
pub mod message;
pub mod poller;
pub mod pool;
pub mod reply;
pub mod retry;

pub use config::DriverConfig;
pub use driver::Driver;
pub use errors::{MessagingError, RemoteError};
pub use message::{
    ContextMap, FailureInfo, IncomingMessage, MessageEnvelope, PayloadMap, ReplyEnvelope,
    RpcIncomingMessage, CONTEXT_KEY_MARKER,
};
pub use poller::{ConsumeTarget, NotificationPoller, RpcServicePoller};
pub use reply::ReplyListener;
pub use retry::RetryPolicy;

/// Logical endpoint descriptor: which exchange and topic a message goes
/// to, optionally narrowed to one server or broadcast to all of them.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
pub struct Target {
    pub exchange: Option<String>,
    pub topic: String,
    pub server: Option<String>,
    #[serde(default)]
    pub fanout: bool,
}

impl Target {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            exchange: None,
            topic: topic.into(),
            server: None,
            fanout: false,
        }
    }

    pub fn with_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = Some(exchange.into());
        self
    }

    pub fn with_server(mut self, server: impl Into<String>) -> Self {
        self.server = Some(server.into());
        self
    }

    pub fn with_fanout(mut self) -> Self {
        self.fanout = true;
        self
    }
}
