use std::fmt;

use lapin::protocol::{AMQPErrorKind, AMQPSoftError};

/// Error surface of the driver.
///
/// `Rejected` (a broker nack on a confirmed publish) counts as a delivery
/// failure for retry purposes, see [`MessagingError::is_delivery_failure`].
#[derive(Debug, thiserror::Error)]
pub enum MessagingError {
    #[error("connection failure: {0}")]
    Connection(String),

    #[error("message delivery failed: {0}")]
    Delivery(String),

    #[error("message rejected by broker: {0}")]
    Rejected(String),

    #[error("exchange not found: {0}")]
    ExchangeNotFound(String),

    #[error("message unroutable: {0}")]
    Routing(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("timed out waiting for a pooled connection")]
    PoolTimeout,

    #[error("{0}")]
    Remote(RemoteError),

    #[error("envelope serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl MessagingError {
    /// Transport-level failures that invalidate a pooled connection.
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, MessagingError::Connection(_))
    }

    /// Failures of the publish path itself, broker nacks included.
    pub fn is_delivery_failure(&self) -> bool {
        matches!(
            self,
            MessagingError::Delivery(_) | MessagingError::Rejected(_)
        )
    }

    /// Declaration targets that vanished or mismatched on the broker side.
    pub fn is_binding_failure(&self) -> bool {
        matches!(
            self,
            MessagingError::ExchangeNotFound(_) | MessagingError::Routing(_)
        )
    }
}

/// An error reconstructed from a peer's failure envelope.
///
/// `kind` is the remote class name when the origin module is whitelisted,
/// otherwise the generic `RemoteError`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteError {
    pub kind: String,
    pub message: String,
    pub trace: Vec<String>,
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        for line in &self.trace {
            write!(f, "\n{}", line)?;
        }
        Ok(())
    }
}

/// Rebuild a caller-facing error from the pieces of a failure envelope.
pub(crate) fn remote_error(
    class_name: &str,
    module_name: &str,
    message: String,
    trace: Vec<String>,
    allowed_remote_exmods: &[String],
) -> MessagingError {
    let kind = if allowed_remote_exmods.iter().any(|m| m == module_name) {
        class_name.to_string()
    } else {
        "RemoteError".to_string()
    };
    MessagingError::Remote(RemoteError {
        kind,
        message,
        trace,
    })
}

/// Whether a lapin error means the connection (or its channel) is gone for
/// good and the pooled connection must be discarded rather than reused.
pub(crate) fn is_connection_lost(err: &lapin::Error) -> bool {
    matches!(
        err,
        lapin::Error::InvalidChannelState(_)
            | lapin::Error::InvalidConnectionState(_)
            | lapin::Error::IOError(_)
    )
}

fn soft_error(err: &lapin::Error) -> Option<&AMQPSoftError> {
    match err {
        lapin::Error::ProtocolError(amqp) => match amqp.kind() {
            AMQPErrorKind::Soft(soft) => Some(soft),
            _ => None,
        },
        _ => None,
    }
}

/// Classify a lapin error raised while connecting or declaring topology.
pub(crate) fn connection_error(err: lapin::Error) -> MessagingError {
    match soft_error(&err) {
        Some(AMQPSoftError::NOTFOUND) => MessagingError::ExchangeNotFound(err.to_string()),
        Some(AMQPSoftError::PRECONDITIONFAILED) => MessagingError::Routing(err.to_string()),
        _ => MessagingError::Connection(err.to_string()),
    }
}

/// Classify a lapin error raised while publishing on an established channel.
pub(crate) fn publish_error(err: lapin::Error) -> MessagingError {
    match soft_error(&err) {
        Some(AMQPSoftError::NOTFOUND) => MessagingError::ExchangeNotFound(err.to_string()),
        Some(AMQPSoftError::PRECONDITIONFAILED) => MessagingError::Routing(err.to_string()),
        _ => MessagingError::Delivery(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_error_keeps_kind_for_allowed_modules() {
        let allowed = vec!["oslo_messaging.exceptions".to_string()];
        let err = remote_error(
            "MessagingException",
            "oslo_messaging.exceptions",
            "Error message".to_string(),
            vec!["TRACE HERE".to_string()],
            &allowed,
        );
        match err {
            MessagingError::Remote(remote) => {
                assert_eq!(remote.kind, "MessagingException");
                assert_eq!(remote.to_string(), "Error message\nTRACE HERE");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn remote_error_downgrades_unknown_modules() {
        let err = remote_error(
            "EvilException",
            "some.random.module",
            "boom".to_string(),
            vec![],
            &[],
        );
        match err {
            MessagingError::Remote(remote) => {
                assert_eq!(remote.kind, "RemoteError");
                assert_eq!(remote.message, "boom");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn delivery_failure_classification() {
        assert!(MessagingError::Rejected("nack".into()).is_delivery_failure());
        assert!(MessagingError::Delivery("io".into()).is_delivery_failure());
        assert!(!MessagingError::Connection("gone".into()).is_delivery_failure());
        assert!(MessagingError::Connection("gone".into()).is_connection_loss());
        assert!(MessagingError::ExchangeNotFound("e".into()).is_binding_failure());
        assert!(MessagingError::Routing("r".into()).is_binding_failure());
    }
}
