//! Error types for the THUNDER node core.
//!
//! Errors are split by the layer that surfaces them:
//!
//! - **API**: synchronous failures returned to the embedding application
//!   ([`APIError`], [`PaymentSendFailure`])
//! - **Channel**: protocol violations detected by a channel state machine
//!   ([`ChannelError`]), which either ignore the message or force-close
//! - **Gossip / peer**: failures carrying a disciplinary action towards the
//!   sending peer ([`LightningError`], [`PeerHandleError`])
//! - **Persistence**: monitor update failures ([`ChannelMonitorUpdateErr`])
//! - **Decoding**: malformed wire data ([`DecodeError`])

use crate::msgs::ErrorMessage;
use std::borrow::Cow;
use thiserror::Error;

// ============ Wire Decoding ============

/// Errors from decoding wire messages
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// A version byte specified something we don't know how to handle
    #[error("unknown version")]
    UnknownVersion,

    /// Unknown even feature flags or message type
    #[error("unknown required feature or message type")]
    UnknownRequiredFeature,

    /// Value was invalid (bad public key, signature, enum value)
    #[error("invalid value")]
    InvalidValue,

    /// Buffer too short
    #[error("short read")]
    ShortRead,

    /// A length descriptor in the packet didn't describe the later data correctly
    #[error("bad length descriptor")]
    BadLengthDescriptor,
}

// ============ Application API ============

/// Errors returned synchronously from channel manager API calls
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum APIError {
    /// The caller violated an API precondition
    #[error("API misuse: {err}")]
    APIMisuseError {
        /// Description of the misuse
        err: Cow<'static, str>,
    },

    /// Requested fee rate is higher than we are willing to pay
    #[error("fee rate too high ({feerate} sat/kw): {err}")]
    FeeRateTooHigh {
        /// Description of the failure
        err: Cow<'static, str>,
        /// The offending fee rate
        feerate: u32,
    },

    /// A route was malformed or its fee/CLTV constraints cannot be satisfied
    #[error("route error: {err}")]
    RouteError {
        /// Description of the failure
        err: Cow<'static, str>,
    },

    /// The channel is down, unknown, or cannot take the update right now
    #[error("channel unavailable: {err}")]
    ChannelUnavailable {
        /// Description of the failure
        err: Cow<'static, str>,
    },

    /// Persisting the monitor update failed; the update was not sent
    #[error("channel monitor update failed")]
    MonitorUpdateFailed,
}

/// Result of a single path within [`PaymentSendFailure::PartialFailure`]
pub type PathResult = Result<(), APIError>;

/// Failures from [`crate::manager::ChannelManager::send_payment`]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PaymentSendFailure {
    /// A parameter covering the whole payment was invalid; nothing was sent
    #[error("payment parameter error: {0}")]
    ParameterError(APIError),

    /// One or more paths were invalid; nothing was sent
    #[error("path parameter error")]
    PathParameterError(Vec<PathResult>),

    /// Every path failed before an HTLC was committed; safe to retry
    #[error("all paths failed, retry safe")]
    AllFailedRetrySafe(Vec<APIError>),

    /// Some paths were sent and some failed
    #[error("partial failure")]
    PartialFailure(Vec<PathResult>),
}

// ============ Channel Protocol ============

/// Protocol violations detected by a channel state machine
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    /// The message is benign (for example a retransmission) and is dropped
    #[error("ignored: {0}")]
    Ignore(Cow<'static, str>),

    /// The channel must be force-closed and the peer told why
    #[error("channel closed: {0}")]
    Close(Cow<'static, str>),
}

impl ChannelError {
    /// Shorthand for a closing error
    pub fn close(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::Close(msg.into())
    }

    /// Shorthand for an ignorable error
    pub fn ignore(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::Ignore(msg.into())
    }
}

// ============ Peer / Gossip ============

/// Disciplinary action to take against the peer that sent a bad message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorAction {
    /// Disconnect the peer, optionally sending an error message first
    CloseConnection {
        /// Error message to send before disconnecting
        msg: Option<ErrorMessage>,
    },
    /// Drop the message and keep the connection
    IgnoreError,
    /// Send an error message to the peer and keep the connection
    SendErrorMessage {
        /// Error message to send
        msg: ErrorMessage,
    },
}

/// An error paired with the action to take against its source
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{err}")]
pub struct LightningError {
    /// Human-readable description
    pub err: Cow<'static, str>,
    /// What to do about the peer that caused it
    pub action: ErrorAction,
}

impl LightningError {
    /// Error whose message is dropped without penalizing the peer
    pub fn ignore(err: impl Into<Cow<'static, str>>) -> Self {
        Self {
            err: err.into(),
            action: ErrorAction::IgnoreError,
        }
    }

    /// Error that closes the connection to the peer
    pub fn close_connection(err: impl Into<Cow<'static, str>>) -> Self {
        Self {
            err: err.into(),
            action: ErrorAction::CloseConnection { msg: None },
        }
    }
}

/// Error from the peer manager indicating the socket must be closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("peer sent invalid data or we decided to disconnect (no_connection_possible: {no_connection_possible})")]
pub struct PeerHandleError {
    /// Whether channels with this peer should be force-closed because we
    /// can never talk to it again (for example it requires unknown features)
    pub no_connection_possible: bool,
}

// ============ Persistence ============

/// Failure reported by a [`crate::chain::Persist`] implementation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ChannelMonitorUpdateErr {
    /// The update could not be stored yet; the channel freezes until the
    /// embedder reports completion
    #[error("temporary monitor update failure")]
    TemporaryFailure,

    /// The update can never be stored; the channel must be force-closed
    #[error("permanent monitor update failure")]
    PermanentFailure,
}

/// A monitor rejected an update as inconsistent with its state
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("monitor update error: {0}")]
pub struct MonitorUpdateError(pub Cow<'static, str>);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lightning_error_constructors() {
        let e = LightningError::ignore("stale");
        assert_eq!(e.action, ErrorAction::IgnoreError);
        assert_eq!(e.to_string(), "stale");

        let e = LightningError::close_connection("bad sig");
        assert!(matches!(e.action, ErrorAction::CloseConnection { msg: None }));
    }

    #[test]
    fn test_channel_error_display() {
        assert_eq!(
            ChannelError::close("reserve").to_string(),
            "channel closed: reserve"
        );
    }

    #[test]
    fn test_api_error_display() {
        let e = APIError::FeeRateTooHigh {
            err: "too high".into(),
            feerate: 1000,
        };
        assert!(e.to_string().contains("1000"));
    }
}
