// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Hutch Client
//!
//! This module provides the error types returned by every fallible operation of the
//! crate. The `AmqpError` enum names the operation that failed, while `BrokerError`
//! carries the underlying transport failure reported by the AMQP client library,
//! classified into a `BrokerErrorKind` so callers can tell the broker error
//! identities apart without matching on strings.

use crate::exchange::Prefetch;
use lapin::protocol::{AMQPErrorKind, AMQPHardError, AMQPSoftError};
use std::fmt;
use thiserror::Error;

/// Broker error identities surfaced by the AMQP transport.
///
/// These mirror the reply codes a broker uses to tear down a connection or a channel,
/// plus the client-side codec failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BrokerErrorKind {
    /// The channel or connection is not open (504)
    Closed,
    /// The SASL mechanism could not be negotiated (403)
    Sasl,
    /// Username or password was refused (403)
    Credentials,
    /// No access to the requested vhost (402/530)
    Vhost,
    /// Malformed frame payload (502)
    Syntax,
    /// Frame could not be parsed (501)
    Frame,
    /// Unexpected command received (503)
    CommandInvalid,
    /// Unexpected frame received (505)
    UnexpectedFrame,
    /// Unsupported table field type
    FieldType,
    /// Any other transport failure
    Other,
}

impl fmt::Display for BrokerErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BrokerErrorKind::Closed => "channel/connection is not open",
            BrokerErrorKind::Sasl => "SASL could not negotiate a shared mechanism",
            BrokerErrorKind::Credentials => "username or password not allowed",
            BrokerErrorKind::Vhost => "no access to this vhost",
            BrokerErrorKind::Syntax => "invalid field or value inside of a frame",
            BrokerErrorKind::Frame => "frame could not be parsed",
            BrokerErrorKind::CommandInvalid => "unexpected command received",
            BrokerErrorKind::UnexpectedFrame => "unexpected frame received",
            BrokerErrorKind::FieldType => "unsupported table field type",
            BrokerErrorKind::Other => "broker error",
        };

        f.write_str(s)
    }
}

/// A transport failure reported by the AMQP client library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerError {
    pub kind: BrokerErrorKind,
    pub message: String,
}

impl BrokerError {
    pub fn new(kind: BrokerErrorKind, message: impl Into<String>) -> Self {
        BrokerError {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.kind)
    }
}

impl From<lapin::Error> for BrokerError {
    fn from(err: lapin::Error) -> Self {
        BrokerError::from(&err)
    }
}

impl From<&lapin::Error> for BrokerError {
    fn from(err: &lapin::Error) -> Self {
        let kind = match err {
            lapin::Error::InvalidChannelState(_) | lapin::Error::InvalidConnectionState(_) => {
                BrokerErrorKind::Closed
            }
            lapin::Error::ParsingError(_) => BrokerErrorKind::Frame,
            lapin::Error::SerialisationError(_) => BrokerErrorKind::FieldType,
            lapin::Error::ProtocolError(amqp) => {
                classify_protocol_error(amqp.kind(), amqp.get_message().as_str())
            }
            _ => BrokerErrorKind::Other,
        };

        BrokerError::new(kind, err.to_string())
    }
}

/// Maps a broker reply to its identity. 403 is shared by SASL and credential
/// refusals, so the reply text decides between them.
fn classify_protocol_error(kind: &AMQPErrorKind, message: &str) -> BrokerErrorKind {
    match kind {
        AMQPErrorKind::Hard(AMQPHardError::CHANNELERROR)
        | AMQPErrorKind::Hard(AMQPHardError::CONNECTIONFORCED) => BrokerErrorKind::Closed,
        AMQPErrorKind::Hard(AMQPHardError::FRAMEERROR) => BrokerErrorKind::Frame,
        AMQPErrorKind::Hard(AMQPHardError::SYNTAXERROR) => BrokerErrorKind::Syntax,
        AMQPErrorKind::Hard(AMQPHardError::COMMANDINVALID) => BrokerErrorKind::CommandInvalid,
        AMQPErrorKind::Hard(AMQPHardError::UNEXPECTEDFRAME) => BrokerErrorKind::UnexpectedFrame,
        AMQPErrorKind::Hard(AMQPHardError::INVALIDPATH) => BrokerErrorKind::Vhost,
        AMQPErrorKind::Hard(AMQPHardError::NOTALLOWED) if message.contains("vhost") => {
            BrokerErrorKind::Vhost
        }
        AMQPErrorKind::Soft(AMQPSoftError::ACCESSREFUSED) => {
            if message.contains("Login") || message.contains("credentials") {
                BrokerErrorKind::Credentials
            } else if message.contains("mechanism") {
                BrokerErrorKind::Sasl
            } else {
                BrokerErrorKind::Credentials
            }
        }
        _ => BrokerErrorKind::Other,
    }
}

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// Each variant names the operation that failed. Variants wrapping a transport failure
/// carry a `BrokerError`; use [`AmqpError::kind`] to inspect its identity.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Error establishing a connection to the broker
    #[error("failure to connect: {0}")]
    ConnectionError(BrokerError),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel: {0}")]
    ChannelError(BrokerError),

    /// The connection settings do not form a valid amqp uri
    #[error("invalid amqp uri: {0}")]
    InvalidUri(String),

    /// The exchange channel is closed or was never opened
    #[error("channel is nil")]
    ChannelUnavailable,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`: {1}")]
    DeclareExchangeError(String, BrokerError),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`: {1}")]
    DeclareQueueError(String, BrokerError),

    /// Error binding a queue to an exchange
    #[error("failure to binding exchange `{0}` to queue `{1}`: {2}")]
    BindingExchangeToQueueError(String, String, BrokerError),

    /// Error starting a consumer on a queue
    #[error("failure to declare consumer `{0}`: {1}")]
    BindingConsumerError(String, BrokerError),

    /// Error cancelling a consumer
    #[error("failure to cancel consumer `{0}`: {1}")]
    CancelConsumerError(String, BrokerError),

    /// Error purging a queue
    #[error("failure to purge queue `{0}`: {1}")]
    PurgeQueueError(String, BrokerError),

    /// Error inspecting a queue
    #[error("failure to inspect queue `{0}`: {1}")]
    InspectQueueError(String, BrokerError),

    /// Error publishing a message
    #[error("failure to publish: {0}")]
    PublishingError(BrokerError),

    /// Error serializing or parsing a message payload
    #[error("failure to parse payload")]
    ParsePayloadError,

    /// Error acknowledging a message
    #[error("failure to ack message: {0}")]
    AckMessageError(BrokerError),

    /// Error negative-acknowledging a message
    #[error("failure to nack message: {0}")]
    NackMessageError(BrokerError),

    /// The message was already acked or nacked
    #[error("already acknowledged")]
    AlreadyAcknowledged,

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`: {1}")]
    QoSDeclarationError(String, BrokerError),

    /// A queue requested a prefetch setting different from the one on the shared channel
    #[error("conflicting qos on shared channel: current {current}, requested {requested}")]
    QoSConflict {
        current: Prefetch,
        requested: Prefetch,
    },

    /// The queue already has a live subscription
    #[error("queue `{0}` is already subscribed")]
    AlreadySubscribed(String),

    /// The queue subscription ended and cannot be restarted
    #[error("queue `{0}` was terminated")]
    QueueTerminated(String),

    /// Error closing the channel and/or the connection
    #[error("failure to close exchange `{exchange}`")]
    CloseError {
        exchange: String,
        channel: Option<BrokerError>,
        connection: Option<BrokerError>,
    },
}

impl AmqpError {
    /// Returns the broker error identity when this error wraps a transport failure.
    ///
    /// For `CloseError` the channel failure wins over the connection failure.
    pub fn kind(&self) -> Option<BrokerErrorKind> {
        match self {
            AmqpError::ConnectionError(e)
            | AmqpError::ChannelError(e)
            | AmqpError::DeclareExchangeError(_, e)
            | AmqpError::DeclareQueueError(_, e)
            | AmqpError::BindingExchangeToQueueError(_, _, e)
            | AmqpError::BindingConsumerError(_, e)
            | AmqpError::CancelConsumerError(_, e)
            | AmqpError::PurgeQueueError(_, e)
            | AmqpError::InspectQueueError(_, e)
            | AmqpError::PublishingError(e)
            | AmqpError::AckMessageError(e)
            | AmqpError::NackMessageError(e)
            | AmqpError::QoSDeclarationError(_, e) => Some(e.kind),
            AmqpError::ChannelUnavailable => Some(BrokerErrorKind::Closed),
            AmqpError::CloseError {
                channel,
                connection,
                ..
            } => channel.as_ref().or(connection.as_ref()).map(|e| e.kind),
            _ => None,
        }
    }
}
