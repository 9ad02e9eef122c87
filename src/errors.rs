// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the AMQP Bridge
//!
//! Three families of errors are kept apart because they travel on different paths:
//! - `ConfigError` is raised synchronously while the bridge is being built and is never retried.
//! - `AmqpError` covers connectivity: connection, channel, queue and consumer failures.
//! - `PublishError` is resolved onto the result of an individual publish call.

use std::time::Duration;
use thiserror::Error;

/// Errors raised while interpreting a connection description.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The connection URI could not be parsed
    #[error("invalid connection uri: {0}")]
    InvalidUri(String),

    /// The URI scheme is neither `amqp` nor `amqps`
    #[error("unsupported scheme `{0}`")]
    UnsupportedScheme(String),

    /// A publish target address is malformed
    #[error("invalid target address `{0}`: {1}")]
    InvalidTargetAddress(String, String),

    /// A recognized tuning key carries a value that cannot be parsed
    #[error("invalid value `{1}` for `{0}`")]
    InvalidTuningValue(String, String),

    /// The trusted certificates are not PEM encoded certificates
    #[error("invalid trusted certificates: {0}")]
    InvalidTrustedCertificates(String),

    /// The connection description document could not be read
    #[error("invalid connection description: {0}")]
    InvalidDescription(String),

    /// The broker backend cannot honour the requested TLS policy
    #[error("unsupported tls policy: {0}")]
    UnsupportedTlsPolicy(String),
}

/// Represents errors that can occur while talking to the broker.
///
/// Variants carrying a reply code come from broker-initiated closes and are what
/// the status reporter looks at when deciding between `Misconfigured` and `Failed`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error: {0}")]
    InternalError(String),

    /// The connection description is invalid
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Error establishing a connection to the broker
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// The broker refused the credentials or the virtual host
    #[error("access refused: {0}")]
    AccessRefused(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel: {0}")]
    ChannelError(String),

    /// The broker or the client library closed the channel
    #[error("channel closed ({0}): {1}")]
    ChannelClosed(u16, String),

    /// The broker or the network closed the connection
    #[error("connection closed ({0}): {1}")]
    ConnectionClosed(u16, String),

    /// The application itself closed the connection
    #[error("closed by application")]
    ClosedByApplication,

    /// A bounded broker operation did not complete in time
    #[error("`{0}` timed out after {1:?}")]
    Timeout(String, Duration),

    /// The broker refused to enable publisher confirms
    #[error("failure to enable publisher confirms: {0}")]
    ConfirmSelectError(String),

    /// A passive declare found no queue with the given name
    #[error("queue `{0}` does not exist")]
    QueueNotFound(String),

    /// The existence check found one or more missing queues
    #[error("missing queues: {0:?}")]
    MissingQueues(Vec<String>),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error binding a consumer to a queue
    #[error("failure to declare consumer on `{0}`: {1}")]
    ConsumerDeclarationError(String, String),

    /// The broker cancelled a consumer, e.g. because its queue was deleted
    #[error("consumer `{0}` cancelled by broker")]
    ConsumerCancelled(String),

    /// Error publishing a message
    #[error("failure to publish: {0}")]
    PublishingError(String),

    /// Error acknowledging a message
    #[error("failure to ack message: {0}")]
    AckMessageError(String),

    /// Error negative-acknowledging a message
    #[error("failure to nack message: {0}")]
    NackMessageError(String),
}

/// Failure outcomes of a single publish call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    /// No publisher channel is currently available
    #[error("no publisher channel available")]
    NoChannel,

    /// The target has no routing key
    #[error("target `{0}` has no routing key")]
    NoRoutingKey(String),

    /// The broker negatively confirmed the message
    #[error("negative confirm received")]
    Nacked,

    /// The broker could not route the message to any queue
    #[error("returned: {0} {1}")]
    Returned(u16, String),

    /// An acknowledgement was requested but the channel is not in confirm mode
    #[error("broker does not support publisher confirms")]
    ConfirmsUnsupported,

    /// No confirmation arrived within the pending-ack TTL
    #[error("no confirm arrived within {0:?}")]
    ConfirmTimeout(Duration),

    /// The channel carrying the publication went away before it was confirmed
    #[error("publisher channel lost before confirmation")]
    ChannelLost,

    /// The frame could not be written to the channel
    #[error("failure to publish: {0}")]
    PublishFailed(String),
}

impl PublishError {
    /// Whether a caller may reasonably retry the publication.
    ///
    /// Configuration-like outcomes (missing routing key, confirms not supported by the
    /// broker) are terminal; everything else depends on transient broker state.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            PublishError::NoRoutingKey(_) | PublishError::ConfirmsUnsupported
        )
    }
}
