// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Client Abstraction
//!
//! The bridge drives the broker through these traits instead of a concrete client. The
//! `lapin` implementation lives in [`crate::channel`]; tests use the `mockall` mocks.
//!
//! Asynchronous signals (confirms, returns, shutdowns, recoveries) do not go through the
//! traits. A channel pushes them as [`ChannelEvent`]s into the sender it was created with,
//! and the supervisor consumes them in one dispatch loop per channel.

use crate::{errors::AmqpError, factory::ConnectionParameters};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use lapin::BasicProperties;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Sender half a channel publishes its asynchronous signals into.
pub type ChannelEventSender = mpsc::UnboundedSender<ChannelEvent>;

/// Stream of deliveries produced by a consumer.
pub type DeliveryStream = BoxStream<'static, Result<InboundDelivery, AmqpError>>;

/// Asynchronous signals raised by a broker channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Positive publisher confirm.
    Ack { delivery_tag: u64, multiple: bool },
    /// Negative publisher confirm.
    Nack { delivery_tag: u64, multiple: bool },
    /// A mandatory message could not be routed to any queue.
    Return {
        reply_code: u16,
        reply_text: String,
        exchange: String,
        routing_key: String,
    },
    /// The channel is gone.
    Shutdown(AmqpError),
    /// The client transparently recreated the channel; its broker-side state is fresh.
    Recovered,
}

/// A message delivered to one of our consumers.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundDelivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: BasicProperties,
    pub data: Vec<u8>,
}

/// Opens broker connections.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    /// Opens a connection.
    ///
    /// Implementations must invoke `params.failure_handler` both for failures of an
    /// established connection and when the connection could not be opened at all.
    async fn connect(
        &self,
        params: &ConnectionParameters,
    ) -> Result<Arc<dyn BrokerConnection>, AmqpError>;
}

/// An open broker connection.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn create_channel(
        &self,
        events: ChannelEventSender,
    ) -> Result<Arc<dyn BrokerChannel>, AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// An open broker channel.
///
/// `next_publish_seq_no` and `basic_publish` must be called under one writer lock so
/// that the number handed out is the one the broker will confirm.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    fn id(&self) -> u16;

    /// Puts the channel into publisher confirm mode.
    async fn confirm_select(&self) -> Result<(), AmqpError>;

    /// Sequence number the next `basic_publish` will be confirmed under.
    fn next_publish_seq_no(&self) -> u64;

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError>;

    /// Passively declares a queue; `AmqpError::QueueNotFound` if it does not exist.
    async fn queue_exists(&self, queue: &str) -> Result<(), AmqpError>;

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError>;

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, AmqpError>;

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}
