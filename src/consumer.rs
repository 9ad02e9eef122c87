// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Consumer
//!
//! One consumer task per (queue, replica). Each delivery is translated into an [`Envelope`]
//! and handed downstream with a [`Settlement`], the pair of continuations that ack or nack
//! the delivery. Failures inside the downstream handler, including panics, are contained per
//! delivery; ack/nack I/O failures are logged and counted but never retried, so the broker may
//! redeliver (at-least-once).

use crate::{
    broker::{BrokerChannel, DeliveryStream, InboundDelivery},
    envelope::Envelope,
    errors::AmqpError,
    otel,
    status::StatusReporter,
};
use async_trait::async_trait;
use futures_util::{FutureExt, StreamExt};
use opentelemetry::{
    global::BoxedSpan,
    trace::{Span, Status},
};
use std::{
    borrow::Cow,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, warn};

/// Failure reported by the downstream handler for one delivery.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct HandlerError(pub String);

/// The downstream processing pipeline.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    /// Processes one delivery. The handler owns the settlement and decides whether and when
    /// to accept or reject; a dropped settlement leaves the delivery unacknowledged until the
    /// channel closes.
    async fn handle(&self, envelope: Envelope, settlement: Settlement) -> Result<(), HandlerError>;
}

/// Counters of the consumer side, shared by every consumer task of a pool.
#[derive(Debug, Default)]
pub struct ConsumerMetrics {
    pub delivered: AtomicU64,
    pub acked: AtomicU64,
    pub nacked: AtomicU64,
    pub ack_failures: AtomicU64,
    pub nack_failures: AtomicU64,
    pub processing_failures: AtomicU64,
}

impl ConsumerMetrics {
    fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Accept/reject continuations of a single delivery. Consumed by either call.
pub struct Settlement {
    channel: Arc<dyn BrokerChannel>,
    address: String,
    delivery_tag: u64,
    metrics: Arc<ConsumerMetrics>,
}

impl Settlement {
    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    /// Positively acknowledges the delivery.
    pub async fn accept(self) {
        match self.channel.basic_ack(self.delivery_tag).await {
            Ok(()) => ConsumerMetrics::incr(&self.metrics.acked),
            Err(err) => {
                ConsumerMetrics::incr(&self.metrics.ack_failures);
                error!(
                    error = err.to_string(),
                    address = self.address,
                    delivery_tag = self.delivery_tag,
                    "error whiling ack msg"
                );
            }
        }
    }

    /// Negatively acknowledges the delivery, asking the broker to requeue it or not.
    pub async fn reject(self, requeue: bool) {
        match self.channel.basic_nack(self.delivery_tag, requeue).await {
            Ok(()) => ConsumerMetrics::incr(&self.metrics.nacked),
            Err(err) => {
                ConsumerMetrics::incr(&self.metrics.nack_failures);
                error!(
                    error = err.to_string(),
                    address = self.address,
                    delivery_tag = self.delivery_tag,
                    requeue,
                    "error whiling nack msg"
                );
            }
        }
    }
}

/// Everything a consumer task needs besides its stream.
#[derive(Clone)]
pub(crate) struct ConsumerContext {
    pub(crate) address: String,
    pub(crate) consumer_tag: String,
    pub(crate) channel: Arc<dyn BrokerChannel>,
    pub(crate) handler: Arc<dyn InboundHandler>,
    pub(crate) metrics: Arc<ConsumerMetrics>,
    pub(crate) reporter: StatusReporter,
}

/// Runs one consumer until it is stopped, cancelled by the broker, or its channel fails.
pub(crate) async fn run(
    ctx: ConsumerContext,
    mut deliveries: DeliveryStream,
    mut stop: watch::Receiver<bool>,
) {
    ctx.reporter.open(&ctx.address, "consumer started");
    debug!(
        address = ctx.address,
        consumer_tag = ctx.consumer_tag,
        "consumer started"
    );

    loop {
        tokio::select! {
            biased;

            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    if let Err(err) = ctx.channel.basic_cancel(&ctx.consumer_tag).await {
                        debug!(error = err.to_string(), consumer_tag = ctx.consumer_tag, "failure to cancel consumer");
                    }
                    debug!(consumer_tag = ctx.consumer_tag, "consumer stopped");
                    return;
                }
            }

            next = deliveries.next() => match next {
                Some(Ok(delivery)) => consume(&ctx, delivery).await,
                Some(Err(err)) => {
                    warn!(error = err.to_string(), address = ctx.address, "consumer channel shut down");
                    ctx.reporter.failure(&ctx.address, &err);
                    return;
                }
                None => {
                    warn!(address = ctx.address, consumer_tag = ctx.consumer_tag, "consumer cancelled by broker");
                    ctx.reporter.failure(
                        &ctx.address,
                        &AmqpError::ConsumerCancelled(ctx.consumer_tag.clone()),
                    );
                    return;
                }
            }
        }
    }
}

/// Hands one delivery downstream.
pub(crate) async fn consume(ctx: &ConsumerContext, delivery: InboundDelivery) {
    ConsumerMetrics::incr(&ctx.metrics.delivered);

    let (parent, mut span) = otel::consumer_span(&ctx.address, &delivery.properties);

    debug!(
        address = ctx.address,
        delivery_tag = delivery.delivery_tag,
        exchange = delivery.exchange,
        "received"
    );

    let settlement = Settlement {
        channel: ctx.channel.clone(),
        address: ctx.address.clone(),
        delivery_tag: delivery.delivery_tag,
        metrics: ctx.metrics.clone(),
    };
    let envelope = Envelope::from_delivery(&ctx.address, delivery, parent);

    let handled = AssertUnwindSafe(ctx.handler.handle(envelope, settlement))
        .catch_unwind()
        .await;

    match handled {
        Ok(Ok(())) => span.set_status(Status::Ok),
        Ok(Err(err)) => {
            ConsumerMetrics::incr(&ctx.metrics.processing_failures);
            warn!(error = err.to_string(), address = ctx.address, "error whiling handling msg");
            record_failure(&mut span, &err.0);
        }
        Err(_) => {
            ConsumerMetrics::incr(&ctx.metrics.processing_failures);
            error!(address = ctx.address, "handler panicked while processing msg");
            record_failure(&mut span, "handler panicked");
        }
    }
}

fn record_failure(span: &mut BoxedSpan, description: &str) {
    span.set_status(Status::Error {
        description: Cow::from(description.to_owned()),
    });
}
