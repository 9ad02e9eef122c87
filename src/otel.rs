// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Trace Context over AMQP Headers
//!
//! The publisher writes the current trace context into the header table of every frame. A
//! consumer reads it back from the delivery and opens its span under it, so one trace spans
//! both sides of the broker.

use lapin::{
    protocol::basic::AMQPProperties,
    types::{AMQPValue, FieldTable, ShortString},
};
use opentelemetry::{
    global::{self, BoxedSpan},
    propagation::{Extractor, Injector},
    trace::{SpanKind, Tracer},
    Context,
};
use std::collections::BTreeMap;

const CONSUMER_TRACER: &str = "amqp consumer";

/// Write side: collects propagation fields as long string headers.
struct HeaderWriter<'a>(&'a mut BTreeMap<ShortString, AMQPValue>);

impl Injector for HeaderWriter<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.0
            .insert(key.to_lowercase().into(), AMQPValue::LongString(value.into()));
    }
}

/// Read side: borrows the delivery headers, accepting short and long string values.
struct HeaderReader<'a>(Option<&'a FieldTable>);

impl Extractor for HeaderReader<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        match self.0?.inner().get(key)? {
            AMQPValue::LongString(value) => std::str::from_utf8(value.as_bytes()).ok(),
            AMQPValue::ShortString(value) => Some(value.as_str()),
            _ => None,
        }
    }

    fn keys(&self) -> Vec<&str> {
        self.0
            .map(|headers| headers.inner().keys().map(ShortString::as_str).collect())
            .unwrap_or_default()
    }
}

/// Writes the trace context of `ctx` into outgoing headers.
pub(crate) fn inject(ctx: &Context, headers: &mut BTreeMap<ShortString, AMQPValue>) {
    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(ctx, &mut HeaderWriter(headers))
    });
}

/// Remote trace context carried by a delivery. Empty when the publisher sent none.
pub(crate) fn extract(props: &AMQPProperties) -> Context {
    global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeaderReader(props.headers().as_ref()))
    })
}

/// Opens the consumer span of a delivery from `address`, parented on its remote context.
pub(crate) fn consumer_span(address: &str, props: &AMQPProperties) -> (Context, BoxedSpan) {
    let parent = extract(props);
    let tracer = global::tracer(CONSUMER_TRACER);
    let span = tracer
        .span_builder(address.to_owned())
        .with_kind(SpanKind::Consumer)
        .start_with_context(&tracer, &parent);

    (parent, span)
}
