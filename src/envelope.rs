// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Envelopes
//!
//! Conversion between AMQP frames and the bridge's own message shapes: [`Envelope`] for
//! deliveries handed downstream, [`OutboundMessage`] for messages handed to the publisher.

use crate::{broker::InboundDelivery, otel, target::PublishTarget};
use lapin::{
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties,
};
use opentelemetry::Context;
use std::collections::BTreeMap;
use uuid::Uuid;

pub const REPLY_TO_HEADER: &str = "reply-to";
pub const CORRELATION_ID_HEADER: &str = "correlation-id";
pub const CONTENT_TYPE_HEADER: &str = "content-type";
pub const MESSAGE_ID_HEADER: &str = "message-id";

/// Content types starting with this are passed through as bytes.
pub const BINARY_CONTENT_TYPE: &str = "application/octet-stream";
pub const TEXT_CONTENT_TYPE: &str = "text/plain; charset=UTF-8";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Binary(Vec<u8>),
}

impl Payload {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Payload::Text(text) => text.as_bytes(),
            Payload::Binary(bytes) => bytes,
        }
    }
}

pub fn is_binary_content_type(content_type: Option<&str>) -> bool {
    content_type.is_some_and(|ct| ct.starts_with(BINARY_CONTENT_TYPE))
}

/// A consumed message in the bridge's internal shape.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub address: String,
    pub headers: BTreeMap<String, String>,
    pub payload: Payload,
    pub content_type: Option<String>,
    pub delivery_tag: u64,
    pub redelivered: bool,
    /// Trace context extracted from the delivery headers.
    pub context: Context,
}

impl Envelope {
    /// Translates a delivery consumed from `address`.
    ///
    /// Application headers are stringified first; the `reply-to`, `correlation-id` and
    /// `content-type` properties and the synthetic `message-id` then take precedence.
    pub fn from_delivery(address: &str, delivery: InboundDelivery, context: Context) -> Envelope {
        let props = &delivery.properties;
        let mut headers = BTreeMap::new();

        if let Some(table) = props.headers() {
            for (key, value) in table.inner() {
                if let Some(value) = header_value(value) {
                    headers.insert(key.as_str().to_owned(), value);
                }
            }
        }

        if let Some(reply_to) = props.reply_to() {
            headers.insert(REPLY_TO_HEADER.to_owned(), reply_to.as_str().to_owned());
        }
        if let Some(correlation_id) = props.correlation_id() {
            headers.insert(
                CORRELATION_ID_HEADER.to_owned(),
                correlation_id.as_str().to_owned(),
            );
        }
        let content_type = props.content_type().as_ref().map(|ct| ct.as_str().to_owned());
        if let Some(ct) = &content_type {
            headers.insert(CONTENT_TYPE_HEADER.to_owned(), ct.clone());
        }
        headers.insert(
            MESSAGE_ID_HEADER.to_owned(),
            delivery.delivery_tag.to_string(),
        );

        let payload = if is_binary_content_type(content_type.as_deref()) {
            Payload::Binary(delivery.data)
        } else {
            Payload::Text(String::from_utf8_lossy(&delivery.data).into_owned())
        };

        Envelope {
            address: address.to_owned(),
            headers,
            payload,
            content_type,
            delivery_tag: delivery.delivery_tag,
            redelivered: delivery.redelivered,
            context,
        }
    }
}

fn header_value(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::LongString(v) => Some(String::from_utf8_lossy(v.as_bytes()).into_owned()),
        AMQPValue::ShortString(v) => Some(v.as_str().to_owned()),
        AMQPValue::Boolean(v) => Some(v.to_string()),
        AMQPValue::ShortShortInt(v) => Some(v.to_string()),
        AMQPValue::ShortShortUInt(v) => Some(v.to_string()),
        AMQPValue::ShortInt(v) => Some(v.to_string()),
        AMQPValue::ShortUInt(v) => Some(v.to_string()),
        AMQPValue::LongInt(v) => Some(v.to_string()),
        AMQPValue::LongUInt(v) => Some(v.to_string()),
        AMQPValue::LongLongInt(v) => Some(v.to_string()),
        AMQPValue::Float(v) => Some(v.to_string()),
        AMQPValue::Double(v) => Some(v.to_string()),
        AMQPValue::Timestamp(v) => Some(v.to_string()),
        _ => None,
    }
}

/// A message to publish.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    /// Identifies the originating signal in the publish result; sent as the AMQP message id.
    pub id: String,
    pub target: PublishTarget,
    pub payload: Payload,
    pub headers: BTreeMap<String, String>,
    pub content_type: Option<String>,
    /// Whether the caller expects a broker acknowledgement for this message.
    pub requires_ack: bool,
}

impl OutboundMessage {
    pub fn new(target: PublishTarget, payload: Payload) -> OutboundMessage {
        OutboundMessage {
            id: Uuid::new_v4().to_string(),
            target,
            payload,
            headers: BTreeMap::new(),
            content_type: None,
            requires_ack: false,
        }
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.id = id.to_owned();
        self
    }

    pub fn with_header(mut self, key: &str, value: &str) -> Self {
        self.headers.insert(key.to_owned(), value.to_owned());
        self
    }

    pub fn with_content_type(mut self, content_type: &str) -> Self {
        self.content_type = Some(content_type.to_owned());
        self
    }

    pub fn requiring_ack(mut self) -> Self {
        self.requires_ack = true;
        self
    }

    /// Builds the AMQP properties of the outgoing frame.
    ///
    /// `content-type`, `correlation-id` and `reply-to` headers become properties; every
    /// other header, plus the trace context of `ctx`, goes into the header table.
    pub(crate) fn properties(&self, ctx: &Context) -> BasicProperties {
        let mut table = BTreeMap::<ShortString, AMQPValue>::default();
        otel::inject(ctx, &mut table);

        let mut props = BasicProperties::default().with_message_id(ShortString::from(self.id.clone()));

        for (key, value) in &self.headers {
            match key.as_str() {
                CONTENT_TYPE_HEADER => {}
                CORRELATION_ID_HEADER => {
                    props = props.with_correlation_id(ShortString::from(value.clone()));
                }
                REPLY_TO_HEADER => {
                    props = props.with_reply_to(ShortString::from(value.clone()));
                }
                _ => {
                    table.insert(
                        ShortString::from(key.clone()),
                        AMQPValue::LongString(LongString::from(value.clone())),
                    );
                }
            }
        }

        let content_type = self
            .content_type
            .clone()
            .or_else(|| self.headers.get(CONTENT_TYPE_HEADER).cloned())
            .unwrap_or_else(|| match self.payload {
                Payload::Binary(_) => BINARY_CONTENT_TYPE.to_owned(),
                Payload::Text(_) => TEXT_CONTENT_TYPE.to_owned(),
            });

        props
            .with_content_type(ShortString::from(content_type))
            .with_headers(FieldTable::from(table))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delivery(props: BasicProperties, data: &[u8]) -> InboundDelivery {
        InboundDelivery {
            delivery_tag: 42,
            exchange: "ex".to_owned(),
            routing_key: "rk".to_owned(),
            redelivered: false,
            properties: props,
            data: data.to_vec(),
        }
    }

    #[test]
    fn should_synthesize_envelope_headers() {
        let mut table = BTreeMap::new();
        table.insert(
            ShortString::from("tenant"),
            AMQPValue::LongString(LongString::from("acme")),
        );
        table.insert(ShortString::from("attempt"), AMQPValue::LongInt(3));
        let props = BasicProperties::default()
            .with_reply_to(ShortString::from("replies"))
            .with_correlation_id(ShortString::from("c-1"))
            .with_content_type(ShortString::from("application/json"))
            .with_headers(FieldTable::from(table));

        let envelope =
            Envelope::from_delivery("orders", delivery(props, b"{\"a\":1}"), Context::new());

        assert_eq!(envelope.headers.get("tenant").unwrap(), "acme");
        assert_eq!(envelope.headers.get("attempt").unwrap(), "3");
        assert_eq!(envelope.headers.get(REPLY_TO_HEADER).unwrap(), "replies");
        assert_eq!(envelope.headers.get(CORRELATION_ID_HEADER).unwrap(), "c-1");
        assert_eq!(
            envelope.headers.get(CONTENT_TYPE_HEADER).unwrap(),
            "application/json"
        );
        assert_eq!(envelope.headers.get(MESSAGE_ID_HEADER).unwrap(), "42");
        assert_eq!(envelope.payload, Payload::Text("{\"a\":1}".to_owned()));
        assert_eq!(envelope.address, "orders");
    }

    #[test]
    fn should_keep_octet_stream_as_binary() {
        let props = BasicProperties::default()
            .with_content_type(ShortString::from("application/octet-stream; x=y"));

        let envelope =
            Envelope::from_delivery("orders", delivery(props, &[0xff, 0x00]), Context::new());

        assert_eq!(envelope.payload, Payload::Binary(vec![0xff, 0x00]));
    }

    #[test]
    fn should_default_to_text_without_content_type() {
        let envelope = Envelope::from_delivery(
            "orders",
            delivery(BasicProperties::default(), b"hello"),
            Context::new(),
        );

        assert_eq!(envelope.payload, Payload::Text("hello".to_owned()));
        assert!(!envelope.headers.contains_key(CONTENT_TYPE_HEADER));
        assert_eq!(envelope.headers.len(), 1);
    }

    #[test]
    fn should_lift_special_headers_into_properties() {
        let msg = OutboundMessage::new(
            PublishTarget::new("ex", Some("rk")),
            Payload::Text("hi".to_owned()),
        )
        .with_id("signal-1")
        .with_header(CORRELATION_ID_HEADER, "c-9")
        .with_header(REPLY_TO_HEADER, "replies")
        .with_header("tenant", "acme");

        let props = msg.properties(&Context::new());

        assert_eq!(props.message_id().as_ref().unwrap().as_str(), "signal-1");
        assert_eq!(props.correlation_id().as_ref().unwrap().as_str(), "c-9");
        assert_eq!(props.reply_to().as_ref().unwrap().as_str(), "replies");
        assert_eq!(
            props.content_type().as_ref().unwrap().as_str(),
            TEXT_CONTENT_TYPE
        );
        let headers = props.headers().as_ref().unwrap().inner();
        assert!(headers.contains_key("tenant"));
        assert!(!headers.contains_key(CORRELATION_ID_HEADER));
    }

    #[test]
    fn should_default_binary_content_type() {
        let msg = OutboundMessage::new(
            PublishTarget::new("ex", Some("rk")),
            Payload::Binary(vec![1, 2, 3]),
        );

        let props = msg.properties(&Context::new());

        assert_eq!(
            props.content_type().as_ref().unwrap().as_str(),
            BINARY_CONTENT_TYPE
        );
        assert_eq!(msg.payload.as_bytes(), &[1, 2, 3]);
    }
}
