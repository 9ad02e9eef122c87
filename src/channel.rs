// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection and Channel Management
//!
//! `lapin` implementation of the broker traits. Connections are opened from
//! [`ConnectionParameters`]; channels translate lapin's per-publish confirmation futures into
//! [`ChannelEvent`]s so the publisher sees the same ack, nack and return signals as with any
//! other broker client.

use crate::{
    broker::{
        BrokerChannel, BrokerConnection, BrokerConnector, ChannelEvent, ChannelEventSender,
        DeliveryStream, InboundDelivery,
    },
    errors::{AmqpError, ConfigError},
    factory::{ConnectionParameters, TlsPolicy},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions, QueueDeclareOptions,
    },
    publisher_confirm::Confirmation,
    tcp::OwnedTLSConfig,
    types::{FieldTable, LongString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tracing::{debug, error};

const REPLY_SUCCESS: u16 = 200;
const REPLY_ACCESS_REFUSED: u16 = 403;
const REPLY_NOT_FOUND: u16 = 404;

/// Reply codes AMQP 0.9.1 classifies as channel (soft) errors.
const CHANNEL_REPLY_CODES: [u16; 7] = [311, 312, 313, 403, 404, 405, 406];

/// Opens connections with `lapin`.
#[derive(Debug, Default, Clone)]
pub struct LapinConnector;

impl LapinConnector {
    pub fn new() -> LapinConnector {
        LapinConnector
    }
}

#[async_trait]
impl BrokerConnector for LapinConnector {
    async fn connect(
        &self,
        params: &ConnectionParameters,
    ) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        debug!(endpoint = params.endpoint(), "creating amqp connection...");

        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(params.connection_name.clone()));
        let uri = params.uri.clone();

        let tls = match &params.tls {
            TlsPolicy::Plain => None,
            TlsPolicy::Verified {
                trusted_certificates,
            } => Some(OwnedTLSConfig {
                identity: None,
                cert_chain: trusted_certificates.clone(),
            }),
            TlsPolicy::AcceptAnyCertificate => {
                // lapin always verifies the broker certificate against some trust anchors
                let err = AmqpError::Config(ConfigError::UnsupportedTlsPolicy(
                    "broker certificate validation cannot be disabled".to_owned(),
                ));
                error!(error = err.to_string(), endpoint = params.endpoint(), "failure to connect");
                params.report_failure(err.clone());
                return Err(err);
            }
        };

        let connecting = async {
            match tls {
                None => Connection::connect_uri(uri, options).await,
                Some(config) => Connection::connect_uri_with_config(uri, options, config).await,
            }
        };

        let handshake_timeout = params.tuning.handshake_timeout;
        let conn = match tokio::time::timeout(handshake_timeout, connecting).await {
            Ok(Ok(conn)) => conn,
            Ok(Err(err)) => {
                let err = classify(err);
                error!(error = err.to_string(), "failure to connect");
                // lapin only reports errors of established connections through on_error
                params.report_failure(err.clone());
                return Err(err);
            }
            Err(_) => {
                let err = AmqpError::Timeout("connection handshake".to_owned(), handshake_timeout);
                error!(error = err.to_string(), "failure to connect");
                params.report_failure(err.clone());
                return Err(err);
            }
        };
        debug!(endpoint = params.endpoint(), "amqp connected");

        let failure_handler = params.failure_handler.clone();
        conn.on_error(move |err| {
            let err = classify(err);
            error!(error = err.to_string(), "amqp connection failed");
            failure_handler(err);
        });

        Ok(Arc::new(LapinConnection {
            conn,
            shutdown_timeout: params.tuning.shutdown_timeout,
        }))
    }
}

pub struct LapinConnection {
    conn: Connection,
    shutdown_timeout: Duration,
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    async fn create_channel(
        &self,
        events: ChannelEventSender,
    ) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        debug!("creating amqp channel...");
        match self.conn.create_channel().await {
            Ok(channel) => {
                debug!(channel = channel.id(), "channel created");
                Ok(Arc::new(LapinChannel::new(
                    channel,
                    events,
                    self.shutdown_timeout,
                )))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError(err.to_string()))
            }
        }
    }

    async fn close(&self) -> Result<(), AmqpError> {
        match tokio::time::timeout(
            self.shutdown_timeout,
            self.conn.close(REPLY_SUCCESS, "closed by bridge"),
        )
        .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(classify(err)),
            Err(_) => Err(AmqpError::Timeout(
                "connection close".to_owned(),
                self.shutdown_timeout,
            )),
        }
    }
}

pub struct LapinChannel {
    channel: Channel,
    events: ChannelEventSender,
    published: AtomicU64,
    confirms: AtomicBool,
    shutdown_timeout: Duration,
}

impl LapinChannel {
    fn new(channel: Channel, events: ChannelEventSender, shutdown_timeout: Duration) -> Self {
        LapinChannel {
            channel,
            events,
            published: AtomicU64::new(0),
            confirms: AtomicBool::new(false),
            shutdown_timeout,
        }
    }

    /// Waits for lapin's confirmation of publication `seq` and replays it as events.
    fn forward_confirmation(&self, seq: u64, confirm: lapin::publisher_confirm::PublisherConfirm) {
        let events = self.events.clone();

        tokio::spawn(async move {
            let (event, returned) = match confirm.await {
                Ok(Confirmation::Ack(returned)) => (
                    ChannelEvent::Ack {
                        delivery_tag: seq,
                        multiple: false,
                    },
                    returned,
                ),
                Ok(Confirmation::Nack(returned)) => (
                    ChannelEvent::Nack {
                        delivery_tag: seq,
                        multiple: false,
                    },
                    returned,
                ),
                Ok(Confirmation::NotRequested) => return,
                Err(err) => {
                    let _ = events.send(ChannelEvent::Shutdown(classify(err)));
                    return;
                }
            };

            if let Some(returned) = returned {
                let _ = events.send(ChannelEvent::Return {
                    reply_code: returned.reply_code,
                    reply_text: returned.reply_text.as_str().to_owned(),
                    exchange: returned.delivery.exchange.as_str().to_owned(),
                    routing_key: returned.delivery.routing_key.as_str().to_owned(),
                });
            }
            let _ = events.send(event);
        });
    }
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    fn id(&self) -> u16 {
        self.channel.id()
    }

    async fn confirm_select(&self) -> Result<(), AmqpError> {
        self.channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|err| AmqpError::ConfirmSelectError(err.to_string()))?;

        self.published.store(0, Ordering::SeqCst);
        self.confirms.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn next_publish_seq_no(&self) -> u64 {
        self.published.load(Ordering::SeqCst) + 1
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory,
                    immediate: false,
                },
                payload,
                properties,
            )
            .await
            .map_err(|err| AmqpError::PublishingError(err.to_string()))?;

        let seq = self.published.fetch_add(1, Ordering::SeqCst) + 1;
        if self.confirms.load(Ordering::SeqCst) {
            self.forward_confirmation(seq, confirm);
        }

        Ok(())
    }

    async fn queue_exists(&self, queue: &str) -> Result<(), AmqpError> {
        self.channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    passive: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map(|_| ())
            .map_err(|err| match classify(err) {
                AmqpError::ChannelClosed(REPLY_NOT_FOUND, _) => {
                    AmqpError::QueueNotFound(queue.to_owned())
                }
                other => other,
            })
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|err| AmqpError::QoSDeclarationError(err.to_string()))
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, AmqpError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|err| AmqpError::ConsumerDeclarationError(queue.to_owned(), err.to_string()))?;

        Ok(consumer
            .map(|delivery| delivery.map(InboundDelivery::from).map_err(classify))
            .boxed())
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| AmqpError::AckMessageError(err.to_string()))
    }

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(|err| AmqpError::NackMessageError(err.to_string()))
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(classify)
    }

    async fn close(&self) -> Result<(), AmqpError> {
        match tokio::time::timeout(
            self.shutdown_timeout,
            self.channel.close(REPLY_SUCCESS, "closed by bridge"),
        )
        .await
        {
            Ok(result) => result.map_err(classify),
            Err(_) => Err(AmqpError::Timeout(
                "channel close".to_owned(),
                self.shutdown_timeout,
            )),
        }
    }
}

impl From<Delivery> for InboundDelivery {
    fn from(delivery: Delivery) -> Self {
        InboundDelivery {
            delivery_tag: delivery.delivery_tag,
            exchange: delivery.exchange.as_str().to_owned(),
            routing_key: delivery.routing_key.as_str().to_owned(),
            redelivered: delivery.redelivered,
            properties: delivery.properties,
            data: delivery.data,
        }
    }
}

/// Maps a lapin error onto the bridge's error type, keeping broker reply codes.
pub(crate) fn classify(err: lapin::Error) -> AmqpError {
    match &err {
        lapin::Error::ProtocolError(amqp) => {
            let code = amqp.get_id();
            let text = amqp.get_message().as_str().to_owned();
            if code == REPLY_SUCCESS {
                AmqpError::ClosedByApplication
            } else if code == REPLY_ACCESS_REFUSED {
                AmqpError::AccessRefused(text)
            } else if CHANNEL_REPLY_CODES.contains(&code) {
                AmqpError::ChannelClosed(code, text)
            } else {
                AmqpError::ConnectionClosed(code, text)
            }
        }
        lapin::Error::InvalidChannelState(lapin::ChannelState::Closed)
        | lapin::Error::InvalidConnectionState(lapin::ConnectionState::Closed) => {
            AmqpError::ClosedByApplication
        }
        lapin::Error::InvalidChannelState(_) => AmqpError::ChannelClosed(0, err.to_string()),
        lapin::Error::InvalidConnectionState(_) => {
            AmqpError::ConnectionClosed(0, err.to_string())
        }
        lapin::Error::IOError(_) => AmqpError::ConnectionError(err.to_string()),
        _ => AmqpError::InternalError(err.to_string()),
    }
}
