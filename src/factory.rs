// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Connection Factory
//!
//! Turns a [`ConnectionDescription`] into the parameters a [`crate::broker::BrokerConnector`]
//! needs: the parsed URI with tuning applied to its query, the TLS trust policy, the tuning
//! knobs the bridge enforces itself and the failure handler.

use crate::{config::ConnectionDescription, errors::AmqpError, errors::ConfigError};
use lapin::uri::{AMQPScheme, AMQPUri};
use rustls::pki_types::{pem::PemObject, CertificateDer};
use std::{collections::HashMap, fmt, sync::Arc, time::Duration};
use tracing::{debug, warn};

/// Tuning keys recognized in `specificConfig`.
pub const CHANNEL_RPC_TIMEOUT: &str = "channelRpcTimeout";
pub const CONNECTION_TIMEOUT: &str = "connectionTimeout";
pub const HANDSHAKE_TIMEOUT: &str = "handshakeTimeout";
pub const CHANNEL_SHOULD_CHECK_RPC_RESPONSE_TYPE: &str = "channelShouldCheckRpcResponseType";
pub const NETWORK_RECOVERY_INTERVAL: &str = "networkRecoveryInterval";
pub const REQUESTED_CHANNEL_MAX: &str = "requestedChannelMax";
pub const REQUESTED_FRAME_MAX: &str = "requestedFrameMax";
pub const REQUESTED_HEARTBEAT: &str = "requestedHeartbeat";
pub const TOPOLOGY_RECOVERY_ENABLED: &str = "topologyRecoveryEnabled";
pub const SHUTDOWN_TIMEOUT: &str = "shutdownTimeout";

/// Invoked with every connection-level failure, including failures to connect at all.
pub type FailureHandler = Arc<dyn Fn(AmqpError) + Send + Sync>;

/// How the broker's certificate is trusted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TlsPolicy {
    /// Plain `amqp` transport.
    Plain,
    /// Certificates are validated, against the given PEM chain if any, otherwise
    /// against the platform roots.
    Verified { trusted_certificates: Option<String> },
    /// Certificates are not validated.
    AcceptAnyCertificate,
}

/// Tuning knobs. Durations are configured in milliseconds, the heartbeat in seconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionTuning {
    pub channel_rpc_timeout: Duration,
    pub connection_timeout: Option<Duration>,
    pub handshake_timeout: Duration,
    pub check_rpc_response_type: bool,
    pub network_recovery_interval: Duration,
    pub requested_channel_max: Option<u16>,
    pub requested_frame_max: Option<u32>,
    pub requested_heartbeat: Option<u16>,
    pub topology_recovery_enabled: bool,
    pub shutdown_timeout: Duration,
}

impl Default for ConnectionTuning {
    fn default() -> Self {
        ConnectionTuning {
            channel_rpc_timeout: Duration::from_secs(10),
            connection_timeout: None,
            handshake_timeout: Duration::from_secs(10),
            check_rpc_response_type: false,
            network_recovery_interval: Duration::from_secs(5),
            requested_channel_max: None,
            requested_frame_max: None,
            requested_heartbeat: None,
            topology_recovery_enabled: true,
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

impl ConnectionTuning {
    /// Reads every recognized key from the free-form parameter map.
    ///
    /// Unknown keys are ignored; a recognized key with an unparsable value fails.
    pub fn from_params(params: &HashMap<String, String>) -> Result<ConnectionTuning, ConfigError> {
        let mut tuning = ConnectionTuning::default();

        if let Some(v) = parse::<u64>(params, CHANNEL_RPC_TIMEOUT)? {
            tuning.channel_rpc_timeout = Duration::from_millis(v);
        }
        if let Some(v) = parse::<u64>(params, CONNECTION_TIMEOUT)? {
            tuning.connection_timeout = Some(Duration::from_millis(v));
        }
        if let Some(v) = parse::<u64>(params, HANDSHAKE_TIMEOUT)? {
            tuning.handshake_timeout = Duration::from_millis(v);
        }
        if let Some(v) = parse::<bool>(params, CHANNEL_SHOULD_CHECK_RPC_RESPONSE_TYPE)? {
            tuning.check_rpc_response_type = v;
        }
        if let Some(v) = parse::<u64>(params, NETWORK_RECOVERY_INTERVAL)? {
            tuning.network_recovery_interval = Duration::from_millis(v);
        }
        tuning.requested_channel_max = parse::<u16>(params, REQUESTED_CHANNEL_MAX)?;
        tuning.requested_frame_max = parse::<u32>(params, REQUESTED_FRAME_MAX)?;
        tuning.requested_heartbeat = parse::<u16>(params, REQUESTED_HEARTBEAT)?;
        if let Some(v) = parse::<bool>(params, TOPOLOGY_RECOVERY_ENABLED)? {
            tuning.topology_recovery_enabled = v;
        }
        if let Some(v) = parse::<u64>(params, SHUTDOWN_TIMEOUT)? {
            tuning.shutdown_timeout = Duration::from_millis(v);
        }

        Ok(tuning)
    }
}

fn parse<T: std::str::FromStr>(
    params: &HashMap<String, String>,
    key: &str,
) -> Result<Option<T>, ConfigError> {
    match params.get(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidTuningValue(key.to_owned(), raw.clone())),
    }
}

/// Everything needed to open one broker connection.
#[derive(Clone)]
pub struct ConnectionParameters {
    pub connection_name: String,
    pub uri: AMQPUri,
    pub tls: TlsPolicy,
    pub tuning: ConnectionTuning,
    pub failure_handler: FailureHandler,
}

impl ConnectionParameters {
    /// `host:port` of the broker, safe to log.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.uri.authority.host, self.uri.authority.port)
    }

    pub(crate) fn report_failure(&self, err: AmqpError) {
        (self.failure_handler)(err)
    }
}

impl fmt::Debug for ConnectionParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionParameters")
            .field("connection_name", &self.connection_name)
            .field("endpoint", &self.endpoint())
            .field("tls", &self.tls)
            .field("tuning", &self.tuning)
            .finish_non_exhaustive()
    }
}

/// Builds [`ConnectionParameters`]. One factory is created per bridge and shared by handle.
#[derive(Debug, Default, Clone)]
pub struct BrokerConnectionFactory;

impl BrokerConnectionFactory {
    pub fn new() -> BrokerConnectionFactory {
        BrokerConnectionFactory
    }

    /// Builds the parameters for a connection described by `desc`.
    ///
    /// # Errors
    /// `ConfigError` for a malformed URI or scheme, malformed tuning values or malformed
    /// trust material. Nothing is opened, so there is nothing to clean up on error.
    pub fn build(
        &self,
        desc: &ConnectionDescription,
        failure_handler: FailureHandler,
    ) -> Result<ConnectionParameters, ConfigError> {
        let scheme = desc
            .uri
            .split_once("://")
            .map(|(scheme, _)| scheme.to_ascii_lowercase())
            .ok_or_else(|| ConfigError::InvalidUri("missing scheme".to_owned()))?;
        if scheme != "amqp" && scheme != "amqps" {
            return Err(ConfigError::UnsupportedScheme(scheme));
        }

        let mut uri: AMQPUri = desc.uri.parse().map_err(ConfigError::InvalidUri)?;
        let tuning = ConnectionTuning::from_params(&desc.specific_config)?;

        if let Some(heartbeat) = tuning.requested_heartbeat {
            uri.query.heartbeat = Some(heartbeat);
        }
        if let Some(channel_max) = tuning.requested_channel_max {
            uri.query.channel_max = Some(channel_max);
        }
        if let Some(frame_max) = tuning.requested_frame_max {
            uri.query.frame_max = Some(frame_max);
        }
        if let Some(timeout) = tuning.connection_timeout {
            uri.query.connection_timeout = Some(timeout.as_millis() as u64);
        }

        let tls = match uri.scheme {
            AMQPScheme::AMQP => TlsPolicy::Plain,
            AMQPScheme::AMQPS if desc.validate_certificates => {
                if let Some(pem) = &desc.trusted_certificates {
                    validate_pem(pem)?;
                }
                TlsPolicy::Verified {
                    trusted_certificates: desc.trusted_certificates.clone(),
                }
            }
            AMQPScheme::AMQPS => {
                warn!(
                    connection = desc.id,
                    "certificate validation is disabled by configuration"
                );
                TlsPolicy::AcceptAnyCertificate
            }
        };

        let params = ConnectionParameters {
            connection_name: desc.id.clone(),
            uri,
            tls,
            tuning,
            failure_handler,
        };

        debug!(
            connection = desc.id,
            endpoint = params.endpoint(),
            "connection parameters built"
        );

        Ok(params)
    }
}

/// Parses the PEM chain. At least one certificate must be present and every section must decode.
fn validate_pem(pem: &str) -> Result<(), ConfigError> {
    let certificates = CertificateDer::pem_slice_iter(pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| {
            ConfigError::InvalidTrustedCertificates(format!("failed to parse certificates: {e}"))
        })?;

    if certificates.is_empty() {
        return Err(ConfigError::InvalidTrustedCertificates(
            "no PEM certificate found".to_owned(),
        ));
    }

    Ok(())
}
