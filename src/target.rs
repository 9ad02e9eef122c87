// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Publish Targets
//!
//! A publish target is written as `exchange` or `exchange/routingKey`. The exchange is
//! mandatory; an empty routing key segment (`exchange/`) is normalized to "no routing key".

use crate::errors::ConfigError;
use std::{fmt, str::FromStr};

const SEPARATOR: char = '/';

/// Exchange and optional routing key a message is published to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublishTarget {
    exchange: String,
    routing_key: Option<String>,
}

impl PublishTarget {
    /// Creates a target directly. An empty routing key is stored as absent.
    pub fn new(exchange: &str, routing_key: Option<&str>) -> PublishTarget {
        PublishTarget {
            exchange: exchange.to_owned(),
            routing_key: routing_key.filter(|k| !k.is_empty()).map(str::to_owned),
        }
    }

    /// Parses a target address.
    ///
    /// # Errors
    /// `ConfigError::InvalidTargetAddress` if the exchange segment is empty or the
    /// address has more than two segments.
    pub fn parse(address: &str) -> Result<PublishTarget, ConfigError> {
        let mut segments = address.split(SEPARATOR);

        let exchange = segments.next().unwrap_or_default();
        if exchange.is_empty() {
            return Err(ConfigError::InvalidTargetAddress(
                address.to_owned(),
                "exchange must not be empty".to_owned(),
            ));
        }

        let routing_key = segments.next();

        if segments.next().is_some() {
            return Err(ConfigError::InvalidTargetAddress(
                address.to_owned(),
                "expected `exchange` or `exchange/routingKey`".to_owned(),
            ));
        }

        Ok(PublishTarget::new(exchange, routing_key))
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn routing_key(&self) -> Option<&str> {
        self.routing_key.as_deref()
    }
}

impl FromStr for PublishTarget {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PublishTarget::parse(s)
    }
}

impl fmt::Display for PublishTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.routing_key {
            Some(key) => write!(f, "{}{}{}", self.exchange, SEPARATOR, key),
            None => write!(f, "{}", self.exchange),
        }
    }
}
