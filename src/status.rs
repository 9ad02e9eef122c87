// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connectivity Status
//!
//! Maps low-level failures onto the small status vocabulary operators see, and pushes the
//! result to a [`StatusSink`]. Resources are identified by source address, target address
//! or [`CONNECTION_RESOURCE`].

use crate::errors::AmqpError;
use chrono::{DateTime, Utc};
use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, RwLock},
};

/// Resource name used for the connection itself.
pub const CONNECTION_RESOURCE: &str = "connection";

const REPLY_ACCESS_REFUSED: u16 = 403;
const REPLY_NOT_FOUND: u16 = 404;
const REPLY_PRECONDITION_FAILED: u16 = 406;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectivityStatus {
    Open,
    Misconfigured,
    Failed,
    Unknown,
}

impl fmt::Display for ConnectivityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectivityStatus::Open => "open",
            ConnectivityStatus::Misconfigured => "misconfigured",
            ConnectivityStatus::Failed => "failed",
            ConnectivityStatus::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// A status plus a human readable, timestamped detail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub status: ConnectivityStatus,
    pub detail: String,
    pub timestamp: DateTime<Utc>,
}

impl StatusReport {
    pub fn new(status: ConnectivityStatus, detail: impl Into<String>) -> StatusReport {
        let timestamp = Utc::now();
        StatusReport {
            status,
            detail: format!("{} at {}", detail.into(), timestamp.to_rfc3339()),
            timestamp,
        }
    }

    /// Builds a report from a failure. Never fails itself.
    pub fn from_error(err: &AmqpError) -> StatusReport {
        StatusReport::new(resolve_status(err), err.to_string())
    }
}

/// Status a failure leaves the affected resource in.
pub fn resolve_status(err: &AmqpError) -> ConnectivityStatus {
    match err {
        AmqpError::Config(_)
        | AmqpError::AccessRefused(_)
        | AmqpError::QueueNotFound(_)
        | AmqpError::MissingQueues(_)
        | AmqpError::ConsumerCancelled(_) => ConnectivityStatus::Misconfigured,

        AmqpError::ChannelClosed(code, _) | AmqpError::ConnectionClosed(code, _) => match *code {
            REPLY_ACCESS_REFUSED | REPLY_NOT_FOUND | REPLY_PRECONDITION_FAILED => {
                ConnectivityStatus::Misconfigured
            }
            _ => ConnectivityStatus::Failed,
        },

        AmqpError::ConnectionError(_)
        | AmqpError::ChannelError(_)
        | AmqpError::Timeout(..)
        | AmqpError::ConfirmSelectError(_)
        | AmqpError::QoSDeclarationError(_)
        | AmqpError::ConsumerDeclarationError(..)
        | AmqpError::PublishingError(_)
        | AmqpError::AckMessageError(_)
        | AmqpError::NackMessageError(_) => ConnectivityStatus::Failed,

        AmqpError::ClosedByApplication | AmqpError::InternalError(_) => {
            ConnectivityStatus::Unknown
        }
    }
}

/// External consumer of status updates.
pub trait StatusSink: Send + Sync {
    fn report(&self, resource: &str, report: StatusReport);
}

/// In-memory sink keeping the latest report per resource.
#[derive(Debug, Default, Clone)]
pub struct StatusBoard {
    entries: Arc<RwLock<HashMap<String, StatusReport>>>,
}

impl StatusBoard {
    pub fn new() -> StatusBoard {
        StatusBoard::default()
    }

    pub fn get(&self, resource: &str) -> Option<StatusReport> {
        self.entries
            .read()
            .ok()
            .and_then(|entries| entries.get(resource).cloned())
    }

    pub fn status(&self, resource: &str) -> ConnectivityStatus {
        self.get(resource)
            .map(|r| r.status)
            .unwrap_or(ConnectivityStatus::Unknown)
    }

    pub fn snapshot(&self) -> HashMap<String, StatusReport> {
        self.entries
            .read()
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }
}

impl StatusSink for StatusBoard {
    fn report(&self, resource: &str, report: StatusReport) {
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(resource.to_owned(), report);
        }
    }
}

/// Front door the bridge components report through.
#[derive(Clone)]
pub struct StatusReporter {
    sink: Arc<dyn StatusSink>,
}

impl StatusReporter {
    pub fn new(sink: Arc<dyn StatusSink>) -> StatusReporter {
        StatusReporter { sink }
    }

    pub fn open(&self, resource: &str, detail: &str) {
        self.sink
            .report(resource, StatusReport::new(ConnectivityStatus::Open, detail));
    }

    pub fn failure(&self, resource: &str, err: &AmqpError) {
        self.sink.report(resource, StatusReport::from_error(err));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ConfigError;
    use std::time::Duration;

    #[test]
    fn should_resolve_misconfiguration() {
        for err in [
            AmqpError::QueueNotFound("q".to_owned()),
            AmqpError::MissingQueues(vec!["q".to_owned()]),
            AmqpError::AccessRefused("vhost".to_owned()),
            AmqpError::ConsumerCancelled("tag".to_owned()),
            AmqpError::ChannelClosed(404, "NOT_FOUND".to_owned()),
            AmqpError::Config(ConfigError::UnsupportedScheme("http".to_owned())),
            AmqpError::Config(ConfigError::UnsupportedTlsPolicy("any".to_owned())),
        ] {
            assert_eq!(resolve_status(&err), ConnectivityStatus::Misconfigured, "{err}");
        }
    }

    #[test]
    fn should_resolve_failures() {
        for err in [
            AmqpError::ConnectionError("refused".to_owned()),
            AmqpError::ConnectionClosed(320, "CONNECTION_FORCED".to_owned()),
            AmqpError::Timeout("channel".to_owned(), Duration::from_secs(1)),
        ] {
            assert_eq!(resolve_status(&err), ConnectivityStatus::Failed, "{err}");
        }
        assert_eq!(
            resolve_status(&AmqpError::ClosedByApplication),
            ConnectivityStatus::Unknown
        );
    }

    #[test]
    fn should_keep_latest_report_per_resource() {
        let board = StatusBoard::new();
        let reporter = StatusReporter::new(Arc::new(board.clone()));

        assert_eq!(board.status("orders"), ConnectivityStatus::Unknown);

        reporter.open("orders", "consumer started");
        assert_eq!(board.status("orders"), ConnectivityStatus::Open);

        reporter.failure("orders", &AmqpError::QueueNotFound("orders".to_owned()));
        let report = board.get("orders").unwrap();
        assert_eq!(report.status, ConnectivityStatus::Misconfigured);
        assert!(report.detail.starts_with("queue `orders` does not exist at "));
        assert_eq!(board.snapshot().len(), 1);
    }
}
