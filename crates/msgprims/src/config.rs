//! JSON configuration file for the CLI.
//!
//! ```json
//! {
//!   "messaging": { "connections_per_destination": 3, "response_timeout_ms": 2000 },
//!   "destinations": ["10.0.0.5:7400"],
//!   "metadata": { "zone": "eu-west" }
//! }
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use msgprims_frame::{FieldMap, FieldValue};
use msgprims_peer::MessagingConfig;
use serde::Deserialize;

use crate::exit::{io_error, CliError, CliResult, USAGE};

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigFile {
    pub messaging: MessagingSection,
    /// Extra peers to connect to, as `host:port`.
    pub destinations: Vec<String>,
    /// Metadata published to every peer.
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// Overrides for [`MessagingConfig`]. Durations are milliseconds.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MessagingSection {
    pub connections_per_destination: Option<usize>,
    pub response_timeout_ms: Option<u64>,
    pub async_dispatch_timeout_ms: Option<u64>,
    pub message_read_timeout_ms: Option<u64>,
    pub check_interval_ms: Option<u64>,
    pub excess_endpoint_grace_ms: Option<u64>,
    pub connect_timeout_ms: Option<u64>,
    pub handshake_timeout_ms: Option<u64>,
    pub worker_pool_size: Option<usize>,
    pub worker_queue_capacity: Option<usize>,
    pub prebuffer_limit: Option<usize>,
    pub report_load: Option<bool>,
    pub max_header_size: Option<usize>,
    pub max_object_size: Option<usize>,
}

impl ConfigFile {
    pub fn load(path: &Path) -> CliResult<Self> {
        let text = fs::read_to_string(path)
            .map_err(|err| io_error(&format!("failed reading {}", path.display()), err))?;
        Self::parse(&text)
            .map_err(|err| CliError::new(USAGE, format!("invalid config {}: {err}", path.display())))
    }

    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn messaging_config(&self) -> MessagingConfig {
        self.messaging.apply(MessagingConfig::default())
    }

    pub fn field_metadata(&self) -> FieldMap {
        self.metadata
            .iter()
            .map(|(key, value)| (key.clone(), FieldValue::from(value.clone())))
            .collect()
    }
}

impl MessagingSection {
    pub fn apply(&self, mut config: MessagingConfig) -> MessagingConfig {
        let ms = Duration::from_millis;
        if let Some(count) = self.connections_per_destination {
            config.connections_per_destination = count;
        }
        if let Some(value) = self.response_timeout_ms {
            config.response_timeout = ms(value);
        }
        if let Some(value) = self.async_dispatch_timeout_ms {
            config.async_dispatch_timeout = ms(value);
        }
        if let Some(value) = self.message_read_timeout_ms {
            config.message_read_timeout = ms(value);
        }
        if let Some(value) = self.check_interval_ms {
            config.check_interval = ms(value);
        }
        if let Some(value) = self.excess_endpoint_grace_ms {
            config.excess_endpoint_grace = ms(value);
        }
        if let Some(value) = self.connect_timeout_ms {
            config.connect_timeout = ms(value);
        }
        if let Some(value) = self.handshake_timeout_ms {
            config.handshake.timeout = ms(value);
        }
        if let Some(size) = self.worker_pool_size {
            config.worker_pool_size = size;
        }
        if let Some(capacity) = self.worker_queue_capacity {
            config.worker_queue_capacity = capacity;
        }
        if let Some(limit) = self.prebuffer_limit {
            config.prebuffer_limit = limit;
        }
        if let Some(report) = self.report_load {
            config.report_load = report;
        }
        if let Some(size) = self.max_header_size {
            config.frame.max_header_size = size;
        }
        if let Some(size) = self.max_object_size {
            config.frame.max_object_size = size;
        }
        config
    }
}
