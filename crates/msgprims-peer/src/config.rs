use std::time::Duration;

use msgprims_frame::FrameConfig;

use crate::handshake::HandshakeConfig;

/// Lower bound applied to the periodic check interval.
pub const MIN_CHECK_INTERVAL: Duration = Duration::from_millis(500);

/// Runtime configuration of a messaging system.
#[derive(Debug, Clone)]
pub struct MessagingConfig {
    /// Target number of live endpoints per client-side destination.
    pub connections_per_destination: usize,
    /// Default wait for a reply to a synchronous dispatch.
    pub response_timeout: Duration,
    /// Default wait for a ready endpoint on an asynchronous dispatch.
    pub async_dispatch_timeout: Duration,
    /// How long the receive loop waits for a consumer to make progress
    /// reading a body before giving up and skipping it.
    pub message_read_timeout: Duration,
    /// Interval between maintenance ticks. Never below [`MIN_CHECK_INTERVAL`].
    pub check_interval: Duration,
    /// Wait before closing endpoints above the target count.
    pub excess_endpoint_grace: Duration,
    /// TCP connect timeout for client-side endpoints.
    pub connect_timeout: Duration,
    /// Consumer worker threads. 0 runs consumers on the receive thread.
    pub worker_pool_size: usize,
    /// Bound of the worker queue; a full queue blocks the receive loop.
    pub worker_queue_capacity: usize,
    /// Bodies shorter than this are read fully before delivery.
    pub prebuffer_limit: usize,
    /// Publish the number of busy consumers as `ServerLoad` metadata.
    pub report_load: bool,
    pub handshake: HandshakeConfig,
    pub frame: FrameConfig,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            connections_per_destination: 2,
            response_timeout: Duration::from_secs(10),
            async_dispatch_timeout: Duration::from_secs(2),
            message_read_timeout: Duration::from_secs(30),
            check_interval: Duration::from_secs(30),
            excess_endpoint_grace: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(5),
            worker_pool_size: 8,
            worker_queue_capacity: 1024,
            prebuffer_limit: 8192,
            report_load: true,
            handshake: HandshakeConfig::default(),
            frame: FrameConfig::default(),
        }
    }
}

impl MessagingConfig {
    pub fn with_connections_per_destination(mut self, count: usize) -> Self {
        self.connections_per_destination = count;
        self
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn with_async_dispatch_timeout(mut self, timeout: Duration) -> Self {
        self.async_dispatch_timeout = timeout;
        self
    }

    pub fn with_message_read_timeout(mut self, timeout: Duration) -> Self {
        self.message_read_timeout = timeout;
        self
    }

    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    pub fn with_excess_endpoint_grace(mut self, grace: Duration) -> Self {
        self.excess_endpoint_grace = grace;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_worker_pool(mut self, size: usize, queue_capacity: usize) -> Self {
        self.worker_pool_size = size;
        self.worker_queue_capacity = queue_capacity;
        self
    }

    pub fn with_prebuffer_limit(mut self, limit: usize) -> Self {
        self.prebuffer_limit = limit;
        self
    }

    pub fn with_report_load(mut self, report_load: bool) -> Self {
        self.report_load = report_load;
        self
    }

    pub fn with_handshake_config(mut self, config: HandshakeConfig) -> Self {
        self.handshake = config;
        self
    }

    pub fn with_frame_config(mut self, config: FrameConfig) -> Self {
        self.frame = config;
        self
    }

    /// Check interval with the lower bound applied.
    pub fn effective_check_interval(&self) -> Duration {
        self.check_interval.max(MIN_CHECK_INTERVAL)
    }

    /// Endpoint target, never below one.
    pub fn target_endpoints(&self) -> usize {
        self.connections_per_destination.max(1)
    }
}
