use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level registry configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegistryConfig {
    pub media_server: MediaServerConfig,
    pub event_bus: EventBusConfig,
    /// Default deadline for a whole `send_media` call.
    pub send_timeout: Duration,
    /// How long `stop` waits for each adapter before abandoning it.
    pub adapter_stop_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            media_server: MediaServerConfig::default(),
            event_bus: EventBusConfig::default(),
            send_timeout: Duration::from_secs(30),
            adapter_stop_timeout: Duration::from_secs(5),
        }
    }
}

impl RegistryConfig {
    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    pub fn with_adapter_stop_timeout(mut self, timeout: Duration) -> Self {
        self.adapter_stop_timeout = timeout;
        self
    }

    pub fn with_media_server(mut self, media_server: MediaServerConfig) -> Self {
        self.media_server = media_server;
        self
    }

    pub fn with_event_bus(mut self, event_bus: EventBusConfig) -> Self {
        self.event_bus = event_bus;
        self
    }
}

/// Embedded HTTP media server settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MediaServerConfig {
    /// Address to advertise in payload URLs. `None` autodetects the LAN ip.
    pub ip: Option<String>,
    /// Listen port; 0 lets the OS pick one.
    pub port: u16,
    /// Payloads unused for this long are evicted.
    pub payload_idle_timeout: Duration,
    /// How often the eviction sweep runs.
    pub gc_interval: Duration,
}

impl Default for MediaServerConfig {
    fn default() -> Self {
        Self {
            ip: None,
            port: 0,
            payload_idle_timeout: Duration::from_secs(900),
            gc_interval: Duration::from_secs(60),
        }
    }
}

impl MediaServerConfig {
    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = Some(ip.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_payload_idle_timeout(mut self, timeout: Duration) -> Self {
        self.payload_idle_timeout = timeout;
        self
    }

    pub fn with_gc_interval(mut self, interval: Duration) -> Self {
        self.gc_interval = interval;
        self
    }
}

/// What happens when a subscriber's buffer is full.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OverflowPolicy {
    /// Discard the oldest buffered event and count the drop.
    DropOldest,
    /// Block the publisher up to the given duration, then drop the new event.
    BlockWithTimeout(Duration),
}

/// Event fan-out settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventBusConfig {
    /// Per-subscription buffer capacity, in events.
    pub buffer_capacity: usize,
    pub overflow: OverflowPolicy,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 256,
            overflow: OverflowPolicy::DropOldest,
        }
    }
}

impl EventBusConfig {
    pub fn with_buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity;
        self
    }

    pub fn with_overflow(mut self, overflow: OverflowPolicy) -> Self {
        self.overflow = overflow;
        self
    }
}
