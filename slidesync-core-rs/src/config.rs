//! Configuration for presenter and viewer nodes
//!
//! Combines settings for local persistence, the presenter endpoint and the
//! follower's reconnect policy.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::BackoffClass;

/// Default TCP port for the presenter endpoint
pub const DEFAULT_PORT: u16 = 9470;

/// Complete node configuration
#[derive(Debug, Clone, Default)]
pub struct SyncConfig {
    pub store: StoreConfig,
    pub presenter: PresenterConfig,
    pub reconnect: ReconnectPolicy,
}

/// Local persistence settings
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Directory holding the persisted state
    pub dir: PathBuf,

    /// Fixed key per deployment
    pub key: String,

    /// Largest encoded payload accepted by `save`
    pub quota_bytes: usize,

    /// Drop a previous session's value when a presenter starts
    pub clear_on_start: bool,
}

/// Presenter endpoint settings
#[derive(Debug, Clone)]
pub struct PresenterConfig {
    /// Address the WebSocket endpoint listens on
    pub listen: SocketAddr,

    /// Host placed in the viewer link
    pub public_host: String,

    /// Delay before accepting again after an accept failure
    pub accept_retry_delay: Duration,

    /// Time a new connection gets to finish the WebSocket handshake
    pub handshake_timeout: Duration,

    /// Largest WebSocket message accepted or sent
    pub max_message_size: usize,

    /// Announce the session over mDNS
    pub use_mdns: bool,
}

/// Follower reconnect policy. Retries are unbounded.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Delay after an open channel closes
    pub closed_delay: Duration,

    /// Delay after the target reports no such session
    pub unavailable_delay: Duration,

    /// Delay after network-class failures and timeouts
    pub network_delay: Duration,

    /// Upper bound on one connection attempt, discovery included
    pub connect_timeout: Duration,

    /// Largest WebSocket message accepted
    pub max_message_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./slidesync-data"),
            key: "slidesync_state".to_string(),
            quota_bytes: 5 * 1024 * 1024, // 5 MiB
            clear_on_start: true,
        }
    }
}

impl Default for PresenterConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            public_host: "127.0.0.1".to_string(),
            accept_retry_delay: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(10),
            max_message_size: 16 * 1024 * 1024,
            use_mdns: true,
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            closed_delay: Duration::from_secs(5),
            unavailable_delay: Duration::from_secs(3),
            network_delay: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(12),
            max_message_size: 16 * 1024 * 1024,
        }
    }
}

impl ReconnectPolicy {
    /// Fixed backoff for a failure class
    pub fn delay_for(&self, class: BackoffClass) -> Duration {
        match class {
            BackoffClass::Closed => self.closed_delay,
            BackoffClass::PeerUnavailable => self.unavailable_delay,
            BackoffClass::Network => self.network_delay,
        }
    }

    /// Same delay for every failure class; handy in tests
    pub fn uniform(delay: Duration) -> Self {
        Self {
            closed_delay: delay,
            unavailable_delay: delay,
            network_delay: delay,
            ..Default::default()
        }
    }
}

impl SyncConfig {
    /// Set storage directory
    pub fn with_store_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.store.dir = dir.into();
        self
    }

    /// Set storage key
    pub fn with_store_key(mut self, key: impl Into<String>) -> Self {
        self.store.key = key.into();
        self
    }

    /// Set storage quota
    pub fn with_quota(mut self, bytes: usize) -> Self {
        self.store.quota_bytes = bytes;
        self
    }

    /// Keep a previous session's persisted value at startup
    pub fn keep_stale_state(mut self) -> Self {
        self.store.clear_on_start = false;
        self
    }

    /// Set listen address
    pub fn with_listen(mut self, addr: SocketAddr) -> Self {
        self.presenter.listen = addr;
        self
    }

    /// Set host used in viewer links
    pub fn with_public_host(mut self, host: impl Into<String>) -> Self {
        self.presenter.public_host = host.into();
        self
    }

    /// Set how long a viewer may take to complete the handshake
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.presenter.handshake_timeout = timeout;
        self
    }

    /// Disable mDNS announcement
    pub fn without_mdns(mut self) -> Self {
        self.presenter.use_mdns = false;
        self
    }

    /// Set the follower reconnect policy
    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }
}
