//! mDNS discovery of presenter sessions
//!
//! A presenter announces itself with its session identity as the instance
//! name, so a viewer that only knows the identity can find the endpoint.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use tracing::{debug, info, warn};

use crate::error::TransportError;
use crate::identity::SessionId;

/// mDNS service type for slidesync presenters
const SERVICE_TYPE: &str = "_slidesync._tcp.local.";

/// Live mDNS announcement of a presenter session
pub struct Announcement {
    daemon: ServiceDaemon,
    fullname: String,
}

impl Announcement {
    /// Announce `session` as reachable on `port`
    pub fn start(session: &SessionId, port: u16) -> Result<Self, TransportError> {
        let daemon = ServiceDaemon::new()?;
        let host = format!("{}.local.", session);

        let mut properties = HashMap::new();
        properties.insert("version".to_string(), env!("CARGO_PKG_VERSION").to_string());

        let service_info = ServiceInfo::new(
            SERVICE_TYPE,
            session.as_str(),
            &host,
            (),
            port,
            properties,
        )?
        .enable_addr_auto();
        let fullname = service_info.get_fullname().to_string();

        daemon.register(service_info)?;
        info!("mDNS: Announcing {} on {}", session, SERVICE_TYPE);

        Ok(Self { daemon, fullname })
    }

    /// Withdraw the announcement
    pub fn shutdown(self) {
        if let Err(e) = self.daemon.unregister(&self.fullname) {
            debug!("mDNS: unregister failed: {}", e);
        }
        if let Err(e) = self.daemon.shutdown() {
            debug!("mDNS: shutdown failed: {}", e);
        }
    }
}

/// Instance name of a fully qualified service name
fn instance_name(fullname: &str) -> &str {
    fullname.split('.').next().unwrap_or("")
}

/// Browsing daemon that is shut down however the browse ends, including
/// when the resolving future is dropped by an outer timeout
struct BrowseDaemon(ServiceDaemon);

impl Drop for BrowseDaemon {
    fn drop(&mut self) {
        if let Err(e) = self.0.shutdown() {
            debug!("mDNS: shutdown failed: {}", e);
        }
    }
}

/// Find the endpoint announcing `session`, giving up after `timeout`
pub async fn resolve(session: &SessionId, timeout: Duration) -> Result<SocketAddr, TransportError> {
    resolve_with(ServiceDaemon::new()?, session, timeout).await
}

async fn resolve_with(
    daemon: ServiceDaemon,
    session: &SessionId,
    timeout: Duration,
) -> Result<SocketAddr, TransportError> {
    let daemon = BrowseDaemon(daemon);
    let receiver = daemon.0.browse(SERVICE_TYPE)?;
    debug!("mDNS: Browsing for {}", session);

    let search = async {
        loop {
            match receiver.recv_async().await {
                Ok(ServiceEvent::ServiceResolved(info)) => {
                    if instance_name(info.get_fullname()) != session.as_str() {
                        continue;
                    }
                    let addresses = info.get_addresses();
                    let addr = addresses
                        .iter()
                        .find(|a| a.is_ipv4())
                        .or_else(|| addresses.iter().next())
                        .copied();
                    match addr {
                        Some(ip) => return Ok(SocketAddr::new(ip, info.get_port())),
                        None => warn!("mDNS: {} resolved without addresses", session),
                    }
                }
                Ok(_) => {}
                Err(e) => return Err(TransportError::Discovery(e.to_string())),
            }
        }
    };

    let result = match tokio::time::timeout(timeout, search).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout(timeout)),
    };
    drop(daemon);

    if let Ok(addr) = &result {
        info!("mDNS: Discovered {} at {}", session, addr);
    }
    result
}

/// Prefer a concrete address when the endpoint listens on a wildcard
pub fn advertised_host(listen: IpAddr, public_host: &str) -> String {
    if listen.is_unspecified() {
        public_host.to_string()
    } else {
        listen.to_string()
    }
}
