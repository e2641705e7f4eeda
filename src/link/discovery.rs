//! LAN visibility for hosted sessions.
//!
//! A hosting session periodically broadcasts a small UDP announcement carrying
//! the service name, the service type and its TCP port. Browsers listen on the
//! discovery port and list what they hear; joining still takes an explicit
//! address.
//!
//! Packet layout:
//!
//! ```text
//! [magic "MGBL"][u16 tcp port, BE][u8 len][name][u8 len][service type]
//! ```

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{SERVICE_NAME, SERVICE_TYPE};

const MAGIC: &[u8; 4] = b"MGBL";
const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(1);
const RECV_BUFFER_LEN: usize = 512;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed announcement: {0}")]
    Malformed(&'static str),
    #[error("field too long for announcement: {0}")]
    FieldTooLong(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceAnnouncement {
    pub name: String,
    pub service_type: String,
    pub port: u16,
}

impl ServiceAnnouncement {
    /// Announcement for the fixed link service on `port`.
    pub fn link_service(port: u16) -> Self {
        Self {
            name: SERVICE_NAME.to_string(),
            service_type: SERVICE_TYPE.to_string(),
            port,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, DiscoveryError> {
        let name = self.name.as_bytes();
        let service_type = self.service_type.as_bytes();
        let name_len = u8::try_from(name.len()).map_err(|_| DiscoveryError::FieldTooLong("name"))?;
        let type_len = u8::try_from(service_type.len())
            .map_err(|_| DiscoveryError::FieldTooLong("service type"))?;

        let mut out = Vec::with_capacity(MAGIC.len() + 2 + 2 + name.len() + service_type.len());
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&self.port.to_be_bytes());
        out.push(name_len);
        out.extend_from_slice(name);
        out.push(type_len);
        out.extend_from_slice(service_type);
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DiscoveryError> {
        let rest = bytes
            .strip_prefix(MAGIC.as_slice())
            .ok_or(DiscoveryError::Malformed("bad magic"))?;
        let (port, rest) = split(rest, 2)?;
        let port = u16::from_be_bytes([port[0], port[1]]);
        let (name, rest) = length_prefixed(rest)?;
        let (service_type, rest) = length_prefixed(rest)?;
        if !rest.is_empty() {
            return Err(DiscoveryError::Malformed("trailing bytes"));
        }
        Ok(Self {
            name,
            service_type,
            port,
        })
    }

    pub fn is_link_service(&self) -> bool {
        self.service_type == SERVICE_TYPE
    }
}

fn split(bytes: &[u8], n: usize) -> Result<(&[u8], &[u8]), DiscoveryError> {
    if bytes.len() < n {
        return Err(DiscoveryError::Malformed("truncated"));
    }
    Ok(bytes.split_at(n))
}

fn length_prefixed(bytes: &[u8]) -> Result<(String, &[u8]), DiscoveryError> {
    let (len, rest) = split(bytes, 1)?;
    let (field, rest) = split(rest, len[0] as usize)?;
    let field = std::str::from_utf8(field).map_err(|_| DiscoveryError::Malformed("not utf-8"))?;
    Ok((field.to_string(), rest))
}

/// A host heard on the LAN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredHost {
    pub name: String,
    /// Address to pass to `join_host`.
    pub address: SocketAddr,
}

/// Background task broadcasting one announcement. Stops when dropped.
#[derive(Debug)]
pub struct Advertiser {
    handle: JoinHandle<()>,
}

impl Advertiser {
    /// Broadcasts on the local network.
    pub async fn broadcast(
        announcement: &ServiceAnnouncement,
        discovery_port: u16,
    ) -> Result<Self, DiscoveryError> {
        let target = SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), discovery_port);
        Self::spawn(announcement, target).await
    }

    /// Sends the announcement to `target` once per interval.
    pub async fn spawn(
        announcement: &ServiceAnnouncement,
        target: SocketAddr,
    ) -> Result<Self, DiscoveryError> {
        let payload = announcement.encode()?;
        let socket = UdpSocket::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)).await?;
        socket.set_broadcast(true)?;

        info!(
            "Advertising '{}' ({}) on port {} via {}",
            announcement.name, announcement.service_type, announcement.port, target
        );
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ANNOUNCE_INTERVAL);
            loop {
                ticker.tick().await;
                if let Err(e) = socket.send_to(&payload, target).await {
                    warn!("Announcement to {} failed: {}", target, e);
                }
            }
        });
        Ok(Self { handle })
    }
}

impl Drop for Advertiser {
    fn drop(&mut self) {
        debug!("Stopping advertiser");
        self.handle.abort();
    }
}

/// Listens for announcements on the discovery port.
#[derive(Debug)]
pub struct DiscoveryListener {
    socket: UdpSocket,
}

impl DiscoveryListener {
    pub async fn bind(port: u16) -> Result<Self, DiscoveryError> {
        let socket = UdpSocket::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)).await?;
        Ok(Self { socket })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, DiscoveryError> {
        Ok(self.socket.local_addr()?)
    }

    /// Collects link hosts heard during `window`, deduplicated by address.
    pub async fn collect(&self, window: Duration) -> Vec<DiscoveredHost> {
        let deadline = Instant::now() + window;
        let mut hosts = BTreeMap::new();
        let mut buf = [0u8; RECV_BUFFER_LEN];

        loop {
            let received = tokio::select! {
                _ = tokio::time::sleep_until(deadline) => break,
                received = self.socket.recv_from(&mut buf) => received,
            };
            let (len, source) = match received {
                Ok(received) => received,
                Err(e) => {
                    warn!("Discovery receive failed: {}", e);
                    continue;
                }
            };
            match ServiceAnnouncement::decode(&buf[..len]) {
                Ok(announcement) if announcement.is_link_service() => {
                    let address = SocketAddr::new(source.ip(), announcement.port);
                    if hosts.insert(address, announcement.name.clone()).is_none() {
                        info!("Found '{}' at {}", announcement.name, address);
                    }
                }
                Ok(other) => debug!("Ignoring service type '{}' from {}", other.service_type, source),
                Err(e) => debug!("Ignoring datagram from {}: {}", source, e),
            }
        }

        hosts
            .into_iter()
            .map(|(address, name)| DiscoveredHost { name, address })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_service_announcement_layout() {
        let bytes = ServiceAnnouncement::link_service(8888).encode().unwrap();
        assert_eq!(&bytes[..4], b"MGBL");
        assert_eq!(&bytes[4..6], &8888u16.to_be_bytes());
        assert_eq!(bytes[6] as usize, SERVICE_NAME.len());

        let decoded = ServiceAnnouncement::decode(&bytes).unwrap();
        assert_eq!(decoded.name, "mGBA-Multiplayer");
        assert_eq!(decoded.service_type, "_mgba._tcp");
        assert_eq!(decoded.port, 8888);
        assert!(decoded.is_link_service());
    }

    #[test]
    fn rejects_garbage() {
        assert!(ServiceAnnouncement::decode(b"NOPE\x22\xb8").is_err());
        let mut bytes = ServiceAnnouncement::link_service(1).encode().unwrap();
        bytes.pop();
        assert!(matches!(
            ServiceAnnouncement::decode(&bytes),
            Err(DiscoveryError::Malformed("truncated"))
        ));
        bytes.extend_from_slice(b"p!");
        assert!(ServiceAnnouncement::decode(&bytes).is_err());
    }

    #[test]
    fn oversized_name_is_refused() {
        let announcement = ServiceAnnouncement {
            name: "x".repeat(300),
            service_type: SERVICE_TYPE.into(),
            port: 1,
        };
        assert!(matches!(
            announcement.encode(),
            Err(DiscoveryError::FieldTooLong("name"))
        ));
    }

    #[tokio::test]
    async fn hears_advertiser_over_loopback() {
        let listener = DiscoveryListener::bind(0).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let target = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);

        let _advertiser = Advertiser::spawn(&ServiceAnnouncement::link_service(4242), target)
            .await
            .unwrap();
        let _other = Advertiser::spawn(
            &ServiceAnnouncement {
                name: "printer".into(),
                service_type: "_ipp._tcp".into(),
                port: 631,
            },
            target,
        )
        .await
        .unwrap();

        let hosts = listener.collect(Duration::from_millis(300)).await;
        assert_eq!(
            hosts,
            vec![DiscoveredHost {
                name: SERVICE_NAME.into(),
                address: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 4242),
            }]
        );
    }
}
