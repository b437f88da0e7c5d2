//! Configuration of a connection manager instance, plus the runtime
//! address caches.
//!
//! The configuration is immutable after construction; only the published
//! address and the resolved TURN addresses change at runtime, each behind
//! its own lock.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::Result;

use crate::crypto::generate_device_certificate;
use crate::ice::IceFactory;
use crate::identity::{DeviceCertificate, DeviceId, DeviceKeypair};
use crate::multiplexed_socket::SocketTuning;
use crate::protocols::{CertificateStore, DhtRunner, UpnpController};

/// The local device's keypair and matching certificate chain.
#[derive(Clone)]
pub struct DeviceIdentity {
    pub keypair: DeviceKeypair,
    pub certificate: DeviceCertificate,
}

impl DeviceIdentity {
    /// Generate the self-signed certificate for an existing keypair.
    pub fn from_keypair(keypair: DeviceKeypair) -> Result<Self> {
        let (certs, _key) = generate_device_certificate(&keypair)?;
        let certificate = DeviceCertificate::from_der(certs[0].as_ref().to_vec())?;
        Ok(Self {
            keypair,
            certificate,
        })
    }

    pub fn device_id(&self) -> DeviceId {
        self.keypair.device_id()
    }
}

/// Per-state deadlines of a connection negotiation.
#[derive(Clone, Copy, Debug)]
pub struct NegotiationTimeouts {
    /// Resolving the peer certificate (store miss, DHT lookup).
    pub cert_resolution: Duration,
    /// DHT offer/answer exchange.
    pub signaling: Duration,
    /// ICE gathering and connectivity checks.
    pub ice: Duration,
    /// TLS handshake.
    pub tls: Duration,
}

impl Default for NegotiationTimeouts {
    fn default() -> Self {
        Self {
            cert_resolution: Duration::from_secs(15),
            signaling: Duration::from_secs(30),
            ice: Duration::from_secs(30),
            tls: Duration::from_secs(15),
        }
    }
}

/// Everything a [`ConnectionManager`](crate::ConnectionManager) needs,
/// set before first use.
pub struct ConnectionManagerConfig {
    pub stun_enabled: bool,
    pub stun_server: String,
    pub turn_enabled: bool,
    pub turn_server: String,
    pub turn_server_user_name: String,
    pub turn_server_pwd: String,
    pub turn_server_realm: String,
    /// Directory for transient caches. Unused when `None`.
    pub cache_path: Option<PathBuf>,
    pub dht: Arc<dyn DhtRunner>,
    pub identity: DeviceIdentity,
    pub cert_store: Arc<dyn CertificateStore>,
    pub upnp_enabled: bool,
    pub upnp: Option<Arc<dyn UpnpController>>,
    pub ice_factory: Arc<dyn IceFactory>,
    pub timeouts: NegotiationTimeouts,
    pub socket_tuning: SocketTuning,
}

impl ConnectionManagerConfig {
    /// Minimal configuration: STUN/TURN/UPnP disabled, default timeouts.
    pub fn new(
        dht: Arc<dyn DhtRunner>,
        identity: DeviceIdentity,
        cert_store: Arc<dyn CertificateStore>,
        ice_factory: Arc<dyn IceFactory>,
    ) -> Self {
        Self {
            stun_enabled: false,
            stun_server: String::new(),
            turn_enabled: false,
            turn_server: String::new(),
            turn_server_user_name: String::new(),
            turn_server_pwd: String::new(),
            turn_server_realm: String::new(),
            cache_path: None,
            dht,
            identity,
            cert_store,
            upnp_enabled: false,
            upnp: None,
            ice_factory,
            timeouts: NegotiationTimeouts::default(),
            socket_tuning: SocketTuning::default(),
        }
    }
}

/// Address family selector for published address queries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IpFamily {
    /// No preference; IPv4 wins when both are known.
    Any,
    V4,
    V6,
}

#[derive(Default)]
struct PublishedAddresses {
    v4: Option<IpAddr>,
    v6: Option<IpAddr>,
}

#[derive(Default)]
struct TurnAddresses {
    v4: Option<SocketAddr>,
    v6: Option<SocketAddr>,
}

/// Updatable cache of the published local address and the resolved TURN
/// server addresses.
#[derive(Default)]
pub struct AddressCache {
    published: StdMutex<PublishedAddresses>,
    turn: StdMutex<TurnAddresses>,
}

impl AddressCache {
    /// The address ICE advertises for this device.
    pub fn published_ip(&self, family: IpFamily) -> Option<IpAddr> {
        let published = self.published.lock().expect("published address lock poisoned");
        match family {
            IpFamily::V4 => published.v4,
            IpFamily::V6 => published.v6,
            IpFamily::Any => published.v4.or(published.v6),
        }
    }

    /// Record a published address in its family slot.
    pub fn set_published_ip(&self, addr: IpAddr) {
        let mut published = self.published.lock().expect("published address lock poisoned");
        match addr {
            IpAddr::V4(_) => published.v4 = Some(addr),
            IpAddr::V6(_) => published.v6 = Some(addr),
        }
    }

    pub fn cached_turn(&self, family: IpFamily) -> Option<SocketAddr> {
        let turn = self.turn.lock().expect("turn cache lock poisoned");
        match family {
            IpFamily::V4 => turn.v4,
            IpFamily::V6 => turn.v6,
            IpFamily::Any => turn.v4.or(turn.v6),
        }
    }

    pub fn set_cached_turn(&self, addr: SocketAddr) {
        let mut turn = self.turn.lock().expect("turn cache lock poisoned");
        if addr.is_ipv4() {
            turn.v4 = Some(addr);
        } else {
            turn.v6 = Some(addr);
        }
    }
}

/// Discover the local addresses this host can be reached on.
///
/// Probes by connecting UDP sockets toward public resolvers and reading
/// the chosen source address; no packets are actually sent. Loopback is
/// appended as a fallback so the result is never empty.
pub(crate) fn probe_local_addresses() -> Vec<IpAddr> {
    let mut addresses = Vec::new();

    let probe_targets = ["8.8.8.8:53", "1.1.1.1:53", "9.9.9.9:53"];
    for target in probe_targets {
        if let Ok(socket) = std::net::UdpSocket::bind("0.0.0.0:0") {
            if socket.connect(target).is_ok() {
                if let Ok(local) = socket.local_addr() {
                    let ip = local.ip();
                    if !ip.is_loopback() && !ip.is_unspecified() && !addresses.contains(&ip) {
                        addresses.push(ip);
                    }
                }
            }
        }
    }

    let ipv6_targets = ["[2001:4860:4860::8888]:53", "[2606:4700:4700::1111]:53"];
    for target in ipv6_targets {
        if let Ok(socket) = std::net::UdpSocket::bind("[::]:0") {
            if socket.connect(target).is_ok() {
                if let Ok(local) = socket.local_addr() {
                    let ip = local.ip();
                    if !ip.is_loopback() && !ip.is_unspecified() && !addresses.contains(&ip) {
                        addresses.push(ip);
                    }
                }
            }
        }
    }

    if addresses.is_empty() {
        addresses.push(IpAddr::V4(std::net::Ipv4Addr::LOCALHOST));
    }

    addresses
}
