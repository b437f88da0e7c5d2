//! # dhtlink - DHT-Rendezvous Connection Manager
//!
//! dhtlink establishes, multiplexes and maintains authenticated,
//! encrypted, NAT-traversing transports between devices identified by
//! cryptographic fingerprints. A distributed hash table serves purely as
//! the rendezvous signaling medium; application logic opens named byte
//! channels on top of each negotiated transport.
//!
//! ## Connection Flow
//!
//! ```text
//! connect_device(peer, "git")
//!   │ resolve certificate (store → DHT, bounded)
//!   │ reuse ready socket / attach to pending negotiation
//!   ▼
//! ICE gathering ──► DHT offer ──► answer ──► connectivity checks
//!   ▼
//! mutual TLS (fingerprint-bound) ──► MultiplexedSocket ──► ChannelSocket
//! ```
//!
//! The inbound path mirrors it: the DHT listener decrypts offers, the
//! ICE-request callback gates them, and accepted channels surface through
//! the connection-ready callback.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `connection_manager` | Orchestrator: registry, negotiation, public API |
//! | `multiplexed_socket` | Framed channel multiplexer over one transport |
//! | `channel` | Per-channel byte stream handles |
//! | `ice` | ICE library seam and transport wrapper |
//! | `tls` | Mutual TLS bound to device fingerprints |
//! | `identity` | Keypairs, fingerprints, device certificates |
//! | `crypto` | Certificate generation and rustls verifiers |
//! | `messages` | Wire types and the frame codec |
//! | `protocols` | DHT / certificate store / UPnP collaborator traits |
//! | `config` | Configuration and address caches |
//!
//! ## External Collaborators
//!
//! The DHT client, certificate store, UPnP controller and the low-level
//! ICE library are injected as trait objects; this crate contains no
//! network discovery of its own.

mod channel;
mod config;
mod connection_manager;
mod crypto;
mod ice;
mod identity;
mod messages;
mod multiplexed_socket;
mod protocols;
mod tls;

pub use channel::ChannelSocket;
pub use config::{
    AddressCache, ConnectionManagerConfig, DeviceIdentity, IpFamily, NegotiationTimeouts,
};
pub use connection_manager::{
    ChannelRequestCallback, ConnectOptions, ConnectTarget, ConnectionError, ConnectionManager,
    ConnectionReadyCallback, IceRequestCallback, WakeRequestCallback,
};
pub use crypto::{extract_device_id_from_cert, generate_device_certificate, ALPN};
pub use ice::{
    IceAttributes, IceFactory, IceSession, IceStream, IceTransport, IceTransportOptions,
    StunServer, TurnServer,
};
pub use identity::{DeviceCertificate, DeviceId, DeviceKeypair};
pub use messages::{deserialize_request, serialize_request, IceSdp, PeerConnectionRequest};
pub use multiplexed_socket::{
    ChannelOpenError, MultiplexedSocket, SocketHooks, SocketTuning,
};
pub use protocols::{
    CertificateStore, DhtRunner, DhtValue, ListenToken, PortMapping, PortProtocol,
    UpnpController,
};
pub use tls::{TlsError, TlsSession};
