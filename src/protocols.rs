//! Collaborator trait definitions for the connection manager.
//!
//! The manager depends on external services it does not implement itself:
//! the DHT used as a rendezvous medium, the account's certificate store,
//! and an optional UPnP controller for port mappings. Each is a trait seam
//! injected through the configuration.
//!
//! | Collaborator | Trait | Purpose |
//! |--------------|-------|---------|
//! | DHT | [`DhtRunner`] | Encrypted offer/answer signaling |
//! | Certificates | [`CertificateStore`] | Device certificate lookup and trust policy |
//! | UPnP | [`UpnpController`] | Port mappings for ICE host candidates |
//!
//! Traits are defined here separately from implementations to keep the
//! manager testable against in-memory fakes and to avoid dragging network
//! stacks into the dependency graph.

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::identity::{DeviceCertificate, DeviceId};

/// A value delivered by the DHT to a listener or a get.
///
/// The DHT layer decrypts values addressed to the local device key and
/// authenticates the sender; `from` is the sender's device certificate as
/// established by that layer.
#[derive(Clone, Debug)]
pub struct DhtValue {
    pub from: DeviceCertificate,
    pub payload: Vec<u8>,
}

/// Opaque handle identifying an active listen operation.
pub type ListenToken = u64;

/// Rendezvous DHT operations.
///
/// Values put with a recipient device are encrypted to that device's key by
/// the implementation. Listen delivery may repeat values; consumers must
/// deduplicate.
#[async_trait]
pub trait DhtRunner: Send + Sync + 'static {
    /// Publish a value under `key`, encrypted to the device `to`.
    async fn put(&self, key: Vec<u8>, to: DeviceId, value: Vec<u8>) -> Result<()>;

    /// Start listening on `key`; decrypted values are delivered on `tx`.
    fn listen(&self, key: Vec<u8>, tx: mpsc::Sender<DhtValue>) -> ListenToken;

    /// Stop a listen started with [`DhtRunner::listen`].
    fn cancel_listen(&self, token: ListenToken);

    /// Fetch the values currently stored under `key`.
    async fn get(&self, key: Vec<u8>) -> Result<Vec<DhtValue>>;
}

/// The account's certificate store: local lookup, pinning and trust policy.
pub trait CertificateStore: Send + Sync + std::fmt::Debug + 'static {
    /// Look up a locally known certificate for a device.
    fn find(&self, device: &DeviceId) -> Option<DeviceCertificate>;

    /// Pin a certificate learned from the network.
    fn pin(&self, cert: DeviceCertificate);

    /// Apply the account trust policy to a presented chain.
    /// The end-entity certificate comes first.
    fn verify(&self, chain: &[DeviceCertificate]) -> bool;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PortProtocol {
    Udp,
    Tcp,
}

/// A reserved IGD port mapping.
#[derive(Clone, Copy, Debug)]
pub struct PortMapping {
    pub external_port: u16,
    pub internal_port: u16,
    pub protocol: PortProtocol,
}

/// UPnP IGD controller used to open ports for ICE host candidates.
pub trait UpnpController: Send + Sync + 'static {
    /// Whether the controller has an IGD available and can make mappings.
    fn is_ready(&self) -> bool;

    /// Reserve a mapping for `port`, returning the granted mapping if any.
    fn reserve_mapping(&self, port: u16, protocol: PortProtocol) -> Option<PortMapping>;
}
