//! # Connection Manager
//!
//! The orchestrator: owns the rendezvous listener, the registry of pending
//! negotiations and ready sockets, and the public connect/notify API.
//!
//! ## Outgoing path
//!
//! `connect_device` resolves the peer certificate (store, then DHT with a
//! bounded wait), reuses a ready socket when one exists, attaches to an
//! in-flight negotiation for the same device, or starts a fresh one:
//! gather ICE candidates, publish an encrypted offer under the peer's
//! `peer:<infohash>` key, await the answer, run connectivity checks, then
//! a mutual TLS handshake bound to the expected fingerprint. The resulting
//! socket lands in the registry and every queued channel open drains
//! through it.
//!
//! ## Incoming path
//!
//! The DHT listener decrypts offers, gates them through the ICE-request
//! callback, answers with local candidates, and accepts the TLS handshake.
//! Channel opens on established sockets are gated by the channel-request
//! callback and surfaced through the connection-ready callback.
//!
//! When both sides dial each other simultaneously, the device with the
//! lower fingerprint keeps its offer; the other side discards its own
//! context and serves the inbound one, inheriting any queued opens.
//!
//! ## Locking
//!
//! One mutex guards the registry maps and is held only across map
//! mutations. User callbacks are never invoked under it.

use std::collections::HashMap;
use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::Duration;

use lru::LruCache;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::channel::ChannelSocket;
use crate::config::{AddressCache, ConnectionManagerConfig, IpFamily};
use crate::crypto::{create_client_config, create_server_config, generate_device_certificate};
use crate::ice::{IceTransport, IceTransportOptions, StunServer, TurnServer};
use crate::identity::{DeviceCertificate, DeviceId};
use crate::messages::{self, IceSdp, PeerConnectionRequest};
use crate::multiplexed_socket::{ChannelOpenError, MultiplexedSocket, SocketHooks};
use crate::protocols::DhtValue;
use crate::tls::{TlsError, TlsSession};

/// Bounded retries for transient DHT put faults within the signaling window.
const DHT_PUT_ATTEMPTS: u32 = 3;

/// Backoff between DHT put retries.
const DHT_PUT_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Size of the treated-request cache suppressing duplicate DHT deliveries.
const TREATED_CACHE_SIZE: usize = 512;

/// Capacity of the DHT listener delivery queue.
const DHT_LISTEN_QUEUE: usize = 64;

// ============================================================================
// Public error taxonomy
// ============================================================================

/// Why a connection or channel could not be delivered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionError {
    /// The peer certificate could not be resolved.
    UnknownPeer,
    /// A negotiation state exceeded its deadline.
    NegotiationTimeout,
    /// ICE found no working candidate pair.
    IceFailed,
    /// The TLS handshake failed or the peer identity did not match.
    TlsFailed,
    /// The channel open was rejected, or the inbound offer was declined.
    PeerDeclined,
    /// The socket died after being ready (includes beacon timeout).
    TransportClosed,
    /// `no_new_socket` was set and no ready socket exists.
    NoExistingSocket,
    /// The connection manager is shutting down.
    Shutdown,
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionError::UnknownPeer => write!(f, "peer certificate cannot be resolved"),
            ConnectionError::NegotiationTimeout => write!(f, "negotiation timed out"),
            ConnectionError::IceFailed => write!(f, "ICE negotiation failed"),
            ConnectionError::TlsFailed => write!(f, "TLS handshake failed"),
            ConnectionError::PeerDeclined => write!(f, "peer declined the request"),
            ConnectionError::TransportClosed => write!(f, "transport closed"),
            ConnectionError::NoExistingSocket => write!(f, "no existing socket to the peer"),
            ConnectionError::Shutdown => write!(f, "connection manager shut down"),
        }
    }
}

impl std::error::Error for ConnectionError {}

impl From<ChannelOpenError> for ConnectionError {
    fn from(err: ChannelOpenError) -> Self {
        match err {
            ChannelOpenError::Declined(_) => ConnectionError::PeerDeclined,
            ChannelOpenError::Timeout => ConnectionError::NegotiationTimeout,
            ChannelOpenError::TransportClosed => ConnectionError::TransportClosed,
            ChannelOpenError::IdSpaceExhausted => ConnectionError::TransportClosed,
            ChannelOpenError::InvalidName => ConnectionError::PeerDeclined,
        }
    }
}

impl From<&TlsError> for ConnectionError {
    fn from(err: &TlsError) -> Self {
        match err {
            TlsError::Timeout => ConnectionError::NegotiationTimeout,
            TlsError::TransportClosed => ConnectionError::TransportClosed,
            _ => ConnectionError::TlsFailed,
        }
    }
}

// ============================================================================
// Public API types
// ============================================================================

/// Options of a [`ConnectionManager::connect_device_with`] call.
#[derive(Clone, Debug, Default)]
pub struct ConnectOptions {
    /// Fail with [`ConnectionError::NoExistingSocket`] instead of
    /// negotiating when no ready socket exists.
    pub no_new_socket: bool,
    /// Negotiate a fresh socket even when one is ready. Runs in parallel
    /// with any pending non-forced negotiation.
    pub force_new_socket: bool,
    /// Opaque tag the remote can use to classify wake-up notifications.
    pub conn_type: String,
}

/// Target of a connect call: a device fingerprint, or a certificate when
/// the caller already holds one.
#[derive(Clone, Debug)]
pub enum ConnectTarget {
    Device(DeviceId),
    Certificate(DeviceCertificate),
}

impl From<DeviceId> for ConnectTarget {
    fn from(device: DeviceId) -> Self {
        ConnectTarget::Device(device)
    }
}

impl From<DeviceCertificate> for ConnectTarget {
    fn from(cert: DeviceCertificate) -> Self {
        ConnectTarget::Certificate(cert)
    }
}

/// Gate for inbound offers: `device -> accept`.
pub type IceRequestCallback = Arc<dyn Fn(&DeviceId) -> bool + Send + Sync>;
/// Gate for inbound channel opens: `(certificate, name) -> accept`.
pub type ChannelRequestCallback = Arc<dyn Fn(&DeviceCertificate, &str) -> bool + Send + Sync>;
/// Notification for every accepted inbound channel.
pub type ConnectionReadyCallback = Arc<dyn Fn(DeviceId, &str, ChannelSocket) + Send + Sync>;
/// Wake-up hook for offers carrying a `conn_type` tag: `(conn_type, device)
/// -> handled`. Returning true skips normal processing of the offer.
pub type WakeRequestCallback = Arc<dyn Fn(&str, &DeviceId) -> bool + Send + Sync>;

// ============================================================================
// Registry
// ============================================================================

type ConnectWaiter = oneshot::Sender<Result<ChannelSocket, ConnectionError>>;

struct PendingConnection {
    request_id: u64,
    /// True for locally initiated negotiations; used by the
    /// simultaneous-open tie-break.
    outbound: bool,
    /// Channel name -> callers waiting for that channel on this transport.
    waiters: HashMap<String, Vec<ConnectWaiter>>,
    /// Routes the matching DHT answer into the negotiation task.
    answer_tx: Option<oneshot::Sender<IceSdp>>,
    ice: Option<Arc<IceTransport>>,
    task: Option<JoinHandle<()>>,
    /// Owner URI from the certificate, for `close_connections_with`.
    owner: Option<String>,
}

impl PendingConnection {
    fn new(request_id: u64, outbound: bool, owner: Option<String>) -> Self {
        Self {
            request_id,
            outbound,
            waiters: HashMap::new(),
            answer_tx: None,
            ice: None,
            task: None,
            owner,
        }
    }

    fn add_waiter(&mut self, name: &str, waiter: ConnectWaiter) {
        self.waiters.entry(name.to_string()).or_default().push(waiter);
    }

    /// Abort the negotiation and fail every waiter.
    fn cancel(mut self, error: ConnectionError) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        if let Some(ice) = self.ice.take() {
            ice.cancel_operations();
        }
        for (_, waiters) in self.waiters.drain() {
            for waiter in waiters {
                let _ = waiter.send(Err(error));
            }
        }
    }
}

struct ReadySocket {
    token: u64,
    socket: Arc<MultiplexedSocket>,
}

#[derive(Default)]
struct Registry {
    /// At most one non-forced pending negotiation per device.
    connecting: HashMap<DeviceId, PendingConnection>,
    /// Forced parallel negotiations, keyed by (device, request id).
    forced: HashMap<(DeviceId, u64), PendingConnection>,
    ready: HashMap<DeviceId, Vec<ReadySocket>>,
    shutdown: bool,
    next_socket_token: u64,
}

#[derive(Default)]
struct Callbacks {
    ice_request: RwLock<Option<IceRequestCallback>>,
    channel_request: RwLock<Option<ChannelRequestCallback>>,
    connection_ready: RwLock<Option<ConnectionReadyCallback>>,
    wake_request: RwLock<Option<WakeRequestCallback>>,
}

struct ManagerInner {
    config: ConnectionManagerConfig,
    local_device: DeviceId,
    client_tls: Arc<rustls::ClientConfig>,
    server_tls: Arc<rustls::ServerConfig>,
    registry: StdMutex<Registry>,
    callbacks: Callbacks,
    addresses: AddressCache,
    /// Suppresses duplicate DHT deliveries of the same request.
    treated: StdMutex<LruCache<(DeviceId, u64, bool), ()>>,
    listener: StdMutex<Option<(crate::protocols::ListenToken, JoinHandle<()>)>>,
}

/// Manages authenticated transports and named channels to remote devices.
///
/// Cheap to clone; all clones share one registry. Public methods may be
/// called from any task.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl ConnectionManager {
    pub fn new(config: ConnectionManagerConfig) -> anyhow::Result<Self> {
        let local_device = config.identity.device_id();

        let (certs, key) = generate_device_certificate(&config.identity.keypair)?;
        let client_tls = Arc::new(create_client_config(
            certs.clone(),
            key.clone_key(),
            config.cert_store.clone(),
        )?);
        let server_tls = Arc::new(create_server_config(
            certs,
            key,
            config.cert_store.clone(),
        )?);

        let treated_cap =
            NonZeroUsize::new(TREATED_CACHE_SIZE).expect("treated cache size is non-zero");

        Ok(Self {
            inner: Arc::new(ManagerInner {
                config,
                local_device,
                client_tls,
                server_tls,
                registry: StdMutex::new(Registry::default()),
                callbacks: Callbacks::default(),
                addresses: AddressCache::default(),
                treated: StdMutex::new(LruCache::new(treated_cap)),
                listener: StdMutex::new(None),
            }),
        })
    }

    /// The local device fingerprint.
    pub fn local_device(&self) -> DeviceId {
        self.inner.local_device
    }

    /// The configuration this manager was built with.
    pub fn config(&self) -> &ConnectionManagerConfig {
        &self.inner.config
    }

    // ========================================================================
    // Callback registration
    // ========================================================================

    /// Gate inbound offers. Unset means accept.
    pub fn on_ice_request(&self, cb: impl Fn(&DeviceId) -> bool + Send + Sync + 'static) {
        *self.inner.callbacks.ice_request.write().expect("callback lock poisoned") =
            Some(Arc::new(cb));
    }

    /// Gate inbound channel opens. Unset means accept.
    pub fn on_channel_request(
        &self,
        cb: impl Fn(&DeviceCertificate, &str) -> bool + Send + Sync + 'static,
    ) {
        *self.inner.callbacks.channel_request.write().expect("callback lock poisoned") =
            Some(Arc::new(cb));
    }

    /// Observe every accepted inbound channel.
    pub fn on_connection_ready(
        &self,
        cb: impl Fn(DeviceId, &str, ChannelSocket) + Send + Sync + 'static,
    ) {
        *self.inner.callbacks.connection_ready.write().expect("callback lock poisoned") =
            Some(Arc::new(cb));
    }

    /// Classify offers carrying a `conn_type` tag before normal processing.
    /// Returning true marks the offer as handled out-of-band (wake path).
    pub fn on_wake_request(&self, cb: impl Fn(&str, &DeviceId) -> bool + Send + Sync + 'static) {
        *self.inner.callbacks.wake_request.write().expect("callback lock poisoned") =
            Some(Arc::new(cb));
    }

    // ========================================================================
    // DHT listener
    // ========================================================================

    /// Install the rendezvous listener for inbound offers and answers.
    /// Call once the DHT is connected; the key is derived from the local
    /// device public key.
    pub fn on_dht_connected(&self, device_public_key: &[u8; 32]) {
        let device = DeviceId::from_public_key(device_public_key);
        let key = device.dht_key();

        let (tx, mut rx) = mpsc::channel::<DhtValue>(DHT_LISTEN_QUEUE);
        let token = self.inner.config.dht.listen(key, tx);

        let inner = self.inner.clone();
        let task = tokio::spawn(async move {
            while let Some(value) = rx.recv().await {
                handle_dht_value(&inner, value).await;
            }
        });

        let mut listener = self.inner.listener.lock().expect("listener lock poisoned");
        if let Some((old_token, old_task)) = listener.replace((token, task)) {
            self.inner.config.dht.cancel_listen(old_token);
            old_task.abort();
        }
    }

    // ========================================================================
    // Connecting
    // ========================================================================

    /// Open a channel named `name` to `target`, negotiating a transport if
    /// none exists. Resolves exactly once.
    pub async fn connect_device(
        &self,
        target: impl Into<ConnectTarget>,
        name: &str,
    ) -> Result<ChannelSocket, ConnectionError> {
        self.connect_device_with(target, name, ConnectOptions::default())
            .await
    }

    pub async fn connect_device_with(
        &self,
        target: impl Into<ConnectTarget>,
        name: &str,
        opts: ConnectOptions,
    ) -> Result<ChannelSocket, ConnectionError> {
        let inner = &self.inner;
        if inner.registry.lock().expect("registry lock poisoned").shutdown {
            return Err(ConnectionError::Shutdown);
        }

        let cert = match target.into() {
            ConnectTarget::Certificate(cert) => {
                inner.config.cert_store.pin(cert.clone());
                cert
            }
            ConnectTarget::Device(device) => resolve_certificate(inner, device).await?,
        };
        let device = cert.device_id();

        if device == inner.local_device {
            debug!(device = %device, "refusing connection to the local device");
            return Err(ConnectionError::UnknownPeer);
        }

        enum Plan {
            UseSocket(Arc<MultiplexedSocket>),
            Wait(oneshot::Receiver<Result<ChannelSocket, ConnectionError>>),
            Fail(ConnectionError),
        }

        let plan = {
            let mut registry = inner.registry.lock().expect("registry lock poisoned");
            if registry.shutdown {
                Plan::Fail(ConnectionError::Shutdown)
            } else if !opts.force_new_socket {
                if let Some(socket) = registry
                    .ready
                    .get(&device)
                    .and_then(|list| list.iter().find(|s| !s.socket.is_closed()))
                {
                    Plan::UseSocket(socket.socket.clone())
                } else if let Some(pending) = registry.connecting.get_mut(&device) {
                    let (tx, rx) = oneshot::channel();
                    pending.add_waiter(name, tx);
                    Plan::Wait(rx)
                } else if opts.no_new_socket {
                    Plan::Fail(ConnectionError::NoExistingSocket)
                } else {
                    let (tx, rx) = oneshot::channel();
                    let request_id = fresh_request_id();
                    let mut pending =
                        PendingConnection::new(request_id, true, cert.owner().map(str::to_string));
                    pending.add_waiter(name, tx);
                    registry.connecting.insert(device, pending);

                    let task = tokio::spawn(run_outgoing(
                        inner.clone(),
                        device,
                        request_id,
                        false,
                        opts.conn_type.clone(),
                    ));
                    if let Some(pending) = registry.connecting.get_mut(&device) {
                        pending.task = Some(task);
                    }
                    Plan::Wait(rx)
                }
            } else if opts.no_new_socket {
                Plan::Fail(ConnectionError::NoExistingSocket)
            } else {
                // Forced: always negotiate a parallel transport.
                let (tx, rx) = oneshot::channel();
                let request_id = fresh_request_id();
                let mut pending =
                    PendingConnection::new(request_id, true, cert.owner().map(str::to_string));
                pending.add_waiter(name, tx);
                registry.forced.insert((device, request_id), pending);

                let task = tokio::spawn(run_outgoing(
                    inner.clone(),
                    device,
                    request_id,
                    true,
                    opts.conn_type.clone(),
                ));
                if let Some(pending) = registry.forced.get_mut(&(device, request_id)) {
                    pending.task = Some(task);
                }
                Plan::Wait(rx)
            }
        };

        match plan {
            Plan::UseSocket(socket) => {
                debug!(device = %device, name = %name, "reusing ready socket");
                Ok(socket.open_channel(name).await?)
            }
            Plan::Wait(rx) => rx.await.map_err(|_| ConnectionError::Shutdown)?,
            Plan::Fail(error) => Err(error),
        }
    }

    /// Whether a channel open with this name is pending toward `device`,
    /// either queued on a negotiation or awaiting the remote decision on a
    /// ready socket.
    pub fn is_connecting(&self, device: &DeviceId, name: &str) -> bool {
        let registry = self.inner.registry.lock().expect("registry lock poisoned");
        if registry
            .connecting
            .get(device)
            .is_some_and(|p| p.waiters.contains_key(name))
        {
            return true;
        }
        if registry
            .forced
            .iter()
            .any(|((d, _), p)| d == device && p.waiters.contains_key(name))
        {
            return true;
        }
        registry
            .ready
            .get(device)
            .is_some_and(|list| list.iter().any(|s| s.socket.is_open_pending(name)))
    }

    /// Close every socket and cancel every negotiation whose peer maps to
    /// `peer_uri` (a certificate owner URI or a device fingerprint in hex).
    pub async fn close_connections_with(&self, peer_uri: &str) {
        let matches = |device: &DeviceId, owner: Option<&str>| {
            owner == Some(peer_uri) || device.to_hex() == peer_uri
        };

        let (cancelled, sockets) = {
            let mut registry = self.inner.registry.lock().expect("registry lock poisoned");

            let devices: Vec<DeviceId> = registry
                .connecting
                .iter()
                .filter(|(d, p)| matches(d, p.owner.as_deref()))
                .map(|(d, _)| *d)
                .collect();
            let mut cancelled: Vec<PendingConnection> = devices
                .into_iter()
                .filter_map(|d| registry.connecting.remove(&d))
                .collect();

            let forced_keys: Vec<(DeviceId, u64)> = registry
                .forced
                .iter()
                .filter(|((d, _), p)| matches(d, p.owner.as_deref()))
                .map(|(k, _)| *k)
                .collect();
            cancelled.extend(
                forced_keys
                    .into_iter()
                    .filter_map(|k| registry.forced.remove(&k)),
            );

            let socket_devices: Vec<DeviceId> = registry
                .ready
                .iter()
                .filter(|(d, list)| {
                    list.iter().any(|s| {
                        matches(d, s.socket.peer_certificate().owner())
                    })
                })
                .map(|(d, _)| *d)
                .collect();
            let sockets: Vec<Arc<MultiplexedSocket>> = socket_devices
                .into_iter()
                .filter_map(|d| registry.ready.remove(&d))
                .flatten()
                .map(|s| s.socket)
                .collect();

            (cancelled, sockets)
        };

        for pending in cancelled {
            pending.cancel(ConnectionError::Shutdown);
        }
        for socket in sockets {
            info!(peer = %socket.peer(), "closing connections on request");
            socket.stop().await;
        }
    }

    // ========================================================================
    // Liveness
    // ========================================================================

    /// Probe every ready socket with a beacon; sockets that fail to
    /// acknowledge within the beacon timeout are torn down.
    pub async fn connectivity_changed(&self) {
        let sockets: Vec<Arc<MultiplexedSocket>> = {
            let registry = self.inner.registry.lock().expect("registry lock poisoned");
            registry
                .ready
                .values()
                .flatten()
                .map(|s| s.socket.clone())
                .collect()
        };
        let timeout = self.inner.config.socket_tuning.beacon_timeout;

        let probes: Vec<JoinHandle<()>> = sockets
            .into_iter()
            .map(|socket| {
                tokio::spawn(async move {
                    if !socket.send_beacon(timeout).await {
                        warn!(peer = %socket.peer(), "beacon unanswered after connectivity change");
                        socket.stop().await;
                    }
                })
            })
            .collect();
        for probe in probes {
            let _ = probe.await;
        }
    }

    // ========================================================================
    // ICE options and published addresses
    // ========================================================================

    /// Build ICE options from the configuration and the current caches,
    /// without touching the network.
    pub fn get_ice_options_sync(&self) -> IceTransportOptions {
        build_ice_options(&self.inner)
    }

    /// Build ICE options, resolving and caching the TURN server address
    /// first when TURN is enabled.
    pub async fn get_ice_options(&self) -> IceTransportOptions {
        let inner = &self.inner;
        if inner.config.turn_enabled
            && inner.addresses.cached_turn(IpFamily::Any).is_none()
            && !inner.config.turn_server.is_empty()
        {
            match tokio::net::lookup_host(inner.config.turn_server.clone()).await {
                Ok(addrs) => {
                    for addr in addrs {
                        inner.addresses.set_cached_turn(addr);
                    }
                }
                Err(e) => {
                    warn!(server = %inner.config.turn_server, error = %e, "TURN resolution failed");
                }
            }
        }
        build_ice_options(inner)
    }

    /// The address ICE advertises, preferring IPv4 when `family` is
    /// [`IpFamily::Any`].
    pub fn get_published_ip_address(&self, family: IpFamily) -> Option<IpAddr> {
        self.inner.addresses.published_ip(family)
    }

    pub fn set_published_address(&self, addr: IpAddr) {
        self.inner.addresses.set_published_ip(addr);
    }

    /// Probe the local interfaces and store the discovered addresses as
    /// published. Returns what was stored.
    pub async fn store_active_ip_address(&self) -> Vec<IpAddr> {
        let addresses =
            tokio::task::spawn_blocking(crate::config::probe_local_addresses)
                .await
                .unwrap_or_default();
        for addr in &addresses {
            self.inner.addresses.set_published_ip(*addr);
        }
        addresses
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    /// Number of ready sockets across all peers.
    pub fn active_sockets(&self) -> usize {
        let registry = self.inner.registry.lock().expect("registry lock poisoned");
        registry.ready.values().map(Vec::len).sum()
    }

    /// Log the state of every socket and pending negotiation.
    pub fn monitor(&self) {
        let registry = self.inner.registry.lock().expect("registry lock poisoned");
        info!(
            connecting = registry.connecting.len(),
            forced = registry.forced.len(),
            ready = registry.ready.values().map(Vec::len).sum::<usize>(),
            "connection manager state"
        );
        for (device, list) in &registry.ready {
            for entry in list {
                info!(
                    peer = %device,
                    channels = entry.socket.active_channels(),
                    inventory = ?entry.socket.channel_inventory(),
                    closed = entry.socket.is_closed(),
                    "socket"
                );
            }
        }
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// Fail every pending negotiation, close every socket, stop listening.
    pub async fn shutdown(&self) {
        let (cancelled, sockets) = {
            let mut registry = self.inner.registry.lock().expect("registry lock poisoned");
            registry.shutdown = true;
            let mut cancelled: Vec<PendingConnection> =
                registry.connecting.drain().map(|(_, p)| p).collect();
            cancelled.extend(registry.forced.drain().map(|(_, p)| p));
            let sockets: Vec<Arc<MultiplexedSocket>> = registry
                .ready
                .drain()
                .flat_map(|(_, list)| list)
                .map(|s| s.socket)
                .collect();
            (cancelled, sockets)
        };

        if let Some((token, task)) = self
            .inner
            .listener
            .lock()
            .expect("listener lock poisoned")
            .take()
        {
            self.inner.config.dht.cancel_listen(token);
            task.abort();
        }

        for pending in cancelled {
            pending.cancel(ConnectionError::Shutdown);
        }
        for socket in sockets {
            socket.stop().await;
        }
        debug!("connection manager shut down");
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("local_device", &self.inner.local_device)
            .field("active_sockets", &self.active_sockets())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Certificate resolution
// ============================================================================

async fn resolve_certificate(
    inner: &Arc<ManagerInner>,
    device: DeviceId,
) -> Result<DeviceCertificate, ConnectionError> {
    if let Some(cert) = inner.config.cert_store.find(&device) {
        return Ok(cert);
    }

    let lookup = tokio::time::timeout(
        inner.config.timeouts.cert_resolution,
        inner.config.dht.get(device.cert_dht_key()),
    )
    .await;

    let values = match lookup {
        Ok(Ok(values)) => values,
        Ok(Err(e)) => {
            debug!(device = %device, error = %e, "certificate lookup failed");
            return Err(ConnectionError::UnknownPeer);
        }
        Err(_) => {
            debug!(device = %device, "certificate lookup timed out");
            return Err(ConnectionError::UnknownPeer);
        }
    };

    for value in values {
        if let Ok(cert) = DeviceCertificate::from_der(value.payload) {
            if cert.device_id() == device {
                inner.config.cert_store.pin(cert.clone());
                return Ok(cert);
            }
            trace!(device = %device, "discarding certificate with wrong fingerprint");
        }
    }
    Err(ConnectionError::UnknownPeer)
}

// ============================================================================
// Negotiation tasks
// ============================================================================

fn fresh_request_id() -> u64 {
    loop {
        let id: u64 = rand::random();
        if id != 0 {
            return id;
        }
    }
}

fn build_ice_options(inner: &ManagerInner) -> IceTransportOptions {
    let config = &inner.config;
    let mut options = IceTransportOptions::new(inner.local_device, false);

    if config.stun_enabled && !config.stun_server.is_empty() {
        options.stun_servers.push(StunServer {
            uri: config.stun_server.clone(),
        });
    }
    if config.turn_enabled && !config.turn_server.is_empty() {
        // Prefer the cached resolved address over re-resolving in the
        // ICE library.
        let uri = inner
            .addresses
            .cached_turn(IpFamily::Any)
            .map(|a| a.to_string())
            .unwrap_or_else(|| config.turn_server.clone());
        options.turn_servers.push(TurnServer {
            uri,
            username: config.turn_server_user_name.clone(),
            password: config.turn_server_pwd.clone(),
            realm: config.turn_server_realm.clone(),
        });
    }
    if config.upnp_enabled {
        if let Some(upnp) = &config.upnp {
            if upnp.is_ready() {
                options.upnp = Some(upnp.clone());
            }
        }
    }
    options
}

/// Store a value into the pending context, bailing out when the context
/// was cancelled meanwhile.
fn with_pending<R>(
    inner: &ManagerInner,
    device: DeviceId,
    request_id: u64,
    forced: bool,
    f: impl FnOnce(&mut PendingConnection) -> R,
) -> Option<R> {
    let mut registry = inner.registry.lock().expect("registry lock poisoned");
    let pending = if forced {
        registry.forced.get_mut(&(device, request_id))
    } else {
        registry
            .connecting
            .get_mut(&device)
            .filter(|p| p.request_id == request_id)
    };
    pending.map(f)
}

async fn dht_put_with_retry(
    inner: &ManagerInner,
    key: Vec<u8>,
    to: DeviceId,
    value: Vec<u8>,
) -> bool {
    for attempt in 1..=DHT_PUT_ATTEMPTS {
        match inner.config.dht.put(key.clone(), to, value.clone()).await {
            Ok(()) => return true,
            Err(e) => {
                debug!(attempt, error = %e, "DHT put failed");
                if attempt < DHT_PUT_ATTEMPTS {
                    tokio::time::sleep(DHT_PUT_RETRY_DELAY).await;
                }
            }
        }
    }
    false
}

async fn run_outgoing(
    inner: Arc<ManagerInner>,
    device: DeviceId,
    request_id: u64,
    forced: bool,
    conn_type: String,
) {
    let result = negotiate_outgoing(&inner, device, request_id, forced, conn_type).await;
    finish_negotiation(&inner, device, request_id, forced, result).await;
}

async fn negotiate_outgoing(
    inner: &Arc<ManagerInner>,
    device: DeviceId,
    request_id: u64,
    forced: bool,
    conn_type: String,
) -> Result<(Arc<MultiplexedSocket>, u64), ConnectionError> {
    let timeouts = inner.config.timeouts;

    // ICE gathering.
    let mut options = build_ice_options(inner);
    options.initiator = true;
    let ice = Arc::new(
        IceTransport::new(&*inner.config.ice_factory, options)
            .map_err(|_| ConnectionError::IceFailed)?,
    );
    if with_pending(inner, device, request_id, forced, |p| {
        p.ice = Some(ice.clone());
    })
    .is_none()
    {
        return Err(ConnectionError::Shutdown);
    }

    tokio::time::timeout(timeouts.ice, ice.init())
        .await
        .map_err(|_| ConnectionError::NegotiationTimeout)?
        .map_err(|e| {
            debug!(device = %device, error = %e, "candidate gathering failed");
            ConnectionError::IceFailed
        })?;

    let local_sdp = ice.local_sdp().await;
    let ice_msg =
        IceTransport::serialize_sdp(&local_sdp).map_err(|_| ConnectionError::IceFailed)?;

    // Route the answer before publishing the offer so it cannot be missed.
    let (answer_tx, answer_rx) = oneshot::channel();
    if with_pending(inner, device, request_id, forced, |p| {
        p.answer_tx = Some(answer_tx);
    })
    .is_none()
    {
        return Err(ConnectionError::Shutdown);
    }

    let offer = PeerConnectionRequest {
        id: request_id,
        ice_msg,
        is_answer: false,
        conn_type,
    };
    let value = messages::serialize_request(&offer).map_err(|_| ConnectionError::IceFailed)?;
    debug!(device = %device, request = request_id, "publishing connection offer");
    if !dht_put_with_retry(inner, device.dht_key(), device, value).await {
        return Err(ConnectionError::NegotiationTimeout);
    }

    // Signaling: wait for the answer.
    let answer_sdp = tokio::time::timeout(timeouts.signaling, answer_rx)
        .await
        .map_err(|_| ConnectionError::NegotiationTimeout)?
        .map_err(|_| ConnectionError::Shutdown)?;

    // ICE connectivity checks.
    debug!(device = %device, request = request_id, "answer received, starting connectivity checks");
    tokio::time::timeout(timeouts.ice, ice.start_ice(&answer_sdp))
        .await
        .map_err(|_| ConnectionError::NegotiationTimeout)?
        .map_err(|e| {
            debug!(device = %device, error = %e, "connectivity checks failed");
            ConnectionError::IceFailed
        })?;

    // TLS, bound to the expected fingerprint.
    let flow = ice
        .take_component(1)
        .await
        .ok_or(ConnectionError::IceFailed)?;
    let tls = TlsSession::connect(inner.client_tls.clone(), device, flow, timeouts.tls)
        .await
        .map_err(|e| {
            debug!(device = %device, error = %e, "TLS handshake failed");
            ConnectionError::from(&e)
        })?;

    info!(device = %device, request = request_id, "outbound transport ready");
    Ok(install_socket(inner, tls, true))
}

async fn run_incoming(
    inner: Arc<ManagerInner>,
    peer_cert: DeviceCertificate,
    request_id: u64,
    offer_sdp: IceSdp,
) {
    let device = peer_cert.device_id();
    let result = negotiate_incoming(&inner, &peer_cert, request_id, offer_sdp).await;
    finish_negotiation(&inner, device, request_id, false, result).await;
}

async fn negotiate_incoming(
    inner: &Arc<ManagerInner>,
    peer_cert: &DeviceCertificate,
    request_id: u64,
    offer_sdp: IceSdp,
) -> Result<(Arc<MultiplexedSocket>, u64), ConnectionError> {
    let device = peer_cert.device_id();
    let timeouts = inner.config.timeouts;

    let mut options = build_ice_options(inner);
    options.initiator = false;
    let ice = Arc::new(
        IceTransport::new(&*inner.config.ice_factory, options)
            .map_err(|_| ConnectionError::IceFailed)?,
    );
    if with_pending(inner, device, request_id, false, |p| {
        p.ice = Some(ice.clone());
    })
    .is_none()
    {
        return Err(ConnectionError::Shutdown);
    }

    tokio::time::timeout(timeouts.ice, ice.init())
        .await
        .map_err(|_| ConnectionError::NegotiationTimeout)?
        .map_err(|_| ConnectionError::IceFailed)?;

    let local_sdp = ice.local_sdp().await;
    let ice_msg =
        IceTransport::serialize_sdp(&local_sdp).map_err(|_| ConnectionError::IceFailed)?;
    let answer = PeerConnectionRequest {
        id: request_id,
        ice_msg,
        is_answer: true,
        conn_type: String::new(),
    };
    let value = messages::serialize_request(&answer).map_err(|_| ConnectionError::IceFailed)?;
    debug!(device = %device, request = request_id, "publishing connection answer");
    if !dht_put_with_retry(inner, device.dht_key(), device, value).await {
        return Err(ConnectionError::NegotiationTimeout);
    }

    tokio::time::timeout(timeouts.ice, ice.start_ice(&offer_sdp))
        .await
        .map_err(|_| ConnectionError::NegotiationTimeout)?
        .map_err(|_| ConnectionError::IceFailed)?;

    let flow = ice
        .take_component(1)
        .await
        .ok_or(ConnectionError::IceFailed)?;
    let tls = TlsSession::accept(inner.server_tls.clone(), flow, timeouts.tls)
        .await
        .map_err(|e| {
            debug!(device = %device, error = %e, "TLS accept failed");
            ConnectionError::from(&e)
        })?;

    // The authenticated client must be the device that sent the offer.
    tls.expect_peer(device).map_err(|e| {
        warn!(device = %device, error = %e, "peer identity mismatch after TLS");
        ConnectionError::TlsFailed
    })?;

    info!(device = %device, request = request_id, "inbound transport ready");
    Ok(install_socket(inner, tls, false))
}

/// Wrap an authenticated session into a multiplexed socket wired to the
/// manager's callbacks. Returns the socket and its registry token; the
/// caller decides when to publish it in `ready`.
fn install_socket(
    inner: &Arc<ManagerInner>,
    tls: TlsSession,
    initiator: bool,
) -> (Arc<MultiplexedSocket>, u64) {
    let (stream, peer_cert) = tls.into_parts();
    let device = peer_cert.device_id();
    inner.config.cert_store.pin(peer_cert.clone());

    let token = {
        let mut registry = inner.registry.lock().expect("registry lock poisoned");
        registry.next_socket_token += 1;
        registry.next_socket_token
    };

    let request_gate = {
        let inner = inner.clone();
        Arc::new(move |cert: &DeviceCertificate, name: &str| -> bool {
            let cb = inner
                .callbacks
                .channel_request
                .read()
                .expect("callback lock poisoned")
                .clone();
            match cb {
                Some(cb) => cb(cert, name),
                None => true,
            }
        })
    };

    let ready_hook = {
        let inner = inner.clone();
        Arc::new(move |channel: ChannelSocket| {
            let cb = inner
                .callbacks
                .connection_ready
                .read()
                .expect("callback lock poisoned")
                .clone();
            match cb {
                Some(cb) => {
                    let name = channel.name().to_string();
                    cb(channel.peer(), &name, channel);
                }
                // Nobody to hand the channel to: drop it, which closes it.
                None => debug!(peer = %channel.peer(), name = %channel.name(), "no connection-ready callback, dropping channel"),
            }
        })
    };

    let shutdown_hook = {
        let inner = Arc::downgrade(inner);
        Box::new(move || {
            if let Some(inner) = inner.upgrade() {
                let mut registry = inner.registry.lock().expect("registry lock poisoned");
                if let Some(list) = registry.ready.get_mut(&device) {
                    list.retain(|s| s.token != token);
                    if list.is_empty() {
                        registry.ready.remove(&device);
                    }
                }
                debug!(peer = %device, "socket removed from registry");
            }
        })
    };

    let socket = Arc::new(MultiplexedSocket::start(
        Box::new(stream),
        peer_cert,
        initiator,
        SocketHooks {
            on_channel_request: request_gate,
            on_channel_ready: ready_hook,
            on_shutdown: shutdown_hook,
        },
        inner.config.socket_tuning,
    ));

    (socket, token)
}

/// Remove the pending context, publish the socket (on success) and drain
/// queued channel opens.
async fn finish_negotiation(
    inner: &Arc<ManagerInner>,
    device: DeviceId,
    request_id: u64,
    forced: bool,
    result: Result<(Arc<MultiplexedSocket>, u64), ConnectionError>,
) {
    // The registry mutex guard must not be held across an `.await`, so the
    // locked section below only decides what to do; the actual awaiting
    // happens afterwards, once the guard has gone out of scope.
    enum Outcome {
        StopSocket(Option<Arc<MultiplexedSocket>>),
        Ready(Vec<(String, Vec<ConnectWaiter>)>, Arc<MultiplexedSocket>),
        Done,
    }

    let outcome = 'outcome: {
        let mut registry = inner.registry.lock().expect("registry lock poisoned");
        let pending = if forced {
            registry.forced.remove(&(device, request_id))
        } else if registry
            .connecting
            .get(&device)
            .is_some_and(|p| p.request_id == request_id)
        {
            registry.connecting.remove(&device)
        } else {
            None
        };
        let Some(mut pending) = pending else {
            // Cancelled while negotiating; the canceller already resolved
            // the waiters. Close a just-created socket, nobody owns it.
            break 'outcome Outcome::StopSocket(result.ok().map(|(socket, _)| socket));
        };
        let waiters: Vec<(String, Vec<ConnectWaiter>)> = pending.waiters.drain().collect();

        match result {
            Ok((socket, token)) => {
                if registry.shutdown {
                    for (_, list) in waiters {
                        for waiter in list {
                            let _ = waiter.send(Err(ConnectionError::Shutdown));
                        }
                    }
                    Outcome::StopSocket(Some(socket))
                } else {
                    let list = registry.ready.entry(device).or_default();
                    list.push(ReadySocket {
                        token,
                        socket: socket.clone(),
                    });
                    // The socket may have died before we published it, in
                    // which case its shutdown hook already ran and missed
                    // this entry.
                    if socket.is_closed() {
                        list.retain(|s| s.token != token);
                    }
                    Outcome::Ready(waiters, socket)
                }
            }
            Err(error) => {
                debug!(device = %device, request = request_id, %error, "negotiation failed");
                for (_, list) in waiters {
                    for waiter in list {
                        let _ = waiter.send(Err(error));
                    }
                }
                Outcome::Done
            }
        }
    };

    match outcome {
        Outcome::StopSocket(Some(socket)) => socket.stop().await,
        Outcome::StopSocket(None) | Outcome::Done => {}
        Outcome::Ready(waiters, socket) => {
            for (name, list) in waiters {
                let result = socket
                    .open_channel(&name)
                    .await
                    .map_err(ConnectionError::from);
                for waiter in list {
                    let _ = waiter.send(result.clone());
                }
            }
        }
    }
}

// ============================================================================
// Inbound DHT values
// ============================================================================

async fn handle_dht_value(inner: &Arc<ManagerInner>, value: DhtValue) {
    let request = match messages::deserialize_request(&value.payload) {
        Ok(request) => request,
        Err(e) => {
            trace!(error = %e, "undecodable rendezvous value");
            return;
        }
    };
    let peer_cert = value.from;
    let device = peer_cert.device_id();

    // Each (device, id, direction) is processed once; the DHT may
    // re-deliver values arbitrarily.
    {
        let mut treated = inner.treated.lock().expect("treated cache lock poisoned");
        if treated
            .put((device, request.id, request.is_answer), ())
            .is_some()
        {
            trace!(device = %device, request = request.id, "duplicate rendezvous value");
            return;
        }
    }

    if request.is_answer {
        route_answer(inner, device, request);
    } else {
        handle_incoming_offer(inner, peer_cert, request).await;
    }
}

fn route_answer(inner: &Arc<ManagerInner>, device: DeviceId, request: PeerConnectionRequest) {
    let sdp = match IceTransport::parse_ice_candidates(&request.ice_msg) {
        Ok(sdp) => sdp,
        Err(e) => {
            debug!(device = %device, error = %e, "undecodable answer description");
            return;
        }
    };

    let answer_tx = {
        let mut registry = inner.registry.lock().expect("registry lock poisoned");
        registry
            .connecting
            .get_mut(&device)
            .filter(|p| p.request_id == request.id)
            .and_then(|p| p.answer_tx.take())
            .or_else(|| {
                registry
                    .forced
                    .get_mut(&(device, request.id))
                    .and_then(|p| p.answer_tx.take())
            })
    };

    match answer_tx {
        Some(tx) => {
            let _ = tx.send(sdp);
        }
        None => debug!(device = %device, request = request.id, "answer without matching negotiation"),
    }
}

async fn handle_incoming_offer(
    inner: &Arc<ManagerInner>,
    peer_cert: DeviceCertificate,
    request: PeerConnectionRequest,
) {
    let device = peer_cert.device_id();

    // Wake path: the application may handle tagged offers out-of-band.
    if !request.conn_type.is_empty() {
        let cb = inner
            .callbacks
            .wake_request
            .read()
            .expect("callback lock poisoned")
            .clone();
        if let Some(cb) = cb {
            if cb(&request.conn_type, &device) {
                debug!(device = %device, conn_type = %request.conn_type, "offer handled by wake path");
                return;
            }
        }
    }

    // Inbound offer gate. Unset means accept.
    let accept = {
        let cb = inner
            .callbacks
            .ice_request
            .read()
            .expect("callback lock poisoned")
            .clone();
        match cb {
            Some(cb) => cb(&device),
            None => true,
        }
    };
    if !accept {
        debug!(device = %device, "inbound offer declined");
        return;
    }

    let offer_sdp = match IceTransport::parse_ice_candidates(&request.ice_msg) {
        Ok(sdp) => sdp,
        Err(e) => {
            debug!(device = %device, error = %e, "undecodable offer description");
            return;
        }
    };

    // Simultaneous open: the lower fingerprint keeps its own offer. A
    // pending inbound context for the same device means the peer retried
    // with a fresh request; serve the newest offer. One critical section,
    // so no connect call can slip a context in between.
    {
        let mut registry = inner.registry.lock().expect("registry lock poisoned");
        if registry.shutdown {
            return;
        }
        let inherited = match registry.connecting.get(&device) {
            Some(pending) if pending.outbound && inner.local_device < device => {
                debug!(device = %device, "simultaneous open, local offer wins");
                return;
            }
            Some(pending) => {
                if pending.outbound {
                    debug!(device = %device, "simultaneous open, inbound offer wins");
                } else {
                    debug!(device = %device, "superseding pending inbound negotiation");
                }
                registry.connecting.remove(&device)
            }
            None => None,
        };

        // Register the responder context, inheriting queued opens from a
        // discarded context so every caller still gets resolved.
        let mut pending =
            PendingConnection::new(request.id, false, peer_cert.owner().map(str::to_string));
        if let Some(mut local) = inherited {
            if let Some(task) = local.task.take() {
                task.abort();
            }
            if let Some(ice) = local.ice.take() {
                ice.cancel_operations();
            }
            for (name, list) in local.waiters.drain() {
                pending.waiters.entry(name).or_default().extend(list);
            }
        }

        registry.connecting.insert(device, pending);
        let task = tokio::spawn(run_incoming(
            inner.clone(),
            peer_cert,
            request.id,
            offer_sdp,
        ));
        if let Some(pending) = registry.connecting.get_mut(&device) {
            pending.task = Some(task);
        }
    }
}
