//! Shared fakes for the integration suites: an in-memory DHT, an
//! accept-all certificate store, and a loopback ICE factory whose
//! sessions rendezvous through their ufrag pair.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::task::{Context, Poll};

use anyhow::Result;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::sync::mpsc;

use dhtlink::{
    CertificateStore, ConnectionManager, ConnectionManagerConfig, DeviceCertificate, DeviceId,
    DeviceIdentity, DeviceKeypair, DhtRunner, DhtValue, IceAttributes, IceFactory, IceSdp,
    IceSession, IceStream, IceTransportOptions, ListenToken, NegotiationTimeouts, SocketTuning,
};

/// One-time tracing initialization.
/// Use RUST_LOG=debug or RUST_LOG=trace for verbose output.
static INIT: Once = Once::new();

pub fn init_tracing() {
    INIT.call_once(|| {
        let filter = if std::env::var("RUST_LOG").is_ok() {
            tracing_subscriber::EnvFilter::from_default_env()
        } else {
            tracing_subscriber::EnvFilter::new("info")
        };

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init()
            .ok();
    });
}

// ============================================================================
// In-memory DHT
// ============================================================================

#[derive(Default)]
struct DhtState {
    storage: HashMap<Vec<u8>, Vec<(DeviceCertificate, Vec<u8>)>>,
    listeners: HashMap<Vec<u8>, Vec<(u64, mpsc::Sender<DhtValue>)>>,
    next_token: u64,
}

/// The shared rendezvous medium of a test cluster.
#[derive(Default)]
pub struct DhtNetwork {
    state: Mutex<DhtState>,
}

impl DhtNetwork {
    /// Store a value and deliver it to live listeners of `key`.
    pub fn publish(&self, from: DeviceCertificate, key: Vec<u8>, payload: Vec<u8>) {
        let listeners: Vec<mpsc::Sender<DhtValue>> = {
            let mut state = self.state.lock().expect("dht state lock");
            state
                .storage
                .entry(key.clone())
                .or_default()
                .push((from.clone(), payload.clone()));
            state
                .listeners
                .get(&key)
                .map(|l| l.iter().map(|(_, tx)| tx.clone()).collect())
                .unwrap_or_default()
        };
        for tx in listeners {
            let _ = tx.try_send(DhtValue {
                from: from.clone(),
                payload: payload.clone(),
            });
        }
    }
}

/// One node's view of the shared [`DhtNetwork`]. Values put through it are
/// attributed to the node's certificate, as the real DHT layer would after
/// decrypting and authenticating.
pub struct MemoryDht {
    network: Arc<DhtNetwork>,
    local_cert: DeviceCertificate,
}

impl MemoryDht {
    pub fn new(network: Arc<DhtNetwork>, local_cert: DeviceCertificate) -> Self {
        Self {
            network,
            local_cert,
        }
    }
}

#[async_trait]
impl DhtRunner for MemoryDht {
    async fn put(&self, key: Vec<u8>, _to: DeviceId, value: Vec<u8>) -> Result<()> {
        self.network.publish(self.local_cert.clone(), key, value);
        Ok(())
    }

    fn listen(&self, key: Vec<u8>, tx: mpsc::Sender<DhtValue>) -> ListenToken {
        let mut state = self.network.state.lock().expect("dht state lock");
        state.next_token += 1;
        let token = state.next_token;

        // Replay already-stored values, as a real DHT listen would.
        if let Some(values) = state.storage.get(&key) {
            for (from, payload) in values {
                let _ = tx.try_send(DhtValue {
                    from: from.clone(),
                    payload: payload.clone(),
                });
            }
        }
        state.listeners.entry(key).or_default().push((token, tx));
        token
    }

    fn cancel_listen(&self, token: ListenToken) {
        let mut state = self.network.state.lock().expect("dht state lock");
        for listeners in state.listeners.values_mut() {
            listeners.retain(|(t, _)| *t != token);
        }
    }

    async fn get(&self, key: Vec<u8>) -> Result<Vec<DhtValue>> {
        let state = self.network.state.lock().expect("dht state lock");
        Ok(state
            .storage
            .get(&key)
            .map(|values| {
                values
                    .iter()
                    .map(|(from, payload)| DhtValue {
                        from: from.clone(),
                        payload: payload.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }
}

// ============================================================================
// Certificate store
// ============================================================================

/// Store trusting any non-empty chain; lookups hit only pinned entries.
#[derive(Debug, Default)]
pub struct MemoryCertStore {
    certs: Mutex<HashMap<DeviceId, DeviceCertificate>>,
}

impl CertificateStore for MemoryCertStore {
    fn find(&self, device: &DeviceId) -> Option<DeviceCertificate> {
        self.certs.lock().expect("cert store lock").get(device).cloned()
    }

    fn pin(&self, cert: DeviceCertificate) {
        self.certs
            .lock()
            .expect("cert store lock")
            .insert(cert.device_id(), cert);
    }

    fn verify(&self, chain: &[DeviceCertificate]) -> bool {
        !chain.is_empty()
    }
}

// ============================================================================
// Loopback ICE
// ============================================================================

/// Pairs the two halves of a negotiation by their (sorted) ufrag pair.
#[derive(Default)]
pub struct IceNetwork {
    pending: Mutex<HashMap<String, DuplexStream>>,
}

/// Factory producing loopback sessions. `freeze_handle` returns a switch
/// that suspends all I/O of sessions created by this factory, simulating
/// a peer whose network froze.
pub struct LoopbackIceFactory {
    network: Arc<IceNetwork>,
    frozen: Arc<AtomicBool>,
}

impl LoopbackIceFactory {
    pub fn new(network: Arc<IceNetwork>) -> Self {
        Self {
            network,
            frozen: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn freeze_handle(&self) -> Arc<AtomicBool> {
        self.frozen.clone()
    }
}

impl IceFactory for LoopbackIceFactory {
    fn create(&self, _options: IceTransportOptions) -> Result<Box<dyn IceSession>> {
        let suffix: u64 = rand::random();
        Ok(Box::new(LoopbackSession {
            network: self.network.clone(),
            frozen: self.frozen.clone(),
            ufrag: format!("{suffix:016x}"),
            pwd: format!("{:016x}", rand::random::<u64>()),
            component: None,
        }))
    }
}

fn pair_key(a: &str, b: &str) -> String {
    if a < b {
        format!("{a}:{b}")
    } else {
        format!("{b}:{a}")
    }
}

struct LoopbackSession {
    network: Arc<IceNetwork>,
    frozen: Arc<AtomicBool>,
    ufrag: String,
    pwd: String,
    component: Option<DuplexStream>,
}

#[async_trait]
impl IceSession for LoopbackSession {
    async fn gather(&mut self) -> Result<()> {
        Ok(())
    }

    fn attributes(&self) -> IceAttributes {
        IceAttributes {
            ufrag: self.ufrag.clone(),
            pwd: self.pwd.clone(),
        }
    }

    fn candidates(&self, component: u8) -> Vec<String> {
        if component == 1 {
            vec![format!(
                "candidate:1 1 TCP 2105458943 127.0.0.1 9 typ host ufrag {}",
                self.ufrag
            )]
        } else {
            Vec::new()
        }
    }

    async fn negotiate(&mut self, remote: &IceSdp) -> Result<()> {
        let key = pair_key(&self.ufrag, &remote.ufrag);
        let mut pending = self.network.pending.lock().expect("ice network lock");
        match pending.remove(&key) {
            Some(half) => self.component = Some(half),
            None => {
                let (a, b) = tokio::io::duplex(256 * 1024);
                pending.insert(key, b);
                self.component = Some(a);
            }
        }
        Ok(())
    }

    fn take_component(&mut self, component: u8) -> Option<Box<dyn IceStream>> {
        if component != 1 {
            return None;
        }
        self.component.take().map(|stream| {
            Box::new(FreezableStream {
                inner: stream,
                frozen: self.frozen.clone(),
            }) as Box<dyn IceStream>
        })
    }
}

/// A duplex stream that stops making progress while its switch is on.
struct FreezableStream {
    inner: DuplexStream,
    frozen: Arc<AtomicBool>,
}

impl AsyncRead for FreezableStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if self.frozen.load(Ordering::SeqCst) {
            return Poll::Pending;
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for FreezableStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        if self.frozen.load(Ordering::SeqCst) {
            return Poll::Pending;
        }
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        if self.frozen.load(Ordering::SeqCst) {
            return Poll::Pending;
        }
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

// ============================================================================
// Test cluster plumbing
// ============================================================================

/// Shared media of one test cluster.
#[derive(Default)]
pub struct TestEnv {
    pub dht: Arc<DhtNetwork>,
    pub ice: Arc<IceNetwork>,
}

pub struct TestNode {
    pub manager: ConnectionManager,
    pub device: DeviceId,
    pub cert: DeviceCertificate,
    pub freeze: Arc<AtomicBool>,
}

/// Deadlines short enough to keep failure-path tests fast.
pub fn fast_timeouts() -> NegotiationTimeouts {
    NegotiationTimeouts {
        cert_resolution: std::time::Duration::from_secs(2),
        signaling: std::time::Duration::from_secs(2),
        ice: std::time::Duration::from_secs(2),
        tls: std::time::Duration::from_secs(2),
    }
}

/// Boot a node on the shared media: fresh identity, certificate published
/// in the DHT, rendezvous listener installed.
pub fn spawn_node(env: &TestEnv, timeouts: NegotiationTimeouts, tuning: SocketTuning) -> TestNode {
    let keypair = DeviceKeypair::generate();
    let identity = DeviceIdentity::from_keypair(keypair.clone()).expect("identity");
    let cert = identity.certificate.clone();
    let device = identity.device_id();

    env.dht
        .publish(cert.clone(), device.cert_dht_key(), cert.der().to_vec());

    let ice_factory = LoopbackIceFactory::new(env.ice.clone());
    let freeze = ice_factory.freeze_handle();

    let mut config = ConnectionManagerConfig::new(
        Arc::new(MemoryDht::new(env.dht.clone(), cert.clone())),
        identity,
        Arc::new(MemoryCertStore::default()),
        Arc::new(ice_factory),
    );
    config.timeouts = timeouts;
    config.socket_tuning = tuning;

    let manager = ConnectionManager::new(config).expect("manager");
    manager.on_dht_connected(&keypair.public_key_bytes());

    TestNode {
        manager,
        device,
        cert,
        freeze,
    }
}
