//! # ICE Transport
//!
//! Wrapper around the NAT-traversal library that gathers candidates, runs
//! connectivity checks against a remote description and hands out the
//! per-component byte flows of the nominated pair.
//!
//! The library itself is a black box behind [`IceSession`] / [`IceFactory`]:
//! the wrapper contributes the locked state machine, bounded waits, SDP
//! (de)serialization and the one-shot shutdown callback that the connection
//! manager relies on.
//!
//! ## State Machine
//!
//! ```text
//! Created ──init()──► Initialized ──start_ice()──► Running
//!    │                     │                          │
//!    └──────────► Failed ◄─┴────────── (negotiation / cancel / error)
//! ```
//!
//! Component flows are ordered reliable byte streams; the library is
//! expected to nominate candidate pairs that provide this (TCP or relayed
//! candidates), which lets the session layer run plain TLS on top.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{watch, Mutex};
use tracing::{debug, trace, warn};

use crate::identity::DeviceId;
use crate::messages::{self, IceSdp};
use crate::protocols::UpnpController;

/// Default number of ICE streams.
pub const DEFAULT_STREAMS_COUNT: usize = 1;

/// Default number of components per stream. All session traffic flows on
/// component 1.
pub const DEFAULT_COMPONENTS_PER_STREAM: usize = 1;

#[derive(Clone, Debug)]
pub struct StunServer {
    pub uri: String,
}

#[derive(Clone, Debug)]
pub struct TurnServer {
    pub uri: String,
    pub username: String,
    pub password: String,
    pub realm: String,
}

/// Options handed to the ICE library when creating a session.
#[derive(Clone)]
pub struct IceTransportOptions {
    /// Local device, used by the library for logging and TURN allocation tags.
    pub local_device: DeviceId,
    /// Whether this side drives the nomination (the offerer).
    pub initiator: bool,
    pub streams_count: usize,
    pub components_per_stream: usize,
    pub tcp_enabled: bool,
    /// Accept any remote candidate without address filtering.
    pub accept_any_candidate: bool,
    pub stun_servers: Vec<StunServer>,
    pub turn_servers: Vec<TurnServer>,
    pub upnp: Option<Arc<dyn UpnpController>>,
}

impl IceTransportOptions {
    pub fn new(local_device: DeviceId, initiator: bool) -> Self {
        Self {
            local_device,
            initiator,
            streams_count: DEFAULT_STREAMS_COUNT,
            components_per_stream: DEFAULT_COMPONENTS_PER_STREAM,
            tcp_enabled: true,
            accept_any_candidate: false,
            stun_servers: Vec::new(),
            turn_servers: Vec::new(),
            upnp: None,
        }
    }
}

impl std::fmt::Debug for IceTransportOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IceTransportOptions")
            .field("local_device", &self.local_device)
            .field("initiator", &self.initiator)
            .field("streams_count", &self.streams_count)
            .field("components_per_stream", &self.components_per_stream)
            .field("tcp_enabled", &self.tcp_enabled)
            .field("stun_servers", &self.stun_servers)
            .field("turn_servers", &self.turn_servers.len())
            .finish_non_exhaustive()
    }
}

/// Local session attributes advertised in the SDP.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IceAttributes {
    pub ufrag: String,
    pub pwd: String,
}

/// Ordered reliable byte flow of one negotiated component.
pub trait IceStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> IceStream for T {}

/// One ICE session as exposed by the underlying library.
///
/// Sessions are single-use: gather, negotiate, then surrender component
/// flows. Dropping the session releases all library resources.
#[async_trait]
pub trait IceSession: Send + 'static {
    /// Gather local candidates. Returns once gathering has completed.
    async fn gather(&mut self) -> Result<()>;

    /// Local attributes, valid after gathering.
    fn attributes(&self) -> IceAttributes;

    /// Local candidate lines for a component (1-based), valid after
    /// gathering.
    fn candidates(&self, component: u8) -> Vec<String>;

    /// Run connectivity checks against the remote description. Returns
    /// once every component has a nominated pair.
    async fn negotiate(&mut self, remote: &IceSdp) -> Result<()>;

    /// Take the byte flow of a negotiated component (1-based). Each
    /// component can be taken once.
    fn take_component(&mut self, component: u8) -> Option<Box<dyn IceStream>>;
}

/// Creates ICE sessions. Implemented by the embedding layer over the
/// actual NAT-traversal library.
pub trait IceFactory: Send + Sync + 'static {
    fn create(&self, options: IceTransportOptions) -> Result<Box<dyn IceSession>>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum IceState {
    Created,
    Initialized,
    Started,
    Running,
    Failed,
}

type ShutdownCallback = Box<dyn FnOnce() + Send>;

/// Handle to one ICE session with a locked state machine and bounded waits.
pub struct IceTransport {
    session: Mutex<Box<dyn IceSession>>,
    /// Negotiated component flows, pulled out of the session once running.
    components: Mutex<std::collections::HashMap<u8, Box<dyn IceStream>>>,
    state_tx: watch::Sender<IceState>,
    state_rx: watch::Receiver<IceState>,
    cancelled: AtomicBool,
    initiator: bool,
    on_shutdown: StdMutex<Option<ShutdownCallback>>,
    shutdown_fired: AtomicBool,
}

impl IceTransport {
    /// Create a session from the factory. The session holds no network
    /// resources until [`IceTransport::init`] runs.
    pub fn new(factory: &dyn IceFactory, options: IceTransportOptions) -> Result<Self> {
        let initiator = options.initiator;
        let session = factory.create(options).context("ICE session creation failed")?;
        let (state_tx, state_rx) = watch::channel(IceState::Created);
        Ok(Self {
            session: Mutex::new(session),
            components: Mutex::new(std::collections::HashMap::new()),
            state_tx,
            state_rx,
            cancelled: AtomicBool::new(false),
            initiator,
            on_shutdown: StdMutex::new(None),
            shutdown_fired: AtomicBool::new(false),
        })
    }

    pub fn is_initiator(&self) -> bool {
        self.initiator
    }

    /// Register the shutdown callback. Fires exactly once, on failure,
    /// cancellation or drop.
    pub fn on_shutdown(&self, cb: impl FnOnce() + Send + 'static) {
        *self.on_shutdown.lock().expect("shutdown callback lock poisoned") = Some(Box::new(cb));
    }

    fn fire_shutdown(&self) {
        if self.shutdown_fired.swap(true, Ordering::SeqCst) {
            return;
        }
        trace!(initiator = self.initiator, "ICE session shut down");
        let cb = self
            .on_shutdown
            .lock()
            .expect("shutdown callback lock poisoned")
            .take();
        if let Some(cb) = cb {
            cb();
        }
    }

    fn set_state(&self, state: IceState) {
        let old = self.state_tx.send_replace(state);
        if old != state {
            trace!(from = ?old, to = ?state, "ICE state change");
        }
        if state == IceState::Failed {
            self.fire_shutdown();
        }
    }

    fn state(&self) -> IceState {
        *self.state_rx.borrow()
    }

    pub fn is_initialized(&self) -> bool {
        self.state() >= IceState::Initialized && self.state() != IceState::Failed
    }

    pub fn is_started(&self) -> bool {
        self.state() >= IceState::Started && self.state() != IceState::Failed
    }

    pub fn is_running(&self) -> bool {
        self.state() == IceState::Running
    }

    pub fn is_failed(&self) -> bool {
        self.state() == IceState::Failed
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancelled.load(Ordering::SeqCst) {
            anyhow::bail!("ICE operations cancelled");
        }
        Ok(())
    }

    /// Gather local candidates.
    pub async fn init(&self) -> Result<()> {
        self.check_cancelled()?;
        let mut session = self.session.lock().await;
        self.check_cancelled()?;
        debug!(initiator = self.initiator, "gathering ICE candidates");
        match session.gather().await {
            Ok(()) => {
                debug!(
                    candidates = session.candidates(1).len(),
                    "candidate gathering complete"
                );
                self.set_state(IceState::Initialized);
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "candidate gathering failed");
                self.set_state(IceState::Failed);
                Err(e.context("ICE candidate gathering failed"))
            }
        }
    }

    /// Run connectivity checks against the remote description.
    pub async fn start_ice(&self, remote: &IceSdp) -> Result<()> {
        self.check_cancelled()?;
        let mut session = self.session.lock().await;
        self.check_cancelled()?;
        debug!(
            remote_candidates = remote.candidates.len(),
            "starting ICE connectivity checks"
        );
        self.set_state(IceState::Started);
        match session.negotiate(remote).await {
            Ok(()) => {
                if self.cancelled.load(Ordering::SeqCst) {
                    self.set_state(IceState::Failed);
                    anyhow::bail!("ICE operations cancelled");
                }
                // Pull every nominated component flow out of the session
                // while we still hold it exclusively.
                let mut components = self.components.lock().await;
                for component in 1..=u8::MAX {
                    match session.take_component(component) {
                        Some(stream) => {
                            components.insert(component, stream);
                        }
                        None => break,
                    }
                }
                debug!(components = components.len(), "ICE negotiation complete");
                drop(components);
                self.set_state(IceState::Running);
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "ICE connectivity checks failed");
                self.set_state(IceState::Failed);
                Err(e.context("ICE negotiation failed"))
            }
        }
    }

    /// Wait until candidate gathering has finished.
    pub async fn wait_for_initialization(&self, timeout: Duration) -> Result<()> {
        self.wait_for(timeout, IceState::Initialized).await
    }

    /// Wait until negotiation has nominated a pair for every component.
    pub async fn wait_for_negotiation(&self, timeout: Duration) -> Result<()> {
        self.wait_for(timeout, IceState::Running).await
    }

    async fn wait_for(&self, timeout: Duration, target: IceState) -> Result<()> {
        let mut rx = self.state_rx.clone();
        let reached = tokio::time::timeout(timeout, rx.wait_for(|s| *s >= target))
            .await
            .context("timed out waiting for ICE state")?
            .context("ICE transport dropped")?;
        if *reached == IceState::Failed {
            anyhow::bail!("ICE transport failed");
        }
        Ok(())
    }

    pub async fn local_attributes(&self) -> IceAttributes {
        self.session.lock().await.attributes()
    }

    pub async fn local_candidates(&self, component: u8) -> Vec<String> {
        self.session.lock().await.candidates(component)
    }

    /// Full local description, valid after initialization.
    pub async fn local_sdp(&self) -> IceSdp {
        let session = self.session.lock().await;
        let attrs = session.attributes();
        let mut candidates = Vec::new();
        for component in 1..=u8::MAX {
            let lines = session.candidates(component);
            if lines.is_empty() {
                break;
            }
            candidates.extend(lines);
        }
        IceSdp {
            ufrag: attrs.ufrag,
            pwd: attrs.pwd,
            candidates,
        }
    }

    /// Serialize a description for transport inside `ice_msg`.
    pub fn serialize_sdp(sdp: &IceSdp) -> Result<Vec<u8>> {
        messages::serialize(sdp).context("failed to serialize ICE description")
    }

    /// Parse an `ice_msg` blob back into a description.
    pub fn parse_ice_candidates(blob: &[u8]) -> Result<IceSdp> {
        messages::deserialize_bounded(blob).context("failed to parse ICE description")
    }

    /// Take ownership of a negotiated component flow (1-based). The session
    /// layer takes component 1 for the TLS handshake.
    pub async fn take_component(&self, component: u8) -> Option<Box<dyn IceStream>> {
        if !self.is_running() {
            return None;
        }
        self.components.lock().await.remove(&component)
    }

    /// Send on a negotiated component that has not been taken.
    pub async fn send(&self, component: u8, data: &[u8]) -> Result<()> {
        let mut components = self.components.lock().await;
        let stream = components
            .get_mut(&component)
            .context("component not available")?;
        stream.write_all(data).await.context("ICE send failed")?;
        stream.flush().await.context("ICE send flush failed")?;
        Ok(())
    }

    /// Receive from a negotiated component that has not been taken.
    /// Returns the number of bytes read; 0 means the flow closed.
    pub async fn recv(&self, component: u8, buf: &mut [u8]) -> Result<usize> {
        let mut components = self.components.lock().await;
        let stream = components
            .get_mut(&component)
            .context("component not available")?;
        stream.read(buf).await.context("ICE recv failed")
    }

    /// Abort in-flight operations. Idempotent; later operations fail.
    pub fn cancel_operations(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(state = ?self.state(), "cancelling ICE operations");
        if self.state() != IceState::Running {
            self.set_state(IceState::Failed);
        }
    }
}

impl Drop for IceTransport {
    fn drop(&mut self) {
        self.fire_shutdown();
    }
}

impl std::fmt::Debug for IceTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IceTransport")
            .field("state", &self.state())
            .field("initiator", &self.initiator)
            .finish_non_exhaustive()
    }
}
