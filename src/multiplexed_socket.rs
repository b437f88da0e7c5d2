//! # Multiplexed Socket
//!
//! Shares one authenticated transport among many logical channels. Frames
//! are `varint(channel) | varint(len) | payload`; channel 0 carries control
//! messages (open/accept/reject/close and the liveness beacon), every other
//! channel carries application bytes for one [`ChannelSocket`].
//!
//! ## Tasks
//!
//! - A single **reader task** demultiplexes inbound frames. Control frames
//!   drive channel lifecycle; data frames land in per-channel buffers with
//!   watermark backpressure. Any decode or I/O error tears the whole
//!   socket down.
//! - A **maintenance task** emits periodic beacons and processes deferred
//!   channel cleanup from dropped handles.
//!
//! ## Channel Id Allocation
//!
//! The side that initiated the transport allocates odd ids, the responder
//! allocates even ids; id 0 is reserved. The two id spaces cannot collide,
//! so both sides may open channels concurrently without coordination.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::{Duration, Instant};

use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, trace, warn};

use crate::channel::{ChannelInner, ChannelSocket, DEFAULT_HIGH_WATER, DEFAULT_LOW_WATER};
use crate::ice::IceStream;
use crate::identity::{DeviceCertificate, DeviceId};
use crate::messages::{
    self, read_frame, ControlMessage, CONTROL_CHANNEL, MAX_CHANNEL_NAME, MAX_FRAME_PAYLOAD,
};

/// Default wait for the remote decision on a channel open.
pub const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(10);

/// Default period between liveness beacons.
pub const DEFAULT_BEACON_INTERVAL: Duration = Duration::from_secs(30);

/// Default wait for a beacon acknowledgement before declaring the peer dead.
pub const DEFAULT_BEACON_TIMEOUT: Duration = Duration::from_secs(10);

/// Timing and buffering knobs of one multiplexed socket.
#[derive(Clone, Copy, Debug)]
pub struct SocketTuning {
    pub open_timeout: Duration,
    pub beacon_interval: Duration,
    pub beacon_timeout: Duration,
    pub high_water: usize,
    pub low_water: usize,
}

impl Default for SocketTuning {
    fn default() -> Self {
        Self {
            open_timeout: DEFAULT_OPEN_TIMEOUT,
            beacon_interval: DEFAULT_BEACON_INTERVAL,
            beacon_timeout: DEFAULT_BEACON_TIMEOUT,
            high_water: DEFAULT_HIGH_WATER,
            low_water: DEFAULT_LOW_WATER,
        }
    }
}

/// Failure modes of [`MultiplexedSocket::open_channel`].
#[derive(Debug)]
pub enum ChannelOpenError {
    /// The peer rejected the open request.
    Declined(String),
    /// No decision arrived within the open timeout.
    Timeout,
    /// The transport died before a decision arrived.
    TransportClosed,
    /// The channel id space is exhausted.
    IdSpaceExhausted,
    /// The requested name is not acceptable.
    InvalidName,
}

impl std::fmt::Display for ChannelOpenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelOpenError::Declined(reason) => write!(f, "channel declined: {reason}"),
            ChannelOpenError::Timeout => write!(f, "channel open timed out"),
            ChannelOpenError::TransportClosed => write!(f, "transport closed"),
            ChannelOpenError::IdSpaceExhausted => write!(f, "channel id space exhausted"),
            ChannelOpenError::InvalidName => write!(f, "invalid channel name"),
        }
    }
}

impl std::error::Error for ChannelOpenError {}

/// Hooks a socket owner installs at construction. Invoked from the reader
/// task with no internal lock held.
pub struct SocketHooks {
    /// Gate for inbound channel opens: `(peer certificate, name) -> accept`.
    pub on_channel_request: Arc<dyn Fn(&DeviceCertificate, &str) -> bool + Send + Sync>,
    /// Invoked for every accepted inbound channel, after the accept frame
    /// was sent.
    pub on_channel_ready: Arc<dyn Fn(ChannelSocket) + Send + Sync>,
    /// Invoked exactly once when the socket dies, whatever the cause.
    pub on_shutdown: Box<dyn FnOnce() + Send>,
}

impl Default for SocketHooks {
    fn default() -> Self {
        Self {
            on_channel_request: Arc::new(|_, _| true),
            on_channel_ready: Arc::new(|_| {}),
            on_shutdown: Box::new(|| {}),
        }
    }
}

struct ChannelEntry {
    name: String,
    inner: Weak<ChannelInner>,
}

struct PendingOpen {
    name: String,
    reply: oneshot::Sender<Result<ChannelSocket, ChannelOpenError>>,
}

struct ChannelTable {
    channels: HashMap<u16, ChannelEntry>,
    pending_opens: HashMap<u16, PendingOpen>,
    next_id: u16,
}

pub(crate) struct SocketCore {
    peer: DeviceCertificate,
    peer_device: DeviceId,
    initiator: bool,
    tuning: SocketTuning,
    writer: Mutex<WriteHalf<Box<dyn IceStream>>>,
    table: StdMutex<ChannelTable>,
    closed: AtomicBool,
    /// Wakes long-running tasks on teardown.
    closed_tx: tokio::sync::watch::Sender<bool>,
    /// Channel ids whose last application handle was dropped unclosed.
    dropped_tx: mpsc::UnboundedSender<u16>,
    beacon_waiters: StdMutex<Vec<oneshot::Sender<()>>>,
    last_beacon_ack: StdMutex<Option<Instant>>,
    on_shutdown: StdMutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl SocketCore {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Send application bytes on a channel, splitting into frames. Holding
    /// the write lock for the whole call keeps one write's frames
    /// contiguous and in call order.
    pub(crate) async fn send_data(&self, id: u16, data: &[u8]) -> io::Result<()> {
        if self.is_closed() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "socket closed"));
        }
        let mut writer = self.writer.lock().await;
        for chunk in data.chunks(MAX_FRAME_PAYLOAD) {
            messages::write_frame(&mut *writer, id, chunk).await?;
        }
        Ok(())
    }

    async fn send_control(&self, msg: &ControlMessage) -> io::Result<()> {
        let payload = messages::serialize(msg)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let mut writer = self.writer.lock().await;
        messages::write_frame(&mut *writer, CONTROL_CHANNEL, &payload).await
    }

    /// Close one channel: notify the peer, drop the table entry, wake the
    /// channel's readers.
    pub(crate) async fn close_channel(&self, id: u16) {
        let inner = {
            let mut table = self.table.lock().expect("channel table lock poisoned");
            table.channels.remove(&id).and_then(|e| e.inner.upgrade())
        };
        if let Some(inner) = inner {
            inner.shutdown();
        }
        if !self.is_closed() {
            if let Err(e) = self.send_control(&ControlMessage::ChannelClose { id }).await {
                debug!(channel = id, error = %e, "failed to send channel close");
            }
        }
    }

    /// Deferred cleanup entry point for [`ChannelInner`]'s drop.
    pub(crate) fn channel_dropped(&self, id: u16) {
        let _ = self.dropped_tx.send(id);
    }

    fn allocate_channel_id(&self) -> Result<u16, ChannelOpenError> {
        let mut table = self.table.lock().expect("channel table lock poisoned");
        let start = table.next_id;
        loop {
            let id = table.next_id;
            // Odd/even split per side; wrap within the parity class.
            let next = table.next_id.wrapping_add(2);
            table.next_id = if next < 2 {
                if self.initiator {
                    1
                } else {
                    2
                }
            } else {
                next
            };
            if !table.channels.contains_key(&id) && !table.pending_opens.contains_key(&id) {
                return Ok(id);
            }
            if table.next_id == start {
                return Err(ChannelOpenError::IdSpaceExhausted);
            }
        }
    }

    fn make_channel(self: &Arc<Self>, id: u16, name: &str) -> ChannelSocket {
        let channel = ChannelSocket::new(
            id,
            name.to_string(),
            self.peer_device,
            Arc::downgrade(self),
            self.tuning.high_water,
            self.tuning.low_water,
        );
        self.table
            .lock()
            .expect("channel table lock poisoned")
            .channels
            .insert(
                id,
                ChannelEntry {
                    name: name.to_string(),
                    inner: channel.downgrade(),
                },
            );
        channel
    }

    /// Tear the whole socket down: close every channel, fail every pending
    /// open, fire the shutdown hook. Idempotent.
    async fn teardown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.closed_tx.send(true);

        let (channels, pending) = {
            let mut table = self.table.lock().expect("channel table lock poisoned");
            let channels: Vec<_> = table.channels.drain().collect();
            let pending: Vec<_> = table.pending_opens.drain().collect();
            (channels, pending)
        };
        for (_, entry) in channels {
            if let Some(inner) = entry.inner.upgrade() {
                inner.shutdown();
            }
        }
        for (_, open) in pending {
            let _ = open.reply.send(Err(ChannelOpenError::TransportClosed));
        }

        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
        drop(writer);

        let hook = self
            .on_shutdown
            .lock()
            .expect("shutdown hook lock poisoned")
            .take();
        if let Some(hook) = hook {
            hook();
        }
    }
}

/// One authenticated, framed, multiplexed transport to a peer device.
pub struct MultiplexedSocket {
    core: Arc<SocketCore>,
}

impl MultiplexedSocket {
    /// Wrap an authenticated stream. `initiator` selects the odd id space
    /// when true. Spawns the reader and maintenance tasks.
    pub fn start(
        stream: Box<dyn IceStream>,
        peer: DeviceCertificate,
        initiator: bool,
        hooks: SocketHooks,
        tuning: SocketTuning,
    ) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        let (closed_tx, closed_rx) = tokio::sync::watch::channel(false);
        let (dropped_tx, dropped_rx) = mpsc::unbounded_channel();

        let core = Arc::new(SocketCore {
            peer_device: peer.device_id(),
            peer,
            initiator,
            tuning,
            writer: Mutex::new(write_half),
            table: StdMutex::new(ChannelTable {
                channels: HashMap::new(),
                pending_opens: HashMap::new(),
                next_id: if initiator { 1 } else { 2 },
            }),
            closed: AtomicBool::new(false),
            closed_tx,
            dropped_tx,
            beacon_waiters: StdMutex::new(Vec::new()),
            last_beacon_ack: StdMutex::new(None),
            on_shutdown: StdMutex::new(Some(hooks.on_shutdown)),
        });

        tokio::spawn(reader_task(
            core.clone(),
            read_half,
            hooks.on_channel_request,
            hooks.on_channel_ready,
        ));
        tokio::spawn(maintenance_task(core.clone(), dropped_rx, closed_rx));

        Self { core }
    }

    /// The authenticated remote device.
    pub fn peer(&self) -> DeviceId {
        self.core.peer_device
    }

    pub fn peer_certificate(&self) -> &DeviceCertificate {
        &self.core.peer
    }

    pub fn is_initiator(&self) -> bool {
        self.core.initiator
    }

    pub fn is_closed(&self) -> bool {
        self.core.is_closed()
    }

    /// Open a channel with the given name and wait for the remote decision.
    pub async fn open_channel(&self, name: &str) -> Result<ChannelSocket, ChannelOpenError> {
        if name.is_empty() || name.len() > MAX_CHANNEL_NAME {
            return Err(ChannelOpenError::InvalidName);
        }
        if self.core.is_closed() {
            return Err(ChannelOpenError::TransportClosed);
        }

        let id = self.core.allocate_channel_id()?;
        let (reply_tx, reply_rx) = oneshot::channel();
        {
            let mut table = self.core.table.lock().expect("channel table lock poisoned");
            table.pending_opens.insert(
                id,
                PendingOpen {
                    name: name.to_string(),
                    reply: reply_tx,
                },
            );
        }

        let sent = self
            .core
            .send_control(&ControlMessage::ChannelOpen {
                id,
                name: name.to_string(),
            })
            .await;
        if sent.is_err() {
            self.core
                .table
                .lock()
                .expect("channel table lock poisoned")
                .pending_opens
                .remove(&id);
            return Err(ChannelOpenError::TransportClosed);
        }

        match tokio::time::timeout(self.core.tuning.open_timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ChannelOpenError::TransportClosed),
            Err(_) => {
                self.core
                    .table
                    .lock()
                    .expect("channel table lock poisoned")
                    .pending_opens
                    .remove(&id);
                Err(ChannelOpenError::Timeout)
            }
        }
    }

    /// Whether an open request with this name is awaiting the remote
    /// decision.
    pub fn is_open_pending(&self, name: &str) -> bool {
        self.core
            .table
            .lock()
            .expect("channel table lock poisoned")
            .pending_opens
            .values()
            .any(|p| p.name == name)
    }

    /// Number of live channels (excluding the control channel).
    pub fn active_channels(&self) -> usize {
        self.core
            .table
            .lock()
            .expect("channel table lock poisoned")
            .channels
            .len()
    }

    /// (id, name) of every live channel, for diagnostics.
    pub fn channel_inventory(&self) -> Vec<(u16, String)> {
        self.core
            .table
            .lock()
            .expect("channel table lock poisoned")
            .channels
            .iter()
            .map(|(id, e)| (*id, e.name.clone()))
            .collect()
    }

    /// Instant of the last beacon acknowledgement, if any.
    pub fn last_beacon_ack(&self) -> Option<Instant> {
        *self
            .core
            .last_beacon_ack
            .lock()
            .expect("beacon state lock poisoned")
    }

    /// Emit a beacon and wait for the acknowledgement. Returns false when
    /// the peer failed to answer within `timeout`; the caller decides
    /// whether to tear the socket down.
    pub async fn send_beacon(&self, timeout: Duration) -> bool {
        send_beacon(&self.core, timeout).await
    }

    /// Tear the socket down, closing every channel.
    pub async fn stop(&self) {
        self.core.teardown().await;
    }
}

impl std::fmt::Debug for MultiplexedSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiplexedSocket")
            .field("peer", &self.core.peer_device)
            .field("initiator", &self.core.initiator)
            .field("closed", &self.core.is_closed())
            .field("channels", &self.active_channels())
            .finish()
    }
}

async fn send_beacon(core: &Arc<SocketCore>, timeout: Duration) -> bool {
    if core.is_closed() {
        return false;
    }
    let (ack_tx, ack_rx) = oneshot::channel();
    core.beacon_waiters
        .lock()
        .expect("beacon state lock poisoned")
        .push(ack_tx);
    if core.send_control(&ControlMessage::Beacon).await.is_err() {
        return false;
    }
    tokio::time::timeout(timeout, ack_rx).await.is_ok_and(|r| r.is_ok())
}

async fn maintenance_task(
    core: Arc<SocketCore>,
    mut dropped_rx: mpsc::UnboundedReceiver<u16>,
    mut closed_rx: tokio::sync::watch::Receiver<bool>,
) {
    let mut beacon_interval = tokio::time::interval(core.tuning.beacon_interval);
    beacon_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    beacon_interval.tick().await; // skip the immediate tick

    loop {
        tokio::select! {
            _ = beacon_interval.tick() => {
                if !send_beacon(&core, core.tuning.beacon_timeout).await {
                    warn!(peer = %core.peer_device, "beacon unanswered, tearing down socket");
                    core.teardown().await;
                    return;
                }
            }
            dropped = dropped_rx.recv() => {
                match dropped {
                    Some(id) => {
                        trace!(channel = id, "last handle dropped, closing channel");
                        core.close_channel(id).await;
                    }
                    None => return,
                }
            }
            _ = closed_rx.changed() => {
                if *closed_rx.borrow() {
                    return;
                }
            }
        }
    }
}

async fn reader_task(
    core: Arc<SocketCore>,
    mut read_half: ReadHalf<Box<dyn IceStream>>,
    on_channel_request: Arc<dyn Fn(&DeviceCertificate, &str) -> bool + Send + Sync>,
    on_channel_ready: Arc<dyn Fn(ChannelSocket) + Send + Sync>,
) {
    loop {
        let frame = match read_frame(&mut read_half).await {
            Ok(frame) => frame,
            Err(e) => {
                if !core.is_closed() {
                    debug!(peer = %core.peer_device, error = %e, "transport read failed");
                }
                core.teardown().await;
                return;
            }
        };

        if frame.channel == CONTROL_CHANNEL {
            let msg: ControlMessage = match messages::deserialize_bounded(&frame.payload) {
                Ok(msg) => msg,
                Err(e) => {
                    warn!(peer = %core.peer_device, error = %e, "undecodable control frame");
                    core.teardown().await;
                    return;
                }
            };
            handle_control(&core, msg, &on_channel_request, &on_channel_ready).await;
            if core.is_closed() {
                return;
            }
        } else {
            let inner = {
                let table = core.table.lock().expect("channel table lock poisoned");
                table.channels.get(&frame.channel).and_then(|e| e.inner.upgrade())
            };
            match inner {
                // Backpressure: deliver blocks while the channel's buffer
                // sits over its high-water mark.
                Some(inner) => inner.deliver(&frame.payload).await,
                // Late frames for closed/unknown channels are dropped.
                None => trace!(channel = frame.channel, "dropping frame for unknown channel"),
            }
        }
    }
}

async fn handle_control(
    core: &Arc<SocketCore>,
    msg: ControlMessage,
    on_channel_request: &Arc<dyn Fn(&DeviceCertificate, &str) -> bool + Send + Sync>,
    on_channel_ready: &Arc<dyn Fn(ChannelSocket) + Send + Sync>,
) {
    match msg {
        ControlMessage::ChannelOpen { id, name } => {
            // The remote allocates from the opposite parity class.
            let expected_parity = if core.initiator { 0 } else { 1 };
            let valid_id = id != 0 && id % 2 == expected_parity;
            let in_use = {
                let table = core.table.lock().expect("channel table lock poisoned");
                table.channels.contains_key(&id)
            };
            if !valid_id || in_use || name.is_empty() || name.len() > MAX_CHANNEL_NAME {
                let _ = core
                    .send_control(&ControlMessage::ChannelReject {
                        id,
                        reason: "invalid channel id or name".into(),
                    })
                    .await;
                return;
            }

            if !on_channel_request(&core.peer, &name) {
                debug!(peer = %core.peer_device, name = %name, "channel request declined");
                let _ = core
                    .send_control(&ControlMessage::ChannelReject {
                        id,
                        reason: "declined".into(),
                    })
                    .await;
                return;
            }

            let channel = core.make_channel(id, &name);
            if core
                .send_control(&ControlMessage::ChannelAccept { id })
                .await
                .is_err()
            {
                core.teardown().await;
                return;
            }
            debug!(peer = %core.peer_device, channel = id, name = %name, "inbound channel accepted");
            on_channel_ready(channel);
        }
        ControlMessage::ChannelAccept { id } => {
            let pending = {
                let mut table = core.table.lock().expect("channel table lock poisoned");
                table.pending_opens.remove(&id)
            };
            match pending {
                Some(open) => {
                    let channel = core.make_channel(id, &open.name);
                    debug!(peer = %core.peer_device, channel = id, name = %open.name, "channel open accepted");
                    let _ = open.reply.send(Ok(channel));
                }
                None => {
                    // The local open already timed out; tell the peer so it
                    // does not keep a half-open channel around.
                    trace!(channel = id, "accept for unknown pending open");
                    let _ = core.send_control(&ControlMessage::ChannelClose { id }).await;
                }
            }
        }
        ControlMessage::ChannelReject { id, reason } => {
            let pending = {
                let mut table = core.table.lock().expect("channel table lock poisoned");
                table.pending_opens.remove(&id)
            };
            if let Some(open) = pending {
                debug!(peer = %core.peer_device, channel = id, reason = %reason, "channel open rejected");
                let _ = open.reply.send(Err(ChannelOpenError::Declined(reason)));
            }
        }
        ControlMessage::ChannelClose { id } => {
            let inner = {
                let mut table = core.table.lock().expect("channel table lock poisoned");
                table.channels.remove(&id).and_then(|e| e.inner.upgrade())
            };
            if let Some(inner) = inner {
                inner.shutdown();
            }
        }
        ControlMessage::Beacon => {
            if core.send_control(&ControlMessage::BeaconAck).await.is_err() {
                core.teardown().await;
            }
        }
        ControlMessage::BeaconAck => {
            *core
                .last_beacon_ack
                .lock()
                .expect("beacon state lock poisoned") = Some(Instant::now());
            let waiters: Vec<_> = core
                .beacon_waiters
                .lock()
                .expect("beacon state lock poisoned")
                .drain(..)
                .collect();
            for waiter in waiters {
                let _ = waiter.send(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::generate_device_certificate;
    use crate::identity::DeviceKeypair;

    fn test_certificate() -> DeviceCertificate {
        let keypair = DeviceKeypair::generate();
        let (certs, _) = generate_device_certificate(&keypair).expect("certs");
        DeviceCertificate::from_der(certs[0].as_ref().to_vec()).expect("record")
    }

    fn socket_pair(
        a_hooks: SocketHooks,
        b_hooks: SocketHooks,
        tuning: SocketTuning,
    ) -> (MultiplexedSocket, MultiplexedSocket) {
        let (a, b) = tokio::io::duplex(256 * 1024);
        let sa = MultiplexedSocket::start(
            Box::new(a),
            test_certificate(),
            true,
            a_hooks,
            tuning,
        );
        let sb = MultiplexedSocket::start(
            Box::new(b),
            test_certificate(),
            false,
            b_hooks,
            tuning,
        );
        (sa, sb)
    }

    #[tokio::test]
    async fn open_accept_and_exchange_bytes() {
        let (ready_tx, mut ready_rx) = mpsc::unbounded_channel();
        let b_hooks = SocketHooks {
            on_channel_request: Arc::new(|_, name| name == "git"),
            on_channel_ready: Arc::new(move |ch| {
                let _ = ready_tx.send(ch);
            }),
            on_shutdown: Box::new(|| {}),
        };
        let (sa, _sb) = socket_pair(SocketHooks::default(), b_hooks, SocketTuning::default());

        let ca = sa.open_channel("git").await.expect("open accepted");
        let cb = ready_rx.recv().await.expect("remote channel surfaced");
        assert_eq!(ca.id(), cb.id());
        assert_eq!(cb.name(), "git");

        ca.write(&[0x01, 0x02, 0x03]).await.expect("write");
        let mut buf = [0u8; 3];
        let mut filled = 0;
        while filled < 3 {
            filled += cb.read(&mut buf[filled..]).await.expect("read");
        }
        assert_eq!(buf, [0x01, 0x02, 0x03]);
    }

    #[tokio::test]
    async fn rejected_open_reports_decline() {
        let b_hooks = SocketHooks {
            on_channel_request: Arc::new(|_, name| name != "secret"),
            ..Default::default()
        };
        let (sa, _sb) = socket_pair(SocketHooks::default(), b_hooks, SocketTuning::default());

        let err = sa.open_channel("secret").await.unwrap_err();
        assert!(matches!(err, ChannelOpenError::Declined(_)), "got {err}");

        // Other names remain usable on the same socket.
        assert!(sa.open_channel("public").await.is_ok());
    }

    #[tokio::test]
    async fn initiator_and_responder_id_spaces_are_disjoint() {
        let (ready_tx, mut ready_rx) = mpsc::unbounded_channel();
        let a_hooks = SocketHooks {
            on_channel_ready: Arc::new(move |ch| {
                let _ = ready_tx.send(ch);
            }),
            ..Default::default()
        };
        let (sa, sb) = socket_pair(a_hooks, SocketHooks::default(), SocketTuning::default());

        let from_a = sa.open_channel("one").await.expect("open");
        let from_b = sb.open_channel("two").await.expect("open");
        let surfaced = ready_rx.recv().await.expect("b's channel on a");

        assert_eq!(from_a.id() % 2, 1, "initiator allocates odd ids");
        assert_eq!(from_b.id() % 2, 0, "responder allocates even ids");
        assert_ne!(from_a.id(), from_b.id());
        assert_eq!(surfaced.id(), from_b.id());
    }

    #[tokio::test]
    async fn close_notifies_remote_side() {
        let (ready_tx, mut ready_rx) = mpsc::unbounded_channel();
        let b_hooks = SocketHooks {
            on_channel_ready: Arc::new(move |ch| {
                let _ = ready_tx.send(ch);
            }),
            ..Default::default()
        };
        let (sa, _sb) = socket_pair(SocketHooks::default(), b_hooks, SocketTuning::default());

        let ca = sa.open_channel("doc").await.expect("open");
        let cb = ready_rx.recv().await.expect("surfaced");

        ca.close().await;
        assert!(ca.is_closed());

        // The remote read drains to EOF once the close frame lands.
        let mut buf = [0u8; 8];
        let n = tokio::time::timeout(Duration::from_secs(2), cb.read(&mut buf))
            .await
            .expect("close propagated");
        assert_eq!(n.expect("read"), 0);
    }

    #[tokio::test]
    async fn dropping_last_handle_closes_remote_side() {
        let (ready_tx, mut ready_rx) = mpsc::unbounded_channel();
        let b_hooks = SocketHooks {
            on_channel_ready: Arc::new(move |ch| {
                let _ = ready_tx.send(ch);
            }),
            ..Default::default()
        };
        let (sa, _sb) = socket_pair(SocketHooks::default(), b_hooks, SocketTuning::default());

        let ca = sa.open_channel("tmp").await.expect("open");
        let cb = ready_rx.recv().await.expect("surfaced");
        drop(ca);

        let mut buf = [0u8; 8];
        let n = tokio::time::timeout(Duration::from_secs(2), cb.read(&mut buf))
            .await
            .expect("drop propagated close");
        assert_eq!(n.expect("read"), 0);
    }

    #[tokio::test]
    async fn teardown_closes_every_channel_and_fires_hook() {
        let (down_tx, down_rx) = oneshot::channel();
        let a_hooks = SocketHooks {
            on_shutdown: Box::new(move || {
                let _ = down_tx.send(());
            }),
            ..Default::default()
        };
        let (sa, _sb) = socket_pair(a_hooks, SocketHooks::default(), SocketTuning::default());

        let c1 = sa.open_channel("one").await.expect("open");
        let c2 = sa.open_channel("two").await.expect("open");

        sa.stop().await;
        assert!(sa.is_closed());
        assert!(c1.is_closed());
        assert!(c2.is_closed());
        tokio::time::timeout(Duration::from_secs(1), down_rx)
            .await
            .expect("shutdown hook fired")
            .expect("hook sender");
    }

    #[tokio::test]
    async fn peer_death_detected_by_beacon() {
        let tuning = SocketTuning {
            beacon_interval: Duration::from_millis(200),
            beacon_timeout: Duration::from_millis(200),
            ..Default::default()
        };
        let (down_tx, down_rx) = oneshot::channel();
        let a_hooks = SocketHooks {
            on_shutdown: Box::new(move || {
                let _ = down_tx.send(());
            }),
            ..Default::default()
        };

        // A frozen peer: the raw far end stays open but never answers.
        let (a, frozen) = tokio::io::duplex(64 * 1024);
        let sa = MultiplexedSocket::start(Box::new(a), test_certificate(), true, a_hooks, tuning);

        tokio::time::timeout(Duration::from_secs(2), down_rx)
            .await
            .expect("beacon death within 2x interval")
            .expect("hook sender");
        assert!(sa.is_closed());
        drop(frozen);
    }

    #[tokio::test]
    async fn beacon_round_trip_on_live_socket() {
        let (sa, _sb) = socket_pair(
            SocketHooks::default(),
            SocketHooks::default(),
            SocketTuning::default(),
        );
        assert!(sa.send_beacon(Duration::from_secs(2)).await);
        assert!(sa.last_beacon_ack().is_some());
    }

    #[tokio::test]
    async fn open_times_out_without_decision() {
        // A peer that never answers: raw duplex with no socket on the far end.
        let (a, _b) = tokio::io::duplex(64 * 1024);
        let sa = MultiplexedSocket::start(
            Box::new(a),
            test_certificate(),
            true,
            SocketHooks::default(),
            SocketTuning {
                open_timeout: Duration::from_millis(200),
                ..Default::default()
            },
        );

        let before = std::time::Instant::now();
        let err = sa.open_channel("silent").await.unwrap_err();
        assert!(matches!(err, ChannelOpenError::Timeout), "got {err}");
        assert!(before.elapsed() < Duration::from_secs(2));
        assert!(!sa.is_open_pending("silent"));
    }

    #[tokio::test]
    async fn invalid_channel_names_rejected_locally() {
        let (sa, _sb) = socket_pair(
            SocketHooks::default(),
            SocketHooks::default(),
            SocketTuning::default(),
        );
        assert!(matches!(
            sa.open_channel("").await.unwrap_err(),
            ChannelOpenError::InvalidName
        ));
        let long = "x".repeat(MAX_CHANNEL_NAME + 1);
        assert!(matches!(
            sa.open_channel(&long).await.unwrap_err(),
            ChannelOpenError::InvalidName
        ));
    }
}
