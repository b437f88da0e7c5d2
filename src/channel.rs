//! # Channel Socket
//!
//! One logical bidirectional byte stream inside a multiplexed transport.
//! A [`ChannelSocket`] is a thin handle addressing into its parent socket:
//! writes are framed onto the shared transport, reads drain a per-channel
//! buffer filled by the parent's demultiplexer.
//!
//! The parent link is weak. Closing a channel never frees the parent, but
//! tearing down the parent force-closes every channel. Dropping the last
//! handle of an unclosed channel still notifies the peer.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};

use tokio::sync::Notify;
use tracing::trace;

use crate::identity::DeviceId;
use crate::multiplexed_socket::SocketCore;

/// Default per-channel read buffer high-water mark.
pub const DEFAULT_HIGH_WATER: usize = 64 * 1024;

/// Default low-water mark at which a paused demultiplexer resumes.
pub const DEFAULT_LOW_WATER: usize = 16 * 1024;

type HookCallback = Box<dyn FnOnce() + Send>;

struct ReadBuffer {
    data: VecDeque<u8>,
    /// Set when no more data will ever arrive (close or teardown).
    eof: bool,
}

pub(crate) struct ChannelInner {
    id: u16,
    name: String,
    peer: DeviceId,
    parent: Weak<SocketCore>,
    high_water: usize,
    low_water: usize,
    buffer: StdMutex<ReadBuffer>,
    /// Signalled when data arrives or the channel reaches EOF.
    data_ready: Notify,
    /// Signalled when the reader drains below the low-water mark.
    space_freed: Notify,
    closed: AtomicBool,
    on_shutdown: StdMutex<Option<HookCallback>>,
}

impl ChannelInner {
    /// Queue bytes for the application, honoring the high-water mark.
    /// Blocks the caller (the parent demultiplexer) while the buffer is
    /// over the mark. Silently drops data once the channel is closed.
    pub(crate) async fn deliver(&self, data: &[u8]) {
        loop {
            let mut wait = std::pin::pin!(self.space_freed.notified());
            // Register interest before re-checking the condition so a
            // concurrent notify_waiters cannot slip between check and await.
            wait.as_mut().enable();
            if self.closed.load(Ordering::SeqCst) {
                return;
            }
            {
                let mut buf = self.buffer.lock().expect("channel buffer lock poisoned");
                if buf.eof {
                    return;
                }
                if buf.data.len() + data.len() <= self.high_water || buf.data.is_empty() {
                    buf.data.extend(data);
                    drop(buf);
                    self.data_ready.notify_waiters();
                    return;
                }
            }
            trace!(channel = self.id, "read buffer over high water, pausing demux");
            wait.await;
        }
    }

    /// Mark the channel closed and wake everyone. Fires the shutdown hook
    /// exactly once. Buffered data stays readable until drained.
    pub(crate) fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let mut buf = self.buffer.lock().expect("channel buffer lock poisoned");
            buf.eof = true;
        }
        self.data_ready.notify_waiters();
        self.space_freed.notify_waiters();
        let hook = self
            .on_shutdown
            .lock()
            .expect("shutdown hook lock poisoned")
            .take();
        if let Some(hook) = hook {
            hook();
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    fn buffered(&self) -> usize {
        self.buffer
            .lock()
            .expect("channel buffer lock poisoned")
            .data
            .len()
    }
}

impl Drop for ChannelInner {
    fn drop(&mut self) {
        // Last handle gone without an explicit close: the peer still gets
        // its close notification, routed through the parent's cleanup queue.
        if !self.closed.load(Ordering::SeqCst) {
            if let Some(parent) = self.parent.upgrade() {
                parent.channel_dropped(self.id);
            }
        }
    }
}

/// Cheap-clone handle to one channel of a multiplexed transport.
#[derive(Clone)]
pub struct ChannelSocket {
    inner: Arc<ChannelInner>,
}

impl ChannelSocket {
    pub(crate) fn new(
        id: u16,
        name: String,
        peer: DeviceId,
        parent: Weak<SocketCore>,
        high_water: usize,
        low_water: usize,
    ) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                id,
                name,
                peer,
                parent,
                high_water,
                low_water,
                buffer: StdMutex::new(ReadBuffer {
                    data: VecDeque::new(),
                    eof: false,
                }),
                data_ready: Notify::new(),
                space_freed: Notify::new(),
                closed: AtomicBool::new(false),
                on_shutdown: StdMutex::new(None),
            }),
        }
    }

    pub(crate) fn downgrade(&self) -> Weak<ChannelInner> {
        Arc::downgrade(&self.inner)
    }

    pub fn id(&self) -> u16 {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Authenticated device on the other end of the parent transport.
    pub fn peer(&self) -> DeviceId {
        self.inner.peer
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Run `cb` as soon as the channel is usable. Channels are surfaced to
    /// the application only after acceptance, so the hook runs immediately;
    /// it exists so callers can keep one registration path for both sides.
    pub fn set_on_ready(&self, cb: impl FnOnce() + Send + 'static) {
        cb();
    }

    /// Run `cb` once when the channel closes, whatever the cause. If the
    /// channel is already closed the hook runs immediately.
    pub fn set_on_shutdown(&self, cb: impl FnOnce() + Send + 'static) {
        if self.inner.is_closed() {
            cb();
            return;
        }
        let mut slot = self
            .inner
            .on_shutdown
            .lock()
            .expect("shutdown hook lock poisoned");
        // Re-check under the lock so a concurrent shutdown cannot strand
        // the hook in the slot.
        if self.inner.is_closed() {
            drop(slot);
            cb();
        } else {
            *slot = Some(Box::new(cb));
        }
    }

    /// Read into `buf`, waiting for data. Returns 0 once the channel is
    /// closed and the buffer fully drained.
    pub async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            let mut wait = std::pin::pin!(self.inner.data_ready.notified());
            wait.as_mut().enable();
            {
                let mut inner_buf = self
                    .inner
                    .buffer
                    .lock()
                    .expect("channel buffer lock poisoned");
                if !inner_buf.data.is_empty() {
                    let n = buf.len().min(inner_buf.data.len());
                    for slot in buf.iter_mut().take(n) {
                        *slot = inner_buf.data.pop_front().expect("length checked");
                    }
                    let below_low_water = inner_buf.data.len() <= self.inner.low_water;
                    drop(inner_buf);
                    if below_low_water {
                        self.inner.space_freed.notify_waiters();
                    }
                    return Ok(n);
                }
                if inner_buf.eof {
                    return Ok(0);
                }
            }
            wait.await;
        }
    }

    /// Write all of `data` to the peer, in order. Applies transport
    /// backpressure by waiting on the shared write path.
    pub async fn write(&self, data: &[u8]) -> io::Result<()> {
        if self.inner.is_closed() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "channel closed"));
        }
        let parent = self.inner.parent.upgrade().ok_or_else(|| {
            io::Error::new(io::ErrorKind::BrokenPipe, "transport closed")
        })?;
        parent.send_data(self.inner.id, data).await
    }

    /// Close the channel, notifying the peer. Idempotent.
    pub async fn close(&self) {
        if self.inner.is_closed() {
            return;
        }
        if let Some(parent) = self.inner.parent.upgrade() {
            parent.close_channel(self.inner.id).await;
        } else {
            self.inner.shutdown();
        }
    }
}

impl std::fmt::Debug for ChannelSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelSocket")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("peer", &self.inner.peer)
            .field("closed", &self.inner.is_closed())
            .finish()
    }
}
