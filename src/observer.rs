//! Edge event streaming.
//!
//! An [`EventObserver`] takes ownership of a [`LineHandle`] and streams its
//! edge events to a callback running on the caller's tokio runtime.
//!
//! # Architecture
//!
//! ```text
//!   kernel event queue
//!          │  read(48 bytes)
//!   ┌──────▼──────────────┐
//!   │ reader thread       │  blocks in poll(line fd, wake fd)
//!   │ EventRing (128)     │
//!   └──────┬──────────────┘
//!          │  blocking_send, capacity 127
//!   ┌──────▼──────────────┐
//!   │ dispatcher task     │  runs on the consumer's runtime
//!   │ on_event(LineEvent) │
//!   └─────────────────────┘
//! ```
//!
//! The reader thread blocks when 127 events are in flight, so the kernel's
//! own queue absorbs the overflow and the read rate follows the consumer.
//! Cancellation is observed only at the two blocking points: the wake
//! eventfd interrupts the poll, and the dispatcher dropping its receiver
//! fails a pending send.
//!
//! Teardown runs exactly once, on the reader thread, whatever ended the
//! stream: queued events are discarded, the handle is closed and the thread
//! exits. The dispatcher then joins the thread and marks the observer
//! [`ObserverState::Terminated`]. If the dispatcher is gone (its runtime was
//! dropped, or `on_event` panicked) whichever side finishes last marks it
//! instead.

use std::io::ErrorKind;
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::eventfd::{EfdFlags, EventFd};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, trace, warn};

use crate::error::{GpioError, Result};
use crate::event::{EventRing, LineEvent, EVENT_RECORD_SIZE, IN_FLIGHT_CAPACITY};
use crate::handle::LineHandle;

/// Lifecycle of an [`EventObserver`].
///
/// States only move forward; `Cancelling` is skipped when the stream ends
/// on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ObserverState {
    /// Handle acquired, delivery channel registered
    Created,
    /// Reader thread active
    Running,
    /// Release requested, reader not yet exited
    Cancelling,
    /// Handle closed, reader joined, no further callbacks
    Terminated,
}

/// Why an event stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamTermination {
    /// Released through a [`ReleaseHandle`]
    Cancelled,
    /// The handle reported end of file
    EndOfStream,
    /// A read returned fewer bytes than one event record
    ShortRead(usize),
    /// A read or poll failed
    ReadFailed(Errno),
    /// The consumer side went away without a release
    ConsumerGone,
}

impl std::fmt::Display for StreamTermination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cancelled => write!(f, "cancelled"),
            Self::EndOfStream => write!(f, "end of stream"),
            Self::ShortRead(n) => write!(f, "short read of {n} bytes"),
            Self::ReadFailed(errno) => write!(f, "read failed: {errno}"),
            Self::ConsumerGone => write!(f, "consumer gone"),
        }
    }
}

/// State shared by the observer, its release handles, the reader thread
/// and the dispatcher task.
struct Shared {
    fd: RawFd,
    state: watch::Sender<ObserverState>,
    wake: EventFd,
    /// Set by teardown; events still queued after this are discarded
    stream_closed: AtomicBool,
    /// Set once teardown has closed the handle
    reader_done: AtomicBool,
    /// Cleared when the dispatcher task is dropped, for any reason
    dispatcher_alive: AtomicBool,
    records_read: AtomicU64,
    handle: Mutex<Option<Arc<LineHandle>>>,
    termination: Mutex<Option<StreamTermination>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn state(&self) -> ObserverState {
        *self.state.borrow()
    }

    fn mark_terminated(&self) {
        self.state.send_if_modified(|state| {
            let changed = *state != ObserverState::Terminated;
            *state = ObserverState::Terminated;
            changed
        });
    }

    /// Terminate on behalf of a dispatcher that no longer exists, once
    /// teardown has finished.
    fn finish_without_dispatcher(&self) {
        if self.reader_done.load(Ordering::SeqCst)
            && !self.dispatcher_alive.load(Ordering::SeqCst)
        {
            self.mark_terminated();
        }
    }

    /// Move Running to Cancelling and wake the reader. False if the stream
    /// was not running.
    fn request_cancel(&self) -> bool {
        let requested = self.state.send_if_modified(|state| {
            if *state == ObserverState::Running {
                *state = ObserverState::Cancelling;
                true
            } else {
                false
            }
        });

        if requested {
            debug!(fd = self.fd, "Release requested");
            if let Err(e) = self.wake.write(1) {
                error!(fd = self.fd, error = %e, "Failed to wake event reader");
            }
        }
        requested
    }
}

/// Streams edge events from an owned [`LineHandle`].
///
/// Dropping the observer releases it.
pub struct EventObserver {
    shared: Arc<Shared>,
}

impl EventObserver {
    /// Take ownership of `handle` and start streaming its events to
    /// `on_event`.
    ///
    /// Must be called from within a tokio runtime: `on_event` runs on that
    /// runtime, one event at a time and in read order.
    ///
    /// # Errors
    ///
    /// [`GpioError::RegistrationFailed`] if there is no runtime or the wake
    /// descriptor cannot be created, [`GpioError::SpawnFailed`] if the reader
    /// thread cannot be started. The handle is closed in both cases.
    pub fn start<F>(handle: LineHandle, on_event: F) -> Result<(Self, ReleaseHandle)>
    where
        F: FnMut(LineEvent) + Send + 'static,
    {
        let fd = handle.as_raw_fd();

        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            warn!(fd, "No runtime to deliver events on, closing handle");
            GpioError::RegistrationFailed {
                message: e.to_string(),
            }
        })?;
        let wake = EventFd::from_value_and_flags(0, EfdFlags::EFD_CLOEXEC).map_err(|e| {
            warn!(fd, error = %e, "Failed to create wake descriptor, closing handle");
            GpioError::RegistrationFailed {
                message: format!("eventfd: {e}"),
            }
        })?;

        let (state, _) = watch::channel(ObserverState::Created);
        let handle = Arc::new(handle);
        let shared = Arc::new(Shared {
            fd,
            state,
            wake,
            stream_closed: AtomicBool::new(false),
            reader_done: AtomicBool::new(false),
            dispatcher_alive: AtomicBool::new(true),
            records_read: AtomicU64::new(0),
            handle: Mutex::new(Some(Arc::clone(&handle))),
            termination: Mutex::new(None),
            reader: Mutex::new(None),
        });

        let (tx, rx) = mpsc::channel(IN_FLIGHT_CAPACITY);
        let reader = ReaderLoop {
            shared: Arc::clone(&shared),
            handle: Some(handle),
            tx: Some(tx),
            ring: EventRing::new(),
        };

        shared.state.send_replace(ObserverState::Running);
        let spawned = std::thread::Builder::new()
            .name(format!("gpio-events-{fd}"))
            .spawn(move || reader.run());

        match spawned {
            Ok(join) => *shared.reader.lock() = Some(join),
            Err(e) => {
                // The reader closure has been dropped, and with it the
                // handle; make sure the slot is empty too.
                error!(fd, error = %e, "Failed to spawn event reader");
                shared.handle.lock().take();
                shared.mark_terminated();
                return Err(GpioError::SpawnFailed(e));
            }
        }

        // The guard lives in the task's state, so it is dropped even if the
        // task never gets polled.
        let guard = DispatcherGuard {
            shared: Arc::clone(&shared),
        };
        runtime.spawn(dispatch(guard, rx, on_event));
        info!(fd, "Event observer started");

        let release = ReleaseHandle {
            shared: Arc::clone(&shared),
        };
        Ok((Self { shared }, release))
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ObserverState {
        self.shared.state()
    }

    /// True until the observer is terminated.
    pub fn is_running(&self) -> bool {
        self.state() < ObserverState::Terminated
    }

    /// A new capability to release this observer.
    pub fn release_handle(&self) -> ReleaseHandle {
        ReleaseHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Request cancellation, see [`ReleaseHandle::release`].
    pub fn release(&self) {
        self.shared.request_cancel();
    }

    /// Wait until the observer is terminated and return why the stream ended.
    pub async fn wait(&self) -> Option<StreamTermination> {
        let mut state = self.shared.state.subscribe();
        // The sender lives in `shared`, which we hold
        let _ = state
            .wait_for(|s| *s == ObserverState::Terminated)
            .await;
        self.termination()
    }

    /// Why the stream ended, once it has.
    pub fn termination(&self) -> Option<StreamTermination> {
        *self.shared.termination.lock()
    }

    /// Number of event records read from the handle so far.
    pub fn records_read(&self) -> u64 {
        self.shared.records_read.load(Ordering::Acquire)
    }

    /// Descriptor number of the owned handle. Stale once terminated.
    pub fn raw_fd(&self) -> RawFd {
        self.shared.fd
    }

    /// Read line values through the owned handle.
    ///
    /// Fails with [`GpioError::StreamTerminated`] once the handle is closed.
    pub fn get_values(&self, mask: u32) -> Result<u32> {
        let slot = self.shared.handle.lock();
        slot.as_ref()
            .ok_or(GpioError::StreamTerminated)?
            .get_values(mask)
    }

    /// Set line values through the owned handle.
    ///
    /// Fails with [`GpioError::StreamTerminated`] once the handle is closed.
    pub fn set_values(&self, mask: u32, bits: u32) -> Result<()> {
        let slot = self.shared.handle.lock();
        slot.as_ref()
            .ok_or(GpioError::StreamTerminated)?
            .set_values(mask, bits)
    }
}

impl Drop for EventObserver {
    fn drop(&mut self) {
        self.shared.request_cancel();
    }
}

impl std::fmt::Debug for EventObserver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventObserver")
            .field("fd", &self.shared.fd)
            .field("state", &self.state())
            .finish()
    }
}

/// Capability to cancel a running [`EventObserver`].
///
/// Does not own the handle. Cloning is cheap.
#[derive(Clone)]
pub struct ReleaseHandle {
    shared: Arc<Shared>,
}

impl ReleaseHandle {
    /// Request cancellation of the observer.
    ///
    /// Idempotent and non-blocking: only the first call on a running
    /// observer has any effect. Calls after the stream ended on its own are
    /// no-ops as well. Use [`EventObserver::wait`] to wait for termination.
    pub fn release(&self) {
        self.shared.request_cancel();
    }

    /// Current state of the bound observer.
    pub fn state(&self) -> ObserverState {
        self.shared.state()
    }
}

impl std::fmt::Debug for ReleaseHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReleaseHandle")
            .field("fd", &self.shared.fd)
            .finish()
    }
}

/// The reader thread. Dropping it performs teardown.
struct ReaderLoop {
    shared: Arc<Shared>,
    handle: Option<Arc<LineHandle>>,
    tx: Option<mpsc::Sender<LineEvent>>,
    ring: EventRing,
}

impl ReaderLoop {
    fn run(mut self) {
        let reason = self.read_events();
        *self.shared.termination.lock() = Some(reason);
    }

    fn read_events(&mut self) -> StreamTermination {
        let (Some(handle), Some(tx)) = (self.handle.as_ref(), self.tx.as_ref()) else {
            return StreamTermination::Cancelled;
        };

        loop {
            match wait_readable(handle, &self.shared.wake) {
                Ok(true) => {}
                Ok(false) => return StreamTermination::Cancelled,
                Err(errno) => return StreamTermination::ReadFailed(errno),
            }

            let slot = self.ring.next_slot();
            let n = match handle.read_record(&mut slot[..]) {
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    return StreamTermination::ReadFailed(
                        e.raw_os_error().map_or(Errno::UnknownErrno, Errno::from_raw),
                    )
                }
            };
            if n == 0 {
                return StreamTermination::EndOfStream;
            }
            if n != EVENT_RECORD_SIZE {
                return StreamTermination::ShortRead(n);
            }

            let Some(event) = LineEvent::decode(&slot[..]) else {
                return StreamTermination::ShortRead(n);
            };
            self.shared.records_read.fetch_add(1, Ordering::AcqRel);
            trace!(
                fd = self.shared.fd,
                offset = event.offset,
                edge = ?event.edge,
                seqno = event.seqno,
                timestamp_ns = event.timestamp_ns,
                "Edge event"
            );

            if tx.blocking_send(event).is_err() {
                return if self.shared.state() >= ObserverState::Cancelling {
                    StreamTermination::Cancelled
                } else {
                    StreamTermination::ConsumerGone
                };
            }
        }
    }
}

impl Drop for ReaderLoop {
    fn drop(&mut self) {
        let fd = self.shared.fd;

        self.shared.stream_closed.store(true, Ordering::Release);
        drop(self.tx.take());

        // Both references gone closes the descriptor
        drop(self.handle.take());
        drop(self.shared.handle.lock().take());

        let reason = *self.shared.termination.lock();
        match reason {
            Some(StreamTermination::Cancelled) => info!(fd, "Event stream released"),
            Some(reason) => warn!(fd, %reason, "Event stream terminated"),
            None => debug!(fd, "Event reader torn down before start"),
        }

        self.shared.reader_done.store(true, Ordering::SeqCst);
        // Nobody may be left to join us and mark the end
        self.shared.finish_without_dispatcher();
        debug!(fd, read = self.ring.staged(), "Event reader exiting");
    }
}

/// Block until the handle is readable. `Ok(false)` means the wake
/// descriptor fired.
fn wait_readable(handle: &LineHandle, wake: &EventFd) -> std::result::Result<bool, Errno> {
    loop {
        let mut fds = [
            PollFd::new(handle.as_fd(), PollFlags::POLLIN),
            PollFd::new(wake.as_fd(), PollFlags::POLLIN),
        ];
        match poll(&mut fds, PollTimeout::NONE) {
            Ok(_) => {}
            Err(Errno::EINTR) => continue,
            Err(errno) => return Err(errno),
        }

        if fds[1].revents().is_some_and(|r| !r.is_empty()) {
            return Ok(false);
        }
        if fds[0].revents().is_some_and(|r| !r.is_empty()) {
            return Ok(true);
        }
    }
}

/// Marks the dispatcher gone when its task is dropped, whether it finished,
/// panicked in `on_event` or was discarded with its runtime.
struct DispatcherGuard {
    shared: Arc<Shared>,
}

impl Drop for DispatcherGuard {
    fn drop(&mut self) {
        self.shared.dispatcher_alive.store(false, Ordering::SeqCst);
        self.shared.finish_without_dispatcher();
    }
}

/// Dispatcher task: hands queued events to `on_event` until the stream ends
/// or a release is requested, then joins the reader.
async fn dispatch<F>(guard: DispatcherGuard, mut rx: mpsc::Receiver<LineEvent>, mut on_event: F)
where
    F: FnMut(LineEvent) + Send + 'static,
{
    let shared = Arc::clone(&guard.shared);
    let mut state = shared.state.subscribe();
    let mut delivered: u64 = 0;

    loop {
        tokio::select! {
            biased;
            _ = state.wait_for(|s| *s >= ObserverState::Cancelling) => break,
            event = rx.recv() => match event {
                Some(event) if !shared.stream_closed.load(Ordering::Acquire) => {
                    on_event(event);
                    delivered += 1;
                }
                _ => break,
            },
        }
    }

    let aborted = rx.len();
    drop(rx);

    let reader = shared.reader.lock().take();
    if let Some(reader) = reader {
        match tokio::task::spawn_blocking(move || reader.join()).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => error!(fd = shared.fd, "Event reader panicked"),
            Err(e) => error!(fd = shared.fd, error = %e, "Failed to join event reader"),
        }
    }

    shared.mark_terminated();
    debug!(fd = shared.fd, delivered, aborted, "Event observer terminated");
}
