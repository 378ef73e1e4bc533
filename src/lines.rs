//! Requesting lines with event delivery in one call.

use std::os::fd::RawFd;

use tracing::info;

use crate::attribute::AttributeDescriptor;
use crate::chip::ChipInterface;
use crate::error::Result;
use crate::event::LineEvent;
use crate::observer::{EventObserver, ObserverState, ReleaseHandle, StreamTermination};
use crate::request::build_and_acquire;

/// Lines acquired by [`request_lines`], streaming events to a callback.
#[derive(Debug)]
pub struct ActiveRequest {
    offsets: Vec<u32>,
    release: ReleaseHandle,
    observer: EventObserver,
}

impl ActiveRequest {
    /// Descriptor number of the line request.
    pub fn fd(&self) -> RawFd {
        self.observer.raw_fd()
    }

    /// Offsets of the acquired lines, in request order.
    pub fn offsets(&self) -> &[u32] {
        &self.offsets
    }

    /// Capability to cancel event delivery.
    pub fn release_handle(&self) -> &ReleaseHandle {
        &self.release
    }

    /// Request cancellation. Idempotent.
    pub fn release(&self) {
        self.release.release();
    }

    /// The observer owning the lines.
    pub fn observer(&self) -> &EventObserver {
        &self.observer
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ObserverState {
        self.observer.state()
    }

    /// Read line values by request-position mask.
    pub fn get_values(&self, mask: u32) -> Result<u32> {
        self.observer.get_values(mask)
    }

    /// Set line values by request-position mask.
    pub fn set_values(&self, mask: u32, bits: u32) -> Result<()> {
        self.observer.set_values(mask, bits)
    }

    /// Wait for the stream to end, see [`EventObserver::wait`].
    pub async fn wait(&self) -> Option<StreamTermination> {
        self.observer.wait().await
    }

    /// Split into the release capability and the observer.
    pub fn into_parts(self) -> (ReleaseHandle, EventObserver) {
        (self.release, self.observer)
    }
}

/// Acquire `offsets` from `chip` and stream their edge events to `on_event`.
///
/// Validation happens before the kernel is touched; the acquisition is a
/// single atomic request. On success the lines are owned by an
/// [`EventObserver`] running on the current tokio runtime, and stay
/// acquired until released (or the returned value is dropped).
pub fn request_lines<C, F>(
    chip: &C,
    consumer: &str,
    offsets: &[u32],
    attributes: &[AttributeDescriptor],
    on_event: F,
) -> Result<ActiveRequest>
where
    C: ChipInterface + ?Sized,
    F: FnMut(LineEvent) + Send + 'static,
{
    let handle = build_and_acquire(chip, consumer, offsets, attributes)?;
    let (observer, release) = EventObserver::start(handle, on_event)?;
    info!(consumer, fd = observer.raw_fd(), offsets = ?offsets, "Line request active");

    Ok(ActiveRequest {
        offsets: offsets.to_vec(),
        release,
        observer,
    })
}
