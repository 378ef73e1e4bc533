//! Linux GPIO character device access with bounded edge-event streaming.
//!
//! This crate talks to `/dev/gpiochipN` through the GPIO uAPI v2 ioctls
//! (raw definitions in `gpio-sys`). It owns three things: encoding line
//! requests, the lifecycle of an acquired line handle, and delivering edge
//! events from a blocking reader thread to a consumer on a tokio runtime.
//!
//! # Architecture
//!
//! ## Chip access
//! - [`GpioChip`] - open chip device, implements [`ChipInterface`]
//! - [`ChipInfo`] / [`LineInfo`] - chip and line introspection
//! - [`chips`] - enumerate chip devices
//!
//! ## Requests
//! - [`AttributeDescriptor`] / [`encode`] - per-line attributes and their
//!   kernel encoding
//! - [`LineRequestBuilder`] / [`build_and_acquire`] - validated, atomic
//!   acquisition
//! - [`LineHandle`] - acquired lines, value get/set by mask
//!
//! ## Events
//! - [`EventObserver`] - owns a handle and streams its [`LineEvent`]s
//! - [`ReleaseHandle`] - idempotent cancellation
//! - [`request_lines`] - acquisition plus streaming in one call
//!
//! ## Named lines
//! - [`LineGroup`] - lines addressed by name, final values on close
//! - [`check_fallback`] - verify released lines return to input
//!
//! # Example
//!
//! ```no_run
//! use rust_gpiod::{request_lines, AttributeDescriptor, Bias, GpioChip};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let chip = GpioChip::open("/dev/gpiochip0")?;
//!
//! // Line 2 as a pulled-down input reporting rising edges
//! let attrs = [AttributeDescriptor::flags(0b1)
//!     .with_bias(Bias::PullDown)
//!     .rising_edge()];
//! let request = request_lines(&chip, "doorbell", &[2], &attrs, |event| {
//!     println!("{} at {} ns", event.offset, event.timestamp_ns);
//! })?;
//!
//! tokio::signal::ctrl_c().await?;
//! request.release();
//! request.wait().await;
//! # Ok(())
//! # }
//! ```

pub mod attribute;
pub mod chip;
pub mod config;
pub mod error;
pub mod event;
pub mod group;
pub mod handle;
pub mod lines;
pub mod logging;
pub mod observer;
pub mod request;

pub use attribute::{
    encode, AttributeDescriptor, AttributeKind, Bias, Drive, EncodedAttribute, LineFlags,
    MAX_ATTRIBUTES,
};
pub use chip::{chips, ChipInfo, ChipInterface, GpioChip, LineInfo, LineInfoFlags};
pub use config::GpiodConfig;
pub use error::{GpioError, Result};
pub use event::{EdgeKind, LineEvent, IN_FLIGHT_CAPACITY, RING_SLOTS};
pub use group::{check_fallback, AttributeSet, InputConfig, LineChange, LineConfig, LineGroup, OutputConfig, Pin};
pub use handle::LineHandle;
pub use lines::{request_lines, ActiveRequest};
pub use observer::{EventObserver, ObserverState, ReleaseHandle, StreamTermination};
pub use request::{build_and_acquire, LineRequest, LineRequestBuilder, MAX_LINES};
