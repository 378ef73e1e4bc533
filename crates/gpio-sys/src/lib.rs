//! Raw definitions for the Linux GPIO character device interface.
//!
//! This crate mirrors the structures, flags and ioctl numbers published in
//! `include/uapi/linux/gpio.h` (the "v2" line API, available since Linux
//! 5.10). Every `#[repr(C)]` type here matches the kernel layout byte for
//! byte; the sizes are checked at compile time at the bottom of this file.
//!
//! # Safety
//!
//! All ioctl wrappers are `unsafe`: the caller must pass a valid file
//! descriptor of the right kind (chip or line request) and a pointer to a
//! properly initialised structure. For a safe wrapper, use the `rust-gpiod`
//! crate instead.
//!
//! # Example (unsafe)
//!
//! ```no_run
//! use gpio_sys::*;
//! use std::fs::File;
//! use std::os::fd::AsRawFd;
//!
//! let chip = File::open("/dev/gpiochip0")?;
//! let mut info = gpiochip_info::zeroed();
//! unsafe { gpio_get_chipinfo_ioctl(chip.as_raw_fd(), &mut info)? };
//! println!("{} lines", info.lines);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

#![allow(non_camel_case_types)]

use bitflags::bitflags;
use nix::{ioctl_read, ioctl_readwrite};

/// Maximum size of name and label arrays, including the terminating NUL.
pub const GPIO_MAX_NAME_SIZE: usize = 32;

/// Maximum number of lines the kernel accepts in one request.
pub const GPIO_V2_LINES_MAX: usize = 64;

/// Maximum number of configuration attributes in one request.
pub const GPIO_V2_LINE_NUM_ATTRS_MAX: usize = 10;

/// `gpio_v2_line_attribute.id`: the attribute carries line flags.
pub const GPIO_V2_LINE_ATTR_ID_FLAGS: u32 = 1;
/// `gpio_v2_line_attribute.id`: the attribute carries output values.
pub const GPIO_V2_LINE_ATTR_ID_OUTPUT_VALUES: u32 = 2;
/// `gpio_v2_line_attribute.id`: the attribute carries a debounce period.
pub const GPIO_V2_LINE_ATTR_ID_DEBOUNCE: u32 = 3;

/// `gpio_v2_line_event.id` for a rising edge.
pub const GPIO_V2_LINE_EVENT_RISING_EDGE: u32 = 1;
/// `gpio_v2_line_event.id` for a falling edge.
pub const GPIO_V2_LINE_EVENT_FALLING_EDGE: u32 = 2;

bitflags! {
    /// Line flags.
    ///
    /// Maps to kernel `enum gpio_v2_line_flag`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct GPIO_V2_LINE_FLAG: u64 {
        const USED = 1 << 0;
        const ACTIVE_LOW = 1 << 1;
        const INPUT = 1 << 2;
        const OUTPUT = 1 << 3;
        const EDGE_RISING = 1 << 4;
        const EDGE_FALLING = 1 << 5;
        const OPEN_DRAIN = 1 << 6;
        const OPEN_SOURCE = 1 << 7;
        const BIAS_PULL_UP = 1 << 8;
        const BIAS_PULL_DOWN = 1 << 9;
        const BIAS_DISABLED = 1 << 10;
        const EVENT_CLOCK_REALTIME = 1 << 11;
        const EVENT_CLOCK_HTE = 1 << 12;
    }
}

/// Information about a GPIO chip.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct gpiochip_info {
    /// Kernel name of the chip, e.g. `gpiochip0`
    pub name: [libc::c_char; GPIO_MAX_NAME_SIZE],
    /// Functional label of the chip, e.g. `pinctrl-bcm2711`
    pub label: [libc::c_char; GPIO_MAX_NAME_SIZE],
    /// Number of lines on the chip
    pub lines: u32,
}

/// Values of the lines of a request.
#[repr(C, align(8))]
#[derive(Debug, Clone, Copy, Default)]
pub struct gpio_v2_line_values {
    /// Bit `n` holds the logical value of the `n`th requested line
    pub bits: u64,
    /// Bit `n` selects the `n`th requested line
    pub mask: u64,
}

/// Payload of a [`gpio_v2_line_attribute`], selected by its `id`.
#[repr(C, align(8))]
#[derive(Clone, Copy)]
pub union gpio_v2_line_attribute_value {
    /// Line flags, for [`GPIO_V2_LINE_ATTR_ID_FLAGS`]
    pub flags: u64,
    /// Output values bitmap, for [`GPIO_V2_LINE_ATTR_ID_OUTPUT_VALUES`]
    pub values: u64,
    /// Debounce period in microseconds, for [`GPIO_V2_LINE_ATTR_ID_DEBOUNCE`]
    pub debounce_period_us: u32,
}

/// A configurable attribute of a line.
#[repr(C, align(8))]
#[derive(Clone, Copy)]
pub struct gpio_v2_line_attribute {
    /// One of the `GPIO_V2_LINE_ATTR_ID_*` constants
    pub id: u32,
    pub padding: u32,
    pub value: gpio_v2_line_attribute_value,
}

impl std::fmt::Debug for gpio_v2_line_attribute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // SAFETY: every variant is plain integer data and the union is
        // always fully initialised through `zeroed()` before use.
        let raw = unsafe { self.value.values };
        f.debug_struct("gpio_v2_line_attribute")
            .field("id", &self.id)
            .field("value", &format_args!("{raw:#x}"))
            .finish()
    }
}

/// A configuration attribute associated with one or more requested lines.
#[repr(C, align(8))]
#[derive(Debug, Clone, Copy)]
pub struct gpio_v2_line_config_attribute {
    pub attr: gpio_v2_line_attribute,
    /// Bit `n` selects the `n`th line of the request
    pub mask: u64,
}

/// Configuration for a set of requested lines.
#[repr(C, align(8))]
#[derive(Debug, Clone, Copy)]
pub struct gpio_v2_line_config {
    /// Flags for lines not covered by a flags attribute
    pub flags: u64,
    /// Number of valid entries in `attrs`
    pub num_attrs: u32,
    pub padding: [u32; 5],
    pub attrs: [gpio_v2_line_config_attribute; GPIO_V2_LINE_NUM_ATTRS_MAX],
}

/// Request for a set of lines.
#[repr(C, align(8))]
#[derive(Debug, Clone, Copy)]
pub struct gpio_v2_line_request {
    /// Offsets of the requested lines on the chip
    pub offsets: [u32; GPIO_V2_LINES_MAX],
    /// NUL-terminated consumer label
    pub consumer: [libc::c_char; GPIO_MAX_NAME_SIZE],
    pub config: gpio_v2_line_config,
    /// Number of valid entries in `offsets`
    pub num_lines: u32,
    /// Suggested kernel event buffer size, 0 for the kernel default
    pub event_buffer_size: u32,
    pub padding: [u32; 5],
    /// Set by the kernel on success: the line request file descriptor
    pub fd: i32,
}

/// Information about a certain GPIO line.
#[repr(C, align(8))]
#[derive(Debug, Clone, Copy)]
pub struct gpio_v2_line_info {
    pub name: [libc::c_char; GPIO_MAX_NAME_SIZE],
    pub consumer: [libc::c_char; GPIO_MAX_NAME_SIZE],
    /// Offset of the line; fill in before the ioctl
    pub offset: u32,
    pub num_attrs: u32,
    pub flags: u64,
    pub attrs: [gpio_v2_line_attribute; GPIO_V2_LINE_NUM_ATTRS_MAX],
    pub padding: [u32; 4],
}

/// An edge event as read from a line request file descriptor.
#[repr(C, align(8))]
#[derive(Debug, Clone, Copy, Default)]
pub struct gpio_v2_line_event {
    /// Best estimate of the event time, CLOCK_MONOTONIC by default
    pub timestamp_ns: u64,
    /// [`GPIO_V2_LINE_EVENT_RISING_EDGE`] or [`GPIO_V2_LINE_EVENT_FALLING_EDGE`]
    pub id: u32,
    /// Offset of the line that triggered the event
    pub offset: u32,
    /// Sequence number across all lines of the request
    pub seqno: u32,
    /// Sequence number for this line
    pub line_seqno: u32,
    pub padding: [u32; 6],
}

/// Byte offsets of the fields of [`gpio_v2_line_event`].
pub mod event_layout {
    pub const TIMESTAMP_NS: usize = 0;
    pub const ID: usize = 8;
    pub const OFFSET: usize = 12;
    pub const SEQNO: usize = 16;
    pub const LINE_SEQNO: usize = 20;
    /// Total record size
    pub const SIZE: usize = 48;
}

macro_rules! zeroed_ctor {
    ($($ty:ty),* $(,)?) => {
        $(
            impl $ty {
                /// An all-zero instance, the starting point for every ioctl argument.
                pub fn zeroed() -> Self {
                    // SAFETY: the type consists solely of integers, integer
                    // arrays and unions of integers; all-zero is valid.
                    unsafe { std::mem::zeroed() }
                }
            }
        )*
    };
}

zeroed_ctor!(
    gpiochip_info,
    gpio_v2_line_attribute,
    gpio_v2_line_config_attribute,
    gpio_v2_line_config,
    gpio_v2_line_request,
    gpio_v2_line_info,
);

ioctl_read!(gpio_get_chipinfo_ioctl, 0xB4, 0x01, gpiochip_info);
ioctl_readwrite!(gpio_v2_get_lineinfo_ioctl, 0xB4, 0x05, gpio_v2_line_info);
ioctl_readwrite!(gpio_v2_get_line_ioctl, 0xB4, 0x07, gpio_v2_line_request);
ioctl_readwrite!(gpio_v2_line_set_config_ioctl, 0xB4, 0x0D, gpio_v2_line_config);
ioctl_readwrite!(gpio_v2_line_get_values_ioctl, 0xB4, 0x0E, gpio_v2_line_values);
ioctl_readwrite!(gpio_v2_line_set_values_ioctl, 0xB4, 0x0F, gpio_v2_line_values);

const _: () = assert!(std::mem::size_of::<gpiochip_info>() == 68);
const _: () = assert!(std::mem::size_of::<gpio_v2_line_values>() == 16);
const _: () = assert!(std::mem::size_of::<gpio_v2_line_attribute>() == 16);
const _: () = assert!(std::mem::size_of::<gpio_v2_line_config_attribute>() == 24);
const _: () = assert!(std::mem::size_of::<gpio_v2_line_config>() == 272);
const _: () = assert!(std::mem::size_of::<gpio_v2_line_request>() == 592);
const _: () = assert!(std::mem::size_of::<gpio_v2_line_info>() == 256);
const _: () = assert!(std::mem::size_of::<gpio_v2_line_event>() == event_layout::SIZE);

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::offset_of;

    #[test]
    fn test_event_field_offsets() {
        assert_eq!(
            offset_of!(gpio_v2_line_event, timestamp_ns),
            event_layout::TIMESTAMP_NS
        );
        assert_eq!(offset_of!(gpio_v2_line_event, id), event_layout::ID);
        assert_eq!(offset_of!(gpio_v2_line_event, offset), event_layout::OFFSET);
        assert_eq!(offset_of!(gpio_v2_line_event, seqno), event_layout::SEQNO);
        assert_eq!(
            offset_of!(gpio_v2_line_event, line_seqno),
            event_layout::LINE_SEQNO
        );
    }

    #[test]
    fn test_request_field_offsets() {
        assert_eq!(offset_of!(gpio_v2_line_request, consumer), 256);
        assert_eq!(offset_of!(gpio_v2_line_request, config), 288);
        assert_eq!(offset_of!(gpio_v2_line_request, num_lines), 560);
        assert_eq!(offset_of!(gpio_v2_line_request, fd), 588);
    }

    #[test]
    fn test_debounce_shares_low_bytes_of_union() {
        let mut attr = gpio_v2_line_attribute::zeroed();
        attr.value.debounce_period_us = 5000;
        // SAFETY: written above, union is fully zero-initialised
        let debounce = unsafe { attr.value.debounce_period_us };
        assert_eq!(debounce, 5000);
        assert_eq!(offset_of!(gpio_v2_line_attribute, value), 8);
    }

    #[test]
    fn test_flag_bits_match_uapi() {
        assert_eq!(GPIO_V2_LINE_FLAG::OUTPUT.bits(), 0x8);
        assert_eq!(GPIO_V2_LINE_FLAG::BIAS_DISABLED.bits(), 0x400);
        assert_eq!(GPIO_V2_LINE_FLAG::EDGE_FALLING.bits(), 0x20);
    }
}
