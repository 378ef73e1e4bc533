//! Acquired line handles.
//!
//! A [`LineHandle`] wraps the anonymous file descriptor the kernel returns
//! for a successful line request. The descriptor is closed exactly once,
//! when the handle is dropped.

use std::fs::File;
use std::io::Read;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};

use gpio_sys::{gpio_v2_line_get_values_ioctl, gpio_v2_line_set_values_ioctl, gpio_v2_line_values};
use tracing::{debug, trace};

use crate::error::{GpioError, Result};

/// Lines acquired from a chip by one request.
///
/// Values are addressed by bitmask over the request positions: bit `n`
/// refers to the `n`th offset of the request.
pub struct LineHandle {
    file: File,
    offsets: Vec<u32>,
}

impl LineHandle {
    /// Wrap a line request file descriptor.
    pub fn new(fd: OwnedFd, offsets: Vec<u32>) -> Self {
        debug!(fd = fd.as_raw_fd(), offsets = ?offsets, "Acquired line handle");
        Self {
            file: File::from(fd),
            offsets,
        }
    }

    /// Offsets of the acquired lines, in request order.
    pub fn offsets(&self) -> &[u32] {
        &self.offsets
    }

    /// Number of acquired lines.
    pub fn num_lines(&self) -> usize {
        self.offsets.len()
    }

    /// Request position of a chip offset, if it is part of this request.
    pub fn position_of(&self, offset: u32) -> Option<usize> {
        self.offsets.iter().position(|&o| o == offset)
    }

    /// Read the logical values of the lines selected by `mask`.
    pub fn get_values(&self, mask: u32) -> Result<u32> {
        let mut values = gpio_v2_line_values {
            bits: 0,
            mask: u64::from(mask),
        };
        // SAFETY: the descriptor is a live line request fd owned by self and
        // `values` is a valid gpio_v2_line_values.
        unsafe { gpio_v2_line_get_values_ioctl(self.file.as_raw_fd(), &mut values) }
            .map_err(GpioError::ioctl("GPIO_V2_LINE_GET_VALUES"))?;

        // Only the low 32 request positions are addressable through a u32 mask.
        let bits = (values.bits & values.mask) as u32;
        trace!(mask, bits, "Read line values");
        Ok(bits)
    }

    /// Drive the lines selected by `mask` to the logical values in `bits`.
    pub fn set_values(&self, mask: u32, bits: u32) -> Result<()> {
        let mut values = gpio_v2_line_values {
            bits: u64::from(bits & mask),
            mask: u64::from(mask),
        };
        // SAFETY: as in get_values
        unsafe { gpio_v2_line_set_values_ioctl(self.file.as_raw_fd(), &mut values) }
            .map_err(GpioError::ioctl("GPIO_V2_LINE_SET_VALUES"))?;

        trace!(mask, bits, "Set line values");
        Ok(())
    }

    /// Read one raw record from the descriptor into `buf`.
    pub(crate) fn read_record(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        (&self.file).read(buf)
    }

    /// Close the handle, releasing the lines back to the kernel.
    pub fn close(self) {
        drop(self);
    }
}

impl From<OwnedFd> for LineHandle {
    fn from(fd: OwnedFd) -> Self {
        Self::new(fd, Vec::new())
    }
}

impl AsFd for LineHandle {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

impl AsRawFd for LineHandle {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

impl Drop for LineHandle {
    fn drop(&mut self) {
        debug!(fd = self.file.as_raw_fd(), offsets = ?self.offsets, "Closing line handle");
    }
}

impl std::fmt::Debug for LineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LineHandle")
            .field("fd", &self.file.as_raw_fd())
            .field("offsets", &self.offsets)
            .finish()
    }
}
