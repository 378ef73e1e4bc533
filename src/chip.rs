//! GPIO chip access.
//!
//! [`ChipInterface`] is the seam between line requests and the kernel: the
//! real implementation is [`GpioChip`], which owns an open
//! `/dev/gpiochipN` descriptor and issues the chip ioctls. Chip info is
//! queried once and cached; it cannot change while the chip is open. The
//! line table returned by [`ChipInterface::lines`] is cached the same way,
//! for name lookups; [`ChipInterface::line_info`] always asks the kernel.

use std::ffi::CStr;
use std::fs::File;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::{Path, PathBuf};

use gpio_sys::{
    gpio_get_chipinfo_ioctl, gpio_v2_get_line_ioctl, gpio_v2_get_lineinfo_ioctl,
    gpio_v2_line_info, gpiochip_info, GPIO_V2_LINE_ATTR_ID_DEBOUNCE,
};
use nix::errno::Errno;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::attribute::LineFlags;
use crate::error::{GpioError, Result};
use crate::handle::LineHandle;
use crate::request::LineRequest;

/// Static information about a chip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChipInfo {
    /// Kernel name, e.g. `gpiochip0`
    pub name: String,
    /// Functional label, e.g. `pinctrl-bcm2711`
    pub label: String,
    /// Number of lines on the chip
    pub line_cnt: u32,
}

/// Line state flags as reported by the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct LineInfoFlags {
    /// Held by a consumer
    pub used: bool,
    /// Logical value is inverted
    pub active_low: bool,
    /// Input direction
    pub input: bool,
    /// Output direction
    pub output: bool,
    /// Pull-up enabled
    pub pull_up: bool,
    /// Pull-down enabled
    pub pull_down: bool,
    /// Bias explicitly disabled
    pub bias_disabled: bool,
    /// Open-drain output
    pub open_drain: bool,
    /// Open-source output
    pub open_source: bool,
    /// Rising edge detection enabled
    pub rising_edge: bool,
    /// Falling edge detection enabled
    pub falling_edge: bool,
}

impl From<LineFlags> for LineInfoFlags {
    fn from(flags: LineFlags) -> Self {
        Self {
            used: flags.contains(LineFlags::USED),
            active_low: flags.contains(LineFlags::ACTIVE_LOW),
            input: flags.contains(LineFlags::INPUT),
            output: flags.contains(LineFlags::OUTPUT),
            pull_up: flags.contains(LineFlags::BIAS_PULL_UP),
            pull_down: flags.contains(LineFlags::BIAS_PULL_DOWN),
            bias_disabled: flags.contains(LineFlags::BIAS_DISABLED),
            open_drain: flags.contains(LineFlags::OPEN_DRAIN),
            open_source: flags.contains(LineFlags::OPEN_SOURCE),
            rising_edge: flags.contains(LineFlags::EDGE_RISING),
            falling_edge: flags.contains(LineFlags::EDGE_FALLING),
        }
    }
}

/// Static information about one line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LineInfo {
    /// Offset on the chip
    pub offset: u32,
    /// Line name, empty if unnamed
    pub name: String,
    /// Label of the current holder, empty if unused
    pub consumer: String,
    /// Direction, bias, drive and edge state
    pub flags: LineInfoFlags,
    /// Debounce period, if the line is debounced
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debounce_period_us: Option<u32>,
}

impl LineInfo {
    fn from_raw(raw: &gpio_v2_line_info) -> Self {
        let debounce_period_us = raw
            .attrs
            .iter()
            .take(raw.num_attrs as usize)
            .find(|attr| attr.id == GPIO_V2_LINE_ATTR_ID_DEBOUNCE)
            // SAFETY: the debounce id selects the debounce member
            .map(|attr| unsafe { attr.value.debounce_period_us });

        Self {
            offset: raw.offset,
            name: c_name(&raw.name),
            consumer: c_name(&raw.consumer),
            flags: LineFlags::from_bits_truncate(raw.flags).into(),
            debounce_period_us,
        }
    }
}

/// Operations on a chip that line requests depend on.
pub trait ChipInterface {
    /// Query name, label and line count.
    fn chip_info(&self) -> Result<ChipInfo>;

    /// Query the state of one line.
    fn line_info(&self, offset: u32) -> Result<LineInfo>;

    /// Submit a line request. This is the only call that acquires lines.
    fn acquire(&self, request: LineRequest) -> Result<LineHandle>;

    /// Every line of the chip, in offset order.
    ///
    /// Implementations may cache the table; use [`line_info`](Self::line_info)
    /// for the current state of a line.
    fn lines(&self) -> Result<Vec<LineInfo>> {
        let info = self.chip_info()?;
        (0..info.line_cnt).map(|offset| self.line_info(offset)).collect()
    }

    /// Find the offset of a line by name.
    fn find_line(&self, name: &str) -> Result<u32> {
        self.lines()?
            .into_iter()
            .find(|line| line.name == name)
            .map(|line| line.offset)
            .ok_or_else(|| GpioError::UnknownLine {
                name: name.to_string(),
            })
    }
}

/// An open GPIO chip character device.
pub struct GpioChip {
    file: File,
    path: PathBuf,
    info: RwLock<Option<ChipInfo>>,
    lines: RwLock<Option<Vec<LineInfo>>>,
}

impl GpioChip {
    /// Open a chip by path, e.g. `/dev/gpiochip0`.
    ///
    /// # Errors
    ///
    /// Returns [`GpioError::ChipOpen`] if the device cannot be opened (not
    /// found, no permissions, etc.); use [`GpioError::is_not_found`] and
    /// friends to tell them apart.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| GpioError::ChipOpen {
            path: path.display().to_string(),
            source: e.raw_os_error().map_or(Errno::UnknownErrno, Errno::from_raw),
        })?;

        info!(path = %path.display(), "Opened GPIO chip");
        Ok(Self {
            file,
            path: path.to_path_buf(),
            info: RwLock::new(None),
            lines: RwLock::new(None),
        })
    }

    /// Path used to open this chip.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn query_chip_info(&self) -> Result<ChipInfo> {
        let mut raw = gpiochip_info::zeroed();
        // SAFETY: the descriptor is an open chip owned by self and `raw` is
        // a valid gpiochip_info.
        unsafe { gpio_get_chipinfo_ioctl(self.file.as_raw_fd(), &mut raw) }
            .map_err(GpioError::ioctl("GPIO_GET_CHIPINFO"))?;

        Ok(ChipInfo {
            name: c_name(&raw.name),
            label: c_name(&raw.label),
            line_cnt: raw.lines,
        })
    }
}

impl ChipInterface for GpioChip {
    fn chip_info(&self) -> Result<ChipInfo> {
        if let Some(info) = self.info.read().as_ref() {
            return Ok(info.clone());
        }
        let info = self.query_chip_info()?;
        *self.info.write() = Some(info.clone());
        Ok(info)
    }

    fn line_info(&self, offset: u32) -> Result<LineInfo> {
        let line_cnt = self.chip_info()?.line_cnt;
        if offset >= line_cnt {
            return Err(GpioError::InvalidOffset {
                offset,
                max: line_cnt,
            });
        }

        let mut raw = gpio_v2_line_info::zeroed();
        raw.offset = offset;
        // SAFETY: as in query_chip_info
        unsafe { gpio_v2_get_lineinfo_ioctl(self.file.as_raw_fd(), &mut raw) }
            .map_err(GpioError::ioctl("GPIO_V2_GET_LINEINFO"))?;

        Ok(LineInfo::from_raw(&raw))
    }

    fn lines(&self) -> Result<Vec<LineInfo>> {
        if let Some(lines) = self.lines.read().as_ref() {
            return Ok(lines.clone());
        }
        let line_cnt = self.chip_info()?.line_cnt;
        let lines = (0..line_cnt)
            .map(|offset| self.line_info(offset))
            .collect::<Result<Vec<_>>>()?;
        debug!(path = %self.path.display(), lines = lines.len(), "Cached line table");
        *self.lines.write() = Some(lines.clone());
        Ok(lines)
    }

    fn acquire(&self, request: LineRequest) -> Result<LineHandle> {
        let mut raw = request.to_raw();
        // SAFETY: as in query_chip_info; the kernel writes `fd` on success.
        unsafe { gpio_v2_get_line_ioctl(self.file.as_raw_fd(), &mut raw) }.map_err(|source| {
            warn!(
                path = %self.path.display(),
                offsets = ?request.offsets(),
                error = %source,
                "Line request rejected"
            );
            GpioError::AcquisitionFailed { source }
        })?;

        // SAFETY: on success the kernel hands us a fresh descriptor that
        // nothing else owns.
        let fd = unsafe { OwnedFd::from_raw_fd(raw.fd) };
        Ok(LineHandle::new(fd, request.offsets().to_vec()))
    }
}

impl Drop for GpioChip {
    fn drop(&mut self) {
        debug!(path = %self.path.display(), "Closing GPIO chip");
    }
}

impl std::fmt::Debug for GpioChip {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpioChip")
            .field("path", &self.path)
            .field("fd", &self.file.as_raw_fd())
            .finish()
    }
}

/// List the GPIO chip devices under `/dev`, sorted by path.
pub fn chips() -> Result<Vec<PathBuf>> {
    chips_in(Path::new("/dev"))
}

fn chips_in(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_name().to_string_lossy().starts_with("gpiochip") {
            found.push(entry.path());
        }
    }
    found.sort();
    Ok(found)
}

/// Convert a NUL-terminated kernel name field.
fn c_name(raw: &[libc::c_char]) -> String {
    let bytes: Vec<u8> = raw.iter().map(|&c| c as u8).collect();
    match CStr::from_bytes_until_nul(&bytes) {
        Ok(name) => name.to_string_lossy().into_owned(),
        Err(_) => String::from_utf8_lossy(&bytes).into_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_name(s: &str) -> [libc::c_char; 32] {
        let mut raw = [0 as libc::c_char; 32];
        for (dst, b) in raw.iter_mut().zip(s.bytes()) {
            *dst = b as libc::c_char;
        }
        raw
    }

    #[test]
    fn test_c_name() {
        assert_eq!(c_name(&raw_name("gpiochip0")), "gpiochip0");
        assert_eq!(c_name(&raw_name("")), "");
        let full = [b'a' as libc::c_char; 32];
        assert_eq!(c_name(&full).len(), 32);
    }

    #[test]
    fn test_line_info_from_raw() {
        let mut raw = gpio_v2_line_info::zeroed();
        raw.name = raw_name("LED");
        raw.consumer = raw_name("blink");
        raw.offset = 17;
        raw.flags = (LineFlags::USED | LineFlags::OUTPUT | LineFlags::ACTIVE_LOW).bits();
        raw.num_attrs = 1;
        raw.attrs[0].id = GPIO_V2_LINE_ATTR_ID_DEBOUNCE;
        raw.attrs[0].value.debounce_period_us = 500;

        let info = LineInfo::from_raw(&raw);
        assert_eq!(info.offset, 17);
        assert_eq!(info.name, "LED");
        assert_eq!(info.consumer, "blink");
        assert!(info.flags.used && info.flags.output && info.flags.active_low);
        assert!(!info.flags.input && !info.flags.pull_up);
        assert_eq!(info.debounce_period_us, Some(500));
    }

    #[test]
    fn test_open_missing_chip() {
        let err = GpioChip::open("/nonexistent/gpiochip99").unwrap_err();
        assert!(err.is_not_found());
        assert!(matches!(err, GpioError::ChipOpen { .. }));
    }

    #[test]
    fn test_chips_in_filters_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["gpiochip1", "ttyS0", "gpiochip0"] {
            File::create(dir.path().join(name)).unwrap();
        }
        let found = chips_in(dir.path()).unwrap();
        let names: Vec<_> = found
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, ["gpiochip0", "gpiochip1"]);
    }

    #[test]
    fn test_chip_ioctl_on_regular_file_fails() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let chip = GpioChip::open(file.path()).unwrap();
        assert!(matches!(
            chip.chip_info(),
            Err(GpioError::Ioctl {
                op: "GPIO_GET_CHIPINFO",
                ..
            })
        ));
    }

    #[test]
    fn test_line_table_is_cached_but_line_info_is_not() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let chip = GpioChip::open(file.path()).unwrap();
        *chip.info.write() = Some(ChipInfo {
            name: "gpiochip0".to_string(),
            label: "sim".to_string(),
            line_cnt: 2,
        });
        let table: Vec<LineInfo> = ["", "LED"]
            .iter()
            .enumerate()
            .map(|(offset, name)| LineInfo {
                offset: offset as u32,
                name: name.to_string(),
                consumer: String::new(),
                flags: LineInfoFlags::default(),
                debounce_period_us: None,
            })
            .collect();
        *chip.lines.write() = Some(table.clone());

        // A regular file rejects the chip ioctls, so these come from the cache
        assert_eq!(chip.lines().unwrap(), table);
        assert_eq!(chip.find_line("LED").unwrap(), 1);
        assert!(matches!(
            chip.find_line("BUTTON"),
            Err(GpioError::UnknownLine { .. })
        ));

        assert!(matches!(
            chip.line_info(1),
            Err(GpioError::Ioctl {
                op: "GPIO_V2_GET_LINEINFO",
                ..
            })
        ));
        assert!(matches!(
            chip.line_info(2),
            Err(GpioError::InvalidOffset { offset: 2, max: 2 })
        ));
    }
}
