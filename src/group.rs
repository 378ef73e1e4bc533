//! Named line groups.
//!
//! A [`LineGroup`] requests a set of named lines, each described by a
//! [`LineConfig`], and addresses them by name afterwards. Lines with equal
//! settings share one attribute entry, see [`AttributeSet`].

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::attribute::{AttributeDescriptor, AttributeKind, Bias, Drive, MAX_ATTRIBUTES};
use crate::chip::{ChipInterface, GpioChip, LineInfo};
use crate::error::{GpioError, Result};
use crate::event::LineEvent;
use crate::lines::{request_lines, ActiveRequest};
use crate::observer::StreamTermination;
use crate::request::MAX_LINES;

/// A line, by chip offset or by name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Pin {
    /// Chip offset
    Offset(u32),
    /// Line name, as reported in line info
    Name(String),
}

impl From<u32> for Pin {
    fn from(offset: u32) -> Self {
        Self::Offset(offset)
    }
}

impl From<&str> for Pin {
    fn from(name: &str) -> Self {
        Self::Name(name.to_string())
    }
}

impl std::fmt::Display for Pin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Offset(offset) => write!(f, "{offset}"),
            Self::Name(name) => write!(f, "'{name}'"),
        }
    }
}

/// Settings of an input line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputConfig {
    /// The line
    pub pin: Pin,
    /// Invert the logical value
    #[serde(default)]
    pub active_low: bool,
    /// Pull resistor
    #[serde(default)]
    pub bias: Bias,
    /// Report rising edges
    #[serde(default)]
    pub rising_edge: bool,
    /// Report falling edges
    #[serde(default)]
    pub falling_edge: bool,
    /// Debounce period in microseconds
    #[serde(default)]
    pub debounce_us: Option<u32>,
}

impl InputConfig {
    /// An input with no bias, no edge detection and no debounce.
    pub fn new(pin: impl Into<Pin>) -> Self {
        Self {
            pin: pin.into(),
            active_low: false,
            bias: Bias::default(),
            rising_edge: false,
            falling_edge: false,
            debounce_us: None,
        }
    }

    /// Invert the logical value.
    pub fn active_low(mut self) -> Self {
        self.active_low = true;
        self
    }

    /// Set the pull resistor.
    pub fn with_bias(mut self, bias: Bias) -> Self {
        self.bias = bias;
        self
    }

    /// Report rising edges.
    pub fn rising_edge(mut self) -> Self {
        self.rising_edge = true;
        self
    }

    /// Report falling edges.
    pub fn falling_edge(mut self) -> Self {
        self.falling_edge = true;
        self
    }

    /// Report both edges.
    pub fn both_edges(self) -> Self {
        self.rising_edge().falling_edge()
    }

    /// Debounce the line, period in microseconds.
    pub fn with_debounce(mut self, period_us: u32) -> Self {
        self.debounce_us = Some(period_us);
        self
    }
}

/// Settings of an output line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputConfig {
    /// The line
    pub pin: Pin,
    /// Invert the logical value
    #[serde(default)]
    pub active_low: bool,
    /// Drive mode
    #[serde(default)]
    pub drive: Drive,
    /// Value driven at acquisition, kernel default if unset
    #[serde(default)]
    pub initial_value: Option<bool>,
    /// Value driven when the group is closed
    #[serde(default)]
    pub final_value: Option<bool>,
}

impl OutputConfig {
    /// A push-pull output with no initial or final value.
    pub fn new(pin: impl Into<Pin>) -> Self {
        Self {
            pin: pin.into(),
            active_low: false,
            drive: Drive::default(),
            initial_value: None,
            final_value: None,
        }
    }

    /// Invert the logical value.
    pub fn active_low(mut self) -> Self {
        self.active_low = true;
        self
    }

    /// Set the drive mode.
    pub fn with_drive(mut self, drive: Drive) -> Self {
        self.drive = drive;
        self
    }

    /// Value to drive at acquisition.
    pub fn initial_value(mut self, value: bool) -> Self {
        self.initial_value = Some(value);
        self
    }

    /// Value to drive when the group is closed.
    pub fn final_value(mut self, value: bool) -> Self {
        self.final_value = Some(value);
        self
    }
}

/// Definition of one line of a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "direction", rename_all = "lowercase")]
pub enum LineConfig {
    /// `direction = "input"`
    Input(InputConfig),
    /// `direction = "output"`
    Output(OutputConfig),
}

impl LineConfig {
    /// The configured line.
    pub fn pin(&self) -> &Pin {
        match self {
            Self::Input(cfg) => &cfg.pin,
            Self::Output(cfg) => &cfg.pin,
        }
    }

    /// True for an output line.
    pub fn is_output(&self) -> bool {
        matches!(self, Self::Output(_))
    }
}

impl From<InputConfig> for LineConfig {
    fn from(cfg: InputConfig) -> Self {
        Self::Input(cfg)
    }
}

impl From<OutputConfig> for LineConfig {
    fn from(cfg: OutputConfig) -> Self {
        Self::Output(cfg)
    }
}

/// Attribute entries for a group, merged by settings.
///
/// Each line contributes its request position to the mask of the entry
/// matching its settings, creating the entry on first use.
#[derive(Debug, Clone, Default)]
pub struct AttributeSet {
    attrs: Vec<AttributeDescriptor>,
}

impl AttributeSet {
    /// An empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the attributes of the line at request `position`.
    pub fn add_line(&mut self, position: usize, config: &LineConfig) -> Result<()> {
        if position >= MAX_LINES {
            return Err(GpioError::TooManyLines {
                requested: position + 1,
                max: MAX_LINES,
            });
        }
        let bit = 1u32 << position;

        match config {
            LineConfig::Output(cfg) => {
                if let Some(value) = cfg.initial_value {
                    let entry = self.entry(AttributeDescriptor::output_values(0, 0))?;
                    entry.mask |= bit;
                    if value {
                        entry.values |= bit;
                    }
                }

                let mut flags = AttributeDescriptor::flags(0).output().with_drive(cfg.drive);
                flags.active_low = cfg.active_low;
                self.entry(flags)?.mask |= bit;
            }
            LineConfig::Input(cfg) => {
                if let Some(period) = cfg.debounce_us.filter(|&p| p > 0) {
                    self.entry(AttributeDescriptor::debounce(0, period))?.mask |= bit;
                }

                let flags = AttributeDescriptor {
                    active_low: cfg.active_low,
                    bias: cfg.bias.code(),
                    rising_edge: cfg.rising_edge,
                    falling_edge: cfg.falling_edge,
                    ..AttributeDescriptor::flags(0)
                };
                self.entry(flags)?.mask |= bit;
            }
        }
        Ok(())
    }

    /// The entry with the same settings as `template`, created if missing.
    fn entry(&mut self, template: AttributeDescriptor) -> Result<&mut AttributeDescriptor> {
        match self.attrs.iter().position(|a| same_settings(a, &template)) {
            Some(index) => Ok(&mut self.attrs[index]),
            None => {
                if self.attrs.len() >= MAX_ATTRIBUTES {
                    return Err(GpioError::TooManyAttributes {
                        requested: self.attrs.len() + 1,
                        max: MAX_ATTRIBUTES,
                    });
                }
                self.attrs.push(template);
                let last = self.attrs.len() - 1;
                Ok(&mut self.attrs[last])
            }
        }
    }

    /// Number of attribute entries.
    pub fn len(&self) -> usize {
        self.attrs.len()
    }

    /// True if no line has been added.
    pub fn is_empty(&self) -> bool {
        self.attrs.is_empty()
    }

    /// The entries, in creation order.
    pub fn descriptors(&self) -> &[AttributeDescriptor] {
        &self.attrs
    }

    /// Take the entries for a request.
    pub fn into_descriptors(self) -> Vec<AttributeDescriptor> {
        self.attrs
    }
}

/// Equal apart from the per-line data (`mask`, `values`).
fn same_settings(a: &AttributeDescriptor, b: &AttributeDescriptor) -> bool {
    if a.kind != b.kind {
        return false;
    }
    match AttributeKind::try_from(a.kind) {
        Ok(AttributeKind::Flags) => {
            a.active_low == b.active_low
                && a.output == b.output
                && a.drive == b.drive
                && a.bias == b.bias
                && a.rising_edge == b.rising_edge
                && a.falling_edge == b.falling_edge
        }
        Ok(AttributeKind::OutputValues) => true,
        Ok(AttributeKind::Debounce) => a.debounce == b.debounce,
        Err(_) => false,
    }
}

/// An edge event, resolved to the line's name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LineChange {
    /// Name of the line in the group
    pub name: String,
    /// Chip offset
    pub offset: u32,
    /// True for a rising edge
    pub rising_edge: bool,
    /// The underlying event
    pub event: LineEvent,
}

#[derive(Debug, Clone)]
struct GroupLine {
    position: usize,
    offset: u32,
    output: bool,
    final_value: Option<bool>,
}

/// A requested set of named lines.
///
/// Dropping the group closes it.
#[derive(Debug)]
pub struct LineGroup {
    consumer: String,
    lines: HashMap<String, GroupLine>,
    request: ActiveRequest,
    closed: bool,
}

impl LineGroup {
    /// Request `lines` from `chip`, routing edge events to `on_change`.
    ///
    /// Lines are placed in the request in iteration order. Pins given by
    /// name are looked up in the chip's line table.
    pub fn request<C, I, F>(chip: &C, consumer: &str, lines: I, on_change: F) -> Result<Self>
    where
        C: ChipInterface + ?Sized,
        I: IntoIterator<Item = (String, LineConfig)>,
        F: FnMut(LineChange) + Send + 'static,
    {
        let lines: Vec<(String, LineConfig)> = lines.into_iter().collect();
        if lines.len() > MAX_LINES {
            return Err(GpioError::TooManyLines {
                requested: lines.len(),
                max: MAX_LINES,
            });
        }

        let line_cnt = chip.chip_info()?.line_cnt;
        let mut table: Option<Vec<LineInfo>> = None;
        let mut attrs = AttributeSet::new();
        let mut offsets = Vec::with_capacity(lines.len());
        let mut group_lines = HashMap::with_capacity(lines.len());

        for (position, (name, config)) in lines.iter().enumerate() {
            let offset = match config.pin() {
                Pin::Offset(offset) => *offset,
                Pin::Name(pin) => {
                    if table.is_none() {
                        table = Some(chip.lines()?);
                    }
                    table
                        .iter()
                        .flatten()
                        .find(|line| &line.name == pin)
                        .map(|line| line.offset)
                        .ok_or_else(|| GpioError::UnknownLine { name: pin.clone() })?
                }
            };
            if offset >= line_cnt {
                return Err(GpioError::InvalidOffset {
                    offset,
                    max: line_cnt,
                });
            }

            attrs.add_line(position, config)?;
            offsets.push(offset);

            let final_value = match config {
                LineConfig::Output(cfg) => cfg.final_value,
                LineConfig::Input(_) => None,
            };
            group_lines.insert(
                name.clone(),
                GroupLine {
                    position,
                    offset,
                    output: config.is_output(),
                    final_value,
                },
            );
        }

        let names: HashMap<u32, String> = group_lines
            .iter()
            .map(|(name, line)| (line.offset, name.clone()))
            .collect();
        let mut on_change = on_change;
        let route = move |event: LineEvent| match names.get(&event.offset) {
            Some(name) => on_change(LineChange {
                name: name.clone(),
                offset: event.offset,
                rising_edge: event.rising_edge(),
                event,
            }),
            None => warn!(offset = event.offset, "Event for a line outside the group"),
        };

        let request = request_lines(
            chip,
            consumer,
            &offsets,
            &attrs.into_descriptors(),
            route,
        )?;
        info!(consumer, lines = group_lines.len(), "Line group requested");

        Ok(Self {
            consumer: consumer.to_string(),
            lines: group_lines,
            request,
            closed: false,
        })
    }

    /// Names of the lines in the group.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.lines.keys().map(String::as_str)
    }

    /// Chip offset of a line.
    pub fn offset(&self, name: &str) -> Result<u32> {
        Ok(self.line(name)?.offset)
    }

    fn line(&self, name: &str) -> Result<&GroupLine> {
        self.lines.get(name).ok_or_else(|| GpioError::UnknownLine {
            name: name.to_string(),
        })
    }

    /// Current logical value of a line.
    pub fn value(&self, name: &str) -> Result<bool> {
        let mask = 1u32 << self.line(name)?.position;
        Ok(self.request.get_values(mask)? != 0)
    }

    /// Drive an output line.
    pub fn set_value(&self, name: &str, value: bool) -> Result<()> {
        let line = self.line(name)?;
        if !line.output {
            return Err(GpioError::NotAnOutput {
                name: name.to_string(),
            });
        }
        let mask = 1u32 << line.position;
        self.request
            .set_values(mask, if value { mask } else { 0 })
    }

    /// True once [`close`](Self::close) has run.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Drive final values and release the lines. Idempotent.
    ///
    /// The lines are released even if the final values cannot be written;
    /// that error is returned afterwards.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let (mask, bits) = self
            .lines
            .values()
            .filter_map(|line| line.final_value.map(|v| (line.position, v)))
            .fold((0u32, 0u32), |(mask, bits), (position, value)| {
                let bit = 1u32 << position;
                (mask | bit, if value { bits | bit } else { bits })
            });

        let result = if mask != 0 {
            debug!(consumer = %self.consumer, mask, bits, "Driving final values");
            self.request.set_values(mask, bits)
        } else {
            Ok(())
        };

        self.request.release();
        info!(consumer = %self.consumer, "Line group closed");
        result
    }

    /// Close the group and wait until the lines are handed back.
    pub async fn shutdown(mut self) -> Result<Option<StreamTermination>> {
        let result = self.close();
        let termination = self.request.wait().await;
        result.map(|()| termination)
    }

    /// Wait for the event stream to end.
    pub async fn wait(&self) -> Option<StreamTermination> {
        self.request.wait().await
    }
}

impl Drop for LineGroup {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(consumer = %self.consumer, error = %e, "Failed to drive final values on drop");
        }
    }
}

/// Check that a line falls back to input once released.
///
/// The line must be unused and an input. It is requested as an output, the
/// chip is closed and reopened, and the line must read back as an input.
pub async fn check_fallback(chip_path: impl AsRef<Path>, pin: Pin) -> Result<()> {
    let chip_path = chip_path.as_ref();
    let chip = GpioChip::open(chip_path)?;
    let offset = match &pin {
        Pin::Offset(offset) => *offset,
        Pin::Name(name) => chip.find_line(name)?,
    };

    let before = chip.line_info(offset)?;
    if before.flags.used {
        return Err(GpioError::FallbackCheckFailed {
            message: format!("line {pin} is in use by '{}'", before.consumer),
        });
    }
    if !before.flags.input {
        return Err(GpioError::FallbackCheckFailed {
            message: format!("line {pin} is not an input"),
        });
    }

    let group = LineGroup::request(
        &chip,
        "output-test",
        [("out".to_string(), LineConfig::from(OutputConfig::new(offset)))],
        |_| {},
    )?;
    group.shutdown().await?;
    drop(chip);

    let chip = GpioChip::open(chip_path)?;
    let after = chip.line_info(offset)?;
    if !after.flags.input {
        return Err(GpioError::FallbackCheckFailed {
            message: format!("line {pin} still is an output after close"),
        });
    }

    info!(chip = %chip_path.display(), offset, "Line falls back to input after close");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::LineFlags;

    #[test]
    fn test_outputs_share_entries() {
        let mut set = AttributeSet::new();
        set.add_line(0, &OutputConfig::new(4).initial_value(true).into())
            .unwrap();
        set.add_line(1, &OutputConfig::new(7).initial_value(false).into())
            .unwrap();

        let attrs = set.descriptors();
        assert_eq!(attrs.len(), 2);
        assert_eq!(attrs[0].kind, AttributeKind::OutputValues.to_raw());
        assert_eq!(attrs[0].mask, 0b11);
        assert_eq!(attrs[0].values, 0b01);
        assert_eq!(attrs[1].kind, AttributeKind::Flags.to_raw());
        assert_eq!(attrs[1].mask, 0b11);
        assert!(attrs[1].output);
    }

    #[test]
    fn test_different_settings_split_entries() {
        let mut set = AttributeSet::new();
        set.add_line(0, &InputConfig::new(1).rising_edge().into())
            .unwrap();
        set.add_line(1, &InputConfig::new(2).with_bias(Bias::PullUp).into())
            .unwrap();
        set.add_line(2, &InputConfig::new(3).rising_edge().into())
            .unwrap();

        let attrs = set.descriptors();
        assert_eq!(attrs.len(), 2);
        assert_eq!(attrs[0].mask, 0b101);
        assert_eq!(attrs[1].mask, 0b010);
        assert_eq!(
            attrs[1].encode().unwrap().mask(),
            0b010,
        );
    }

    #[test]
    fn test_debounce_keyed_by_period() {
        let mut set = AttributeSet::new();
        set.add_line(0, &InputConfig::new(1).with_debounce(100).into())
            .unwrap();
        set.add_line(1, &InputConfig::new(2).with_debounce(200).into())
            .unwrap();
        set.add_line(2, &InputConfig::new(3).with_debounce(100).into())
            .unwrap();

        let debounce: Vec<_> = set
            .descriptors()
            .iter()
            .filter(|a| a.kind == AttributeKind::Debounce.to_raw())
            .map(|a| (a.debounce, a.mask))
            .collect();
        assert_eq!(debounce, [(100, 0b101), (200, 0b010)]);
        // Same flags for all three lines
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn test_attribute_overflow() {
        // One shared flags entry plus nine distinct debounce periods
        let mut set = AttributeSet::new();
        for position in 0..9 {
            let cfg = InputConfig::new(position as u32).with_debounce(position as u32 + 1);
            set.add_line(position, &cfg.into()).unwrap();
        }
        assert_eq!(set.len(), 10);

        let err = set
            .add_line(9, &InputConfig::new(9).with_debounce(99).into())
            .unwrap_err();
        assert!(matches!(err, GpioError::TooManyAttributes { requested: 11, max: 10 }));

        // Settings already present still fit
        set.add_line(9, &InputConfig::new(9).with_debounce(3).into())
            .unwrap();
        assert_eq!(set.len(), 10);
    }

    #[test]
    fn test_encoded_group_flags() {
        let mut set = AttributeSet::new();
        set.add_line(
            0,
            &OutputConfig::new(0)
                .with_drive(Drive::OpenDrain)
                .active_low()
                .into(),
        )
        .unwrap();
        let encoded = set.descriptors()[0].encode().unwrap();
        assert_eq!(
            encoded,
            crate::attribute::EncodedAttribute::Flags {
                mask: 1,
                flags: LineFlags::ACTIVE_LOW | LineFlags::OUTPUT | LineFlags::OPEN_DRAIN,
            }
        );
    }

    #[test]
    fn test_line_config_toml() {
        #[derive(Deserialize)]
        struct Doc {
            lines: std::collections::BTreeMap<String, LineConfig>,
        }

        let doc: Doc = toml::from_str(
            r#"
            [lines.button]
            direction = "input"
            pin = "GPIO17"
            bias = "pull-up"
            falling_edge = true
            debounce_us = 5000

            [lines.led]
            direction = "output"
            pin = 4
            drive = "open-drain"
            initial_value = true
            final_value = false
            "#,
        )
        .unwrap();

        assert_eq!(
            doc.lines["button"],
            LineConfig::Input(
                InputConfig::new("GPIO17")
                    .with_bias(Bias::PullUp)
                    .falling_edge()
                    .with_debounce(5000)
            )
        );
        assert_eq!(
            doc.lines["led"],
            LineConfig::Output(
                OutputConfig::new(4)
                    .with_drive(Drive::OpenDrain)
                    .initial_value(true)
                    .final_value(false)
            )
        );
    }
}
