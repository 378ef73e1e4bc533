//! Line attribute descriptors and their kernel encoding.
//!
//! A line request carries up to [`MAX_ATTRIBUTES`] attribute entries. Each
//! entry applies to the request positions selected by its `mask` (bit `n`
//! selects the `n`th offset of the request, not offset `n`).
//!
//! [`AttributeDescriptor`] is the consumer-facing form, with a numeric
//! `type` discriminant so it can come straight from a configuration file.
//! [`encode`] turns it into an [`EncodedAttribute`], which maps one-to-one
//! onto the kernel's `gpio_v2_line_config_attribute`.

use gpio_sys::{
    gpio_v2_line_config_attribute, GPIO_V2_LINE_ATTR_ID_DEBOUNCE, GPIO_V2_LINE_ATTR_ID_FLAGS,
    GPIO_V2_LINE_ATTR_ID_OUTPUT_VALUES, GPIO_V2_LINE_FLAG, GPIO_V2_LINE_NUM_ATTRS_MAX,
};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{GpioError, Result};

/// Kernel line flag bits.
pub type LineFlags = GPIO_V2_LINE_FLAG;

/// Maximum number of attribute entries per request.
pub const MAX_ATTRIBUTES: usize = GPIO_V2_LINE_NUM_ATTRS_MAX;

/// Output drive mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Drive {
    /// Actively driven both high and low
    #[default]
    PushPull,
    /// Driven low only, high is left floating
    OpenDrain,
    /// Driven high only, low is left floating
    OpenSource,
}

impl Drive {
    /// Numeric code as carried by an [`AttributeDescriptor`].
    pub fn code(self) -> u32 {
        match self {
            Self::PushPull => 0,
            Self::OpenDrain => 1,
            Self::OpenSource => 2,
        }
    }
}

impl TryFrom<u32> for Drive {
    type Error = GpioError;

    fn try_from(code: u32) -> Result<Self> {
        match code {
            0 => Ok(Self::PushPull),
            1 => Ok(Self::OpenDrain),
            2 => Ok(Self::OpenSource),
            value => Err(GpioError::InvalidAttribute {
                field: "drive",
                value,
            }),
        }
    }
}

/// Input bias.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Bias {
    /// No pull resistor
    #[default]
    #[serde(alias = "none")]
    Disabled,
    /// Pull towards the supply
    PullUp,
    /// Pull towards ground
    PullDown,
}

impl Bias {
    /// Numeric code as carried by an [`AttributeDescriptor`].
    pub fn code(self) -> u32 {
        match self {
            Self::Disabled => 0,
            Self::PullUp => 1,
            Self::PullDown => 2,
        }
    }
}

impl TryFrom<u32> for Bias {
    type Error = GpioError;

    fn try_from(code: u32) -> Result<Self> {
        match code {
            0 => Ok(Self::Disabled),
            1 => Ok(Self::PullUp),
            2 => Ok(Self::PullDown),
            value => Err(GpioError::InvalidAttribute {
                field: "bias",
                value,
            }),
        }
    }
}

/// The `type` discriminant of an [`AttributeDescriptor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum AttributeKind {
    /// Line flags (direction, bias, drive, edges, active-low)
    Flags = 1,
    /// Initial output values
    OutputValues = 2,
    /// Debounce period
    Debounce = 3,
}

impl AttributeKind {
    /// Convert to the raw discriminant.
    pub fn to_raw(self) -> u32 {
        self as u32
    }
}

impl TryFrom<u32> for AttributeKind {
    type Error = GpioError;

    fn try_from(code: u32) -> Result<Self> {
        match code {
            1 => Ok(Self::Flags),
            2 => Ok(Self::OutputValues),
            3 => Ok(Self::Debounce),
            value => Err(GpioError::InvalidAttribute {
                field: "type",
                value,
            }),
        }
    }
}

/// A consumer-supplied attribute descriptor.
///
/// Which fields are meaningful depends on `kind`:
///
/// | `kind` | fields |
/// |--------|--------|
/// | 1 (flags) | `active_low`, `output`, `drive` (output), `bias`, `rising_edge`, `falling_edge` (input) |
/// | 2 (output values) | `values` |
/// | 3 (debounce) | `debounce` (microseconds) |
///
/// `drive` and `bias` are numeric codes, checked by [`encode`]. When
/// deserialized they may also be given by name (`"open-drain"`,
/// `"pull-up"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct AttributeDescriptor {
    /// Request positions this attribute applies to
    pub mask: u32,
    /// Attribute type discriminant, see [`AttributeKind`]
    #[serde(rename = "type")]
    pub kind: u32,
    /// Invert the logical value
    #[serde(default)]
    pub active_low: bool,
    /// Output direction; input when false
    #[serde(default)]
    pub output: bool,
    /// [`Drive`] code, outputs only
    #[serde(default, deserialize_with = "drive_code")]
    pub drive: u32,
    /// [`Bias`] code, inputs only
    #[serde(default, deserialize_with = "bias_code")]
    pub bias: u32,
    /// Report rising edges, inputs only
    #[serde(default)]
    pub rising_edge: bool,
    /// Report falling edges, inputs only
    #[serde(default)]
    pub falling_edge: bool,
    /// Initial output values, bit `n` for request position `n`
    #[serde(default)]
    pub values: u32,
    /// Debounce period in microseconds
    #[serde(default)]
    pub debounce: u32,
}

impl AttributeDescriptor {
    /// A flags attribute for an input with bias disabled and no edge detection.
    pub fn flags(mask: u32) -> Self {
        Self {
            mask,
            kind: AttributeKind::Flags.to_raw(),
            ..Default::default()
        }
    }

    /// An output values attribute.
    pub fn output_values(mask: u32, values: u32) -> Self {
        Self {
            mask,
            kind: AttributeKind::OutputValues.to_raw(),
            values,
            ..Default::default()
        }
    }

    /// A debounce attribute with the period in microseconds.
    pub fn debounce(mask: u32, period_us: u32) -> Self {
        Self {
            mask,
            kind: AttributeKind::Debounce.to_raw(),
            debounce: period_us,
            ..Default::default()
        }
    }

    /// Mark the lines as outputs.
    pub fn output(mut self) -> Self {
        self.output = true;
        self
    }

    /// Mark the lines as active-low.
    pub fn active_low(mut self) -> Self {
        self.active_low = true;
        self
    }

    /// Set the drive mode (outputs only).
    pub fn with_drive(mut self, drive: Drive) -> Self {
        self.drive = drive.code();
        self
    }

    /// Set the bias (inputs only).
    pub fn with_bias(mut self, bias: Bias) -> Self {
        self.bias = bias.code();
        self
    }

    /// Enable rising edge detection (inputs only).
    pub fn rising_edge(mut self) -> Self {
        self.rising_edge = true;
        self
    }

    /// Enable falling edge detection (inputs only).
    pub fn falling_edge(mut self) -> Self {
        self.falling_edge = true;
        self
    }

    /// Encode this descriptor, see [`encode`].
    pub fn encode(&self) -> Result<EncodedAttribute> {
        encode(self)
    }
}

/// A `drive`/`bias` value as written in a descriptor: a raw code or a name.
#[derive(Deserialize)]
#[serde(untagged)]
enum CodeOrName<T> {
    Code(u32),
    Name(T),
}

fn drive_code<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<u32, D::Error> {
    Ok(match CodeOrName::<Drive>::deserialize(deserializer)? {
        CodeOrName::Code(code) => code,
        CodeOrName::Name(drive) => drive.code(),
    })
}

fn bias_code<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<u32, D::Error> {
    Ok(match CodeOrName::<Bias>::deserialize(deserializer)? {
        CodeOrName::Code(code) => code,
        CodeOrName::Name(bias) => bias.code(),
    })
}

/// An attribute in kernel form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EncodedAttribute {
    /// Line flags
    Flags {
        /// Request positions
        mask: u32,
        /// Kernel flag bits
        flags: LineFlags,
    },
    /// Initial output values
    OutputValues {
        /// Request positions
        mask: u32,
        /// Value bits, by request position
        values: u32,
    },
    /// Debounce period
    Debounce {
        /// Request positions
        mask: u32,
        /// Period in microseconds
        period_us: u32,
    },
}

impl EncodedAttribute {
    /// Request positions this attribute applies to.
    pub fn mask(&self) -> u32 {
        match *self {
            Self::Flags { mask, .. }
            | Self::OutputValues { mask, .. }
            | Self::Debounce { mask, .. } => mask,
        }
    }

    /// Write the kernel structure for this attribute.
    pub(crate) fn to_raw(self) -> gpio_v2_line_config_attribute {
        let mut raw = gpio_v2_line_config_attribute::zeroed();
        raw.mask = u64::from(self.mask());
        match self {
            Self::Flags { flags, .. } => {
                raw.attr.id = GPIO_V2_LINE_ATTR_ID_FLAGS;
                raw.attr.value.flags = flags.bits();
            }
            Self::OutputValues { values, .. } => {
                raw.attr.id = GPIO_V2_LINE_ATTR_ID_OUTPUT_VALUES;
                raw.attr.value.values = u64::from(values);
            }
            Self::Debounce { period_us, .. } => {
                raw.attr.id = GPIO_V2_LINE_ATTR_ID_DEBOUNCE;
                raw.attr.value.debounce_period_us = period_us;
            }
        }
        raw
    }
}

/// Translate a descriptor into its kernel encoding.
///
/// Pure: no I/O, no state. Fails with [`GpioError::InvalidAttribute`] on an
/// unknown `type` discriminant, or an unknown `drive` or `bias` code in a
/// flags attribute.
pub fn encode(descriptor: &AttributeDescriptor) -> Result<EncodedAttribute> {
    let mask = descriptor.mask;
    Ok(match AttributeKind::try_from(descriptor.kind)? {
        AttributeKind::Flags => EncodedAttribute::Flags {
            mask,
            flags: encode_flags(descriptor)?,
        },
        AttributeKind::OutputValues => EncodedAttribute::OutputValues {
            mask,
            values: descriptor.values,
        },
        AttributeKind::Debounce => EncodedAttribute::Debounce {
            mask,
            period_us: descriptor.debounce,
        },
    })
}

fn encode_flags(descriptor: &AttributeDescriptor) -> Result<LineFlags> {
    let drive = Drive::try_from(descriptor.drive)?;
    let bias = Bias::try_from(descriptor.bias)?;
    let mut flags = LineFlags::empty();

    if descriptor.active_low {
        flags |= LineFlags::ACTIVE_LOW;
    }

    if descriptor.output {
        flags |= LineFlags::OUTPUT;
        match drive {
            Drive::PushPull => {}
            Drive::OpenDrain => flags |= LineFlags::OPEN_DRAIN,
            Drive::OpenSource => flags |= LineFlags::OPEN_SOURCE,
        }
    } else {
        flags |= LineFlags::INPUT;
        flags |= match bias {
            Bias::PullUp => LineFlags::BIAS_PULL_UP,
            Bias::PullDown => LineFlags::BIAS_PULL_DOWN,
            Bias::Disabled => LineFlags::BIAS_DISABLED,
        };
        if descriptor.rising_edge {
            flags |= LineFlags::EDGE_RISING;
        }
        if descriptor.falling_edge {
            flags |= LineFlags::EDGE_FALLING;
        }
    }

    Ok(flags)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BIAS_BITS: LineFlags = LineFlags::BIAS_PULL_UP
        .union(LineFlags::BIAS_PULL_DOWN)
        .union(LineFlags::BIAS_DISABLED);

    fn flags_of(descriptor: &AttributeDescriptor) -> LineFlags {
        match encode(descriptor) {
            Ok(EncodedAttribute::Flags { flags, .. }) => flags,
            other => panic!("expected flags attribute, got {other:?}"),
        }
    }

    #[test]
    fn test_encode_is_deterministic() {
        let descriptors = [
            AttributeDescriptor::flags(0b11).output().with_drive(Drive::OpenDrain),
            AttributeDescriptor::flags(0b1)
                .with_bias(Bias::PullUp)
                .rising_edge()
                .falling_edge(),
            AttributeDescriptor::output_values(0b11, 0b01),
            AttributeDescriptor::debounce(0b100, 5000),
        ];
        for descriptor in &descriptors {
            let first = encode(descriptor).unwrap();
            let second = encode(descriptor).unwrap();
            assert_eq!(first, second);
            assert_eq!(first.mask(), descriptor.mask);
        }
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let descriptor = AttributeDescriptor {
            mask: 0b1,
            kind: 4,
            ..Default::default()
        };
        let err = encode(&descriptor).unwrap_err();
        assert!(matches!(
            err,
            GpioError::InvalidAttribute {
                field: "type",
                value: 4
            }
        ));
        assert!(err.is_validation());

        let zero = AttributeDescriptor::default();
        assert!(encode(&zero).is_err());
    }

    #[test]
    fn test_output_drive_modes_are_exclusive() {
        let push_pull = flags_of(&AttributeDescriptor::flags(1).output());
        assert_eq!(push_pull, LineFlags::OUTPUT);

        let open_drain = flags_of(
            &AttributeDescriptor::flags(1)
                .output()
                .with_drive(Drive::OpenDrain),
        );
        assert!(open_drain.contains(LineFlags::OPEN_DRAIN));
        assert!(!open_drain.contains(LineFlags::OPEN_SOURCE));

        let open_source = flags_of(
            &AttributeDescriptor::flags(1)
                .output()
                .with_drive(Drive::OpenSource),
        );
        assert!(open_source.contains(LineFlags::OPEN_SOURCE));
        assert!(!open_source.contains(LineFlags::OPEN_DRAIN));
    }

    #[test]
    fn test_input_bias_is_exactly_one() {
        for bias in [Bias::Disabled, Bias::PullUp, Bias::PullDown] {
            let flags = flags_of(&AttributeDescriptor::flags(1).with_bias(bias));
            assert!(flags.contains(LineFlags::INPUT));
            assert_eq!((flags & BIAS_BITS).bits().count_ones(), 1, "{bias:?}");
        }

        let pull_up = flags_of(&AttributeDescriptor::flags(1).with_bias(Bias::PullUp));
        assert!(!pull_up.contains(LineFlags::BIAS_PULL_DOWN));
        assert!(!pull_up.contains(LineFlags::BIAS_DISABLED));
    }

    #[test]
    fn test_output_ignores_input_settings() {
        let mut descriptor = AttributeDescriptor::flags(1).output().rising_edge();
        descriptor.bias = Bias::PullUp.code();
        let flags = flags_of(&descriptor);
        assert_eq!(flags & BIAS_BITS, LineFlags::empty());
        assert!(!flags.contains(LineFlags::EDGE_RISING));
        assert!(!flags.contains(LineFlags::INPUT));
    }

    #[test]
    fn test_edges_are_independent() {
        let both = flags_of(
            &AttributeDescriptor::flags(1)
                .rising_edge()
                .falling_edge()
                .active_low(),
        );
        assert!(both.contains(LineFlags::EDGE_RISING | LineFlags::EDGE_FALLING));
        assert!(both.contains(LineFlags::ACTIVE_LOW));

        let none = flags_of(&AttributeDescriptor::flags(1));
        assert_eq!(none, LineFlags::INPUT | LineFlags::BIAS_DISABLED);
    }

    #[test]
    fn test_raw_encoding() {
        let raw = EncodedAttribute::Debounce {
            mask: 0b10,
            period_us: 1000,
        }
        .to_raw();
        assert_eq!(raw.attr.id, GPIO_V2_LINE_ATTR_ID_DEBOUNCE);
        assert_eq!(raw.mask, 0b10);
        // SAFETY: debounce variant written by to_raw
        assert_eq!(unsafe { raw.attr.value.debounce_period_us }, 1000);

        let raw = EncodedAttribute::OutputValues {
            mask: 0b11,
            values: 0b01,
        }
        .to_raw();
        assert_eq!(raw.attr.id, GPIO_V2_LINE_ATTR_ID_OUTPUT_VALUES);
        // SAFETY: values variant written by to_raw
        assert_eq!(unsafe { raw.attr.value.values }, 0b01);
    }

    #[test]
    fn test_numeric_codes() {
        assert_eq!(Drive::try_from(1).unwrap(), Drive::OpenDrain);
        assert_eq!(Bias::try_from(2).unwrap(), Bias::PullDown);
        assert!(matches!(
            Bias::try_from(3),
            Err(GpioError::InvalidAttribute { field: "bias", .. })
        ));
        assert!(Drive::try_from(7).is_err());
    }

    #[test]
    fn test_descriptor_from_toml() {
        let descriptor: AttributeDescriptor = toml::from_str(
            r#"
            mask = 3
            type = 1
            bias = "pull-down"
            rising_edge = true
            "#,
        )
        .unwrap();
        assert_eq!(descriptor.kind, AttributeKind::Flags.to_raw());
        assert_eq!(descriptor.bias, Bias::PullDown.code());
        assert!(descriptor.rising_edge);
        assert!(!descriptor.output);
    }

    #[test]
    fn test_numeric_codes_in_descriptor() {
        let descriptor: AttributeDescriptor = toml::from_str(
            r#"
            mask = 1
            type = 1
            output = true
            drive = 1
            "#,
        )
        .unwrap();
        assert_eq!(descriptor.drive, Drive::OpenDrain.code());
        assert_eq!(
            flags_of(&descriptor),
            LineFlags::OUTPUT | LineFlags::OPEN_DRAIN
        );

        let descriptor: AttributeDescriptor =
            serde_json::from_str(r#"{"mask": 1, "type": 1, "bias": 7}"#).unwrap();
        let err = encode(&descriptor).unwrap_err();
        assert!(matches!(
            err,
            GpioError::InvalidAttribute {
                field: "bias",
                value: 7
            }
        ));
        assert!(err.is_validation());

        let descriptor = AttributeDescriptor {
            drive: 3,
            ..AttributeDescriptor::flags(1).output()
        };
        assert!(matches!(
            encode(&descriptor),
            Err(GpioError::InvalidAttribute { field: "drive", value: 3 })
        ));
    }
}
