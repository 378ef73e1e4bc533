//! Line request assembly and acquisition.
//!
//! A [`LineRequestBuilder`] collects the consumer label, the ordered line
//! offsets and the attribute descriptors. [`LineRequestBuilder::build`]
//! validates and encodes everything up front, so a request that reaches the
//! kernel is always complete; a [`LineRequest`] is immutable and consumed by
//! exactly one acquisition.

use gpio_sys::{gpio_v2_line_request, GPIO_MAX_NAME_SIZE};
use tracing::{debug, info, warn};

use crate::attribute::{encode, AttributeDescriptor, EncodedAttribute, MAX_ATTRIBUTES};
use crate::chip::ChipInterface;
use crate::error::{GpioError, Result};
use crate::handle::LineHandle;

/// Maximum number of lines in one request.
pub const MAX_LINES: usize = 32;

/// A validated, fully encoded line request.
#[derive(Debug, PartialEq, Eq)]
pub struct LineRequest {
    consumer: String,
    offsets: Vec<u32>,
    attributes: Vec<EncodedAttribute>,
    event_buffer_size: u32,
}

impl LineRequest {
    /// Consumer label shown in line info while the lines are held.
    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    /// Requested chip offsets, in request order.
    pub fn offsets(&self) -> &[u32] {
        &self.offsets
    }

    /// Encoded attribute entries.
    pub fn attributes(&self) -> &[EncodedAttribute] {
        &self.attributes
    }

    /// Suggested kernel event buffer size, 0 for the kernel default.
    pub fn event_buffer_size(&self) -> u32 {
        self.event_buffer_size
    }

    /// Assemble the kernel `gpio_v2_line_request`.
    pub(crate) fn to_raw(&self) -> gpio_v2_line_request {
        let mut raw = gpio_v2_line_request::zeroed();

        raw.offsets[..self.offsets.len()].copy_from_slice(&self.offsets);
        raw.num_lines = self.offsets.len() as u32;

        // Validated at build time: shorter than the field, no interior NUL,
        // so the zeroed tail terminates it.
        for (dst, src) in raw.consumer.iter_mut().zip(self.consumer.bytes()) {
            *dst = src as libc::c_char;
        }

        raw.config.num_attrs = self.attributes.len() as u32;
        for (dst, attr) in raw.config.attrs.iter_mut().zip(&self.attributes) {
            *dst = attr.to_raw();
        }

        raw.event_buffer_size = self.event_buffer_size;
        raw
    }

    /// Acquire the lines from `chip`.
    pub fn acquire<C: ChipInterface + ?Sized>(self, chip: &C) -> Result<LineHandle> {
        chip.acquire(self)
    }
}

/// Builder for a [`LineRequest`].
#[derive(Debug, Clone, Default)]
pub struct LineRequestBuilder {
    consumer: String,
    offsets: Vec<u32>,
    attributes: Vec<AttributeDescriptor>,
    event_buffer_size: u32,
}

impl LineRequestBuilder {
    /// Start a request with the given consumer label.
    pub fn new(consumer: impl Into<String>) -> Self {
        Self {
            consumer: consumer.into(),
            ..Default::default()
        }
    }

    /// Append one line offset.
    pub fn offset(mut self, offset: u32) -> Self {
        self.offsets.push(offset);
        self
    }

    /// Append line offsets, in order.
    pub fn offsets(mut self, offsets: impl IntoIterator<Item = u32>) -> Self {
        self.offsets.extend(offsets);
        self
    }

    /// Append one attribute descriptor.
    pub fn attribute(mut self, attribute: AttributeDescriptor) -> Self {
        self.attributes.push(attribute);
        self
    }

    /// Append attribute descriptors.
    pub fn attributes(mut self, attributes: impl IntoIterator<Item = AttributeDescriptor>) -> Self {
        self.attributes.extend(attributes);
        self
    }

    /// Suggest a kernel-side event buffer size.
    pub fn event_buffer_size(mut self, size: u32) -> Self {
        self.event_buffer_size = size;
        self
    }

    /// Validate and encode the request.
    ///
    /// Nothing is submitted to the kernel here; every error is a validation
    /// error.
    pub fn build(self) -> Result<LineRequest> {
        if self.offsets.len() > MAX_LINES {
            return Err(GpioError::TooManyLines {
                requested: self.offsets.len(),
                max: MAX_LINES,
            });
        }
        if self.attributes.len() > MAX_ATTRIBUTES {
            return Err(GpioError::TooManyAttributes {
                requested: self.attributes.len(),
                max: MAX_ATTRIBUTES,
            });
        }
        validate_label(&self.consumer)?;

        let attributes = self
            .attributes
            .iter()
            .map(encode)
            .collect::<Result<Vec<_>>>()?;

        Ok(LineRequest {
            consumer: self.consumer,
            offsets: self.offsets,
            attributes,
            event_buffer_size: self.event_buffer_size,
        })
    }

    /// Build the request and acquire it from `chip` with one kernel call.
    pub fn acquire<C: ChipInterface + ?Sized>(self, chip: &C) -> Result<LineHandle> {
        self.build()?.acquire(chip)
    }
}

/// Check that a consumer label fits the kernel's NUL-terminated name field.
pub fn validate_label(label: &str) -> Result<()> {
    if label.as_bytes().contains(&0) {
        return Err(GpioError::InvalidLabel {
            label: label.escape_default().to_string(),
            reason: "contains a NUL byte".to_string(),
        });
    }
    if label.len() >= GPIO_MAX_NAME_SIZE {
        return Err(GpioError::InvalidLabel {
            label: label.to_string(),
            reason: format!(
                "{} bytes, at most {} fit",
                label.len(),
                GPIO_MAX_NAME_SIZE - 1
            ),
        });
    }
    Ok(())
}

/// Validate, encode and acquire a set of lines in one step.
///
/// Either every offset is granted or none is: validation and encoding
/// errors are raised before the kernel is touched, and a kernel rejection
/// leaves nothing to clean up.
pub fn build_and_acquire<C: ChipInterface + ?Sized>(
    chip: &C,
    consumer: &str,
    offsets: &[u32],
    attributes: &[AttributeDescriptor],
) -> Result<LineHandle> {
    let request = LineRequestBuilder::new(consumer)
        .offsets(offsets.iter().copied())
        .attributes(attributes.iter().cloned())
        .build()
        .inspect_err(|e| warn!(consumer, error = %e, "Rejected line request"))?;

    debug!(
        consumer,
        offsets = ?request.offsets(),
        attributes = request.attributes().len(),
        "Submitting line request"
    );
    let handle = request.acquire(chip)?;
    info!(consumer, offsets = ?handle.offsets(), "Lines acquired");
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::{Bias, Drive, LineFlags};

    #[test]
    fn test_build_scenario_outputs() {
        let request = LineRequestBuilder::new("test")
            .offsets([4, 7])
            .attribute(AttributeDescriptor::flags(0b11).output())
            .attribute(AttributeDescriptor::output_values(0b11, 0b01))
            .build()
            .unwrap();

        let raw = request.to_raw();
        assert_eq!(raw.num_lines, 2);
        assert_eq!(&raw.offsets[..2], &[4, 7]);
        assert_eq!(raw.config.num_attrs, 2);
        assert_eq!(raw.config.attrs[0].mask, 0b11);
        assert_eq!(raw.config.attrs[0].attr.id, 1);
        // SAFETY: id 1 selects the flags member
        let flags = unsafe { raw.config.attrs[0].attr.value.flags };
        assert_eq!(flags, LineFlags::OUTPUT.bits());
        assert_eq!(raw.config.attrs[1].attr.id, 2);
        // SAFETY: id 2 selects the values member
        assert_eq!(unsafe { raw.config.attrs[1].attr.value.values }, 0b01);
        assert_eq!(raw.consumer[0] as u8, b't');
        assert_eq!(raw.consumer[4], 0);
        assert_eq!(raw.fd, 0);
    }

    #[test]
    fn test_build_scenario_edge_input() {
        let request = LineRequestBuilder::new("watch")
            .offset(2)
            .attribute(
                AttributeDescriptor::flags(0b1)
                    .with_bias(Bias::PullDown)
                    .rising_edge(),
            )
            .build()
            .unwrap();

        assert_eq!(
            request.attributes(),
            &[EncodedAttribute::Flags {
                mask: 0b1,
                flags: LineFlags::INPUT | LineFlags::BIAS_PULL_DOWN | LineFlags::EDGE_RISING,
            }]
        );
    }

    #[test]
    fn test_too_many_lines() {
        let err = LineRequestBuilder::new("test")
            .offsets(0..33)
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            GpioError::TooManyLines {
                requested: 33,
                max: 32
            }
        ));

        assert!(LineRequestBuilder::new("test").offsets(0..32).build().is_ok());
    }

    #[test]
    fn test_too_many_attributes() {
        let attrs = std::iter::repeat(AttributeDescriptor::flags(1)).take(MAX_ATTRIBUTES + 1);
        let err = LineRequestBuilder::new("test")
            .offset(0)
            .attributes(attrs)
            .build()
            .unwrap_err();
        assert!(matches!(err, GpioError::TooManyAttributes { requested: 11, .. }));
    }

    #[test]
    fn test_invalid_attribute_aborts_build() {
        let bad = AttributeDescriptor {
            mask: 1,
            kind: 4,
            ..Default::default()
        };
        let err = LineRequestBuilder::new("test")
            .offset(0)
            .attribute(AttributeDescriptor::flags(1).output().with_drive(Drive::OpenDrain))
            .attribute(bad)
            .build()
            .unwrap_err();
        assert!(matches!(err, GpioError::InvalidAttribute { field: "type", value: 4 }));
    }

    #[test]
    fn test_label_limits() {
        assert!(validate_label("").is_ok());
        assert!(validate_label(&"a".repeat(31)).is_ok());
        assert!(matches!(
            validate_label(&"a".repeat(32)),
            Err(GpioError::InvalidLabel { .. })
        ));
        assert!(matches!(
            validate_label("bad\0label"),
            Err(GpioError::InvalidLabel { .. })
        ));
    }

    #[test]
    fn test_event_buffer_size_passed_through() {
        let request = LineRequestBuilder::new("test")
            .offset(3)
            .event_buffer_size(64)
            .build()
            .unwrap();
        assert_eq!(request.to_raw().event_buffer_size, 64);
    }
}
