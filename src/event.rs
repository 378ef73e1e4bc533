//! Edge events and the staging ring they are read into.

use gpio_sys::{event_layout, GPIO_V2_LINE_EVENT_FALLING_EDGE, GPIO_V2_LINE_EVENT_RISING_EDGE};
use serde::Serialize;

/// Size of one kernel edge-event record in bytes.
pub const EVENT_RECORD_SIZE: usize = event_layout::SIZE;

/// Number of slots in the staging ring.
pub const RING_SLOTS: usize = 128;

/// Events that may be in flight towards the consumer at once.
///
/// One less than [`RING_SLOTS`], so the reader never stages into a slot
/// whose event is still waiting to be delivered.
pub const IN_FLIGHT_CAPACITY: usize = RING_SLOTS - 1;

/// Direction of a detected transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeKind {
    /// Low to high
    Rising,
    /// High to low
    Falling,
}

impl EdgeKind {
    fn to_raw(self) -> u32 {
        match self {
            Self::Rising => GPIO_V2_LINE_EVENT_RISING_EDGE,
            Self::Falling => GPIO_V2_LINE_EVENT_FALLING_EDGE,
        }
    }
}

/// An edge event on one of the requested lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct LineEvent {
    /// Event time in nanoseconds, CLOCK_MONOTONIC
    pub timestamp_ns: u64,
    /// Rising or falling transition
    pub edge: EdgeKind,
    /// Chip offset of the line
    pub offset: u32,
    /// Sequence number across all lines of the request
    pub seqno: u32,
    /// Sequence number for this line
    pub line_seqno: u32,
}

impl LineEvent {
    /// True for a rising edge.
    pub fn rising_edge(&self) -> bool {
        self.edge == EdgeKind::Rising
    }

    /// Decode a kernel `gpio_v2_line_event` record.
    ///
    /// Returns `None` unless `record` is exactly [`EVENT_RECORD_SIZE`] bytes.
    /// Any id other than the rising-edge id is reported as a falling edge.
    pub fn decode(record: &[u8]) -> Option<Self> {
        if record.len() != EVENT_RECORD_SIZE {
            return None;
        }

        let edge = if read_u32(record, event_layout::ID)? == GPIO_V2_LINE_EVENT_RISING_EDGE {
            EdgeKind::Rising
        } else {
            EdgeKind::Falling
        };

        Some(Self {
            timestamp_ns: read_u64(record, event_layout::TIMESTAMP_NS)?,
            edge,
            offset: read_u32(record, event_layout::OFFSET)?,
            seqno: read_u32(record, event_layout::SEQNO)?,
            line_seqno: read_u32(record, event_layout::LINE_SEQNO)?,
        })
    }

    /// Encode this event as a kernel record, padding zeroed.
    pub fn to_record(&self) -> [u8; EVENT_RECORD_SIZE] {
        let mut record = [0u8; EVENT_RECORD_SIZE];
        write_bytes(
            &mut record,
            event_layout::TIMESTAMP_NS,
            &self.timestamp_ns.to_ne_bytes(),
        );
        write_bytes(&mut record, event_layout::ID, &self.edge.to_raw().to_ne_bytes());
        write_bytes(&mut record, event_layout::OFFSET, &self.offset.to_ne_bytes());
        write_bytes(&mut record, event_layout::SEQNO, &self.seqno.to_ne_bytes());
        write_bytes(
            &mut record,
            event_layout::LINE_SEQNO,
            &self.line_seqno.to_ne_bytes(),
        );
        record
    }
}

fn read_u32(record: &[u8], at: usize) -> Option<u32> {
    let bytes = record.get(at..at + 4)?;
    Some(u32::from_ne_bytes(bytes.try_into().ok()?))
}

fn read_u64(record: &[u8], at: usize) -> Option<u64> {
    let bytes = record.get(at..at + 8)?;
    Some(u64::from_ne_bytes(bytes.try_into().ok()?))
}

fn write_bytes(record: &mut [u8; EVENT_RECORD_SIZE], at: usize, bytes: &[u8]) {
    record[at..at + bytes.len()].copy_from_slice(bytes);
}

/// Fixed ring of raw record slots, reused cyclically.
///
/// Owned by the reader thread; the slot index is a running counter modulo
/// [`RING_SLOTS`], so no allocation happens per event.
pub(crate) struct EventRing {
    slots: Box<[[u8; EVENT_RECORD_SIZE]; RING_SLOTS]>,
    next: u64,
}

impl EventRing {
    pub(crate) fn new() -> Self {
        Self {
            slots: Box::new([[0u8; EVENT_RECORD_SIZE]; RING_SLOTS]),
            next: 0,
        }
    }

    /// The slot for the next record.
    pub(crate) fn next_slot(&mut self) -> &mut [u8; EVENT_RECORD_SIZE] {
        let index = (self.next % RING_SLOTS as u64) as usize;
        self.next = self.next.wrapping_add(1);
        &mut self.slots[index]
    }

    /// Number of slots handed out so far.
    pub(crate) fn staged(&self) -> u64 {
        self.next
    }
}
