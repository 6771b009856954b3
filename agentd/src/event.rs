//! Event model shared by the reorderer, resolver and dispatch path.
//!
//! `RawEvent` is what the per-CPU consumers hand to C1; `ResolvedEvent`
//! is what dispatch hands to the rule-engine sinks once C5 has turned
//! the event's dentry key into an absolute path.

use crate::error::ResolutionShortfall;
use crate::reorder::Payload;
use bytes::Bytes;
use ebpf_protocol::{EventHeader, PathKey, EVENT_HEADER_SIZE};

/// A raw ring-buffer record: header plus opaque event-specific payload.
/// Implements `Payload` so it can be admitted straight into the
/// reorderer; extraction failure (too few bytes for even the header)
/// is the spec's `InsufficientData` case and is dropped silently.
#[derive(Clone)]
pub struct RawEvent {
    pub header: EventHeader,
    pub bytes: Bytes,
}

impl RawEvent {
    pub fn parse(bytes: Bytes) -> Option<RawEvent> {
        let header = EventHeader::from_bytes(&bytes)?;
        Some(RawEvent { header, bytes })
    }

    /// File-shaped events carry a `PathKey` immediately after the
    /// header; other event kinds don't resolve a path at all.
    pub fn path_key(&self) -> Option<PathKey> {
        let start = EVENT_HEADER_SIZE;
        PathKey::from_bytes(self.bytes.get(start..start + PathKey::WIRE_SIZE)?)
    }
}

impl Payload for RawEvent {
    fn extract_info(&self) -> Option<(u16, u64)> {
        Some((self.header.cpu, self.header.timestamp))
    }
}

/// Why a resolved event's path is incomplete or missing, mirroring
/// `ResolutionShortfall` but scoped to what dispatch reports upward as
/// an "abnormal path" custom event rather than a hard failure.
pub type AbnormalPathReason = ResolutionShortfall;

/// A fully resolved, totally-ordered event ready for the downstream
/// rule engine.
#[derive(Debug, Clone)]
pub struct ResolvedEvent {
    pub cpu: u16,
    pub timestamp: u64,
    pub event_type: u32,
    pub flags: u32,
    pub path: Option<String>,
    pub abnormal_path: Option<AbnormalPathReason>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use ebpf_protocol::EVENT_HEADER_SIZE;

    fn header_bytes(cpu: u16, ts: u64) -> Vec<u8> {
        let mut buf = vec![0u8; EVENT_HEADER_SIZE];
        buf[0..2].copy_from_slice(&cpu.to_le_bytes());
        buf[2..10].copy_from_slice(&ts.to_le_bytes());
        buf
    }

    #[test]
    fn parse_extracts_cpu_and_timestamp() {
        let raw = RawEvent::parse(Bytes::from(header_bytes(2, 42))).unwrap();
        assert_eq!(raw.extract_info(), Some((2, 42)));
    }

    #[test]
    fn parse_rejects_short_buffer() {
        assert!(RawEvent::parse(Bytes::from(vec![0u8; 2])).is_none());
    }

    #[test]
    fn path_key_absent_when_payload_too_short() {
        let raw = RawEvent::parse(Bytes::from(header_bytes(0, 1))).unwrap();
        assert!(raw.path_key().is_none());
    }
}
