#![cfg_attr(all(feature = "bpf", not(feature = "user")), no_std)]

#[cfg(test)]
use core::mem::size_of;

use bytemuck::{Pod, Zeroable};

// =============================================================================
// DENTRY WIRE PROTOCOL — shared with the kernel tracing layer
// =============================================================================
//
// The kernel exposes dentry chains through a handful of BPF maps (see the
// `kernel_maps` module in `agentd` for the userspace side). `PathKey` and
// `PathValue` are the wire structs read out of those maps; their byte
// layout is part of the contract and must not be inferred from Rust's
// default struct layout — we serialize explicitly.
// =============================================================================

/// High 32 bits of `inode` that mark a rename-time synthetic inode.
///
/// A key carrying this sentinel in `inode >> 32` must never be cached
/// (spec P5) — it exists only to let the kernel describe a renamed dentry
/// chain without a stable identity.
pub const FAKE_INODE_SENTINEL: u32 = 0xdead_c001;

/// Identifies a dentry in the kernel's path-resolution maps.
///
/// A key is "null" iff `inode == 0 && mount_id == 0`.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub struct PathKey {
    pub mount_id: u32,
    pub inode: u64,
    pub path_id: u32,
}

impl PathKey {
    pub const WIRE_SIZE: usize = 16;

    pub const NULL: PathKey = PathKey {
        mount_id: 0,
        inode: 0,
        path_id: 0,
    };

    pub const fn is_null(&self) -> bool {
        self.inode == 0 && self.mount_id == 0
    }

    /// Rename-time synthetic inode: never cache, never trust across calls.
    pub const fn is_fake(&self) -> bool {
        (self.inode >> 32) as u32 == FAKE_INODE_SENTINEL
    }

    /// Wire layout: `inode(LE,8) | mount_id(LE,4) | path_id(LE,4)`.
    pub fn to_bytes(&self) -> [u8; Self::WIRE_SIZE] {
        let mut buf = [0u8; Self::WIRE_SIZE];
        buf[0..8].copy_from_slice(&self.inode.to_le_bytes());
        buf[8..12].copy_from_slice(&self.mount_id.to_le_bytes());
        buf[12..16].copy_from_slice(&self.path_id.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Option<PathKey> {
        if buf.len() < Self::WIRE_SIZE {
            return None;
        }
        let inode = u64::from_le_bytes(buf[0..8].try_into().ok()?);
        let mount_id = u32::from_le_bytes(buf[8..12].try_into().ok()?);
        let path_id = u32::from_le_bytes(buf[12..16].try_into().ok()?);
        Some(PathKey {
            mount_id,
            inode,
            path_id,
        })
    }
}

/// Maximum length of a single path segment name, not counting the NUL.
pub const SEG_MAX: usize = 255;

/// A single link in a dentry chain: one path segment plus its parent key.
///
/// `name` is NUL-terminated inside the fixed buffer. `name[0] == b'/'`
/// marks the filesystem root (traversal stops, the `/` itself is not
/// included in the composed path). `name[0] == 0` marks a chain the
/// kernel could not walk any further (`TruncatedParents`).
#[repr(C)]
#[derive(Copy, Clone)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub struct PathValue {
    pub parent: PathKey,
    pub name: [u8; SEG_MAX + 1],
    pub len: u16,
}

impl PathValue {
    /// On-wire size of a `PathValue` as read from the `pathnames` kernel
    /// map: `parent.inode(LE,8) | parent.mount_id(LE,4) | parent.path_id(LE,4)
    /// | name(256) | len(LE,2)`. Not part of the documented §3 layout (only
    /// `PathKey` has a normative byte layout) but fixed here so the kernel
    /// map gateway has one place to pack/unpack instead of trusting Rust's
    /// native struct layout.
    pub const WIRE_SIZE: usize = 8 + 4 + 4 + (SEG_MAX + 1) + 2;

    pub fn from_wire_bytes(buf: &[u8]) -> Option<PathValue> {
        if buf.len() < Self::WIRE_SIZE {
            return None;
        }
        let parent_inode = u64::from_le_bytes(buf[0..8].try_into().ok()?);
        let parent_mount_id = u32::from_le_bytes(buf[8..12].try_into().ok()?);
        let parent_path_id = u32::from_le_bytes(buf[12..16].try_into().ok()?);
        let mut name = [0u8; SEG_MAX + 1];
        name.copy_from_slice(&buf[16..16 + SEG_MAX + 1]);
        let len = u16::from_le_bytes(
            buf[16 + SEG_MAX + 1..18 + SEG_MAX + 1]
                .try_into()
                .ok()?,
        );
        Some(PathValue {
            parent: PathKey {
                mount_id: parent_mount_id,
                inode: parent_inode,
                path_id: parent_path_id,
            },
            name,
            len,
        })
    }

    pub fn segment(&self) -> &[u8] {
        let n = (self.len as usize).min(self.name.len());
        let nul = self.name[..n].iter().position(|b| *b == 0).unwrap_or(n);
        &self.name[..nul]
    }

    pub fn is_root_marker(&self) -> bool {
        self.name.first() == Some(&b'/')
    }

    pub fn is_truncated_marker(&self) -> bool {
        self.len == 0 || self.name.first() == Some(&0u8)
    }
}

#[cfg(feature = "user")]
impl core::fmt::Debug for PathValue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PathValue")
            .field("parent", &self.parent)
            .field("segment", &String::from_utf8_lossy(self.segment()))
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(not(feature = "user"))]
impl core::fmt::Debug for PathValue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PathValue")
            .field("parent", &self.parent)
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(feature = "user")]
extern crate std;
#[cfg(feature = "user")]
use std::string::String;

// =============================================================================
// OUT-OF-BAND DENTRY RESOLUTION REQUEST
// =============================================================================
//
// Alternative to direct map lookup: userspace writes a request record into
// a shared memory segment and signals the kernel out-of-band, which writes
// back a packed list of (PathKey, segment) tuples terminated by a leading
// `/` segment.
// =============================================================================

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OutOfBandOp {
    /// Resolve and return a single path segment.
    ResolveSegment = 0,
    /// Resolve and return the full serialized chain.
    ResolvePath = 1,
}

/// Request record written into the shared out-of-band segment.
///
/// Wire layout, 29 bytes, zero-padded to a machine word:
/// `op(1) | inode(LE,8) | mount_id(LE,4) | path_id(LE,4) | segment_ptr(LE,8) | segment_len(LE,4)`.
#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct OutOfBandRequest {
    pub op: OutOfBandOp,
    pub key: PathKey,
    pub segment_ptr: u64,
    pub segment_len: u32,
}

impl OutOfBandRequest {
    /// Unpadded size of the documented wire fields.
    pub const WIRE_SIZE: usize = 29;
    /// Zero-padded to an 8-byte machine word.
    pub const PADDED_SIZE: usize = 32;

    pub fn to_bytes(&self) -> [u8; Self::PADDED_SIZE] {
        let mut buf = [0u8; Self::PADDED_SIZE];
        buf[0] = self.op as u8;
        buf[1..9].copy_from_slice(&self.key.inode.to_le_bytes());
        buf[9..13].copy_from_slice(&self.key.mount_id.to_le_bytes());
        buf[13..17].copy_from_slice(&self.key.path_id.to_le_bytes());
        buf[17..25].copy_from_slice(&self.segment_ptr.to_le_bytes());
        buf[25..29].copy_from_slice(&self.segment_len.to_le_bytes());
        buf
    }
}

// =============================================================================
// EVENT HEADER — common prefix of every ring-buffer record
// =============================================================================
//
// Every event the kernel tracing layer emits starts with this fixed
// header; the reorderer (C1) only ever needs `cpu` and `timestamp`,
// everything past the header is event-type-specific and left opaque
// here.

/// `cpu(LE,2) | timestamp(LE,8) | event_type(LE,4) | flags(LE,4)`.
pub const EVENT_HEADER_SIZE: usize = 2 + 8 + 4 + 4;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct EventHeader {
    pub cpu: u16,
    pub timestamp: u64,
    pub event_type: u32,
    pub flags: u32,
}

impl EventHeader {
    pub fn from_bytes(buf: &[u8]) -> Option<EventHeader> {
        if buf.len() < EVENT_HEADER_SIZE {
            return None;
        }
        Some(EventHeader {
            cpu: u16::from_le_bytes(buf[0..2].try_into().ok()?),
            timestamp: u64::from_le_bytes(buf[2..10].try_into().ok()?),
            event_type: u32::from_le_bytes(buf[10..14].try_into().ok()?),
            flags: u32::from_le_bytes(buf[14..18].try_into().ok()?),
        })
    }
}

// =============================================================================
// ACTIVITY-DUMP LOAD CONTROLLER — wire projection of DumpLCConfig
// =============================================================================

/// Event-type tags recognized by the kernel's `traced_event_types` map.
///
/// Spec §4.5 step 3 names file-open as the first kind the reduction
/// policy strips, so it sorts first here too.
#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub enum TracedEventType {
    FileOpen = 0,
    Exec = 1,
    Fork = 2,
    Exit = 3,
    Mount = 4,
    NetDevice = 5,
}

impl TracedEventType {
    pub const ALL: [TracedEventType; 6] = [
        TracedEventType::FileOpen,
        TracedEventType::Exec,
        TracedEventType::Fork,
        TracedEventType::Exit,
        TracedEventType::Mount,
        TracedEventType::NetDevice,
    ];
}

/// Key used for every single-entry ("zero-key") kernel map in §6.
pub const ZERO_KEY: u32 = 0;

/// `traced_cgroups_counter` map value: current/cap traced cgroups.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Pod, Zeroable)]
pub struct CgroupCounter {
    pub counter: u64,
    pub max: u64,
}

/// `aya::Pod` is a distinct trait from `bytemuck::Pod`; `aya::maps::HashMap`
/// requires it on its value type. Implemented here (the crate that owns
/// `CgroupCounter`) rather than in `agentd`, which would hit the orphan
/// rule for a foreign trait on a foreign type. Mirrors the teacher's own
/// `unsafe impl Pod for TelemetryConfigPod`.
#[cfg(feature = "aya")]
unsafe impl aya::Pod for CgroupCounter {}

/// Names of the kernel maps this core consumes (part of the wire contract,
/// see spec §6). Kept as named constants rather than a config knob — the
/// kernel side defines them, userspace only discovers them by name.
pub mod map_names {
    pub const PATHNAMES: &str = "pathnames";
    pub const TRACED_EVENT_TYPES: &str = "traced_event_types";
    pub const TRACED_CGROUPS_COUNTER: &str = "traced_cgroups_counter";
    pub const TRACED_CGROUPS_LOCK: &str = "traced_cgroups_lock";
    pub const AD_DUMP_TIMEOUT: &str = "ad_dump_timeout";
    pub const MOUNT_ID_OFFSET: &str = "mount_id_offset";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_key_roundtrip_is_16_bytes() {
        let key = PathKey {
            mount_id: 27,
            inode: 0x1234_5678_9abc,
            path_id: 9,
        };
        let bytes = key.to_bytes();
        assert_eq!(bytes.len(), 16);
        let back = PathKey::from_bytes(&bytes).unwrap();
        assert_eq!(back, key);
    }

    #[test]
    fn null_key_detection() {
        assert!(PathKey::NULL.is_null());
        assert!(!PathKey {
            mount_id: 1,
            inode: 0,
            path_id: 0,
        }
        .is_null());
    }

    #[test]
    fn fake_inode_detection() {
        let fake = PathKey {
            mount_id: 1,
            inode: (FAKE_INODE_SENTINEL as u64) << 32 | 42,
            path_id: 0,
        };
        assert!(fake.is_fake());
        let real = PathKey {
            mount_id: 1,
            inode: 42,
            path_id: 0,
        };
        assert!(!real.is_fake());
    }

    #[test]
    fn out_of_band_request_layout() {
        let req = OutOfBandRequest {
            op: OutOfBandOp::ResolvePath,
            key: PathKey {
                mount_id: 5,
                inode: 10,
                path_id: 1,
            },
            segment_ptr: 0xdead_beef,
            segment_len: 4096,
        };
        let bytes = req.to_bytes();
        assert_eq!(bytes.len(), OutOfBandRequest::PADDED_SIZE);
        assert_eq!(bytes[0], OutOfBandOp::ResolvePath as u8);
    }

    #[test]
    fn path_value_wire_roundtrip() {
        let mut buf = [0u8; PathValue::WIRE_SIZE];
        buf[0..8].copy_from_slice(&42u64.to_le_bytes());
        buf[8..12].copy_from_slice(&7u32.to_le_bytes());
        buf[12..16].copy_from_slice(&0u32.to_le_bytes());
        buf[16..19].copy_from_slice(b"etc");
        let len_offset = 16 + SEG_MAX + 1;
        buf[len_offset..len_offset + 2].copy_from_slice(&3u16.to_le_bytes());

        let value = PathValue::from_wire_bytes(&buf).unwrap();
        assert_eq!(value.parent.inode, 42);
        assert_eq!(value.parent.mount_id, 7);
        assert_eq!(value.segment(), b"etc");
        assert!(!value.is_truncated_marker());
        assert!(!value.is_root_marker());
    }

    #[test]
    fn cgroup_counter_is_pod() {
        assert_eq!(size_of::<CgroupCounter>(), 16);
    }

    #[test]
    fn event_header_parses_fixed_prefix() {
        let mut buf = [0u8; EVENT_HEADER_SIZE + 4];
        buf[0..2].copy_from_slice(&3u16.to_le_bytes());
        buf[2..10].copy_from_slice(&1_000_000u64.to_le_bytes());
        buf[10..14].copy_from_slice(&(TracedEventType::Exec as u32).to_le_bytes());
        let header = EventHeader::from_bytes(&buf).unwrap();
        assert_eq!(header.cpu, 3);
        assert_eq!(header.timestamp, 1_000_000);
        assert_eq!(header.event_type, TracedEventType::Exec as u32);
    }

    #[test]
    fn event_header_rejects_short_buffer() {
        assert!(EventHeader::from_bytes(&[0u8; 4]).is_none());
    }
}
