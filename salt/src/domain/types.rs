//! Domain types providing compile-time safety and self-documentation
//!
//! These newtype wrappers keep raw target addresses, process IDs and event
//! kinds from being mixed up with plain integers and strings.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Address in the traced kernel's address space
///
/// Always an unsigned 64-bit quantity. Values that surface from the target as
/// negative two's-complement integers are normalized with [`Address::from_signed`]
/// so they render identically to their unsigned form.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(pub u64);

impl Address {
    pub const NULL: Address = Address(0);

    /// Normalize a signed value: `(v + 2^64) mod 2^64`
    #[must_use]
    #[allow(clippy::cast_sign_loss)]
    pub fn from_signed(value: i64) -> Self {
        Address(value as u64)
    }

    #[must_use]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Lowercase `0x…` rendering, no padding
    #[must_use]
    pub fn to_hex(self) -> String {
        format!("{:#x}", self.0)
    }

    /// Byte offset arithmetic that wraps like the hardware does
    #[must_use]
    pub fn offset(self, delta: u64) -> Self {
        Address(self.0.wrapping_add(delta))
    }

    /// Intrusive-list back-computation: container address from a member address
    #[must_use]
    pub fn container_of(self, member_offset: u64) -> Self {
        Address(self.0.wrapping_sub(member_offset))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl From<u64> for Address {
    fn from(value: u64) -> Self {
        Address(value)
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        let digits = text.trim_start_matches("0x");
        u64::from_str_radix(digits, 16).map(Address).map_err(serde::de::Error::custom)
    }
}

/// Process ID of the task that was current when an event was observed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Pid(pub u32);

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PID:{}", self.0)
    }
}

impl From<i32> for Pid {
    #[allow(clippy::cast_sign_loss)]
    fn from(pid: i32) -> Self {
        Pid(pid as u32)
    }
}

/// Semantic allocator event produced by the correlator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// `kmalloc(0)`: the allocator handed back `ZERO_SIZE_PTR`, no cache involved
    KmallocZeroSize,
    Kmalloc,
    Kfree,
    #[serde(rename = "kmem_cache_alloc")]
    CacheAlloc,
    #[serde(rename = "kmem_cache_free")]
    CacheFree,
    NewSlab,
}

impl EventKind {
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            EventKind::KmallocZeroSize => "kmalloc_zero_size",
            EventKind::Kmalloc => "kmalloc",
            EventKind::Kfree => "kfree",
            EventKind::CacheAlloc => "kmem_cache_alloc",
            EventKind::CacheFree => "kmem_cache_free",
            EventKind::NewSlab => "new_slab",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One correlated, attributed allocator event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationEvent {
    pub kind: EventKind,
    /// `None` only for [`EventKind::KmallocZeroSize`]
    pub cache_name: Option<String>,
    pub process_name: String,
    pub pid: Pid,
    /// Return address into the allocator's caller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_site: Option<Address>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_signed_matches_modular_normalization() {
        let samples = [0i64, 1, -1, -16, i64::MIN, i64::MAX, -0x7777_0000_0000_0000];
        for v in samples {
            let expected = ((i128::from(v) + (1i128 << 64)) % (1i128 << 64)) as u64;
            assert_eq!(Address::from_signed(v).0, expected, "value {v}");
        }
    }

    #[test]
    fn test_negative_renders_as_unsigned() {
        assert_eq!(Address::from_signed(-1).to_hex(), "0xffffffffffffffff");
        assert_eq!(
            Address::from_signed(-0x0000_7800_0000_0000).to_hex(),
            Address(0xffff_8800_0000_0000).to_hex()
        );
    }

    #[test]
    fn test_container_of_wraps() {
        let link = Address(0x1068);
        assert_eq!(link.container_of(0x68), Address(0x1000));
        assert_eq!(Address(0x10).container_of(0x20), Address(u64::MAX - 0xf));
    }

    #[test]
    fn test_address_serde_as_hex_string() {
        let json = serde_json::to_string(&Address(0xdead)).unwrap();
        assert_eq!(json, "\"0xdead\"");
        let back: Address = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Address(0xdead));
    }

    #[test]
    fn test_event_kind_labels_match_serde() {
        let json = serde_json::to_string(&EventKind::CacheFree).unwrap();
        assert_eq!(json, "\"kmem_cache_free\"");
        assert_eq!(EventKind::CacheFree.label(), "kmem_cache_free");
        assert_eq!(EventKind::KmallocZeroSize.to_string(), "kmalloc_zero_size");
    }

    #[test]
    fn test_event_json_shape() {
        let event = AllocationEvent {
            kind: EventKind::KmallocZeroSize,
            cache_name: None,
            process_name: "bash".into(),
            pid: Pid(7),
            call_site: None,
        };
        assert_eq!(
            serde_json::to_string(&event).unwrap(),
            r#"{"kind":"kmalloc_zero_size","cache_name":null,"process_name":"bash","pid":7}"#
        );
    }

    #[test]
    fn test_pid_display() {
        assert_eq!(Pid::from(1234i32).to_string(), "PID:1234");
    }
}
