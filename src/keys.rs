//! Composite key codec & namespace.
//!
//! Composes and parses the six-part composite key:
//! `<extra-op-space><op>:<dom>:<ns>:<ns_part>:<id>:<id_part>:<core>`.
//!
//! Human-readable key strings (e.g. `:D:8_0::#RDY`) elide the leading
//! single-byte alias slot, which is never printable (see
//! [`ALIAS_SLOT_DEFAULT`]); this module's `Key::compose`
//! always emits that byte, and `Key::parse` always expects it. Round-tripping
//! through `Key` rather than hand-writing colon strings is the supported way
//! to construct keys in this crate and in its tests.

use std::fmt;

/// The reserved leading byte of every composed key. Ordinary keys carry this
/// value; [`Key::to_alias`] rewrites only this byte to [`ALIAS_PREFIX`] to
/// produce the companion index-alias key, in place, without reallocating the
/// rest of the buffer.
pub const ALIAS_SLOT_DEFAULT: u8 = 0u8;
/// Leading byte of an index-alias key. Chosen so that `[ALIAS_PREFIX, b'?')`
/// is a valid iteration range containing exactly the alias keys, since no
/// ordinary key ever has a leading byte in `('>', '?')` (`ALIAS_SLOT_DEFAULT`
/// sorts well below it).
pub const ALIAS_PREFIX: u8 = b'>';
/// Exclusive upper bound of the alias iteration range.
pub const ALIAS_RANGE_END: u8 = b'?';

const DELIM: u8 = b':';

/// The merge operator carried in the `op` slot of a key. Distinct from the
/// delta `Op` used by the delta engine only in sharing the same three
/// productive variants plus an `Illegal` sentinel for malformed input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Set,
    Plus,
    Minus,
    Illegal,
}

impl Op {
    pub fn as_str(self) -> &'static str {
        match self {
            Op::Set => "",
            Op::Plus => "+",
            Op::Minus => "-",
            Op::Illegal => "X",
        }
    }

    fn from_bytes(b: &[u8]) -> Op {
        match b {
            b"" => Op::Set,
            b"+" => Op::Plus,
            b"-" => Op::Minus,
            _ => Op::Illegal,
        }
    }
}

/// The `dom` slot: distinguishes layer/hierarchy records from user/module
/// records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Domain {
    Undefined,
    Layer,
    User,
}

impl Domain {
    pub fn as_str(self) -> &'static str {
        match self {
            Domain::Undefined => "",
            Domain::Layer => "LYR",
            Domain::User => "USR",
        }
    }

    fn from_bytes(b: &[u8]) -> Domain {
        match b {
            b"LYR" => Domain::Layer,
            b"USR" => Domain::User,
            _ => Domain::Undefined,
        }
    }
}

/// The `ns` slot: visibility/scope of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    Undefined,
    Udev,
    Device,
    Module,
    Global,
}

impl Namespace {
    pub fn as_str(self) -> &'static str {
        match self {
            Namespace::Undefined => "",
            Namespace::Udev => "U",
            Namespace::Device => "D",
            Namespace::Module => "M",
            Namespace::Global => "G",
        }
    }

    fn from_bytes(b: &[u8]) -> Namespace {
        match b {
            b"U" => Namespace::Udev,
            b"D" => Namespace::Device,
            b"M" => Namespace::Module,
            b"G" => Namespace::Global,
            _ => Namespace::Undefined,
        }
    }

    /// The UDEV namespace may only contain blob values.
    pub fn blob_only(self) -> bool {
        matches!(self, Namespace::Udev)
    }
}

/// A parsed composite key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Key {
    pub op: Op,
    pub dom: Domain,
    pub ns: Namespace,
    pub ns_part: String,
    pub id: String,
    pub id_part: String,
    pub core: String,
}

impl Key {
    pub fn new(ns: Namespace, ns_part: impl Into<String>, core: impl Into<String>) -> Self {
        Self {
            op: Op::Set,
            dom: Domain::Undefined,
            ns,
            ns_part: ns_part.into(),
            id: String::new(),
            id_part: String::new(),
            core: core.into(),
        }
    }

    pub fn with_op(mut self, op: Op) -> Self {
        self.op = op;
        self
    }

    pub fn with_dom(mut self, dom: Domain) -> Self {
        self.dom = dom;
        self
    }

    pub fn with_id(mut self, id: impl Into<String>, id_part: impl Into<String>) -> Self {
        self.id = id.into();
        self.id_part = id_part.into();
        self
    }

    /// Build a device-scoped key: `ns_part` is the device's `major_minor`.
    pub fn device(major_minor: impl Into<String>, core: impl Into<String>) -> Self {
        Self::new(Namespace::Device, major_minor, core)
    }

    /// Build a module-scoped key: `ns_part` is the module name.
    pub fn module(module_name: impl Into<String>, core: impl Into<String>) -> Self {
        Self::new(Namespace::Module, module_name, core)
    }

    /// Build a global key (`ns_part` is conventionally empty).
    pub fn global(core: impl Into<String>) -> Self {
        Self::new(Namespace::Global, "", core)
    }

    /// Compose the full key, including the final `:<core>` field.
    pub fn compose(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            1 + self.op.as_str().len()
                + self.dom.as_str().len()
                + self.ns.as_str().len()
                + self.ns_part.len()
                + self.id.len()
                + self.id_part.len()
                + self.core.len()
                + 6
                + 1,
        );
        out.push(ALIAS_SLOT_DEFAULT);
        out.extend_from_slice(self.op.as_str().as_bytes());
        out.push(DELIM);
        out.extend_from_slice(self.dom.as_str().as_bytes());
        out.push(DELIM);
        out.extend_from_slice(self.ns.as_str().as_bytes());
        out.push(DELIM);
        out.extend_from_slice(self.ns_part.as_bytes());
        out.push(DELIM);
        out.extend_from_slice(self.id.as_bytes());
        out.push(DELIM);
        out.extend_from_slice(self.id_part.as_bytes());
        out.push(DELIM);
        out.extend_from_slice(self.core.as_bytes());
        out
    }

    /// Compose the prefix-only form, omitting the final `:<core>` field.
    /// This is the anchor used for relation-inverse values.
    pub fn compose_prefix(&self) -> Vec<u8> {
        let full = self.compose();
        // Strip back to just before the final delimiter.
        let core_len = self.core.len();
        full[..full.len() - core_len - 1].to_vec()
    }

    /// Parse a composed key, including its leading alias-slot byte.
    pub fn parse(bytes: &[u8]) -> Option<Key> {
        if bytes.is_empty() {
            return None;
        }
        let rest = &bytes[1..];
        let parts: Vec<&[u8]> = rest.splitn(7, |&b| b == DELIM).collect();
        if parts.len() != 7 {
            return None;
        }
        Some(Key {
            op: Op::from_bytes(parts[0]),
            dom: Domain::from_bytes(parts[1]),
            ns: Namespace::from_bytes(parts[2]),
            ns_part: String::from_utf8_lossy(parts[3]).into_owned(),
            id: String::from_utf8_lossy(parts[4]).into_owned(),
            id_part: String::from_utf8_lossy(parts[5]).into_owned(),
            core: String::from_utf8_lossy(parts[6]).into_owned(),
        })
    }

    /// Whether `bytes` is a composed key with the given alias slot.
    pub fn is_alias_bytes(bytes: &[u8]) -> bool {
        bytes.first() == Some(&ALIAS_PREFIX)
    }
}

/// Rewrite the leading alias-slot byte of a composed key in place, producing
/// its companion index-alias key without reallocating the remainder.
pub fn to_alias_in_place(composed: &mut [u8]) {
    if let Some(first) = composed.first_mut() {
        *first = ALIAS_PREFIX;
    }
}

/// Produce a new buffer that is `composed`'s alias form, without mutating
/// the input (used when the primary key is still needed).
pub fn to_alias(composed: &[u8]) -> Vec<u8> {
    let mut out = composed.to_vec();
    to_alias_in_place(&mut out);
    out
}

/// The iteration bounds `[">", "?")` over the alias range: yields
/// exactly the SYNC-flagged records in key order.
pub fn alias_range() -> (Vec<u8>, Vec<u8>) {
    (vec![ALIAS_PREFIX], vec![ALIAS_RANGE_END])
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}:{}:{}:{}",
            self.op.as_str(),
            self.dom.as_str(),
            self.ns.as_str(),
            self.ns_part,
            self.id,
            self.id_part,
            self.core
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compose_parse_round_trip() {
        let key = Key::device("8_0", "#RDY").with_dom(Domain::Undefined);
        let composed = key.compose();
        let parsed = Key::parse(&composed).unwrap();
        assert_eq!(parsed, key);
    }

    #[test]
    fn alias_round_trip_preserves_length() {
        let key = Key::device("8_0", "GMB").with_dom(Domain::Layer);
        let composed = key.compose();
        let alias = to_alias(&composed);
        assert_eq!(alias.len(), composed.len());
        assert!(Key::is_alias_bytes(&alias));
        assert!(!Key::is_alias_bytes(&composed));
    }

    #[test]
    fn prefix_omits_core() {
        let key = Key::device("8_0", "GMB").with_id("grp", "1");
        let full = key.compose();
        let prefix = key.compose_prefix();
        assert!(full.starts_with(&prefix));
        assert_eq!(full.len(), prefix.len() + 1 + key.core.len());
    }

    #[test]
    fn udev_namespace_is_blob_only() {
        assert!(Namespace::Udev.blob_only());
        assert!(!Namespace::Device.blob_only());
    }

    #[test]
    fn delta_companion_ops_round_trip() {
        for op in [Op::Set, Op::Plus, Op::Minus, Op::Illegal] {
            let key = Key::device("8_0", "GMB").with_op(op);
            let parsed = Key::parse(&key.compose()).unwrap();
            assert_eq!(parsed.op, op);
        }
    }
}
