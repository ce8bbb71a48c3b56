//! KV record types.

use bitflags::bitflags;

bitflags! {
    /// Per-record flag bitset.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RecordFlags: u8 {
        /// Mirrored into the `>`-prefixed index alias range.
        const SYNC           = 0b0000_0001;
        /// Survives an explicit persistent-snapshot command.
        const PERSISTENT     = 0b0000_0010;
        /// Immutable to any writer other than the owning module; EPERM.
        const MOD_PROTECTED  = 0b0000_0100;
        /// Immutable to any writer other than the owning module; EACCES.
        const MOD_PRIVATE    = 0b0000_1000;
        /// Immutable to any writer other than the owning module; EBUSY.
        const MOD_RESERVED   = 0b0001_0000;
    }
}

impl RecordFlags {
    /// Any of the three ownership-protection flags.
    pub fn ownership_flags(self) -> RecordFlags {
        self & (RecordFlags::MOD_PRIVATE | RecordFlags::MOD_PROTECTED | RecordFlags::MOD_RESERVED)
    }

    pub fn is_protected(self) -> bool {
        !self.ownership_flags().is_empty()
    }
}

/// The header fields common to every record, whether blob or vector-valued.
/// For a vector value these are the first four element
/// slices of the stored vector; see [`super::wire`] for that exact encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordHeader {
    pub gennum: u64,
    pub seqnum: u64,
    pub flags: RecordFlags,
    pub owner: String,
}

/// The record body: either an opaque blob, or a vector of sorted payload
/// elements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordBody {
    Blob(Vec<u8>),
    /// Payload elements only (header excluded); invariant: strictly
    /// ascending under byte-wise (`memcmp`) comparison.
    Vector(Vec<Vec<u8>>),
}

impl RecordBody {
    pub fn is_vector(&self) -> bool {
        matches!(self, RecordBody::Vector(_))
    }

    /// Whether a vector body's elements are strictly ascending.
    pub fn is_sorted(&self) -> bool {
        match self {
            RecordBody::Blob(_) => true,
            RecordBody::Vector(elems) => elems.windows(2).all(|w| w[0] < w[1]),
        }
    }

    pub fn empty_vector() -> Self {
        RecordBody::Vector(Vec::new())
    }
}

/// A complete stored record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub header: RecordHeader,
    pub body: RecordBody,
}

impl Record {
    pub fn new(header: RecordHeader, body: RecordBody) -> Self {
        Self { header, body }
    }

    pub fn is_vector(&self) -> bool {
        self.body.is_vector()
    }

    pub fn as_blob(&self) -> Option<&[u8]> {
        match &self.body {
            RecordBody::Blob(b) => Some(b),
            RecordBody::Vector(_) => None,
        }
    }

    pub fn as_vector(&self) -> Option<&[Vec<u8>]> {
        match &self.body {
            RecordBody::Blob(_) => None,
            RecordBody::Vector(v) => Some(v),
        }
    }
}

/// The literal `{gennum, seqnum, flags, owner, elements...}` vector-of-slices
/// wire layout used for the sync export serialization. Kept separate from
/// the typed [`Record`] used for in-process
/// store logic: the B+-tree backing the store is out of scope, so only
/// this value-level contract — not a particular in-memory layout — is
/// binding.
pub mod wire {
    use super::*;

    /// Encode a record's header + vector body as the four-header-slice plus
    /// payload-slices layout.
    pub fn encode_vector_iovecs(header: &RecordHeader, elements: &[Vec<u8>]) -> Vec<Vec<u8>> {
        let mut out = Vec::with_capacity(4 + elements.len());
        out.push(header.gennum.to_le_bytes().to_vec());
        out.push(header.seqnum.to_le_bytes().to_vec());
        out.push(vec![header.flags.bits()]);
        out.push(header.owner.clone().into_bytes());
        out.extend(elements.iter().cloned());
        out
    }

    /// Decode the four-header-slice plus payload-slices layout. Returns
    /// `None` if fewer than four slices are present.
    pub fn decode_vector_iovecs(slices: &[Vec<u8>]) -> Option<(RecordHeader, Vec<Vec<u8>>)> {
        if slices.len() < 4 {
            return None;
        }
        let gennum = u64::from_le_bytes(slices[0].as_slice().try_into().ok()?);
        let seqnum = u64::from_le_bytes(slices[1].as_slice().try_into().ok()?);
        let flags = RecordFlags::from_bits_truncate(*slices[2].first()?);
        let owner = String::from_utf8(slices[3].clone()).ok()?;
        let elements = slices[4..].to_vec();
        Some((RecordHeader { gennum, seqnum, flags, owner }, elements))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hdr() -> RecordHeader {
        RecordHeader { gennum: 1, seqnum: 42, flags: RecordFlags::SYNC, owner: "sid-dm".into() }
    }

    #[test]
    fn vector_sortedness() {
        let sorted = RecordBody::Vector(vec![b"8_1".to_vec(), b"8_2".to_vec(), b"8_3".to_vec()]);
        assert!(sorted.is_sorted());
        let unsorted = RecordBody::Vector(vec![b"8_3".to_vec(), b"8_1".to_vec()]);
        assert!(!unsorted.is_sorted());
    }

    #[test]
    fn wire_round_trip() {
        let header = hdr();
        let elements = vec![b"8_1".to_vec(), b"8_2".to_vec()];
        let iovecs = wire::encode_vector_iovecs(&header, &elements);
        assert_eq!(iovecs.len(), 6);
        let (decoded_header, decoded_elements) = wire::decode_vector_iovecs(&iovecs).unwrap();
        assert_eq!(decoded_header, header);
        assert_eq!(decoded_elements, elements);
    }

    #[test]
    fn ownership_flags_detection() {
        assert!(RecordFlags::MOD_PRIVATE.is_protected());
        assert!(RecordFlags::MOD_PROTECTED.is_protected());
        assert!(RecordFlags::MOD_RESERVED.is_protected());
        assert!(!RecordFlags::SYNC.is_protected());
        assert!(!RecordFlags::empty().is_protected());
    }
}
