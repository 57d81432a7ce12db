//! The packed 256-bit form of a handle, used when handles cross a
//! serialization boundary (repository files, hashing, the wire).
//!
//! ```text
//! bytes  | literal          | canonical              | local
//! 0..24  | data[0..24]      | digest                 | word 0: counter, then 0
//! 24..30 | data[24..30]     | size (48 bit LE)       | size (48 bit LE)
//! 30     | metadata         | metadata               | metadata
//! 31     | literal length   | flags (bit 0: tag)     | flags (bit 0: tag)
//! ```
//!
//! The metadata byte holds the shape code in its low 6 bits and the naming
//! class in its top 2 bits.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::{Blob, Digest, Fix, Literal, Name, Payload, TreeName, DIGEST_LEN, LITERAL_MAX};
use crate::error::{FixError, Result};

const METADATA: usize = 30;
const LAST: usize = 31;
const SHAPE_MASK: u8 = 0b0011_1111;
const TAG_FLAG: u8 = 1;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[repr(u8)]
enum Naming {
    Canonical = 0,
    Local = 1,
    Literal = 2,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RawHandle(pub [u8; 32]);

impl RawHandle {
    /// The four little-endian words
    pub fn words(&self) -> [u64; 4] {
        let mut words = [0; 4];
        for (i, chunk) in self.0.chunks_exact(8).enumerate() {
            words[i] = u64::from_le_bytes(chunk.try_into().expect("chunks are 8 bytes"));
        }
        words
    }

    pub fn from_words(words: [u64; 4]) -> Self {
        let mut bytes = [0; 32];
        for (i, w) in words.iter().enumerate() {
            bytes[i * 8..(i + 1) * 8].copy_from_slice(&w.to_le_bytes());
        }
        RawHandle(bytes)
    }

    #[inline]
    pub fn metadata(&self) -> u8 {
        self.0[METADATA]
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|e| FixError::MalformedHandle(e.to_string()))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| FixError::MalformedHandle(format!("{s} is not 32 bytes")))?;
        Ok(RawHandle(bytes))
    }
}

impl fmt::Debug for RawHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RawHandle({})", self.to_hex())
    }
}

fn write_size(bytes: &mut [u8; 32], size: u64) {
    bytes[24..30].copy_from_slice(&size.to_le_bytes()[..6]);
}

fn read_size(bytes: &[u8; 32]) -> u64 {
    let mut buf = [0; 8];
    buf[..6].copy_from_slice(&bytes[24..30]);
    u64::from_le_bytes(buf)
}

fn write_name(bytes: &mut [u8; 32], name: &Name) -> Naming {
    match name {
        Name::Canonical { digest, size } => {
            bytes[..DIGEST_LEN].copy_from_slice(&digest.0);
            write_size(bytes, *size);
            Naming::Canonical
        }
        Name::Local { id, size } => {
            bytes[..8].copy_from_slice(&id.to_le_bytes());
            write_size(bytes, *size);
            Naming::Local
        }
    }
}

fn read_name(bytes: &[u8; 32], naming: Naming) -> Name {
    let size = read_size(bytes);
    match naming {
        Naming::Canonical => {
            let mut digest = [0; DIGEST_LEN];
            digest.copy_from_slice(&bytes[..DIGEST_LEN]);
            Name::canonical(Digest(digest), size)
        }
        Naming::Local => {
            let id = u64::from_le_bytes(bytes[..8].try_into().expect("8 bytes"));
            Name::local(id, size)
        }
        Naming::Literal => unreachable!("literals carry no name"),
    }
}

impl Fix {
    pub fn to_raw(&self) -> RawHandle {
        let mut bytes = [0; 32];
        let naming = match self.payload() {
            Payload::Blob(Blob::Literal(l)) => {
                bytes[..l.len()].copy_from_slice(l.as_bytes());
                bytes[LAST] = l.len() as u8;
                Naming::Literal
            }
            Payload::Blob(Blob::Named(n)) => write_name(&mut bytes, &n),
            Payload::Tree(t) => {
                let naming = write_name(&mut bytes, t.name());
                if t.is_tag() {
                    bytes[LAST] |= TAG_FLAG;
                }
                naming
            }
        };
        bytes[METADATA] = self.code() | ((naming as u8) << 6);
        RawHandle(bytes)
    }

    pub fn from_raw(raw: &RawHandle) -> Result<Fix> {
        let bytes = &raw.0;
        let metadata = bytes[METADATA];
        let code = metadata & SHAPE_MASK;
        let malformed = |why: &str| FixError::MalformedHandle(format!("{raw:?}: {why}"));
        let naming = match metadata >> 6 {
            0 => Naming::Canonical,
            1 => Naming::Local,
            2 => Naming::Literal,
            _ => return Err(malformed("unknown naming class")),
        };
        let payload = if naming == Naming::Literal {
            let len = bytes[LAST] as usize;
            if len > LITERAL_MAX {
                return Err(malformed("literal too long"));
            }
            if bytes[len..METADATA].iter().any(|&b| b != 0) {
                return Err(malformed("bytes past the literal's end"));
            }
            let lit = Literal::new(&bytes[..len]).expect("length was checked");
            Payload::Blob(Blob::Literal(lit))
        } else {
            if bytes[LAST] & !TAG_FLAG != 0 {
                return Err(malformed("unknown flags"));
            }
            if naming == Naming::Local && bytes[8..DIGEST_LEN].iter().any(|&b| b != 0) {
                return Err(malformed("local name padding"));
            }
            let name = read_name(bytes, naming);
            // The shape decides whether the name is a blob or a tree; try the
            // blob reading first and fall back to a tree.
            let tag = bytes[LAST] & TAG_FLAG != 0;
            if !tag {
                if let Some(fix) = Fix::from_code(code, Payload::Blob(Blob::Named(name))) {
                    return Ok(fix);
                }
            }
            Payload::Tree(TreeName::new(name, tag))
        };
        Fix::from_code(code, payload).ok_or_else(|| malformed("shape does not fit payload"))
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::{Naming, RawHandle, LAST, METADATA, SHAPE_MASK};
    use crate::handle::{
        Blob, BlobRef, Digest, Encode, ExpressionTree, Fix, Name, Object, ObjectTree, Payload,
        Relation, Thunk, TreeName, Value, ValueTree, DIGEST_LEN, LITERAL_MAX, SIZE_MASK,
    };

    fn arb_name() -> impl Strategy<Value = Name> {
        prop_oneof![
            (any::<[u8; DIGEST_LEN]>(), 0..SIZE_MASK)
                .prop_map(|(d, s)| Name::canonical(Digest(d), s)),
            (any::<u64>(), 0..SIZE_MASK).prop_map(|(id, s)| Name::local(id, s)),
        ]
    }

    fn arb_payload() -> impl Strategy<Value = Payload> {
        prop_oneof![
            prop::collection::vec(any::<u8>(), 0..=LITERAL_MAX)
                .prop_map(|v| Payload::Blob(Blob::literal(&v).unwrap())),
            arb_name().prop_map(|n| Payload::Blob(Blob::Named(n))),
            (arb_name(), any::<bool>()).prop_map(|(n, t)| Payload::Tree(TreeName::new(n, t))),
        ]
    }

    proptest! {
        #[test]
        fn raw_encoding_is_faithful(code in 0..Fix::SHAPES, payload in arb_payload()) {
            if let Some(fix) = Fix::from_code(code, payload) {
                let raw = fix.to_raw();
                prop_assert_eq!(Fix::from_raw(&raw).unwrap(), fix);
                prop_assert_eq!(RawHandle::from_words(raw.words()), raw);
            }
        }
    }

    #[test]
    fn test_literal_layout() {
        let fix = Fix::from(Blob::literal(b"abc").unwrap());
        let raw = fix.to_raw();
        assert_eq!(&raw.0[..3], b"abc");
        assert_eq!(raw.0[LAST], 3);
        assert_eq!(raw.metadata() >> 6, Naming::Literal as u8);
        assert_eq!(raw.metadata() & SHAPE_MASK, 0);
    }

    #[test]
    fn test_size_in_low_48_bits_of_last_word() {
        let name = Name::canonical(Digest([0xaa; DIGEST_LEN]), 0x1234_5678_9abc);
        let fix = Fix::from(ValueTree(TreeName::new(name, false)));
        let words = fix.to_raw().words();
        assert_eq!(words[3] & SIZE_MASK, 0x1234_5678_9abc);
    }

    #[test]
    fn test_local_counter_in_word_zero() {
        let fix = Fix::from(Blob::Named(Name::local(42, 1000)));
        let raw = fix.to_raw();
        assert_eq!(raw.words()[0], 42);
        assert!(Fix::from_raw(&raw).unwrap().is_local());
    }

    #[test]
    fn test_distinct_shapes_distinct_bits() {
        let tree = TreeName::new(Name::local(1, 2), false);
        let handles: Vec<Fix> = vec![
            ObjectTree(tree).into(),
            ExpressionTree(tree).into(),
            Thunk::Selection(ObjectTree(tree)).into(),
            Encode::Shallow(Thunk::Selection(ObjectTree(tree))).into(),
            Relation::Apply(ObjectTree(tree)).into(),
            Relation::Eval(Object::ObjectTree(ObjectTree(tree))).into(),
            Value::BlobRef(BlobRef(Blob::from_u64(1))).into(),
        ];
        for (i, a) in handles.iter().enumerate() {
            for b in &handles[i + 1..] {
                assert_ne!(a.to_raw(), b.to_raw());
            }
        }
    }

    #[test]
    fn test_rejects_garbage() {
        let mut bytes = [0; 32];
        bytes[METADATA] = 0b1100_0000;
        assert!(Fix::from_raw(&RawHandle(bytes)).is_err());
        bytes[METADATA] = Fix::SHAPES;
        assert!(Fix::from_raw(&RawHandle(bytes)).is_err());
        bytes[METADATA] = 2 << 6;
        bytes[LAST] = 31;
        assert!(Fix::from_raw(&RawHandle(bytes)).is_err());
    }

    #[test]
    fn test_rejects_non_canonical_padding() {
        let literal = Fix::from(Blob::literal(b"abc").unwrap()).to_raw();
        let mut trailing = literal;
        trailing.0[10] = 1;
        assert_ne!(trailing, literal);
        assert!(Fix::from_raw(&trailing).is_err());

        let local = Fix::from(Blob::Named(Name::local(42, 1000))).to_raw();
        let mut padded = local;
        padded.0[12] = 0xff;
        assert!(Fix::from_raw(&padded).is_err());

        let canonical = Fix::from(Blob::Named(Name::canonical(Digest([7; DIGEST_LEN]), 64)));
        let mut flagged = canonical.to_raw();
        flagged.0[LAST] = 0x80;
        assert!(Fix::from_raw(&flagged).is_err());
        assert_eq!(Fix::from_raw(&canonical.to_raw()).unwrap(), canonical);
    }
}
