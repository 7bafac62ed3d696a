// On-disk layout of a GSD file. All integers little-endian, all offsets
// absolute byte positions.
//
//   [ header, 256 bytes at offset 0 ]
//   [ chunk payloads ... ]
//   [ index block: index_allocated_entries fixed-size slots ]
//   [ namelist block: namelist_allocated_entries 64-byte slots ]
//
// Committed chunk payloads always precede the committed index block; the
// header pointers are rewritten last on every commit.

use crate::gsd_lib::error::{GsdError, Result};
use crate::gsd_lib::utils::{decode_fixed_str, encode_fixed_str};
use num_enum::{IntoPrimitive, TryFromPrimitive};

pub const GSD_MAGIC: u64 = 0x65DF_65DF_65DF_65DF;
pub const HEADER_SIZE: u64 = 256;
pub const INDEX_ENTRY_V1_SIZE: u64 = 64;
pub const INDEX_ENTRY_V2_SIZE: u64 = 32;
pub const NAMELIST_ENTRY_SIZE: u64 = 64;
/// Longest name, application or schema string in bytes (field width minus
/// the reserved terminator).
pub const MAX_STRING_BYTES: usize = 63;

/// Version written by this implementation, packed `major << 16 | minor`.
pub const GSD_CURRENT_VERSION: u32 = (2 << 16) | 1;

pub fn pack_version(major: u16, minor: u16) -> u32 {
    (major as u32) << 16 | minor as u32
}

pub fn unpack_version(v: u32) -> (u16, u16) {
    ((v >> 16) as u16, (v & 0xffff) as u16)
}

/// Element type of a chunk payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum TypeCode {
    U8 = 1,
    U16 = 2,
    U32 = 3,
    U64 = 4,
    I8 = 5,
    I16 = 6,
    I32 = 7,
    I64 = 8,
    F32 = 9,
    F64 = 10,
}

impl TypeCode {
    /// Map a raw code; anything outside 1..=10 is rejected.
    pub fn from_u8(code: u8) -> Result<Self> {
        Self::try_from(code).map_err(|_| GsdError::UnsupportedType(code))
    }

    /// Element size in bytes.
    pub fn size(self) -> u64 {
        match self {
            TypeCode::U8 | TypeCode::I8 => 1,
            TypeCode::U16 | TypeCode::I16 => 2,
            TypeCode::U32 | TypeCode::I32 | TypeCode::F32 => 4,
            TypeCode::U64 | TypeCode::I64 | TypeCode::F64 => 8,
        }
    }
}

/// `type_size(code)` of the format contract; `None` for unknown codes.
pub fn type_size(code: u8) -> Option<u64> {
    TypeCode::try_from(code).ok().map(TypeCode::size)
}

/// The fixed 256-byte file header.
#[derive(Debug, Clone)]
pub struct GsdHeader {
    pub magic: u64,
    pub index_location: u64,
    pub index_allocated_entries: u64,
    pub namelist_location: u64,
    pub namelist_allocated_entries: u64,
    pub schema_version: u32,
    pub gsd_version: u32,
    pub application: String,
    pub schema: String,
}

impl GsdHeader {
    pub fn encode(&self) -> [u8; HEADER_SIZE as usize] {
        let mut out = [0u8; HEADER_SIZE as usize];
        out[0..8].copy_from_slice(&self.magic.to_le_bytes());
        out[8..16].copy_from_slice(&self.index_location.to_le_bytes());
        out[16..24].copy_from_slice(&self.index_allocated_entries.to_le_bytes());
        out[24..32].copy_from_slice(&self.namelist_location.to_le_bytes());
        out[32..40].copy_from_slice(&self.namelist_allocated_entries.to_le_bytes());
        out[40..44].copy_from_slice(&self.schema_version.to_le_bytes());
        out[44..48].copy_from_slice(&self.gsd_version.to_le_bytes());
        encode_fixed_str(&self.application, &mut out[48..112]);
        encode_fixed_str(&self.schema, &mut out[112..176]);
        // bytes 176..256 reserved, zero
        out
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        let magic = read_u64(raw, 0);
        if magic != GSD_MAGIC {
            return Err(GsdError::NotAGsdFile);
        }
        let gsd_version = read_u32(raw, 44);
        let (major, minor) = unpack_version(gsd_version);
        if major < 1 || major > 2 {
            return Err(GsdError::UnsupportedVersion { major, minor });
        }
        Ok(Self {
            magic,
            index_location: read_u64(raw, 8),
            index_allocated_entries: read_u64(raw, 16),
            namelist_location: read_u64(raw, 24),
            namelist_allocated_entries: read_u64(raw, 32),
            schema_version: read_u32(raw, 40),
            gsd_version,
            application: decode_fixed_str(&raw[48..112]),
            schema: decode_fixed_str(&raw[112..176]),
        })
    }

    pub fn version_major(&self) -> u16 {
        unpack_version(self.gsd_version).0
    }
}

/// One frame-chunk descriptor. `location == 0` marks an unused slot and
/// terminates the active prefix of the index block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IndexEntry {
    pub frame: u64,
    pub n: u64,
    pub location: i64,
    pub m: u32,
    pub id: u16,
    pub type_code: u8,
    pub flags: u8,
}

impl IndexEntry {
    pub fn is_used(&self) -> bool {
        self.location != 0
    }

    /// Payload size in bytes, `None` on unknown type or overflow.
    pub fn payload_len(&self) -> Option<u64> {
        let elem = type_size(self.type_code)?;
        self.n.checked_mul(self.m as u64)?.checked_mul(elem)
    }

    pub fn sort_key(&self) -> (u64, u16) {
        (self.frame, self.id)
    }
}

/// v2 layout: 32 bytes, `frame u64, N u64, location i64, M u32, id u16,
/// type u8, flags u8`.
pub fn encode_index_entry_v2(entry: &IndexEntry) -> [u8; INDEX_ENTRY_V2_SIZE as usize] {
    let mut out = [0u8; INDEX_ENTRY_V2_SIZE as usize];
    out[0..8].copy_from_slice(&entry.frame.to_le_bytes());
    out[8..16].copy_from_slice(&entry.n.to_le_bytes());
    out[16..24].copy_from_slice(&entry.location.to_le_bytes());
    out[24..28].copy_from_slice(&entry.m.to_le_bytes());
    out[28..30].copy_from_slice(&entry.id.to_le_bytes());
    out[30] = entry.type_code;
    out[31] = entry.flags;
    out
}

pub fn decode_index_entry_v2(raw: &[u8]) -> IndexEntry {
    IndexEntry {
        frame: read_u64(raw, 0),
        n: read_u64(raw, 8),
        location: read_u64(raw, 16) as i64,
        m: read_u32(raw, 24),
        id: u16::from_le_bytes([raw[28], raw[29]]),
        type_code: raw[30],
        flags: raw[31],
    }
}

/// v1 layout: 64 bytes, same fields widened to 64-bit slots (`frame, N,
/// location, M, id, type, flags`, 8 reserved bytes). Narrowing failures
/// mean a used entry cannot have been produced by a v1 writer; an unused
/// slot (`location == 0`) terminates the active prefix and is passed
/// through untouched, whatever its other bytes hold.
pub fn decode_index_entry_v1(raw: &[u8]) -> Result<IndexEntry> {
    if read_u64(raw, 16) == 0 {
        return Ok(IndexEntry::default());
    }
    let narrow = |offset: usize, max: u64, field: &str| -> Result<u64> {
        let v = read_u64(raw, offset);
        if v > max {
            return Err(GsdError::Corrupt(format!(
                "v1 index field {} out of range: {}",
                field, v
            )));
        }
        Ok(v)
    };
    Ok(IndexEntry {
        frame: read_u64(raw, 0),
        n: read_u64(raw, 8),
        location: read_u64(raw, 16) as i64,
        m: narrow(24, u32::MAX as u64, "M")? as u32,
        id: narrow(32, u16::MAX as u64, "id")? as u16,
        type_code: narrow(40, u8::MAX as u64, "type")? as u8,
        flags: narrow(48, u8::MAX as u64, "flags")? as u8,
    })
}

pub fn index_entry_size(version_major: u16) -> u64 {
    if version_major == 1 {
        INDEX_ENTRY_V1_SIZE
    } else {
        INDEX_ENTRY_V2_SIZE
    }
}

/// Encode a chunk name into a 64-byte namelist slot.
pub fn encode_name(name: &str) -> [u8; NAMELIST_ENTRY_SIZE as usize] {
    let mut out = [0u8; NAMELIST_ENTRY_SIZE as usize];
    encode_fixed_str(name, &mut out);
    out
}

fn read_u64(raw: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(raw[offset..offset + 8].try_into().unwrap())
}

fn read_u32(raw: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(raw[offset..offset + 4].try_into().unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    fn sample_header() -> GsdHeader {
        GsdHeader {
            magic: GSD_MAGIC,
            index_location: 256,
            index_allocated_entries: 128,
            namelist_location: 4352,
            namelist_allocated_entries: 128,
            schema_version: pack_version(1, 4),
            gsd_version: GSD_CURRENT_VERSION,
            application: "test app".to_string(),
            schema: "hoomd".to_string(),
        }
    }

    #[test]
    fn header_roundtrip() -> Result<()> {
        let header = sample_header();
        let raw = header.encode();
        let back = GsdHeader::decode(&raw)?;
        assert_eq!(back.index_location, 256);
        assert_eq!(back.namelist_allocated_entries, 128);
        assert_eq!(back.application, "test app");
        assert_eq!(back.schema, "hoomd");
        assert_eq!(unpack_version(back.schema_version), (1, 4));
        Ok(())
    }

    #[test]
    fn bad_magic_rejected() {
        let mut raw = sample_header().encode();
        raw[0] = 0;
        assert!(matches!(
            GsdHeader::decode(&raw),
            Err(GsdError::NotAGsdFile)
        ));
    }

    #[test]
    fn version_out_of_range_rejected() {
        let mut header = sample_header();
        header.gsd_version = pack_version(3, 0);
        assert!(matches!(
            GsdHeader::decode(&header.encode()),
            Err(GsdError::UnsupportedVersion { major: 3, minor: 0 })
        ));
        header.gsd_version = pack_version(0, 9);
        assert!(GsdHeader::decode(&header.encode()).is_err());
    }

    #[test]
    fn index_entry_v2_roundtrip() {
        let entry = IndexEntry {
            frame: 12,
            n: 1000,
            location: 99_000,
            m: 3,
            id: 7,
            type_code: TypeCode::F32.into(),
            flags: 0,
        };
        let raw = encode_index_entry_v2(&entry);
        assert_eq!(decode_index_entry_v2(&raw), entry);
    }

    #[test]
    fn index_entry_v1_widened() -> Result<()> {
        let mut raw = [0u8; INDEX_ENTRY_V1_SIZE as usize];
        raw[0..8].copy_from_slice(&5u64.to_le_bytes()); // frame
        raw[8..16].copy_from_slice(&6u64.to_le_bytes()); // N
        raw[16..24].copy_from_slice(&1024i64.to_le_bytes()); // location
        raw[24..32].copy_from_slice(&2u64.to_le_bytes()); // M
        raw[32..40].copy_from_slice(&3u64.to_le_bytes()); // id
        raw[40..48].copy_from_slice(&9u64.to_le_bytes()); // type
        let entry = decode_index_entry_v1(&raw)?;
        assert_eq!(entry.frame, 5);
        assert_eq!(entry.n, 6);
        assert_eq!(entry.location, 1024);
        assert_eq!(entry.m, 2);
        assert_eq!(entry.id, 3);
        assert_eq!(entry.type_code, u8::from(TypeCode::F32));
        Ok(())
    }

    #[test]
    fn index_entry_v1_narrow_overflow_is_corrupt() {
        let mut raw = [0u8; INDEX_ENTRY_V1_SIZE as usize];
        raw[16..24].copy_from_slice(&1024i64.to_le_bytes());
        raw[32..40].copy_from_slice(&0x1_0000u64.to_le_bytes()); // id too wide
        assert!(matches!(
            decode_index_entry_v1(&raw),
            Err(GsdError::Corrupt(_))
        ));
    }

    #[test]
    fn index_entry_v1_unused_slot_tolerates_junk() -> Result<()> {
        // location 0 terminates the active prefix; junk in the other
        // widened fields (unzeroed buffer from a foreign writer) must not
        // read as corruption
        let mut raw = [0u8; INDEX_ENTRY_V1_SIZE as usize];
        raw[24..32].copy_from_slice(&u64::MAX.to_le_bytes()); // M
        raw[32..40].copy_from_slice(&u64::MAX.to_le_bytes()); // id
        raw[40..48].copy_from_slice(&u64::MAX.to_le_bytes()); // type
        raw[48..56].copy_from_slice(&u64::MAX.to_le_bytes()); // flags
        let entry = decode_index_entry_v1(&raw)?;
        assert!(!entry.is_used());
        Ok(())
    }

    #[test]
    fn type_codes() {
        assert_eq!(type_size(1), Some(1)); // u8
        assert_eq!(type_size(2), Some(2)); // u16
        assert_eq!(type_size(3), Some(4)); // u32
        assert_eq!(type_size(4), Some(8)); // u64
        assert_eq!(type_size(5), Some(1)); // i8
        assert_eq!(type_size(6), Some(2)); // i16
        assert_eq!(type_size(7), Some(4)); // i32
        assert_eq!(type_size(8), Some(8)); // i64
        assert_eq!(type_size(9), Some(4)); // f32
        assert_eq!(type_size(10), Some(8)); // f64
        assert_eq!(type_size(0), None);
        assert_eq!(type_size(11), None);
        assert!(matches!(
            TypeCode::from_u8(11),
            Err(GsdError::UnsupportedType(11))
        ));
    }

    #[test]
    fn payload_len_overflow_checked() {
        let entry = IndexEntry {
            frame: 0,
            n: u64::MAX,
            location: 300,
            m: 2,
            id: 0,
            type_code: TypeCode::U8.into(),
            flags: 0,
        };
        assert_eq!(entry.payload_len(), None);
    }
}
