//! NDR primitive type implementations
//!
//! NDR primitive types and their encodings:
//!
//! | IDL Type       | Rust Type       | Size | Alignment |
//! |----------------|-----------------|------|-----------|
//! | boolean        | bool            | 1    | 1         |
//! | byte/char      | u8              | 1    | 1         |
//! | small          | i8              | 1    | 1         |
//! | short          | i16             | 2    | 2         |
//! | long/int       | i32             | 4    | 4         |
//! | hyper          | i64             | 8    | 8         |
//! | unsigned short | u16             | 2    | 2         |
//! | unsigned long  | u32             | 4    | 4         |
//! | unsigned hyper | u64             | 8    | 8         |
//! | float          | f32             | 4    | 4         |
//! | double         | f64             | 8    | 8         |
//! | enum           | [`Enum16`]      | 2    | 2         |
//! | v1_enum        | [`Enum32`]      | 4    | 4         |
//! | GUID           | [`Uuid`]        | 16   | 4         |
//! | context handle | [`ContextHandle`] | 20 | 4         |

use std::fmt;
use std::str::FromStr;

use crate::error::NdrError;
use crate::{NdrDecode, NdrEncode, NdrReader, NdrWriter, Result};

macro_rules! impl_ndr_primitive {
    ($ty:ty, $size:expr, $write:ident, $read:ident) => {
        impl NdrEncode for $ty {
            #[inline]
            fn ndr_encode<'a>(&'a self, w: &mut NdrWriter<'a>) -> Result<()> {
                w.$write(*self);
                Ok(())
            }

            fn ndr_align() -> usize {
                $size
            }
        }

        impl NdrDecode for $ty {
            #[inline]
            fn ndr_decode(r: &mut NdrReader) -> Result<Self> {
                r.$read()
            }

            fn ndr_align() -> usize {
                $size
            }

            fn ndr_min_size() -> usize {
                $size
            }
        }
    };
}

impl_ndr_primitive!(u8, 1, write_u8, read_u8);
impl_ndr_primitive!(i8, 1, write_i8, read_i8);
impl_ndr_primitive!(bool, 1, write_bool, read_bool);
impl_ndr_primitive!(u16, 2, write_u16, read_u16);
impl_ndr_primitive!(i16, 2, write_i16, read_i16);
impl_ndr_primitive!(u32, 4, write_u32, read_u32);
impl_ndr_primitive!(i32, 4, write_i32, read_i32);
impl_ndr_primitive!(u64, 8, write_u64, read_u64);
impl_ndr_primitive!(i64, 8, write_i64, read_i64);
impl_ndr_primitive!(f32, 4, write_f32, read_f32);
impl_ndr_primitive!(f64, 8, write_f64, read_f64);

/// 16-bit NDR enumeration.
///
/// Values travel as an unsigned short but must fit in 15 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Enum16(pub u16);

impl Enum16 {
    pub const MAX: u16 = 0x7fff;
}

impl NdrEncode for Enum16 {
    fn ndr_encode<'a>(&'a self, w: &mut NdrWriter<'a>) -> Result<()> {
        if self.0 > Self::MAX {
            return Err(NdrError::InvalidEnumValue(self.0.into()));
        }
        w.write_u16(self.0);
        Ok(())
    }

    fn ndr_align() -> usize {
        2
    }
}

impl NdrDecode for Enum16 {
    fn ndr_decode(r: &mut NdrReader) -> Result<Self> {
        let value = r.read_u16()?;
        if value > Self::MAX {
            return Err(NdrError::InvalidEnumValue(value.into()));
        }
        Ok(Self(value))
    }

    fn ndr_align() -> usize {
        2
    }

    fn ndr_min_size() -> usize {
        2
    }
}

/// `[v1_enum]` enumeration, four bytes on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Enum32(pub u32);

impl NdrEncode for Enum32 {
    fn ndr_encode<'a>(&'a self, w: &mut NdrWriter<'a>) -> Result<()> {
        w.write_u32(self.0);
        Ok(())
    }

    fn ndr_align() -> usize {
        4
    }
}

impl NdrDecode for Enum32 {
    fn ndr_decode(r: &mut NdrReader) -> Result<Self> {
        r.read_u32().map(Self)
    }

    fn ndr_align() -> usize {
        4
    }

    fn ndr_min_size() -> usize {
        4
    }
}

/// GUID/UUID.
///
/// The first three fields follow the data representation's byte order; the
/// trailing eight bytes are copied as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Uuid {
    pub data1: u32,
    pub data2: u16,
    pub data3: u16,
    pub data4: [u8; 8],
}

impl Uuid {
    /// Nil UUID
    pub const NIL: Self = Self::new(0, 0, 0, [0; 8]);

    pub const fn new(data1: u32, data2: u16, data3: u16, data4: [u8; 8]) -> Self {
        Self { data1, data2, data3, data4 }
    }

    /// Parse from string "xxxxxxxx-xxxx-xxxx-xxxx-xxxxxxxxxxxx"
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim().trim_start_matches('{').trim_end_matches('}');
        if s.len() != 36 || !s.is_ascii() {
            return None;
        }
        let parts: Vec<&str> = s.split('-').collect();
        if parts.len() != 5 || parts[3].len() != 4 || parts[4].len() != 12 {
            return None;
        }

        let data1 = u32::from_str_radix(parts[0], 16).ok()?;
        let data2 = u16::from_str_radix(parts[1], 16).ok()?;
        let data3 = u16::from_str_radix(parts[2], 16).ok()?;
        let clock = u16::from_str_radix(parts[3], 16).ok()?;

        let mut data4 = [0u8; 8];
        data4[..2].copy_from_slice(&clock.to_be_bytes());
        for (i, byte) in data4[2..].iter_mut().enumerate() {
            *byte = u8::from_str_radix(&parts[4][i * 2..i * 2 + 2], 16).ok()?;
        }

        Some(Self { data1, data2, data3, data4 })
    }

    pub fn is_nil(&self) -> bool {
        *self == Self::NIL
    }

    /// Little-endian (Windows GUID) byte layout
    pub fn to_bytes_le(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[0..4].copy_from_slice(&self.data1.to_le_bytes());
        out[4..6].copy_from_slice(&self.data2.to_le_bytes());
        out[6..8].copy_from_slice(&self.data3.to_le_bytes());
        out[8..].copy_from_slice(&self.data4);
        out
    }
}

impl FromStr for Uuid {
    type Err = NdrError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s).ok_or_else(|| NdrError::InvalidString(format!("malformed UUID: {s}")))
    }
}

impl fmt::Display for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let d = &self.data4;
        write!(
            f,
            "{:08x}-{:04x}-{:04x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
            self.data1, self.data2, self.data3, d[0], d[1], d[2], d[3], d[4], d[5], d[6], d[7],
        )
    }
}

impl NdrEncode for Uuid {
    fn ndr_encode<'a>(&'a self, w: &mut NdrWriter<'a>) -> Result<()> {
        w.write_u32(self.data1);
        w.write_u16(self.data2);
        w.write_u16(self.data3);
        w.write_bytes(&self.data4);
        Ok(())
    }

    fn ndr_align() -> usize {
        4
    }
}

impl NdrDecode for Uuid {
    fn ndr_decode(r: &mut NdrReader) -> Result<Self> {
        let data1 = r.read_u32()?;
        let data2 = r.read_u16()?;
        let data3 = r.read_u16()?;
        let mut data4 = [0u8; 8];
        data4.copy_from_slice(&r.read_bytes(8)?);
        Ok(Self { data1, data2, data3, data4 })
    }

    fn ndr_align() -> usize {
        4
    }

    fn ndr_min_size() -> usize {
        16
    }
}

/// Context handle as carried on the wire: attributes plus a GUID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ContextHandle {
    pub attributes: u32,
    pub uuid: Uuid,
}

impl ContextHandle {
    pub const NIL: Self = Self {
        attributes: 0,
        uuid: Uuid::NIL,
    };

    /// A nil handle means "no context" (closed or never opened)
    pub fn is_nil(&self) -> bool {
        self.attributes == 0 && self.uuid.is_nil()
    }
}

impl NdrEncode for ContextHandle {
    fn ndr_encode<'a>(&'a self, w: &mut NdrWriter<'a>) -> Result<()> {
        w.write_u32(self.attributes);
        self.uuid.ndr_encode(w)
    }

    fn ndr_align() -> usize {
        4
    }
}

impl NdrDecode for ContextHandle {
    fn ndr_decode(r: &mut NdrReader) -> Result<Self> {
        Ok(Self {
            attributes: r.read_u32()?,
            uuid: Uuid::ndr_decode(r)?,
        })
    }

    fn ndr_align() -> usize {
        4
    }

    fn ndr_min_size() -> usize {
        20
    }
}
