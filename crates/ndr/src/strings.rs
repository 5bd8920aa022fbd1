//! NDR string types
//!
//! A string is a conformant varying array of code units whose last unit is
//! a terminator:
//!
//! ```text
//! max_count: u32     # units including the terminator
//! offset: u32        # always 0
//! actual_count: u32  # units including the terminator
//! units[actual_count]
//! ```
//!
//! [`NdrWString`] carries UTF-16 units (`wchar_t*`), [`NdrString`] 8-bit
//! units (`char*`). When a string field is pointer-indirected, an empty
//! string travels as a null pointer; see [`UniquePtr::from_text`].

use std::fmt;

use crate::arrays::{count_of, read_conformance, read_variance, write_conformance, write_variance};
use crate::error::NdrError;
use crate::{NdrDecode, NdrEncode, NdrReader, NdrWriter, Result, UniquePtr};

/// Read the string header and return the number of units that follow
fn read_string_header(r: &mut NdrReader, unit_size: usize) -> Result<usize> {
    let max_count = read_conformance(r)?;
    let (offset, actual_count) = read_variance(r)?;
    if offset != 0 {
        return Err(NdrError::NonZeroOffset(offset));
    }
    if actual_count > max_count {
        return Err(NdrError::ConformanceMismatch {
            max_count: max_count.into(),
            actual_count: actual_count.into(),
        });
    }
    r.check_count(actual_count, unit_size)
}

fn write_string_header(w: &mut NdrWriter<'_>, units_with_terminator: usize) -> Result<()> {
    let count = count_of(units_with_terminator)?;
    write_conformance(w, count);
    write_variance(w, 0, count);
    Ok(())
}

/// Wide (UTF-16) null-terminated string
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct NdrWString(pub String);

impl NdrWString {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl From<String> for NdrWString {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for NdrWString {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for NdrWString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl NdrEncode for NdrWString {
    fn ndr_encode<'a>(&'a self, w: &mut NdrWriter<'a>) -> Result<()> {
        let units: Vec<u16> = self.0.encode_utf16().collect();
        write_string_header(w, units.len() + 1)?;
        for unit in units {
            w.write_u16(unit);
        }
        w.write_u16(0);
        Ok(())
    }

    fn ndr_align() -> usize {
        4
    }
}

impl NdrDecode for NdrWString {
    fn ndr_decode(r: &mut NdrReader) -> Result<Self> {
        let count = read_string_header(r, 2)?;
        let mut units = Vec::with_capacity(count);
        for _ in 0..count {
            units.push(r.read_u16()?);
        }
        if units.last() == Some(&0) {
            units.pop();
        }
        let s = char::decode_utf16(units).collect::<std::result::Result<String, _>>()?;
        Ok(Self(s))
    }

    fn ndr_align() -> usize {
        4
    }

    fn ndr_min_size() -> usize {
        12
    }
}

/// Narrow (8-bit) null-terminated string, UTF-8 on the Rust side
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct NdrString(pub String);

impl NdrString {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl From<String> for NdrString {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for NdrString {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl NdrEncode for NdrString {
    fn ndr_encode<'a>(&'a self, w: &mut NdrWriter<'a>) -> Result<()> {
        if self.0.contains('\0') {
            return Err(NdrError::InvalidString("embedded NUL".to_string()));
        }
        write_string_header(w, self.0.len() + 1)?;
        w.write_bytes(self.0.as_bytes());
        w.write_u8(0);
        Ok(())
    }

    fn ndr_align() -> usize {
        4
    }
}

impl NdrDecode for NdrString {
    fn ndr_decode(r: &mut NdrReader) -> Result<Self> {
        let count = read_string_header(r, 1)?;
        let mut bytes = r.read_bytes(count)?.to_vec();
        if bytes.last() == Some(&0) {
            bytes.pop();
        }
        Ok(Self(String::from_utf8(bytes)?))
    }

    fn ndr_align() -> usize {
        4
    }

    fn ndr_min_size() -> usize {
        12
    }
}

impl UniquePtr<NdrWString> {
    /// Pointer to `s`, or null when `s` is empty
    pub fn from_text(s: &str) -> Self {
        if s.is_empty() {
            Self::null()
        } else {
            Self::new(NdrWString::from(s))
        }
    }

    /// The string, with null read as empty
    pub fn text(&self) -> &str {
        self.as_ref().map_or("", NdrWString::as_str)
    }
}

impl UniquePtr<NdrString> {
    /// Pointer to `s`, or null when `s` is empty
    pub fn from_text(s: &str) -> Self {
        if s.is_empty() {
            Self::null()
        } else {
            Self::new(NdrString::from(s))
        }
    }

    /// The string, with null read as empty
    pub fn text(&self) -> &str {
        self.as_ref().map_or("", NdrString::as_str)
    }
}
