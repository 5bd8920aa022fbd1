//! NDR array types
//!
//! NDR supports several array types:
//!
//! - Fixed arrays: size known at compile time, elements only
//! - Conformant arrays: `max_count` prefix, then the elements
//! - Varying arrays: `offset` and `actual_count` prefix, bounded statically
//! - Conformant varying arrays: `max_count`, `offset`, `actual_count`
//!
//! Every count read from the wire is checked against the remaining input
//! and the context limits before it sizes an allocation or drives a loop.
//!
//! When a conformant array is the last member of a structure, its
//! `max_count` is written before the structure itself. Use
//! [`ConformantArray::encode_conformance`] / [`ConformantArray::encode_elements`]
//! and [`read_conformance`] / [`ConformantArray::decode_elements`] for that
//! layout.

use crate::decode::Referents;
use crate::error::NdrError;
use crate::{NdrDecode, NdrEncode, NdrReader, NdrWriter, Result};

/// Convert an in-memory length to a wire count
pub fn count_of(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| NdrError::SizeOverflow {
        declared: len as u64,
        limit: u32::MAX as u64,
    })
}

/// Write the conformance (`max_count`) of an array
pub fn write_conformance(w: &mut NdrWriter<'_>, max_count: u32) {
    w.write_u32(max_count);
}

/// Write the variance (`offset`, `actual_count`) of an array
pub fn write_variance(w: &mut NdrWriter<'_>, offset: u32, actual_count: u32) {
    w.write_u32(offset);
    w.write_u32(actual_count);
}

pub fn read_conformance(r: &mut NdrReader) -> Result<u32> {
    r.read_u32()
}

/// Read `(offset, actual_count)`
pub fn read_variance(r: &mut NdrReader) -> Result<(u32, u32)> {
    Ok((r.read_u32()?, r.read_u32()?))
}

/// A count carried by a sibling field fills in a zero wire count, and never
/// overrides a wire count that is present.
fn effective_count(wire: u32, known: Option<u32>) -> u32 {
    match known {
        Some(known) if wire == 0 => known,
        _ => wire,
    }
}

fn check_fits(len: usize, count: u32) -> Result<()> {
    if len > count as usize {
        return Err(NdrError::ConformanceMismatch {
            max_count: count.into(),
            actual_count: len as u64,
        });
    }
    Ok(())
}

fn write_elements<'a, T: NdrEncode>(w: &mut NdrWriter<'a>, elements: &'a [T]) -> Result<()> {
    for element in elements {
        element.ndr_encode(w)?;
    }
    Ok(())
}

fn write_padding_elements<T: NdrEncode + Default>(w: &mut NdrWriter<'_>, n: usize) -> Result<()> {
    let filler = T::default();
    for _ in 0..n {
        w.encode_scoped(&filler)?;
    }
    Ok(())
}

fn read_elements<T: NdrDecode>(r: &mut NdrReader, count: u32) -> Result<Vec<T>> {
    let count = r.check_count(count, T::ndr_min_size())?;
    let mut elements = Vec::with_capacity(count);
    for _ in 0..count {
        elements.push(T::ndr_decode(r)?);
    }
    Ok(elements)
}

fn finish_elements<T: NdrDecode>(elements: &mut [T], referents: &mut Referents) -> Result<()> {
    for element in elements {
        element.ndr_finish(referents)?;
    }
    Ok(())
}

/// Write `max_count` then the elements, padding with default elements when
/// `elements` is shorter than `max_count`.
pub fn write_conformant_array<'a, T: NdrEncode + Default>(
    w: &mut NdrWriter<'a>,
    max_count: u32,
    elements: &'a [T],
) -> Result<()> {
    check_fits(elements.len(), max_count)?;
    write_conformance(w, max_count);
    write_elements(w, elements)?;
    write_padding_elements::<T>(w, max_count as usize - elements.len())
}

/// Write `max_count`, a zero offset and `actual_count`, then `actual_count`
/// elements, padding with default elements when `elements` is shorter.
pub fn write_conformant_varying_array<'a, T: NdrEncode + Default>(
    w: &mut NdrWriter<'a>,
    max_count: u32,
    actual_count: u32,
    elements: &'a [T],
) -> Result<()> {
    check_fits(actual_count as usize, max_count)?;
    check_fits(elements.len(), actual_count)?;
    write_conformance(w, max_count);
    write_variance(w, 0, actual_count);
    write_elements(w, elements)?;
    write_padding_elements::<T>(w, actual_count as usize - elements.len())
}

pub fn read_conformant_array<T: NdrDecode>(r: &mut NdrReader, known_count: Option<u32>) -> Result<Vec<T>> {
    let max_count = effective_count(read_conformance(r)?, known_count);
    read_elements(r, max_count)
}

pub fn read_conformant_varying_array<T: NdrDecode>(
    r: &mut NdrReader,
    known_count: Option<u32>,
) -> Result<ConformantVaryingArray<T>> {
    let wire_max = read_conformance(r)?;
    let (offset, wire_actual) = read_variance(r)?;
    let actual_count = effective_count(wire_actual, known_count);
    let max_count = effective_count(wire_max, known_count);
    if u64::from(offset) + u64::from(actual_count) > u64::from(max_count) {
        return Err(NdrError::ConformanceMismatch {
            max_count: max_count.into(),
            actual_count: u64::from(offset) + u64::from(actual_count),
        });
    }
    Ok(ConformantVaryingArray {
        max_count: max_count as usize,
        offset: offset as usize,
        elements: read_elements(r, actual_count)?,
    })
}

/// Fixed-size array
///
/// Wire format: just the elements (no size prefix)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedArray<T, const N: usize> {
    pub elements: [T; N],
}

impl<T: Default, const N: usize> Default for FixedArray<T, N> {
    fn default() -> Self {
        Self {
            elements: std::array::from_fn(|_| T::default()),
        }
    }
}

impl<T, const N: usize> FixedArray<T, N> {
    pub fn new(elements: [T; N]) -> Self {
        Self { elements }
    }
}

impl<T: NdrEncode, const N: usize> NdrEncode for FixedArray<T, N> {
    fn ndr_encode<'a>(&'a self, w: &mut NdrWriter<'a>) -> Result<()> {
        w.align(T::ndr_align())?;
        write_elements(w, &self.elements)
    }

    fn ndr_align() -> usize {
        T::ndr_align()
    }
}

impl<T: NdrDecode, const N: usize> NdrDecode for FixedArray<T, N> {
    fn ndr_decode(r: &mut NdrReader) -> Result<Self> {
        r.align(T::ndr_align())?;
        let elements = read_elements::<T>(r, count_of(N)?)?;
        let elements = elements
            .try_into()
            .map_err(|v: Vec<T>| NdrError::ConformanceMismatch {
                max_count: N as u64,
                actual_count: v.len() as u64,
            })?;
        Ok(Self { elements })
    }

    fn ndr_align() -> usize {
        T::ndr_align()
    }

    fn ndr_min_size() -> usize {
        N * T::ndr_min_size()
    }

    fn ndr_finish(&mut self, referents: &mut Referents) -> Result<()> {
        finish_elements(&mut self.elements, referents)
    }
}

/// Conformant array - size determined at runtime
///
/// Wire format:
/// ```text
/// max_count: u32
/// elements[max_count]
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConformantArray<T> {
    pub elements: Vec<T>,
}

impl<T> ConformantArray<T> {
    pub fn new(elements: Vec<T>) -> Self {
        Self { elements }
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn into_inner(self) -> Vec<T> {
        self.elements
    }
}

impl<T: NdrEncode> ConformantArray<T> {
    /// Conformance only, for arrays embedded at the end of a structure
    pub fn encode_conformance(&self, w: &mut NdrWriter<'_>) -> Result<()> {
        write_conformance(w, count_of(self.elements.len())?);
        Ok(())
    }

    /// Elements only, for arrays embedded at the end of a structure
    pub fn encode_elements<'a>(&'a self, w: &mut NdrWriter<'a>) -> Result<()> {
        write_elements(w, &self.elements)
    }
}

impl<T: NdrDecode> ConformantArray<T> {
    /// Elements only, with the conformance read ahead of the structure
    pub fn decode_elements(r: &mut NdrReader, max_count: u32) -> Result<Self> {
        read_elements(r, max_count).map(Self::new)
    }
}

impl<T> From<Vec<T>> for ConformantArray<T> {
    fn from(elements: Vec<T>) -> Self {
        Self::new(elements)
    }
}

impl<T: NdrEncode> NdrEncode for ConformantArray<T> {
    fn ndr_encode<'a>(&'a self, w: &mut NdrWriter<'a>) -> Result<()> {
        self.encode_conformance(w)?;
        self.encode_elements(w)
    }

    fn ndr_align() -> usize {
        4.max(T::ndr_align())
    }
}

impl<T: NdrDecode> NdrDecode for ConformantArray<T> {
    fn ndr_decode(r: &mut NdrReader) -> Result<Self> {
        Self::ndr_decode_sized(r, None)
    }

    fn ndr_decode_sized(r: &mut NdrReader, known_count: Option<u32>) -> Result<Self> {
        read_conformant_array(r, known_count).map(Self::new)
    }

    fn ndr_align() -> usize {
        4.max(T::ndr_align())
    }

    fn ndr_min_size() -> usize {
        4
    }

    fn ndr_finish(&mut self, referents: &mut Referents) -> Result<()> {
        finish_elements(&mut self.elements, referents)
    }
}

/// Varying array - a window of a statically sized array
///
/// Wire format:
/// ```text
/// offset: u32
/// actual_count: u32
/// elements[actual_count]
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaryingArray<T, const N: usize> {
    pub offset: usize,
    pub elements: Vec<T>,
}

impl<T, const N: usize> Default for VaryingArray<T, N> {
    fn default() -> Self {
        Self {
            offset: 0,
            elements: Vec::new(),
        }
    }
}

impl<T, const N: usize> VaryingArray<T, N> {
    pub fn new(elements: Vec<T>) -> Self {
        Self { offset: 0, elements }
    }

    pub fn with_offset(offset: usize, elements: Vec<T>) -> Self {
        Self { offset, elements }
    }

    fn check_bound(offset: u64, actual_count: u64) -> Result<()> {
        if offset + actual_count > N as u64 {
            return Err(NdrError::ConformanceMismatch {
                max_count: N as u64,
                actual_count: offset + actual_count,
            });
        }
        Ok(())
    }
}

impl<T: NdrEncode, const N: usize> NdrEncode for VaryingArray<T, N> {
    fn ndr_encode<'a>(&'a self, w: &mut NdrWriter<'a>) -> Result<()> {
        Self::check_bound(self.offset as u64, self.elements.len() as u64)?;
        write_variance(w, count_of(self.offset)?, count_of(self.elements.len())?);
        write_elements(w, &self.elements)
    }

    fn ndr_align() -> usize {
        4.max(T::ndr_align())
    }
}

impl<T: NdrDecode, const N: usize> NdrDecode for VaryingArray<T, N> {
    fn ndr_decode(r: &mut NdrReader) -> Result<Self> {
        let (offset, actual_count) = read_variance(r)?;
        Self::check_bound(offset.into(), actual_count.into())?;
        Ok(Self {
            offset: offset as usize,
            elements: read_elements(r, actual_count)?,
        })
    }

    fn ndr_align() -> usize {
        4.max(T::ndr_align())
    }

    fn ndr_min_size() -> usize {
        8
    }

    fn ndr_finish(&mut self, referents: &mut Referents) -> Result<()> {
        finish_elements(&mut self.elements, referents)
    }
}

/// Conformant varying array - size and used length determined at runtime
///
/// Wire format:
/// ```text
/// max_count: u32
/// offset: u32
/// actual_count: u32
/// elements[actual_count]
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConformantVaryingArray<T> {
    pub max_count: usize,
    pub offset: usize,
    pub elements: Vec<T>,
}

impl<T> ConformantVaryingArray<T> {
    pub fn new(elements: Vec<T>) -> Self {
        Self {
            max_count: elements.len(),
            offset: 0,
            elements,
        }
    }

    /// Storage for `max_count` elements, of which `elements` are in use
    pub fn with_max(max_count: usize, elements: Vec<T>) -> Self {
        Self {
            max_count,
            offset: 0,
            elements,
        }
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }
}

impl<T: NdrEncode> NdrEncode for ConformantVaryingArray<T> {
    fn ndr_encode<'a>(&'a self, w: &mut NdrWriter<'a>) -> Result<()> {
        let max_count = count_of(self.max_count)?;
        let offset = count_of(self.offset)?;
        let actual_count = count_of(self.elements.len())?;
        check_fits(self.offset + self.elements.len(), max_count)?;
        write_conformance(w, max_count);
        write_variance(w, offset, actual_count);
        write_elements(w, &self.elements)
    }

    fn ndr_align() -> usize {
        4.max(T::ndr_align())
    }
}

impl<T: NdrDecode> NdrDecode for ConformantVaryingArray<T> {
    fn ndr_decode(r: &mut NdrReader) -> Result<Self> {
        Self::ndr_decode_sized(r, None)
    }

    fn ndr_decode_sized(r: &mut NdrReader, known_count: Option<u32>) -> Result<Self> {
        read_conformant_varying_array(r, known_count)
    }

    fn ndr_align() -> usize {
        4.max(T::ndr_align())
    }

    fn ndr_min_size() -> usize {
        12
    }

    fn ndr_finish(&mut self, referents: &mut Referents) -> Result<()> {
        finish_elements(&mut self.elements, referents)
    }
}
