//! NDR discriminated unions
//!
//! A non-encapsulated union is a discriminant followed by the single arm it
//! selects. Arms are described by a closed Rust enum implementing
//! [`NdrUnion`]; the discriminant-to-decoder mapping is a `match` returning
//! plain function pointers, so dispatch needs no runtime type inspection.
//!
//! A discriminant with no arm decodes to [`Union::Unknown`] and consumes
//! nothing beyond the discriminant itself.

use tracing::trace;

use crate::decode::Referents;
use crate::error::NdrError;
use crate::{NdrDecode, NdrEncode, NdrReader, NdrWriter, Result};

/// Wire width of a union discriminant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchType {
    /// `small`, `char`, `boolean`
    Small,
    /// `short`, `enum`
    Short,
    /// `long`
    Long,
}

impl SwitchType {
    pub fn width(self) -> usize {
        match self {
            SwitchType::Small => 1,
            SwitchType::Short => 2,
            SwitchType::Long => 4,
        }
    }

    fn write(self, w: &mut NdrWriter<'_>, discriminant: u32) -> Result<()> {
        let limit = match self {
            SwitchType::Small => u8::MAX.into(),
            SwitchType::Short => u16::MAX.into(),
            SwitchType::Long => u32::MAX,
        };
        if discriminant > limit {
            return Err(NdrError::InvalidEnumValue(discriminant));
        }
        match self {
            SwitchType::Small => w.write_u8(discriminant as u8),
            SwitchType::Short => w.write_u16(discriminant as u16),
            SwitchType::Long => w.write_u32(discriminant),
        }
        Ok(())
    }

    fn read(self, r: &mut NdrReader) -> Result<u32> {
        match self {
            SwitchType::Small => r.read_u8().map(u32::from),
            SwitchType::Short => r.read_u16().map(u32::from),
            SwitchType::Long => r.read_u32(),
        }
    }
}

/// Decoder for one union arm, called after the discriminant has been read
pub type ArmDecoder<U> = fn(&mut NdrReader) -> Result<U>;

/// A closed set of union arms
pub trait NdrUnion: Sized {
    /// Width of the discriminant on the wire
    const SWITCH: SwitchType;

    /// Discriminant selecting this arm
    fn discriminant(&self) -> u32;

    /// Encode the arm body (not the discriminant)
    fn encode_arm<'a>(&'a self, w: &mut NdrWriter<'a>) -> Result<()>;

    /// Decoder for the arm selected by `discriminant`, if there is one
    fn arm(discriminant: u32) -> Option<ArmDecoder<Self>>;

    /// Largest alignment of any arm
    fn arm_align() -> usize {
        1
    }

    /// Resolve pointers held by the decoded arm
    fn finish_arm(&mut self, referents: &mut Referents) -> Result<()> {
        let _ = referents;
        Ok(())
    }
}

/// A union value as found on the wire
#[derive(Debug, Clone, PartialEq)]
pub enum Union<U> {
    Known(U),
    /// Discriminant without a matching arm
    Unknown(u32),
}

impl<U: NdrUnion> Union<U> {
    pub fn discriminant(&self) -> u32 {
        match self {
            Union::Known(arm) => arm.discriminant(),
            Union::Unknown(discriminant) => *discriminant,
        }
    }

    /// The decoded arm, or `UnknownUnionVariant`
    pub fn known(&self) -> Result<&U> {
        match self {
            Union::Known(arm) => Ok(arm),
            Union::Unknown(discriminant) => Err(NdrError::UnknownUnionVariant(*discriminant)),
        }
    }

    pub fn into_known(self) -> Result<U> {
        match self {
            Union::Known(arm) => Ok(arm),
            Union::Unknown(discriminant) => Err(NdrError::UnknownUnionVariant(discriminant)),
        }
    }

    fn align() -> usize {
        U::SWITCH.width().max(U::arm_align())
    }
}

impl<U> From<U> for Union<U> {
    fn from(arm: U) -> Self {
        Union::Known(arm)
    }
}

/// Write the discriminant followed by the arm it selects.
///
/// An unknown union writes its discriminant and nothing else.
pub fn write_union<'a, U: NdrUnion>(w: &mut NdrWriter<'a>, value: &'a Union<U>) -> Result<()> {
    w.align(Union::<U>::align())?;
    U::SWITCH.write(w, value.discriminant())?;
    if let Union::Known(arm) = value {
        w.align(U::arm_align())?;
        arm.encode_arm(w)?;
    }
    Ok(())
}

/// Read a discriminant and the arm it selects.
///
/// `expected` is what the caller believes the discriminant to be (usually
/// from a sibling switch field); the wire value always wins.
pub fn read_union<U: NdrUnion>(r: &mut NdrReader, expected: Option<u32>) -> Result<Union<U>> {
    r.align(Union::<U>::align())?;
    let discriminant = U::SWITCH.read(r)?;
    if let Some(expected) = expected.filter(|&e| e != discriminant) {
        trace!("union discriminant {} differs from expected {}", discriminant, expected);
    }
    match U::arm(discriminant) {
        Some(decode) => {
            r.align(U::arm_align())?;
            decode(r).map(Union::Known)
        }
        None => Ok(Union::Unknown(discriminant)),
    }
}

impl<U: NdrUnion> NdrEncode for Union<U> {
    fn ndr_encode<'a>(&'a self, w: &mut NdrWriter<'a>) -> Result<()> {
        write_union(w, self)
    }

    fn ndr_align() -> usize {
        Self::align()
    }
}

impl<U: NdrUnion> NdrDecode for Union<U> {
    fn ndr_decode(r: &mut NdrReader) -> Result<Self> {
        read_union(r, None)
    }

    fn ndr_align() -> usize {
        Self::align()
    }

    fn ndr_min_size() -> usize {
        U::SWITCH.width()
    }

    fn ndr_finish(&mut self, referents: &mut Referents) -> Result<()> {
        match self {
            Union::Known(arm) => arm.finish_arm(referents),
            Union::Unknown(_) => Ok(()),
        }
    }
}
