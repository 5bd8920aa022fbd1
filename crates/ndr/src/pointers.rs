//! NDR pointer types
//!
//! Two pointer semantics are supported:
//!
//! - Reference (`[ref]`): never null, the pointee is encoded inline and the
//!   pointer itself has no wire representation.
//! - Unique (`[unique]`): nullable. The fixed part carries a 4-byte referent
//!   identifier (zero for null); the pointee is deferred until the enclosing
//!   value's fixed part is complete.
//!
//! Deferred referents are written and read in the order their identifiers
//! appeared. A referent that itself contains pointers queues its own
//! referents behind everything already waiting.

use std::ops::{Deref, DerefMut};

use crate::decode::{ReferentHandle, Referents};
use crate::error::NdrError;
use crate::{NdrDecode, NdrEncode, NdrReader, NdrWriter, Result};

/// Trait for NDR pointer types
pub trait NdrPtr {
    type Target;

    /// Check if the pointer is null
    fn is_null(&self) -> bool;

    /// Get the inner value, if any
    fn get(&self) -> Option<&Self::Target>;

    /// Get a mutable reference to the inner value, if any
    fn get_mut(&mut self) -> Option<&mut Self::Target>;
}

/// Reference pointer - non-null, data follows inline
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RefPtr<T>(pub T);

impl<T> RefPtr<T> {
    pub fn new(value: T) -> Self {
        Self(value)
    }

    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> Deref for RefPtr<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T> DerefMut for RefPtr<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.0
    }
}

impl<T> NdrPtr for RefPtr<T> {
    type Target = T;

    fn is_null(&self) -> bool {
        false
    }

    fn get(&self) -> Option<&T> {
        Some(&self.0)
    }

    fn get_mut(&mut self) -> Option<&mut T> {
        Some(&mut self.0)
    }
}

impl<T: NdrEncode> NdrEncode for RefPtr<T> {
    fn ndr_encode<'a>(&'a self, w: &mut NdrWriter<'a>) -> Result<()> {
        self.0.ndr_encode(w)
    }

    fn ndr_align() -> usize {
        T::ndr_align()
    }
}

impl<T: NdrDecode> NdrDecode for RefPtr<T> {
    fn ndr_decode(r: &mut NdrReader) -> Result<Self> {
        T::ndr_decode(r).map(Self)
    }

    fn ndr_decode_sized(r: &mut NdrReader, known_count: Option<u32>) -> Result<Self> {
        T::ndr_decode_sized(r, known_count).map(Self)
    }

    fn ndr_align() -> usize {
        T::ndr_align()
    }

    fn ndr_min_size() -> usize {
        T::ndr_min_size()
    }

    fn ndr_finish(&mut self, referents: &mut Referents) -> Result<()> {
        self.0.ndr_finish(referents)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum PtrState<T> {
    Null,
    Value(Box<T>),
    /// Identifier read, referent not yet resolved
    Pending(ReferentHandle),
}

/// Unique pointer - nullable, referent deferred
///
/// Absence is a state of the wrapper rather than of the pointee; a decoded
/// value is always either null or fully resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct UniquePtr<T> {
    state: PtrState<T>,
}

impl<T> UniquePtr<T> {
    pub fn new(value: T) -> Self {
        Self {
            state: PtrState::Value(Box::new(value)),
        }
    }

    pub fn null() -> Self {
        Self { state: PtrState::Null }
    }

    pub fn from_option(opt: Option<T>) -> Self {
        opt.map_or_else(Self::null, Self::new)
    }

    pub fn into_option(self) -> Option<T> {
        match self.state {
            PtrState::Value(value) => Some(*value),
            PtrState::Null | PtrState::Pending(_) => None,
        }
    }

    pub fn as_ref(&self) -> Option<&T> {
        match &self.state {
            PtrState::Value(value) => Some(value),
            PtrState::Null | PtrState::Pending(_) => None,
        }
    }

    pub fn as_mut(&mut self) -> Option<&mut T> {
        match &mut self.state {
            PtrState::Value(value) => Some(value),
            PtrState::Null | PtrState::Pending(_) => None,
        }
    }

    /// Take the pointee, leaving a null pointer behind
    pub fn take(&mut self) -> Option<T> {
        std::mem::take(self).into_option()
    }
}

impl<T> Default for UniquePtr<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T> From<Option<T>> for UniquePtr<T> {
    fn from(opt: Option<T>) -> Self {
        Self::from_option(opt)
    }
}

impl<T> NdrPtr for UniquePtr<T> {
    type Target = T;

    fn is_null(&self) -> bool {
        matches!(self.state, PtrState::Null)
    }

    fn get(&self) -> Option<&T> {
        self.as_ref()
    }

    fn get_mut(&mut self) -> Option<&mut T> {
        self.as_mut()
    }
}

impl<T: NdrEncode> NdrEncode for UniquePtr<T> {
    fn ndr_encode<'a>(&'a self, w: &mut NdrWriter<'a>) -> Result<()> {
        let referent: Option<&'a dyn NdrEncode> = match &self.state {
            PtrState::Null => None,
            PtrState::Value(value) => Some(&**value),
            PtrState::Pending(handle) => {
                return Err(NdrError::UnresolvedReferent(handle.referent_id));
            }
        };
        w.write_pointer(referent);
        Ok(())
    }

    fn ndr_align() -> usize {
        4
    }
}

impl<T: NdrDecode + Send + 'static> NdrDecode for UniquePtr<T> {
    fn ndr_decode(r: &mut NdrReader) -> Result<Self> {
        Self::ndr_decode_sized(r, None)
    }

    /// The known count travels with the deferred record to the referent.
    fn ndr_decode_sized(r: &mut NdrReader, known_count: Option<u32>) -> Result<Self> {
        let state = match r.read_pointer::<T>(known_count)? {
            None => PtrState::Null,
            Some(handle) => PtrState::Pending(handle),
        };
        Ok(Self { state })
    }

    fn ndr_align() -> usize {
        4
    }

    fn ndr_min_size() -> usize {
        4
    }

    fn ndr_finish(&mut self, referents: &mut Referents) -> Result<()> {
        if let PtrState::Pending(handle) = self.state {
            let mut value = referents.take::<T>(handle)?;
            value.ndr_finish(referents)?;
            self.state = PtrState::Value(value);
        } else if let PtrState::Value(value) = &mut self.state {
            value.ndr_finish(referents)?;
        }
        Ok(())
    }
}
