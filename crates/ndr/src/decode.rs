//! NDR decoding: the read cursor, the decoding trait and the referent table

use std::any::Any;
use std::collections::VecDeque;
use std::fmt;

use bytes::Bytes;
use tracing::trace;

use crate::error::NdrError;
use crate::{NdrContext, Result};

/// Trait for types that can be decoded from NDR format
pub trait NdrDecode: Sized {
    /// Decode a value at the reader's current position.
    fn ndr_decode(r: &mut NdrReader) -> Result<Self>;

    /// Decode with an element count already known from a sibling field.
    ///
    /// Only array-like types use the count; everything else ignores it.
    fn ndr_decode_sized(r: &mut NdrReader, known_count: Option<u32>) -> Result<Self> {
        let _ = known_count;
        Self::ndr_decode(r)
    }

    /// Get the NDR alignment requirement for this type
    fn ndr_align() -> usize {
        1
    }

    /// Smallest number of bytes one value can occupy on the wire.
    ///
    /// Used to reject array counts that cannot fit in the remaining input
    /// before any storage is allocated.
    fn ndr_min_size() -> usize {
        1
    }

    /// Post-decode hook, run once all deferred referents have been read.
    ///
    /// Types holding pointers resolve them here and must forward the call to
    /// every member that may hold one.
    fn ndr_finish(&mut self, referents: &mut Referents) -> Result<()> {
        let _ = referents;
        Ok(())
    }
}

/// Location of a referent that has been announced but not yet read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReferentHandle {
    pub referent_id: u32,
    slot: usize,
}

type DecodeFn = fn(&mut NdrReader, Option<u32>) -> Result<Box<dyn Any + Send>>;

fn decode_boxed<T: NdrDecode + Send + 'static>(
    r: &mut NdrReader,
    known_count: Option<u32>,
) -> Result<Box<dyn Any + Send>> {
    Ok(Box::new(T::ndr_decode_sized(r, known_count)?))
}

struct Pending {
    handle: ReferentHandle,
    known_count: Option<u32>,
    /// Pointers between the top-level value and this referent
    depth: usize,
    decode: DecodeFn,
}

struct Slot {
    referent_id: u32,
    value: Option<Box<dyn Any + Send>>,
}

/// Referents read during a flush, waiting to be claimed by their pointers
#[derive(Default)]
pub struct Referents {
    slots: Vec<Slot>,
}

impl Referents {
    fn reserve(&mut self, referent_id: u32) -> usize {
        self.slots.push(Slot { referent_id, value: None });
        self.slots.len() - 1
    }

    fn fill(&mut self, slot: usize, value: Box<dyn Any + Send>) {
        if let Some(slot) = self.slots.get_mut(slot) {
            slot.value = Some(value);
        }
    }

    /// Claim the referent behind `handle`.
    pub fn take<T: 'static>(&mut self, handle: ReferentHandle) -> Result<Box<T>> {
        let id = handle.referent_id;
        let value = self
            .slots
            .get_mut(handle.slot)
            .filter(|slot| slot.referent_id == id)
            .and_then(|slot| slot.value.take())
            .ok_or(NdrError::MissingReferent(id))?;
        value
            .downcast::<T>()
            .map_err(|_| NdrError::ReferentTypeMismatch(id))
    }

    /// Number of slots handed out in this scope
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn ensure_claimed(&self) -> Result<()> {
        match self.slots.iter().find(|slot| slot.value.is_some()) {
            Some(slot) => Err(NdrError::UnresolvedReferent(slot.referent_id)),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Referents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.slots.iter().map(|slot| (slot.referent_id, slot.value.is_some())))
            .finish()
    }
}

/// Read cursor over an owned buffer.
///
/// Every read is bounds-checked; the offset never passes the end of the
/// buffer. Pointers read through [`read_pointer`](Self::read_pointer) queue a
/// decoder that runs on the next [`flush_deferred`](Self::flush_deferred).
pub struct NdrReader {
    buf: Bytes,
    pos: usize,
    ctx: NdrContext,
    deferred: VecDeque<Pending>,
    referents: Referents,
    /// Depth of the referent being read; 0 outside a flush
    depth: usize,
}

macro_rules! read_primitive {
    ($name:ident, $ty:ty, $width:expr) => {
        #[doc = concat!("Align to ", stringify!($width), " and read a `", stringify!($ty), "`.")]
        pub fn $name(&mut self) -> Result<$ty> {
            self.skip_padding($width)?;
            let bytes = self.take_array::<{ $width }>()?;
            Ok(if self.ctx.little_endian {
                <$ty>::from_le_bytes(bytes)
            } else {
                <$ty>::from_be_bytes(bytes)
            })
        }
    };
}

impl NdrReader {
    /// Create a little-endian reader
    pub fn new(buf: impl Into<Bytes>) -> Self {
        Self::with_context(buf, NdrContext::new())
    }

    pub fn with_context(buf: impl Into<Bytes>, ctx: NdrContext) -> Self {
        Self {
            buf: buf.into(),
            pos: 0,
            ctx,
            deferred: VecDeque::new(),
            referents: Referents::default(),
            depth: 0,
        }
    }

    pub fn context(&self) -> &NdrContext {
        &self.ctx
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Number of referents waiting for [`flush_deferred`](Self::flush_deferred)
    pub fn pending(&self) -> usize {
        self.deferred.len()
    }

    fn take(&mut self, n: usize) -> Result<&[u8]> {
        let have = self.remaining();
        if n > have {
            return Err(NdrError::truncated(n, have));
        }
        let start = self.pos;
        self.pos += n;
        Ok(&self.buf[start..self.pos])
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn skip_padding(&mut self, alignment: usize) -> Result<()> {
        let padding = NdrContext::align_padding(self.pos, alignment);
        self.take(padding).map(|_| ())
    }

    /// Skip bytes until the position is a multiple of `alignment`.
    pub fn align(&mut self, alignment: usize) -> Result<()> {
        if !NdrContext::is_valid_alignment(alignment) {
            return Err(NdrError::InvalidAlignment(alignment));
        }
        self.skip_padding(alignment)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take_array::<1>()?[0])
    }

    pub fn read_i8(&mut self) -> Result<i8> {
        Ok(self.read_u8()? as i8)
    }

    read_primitive!(read_u16, u16, 2);
    read_primitive!(read_i16, i16, 2);
    read_primitive!(read_u32, u32, 4);
    read_primitive!(read_i32, i32, 4);
    read_primitive!(read_u64, u64, 8);
    read_primitive!(read_i64, i64, 8);
    read_primitive!(read_f32, f32, 4);
    read_primitive!(read_f64, f64, 8);

    /// NDR boolean: any non-zero byte is true
    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    /// Raw bytes, no alignment
    pub fn read_bytes(&mut self, n: usize) -> Result<Bytes> {
        let have = self.remaining();
        if n > have {
            return Err(NdrError::truncated(n, have));
        }
        let start = self.pos;
        self.pos += n;
        Ok(self.buf.slice(start..self.pos))
    }

    /// Validate an attacker-supplied element count before it drives a loop
    /// or an allocation.
    ///
    /// The count must respect the configured limits, and `count` elements of
    /// at least `min_element_size` bytes must fit in the remaining input.
    pub fn check_count(&self, count: u32, min_element_size: usize) -> Result<usize> {
        let elements = count as u64;
        let limit = self.ctx.max_array_elements as u64;
        if elements > limit {
            return Err(NdrError::SizeOverflow { declared: elements, limit });
        }
        let bytes = elements.saturating_mul(min_element_size.max(1) as u64);
        let limit = (self.ctx.max_allocation as u64).min(self.remaining() as u64);
        if bytes > limit {
            return Err(NdrError::SizeOverflow { declared: bytes, limit });
        }
        Ok(count as usize)
    }

    /// Read an embedded pointer identifier.
    ///
    /// A zero identifier is null and queues nothing. Otherwise a decoder for
    /// `T` is queued and the returned handle claims its result once the
    /// queue has been flushed.
    ///
    /// Referents nested deeper than the context's `max_pointer_depth` are
    /// rejected with `SizeOverflow`.
    pub fn read_pointer<T: NdrDecode + Send + 'static>(
        &mut self,
        known_count: Option<u32>,
    ) -> Result<Option<ReferentHandle>> {
        let referent_id = self.read_u32()?;
        if referent_id == 0 {
            return Ok(None);
        }
        let depth = self.depth + 1;
        if depth > self.ctx.max_pointer_depth {
            return Err(NdrError::SizeOverflow {
                declared: depth as u64,
                limit: self.ctx.max_pointer_depth as u64,
            });
        }
        let handle = ReferentHandle {
            referent_id,
            slot: self.referents.reserve(referent_id),
        };
        self.deferred.push_back(Pending {
            handle,
            known_count,
            depth,
            decode: decode_boxed::<T>,
        });
        Ok(Some(handle))
    }

    /// Read queued referents in the order their identifiers were read.
    pub fn flush_deferred(&mut self) -> Result<()> {
        while let Some(pending) = self.deferred.pop_front() {
            let id = pending.handle.referent_id;
            if self.remaining() == 0 {
                return Err(NdrError::MissingReferent(id));
            }
            trace!("reading referent 0x{:08x} at offset {}", id, self.pos);
            self.depth = pending.depth;
            let value = (pending.decode)(self, pending.known_count);
            self.depth = 0;
            self.referents.fill(pending.handle.slot, value?);
        }
        Ok(())
    }

    /// Flush outstanding referents and resolve them into `value`.
    pub fn finish<T: NdrDecode>(&mut self, mut value: T) -> Result<T> {
        self.flush_deferred()?;
        let mut referents = std::mem::take(&mut self.referents);
        value.ndr_finish(&mut referents)?;
        referents.ensure_claimed()?;
        Ok(value)
    }

    /// Decode one top-level parameter together with everything it points to.
    pub fn read_param<T: NdrDecode>(&mut self) -> Result<T> {
        let value = T::ndr_decode(self)?;
        self.finish(value)
    }
}

impl fmt::Debug for NdrReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NdrReader")
            .field("len", &self.buf.len())
            .field("pos", &self.pos)
            .field("ctx", &self.ctx)
            .field("pending", &self.deferred.len())
            .finish()
    }
}

/// Decode a little-endian NDR value, resolving all of its referents
pub fn decode<T: NdrDecode>(buf: impl Into<Bytes>) -> Result<T> {
    decode_with(buf, NdrContext::new())
}

/// Decode an NDR value, resolving all of its referents.
///
/// Trailing bytes after the value are ignored.
pub fn decode_with<T: NdrDecode>(buf: impl Into<Bytes>, ctx: NdrContext) -> Result<T> {
    NdrReader::with_context(buf, ctx).read_param()
}
