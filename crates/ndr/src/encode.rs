//! NDR encoding: the write cursor and the encoding trait

use std::collections::VecDeque;

use bytes::{BufMut, Bytes, BytesMut};
use tracing::trace;

use crate::error::NdrError;
use crate::{NdrContext, Result};

/// First referent identifier handed out in a deferral scope.
///
/// Windows peers start at 0x00020000 and step by 4; any non-zero value
/// unique within the scope is accepted on the wire.
pub const FIRST_REFERENT_ID: u32 = 0x0002_0000;
const REFERENT_ID_STEP: u32 = 4;

/// Trait for types that can be encoded to NDR format
///
/// Implementations align to their own requirement, then encode members in
/// declaration order. Embedded pointers hand their referent to
/// [`NdrWriter::write_pointer`]; the referent is borrowed for the lifetime of
/// the writer so that it can be emitted after the fixed part.
pub trait NdrEncode {
    /// Encode this value at the writer's current position.
    fn ndr_encode<'a>(&'a self, w: &mut NdrWriter<'a>) -> Result<()>;

    /// Get the NDR alignment requirement for this type
    fn ndr_align() -> usize
    where
        Self: Sized,
    {
        1
    }
}

impl<T: NdrEncode + ?Sized> NdrEncode for &T {
    fn ndr_encode<'a>(&'a self, w: &mut NdrWriter<'a>) -> Result<()> {
        (**self).ndr_encode(w)
    }
}

struct Deferred<'a> {
    referent_id: u32,
    referent: &'a dyn NdrEncode,
}

/// Write cursor over an owned buffer.
///
/// Owns the output bytes, the byte order, and the queue of referents waiting
/// to be emitted after the fixed part of the value being encoded.
pub struct NdrWriter<'a> {
    buf: BytesMut,
    ctx: NdrContext,
    deferred: VecDeque<Deferred<'a>>,
    next_referent_id: u32,
}

macro_rules! write_primitive {
    ($name:ident, $ty:ty, $width:expr) => {
        #[doc = concat!("Align to ", stringify!($width), " and write a `", stringify!($ty), "`.")]
        #[inline]
        pub fn $name(&mut self, value: $ty) {
            self.pad($width);
            if self.ctx.little_endian {
                self.buf.put_slice(&value.to_le_bytes());
            } else {
                self.buf.put_slice(&value.to_be_bytes());
            }
        }
    };
}

impl<'a> NdrWriter<'a> {
    /// Create a little-endian writer
    pub fn new() -> Self {
        Self::with_context(NdrContext::new())
    }

    pub fn with_context(ctx: NdrContext) -> Self {
        Self {
            buf: BytesMut::new(),
            ctx,
            deferred: VecDeque::new(),
            next_referent_id: FIRST_REFERENT_ID,
        }
    }

    pub fn context(&self) -> &NdrContext {
        &self.ctx
    }

    /// Offset of the next byte to be written
    pub fn position(&self) -> usize {
        self.buf.len()
    }

    /// Bytes written so far
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Number of referents waiting for [`flush_deferred`](Self::flush_deferred)
    pub fn pending(&self) -> usize {
        self.deferred.len()
    }

    fn pad(&mut self, alignment: usize) {
        let padding = NdrContext::align_padding(self.buf.len(), alignment);
        self.buf.put_bytes(0, padding);
    }

    /// Pad with zero bytes until the position is a multiple of `alignment`.
    pub fn align(&mut self, alignment: usize) -> Result<()> {
        if !NdrContext::is_valid_alignment(alignment) {
            return Err(NdrError::InvalidAlignment(alignment));
        }
        self.pad(alignment);
        Ok(())
    }

    #[inline]
    pub fn write_u8(&mut self, value: u8) {
        self.buf.put_u8(value);
    }

    #[inline]
    pub fn write_i8(&mut self, value: i8) {
        self.buf.put_i8(value);
    }

    write_primitive!(write_u16, u16, 2);
    write_primitive!(write_i16, i16, 2);
    write_primitive!(write_u32, u32, 4);
    write_primitive!(write_i32, i32, 4);
    write_primitive!(write_u64, u64, 8);
    write_primitive!(write_i64, i64, 8);
    write_primitive!(write_f32, f32, 4);
    write_primitive!(write_f64, f64, 8);

    /// NDR boolean: one byte, 0 or 1
    #[inline]
    pub fn write_bool(&mut self, value: bool) {
        self.buf.put_u8(u8::from(value));
    }

    /// Raw bytes, no alignment
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.put_slice(bytes);
    }

    /// Overwrite a previously written `u16` (used for length fields that are
    /// only known once the body has been encoded).
    pub fn patch_u16(&mut self, offset: usize, value: u16) -> Result<()> {
        let bytes = if self.ctx.little_endian {
            value.to_le_bytes()
        } else {
            value.to_be_bytes()
        };
        let end = offset + bytes.len();
        let have = self.buf.len();
        self.buf
            .get_mut(offset..end)
            .ok_or_else(|| NdrError::truncated(end, have))?
            .copy_from_slice(&bytes);
        Ok(())
    }

    /// Write an embedded pointer.
    ///
    /// A null pointer is a zero identifier and nothing is queued. Otherwise a
    /// fresh non-zero identifier is written and the referent is queued for
    /// the next [`flush_deferred`](Self::flush_deferred). Returns the
    /// identifier written.
    pub fn write_pointer(&mut self, referent: Option<&'a dyn NdrEncode>) -> u32 {
        match referent {
            None => {
                self.write_u32(0);
                0
            }
            Some(referent) => {
                let referent_id = self.next_referent_id;
                self.next_referent_id = self.next_referent_id.wrapping_add(REFERENT_ID_STEP).max(REFERENT_ID_STEP);
                self.write_u32(referent_id);
                self.deferred.push_back(Deferred { referent_id, referent });
                referent_id
            }
        }
    }

    /// Emit queued referents in the order their identifiers were written.
    ///
    /// Referents queued while flushing go to the back of the queue, so each
    /// nesting level is emitted after the level that introduced it.
    pub fn flush_deferred(&mut self) -> Result<()> {
        while let Some(Deferred { referent_id, referent }) = self.deferred.pop_front() {
            trace!("flushing referent 0x{:08x} at offset {}", referent_id, self.position());
            referent.ndr_encode(self)?;
        }
        Ok(())
    }

    /// Encode one top-level parameter: the value, then everything it points
    /// to. Operation stubs call this once per parameter in declaration order.
    pub fn write_param<T: NdrEncode + ?Sized>(&mut self, value: &'a T) -> Result<()> {
        value.ndr_encode(self)?;
        self.flush_deferred()
    }

    /// Encode a value that does not outlive this call.
    ///
    /// The value is written at the current position and any referents it
    /// queues are flushed before returning, in a scope of their own.
    pub fn encode_scoped<T: NdrEncode + ?Sized>(&mut self, value: &T) -> Result<()> {
        let mut scope = NdrWriter {
            buf: std::mem::take(&mut self.buf),
            ctx: self.ctx,
            deferred: VecDeque::new(),
            next_referent_id: self.next_referent_id,
        };
        let result = value
            .ndr_encode(&mut scope)
            .and_then(|()| scope.flush_deferred());
        self.buf = scope.buf;
        self.next_referent_id = scope.next_referent_id;
        result
    }

    /// Flush outstanding referents and hand back the encoded bytes
    pub fn finish(mut self) -> Result<Bytes> {
        self.flush_deferred()?;
        Ok(self.buf.freeze())
    }

    /// The buffer as written so far, dropping anything still queued
    pub fn into_inner(self) -> BytesMut {
        self.buf
    }
}

impl Default for NdrWriter<'_> {
    fn default() -> Self {
        Self::new()
    }
}

/// Encode a value to NDR with little-endian byte order
pub fn encode<T: NdrEncode + ?Sized>(value: &T) -> Result<Bytes> {
    encode_with(value, NdrContext::new())
}

/// Encode a value to NDR, flushing all deferred referents
pub fn encode_with<T: NdrEncode + ?Sized>(value: &T, ctx: NdrContext) -> Result<Bytes> {
    let mut w = NdrWriter::with_context(ctx);
    w.write_param(value)?;
    Ok(w.into_inner().freeze())
}
