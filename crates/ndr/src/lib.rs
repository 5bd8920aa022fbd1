//! NDR (Network Data Representation) codec
//!
//! This crate implements the NDR transfer syntax used by DCE/RPC and MS-RPCE
//! stubs: primitive encoding and alignment, embedded pointers with deferred
//! referents, conformant and varying arrays, discriminated unions and
//! strings.
//!
//! # NDR Wire Format
//!
//! - Primitives align to their natural size (1, 2, 4, or 8 bytes)
//! - Structures align to their largest member, then encode members in order
//! - Embedded unique pointers write a referent identifier in place; the
//!   pointee follows once the enclosing value's fixed part is complete
//! - Conformant arrays carry their element count ahead of the elements
//! - Strings are conformant varying arrays with a null terminator
//!
//! # Usage
//!
//! Types implement [`NdrEncode`] and [`NdrDecode`]; [`encode`] and [`decode`]
//! run a complete pass including deferred referents:
//!
//! ```
//! use msrpc_ndr::{decode, encode, UniquePtr};
//!
//! let value = UniquePtr::new(42u32);
//! let bytes = encode(&value).unwrap();
//! assert_eq!(bytes.len(), 8);
//! assert_eq!(decode::<UniquePtr<u32>>(bytes).unwrap(), value);
//! ```
//!
//! Decoding never trusts a length field: every count is checked against the
//! remaining input and the limits in [`NdrContext`] before it is used.

mod arrays;
mod context;
mod decode;
mod encode;
mod error;
mod pointers;
mod primitives;
mod strings;
mod unions;

pub use arrays::{
    count_of, read_conformance, read_conformant_array, read_conformant_varying_array,
    read_variance, write_conformance, write_conformant_array, write_conformant_varying_array,
    write_variance, ConformantArray, ConformantVaryingArray, FixedArray, VaryingArray,
};
pub use context::{
    NdrContext, DEFAULT_MAX_ALLOCATION, DEFAULT_MAX_ARRAY_ELEMENTS, DEFAULT_MAX_POINTER_DEPTH,
};
pub use decode::{decode, decode_with, NdrDecode, NdrReader, ReferentHandle, Referents};
pub use encode::{encode, encode_with, NdrEncode, NdrWriter, FIRST_REFERENT_ID};
pub use error::{NdrError, Result};
pub use pointers::{NdrPtr, RefPtr, UniquePtr};
pub use primitives::{ContextHandle, Enum16, Enum32, Uuid};
pub use strings::{NdrString, NdrWString};
pub use unions::{read_union, write_union, ArmDecoder, NdrUnion, SwitchType, Union};

/// Alias kept for stubs that name the GUID type after the codec
pub type NdrUuid = Uuid;

/// Re-export bytes for convenience
pub use bytes::{Bytes, BytesMut};
