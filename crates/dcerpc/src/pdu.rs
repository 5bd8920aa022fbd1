//! Connection-oriented DCE RPC PDU (Protocol Data Unit) types
//!
//! This module implements the wire format defined in:
//! - DCE 1.1: Remote Procedure Call (C706), chapter 12
//! - MS-RPCE: Remote Procedure Call Protocol Extensions
//!
//! PDU Header Format:
//! ```text
//! +--------+--------+--------+--------+
//! |  vers  |vers_min| ptype  | pflags |
//! +--------+--------+--------+--------+
//! |        data representation        |
//! +--------+--------+--------+--------+
//! |   frag_len      |   auth_len      |
//! +--------+--------+--------+--------+
//! |             call_id               |
//! +--------+--------+--------+--------+
//! ```
//!
//! Bodies are NDR-encoded with the byte order announced in the header, so
//! the codec is built on [`NdrWriter`] and [`NdrReader`]: every length
//! field is validated against the received bytes before it is used.

use crate::error::{Result, RpcError};
use crate::security::{calculate_auth_padding, AuthVerifier};
use bytes::Bytes;
use msrpc_ndr::{NdrContext, NdrDecode, NdrEncode, NdrReader, NdrWriter, Uuid};
use std::fmt;
use std::ops::Range;

/// DCE RPC protocol version
pub const DCE_RPC_VERSION: u8 = 5;
/// DCE RPC protocol minor version
pub const DCE_RPC_VERSION_MINOR: u8 = 0;

/// Fragment size proposed in bind PDUs
pub const DEFAULT_MAX_FRAG: u16 = 4280;

/// NDR transfer syntax `8a885d04-1ceb-11c9-9fe8-08002b104860`
pub const NDR_SYNTAX_UUID: Uuid = Uuid::new(
    0x8a88_5d04,
    0x1ceb,
    0x11c9,
    [0x9f, 0xe8, 0x08, 0x00, 0x2b, 0x10, 0x48, 0x60],
);
pub const NDR_SYNTAX_VERSION: u16 = 2;

/// Connection-oriented packet types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Request = 0,
    Response = 2,
    Fault = 3,
    Bind = 11,
    BindAck = 12,
    BindNak = 13,
    AlterContext = 14,
    AlterContextResp = 15,
    /// Third leg of a three-way authentication (MS-RPCE)
    Auth3 = 16,
    Shutdown = 17,
    CoCancel = 18,
    Orphaned = 19,
}

impl PacketType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Request),
            2 => Some(Self::Response),
            3 => Some(Self::Fault),
            11 => Some(Self::Bind),
            12 => Some(Self::BindAck),
            13 => Some(Self::BindNak),
            14 => Some(Self::AlterContext),
            15 => Some(Self::AlterContextResp),
            16 => Some(Self::Auth3),
            17 => Some(Self::Shutdown),
            18 => Some(Self::CoCancel),
            19 => Some(Self::Orphaned),
            _ => None,
        }
    }
}

/// Packet flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketFlags(u8);

impl PacketFlags {
    /// First fragment
    pub const FIRST_FRAG: u8 = 0x01;
    /// Last fragment
    pub const LAST_FRAG: u8 = 0x02;
    /// Cancel pending
    pub const PENDING_CANCEL: u8 = 0x04;
    /// Supports concurrent multiplexing
    pub const CONC_MPX: u8 = 0x10;
    /// Did not execute
    pub const DID_NOT_EXECUTE: u8 = 0x20;
    /// Maybe semantics requested
    pub const MAYBE: u8 = 0x40;
    /// Object UUID present in a request
    pub const OBJECT_UUID: u8 = 0x80;

    pub fn new() -> Self {
        Self(0)
    }

    /// Flags for a complete (non-fragmented) PDU
    pub fn complete() -> Self {
        Self(Self::FIRST_FRAG | Self::LAST_FRAG)
    }

    pub fn contains(&self, flag: u8) -> bool {
        self.0 & flag == flag
    }

    pub fn set(&mut self, flag: u8, on: bool) -> &mut Self {
        if on {
            self.0 |= flag;
        } else {
            self.0 &= !flag;
        }
        self
    }

    pub fn is_first_frag(&self) -> bool {
        self.contains(Self::FIRST_FRAG)
    }

    pub fn is_last_frag(&self) -> bool {
        self.contains(Self::LAST_FRAG)
    }

    pub fn as_u8(&self) -> u8 {
        self.0
    }

    pub fn from_u8(value: u8) -> Self {
        Self(value)
    }
}

/// Data Representation Format Label
///
/// - Byte 0: integer representation (bits 4-7) and character set (bits 0-3)
/// - Byte 1: floating point representation
/// - Bytes 2-3: reserved (zero)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataRepresentation {
    pub int_rep: IntRep,
    pub char_rep: CharRep,
    pub float_rep: FloatRep,
}

/// Integer representation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntRep {
    BigEndian = 0,
    LittleEndian = 1,
}

/// Character representation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CharRep {
    Ascii = 0,
    Ebcdic = 1,
}

/// Floating point representation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloatRep {
    Ieee = 0,
    Vax = 1,
    Cray = 2,
    Ibm = 3,
}

impl DataRepresentation {
    /// Little-endian, ASCII, IEEE
    pub fn ndr() -> Self {
        Self {
            int_rep: IntRep::LittleEndian,
            char_rep: CharRep::Ascii,
            float_rep: FloatRep::Ieee,
        }
    }

    pub fn big_endian() -> Self {
        Self {
            int_rep: IntRep::BigEndian,
            ..Self::ndr()
        }
    }

    /// For little-endian ASCII IEEE: `[0x10, 0x00, 0x00, 0x00]`
    pub fn encode(&self) -> [u8; 4] {
        let byte0 = (self.char_rep as u8) | ((self.int_rep as u8) << 4);
        [byte0, self.float_rep as u8, 0, 0]
    }

    pub fn decode(data: [u8; 4]) -> Self {
        let int_rep = if data[0] & 0xF0 == 0 {
            IntRep::BigEndian
        } else {
            IntRep::LittleEndian
        };
        let char_rep = if data[0] & 0x0F == 0 {
            CharRep::Ascii
        } else {
            CharRep::Ebcdic
        };
        let float_rep = match data[1] {
            0 => FloatRep::Ieee,
            1 => FloatRep::Vax,
            2 => FloatRep::Cray,
            _ => FloatRep::Ibm,
        };
        Self {
            int_rep,
            char_rep,
            float_rep,
        }
    }

    pub fn is_little_endian(&self) -> bool {
        self.int_rep == IntRep::LittleEndian
    }

    /// Codec settings for stub data carried under this label
    pub fn ndr_context(&self, limits: NdrContext) -> NdrContext {
        limits.byte_order(self.is_little_endian())
    }
}

impl Default for DataRepresentation {
    fn default() -> Self {
        Self::ndr()
    }
}

/// Interface or transfer syntax identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SyntaxId {
    pub uuid: Uuid,
    /// Major version in the low 16 bits, minor in the high 16 bits
    pub version: u32,
}

impl SyntaxId {
    pub fn new(uuid: Uuid, major: u16, minor: u16) -> Self {
        Self {
            uuid,
            version: u32::from(major) | (u32::from(minor) << 16),
        }
    }

    /// The NDR transfer syntax, version 2.0
    pub fn ndr() -> Self {
        Self::new(NDR_SYNTAX_UUID, NDR_SYNTAX_VERSION, 0)
    }

    pub fn major_version(&self) -> u16 {
        self.version as u16
    }

    pub fn minor_version(&self) -> u16 {
        (self.version >> 16) as u16
    }
}

impl fmt::Display for SyntaxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} v{}.{}",
            self.uuid,
            self.major_version(),
            self.minor_version()
        )
    }
}

impl NdrEncode for SyntaxId {
    fn ndr_encode<'a>(&'a self, w: &mut NdrWriter<'a>) -> msrpc_ndr::Result<()> {
        self.uuid.ndr_encode(w)?;
        w.write_u32(self.version);
        Ok(())
    }

    fn ndr_align() -> usize {
        4
    }
}

impl NdrDecode for SyntaxId {
    fn ndr_decode(r: &mut NdrReader) -> msrpc_ndr::Result<Self> {
        Ok(Self {
            uuid: Uuid::ndr_decode(r)?,
            version: r.read_u32()?,
        })
    }

    fn ndr_align() -> usize {
        4
    }

    fn ndr_min_size() -> usize {
        20
    }
}

/// Common PDU header (16 bytes)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PduHeader {
    pub version: u8,
    pub version_minor: u8,
    pub packet_type: PacketType,
    pub packet_flags: PacketFlags,
    pub data_rep: DataRepresentation,
    /// Total length of this fragment, header included
    pub frag_length: u16,
    /// Length of the auth token, excluding the 8-byte `sec_trailer`
    pub auth_length: u16,
    pub call_id: u32,
}

impl PduHeader {
    /// PDU header size in bytes
    pub const SIZE: usize = 16;

    pub fn new(packet_type: PacketType, call_id: u32) -> Self {
        Self {
            version: DCE_RPC_VERSION,
            version_minor: DCE_RPC_VERSION_MINOR,
            packet_type,
            packet_flags: PacketFlags::complete(),
            data_rep: DataRepresentation::ndr(),
            frag_length: 0,
            auth_length: 0,
            call_id,
        }
    }

    fn encode(&self, w: &mut NdrWriter<'_>) {
        w.write_u8(self.version);
        w.write_u8(self.version_minor);
        w.write_u8(self.packet_type as u8);
        w.write_u8(self.packet_flags.as_u8());
        w.write_bytes(&self.data_rep.encode());
        w.write_u16(self.frag_length);
        w.write_u16(self.auth_length);
        w.write_u32(self.call_id);
    }

    /// Parse and validate the first 16 bytes of a PDU
    pub fn decode(data: &[u8]) -> Result<Self> {
        let header: &[u8; 16] = data
            .get(..Self::SIZE)
            .and_then(|h| h.try_into().ok())
            .ok_or_else(|| {
                RpcError::InvalidPdu(format!("PDU header too short: {} bytes", data.len()))
            })?;

        if header[0] != DCE_RPC_VERSION || header[1] > 1 {
            return Err(RpcError::InvalidPdu(format!(
                "unsupported protocol version {}.{}",
                header[0], header[1]
            )));
        }
        let packet_type =
            PacketType::from_u8(header[2]).ok_or(RpcError::InvalidMessageType(header[2]))?;
        let data_rep = DataRepresentation::decode([header[4], header[5], header[6], header[7]]);

        let (frag_length, auth_length, call_id) = if data_rep.is_little_endian() {
            (
                u16::from_le_bytes([header[8], header[9]]),
                u16::from_le_bytes([header[10], header[11]]),
                u32::from_le_bytes([header[12], header[13], header[14], header[15]]),
            )
        } else {
            (
                u16::from_be_bytes([header[8], header[9]]),
                u16::from_be_bytes([header[10], header[11]]),
                u32::from_be_bytes([header[12], header[13], header[14], header[15]]),
            )
        };

        if usize::from(frag_length) < Self::SIZE {
            return Err(RpcError::InvalidPdu(format!(
                "fragment length {frag_length} shorter than header"
            )));
        }

        Ok(Self {
            version: header[0],
            version_minor: header[1],
            packet_type,
            packet_flags: PacketFlags::from_u8(header[3]),
            data_rep,
            frag_length,
            auth_length,
            call_id,
        })
    }

    /// Offset of the `sec_trailer` in this fragment, if it carries one
    pub fn trailer_offset(&self) -> Option<usize> {
        if self.auth_length == 0 {
            return None;
        }
        usize::from(self.frag_length)
            .checked_sub(usize::from(self.auth_length) + AuthVerifier::HEADER_SIZE)
            .filter(|offset| *offset >= Self::SIZE)
    }

    /// Byte range of the stub data (plus trailer padding) in a request or
    /// response fragment described by this header
    pub fn stub_range(&self) -> Option<Range<usize>> {
        let start = match self.packet_type {
            PacketType::Request if self.packet_flags.contains(PacketFlags::OBJECT_UUID) => {
                Self::SIZE + RequestPdu::BODY_HEADER_SIZE + 16
            }
            PacketType::Request => Self::SIZE + RequestPdu::BODY_HEADER_SIZE,
            PacketType::Response => Self::SIZE + ResponsePdu::BODY_HEADER_SIZE,
            _ => return None,
        };
        let end = if self.auth_length == 0 {
            usize::from(self.frag_length)
        } else {
            self.trailer_offset()?
        };
        (start <= end).then_some(start..end)
    }
}

/// Presentation context proposed in bind and alter_context
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextElement {
    pub context_id: u16,
    pub abstract_syntax: SyntaxId,
    pub transfer_syntaxes: Vec<SyntaxId>,
}

impl ContextElement {
    pub fn new(context_id: u16, abstract_syntax: SyntaxId, transfer_syntax: SyntaxId) -> Self {
        Self {
            context_id,
            abstract_syntax,
            transfer_syntaxes: vec![transfer_syntax],
        }
    }
}

impl NdrEncode for ContextElement {
    fn ndr_encode<'a>(&'a self, w: &mut NdrWriter<'a>) -> msrpc_ndr::Result<()> {
        w.write_u16(self.context_id);
        w.write_u8(count_u8(self.transfer_syntaxes.len())?);
        w.write_u8(0);
        self.abstract_syntax.ndr_encode(w)?;
        for ts in &self.transfer_syntaxes {
            ts.ndr_encode(w)?;
        }
        Ok(())
    }

    fn ndr_align() -> usize {
        4
    }
}

impl NdrDecode for ContextElement {
    fn ndr_decode(r: &mut NdrReader) -> msrpc_ndr::Result<Self> {
        let context_id = r.read_u16()?;
        let n_transfer = r.read_u8()?;
        let _reserved = r.read_u8()?;
        let abstract_syntax = SyntaxId::ndr_decode(r)?;
        let count = r.check_count(u32::from(n_transfer), SyntaxId::ndr_min_size())?;
        let transfer_syntaxes = (0..count)
            .map(|_| SyntaxId::ndr_decode(r))
            .collect::<msrpc_ndr::Result<Vec<_>>>()?;
        Ok(Self {
            context_id,
            abstract_syntax,
            transfer_syntaxes,
        })
    }

    fn ndr_align() -> usize {
        4
    }

    fn ndr_min_size() -> usize {
        24
    }
}

fn count_u8(len: usize) -> msrpc_ndr::Result<u8> {
    u8::try_from(len).map_err(|_| msrpc_ndr::NdrError::SizeOverflow {
        declared: len as u64,
        limit: u64::from(u8::MAX),
    })
}

/// Bind and alter_context body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindPdu {
    pub max_xmit_frag: u16,
    pub max_recv_frag: u16,
    pub assoc_group_id: u32,
    pub context_list: Vec<ContextElement>,
}

impl BindPdu {
    /// Propose one context for `interface` with the NDR transfer syntax
    pub fn new(context_id: u16, interface: SyntaxId) -> Self {
        Self {
            max_xmit_frag: DEFAULT_MAX_FRAG,
            max_recv_frag: DEFAULT_MAX_FRAG,
            assoc_group_id: 0,
            context_list: vec![ContextElement::new(context_id, interface, SyntaxId::ndr())],
        }
    }

    fn encode<'a>(&'a self, w: &mut NdrWriter<'a>) -> msrpc_ndr::Result<()> {
        w.write_u16(self.max_xmit_frag);
        w.write_u16(self.max_recv_frag);
        w.write_u32(self.assoc_group_id);
        w.write_u8(count_u8(self.context_list.len())?);
        w.write_u8(0);
        w.write_u16(0);
        for ctx in &self.context_list {
            ctx.ndr_encode(w)?;
        }
        Ok(())
    }

    fn decode(r: &mut NdrReader) -> msrpc_ndr::Result<Self> {
        let max_xmit_frag = r.read_u16()?;
        let max_recv_frag = r.read_u16()?;
        let assoc_group_id = r.read_u32()?;
        let n_context = r.read_u8()?;
        let _reserved = r.read_u8()?;
        let _reserved2 = r.read_u16()?;
        let count = r.check_count(u32::from(n_context), ContextElement::ndr_min_size())?;
        let context_list = (0..count)
            .map(|_| ContextElement::ndr_decode(r))
            .collect::<msrpc_ndr::Result<Vec<_>>>()?;
        Ok(Self {
            max_xmit_frag,
            max_recv_frag,
            assoc_group_id,
            context_list,
        })
    }
}

/// Outcome of one proposed presentation context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextResult {
    Acceptance,
    UserRejection,
    ProviderRejection,
    /// Bind time feature negotiation acknowledgement (MS-RPCE 3.3.1.5.3)
    NegotiateAck,
}

impl ContextResult {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(Self::Acceptance),
            1 => Some(Self::UserRejection),
            2 => Some(Self::ProviderRejection),
            3 => Some(Self::NegotiateAck),
            _ => None,
        }
    }

    pub fn as_u16(&self) -> u16 {
        match self {
            Self::Acceptance => 0,
            Self::UserRejection => 1,
            Self::ProviderRejection => 2,
            Self::NegotiateAck => 3,
        }
    }
}

/// Why a presentation context was rejected (`p_provider_reason_t`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderReason {
    NotSpecified,
    AbstractSyntaxNotSupported,
    ProposedTransferSyntaxesNotSupported,
    LocalLimitExceeded,
    Other(u16),
}

impl ProviderReason {
    pub fn from_u16(value: u16) -> Self {
        match value {
            0 => Self::NotSpecified,
            1 => Self::AbstractSyntaxNotSupported,
            2 => Self::ProposedTransferSyntaxesNotSupported,
            3 => Self::LocalLimitExceeded,
            other => Self::Other(other),
        }
    }

    pub fn as_u16(&self) -> u16 {
        match self {
            Self::NotSpecified => 0,
            Self::AbstractSyntaxNotSupported => 1,
            Self::ProposedTransferSyntaxesNotSupported => 2,
            Self::LocalLimitExceeded => 3,
            Self::Other(value) => *value,
        }
    }
}

impl fmt::Display for ProviderReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotSpecified => f.write_str("reason not specified"),
            Self::AbstractSyntaxNotSupported => f.write_str("abstract syntax not supported"),
            Self::ProposedTransferSyntaxesNotSupported => {
                f.write_str("proposed transfer syntaxes not supported")
            }
            Self::LocalLimitExceeded => f.write_str("local limit exceeded"),
            Self::Other(value) => write!(f, "reason {value}"),
        }
    }
}

/// Why an association was refused (`p_reject_reason_t`, carried by bind_nak)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    NotSpecified,
    TemporaryCongestion,
    LocalLimitExceeded,
    CalledPaddrUnknown,
    ProtocolVersionNotSupported,
    DefaultContextNotSupported,
    UserDataNotReadable,
    NoPsapAvailable,
    AuthTypeNotRecognized,
    InvalidChecksum,
    Other(u16),
}

impl RejectReason {
    pub fn from_u16(value: u16) -> Self {
        match value {
            0 => Self::NotSpecified,
            1 => Self::TemporaryCongestion,
            2 => Self::LocalLimitExceeded,
            3 => Self::CalledPaddrUnknown,
            4 => Self::ProtocolVersionNotSupported,
            5 => Self::DefaultContextNotSupported,
            6 => Self::UserDataNotReadable,
            7 => Self::NoPsapAvailable,
            8 => Self::AuthTypeNotRecognized,
            9 => Self::InvalidChecksum,
            other => Self::Other(other),
        }
    }

    pub fn as_u16(&self) -> u16 {
        match self {
            Self::NotSpecified => 0,
            Self::TemporaryCongestion => 1,
            Self::LocalLimitExceeded => 2,
            Self::CalledPaddrUnknown => 3,
            Self::ProtocolVersionNotSupported => 4,
            Self::DefaultContextNotSupported => 5,
            Self::UserDataNotReadable => 6,
            Self::NoPsapAvailable => 7,
            Self::AuthTypeNotRecognized => 8,
            Self::InvalidChecksum => 9,
            Self::Other(value) => *value,
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::NotSpecified => "reason not specified",
            Self::TemporaryCongestion => "temporary congestion",
            Self::LocalLimitExceeded => "local limit exceeded",
            Self::CalledPaddrUnknown => "called presentation address unknown",
            Self::ProtocolVersionNotSupported => "protocol version not supported",
            Self::DefaultContextNotSupported => "default context not supported",
            Self::UserDataNotReadable => "user data not readable",
            Self::NoPsapAvailable => "no presentation service access point available",
            Self::AuthTypeNotRecognized => "authentication type not recognized",
            Self::InvalidChecksum => "invalid checksum",
            Self::Other(value) => return write!(f, "reason {value}"),
        };
        f.write_str(text)
    }
}

/// One entry of the bind_ack result list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresentationResult {
    pub result: ContextResult,
    pub reason: ProviderReason,
    pub transfer_syntax: SyntaxId,
}

impl PresentationResult {
    pub fn accepted(transfer_syntax: SyntaxId) -> Self {
        Self {
            result: ContextResult::Acceptance,
            reason: ProviderReason::NotSpecified,
            transfer_syntax,
        }
    }

    pub fn rejected(reason: ProviderReason) -> Self {
        Self {
            result: ContextResult::ProviderRejection,
            reason,
            transfer_syntax: SyntaxId::new(Uuid::NIL, 0, 0),
        }
    }
}

impl NdrEncode for PresentationResult {
    fn ndr_encode<'a>(&'a self, w: &mut NdrWriter<'a>) -> msrpc_ndr::Result<()> {
        w.write_u16(self.result.as_u16());
        w.write_u16(self.reason.as_u16());
        self.transfer_syntax.ndr_encode(w)
    }

    fn ndr_align() -> usize {
        4
    }
}

impl NdrDecode for PresentationResult {
    fn ndr_decode(r: &mut NdrReader) -> msrpc_ndr::Result<Self> {
        let code = r.read_u16()?;
        let result = ContextResult::from_u16(code)
            .ok_or(msrpc_ndr::NdrError::InvalidEnumValue(u32::from(code)))?;
        Ok(Self {
            result,
            reason: ProviderReason::from_u16(r.read_u16()?),
            transfer_syntax: SyntaxId::ndr_decode(r)?,
        })
    }

    fn ndr_align() -> usize {
        4
    }

    fn ndr_min_size() -> usize {
        24
    }
}

/// Bind_ack and alter_context_resp body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindAckPdu {
    pub max_xmit_frag: u16,
    pub max_recv_frag: u16,
    pub assoc_group_id: u32,
    /// Secondary address (usually the server port); empty in
    /// alter_context_resp
    pub secondary_addr: String,
    pub results: Vec<PresentationResult>,
}

impl BindAckPdu {
    pub fn new(assoc_group_id: u32, results: Vec<PresentationResult>) -> Self {
        Self {
            max_xmit_frag: DEFAULT_MAX_FRAG,
            max_recv_frag: DEFAULT_MAX_FRAG,
            assoc_group_id,
            secondary_addr: String::new(),
            results,
        }
    }

    fn encode<'a>(&'a self, w: &mut NdrWriter<'a>) -> msrpc_ndr::Result<()> {
        w.write_u16(self.max_xmit_frag);
        w.write_u16(self.max_recv_frag);
        w.write_u32(self.assoc_group_id);

        if self.secondary_addr.is_empty() {
            w.write_u16(0);
        } else {
            let len = self.secondary_addr.len() + 1;
            let len = u16::try_from(len).map_err(|_| msrpc_ndr::NdrError::SizeOverflow {
                declared: len as u64,
                limit: u64::from(u16::MAX),
            })?;
            w.write_u16(len);
            w.write_bytes(self.secondary_addr.as_bytes());
            w.write_u8(0);
        }
        w.align(4)?;

        w.write_u8(count_u8(self.results.len())?);
        w.write_u8(0);
        w.write_u16(0);
        for result in &self.results {
            result.ndr_encode(w)?;
        }
        Ok(())
    }

    fn decode(r: &mut NdrReader) -> msrpc_ndr::Result<Self> {
        let max_xmit_frag = r.read_u16()?;
        let max_recv_frag = r.read_u16()?;
        let assoc_group_id = r.read_u32()?;

        let addr_len = r.read_u16()?;
        let addr = r.read_bytes(usize::from(addr_len))?;
        let addr = addr.strip_suffix(&[0u8]).unwrap_or(&addr[..]);
        let secondary_addr = String::from_utf8_lossy(addr).into_owned();
        r.align(4)?;

        let n_results = r.read_u8()?;
        let _reserved = r.read_u8()?;
        let _reserved2 = r.read_u16()?;
        let count = r.check_count(u32::from(n_results), PresentationResult::ndr_min_size())?;
        let results = (0..count)
            .map(|_| PresentationResult::ndr_decode(r))
            .collect::<msrpc_ndr::Result<Vec<_>>>()?;

        Ok(Self {
            max_xmit_frag,
            max_recv_frag,
            assoc_group_id,
            secondary_addr,
            results,
        })
    }
}

/// Bind_nak body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindNakPdu {
    pub reason: RejectReason,
    /// Supported protocol versions as `(major, minor)`
    pub versions: Vec<(u8, u8)>,
}

impl BindNakPdu {
    pub fn new(reason: RejectReason) -> Self {
        Self {
            reason,
            versions: vec![(DCE_RPC_VERSION, DCE_RPC_VERSION_MINOR)],
        }
    }

    fn encode(&self, w: &mut NdrWriter<'_>) -> msrpc_ndr::Result<()> {
        w.write_u16(self.reason.as_u16());
        w.write_u8(count_u8(self.versions.len())?);
        for (major, minor) in &self.versions {
            w.write_u8(*major);
            w.write_u8(*minor);
        }
        Ok(())
    }

    fn decode(r: &mut NdrReader) -> msrpc_ndr::Result<Self> {
        let reason = RejectReason::from_u16(r.read_u16()?);
        // Some peers send only the reason.
        let versions = if r.remaining() == 0 {
            Vec::new()
        } else {
            let n = r.read_u8()?;
            let count = r.check_count(u32::from(n), 2)?;
            (0..count)
                .map(|_| -> msrpc_ndr::Result<(u8, u8)> { Ok((r.read_u8()?, r.read_u8()?)) })
                .collect::<msrpc_ndr::Result<Vec<_>>>()?
        };
        Ok(Self { reason, versions })
    }
}

/// Request body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestPdu {
    /// Total stub size of the call, repeated in every fragment
    pub alloc_hint: u32,
    pub context_id: u16,
    pub opnum: u16,
    pub object_uuid: Option<Uuid>,
    pub stub_data: Bytes,
}

impl RequestPdu {
    /// alloc_hint(4) + context_id(2) + opnum(2)
    pub const BODY_HEADER_SIZE: usize = 8;

    pub fn new(context_id: u16, opnum: u16, stub_data: Bytes) -> Self {
        Self {
            alloc_hint: stub_data.len() as u32,
            context_id,
            opnum,
            object_uuid: None,
            stub_data,
        }
    }

    fn encode<'a>(&'a self, w: &mut NdrWriter<'a>) -> msrpc_ndr::Result<()> {
        w.write_u32(self.alloc_hint);
        w.write_u16(self.context_id);
        w.write_u16(self.opnum);
        if let Some(uuid) = &self.object_uuid {
            uuid.ndr_encode(w)?;
        }
        w.write_bytes(&self.stub_data);
        Ok(())
    }

    fn decode(r: &mut NdrReader, has_object: bool) -> msrpc_ndr::Result<Self> {
        let alloc_hint = r.read_u32()?;
        let context_id = r.read_u16()?;
        let opnum = r.read_u16()?;
        let object_uuid = if has_object {
            Some(Uuid::ndr_decode(r)?)
        } else {
            None
        };
        let stub_data = r.read_bytes(r.remaining())?;
        Ok(Self {
            alloc_hint,
            context_id,
            opnum,
            object_uuid,
            stub_data,
        })
    }
}

/// Response body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponsePdu {
    pub alloc_hint: u32,
    pub context_id: u16,
    pub cancel_count: u8,
    pub stub_data: Bytes,
}

impl ResponsePdu {
    /// alloc_hint(4) + context_id(2) + cancel_count(1) + reserved(1)
    pub const BODY_HEADER_SIZE: usize = 8;

    pub fn new(context_id: u16, stub_data: Bytes) -> Self {
        Self {
            alloc_hint: stub_data.len() as u32,
            context_id,
            cancel_count: 0,
            stub_data,
        }
    }

    fn encode(&self, w: &mut NdrWriter<'_>) {
        w.write_u32(self.alloc_hint);
        w.write_u16(self.context_id);
        w.write_u8(self.cancel_count);
        w.write_u8(0);
        w.write_bytes(&self.stub_data);
    }

    fn decode(r: &mut NdrReader) -> msrpc_ndr::Result<Self> {
        let alloc_hint = r.read_u32()?;
        let context_id = r.read_u16()?;
        let cancel_count = r.read_u8()?;
        let _reserved = r.read_u8()?;
        let stub_data = r.read_bytes(r.remaining())?;
        Ok(Self {
            alloc_hint,
            context_id,
            cancel_count,
            stub_data,
        })
    }
}

/// Fault body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaultPdu {
    pub alloc_hint: u32,
    pub context_id: u16,
    pub cancel_count: u8,
    /// MS-RPCE: 0x01 when extended error information follows
    pub flags: u8,
    pub status: u32,
}

impl FaultPdu {
    pub fn new(context_id: u16, status: u32) -> Self {
        Self {
            alloc_hint: 0,
            context_id,
            cancel_count: 0,
            flags: 0,
            status,
        }
    }

    fn encode(&self, w: &mut NdrWriter<'_>) {
        w.write_u32(self.alloc_hint);
        w.write_u16(self.context_id);
        w.write_u8(self.cancel_count);
        w.write_u8(self.flags);
        w.write_u32(self.status);
        w.write_u32(0);
    }

    fn decode(r: &mut NdrReader) -> msrpc_ndr::Result<Self> {
        let alloc_hint = r.read_u32()?;
        let context_id = r.read_u16()?;
        let cancel_count = r.read_u8()?;
        let flags = r.read_u8()?;
        let status = r.read_u32()?;
        // Trailing reserved word and any extended error data are ignored.
        Ok(Self {
            alloc_hint,
            context_id,
            cancel_count,
            flags,
            status,
        })
    }
}

/// PDU body by packet type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PduBody {
    Bind(BindPdu),
    BindAck(BindAckPdu),
    BindNak(BindNakPdu),
    AlterContext(BindPdu),
    AlterContextResp(BindAckPdu),
    Request(RequestPdu),
    Response(ResponsePdu),
    Fault(FaultPdu),
    /// Four bytes of padding, then the auth verifier
    Auth3,
    Shutdown,
    CoCancel,
    Orphaned,
}

impl PduBody {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Self::Bind(_) => PacketType::Bind,
            Self::BindAck(_) => PacketType::BindAck,
            Self::BindNak(_) => PacketType::BindNak,
            Self::AlterContext(_) => PacketType::AlterContext,
            Self::AlterContextResp(_) => PacketType::AlterContextResp,
            Self::Request(_) => PacketType::Request,
            Self::Response(_) => PacketType::Response,
            Self::Fault(_) => PacketType::Fault,
            Self::Auth3 => PacketType::Auth3,
            Self::Shutdown => PacketType::Shutdown,
            Self::CoCancel => PacketType::CoCancel,
            Self::Orphaned => PacketType::Orphaned,
        }
    }

    fn encode<'a>(&'a self, w: &mut NdrWriter<'a>) -> msrpc_ndr::Result<()> {
        match self {
            Self::Bind(pdu) | Self::AlterContext(pdu) => pdu.encode(w),
            Self::BindAck(pdu) | Self::AlterContextResp(pdu) => pdu.encode(w),
            Self::BindNak(pdu) => pdu.encode(w),
            Self::Request(pdu) => pdu.encode(w),
            Self::Response(pdu) => {
                pdu.encode(w);
                Ok(())
            }
            Self::Fault(pdu) => {
                pdu.encode(w);
                Ok(())
            }
            Self::Auth3 => {
                w.write_u32(0);
                Ok(())
            }
            Self::Shutdown | Self::CoCancel | Self::Orphaned => Ok(()),
        }
    }

    fn decode(header: &PduHeader, r: &mut NdrReader) -> msrpc_ndr::Result<Self> {
        Ok(match header.packet_type {
            PacketType::Bind => Self::Bind(BindPdu::decode(r)?),
            PacketType::AlterContext => Self::AlterContext(BindPdu::decode(r)?),
            PacketType::BindAck => Self::BindAck(BindAckPdu::decode(r)?),
            PacketType::AlterContextResp => Self::AlterContextResp(BindAckPdu::decode(r)?),
            PacketType::BindNak => Self::BindNak(BindNakPdu::decode(r)?),
            PacketType::Request => Self::Request(RequestPdu::decode(
                r,
                header.packet_flags.contains(PacketFlags::OBJECT_UUID),
            )?),
            PacketType::Response => Self::Response(ResponsePdu::decode(r)?),
            PacketType::Fault => Self::Fault(FaultPdu::decode(r)?),
            PacketType::Auth3 => Self::Auth3,
            PacketType::Shutdown => Self::Shutdown,
            PacketType::CoCancel => Self::CoCancel,
            PacketType::Orphaned => Self::Orphaned,
        })
    }
}

/// A complete connection-oriented PDU (one fragment)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pdu {
    pub header: PduHeader,
    pub body: PduBody,
    pub auth_verifier: Option<AuthVerifier>,
}

impl Pdu {
    pub fn new(call_id: u32, body: PduBody) -> Self {
        Self {
            header: PduHeader::new(body.packet_type(), call_id),
            body,
            auth_verifier: None,
        }
    }

    pub fn with_auth(mut self, verifier: AuthVerifier) -> Self {
        self.auth_verifier = Some(verifier);
        self
    }

    pub fn with_data_rep(mut self, data_rep: DataRepresentation) -> Self {
        self.header.data_rep = data_rep;
        self
    }

    pub fn call_id(&self) -> u32 {
        self.header.call_id
    }

    pub fn packet_type(&self) -> PacketType {
        self.header.packet_type
    }

    /// Encode the PDU, filling in `frag_length`, `auth_length` and the
    /// trailer padding.
    pub fn encode(&self) -> Result<Bytes> {
        let ctx = self.header.data_rep.ndr_context(NdrContext::new());
        let mut w = NdrWriter::with_context(ctx);

        let mut header = self.header.clone();
        header.packet_type = self.body.packet_type();
        if let PduBody::Request(req) = &self.body {
            header
                .packet_flags
                .set(PacketFlags::OBJECT_UUID, req.object_uuid.is_some());
        }
        header.encode(&mut w);
        self.body.encode(&mut w).map_err(RpcError::invalid_pdu)?;

        let mut auth_length = 0;
        if let Some(auth) = &self.auth_verifier {
            let pad = calculate_auth_padding(w.position(), auth.auth_level);
            w.write_bytes(&[0u8; 16][..pad]);
            let mut trailer = auth.clone();
            trailer.auth_pad_length = pad as u8;
            trailer.encode(&mut w);
            auth_length = auth.auth_value.len();
        }

        let size = w.position();
        let frag_length = u16::try_from(size).map_err(|_| RpcError::PduTooLarge {
            size,
            max: usize::from(u16::MAX),
        })?;
        let auth_length = u16::try_from(auth_length).map_err(|_| RpcError::PduTooLarge {
            size: auth_length,
            max: usize::from(u16::MAX),
        })?;
        w.patch_u16(8, frag_length).map_err(RpcError::invalid_pdu)?;
        w.patch_u16(10, auth_length).map_err(RpcError::invalid_pdu)?;
        Ok(w.into_inner().freeze())
    }

    /// Decode one fragment. Bytes past `frag_length` are ignored.
    pub fn decode(data: Bytes) -> Result<Self> {
        let header = PduHeader::decode(&data)?;
        let frag_length = usize::from(header.frag_length);
        if data.len() < frag_length {
            return Err(RpcError::InvalidPdu(format!(
                "fragment truncated: {} of {} bytes",
                data.len(),
                frag_length
            )));
        }
        let ctx = header.data_rep.ndr_context(NdrContext::new());

        let (body_end, auth_verifier) = if header.auth_length > 0 {
            let trailer = header.trailer_offset().ok_or_else(|| {
                RpcError::InvalidPdu(format!(
                    "auth length {} exceeds fragment length {}",
                    header.auth_length, header.frag_length
                ))
            })?;
            let mut r = NdrReader::with_context(data.slice(trailer..frag_length), ctx);
            let verifier = AuthVerifier::decode(&mut r, usize::from(header.auth_length))?;
            let body_end = trailer
                .checked_sub(usize::from(verifier.auth_pad_length))
                .filter(|end| *end >= PduHeader::SIZE)
                .ok_or_else(|| {
                    RpcError::InvalidPdu(format!(
                        "auth padding {} overruns the body",
                        verifier.auth_pad_length
                    ))
                })?;
            (body_end, Some(verifier))
        } else {
            (frag_length, None)
        };

        let mut r = NdrReader::with_context(data.slice(PduHeader::SIZE..body_end), ctx);
        let body = PduBody::decode(&header, &mut r).map_err(RpcError::invalid_pdu)?;

        Ok(Self {
            header,
            body,
            auth_verifier,
        })
    }
}
