//! Security trailer and the authentication collaborator
//!
//! Authenticated PDUs end with an auth verifier (`sec_trailer` plus token).
//! The PDU codec writes and parses the trailer; producing tokens and
//! signing or sealing stub data is delegated to a [`SecurityProvider`].
//!
//! Wire format follows MS-RPCE 2.2.2.11.

use crate::error::{Result, RpcError};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use msrpc_ndr::{NdrContext, NdrReader, NdrWriter};
use std::ops::Range;

/// Authentication types (MS-RPCE Section 2.2.1.1.7)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AuthType {
    /// No authentication
    None = 0,
    /// OSF DCE private key authentication (deprecated)
    DcePrivate = 1,
    /// OSF DCE public key authentication (deprecated)
    DcePublic = 2,
    /// GSS Negotiate (SPNEGO)
    GssNegotiate = 9,
    /// Windows NT LAN Manager (NTLM)
    Ntlm = 10,
    /// GSS Kerberos
    GssKerberos = 16,
    /// Netlogon secure channel
    Netlogon = 68,
}

impl AuthType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::None),
            1 => Some(Self::DcePrivate),
            2 => Some(Self::DcePublic),
            9 => Some(Self::GssNegotiate),
            10 => Some(Self::Ntlm),
            16 => Some(Self::GssKerberos),
            68 => Some(Self::Netlogon),
            _ => None,
        }
    }
}

/// Authentication levels (MS-RPCE Section 2.2.1.1.8)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
#[repr(u8)]
pub enum AuthLevel {
    #[default]
    None = 1,
    /// Authenticate at bind time only
    Connect = 2,
    Call = 3,
    Pkt = 4,
    /// Sign each packet
    PktIntegrity = 5,
    /// Seal each packet
    PktPrivacy = 6,
}

impl AuthLevel {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::None),
            2 => Some(Self::Connect),
            3 => Some(Self::Call),
            4 => Some(Self::Pkt),
            5 => Some(Self::PktIntegrity),
            6 => Some(Self::PktPrivacy),
            _ => None,
        }
    }

    /// Returns true if request and response fragments carry a signature
    pub fn requires_signing(&self) -> bool {
        matches!(self, Self::PktIntegrity | Self::PktPrivacy)
    }

    /// Returns true if stub data is encrypted
    pub fn requires_encryption(&self) -> bool {
        matches!(self, Self::PktPrivacy)
    }
}

/// Authentication verifier (appended to authenticated PDUs)
///
/// ```text
/// +-----------+------------+--------------+----------+
/// | auth_type | auth_level | auth_pad_len | reserved |
/// +-----------+------------+--------------+----------+
/// |               auth_context_id                    |
/// +--------------------------------------------------+
/// |          auth_value (auth_length bytes)          |
/// +--------------------------------------------------+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthVerifier {
    pub auth_type: AuthType,
    pub auth_level: AuthLevel,
    /// Number of padding bytes between the stub and this verifier
    pub auth_pad_length: u8,
    pub reserved: u8,
    pub auth_context_id: u32,
    /// Token or signature
    pub auth_value: Bytes,
}

impl AuthVerifier {
    /// Size of the fixed `sec_trailer` portion
    pub const HEADER_SIZE: usize = 8;

    pub fn new(
        auth_type: AuthType,
        auth_level: AuthLevel,
        auth_context_id: u32,
        auth_value: Bytes,
    ) -> Self {
        Self {
            auth_type,
            auth_level,
            auth_pad_length: 0,
            reserved: 0,
            auth_context_id,
            auth_value,
        }
    }

    /// Total size including header and auth value
    pub fn size(&self) -> usize {
        Self::HEADER_SIZE + self.auth_value.len()
    }

    pub fn encode(&self, w: &mut NdrWriter<'_>) {
        w.write_u8(self.auth_type as u8);
        w.write_u8(self.auth_level as u8);
        w.write_u8(self.auth_pad_length);
        w.write_u8(self.reserved);
        w.write_u32(self.auth_context_id);
        w.write_bytes(&self.auth_value);
    }

    /// Parse a verifier whose token is `auth_length` bytes long.
    ///
    /// The reader must be positioned at the start of the `sec_trailer`, which
    /// is 4-byte aligned relative to the start of the PDU.
    pub fn decode(r: &mut NdrReader, auth_length: usize) -> Result<Self> {
        let auth_type = r.read_u8().map_err(RpcError::invalid_pdu)?;
        let auth_type = AuthType::from_u8(auth_type)
            .ok_or_else(|| RpcError::Security(format!("unknown auth type {auth_type}")))?;
        let auth_level = r.read_u8().map_err(RpcError::invalid_pdu)?;
        let auth_level = AuthLevel::from_u8(auth_level)
            .ok_or_else(|| RpcError::Security(format!("unknown auth level {auth_level}")))?;
        let auth_pad_length = r.read_u8().map_err(RpcError::invalid_pdu)?;
        let reserved = r.read_u8().map_err(RpcError::invalid_pdu)?;
        let auth_context_id = r.read_u32().map_err(RpcError::invalid_pdu)?;
        let auth_value = r.read_bytes(auth_length).map_err(RpcError::invalid_pdu)?;
        Ok(Self {
            auth_type,
            auth_level,
            auth_pad_length,
            reserved,
            auth_context_id,
            auth_value,
        })
    }
}

/// Alignment of the `sec_trailer` relative to the start of the PDU.
///
/// Sealed stubs are padded to the 16-byte cipher block size.
pub fn auth_alignment(level: AuthLevel) -> usize {
    if level.requires_encryption() {
        16
    } else {
        4
    }
}

/// Padding needed to bring `offset` (measured from the start of the PDU) to
/// the trailer alignment for `level`
pub fn calculate_auth_padding(offset: usize, level: AuthLevel) -> usize {
    NdrContext::align_padding(offset, auth_alignment(level))
}

/// Maximum signature size for common auth types
pub fn max_signature_size(auth_type: AuthType) -> usize {
    match auth_type {
        AuthType::Ntlm => 16,
        AuthType::GssNegotiate | AuthType::GssKerberos => 76,
        _ => 0,
    }
}

/// Authentication collaborator.
///
/// Implementations own the security context (NTLM, Kerberos or anything
/// else); the client only moves tokens between the provider and the wire.
/// Methods take `&self`, so providers keep sequence numbers and keys behind
/// their own locks.
#[async_trait]
pub trait SecurityProvider: Send + Sync {
    fn auth_type(&self) -> AuthType;

    fn auth_level(&self) -> AuthLevel;

    fn auth_context_id(&self) -> u32 {
        0
    }

    /// Size of the signature appended to protected fragments
    fn signature_size(&self) -> usize {
        max_signature_size(self.auth_type())
    }

    /// Token carried by the bind PDU
    async fn initial_token(&self) -> Result<Bytes>;

    /// Consume the token from bind_ack; a returned token is sent in an
    /// auth3 PDU to complete a three-leg exchange.
    async fn process_token(&self, token: Bytes) -> Result<Option<Bytes>>;

    /// Sign or seal an outgoing fragment in place.
    ///
    /// `fragment` is the complete encoded PDU with a zeroed signature of
    /// [`signature_size`](Self::signature_size) bytes at its end; `stub`
    /// locates the stub data (including trailer padding).
    async fn protect(&self, fragment: &mut BytesMut, stub: Range<usize>) -> Result<()>;

    /// Check the signature of an incoming fragment and unseal its stub in
    /// place.
    async fn verify(&self, fragment: &mut BytesMut, stub: Range<usize>) -> Result<()>;
}
