//! Multi-PDU fragmentation
//!
//! Defined in DCE 1.1 (C706) section 12.5 and MS-RPCE. When stub data
//! exceeds the negotiated `max_xmit_frag`/`max_recv_frag`, a call is split
//! into several fragments. Each fragment carries:
//! - The same call_id
//! - FIRST_FRAG flag on first fragment
//! - LAST_FRAG flag on last fragment
//! - The whole-call `alloc_hint`
//!
//! # Fragment Structure
//!
//! ```text
//! max_frag size limit (e.g., 4280 bytes)
//! ├── PDU Header (16 bytes)
//! ├── Request/Response body header (8 bytes)
//! ├── Object UUID (16 bytes, optional, request only)
//! ├── Stub data fragment (variable)
//! ├── Auth padding (0-15 bytes, if authenticated)
//! └── Auth verifier (8 + auth_value bytes, if authenticated)
//! ```

use crate::error::{Result, RpcError};
use crate::pdu::{PacketFlags, Pdu, PduBody, PduHeader, RequestPdu, ResponsePdu};
use crate::security::AuthVerifier;
use bytes::{Bytes, BytesMut};

/// Splits outgoing calls into fragments
pub struct FragmentGenerator;

impl FragmentGenerator {
    /// Stub bytes that fit in one fragment of `max_frag` bytes.
    ///
    /// `auth_len` is the length of the token or signature carried by every
    /// fragment (0 without authentication).
    pub fn max_stub_size(max_frag: u16, auth_len: usize, has_object_uuid: bool) -> usize {
        let object_uuid_size = if has_object_uuid { 16 } else { 0 };
        let auth_overhead = if auth_len > 0 {
            // worst case padding + sec_trailer + token
            15 + AuthVerifier::HEADER_SIZE + auth_len
        } else {
            0
        };
        let overhead =
            PduHeader::SIZE + RequestPdu::BODY_HEADER_SIZE + object_uuid_size + auth_overhead;
        usize::from(max_frag).saturating_sub(overhead)
    }

    /// Split `stub` into chunks of at most `max_stub` bytes with their
    /// fragment flags. An empty stub still yields one (complete) fragment.
    fn chunks(stub: &Bytes, max_stub: usize) -> Vec<(Bytes, PacketFlags)> {
        let max_stub = max_stub.max(1);
        let total = stub.len();
        let mut out = Vec::with_capacity(total / max_stub + 1);
        let mut offset = 0;
        loop {
            let end = (offset + max_stub).min(total);
            let mut flags = PacketFlags::new();
            flags.set(PacketFlags::FIRST_FRAG, offset == 0);
            flags.set(PacketFlags::LAST_FRAG, end == total);
            out.push((stub.slice(offset..end), flags));
            if end == total {
                return out;
            }
            offset = end;
        }
    }

    /// Fragment a request.
    ///
    /// Returns one PDU per fragment, all with `call_id` and the alloc_hint
    /// of the whole call. Auth verifiers are attached per fragment by the
    /// caller.
    pub fn fragment_request(
        call_id: u32,
        request: &RequestPdu,
        max_frag: u16,
        auth_len: usize,
    ) -> Vec<Pdu> {
        let max_stub = Self::max_stub_size(max_frag, auth_len, request.object_uuid.is_some());
        let alloc_hint = request.stub_data.len() as u32;
        Self::chunks(&request.stub_data, max_stub)
            .into_iter()
            .map(|(stub_data, flags)| {
                let mut pdu = Pdu::new(
                    call_id,
                    PduBody::Request(RequestPdu {
                        alloc_hint,
                        stub_data,
                        ..request.clone()
                    }),
                );
                pdu.header.packet_flags = flags;
                pdu
            })
            .collect()
    }

    /// Fragment a response
    pub fn fragment_response(
        call_id: u32,
        response: &ResponsePdu,
        max_frag: u16,
        auth_len: usize,
    ) -> Vec<Pdu> {
        let max_stub = Self::max_stub_size(max_frag, auth_len, false);
        let alloc_hint = response.stub_data.len() as u32;
        Self::chunks(&response.stub_data, max_stub)
            .into_iter()
            .map(|(stub_data, flags)| {
                let mut pdu = Pdu::new(
                    call_id,
                    PduBody::Response(ResponsePdu {
                        alloc_hint,
                        stub_data,
                        ..response.clone()
                    }),
                );
                pdu.header.packet_flags = flags;
                pdu
            })
            .collect()
    }
}

/// Reassembles the stub data of one fragmented call.
///
/// Collects fragments from FIRST_FRAG through LAST_FRAG and checks that
/// they all belong to the same call and presentation context.
pub struct FragmentAssembler {
    call_id: u32,
    stub_data: BytesMut,
    context_id: u16,
    opnum: Option<u16>,
    received_first: bool,
    received_last: bool,
    max_size: usize,
}

impl FragmentAssembler {
    /// Largest reassembled stub accepted by default
    pub const DEFAULT_MAX_SIZE: usize = 64 * 1024 * 1024;

    pub fn new(call_id: u32) -> Self {
        Self {
            call_id,
            stub_data: BytesMut::new(),
            context_id: 0,
            opnum: None,
            received_first: false,
            received_last: false,
            max_size: Self::DEFAULT_MAX_SIZE,
        }
    }

    /// Cap the size of the reassembled stub
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn call_id(&self) -> u32 {
        self.call_id
    }

    /// Context ID from the first fragment
    pub fn context_id(&self) -> u16 {
        self.context_id
    }

    /// Operation number (request fragments only)
    pub fn opnum(&self) -> Option<u16> {
        self.opnum
    }

    /// Whether the first fragment has been added
    pub fn is_started(&self) -> bool {
        self.received_first
    }

    pub fn is_complete(&self) -> bool {
        self.received_first && self.received_last
    }

    /// Add a fragment.
    ///
    /// Returns `Ok(Some(stub))` once the last fragment has been added,
    /// `Ok(None)` while more are expected.
    pub fn add_fragment(
        &mut self,
        header: &PduHeader,
        stub: &[u8],
        ctx_id: u16,
        opnum: Option<u16>,
        alloc_hint: u32,
    ) -> Result<Option<Bytes>> {
        if header.call_id != self.call_id {
            return Err(RpcError::CallIdMismatch {
                expected: self.call_id,
                got: header.call_id,
            });
        }
        if self.received_last {
            return Err(RpcError::FragmentAssembly(
                "fragment received after the last fragment".to_string(),
            ));
        }

        if header.packet_flags.is_first_frag() {
            if self.received_first {
                return Err(RpcError::FragmentAssembly(
                    "received duplicate first fragment".to_string(),
                ));
            }
            self.received_first = true;
            self.context_id = ctx_id;
            self.opnum = opnum;
            // alloc_hint is only a hint; never trust it beyond the cap
            self.stub_data
                .reserve((alloc_hint as usize).min(self.max_size).min(1 << 20));
        } else if !self.received_first {
            return Err(RpcError::FragmentOutOfOrder);
        }

        if ctx_id != self.context_id {
            return Err(RpcError::FragmentAssembly(format!(
                "context id changed from {} to {} within a call",
                self.context_id, ctx_id
            )));
        }

        if self.stub_data.len() + stub.len() > self.max_size {
            return Err(RpcError::FragmentAssembly(format!(
                "reassembled stub exceeds {} bytes",
                self.max_size
            )));
        }
        self.stub_data.extend_from_slice(stub);

        if header.packet_flags.is_last_frag() {
            self.received_last = true;
            Ok(Some(self.stub_data.split().freeze()))
        } else {
            Ok(None)
        }
    }

    /// Reset for reuse with a new call
    pub fn reset(&mut self, call_id: u32) {
        self.call_id = call_id;
        self.stub_data.clear();
        self.context_id = 0;
        self.opnum = None;
        self.received_first = false;
        self.received_last = false;
    }
}
