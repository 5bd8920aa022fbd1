//! Shared harness for the integration tests
//!
//! [`ScriptedPeer`] plays the server side of an association over an
//! in-memory duplex stream: it answers bind and alter_context, reassembles
//! requests, hands each complete call to a handler closure and fragments the
//! reply. Everything it sees is recorded in a [`PeerLog`] for assertions.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use msrpc_dcerpc::{
    AuthLevel, AuthType, AuthVerifier, BindAckPdu, BindNakPdu, BindPdu, DataRepresentation,
    FaultCode, FaultPdu, FragmentAssembler, FragmentGenerator, PacketType, Pdu, PduBody,
    PduHeader, PduTransport, PresentationResult, ProviderReason, RejectReason, ResponsePdu,
    RpcError, SecurityProvider, SyntaxId, Uuid,
};
use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;
use tokio::io::{duplex, DuplexStream};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

pub type Result<T> = msrpc_dcerpc::Result<T>;

pub const ECHO_UUID: &str = "f1a2b3c4-d5e6-7890-abcd-ef1234567890";
pub const OTHER_UUID: &str = "b2222222-2222-2222-2222-222222222222";
pub const UNKNOWN_UUID: &str = "deadbeef-0000-0000-0000-000000000000";

pub const NEGOTIATE_TOKEN: &[u8] = b"NEGOTIATE";
pub const CHALLENGE_TOKEN: &[u8] = b"CHALLENGE";
pub const AUTHENTICATE_TOKEN: &[u8] = b"AUTHENTICATE";

/// Install a test subscriber once; `RUST_LOG` overrides the default level
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

pub fn syntax(uuid: &str) -> SyntaxId {
    SyntaxId::new(Uuid::parse(uuid).unwrap(), 1, 0)
}

/// Simple order-sensitive checksum
pub fn compute_checksum(data: &[u8]) -> u64 {
    data.iter().fold(0xcbf2_9ce4_8422_2325u64, |sum, &b| {
        (sum ^ u64::from(b)).wrapping_mul(0x0100_0000_01b3)
    })
}

/// Deterministic payload of `len` bytes
pub fn pattern(len: usize, seed: u8) -> Bytes {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect::<Vec<u8>>()
        .into()
}

/// A complete request as the peer reassembled it
#[derive(Debug, Clone)]
pub struct ReceivedCall {
    pub call_id: u32,
    pub context_id: u16,
    pub interface: Option<SyntaxId>,
    pub opnum: u16,
    pub object: Option<Uuid>,
    pub stub: Bytes,
    pub fragments: usize,
}

/// What the peer does with a call
#[derive(Debug, Clone)]
pub enum Reply {
    Stub(Bytes),
    Fault(u32),
    /// Swallow the request and never answer
    Silent,
}

#[derive(Debug, Default)]
pub struct PeerLog {
    pub binds: usize,
    pub alter_contexts: usize,
    pub calls: Vec<ReceivedCall>,
    pub auth_tokens: Vec<Bytes>,
    pub errors: Vec<String>,
}

type Handler = Arc<dyn Fn(&ReceivedCall) -> Reply + Send + Sync>;

/// In-process server side of one association
pub struct ScriptedPeer {
    interfaces: Vec<SyntaxId>,
    handler: Handler,
    max_frag: u16,
    response_frag: Option<u16>,
    assoc_group_id: u32,
    big_endian: bool,
    bind_nak: Option<RejectReason>,
    security: Option<Arc<XorSigner>>,
    challenge: Option<Bytes>,
    tamper: bool,
}

struct Pending {
    assembler: FragmentAssembler,
    fragments: usize,
}

impl ScriptedPeer {
    pub fn new(
        interfaces: Vec<SyntaxId>,
        handler: impl Fn(&ReceivedCall) -> Reply + Send + Sync + 'static,
    ) -> Self {
        Self {
            interfaces,
            handler: Arc::new(handler),
            max_frag: 4280,
            response_frag: None,
            assoc_group_id: 0x0001_2345,
            big_endian: false,
            bind_nak: None,
            security: None,
            challenge: None,
            tamper: false,
        }
    }

    /// Answer every call with its own request stub
    pub fn echo(interfaces: Vec<SyntaxId>) -> Self {
        Self::new(interfaces, |call| Reply::Stub(call.stub.clone()))
    }

    /// Fragment size advertised in bind_ack and used for responses
    pub fn max_frag(mut self, max_frag: u16) -> Self {
        self.max_frag = max_frag;
        self
    }

    /// Fragment responses at `size` regardless of what bind_ack advertised
    pub fn response_frag(mut self, size: u16) -> Self {
        self.response_frag = Some(size);
        self
    }

    /// Send responses in big-endian data representation
    pub fn big_endian(mut self) -> Self {
        self.big_endian = true;
        self
    }

    pub fn bind_nak(mut self, reason: RejectReason) -> Self {
        self.bind_nak = Some(reason);
        self
    }

    /// Protect the association with `signer`; `challenge` is returned in the
    /// bind_ack verifier
    pub fn security(mut self, signer: Arc<XorSigner>, challenge: Option<Bytes>) -> Self {
        self.security = Some(signer);
        self.challenge = challenge;
        self
    }

    /// Corrupt the signature of every protected response
    pub fn tamper_responses(mut self) -> Self {
        self.tamper = true;
        self
    }

    /// Start serving; returns the client end of the stream
    pub fn spawn(self) -> (DuplexStream, PeerHandle) {
        let (client, server) = duplex(256 * 1024);
        let log = Arc::new(Mutex::new(PeerLog::default()));
        let task_log = log.clone();
        let task = tokio::spawn(async move {
            if let Err(err) = self.serve(server, &task_log).await {
                warn!("peer stopped: {}", err);
                task_log.lock().errors.push(err.to_string());
            }
        });
        (client, PeerHandle { log, task })
    }

    fn signer(&self) -> Option<&XorSigner> {
        self.security
            .as_deref()
            .filter(|signer| signer.auth_level().requires_signing())
    }

    fn data_rep(&self) -> DataRepresentation {
        if self.big_endian {
            DataRepresentation::big_endian()
        } else {
            DataRepresentation::ndr()
        }
    }

    async fn serve(&self, stream: DuplexStream, log: &Mutex<PeerLog>) -> Result<()> {
        let mut transport = PduTransport::new(stream);
        let mut contexts: HashMap<u16, SyntaxId> = HashMap::new();
        let mut pending: Option<Pending> = None;

        loop {
            let frame = match transport.read_frame().await {
                Ok(frame) => frame,
                Err(RpcError::ConnectionClosed) => return Ok(()),
                Err(err) => return Err(err),
            };
            let Pdu {
                header,
                body,
                auth_verifier,
            } = self.open(frame).await?;
            let call_id = header.call_id;

            match body {
                PduBody::Bind(bind) => {
                    log.lock().binds += 1;
                    if let Some(verifier) = auth_verifier {
                        log.lock().auth_tokens.push(verifier.auth_value);
                    }
                    if let Some(reason) = self.bind_nak {
                        let nak = Pdu::new(call_id, PduBody::BindNak(BindNakPdu::new(reason)));
                        transport.write_pdu(&nak).await?;
                        continue;
                    }
                    let ack = self.acknowledge(&bind, &mut contexts);
                    let mut reply = Pdu::new(call_id, PduBody::BindAck(ack));
                    if let (Some(signer), Some(challenge)) = (&self.security, &self.challenge) {
                        reply = reply.with_auth(AuthVerifier::new(
                            signer.auth_type(),
                            signer.auth_level(),
                            0,
                            challenge.clone(),
                        ));
                    }
                    transport.write_pdu(&reply).await?;
                }
                PduBody::AlterContext(bind) => {
                    log.lock().alter_contexts += 1;
                    let ack = self.acknowledge(&bind, &mut contexts);
                    transport
                        .write_pdu(&Pdu::new(call_id, PduBody::AlterContextResp(ack)))
                        .await?;
                }
                PduBody::Auth3 => {
                    if let Some(verifier) = auth_verifier {
                        log.lock().auth_tokens.push(verifier.auth_value);
                    }
                }
                PduBody::Request(request) => {
                    let state = pending.get_or_insert_with(|| Pending {
                        assembler: FragmentAssembler::new(call_id),
                        fragments: 0,
                    });
                    state.fragments += 1;
                    let complete = state.assembler.add_fragment(
                        &header,
                        &request.stub_data,
                        request.context_id,
                        Some(request.opnum),
                        request.alloc_hint,
                    )?;
                    let Some(stub) = complete else {
                        continue;
                    };
                    let fragments = state.fragments;
                    pending = None;

                    let call = ReceivedCall {
                        call_id,
                        context_id: request.context_id,
                        interface: contexts.get(&request.context_id).copied(),
                        opnum: request.opnum,
                        object: request.object_uuid,
                        stub,
                        fragments,
                    };
                    debug!(
                        "peer: call {} opnum {} ({} bytes in {} fragments)",
                        call.call_id,
                        call.opnum,
                        call.stub.len(),
                        call.fragments
                    );
                    let reply = if call.interface.is_some() {
                        (self.handler)(&call)
                    } else {
                        Reply::Fault(FaultCode::UNKNOWN_INTERFACE.code())
                    };
                    log.lock().calls.push(call);
                    self.respond(&mut transport, call_id, request.context_id, reply)
                        .await?;
                }
                other => return Err(RpcError::InvalidMessageType(other.packet_type() as u8)),
            }
        }
    }

    fn acknowledge(&self, bind: &BindPdu, contexts: &mut HashMap<u16, SyntaxId>) -> BindAckPdu {
        let results = bind
            .context_list
            .iter()
            .map(|element| {
                if self.interfaces.contains(&element.abstract_syntax) {
                    contexts.insert(element.context_id, element.abstract_syntax);
                    PresentationResult::accepted(SyntaxId::ndr())
                } else {
                    PresentationResult::rejected(ProviderReason::AbstractSyntaxNotSupported)
                }
            })
            .collect();
        let mut ack = BindAckPdu::new(self.assoc_group_id, results);
        ack.max_xmit_frag = self.max_frag;
        ack.max_recv_frag = self.max_frag;
        ack
    }

    async fn open(&self, frame: Bytes) -> Result<Pdu> {
        let header = PduHeader::decode(&frame)?;
        match self.signer() {
            Some(signer) if header.packet_type == PacketType::Request => {
                let stub = header
                    .stub_range()
                    .filter(|_| header.auth_length > 0)
                    .ok_or_else(|| RpcError::Security("unprotected request".to_string()))?;
                let mut frame = BytesMut::from(&frame[..]);
                signer.verify(&mut frame, stub).await?;
                Pdu::decode(frame.freeze())
            }
            _ => Pdu::decode(frame),
        }
    }

    async fn respond(
        &self,
        transport: &mut PduTransport<DuplexStream>,
        call_id: u32,
        context_id: u16,
        reply: Reply,
    ) -> Result<()> {
        let stub = match reply {
            Reply::Silent => return Ok(()),
            Reply::Fault(status) => {
                let fault = Pdu::new(call_id, PduBody::Fault(FaultPdu::new(context_id, status)))
                    .with_data_rep(self.data_rep());
                return transport.write_pdu(&fault).await;
            }
            Reply::Stub(stub) => stub,
        };

        let signer = self.signer();
        let auth_len = signer.map_or(0, |signer| signer.signature_size());
        let fragments = FragmentGenerator::fragment_response(
            call_id,
            &ResponsePdu::new(context_id, stub),
            self.response_frag.unwrap_or(self.max_frag),
            auth_len,
        );
        for fragment in fragments {
            let fragment = fragment.with_data_rep(self.data_rep());
            let Some(signer) = signer else {
                transport.write_pdu(&fragment).await?;
                continue;
            };

            let signature = Bytes::from(vec![0u8; signer.signature_size()]);
            let fragment = fragment.with_auth(AuthVerifier::new(
                signer.auth_type(),
                signer.auth_level(),
                0,
                signature,
            ));
            let mut frame = BytesMut::from(&fragment.encode()?[..]);
            let header = PduHeader::decode(&frame)?;
            let stub = header
                .stub_range()
                .ok_or_else(|| RpcError::InvalidPdu("response without stub".to_string()))?;
            signer.protect(&mut frame, stub).await?;
            if self.tamper {
                let last = frame.len() - 1;
                frame[last] ^= 0xff;
            }
            transport.write_frame(&frame).await?;
        }
        Ok(())
    }
}

/// Handle on a running [`ScriptedPeer`]
pub struct PeerHandle {
    log: Arc<Mutex<PeerLog>>,
    task: JoinHandle<()>,
}

impl PeerHandle {
    pub fn log(&self) -> MutexGuard<'_, PeerLog> {
        self.log.lock()
    }

    pub fn calls(&self) -> Vec<ReceivedCall> {
        self.log.lock().calls.clone()
    }

    pub fn errors(&self) -> Vec<String> {
        self.log.lock().errors.clone()
    }

    /// Wait for the peer to see the connection close.
    ///
    /// Panics if the peer task panicked, e.g. on a failed assertion in a
    /// handler.
    pub async fn finished(self) -> Vec<String> {
        let PeerHandle { log, task } = self;
        task.await.expect("peer task panicked");
        let errors = log.lock().errors.clone();
        errors
    }
}

/// Toy security provider: sealing XORs the stub with a key and the
/// signature is a checksum of the (sealed) stub repeated to 16 bytes.
///
/// Both directions use the same transform, so one instance serves the
/// client and another the peer.
pub struct XorSigner {
    level: AuthLevel,
    key: u8,
}

impl XorSigner {
    pub fn new(level: AuthLevel) -> Self {
        Self { level, key: 0x5a }
    }

    fn signature_range(&self, len: usize) -> Result<Range<usize>> {
        let size = self.signature_size();
        len.checked_sub(size)
            .map(|start| start..len)
            .ok_or_else(|| RpcError::Security("fragment shorter than signature".to_string()))
    }

    fn seal(&self, data: &mut [u8]) {
        for byte in data {
            *byte ^= self.key;
        }
    }
}

#[async_trait]
impl SecurityProvider for XorSigner {
    fn auth_type(&self) -> AuthType {
        AuthType::Ntlm
    }

    fn auth_level(&self) -> AuthLevel {
        self.level
    }

    async fn initial_token(&self) -> Result<Bytes> {
        Ok(Bytes::from_static(NEGOTIATE_TOKEN))
    }

    async fn process_token(&self, token: Bytes) -> Result<Option<Bytes>> {
        if token.as_ref() == CHALLENGE_TOKEN {
            Ok(Some(Bytes::from_static(AUTHENTICATE_TOKEN)))
        } else {
            Err(RpcError::Security(format!("unexpected token {:?}", token)))
        }
    }

    async fn protect(&self, fragment: &mut BytesMut, stub: Range<usize>) -> Result<()> {
        if self.level.requires_encryption() {
            self.seal(&mut fragment[stub.clone()]);
        }
        let sum = compute_checksum(&fragment[stub]).to_le_bytes();
        let sig = self.signature_range(fragment.len())?;
        for chunk in fragment[sig].chunks_mut(sum.len()) {
            chunk.copy_from_slice(&sum[..chunk.len()]);
        }
        Ok(())
    }

    async fn verify(&self, fragment: &mut BytesMut, stub: Range<usize>) -> Result<()> {
        let sum = compute_checksum(&fragment[stub.clone()]).to_le_bytes();
        let sig = self.signature_range(fragment.len())?;
        let valid = fragment[sig]
            .chunks(sum.len())
            .all(|chunk| chunk == &sum[..chunk.len()]);
        if !valid {
            return Err(RpcError::Security("signature mismatch".to_string()));
        }
        if self.level.requires_encryption() {
            self.seal(&mut fragment[stub]);
        }
        Ok(())
    }
}
