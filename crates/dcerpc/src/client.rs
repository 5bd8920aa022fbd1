//! DCE RPC client
//!
//! An [`RpcClient`] owns one connection-oriented association. The connection
//! moves through `Unbound -> Bound -> (Calling <-> Bound) -> Closed`; every
//! exchange holds the connection lock from the first request byte to the
//! last response byte, so concurrent callers are serialized and their
//! fragments never interleave.
//!
//! A call whose future is dropped mid-exchange, or which hits its timeout,
//! leaves a half-written request or half-read response on the stream. The
//! connection is closed in that case and later calls fail with
//! [`RpcError::NotBound`].

use crate::config::{ClientConfig, MIN_FRAG_SIZE};
use crate::error::{Result, RpcError};
use crate::fault::FaultCode;
use crate::fragmentation::{FragmentAssembler, FragmentGenerator};
use crate::operation::Operation;
use crate::pdu::{
    BindPdu, ContextResult, DataRepresentation, PacketType, Pdu, PduBody, PduHeader, RequestPdu,
    SyntaxId,
};
use crate::security::{AuthVerifier, SecurityProvider};
use crate::transport::PduTransport;
use bytes::{Bytes, BytesMut};
use msrpc_ndr::{NdrReader, NdrWriter, Uuid};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, trace, warn};

/// Lifecycle of a client connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Connected, no presentation context yet
    Unbound,
    Bound,
    /// An exchange is in flight
    Calling,
    /// Transport released; nothing more can be sent
    Closed,
}

/// The presentation context calls are currently made on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Binding {
    pub interface: SyntaxId,
    pub context_id: u16,
    pub max_xmit_frag: u16,
    pub max_recv_frag: u16,
    pub assoc_group_id: u32,
}

#[derive(Debug, Clone, Copy)]
struct PresentationContext {
    context_id: u16,
    interface: SyntaxId,
}

struct Connection<S> {
    transport: Option<PduTransport<S>>,
    state: ClientState,
    contexts: Vec<PresentationContext>,
    active: Option<usize>,
    next_context_id: u16,
    max_xmit_frag: u16,
    max_recv_frag: u16,
    assoc_group_id: u32,
}

impl<S> Connection<S> {
    fn new(transport: PduTransport<S>, config: &ClientConfig) -> Self {
        Self {
            transport: Some(transport),
            state: ClientState::Unbound,
            contexts: Vec::new(),
            active: None,
            next_context_id: 0,
            max_xmit_frag: config.max_xmit_frag,
            max_recv_frag: config.max_recv_frag,
            assoc_group_id: config.assoc_group_id,
        }
    }

    fn active_context(&self) -> Option<PresentationContext> {
        self.active.and_then(|index| self.contexts.get(index)).copied()
    }

    fn binding(&self) -> Option<Binding> {
        let context = self.active_context()?;
        Some(Binding {
            interface: context.interface,
            context_id: context.context_id,
            max_xmit_frag: self.max_xmit_frag,
            max_recv_frag: self.max_recv_frag,
            assoc_group_id: self.assoc_group_id,
        })
    }

    /// Drop the transport (closing the stream) and forget every context
    fn teardown(&mut self, state: ClientState) {
        self.transport = None;
        self.contexts.clear();
        self.active = None;
        self.state = state;
    }

    fn transport(&mut self) -> Result<&mut PduTransport<S>> {
        self.transport.as_mut().ok_or(RpcError::ConnectionClosed)
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> Connection<S> {
    /// Propose `interface` in a bind (or alter_context) and adopt the result
    async fn negotiate(
        &mut self,
        call_id: u32,
        interface: SyntaxId,
        alter: bool,
        config: &ClientConfig,
    ) -> Result<u16> {
        let context_id = self.next_context_id;
        let mut bind = BindPdu::new(context_id, interface);
        bind.max_xmit_frag = self.max_xmit_frag;
        bind.max_recv_frag = self.max_recv_frag;
        bind.assoc_group_id = self.assoc_group_id;

        let security = if alter {
            None
        } else {
            config.security.as_deref()
        };

        let body = if alter {
            PduBody::AlterContext(bind)
        } else {
            PduBody::Bind(bind)
        };
        let mut pdu = Pdu::new(call_id, body);
        if let Some(provider) = security {
            let token = provider.initial_token().await?;
            pdu = pdu.with_auth(verifier_for(provider, token));
        }

        let transport = self.transport()?;
        transport.write_pdu(&pdu).await?;
        let Pdu {
            header,
            body,
            auth_verifier,
        } = transport.read_pdu().await?;
        if header.call_id != call_id {
            return Err(RpcError::CallIdMismatch {
                expected: call_id,
                got: header.call_id,
            });
        }

        let ack = match body {
            PduBody::BindAck(ack) if !alter => ack,
            PduBody::AlterContextResp(ack) if alter => ack,
            PduBody::BindNak(nak) if !alter => {
                warn!("bind to {} rejected: {}", interface, nak.reason);
                return Err(RpcError::BindRejected(nak.reason));
            }
            PduBody::Fault(fault) => {
                let code = FaultCode(fault.status);
                warn!("context negotiation for {} faulted: {}", interface, code);
                return Err(RpcError::RemoteFault(code));
            }
            other => return Err(RpcError::InvalidMessageType(other.packet_type() as u8)),
        };

        let result = ack.results.first().ok_or_else(|| {
            RpcError::InvalidPdu("acknowledgement carries no presentation results".to_string())
        })?;
        if result.result != ContextResult::Acceptance {
            warn!(
                "presentation context for {} rejected: {:?} ({})",
                interface, result.result, result.reason
            );
            return Err(RpcError::UnsupportedInterface {
                interface,
                reason: result.reason,
            });
        }

        if !alter {
            // our transmit limit is the peer's receive limit and vice versa
            self.max_xmit_frag = self.max_xmit_frag.min(ack.max_recv_frag).max(MIN_FRAG_SIZE);
            self.max_recv_frag = self.max_recv_frag.min(ack.max_xmit_frag).max(MIN_FRAG_SIZE);
            self.assoc_group_id = ack.assoc_group_id;

            if let Some(provider) = security {
                let token = auth_verifier
                    .map(|verifier| verifier.auth_value)
                    .ok_or_else(|| {
                        RpcError::Security("bind_ack carries no auth verifier".to_string())
                    })?;
                if let Some(token) = provider.process_token(token).await? {
                    let auth3 = Pdu::new(call_id, PduBody::Auth3)
                        .with_auth(verifier_for(provider, token));
                    self.transport()?.write_pdu(&auth3).await?;
                }
            }
        }

        self.contexts.push(PresentationContext {
            context_id,
            interface,
        });
        self.active = Some(self.contexts.len() - 1);
        self.next_context_id = context_id.wrapping_add(1);
        Ok(context_id)
    }

    /// Send one request (fragmented as needed) and collect its response
    async fn request(
        &mut self,
        call_id: u32,
        context_id: u16,
        opnum: u16,
        object: Option<Uuid>,
        stub: Bytes,
        config: &ClientConfig,
    ) -> Result<(Bytes, DataRepresentation)> {
        let signer = config
            .security
            .as_deref()
            .filter(|provider| provider.auth_level().requires_signing());
        let auth_len = signer.map_or(0, |provider| provider.signature_size());

        let mut request = RequestPdu::new(context_id, opnum, stub);
        request.object_uuid = object;
        let fragments =
            FragmentGenerator::fragment_request(call_id, &request, self.max_xmit_frag, auth_len);
        debug!(
            "call_id={} opnum={} context_id={}: sending {} stub bytes in {} fragment(s)",
            call_id,
            opnum,
            context_id,
            request.stub_data.len(),
            fragments.len()
        );

        let max_recv_frag = self.max_recv_frag;
        let transport = self.transport()?;
        for fragment in fragments {
            send_fragment(transport, fragment, signer).await?;
        }
        receive_response(transport, call_id, context_id, max_recv_frag, signer).await
    }
}

fn verifier_for(provider: &dyn SecurityProvider, auth_value: Bytes) -> AuthVerifier {
    AuthVerifier::new(
        provider.auth_type(),
        provider.auth_level(),
        provider.auth_context_id(),
        auth_value,
    )
}

async fn send_fragment<S: AsyncWrite + Unpin>(
    transport: &mut PduTransport<S>,
    fragment: Pdu,
    signer: Option<&dyn SecurityProvider>,
) -> Result<()> {
    let Some(provider) = signer else {
        return transport.write_pdu(&fragment).await;
    };

    let signature = Bytes::from(vec![0u8; provider.signature_size()]);
    let fragment = fragment.with_auth(verifier_for(provider, signature));
    let mut frame = BytesMut::from(&fragment.encode()?[..]);
    let header = PduHeader::decode(&frame)?;
    let stub = header
        .stub_range()
        .ok_or_else(|| RpcError::InvalidPdu("request fragment has no stub".to_string()))?;
    provider.protect(&mut frame, stub).await?;
    trace!(
        "sending protected fragment: call_id={} len={}",
        header.call_id,
        frame.len()
    );
    transport.write_frame(&frame).await
}

/// Decode a received fragment, checking and unsealing it first when the
/// association protects every packet
async fn open_fragment(frame: Bytes, verifier: Option<&dyn SecurityProvider>) -> Result<Pdu> {
    let Some(provider) = verifier else {
        return Pdu::decode(frame);
    };

    let header = PduHeader::decode(&frame)?;
    if header.packet_type != PacketType::Response {
        return Pdu::decode(frame);
    }
    if header.auth_length == 0 {
        return Err(RpcError::Security(format!(
            "unprotected response fragment for call {}",
            header.call_id
        )));
    }
    let stub = header
        .stub_range()
        .ok_or_else(|| RpcError::InvalidPdu("response trailer overruns the fragment".into()))?;
    let mut frame = BytesMut::from(&frame[..]);
    provider.verify(&mut frame, stub).await?;
    Pdu::decode(frame.freeze())
}

/// Collect the response to `call_id`. Fragments longer than the negotiated
/// `max_recv_frag` are rejected.
async fn receive_response<S: AsyncRead + Unpin>(
    transport: &mut PduTransport<S>,
    call_id: u32,
    context_id: u16,
    max_recv_frag: u16,
    verifier: Option<&dyn SecurityProvider>,
) -> Result<(Bytes, DataRepresentation)> {
    let mut assembler = FragmentAssembler::new(call_id);
    let mut data_rep = None;

    loop {
        let frame = transport.read_frame().await?;
        if frame.len() > usize::from(max_recv_frag) {
            return Err(RpcError::PduTooLarge {
                size: frame.len(),
                max: usize::from(max_recv_frag),
            });
        }
        let Pdu { header, body, .. } = open_fragment(frame, verifier).await?;
        if header.call_id != call_id {
            return Err(RpcError::CallIdMismatch {
                expected: call_id,
                got: header.call_id,
            });
        }

        match body {
            PduBody::Response(response) => {
                if response.context_id != context_id {
                    return Err(RpcError::InvalidPdu(format!(
                        "response on context {} for a call on context {}",
                        response.context_id, context_id
                    )));
                }
                let rep = *data_rep.get_or_insert(header.data_rep);

                let flags = header.packet_flags;
                if flags.is_first_frag() && flags.is_last_frag() && !assembler.is_started() {
                    trace!(
                        "call_id={}: single-fragment response, {} stub bytes",
                        call_id,
                        response.stub_data.len()
                    );
                    return Ok((response.stub_data, rep));
                }

                if let Some(stub) = assembler.add_fragment(
                    &header,
                    &response.stub_data,
                    response.context_id,
                    None,
                    response.alloc_hint,
                )? {
                    debug!(
                        "call_id={}: reassembled response, {} stub bytes",
                        call_id,
                        stub.len()
                    );
                    return Ok((stub, rep));
                }
            }
            PduBody::Fault(fault) => {
                let code = FaultCode(fault.status);
                warn!("call_id={} failed with fault {}", call_id, code);
                return Err(RpcError::RemoteFault(code));
            }
            PduBody::Shutdown => return Err(RpcError::ConnectionClosed),
            other => return Err(RpcError::InvalidMessageType(other.packet_type() as u8)),
        }
    }
}

async fn with_timeout<T>(
    limit: Option<Duration>,
    exchange: impl Future<Output = Result<T>>,
) -> Result<T> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, exchange)
            .await
            .unwrap_or_else(|_| Err(RpcError::Timeout)),
        None => exchange.await,
    }
}

/// Exclusive use of the connection for one exchange.
///
/// Dropped without [`finish`](Self::finish) means the exchange future was
/// cancelled part way; the connection is closed.
struct Exchange<'a, S> {
    conn: MutexGuard<'a, Connection<S>>,
    armed: bool,
}

impl<'a, S> Exchange<'a, S> {
    fn begin(mut conn: MutexGuard<'a, Connection<S>>) -> Self {
        conn.state = ClientState::Calling;
        Self { conn, armed: true }
    }

    /// Settle the connection state after an exchange: `settled` unless the
    /// error broke the stream, in which case the transport is released and
    /// the state becomes `torn`.
    fn finish<T>(mut self, result: Result<T>, settled: ClientState, torn: ClientState) -> Result<T> {
        self.armed = false;
        match &result {
            Err(err) if err.is_fatal() => {
                warn!("closing connection: {}", err);
                self.conn.teardown(torn);
            }
            _ => self.conn.state = settled,
        }
        result
    }
}

impl<S> Drop for Exchange<'_, S> {
    fn drop(&mut self) {
        if self.armed {
            warn!("exchange abandoned mid-flight, closing connection");
            self.conn.teardown(ClientState::Closed);
        }
    }
}

/// DCE RPC client over one connection
pub struct RpcClient<S = TcpStream> {
    conn: Mutex<Connection<S>>,
    next_call_id: AtomicU32,
    config: ClientConfig,
}

impl RpcClient<TcpStream> {
    /// Connect over TCP and bind `interface` with the default configuration
    pub async fn connect(addr: SocketAddr, interface: SyntaxId) -> Result<Self> {
        RpcClientBuilder::from_syntax(interface).connect(addr).await
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> RpcClient<S> {
    /// Wrap a connected stream. The client starts out unbound.
    pub fn new(stream: S, config: ClientConfig) -> Self {
        let transport = PduTransport::new(stream).with_max_pdu_size(config.max_pdu_size);
        Self {
            conn: Mutex::new(Connection::new(transport, &config)),
            next_call_id: AtomicU32::new(1),
            config,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub async fn state(&self) -> ClientState {
        self.conn.lock().await.state
    }

    pub async fn is_bound(&self) -> bool {
        self.state().await == ClientState::Bound
    }

    /// The presentation context calls currently go to
    pub async fn binding(&self) -> Option<Binding> {
        self.conn.lock().await.binding()
    }

    fn next_call_id(&self) -> u32 {
        loop {
            let id = self.next_call_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    /// Negotiate a presentation context for `interface`.
    ///
    /// On an already bound connection this is an
    /// [`alter_context`](Self::alter_context). A rejected bind leaves the
    /// client unbound; a bind that breaks the stream also releases the
    /// transport.
    pub async fn bind(&self, interface: SyntaxId) -> Result<()> {
        let conn = self.conn.lock().await;
        let (state, connected) = (conn.state, conn.transport.is_some());
        match state {
            ClientState::Unbound if connected => {}
            ClientState::Bound => return self.alter_locked(conn, interface).await.map(|_| ()),
            _ => return Err(RpcError::ConnectionClosed),
        }

        let mut exchange = Exchange::begin(conn);
        let call_id = self.next_call_id();
        debug!("binding to {} (call_id={})", interface, call_id);
        let result = with_timeout(
            self.config.call_timeout,
            exchange
                .conn
                .negotiate(call_id, interface, false, &self.config),
        )
        .await;

        let settled = if result.is_ok() {
            ClientState::Bound
        } else {
            ClientState::Unbound
        };
        let context_id = exchange.finish(result, settled, ClientState::Unbound)?;
        debug!("bound to {} on context {}", interface, context_id);
        Ok(())
    }

    /// Make `interface` the target of subsequent calls.
    ///
    /// An interface negotiated earlier on this association is switched to
    /// without a round trip. Otherwise a new presentation context is
    /// proposed; if the peer rejects it the previous context stays active.
    /// Returns the context id now in use.
    pub async fn alter_context(&self, interface: SyntaxId) -> Result<u16> {
        let conn = self.conn.lock().await;
        self.alter_locked(conn, interface).await
    }

    async fn alter_locked(
        &self,
        mut conn: MutexGuard<'_, Connection<S>>,
        interface: SyntaxId,
    ) -> Result<u16> {
        if conn.state != ClientState::Bound {
            return Err(RpcError::NotBound);
        }
        if let Some(index) = conn.contexts.iter().position(|c| c.interface == interface) {
            conn.active = Some(index);
            let context_id = conn.contexts[index].context_id;
            debug!("switched to {} on context {}", interface, context_id);
            return Ok(context_id);
        }

        let mut exchange = Exchange::begin(conn);
        let call_id = self.next_call_id();
        debug!("altering context to {} (call_id={})", interface, call_id);
        let result = with_timeout(
            self.config.call_timeout,
            exchange
                .conn
                .negotiate(call_id, interface, true, &self.config),
        )
        .await;
        exchange.finish(result, ClientState::Bound, ClientState::Closed)
    }

    /// Invoke `opnum` with an already encoded stub and return the response
    /// stub
    pub async fn call_raw(&self, opnum: u16, stub: Bytes) -> Result<Bytes> {
        self.invoke(opnum, None, stub).await.map(|(stub, _)| stub)
    }

    /// Invoke a typed operation
    pub async fn call<O: Operation>(&self, request: &O::Request) -> Result<O::Response> {
        self.call_typed::<O>(None, request).await
    }

    /// Invoke a typed operation on a specific object
    pub async fn call_object<O: Operation>(
        &self,
        object: Uuid,
        request: &O::Request,
    ) -> Result<O::Response> {
        self.call_typed::<O>(Some(object), request).await
    }

    async fn call_typed<O: Operation>(
        &self,
        object: Option<Uuid>,
        request: &O::Request,
    ) -> Result<O::Response> {
        let mut w = NdrWriter::with_context(self.config.ndr.byte_order(true));
        O::encode_request(request, &mut w)?;
        let stub = w.finish()?;
        trace!("{}: encoded {} request bytes", O::NAME, stub.len());

        let (stub, data_rep) = self.invoke(O::OPNUM, object, stub).await?;

        let mut r = NdrReader::with_context(stub, data_rep.ndr_context(self.config.ndr));
        let response = O::decode_response(&mut r)?;
        match O::status(&response) {
            0 => Ok(response),
            status => {
                let code = FaultCode(status);
                debug!("{} returned status {}", O::NAME, code);
                Err(RpcError::RemoteFault(code))
            }
        }
    }

    async fn invoke(
        &self,
        opnum: u16,
        object: Option<Uuid>,
        stub: Bytes,
    ) -> Result<(Bytes, DataRepresentation)> {
        let conn = self.conn.lock().await;
        if conn.state != ClientState::Bound {
            return Err(RpcError::NotBound);
        }
        let Some(context) = conn.active_context() else {
            return Err(RpcError::NotBound);
        };

        let mut exchange = Exchange::begin(conn);
        let call_id = self.next_call_id();
        let result = with_timeout(
            self.config.call_timeout,
            exchange.conn.request(
                call_id,
                context.context_id,
                opnum,
                object,
                stub,
                &self.config,
            ),
        )
        .await;
        exchange.finish(result, ClientState::Bound, ClientState::Closed)
    }

    /// Release the transport. Later calls fail with [`RpcError::NotBound`].
    pub async fn close(&self) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let transport = conn.transport.take();
        conn.teardown(ClientState::Closed);
        if let Some(mut transport) = transport {
            debug!("closing connection");
            transport.shutdown().await?;
        }
        Ok(())
    }
}

/// Builder for [`RpcClient`]
pub struct RpcClientBuilder {
    interface: SyntaxId,
    config: ClientConfig,
}

impl RpcClientBuilder {
    pub fn new(uuid: Uuid, major: u16, minor: u16) -> Self {
        Self::from_syntax(SyntaxId::new(uuid, major, minor))
    }

    pub fn from_syntax(interface: SyntaxId) -> Self {
        Self {
            interface,
            config: ClientConfig::default(),
        }
    }

    /// Deadline for connecting and for each exchange
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = Some(timeout);
        self.config.call_timeout = Some(timeout);
        self
    }

    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.config.call_timeout = Some(timeout);
        self
    }

    pub fn max_pdu_size(mut self, size: usize) -> Self {
        self.config.max_pdu_size = size;
        self
    }

    pub fn max_frag(mut self, max_xmit_frag: u16, max_recv_frag: u16) -> Self {
        self.config = self.config.with_max_frag(max_xmit_frag, max_recv_frag);
        self
    }

    pub fn security(mut self, provider: Arc<dyn SecurityProvider>) -> Self {
        self.config.security = Some(provider);
        self
    }

    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn interface(&self) -> SyntaxId {
        self.interface
    }

    /// Bind over an already connected stream
    pub async fn bind_stream<S>(self, stream: S) -> Result<RpcClient<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let client = RpcClient::new(stream, self.config);
        client.bind(self.interface).await?;
        Ok(client)
    }

    /// Connect over TCP and bind
    pub async fn connect(self, addr: SocketAddr) -> Result<RpcClient<TcpStream>> {
        let stream = match self.config.connect_timeout {
            Some(limit) => tokio::time::timeout(limit, TcpStream::connect(addr))
                .await
                .map_err(|_| RpcError::Timeout)??,
            None => TcpStream::connect(addr).await?,
        };
        stream.set_nodelay(true)?;
        debug!("connected to {}", addr);
        self.bind_stream(stream).await
    }
}
