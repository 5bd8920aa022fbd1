//! Connection-oriented DCE RPC (MS-RPCE) client transport
//!
//! This crate carries NDR-encoded stubs (see [`msrpc_ndr`]) to a remote
//! interface as specified in the DCE 1.1 RPC specification and MS-RPCE.
//!
//! # Features
//!
//! - Connection-oriented PDU codec (protocol version 5.0)
//! - Bind and alter context negotiation with the NDR transfer syntax
//! - Request fragmentation and response reassembly
//! - Fault and status translation into [`RpcError::RemoteFault`]
//! - Auth verifier plumbing for a pluggable [`SecurityProvider`]
//! - Async client over any Tokio byte stream (TCP out of the box)
//!
//! # Example
//!
//! ```no_run
//! use msrpc_dcerpc::{RpcClient, SyntaxId, Uuid};
//! use bytes::Bytes;
//!
//! #[tokio::main]
//! async fn main() -> msrpc_dcerpc::Result<()> {
//!     let interface = SyntaxId::new(
//!         Uuid::parse("12345678-1234-1234-1234-123456789012").unwrap(),
//!         1,
//!         0,
//!     );
//!
//!     let client = RpcClient::connect("127.0.0.1:12345".parse().unwrap(), interface).await?;
//!
//!     // operation 1 with an already encoded stub
//!     let reply = client.call_raw(1, Bytes::from_static(&[0, 0, 0, 0])).await?;
//!     println!("{} response bytes", reply.len());
//!
//!     client.close().await
//! }
//! ```
//!
//! Typed calls go through an [`Operation`] implementation generated per
//! remote procedure; see [`RpcClient::call`].

pub mod client;
pub mod config;
pub mod error;
pub mod fault;
pub mod fragmentation;
pub mod operation;
pub mod pdu;
pub mod security;
pub mod transport;

pub use client::{Binding, ClientState, RpcClient, RpcClientBuilder};
pub use config::{ClientConfig, MIN_FRAG_SIZE};
pub use error::{Result, RpcError};
pub use fault::FaultCode;
pub use fragmentation::{FragmentAssembler, FragmentGenerator};
pub use operation::Operation;
pub use pdu::{
    BindAckPdu, BindNakPdu, BindPdu, CharRep, ContextElement, ContextResult, DataRepresentation,
    FaultPdu, FloatRep, IntRep, PacketFlags, PacketType, Pdu, PduBody, PduHeader,
    PresentationResult, ProviderReason, RejectReason, RequestPdu, ResponsePdu, SyntaxId,
    DCE_RPC_VERSION, DCE_RPC_VERSION_MINOR, DEFAULT_MAX_FRAG, NDR_SYNTAX_UUID, NDR_SYNTAX_VERSION,
};
pub use security::{
    auth_alignment, calculate_auth_padding, max_signature_size, AuthLevel, AuthType,
    AuthVerifier, SecurityProvider,
};
pub use transport::{PduTransport, DEFAULT_MAX_PDU_SIZE};

pub use msrpc_ndr::Uuid;
