//! Call Tests - Typed Operations, Faults and Status Mapping
//!
//! These tests drive complete calls through the client:
//! - Typed request/response encoding via `Operation`
//! - Fault PDUs and non-zero operation status
//! - Big-endian responses
//! - Object UUIDs
//! - Timeouts and malformed responses

use std::time::Duration;

use bytes::Bytes;
use integration_tests::*;
use msrpc_dcerpc::{
    ClientConfig, ClientState, FaultCode, Operation, RpcClient, RpcClientBuilder, RpcError, Uuid,
};
use msrpc_ndr::{NdrContext, NdrError, NdrReader, NdrWString, NdrWriter, UniquePtr};
use tokio::io::DuplexStream;

/// `u32 Greet([in, unique, string] wchar_t *name, [in] u32 times,
///            [out, unique, string] wchar_t **greeting)`
struct Greet;

#[derive(Debug)]
struct GreetResponse {
    greeting: UniquePtr<NdrWString>,
    status: u32,
}

impl Operation for Greet {
    const OPNUM: u16 = 1;
    const NAME: &'static str = "Greet";
    type Request = (UniquePtr<NdrWString>, u32);
    type Response = GreetResponse;

    fn encode_request<'a>(
        request: &'a Self::Request,
        w: &mut NdrWriter<'a>,
    ) -> msrpc_ndr::Result<()> {
        w.write_param(&request.0)?;
        w.write_param(&request.1)
    }

    fn decode_response(r: &mut NdrReader) -> msrpc_ndr::Result<GreetResponse> {
        let greeting = r.read_param()?;
        let status = r.read_param()?;
        Ok(GreetResponse { greeting, status })
    }

    fn status(response: &GreetResponse) -> u32 {
        response.status
    }
}

/// Server side of `Greet`, in the byte order the peer answers with
fn serve_greet(stub: &Bytes, ctx: NdrContext) -> Reply {
    let mut r = NdrReader::new(stub.clone());
    let name: UniquePtr<NdrWString> = r.read_param().unwrap();
    let times: u32 = r.read_param().unwrap();

    // ERROR_ACCESS_DENIED with a null greeting when no name is given
    let (greeting, status) = if name.text().is_empty() {
        (UniquePtr::null(), 5u32)
    } else {
        (text(&format!("hello {}", name.text()).repeat(times as usize)), 0)
    };
    let mut w = NdrWriter::with_context(ctx);
    w.write_param(&greeting).unwrap();
    w.write_param(&status).unwrap();
    Reply::Stub(w.finish().unwrap())
}

fn text(s: &str) -> UniquePtr<NdrWString> {
    UniquePtr::<NdrWString>::from_text(s)
}

fn greet_peer(ctx: NdrContext) -> ScriptedPeer {
    ScriptedPeer::new(vec![syntax(ECHO_UUID)], move |call| match call.opnum {
        Greet::OPNUM => serve_greet(&call.stub, ctx),
        _ => Reply::Fault(FaultCode::OP_RANGE_ERROR.code()),
    })
}

async fn bound(peer: ScriptedPeer, config: ClientConfig) -> (RpcClient<DuplexStream>, PeerHandle) {
    let (stream, handle) = peer.spawn();
    let client = RpcClientBuilder::from_syntax(syntax(ECHO_UUID))
        .config(config)
        .bind_stream(stream)
        .await
        .unwrap();
    (client, handle)
}

#[tokio::test]
async fn test_typed_call() {
    init_logging();

    let (client, peer) = bound(greet_peer(NdrContext::new()), ClientConfig::default()).await;

    let request = (text("world"), 2);
    let response = client.call::<Greet>(&request).await.unwrap();
    assert_eq!(response.greeting.text(), "hello worldhello world");
    assert_eq!(response.status, 0);

    let calls = peer.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].opnum, Greet::OPNUM);
    assert_eq!(calls[0].fragments, 1);
    assert!(calls[0].object.is_none());
}

#[tokio::test]
async fn test_status_maps_to_remote_fault() {
    init_logging();

    let (client, _peer) = bound(greet_peer(NdrContext::new()), ClientConfig::default()).await;

    let err = client
        .call::<Greet>(&(UniquePtr::null(), 1))
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::RemoteFault(FaultCode::ACCESS_DENIED)));
    assert!(!err.is_fatal());
    assert_eq!(client.state().await, ClientState::Bound);
}

#[tokio::test]
async fn test_fault_pdu() {
    init_logging();

    let (client, _peer) = bound(greet_peer(NdrContext::new()), ClientConfig::default()).await;

    let err = client.call_raw(42, Bytes::new()).await.unwrap_err();
    match err {
        RpcError::RemoteFault(code) => {
            assert_eq!(code, FaultCode::OP_RANGE_ERROR);
            assert_eq!(code.name(), Some("nca_s_op_rng_error"));
        }
        other => panic!("expected RemoteFault, got {other:?}"),
    }

    // a fault fails the call only
    let response = client
        .call::<Greet>(&(text("again"), 1))
        .await
        .unwrap();
    assert_eq!(response.greeting.text(), "hello again");
}

#[tokio::test]
async fn test_big_endian_response() {
    init_logging();

    let (client, _peer) = bound(
        greet_peer(NdrContext::big_endian()).big_endian(),
        ClientConfig::default(),
    )
    .await;

    let response = client
        .call::<Greet>(&(text("peer"), 1))
        .await
        .unwrap();
    assert_eq!(response.greeting.text(), "hello peer");
}

#[tokio::test]
async fn test_object_uuid_reaches_peer() {
    init_logging();

    let (client, peer) = bound(greet_peer(NdrContext::new()), ClientConfig::default()).await;
    let object = Uuid::parse("0a0b0c0d-1111-2222-3333-444455556666").unwrap();

    client
        .call_object::<Greet>(object, &(text("obj"), 1))
        .await
        .unwrap();
    assert_eq!(peer.calls()[0].object, Some(object));
}

#[tokio::test]
async fn test_malformed_response_fails_call_only() {
    init_logging();

    // three bytes can't hold the referent id of the greeting
    let peer = ScriptedPeer::new(vec![syntax(ECHO_UUID)], |call| match call.opnum {
        Greet::OPNUM => Reply::Stub(Bytes::from_static(&[1, 2, 3])),
        _ => Reply::Stub(call.stub.clone()),
    });
    let (client, _peer) = bound(peer, ClientConfig::default()).await;

    let err = client
        .call::<Greet>(&(text("x"), 1))
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Ndr(NdrError::TruncatedInput { .. })));
    assert_eq!(client.state().await, ClientState::Bound);

    let echoed = client.call_raw(0, Bytes::from_static(b"ok")).await.unwrap();
    assert_eq!(echoed.as_ref(), b"ok");
}

#[tokio::test]
async fn test_timeout_closes_connection() {
    init_logging();

    let peer = ScriptedPeer::new(vec![syntax(ECHO_UUID)], |call| match call.opnum {
        0 => Reply::Silent,
        _ => Reply::Stub(call.stub.clone()),
    });
    let config = ClientConfig::default().with_call_timeout(Duration::from_millis(100));
    let (client, peer) = bound(peer, config).await;

    let err = client.call_raw(0, Bytes::new()).await.unwrap_err();
    assert!(matches!(err, RpcError::Timeout));
    assert_eq!(client.state().await, ClientState::Closed);
    assert!(matches!(
        client.call_raw(1, Bytes::new()).await,
        Err(RpcError::NotBound)
    ));

    let errors = peer.finished().await;
    assert!(errors.is_empty(), "peer errors: {errors:?}");
}

#[tokio::test]
async fn test_dropped_call_closes_connection() {
    init_logging();

    let peer = ScriptedPeer::new(vec![syntax(ECHO_UUID)], |_| Reply::Silent);
    let (client, _peer) = bound(peer, ClientConfig::default()).await;

    let call = client.call_raw(0, Bytes::from_static(b"abandoned"));
    assert!(tokio::time::timeout(Duration::from_millis(50), call)
        .await
        .is_err());

    assert_eq!(client.state().await, ClientState::Closed);
    assert!(matches!(
        client.call::<Greet>(&(text("late"), 1)).await,
        Err(RpcError::NotBound)
    ));
}
