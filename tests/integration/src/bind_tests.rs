//! Bind and Alter Context Tests
//!
//! These tests exercise presentation context negotiation:
//! - Successful bind and negotiated limits
//! - Rejected interfaces and bind_nak
//! - Alter context to a second interface, and back
//! - Closing the association

use bytes::Bytes;
use integration_tests::*;
use msrpc_dcerpc::{
    ClientConfig, ClientState, ProviderReason, RejectReason, RpcClient, RpcClientBuilder,
    RpcError,
};

#[tokio::test]
async fn test_bind_success() {
    init_logging();

    let (stream, peer) = ScriptedPeer::echo(vec![syntax(ECHO_UUID)])
        .max_frag(2048)
        .spawn();
    let client = RpcClientBuilder::from_syntax(syntax(ECHO_UUID))
        .bind_stream(stream)
        .await
        .unwrap();

    assert_eq!(client.state().await, ClientState::Bound);
    let binding = client.binding().await.unwrap();
    assert_eq!(binding.interface, syntax(ECHO_UUID));
    assert_eq!(binding.context_id, 0);
    assert_eq!(binding.max_xmit_frag, 2048);
    assert_eq!(binding.max_recv_frag, 2048);
    assert_eq!(binding.assoc_group_id, 0x0001_2345);
    assert_eq!(peer.log().binds, 1);
}

#[tokio::test]
async fn test_bind_unknown_interface() {
    init_logging();

    let (stream, peer) = ScriptedPeer::echo(vec![syntax(ECHO_UUID)]).spawn();
    let client = RpcClient::new(stream, ClientConfig::default());

    let err = client.bind(syntax(UNKNOWN_UUID)).await.unwrap_err();
    match err {
        RpcError::UnsupportedInterface { interface, reason } => {
            assert_eq!(interface, syntax(UNKNOWN_UUID));
            assert_eq!(reason, ProviderReason::AbstractSyntaxNotSupported);
        }
        other => panic!("expected UnsupportedInterface, got {other:?}"),
    }
    assert_eq!(client.state().await, ClientState::Unbound);
    assert!(matches!(
        client.call_raw(0, Bytes::new()).await,
        Err(RpcError::NotBound)
    ));

    // a second attempt on the same connection may still succeed
    client.bind(syntax(ECHO_UUID)).await.unwrap();
    assert_eq!(client.state().await, ClientState::Bound);
    assert_eq!(peer.log().binds, 2);
}

#[tokio::test]
async fn test_bind_nak() {
    init_logging();

    let (stream, _peer) = ScriptedPeer::echo(vec![syntax(ECHO_UUID)])
        .bind_nak(RejectReason::ProtocolVersionNotSupported)
        .spawn();
    let client = RpcClient::new(stream, ClientConfig::default());

    let err = client.bind(syntax(ECHO_UUID)).await.unwrap_err();
    assert!(matches!(
        err,
        RpcError::BindRejected(RejectReason::ProtocolVersionNotSupported)
    ));
    assert!(!err.is_fatal());
    assert_eq!(client.state().await, ClientState::Unbound);
}

#[tokio::test]
async fn test_alter_context_switches_interface() {
    init_logging();

    let (stream, peer) = ScriptedPeer::echo(vec![syntax(ECHO_UUID), syntax(OTHER_UUID)]).spawn();
    let client = RpcClientBuilder::from_syntax(syntax(ECHO_UUID))
        .bind_stream(stream)
        .await
        .unwrap();

    client.call_raw(0, Bytes::from_static(b"first")).await.unwrap();

    let context_id = client.alter_context(syntax(OTHER_UUID)).await.unwrap();
    assert_eq!(context_id, 1);
    assert_eq!(client.state().await, ClientState::Bound);
    client.call_raw(0, Bytes::from_static(b"second")).await.unwrap();

    // switching back to a negotiated interface needs no round trip
    assert_eq!(client.alter_context(syntax(ECHO_UUID)).await.unwrap(), 0);
    client.call_raw(0, Bytes::from_static(b"third")).await.unwrap();

    let calls = peer.calls();
    assert_eq!(calls.len(), 3);
    assert_eq!(calls[0].interface, Some(syntax(ECHO_UUID)));
    assert_eq!(calls[1].interface, Some(syntax(OTHER_UUID)));
    assert_eq!(calls[1].context_id, 1);
    assert_eq!(calls[2].interface, Some(syntax(ECHO_UUID)));
    assert_eq!(peer.log().alter_contexts, 1);
}

#[tokio::test]
async fn test_rejected_alter_context_keeps_previous_context() {
    init_logging();

    let (stream, peer) = ScriptedPeer::echo(vec![syntax(ECHO_UUID)]).spawn();
    let client = RpcClientBuilder::from_syntax(syntax(ECHO_UUID))
        .bind_stream(stream)
        .await
        .unwrap();

    let err = client.alter_context(syntax(UNKNOWN_UUID)).await.unwrap_err();
    assert!(matches!(err, RpcError::UnsupportedInterface { .. }));
    assert_eq!(client.state().await, ClientState::Bound);
    assert_eq!(client.binding().await.unwrap().interface, syntax(ECHO_UUID));

    let reply = client.call_raw(0, Bytes::from_static(b"still here")).await.unwrap();
    assert_eq!(reply.as_ref(), b"still here");
    assert_eq!(peer.calls()[0].context_id, 0);
}

#[tokio::test]
async fn test_bind_on_bound_client_alters_context() {
    init_logging();

    let (stream, peer) = ScriptedPeer::echo(vec![syntax(ECHO_UUID), syntax(OTHER_UUID)]).spawn();
    let client = RpcClientBuilder::from_syntax(syntax(ECHO_UUID))
        .bind_stream(stream)
        .await
        .unwrap();

    client.bind(syntax(OTHER_UUID)).await.unwrap();
    assert_eq!(client.binding().await.unwrap().interface, syntax(OTHER_UUID));
    assert_eq!(peer.log().binds, 1);
    assert_eq!(peer.log().alter_contexts, 1);
}

#[tokio::test]
async fn test_close_releases_transport() {
    init_logging();

    let (stream, peer) = ScriptedPeer::echo(vec![syntax(ECHO_UUID)]).spawn();
    let client = RpcClientBuilder::from_syntax(syntax(ECHO_UUID))
        .bind_stream(stream)
        .await
        .unwrap();

    client.close().await.unwrap();
    assert_eq!(client.state().await, ClientState::Closed);
    assert!(matches!(
        client.call_raw(0, Bytes::new()).await,
        Err(RpcError::NotBound)
    ));

    // the peer sees a clean end of stream
    let errors = peer.finished().await;
    assert!(errors.is_empty(), "peer errors: {errors:?}");
}
