//! Security Tests - Authenticated Association Tests
//!
//! These tests run the bind-time token exchange and per-packet protection
//! against a toy provider:
//! - Three-leg bind (bind, bind_ack, auth3)
//! - Packet integrity and privacy across fragmented calls
//! - Tampered responses and missing verifiers

use std::sync::Arc;

use bytes::Bytes;
use integration_tests::*;
use msrpc_dcerpc::{AuthLevel, ClientState, RpcClient, RpcClientBuilder, RpcError};
use tokio::io::DuplexStream;

fn secure_peer(level: AuthLevel) -> ScriptedPeer {
    ScriptedPeer::echo(vec![syntax(ECHO_UUID)]).security(
        Arc::new(XorSigner::new(level)),
        Some(Bytes::from_static(CHALLENGE_TOKEN)),
    )
}

async fn secure_client(
    peer: ScriptedPeer,
    level: AuthLevel,
) -> (msrpc_dcerpc::Result<RpcClient<DuplexStream>>, PeerHandle) {
    let (stream, handle) = peer.spawn();
    let client = RpcClientBuilder::from_syntax(syntax(ECHO_UUID))
        .security(Arc::new(XorSigner::new(level)))
        .bind_stream(stream)
        .await;
    (client, handle)
}

#[tokio::test]
async fn test_three_leg_bind() {
    init_logging();

    let (client, peer) =
        secure_client(secure_peer(AuthLevel::Connect), AuthLevel::Connect).await;
    let client = client.unwrap();

    // connect level authenticates the bind only
    let reply = client.call_raw(0, Bytes::from_static(b"plain")).await.unwrap();
    assert_eq!(reply.as_ref(), b"plain");

    let tokens = peer.log().auth_tokens.clone();
    assert_eq!(
        tokens,
        vec![
            Bytes::from_static(NEGOTIATE_TOKEN),
            Bytes::from_static(AUTHENTICATE_TOKEN)
        ]
    );
}

#[tokio::test]
async fn test_packet_integrity() {
    init_logging();

    let (client, peer) = secure_client(
        secure_peer(AuthLevel::PktIntegrity),
        AuthLevel::PktIntegrity,
    )
    .await;
    let client = client.unwrap();

    for size in [0usize, 3, 10_000] {
        let payload = pattern(size, 9);
        let reply = client.call_raw(0, payload.clone()).await.unwrap();
        assert_eq!(reply, payload);
    }

    let calls = peer.calls();
    assert_eq!(calls[2].stub, pattern(10_000, 9));
    assert_eq!(calls[2].fragments, 3);
    assert_eq!(peer.log().auth_tokens.len(), 2);
    assert!(peer.errors().is_empty(), "peer errors: {:?}", peer.errors());
}

#[tokio::test]
async fn test_packet_privacy_with_fragmentation() {
    init_logging();

    let peer = secure_peer(AuthLevel::PktPrivacy).max_frag(1432);
    let (client, peer) = secure_client(peer, AuthLevel::PktPrivacy).await;
    let client = client.unwrap();

    // stub lengths that need trailer padding to the cipher block size
    for size in [1usize, 17, 5000] {
        let payload = pattern(size, 0x33);
        let reply = client.call_raw(0, payload.clone()).await.unwrap();
        assert_eq!(reply, payload);
    }

    // the peer saw the unsealed stub
    let calls = peer.calls();
    assert_eq!(calls[1].stub, pattern(17, 0x33));
    assert!(calls[2].fragments > 1);
    assert!(peer.errors().is_empty(), "peer errors: {:?}", peer.errors());
}

#[tokio::test]
async fn test_tampered_response_closes_connection() {
    init_logging();

    let peer = secure_peer(AuthLevel::PktIntegrity).tamper_responses();
    let (client, _peer) = secure_client(peer, AuthLevel::PktIntegrity).await;
    let client = client.unwrap();

    let err = client
        .call_raw(0, Bytes::from_static(b"payload"))
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Security(_)), "{err:?}");
    assert!(err.is_fatal());
    assert_eq!(client.state().await, ClientState::Closed);
    assert!(matches!(
        client.call_raw(0, Bytes::new()).await,
        Err(RpcError::NotBound)
    ));
}

#[tokio::test]
async fn test_bind_ack_without_verifier() {
    init_logging();

    let peer = ScriptedPeer::echo(vec![syntax(ECHO_UUID)])
        .security(Arc::new(XorSigner::new(AuthLevel::PktIntegrity)), None);
    let (client, _peer) = secure_client(peer, AuthLevel::PktIntegrity).await;

    assert!(matches!(client, Err(RpcError::Security(_))));
}

#[tokio::test]
async fn test_unexpected_challenge_fails_bind() {
    init_logging();

    let (stream, peer) = ScriptedPeer::echo(vec![syntax(ECHO_UUID)])
        .security(
            Arc::new(XorSigner::new(AuthLevel::PktIntegrity)),
            Some(Bytes::from_static(b"BOGUS")),
        )
        .spawn();
    let config = msrpc_dcerpc::ClientConfig::default()
        .with_security(Arc::new(XorSigner::new(AuthLevel::PktIntegrity)));
    let client = RpcClient::new(stream, config);

    let err = client.bind(syntax(ECHO_UUID)).await.unwrap_err();
    assert!(matches!(err, RpcError::Security(_)), "{err:?}");
    assert_eq!(client.state().await, ClientState::Unbound);

    // the security context is gone, so is the transport
    assert!(matches!(
        client.bind(syntax(ECHO_UUID)).await,
        Err(RpcError::ConnectionClosed)
    ));
    assert_eq!(peer.finished().await, Vec::<String>::new());
}
