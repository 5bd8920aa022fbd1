//! Fragmentation Tests - Large PDU Transfer Tests
//!
//! These tests exercise the multi-PDU fragmentation support for large data transfers:
//! - Requests exceeding max_xmit_frag
//! - Responses exceeding max_recv_frag
//! - Bidirectional large transfers
//! - Fragment sizes negotiated down by the peer

use bytes::{BufMut, Bytes, BytesMut};
use integration_tests::*;
use msrpc_dcerpc::{
    ClientConfig, ClientState, FragmentGenerator, RpcClient, RpcClientBuilder, RpcError,
};
use tokio::io::DuplexStream;

/// opnum 0 echoes, opnum 1 returns N pattern bytes (N as u32 LE),
/// opnum 2 returns the checksum of the request
fn frag_peer() -> ScriptedPeer {
    ScriptedPeer::new(vec![syntax(ECHO_UUID)], |call| match call.opnum {
        0 => Reply::Stub(call.stub.clone()),
        1 => {
            let size = u32::from_le_bytes([call.stub[0], call.stub[1], call.stub[2], call.stub[3]]);
            Reply::Stub(pattern(size as usize, 7))
        }
        _ => {
            let mut result = BytesMut::with_capacity(8);
            result.put_u64_le(compute_checksum(&call.stub));
            Reply::Stub(result.freeze())
        }
    })
}

async fn bound(peer: ScriptedPeer) -> (RpcClient<DuplexStream>, PeerHandle) {
    let (stream, handle) = peer.spawn();
    let client = RpcClientBuilder::from_syntax(syntax(ECHO_UUID))
        .bind_stream(stream)
        .await
        .unwrap();
    (client, handle)
}

fn expected_fragments(len: usize, max_frag: u16) -> usize {
    let per_fragment = FragmentGenerator::max_stub_size(max_frag, 0, false);
    len.div_ceil(per_fragment).max(1)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_large_request_fragmentation() {
    init_logging();

    let (client, peer) = bound(frag_peer()).await;
    let payload = pattern(10_000, 1);

    let reply = client.call_raw(2, payload.clone()).await.unwrap();
    assert_eq!(reply.as_ref(), &compute_checksum(&payload).to_le_bytes());

    let calls = peer.calls();
    assert_eq!(calls[0].stub, payload);
    assert_eq!(calls[0].fragments, expected_fragments(10_000, 4280));
    assert_eq!(calls[0].fragments, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_large_response_fragmentation() {
    init_logging();

    let (client, _peer) = bound(frag_peer()).await;

    let reply = client
        .call_raw(1, Bytes::copy_from_slice(&100_000u32.to_le_bytes()))
        .await
        .unwrap();
    assert_eq!(reply.len(), 100_000);
    assert_eq!(reply, pattern(100_000, 7));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_small_fragment_size() {
    init_logging();

    // the peer only accepts the minimum fragment size
    let (client, peer) = bound(frag_peer().max_frag(1432)).await;
    let binding = client.binding().await.unwrap();
    assert_eq!(binding.max_xmit_frag, 1432);
    assert_eq!(binding.max_recv_frag, 1432);

    let payload = pattern(20_000, 3);
    let reply = client.call_raw(0, payload.clone()).await.unwrap();
    assert_eq!(reply, payload);
    assert_eq!(peer.calls()[0].fragments, expected_fragments(20_000, 1432));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_bidirectional_large_transfer() {
    init_logging();

    let (client, peer) = bound(frag_peer().max_frag(2048)).await;

    for size in [0usize, 1, 2024, 2025, 65_536, 250_000] {
        let payload = pattern(size, size as u8);
        let reply = client.call_raw(0, payload.clone()).await.unwrap();
        assert_eq!(reply.len(), size);
        assert_eq!(compute_checksum(&reply), compute_checksum(&payload));
    }

    let fragments: Vec<usize> = peer.calls().iter().map(|call| call.fragments).collect();
    assert_eq!(fragments, vec![1, 1, 1, 2, 33, 124]);
    assert!(peer.errors().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_response_fragment_over_negotiated_size() {
    init_logging();

    // bind_ack promises 1432-byte fragments, responses come in 4280
    let (client, peer) = bound(frag_peer().max_frag(1432).response_frag(4280)).await;
    assert_eq!(client.binding().await.unwrap().max_recv_frag, 1432);

    let err = client
        .call_raw(1, Bytes::copy_from_slice(&3000u32.to_le_bytes()))
        .await
        .unwrap_err();
    assert!(
        matches!(err, RpcError::PduTooLarge { size: 3024, max: 1432 }),
        "{err:?}"
    );
    assert_eq!(client.state().await, ClientState::Closed);

    let errors = peer.finished().await;
    assert!(errors.is_empty(), "peer errors: {errors:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_response_fragment_over_pdu_limit() {
    init_logging();

    // fragments larger than the client will read tear the connection down
    let (stream, _peer) = frag_peer().spawn();
    let config = ClientConfig::default().with_max_pdu_size(1024);
    let client = RpcClient::new(stream, config);
    client.bind(syntax(ECHO_UUID)).await.unwrap();

    let err = client
        .call_raw(1, Bytes::copy_from_slice(&2000u32.to_le_bytes()))
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::PduTooLarge { .. }), "{err:?}");
    assert!(err.is_fatal());
    assert_eq!(client.state().await, ClientState::Closed);
}
