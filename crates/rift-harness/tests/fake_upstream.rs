//! Fake upstreams driven directly by the harness clients, no proxy in between.

mod common;

use rift_harness::client::{IntegrationCodecClient, IntegrationTcpClient};
use rift_harness::connection::{Connection, ConnectionState};
use rift_harness::headers::HeaderBlock;
use rift_harness::upstream::FakeUpstream;
use rift_harness::{FailureKind, HarnessError, IpVersion};
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

async fn upstream() -> FakeUpstream {
    rift_harness::logging::init_test_logging();
    FakeUpstream::bind("upstream0", IpVersion::V4).await.unwrap()
}

#[tokio::test]
async fn test_header_only_exchange() {
    let upstream = upstream().await;
    let client = IntegrationCodecClient::connect(upstream.local_addr(), &common::settings())
        .await
        .unwrap();

    let response = client
        .make_header_only_request(
            &HeaderBlock::request("GET", "/test/long/url", "host").with("x-user-id", "123"),
        )
        .await
        .unwrap();
    assert!(matches!(response.status(), Err(HarnessError::Usage(_))));

    let connection = upstream.wait_for_http_connection(WAIT).await.unwrap();
    let request = connection.wait_for_new_stream(WAIT).await.unwrap();
    request.wait_for_end_stream(WAIT).await.unwrap();
    assert_eq!(request.method(), "GET");
    assert_eq!(request.path(), "/test/long/url");
    assert_eq!(request.header_block().get(":authority"), Some("host"));
    assert_eq!(request.headers()["x-user-id"], "123");
    assert_eq!(request.body_length(), 0);

    request
        .encode_headers(&HeaderBlock::response(200), true)
        .unwrap();
    response.wait_for_end_stream(WAIT).await.unwrap();
    assert!(response.complete());
    assert_eq!(response.status().unwrap(), 200);
    assert_eq!(response.body_length(), 0);
}

#[tokio::test]
async fn test_streamed_bodies_and_trailers() {
    let upstream = upstream().await;
    let client = IntegrationCodecClient::connect(upstream.local_addr(), &common::settings())
        .await
        .unwrap();

    let (encoder, response) = client
        .start_request(&HeaderBlock::request("POST", "/upload", "host").with("te", "trailers"))
        .await
        .unwrap();
    client.send_data(&encoder, 100, false).unwrap();

    let connection = upstream.wait_for_http_connection(WAIT).await.unwrap();
    let request = connection.wait_for_new_stream(WAIT).await.unwrap();
    request.wait_for_body(100, WAIT).await.unwrap();
    assert!(!request.complete());

    client.send_data(&encoder, 24, true).unwrap();
    request.wait_for_end_stream(WAIT).await.unwrap();
    assert_eq!(request.body_length(), 124);
    assert!(request.body().iter().all(|b| *b == b'a'));
    assert!(encoder.send_data(1, true).is_err());

    // Trailers are only sent when announced and accepted.
    request
        .encode_headers(&HeaderBlock::response(200).with("trailer", "x-checksum"), false)
        .unwrap();
    request.encode_data(512, false).unwrap();
    response.wait_for_body_data(512, WAIT).await.unwrap();
    assert!(!response.complete());

    request
        .encode_trailers(&HeaderBlock::from([("x-checksum", "abc")]))
        .unwrap();
    response.wait_for_end_stream(WAIT).await.unwrap();
    assert!(response.complete());
    assert_eq!(response.body_length(), 512);
    assert_eq!(response.trailers().unwrap()["x-checksum"], "abc");
}

#[tokio::test]
async fn test_keep_alive_streams_in_arrival_order() {
    let upstream = upstream().await;
    let client = IntegrationCodecClient::connect(upstream.local_addr(), &common::settings())
        .await
        .unwrap();
    let connection = {
        let first = client
            .make_header_only_request(&HeaderBlock::request("GET", "/one", "host"))
            .await
            .unwrap();
        let connection = upstream.wait_for_http_connection(WAIT).await.unwrap();
        let stream = connection.wait_for_new_stream(WAIT).await.unwrap();
        assert_eq!(stream.path(), "/one");
        stream
            .encode_headers(&HeaderBlock::response(204), true)
            .unwrap();
        first.wait_for_end_stream(WAIT).await.unwrap();
        connection
    };

    let second = client
        .make_header_only_request(&HeaderBlock::request("GET", "/two", "host"))
        .await
        .unwrap();
    let stream = connection.wait_for_new_stream(WAIT).await.unwrap();
    assert_eq!(stream.path(), "/two");
    stream
        .encode_headers(&HeaderBlock::response(200), true)
        .unwrap();
    second.wait_for_end_stream(WAIT).await.unwrap();

    assert_eq!(connection.stream_count(), 2);
    assert_eq!(upstream.connection_count(), 1);
}

#[tokio::test]
async fn test_malformed_request_is_protocol_violation() {
    let upstream = upstream().await;
    let client = IntegrationTcpClient::connect(upstream.local_addr(), &common::settings())
        .await
        .unwrap();
    client.write("GET / HTTP/1.1\r\nHost host\r\n\r\n").unwrap();

    let connection = upstream.wait_for_http_connection(WAIT).await.unwrap();
    let err = connection.wait_for_new_stream(WAIT).await.unwrap_err();
    assert_eq!(err.kind(), FailureKind::ProtocolViolation);
    assert!(connection.protocol_error().is_some());
}

#[tokio::test]
async fn test_early_disconnect_is_incomplete_request() {
    let upstream = upstream().await;
    let client = IntegrationTcpClient::connect(upstream.local_addr(), &common::settings())
        .await
        .unwrap();
    client
        .write("POST /upload HTTP/1.1\r\nHost: host\r\nContent-Length: 100\r\n\r\n0123456789")
        .unwrap();

    let connection = upstream.wait_for_http_connection(WAIT).await.unwrap();
    let request = connection.wait_for_new_stream(WAIT).await.unwrap();
    request.wait_for_body(10, WAIT).await.unwrap();
    client.close().await.unwrap();

    let err = request.wait_for_end_stream(WAIT).await.unwrap_err();
    assert!(matches!(err, HarnessError::IncompleteRequest));
    assert!(!request.complete());
    connection.wait_for_disconnect(WAIT).await.unwrap();
    assert_eq!(connection.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_client_close_mid_body_disconnects_upstream() {
    let upstream = upstream().await;
    let client = IntegrationCodecClient::connect(upstream.local_addr(), &common::settings())
        .await
        .unwrap();
    let (encoder, _response) = client
        .start_request(&HeaderBlock::request("POST", "/upload", "host"))
        .await
        .unwrap();
    client.send_data(&encoder, 256, false).unwrap();

    let connection = upstream.wait_for_http_connection(WAIT).await.unwrap();
    let request = connection.wait_for_new_stream(WAIT).await.unwrap();
    request.wait_for_body(256, WAIT).await.unwrap();
    client.close().await.unwrap();

    connection.wait_for_disconnect(WAIT).await.unwrap();
    assert_eq!(connection.state(), ConnectionState::Disconnected);
    request.wait_for_reset(WAIT).await.unwrap();
    assert!(request.reset_reason().is_some());
    assert!(!request.complete());
}

#[tokio::test]
async fn test_raw_connection_accounting() {
    let upstream = upstream().await;
    let client = IntegrationTcpClient::connect(upstream.local_addr(), &common::settings())
        .await
        .unwrap();
    let connection = upstream.wait_for_raw_connection(WAIT).await.unwrap();

    client.write("hel").unwrap();
    client.write("lo").unwrap();
    connection.wait_for_data(5, WAIT).await.unwrap();
    assert_eq!(&connection.data()[..], b"hello");
    assert_eq!(connection.bytes_received(), 5);

    connection.write("world").unwrap();
    connection.close().await.unwrap();
    client.wait_for_disconnect(WAIT).await.unwrap();
    assert_eq!(&client.data()[..], b"world");

    let err = client.wait_for_data(6, WAIT).await.unwrap_err();
    assert!(matches!(err, HarnessError::ConnectionClosedEarly { .. }));
}

#[tokio::test]
async fn test_codec_client_sees_upstream_close() {
    let upstream = upstream().await;
    let client = IntegrationCodecClient::connect(upstream.local_addr(), &common::settings())
        .await
        .unwrap();
    let response = client
        .make_header_only_request(&HeaderBlock::request("GET", "/", "host"))
        .await
        .unwrap();

    let connection = upstream.wait_for_http_connection(WAIT).await.unwrap();
    let request = connection.wait_for_new_stream(WAIT).await.unwrap();
    request
        .encode_headers(&HeaderBlock::response(200), false)
        .unwrap();
    request.encode_data(64, false).unwrap();
    response.wait_for_body_data(64, WAIT).await.unwrap();

    connection.close().await.unwrap();
    response.wait_for_end_stream(WAIT).await.unwrap();
    assert!(!response.complete());
    assert!(response.reset_reason().is_some());
    assert_eq!(response.status().unwrap(), 200);
    client.wait_for_disconnect(WAIT).await.unwrap();

    let err = client
        .make_header_only_request(&HeaderBlock::request("GET", "/", "host"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), FailureKind::Usage);
}

#[tokio::test]
async fn test_upstream_close_releases_connections() {
    let upstream = upstream().await;
    let client = IntegrationTcpClient::connect(upstream.local_addr(), &common::settings())
        .await
        .unwrap();
    let _connection = upstream.wait_for_raw_connection(WAIT).await.unwrap();

    upstream.close().await.unwrap();
    client.wait_for_disconnect(WAIT).await.unwrap();
}
