//! End-to-end exercises of the Hub channel over real mutual TLS, using a
//! throwaway CA minted per test.

use node::auth::{client_tls_config, server_tls_config, TlsIdentity};
use node::hub::{ChannelError, CommandHandler, HubChannel, MAX_FRAME_BYTES};
use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair};
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use serde_json::Value;
use shared::models::command::{AckStatus, CommandAck, HeartbeatFrame};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

struct TestPki {
    server: TlsIdentity,
    client: TlsIdentity,
}

fn test_pki() -> TestPki {
    let ca_key = KeyPair::generate().unwrap();
    let mut ca_params = CertificateParams::new(Vec::new()).unwrap();
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    ca_params
        .distinguished_name
        .push(DnType::CommonName, "Test Hub CA");
    let ca_cert = ca_params.self_signed(&ca_key).unwrap();

    let server_key = KeyPair::generate().unwrap();
    let mut server_params = CertificateParams::new(vec!["localhost".to_string()]).unwrap();
    server_params
        .distinguished_name
        .push(DnType::CommonName, "hub");
    let server_cert = server_params.signed_by(&server_key, &ca_cert, &ca_key).unwrap();

    let client_key = KeyPair::generate().unwrap();
    let mut client_params = CertificateParams::new(Vec::new()).unwrap();
    client_params
        .distinguished_name
        .push(DnType::CommonName, "node-1");
    let client_cert = client_params.signed_by(&client_key, &ca_cert, &ca_key).unwrap();

    let server = TlsIdentity {
        certs: vec![server_cert.der().clone()],
        key: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(server_key.serialize_der())),
        ca_certs: vec![ca_cert.der().clone()],
        common_name: "hub".to_string(),
    };
    let client = TlsIdentity {
        certs: vec![client_cert.der().clone()],
        key: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(client_key.serialize_der())),
        ca_certs: vec![ca_cert.der().clone()],
        common_name: "node-1".to_string(),
    };

    TestPki { server, client }
}

fn ok_handler() -> CommandHandler {
    Arc::new(|cmd| Box::pin(async move { CommandAck::ok(cmd.id) }))
}

async fn bind_hub() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

#[tokio::test]
async fn test_command_ack_round_trip_over_mtls() {
    let pki = test_pki();
    let (listener, port) = bind_hub().await;
    let acceptor = TlsAcceptor::from(Arc::new(server_tls_config(&pki.server).unwrap()));

    let server = tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        let mut tls = acceptor.accept(tcp).await.unwrap();

        tls.write_all(br#"{"id":"c1","type":"start_rental","payload":{"session_id":"s1"}}"#)
            .await
            .unwrap();
        tls.flush().await.unwrap();

        let mut buf = vec![0u8; MAX_FRAME_BYTES];
        let n = tls.read(&mut buf).await.unwrap();
        serde_json::from_slice::<CommandAck>(&buf[..n]).unwrap()
    });

    let shutdown = CancellationToken::new();
    let channel = Arc::new(
        HubChannel::new(
            format!("localhost:{port}"),
            Arc::new(client_tls_config(&pki.client).unwrap()),
            ok_handler(),
            shutdown.clone(),
        )
        .unwrap(),
    );

    let reader = channel.connect().await.unwrap();
    let run = tokio::spawn(channel.clone().run(reader));

    let ack = tokio::time::timeout(Duration::from_secs(10), server)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(ack.command_id, "c1");
    assert_eq!(ack.status, AckStatus::Ok);

    channel.close().await;
    let _ = run.await;
}

#[tokio::test]
async fn test_heartbeat_frame_reaches_hub() {
    let pki = test_pki();
    let (listener, port) = bind_hub().await;
    let acceptor = TlsAcceptor::from(Arc::new(server_tls_config(&pki.server).unwrap()));

    let server = tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        let mut tls = acceptor.accept(tcp).await.unwrap();

        let mut buf = vec![0u8; MAX_FRAME_BYTES];
        let n = tls.read(&mut buf).await.unwrap();
        serde_json::from_slice::<Value>(&buf[..n]).unwrap()
    });

    let shutdown = CancellationToken::new();
    let channel = HubChannel::new(
        format!("localhost:{port}"),
        Arc::new(client_tls_config(&pki.client).unwrap()),
        ok_handler(),
        shutdown,
    )
    .unwrap();

    let _reader = channel.connect().await.unwrap();
    channel
        .send(&HeartbeatFrame::new("master", Vec::new()))
        .await
        .unwrap();

    let frame = tokio::time::timeout(Duration::from_secs(10), server)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(frame["type"], "heartbeat");
    assert_eq!(frame["payload"]["mode"], "master");
    assert!(frame["payload"]["gpu_metrics"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_send_without_connection_fails() {
    let pki = test_pki();

    let channel = HubChannel::new(
        "localhost:1",
        Arc::new(client_tls_config(&pki.client).unwrap()),
        ok_handler(),
        CancellationToken::new(),
    )
    .unwrap();

    let err = channel
        .send(&HeartbeatFrame::new("master", Vec::new()))
        .await
        .unwrap_err();
    assert!(matches!(err, ChannelError::NotConnected));
}

#[tokio::test]
async fn test_tls12_only_hub_is_refused() {
    let pki = test_pki();
    let (listener, port) = bind_hub().await;

    // A Hub stuck on TLS 1.2: the handshake must fail before any
    // application data is exchanged
    let server_config = rustls::ServerConfig::builder_with_protocol_versions(&[
        &rustls::version::TLS12,
    ])
    .with_no_client_auth()
    .with_single_cert(pki.server.certs.clone(), pki.server.key.clone_key())
    .unwrap();
    let acceptor = TlsAcceptor::from(Arc::new(server_config));

    let server = tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        acceptor.accept(tcp).await.is_err()
    });

    let channel = HubChannel::new(
        format!("localhost:{port}"),
        Arc::new(client_tls_config(&pki.client).unwrap()),
        ok_handler(),
        CancellationToken::new(),
    )
    .unwrap();

    let err = channel.connect().await.unwrap_err();
    assert!(matches!(err, ChannelError::Network(_)));

    let server_saw_failure = tokio::time::timeout(Duration::from_secs(10), server)
        .await
        .unwrap()
        .unwrap();
    assert!(server_saw_failure);
}

#[tokio::test]
async fn test_oversized_frame_closes_connection() {
    let pki = test_pki();
    let (listener, port) = bind_hub().await;
    let acceptor = TlsAcceptor::from(Arc::new(server_tls_config(&pki.server).unwrap()));

    let server = tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        let mut tls = acceptor.accept(tcp).await.unwrap();

        // Well past the frame limit, so client reads fill the whole buffer
        let filler = "a".repeat(16 * MAX_FRAME_BYTES);
        let frame = format!(r#"{{"id":"big","type":"noop","payload":{{"data":"{filler}"}}}}"#);
        tls.write_all(frame.as_bytes()).await.unwrap();
        tls.flush().await.unwrap();

        // The client must drop the connection without replying
        let mut buf = vec![0u8; MAX_FRAME_BYTES];
        matches!(tls.read(&mut buf).await, Ok(0) | Err(_))
    });

    let handled = Arc::new(AtomicBool::new(false));
    let handled_clone = handled.clone();
    let handler: CommandHandler = Arc::new(move |cmd| {
        handled_clone.store(true, Ordering::SeqCst);
        Box::pin(async move { CommandAck::ok(cmd.id) })
    });

    let shutdown = CancellationToken::new();
    let channel = Arc::new(
        HubChannel::new(
            format!("localhost:{port}"),
            Arc::new(client_tls_config(&pki.client).unwrap()),
            handler,
            shutdown.clone(),
        )
        .unwrap(),
    );

    let reader = channel.connect().await.unwrap();
    let run = tokio::spawn(channel.clone().run(reader));

    let connection_dropped = tokio::time::timeout(Duration::from_secs(10), server)
        .await
        .unwrap()
        .unwrap();
    assert!(connection_dropped);
    assert!(!handled.load(Ordering::SeqCst));

    channel.close().await;
    let _ = run.await;
}

#[tokio::test]
async fn test_reconnect_then_heartbeat_on_new_connection() {
    let pki = test_pki();
    let (listener, port) = bind_hub().await;
    let acceptor = TlsAcceptor::from(Arc::new(server_tls_config(&pki.server).unwrap()));

    let server = tokio::spawn(async move {
        // First connection is dropped straight away
        let (tcp, _) = listener.accept().await.unwrap();
        let tls = acceptor.accept(tcp).await.unwrap();
        drop(tls);

        // The channel comes back on its own; a heartbeat must appear on the
        // new connection
        let (tcp, _) = listener.accept().await.unwrap();
        let mut tls = acceptor.accept(tcp).await.unwrap();
        let mut buf = vec![0u8; MAX_FRAME_BYTES];
        let n = tls.read(&mut buf).await.unwrap();
        serde_json::from_slice::<Value>(&buf[..n]).unwrap()
    });

    let (reconnected_tx, mut reconnected_rx) = tokio::sync::mpsc::unbounded_channel();
    let shutdown = CancellationToken::new();
    let channel = Arc::new(
        HubChannel::new(
            format!("localhost:{port}"),
            Arc::new(client_tls_config(&pki.client).unwrap()),
            ok_handler(),
            shutdown.clone(),
        )
        .unwrap()
        .with_on_reconnected(move || {
            let _ = reconnected_tx.send(());
        }),
    );

    let reader = channel.connect().await.unwrap();
    let run = tokio::spawn(channel.clone().run(reader));

    // Backoff starts at 5s, so allow a generous window
    tokio::time::timeout(Duration::from_secs(20), reconnected_rx.recv())
        .await
        .expect("channel did not reconnect in time")
        .unwrap();

    channel
        .send(&HeartbeatFrame::new("master", Vec::new()))
        .await
        .unwrap();

    let frame = tokio::time::timeout(Duration::from_secs(10), server)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(frame["type"], "heartbeat");

    channel.close().await;
    let _ = run.await;
}
