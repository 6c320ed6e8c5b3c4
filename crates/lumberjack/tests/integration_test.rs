// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use lumberjack::{
    Client, ClientConfig, ClientTls, DecodeError, Error, Event, RateLimiter, Server, ServerConfig,
    Version, Versions,
};
use serde_json::json;
use std::sync::Arc;
use tokio_rustls::rustls::{
    self,
    pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName},
    RootCertStore,
};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tokio::{
    net::{TcpListener, TcpStream},
    task::JoinHandle,
    time::{sleep, timeout, Duration, Instant},
};

async fn start_server(config: ServerConfig) -> Server {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind listener");
    Server::with_listener(listener, config).expect("failed to start server")
}

fn send_in_background(
    addr: String,
    config: ClientConfig,
    events: Vec<Event>,
) -> JoinHandle<Result<(usize, u32), Error>> {
    tokio::spawn(async move {
        let mut client = Client::connect(&addr, config).await?;
        let sent = client.send(&events).await?;
        let acked = client.acked();
        client.close().await?;
        Ok((sent, acked))
    })
}

/// Self-signed certificate for `localhost`, as an acceptor and a matching connector.
fn tls_pair() -> (TlsAcceptor, ClientTls) {
    let key_pair = rcgen::KeyPair::generate().expect("failed to generate key");
    let cert = rcgen::CertificateParams::new(vec!["localhost".to_string()])
        .expect("invalid certificate params")
        .self_signed(&key_pair)
        .expect("failed to sign certificate");
    let cert_der: CertificateDer<'static> = cert.der().clone();
    let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));

    let server = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der.clone()], key_der)
        .expect("invalid server certificate");

    let mut roots = RootCertStore::empty();
    roots.add(cert_der).expect("invalid root certificate");
    let client = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    (
        TlsAcceptor::from(Arc::new(server)),
        ClientTls {
            connector: TlsConnector::from(Arc::new(client)),
            server_name: ServerName::try_from("localhost").expect("invalid server name"),
        },
    )
}

fn events(n: usize) -> Vec<Event> {
    (0..n)
        .map(|i| json!({"message": format!("line {i}"), "offset": i}))
        .collect()
}

#[cfg(test)]
#[tokio::test]
async fn compressed_v2_windows_arrive_in_order() {
    let mut server = start_server(ServerConfig::default()).await;
    let sent = events(5);
    let client = send_in_background(
        server.local_addr().to_string(),
        ClientConfig {
            max_window: 2,
            compression_level: 6,
            ..Default::default()
        },
        sent.clone(),
    );

    let mut received = Vec::new();
    let mut sizes = Vec::new();
    while received.len() < sent.len() {
        let batch = timeout(Duration::from_secs(5), server.receive())
            .await
            .expect("timed out waiting for batch")
            .expect("server closed");
        assert_eq!(batch.version(), Version::V2);
        sizes.push(batch.len());
        let (events, ack) = batch.into_parts();
        received.extend(events);
        ack.ack();
    }

    assert_eq!(sizes, vec![2, 2, 1]);
    assert_eq!(received, sent);
    let (count, acked) = client.await.unwrap().expect("send failed");
    assert_eq!(count, 5);
    assert_eq!(acked, 5);
    server.close().await;
}

#[cfg(test)]
#[tokio::test]
async fn v1_events_arrive_as_string_maps() {
    let mut server = start_server(ServerConfig::default()).await;
    let client = send_in_background(
        server.local_addr().to_string(),
        ClientConfig {
            version: Version::V1,
            compression_level: 0,
            ..Default::default()
        },
        vec![json!({"message": "hello", "line": "7"})],
    );

    let batch = server.receive().await.expect("server closed");
    assert_eq!(batch.version(), Version::V1);
    assert_eq!(batch.events(), &[json!({"message": "hello", "line": "7"})]);
    batch.ack();

    assert_eq!(client.await.unwrap().expect("send failed"), (1, 1));
    server.close().await;
}

#[cfg(test)]
#[tokio::test]
async fn keepalives_hold_a_slow_consumer_window_open() {
    let mut server = start_server(ServerConfig {
        keepalive: Duration::from_millis(50),
        ..Default::default()
    })
    .await;
    // The client would give up after 300ms without keepalives
    let client = send_in_background(
        server.local_addr().to_string(),
        ClientConfig {
            timeout: Duration::from_millis(300),
            ..Default::default()
        },
        events(3),
    );

    let batch = server.receive().await.expect("server closed");
    sleep(Duration::from_secs(1)).await;
    batch.ack();

    assert_eq!(client.await.unwrap().expect("send failed"), (3, 3));
    server.close().await;
}

#[cfg(test)]
#[tokio::test]
async fn client_times_out_without_keepalives() {
    let mut server = start_server(ServerConfig {
        keepalive: Duration::ZERO,
        ..Default::default()
    })
    .await;
    let client = send_in_background(
        server.local_addr().to_string(),
        ClientConfig {
            timeout: Duration::from_millis(200),
            ..Default::default()
        },
        events(1),
    );

    let batch = server.receive().await.expect("server closed");
    let err = client.await.unwrap().expect_err("send should time out");
    assert!(err.is_timeout(), "unexpected {err:?}");
    drop(batch);
    server.close().await;
}

#[cfg(test)]
#[tokio::test]
async fn decode_failure_closes_the_session() {
    let decoder = |payload: &[u8]| -> Result<Event, DecodeError> {
        if payload.starts_with(b"{") {
            Ok(serde_json::from_slice(payload)?)
        } else {
            Err(DecodeError("expected an object".to_string()))
        }
    };
    let mut server = start_server(ServerConfig {
        decoder: Arc::new(decoder),
        ..Default::default()
    })
    .await;

    let client = send_in_background(
        server.local_addr().to_string(),
        ClientConfig::default(),
        vec![json!({"ok": true}), json!("not an object")],
    );

    let err = timeout(Duration::from_secs(5), client)
        .await
        .expect("client hung")
        .unwrap()
        .expect_err("send should fail");
    assert!(matches!(err, Error::Io(_)), "unexpected {err:?}");
    assert!(timeout(Duration::from_millis(200), server.receive()).await.is_err());
    server.close().await;
}

#[cfg(test)]
#[tokio::test]
async fn disabled_version_is_rejected() {
    let mut server = start_server(ServerConfig {
        versions: Versions::V2_ONLY,
        ..Default::default()
    })
    .await;
    let client = send_in_background(
        server.local_addr().to_string(),
        ClientConfig {
            version: Version::V1,
            ..Default::default()
        },
        vec![json!({"message": "hello"}); 2],
    );

    let err = client.await.unwrap().expect_err("send should fail");
    assert!(matches!(err, Error::Io(_)), "unexpected {err:?}");
    server.close().await;
}

#[cfg(test)]
#[tokio::test]
async fn concurrent_clients_share_one_channel() {
    let mut server = start_server(ServerConfig {
        channel_capacity: 1,
        ..Default::default()
    })
    .await;
    let addr = server.local_addr().to_string();
    let clients: Vec<_> = (0..4)
        .map(|i| {
            send_in_background(
                addr.clone(),
                ClientConfig::default(),
                vec![json!({"client": i}); 10],
            )
        })
        .collect();

    let mut total = 0;
    while total < 40 {
        let batch = timeout(Duration::from_secs(5), server.receive())
            .await
            .expect("timed out waiting for batch")
            .expect("server closed");
        total += batch.len();
        batch.ack();
    }

    for client in clients {
        assert_eq!(client.await.unwrap().expect("send failed"), (10, 10));
    }
    server.close().await;
}

#[cfg(test)]
#[tokio::test]
async fn rate_limited_consumer_paces_acks() {
    let mut server = start_server(ServerConfig::default()).await;
    let limiter = RateLimiter::new(20);
    let client = send_in_background(
        server.local_addr().to_string(),
        ClientConfig {
            max_window: 10,
            ..Default::default()
        },
        events(40),
    );

    let start = Instant::now();
    let mut received = 0;
    while received < 40 {
        let batch = server.receive().await.expect("server closed");
        limiter.acquire(batch.len() as u64).await;
        received += batch.len();
        batch.ack();
    }

    // 20 burst tokens, then 20 more at 20/s
    assert!(start.elapsed() >= Duration::from_millis(900));
    assert_eq!(client.await.unwrap().expect("send failed"), (40, 40));
    server.close().await;
}

#[cfg(test)]
#[tokio::test]
async fn client_reconnects_after_server_restart() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let mut server = Server::with_listener(listener, ServerConfig::default()).unwrap();

    let mut client = Client::connect(&addr.to_string(), ClientConfig::default())
        .await
        .unwrap();
    let first = tokio::spawn(async move {
        let result = client.send(&events(1)).await;
        (client, result)
    });
    // Never acknowledged: the window must be resent on a new connection
    let unacked = server.receive().await.expect("server closed");
    server.close().await;
    drop(unacked);
    let (client, result) = first.await.unwrap();
    assert!(result.is_err());
    assert_eq!(client.acked(), 0);

    let mut server = Server::listen(addr, ServerConfig::default()).await.unwrap();
    let retry = send_in_background(addr.to_string(), ClientConfig::default(), events(1));
    let batch = server.receive().await.expect("server closed");
    assert_eq!(batch.events(), events(1).as_slice());
    batch.ack();
    assert_eq!(retry.await.unwrap().expect("resend failed"), (1, 1));
    server.close().await;
}

#[cfg(test)]
#[tokio::test]
async fn tls_session_acknowledges_windows() {
    let (acceptor, client_tls) = tls_pair();
    let mut server = start_server(ServerConfig {
        tls: Some(acceptor),
        ..Default::default()
    })
    .await;
    let sent = events(3);
    let client = send_in_background(
        server.local_addr().to_string(),
        ClientConfig {
            max_window: 2,
            tls: Some(client_tls),
            ..Default::default()
        },
        sent.clone(),
    );

    let mut received = Vec::new();
    while received.len() < sent.len() {
        let batch = timeout(Duration::from_secs(5), server.receive())
            .await
            .expect("timed out waiting for batch")
            .expect("server closed");
        received.extend_from_slice(batch.events());
        batch.ack();
    }

    assert_eq!(received, sent);
    assert_eq!(client.await.unwrap().expect("send failed"), (3, 3));
    server.close().await;
}

#[cfg(test)]
#[tokio::test]
async fn plain_client_cannot_talk_to_tls_server() {
    let (acceptor, _) = tls_pair();
    let mut server = start_server(ServerConfig {
        tls: Some(acceptor),
        ..Default::default()
    })
    .await;
    let client = send_in_background(
        server.local_addr().to_string(),
        ClientConfig {
            timeout: Duration::from_secs(2),
            ..Default::default()
        },
        events(1),
    );

    assert!(timeout(Duration::from_secs(5), client)
        .await
        .expect("client hung")
        .unwrap()
        .is_err());
    assert!(timeout(Duration::from_millis(200), server.receive()).await.is_err());
    server.close().await;
}

#[cfg(test)]
#[tokio::test]
async fn close_does_not_wait_on_a_stalled_tls_handshake() {
    let (acceptor, _) = tls_pair();
    let mut server = start_server(ServerConfig {
        tls: Some(acceptor),
        timeout: Duration::ZERO,
        ..Default::default()
    })
    .await;

    // Connects but never starts the handshake
    let _stalled = TcpStream::connect(server.local_addr()).await.unwrap();
    let started = Instant::now();
    while server.active_sessions() == 0 && started.elapsed() < Duration::from_secs(5) {
        sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(server.active_sessions(), 1);

    timeout(Duration::from_secs(2), server.close())
        .await
        .expect("close waited on the handshake");
    assert_eq!(server.active_sessions(), 0);
}
