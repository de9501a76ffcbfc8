//! End-to-end scenarios: session engines wired back-to-back over
//! in-process transports, the full TLS stack over real sockets, and
//! the ingress adapters in front of a live session.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::time::timeout;

use mailtun::config::{Config, ForwardEntry, SocksEntry};
use mailtun::error::Error;
use mailtun::supervisor::Supervisor;
use mailtun::tunnel::server::serve_session;
use mailtun::tunnel::Tunnel;

const WAIT: Duration = Duration::from_secs(10);

/// A client/server engine pair joined by an in-process duplex
/// transport, standing in for the post-TLS byte stream.
async fn session_pair() -> Arc<Tunnel> {
    let (client_io, server_io) = tokio::io::duplex(256 * 1024);

    tokio::spawn(serve_session(server_io, "alice", false));

    let (tunnel, reader) = Tunnel::new(client_io);
    tokio::spawn(Arc::clone(&tunnel).run_receiver(reader));
    tunnel
}

/// TCP echo server on an ephemeral loopback port.
async fn start_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            if socket.write_all(&buf[..n]).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

/// Reserve an ephemeral port by binding and immediately releasing it.
async fn free_tcp_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

#[tokio::test]
async fn round_trip_small_payload() {
    let echo = start_echo_server().await;
    let tunnel = session_pair().await;

    let channel_id = timeout(WAIT, tunnel.open("127.0.0.1", echo.port()))
        .await
        .unwrap()
        .unwrap();
    let mut rx = tunnel.register(channel_id);

    tunnel.send_data(channel_id, b"hello").await.unwrap();

    let mut echoed = Vec::new();
    while echoed.len() < 5 {
        let chunk = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        echoed.extend_from_slice(&chunk);
    }
    assert_eq!(echoed, b"hello");

    tunnel.close_remote(channel_id).await;
    tunnel.close_local(channel_id);
}

#[tokio::test]
async fn connect_to_closed_port_fails_with_reason() {
    let dead = free_tcp_port().await;
    let tunnel = session_pair().await;

    let err = timeout(Duration::from_secs(30), tunnel.open("127.0.0.1", dead.port()))
        .await
        .expect("answer must arrive within the open deadline")
        .unwrap_err();

    match err {
        Error::ChannelOpen(reason) => assert!(!reason.is_empty()),
        other => panic!("expected ChannelOpen, got: {other}"),
    }
}

#[tokio::test]
async fn ping_round_trip_is_fast() {
    let tunnel = session_pair().await;

    let rtt = timeout(WAIT, tunnel.ping()).await.unwrap().unwrap();
    assert!(rtt < Duration::from_secs(1), "loopback rtt was {rtt:?}");
}

#[tokio::test]
async fn destination_close_propagates() {
    // A destination that answers once and hangs up.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 64];
        let n = socket.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"request");
        socket.write_all(b"bye").await.unwrap();
    });

    let tunnel = session_pair().await;
    let channel_id = timeout(WAIT, tunnel.open("127.0.0.1", addr.port()))
        .await
        .unwrap()
        .unwrap();
    let mut rx = tunnel.register(channel_id);

    tunnel.send_data(channel_id, b"request").await.unwrap();
    assert_eq!(timeout(WAIT, rx.recv()).await.unwrap().unwrap(), b"bye");

    // The destination closing makes the responder send CLOSE, which
    // ends this channel's queue.
    assert!(timeout(WAIT, rx.recv()).await.unwrap().is_none());
}

#[tokio::test]
async fn concurrent_channels_are_independent() {
    let echo = start_echo_server().await;
    let tunnel = session_pair().await;

    let mut tasks = Vec::new();
    for i in 0u8..8 {
        let tunnel = Arc::clone(&tunnel);
        let port = echo.port();
        tasks.push(tokio::spawn(async move {
            let id = tunnel.open("127.0.0.1", port).await.unwrap();
            let mut rx = tunnel.register(id);

            let message = vec![i; 2048];
            tunnel.send_data(id, &message).await.unwrap();

            let mut echoed = Vec::new();
            while echoed.len() < message.len() {
                echoed.extend_from_slice(&rx.recv().await.unwrap());
            }
            assert_eq!(echoed, message);

            tunnel.close_remote(id).await;
            tunnel.close_local(id);
            id
        }));
    }

    let mut ids = std::collections::HashSet::new();
    for task in tasks {
        let id = timeout(WAIT, task).await.unwrap().unwrap();
        assert!(ids.insert(id), "channel ids must be distinct");
    }
}

#[tokio::test]
async fn socks5_connect_through_session() {
    let echo = start_echo_server().await;
    let tunnel = session_pair().await;

    let socks_addr = free_tcp_port().await;
    let entry = SocksEntry {
        listen: socks_addr.to_string(),
        username: String::new(),
        password: String::new(),
    };
    tokio::spawn(mailtun::ingress::Socks5Server::new(&entry, Arc::clone(&tunnel)).run());
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut client = TcpStream::connect(socks_addr).await.unwrap();

    // Greeting: no-auth.
    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut resp = [0u8; 2];
    client.read_exact(&mut resp).await.unwrap();
    assert_eq!(resp, [0x05, 0x00]);

    // CONNECT 127.0.0.1:<echo> via IPv4 address form.
    let mut request = vec![0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1];
    request.extend_from_slice(&echo.port().to_be_bytes());
    client.write_all(&request).await.unwrap();

    let mut reply = [0u8; 10];
    timeout(WAIT, client.read_exact(&mut reply)).await.unwrap().unwrap();
    assert_eq!(reply[1], 0x00, "expected success reply");

    client.write_all(b"proxied payload").await.unwrap();
    let mut echoed = vec![0u8; b"proxied payload".len()];
    timeout(WAIT, client.read_exact(&mut echoed)).await.unwrap().unwrap();
    assert_eq!(echoed, b"proxied payload");
}

#[tokio::test]
async fn socks5_unreachable_destination_reply() {
    let dead = free_tcp_port().await;
    let tunnel = session_pair().await;

    let socks_addr = free_tcp_port().await;
    let entry = SocksEntry {
        listen: socks_addr.to_string(),
        username: String::new(),
        password: String::new(),
    };
    tokio::spawn(mailtun::ingress::Socks5Server::new(&entry, Arc::clone(&tunnel)).run());
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut client = TcpStream::connect(socks_addr).await.unwrap();
    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut resp = [0u8; 2];
    client.read_exact(&mut resp).await.unwrap();

    let mut request = vec![0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1];
    request.extend_from_slice(&dead.port().to_be_bytes());
    client.write_all(&request).await.unwrap();

    let mut reply = [0u8; 10];
    timeout(WAIT, client.read_exact(&mut reply)).await.unwrap().unwrap();
    assert_eq!(reply[1], 0x04, "expected host-unreachable reply");
}

#[tokio::test]
async fn tcp_forward_through_session() {
    let echo = start_echo_server().await;
    let tunnel = session_pair().await;

    let forward_addr = free_tcp_port().await;
    let entry = ForwardEntry {
        listen: forward_addr.to_string(),
        to: format!("127.0.0.1:{}", echo.port()),
        protocol: "tcp".to_string(),
    };
    let forwarder = mailtun::ingress::Forwarder::from_entry(&entry, Arc::clone(&tunnel)).unwrap();
    tokio::spawn(forwarder.run());
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut client = TcpStream::connect(forward_addr).await.unwrap();
    client.write_all(b"forwarded").await.unwrap();

    let mut echoed = vec![0u8; b"forwarded".len()];
    timeout(WAIT, client.read_exact(&mut echoed)).await.unwrap().unwrap();
    assert_eq!(echoed, b"forwarded");
}

#[tokio::test]
async fn udp_forward_single_shot() {
    // The destination is a TCP sink that records what it receives.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dest_addr = listener.local_addr().unwrap();
    let (sink_tx, mut sink_rx) = tokio::sync::mpsc::channel::<Vec<u8>>(4);
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let sink_tx = sink_tx.clone();
            tokio::spawn(async move {
                let mut received = Vec::new();
                let mut buf = [0u8; 4096];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => received.extend_from_slice(&buf[..n]),
                    }
                }
                let _ = sink_tx.send(received).await;
            });
        }
    });

    let tunnel = session_pair().await;

    let udp_listen = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let udp_addr = udp_listen.local_addr().unwrap();
    drop(udp_listen);

    let entry = ForwardEntry {
        listen: udp_addr.to_string(),
        to: format!("127.0.0.1:{}", dest_addr.port()),
        protocol: "udp".to_string(),
    };
    let forwarder = mailtun::ingress::Forwarder::from_entry(&entry, Arc::clone(&tunnel)).unwrap();
    tokio::spawn(forwarder.run());
    tokio::time::sleep(Duration::from_millis(100)).await;

    let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    sender.send_to(b"one datagram", udp_addr).await.unwrap();

    // The datagram arrives at the destination and the channel closes,
    // which ends the sink's TCP connection.
    let received = timeout(WAIT, sink_rx.recv()).await.unwrap().unwrap();
    assert_eq!(received, b"one datagram");
}

mod tls_stack {
    use super::*;
    use mailtun::handshake::{client_handshake, server_handshake};
    use mailtun::tls;
    use std::path::PathBuf;

    const COVER_HOST: &str = "mail.test.local";

    /// Write a self-signed cert (valid for the cover host and
    /// 127.0.0.1) plus its key, returning (cert_path, key_path).
    fn write_pems(tag: &str) -> (PathBuf, PathBuf) {
        let signed = rcgen::generate_simple_self_signed(vec![
            COVER_HOST.to_string(),
            "127.0.0.1".to_string(),
        ])
        .unwrap();
        let dir = std::env::temp_dir().join(format!("mailtun-e2e-{}-{tag}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let cert_path = dir.join("server.crt");
        let key_path = dir.join("server.key");
        std::fs::write(&cert_path, signed.cert.pem()).unwrap();
        std::fs::write(&key_path, signed.key_pair.serialize_pem()).unwrap();
        (cert_path, key_path)
    }

    fn principals() -> std::collections::HashMap<String, String> {
        let mut map = std::collections::HashMap::new();
        map.insert("alice".to_string(), "alice-secret".to_string());
        map
    }

    #[tokio::test]
    async fn full_stack_over_tls() {
        let (cert_path, key_path) = write_pems("full");
        let acceptor = tls::acceptor_from_pem(&cert_path, &key_path, "1.2").unwrap();
        let connector = tls::connector(Some(&cert_path), false).unwrap();

        let echo = start_echo_server().await;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server_addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let users = principals();
            let (username, tls_stream) =
                server_handshake(stream, COVER_HOST, &acceptor, &users).await.unwrap();
            assert_eq!(username, "alice");
            serve_session(tls_stream, &username, true).await;
        });

        let stream = TcpStream::connect(server_addr).await.unwrap();
        let tls_stream =
            client_handshake(stream, COVER_HOST, "alice", "alice-secret", &connector)
                .await
                .unwrap();

        let (tunnel, reader) = Tunnel::new(tls_stream);
        tokio::spawn(Arc::clone(&tunnel).run_receiver(reader));

        let channel_id = timeout(WAIT, tunnel.open("127.0.0.1", echo.port()))
            .await
            .unwrap()
            .unwrap();
        let mut rx = tunnel.register(channel_id);

        tunnel.send_data(channel_id, b"over tls").await.unwrap();
        let mut echoed = Vec::new();
        while echoed.len() < b"over tls".len() {
            echoed.extend_from_slice(&timeout(WAIT, rx.recv()).await.unwrap().unwrap());
        }
        assert_eq!(echoed, b"over tls");

        let rtt = timeout(WAIT, tunnel.ping()).await.unwrap().unwrap();
        assert!(rtt < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn supervisor_reconnects_when_server_appears() {
        let (cert_path, key_path) = write_pems("reconnect");
        let acceptor = tls::acceptor_from_pem(&cert_path, &key_path, "1.2").unwrap();

        // Reserve the server's port but leave it closed for now.
        let server_addr = free_tcp_port().await;
        let socks_addr = free_tcp_port().await;

        let mut config = Config::default();
        config.client.server = server_addr.to_string();
        config.client.username = "alice".to_string();
        config.client.secret = "alice-secret".to_string();
        config.client.ca_cert = Some(cert_path);
        config.client.reconnect_delay_secs = 1;
        config.client.max_reconnect_delay_secs = 2;
        config.client.socks.push(SocksEntry {
            listen: socks_addr.to_string(),
            username: String::new(),
            password: String::new(),
        });

        let supervisor = Supervisor::new(Arc::new(config)).unwrap();
        tokio::spawn(async move { supervisor.run().await });

        // Let at least one connect attempt fail before the server
        // comes online.
        tokio::time::sleep(Duration::from_millis(300)).await;

        let listener = TcpListener::bind(server_addr).await.unwrap();
        let handshake_done = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let users = principals();
            let (username, tls_stream) =
                server_handshake(stream, COVER_HOST, &acceptor, &users).await?;
            let session_user = username.clone();
            tokio::spawn(async move { serve_session(tls_stream, &session_user, false).await });
            Ok::<_, mailtun::Error>(username)
        });

        let username = timeout(Duration::from_secs(15), handshake_done)
            .await
            .expect("supervisor should reconnect once the server is up")
            .unwrap()
            .unwrap();
        assert_eq!(username, "alice");
    }
}
