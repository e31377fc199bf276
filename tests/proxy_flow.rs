//! End-to-end proxy scenarios over loopback TCP.
//!
//! Each test runs the full stack: a simulated client performs the downstream
//! handshake against the relay, the relay resolves and dials a simulated
//! backend speaking the same transport, and assertions cover the
//! authentication piping and the raw relay phase.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use rand_core::OsRng;
use ssh_encoding::Encode;
use ssh_key::{Algorithm, PrivateKey};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};

use sshgate::auth::{
    next_auth_request,
    signature::{sign_request, verify_request},
    AuthRequest, CredentialPolicy, KeyMapPolicy, MappedCredential, PassThroughPolicy,
};
use sshgate::proxy::establish;
use sshgate::transport::handshake::{
    client_handshake, request_auth_service, server_handshake, ServerIdentity,
};
use sshgate::transport::PacketChannel;
use sshgate::wire::{
    packet_type, userauth_banner, userauth_success, PkOk, UserAuthFailure, MSG_EXT_INFO,
    MSG_USERAUTH_FAILURE, MSG_USERAUTH_PK_OK, MSG_USERAUTH_SUCCESS, SERVICE_CONNECTION,
};
use sshgate::{ProxyContext, ProxyServer, ServerError, StaticResolver};

fn fresh_key() -> PrivateKey {
    PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap()
}

fn auth_failure() -> Vec<u8> {
    UserAuthFailure { methods: vec!["publickey".into(), "password".into()], partial: false }.encode()
}

/// Starts the relay with a static route table and the given credential
/// policy. Returns the bound address, the shutdown trigger, and the serve
/// task.
async fn start_proxy(
    routes: HashMap<String, String>,
    destination_port: u16,
    policy: Arc<dyn CredentialPolicy>,
) -> (SocketAddr, watch::Sender<bool>, JoinHandle<Result<(), ServerError>>) {
    let ctx = Arc::new(ProxyContext {
        identity: ServerIdentity::new(vec![fresh_key()]),
        resolver: Arc::new(StaticResolver::new(routes)),
        policy,
        destination_port,
        pinned_backend_key: None,
    });
    let bound = ProxyServer::new(ctx, "127.0.0.1:0").bind().await.unwrap();
    let addr = bound.local_addr().unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let serve = tokio::spawn(bound.serve(shutdown_rx));
    (addr, shutdown_tx, serve)
}

/// Binds a backend listener and hands each accepted, handshaken channel to
/// `behavior`. The accept counter tracks dial attempts.
async fn start_backend<F, Fut>(behavior: F) -> (u16, Arc<AtomicUsize>, JoinHandle<()>)
where
    F: Fn(PacketChannel<TcpStream>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = accepted.clone();
    let identity = ServerIdentity::new(vec![fresh_key()]);
    let task = tokio::spawn(async move {
        let behavior = Arc::new(behavior);
        loop {
            let Ok((stream, _)) = listener.accept().await else { break };
            counter.fetch_add(1, Ordering::SeqCst);
            let identity = identity.clone();
            let behavior = behavior.clone();
            tokio::spawn(async move {
                if let Ok(channel) = server_handshake(stream, &identity).await {
                    behavior(channel).await;
                }
            });
        }
    });
    (port, accepted, task)
}

/// Accepts password auth for the given password, then echoes every relayed
/// packet back.
async fn password_then_echo(mut channel: PacketChannel<TcpStream>, password: &str) {
    let request = next_auth_request(&mut channel).await.unwrap();
    assert_eq!(request.method, "password");
    assert_eq!(request.password_payload().unwrap(), password);
    channel.write_packet(&userauth_success()).await.unwrap();
    while let Ok(packet) = channel.read_packet().await {
        if channel.write_packet(&packet).await.is_err() {
            break;
        }
    }
}

/// Connects to the relay as a downstream client, through the service
/// negotiation.
async fn connect_client(addr: SocketAddr) -> PacketChannel<TcpStream> {
    let stream = TcpStream::connect(addr).await.unwrap();
    let mut channel = client_handshake(stream, None).await.unwrap();
    request_auth_service(&mut channel).await.unwrap();
    channel
}

fn key_blob(key: &PrivateKey) -> Vec<u8> {
    let mut blob = Vec::new();
    key.public_key().key_data().encode(&mut blob).unwrap();
    blob
}

/// Builds the first-phase public-key probe (no signature).
fn pubkey_query(user: &str, key: &PrivateKey) -> AuthRequest {
    let blob = key_blob(key);
    let mut payload = vec![0u8];
    key.algorithm().as_str().encode(&mut payload).unwrap();
    blob.as_slice().encode(&mut payload).unwrap();
    AuthRequest {
        user: user.to_owned(),
        service: SERVICE_CONNECTION.to_owned(),
        method: "publickey".to_owned(),
        payload,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn password_login_reaches_relay_and_round_trips() -> Result<()> {
    let (port, accepted, _backend) =
        start_backend(|channel| password_then_echo(channel, "p")).await;
    let routes = HashMap::from([("alice".to_owned(), "127.0.0.1".to_owned())]);
    let (addr, _shutdown, _serve) = start_proxy(routes, port, Arc::new(PassThroughPolicy)).await;

    let mut client = connect_client(addr).await;
    client
        .write_packet(&AuthRequest::password("alice", "p").encode())
        .await?;
    let reply = client.read_packet().await?;
    assert_eq!(packet_type(&reply)?, MSG_USERAUTH_SUCCESS);

    // Relay phase: packets must cross byte-identical in both directions.
    let payload = vec![94, 0, 0, 0, 1, 0xde, 0xad];
    client.write_packet(&payload).await?;
    assert_eq!(client.read_packet().await?, payload);

    assert_eq!(accepted.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_user_gets_explicit_failure_without_dialing() -> Result<()> {
    let (port, accepted, _backend) =
        start_backend(|channel| password_then_echo(channel, "p")).await;
    let (addr, _shutdown, _serve) = start_proxy(HashMap::new(), port, Arc::new(PassThroughPolicy)).await;

    let mut client = connect_client(addr).await;
    client
        .write_packet(&AuthRequest::password("bob", "p").encode())
        .await?;
    let reply = client.read_packet().await?;
    assert_eq!(packet_type(&reply)?, MSG_USERAUTH_FAILURE);

    // The relay closes after the explicit failure.
    assert!(client.read_packet().await.is_err());
    assert_eq!(accepted.load(Ordering::SeqCst), 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn public_key_query_is_answered_locally() -> Result<()> {
    // The backend sees only the follow-up password request; a relayed query
    // would arrive as method publickey and fail the assertion inside.
    let (port, _accepted, _backend) =
        start_backend(|channel| password_then_echo(channel, "p")).await;
    let routes = HashMap::from([("alice".to_owned(), "127.0.0.1".to_owned())]);
    let (addr, _shutdown, _serve) = start_proxy(routes, port, Arc::new(PassThroughPolicy)).await;

    let key = fresh_key();
    let mut client = connect_client(addr).await;
    client.write_packet(&pubkey_query("alice", &key).encode()).await?;

    let reply = client.read_packet().await?;
    assert_eq!(packet_type(&reply)?, MSG_USERAUTH_PK_OK);
    let pk_ok = PkOk::decode(&reply)?;
    assert_eq!(pk_ok.key_blob, key_blob(&key));

    client
        .write_packet(&AuthRequest::password("alice", "p").encode())
        .await?;
    let reply = client.read_packet().await?;
    assert_eq!(packet_type(&reply)?, MSG_USERAUTH_SUCCESS);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn invalid_signature_is_downgraded_to_none() -> Result<()> {
    // Backend script: a none probe first (the downgraded request), then the
    // client's password retry.
    let (port, _accepted, _backend) = start_backend(|mut channel| async move {
        let first = next_auth_request(&mut channel).await.unwrap();
        assert_eq!(first.method, "none");
        channel.write_packet(&auth_failure()).await.unwrap();
        let second = next_auth_request(&mut channel).await.unwrap();
        assert_eq!(second.method, "password");
        channel.write_packet(&userauth_success()).await.unwrap();
    })
    .await;
    let routes = HashMap::from([("alice".to_owned(), "127.0.0.1".to_owned())]);
    let (addr, _shutdown, _serve) = start_proxy(routes, port, Arc::new(PassThroughPolicy)).await;

    let key = fresh_key();
    let mut client = connect_client(addr).await;
    // Signed for the wrong session identifier: structurally valid, never
    // verifiable downstream.
    let bad = sign_request("alice", &key, &[0u8; 32])?;
    client.write_packet(&bad.encode()).await?;
    let reply = client.read_packet().await?;
    assert_eq!(packet_type(&reply)?, MSG_USERAUTH_FAILURE);

    client
        .write_packet(&AuthRequest::password("alice", "p").encode())
        .await?;
    let reply = client.read_packet().await?;
    assert_eq!(packet_type(&reply)?, MSG_USERAUTH_SUCCESS);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rejected_key_falls_back_to_next_method() -> Result<()> {
    // The client's signature verifies downstream, the pass-through request is
    // forwarded, and the backend turns it down; the client then retries with
    // a password on the same connection.
    let (port, _accepted, _backend) = start_backend(|mut channel| async move {
        let first = next_auth_request(&mut channel).await.unwrap();
        assert_eq!(first.method, "publickey");
        channel.write_packet(&auth_failure()).await.unwrap();
        let second = next_auth_request(&mut channel).await.unwrap();
        assert_eq!(second.method, "password");
        channel.write_packet(&userauth_success()).await.unwrap();
    })
    .await;
    let routes = HashMap::from([("carol".to_owned(), "127.0.0.1".to_owned())]);
    let (addr, _shutdown, _serve) = start_proxy(routes, port, Arc::new(PassThroughPolicy)).await;

    let key = fresh_key();
    let mut client = connect_client(addr).await;
    let signed = sign_request("carol", &key, client.session_id())?;
    client.write_packet(&signed.encode()).await?;
    let reply = client.read_packet().await?;
    assert_eq!(packet_type(&reply)?, MSG_USERAUTH_FAILURE);

    client
        .write_packet(&AuthRequest::password("carol", "p").encode())
        .await?;
    let reply = client.read_packet().await?;
    assert_eq!(packet_type(&reply)?, MSG_USERAUTH_SUCCESS);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_drains_live_relays_without_killing_them() -> Result<()> {
    let (port, _accepted, _backend) =
        start_backend(|channel| password_then_echo(channel, "p")).await;
    let routes = HashMap::from([("alice".to_owned(), "127.0.0.1".to_owned())]);
    let (addr, shutdown, serve) = start_proxy(routes, port, Arc::new(PassThroughPolicy)).await;

    let mut sessions = Vec::new();
    for _ in 0..2 {
        let mut client = connect_client(addr).await;
        client
            .write_packet(&AuthRequest::password("alice", "p").encode())
            .await?;
        let reply = client.read_packet().await?;
        assert_eq!(packet_type(&reply)?, MSG_USERAUTH_SUCCESS);
        sessions.push(client);
    }

    shutdown.send(true).unwrap();
    sleep(Duration::from_millis(100)).await;

    // The listener is closed but live sessions keep relaying.
    assert!(TcpStream::connect(addr).await.is_err());
    assert!(!serve.is_finished());
    for client in &mut sessions {
        client.write_packet(&[94, 42]).await?;
        assert_eq!(client.read_packet().await?, vec![94, 42]);
    }

    // Only once both peers disconnect does the drain complete.
    drop(sessions);
    let result = timeout(Duration::from_secs(5), serve).await??;
    assert!(result.is_ok());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn mapped_key_is_re_signed_for_the_backend() -> Result<()> {
    let client_key = fresh_key();
    let relay_key = fresh_key();
    let relay_blob = key_blob(&relay_key);

    // The backend must see the relay-held key under the mapped username,
    // signed for its own session identifier; the client's signature can
    // never verify there.
    let (port, _accepted, _backend) = start_backend(move |mut channel| {
        let relay_blob = relay_blob.clone();
        async move {
            let request = next_auth_request(&mut channel).await.unwrap();
            assert_eq!(request.method, "publickey");
            assert_eq!(request.user, "svc");
            let payload = request.public_key().unwrap();
            assert_eq!(payload.key_blob, relay_blob);
            assert!(verify_request(channel.session_id(), &request, &payload).unwrap());
            channel.write_packet(&userauth_success()).await.unwrap();
        }
    })
    .await;

    let policy = KeyMapPolicy::new().authorize(
        client_key.public_key().key_data().clone(),
        MappedCredential::PrivateKey {
            username: Some("svc".into()),
            key: Arc::new(relay_key),
        },
    );
    let routes = HashMap::from([("alice".to_owned(), "127.0.0.1".to_owned())]);
    let (addr, _shutdown, _serve) = start_proxy(routes, port, Arc::new(policy)).await;

    let mut client = connect_client(addr).await;
    let signed = sign_request("alice", &client_key, client.session_id())?;
    client.write_packet(&signed.encode()).await?;
    let reply = client.read_packet().await?;
    assert_eq!(packet_type(&reply)?, MSG_USERAUTH_SUCCESS);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn upstream_banner_and_ext_info_are_relayed_verbatim() -> Result<()> {
    let banner = userauth_banner("scheduled maintenance at 22:00 UTC");
    let mut ext_info = vec![MSG_EXT_INFO];
    ext_info.extend_from_slice(&0u32.to_be_bytes());

    let expected_banner = banner.clone();
    let expected_ext_info = ext_info.clone();
    let (port, _accepted, _backend) = start_backend(move |mut channel| {
        let banner = banner.clone();
        let ext_info = ext_info.clone();
        async move {
            let request = next_auth_request(&mut channel).await.unwrap();
            assert_eq!(request.method, "password");
            channel.write_packet(&banner).await.unwrap();
            channel.write_packet(&ext_info).await.unwrap();
            channel.write_packet(&userauth_success()).await.unwrap();
        }
    })
    .await;
    let routes = HashMap::from([("alice".to_owned(), "127.0.0.1".to_owned())]);
    let (addr, _shutdown, _serve) = start_proxy(routes, port, Arc::new(PassThroughPolicy)).await;

    let mut client = connect_client(addr).await;
    client
        .write_packet(&AuthRequest::password("alice", "p").encode())
        .await?;

    // Both interleaved packets arrive downstream byte-identical, before the
    // answer to the request they interrupted.
    assert_eq!(client.read_packet().await?, expected_banner);
    assert_eq!(client.read_packet().await?, expected_ext_info);
    let reply = client.read_packet().await?;
    assert_eq!(packet_type(&reply)?, MSG_USERAUTH_SUCCESS);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn password_change_request_flows_through_untouched() -> Result<()> {
    let (port, _accepted, _backend) = start_backend(|mut channel| async move {
        let request = next_auth_request(&mut channel).await.unwrap();
        assert_eq!(request.method, "password");
        // Change flag still set, followed by the old and new passwords.
        assert_eq!(request.payload.first(), Some(&1));
        channel.write_packet(&userauth_success()).await.unwrap();
    })
    .await;
    let routes = HashMap::from([("alice".to_owned(), "127.0.0.1".to_owned())]);
    let (addr, _shutdown, _serve) = start_proxy(routes, port, Arc::new(PassThroughPolicy)).await;

    let mut payload = vec![1u8];
    "old-password".encode(&mut payload)?;
    "new-password".encode(&mut payload)?;
    let change = AuthRequest {
        user: "alice".to_owned(),
        service: SERVICE_CONNECTION.to_owned(),
        method: "password".to_owned(),
        payload,
    };

    let mut client = connect_client(addr).await;
    client.write_packet(&change.encode()).await?;
    let reply = client.read_packet().await?;
    assert_eq!(packet_type(&reply)?, MSG_USERAUTH_SUCCESS);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn close_tears_down_both_channels() -> Result<()> {
    let (port, _accepted, _backend) =
        start_backend(|channel| password_then_echo(channel, "p")).await;
    let ctx = ProxyContext {
        identity: ServerIdentity::new(vec![fresh_key()]),
        resolver: Arc::new(StaticResolver::new(HashMap::from([(
            "alice".to_owned(),
            "127.0.0.1".to_owned(),
        )]))),
        policy: Arc::new(PassThroughPolicy),
        destination_port: port,
        pinned_backend_key: None,
    };

    let (client_stream, server_stream) = tokio::io::duplex(4096);
    let client_side = tokio::spawn(async move {
        let mut client = client_handshake(client_stream, None).await.unwrap();
        request_auth_service(&mut client).await.unwrap();
        client
            .write_packet(&AuthRequest::password("alice", "p").encode())
            .await
            .unwrap();
        let reply = client.read_packet().await.unwrap();
        assert_eq!(packet_type(&reply).unwrap(), MSG_USERAUTH_SUCCESS);
        client
    });

    let connection = establish(server_stream, &ctx).await?;
    let mut client = client_side.await?;

    // Forced teardown instead of the relay phase: both peers observe the
    // close, the already-shut-down sides tolerated silently.
    connection.close().await;
    assert!(client.read_packet().await.is_err());
    Ok(())
}
