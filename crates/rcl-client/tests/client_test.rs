//! Integration test: rcl-client against a scripted server
//!
//! A minimal in-test server speaks the handshake over RclConnection and
//! answers commands from a fixed table, so the client's authentication,
//! error mapping and release-on-drop behavior can be observed directly.
//!
//! Run with: cargo test -p rcl-client --test client_test -- --nocapture

use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::mpsc;

use rcl_client::{Client, ClientError};
use rcl_core::config::ServerEndpoint;
use rcl_protocol::cl_commands::{ClCommand, ClResponse, MemFlags};
use rcl_protocol::messages::{Message, PROTOCOL_VERSION};
use rcl_protocol::{ErrorKind, NetworkHandle, ResourceType};
use rcl_transport::{auth, ConnectionRole, RclConnection};

const SERVER_ID: u16 = 4;
const SESSION_ID: u32 = 7;
const TOKEN: &str = "test-token";

fn make_handle(resource_type: ResourceType, resource_id: u64) -> NetworkHandle {
    NetworkHandle {
        server_id: SERVER_ID,
        session_id: SESSION_ID,
        resource_id,
        resource_type,
    }
}

/// Answers every command the way the tests below expect.
fn respond(command: &ClCommand) -> ClResponse {
    match command {
        ClCommand::OpenDevice { index: 0 } => ClResponse::Device(make_handle(ResourceType::Device, 1)),
        ClCommand::OpenDevice { .. } => ClResponse::Success,
        ClCommand::CreateBuffer { size: 0, .. } => ClResponse::Error {
            kind: ErrorKind::InvalidArgument,
            code: 0,
            message: "buffer size must be non-zero".to_string(),
        },
        ClCommand::CreateBuffer { .. } => ClResponse::Buffer(make_handle(ResourceType::Buffer, 2)),
        _ => ClResponse::Success,
    }
}

/// Start a one-connection server; every command it receives is forwarded to
/// the returned channel.
async fn start_fake_server() -> (String, mpsc::UnboundedReceiver<ClCommand>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local_addr").to_string();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let conn = RclConnection::from_tcp_stream(ConnectionRole::Server, stream)
            .await
            .expect("connection");

        match conn.recv().await.expect("client hello") {
            Message::Hello { protocol_version, .. } => assert_eq!(protocol_version, PROTOCOL_VERSION),
            other => panic!("expected Hello, got {:?}", other),
        }
        let challenge = auth::generate_challenge(32);
        conn.send(Message::Hello {
            protocol_version: PROTOCOL_VERSION,
            name: "Fake Server".to_string(),
            challenge: Some(challenge.clone()),
        })
        .await
        .expect("send hello");

        let accepted = match conn.recv().await.expect("authenticate") {
            Message::Authenticate {
                token,
                challenge_response,
            } => token == TOKEN && auth::verify_challenge_response(TOKEN, &challenge, &challenge_response),
            other => panic!("expected Authenticate, got {:?}", other),
        };
        conn.send(Message::AuthResult {
            success: accepted,
            session_id: accepted.then_some(SESSION_ID),
            server_id: accepted.then_some(SERVER_ID),
            available_devices: Vec::new(),
            error_message: (!accepted).then(|| "invalid token".to_string()),
        })
        .await
        .expect("send auth result");
        if !accepted {
            return;
        }

        while let Ok(msg) = conn.recv().await {
            match msg {
                Message::ClCommand {
                    request_id,
                    command,
                } => {
                    let response = respond(&command);
                    let _ = tx.send(command);
                    if conn
                        .send(Message::ClResponse {
                            request_id,
                            response,
                        })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Message::Ping => {
                    let _ = conn.send(Message::Pong).await;
                }
                other => panic!("unexpected message: {:?}", other),
            }
        }
    });

    (addr, rx)
}

async fn next_command(rx: &mut mpsc::UnboundedReceiver<ClCommand>) -> ClCommand {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for a command")
        .expect("server closed")
}

#[tokio::test(flavor = "multi_thread")]
async fn test_handshake() {
    let (addr, _rx) = start_fake_server().await;
    let client = Client::connect(&ServerEndpoint::plain(addr.clone(), TOKEN))
        .await
        .expect("connect");
    assert_eq!(client.server_id(), SERVER_ID);
    assert_eq!(client.session_id(), SESSION_ID);
    assert_eq!(client.address(), addr);
    assert!(client.devices().is_empty());
    client.ping().await.expect("ping");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_bad_token_rejected() {
    let (addr, _rx) = start_fake_server().await;
    match Client::connect(&ServerEndpoint::plain(addr, "wrong")).await {
        Err(ClientError::AuthFailed(msg)) => assert_eq!(msg, "invalid token"),
        Err(other) => panic!("expected AuthFailed, got {:?}", other),
        Ok(_) => panic!("expected AuthFailed, got a client"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_release_sent_when_last_clone_drops() {
    let (addr, mut rx) = start_fake_server().await;
    let client = Client::connect(&ServerEndpoint::plain(addr, TOKEN)).await.expect("connect");

    let device = client.open_device(0).await.expect("open_device");
    match next_command(&mut rx).await {
        ClCommand::OpenDevice { index } => assert_eq!(index, 0),
        other => panic!("expected OpenDevice, got {:?}", other),
    }
    let handle = device.handle();
    assert_eq!(handle.resource_type, ResourceType::Device);

    let second = device.clone();
    drop(device);
    client.ping().await.expect("ping");
    assert!(rx.try_recv().is_err(), "release sent while a clone was alive");

    drop(second);
    match next_command(&mut rx).await {
        ClCommand::Release { handle: released } => assert_eq!(released, handle),
        other => panic!("expected Release, got {:?}", other),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_remote_error_mapping() {
    let (addr, mut rx) = start_fake_server().await;
    let client = Client::connect(&ServerEndpoint::plain(addr, TOKEN)).await.expect("connect");
    let device = client.open_device(0).await.expect("open_device");
    let _ = next_command(&mut rx).await;

    match device.create_buffer(MemFlags::READ_WRITE, 0, None).await {
        Err(e) => {
            assert_eq!(e.kind(), Some(ErrorKind::InvalidArgument));
            assert!(e.to_string().contains("buffer size must be non-zero"));
        }
        Ok(_) => panic!("expected InvalidArgument, got a buffer"),
    }

    let buffer = device
        .create_buffer(MemFlags::READ_WRITE, 16, None)
        .await
        .expect("create_buffer");
    assert_eq!(buffer.handle().resource_type, ResourceType::Buffer);

    // Success where a handle was expected.
    match client.open_device(1).await {
        Err(ClientError::UnexpectedResponse(msg)) => println!("{}", msg),
        Err(other) => panic!("expected UnexpectedResponse, got {:?}", other),
        Ok(_) => panic!("expected UnexpectedResponse, got a device"),
    }
}
