//! Integration test: RclServer end to end
//!
//! Starts servers on 127.0.0.1 with the host emulation driver and talks to
//! them through rcl-client over plain TCP: handshake and authentication,
//! buffer and event operations, connection limits, idle timeout and a
//! cross-node copy between two servers.
//!
//! Run with: cargo test -p rcl-server --test server_test -- --nocapture

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use rcl_client::{Client, ClientError};
use rcl_core::config::{ServerConfig, ServerEndpoint, TokenEntry};
use rcl_protocol::cl_commands::{ClCommand, ClResponse, CopyRegion, MemFlags, ProgramSource};
use rcl_protocol::ErrorKind;
use rcl_server::discovery;
use rcl_server::driver::{Driver, HostDriver};
use rcl_server::peer::PeerDirectory;
use rcl_server::{ClExecutor, RclServer};

struct TestServer {
    addr: SocketAddr,
    server: Arc<RclServer>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl TestServer {
    fn endpoint(&self, token: &str) -> ServerEndpoint {
        ServerEndpoint::plain(self.addr.to_string(), token)
    }

    async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = tokio::time::timeout(Duration::from_secs(15), self.task).await;
    }
}

fn make_config(server_id: u16) -> ServerConfig {
    ServerConfig {
        server_id,
        bind: "127.0.0.1".to_string(),
        port: 0,
        ..ServerConfig::default()
    }
}

fn make_executor(server_id: u16, devices: u32) -> ClExecutor {
    let driver = Arc::new(HostDriver::with_devices(devices));
    let exposed = discovery::discover_devices(driver.as_ref(), None);
    let driver: Arc<dyn Driver> = driver;
    ClExecutor::new(driver, exposed, server_id, false)
}

async fn start_server(config: ServerConfig, tokens: Vec<TokenEntry>, executor: ClExecutor) -> TestServer {
    rcl_common::try_init_logging();
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local_addr");
    let server = Arc::new(RclServer::with_executor(config, tokens, Arc::new(executor)));
    let (shutdown, shutdown_rx) = watch::channel(false);

    let task = {
        let server = server.clone();
        tokio::spawn(async move {
            if let Err(e) = server.serve(listener, shutdown_rx).await {
                panic!("server failed: {}", e);
            }
        })
    };

    TestServer {
        addr,
        server,
        shutdown,
        task,
    }
}

fn token(name: &str, token: &str, allowed_devices: Option<Vec<u32>>) -> TokenEntry {
    TokenEntry {
        token: token.to_string(),
        name: name.to_string(),
        allowed_devices,
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_handshake_and_device_list() {
    let server = start_server(make_config(3), Vec::new(), make_executor(3, 2)).await;

    let client = Client::connect(&server.endpoint("")).await.expect("connect");
    assert_eq!(client.server_id(), 3);
    assert_eq!(client.devices().len(), 2);
    for d in client.devices() {
        println!("  {} ({:?}) on server {}", d.device_name, d.device_type, d.server_id);
        assert_eq!(d.server_id, 3);
    }

    client.ping().await.expect("ping");
    let devices = client.query_devices().await.expect("query_devices");
    assert_eq!(devices.len(), 2);

    drop(client);
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_token_authentication() {
    let tokens = vec![token("alice", "secret-a", None), token("bob", "secret-b", Some(vec![1]))];
    let server = start_server(make_config(1), tokens, make_executor(1, 2)).await;

    match Client::connect(&server.endpoint("wrong")).await {
        Err(ClientError::AuthFailed(msg)) => println!("rejected: {}", msg),
        Err(other) => panic!("expected AuthFailed, got {:?}", other),
        Ok(_) => panic!("expected AuthFailed, got a client"),
    }

    let alice = Client::connect(&server.endpoint("secret-a")).await.expect("alice");
    assert_eq!(alice.devices().len(), 2);

    // bob only sees and may open device 1.
    let bob = Client::connect(&server.endpoint("secret-b")).await.expect("bob");
    assert_eq!(bob.devices().len(), 1);
    assert_eq!(bob.devices()[0].server_device_index, 1);
    match bob.open_device(0).await {
        Err(e) => assert_eq!(e.kind(), Some(ErrorKind::InvalidArgument)),
        Ok(_) => panic!("expected InvalidArgument, got a device"),
    }
    bob.open_device(1).await.expect("open device 1");

    drop(alice);
    drop(bob);
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_buffer_and_event_operations() {
    let server = start_server(make_config(1), Vec::new(), make_executor(1, 1)).await;
    let client = Client::connect(&server.endpoint("")).await.expect("connect");
    let device = client.open_device(0).await.expect("open_device");

    let buffer = device
        .create_buffer(MemFlags::READ_WRITE, 1024, None)
        .await
        .expect("create_buffer");
    assert_eq!(buffer.size().await.expect("size"), 1024);

    let write = buffer.write(0, vec![0xAA; 256], &[]).await.expect("write");
    let fill = buffer.fill(vec![0x00], 256, 768, &[]).await.expect("fill");
    let read = buffer.read(0, 1024, &[&write, &fill]).await.expect("read");
    let data = read.data().await.expect("data");
    assert!(data[..256].iter().all(|b| *b == 0xAA));
    assert!(data[256..].iter().all(|b| *b == 0x00));

    match write.data().await {
        Err(e) => assert_eq!(e.kind(), Some(ErrorKind::ProtocolMisuse)),
        Ok(_) => panic!("expected ProtocolMisuse, got data"),
    }

    // An await and the trigger releasing it are in flight together.
    let gate = device.create_user_event().await.expect("user event");
    let gated = buffer.write(0, vec![1; 16], &[&gate]).await.expect("gated write");
    let waiter = {
        let gated = gated.clone();
        tokio::spawn(async move { gated.wait().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!gated.finished().await.expect("finished"));
    gate.trigger().await.expect("trigger");
    waiter.await.expect("join").expect("wait");
    assert!(gated.finished().await.expect("finished"));

    let metrics = server.server.metrics();
    assert!(metrics.cl_commands.load(Ordering::Relaxed) > 0);
    assert!(metrics.errors_total.load(Ordering::Relaxed) >= 1);

    drop((read, write, fill, gate, gated, buffer, device, client));
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_program_over_network() {
    let server = start_server(make_config(1), Vec::new(), make_executor(1, 1)).await;
    let client = Client::connect(&server.endpoint("")).await.expect("connect");
    let device = client.open_device(0).await.expect("open_device");

    let broken = device
        .create_program(ProgramSource::Source("#error bad\n".to_string()))
        .await
        .expect("create_program");
    match broken.build("").await {
        Err(ClientError::Remote {
            kind: ErrorKind::BuildFailure,
            message,
            ..
        }) => assert!(message.contains("/// OPENCL BUILD LOG")),
        other => panic!("expected BuildFailure, got {:?}", other),
    }

    let program = device
        .create_program(ProgramSource::Source("kernel void run(global int* x) {}".to_string()))
        .await
        .expect("create_program");
    program.build("").await.expect("build");
    assert!(!program.binary().await.expect("binary").is_empty());
    let kernel = program.create_kernel("run").await.expect("kernel");
    assert_eq!(kernel.name(), "run");

    drop((kernel, program, broken, device, client));
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_disconnect_releases_session_handles() {
    let executor = make_executor(1, 1);
    let server = start_server(make_config(1), Vec::new(), executor).await;

    {
        // Raw commands: the handles are never adopted, so nothing is released
        // before the connection goes away.
        let client = Client::connect(&server.endpoint("")).await.expect("connect");
        let device = match client.execute(ClCommand::OpenDevice { index: 0 }).await {
            Ok(ClResponse::Device(handle)) => handle,
            other => panic!("expected Device, got {:?}", other),
        };
        let create = ClCommand::CreateBuffer {
            device,
            flags: MemFlags::READ_WRITE.bits(),
            size: 64,
            initial_data: None,
        };
        match client.execute(create).await {
            Ok(ClResponse::Buffer(_)) => {}
            other => panic!("expected Buffer, got {:?}", other),
        }
        assert_eq!(server.server.executor().handle_count(), 2);
    }

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while server.server.executor().handle_count() > 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(server.server.executor().handle_count(), 0);
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_max_clients() {
    let config = ServerConfig {
        max_clients: 1,
        ..make_config(1)
    };
    let server = start_server(config, Vec::new(), make_executor(1, 1)).await;

    let first = Client::connect(&server.endpoint("")).await.expect("first");
    match Client::connect(&server.endpoint("")).await {
        Err(e) => println!("second client rejected: {}", e),
        Ok(_) => panic!("expected rejection, got a client"),
    }
    first.ping().await.expect("first still served");

    drop(first);
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_idle_timeout() {
    let config = ServerConfig {
        idle_timeout_secs: 1,
        ..make_config(1)
    };
    let server = start_server(config, Vec::new(), make_executor(1, 1)).await;

    let client = Client::connect(&server.endpoint("")).await.expect("connect");
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(client.ping().await.is_err());

    drop(client);
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cross_node_copy() {
    // Node 2 holds the source buffer; node 1 reaches it as a peer.
    let source_node = start_server(make_config(2), Vec::new(), make_executor(2, 1)).await;

    let peers = PeerDirectory::new(
        vec![source_node.endpoint("")],
        tokio::runtime::Handle::current(),
    );
    let executor = make_executor(1, 1).with_peers(Arc::new(peers));
    let dest_node = start_server(make_config(1), Vec::new(), executor).await;

    let src_client = Client::connect(&source_node.endpoint("")).await.expect("connect node 2");
    let dst_client = Client::connect(&dest_node.endpoint("")).await.expect("connect node 1");

    let src_device = src_client.open_device(0).await.expect("open node 2");
    let dst_device = dst_client.open_device(0).await.expect("open node 1");

    let pattern: Vec<u8> = (0..=255).cycle().take(4096).collect();
    let src = src_device
        .create_buffer(MemFlags::READ_ONLY, 4096, Some(pattern.clone()))
        .await
        .expect("src buffer");
    let dst = dst_device
        .create_buffer(MemFlags::READ_WRITE, 4096, None)
        .await
        .expect("dst buffer");

    let copy = dst
        .copy_from(&src, CopyRegion::new(1024, 0, 2048), &[])
        .await
        .expect("copy_from");
    copy.wait().await.expect("copy wait");

    let read = dst.read(0, 4096, &[]).await.expect("read");
    let data = read.data().await.expect("data");
    assert_eq!(&data[..2048], &pattern[1024..3072]);
    assert!(data[2048..].iter().all(|b| *b == 0));

    drop((read, copy, dst, src, dst_device, src_device, dst_client, src_client));
    dest_node.stop().await;
    source_node.stop().await;
}
