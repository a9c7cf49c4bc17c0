//! Integration test: ClExecutor
//!
//! Tests command dispatch on the server-side executor directly (no
//! networking): handle directories, transfers, events, programs, session
//! cleanup and the three buffer copy paths. Cross-node copies reach a
//! second in-process executor through a `PeerReader`.
//!
//! Run with: cargo test -p rcl-server --test executor_test -- --nocapture

use std::sync::{mpsc, Arc};
use std::time::Duration;

use rcl_protocol::cl_commands::{ClCommand, ClResponse, CopyRegion, MemFlags, ProgramSource};
use rcl_protocol::{ErrorKind, NetworkHandle, ResourceType};
use rcl_server::discovery;
use rcl_server::driver::{Driver, HostDriver};
use rcl_server::session::Session;
use rcl_server::{ClError, ClExecutor, PeerReader};

fn make_executor(server_id: u16, devices: u32) -> (Arc<HostDriver>, ClExecutor) {
    rcl_common::try_init_logging();
    let driver = Arc::new(HostDriver::with_devices(devices));
    let exposed = discovery::discover_devices(driver.as_ref(), None);
    let dyn_driver: Arc<dyn Driver> = driver.clone();
    (driver, ClExecutor::new(dyn_driver, exposed, server_id, false))
}

fn make_session(server_id: u16) -> Session {
    Session::new(1, server_id, "test".to_string(), None)
}

fn open(executor: &ClExecutor, session: &Session, index: u32) -> NetworkHandle {
    match executor.execute(session, ClCommand::OpenDevice { index }) {
        ClResponse::Device(handle) => handle,
        other => panic!("expected Device, got {:?}", other),
    }
}

fn create_buffer(
    executor: &ClExecutor,
    session: &Session,
    device: NetworkHandle,
    size: u64,
    initial_data: Option<Vec<u8>>,
) -> NetworkHandle {
    let resp = executor.execute(
        session,
        ClCommand::CreateBuffer {
            device,
            flags: MemFlags::READ_WRITE.bits(),
            size,
            initial_data,
        },
    );
    match resp {
        ClResponse::Buffer(handle) => handle,
        other => panic!("expected Buffer, got {:?}", other),
    }
}

fn expect_event(resp: ClResponse) -> NetworkHandle {
    match resp {
        ClResponse::Event(handle) => handle,
        other => panic!("expected Event, got {:?}", other),
    }
}

fn expect_error(resp: ClResponse, expected: ErrorKind) -> (i32, String) {
    match resp {
        ClResponse::Error {
            kind,
            code,
            message,
        } if kind == expected => (code, message),
        other => panic!("expected {:?} error, got {:?}", expected, other),
    }
}

fn read_bytes(
    executor: &ClExecutor,
    session: &Session,
    buffer: NetworkHandle,
    offset: u64,
    size: u64,
    deps: Vec<NetworkHandle>,
) -> Vec<u8> {
    let event = expect_event(executor.execute(
        session,
        ClCommand::BufferRead {
            buffer,
            offset,
            size,
            deps,
        },
    ));
    let data = match executor.execute(session, ClCommand::EventGetData { event }) {
        ClResponse::Data(bytes) => bytes,
        other => panic!("expected Data, got {:?}", other),
    };
    release(executor, session, event);
    data
}

fn release(executor: &ClExecutor, session: &Session, handle: NetworkHandle) {
    match executor.execute(session, ClCommand::Release { handle }) {
        ClResponse::Success => {}
        other => panic!("expected Success, got {:?}", other),
    }
}

fn await_event(executor: &ClExecutor, session: &Session, event: NetworkHandle) {
    match executor.execute(session, ClCommand::EventAwait { event }) {
        ClResponse::Success => {}
        other => panic!("expected Success, got {:?}", other),
    }
}

/// Serves cross-node reads from another executor in the same process.
struct InProcessPeer {
    executor: Arc<ClExecutor>,
    session: Session,
}

impl PeerReader for InProcessPeer {
    fn read_buffer(
        &self,
        buffer: NetworkHandle,
        offset: u64,
        size: u64,
        deps: &[NetworkHandle],
    ) -> Result<Vec<u8>, ClError> {
        let resp = self.executor.execute(
            &self.session,
            ClCommand::BufferRead {
                buffer,
                offset,
                size,
                deps: deps.to_vec(),
            },
        );
        let event = match resp {
            ClResponse::Event(handle) => handle,
            ClResponse::Error { code, message, .. } => {
                return Err(ClError::Remote { code, message })
            }
            other => panic!("expected Event, got {:?}", other),
        };
        let data = self
            .executor
            .execute(&self.session, ClCommand::EventGetData { event });
        self.executor
            .execute(&self.session, ClCommand::Release { handle: event });
        match data {
            ClResponse::Data(bytes) => Ok(bytes),
            ClResponse::Error { code, message, .. } => Err(ClError::Remote { code, message }),
            other => panic!("expected Data, got {:?}", other),
        }
    }

    fn buffer_size(&self, buffer: NetworkHandle) -> Result<u64, ClError> {
        match self.executor.execute(&self.session, ClCommand::BufferSize { buffer }) {
            ClResponse::Size(size) => Ok(size),
            ClResponse::Error { code, message, .. } => Err(ClError::Remote { code, message }),
            other => panic!("expected Size, got {:?}", other),
        }
    }
}

/// Node 1 executor whose cross-node reads are served by `remote` (node 2).
fn make_peered_executor(remote: &Arc<ClExecutor>) -> ClExecutor {
    let peer = InProcessPeer {
        executor: remote.clone(),
        session: Session::new(99, 2, "peer".to_string(), None),
    };
    let (_driver, executor) = make_executor(1, 1);
    executor.with_peers(Arc::new(peer))
}

fn copy(
    executor: &ClExecutor,
    session: &Session,
    dst: NetworkHandle,
    src: NetworkHandle,
    region: CopyRegion,
    deps: Vec<NetworkHandle>,
) -> ClResponse {
    executor.execute(
        session,
        ClCommand::BufferCopy {
            dst,
            src,
            region,
            deps,
        },
    )
}

#[test]
fn test_open_device() {
    let (_driver, executor) = make_executor(1, 2);
    let session = make_session(1);

    let infos = executor.device_infos();
    assert_eq!(infos.len(), 2);
    assert!(infos.iter().all(|d| d.server_id == 1));

    let first = open(&executor, &session, 0);
    let second = open(&executor, &session, 0);
    assert_ne!(first, second);
    assert_eq!(first.resource_type, ResourceType::Device);
    assert_eq!(first.server_id, 1);
    assert!(executor.opened_device(0).is_some());
    assert!(executor.opened_device(1).is_none());

    let resp = executor.execute(&session, ClCommand::OpenDevice { index: 7 });
    expect_error(resp, ErrorKind::InvalidArgument);
}

#[test]
fn test_allowed_devices() {
    let (_driver, executor) = make_executor(1, 2);
    let session = Session::new(1, 1, "restricted".to_string(), Some(vec![1]));

    let resp = executor.execute(&session, ClCommand::OpenDevice { index: 0 });
    expect_error(resp, ErrorKind::InvalidArgument);
    open(&executor, &session, 1);
}

#[test]
fn test_buffer_commands() {
    let (_driver, executor) = make_executor(1, 1);
    let session = make_session(1);
    let device = open(&executor, &session, 0);
    let buffer = create_buffer(&executor, &session, device, 1024, None);

    match executor.execute(&session, ClCommand::BufferSize { buffer }) {
        ClResponse::Size(size) => assert_eq!(size, 1024),
        other => panic!("expected Size, got {:?}", other),
    }

    let write = expect_event(executor.execute(
        &session,
        ClCommand::BufferWrite {
            buffer,
            offset: 0,
            data: vec![0xAA; 256],
            deps: Vec::new(),
        },
    ));
    let fill = expect_event(executor.execute(
        &session,
        ClCommand::BufferFill {
            buffer,
            pattern: vec![0x00],
            offset: 256,
            size: 768,
            deps: Vec::new(),
        },
    ));

    let data = read_bytes(&executor, &session, buffer, 0, 1024, vec![write, fill]);
    assert!(data[..256].iter().all(|b| *b == 0xAA));
    assert!(data[256..].iter().all(|b| *b == 0x00));

    let resp = executor.execute(&session, ClCommand::EventGetData { event: write });
    expect_error(resp, ErrorKind::ProtocolMisuse);
    let resp = executor.execute(&session, ClCommand::EventTrigger { event: fill });
    expect_error(resp, ErrorKind::ProtocolMisuse);

    let resp = executor.execute(
        &session,
        ClCommand::BufferRead {
            buffer,
            offset: 1000,
            size: 100,
            deps: Vec::new(),
        },
    );
    expect_error(resp, ErrorKind::InvalidArgument);
}

#[test]
fn test_user_event_await_and_trigger() {
    let (_driver, executor) = make_executor(1, 1);
    let executor = Arc::new(executor);
    let session = Arc::new(make_session(1));
    let device = open(&executor, &session, 0);

    let gate = expect_event(executor.execute(&session, ClCommand::CreateUserEvent { device }));
    match executor.execute(&session, ClCommand::EventFinished { event: gate }) {
        ClResponse::Finished(done) => assert!(!done),
        other => panic!("expected Finished, got {:?}", other),
    }

    let waiter = {
        let executor = executor.clone();
        let session = session.clone();
        std::thread::spawn(move || executor.execute(&session, ClCommand::EventAwait { event: gate }))
    };

    std::thread::sleep(Duration::from_millis(50));
    assert!(!waiter.is_finished());

    match executor.execute(&session, ClCommand::EventTrigger { event: gate }) {
        ClResponse::Success => {}
        other => panic!("expected Success, got {:?}", other),
    }
    match waiter.join().expect("waiter panicked") {
        ClResponse::Success => {}
        other => panic!("expected Success, got {:?}", other),
    }
    match executor.execute(&session, ClCommand::EventFinished { event: gate }) {
        ClResponse::Finished(done) => assert!(done),
        other => panic!("expected Finished, got {:?}", other),
    }
}

#[test]
fn test_direct_copy() {
    let (_driver, executor) = make_executor(1, 1);
    let session = make_session(1);
    let device = open(&executor, &session, 0);

    let src = create_buffer(&executor, &session, device, 64, Some((0..64).collect()));
    let dst = create_buffer(&executor, &session, device, 64, None);

    let copy = expect_event(executor.execute(
        &session,
        ClCommand::BufferCopy {
            dst,
            src,
            region: CopyRegion::new(16, 0, 32),
            deps: Vec::new(),
        },
    ));
    let data = read_bytes(&executor, &session, dst, 0, 64, vec![copy]);
    assert_eq!(&data[..32], &(16..48).collect::<Vec<u8>>()[..]);
    assert!(data[32..].iter().all(|b| *b == 0));
}

#[test]
fn test_direct_copy_waits_for_dependencies() {
    let (_driver, executor) = make_executor(1, 1);
    let session = make_session(1);
    let device = open(&executor, &session, 0);

    let src = create_buffer(&executor, &session, device, 64, Some(vec![0x3C; 64]));
    let dst = create_buffer(&executor, &session, device, 64, None);

    let gate = expect_event(executor.execute(&session, ClCommand::CreateUserEvent { device }));
    let event = expect_event(copy(&executor, &session, dst, src, CopyRegion::whole(64), vec![gate]));

    std::thread::sleep(Duration::from_millis(50));
    match executor.execute(&session, ClCommand::EventFinished { event }) {
        ClResponse::Finished(done) => assert!(!done),
        other => panic!("expected Finished, got {:?}", other),
    }

    executor.execute(&session, ClCommand::EventTrigger { event: gate });
    await_event(&executor, &session, event);

    let data = read_bytes(&executor, &session, dst, 0, 64, Vec::new());
    assert!(data.iter().all(|b| *b == 0x3C));
}

#[test]
fn test_copy_paths_agree() {
    let (_remote_driver, remote) = make_executor(2, 1);
    let remote = Arc::new(remote);
    let remote_session = make_session(2);
    let remote_device = open(&remote, &remote_session, 0);

    let executor = make_peered_executor(&remote);
    let session = make_session(1);
    let device = open(&executor, &session, 0);

    let pattern: Vec<u8> = (0..200u32).map(|i| (i * 7 % 251) as u8).collect();
    let region = CopyRegion::new(40, 8, 120);

    let local_src = create_buffer(&executor, &session, device, 200, Some(pattern.clone()));
    let remote_src = create_buffer(&remote, &remote_session, remote_device, 200, Some(pattern.clone()));
    let via_direct = create_buffer(&executor, &session, device, 200, None);
    let via_bruteforce = create_buffer(&executor, &session, device, 200, None);

    let direct = expect_event(copy(&executor, &session, via_direct, local_src, region, Vec::new()));
    let bruteforce = expect_event(copy(&executor, &session, via_bruteforce, remote_src, region, Vec::new()));

    let direct_bytes = read_bytes(&executor, &session, via_direct, 0, 200, vec![direct]);
    let bruteforce_bytes = read_bytes(&executor, &session, via_bruteforce, 0, 200, vec![bruteforce]);
    assert_eq!(direct_bytes, bruteforce_bytes);
    assert_eq!(&direct_bytes[8..128], &pattern[40..160]);
}

#[test]
fn test_local_copy_between_devices() {
    let (_driver, executor) = make_executor(1, 2);
    let session = make_session(1);
    let dev0 = open(&executor, &session, 0);
    let dev1 = open(&executor, &session, 1);

    let src = create_buffer(&executor, &session, dev0, 128, Some(vec![0x5A; 128]));
    let dst = create_buffer(&executor, &session, dev1, 128, None);

    // Gate the copy on a user event of the source device.
    let gate = expect_event(executor.execute(&session, ClCommand::CreateUserEvent { device: dev0 }));
    let copy = expect_event(executor.execute(
        &session,
        ClCommand::BufferCopy {
            dst,
            src,
            region: CopyRegion::new(0, 64, 64),
            deps: vec![gate],
        },
    ));

    std::thread::sleep(Duration::from_millis(50));
    match executor.execute(&session, ClCommand::EventFinished { event: copy }) {
        ClResponse::Finished(done) => assert!(!done),
        other => panic!("expected Finished, got {:?}", other),
    }

    executor.execute(&session, ClCommand::EventTrigger { event: gate });
    await_event(&executor, &session, copy);

    let data = read_bytes(&executor, &session, dst, 0, 128, Vec::new());
    assert!(data[..64].iter().all(|b| *b == 0));
    assert!(data[64..].iter().all(|b| *b == 0x5A));
}

#[test]
fn test_bruteforce_copy_across_nodes() {
    let (_remote_driver, remote) = make_executor(2, 1);
    let remote = Arc::new(remote);
    let remote_session = make_session(2);

    let peer = InProcessPeer {
        executor: remote.clone(),
        session: Session::new(99, 2, "peer".to_string(), None),
    };
    let (_driver, executor) = make_executor(1, 1);
    let executor = executor.with_peers(Arc::new(peer));
    let session = make_session(1);

    // Source on node 2, written once a node-2 user event fires.
    let remote_device = open(&remote, &remote_session, 0);
    let src = create_buffer(&remote, &remote_session, remote_device, 32, None);
    let gate = expect_event(remote.execute(
        &remote_session,
        ClCommand::CreateUserEvent {
            device: remote_device,
        },
    ));
    let write = expect_event(remote.execute(
        &remote_session,
        ClCommand::BufferWrite {
            buffer: src,
            offset: 0,
            data: (100..132).collect(),
            deps: vec![gate],
        },
    ));

    let device = open(&executor, &session, 0);
    let dst = create_buffer(&executor, &session, device, 32, None);
    assert_eq!(src.server_id, 2);
    assert_eq!(dst.server_id, 1);

    // The node-2 dependency is forwarded with the remote read.
    let copy = expect_event(executor.execute(
        &session,
        ClCommand::BufferCopy {
            dst,
            src,
            region: CopyRegion::whole(32),
            deps: vec![write],
        },
    ));

    std::thread::sleep(Duration::from_millis(50));
    match executor.execute(&session, ClCommand::EventFinished { event: copy }) {
        ClResponse::Finished(done) => assert!(!done),
        other => panic!("expected Finished, got {:?}", other),
    }

    remote.execute(&remote_session, ClCommand::EventTrigger { event: gate });
    await_event(&executor, &session, copy);

    let data = read_bytes(&executor, &session, dst, 0, 32, Vec::new());
    assert_eq!(data, (100..132).collect::<Vec<u8>>());
}

#[test]
fn test_remote_source_range_checked_up_front() {
    let (_remote_driver, remote) = make_executor(2, 1);
    let remote = Arc::new(remote);
    let remote_session = make_session(2);
    let executor = make_peered_executor(&remote);
    let session = make_session(1);

    let remote_device = open(&remote, &remote_session, 0);
    let src = create_buffer(&remote, &remote_session, remote_device, 16, None);
    let device = open(&executor, &session, 0);
    let dst = create_buffer(&executor, &session, device, 64, None);
    let local_src = create_buffer(&executor, &session, device, 16, None);

    // 64 bytes from a 16-byte source: rejected before anything is enqueued,
    // the same way for a local and a remote source.
    let resp = copy(&executor, &session, dst, local_src, CopyRegion::whole(64), Vec::new());
    let (_, local_message) = expect_error(resp, ErrorKind::InvalidArgument);
    let resp = copy(&executor, &session, dst, src, CopyRegion::whole(64), Vec::new());
    let (_, remote_message) = expect_error(resp, ErrorKind::InvalidArgument);
    assert_eq!(local_message, remote_message);
    assert!(remote_message.contains("exceeds buffer size 16"));
}

#[test]
fn test_bruteforce_failure_fails_event() {
    let (_remote_driver, remote) = make_executor(2, 1);
    let remote = Arc::new(remote);
    let remote_session = make_session(2);
    let executor = make_peered_executor(&remote);
    let session = make_session(1);

    let remote_device = open(&remote, &remote_session, 0);
    let src = create_buffer(&remote, &remote_session, remote_device, 16, None);
    let device = open(&executor, &session, 0);
    let dst = create_buffer(&executor, &session, device, 16, None);

    // The source disappears from node 2 before the gated copy reads it.
    let gate = expect_event(executor.execute(&session, ClCommand::CreateUserEvent { device }));
    let event = expect_event(copy(&executor, &session, dst, src, CopyRegion::whole(16), vec![gate]));
    release(&remote, &remote_session, src);
    executor.execute(&session, ClCommand::EventTrigger { event: gate });

    let resp = executor.execute(&session, ClCommand::EventAwait { event });
    let (code, message) = expect_error(resp, ErrorKind::Driver);
    println!("{} ({})", message, code);
    assert!(code < 0);
}

#[test]
fn test_cross_node_copy_requires_peers() {
    let (_driver, executor) = make_executor(1, 1);
    let session = make_session(1);
    let device = open(&executor, &session, 0);
    let dst = create_buffer(&executor, &session, device, 16, None);

    let foreign = NetworkHandle {
        server_id: 5,
        session_id: 1,
        resource_id: 1,
        resource_type: ResourceType::Buffer,
    };
    let resp = executor.execute(
        &session,
        ClCommand::BufferCopy {
            dst,
            src: foreign,
            region: CopyRegion::whole(16),
            deps: Vec::new(),
        },
    );
    expect_error(resp, ErrorKind::Unsupported);

    // Dependencies of a plain read must live on this node.
    let foreign_event = NetworkHandle {
        resource_type: ResourceType::Event,
        ..foreign
    };
    let resp = executor.execute(
        &session,
        ClCommand::BufferRead {
            buffer: dst,
            offset: 0,
            size: 16,
            deps: vec![foreign_event],
        },
    );
    expect_error(resp, ErrorKind::InvalidHandle);
}

#[test]
fn test_invalid_handles() {
    let (_driver, executor) = make_executor(1, 1);
    let session = make_session(1);
    let device = open(&executor, &session, 0);
    let buffer = create_buffer(&executor, &session, device, 16, None);

    // Wrong resource type.
    let resp = executor.execute(&session, ClCommand::EventAwait { event: buffer });
    expect_error(resp, ErrorKind::InvalidHandle);

    // Null handle.
    let resp = executor.execute(
        &session,
        ClCommand::BufferSize {
            buffer: NetworkHandle::null(),
        },
    );
    expect_error(resp, ErrorKind::InvalidHandle);

    release(&executor, &session, buffer);
    let resp = executor.execute(&session, ClCommand::BufferSize { buffer });
    expect_error(resp, ErrorKind::InvalidHandle);
    let resp = executor.execute(&session, ClCommand::Release { handle: buffer });
    expect_error(resp, ErrorKind::InvalidHandle);
}

#[test]
fn test_program_commands() {
    let (_driver, executor) = make_executor(1, 1);
    let session = make_session(1);
    let device = open(&executor, &session, 0);

    let create = |source: ProgramSource| match executor.execute(
        &session,
        ClCommand::CreateProgram { device, source },
    ) {
        ClResponse::Program(handle) => handle,
        other => panic!("expected Program, got {:?}", other),
    };

    let broken = create(ProgramSource::Source("#error nope\n".to_string()));
    let resp = executor.execute(
        &session,
        ClCommand::ProgramBuild {
            program: broken,
            options: String::new(),
        },
    );
    let (code, message) = expect_error(resp, ErrorKind::BuildFailure);
    assert_eq!(code, -11);
    assert!(message.starts_with("A build error occurred!\n/// OPENCL BUILD LOG\n"));
    assert!(message.ends_with("/// OPENCL BUILD LOG END"));

    let program = create(ProgramSource::Source(
        "__kernel void add(global int* a) {}".to_string(),
    ));
    let resp = executor.execute(&session, ClCommand::ProgramGetBinary { program });
    expect_error(resp, ErrorKind::ProtocolMisuse);

    match executor.execute(
        &session,
        ClCommand::ProgramBuild {
            program,
            options: String::new(),
        },
    ) {
        ClResponse::Success => {}
        other => panic!("expected Success, got {:?}", other),
    }

    let binary = match executor.execute(&session, ClCommand::ProgramGetBinary { program }) {
        ClResponse::Binary(binary) => binary,
        other => panic!("expected Binary, got {:?}", other),
    };
    let reloaded = create(ProgramSource::Binary(binary));
    assert_ne!(reloaded, program);

    match executor.execute(
        &session,
        ClCommand::ProgramCreateKernel {
            program,
            name: "add".to_string(),
        },
    ) {
        ClResponse::Kernel(handle) => assert_eq!(handle.resource_type, ResourceType::Kernel),
        other => panic!("expected Kernel, got {:?}", other),
    }
}

#[test]
fn test_cleanup_session() {
    let (driver, executor) = make_executor(1, 1);
    let session = make_session(1);
    let device = open(&executor, &session, 0);
    let buffer = create_buffer(&executor, &session, device, 64, None);
    let _read = expect_event(executor.execute(
        &session,
        ClCommand::BufferRead {
            buffer,
            offset: 0,
            size: 64,
            deps: Vec::new(),
        },
    ));
    assert_eq!(executor.handle_count(), 3);
    assert_eq!(session.handle_count(), 3);

    executor.cleanup_session(&session);
    assert_eq!(executor.handle_count(), 0);
    assert_eq!(session.handle_count(), 0);
    assert_eq!(driver.live_mem_objects(), 0);
}

#[test]
fn test_cleanup_completes_orphaned_user_events() {
    let (driver, executor) = make_executor(1, 1);
    let executor = Arc::new(executor);
    let session = Arc::new(make_session(1));
    let device = open(&executor, &session, 0);
    let buffer = create_buffer(&executor, &session, device, 64, None);

    // A read gated on the session's own user event, never triggered.
    let gate = expect_event(executor.execute(&session, ClCommand::CreateUserEvent { device }));
    let _read = expect_event(executor.execute(
        &session,
        ClCommand::BufferRead {
            buffer,
            offset: 0,
            size: 64,
            deps: vec![gate],
        },
    ));

    let (tx, rx) = mpsc::channel();
    {
        let executor = executor.clone();
        let session = session.clone();
        std::thread::spawn(move || {
            executor.cleanup_session(&session);
            let _ = tx.send(());
        });
    }
    rx.recv_timeout(Duration::from_secs(5))
        .expect("cleanup_session blocked on a gated read");

    assert_eq!(executor.handle_count(), 0);
    assert_eq!(driver.live_mem_objects(), 0);
    let opened = executor.opened_device(0).expect("device still opened");
    assert_eq!(opened.user_event_count(), 0);
}

#[test]
fn test_shutdown_triggers_outstanding_user_events() {
    let (driver, executor) = make_executor(1, 1);
    let session = make_session(1);
    let device = open(&executor, &session, 0);
    let buffer = create_buffer(&executor, &session, device, 64, None);

    let gate = expect_event(executor.execute(&session, ClCommand::CreateUserEvent { device }));
    let _read = expect_event(executor.execute(
        &session,
        ClCommand::BufferRead {
            buffer,
            offset: 0,
            size: 64,
            deps: vec![gate],
        },
    ));

    // The buffer cannot be freed while the user event is pending.
    release(&executor, &session, buffer);
    assert_eq!(driver.live_mem_objects(), 1);

    executor.shutdown();
    assert_eq!(executor.handle_count(), 0);
    assert_eq!(driver.live_mem_objects(), 0);
    assert_eq!(driver.live_events(), 0);
}
