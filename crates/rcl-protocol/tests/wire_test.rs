//! Integration test: wire framing
//!
//! Encodes protocol messages into frames and decodes them back through the
//! header/payload path the transport uses.
//!
//! Run with: cargo test -p rcl-protocol --test wire_test

use rcl_protocol::cl_commands::{ClCommand, ClResponse, CopyRegion};
use rcl_protocol::handle::{NetworkHandle, ResourceType};
use rcl_protocol::messages::{Message, RequestId};
use rcl_protocol::wire::{self, FrameFlags, WireError, HEADER_SIZE};
use rcl_protocol::ErrorKind;

fn split_frame(frame: &[u8]) -> ([u8; HEADER_SIZE], &[u8]) {
    let mut header = [0u8; HEADER_SIZE];
    header.copy_from_slice(&frame[..HEADER_SIZE]);
    (header, &frame[HEADER_SIZE..])
}

fn handle(resource_id: u64, resource_type: ResourceType) -> NetworkHandle {
    NetworkHandle {
        server_id: 3,
        session_id: 7,
        resource_id,
        resource_type,
    }
}

#[test]
fn test_copy_command_survives_framing() {
    let msg = Message::ClCommand {
        request_id: RequestId(42),
        command: ClCommand::BufferCopy {
            dst: handle(1, ResourceType::Buffer),
            src: handle(2, ResourceType::Buffer),
            region: CopyRegion::new(16, 32, 64),
            deps: vec![handle(9, ResourceType::Event)],
        },
    };

    let frame = wire::encode_message(&msg, 5).expect("encode");
    let (header, payload) = split_frame(&frame);
    let (flags, stream_id, len) = wire::decode_header(&header).expect("header");
    assert_eq!(stream_id, 5);
    assert_eq!(len as usize, payload.len());
    assert!(!flags.contains(FrameFlags::RESPONSE));

    match wire::decode_message(payload, flags).expect("decode") {
        Message::ClCommand {
            request_id,
            command: ClCommand::BufferCopy { dst, src, region, deps },
        } => {
            assert_eq!(request_id, RequestId(42));
            assert_eq!(dst, handle(1, ResourceType::Buffer));
            assert_eq!(src, handle(2, ResourceType::Buffer));
            assert_eq!(region, CopyRegion::new(16, 32, 64));
            assert_eq!(deps, vec![handle(9, ResourceType::Event)]);
        }
        other => panic!("expected BufferCopy, got {:?}", other),
    }
}

#[test]
fn test_large_payload_is_compressed() {
    let msg = Message::ClResponse {
        request_id: RequestId(1),
        response: ClResponse::Data(vec![0xAA; 64 * 1024]),
    };

    let frame = wire::encode_message(&msg, 0).expect("encode");
    assert!(frame.len() < 64 * 1024, "repetitive payload should compress");

    let (header, payload) = split_frame(&frame);
    let (flags, _, _) = wire::decode_header(&header).expect("header");
    assert!(flags.contains(FrameFlags::COMPRESSED));
    assert!(flags.contains(FrameFlags::RESPONSE));

    match wire::decode_message(payload, flags).expect("decode") {
        Message::ClResponse {
            response: ClResponse::Data(data),
            ..
        } => {
            assert_eq!(data.len(), 64 * 1024);
            assert!(data.iter().all(|&b| b == 0xAA));
        }
        other => panic!("expected Data, got {:?}", other),
    }
}

#[test]
fn test_error_response_keeps_kind() {
    let msg = Message::ClResponse {
        request_id: RequestId(8),
        response: ClResponse::Error {
            kind: ErrorKind::ProtocolMisuse,
            code: 0,
            message: "event has no data".to_string(),
        },
    };
    let frame = wire::encode_message(&msg, 0).expect("encode");
    let (header, payload) = split_frame(&frame);
    let (flags, _, _) = wire::decode_header(&header).expect("header");

    match wire::decode_message(payload, flags).expect("decode") {
        Message::ClResponse {
            response: ClResponse::Error { kind, message, .. },
            ..
        } => {
            assert_eq!(kind, ErrorKind::ProtocolMisuse);
            assert_eq!(message, "event has no data");
        }
        other => panic!("expected Error, got {:?}", other),
    }
}

#[test]
fn test_bad_magic_is_rejected() {
    let frame = wire::encode_message(&Message::Ping, 0).expect("encode");
    let (mut header, _) = split_frame(&frame);
    header[0] = b'X';
    assert!(matches!(wire::decode_header(&header), Err(WireError::InvalidMagic)));
}

#[test]
fn test_oversized_length_is_rejected() {
    let frame = wire::encode_message(&Message::Pong, 0).expect("encode");
    let (mut header, _) = split_frame(&frame);
    header[7..11].copy_from_slice(&(wire::MAX_FRAME_SIZE + 1).to_le_bytes());
    assert!(matches!(
        wire::decode_header(&header),
        Err(WireError::FrameTooLarge(_))
    ));
}
