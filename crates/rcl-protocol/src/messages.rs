use serde::{Deserialize, Serialize};

use crate::cl_commands::{ClCommand, ClResponse};
use crate::device_info::DeviceInfo;
use crate::error::ProtocolError;

/// A unique identifier for a request, used for matching responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct RequestId(pub u64);

/// Top-level message envelope for the RCL protocol.
#[derive(Debug, Clone, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub enum Message {
    // ── Connection establishment ────────────────────────────
    /// Initial handshake from client or server.
    Hello {
        protocol_version: u32,
        name: String,
        /// Server sends a random challenge for auth.
        challenge: Option<Vec<u8>>,
    },

    /// Authentication message from client.
    Authenticate {
        token: String,
        challenge_response: Vec<u8>,
    },

    /// Authentication result from server.
    AuthResult {
        success: bool,
        session_id: Option<u32>,
        server_id: Option<u16>,
        available_devices: Vec<DeviceInfo>,
        error_message: Option<String>,
    },

    // ── Device discovery ────────────────────────────────────
    QueryDevices,
    DeviceList(Vec<DeviceInfo>),

    // ── Compute commands ────────────────────────────────────
    ClCommand {
        request_id: RequestId,
        command: ClCommand,
    },
    ClResponse {
        request_id: RequestId,
        response: ClResponse,
    },

    // ── Monitoring ──────────────────────────────────────────
    QueryMetrics,
    MetricsData {
        connections_total: u64,
        connections_active: u32,
        requests_total: u64,
        errors_total: u64,
        cl_commands: u64,
        uptime_secs: u64,
        server_id: u16,
        server_address: String,
    },

    // ── Keepalive ───────────────────────────────────────────
    Ping,
    Pong,

    // ── Error ───────────────────────────────────────────────
    Error(ProtocolError),
}

/// Current protocol version.
pub const PROTOCOL_VERSION: u32 = 1;
