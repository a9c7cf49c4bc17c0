use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;
use crate::handle::NetworkHandle;

bitflags::bitflags! {
    /// Memory allocation flags, bit-compatible with `cl_mem_flags`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MemFlags: u64 {
        const READ_WRITE     = 1 << 0;
        const WRITE_ONLY     = 1 << 1;
        const READ_ONLY      = 1 << 2;
        const USE_HOST_PTR   = 1 << 3;
        const ALLOC_HOST_PTR = 1 << 4;
        const COPY_HOST_PTR  = 1 << 5;
    }
}

impl Default for MemFlags {
    fn default() -> Self {
        MemFlags::READ_WRITE
    }
}

/// Byte ranges for a buffer-to-buffer copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct CopyRegion {
    pub src_offset: u64,
    pub dst_offset: u64,
    pub size: u64,
}

impl CopyRegion {
    pub fn new(src_offset: u64, dst_offset: u64, size: u64) -> Self {
        Self { src_offset, dst_offset, size }
    }

    /// Copy `size` bytes between the starts of both buffers.
    pub fn whole(size: u64) -> Self {
        Self::new(0, 0, size)
    }
}

/// Device code handed to `CreateProgram`.
#[derive(Debug, Clone, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub enum ProgramSource {
    Source(String),
    Binary(Vec<u8>),
}

/// Compute commands sent from client to server.
///
/// Every command that enqueues device work answers with `ClResponse::Event`
/// immediately; completion is observed through the event commands.
#[derive(Debug, Clone, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub enum ClCommand {
    // ── Device ──────────────────────────────────────────────
    /// Obtain a handle to the discovered device with this server-side index.
    OpenDevice { index: u32 },
    CreateBuffer {
        device: NetworkHandle,
        flags: u64,
        size: u64,
        initial_data: Option<Vec<u8>>,
    },
    CreateUserEvent { device: NetworkHandle },
    CreateProgram {
        device: NetworkHandle,
        source: ProgramSource,
    },

    // ── Buffer ──────────────────────────────────────────────
    BufferSize { buffer: NetworkHandle },
    BufferRead {
        buffer: NetworkHandle,
        offset: u64,
        size: u64,
        deps: Vec<NetworkHandle>,
    },
    BufferWrite {
        buffer: NetworkHandle,
        offset: u64,
        data: Vec<u8>,
        deps: Vec<NetworkHandle>,
    },
    BufferFill {
        buffer: NetworkHandle,
        pattern: Vec<u8>,
        offset: u64,
        size: u64,
        deps: Vec<NetworkHandle>,
    },
    /// Copy from `src` (possibly owned by another node) into `dst`.
    BufferCopy {
        dst: NetworkHandle,
        src: NetworkHandle,
        region: CopyRegion,
        deps: Vec<NetworkHandle>,
    },

    // ── Event ───────────────────────────────────────────────
    EventAwait { event: NetworkHandle },
    EventFinished { event: NetworkHandle },
    EventTrigger { event: NetworkHandle },
    EventGetData { event: NetworkHandle },

    // ── Program ─────────────────────────────────────────────
    ProgramBuild { program: NetworkHandle, options: String },
    ProgramGetBinary { program: NetworkHandle },
    ProgramCreateKernel { program: NetworkHandle, name: String },

    // ── Lifetime ────────────────────────────────────────────
    /// The last remote reference to `handle` was dropped.
    Release { handle: NetworkHandle },
}

impl ClCommand {
    /// Short command name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            ClCommand::OpenDevice { .. } => "OpenDevice",
            ClCommand::CreateBuffer { .. } => "CreateBuffer",
            ClCommand::CreateUserEvent { .. } => "CreateUserEvent",
            ClCommand::CreateProgram { .. } => "CreateProgram",
            ClCommand::BufferSize { .. } => "BufferSize",
            ClCommand::BufferRead { .. } => "BufferRead",
            ClCommand::BufferWrite { .. } => "BufferWrite",
            ClCommand::BufferFill { .. } => "BufferFill",
            ClCommand::BufferCopy { .. } => "BufferCopy",
            ClCommand::EventAwait { .. } => "EventAwait",
            ClCommand::EventFinished { .. } => "EventFinished",
            ClCommand::EventTrigger { .. } => "EventTrigger",
            ClCommand::EventGetData { .. } => "EventGetData",
            ClCommand::ProgramBuild { .. } => "ProgramBuild",
            ClCommand::ProgramGetBinary { .. } => "ProgramGetBinary",
            ClCommand::ProgramCreateKernel { .. } => "ProgramCreateKernel",
            ClCommand::Release { .. } => "Release",
        }
    }
}

/// Server responses to compute commands.
#[derive(Debug, Clone, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub enum ClResponse {
    /// Generic success with no return data.
    Success,

    /// Failure; `code` is the raw native status when `kind` is `Driver`.
    Error {
        kind: ErrorKind,
        code: i32,
        message: String,
    },

    Device(NetworkHandle),
    Buffer(NetworkHandle),
    Event(NetworkHandle),
    Program(NetworkHandle),
    Kernel(NetworkHandle),

    /// BufferSize result.
    Size(u64),

    /// EventFinished result.
    Finished(bool),

    /// EventGetData result.
    Data(Vec<u8>),

    /// ProgramGetBinary result.
    Binary(Vec<u8>),
}

impl ClResponse {
    pub fn is_error(&self) -> bool {
        matches!(self, ClResponse::Error { .. })
    }
}
