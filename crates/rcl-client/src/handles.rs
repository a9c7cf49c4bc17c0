//! Typed client-side handles.
//!
//! Each handle is a cheap clone over one shared [`RemoteHandle`]; when the
//! last clone goes away a `Release` is sent to the owning server.

use std::sync::Arc;

use rcl_protocol::cl_commands::{ClCommand, ClResponse, CopyRegion, MemFlags, ProgramSource};
use rcl_protocol::NetworkHandle;

use crate::client::Client;
use crate::error::ClientError;

pub(crate) struct RemoteHandle {
    pub(crate) client: Arc<Client>,
    pub(crate) handle: NetworkHandle,
}

impl Drop for RemoteHandle {
    fn drop(&mut self) {
        self.client.release_detached(self.handle);
    }
}

fn dep_handles(deps: &[&RemoteEvent]) -> Vec<NetworkHandle> {
    deps.iter().map(|e| e.handle()).collect()
}

fn expect_success(response: ClResponse) -> Result<(), ClientError> {
    match response {
        ClResponse::Success => Ok(()),
        other => Err(ClientError::unexpected(other)),
    }
}

/// A device context/queue on a remote server.
#[derive(Clone)]
pub struct RemoteDevice {
    inner: Arc<RemoteHandle>,
}

impl RemoteDevice {
    pub(crate) fn new(inner: Arc<RemoteHandle>) -> Self {
        Self { inner }
    }

    pub fn handle(&self) -> NetworkHandle {
        self.inner.handle
    }

    pub async fn create_buffer(
        &self,
        flags: MemFlags,
        size: u64,
        initial_data: Option<Vec<u8>>,
    ) -> Result<RemoteBuffer, ClientError> {
        let client = &self.inner.client;
        let response = client
            .execute(ClCommand::CreateBuffer {
                device: self.inner.handle,
                flags: flags.bits(),
                size,
                initial_data,
            })
            .await?;
        match response {
            ClResponse::Buffer(handle) => Ok(RemoteBuffer {
                inner: client.adopt(handle),
            }),
            other => Err(ClientError::unexpected(other)),
        }
    }

    pub async fn create_user_event(&self) -> Result<RemoteEvent, ClientError> {
        let client = &self.inner.client;
        let response = client
            .execute(ClCommand::CreateUserEvent {
                device: self.inner.handle,
            })
            .await?;
        RemoteEvent::from_response(client, response)
    }

    pub async fn create_program(&self, source: ProgramSource) -> Result<RemoteProgram, ClientError> {
        let client = &self.inner.client;
        let response = client
            .execute(ClCommand::CreateProgram {
                device: self.inner.handle,
                source,
            })
            .await?;
        match response {
            ClResponse::Program(handle) => Ok(RemoteProgram {
                inner: client.adopt(handle),
            }),
            other => Err(ClientError::unexpected(other)),
        }
    }
}

/// A fixed-size memory region on a remote device.
#[derive(Clone)]
pub struct RemoteBuffer {
    inner: Arc<RemoteHandle>,
}

impl RemoteBuffer {
    pub fn handle(&self) -> NetworkHandle {
        self.inner.handle
    }

    pub async fn size(&self) -> Result<u64, ClientError> {
        let response = self
            .inner
            .client
            .execute(ClCommand::BufferSize {
                buffer: self.inner.handle,
            })
            .await?;
        match response {
            ClResponse::Size(size) => Ok(size),
            other => Err(ClientError::unexpected(other)),
        }
    }

    /// Enqueue a read; the bytes are fetched with [`RemoteEvent::data`].
    pub async fn read(
        &self,
        offset: u64,
        size: u64,
        deps: &[&RemoteEvent],
    ) -> Result<RemoteEvent, ClientError> {
        self.enqueue(ClCommand::BufferRead {
            buffer: self.inner.handle,
            offset,
            size,
            deps: dep_handles(deps),
        })
        .await
    }

    pub async fn write(
        &self,
        offset: u64,
        data: Vec<u8>,
        deps: &[&RemoteEvent],
    ) -> Result<RemoteEvent, ClientError> {
        self.enqueue(ClCommand::BufferWrite {
            buffer: self.inner.handle,
            offset,
            data,
            deps: dep_handles(deps),
        })
        .await
    }

    pub async fn fill(
        &self,
        pattern: Vec<u8>,
        offset: u64,
        size: u64,
        deps: &[&RemoteEvent],
    ) -> Result<RemoteEvent, ClientError> {
        self.enqueue(ClCommand::BufferFill {
            buffer: self.inner.handle,
            pattern,
            offset,
            size,
            deps: dep_handles(deps),
        })
        .await
    }

    /// Copy `region` of `src` into this buffer. `src` may live on another server.
    pub async fn copy_from(
        &self,
        src: &RemoteBuffer,
        region: CopyRegion,
        deps: &[&RemoteEvent],
    ) -> Result<RemoteEvent, ClientError> {
        self.enqueue(ClCommand::BufferCopy {
            dst: self.inner.handle,
            src: src.handle(),
            region,
            deps: dep_handles(deps),
        })
        .await
    }

    async fn enqueue(&self, command: ClCommand) -> Result<RemoteEvent, ClientError> {
        let client = &self.inner.client;
        let response = client.execute(command).await?;
        RemoteEvent::from_response(client, response)
    }
}

/// A completion token on a remote device.
#[derive(Clone)]
pub struct RemoteEvent {
    inner: Arc<RemoteHandle>,
}

impl RemoteEvent {
    fn from_response(client: &Arc<Client>, response: ClResponse) -> Result<Self, ClientError> {
        match response {
            ClResponse::Event(handle) => Ok(Self {
                inner: client.adopt(handle),
            }),
            other => Err(ClientError::unexpected(other)),
        }
    }

    pub fn handle(&self) -> NetworkHandle {
        self.inner.handle
    }

    /// Block until the event completes.
    pub async fn wait(&self) -> Result<(), ClientError> {
        let response = self
            .inner
            .client
            .execute(ClCommand::EventAwait {
                event: self.inner.handle,
            })
            .await?;
        expect_success(response)
    }

    pub async fn finished(&self) -> Result<bool, ClientError> {
        let response = self
            .inner
            .client
            .execute(ClCommand::EventFinished {
                event: self.inner.handle,
            })
            .await?;
        match response {
            ClResponse::Finished(done) => Ok(done),
            other => Err(ClientError::unexpected(other)),
        }
    }

    /// Complete a user event.
    pub async fn trigger(&self) -> Result<(), ClientError> {
        let response = self
            .inner
            .client
            .execute(ClCommand::EventTrigger {
                event: self.inner.handle,
            })
            .await?;
        expect_success(response)
    }

    /// Wait, then fetch the bytes produced by the operation.
    pub async fn data(&self) -> Result<Vec<u8>, ClientError> {
        let response = self
            .inner
            .client
            .execute(ClCommand::EventGetData {
                event: self.inner.handle,
            })
            .await?;
        match response {
            ClResponse::Data(data) => Ok(data),
            other => Err(ClientError::unexpected(other)),
        }
    }
}

#[derive(Clone)]
pub struct RemoteProgram {
    inner: Arc<RemoteHandle>,
}

impl RemoteProgram {
    pub fn handle(&self) -> NetworkHandle {
        self.inner.handle
    }

    /// Build the program. A `BuildFailure` error carries the build log.
    pub async fn build(&self, options: &str) -> Result<(), ClientError> {
        let response = self
            .inner
            .client
            .execute(ClCommand::ProgramBuild {
                program: self.inner.handle,
                options: options.to_string(),
            })
            .await?;
        expect_success(response)
    }

    pub async fn binary(&self) -> Result<Vec<u8>, ClientError> {
        let response = self
            .inner
            .client
            .execute(ClCommand::ProgramGetBinary {
                program: self.inner.handle,
            })
            .await?;
        match response {
            ClResponse::Binary(binary) => Ok(binary),
            other => Err(ClientError::unexpected(other)),
        }
    }

    pub async fn create_kernel(&self, name: &str) -> Result<RemoteKernel, ClientError> {
        let client = &self.inner.client;
        let response = client
            .execute(ClCommand::ProgramCreateKernel {
                program: self.inner.handle,
                name: name.to_string(),
            })
            .await?;
        match response {
            ClResponse::Kernel(handle) => Ok(RemoteKernel {
                inner: client.adopt(handle),
                name: name.to_string(),
            }),
            other => Err(ClientError::unexpected(other)),
        }
    }
}

#[derive(Clone)]
pub struct RemoteKernel {
    inner: Arc<RemoteHandle>,
    name: String,
}

impl RemoteKernel {
    pub fn handle(&self) -> NetworkHandle {
        self.inner.handle
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}
