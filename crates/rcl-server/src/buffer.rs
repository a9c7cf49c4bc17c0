//! Device memory regions.

use std::sync::Arc;

use tracing::{debug, warn};

use rcl_protocol::cl_commands::{CopyRegion, MemFlags};
use rcl_protocol::NetworkHandle;

use crate::device::Device;
use crate::driver::{DriverError, EventStatus, NativeMem, CL_OUT_OF_HOST_MEMORY, CL_OUT_OF_RESOURCES};
use crate::error::ClError;
use crate::event::{Event, EventKind};
use crate::host_buffer::HostBuffer;

/// Reads buffer contents from another node.
pub trait PeerReader: Send + Sync {
    /// Read `size` bytes at `offset` of the remote `buffer` once every
    /// event in `deps` (all owned by the buffer's node) has completed.
    fn read_buffer(
        &self,
        buffer: NetworkHandle,
        offset: u64,
        size: u64,
        deps: &[NetworkHandle],
    ) -> Result<Vec<u8>, ClError>;

    /// Size in bytes of the remote `buffer`.
    fn buffer_size(&self, buffer: NetworkHandle) -> Result<u64, ClError>;
}

fn check_range(what: &str, offset: u64, len: u64, size: u64) -> Result<(), ClError> {
    if len == 0 {
        return Err(ClError::InvalidArgument(format!("{} of zero bytes", what)));
    }
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(ClError::InvalidArgument(format!(
            "{} of {} bytes at offset {} exceeds buffer size {}",
            what, len, offset, size
        ))),
    }
}

/// Source operand of [`Buffer::copy`].
pub enum CopySource {
    /// A buffer on this node.
    Local(Arc<Buffer>),
    /// A buffer owned by another node.
    Remote {
        buffer: NetworkHandle,
        reader: Arc<dyn PeerReader>,
        /// Dependencies owned by the source node.
        deps: Vec<NetworkHandle>,
    },
}

/// How a copy is carried out, chosen once from the source's locality.
enum CopyPath {
    /// Same native context: one device-side copy command.
    Direct(Arc<Buffer>),
    /// Same node, different context: staged through host memory.
    Local(Arc<Buffer>),
    /// Different node: fetched over the network, then written locally.
    Bruteforce {
        buffer: NetworkHandle,
        reader: Arc<dyn PeerReader>,
        deps: Vec<NetworkHandle>,
    },
}

/// A fixed-size memory region on one device.
pub struct Buffer {
    device: Arc<Device>,
    mem: NativeMem,
    size: u64,
}

impl Buffer {
    /// Allocate `size` bytes, optionally initialised from `initial_data`
    /// (which must be exactly `size` bytes long).
    pub fn create(
        device: &Arc<Device>,
        flags: MemFlags,
        size: u64,
        initial_data: Option<&[u8]>,
    ) -> Result<Arc<Self>, ClError> {
        if size == 0 {
            return Err(ClError::InvalidArgument("buffer size must be non-zero".to_string()));
        }

        // Host pointers never outlive the request, so always copy.
        let host_flags = MemFlags::USE_HOST_PTR | MemFlags::COPY_HOST_PTR;
        let flags = match initial_data {
            Some(data) if data.len() as u64 != size => {
                return Err(ClError::InvalidArgument(format!(
                    "initial data is {} bytes, buffer is {}",
                    data.len(),
                    size
                )))
            }
            Some(_) => flags.difference(MemFlags::USE_HOST_PTR) | MemFlags::COPY_HOST_PTR,
            None => flags.difference(host_flags),
        };

        let mem = device
            .driver()
            .create_buffer(device.context(), flags, size as usize, initial_data)?;
        debug!(device = device.index(), size, "buffer created");

        Ok(Arc::new(Self {
            device: device.clone(),
            mem,
            size,
        }))
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn mem(&self) -> NativeMem {
        self.mem
    }

    fn check_range(&self, what: &str, offset: u64, len: u64) -> Result<(), ClError> {
        check_range(what, offset, len, self.size)
    }

    /// Enqueue a read of `size` bytes at `offset`; the bytes are retrieved
    /// through [`Event::data`].
    pub fn read(&self, offset: u64, size: u64, deps: &[Arc<Event>]) -> Result<Arc<Event>, ClError> {
        self.check_range("read", offset, size)?;
        let wait_list = self.device.wait_list(deps)?;

        let target = HostBuffer::zeroed(size as usize);
        // SAFETY: `target` is registered under the returned token and kept
        // until the event's resources are released, which waits for completion.
        let token = unsafe {
            self.device.driver().enqueue_read(
                self.device.queue(),
                self.mem,
                offset as usize,
                size as usize,
                target.as_mut_ptr(),
                wait_list.tokens(),
            )
        }?;
        self.device.put_result_data(token, target);

        Ok(Event::new(self.device.clone(), token, EventKind::Operation))
    }

    pub fn write(&self, offset: u64, data: Vec<u8>, deps: &[Arc<Event>]) -> Result<Arc<Event>, ClError> {
        self.check_range("write", offset, data.len() as u64)?;
        let wait_list = self.device.wait_list(deps)?;

        let source = HostBuffer::from_vec(data);
        // SAFETY: `source` is registered under the returned token, see `read`.
        let token = unsafe {
            self.device.driver().enqueue_write(
                self.device.queue(),
                self.mem,
                offset as usize,
                source.len(),
                source.as_ptr(),
                wait_list.tokens(),
            )
        }?;
        self.device.put_source_data(token, source);

        Ok(Event::new(self.device.clone(), token, EventKind::Operation))
    }

    /// Fill `size` bytes at `offset` with repetitions of `pattern`.
    pub fn fill(
        &self,
        pattern: &[u8],
        offset: u64,
        size: u64,
        deps: &[Arc<Event>],
    ) -> Result<Arc<Event>, ClError> {
        if !self.device.supports_fill() {
            return Err(ClError::Unsupported(
                "patterned fill requires OpenCL 1.2".to_string(),
            ));
        }
        if pattern.is_empty() {
            return Err(ClError::InvalidArgument("fill pattern is empty".to_string()));
        }
        let pattern_len = pattern.len() as u64;
        if offset % pattern_len != 0 || size % pattern_len != 0 {
            return Err(ClError::InvalidArgument(format!(
                "fill offset and size must be multiples of the {}-byte pattern",
                pattern_len
            )));
        }
        self.check_range("fill", offset, size)?;
        let wait_list = self.device.wait_list(deps)?;

        let token = self.device.driver().enqueue_fill(
            self.device.queue(),
            self.mem,
            pattern,
            offset as usize,
            size as usize,
            wait_list.tokens(),
        )?;

        Ok(Event::new(self.device.clone(), token, EventKind::Operation))
    }

    /// Copy `region` of `source` into this buffer once `deps` complete.
    ///
    /// The bytes written are the same whichever path the copy takes; the
    /// staged paths write all bytes in one command after the source has
    /// been read in full, so a failure never leaves a partial write.
    pub fn copy(
        self: &Arc<Self>,
        source: CopySource,
        region: CopyRegion,
        deps: &[Arc<Event>],
    ) -> Result<Arc<Event>, ClError> {
        self.check_range("copy", region.dst_offset, region.size)?;

        let path = match source {
            CopySource::Local(src) => {
                src.check_range("copy", region.src_offset, region.size)?;
                if src.device.context() == self.device.context() {
                    CopyPath::Direct(src)
                } else {
                    CopyPath::Local(src)
                }
            }
            CopySource::Remote {
                buffer,
                reader,
                deps,
            } => {
                // Same synchronous rejection as a local source.
                let src_size = reader.buffer_size(buffer)?;
                check_range("copy", region.src_offset, region.size, src_size)?;
                CopyPath::Bruteforce {
                    buffer,
                    reader,
                    deps,
                }
            }
        };

        match path {
            CopyPath::Direct(src) => {
                debug!(device = self.device.index(), size = region.size, "direct copy");
                let wait_list = self.device.wait_list(deps)?;
                let token = self.device.driver().enqueue_copy(
                    self.device.queue(),
                    src.mem,
                    self.mem,
                    region,
                    wait_list.tokens(),
                )?;
                Ok(Event::new(self.device.clone(), token, EventKind::Operation))
            }
            CopyPath::Local(src) => {
                debug!(device = self.device.index(), size = region.size, "host-staged copy");
                self.staged_copy(deps, region, move || {
                    src.read(region.src_offset, region.size, &[])?.data()
                })
            }
            CopyPath::Bruteforce {
                buffer,
                reader,
                deps: remote_deps,
            } => {
                debug!(
                    device = self.device.index(),
                    size = region.size,
                    source = %buffer,
                    "cross-node copy"
                );
                self.staged_copy(deps, region, move || {
                    let bytes = reader.read_buffer(buffer, region.src_offset, region.size, &remote_deps)?;
                    if bytes.len() as u64 != region.size {
                        return Err(ClError::Remote {
                            code: 0,
                            message: format!(
                                "peer returned {} bytes, expected {}",
                                bytes.len(),
                                region.size
                            ),
                        });
                    }
                    Ok(bytes)
                })
            }
        }
    }

    /// Run `fetch` and write its result on a staging thread, completing an
    /// internal event when done.
    fn staged_copy<F>(
        self: &Arc<Self>,
        deps: &[Arc<Event>],
        region: CopyRegion,
        fetch: F,
    ) -> Result<Arc<Event>, ClError>
    where
        F: FnOnce() -> Result<Vec<u8>, ClError> + Send + 'static,
    {
        let token = self.device.create_internal_event()?;
        let dst = self.clone();
        let deps: Vec<Arc<Event>> = deps.to_vec();

        let spawned = std::thread::Builder::new()
            .name("rcl-copy".to_string())
            .spawn(move || {
                let result = (|| -> Result<(), ClError> {
                    for dep in &deps {
                        dep.wait()?;
                    }
                    let bytes = fetch()?;
                    dst.write(region.dst_offset, bytes, &[])?.wait()
                })();

                let status = match result {
                    Ok(()) => EventStatus::Complete,
                    Err(e) => {
                        warn!(device = dst.device.index(), "staged copy failed: {}", e);
                        match e.code() {
                            code if code < 0 => EventStatus::Error(code),
                            _ => EventStatus::Error(CL_OUT_OF_RESOURCES),
                        }
                    }
                };
                dst.device.complete_internal_event(token, status);
            });

        if spawned.is_err() {
            self.device
                .complete_internal_event(token, EventStatus::Error(CL_OUT_OF_HOST_MEMORY));
            self.device.release_event(token);
            return Err(DriverError::new("spawn copy thread", CL_OUT_OF_HOST_MEMORY).into());
        }

        Ok(Event::new(self.device.clone(), token, EventKind::Operation))
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        self.device.schedule_memory_deletion(self.mem);
    }
}
