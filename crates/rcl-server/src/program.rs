//! Device programs and the kernels created from them.
//!
//! Compilation itself is left to the native runtime; this layer forwards
//! the source or binary, formats build failures and hands out kernels.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::device::Device;
use crate::driver::{NativeKernel, NativeProgram, CL_BUILD_PROGRAM_FAILURE};
use crate::error::ClError;

pub struct Program {
    device: Arc<Device>,
    native: NativeProgram,
    built: AtomicBool,
}

impl Program {
    pub fn from_source(device: &Arc<Device>, source: &str) -> Result<Arc<Self>, ClError> {
        if source.trim().is_empty() {
            return Err(ClError::InvalidArgument("program source is empty".to_string()));
        }
        let native = device
            .driver()
            .create_program_with_source(device.context(), source)?;
        Ok(Self::wrap(device, native))
    }

    pub fn from_binary(device: &Arc<Device>, binary: &[u8]) -> Result<Arc<Self>, ClError> {
        if binary.is_empty() {
            return Err(ClError::InvalidArgument("program binary is empty".to_string()));
        }
        let native = device
            .driver()
            .create_program_with_binary(device.context(), device.native(), binary)?;
        Ok(Self::wrap(device, native))
    }

    fn wrap(device: &Arc<Device>, native: NativeProgram) -> Arc<Self> {
        Arc::new(Self {
            device: device.clone(),
            native,
            built: AtomicBool::new(false),
        })
    }

    /// Compile for the owning device. A compile error is returned as
    /// `BuildFailure` carrying the native build log.
    pub fn build(&self, options: &str) -> Result<(), ClError> {
        let driver = self.device.driver();
        match driver.build_program(self.native, self.device.native(), options) {
            Ok(()) => {
                self.built.store(true, Ordering::Release);
                debug!(device = self.device.index(), "program built");
                Ok(())
            }
            Err(e) if e.code == CL_BUILD_PROGRAM_FAILURE => {
                let log = driver
                    .program_build_log(self.native, self.device.native())
                    .unwrap_or_else(|log_err| format!("<build log unavailable: {}>", log_err));
                Err(ClError::build_failure(&log))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn is_built(&self) -> bool {
        self.built.load(Ordering::Acquire)
    }

    pub fn binary(&self) -> Result<Vec<u8>, ClError> {
        if !self.is_built() {
            return Err(ClError::ProtocolMisuse(
                "binary requested before the program was built".to_string(),
            ));
        }
        let binary = self.device.driver().program_binary(self.native)?;
        if binary.is_empty() {
            return Err(ClError::ProtocolMisuse("program has no binary".to_string()));
        }
        Ok(binary)
    }

    pub fn create_kernel(self: &Arc<Self>, name: &str) -> Result<Arc<Kernel>, ClError> {
        let native = self.device.driver().create_kernel(self.native, name)?;
        Ok(Arc::new(Kernel {
            program: self.clone(),
            native,
            name: name.to_string(),
        }))
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }
}

impl Drop for Program {
    fn drop(&mut self) {
        if let Err(e) = self.device.driver().release_program(self.native) {
            warn!("{}", e);
        }
    }
}

/// A kernel entry point. Argument setting and launch are not exposed.
pub struct Kernel {
    program: Arc<Program>,
    native: NativeKernel,
    name: String,
}

impl Kernel {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn program(&self) -> &Arc<Program> {
        &self.program
    }
}

impl Drop for Kernel {
    fn drop(&mut self) {
        if let Err(e) = self.program.device.driver().release_kernel(self.native) {
            warn!("{}", e);
        }
    }
}
