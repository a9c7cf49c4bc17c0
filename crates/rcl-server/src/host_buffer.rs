use std::cell::UnsafeCell;
use std::sync::Arc;

/// Host memory handed to the driver as the source or destination of an
/// asynchronous transfer. The allocation never moves, so the pointers stay
/// valid for as long as the buffer is alive.
pub struct HostBuffer {
    bytes: UnsafeCell<Box<[u8]>>,
}

// Access to the bytes is ordered by event completion: the driver writes
// through the raw pointer before the event completes, readers copy after.
unsafe impl Send for HostBuffer {}
unsafe impl Sync for HostBuffer {}

impl HostBuffer {
    pub fn zeroed(len: usize) -> Arc<Self> {
        Self::from_vec(vec![0u8; len])
    }

    pub fn from_vec(bytes: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            bytes: UnsafeCell::new(bytes.into_boxed_slice()),
        })
    }

    pub fn len(&self) -> usize {
        // SAFETY: the length is never written after construction.
        unsafe { (&(*self.bytes.get())).len() }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_ptr(&self) -> *const u8 {
        // SAFETY: only the address is taken.
        unsafe { (*self.bytes.get()).as_ptr() }
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        // SAFETY: only the address is taken.
        unsafe { (*self.bytes.get()).as_mut_ptr() }
    }

    /// Copy the contents out.
    ///
    /// # Safety
    /// No native command may be writing into this buffer, i.e. the event it
    /// was registered under has completed.
    pub unsafe fn to_vec(&self) -> Vec<u8> {
        unsafe { (*self.bytes.get()).to_vec() }
    }
}
