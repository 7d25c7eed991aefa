//! Host memory filled in by queued engine-to-host copies.

use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;

/// A shared, fixed-length host buffer.
///
/// Clones share the same bytes. A queued read
/// ([`Context::async_read_mem`](crate::Context::async_read_mem)) hands one
/// clone to the transport, which fills it when the copy runs. The contents
/// are only meaningful once that request has completed successfully.
#[derive(Clone, Default)]
pub struct HostBuffer {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl HostBuffer {
    /// A buffer of `len` zero bytes.
    pub fn zeroed(len: usize) -> Self {
        Self::from(vec![0u8; len])
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Copies the current contents out.
    pub fn to_vec(&self) -> Vec<u8> {
        self.lock().clone()
    }

    /// Replaces the whole contents with `src`.
    ///
    /// Returns false, leaving the buffer untouched, if the lengths differ.
    pub fn fill_from(&self, src: &[u8]) -> bool {
        let mut bytes = self.lock();
        if bytes.len() != src.len() {
            return false;
        }
        bytes.copy_from_slice(src);
        true
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<u8>> {
        self.bytes.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl From<Vec<u8>> for HostBuffer {
    fn from(bytes: Vec<u8>) -> Self {
        Self { bytes: Arc::new(Mutex::new(bytes)) }
    }
}

impl fmt::Debug for HostBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostBuffer").field("len", &self.len()).finish()
    }
}
