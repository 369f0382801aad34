use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;

/// Owns a serialized message body and hands out views of it. Shared views
/// are reference counted and stay valid after the controller is disposed;
/// detached views are private copies safe to hold across a dispose that
/// recycles the underlying storage.
#[derive(Debug)]
pub struct BufferController {
    buf: Bytes,
    disposed: AtomicBool,
}

impl BufferController {
    pub fn new(buf: Bytes) -> Self {
        BufferController {
            buf,
            disposed: AtomicBool::new(false),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// A zero-copy view of the body.
    pub fn share(&self) -> Bytes {
        assert!(!self.is_disposed(), "buffer already disposed");
        self.buf.clone()
    }

    /// A private copy of the body.
    pub fn detach(&self) -> Bytes {
        assert!(!self.is_disposed(), "buffer already disposed");
        Bytes::copy_from_slice(&self.buf)
    }

    /// Release the controller. Disposing twice is a lifecycle bug.
    pub fn dispose(&self) {
        let was_disposed = self.disposed.swap(true, Ordering::AcqRel);
        assert!(!was_disposed, "buffer disposed twice");
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}
