//! Descriptor binding.

use crate::error::DispatchError;
use crate::selector::{Selector, SelectorListener, POLLIN};
use crate::sys;

use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Binds an open file descriptor to the core.
///
/// An `FdBinder` wraps a descriptor the caller already opened: it
/// offers `read`/`write`/`close` with the OS error mapped into the
/// dispatch taxonomy, and attaches the descriptor to a
/// [`Selector`] with a listener and a readiness mask. Dropping the
/// binder detaches and closes.
pub struct FdBinder {
    fd: RawFd,
    closed: AtomicBool,
    attach: Mutex<Option<Attachment>>,
}

struct Attachment {
    selector: Arc<Selector>,
    listener: Arc<dyn SelectorListener>,
}

impl FdBinder {
    /// Takes ownership of `fd`.
    pub fn new(fd: RawFd) -> FdBinder {
        FdBinder {
            fd,
            closed: AtomicBool::new(false),
            attach: Mutex::new(None),
        }
    }

    /// The wrapped descriptor.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Reads into `buffer`, returning the byte count.
    pub fn read(&self, buffer: &mut [u8]) -> Result<usize, DispatchError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DispatchError::Invalid("descriptor is closed"));
        }
        let n = sys::sys_read(self.fd, buffer);
        if n < 0 {
            return Err(DispatchError::last_os_error());
        }
        Ok(n as usize)
    }

    /// Writes `buffer`, returning the byte count.
    pub fn write(&self, buffer: &[u8]) -> Result<usize, DispatchError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DispatchError::Invalid("descriptor is closed"));
        }
        let n = sys::sys_write(self.fd, buffer);
        if n < 0 {
            return Err(DispatchError::last_os_error());
        }
        Ok(n as usize)
    }

    /// Attaches the descriptor to `selector`, detaching from any prior
    /// one first. `listener` is notified of the events in `mask` on the
    /// selector's thread.
    pub fn set_selector(
        &self,
        listener: Arc<dyn SelectorListener>,
        selector: &Arc<Selector>,
        mask: i16,
    ) -> Result<(), DispatchError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DispatchError::Invalid("descriptor is closed"));
        }

        let mut attach = self.attach.lock().unwrap();
        if let Some(prev) = attach.take() {
            let _ = prev.selector.remove_listener(self.fd, &prev.listener);
        }
        selector.add_listener(self.fd, mask, listener.clone(), 0);
        *attach = Some(Attachment {
            selector: selector.clone(),
            listener,
        });
        Ok(())
    }

    /// Attaches for readability, the common case.
    pub fn listen(
        &self,
        listener: Arc<dyn SelectorListener>,
        selector: &Arc<Selector>,
    ) -> Result<(), DispatchError> {
        self.set_selector(listener, selector, POLLIN)
    }

    /// Detaches from the current selector, if any.
    pub fn detach(&self) {
        let mut attach = self.attach.lock().unwrap();
        if let Some(prev) = attach.take() {
            let _ = prev.selector.remove_listener(self.fd, &prev.listener);
        }
    }

    /// Detaches and closes the descriptor. A second close is a no-op.
    pub fn close(&self) -> Result<(), DispatchError> {
        self.detach();
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if sys::sys_close(self.fd) < 0 {
            return Err(DispatchError::last_os_error());
        }
        Ok(())
    }
}

impl Drop for FdBinder {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
