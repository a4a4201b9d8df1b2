use std::sync::Mutex;

use crate::{error::ConnectionError, pool::buffer::BorrowedBuffer};

/// What a [`OpContext`] currently has bound to its pending operation, if
/// anything.
enum Binding {
    None,
    /// A send in flight: an offset/length window into the connection's
    /// staging buffer, advanced across partial non-blocking writes.
    Send { offset: usize, len: usize },
    /// A receive in flight: the borrowed buffer the read will fill.
    Recv(BorrowedBuffer),
}

/// A reusable descriptor bundling a pending socket operation's buffer
/// binding. Exists to bound per-operation allocation; the socket and
/// completion-listener references a context would otherwise carry are
/// realized by the reactor registration (`Registration`/`Token`) instead of
/// stored here, since a readiness-based reactor associates the handler with
/// the registration, not with the individual operation.
pub struct OpContext {
    binding: Binding,
}

impl OpContext {
    fn new() -> Self {
        Self { binding: Binding::None }
    }

    pub(crate) fn bind_send(&mut self, offset: usize, len: usize) {
        self.binding = Binding::Send { offset, len };
    }

    pub(crate) fn send_binding(&self) -> Option<(usize, usize)> {
        match self.binding {
            Binding::Send { offset, len } => Some((offset, len)),
            _ => None,
        }
    }

    pub(crate) fn bind_recv(&mut self, buffer: BorrowedBuffer) {
        self.binding = Binding::Recv(buffer);
    }

    pub(crate) fn recv_buffer_mut(&mut self) -> Option<&mut BorrowedBuffer> {
        match &mut self.binding {
            Binding::Recv(buffer) => Some(buffer),
            _ => None,
        }
    }

    /// Detaches and returns the bound receive buffer, leaving the context
    /// unbound so the next arm can rebind it.
    pub(crate) fn take_recv_buffer(&mut self) -> Option<BorrowedBuffer> {
        match std::mem::replace(&mut self.binding, Binding::None) {
            Binding::Recv(buffer) => Some(buffer),
            other => {
                self.binding = other;
                None
            }
        }
    }

    /// Clears the binding, returning any still-attached receive buffer so
    /// the caller can check it back into the buffer pool.
    fn reset(&mut self) -> Option<BorrowedBuffer> {
        match std::mem::replace(&mut self.binding, Binding::None) {
            Binding::Recv(buffer) => Some(buffer),
            _ => None,
        }
    }
}

/// A small pool of reusable [`OpContext`]s.
///
/// `get()` yields a context with no buffer bound; `put()` detaches any
/// binding before storing, returning a still-bound receive buffer (if any)
/// so the caller can release it to the buffer pool.
pub struct ContextPool {
    free: Mutex<Vec<OpContext>>,
}

impl ContextPool {
    pub fn new(size: usize) -> Self {
        let mut free = Vec::with_capacity(size);
        for _ in 0..size {
            free.push(OpContext::new());
        }
        Self { free: Mutex::new(free) }
    }

    pub fn get(&self) -> Result<OpContext, ConnectionError> {
        self.free.lock().unwrap().pop().ok_or(ConnectionError::PoolExhausted)
    }

    pub fn put(&self, mut ctx: OpContext) -> Option<BorrowedBuffer> {
        let leftover = ctx.reset();
        self.free.lock().unwrap().push(ctx);
        leftover
    }

    #[cfg(test)]
    pub fn free_count(&self) -> usize {
        self.free.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_yields_unbound_context() {
        let pool = ContextPool::new(2);
        let ctx = pool.get().unwrap();
        assert!(ctx.send_binding().is_none());
    }

    #[test]
    fn put_clears_bound_send_offset() {
        let pool = ContextPool::new(1);
        let mut ctx = pool.get().unwrap();
        ctx.bind_send(4, 16);
        assert_eq!(pool.put(ctx), None);
        assert_eq!(pool.free_count(), 1);
    }

    #[test]
    fn put_returns_leftover_receive_buffer() {
        use crate::pool::buffer::BufferPool;

        let buffers = BufferPool::new(8, 1);
        let pool = ContextPool::new(1);
        let mut ctx = pool.get().unwrap();
        ctx.bind_recv(buffers.check_out().unwrap());
        let leftover = pool.put(ctx);
        assert!(leftover.is_some());
        buffers.check_in(leftover.unwrap());
        assert_eq!(buffers.free_count(), 1);
    }
}
