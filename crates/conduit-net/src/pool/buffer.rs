use std::{
    collections::HashSet,
    sync::Mutex,
};

use conduit_support::safe_assert;

use crate::error::ConnectionError;

/// A fixed-size contiguous region on loan from a [`BufferPool`].
///
/// The full region as loaned must be returned exactly once via
/// [`BufferPool::check_in`]; partial returns are not possible since the
/// pool only ever accepts the whole `BorrowedBuffer` back.
pub struct BorrowedBuffer {
    id: usize,
    data: Vec<u8>,
}

impl BorrowedBuffer {
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// A fixed-capacity pool of equally sized byte regions.
///
/// Regions are interchangeable and never zeroed between loans. Exhaustion
/// fails loudly (`PoolExhausted`) rather than blocking the caller; the
/// connection core surfaces that as a fatal, connection-closing error
/// rather than a silent stall.
pub struct BufferPool {
    chunk_size: usize,
    free: Mutex<Vec<(usize, Vec<u8>)>>,
    outstanding: Mutex<HashSet<usize>>,
}

impl BufferPool {
    pub fn new(chunk_size: usize, chunk_count: usize) -> Self {
        let mut free = Vec::with_capacity(chunk_count);
        for id in 0..chunk_count {
            free.push((id, vec![0u8; chunk_size]));
        }
        Self { chunk_size, free: Mutex::new(free), outstanding: Mutex::new(HashSet::with_capacity(chunk_count)) }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn check_out(&self) -> Result<BorrowedBuffer, ConnectionError> {
        let (id, data) = self.free.lock().unwrap().pop().ok_or(ConnectionError::PoolExhausted)?;
        let freshly_outstanding = self.outstanding.lock().unwrap().insert(id);
        safe_assert!(freshly_outstanding, "buffer pool handed out id {id} that was already outstanding");
        Ok(BorrowedBuffer { id, data })
    }

    /// Returns the full loaned triple. Returning a buffer twice (or one
    /// this pool never loaned) is a programming error, detected here
    /// rather than silently corrupting the free list.
    pub fn check_in(&self, buffer: BorrowedBuffer) {
        let BorrowedBuffer { id, data } = buffer;
        let was_outstanding = self.outstanding.lock().unwrap().remove(&id);
        if !was_outstanding {
            safe_assert!(false, "double return of buffer {id} to pool");
            return;
        }
        self.free.lock().unwrap().push((id, data));
    }

    #[cfg(test)]
    pub fn free_count(&self) -> usize {
        self.free.lock().unwrap().len()
    }

    #[cfg(test)]
    pub fn outstanding_count(&self) -> usize {
        self.outstanding.lock().unwrap().len()
    }
}
