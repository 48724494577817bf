//! Recyclable ingress buffers.
//!
//! The read pump copies each inbound frame into a buffer and hands it to the
//! message queue; workers return buffers to a bounded free list. When the
//! free list is full the buffer is simply dropped, and when it is empty a
//! fresh one is allocated at the configured frame bound.

use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};

use crate::client::Client;

pub(crate) const FREE_LIST_CAPACITY: usize = 8192;

/// One inbound frame plus the session it arrived on.
pub(crate) struct IngressBuffer {
    data: Vec<u8>,
    client: Option<Arc<Client>>,
}

impl IngressBuffer {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            client: None,
        }
    }

    pub(crate) fn assign(&mut self, client: Arc<Client>) {
        self.client = Some(client);
    }

    pub(crate) fn fill(&mut self, frame: &[u8]) {
        self.data.extend_from_slice(frame);
    }

    pub(crate) fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub(crate) fn len(&self) -> usize {
        self.data.len()
    }

    pub(crate) fn take_client(&mut self) -> Option<Arc<Client>> {
        self.client.take()
    }

    /// Detach the session reference and clear the bytes so a pooled buffer
    /// never pins a disconnected client.
    pub(crate) fn reset(&mut self) {
        self.data.clear();
        self.client = None;
    }
}

#[derive(Clone)]
pub(crate) struct BufferPool {
    free_tx: Sender<IngressBuffer>,
    free_rx: Receiver<IngressBuffer>,
    buffer_capacity: usize,
}

impl BufferPool {
    pub(crate) fn new(buffer_capacity: usize) -> Self {
        Self::bounded(buffer_capacity, FREE_LIST_CAPACITY)
    }

    fn bounded(buffer_capacity: usize, free_list_capacity: usize) -> Self {
        let (free_tx, free_rx) = crossbeam_channel::bounded(free_list_capacity);
        Self {
            free_tx,
            free_rx,
            buffer_capacity,
        }
    }

    pub(crate) fn acquire(&self) -> IngressBuffer {
        match self.free_rx.try_recv() {
            Ok(buf) => buf,
            Err(_) => IngressBuffer::with_capacity(self.buffer_capacity),
        }
    }

    /// Return a buffer to the free list; on overflow the buffer becomes
    /// garbage.
    pub(crate) fn release(&self, mut buf: IngressBuffer) {
        buf.reset();
        // On a full list the buffer is dropped on the floor.
        let _ = self.free_tx.try_send(buf);
    }

    #[cfg(test)]
    fn free_len(&self) -> usize {
        self.free_rx.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_reuses_released_buffers() {
        let pool = BufferPool::new(64);
        let mut buf = pool.acquire();
        buf.fill(b"hello");
        assert_eq!(buf.bytes(), b"hello");
        pool.release(buf);
        assert_eq!(pool.free_len(), 1);

        let buf = pool.acquire();
        assert_eq!(buf.len(), 0, "released buffers come back empty");
        assert_eq!(pool.free_len(), 0);
    }

    #[test]
    fn overflow_discards_silently() {
        let pool = BufferPool::bounded(8, 2);
        pool.release(pool.acquire());
        pool.release(pool.acquire());
        // Third release exceeds the free-list bound.
        pool.release(IngressBuffer::with_capacity(8));
        assert_eq!(pool.free_len(), 2);
    }

    #[test]
    fn reset_clears_bytes() {
        let mut buf = IngressBuffer::with_capacity(16);
        buf.fill(b"abc");
        buf.reset();
        assert_eq!(buf.len(), 0);
        assert!(buf.take_client().is_none());
    }
}
