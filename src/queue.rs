//! Inbound message queue.
//!
//! A fixed pool of workers drains the serve channel and runs each session's
//! receive handler. Handler output flows back through the pool: a non-empty
//! reply is echoed to the originating sid, an error kicks it. The read pump
//! enqueues with `try_send`; a full serve channel means the node is failing
//! under load and the offending client is disconnected instead of blocking
//! the read path.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::buffer::{BufferPool, IngressBuffer};
use crate::pool::Pool;

pub(crate) const SERVE_QUEUE_CAPACITY: usize = 8192;

#[derive(Clone)]
pub(crate) struct MessageQueue {
    serve_tx: mpsc::Sender<IngressBuffer>,
    buffers: BufferPool,
}

impl MessageQueue {
    /// Create the queue and start `worker_count` workers.
    pub(crate) fn spawn(pool: Pool, worker_count: usize, buffer_capacity: usize) -> Self {
        let (serve_tx, serve_rx) = mpsc::channel(SERVE_QUEUE_CAPACITY);
        let serve_rx = Arc::new(Mutex::new(serve_rx));
        let buffers = BufferPool::new(buffer_capacity);
        for _ in 0..worker_count {
            tokio::spawn(worker(serve_rx.clone(), pool.clone(), buffers.clone()));
        }
        Self { serve_tx, buffers }
    }

    pub(crate) fn acquire(&self) -> IngressBuffer {
        self.buffers.acquire()
    }

    /// Non-blocking hand-off from the read pump.
    pub(crate) fn try_serve(&self, buf: IngressBuffer) -> Result<(), ()> {
        self.serve_tx.try_send(buf).map_err(|_| ())
    }
}

async fn worker(
    serve_rx: Arc<Mutex<mpsc::Receiver<IngressBuffer>>>,
    pool: Pool,
    buffers: BufferPool,
) {
    loop {
        let buf = {
            let mut rx = serve_rx.lock().await;
            match rx.recv().await {
                Some(buf) => buf,
                None => return,
            }
        };
        serve(&pool, &buffers, buf).await;
    }
}

async fn serve(pool: &Pool, buffers: &BufferPool, mut buf: IngressBuffer) {
    if let Some(client) = buf.take_client() {
        if let Some(handler) = client.receive_handler() {
            match handler(buf.bytes()) {
                Ok(reply) => {
                    if !reply.is_empty() {
                        pool.to_sid(client.socket_id(), Bytes::from(reply)).await;
                    }
                }
                Err(err) => {
                    debug!(sid = %client.socket_id(), %err, "receive handler failed, kicking");
                    pool.kick_sid(client.socket_id()).await;
                }
            }
        }
    }
    buffers.release(buf);
}
