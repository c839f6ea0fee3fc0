use crate::packet::decode_packet;
use crate::reader::{Reader, StreamState};
use crate::stream::{Stream, StreamCore};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Upper bound of packets decoded per scheduler tick, so a single memory
///  reader cannot monopolise a worker thread.
const PACKETS_PER_TICK: usize = 64;

/// Reader that walks a caller-provided buffer holding a concatenation of
///  SPEAD packets. When the buffer is exhausted it synthesises an
///  end-of-stream, so a stream fed only from memory terminates on its own.
pub struct MemReader {
    inner: Arc<MemReaderInner>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

struct MemReaderInner {
    core: Weak<StreamCore>,
    wake: Notify,
    /// Taken by the reader task on startup.
    data: Mutex<Option<Vec<u8>>>,
}

impl MemReader {
    pub fn new(stream: &Stream, data: Vec<u8>) -> Arc<MemReader> {
        Arc::new(MemReader {
            inner: Arc::new(MemReaderInner {
                core: Arc::downgrade(stream.core()),
                wake: Notify::new(),
                data: Mutex::new(Some(data)),
            }),
            handle: Mutex::new(None),
        })
    }
}

#[async_trait]
impl Reader for MemReader {
    fn start(&self) -> Option<oneshot::Receiver<anyhow::Result<()>>> {
        let inner = self.inner.clone();
        *self.handle.lock().unwrap() = Some(tokio::spawn(run(inner)));
        None
    }

    fn state_change(&self, _state: StreamState) {
        self.inner.wake.notify_one();
    }

    async fn join(&self) {
        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("memory reader task failed: {}", e);
            }
        }
    }
}

enum Next {
    Stopped,
    Paused,
    Tick,
}

async fn run(inner: Arc<MemReaderInner>) {
    let data = inner.data.lock().unwrap().take().unwrap_or_default();
    let mut pos = 0;

    loop {
        let Some(core) = inner.core.upgrade() else {
            return;
        };
        let next = {
            let mut shared = core.lock();
            let assembler = &mut shared.assembler;

            let mut decoded = 0;
            while decoded < PACKETS_PER_TICK
                && pos < data.len()
                && !assembler.is_stopped()
                && !assembler.is_paused()
            {
                match decode_packet(&data[pos..]) {
                    Ok((consumed, header)) => {
                        let payload =
                            &data[pos + header.payload_start..][..header.payload_length as usize];
                        assembler.add_packet(&header, payload);
                        pos += consumed;
                        decoded += 1;
                    }
                    Err(e) => {
                        warn!("stopping at undecodable packet in memory buffer: {}", e);
                        pos = data.len();
                    }
                }
            }

            if pos >= data.len() && !assembler.is_stopped() && !assembler.is_paused() {
                debug!("memory buffer exhausted - synthesising end of stream");
                assembler.stop_received();
            }

            if assembler.is_stopped() {
                Next::Stopped
            }
            else if assembler.is_paused() {
                Next::Paused
            }
            else {
                Next::Tick
            }
        };
        drop(core);

        match next {
            Next::Stopped => return,
            Next::Paused => inner.wake.notified().await,
            Next::Tick => tokio::task::yield_now().await,
        }
    }
}
