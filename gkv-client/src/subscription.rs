//! # Subscription Channel
//!
//! Purpose: Hold the dedicated socket the node pushes CQ frames on, and run
//! the single delivery thread that reads them and dispatches to listeners.
//!
//! Losing the socket fails every running CQ once. Shutdown closes the
//! socket, which unblocks the reader, and waits at most the configured
//! grace period before detaching the thread.

use std::io::BufRead;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use gkv_common::{read_response, FrameError, PushFrame, RespValue, CMD_SUBSCRIBE};

use crate::client::{ClientError, ClientResult};
use crate::cq::CqRegistry;
use crate::pool::{Connection, Timeouts};

const DELIVERY_THREAD: &str = "gkv-cq-delivery";

struct Worker {
    handle: JoinHandle<()>,
    finished: mpsc::Receiver<()>,
}

pub(crate) struct SubscriptionChannel {
    server: SocketAddr,
    stream: TcpStream,
    alive: Arc<AtomicBool>,
    shutting_down: Arc<AtomicBool>,
    worker: Mutex<Option<Worker>>,
}

impl SubscriptionChannel {
    /// Subscribes `client_id` on `server` and starts the delivery thread.
    pub fn open(
        server: SocketAddr,
        client_id: &str,
        timeouts: Timeouts,
        registry: Arc<CqRegistry>,
    ) -> ClientResult<Self> {
        let mut conn = Connection::open(server, timeouts, 0)?;
        match conn.exec(&[CMD_SUBSCRIBE, client_id.as_bytes()])? {
            RespValue::Simple(_) => {}
            RespValue::Error(message) => return Err(ClientError::from_reply(message)),
            _ => return Err(ClientError::UnexpectedResponse),
        }

        let reader = conn.into_reader();
        let stream = reader.get_ref().try_clone()?;
        // Pushes arrive whenever the node has them; only shutdown ends the wait.
        stream.set_read_timeout(None)?;

        let alive = Arc::new(AtomicBool::new(true));
        let shutting_down = Arc::new(AtomicBool::new(false));
        let (done_tx, finished) = mpsc::channel::<()>();
        let handle = {
            let alive = alive.clone();
            let shutting_down = shutting_down.clone();
            thread::Builder::new()
                .name(DELIVERY_THREAD.to_string())
                .spawn(move || {
                    deliver_loop(reader, &registry, &alive, &shutting_down);
                    drop(done_tx);
                })?
        };

        info!(%server, client_id, "subscription channel open");
        Ok(SubscriptionChannel {
            server,
            stream,
            alive,
            shutting_down,
            worker: Mutex::new(Some(Worker { handle, finished })),
        })
    }

    pub fn server(&self) -> SocketAddr {
        self.server
    }

    /// True until the socket is lost or shut down.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Closes the socket and waits up to `grace` for the delivery thread.
    pub fn shutdown(&self, grace: Duration) {
        self.shutting_down.store(true, Ordering::Release);
        if let Err(err) = self.stream.shutdown(Shutdown::Both) {
            debug!(error = %err, "subscription socket already closed");
        }

        let worker = match self.worker.lock().take() {
            Some(worker) => worker,
            None => return,
        };
        if worker.handle.thread().id() == thread::current().id() {
            // Last client handle dropped inside a listener callback.
            return;
        }
        match worker.finished.recv_timeout(grace) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if worker.handle.join().is_err() {
                    warn!("delivery thread panicked");
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(?grace, "delivery thread still busy after grace period, detaching");
            }
        }
    }
}

fn deliver_loop<R: BufRead>(
    mut reader: R,
    registry: &CqRegistry,
    alive: &AtomicBool,
    shutting_down: &AtomicBool,
) {
    let mut line_buf = Vec::with_capacity(128);
    loop {
        let value = match read_response(&mut reader, &mut line_buf) {
            Ok(value) => value,
            Err(err) => {
                alive.store(false, Ordering::Release);
                if shutting_down.load(Ordering::Acquire) {
                    debug!("delivery thread stopping");
                } else {
                    let reason = match err {
                        FrameError::Eof => "closed by server".to_string(),
                        other => other.to_string(),
                    };
                    warn!(%reason, "subscription channel lost");
                    registry.fail_all(&format!("subscription channel lost: {}", reason));
                }
                return;
            }
        };

        match PushFrame::from_resp(value) {
            Ok(frame) => registry.deliver(frame),
            Err(err) => warn!(error = %err, "unrecognised push frame dropped"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Codec;
    use crate::config::SerializationStrategy;
    use std::io::Cursor;

    fn registry() -> CqRegistry {
        CqRegistry::new(Arc::new(Codec::new(&SerializationStrategy::Manual).unwrap()))
    }

    #[test]
    fn eof_fails_nothing_when_empty() {
        let registry = registry();
        let alive = AtomicBool::new(true);
        let shutting_down = AtomicBool::new(false);
        deliver_loop(Cursor::new(Vec::new()), &registry, &alive, &shutting_down);
        assert!(!alive.load(Ordering::SeqCst));
        assert!(registry.running_names().is_empty());
    }

    #[test]
    fn garbage_frames_are_skipped_until_eof() {
        let registry = registry();
        let alive = AtomicBool::new(true);
        let shutting_down = AtomicBool::new(true);
        let input = b"*1\r\n$4\r\nNOPE\r\n+OK\r\n".to_vec();
        deliver_loop(Cursor::new(input), &registry, &alive, &shutting_down);
        assert!(!alive.load(Ordering::SeqCst));
    }

    #[test]
    fn oversized_bulk_header_ends_delivery() {
        let registry = registry();
        let alive = AtomicBool::new(true);
        let shutting_down = AtomicBool::new(false);
        let input = b"*3\r\n$8\r\nCQ_ERROR\r\n$99999999999\r\n".to_vec();
        deliver_loop(Cursor::new(input), &registry, &alive, &shutting_down);
        assert!(!alive.load(Ordering::SeqCst));
    }
}
