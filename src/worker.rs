//! The background ingestion consumer. A single worker thread owns the
//! message queue, accumulates batches, and hands them to the transport.
//! The thread exits only on the shutdown control message (or when every
//! producer is gone), and drains the queue before doing so.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, TryRecvError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::batch::{BatchAdd, MessageBatch};
use crate::config::OnError;
use crate::message::Message;
use crate::transport::Transport;

/// Commands carried on the control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Control {
    Flush,
    Shutdown,
}

/// How long a blocked receive waits before re-checking the control channel.
const RECEIVE_WAIT: Duration = Duration::from_millis(100);

pub(crate) struct Worker {
    messages: Receiver<Message>,
    control: Receiver<Control>,
    transport: Arc<dyn Transport>,
    api_key: String,
    batch: MessageBatch,
    /// Shared with the client; decremented as messages are consumed.
    queue_depth: Arc<AtomicUsize>,
    /// Set while a transport request is in flight; `flush` waits on it.
    in_flight: Arc<AtomicBool>,
    on_error: Option<OnError>,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        messages: Receiver<Message>,
        control: Receiver<Control>,
        transport: Arc<dyn Transport>,
        api_key: String,
        batch_size: usize,
        queue_depth: Arc<AtomicUsize>,
        in_flight: Arc<AtomicBool>,
        on_error: Option<OnError>,
    ) -> Self {
        Worker {
            messages,
            control,
            transport,
            api_key,
            batch: MessageBatch::new(batch_size),
            queue_depth,
            in_flight,
            on_error,
        }
    }

    /// Start the worker thread. The thread runs until shutdown and never
    /// propagates panics to the host.
    pub fn spawn(self) -> std::io::Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name("posthog-worker".to_owned())
            .spawn(move || {
                let result = std::panic::catch_unwind(AssertUnwindSafe(|| self.run()));
                if result.is_err() {
                    log::error!(target: "posthog", "worker thread panicked; ingestion stopped");
                }
            })
    }

    fn run(mut self) {
        log::debug!(target: "posthog", "worker started");
        loop {
            match self.control.try_recv() {
                Ok(Control::Flush) => {
                    self.drain_pending();
                    self.flush_batch();
                    continue;
                }
                Ok(Control::Shutdown) => {
                    self.drain_pending();
                    self.flush_batch();
                    log::debug!(target: "posthog", "worker stopped");
                    return;
                }
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Disconnected) => {
                    self.drain_pending();
                    self.flush_batch();
                    return;
                }
            }

            match self.messages.recv_timeout(RECEIVE_WAIT) {
                Ok(message) => {
                    self.handle_message(message);
                    // Take whatever else is already queued, then flush the
                    // partial batch so a quiet queue never delays delivery.
                    self.drain_pending();
                    self.flush_batch();
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    self.flush_batch();
                    return;
                }
            }
        }
    }

    /// Consume every message already sitting in the queue, without blocking.
    fn drain_pending(&mut self) {
        while let Ok(message) = self.messages.try_recv() {
            self.handle_message(message);
        }
    }

    fn handle_message(&mut self, message: Message) {
        self.queue_depth.fetch_sub(1, Ordering::SeqCst);
        match self.batch.add(&message) {
            BatchAdd::Added => {
                if self.batch.full() {
                    self.flush_batch();
                }
            }
            BatchAdd::BatchFull => {
                self.flush_batch();
                match self.batch.add(&message) {
                    BatchAdd::Added => {
                        if self.batch.full() {
                            self.flush_batch();
                        }
                    }
                    BatchAdd::MessageTooLarge { bytes } => self.report_too_large(bytes),
                    BatchAdd::BatchFull => {
                        // Cannot happen with an empty batch; drop rather
                        // than loop.
                        self.report(-1, "message rejected by empty batch");
                    }
                }
            }
            BatchAdd::MessageTooLarge { bytes } => self.report_too_large(bytes),
        }
    }

    fn flush_batch(&mut self) {
        if self.batch.is_empty() {
            return;
        }
        self.in_flight.store(true, Ordering::SeqCst);
        let payload = self.batch.payload(&self.api_key);
        log::debug!(
            target: "posthog",
            "delivering batch of {} message(s)",
            self.batch.len()
        );
        let response = self.transport.send_batch(&payload);
        if !response.success() {
            self.report(response.status, &response.error_message());
        }
        self.batch.clear();
        self.in_flight.store(false, Ordering::SeqCst);
    }

    fn report_too_large(&self, bytes: usize) {
        self.report(-1, &format!("message too large: {bytes} bytes"));
    }

    fn report(&self, status: i32, message: &str) {
        log::warn!(target: "posthog", "{message}");
        if let Some(on_error) = &self.on_error {
            on_error(status, message);
        }
    }
}
