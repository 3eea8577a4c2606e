//! Single in-flight request dispatcher.
//!
//! The device handles exactly one exchange at a time. The pending slot lives
//! in the shared [`DeviceSession`](crate::session::DeviceSession); replies are
//! fed in by the notification reader through [`Dispatcher::on_frame_received`]
//! and correlated against the pending request's expected shape.

use crate::protocol::{Command, Frame, FrameAssembler, Response};
use crate::session::{PendingRequest, SharedSession};
use crate::transport::Transport;
use crate::{Error, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// Receives the reply of an enqueued request.
#[derive(Debug)]
pub struct PendingHandle {
    tag: u64,
    receiver: oneshot::Receiver<Result<Response>>,
}

impl PendingHandle {
    pub fn tag(&self) -> u64 {
        self.tag
    }
}

pub struct Dispatcher {
    session: SharedSession,
    transport: Arc<dyn Transport>,
    assembler: Mutex<FrameAssembler>,
    timeout: Duration,
    retries: u8,
}

impl Dispatcher {
    pub fn new(
        session: SharedSession,
        transport: Arc<dyn Transport>,
        timeout: Duration,
        retries: u8,
    ) -> Self {
        Self {
            session,
            transport,
            assembler: Mutex::new(FrameAssembler::new()),
            timeout,
            retries,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Claims the pending slot for `command` and writes its request frame.
    ///
    /// Fails with [`Error::Busy`] while another request is pending.
    pub async fn enqueue(&self, command: Command) -> Result<PendingHandle> {
        self.enqueue_tagged(command, None).await
    }

    async fn enqueue_tagged(&self, command: Command, tag: Option<u64>) -> Result<PendingHandle> {
        let request = command.request()?;
        let handle = {
            // lock order: assembler, then session
            let mut assembler = self.assembler.lock();
            let mut session = self.session.lock();
            if !session.state().accepts_requests() {
                return Err(Error::NotConnected);
            }
            if session.pending.is_some() {
                return Err(Error::Busy);
            }
            let tag = tag.unwrap_or_else(|| session.next_tag());
            let (reply, receiver) = oneshot::channel();
            session.pending = Some(PendingRequest {
                tag,
                command,
                issued_at: Instant::now(),
                reply,
            });
            assembler.clear();
            PendingHandle { tag, receiver }
        };
        log::trace!("-> {command} {request:02X?}");
        if let Err(err) = self.transport.write(&request).await {
            self.release(handle.tag);
            return Err(err.into());
        }
        Ok(handle)
    }

    /// Waits for the reply of `handle` until the request deadline.
    pub async fn wait(&self, handle: PendingHandle) -> Result<Response> {
        let tag = handle.tag;
        match tokio::time::timeout(self.timeout, handle.receiver).await {
            Ok(Ok(result)) => result,
            // the pending request was dropped by cancel_pending
            Ok(Err(_)) => Err(Error::Cancelled),
            Err(_) => {
                self.release(tag);
                log::debug!(
                    "Request {tag} timed out after {}",
                    humantime::format_duration(self.timeout)
                );
                Err(Error::Timeout(self.timeout))
            }
        }
    }

    /// Runs `command` to completion, retrying timeouts with the same tag.
    ///
    /// Exhausting the retries counts as one consecutive timeout of the session.
    pub async fn request(&self, command: Command) -> Result<Response> {
        let mut tag = None;
        let mut attempt = 0;
        loop {
            let handle = self.enqueue_tagged(command, tag).await?;
            tag = Some(handle.tag);
            match self.wait(handle).await {
                Ok(response) => break Ok(response),
                Err(err) if err.is_retryable() && attempt < self.retries => {
                    attempt += 1;
                    log::trace!(
                        "Failed try {attempt} of {}, repeating ({err})",
                        u32::from(self.retries) + 1
                    );
                }
                Err(err) => {
                    if err.is_retryable() {
                        let mut session = self.session.lock();
                        session.consecutive_timeouts += 1;
                        log::warn!(
                            "{command} failed after {} tries ({} consecutive timeouts)",
                            u32::from(self.retries) + 1,
                            session.consecutive_timeouts
                        );
                    }
                    break Err(err);
                }
            }
        }
    }

    /// Feeds one inbound notification.
    pub fn on_frame_received(&self, bytes: &[u8]) {
        log::trace!("<- {bytes:02X?}");
        let mut assembler = self.assembler.lock();
        assembler.push(bytes);
        while let Some(result) = assembler.next_frame() {
            match result {
                Ok(frame) => self.resolve(frame),
                Err(err) => log::debug!("Discarding inbound bytes ({err})"),
            }
        }
    }

    fn resolve(&self, frame: Frame) {
        let mut session = self.session.lock();
        let matched = session
            .pending
            .as_ref()
            .is_some_and(|pending| pending.command.matches(&frame));
        if !matched {
            log::debug!("Discarding unsolicited frame {frame:?}");
            return;
        }
        if let Some(pending) = session.pending.take() {
            session.record_success();
            log::trace!(
                "Request {} answered after {:?}",
                pending.tag,
                pending.issued_at.elapsed()
            );
            // the waiter may already be gone after a stop
            let _ = pending.reply.send(pending.command.decode(&frame));
        }
    }

    /// Discards the pending request without resolving it.
    pub fn cancel_pending(&self) {
        let mut assembler = self.assembler.lock();
        assembler.clear();
        if let Some(pending) = self.session.lock().pending.take() {
            log::debug!("Cancelled pending request {} ({})", pending.tag, pending.command);
        }
    }

    fn release(&self, tag: u64) {
        let mut session = self.session.lock();
        if session.pending_tag() == Some(tag) {
            session.pending = None;
        }
    }
}
