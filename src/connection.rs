//! Connection state machine.
//!
//! One manager task owns the link to the device. It walks
//! `Disconnected -> Connecting -> Handshaking -> Ready`, runs poll cycles and
//! control writes while ready, and falls back to `Disconnected` with an
//! exponential backoff whenever the link fails.

use crate::config::DriverConfig;
use crate::dispatcher::Dispatcher;
use crate::driver::DriverEvent;
use crate::poller::Poller;
use crate::protocol::Command;
use crate::registers::{DomainValue, CORE_GROUP};
use crate::session::{ConnectionState, SharedSession};
use crate::transport::{Transport, TransportError};
use crate::{Error, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

const NOTIFICATION_QUEUE: usize = 64;
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Reconnection delays: `base * 2^failures`, capped at `max`.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    base: Duration,
    max: Duration,
    failures: u32,
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: 0,
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Delay before the next attempt. Counts one more failure.
    pub fn next_delay(&mut self) -> Duration {
        let factor = 1u32 << self.failures.min(31);
        let delay = self
            .base
            .checked_mul(factor)
            .map_or(self.max, |delay| delay.min(self.max));
        self.failures = self.failures.saturating_add(1);
        delay
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }
}

/// A control write queued by the host.
#[derive(Debug)]
pub(crate) struct ControlRequest {
    pub field: String,
    pub value: DomainValue,
    pub reply: oneshot::Sender<Result<()>>,
}

pub(crate) struct ConnectionManager {
    config: DriverConfig,
    transport: Arc<dyn Transport>,
    session: SharedSession,
    dispatcher: Arc<Dispatcher>,
    poller: Poller,
    backoff: BackoffPolicy,
    events: mpsc::Sender<DriverEvent>,
    controls: mpsc::Receiver<ControlRequest>,
    shutdown: CancellationToken,
}

impl ConnectionManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: DriverConfig,
        transport: Arc<dyn Transport>,
        session: SharedSession,
        dispatcher: Arc<Dispatcher>,
        poller: Poller,
        events: mpsc::Sender<DriverEvent>,
        controls: mpsc::Receiver<ControlRequest>,
        shutdown: CancellationToken,
    ) -> Self {
        let backoff = BackoffPolicy::new(config.backoff_base, config.backoff_max);
        Self {
            config,
            transport,
            session,
            dispatcher,
            poller,
            backoff,
            events,
            controls,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        loop {
            let result = self.serve().await;
            let stopping = self.shutdown.is_cancelled();
            self.teardown(stopping).await;
            match result {
                Err(err) if !stopping => {
                    self.report_failure(&err);
                    let delay = self.backoff.next_delay();
                    self.session.lock().retry_count = self.backoff.failures();
                    log::info!(
                        "Reconnecting to {} in {}",
                        self.config.address,
                        humantime::format_duration(delay)
                    );
                    if !self.wait_backoff(delay).await {
                        break;
                    }
                }
                _ => break,
            }
        }
        log::debug!("Connection manager for {} stopped", self.config.address);
    }

    /// One connection attempt. `Ok` means the driver was stopped.
    async fn serve(&mut self) -> Result<()> {
        self.set_state(ConnectionState::Connecting);
        let connect = tokio::time::timeout(
            self.config.connect_timeout,
            self.transport.connect(&self.config.address),
        );
        tokio::select! {
            _ = self.shutdown.cancelled() => return Ok(()),
            result = connect => match result {
                Ok(result) => result?,
                Err(_) => return Err(Error::Timeout(self.config.connect_timeout)),
            },
        }

        let (sink, notifications) = mpsc::channel(NOTIFICATION_QUEUE);
        let subscribe = tokio::time::timeout(
            self.config.connect_timeout,
            self.transport.subscribe_notifications(sink),
        );
        tokio::select! {
            _ = self.shutdown.cancelled() => return Ok(()),
            result = subscribe => match result {
                Ok(result) => result?,
                Err(_) => return Err(Error::Timeout(self.config.connect_timeout)),
            },
        }
        let link = self.shutdown.child_token();
        let reader = tokio::spawn(read_notifications(
            notifications,
            self.dispatcher.clone(),
            link.clone(),
        ));
        let result = self.serve_link(&link).await;
        link.cancel();
        if let Err(err) = reader.await {
            log::error!("Notification reader failed: {err}");
        }
        result
    }

    async fn serve_link(&mut self, link: &CancellationToken) -> Result<()> {
        self.set_state(ConnectionState::Handshaking);
        let handshake = Command::read_holding_registers(CORE_GROUP.start, CORE_GROUP.count);
        match self.guarded(link, self.dispatcher.request(handshake)).await? {
            Some(result) => {
                result?;
            }
            None => return Ok(()),
        }
        self.set_state(ConnectionState::Ready);
        self.backoff.reset();
        self.session.lock().retry_count = 0;

        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut refresh_at: Option<Instant> = None;
        loop {
            tokio::select! {
                _ = link.cancelled() => return self.link_closed(),
                _ = ticker.tick() => {}
                _ = tokio::time::sleep_until(refresh_at.unwrap_or_else(Instant::now)),
                    if refresh_at.is_some() =>
                {
                    refresh_at = None;
                }
                Some(control) = self.controls.recv() => {
                    let ControlRequest { field, value, reply } = control;
                    let write = self.poller.submit_control(&self.dispatcher, &field, &value);
                    let Some(outcome) = self.guarded(link, write).await? else {
                        return Ok(());
                    };
                    if outcome.is_ok() {
                        refresh_at = Some(Instant::now() + self.config.control_settle_delay);
                    }
                    self.publish(DriverEvent::ControlResult {
                        field,
                        outcome: outcome.clone(),
                    });
                    // the caller may have given up waiting
                    let _ = reply.send(outcome);
                    self.check_timeouts()?;
                    continue;
                }
            }
            let cycle = self.poller.poll_cycle(&self.dispatcher);
            let Some(snapshot) = self.guarded(link, cycle).await? else {
                return Ok(());
            };
            self.publish(DriverEvent::Snapshot(snapshot));
            self.check_timeouts()?;
        }
    }

    /// Runs `future` unless the link closes first. `None` means the driver
    /// was stopped.
    async fn guarded<F: Future>(
        &self,
        link: &CancellationToken,
        future: F,
    ) -> Result<Option<F::Output>> {
        tokio::select! {
            _ = link.cancelled() => self.link_closed().map(|()| None),
            output = future => Ok(Some(output)),
        }
    }

    fn link_closed(&self) -> Result<()> {
        if self.shutdown.is_cancelled() {
            Ok(())
        } else {
            Err(Error::Transport(TransportError::Disconnected))
        }
    }

    fn check_timeouts(&self) -> Result<()> {
        let timeouts = self.session.lock().consecutive_timeouts;
        if timeouts >= self.config.max_consecutive_timeouts {
            log::error!(
                "{timeouts} consecutive timeouts from {}, dropping the connection",
                self.config.address
            );
            return Err(Error::Timeout(self.config.request_timeout));
        }
        Ok(())
    }

    async fn teardown(&self, stopping: bool) {
        self.dispatcher.cancel_pending();
        let state = self.session.lock().state();
        if state == ConnectionState::Disconnected {
            return;
        }
        if stopping {
            self.set_state(ConnectionState::Disconnecting);
        }
        match tokio::time::timeout(DISCONNECT_TIMEOUT, self.transport.disconnect()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => log::debug!("Disconnect from {} failed: {err}", self.config.address),
            Err(_) => log::debug!("Disconnect from {} timed out", self.config.address),
        }
        self.session.lock().consecutive_timeouts = 0;
        self.set_state(ConnectionState::Disconnected);
    }

    fn report_failure(&self, err: &Error) {
        if matches!(err, Error::ExclusiveLock) {
            log::warn!(
                "{} refused the connection because another client holds it, \
                 toggle Bluetooth on the device or close the other app",
                self.config.address
            );
            self.publish(DriverEvent::ExclusiveLock {
                address: self.config.address.clone(),
            });
        } else {
            log::warn!("Connection to {} lost: {err}", self.config.address);
            self.publish(DriverEvent::ConnectionDown {
                reason: err.to_string(),
            });
        }
    }

    /// Sleeps through the backoff delay. Returns `false` when stopped.
    async fn wait_backoff(&mut self, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return false,
                _ = tokio::time::sleep_until(deadline) => return true,
                Some(control) = self.controls.recv() => {
                    let _ = control.reply.send(Err(Error::NotConnected));
                }
            }
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.session.lock().transition(state);
        if previous != state {
            self.publish(DriverEvent::StateChanged(state));
        }
    }

    fn publish(&self, event: DriverEvent) {
        if let Err(err) = self.events.try_send(event) {
            log::debug!("Dropping driver event: {err}");
        }
    }
}

async fn read_notifications(
    mut notifications: mpsc::Receiver<Vec<u8>>,
    dispatcher: Arc<Dispatcher>,
    link: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = link.cancelled() => break,
            notification = notifications.recv() => match notification {
                Some(bytes) => dispatcher.on_frame_received(&bytes),
                None => {
                    log::warn!("Notification stream closed");
                    link.cancel();
                    break;
                }
            },
        }
    }
}
