// src/rabbitmq/connection.rs
// Keeps one logical broker connection alive across transport failures.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, warn};

use super::errors::{RabbitMQError, Result};
use super::transport::{Dialer, Transport};

/// Backoff between dial attempts.
///
/// The delay starts at `initial_delay`, doubles per failed attempt and is
/// capped at `max_delay`, with ±15% jitter. Retries are unlimited unless
/// `max_attempts` or `max_elapsed` is set; both count from the first failure
/// of the current outage.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: Option<u32>,
    pub max_elapsed: Option<Duration>,
    pub jitter: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30000),
            max_attempts: None,
            max_elapsed: None,
            jitter: true,
        }
    }
}

impl ReconnectPolicy {
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    pub fn with_max_elapsed(mut self, elapsed: Duration) -> Self {
        self.max_elapsed = Some(elapsed);
        self
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Delay to wait after the `attempt`-th consecutive failure (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self
            .initial_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay);

        if !self.jitter {
            return delay;
        }
        // Exponential backoff with jitter
        let millis = delay.as_millis() as f64;
        let jitter = (rand::random::<f64>() * 0.3 - 0.15) * millis;
        Duration::from_millis((millis + jitter).max(0.0) as u64)
    }

    pub fn is_exhausted(&self, attempts: u32, elapsed: Duration) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
            || self.max_elapsed.is_some_and(|max| elapsed >= max)
    }
}

/// Where the connection manager currently is.
pub enum ConnectionState<T> {
    /// Dialing; `attempt` counts consecutive failures plus one.
    Connecting { attempt: u32 },
    /// A live transport; `generation` increases on every successful dial.
    Connected { transport: Arc<T>, generation: u64 },
    /// The retry cap was reached; no more attempts will be made.
    Exhausted { attempts: u32 },
    /// Closed by the caller or by the root context. Terminal.
    Closed,
}

impl<T> ConnectionState<T> {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected { .. })
    }

    pub fn generation(&self) -> Option<u64> {
        match self {
            ConnectionState::Connected { generation, .. } => Some(*generation),
            _ => None,
        }
    }
}

impl<T> Clone for ConnectionState<T> {
    fn clone(&self) -> Self {
        match self {
            ConnectionState::Connecting { attempt } => ConnectionState::Connecting { attempt: *attempt },
            ConnectionState::Connected {
                transport,
                generation,
            } => ConnectionState::Connected {
                transport: transport.clone(),
                generation: *generation,
            },
            ConnectionState::Exhausted { attempts } => ConnectionState::Exhausted { attempts: *attempts },
            ConnectionState::Closed => ConnectionState::Closed,
        }
    }
}

impl<T> fmt::Debug for ConnectionState<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Connecting { attempt } => {
                f.debug_struct("Connecting").field("attempt", attempt).finish()
            }
            ConnectionState::Connected { generation, .. } => f
                .debug_struct("Connected")
                .field("generation", generation)
                .finish_non_exhaustive(),
            ConnectionState::Exhausted { attempts } => {
                f.debug_struct("Exhausted").field("attempts", attempts).finish()
            }
            ConnectionState::Closed => f.write_str("Closed"),
        }
    }
}

/// A channel together with the connection generation it was opened on.
#[derive(Debug, Clone)]
pub struct LiveChannel<C> {
    pub channel: C,
    pub generation: u64,
}

struct Shared<T> {
    state: watch::Sender<ConnectionState<T>>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Owns the transport and its regeneration.
///
/// Created by [`ConnectionManager::connect`], which returns at once: dial
/// failures never surface from construction. They are retried in the
/// background, and callers only see them as [`RabbitMQError::NotConnected`],
/// timeouts or [`RabbitMQError::ReconnectExhausted`] from
/// [`channel`](Self::channel) and [`channel_within`](Self::channel_within).
///
/// Clones share the same connection. Dropping the last clone stops the
/// reconnect loop.
pub struct ConnectionManager<T: Transport> {
    shared: Arc<Shared<T>>,
    _stop_on_drop: Arc<DropGuard>,
}

impl<T: Transport> Clone for ConnectionManager<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            _stop_on_drop: self._stop_on_drop.clone(),
        }
    }
}

impl<T: Transport> ConnectionManager<T> {
    /// Start the background reconnect loop. Must be called inside a Tokio
    /// runtime.
    pub fn connect<D>(dialer: D, policy: ReconnectPolicy) -> Self
    where
        D: Dialer<T>,
    {
        Self::connect_with_context(dialer, policy, &CancellationToken::new())
    }

    /// Like [`connect`](Self::connect); cancelling `context` closes the
    /// connection for good.
    pub fn connect_with_context<D>(
        dialer: D,
        policy: ReconnectPolicy,
        context: &CancellationToken,
    ) -> Self
    where
        D: Dialer<T>,
    {
        let shutdown = context.child_token();
        let (state, _) = watch::channel(ConnectionState::Connecting { attempt: 1 });
        let shared = Arc::new(Shared {
            state,
            shutdown: shutdown.clone(),
            task: Mutex::new(None),
        });

        let task = tokio::spawn(run(shared.clone(), dialer, policy));
        if let Ok(mut slot) = shared.task.lock() {
            *slot = Some(task);
        }

        Self {
            shared,
            _stop_on_drop: Arc::new(shutdown.drop_guard()),
        }
    }

    pub fn state(&self) -> ConnectionState<T> {
        self.shared.state.borrow().clone()
    }

    /// Receiver notified on every state change, including connection loss.
    pub fn watch(&self) -> watch::Receiver<ConnectionState<T>> {
        self.shared.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.state.borrow().is_connected()
    }

    pub fn generation(&self) -> Option<u64> {
        self.shared.state.borrow().generation()
    }

    /// The current transport, without waiting.
    pub fn transport(&self) -> Result<(Arc<T>, u64)> {
        state_to_transport(self.state())
    }

    /// Wait until the manager settles on a transport, gives up or closes.
    pub async fn wait_transport(&self, cancel: &CancellationToken) -> Result<(Arc<T>, u64)> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(RabbitMQError::Cancelled),
            state = self.settled() => state_to_transport(state),
        }
    }

    /// Resolves once `generation` is no longer the live connection.
    pub async fn lost(&self, generation: u64) {
        let mut rx = self.shared.state.subscribe();
        let _ = rx.wait_for(|s| s.generation() != Some(generation)).await;
    }

    /// Open a channel on the live transport, failing at once when there is
    /// none.
    pub async fn channel(&self) -> Result<LiveChannel<T::Channel>> {
        let (transport, generation) = self.transport()?;
        // Dropped but not yet noticed by the reconnect loop.
        if !transport.is_connected() {
            return Err(RabbitMQError::NotConnected);
        }
        open_channel(&transport, generation).await
    }

    /// Open a channel, waiting up to `timeout` for a connection.
    pub async fn channel_within(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<LiveChannel<T::Channel>> {
        tokio::time::timeout(timeout, self.wait_channel(cancel)).await?
    }

    /// Open a channel, waiting for as long as it takes to get a connection.
    pub async fn wait_channel(&self, cancel: &CancellationToken) -> Result<LiveChannel<T::Channel>> {
        loop {
            let (transport, generation) = self.wait_transport(cancel).await?;
            if transport.is_connected() {
                return open_channel(&transport, generation).await;
            }
            // Dead transport the reconnect loop has not replaced yet.
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RabbitMQError::Cancelled),
                _ = self.lost(generation) => {}
            }
        }
    }

    /// Stop reconnecting and release the transport. Idempotent.
    pub async fn close(&self) {
        self.shared.shutdown.cancel();
        let task = self.shared.task.lock().ok().and_then(|mut slot| slot.take());
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Reconnect loop ended abnormally: {}", e);
            }
        }
        self.shared.state.send_replace(ConnectionState::Closed);
    }

    pub fn is_closed(&self) -> bool {
        matches!(*self.shared.state.borrow(), ConnectionState::Closed)
    }

    async fn settled(&self) -> ConnectionState<T> {
        let mut rx = self.shared.state.subscribe();
        let settled = rx
            .wait_for(|s| !matches!(s, ConnectionState::Connecting { .. }))
            .await;
        match settled {
            Ok(state) => state.clone(),
            Err(_) => ConnectionState::Closed,
        }
    }
}

fn state_to_transport<T>(state: ConnectionState<T>) -> Result<(Arc<T>, u64)> {
    match state {
        ConnectionState::Connected {
            transport,
            generation,
        } => Ok((transport, generation)),
        ConnectionState::Connecting { .. } => Err(RabbitMQError::NotConnected),
        ConnectionState::Exhausted { attempts } => {
            Err(RabbitMQError::ReconnectExhausted { attempts })
        }
        ConnectionState::Closed => Err(RabbitMQError::ConnectionClosed),
    }
}

async fn open_channel<T: Transport>(
    transport: &Arc<T>,
    generation: u64,
) -> Result<LiveChannel<T::Channel>> {
    let channel = transport.create_channel().await?;
    debug!(generation, "Opened channel");
    Ok(LiveChannel {
        channel,
        generation,
    })
}

async fn run<T, D>(shared: Arc<Shared<T>>, dialer: D, policy: ReconnectPolicy)
where
    T: Transport,
    D: Dialer<T>,
{
    let shutdown = shared.shutdown.clone();
    let mut generation = 0u64;
    let mut attempts = 0u32;
    let mut outage_started: Option<Instant> = None;

    loop {
        shared.state.send_replace(ConnectionState::Connecting {
            attempt: attempts + 1,
        });
        debug!(attempt = attempts + 1, "Attempting to connect to RabbitMQ");

        let dialed = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            dialed = dialer.dial() => dialed,
        };

        match dialed {
            Ok(transport) => {
                attempts = 0;
                outage_started = None;
                generation += 1;
                let transport = Arc::new(transport);
                info!(generation, "Successfully connected to RabbitMQ");
                shared.state.send_replace(ConnectionState::Connected {
                    transport: transport.clone(),
                    generation,
                });

                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => {
                        info!(generation, "Closing RabbitMQ connection gracefully");
                        if let Err(e) = transport.close().await {
                            debug!(generation, "Error while closing connection: {}", e);
                        }
                        break;
                    }
                    reason = transport.closed() => {
                        warn!(generation, %reason, "RabbitMQ connection lost, reconnecting");
                    }
                }
            }
            Err(err) => {
                attempts += 1;
                let started = *outage_started.get_or_insert_with(Instant::now);
                warn!(
                    attempt = attempts,
                    "Failed to connect to RabbitMQ: {}", err
                );

                if policy.is_exhausted(attempts, started.elapsed()) {
                    error!(attempts, "Max reconnection attempts reached. Giving up.");
                    shared
                        .state
                        .send_replace(ConnectionState::Exhausted { attempts });
                    return;
                }

                let delay = policy.delay_for(attempts);
                debug!("Waiting {}ms before next reconnect attempt", delay.as_millis());
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = sleep(delay) => {}
                }
            }
        }
    }

    shared.state.send_replace(ConnectionState::Closed);
    debug!("Reconnect loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let policy = ReconnectPolicy::default()
            .with_initial_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(1000))
            .without_jitter();

        let delays: Vec<u64> = (1..=6)
            .map(|a| policy.delay_for(a).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000]);
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_millis(1000));
    }

    #[test]
    fn jitter_stays_within_fifteen_percent() {
        let policy = ReconnectPolicy::default().with_initial_delay(Duration::from_millis(1000));
        for _ in 0..100 {
            let ms = policy.delay_for(1).as_millis();
            assert!((850..=1150).contains(&ms), "delay {ms}ms out of range");
        }
    }

    #[test]
    fn unlimited_by_default() {
        let policy = ReconnectPolicy::default();
        assert!(!policy.is_exhausted(u32::MAX, Duration::from_secs(86400)));
    }

    #[test]
    fn attempt_and_time_caps() {
        let by_attempts = ReconnectPolicy::default().with_max_attempts(3);
        assert!(!by_attempts.is_exhausted(2, Duration::ZERO));
        assert!(by_attempts.is_exhausted(3, Duration::ZERO));

        let by_time = ReconnectPolicy::default().with_max_elapsed(Duration::from_secs(10));
        assert!(!by_time.is_exhausted(100, Duration::from_secs(9)));
        assert!(by_time.is_exhausted(1, Duration::from_secs(10)));
    }

    #[test]
    fn state_accessors() {
        let connected: ConnectionState<()> = ConnectionState::Connected {
            transport: Arc::new(()),
            generation: 4,
        };
        assert!(connected.is_connected());
        assert_eq!(connected.generation(), Some(4));
        assert_eq!(format!("{:?}", connected.clone()), "Connected { generation: 4, .. }");

        let closed: ConnectionState<()> = ConnectionState::Closed;
        assert!(!closed.is_connected());
        assert!(matches!(
            state_to_transport(closed),
            Err(RabbitMQError::ConnectionClosed)
        ));
        assert!(matches!(
            state_to_transport::<()>(ConnectionState::Connecting { attempt: 2 }),
            Err(RabbitMQError::NotConnected)
        ));
        assert!(matches!(
            state_to_transport::<()>(ConnectionState::Exhausted { attempts: 5 }),
            Err(RabbitMQError::ReconnectExhausted { attempts: 5 })
        ));
    }
}
