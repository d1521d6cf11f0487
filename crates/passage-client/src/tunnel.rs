//! Tunnel supervisor.
//!
//! Owns the connection pool and the single reconnect-timer slot,
//! orchestrates bulk open, reacts to connection loss, and runs the
//! periodic full-pool refresh. Pool membership, the closing flag and the
//! reconnect-timer decision are serialized under one lock; everything
//! else happens in per-connection tasks.

use crate::bridge::{self, BridgeOutcome};
use crate::config::{ConfigError, TunnelConfig};
use crate::identity::TunnelIdentity;
use crate::local::{LocalDialError, LocalDialer};
use crate::pool::{Pool, PoolMember};
use crate::remote::{RemoteDialError, RemoteDialer};
use crate::rewrite::HostHeaderRewriter;
use crate::status::{StatusClient, StatusError, StatusRequest};
use futures_util::future::join_all;
use k256::ecdsa::SigningKey;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;

/// Cap on how long a heartbeat refresh waits for the old pool to drain
/// before redialing anyway.
const REFRESH_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Observable tunnel lifecycle events.
#[derive(Debug, Clone)]
pub enum TunnelEvent {
    /// A pool connection completed the handshake.
    Open(u64),
    /// A bridge finished wiring and bytes can flow.
    Connected(u64),
    /// The remote refused a connection.
    Disconnected(String),
    /// `close()` finished tearing the pool down.
    Closed,
}

/// Top-level tunnel errors surfaced to callers.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    RemoteDial(#[from] RemoteDialError),

    #[error(transparent)]
    LocalDial(#[from] LocalDialError),

    #[error(transparent)]
    Status(#[from] StatusError),
}

enum TimerKind {
    /// Error-driven: one `open()` attempt after the interval.
    ErrorRetry,
    /// Heartbeat: full pool refresh (drain, then redial everything).
    Heartbeat,
}

/// The reverse tunnel agent.
///
/// A `Tunnel` keeps `max_connections` authenticated TLS connections open
/// to the rendezvous server; each one serves a single user session at a
/// time by bridging to a freshly dialed local connection.
pub struct Tunnel {
    inner: Arc<Inner>,
}

struct Inner {
    config: TunnelConfig,
    identity: TunnelIdentity,
    signing_key: SigningKey,
    remote_dialer: RemoteDialer,
    local_dialer: LocalDialer,
    status: StatusClient,
    events: broadcast::Sender<TunnelEvent>,
    next_id: AtomicU64,
    state: Mutex<Shared>,
    pool_size: watch::Sender<usize>,
}

struct Shared {
    pool: Pool,
    /// Dials spawned but not yet pooled; reserved against capacity so the
    /// pool can never exceed `max_connections`.
    pending: usize,
    /// Set by `close()` before sockets are touched so in-flight error and
    /// close paths stop scheduling replacements; cleared by a
    /// caller-initiated `open()`.
    closing: bool,
    reconnect_timer: Option<JoinHandle<()>>,
    timer_generation: u64,
}

impl Tunnel {
    /// Validate the configuration and build a tunnel. No I/O happens
    /// until `open()`.
    pub fn new(config: TunnelConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let signing_key = config.signing_key()?;
        let identity = TunnelIdentity::derive(&config.private_key, &config.remote_address)?;
        let remote_dialer = RemoteDialer::new(&config.remote_address, config.remote_port);
        let local_dialer = LocalDialer::new(
            &config.local_address,
            config.local_port,
            config.secure_local_connection,
        );
        let status = StatusClient::new(&config.remote_address, identity.id());
        let (events, _) = broadcast::channel(64);
        let (pool_size, _) = watch::channel(0);

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                identity,
                signing_key,
                remote_dialer,
                local_dialer,
                status,
                events,
                next_id: AtomicU64::new(1),
                state: Mutex::new(Shared {
                    pool: Pool::new(),
                    pending: 0,
                    closing: false,
                    reconnect_timer: None,
                    timer_generation: 0,
                }),
                pool_size,
            }),
        })
    }

    /// The 40-hex-character tunnel id.
    pub fn id(&self) -> &str {
        self.inner.identity.id()
    }

    /// Public URL user traffic arrives at.
    pub fn url(&self) -> String {
        self.inner.identity.url()
    }

    /// Public URL for a caller-supplied alias.
    pub fn alias_url(&self, alias: &str) -> String {
        self.inner.identity.alias_url(alias)
    }

    /// Subscribe to lifecycle events. Slow subscribers may observe lag;
    /// the supervisor never blocks on them.
    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.inner.events.subscribe()
    }

    /// Current number of pooled connections.
    pub async fn pool_size(&self) -> usize {
        self.inner.state.lock().await.pool.len()
    }

    /// Open `n` pool connections concurrently (all missing ones when `n`
    /// is `None`). Cancels any pending reconnect timer, completes when
    /// every dial has finished and surfaces the first error. On full
    /// success the heartbeat is (re)scheduled.
    pub async fn open(&self, n: Option<usize>) -> Result<(), TunnelError> {
        self.inner.clone().open_pool(n, true).await
    }

    /// Tear the whole pool down. Completes once every pooled connection
    /// has fully closed; no replacements are scheduled for connections
    /// closed this way.
    pub async fn close(&self) {
        self.inner.close_pool().await;
    }

    /// Schedule the heartbeat: after `auto_reconnect_interval` the pool is
    /// torn down and rebuilt. At most one timer is pending at any time.
    pub async fn reconnect(&self) {
        let inner = self.inner.clone();
        let mut state = self.inner.state.lock().await;
        inner.schedule_timer(&mut state, TimerKind::Heartbeat);
    }

    /// Fetch the tunnel's status document from the rendezvous server.
    pub async fn query_proxy_info(
        &self,
        overrides: Option<StatusRequest>,
    ) -> Result<Value, StatusError> {
        self.inner.status.query(overrides).await
    }
}

impl Inner {
    fn emit(&self, event: TunnelEvent) {
        let _ = self.events.send(event);
    }

    /// Fan out dials for up to `requested` connections. `user` opens
    /// (`Tunnel::open`) clear the closing flag; internal opens
    /// (replacements, timers) are suppressed while closing so a racing
    /// `close()` always wins.
    fn open_pool(
        self: Arc<Self>,
        requested: Option<usize>,
        user: bool,
    ) -> Pin<Box<dyn Future<Output = Result<(), TunnelError>> + Send>> {
        Box::pin(self.open_pool_inner(requested, user))
    }

    async fn open_pool_inner(
        self: Arc<Self>,
        requested: Option<usize>,
        user: bool,
    ) -> Result<(), TunnelError> {
        let n = {
            let mut state = self.state.lock().await;
            if user {
                state.closing = false;
            } else if state.closing {
                return Ok(());
            }
            Self::cancel_timer(&mut state);
            let available = self
                .config
                .max_connections
                .saturating_sub(state.pool.len() + state.pending);
            let n = requested.map_or(available, |r| r.min(available));
            state.pending += n;
            n
        };

        tracing::info!(connections = n, "opening pool connections");

        let mut dials = Vec::with_capacity(n);
        for _ in 0..n {
            let (result_tx, result_rx) = oneshot::channel();
            let inner = self.clone();
            tokio::spawn(async move { inner.run_connection(result_tx).await });
            dials.push(result_rx);
        }

        let mut first_error = None;
        for result in join_all(dials).await {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
                // The task dropped its sender: shutdown raced the dial.
                Err(_) => {}
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                let mut state = self.state.lock().await;
                if !state.closing {
                    self.clone().schedule_timer(&mut state, TimerKind::Heartbeat);
                }
                Ok(())
            }
        }
    }

    /// One connection's whole life: transport connect, pool membership,
    /// challenge handshake, local pairing, bridge, replacement.
    async fn run_connection(self: Arc<Self>, result_tx: oneshot::Sender<Result<(), TunnelError>>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);

        let pending = match self.remote_dialer.connect().await {
            Ok(pending) => pending,
            Err(e) => {
                self.release_pending().await;
                self.clone().handle_remote_error(&e).await;
                let _ = result_tx.send(Err(e.into()));
                return;
            }
        };

        // Pool membership starts at transport connect, before the challenge.
        if !self.pool_join(id, shutdown_tx).await {
            let _ = result_tx.send(Ok(()));
            return;
        }

        let remote = tokio::select! {
            result = pending.authenticate(&self.signing_key) => match result {
                Ok(stream) => stream,
                Err(e) => {
                    self.pool_leave(id).await;
                    self.clone().handle_remote_error(&e).await;
                    let _ = result_tx.send(Err(e.into()));
                    return;
                }
            },
            _ = shutdown_rx.recv() => {
                self.pool_leave(id).await;
                let _ = result_tx.send(Ok(()));
                return;
            }
        };

        self.emit(TunnelEvent::Open(id));
        tracing::info!(connection = id, "pool connection open");

        // The remote stays unread until the local connect completes, so no
        // proxied bytes are dropped.
        let local = tokio::select! {
            result = self.local_dialer.dial() => match result {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::warn!(connection = id, error = %e, "local dial failed");
                    self.pool_leave(id).await;
                    self.clone().schedule_error_reconnect().await;
                    let _ = result_tx.send(Err(e.into()));
                    return;
                }
            },
            _ = shutdown_rx.recv() => {
                self.pool_leave(id).await;
                let _ = result_tx.send(Ok(()));
                return;
            }
        };

        let rewriter = HostHeaderRewriter::applies_to(&self.config.local_address)
            .then(|| HostHeaderRewriter::new(&self.config.local_address));

        self.emit(TunnelEvent::Connected(id));
        let _ = result_tx.send(Ok(()));

        let outcome = bridge::run(
            remote,
            local,
            rewriter,
            self.config.transform.clone(),
            &mut shutdown_rx,
        )
        .await;
        self.pool_leave(id).await;

        match outcome {
            BridgeOutcome::Shutdown => {
                tracing::debug!(connection = id, "connection torn down");
            }
            BridgeOutcome::RemoteClosed { error } => {
                if let Some(e) = error {
                    tracing::warn!(connection = id, error = %e, "remote connection error");
                    self.clone().schedule_error_reconnect().await;
                } else {
                    tracing::debug!(connection = id, "remote connection closed");
                }
                self.clone().replace_connection().await;
            }
            BridgeOutcome::LocalClosed { error } => {
                if let Some(e) = error {
                    tracing::warn!(connection = id, error = %e, "local connection error");
                } else {
                    tracing::debug!(connection = id, "local connection closed");
                }
                // Both sides are torn down with this task; the remote's
                // closure feeds the same replacement path as a
                // remote-initiated close.
                self.clone().replace_connection().await;
            }
        }
    }

    /// Join the pool, consuming this dial's capacity reservation. Refused
    /// while closing.
    async fn pool_join(&self, id: u64, shutdown: mpsc::Sender<()>) -> bool {
        let mut state = self.state.lock().await;
        state.pending = state.pending.saturating_sub(1);
        if state.closing {
            return false;
        }
        state.pool.add(id, PoolMember { shutdown });
        self.pool_size.send_replace(state.pool.len());
        true
    }

    async fn pool_leave(&self, id: u64) {
        let mut state = self.state.lock().await;
        if state.pool.remove(id) {
            self.pool_size.send_replace(state.pool.len());
        }
    }

    async fn release_pending(&self) {
        let mut state = self.state.lock().await;
        state.pending = state.pending.saturating_sub(1);
    }

    /// Error policy for remote failures: `Disconnected` on refused
    /// connections, then at most one timer-driven `open()` once the pool
    /// has emptied. The pool-removal for the failed connection has already
    /// happened when this runs.
    async fn handle_remote_error(self: Arc<Self>, err: &RemoteDialError) {
        let refused = {
            let mut state = self.state.lock().await;
            if state.closing {
                return;
            }
            self.clone().schedule_error_reconnect_locked(&mut state);
            err.is_connection_refused()
        };
        if refused {
            self.emit(TunnelEvent::Disconnected(
                "Tunnel connection refused".to_string(),
            ));
        }
    }

    async fn schedule_error_reconnect(self: Arc<Self>) {
        let mut state = self.state.lock().await;
        if state.closing {
            return;
        }
        self.clone().schedule_error_reconnect_locked(&mut state);
    }

    fn schedule_error_reconnect_locked(self: Arc<Self>, state: &mut Shared) {
        if !self.config.auto_reconnect {
            return;
        }
        let should_reconnect = state.pool.is_empty() && state.reconnect_timer.is_none();
        if should_reconnect {
            self.schedule_timer(state, TimerKind::ErrorRetry);
        }
    }

    /// Request exactly one replacement dial, preserving steady-state pool
    /// size. Suppressed during shutdown.
    async fn replace_connection(self: Arc<Self>) {
        if self.state.lock().await.closing {
            return;
        }
        tokio::spawn(async move {
            if let Err(e) = self.open_pool(Some(1), false).await {
                tracing::warn!(error = %e, "replacement dial failed");
            }
        });
    }

    /// Arm the single reconnect-timer slot, cancelling any pending timer
    /// first. The generation counter makes a timer that lost a cancel
    /// race a no-op.
    fn schedule_timer(self: Arc<Self>, state: &mut Shared, kind: TimerKind) {
        Self::cancel_timer(state);
        state.timer_generation += 1;
        let generation = state.timer_generation;

        state.reconnect_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(self.config.auto_reconnect_interval).await;
            {
                let mut state = self.state.lock().await;
                if state.timer_generation != generation {
                    return;
                }
                state.reconnect_timer = None;
            }
            match kind {
                TimerKind::ErrorRetry => {
                    tracing::info!("reconnecting after connection loss");
                    if let Err(e) = self.clone().open_pool(None, false).await {
                        tracing::warn!(error = %e, "reconnect attempt failed");
                    }
                }
                TimerKind::Heartbeat => {
                    tracing::debug!("heartbeat: refreshing connection pool");
                    if self.refresh_drain().await {
                        if let Err(e) = self.clone().open_pool(None, false).await {
                            tracing::warn!(error = %e, "heartbeat reopen failed");
                        }
                    }
                }
            }
        }));
    }

    fn cancel_timer(state: &mut Shared) {
        state.timer_generation += 1;
        if let Some(timer) = state.reconnect_timer.take() {
            timer.abort();
        }
    }

    /// User-initiated teardown: flips the closing flag so every error and
    /// close path becomes a no-op, then waits for the pool to drain.
    async fn close_pool(&self) {
        let snapshot = {
            let mut state = self.state.lock().await;
            state.closing = true;
            Self::cancel_timer(&mut state);
            state.pool.snapshot()
        };

        tracing::info!(connections = snapshot.len(), "closing pool");
        for (_, shutdown) in snapshot {
            let _ = shutdown.try_send(());
        }

        let mut size = self.pool_size.subscribe();
        let _ = size.wait_for(|n| *n == 0).await;

        self.emit(TunnelEvent::Closed);
        tracing::info!("pool closed");
    }

    /// Heartbeat teardown: drains the current pool without entering the
    /// closing state, so the follow-up redial proceeds. Returns false if a
    /// user close won the race.
    async fn refresh_drain(&self) -> bool {
        let snapshot = {
            let state = self.state.lock().await;
            if state.closing {
                return false;
            }
            state.pool.snapshot()
        };

        for (_, shutdown) in snapshot {
            let _ = shutdown.try_send(());
        }

        // A replacement dial racing this drain can join the pool while we
        // wait; the follow-up open sizes itself from live pool state, so
        // a bounded wait is enough.
        let mut size = self.pool_size.subscribe();
        let _ = tokio::time::timeout(REFRESH_DRAIN_TIMEOUT, size.wait_for(|n| *n == 0)).await;
        true
    }
}
