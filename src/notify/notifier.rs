//! Change notifier: drains change events and refreshes observing connections.

use crate::error::Result;
use crate::protocol::Reply;
use crate::subscriptions::Resolver;
use crate::types::{ChangeEvent, User};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, TrySendError};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::connection::{Connection, ConnectionHandle, ConnectionId};

/// Configuration for the notifier.
#[derive(Clone, Debug)]
pub struct NotifierConfig {
    /// Longest idle wait before the loop re-checks for shutdown.
    /// Default: 100ms
    pub poll_interval: Duration,

    /// Extra wait after the first event so bursts share one drain.
    /// Default: 0 (dispatch immediately)
    pub coalesce_window: Duration,

    /// Max buffered pushes before a connection is dropped.
    /// Default: 1000
    pub push_buffer: usize,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            coalesce_window: Duration::ZERO,
            push_buffer: 1000,
        }
    }
}

/// Counters for one drain of the event queue.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub events: usize,
    pub refreshed: usize,
    pub failed: usize,
    pub dropped: usize,
}

enum Refresh {
    Pushed,
    Skipped,
    Dropped,
}

/// Tracks live connections and re-pushes their subscriptions on change.
pub struct Notifier {
    /// Live connections by ID, in connection order.
    connections: RwLock<BTreeMap<ConnectionId, Arc<Connection>>>,
    /// Counter for generating connection IDs.
    next_id: AtomicU64,
    events: Receiver<ChangeEvent>,
    resolver: Arc<Resolver>,
    config: NotifierConfig,
}

impl Notifier {
    pub fn new(
        events: Receiver<ChangeEvent>,
        resolver: Arc<Resolver>,
        config: NotifierConfig,
    ) -> Self {
        Self {
            connections: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            events,
            resolver,
            config,
        }
    }

    pub fn config(&self) -> &NotifierConfig {
        &self.config
    }

    /// Open a connection and register it for change notification.
    pub fn connect(&self, user: User) -> ConnectionHandle {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (sender, receiver) = bounded(self.config.push_buffer.max(1));
        let connection = Arc::new(Connection::new(id, user, sender));

        self.install(connection.clone());
        ConnectionHandle::new(connection, receiver)
    }

    pub fn install(&self, connection: Arc<Connection>) {
        debug!(connection = %connection.id(), "connection installed");
        self.connections.write().insert(connection.id(), connection);
    }

    pub fn remove(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        let removed = self.connections.write().remove(&id);
        if removed.is_some() {
            debug!(connection = %id, "connection removed");
        }
        removed
    }

    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }

    /// Drain every queued event without blocking and refresh the
    /// connections that observe any of them.
    pub fn dispatch(&self) -> DispatchStats {
        self.dispatch_events(Vec::new())
    }

    fn dispatch_events(&self, mut events: Vec<ChangeEvent>) -> DispatchStats {
        events.extend(self.events.try_iter());
        let mut stats = DispatchStats {
            events: events.len(),
            ..Default::default()
        };
        if events.is_empty() {
            return stats;
        }

        // Each connection is refreshed at most once per drain, in the order
        // it was first flagged.
        let connections: Vec<Arc<Connection>> =
            self.connections.read().values().cloned().collect();
        let mut flagged: Vec<Arc<Connection>> = Vec::new();
        for event in &events {
            for connection in &connections {
                if flagged.iter().any(|c| c.id() == connection.id()) {
                    continue;
                }
                if connection.state().observes(&event.table, &event.key) {
                    flagged.push(connection.clone());
                }
            }
        }

        for connection in &flagged {
            match self.refresh(connection) {
                Ok(Refresh::Pushed) => stats.refreshed += 1,
                Ok(Refresh::Skipped) => {}
                Ok(Refresh::Dropped) => stats.dropped += 1,
                Err(e) => {
                    stats.failed += 1;
                    warn!(connection = %connection.id(), error = %e, "refresh failed");
                }
            }
        }

        debug!(
            events = stats.events,
            flagged = flagged.len(),
            refreshed = stats.refreshed,
            "dispatched change events"
        );
        stats
    }

    /// Re-resolve the connection's set and push it. The state lock is held
    /// throughout, so a concurrent disconnect either precedes or follows the
    /// whole refresh.
    fn refresh(&self, connection: &Connection) -> Result<Refresh> {
        let mut state = connection.state();
        if state.is_closed() {
            return Ok(Refresh::Skipped);
        }
        let Some(set) = state.subscriptions().cloned() else {
            return Ok(Refresh::Skipped);
        };

        let resolution = self.resolver.resolve(connection.user(), &set)?;
        state.refresh(&resolution);

        match connection.push(Reply::push(resolution)) {
            Ok(()) => Ok(Refresh::Pushed),
            Err(e) => {
                let reason = match e {
                    TrySendError::Full(_) => "push buffer full",
                    TrySendError::Disconnected(_) => "receiver gone",
                };
                state.close();
                drop(state);
                self.remove(connection.id());
                warn!(connection = %connection.id(), reason, "dropped connection");
                Ok(Refresh::Dropped)
            }
        }
    }

    /// Run the dispatch loop on a dedicated thread.
    pub fn spawn(self: &Arc<Self>) -> Result<Dispatcher> {
        let stop = Arc::new(AtomicBool::new(false));
        let notifier = Arc::clone(self);
        let flag = Arc::clone(&stop);

        let thread = thread::Builder::new()
            .name("livesync-notifier".to_string())
            .spawn(move || notifier.run(&flag))?;

        Ok(Dispatcher {
            stop,
            thread: Some(thread),
        })
    }

    fn run(&self, stop: &AtomicBool) {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "dispatch loop started"
        );

        while !stop.load(Ordering::Acquire) {
            match self.events.recv_timeout(self.config.poll_interval) {
                Ok(first) => {
                    if !self.config.coalesce_window.is_zero() {
                        thread::sleep(self.config.coalesce_window);
                    }
                    self.dispatch_events(vec![first]);
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    info!("change feed closed");
                    break;
                }
            }
        }

        info!("dispatch loop stopped");
    }
}

/// Owns the dispatch thread. Stops and joins it on [`shutdown`](Self::shutdown)
/// or drop.
pub struct Dispatcher {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Dispatcher {
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().map_or(false, |t| !t.is_finished())
    }

    fn stop_and_join(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("dispatch thread panicked");
            }
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}
