//! Per-connection state and the client-side handle.

use crate::protocol::Reply;
use crate::subscriptions::{Resolution, SubscriptionResult, SubscriptionSet};
use crate::types::{PrimaryKey, User};
use crossbeam_channel::{Receiver, RecvError, RecvTimeoutError, Sender, TryRecvError, TrySendError};
use parking_lot::{Mutex, MutexGuard};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Unique identifier for a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// What a connection last subscribed to and was sent.
#[derive(Clone, Debug, Default)]
pub struct ConnectionState {
    subscriptions: Option<SubscriptionSet>,
    observed: BTreeMap<String, SubscriptionResult>,
    closed: bool,
}

impl ConnectionState {
    /// Whether the last result sent surfaces the row `key` of `table`.
    pub fn observes(&self, table: &str, key: &PrimaryKey) -> bool {
        self.observed.values().any(|result| result.observes(table, key))
    }

    pub fn observed(&self) -> &BTreeMap<String, SubscriptionResult> {
        &self.observed
    }

    pub fn subscriptions(&self) -> Option<&SubscriptionSet> {
        self.subscriptions.as_ref()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// New subscription set and its first resolution.
    pub(crate) fn replace(&mut self, set: SubscriptionSet, resolution: &Resolution) {
        self.subscriptions = Some(set);
        self.observed = resolution.sub.clone();
    }

    /// Re-resolution of the current set.
    pub(crate) fn refresh(&mut self, resolution: &Resolution) {
        self.observed = resolution.sub.clone();
    }

    pub(crate) fn close(&mut self) {
        self.subscriptions = None;
        self.observed.clear();
        self.closed = true;
    }
}

/// Server side of one client connection.
pub struct Connection {
    id: ConnectionId,
    user: User,
    /// Serializes this connection's requests.
    requests: Mutex<()>,
    state: Mutex<ConnectionState>,
    outbox: Sender<Reply>,
}

impl Connection {
    pub(crate) fn new(id: ConnectionId, user: User, outbox: Sender<Reply>) -> Self {
        Self {
            id,
            user,
            requests: Mutex::new(()),
            state: Mutex::new(ConnectionState::default()),
            outbox,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn user(&self) -> &User {
        &self.user
    }

    pub fn state(&self) -> MutexGuard<'_, ConnectionState> {
        self.state.lock()
    }

    /// Held for the duration of one request.
    pub(crate) fn begin_request(&self) -> MutexGuard<'_, ()> {
        self.requests.lock()
    }

    /// Queue a push without blocking.
    pub(crate) fn push(&self, reply: Reply) -> Result<(), TrySendError<Reply>> {
        self.outbox.try_send(reply)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("user", &self.user)
            .finish()
    }
}

/// Handle held by the transport for one connection.
///
/// Pushes arrive on [`recv`](Self::recv); request replies are returned
/// directly by the engine.
pub struct ConnectionHandle {
    connection: Arc<Connection>,
    receiver: Receiver<Reply>,
}

impl ConnectionHandle {
    pub(crate) fn new(connection: Arc<Connection>, receiver: Receiver<Reply>) -> Self {
        Self {
            connection,
            receiver,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.connection.id()
    }

    pub fn user(&self) -> &User {
        self.connection.user()
    }

    pub(crate) fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// Copy of the results last sent to this connection.
    pub fn observed(&self) -> BTreeMap<String, SubscriptionResult> {
        self.connection.state().observed().clone()
    }

    /// Receive the next push (blocking).
    pub fn recv(&self) -> Result<Reply, RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a push (non-blocking).
    pub fn try_recv(&self) -> Result<Reply, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Reply, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}
