//! Engine facade: wires registry, storage, resolver, mutations and notifier,
//! and exposes the connection lifecycle.

use crate::error::{ErrorKind, Result, SyncError};
use crate::mutation::Mutations;
use crate::notify::{Connection, ConnectionHandle, DispatchStats, Dispatcher, Notifier, NotifierConfig};
use crate::protocol::{parse_message, Reply, Request, Response};
use crate::storage::{change_queue, Storage};
use crate::subscriptions::{Resolver, SubscriptionSet};
use crate::types::User;
use crate::visor::VisorRegistry;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Configuration for an [`Engine`].
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Field stamped with the writing user's id on insert and update.
    /// `None` disables stamping.
    /// Default: `lastUpdatedBy`
    pub modifier_field: Option<String>,

    pub notifier: NotifierConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            modifier_field: Some("lastUpdatedBy".to_string()),
            notifier: NotifierConfig::default(),
        }
    }
}

/// The sync engine.
pub struct Engine {
    config: EngineConfig,
    registry: Arc<VisorRegistry>,
    storage: Arc<dyn Storage>,
    resolver: Arc<Resolver>,
    mutations: Mutations,
    notifier: Arc<Notifier>,
}

impl Engine {
    /// Build an engine over `storage`. Installs the change feed on the
    /// backend; the dispatch loop is started separately with
    /// [`start_dispatcher`](Self::start_dispatcher).
    pub fn new(registry: VisorRegistry, storage: Arc<dyn Storage>, config: EngineConfig) -> Self {
        let registry = Arc::new(registry);
        let (feed, events) = change_queue();
        storage.install_feed(feed);

        let resolver = Arc::new(Resolver::new(registry.clone(), storage.clone()));
        let mutations = Mutations::new(
            registry.clone(),
            storage.clone(),
            config.modifier_field.clone(),
        );
        let notifier = Arc::new(Notifier::new(
            events,
            resolver.clone(),
            config.notifier.clone(),
        ));

        info!(
            backend = storage.name(),
            visors = registry.len(),
            "engine ready"
        );

        Self {
            config,
            registry,
            storage,
            resolver,
            mutations,
            notifier,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &VisorRegistry {
        &self.registry
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    pub fn mutations(&self) -> &Mutations {
        &self.mutations
    }

    pub fn notifier(&self) -> &Arc<Notifier> {
        &self.notifier
    }

    /// Open a connection for `user`.
    pub fn connect(&self, user: User) -> ConnectionHandle {
        let handle = self.notifier.connect(user);
        info!(connection = %handle.id(), user_id = ?handle.user().user_id, "connection opened");
        handle
    }

    /// Close a connection. No push reaches it once this returns.
    pub fn disconnect(&self, handle: ConnectionHandle) {
        self.notifier.remove(handle.id());
        handle.connection().state().close();
        info!(connection = %handle.id(), "connection closed");
    }

    /// Handle one request on behalf of a connection.
    pub fn handle(&self, handle: &ConnectionHandle, request: Request) -> Reply {
        let connection = handle.connection();
        let _request = connection.begin_request();
        let kind = request.kind();

        match self.execute(connection, request) {
            Ok(body) => Reply::new(body),
            Err(e) if e.kind() == ErrorKind::Storage => {
                warn!(connection = %connection.id(), request = kind, error = %e, "request failed");
                Reply::error(&e)
            }
            Err(e) => {
                debug!(connection = %connection.id(), request = kind, error = %e, "request rejected");
                Reply::error(&e)
            }
        }
    }

    /// Handle one raw JSON message and return the JSON reply.
    pub fn handle_message(&self, handle: &ConnectionHandle, text: &str) -> String {
        let (query_id, request) = parse_message(text);
        let reply = match request {
            Ok(request) => self.handle(handle, request),
            Err(e) => {
                debug!(connection = %handle.id(), error = %e, "malformed request");
                Reply::error(&e)
            }
        };
        reply.with_query_id(query_id).to_json()
    }

    /// Drain queued change events on the calling thread.
    pub fn dispatch(&self) -> DispatchStats {
        self.notifier.dispatch()
    }

    /// Start the background dispatch loop.
    pub fn start_dispatcher(&self) -> Result<Dispatcher> {
        self.notifier.spawn()
    }

    fn execute(&self, connection: &Connection, request: Request) -> Result<Response> {
        let user = connection.user();
        match request {
            Request::Sub { sub } => self.subscribe(connection, sub),
            Request::Insert { query, insert } => self
                .mutations
                .insert(user, &query.visor, &insert)
                .map(Response::inserted),
            Request::Update { update } => {
                self.mutations.update(user, &update).map(|_| Response::ok())
            }
            Request::Delete { delete } => {
                self.mutations.delete(user, &delete).map(|_| Response::ok())
            }
        }
    }

    /// Resolve a new set and make it the connection's observed state. The
    /// state lock is held across resolution, so a refresh of the previous
    /// set runs wholly before or after it.
    fn subscribe(&self, connection: &Connection, set: SubscriptionSet) -> Result<Response> {
        let mut state = connection.state();
        if state.is_closed() {
            return Err(SyncError::InvalidRequest("connection closed".to_string()));
        }

        let resolution = self.resolver.resolve(connection.user(), &set)?;
        state.replace(set, &resolution);
        Ok(Response::Document(resolution))
    }
}
