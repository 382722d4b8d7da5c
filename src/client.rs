pub(crate) mod executor;
pub mod options;
pub mod session;
#[cfg(test)]
mod test;

use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
        Mutex,
        PoisonError,
        Weak,
    },
};

use derive_where::derive_where;
use serde::de::DeserializeOwned;
use tokio::runtime::Handle;

use crate::{
    bson::Document,
    change_stream::{event::ChangeStreamEvent, options::ChangeStreamOptions, ChangeStream},
    cmap::{Connection, ConnectionPool, PoolStatus},
    concern::{ReadConcern, WriteConcern},
    db::Database,
    error::{Error, Result},
    event::{
        command::{CommandEvent, CommandEventHandler, CommandHandlers},
        sdam::{SdamEvent, SdamEventHandler, SdamHandlers},
    },
    operation::{AggregateTarget, ListDatabases},
    options::{
        ClientOptions,
        DatabaseOptions,
        ListDatabasesOptions,
        ReadPreference,
        SelectionCriteria,
        ServerAddress,
        SessionOptions,
    },
    results::{DatabaseSpecification, ListDatabasesResult},
    runtime,
};

use self::{
    executor::{ExecutionFuture, OperationExecutor},
    session::{ClientSession, ClusterTime, WithSession},
};

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// This is the main entry point for the API. A `Client` is used to connect to a MongoDB
/// deployment. It monitors the topology of the deployment in the background, keeping track of
/// servers as they are added, removed or change roles.
///
/// `Client` uses [`std::sync::Arc`](https://doc.rust-lang.org/std/sync/struct.Arc.html) internally,
/// so it can safely be shared across threads or async tasks. For example:
///
/// ```rust
/// # use mongodb_core::{bson::doc, Client, error::Result};
/// #
/// # async fn start_workers() -> Result<()> {
/// let client = Client::with_uri_str("mongodb://example.com", None)?;
///
/// let mut workers = Vec::new();
/// for i in 0..5 {
///     let client_ref = client.clone();
///
///     workers.push(tokio::spawn(async move {
///         let db = client_ref.database(&format!("items{}", i));
///         db.run_command(doc! { "ping": 1 }, None).await
///     }));
/// }
/// for worker in workers {
///     let _ = worker.await;
/// }
///
/// client.shutdown().await?;
/// # Ok(())
/// # }
/// ```
///
/// ## Threading model
/// Every operation runs on one of a fixed number of blocking worker threads (`threadPoolSize`,
/// five by default), which bounds how many operations block on the network at once. The futures
/// returned by the client complete once the worker is done, and never block the task polling
/// them.
///
/// ## Shutdown
/// A client must be shut down with [`Client::shutdown`] or
/// [`Client::sync_shutdown`] before its last handle is dropped. Dropping a client that was never
/// shut down is a programming error: it is logged and, in debug builds, trips an assertion.
#[derive(Clone, Debug)]
pub struct Client {
    inner: Arc<ClientInner>,
}

#[derive_where(Debug)]
struct ClientInner {
    id: u64,
    options: ClientOptions,
    #[derive_where(skip)]
    runtime: Handle,
    pool: ConnectionPool,
    executor: OperationExecutor,
    read_concern: Option<ReadConcern>,
    write_concern: Option<WriteConcern>,
    selection_criteria: Option<SelectionCriteria>,
    closed: AtomicBool,
    cluster_time: Mutex<Option<ClusterTime>>,
    command_handlers: CommandHandlers,
    sdam_handlers: Arc<SdamHandlers>,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::SeqCst) {
            tracing::error!(
                clientId = self.id,
                "Client dropped without being shut down; call Client::shutdown first",
            );
            if !std::thread::panicking() {
                debug_assert!(
                    false,
                    "Client {} was dropped without being shut down",
                    self.id
                );
            }
        }
    }
}

impl PartialEq for Client {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for Client {}

impl Client {
    /// Creates a new `Client` connected to the deployment specified by `uri`. `uri` must be a
    /// valid MongoDB connection string.
    ///
    /// Fields set in `options` take precedence over the same options given in `uri`, which in
    /// turn take precedence over the defaults. See the documentation on
    /// [`ClientOptions::parse`] for the supported connection string options.
    ///
    /// This must be called from within a tokio runtime.
    pub fn with_uri_str(
        uri: impl AsRef<str>,
        options: impl Into<Option<ClientOptions>>,
    ) -> Result<Self> {
        let mut parsed = ClientOptions::parse(uri.as_ref())?;
        let mut options = options.into().unwrap_or_default();
        if options.hosts.is_empty() {
            options.hosts = std::mem::take(&mut parsed.hosts);
        }
        options.merge(parsed);
        Client::with_options(options)
    }

    /// Creates a new `Client` connected to the deployment specified by `options`. With no hosts
    /// given, the client connects to `localhost:27017`.
    ///
    /// This must be called from within a tokio runtime.
    pub fn with_options(mut options: ClientOptions) -> Result<Self> {
        if options.hosts.is_empty() {
            options.hosts = vec![ServerAddress::default()];
        }
        options.validate()?;
        let runtime = runtime::current()?;
        let id = NEXT_CLIENT_ID.fetch_add(1, Ordering::SeqCst);

        let sdam_handlers = Arc::new(SdamHandlers::default());
        let pool = ConnectionPool::new(&options, sdam_handlers.clone(), runtime.clone());
        let executor =
            OperationExecutor::new(runtime.clone(), options.effective_thread_pool_size());

        // Concerns equal to the server's own defaults are treated as unset.
        let read_concern = options
            .read_concern
            .clone()
            .filter(|rc| !rc.is_server_default());
        let write_concern = options
            .write_concern
            .clone()
            .filter(|wc| !wc.is_server_default());
        let selection_criteria = options
            .read_preference
            .map(SelectionCriteria::ReadPreference);

        tracing::debug!(
            clientId = id,
            hosts = ?options.hosts,
            "Client created",
        );

        Ok(Self {
            inner: Arc::new(ClientInner {
                id,
                options,
                runtime,
                pool,
                executor,
                read_concern,
                write_concern,
                selection_criteria,
                closed: AtomicBool::new(false),
                cluster_time: Mutex::new(None),
                command_handlers: CommandHandlers::default(),
                sdam_handlers,
            }),
        })
    }

    /// The process-unique id of this client.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// The options this client was created with, after merging in the connection string.
    pub fn options(&self) -> &ClientOptions {
        &self.inner.options
    }

    /// Gets the default selection criteria the `Client` uses for operations.
    pub fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        self.inner.selection_criteria.as_ref()
    }

    /// Gets the default read concern the `Client` uses for operations.
    pub fn read_concern(&self) -> Option<&ReadConcern> {
        self.inner.read_concern.as_ref()
    }

    /// Gets the default write concern the `Client` uses for operations.
    pub fn write_concern(&self) -> Option<&WriteConcern> {
        self.inner.write_concern.as_ref()
    }

    /// A snapshot of the connection pool's accounting.
    pub fn pool_status(&self) -> PoolStatus {
        self.inner.pool.status()
    }

    /// Gets a handle to a database specified by `name` in the deployment the `Client` is
    /// connected to. The `Database` options (e.g. read preference and write concern) will default
    /// to those of the `Client`.
    ///
    /// This method does not send or receive anything across the wire to the database, so it can be
    /// used repeatedly without incurring any costs from I/O.
    pub fn database(&self, name: &str) -> Database {
        Database::new(self.clone(), name, None)
    }

    /// Gets a handle to a database specified by `name` in the deployment the `Client` is
    /// connected to. Operations done with this `Database` will use the options specified by
    /// `options` by default and will otherwise default to those of the `Client`.
    ///
    /// This method does not send or receive anything across the wire to the database, so it can be
    /// used repeatedly without incurring any costs from I/O.
    pub fn database_with_options(&self, name: &str, options: DatabaseOptions) -> Database {
        Database::new(self.clone(), name, Some(options))
    }

    /// Starts a new [`ClientSession`].
    pub fn start_session(
        &self,
        options: impl Into<Option<SessionOptions>>,
    ) -> Result<ClientSession> {
        if self.is_closed() {
            return Err(Error::client_closed());
        }
        let options = options.into();
        if let Some(write_concern) = options
            .as_ref()
            .and_then(|o| o.default_transaction_options.as_ref())
            .and_then(|t| t.write_concern.as_ref())
        {
            write_concern.validate()?;
        }
        Ok(ClientSession::new(self, options))
    }

    /// Starts a session, runs `body` with it, and ends the session once the future returned by
    /// `body` completes. The returned future resolves to the body's result only after the
    /// session has ended, so any connection it held is back in the pool by then.
    ///
    /// If `body` fails before producing a future, the session is still ended and that error is
    /// returned. Errors from ending the session are not reported.
    ///
    /// ```rust
    /// # use mongodb_core::{bson::doc, Client, error::Result};
    /// # async fn run(client: &Client) -> Result<()> {
    /// let db = client.database("inventory");
    /// let reply = client
    ///     .with_session(None, move |session| {
    ///         Ok(async move { db.run_command(doc! { "ping": 1 }, Some(&session)).await })
    ///     })
    ///     .await?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn with_session<F, Fut, T>(
        &self,
        options: impl Into<Option<SessionOptions>>,
        body: F,
    ) -> ExecutionFuture<T>
    where
        F: FnOnce(ClientSession) -> Result<Fut>,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let session = match self.start_session(options) {
            Ok(session) => session,
            Err(error) => return ExecutionFuture::ready(Err(error)),
        };
        let body = body(session.clone());
        let with_session = WithSession::new(session, body);

        let (promise, future) = OperationExecutor::make_promise();
        self.inner.runtime.spawn(async move {
            promise.complete(with_session.await);
        });
        future
    }

    /// Leases a connection from the pool, or `session`'s pinned connection if it has one. The
    /// connection can be passed to [`Client::execute_operation`], which returns it to the pool
    /// afterwards.
    pub fn acquire_connection(&self, session: Option<&ClientSession>) -> ExecutionFuture<Connection> {
        if self.is_closed() {
            return ExecutionFuture::ready(Err(Error::client_closed()));
        }
        let pool = self.inner.pool.clone();
        let session = session.cloned();
        let criteria = self
            .selection_criteria()
            .cloned()
            .unwrap_or(SelectionCriteria::ReadPreference(ReadPreference::Primary));
        self.inner
            .executor
            .run_blocking(move || pool.acquire_connection(session.as_ref(), &criteria))
    }

    /// Gets information about each database present in the deployment the Client is connected
    /// to.
    pub async fn list_databases(
        &self,
        filter: impl Into<Option<Document>>,
        options: impl Into<Option<ListDatabasesOptions>>,
        session: Option<&ClientSession>,
    ) -> Result<Vec<DatabaseSpecification>> {
        let op = ListDatabases::new(filter.into(), false, options.into());
        match self.execute_operation(op, None, session).await? {
            ListDatabasesResult::Specs(specs) => Ok(specs),
            ListDatabasesResult::Names(_) => Err(Error::internal(
                "listDatabases returned names when full specifications were requested",
            )),
        }
    }

    /// Gets the names of the databases present in the deployment the Client is connected to.
    pub async fn list_database_names(
        &self,
        filter: impl Into<Option<Document>>,
        options: impl Into<Option<ListDatabasesOptions>>,
        session: Option<&ClientSession>,
    ) -> Result<Vec<String>> {
        let op = ListDatabases::new(filter.into(), true, options.into());
        match self.execute_operation(op, None, session).await? {
            ListDatabasesResult::Names(names) => Ok(names),
            ListDatabasesResult::Specs(_) => Err(Error::internal(
                "listDatabases returned full specifications when only names were requested",
            )),
        }
    }

    /// Gets a [`Database`] handle for each database present in the deployment.
    pub async fn list_mongo_databases(
        &self,
        filter: impl Into<Option<Document>>,
        options: impl Into<Option<ListDatabasesOptions>>,
        session: Option<&ClientSession>,
    ) -> Result<Vec<Database>> {
        let names = self.list_database_names(filter, options, session).await?;
        Ok(names.iter().map(|name| self.database(name)).collect())
    }

    /// Starts a new [`ChangeStream`] that receives events for all changes in the deployment.
    ///
    /// Change streams require a replica set or sharded cluster.
    pub async fn watch(
        &self,
        pipeline: impl IntoIterator<Item = Document>,
        options: impl Into<Option<ChangeStreamOptions>>,
        session: Option<&ClientSession>,
    ) -> Result<ChangeStream<ChangeStreamEvent<Document>>> {
        self.watch_with_event_type(pipeline, options, session).await
    }

    /// Like [`Client::watch`], but decodes the `fullDocument` of each event as a `T`.
    pub async fn watch_with_full_document_type<T>(
        &self,
        pipeline: impl IntoIterator<Item = Document>,
        options: impl Into<Option<ChangeStreamOptions>>,
        session: Option<&ClientSession>,
    ) -> Result<ChangeStream<ChangeStreamEvent<T>>>
    where
        T: DeserializeOwned + Unpin + Send + Sync + 'static,
    {
        self.watch_with_event_type(pipeline, options, session).await
    }

    /// Like [`Client::watch`], but decodes each event as an `E`. Useful when the pipeline
    /// reshapes events.
    pub async fn watch_with_event_type<E>(
        &self,
        pipeline: impl IntoIterator<Item = Document>,
        options: impl Into<Option<ChangeStreamOptions>>,
        session: Option<&ClientSession>,
    ) -> Result<ChangeStream<E>>
    where
        E: DeserializeOwned + Unpin + Send + Sync + 'static,
    {
        ChangeStream::open(
            self.clone(),
            AggregateTarget::Database("admin".to_string()),
            true,
            pipeline.into_iter().collect(),
            options.into(),
            self.read_concern().cloned(),
            self.selection_criteria().cloned(),
            session,
        )
        .await
    }

    /// Registers a handler for command events. The client holds it weakly, so the caller must
    /// keep `handler` alive for as long as it wants events.
    pub fn add_command_event_handler<H>(&self, handler: &Arc<H>)
    where
        H: CommandEventHandler + 'static,
    {
        let handler: Weak<H> = Arc::downgrade(handler);
        self.inner.command_handlers.add_observer(handler);
    }

    /// Registers a callback for command events. The client keeps the callback for the rest of
    /// its lifetime.
    pub fn add_command_event_callback(
        &self,
        callback: impl Fn(CommandEvent) + Send + Sync + 'static,
    ) {
        self.inner.command_handlers.add_callback(callback);
    }

    /// Registers a handler for SDAM events. The client holds it weakly, so the caller must keep
    /// `handler` alive for as long as it wants events.
    pub fn add_sdam_event_handler<H>(&self, handler: &Arc<H>)
    where
        H: SdamEventHandler + 'static,
    {
        let handler: Weak<H> = Arc::downgrade(handler);
        self.inner.sdam_handlers.add_observer(handler);
    }

    /// Registers a callback for SDAM events. The client keeps the callback for the rest of its
    /// lifetime.
    pub fn add_sdam_event_callback(&self, callback: impl Fn(SdamEvent) + Send + Sync + 'static) {
        self.inner.sdam_handlers.add_callback(callback);
    }

    /// Shuts the client down: closes the connection pool, then waits for scheduled operations to
    /// finish and stops the worker threads and the topology monitor.
    ///
    /// Shutting down an already closed client does nothing. Any other use of the client after
    /// shutdown fails with a "client closed" error. Sessions should be ended before shutting
    /// down; a session's pinned connection is closed when it is released afterwards.
    pub async fn shutdown(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.pool.shutdown();
        self.inner.executor.close().await;
        self.inner.pool.topology().wait_for_monitor().await;
        tracing::debug!(clientId = self.inner.id, "Client shut down");
        Ok(())
    }

    /// Blocking version of [`Client::shutdown`].
    ///
    /// # Panics
    ///
    /// Panics if called from within an asynchronous execution context.
    pub fn sync_shutdown(&self) -> Result<()> {
        self.inner.runtime.block_on(self.shutdown())
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn pool(&self) -> &ConnectionPool {
        &self.inner.pool
    }

    pub(crate) fn executor(&self) -> &OperationExecutor {
        &self.inner.executor
    }

    pub(crate) fn command_handlers(&self) -> &CommandHandlers {
        &self.inner.command_handlers
    }

    pub(crate) fn runtime(&self) -> &Handle {
        &self.inner.runtime
    }

    /// The highest cluster time this client has seen.
    pub(crate) fn cluster_time(&self) -> Option<ClusterTime> {
        self.inner
            .cluster_time
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn advance_cluster_time(&self, to: &ClusterTime) {
        let mut current = self
            .inner
            .cluster_time
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if current.as_ref().map_or(true, |ct| ct < to) {
            *current = Some(to.clone());
        }
    }

    pub(crate) fn weak(&self) -> WeakClient {
        WeakClient {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

/// A reference to a [`Client`] that does not keep it alive.
#[derive(Clone, Debug)]
pub(crate) struct WeakClient {
    inner: Weak<ClientInner>,
}

impl WeakClient {
    pub(crate) fn upgrade(&self) -> Option<Client> {
        self.inner.upgrade().map(|inner| Client { inner })
    }
}
