//! The connection pool: a bounded set of connections to the servers of one deployment.

pub(crate) mod conn;
pub(crate) mod establish;

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
        Condvar,
        Mutex,
        MutexGuard,
        PoisonError,
    },
    time::{Duration, Instant},
};

use tokio::runtime::Handle;

pub use self::conn::{
    command::{Command, RawCommandResponse},
    stream::{ConnectOptions, Connector, TcpConnector, WireStream},
    stream_description::StreamDescription,
    Connection,
};
use self::establish::ConnectionEstablisher;
use crate::{
    client::session::ClientSession,
    error::{Error, Result},
    event::sdam::SdamHandlers,
    options::{ClientOptions, ServerAddress},
    sdam::Topology,
    selection_criteria::SelectionCriteria,
    trace::{TracingRepresentation, CONNECTION_TRACING_EVENT_TARGET},
};

/// A snapshot of the pool's accounting.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[non_exhaustive]
pub struct PoolStatus {
    /// Connections that are open or being opened, whether leased or idle.
    pub total: u32,

    /// Connections leased to operations or pinned to sessions.
    pub in_use: u32,

    /// Idle connections waiting in the pool.
    pub available: u32,

    /// The most connections the pool will hold at once.
    pub max_pool_size: u32,
}

#[derive(Debug, Default)]
struct PoolState {
    available: VecDeque<Connection>,
    total: u32,
    in_use: u32,
    closed: bool,
}

/// A pool of connections to every server in the topology.
///
/// The pool is a cheap handle. All blocking methods must be called from worker threads, never
/// from an async context.
#[derive(Clone, Debug)]
pub(crate) struct ConnectionPool {
    inner: Arc<ConnectionPoolInner>,
}

#[derive(Debug)]
pub(crate) struct ConnectionPoolInner {
    state: Mutex<PoolState>,
    connection_available: Condvar,
    max_pool_size: u32,
    wait_queue_timeout: Option<Duration>,
    establisher: ConnectionEstablisher,
    topology: Topology,
    next_connection_id: AtomicU32,
}

impl ConnectionPool {
    pub(crate) fn new(
        options: &ClientOptions,
        sdam_handlers: Arc<SdamHandlers>,
        runtime: Handle,
    ) -> Self {
        let establisher = ConnectionEstablisher::new(options);
        let topology = Topology::new(options, establisher.clone(), sdam_handlers, runtime);
        let max_pool_size = options.effective_max_pool_size();

        tracing::debug!(
            target: CONNECTION_TRACING_EVENT_TARGET,
            maxPoolSize = max_pool_size,
            waitQueueTimeoutMS = options.wait_queue_timeout.map(|t| t.as_millis()),
            "Connection pool created",
        );

        Self {
            inner: Arc::new(ConnectionPoolInner {
                state: Mutex::new(PoolState::default()),
                connection_available: Condvar::new(),
                max_pool_size,
                wait_queue_timeout: options.wait_queue_timeout,
                establisher,
                topology,
                // Id 0 is reserved for monitoring connections.
                next_connection_id: AtomicU32::new(1),
            }),
        }
    }

    pub(crate) fn topology(&self) -> &Topology {
        &self.inner.topology
    }

    /// Leases a connection to a server matching `criteria`.
    ///
    /// If `session` holds a pinned connection, that connection is returned instead; when another
    /// operation of the same session is using it, this waits until it is released.
    pub(crate) fn acquire_connection(
        &self,
        session: Option<&ClientSession>,
        criteria: &SelectionCriteria,
    ) -> Result<Connection> {
        if self.is_closed() {
            return Err(Error::pool_closed());
        }

        if let Some(connection) = session.and_then(|s| s.inner().take_pinned_connection()) {
            tracing::trace!(
                target: CONNECTION_TRACING_EVENT_TARGET,
                driverConnectionId = connection.id,
                "Reusing pinned connection",
            );
            return Ok(connection);
        }

        let address = self.inner.topology.select_server(criteria)?;
        self.check_out(&address)
    }

    /// Leases a connection to the server at `address`, opening a new one if none is idle and the
    /// pool has room.
    pub(crate) fn check_out(&self, address: &ServerAddress) -> Result<Connection> {
        let deadline = self.inner.wait_queue_timeout.map(|t| Instant::now() + t);
        let mut evicted = Vec::new();
        let mut state = self.inner.lock_state();

        loop {
            if state.closed {
                return Err(Error::pool_closed());
            }

            if let Some(index) = state.available.iter().rposition(|c| &c.address == address) {
                if let Some(mut connection) = state.available.remove(index) {
                    state.in_use += 1;
                    drop(state);
                    drop(evicted);
                    connection.pool = Some(Arc::downgrade(&self.inner));
                    tracing::debug!(
                        target: CONNECTION_TRACING_EVENT_TARGET,
                        serverAddress = address.tracing_representation(),
                        driverConnectionId = connection.id,
                        "Connection checked out",
                    );
                    return Ok(connection);
                }
            }

            if state.total < self.inner.max_pool_size {
                state.total += 1;
                state.in_use += 1;
                break;
            }

            // Full, but some idle connections belong to other servers; make room.
            if let Some(idle) = state.available.pop_front() {
                state.total -= 1;
                evicted.push(idle);
                continue;
            }

            state = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        drop(state);
                        tracing::debug!(
                            target: CONNECTION_TRACING_EVENT_TARGET,
                            serverAddress = address.tracing_representation(),
                            "Connection checkout failed",
                        );
                        return Err(Error::wait_queue_timeout(address));
                    }
                    self.inner
                        .connection_available
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
                None => self
                    .inner
                    .connection_available
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
            };
        }
        drop(state);
        for connection in evicted {
            close_connection(connection, "idle connection evicted to make room");
        }

        let id = self.inner.next_connection_id.fetch_add(1, Ordering::SeqCst);
        match self.inner.establisher.establish_connection(id, address) {
            Ok(mut connection) => {
                connection.pool = Some(Arc::downgrade(&self.inner));
                tracing::debug!(
                    target: CONNECTION_TRACING_EVENT_TARGET,
                    serverAddress = address.tracing_representation(),
                    driverConnectionId = id,
                    "Connection created",
                );
                Ok(connection)
            }
            Err(error) => {
                {
                    let mut state = self.inner.lock_state();
                    state.total -= 1;
                    state.in_use -= 1;
                }
                self.inner.connection_available.notify_one();
                if error.is_network_error() {
                    self.inner
                        .topology
                        .updater()
                        .mark_server_unknown(address.clone(), error.clone());
                }
                Err(error)
            }
        }
    }

    /// Returns a leased connection. A pinned connection goes back to its session instead of the
    /// pool, unless `unpin` is set or the connection is broken.
    pub(crate) fn release(&self, mut connection: Connection, unpin: bool) {
        if let Some(session) = connection.pinned_session() {
            if !unpin && !connection.is_broken() {
                session.park_pinned_connection(connection);
                return;
            }
            session.clear_pin();
            tracing::debug!(
                target: CONNECTION_TRACING_EVENT_TARGET,
                driverConnectionId = connection.id,
                "Connection unpinned",
            );
        }
        connection.pinned_to = None;
        self.check_in(connection);
    }

    fn check_in(&self, mut connection: Connection) {
        connection.pool = None;
        let mut state = self.inner.lock_state();
        state.in_use = state.in_use.saturating_sub(1);

        if state.closed || connection.is_broken() {
            state.total = state.total.saturating_sub(1);
            let reason = if state.closed {
                "pool closed"
            } else {
                "connection error"
            };
            drop(state);
            self.inner.connection_available.notify_one();
            close_connection(connection, reason);
            return;
        }

        tracing::debug!(
            target: CONNECTION_TRACING_EVENT_TARGET,
            serverAddress = connection.address.tracing_representation(),
            driverConnectionId = connection.id,
            "Connection checked in",
        );
        connection.ready_and_available_time = Some(Instant::now());
        state.available.push_back(connection);
        drop(state);
        self.inner.connection_available.notify_one();
    }

    /// Leases a connection and parks it in `session`'s pin slot, so every operation issued through
    /// the session runs on it until `unpin`. Does nothing if the session is already pinned.
    pub(crate) fn pin(&self, session: &ClientSession, criteria: &SelectionCriteria) -> Result<()> {
        if session.inner().is_pinned() {
            return Ok(());
        }
        let mut connection = self.acquire_connection(None, criteria)?;
        connection.pinned_to = Some(Arc::downgrade(session.inner()));
        tracing::debug!(
            target: CONNECTION_TRACING_EVENT_TARGET,
            driverConnectionId = connection.id,
            "Connection pinned",
        );
        session.inner().park_pinned_connection(connection);
        Ok(())
    }

    /// Returns `session`'s pinned connection, if any, to the pool. Waits for an operation that is
    /// using it to finish first.
    pub(crate) fn unpin(&self, session: &ClientSession) {
        if let Some(connection) = session.inner().take_pinned_connection() {
            self.release(connection, true);
        }
    }

    /// Closes every idle connection and rejects further checkouts. Leased connections are closed
    /// as they are returned. Calling this more than once has no further effect.
    pub(crate) fn shutdown(&self) {
        let idle = {
            let mut state = self.inner.lock_state();
            if state.closed {
                return;
            }
            state.closed = true;
            let idle: Vec<Connection> = state.available.drain(..).collect();
            state.total -= idle.len() as u32;
            idle
        };
        self.inner.connection_available.notify_all();
        for connection in idle {
            close_connection(connection, "pool closed");
        }
        self.inner.topology.shutdown();
        tracing::debug!(
            target: CONNECTION_TRACING_EVENT_TARGET,
            "Connection pool closed",
        );
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.inner.lock_state().closed
    }

    pub(crate) fn status(&self) -> PoolStatus {
        let state = self.inner.lock_state();
        PoolStatus {
            total: state.total,
            in_use: state.in_use,
            available: state.available.len() as u32,
            max_pool_size: self.inner.max_pool_size,
        }
    }

    /// Closes `connection` after a network error and marks its server unknown.
    pub(crate) fn handle_network_error(&self, connection: &mut Connection, error: &Error) {
        connection.mark_broken();
        self.inner
            .topology
            .updater()
            .mark_server_unknown(connection.address.clone(), error.clone());
    }
}

impl ConnectionPoolInner {
    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Frees the slot of a connection that was dropped while leased.
    pub(super) fn discard(&self, connection: &Connection) {
        {
            let mut state = self.lock_state();
            state.in_use = state.in_use.saturating_sub(1);
            state.total = state.total.saturating_sub(1);
        }
        self.connection_available.notify_one();
        tracing::debug!(
            target: CONNECTION_TRACING_EVENT_TARGET,
            serverAddress = connection.address.tracing_representation(),
            driverConnectionId = connection.id,
            reason = "dropped while checked out",
            "Connection closed",
        );
    }
}

fn close_connection(connection: Connection, reason: &'static str) {
    tracing::debug!(
        target: CONNECTION_TRACING_EVENT_TARGET,
        serverAddress = connection.address.tracing_representation(),
        driverConnectionId = connection.id,
        reason,
        "Connection closed",
    );
    connection.close();
}
