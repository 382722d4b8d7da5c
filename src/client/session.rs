mod cluster_time;
#[cfg(test)]
mod test;
mod with_session;

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use bson::{doc, spec::BinarySubtype, Binary, Document, Timestamp};
use uuid::Uuid;

pub use self::cluster_time::ClusterTime;
pub(crate) use self::with_session::WithSession;
use super::{Client, WeakClient};
use crate::{
    cmap::{Command, Connection},
    error::{Error, Result},
    operation::{AbortTransaction, CommitTransaction},
    options::{ReadPreference, SessionOptions, TransactionOptions},
    selection_criteria::SelectionCriteria,
};

/// A MongoDB client session. This struct represents a logical session used for ordering sequential
/// operations. To create a `ClientSession`, call [`Client::start_session`].
///
/// A `ClientSession` is a cheap handle: clones refer to the same session. The session keeps only a
/// weak reference to its client, so it never keeps the client alive. A session must be ended with
/// [`ClientSession::end`], after which any use of it fails with a logic error.
///
/// ## Transactions
/// Starting a transaction pins one connection to the session. Every operation issued through the
/// session then runs on that connection until the transaction is committed or aborted.
///
/// ```rust
/// # use mongodb_core::{bson::doc, error::Result, Client};
/// #
/// # async fn do_stuff(client: &Client) -> Result<()> {
/// let session = client.start_session(None)?;
/// session.start_transaction(None).await?;
/// client
///     .database("inventory")
///     .run_command(doc! { "ping": 1 }, Some(&session))
///     .await?;
/// session.commit_transaction().await?;
/// session.end().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct ClientSession {
    inner: Arc<SessionInner>,
}

#[derive(Debug)]
pub(crate) struct SessionInner {
    id: Document,
    client_id: u64,
    client: WeakClient,
    options: Option<SessionOptions>,
    state: Mutex<SessionState>,
    pin: Mutex<PinSlot>,
    pin_released: Condvar,
}

#[derive(Debug, Default)]
struct SessionState {
    ended: bool,
    cluster_time: Option<ClusterTime>,
    operation_time: Option<Timestamp>,
    transaction: Transaction,
}

#[derive(Debug, Default)]
struct Transaction {
    state: TransactionState,
    txn_number: i64,
    options: Option<TransactionOptions>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) enum TransactionState {
    #[default]
    None,
    Starting,
    InProgress,
    Committed,
    Aborted,
}

/// Where a session's pinned connection currently is.
#[derive(Debug, Default)]
enum PinSlot {
    #[default]
    Unpinned,
    /// Pinned and idle.
    Parked(Connection),
    /// Pinned and leased to one of the session's operations.
    InUse,
}

impl ClientSession {
    pub(crate) fn new(client: &Client, options: Option<SessionOptions>) -> Self {
        let uuid = Uuid::new_v4();
        tracing::trace!(
            clientId = client.id(),
            lsid = %hex::encode(uuid.as_bytes()),
            "Session started",
        );
        let id = doc! {
            "id": Binary {
                subtype: BinarySubtype::Uuid,
                bytes: uuid.as_bytes().to_vec(),
            }
        };
        Self {
            inner: Arc::new(SessionInner {
                id,
                client_id: client.id(),
                client: client.weak(),
                options,
                state: Mutex::new(SessionState::default()),
                pin: Mutex::new(PinSlot::Unpinned),
                pin_released: Condvar::new(),
            }),
        }
    }

    /// The id of this session.
    pub fn id(&self) -> &Document {
        &self.inner.id
    }

    /// The client used to create this session, if it has not been dropped.
    pub fn client(&self) -> Option<Client> {
        self.inner.client.upgrade()
    }

    /// The options used to create this session.
    pub fn options(&self) -> Option<&SessionOptions> {
        self.inner.options.as_ref()
    }

    /// Whether [`end`](ClientSession::end) has been called.
    pub fn is_ended(&self) -> bool {
        self.inner.lock_state().ended
    }

    /// Whether a connection is pinned to this session.
    pub fn is_pinned(&self) -> bool {
        self.inner.is_pinned()
    }

    /// The highest seen cluster time this session has seen so far.
    /// This will be `None` if this session has not been used in an operation yet.
    pub fn cluster_time(&self) -> Option<ClusterTime> {
        self.inner.lock_state().cluster_time.clone()
    }

    /// Set the cluster time to the provided one if it is greater than this session's highest seen
    /// cluster time or if this session's cluster time is `None`.
    pub fn advance_cluster_time(&self, to: &ClusterTime) {
        let mut state = self.inner.lock_state();
        if state.cluster_time.as_ref().map_or(true, |current| current < to) {
            state.cluster_time = Some(to.clone());
        }
    }

    /// The operation time returned by the last operation executed in this session.
    pub fn operation_time(&self) -> Option<Timestamp> {
        self.inner.lock_state().operation_time
    }

    /// Advance operation time for this session. If the provided timestamp is earlier than this
    /// session's current operation time, then the operation time is unchanged.
    pub fn advance_operation_time(&self, ts: Timestamp) {
        let mut state = self.inner.lock_state();
        let advance = match state.operation_time {
            Some(current) => (current.time, current.increment) < (ts.time, ts.increment),
            None => true,
        };
        if advance {
            state.operation_time = Some(ts);
        }
    }

    pub(crate) fn inner(&self) -> &Arc<SessionInner> {
        &self.inner
    }

    pub(crate) fn client_id(&self) -> u64 {
        self.inner.client_id
    }

    pub(crate) fn causal_consistency(&self) -> bool {
        self.options()
            .and_then(|opts| opts.causal_consistency)
            .unwrap_or(true)
    }

    pub(crate) fn transaction_state(&self) -> TransactionState {
        self.inner.lock_state().transaction.state
    }

    pub(crate) fn in_transaction(&self) -> bool {
        matches!(
            self.transaction_state(),
            TransactionState::Starting | TransactionState::InProgress
        )
    }

    /// Adds the transaction fields for the session's current transaction, if any, to `command`.
    pub(crate) fn apply_transaction_fields(&self, command: &mut Command) {
        let state = self.inner.lock_state();
        let transaction = &state.transaction;
        match transaction.state {
            TransactionState::Starting => {
                command.set_txn_number(transaction.txn_number);
                command.set_start_transaction();
                command.set_autocommit();
                let read_concern = transaction
                    .options
                    .as_ref()
                    .and_then(|opts| opts.read_concern.as_ref())
                    .filter(|rc| !rc.is_server_default());
                if let Some(read_concern) = read_concern {
                    command.body.insert(
                        "readConcern",
                        read_concern.to_command_document(state.operation_time),
                    );
                }
            }
            TransactionState::InProgress => {
                command.set_txn_number(transaction.txn_number);
                command.set_autocommit();
                command.body.remove("readConcern");
            }
            _ => {}
        }
    }

    /// Records that the first command of a starting transaction has been sent.
    pub(crate) fn mark_transaction_sent(&self) {
        let mut state = self.inner.lock_state();
        if state.transaction.state == TransactionState::Starting {
            state.transaction.state = TransactionState::InProgress;
        }
    }

    fn live_client(&self) -> Result<Client> {
        match self.client() {
            Some(client) if !client.is_closed() => Ok(client),
            _ => Err(Error::client_closed()),
        }
    }

    /// Starts a new transaction on this session with the given `TransactionOptions`. If no options
    /// are provided, the session's `default_transaction_options` will be used.
    ///
    /// A connection is pinned to the session until the transaction is committed or aborted.
    pub async fn start_transaction(
        &self,
        options: impl Into<Option<TransactionOptions>>,
    ) -> Result<()> {
        let client = self.live_client()?;
        let options = {
            let mut state = self.inner.lock_state();
            if state.ended {
                return Err(Error::session_ended());
            }
            if matches!(
                state.transaction.state,
                TransactionState::Starting | TransactionState::InProgress
            ) {
                return Err(Error::logic("Transaction already in progress"));
            }

            let mut options = options.into();
            if let Some(defaults) = self
                .options()
                .and_then(|opts| opts.default_transaction_options.as_ref())
            {
                let options = options.get_or_insert_with(Default::default);
                merge_options!(defaults, options, [read_concern, write_concern, read_preference]);
            }
            if let Some(write_concern) = options.as_ref().and_then(|o| o.write_concern.as_ref()) {
                write_concern.validate()?;
            }

            state.transaction.txn_number += 1;
            state.transaction.state = TransactionState::Starting;
            state.transaction.options = options.clone();
            options
        };

        let criteria = SelectionCriteria::ReadPreference(
            options
                .and_then(|o| o.read_preference)
                .unwrap_or(ReadPreference::Primary),
        );
        let pool = client.pool().clone();
        let session = self.clone();
        let pinned = client
            .executor()
            .run_blocking(move || pool.pin(&session, &criteria))
            .await;
        if let Err(error) = pinned {
            self.inner.lock_state().transaction.state = TransactionState::None;
            return Err(error);
        }
        Ok(())
    }

    /// Commits the transaction that is currently active on this session.
    ///
    /// A transaction in which no operation ran commits without contacting the server.
    pub async fn commit_transaction(&self) -> Result<()> {
        let (state, write_concern) = self.transaction_snapshot()?;
        match state {
            TransactionState::None => Err(Error::logic("No transaction started")),
            TransactionState::Aborted => Err(Error::logic(
                "Cannot call commitTransaction after calling abortTransaction",
            )),
            TransactionState::Committed => Err(Error::logic("Transaction already committed")),
            TransactionState::Starting => {
                self.finish_transaction(TransactionState::Committed).await;
                Ok(())
            }
            TransactionState::InProgress => {
                let client = self.live_client()?;
                client
                    .execute_operation(CommitTransaction::new(write_concern), None, Some(self))
                    .await?;
                self.finish_transaction(TransactionState::Committed).await;
                Ok(())
            }
        }
    }

    /// Aborts the transaction that is currently active on this session. Errors reported by the
    /// server are ignored.
    pub async fn abort_transaction(&self) -> Result<()> {
        let (state, write_concern) = self.transaction_snapshot()?;
        match state {
            TransactionState::None => Err(Error::logic("No transaction started")),
            TransactionState::Committed => Err(Error::logic(
                "Cannot call abortTransaction after calling commitTransaction",
            )),
            TransactionState::Aborted => Err(Error::logic("Cannot call abortTransaction twice")),
            TransactionState::Starting => {
                self.finish_transaction(TransactionState::Aborted).await;
                Ok(())
            }
            TransactionState::InProgress => {
                let client = self.live_client()?;
                let _: Result<()> = client
                    .execute_operation(AbortTransaction::new(write_concern), None, Some(self))
                    .await;
                self.finish_transaction(TransactionState::Aborted).await;
                Ok(())
            }
        }
    }

    fn transaction_snapshot(
        &self,
    ) -> Result<(TransactionState, Option<crate::options::WriteConcern>)> {
        let state = self.inner.lock_state();
        if state.ended {
            return Err(Error::session_ended());
        }
        let write_concern = state
            .transaction
            .options
            .as_ref()
            .and_then(|opts| opts.write_concern.clone());
        Ok((state.transaction.state, write_concern))
    }

    async fn finish_transaction(&self, outcome: TransactionState) {
        self.inner.lock_state().transaction.state = outcome;
        self.release_pin().await;
    }

    /// Returns the pinned connection, if any, to the pool. This runs on a plain blocking thread
    /// rather than the executor so it still works once the executor is closed.
    async fn release_pin(&self) {
        if !self.is_pinned() {
            return;
        }
        match self.client() {
            Some(client) => {
                let pool = client.pool().clone();
                let session = self.clone();
                let _: std::result::Result<(), _> =
                    tokio::task::spawn_blocking(move || pool.unpin(&session)).await;
            }
            None => {
                // The pool is gone. Clearing the slot drops a parked connection without waiting
                // for one that is still in use.
                self.inner.clear_pin();
            }
        }
    }

    /// Ends this session, releasing any pinned connection back to the pool. An in-progress
    /// transaction is aborted first, ignoring the outcome.
    ///
    /// Ending a session that has already ended does nothing. This never fails, even after the
    /// client was shut down.
    pub async fn end(&self) {
        let abort = {
            let mut state = self.inner.lock_state();
            if state.ended {
                return;
            }
            state.ended = true;
            (state.transaction.state == TransactionState::InProgress).then(|| {
                state
                    .transaction
                    .options
                    .as_ref()
                    .and_then(|o| o.write_concern.clone())
            })
        };

        if let Some(write_concern) = abort {
            if let Ok(client) = self.live_client() {
                let _: Result<()> = client
                    .executor()
                    .schedule(AbortTransaction::new(write_concern), None, &client, Some(self))
                    .await;
            }
        }

        {
            let mut state = self.inner.lock_state();
            if matches!(
                state.transaction.state,
                TransactionState::Starting | TransactionState::InProgress
            ) {
                state.transaction.state = TransactionState::Aborted;
            }
        }
        self.release_pin().await;
        tracing::trace!(lsid = %self.inner.hex_id(), "Session ended");
    }
}

impl SessionInner {
    /// The session's UUID as lowercase hex, for logging.
    fn hex_id(&self) -> String {
        match self.id.get_binary_generic("id") {
            Ok(bytes) => hex::encode(bytes),
            Err(_) => String::new(),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_pin(&self) -> MutexGuard<'_, PinSlot> {
        self.pin.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn is_pinned(&self) -> bool {
        !matches!(*self.lock_pin(), PinSlot::Unpinned)
    }

    /// Takes the pinned connection out of the slot, marking it in use. Blocks while another
    /// operation of this session holds it. Returns `None` if the session is not pinned.
    pub(crate) fn take_pinned_connection(&self) -> Option<Connection> {
        let mut slot = self.lock_pin();
        loop {
            match std::mem::take(&mut *slot) {
                PinSlot::Parked(connection) => {
                    *slot = PinSlot::InUse;
                    return Some(connection);
                }
                PinSlot::InUse => {
                    *slot = PinSlot::InUse;
                    slot = self
                        .pin_released
                        .wait(slot)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                PinSlot::Unpinned => return None,
            }
        }
    }

    /// Puts a pinned connection back in the slot after an operation used it.
    pub(crate) fn park_pinned_connection(&self, connection: Connection) {
        *self.lock_pin() = PinSlot::Parked(connection);
        self.pin_released.notify_all();
    }

    /// Marks the session unpinned. Operations waiting for the pinned connection fall back to the
    /// pool.
    pub(crate) fn clear_pin(&self) {
        let previous = std::mem::take(&mut *self.lock_pin());
        self.pin_released.notify_all();
        drop(previous);
    }
}
