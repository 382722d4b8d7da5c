
use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    task::{Context, Poll},
    time::Instant,
};

use tokio::{
    runtime::Handle,
    sync::{oneshot, Notify, Semaphore},
};

use super::{session::ClientSession, Client};
use crate::{
    cmap::{conn::wire::next_request_id, Command, Connection, RawCommandResponse},
    error::{Error, Result},
    event::command::{
        handle_command_event,
        CommandEvent,
        CommandFailedEvent,
        CommandStartedEvent,
        CommandSucceededEvent,
    },
    operation::Operation,
    selection_criteria::{ReadPreference, SelectionCriteria},
    trace::{TracingRepresentation, COMMAND_TRACING_EVENT_TARGET},
};

/// Runs operations on a bounded number of blocking worker threads.
///
/// Each scheduled job is spawned immediately and then waits for one of `thread_pool_size` permits,
/// so at most that many jobs block at once and jobs start in the order they were scheduled.
#[derive(Debug)]
pub(crate) struct OperationExecutor {
    runtime: Handle,
    permits: Arc<Semaphore>,
    closed: AtomicBool,
    in_flight: Arc<InFlight>,
}

impl OperationExecutor {
    pub(crate) fn new(runtime: Handle, thread_pool_size: u32) -> Self {
        Self {
            runtime,
            permits: Arc::new(Semaphore::new(thread_pool_size as usize)),
            closed: AtomicBool::new(false),
            in_flight: Arc::new(InFlight::default()),
        }
    }

    /// Runs `op` on a worker for `client`, using `connection` if one is supplied. If `session` is
    /// supplied it must be active and belong to `client`.
    pub(crate) fn execute<Op: Operation>(
        &self,
        op: Op,
        connection: Option<Connection>,
        client: &Client,
        session: Option<&ClientSession>,
    ) -> ExecutionFuture<Op::O> {
        if let Some(session) = session {
            if session.is_ended() {
                return ExecutionFuture::ready(Err(Error::session_ended()));
            }
            if session.client_id() != client.id() {
                return ExecutionFuture::ready(Err(Error::logic(
                    "Tried to use a ClientSession with a client other than the one that created \
                     it",
                )));
            }
        }
        self.schedule(op, connection, client, session)
    }

    /// Like `execute`, but without checking the session. Used to clean up a session that is
    /// already ending.
    pub(crate) fn schedule<Op: Operation>(
        &self,
        op: Op,
        connection: Option<Connection>,
        client: &Client,
        session: Option<&ClientSession>,
    ) -> ExecutionFuture<Op::O> {
        let client = client.clone();
        let session = session.cloned();
        self.run_blocking(move || {
            client.execute_operation_on_worker(op, connection, session.as_ref())
        })
    }

    /// Runs `work` on a worker thread once a permit is free.
    pub(crate) fn run_blocking<T, F>(&self, work: F) -> ExecutionFuture<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        if self.is_closed() {
            return ExecutionFuture::ready(Err(Error::executor_closed()));
        }

        let (promise, future) = Self::make_promise();
        let permits = self.permits.clone();
        let guard = InFlightGuard::new(&self.in_flight);

        self.runtime.spawn(async move {
            let _guard = guard;
            let permit = match permits.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    promise.complete(Err(Error::executor_closed()));
                    return;
                }
            };
            let result = tokio::task::spawn_blocking(move || {
                let _permit = permit;
                work()
            })
            .await
            .unwrap_or_else(|join_error| {
                Err(Error::internal(format!(
                    "operation worker terminated abnormally: {join_error}"
                )))
            });
            promise.complete(result);
        });

        future
    }

    /// Creates a promise and the future it completes.
    pub(crate) fn make_promise<T>() -> (Promise<T>, ExecutionFuture<T>) {
        let (sender, receiver) = oneshot::channel();
        (
            Promise { sender },
            ExecutionFuture {
                state: ExecutionState::Pending(receiver),
            },
        )
    }

    /// Stops accepting work, waits for every scheduled job to finish, and shuts the workers down.
    /// Calling this more than once has no further effect.
    pub(crate) async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // A scheduled task may not have queued on the semaphore yet, so wait on the job count
        // rather than on the permits.
        loop {
            let idle = self.in_flight.idle.notified();
            if self.in_flight() == 0 {
                break;
            }
            idle.await;
        }
        self.permits.close();
        tracing::debug!("Operation executor closed");
    }

    /// Blocking version of `close`. Must not be called from an async context.
    pub(crate) fn sync_close(&self) {
        self.runtime.block_on(self.close());
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// The number of scheduled jobs that have not finished yet.
    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight.count.load(Ordering::SeqCst)
    }
}

/// Counts unfinished jobs and wakes `close` when the last one finishes.
#[derive(Debug, Default)]
struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

struct InFlightGuard(Arc<InFlight>);

impl InFlightGuard {
    fn new(in_flight: &Arc<InFlight>) -> Self {
        in_flight.count.fetch_add(1, Ordering::SeqCst);
        Self(in_flight.clone())
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

/// The writing half of an [`ExecutionFuture`].
#[derive(Debug)]
pub(crate) struct Promise<T> {
    sender: oneshot::Sender<Result<T>>,
}

impl<T> Promise<T> {
    /// Completes the paired future. Does nothing if it was dropped.
    pub(crate) fn complete(self, result: Result<T>) {
        let _ = self.sender.send(result);
    }
}

/// The eventual result of an operation submitted to a [`Client`].
///
/// The operation runs whether or not this future is polled; dropping it discards the result
/// without cancelling the work. Besides being awaited, the result may be waited for from a
/// non-async thread with [`ExecutionFuture::wait`].
#[derive(Debug)]
#[must_use = "the result of the operation is only observable through this future"]
pub struct ExecutionFuture<T> {
    state: ExecutionState<T>,
}

#[derive(Debug)]
enum ExecutionState<T> {
    Ready(Option<Result<T>>),
    Pending(oneshot::Receiver<Result<T>>),
}

impl<T> ExecutionFuture<T> {
    pub(crate) fn ready(result: Result<T>) -> Self {
        Self {
            state: ExecutionState::Ready(Some(result)),
        }
    }

    /// Blocks the current thread until the operation completes.
    ///
    /// # Panics
    ///
    /// Panics if called from within an asynchronous execution context.
    pub fn wait(self) -> Result<T> {
        match self.state {
            ExecutionState::Ready(result) => result.unwrap_or_else(|| Err(already_taken())),
            ExecutionState::Pending(receiver) => {
                receiver.blocking_recv().unwrap_or_else(|_| Err(abandoned()))
            }
        }
    }
}

impl<T> Unpin for ExecutionFuture<T> {}

impl<T> Future for ExecutionFuture<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.state {
            ExecutionState::Ready(result) => {
                Poll::Ready(result.take().unwrap_or_else(|| Err(already_taken())))
            }
            ExecutionState::Pending(receiver) => Pin::new(receiver)
                .poll(cx)
                .map(|received| received.unwrap_or_else(|_| Err(abandoned()))),
        }
    }
}

fn abandoned() -> Error {
    Error::internal("operation was dropped before it completed")
}

fn already_taken() -> Error {
    Error::internal("ExecutionFuture polled after completion")
}

impl Client {
    /// Runs `op` and returns its result. If `connection` is supplied the operation runs on it;
    /// otherwise a connection is acquired from the pool, preferring `session`'s pinned connection.
    ///
    /// This is the entry point for layers built on top of the client, such as collection APIs.
    pub fn execute_operation<'a, Op: Operation>(
        &self,
        op: Op,
        connection: impl Into<Option<Connection>>,
        session: impl Into<Option<&'a ClientSession>>,
    ) -> ExecutionFuture<Op::O> {
        if self.is_closed() {
            return ExecutionFuture::ready(Err(Error::client_closed()));
        }
        self.executor()
            .execute(op, connection.into(), self, session.into())
    }

    /// Acquires a connection if needed, runs `op` on it and releases it. Runs on a worker thread.
    pub(crate) fn execute_operation_on_worker<Op: Operation>(
        &self,
        mut op: Op,
        connection: Option<Connection>,
        session: Option<&ClientSession>,
    ) -> Result<Op::O> {
        let mut connection = match connection {
            Some(connection) => connection,
            None => {
                let criteria = op
                    .selection_criteria()
                    .cloned()
                    .or_else(|| self.selection_criteria().cloned())
                    .unwrap_or(SelectionCriteria::ReadPreference(ReadPreference::Primary));
                self.pool().acquire_connection(session, &criteria)?
            }
        };

        let result = self.execute_on_connection(&mut op, &mut connection, session);
        self.pool().release(connection, false);
        result
    }

    fn execute_on_connection<Op: Operation>(
        &self,
        op: &mut Op,
        connection: &mut Connection,
        session: Option<&ClientSession>,
    ) -> Result<Op::O> {
        let description = connection.stream_description()?.clone();
        let mut command = op.build(&description)?;

        if let Some(session) = session {
            if op.supports_sessions() && description.supports_sessions() {
                command.set_session(session.id());
                session.apply_transaction_fields(&mut command);
                if session.causal_consistency()
                    && op.supports_read_concern()
                    && !session.in_transaction()
                {
                    if let Some(operation_time) = session.operation_time() {
                        command.set_after_cluster_time(operation_time);
                    }
                }
            }
        }

        let cluster_time = match (
            self.cluster_time(),
            session.and_then(ClientSession::cluster_time),
        ) {
            (Some(client), Some(session)) => Some(std::cmp::max(client, session)),
            (client, session) => client.or(session),
        };
        if let Some(ref cluster_time) = cluster_time {
            command.set_cluster_time(cluster_time);
        }

        if description.is_mongos() {
            if let Some(read_preference) = op
                .selection_criteria()
                .and_then(SelectionCriteria::as_read_pref)
                .filter(|rp| **rp != ReadPreference::Primary)
            {
                command.set_read_preference(*read_preference);
            }
        }

        let result = self.send_and_observe(&command, connection, session);
        if let Some(session) = session {
            session.mark_transaction_sent();
        }

        match result {
            Ok(response) => op.handle_response(response, &description),
            Err(error) => {
                if error.is_network_error() {
                    self.pool().handle_network_error(connection, &error);
                }
                op.handle_error(error)
            }
        }
    }

    /// Sends `command` on `connection`, reporting it to command event handlers and the command
    /// tracing target. Replies with `ok: 0` become command errors once their cluster and
    /// operation times have been recorded.
    fn send_and_observe(
        &self,
        command: &Command,
        connection: &mut Connection,
        session: Option<&ClientSession>,
    ) -> Result<RawCommandResponse> {
        let request_id = next_request_id();
        let connection_info = connection.info();
        let handlers = self.command_handlers();

        tracing::debug!(
            target: COMMAND_TRACING_EVENT_TARGET,
            command = command.to_wire_document().tracing_representation(),
            databaseName = command.target_db(),
            commandName = command.name(),
            requestId = request_id,
            driverConnectionId = connection_info.id,
            serverHost = connection_info.address.host.as_str(),
            serverPort = connection_info.address.port(),
            "Command started",
        );
        handlers.emit(
            || {
                CommandEvent::Started(CommandStartedEvent {
                    command: command.to_wire_document(),
                    db: command.target_db().to_string(),
                    command_name: command.name().to_string(),
                    request_id,
                    connection: connection_info.clone(),
                })
            },
            |handler, event| handle_command_event(handler, event),
        );

        let start = Instant::now();
        let result = connection
            .send_command(command, request_id)
            .and_then(|response| {
                self.gossip_times(&response, session);
                response.validate().map(|()| response)
            });
        let duration = start.elapsed();

        match result {
            Ok(response) => {
                tracing::debug!(
                    target: COMMAND_TRACING_EVENT_TARGET,
                    reply = response.raw().tracing_representation(),
                    commandName = command.name(),
                    requestId = request_id,
                    driverConnectionId = connection_info.id,
                    durationMS = duration.as_millis(),
                    "Command succeeded",
                );
                handlers.emit(
                    || {
                        CommandEvent::Succeeded(CommandSucceededEvent {
                            duration,
                            reply: response.raw().clone(),
                            command_name: command.name().to_string(),
                            request_id,
                            connection: connection_info.clone(),
                        })
                    },
                    |handler, event| handle_command_event(handler, event),
                );
                Ok(response)
            }
            Err(error) => {
                tracing::debug!(
                    target: COMMAND_TRACING_EVENT_TARGET,
                    failure = error.tracing_representation(),
                    commandName = command.name(),
                    requestId = request_id,
                    driverConnectionId = connection_info.id,
                    durationMS = duration.as_millis(),
                    "Command failed",
                );
                handlers.emit(
                    || {
                        CommandEvent::Failed(CommandFailedEvent {
                            duration,
                            command_name: command.name().to_string(),
                            failure: error.clone(),
                            request_id,
                            connection: connection_info.clone(),
                        })
                    },
                    |handler, event| handle_command_event(handler, event),
                );
                Err(error)
            }
        }
    }

    /// Records the cluster and operation times a server reported on the client and session.
    fn gossip_times(&self, response: &RawCommandResponse, session: Option<&ClientSession>) {
        if let Some(cluster_time) = response.cluster_time() {
            self.advance_cluster_time(&cluster_time);
            if let Some(session) = session {
                session.advance_cluster_time(&cluster_time);
            }
        }
        if let (Some(session), Some(operation_time)) = (session, response.operation_time()) {
            session.advance_operation_time(operation_time);
        }
    }
}
