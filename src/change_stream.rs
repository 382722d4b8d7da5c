//! Contains the functionality for change streams.
pub mod event;
pub mod options;
#[cfg(test)]
mod test;

use std::{
    collections::VecDeque,
    future::Future,
    marker::PhantomData,
    pin::Pin,
    task::{ready, Context, Poll},
    time::Duration,
};

use futures_core::Stream;
use serde::de::DeserializeOwned;

use crate::{
    bson::{doc, Document},
    change_stream::{event::ResumeToken, options::ChangeStreamOptions},
    client::executor::ExecutionFuture,
    concern::ReadConcern,
    error::{Error, Result},
    operation::{append_options, Aggregate, AggregateTarget, GetMore, GetMoreResult, KillCursors},
    options::ServerAddress,
    selection_criteria::SelectionCriteria,
    trace::CONNECTION_TRACING_EVENT_TARGET,
    Client,
    ClientSession,
    Namespace,
};

/// A `ChangeStream` streams the ongoing changes of its associated database or deployment.
/// `ChangeStream` instances should be created with method `watch` against the relevant target.
///
/// A `ChangeStream` can be iterated like any other [`Stream`]. Since change streams are tailable,
/// polling it waits until the server reports a new event; use
/// [`next_if_any`](ChangeStream::next_if_any) to issue at most one `getMore` instead.
///
/// ```no_run
/// # use futures_util::StreamExt;
/// # use mongodb_core::{Client, error::Result};
/// # async fn func() -> Result<()> {
/// let client = Client::with_uri_str("mongodb://example.com", None)?;
/// let mut change_stream = client.watch(Vec::new(), None, None).await?;
/// while let Some(event) = change_stream.next().await.transpose()? {
///     println!("operation performed: {:?}", event.operation_type);
/// }
/// client.shutdown().await?;
/// # Ok(())
/// # }
/// ```
///
/// If a `ChangeStream` is still open when it goes out of scope, it will automatically be closed
/// via an asynchronous [killCursors](https://www.mongodb.com/docs/manual/reference/command/killCursors/)
/// command executed from its `Drop` implementation.
pub struct ChangeStream<T>
where
    T: DeserializeOwned,
{
    client: Client,
    ns: Namespace,
    cursor_id: i64,
    address: ServerAddress,
    buffer: VecDeque<Document>,
    resume_token: Option<ResumeToken>,
    post_batch_resume_token: Option<ResumeToken>,
    batch_size: Option<u32>,
    max_await_time: Option<Duration>,
    session: Option<ClientSession>,
    pending: Option<ExecutionFuture<GetMoreResult>>,
    _phantom: PhantomData<fn() -> T>,
}

impl<T> ChangeStream<T>
where
    T: DeserializeOwned,
{
    /// Runs the `$changeStream` aggregation and wraps the resulting cursor.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn open(
        client: Client,
        target: AggregateTarget,
        all_changes_for_cluster: bool,
        pipeline: Vec<Document>,
        options: Option<ChangeStreamOptions>,
        read_concern: Option<ReadConcern>,
        criteria: Option<SelectionCriteria>,
        session: Option<&ClientSession>,
    ) -> Result<Self> {
        let mut stage = doc! {};
        if all_changes_for_cluster {
            stage.insert("allChangesForCluster", true);
        }
        append_options(&mut stage, options.as_ref())?;

        let mut full_pipeline = vec![doc! { "$changeStream": stage }];
        full_pipeline.extend(pipeline);

        let batch_size = options.as_ref().and_then(|o| o.batch_size);
        let max_await_time = options.as_ref().and_then(|o| o.max_await_time);
        let op = Aggregate::new(target, full_pipeline, batch_size, read_concern, criteria);
        let spec = client.execute_operation(op, None, session).await?;

        let post_batch_resume_token = spec
            .post_batch_resume_token
            .map(ResumeToken::from_document);
        let resume_token = match (&post_batch_resume_token, spec.initial_buffer.is_empty()) {
            (Some(token), true) => Some(token.clone()),
            _ => options.and_then(|o| o.start_after.or(o.resume_after)),
        };

        Ok(Self {
            client,
            ns: spec.ns,
            cursor_id: spec.id,
            address: spec.address,
            buffer: spec.initial_buffer,
            resume_token,
            post_batch_resume_token,
            batch_size,
            max_await_time,
            session: session.cloned(),
            pending: None,
            _phantom: PhantomData,
        })
    }

    /// Returns the cached resume token that can be used to resume after the most recently
    /// returned change.
    ///
    /// See the documentation
    /// [here](https://www.mongodb.com/docs/manual/changeStreams/#change-stream-resume-token) for
    /// more information on change stream resume tokens.
    pub fn resume_token(&self) -> Option<ResumeToken> {
        self.resume_token.clone()
    }

    /// Returns whether the change stream will continue to receive events.
    pub fn is_alive(&self) -> bool {
        self.cursor_id != 0
    }

    /// The namespace of the server-side cursor backing this stream.
    pub fn namespace(&self) -> &Namespace {
        &self.ns
    }

    /// Retrieves the next result from the change stream, if any.
    ///
    /// Where calling `Stream::next` will internally loop until a change document is received,
    /// this will make at most one request and return `None` if the returned document batch is
    /// empty. This method should be used when storing the resume token in order to ensure the
    /// most up to date token is received, e.g.
    ///
    /// ```no_run
    /// # use mongodb_core::{Client, change_stream::ChangeStream, error::Result};
    /// # async fn func(mut change_stream: ChangeStream<mongodb_core::bson::Document>) -> Result<()> {
    /// let mut resume_token = None;
    /// while change_stream.is_alive() {
    ///     if let Some(event) = change_stream.next_if_any().await? {
    ///         // process event
    ///     }
    ///     resume_token = change_stream.resume_token();
    /// }
    /// # Ok(())
    /// # }
    /// ```
    pub async fn next_if_any(&mut self) -> Result<Option<T>> {
        if self.buffer.is_empty() && self.is_alive() {
            let pending = match self.pending.take() {
                Some(pending) => pending,
                None => self.get_more(),
            };
            let batch = pending.await;
            self.apply_batch(batch)?;
        }
        self.buffer
            .pop_front()
            .map(|document| self.decode(document))
            .transpose()
    }

    fn get_more(&self) -> ExecutionFuture<GetMoreResult> {
        let op = GetMore::new(
            self.ns.clone(),
            self.cursor_id,
            self.address.clone(),
            self.batch_size,
            self.max_await_time,
        );
        self.client
            .execute_operation(op, None, self.session.as_ref())
    }

    fn apply_batch(&mut self, result: Result<GetMoreResult>) -> Result<()> {
        let batch = match result {
            Ok(batch) => batch,
            Err(error) => {
                // The server may already have discarded the cursor, so don't try to kill it.
                self.cursor_id = 0;
                return Err(error);
            }
        };

        self.cursor_id = batch.id;
        self.buffer = batch.batch;
        self.post_batch_resume_token = batch
            .post_batch_resume_token
            .map(ResumeToken::from_document);
        if self.buffer.is_empty() {
            if let Some(ref token) = self.post_batch_resume_token {
                self.resume_token = Some(token.clone());
            }
        }
        Ok(())
    }

    fn decode(&mut self, document: Document) -> Result<T> {
        let token = ResumeToken::from_event(&document).ok_or_else(|| {
            Error::invalid_response(
                "Cannot provide resume functionality when the resume token is missing",
            )
        })?;
        self.resume_token = match self.post_batch_resume_token {
            Some(ref post_batch) if self.buffer.is_empty() => Some(post_batch.clone()),
            _ => Some(token),
        };
        Ok(bson::from_document(document)?)
    }
}

impl<T> Stream for ChangeStream<T>
where
    T: DeserializeOwned + Unpin,
{
    type Item = Result<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if let Some(document) = this.buffer.pop_front() {
                return Poll::Ready(Some(this.decode(document)));
            }

            match this.pending.as_mut() {
                Some(pending) => {
                    let result = ready!(Pin::new(pending).poll(cx));
                    this.pending = None;
                    if let Err(error) = this.apply_batch(result) {
                        return Poll::Ready(Some(Err(error)));
                    }
                }
                None => {
                    if !this.is_alive() {
                        return Poll::Ready(None);
                    }
                    this.pending = Some(this.get_more());
                }
            }
        }
    }
}

impl<T> Drop for ChangeStream<T>
where
    T: DeserializeOwned,
{
    fn drop(&mut self) {
        if !self.is_alive() || self.client.is_closed() {
            return;
        }
        tracing::debug!(
            target: CONNECTION_TRACING_EVENT_TARGET,
            cursor_id = self.cursor_id,
            address = %self.address,
            "killing change stream cursor",
        );
        let op = KillCursors::new(self.ns.clone(), self.cursor_id, self.address.clone());
        // Spawned work runs to completion even though its future is dropped here.
        drop(self.client.execute_operation(op, None, None));
    }
}

impl<T> std::fmt::Debug for ChangeStream<T>
where
    T: DeserializeOwned,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeStream")
            .field("ns", &self.ns)
            .field("cursor_id", &self.cursor_id)
            .field("address", &self.address)
            .field("buffered", &self.buffer.len())
            .field("resume_token", &self.resume_token)
            .finish()
    }
}
