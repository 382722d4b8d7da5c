use std::{
    future::Future,
    pin::Pin,
    task::{ready, Context, Poll},
};

use futures_util::future::{BoxFuture, FutureExt};

use super::ClientSession;
use crate::error::Result;

/// Drives a user body to completion and then ends the session it ran with, yielding the body's
/// result once the session has ended.
pub(crate) struct WithSession<T> {
    session: ClientSession,
    state: State<T>,
}

enum State<T> {
    Running(BoxFuture<'static, Result<T>>),
    Ending {
        result: Option<Result<T>>,
        end: BoxFuture<'static, ()>,
    },
    Done,
}

impl<T> Unpin for WithSession<T> {}

impl<T: Send + 'static> WithSession<T> {
    /// Starts running `body`. A body that failed before producing a future still gets its session
    /// ended.
    pub(crate) fn new<F>(session: ClientSession, body: Result<F>) -> Self
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let state = match body {
            Ok(fut) => State::Running(fut.boxed()),
            Err(error) => State::Ending {
                result: Some(Err(error)),
                end: end_session(&session),
            },
        };
        Self { session, state }
    }
}

fn end_session(session: &ClientSession) -> BoxFuture<'static, ()> {
    let session = session.clone();
    async move { session.end().await }.boxed()
}

impl<T: Send + 'static> Future for WithSession<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        loop {
            match &mut this.state {
                State::Running(body) => {
                    let result = ready!(body.as_mut().poll(cx));
                    this.state = State::Ending {
                        result: Some(result),
                        end: end_session(&this.session),
                    };
                }
                State::Ending { result, end } => {
                    ready!(end.as_mut().poll(cx));
                    let result = result.take();
                    this.state = State::Done;
                    if let Some(result) = result {
                        return Poll::Ready(result);
                    }
                }
                State::Done => panic!("WithSession polled after completion"),
            }
        }
    }
}
