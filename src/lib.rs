//! The core of a MongoDB client: a connection pool, a bounded operation executor, client
//! sessions with transactions, and the `Client` type that ties them together.
//!
//! The crate uses the [`bson`] crate for BSON support and runs on [`tokio`]. Every operation is
//! executed on one of a fixed number of blocking worker threads, and its result is delivered
//! through an [`ExecutionFuture`] that can be awaited from async code or waited on from
//! synchronous code.
//!
//! # Example Usage
//!
//! ## Connecting and running a command
//! ```rust,no_run
//! # use mongodb_core::{bson::doc, error::Result, options::ClientOptions, Client};
//! #
//! # async fn run() -> Result<()> {
//! let client = Client::with_uri_str("mongodb://localhost:27017/?appName=inventory", None)?;
//!
//! for name in client.list_database_names(None, None, None).await? {
//!     println!("{}", name);
//! }
//!
//! let reply = client
//!     .database("inventory")
//!     .run_command(doc! { "ping": 1 }, None)
//!     .await?;
//! println!("{}", reply);
//!
//! client.shutdown().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Transactions
//! ```rust,no_run
//! # use mongodb_core::{bson::doc, error::Result, Client};
//! #
//! # async fn run(client: &Client) -> Result<()> {
//! let session = client.start_session(None)?;
//! session.start_transaction(None).await?;
//! client
//!     .database("inventory")
//!     .run_command(doc! { "ping": 1 }, Some(&session))
//!     .await?;
//! session.commit_transaction().await?;
//! session.end().await;
//! # Ok(())
//! # }
//! ```
//!
//! # Shutting down
//! A [`Client`] must be shut down with [`Client::shutdown`] (or [`Client::sync_shutdown`] from
//! synchronous code) before it is dropped. Shutdown closes the pool, waits for scheduled
//! operations and stops the topology monitor.
//!
//! # Logging
//! Log messages are emitted with [`tracing`] under the targets `mongodb_core::command`,
//! `mongodb_core::connection`, `mongodb_core::server_selection` and `mongodb_core::topology`.
#![warn(missing_docs)]
#![cfg_attr(
    feature = "cargo-clippy",
    allow(
        clippy::unreadable_literal,
        clippy::cognitive_complexity,
        clippy::float_cmp
    )
)]
#![cfg_attr(docsrs, feature(doc_cfg))]

#[macro_use]
pub mod options;

pub use ::bson;

pub mod change_stream;
mod client;
mod cmap;
mod concern;
mod db;
pub mod error;
pub mod event;
mod hello;
mod operation;
pub mod results;
pub(crate) mod runtime;
mod sdam;
mod selection_criteria;
mod trace;

pub use crate::{
    client::{
        executor::ExecutionFuture,
        session::{ClientSession, ClusterTime},
        Client,
    },
    cmap::{
        Command,
        ConnectOptions,
        Connection,
        Connector,
        PoolStatus,
        RawCommandResponse,
        StreamDescription,
        TcpConnector,
        WireStream,
    },
    db::{Database, Namespace},
    operation::Operation,
    sdam::{ServerDescription, ServerType, TopologyDescription, TopologyType},
};
