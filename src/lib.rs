//! A single participant of a Raft replication group.
//!
//! The crate maintains a strongly-ordered replicated log, elects leaders,
//! replicates commands, detects failures and applies committed commands
//! to a user-supplied state machine. It is organized as three layers
//! sharing one logical state:
//!
//! - [`Fsm`]: a pure, deterministic decision core. Inputs (messages,
//!   ticks, proposals, I/O completions) go in; an [`Output`] batch of
//!   effects comes out. No I/O, no blocking.
//! - [`RaftServer`]: a single cooperative task that owns the core,
//!   drains inputs from one channel and dispatches the output batches to
//!   the collaborators, resolving client promises as commit and apply
//!   indices advance.
//! - Collaborator seams: [`Rpc`] (transport), [`Persistence`] (durable
//!   state), [`FailureDetector`] (liveness), [`StateMachine`] (the
//!   replicated application).
//!
//! # Example
//!
//! ```no_run
//! use conclave::{
//!     AlwaysAlive, Configuration, MemoryPersistence, RaftOptions, RaftServer, ServerAddress,
//!     ServerId, WaitType,
//! };
//! use std::collections::BTreeSet;
//! use std::sync::Arc;
//!
//! # #[derive(Default)] struct MyStateMachine;
//! # #[async_trait::async_trait]
//! # impl conclave::StateMachine for MyStateMachine {
//! #     async fn apply(&mut self, _: &[conclave::LogEntry]) {}
//! #     async fn take_snapshot(&mut self) -> Vec<u8> { Vec::new() }
//! #     async fn load_snapshot(&mut self, _: &[u8]) -> conclave::Result<()> { Ok(()) }
//! # }
//! # struct MyTransport;
//! # #[async_trait::async_trait]
//! # impl conclave::Rpc for MyTransport {
//! #     async fn send(&self, _: ServerId, _: conclave::Message) -> conclave::Result<()> { Ok(()) }
//! #     async fn add_server(&self, _: ServerAddress) -> conclave::Result<()> { Ok(()) }
//! #     async fn remove_server(&self, _: ServerId) -> conclave::Result<()> { Ok(()) }
//! # }
//! # #[tokio::main] async fn main() -> conclave::Result<()> {
//! let id = ServerId::random();
//! let seed: BTreeSet<ServerAddress> = [ServerAddress::new(id, Vec::new())].into();
//! let persistence = MemoryPersistence::with_seed_configuration(Configuration::simple(seed))?;
//!
//! let server = RaftServer::start(
//!     id,
//!     RaftOptions::default(),
//!     Arc::new(MyTransport),
//!     Arc::new(persistence),
//!     Arc::new(AlwaysAlive),
//!     Box::new(MyStateMachine::default()),
//! )
//! .await?;
//!
//! server.add_entry(b"set x=1".to_vec(), WaitType::Applied).await?;
//! server.abort().await;
//! # Ok(()) }
//! ```

// unwrap() panics can break consensus; propagate errors instead.
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

pub mod config;
pub mod error;
pub mod failure;
pub mod fsm;
pub mod log;
pub mod membership;
pub mod message;
pub mod persistence;
mod progress;
pub mod rpc;
pub mod server;
pub mod types;

pub use config::RaftOptions;
pub use error::{RaftError, Result};
pub use failure::{AlwaysAlive, FailureDetector, StaticFailureDetector};
pub use fsm::{Fsm, Output, Role};
pub use log::{EntryPayload, LogEntry, RaftLog, SnapshotDescriptor};
pub use membership::Configuration;
pub use message::{Envelope, Message};
pub use persistence::{MemoryPersistence, Persistence};
pub use rpc::Rpc;
pub use server::RaftServer;
pub use types::{LogIndex, ServerAddress, ServerId, Term, WaitType};

use async_trait::async_trait;

/// The replicated application driven by the consensus log.
///
/// Never invoked concurrently with itself: the server loop is the only
/// caller and awaits each operation before issuing the next.
#[async_trait]
pub trait StateMachine: Send + Sync {
    /// Apply committed command entries, strictly in index order. Only
    /// [`EntryPayload::Command`] entries are delivered; configuration
    /// and dummy entries are consumed by the consensus layer.
    async fn apply(&mut self, entries: &[LogEntry]);

    /// Produce an opaque image of everything applied so far.
    async fn take_snapshot(&mut self) -> Vec<u8>;

    /// Replace the current state with a previously produced image.
    async fn load_snapshot(&mut self, data: &[u8]) -> Result<()>;
}
