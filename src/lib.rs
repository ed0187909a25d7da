//! # mdev-protocol
//!
//! Protocol core of a multi-device end-to-end encrypted messaging client.
//!
//! A [`Pipeline`] turns one mediator connection into authenticated application
//! messages and back. The [`TaskManager`] drives outbound protocol work on top of it:
//! sending messages, group operations and reflecting state to the other linked devices,
//! with persistence and retries for tasks that must survive a reconnect.
//!
//! ## Layers
//! 1. **Framing** ([`core`]): length prefixed mediator containers
//! 2. **Mediator** ([`protocol::mediator`]): CSP proxy data and D2M messages
//! 3. **Session** ([`protocol::session`]): CSP and D2M logins, CSP payload encryption
//! 4. **Keepalive** ([`protocol::keepalive`]): echo requests and timeouts
//! 5. **Dispatch** ([`protocol::dispatch`]): hands messages to the task layer
//!
//! ## Example
//! ```rust,no_run
//! use mdev_protocol::{ConnectionContext, Pipeline, TaskManager};
//!
//! async fn connect(manager: &TaskManager, server_public_key: [u8; 32]) -> mdev_protocol::Result<()> {
//!     let stream = tokio::net::TcpStream::connect("mediator.example:443").await?;
//!     let pipeline = Pipeline::spawn(stream, ConnectionContext { server_public_key }, manager)?;
//!     pipeline.closed().await
//! }
//! ```

pub mod blob;
pub mod config;
pub mod core;
pub mod crypto;
pub mod error;
pub mod pipeline;
pub mod protocol;
pub mod services;
pub mod task;
pub mod types;
pub mod utils;

pub use config::ProtocolConfig;
pub use error::{CryptoError, ProtocolError, Result, TaskError, TaskResult};
pub use pipeline::{ConnectionContext, Pipeline, PipelineHandle};
pub use services::Services;
pub use task::{ActiveTask, TaskHandle, TaskManager};
