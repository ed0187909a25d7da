//! # Protocol Layers
//!
//! Layers 2 to 5 of the pipeline and the message types they exchange.
//!
//! ## Layers
//! - **Mediator** (L2): classifies containers as CSP proxy traffic or D2M messages
//! - **Session** (L3): CSP and D2M logins, CSP payload encryption, authentication gating
//! - **Keepalive** (L4): echo requests and responses
//! - **Dispatch** (L5): routes inbound messages to waiting tasks or creates passive tasks
//!
//! ## Messages
//! - [`csp`]: chat server payloads
//! - [`d2m`]: mediator messages
//! - [`e2e`]: end-to-end encrypted message content
//! - [`envelope`]: envelopes reflected between devices

pub mod csp;
pub mod d2m;
pub mod dispatch;
pub mod e2e;
pub mod envelope;
pub mod flags;
pub mod handshake;
pub mod keepalive;
pub mod mediator;
pub mod session;
pub mod state;
pub(crate) mod wire;
