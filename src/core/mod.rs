//! # Core Framing Components
//!
//! Layer 1 of the pipeline: the byte stream is cut into mediator containers.
//!
//! ## Components
//! - **Frame**: container with payload type and reserved bytes
//! - **Codec**: Tokio codec for framing over byte streams
//!
//! ## Wire Format
//! ```text
//! [Length(4, LE)] [Type(1)] [Reserved(3)] [Payload(N)]
//! ```
//!
//! ## Security
//! - Maximum container size: 64 KiB (prevents memory exhaustion)
//! - Length validation before allocation
//! - Malformed lengths are fatal, the stream cannot be resynchronized

pub mod codec;
pub mod frame;
