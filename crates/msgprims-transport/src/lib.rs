//! TCP transport for msgprims.
//!
//! Provides the connection primitives every messaging endpoint sits on:
//! - [`TcpTransport`] to listen, accept and connect
//! - [`NetStream`], a connected stream with timeout and shutdown control
//! - [`address_id`], the 64-bit identity derived from a socket address
//!
//! This is the lowest layer of msgprims. Everything else builds on top of
//! the [`NetStream`] type provided here.

pub mod address;
pub mod error;
pub mod tcp;
pub mod traits;

pub use address::{address_id, parse_address_id};
pub use error::{Result, TransportError};
pub use tcp::{resolve, TcpTransport};
pub use traits::NetStream;
