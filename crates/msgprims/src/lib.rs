//! Peer-to-peer TCP messaging with pooled connections and reply correlation.
//!
//! msgprims keeps a small pool of framed TCP connections to every peer it
//! knows, dispatches messages over whichever connection is idle, and hands
//! replies back to the caller that is waiting for them.
//!
//! # Crate Structure
//!
//! - [`transport`] - TCP listener/stream wrapper and address-derived ids
//! - [`frame`] - Wire header, length-prefixed and legacy codecs
//! - [`peer`] - Messaging manager, dispatch and receive loops (behind `peer` feature)

/// Re-export transport types.
pub mod transport {
    pub use msgprims_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use msgprims_frame::*;
}

/// Re-export messaging types (requires `peer` feature).
#[cfg(feature = "peer")]
pub mod peer {
    pub use msgprims_peer::*;
}
