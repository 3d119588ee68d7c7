//! Connection pooling, dispatch and receive loops for msgprims.
//!
//! A [`MessagingManager`] keeps a pool of framed TCP connections
//! ("endpoints") to each configured peer ("destination"), accepts inbound
//! connections, and correlates replies with the dispatches that asked for
//! them. Inbound messages go to named [`ConsumerCallback`]s on a worker
//! pool; their bodies may be read lazily, even on another thread.
//!
//! ```no_run
//! use msgprims_frame::Header;
//! use msgprims_peer::{BoxError, Message, MessageContext, MessagingConfig, MessagingManager};
//!
//! let server = MessagingManager::start(MessagingConfig::default(), Some("127.0.0.1:7400".parse().unwrap()))?;
//! server.register_consumer("echo", |ctx: &MessageContext, mut msg: Message| -> Result<(), BoxError> {
//!     let body = msg.body_bytes()?;
//!     msg.reply(Header::new(), Some(&body))?;
//!     let _ = ctx.receiver_name();
//!     Ok(())
//! });
//!
//! let client = MessagingManager::start(MessagingConfig::default(), None)?;
//! client.add_destination("127.0.0.1:7400".parse().unwrap());
//! let mut reply = client.send_to_named("echo", Header::new(), Some(&"hi"))?;
//! assert_eq!(&reply.body_bytes()?[..], b"hi");
//! # Ok::<(), msgprims_peer::MessagingError>(())
//! ```

pub mod body;
pub mod config;
pub mod destination;
pub mod dispatch;
pub mod endpoint;
pub mod error;
pub mod handshake;
mod maintenance;
pub mod manager;
pub mod matcher;
pub mod message;
pub mod pending;
pub mod pool;
pub mod receive;
pub mod selection;

pub use body::{BodyWriter, JsonBody, Streamable, StreamableBody};
pub use config::{MessagingConfig, MIN_CHECK_INTERVAL};
pub use destination::{Destination, DestinationRegistry, SERVER_LOAD_KEY};
pub use dispatch::{with_response_timeout, DispatchRequest};
pub use endpoint::{Endpoint, EndpointState};
pub use error::{BoxError, MessagingError, Result};
pub use handshake::{ConnectRequest, ConnectResponse, HandshakeConfig, PrimaryOutcome};
pub use manager::{MessagingHandle, MessagingManager};
pub use matcher::{MetaDataMatcher, ReceiverNameMatcher};
pub use message::{BodyPhase, BodyStream, Message, MessageContext};
pub use pending::{PendingReplies, PendingReply};
pub use pool::WorkerPool;
pub use receive::{AccessControl, ConsumerCallback, MetadataListener, DEFAULT_RECEIVER_NAME};
pub use selection::{DefaultSelectionStrategy, SelectionStrategy, Target};
