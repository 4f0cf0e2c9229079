//! A layered stream-I/O engine.
//!
//! An [`Engine`] mediates three collaborators behind one data-path
//! interface:
//!
//! - a [`LowerLayer`](ll::LowerLayer): the transport underneath (a TCP
//!   socket, a serial port, a pty — this crate ships no concrete one);
//! - an optional [`Filter`](filter::Filter): a protocol layer stacked on
//!   top of the lower layer (TLS, telnet option negotiation, a line
//!   discipline); pipelines with nothing to negotiate use
//!   [`filter::IdentityFilter`];
//! - a [`UserCallbacks`](user::UserCallbacks): the host application's view
//!   of the resulting byte stream.
//!
//! The engine owns the open/close state machine (see [`state::State`]),
//! reconciles read/write backpressure between all three layers, and moves
//! every user-visible callback off the lower layer's own call stack via a
//! [`deferred`] dispatcher so a host application's callback is always free
//! to call back into the engine without risking a re-entrant deadlock.

pub mod deferred;
pub mod engine;
pub mod error;
pub mod filter;
pub mod ll;
pub mod platform;
pub mod state;
pub mod user;

pub use engine::{Engine, EngineConfig};
pub use error::{EngineError, Result};
pub use filter::{Filter, FilterCallbacks, HandshakeProgress, IdentityFilter, Sink};
pub use ll::{CloseOutcome, LlCallbacks, LowerLayer, OpenOutcome};
pub use state::State;
pub use user::{CloseCompletion, OpenCompletion, ReadFlags, UserCallbacks};
