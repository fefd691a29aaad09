//! Network Module Implementation
//!
//! This module turns non-blocking sockets into callback-driven connection
//! objects, with a reactor providing readiness events and one-shot timers
//! and an optional TLS layer slotting in underneath the same send/recv
//! surface.
//!
//! # Components
//!
//! - `Connection`: manages one socket as an event-driven object
//! - `Reactor` / `PollReactor`: readiness watches and timer scheduling
//! - `EventSet` / `IntentFlags`: the event vocabulary and registration flags
//! - `TlsContext` / `RustlsSession`: certificate material and the record layer
//!
//! # Features
//!
//! - Persistent readiness watches with idempotent re-registration
//! - Transparent TLS with handshake retries driven off readiness events
//! - Idle timeouts delivered through the same callback as I/O events
//! - Orderly-close and error reporting left to the owning layer

pub use connection::{Connection, EventCallback, IoOutcome};
pub use event::{EventSet, IntentFlags};
pub use reactor::{PollReactor, Reactor, DEFAULT_POLL_CAPACITY};
pub use tls::{RustlsSession, TlsContext, TlsError, TlsProgress, TlsRole, TlsSession};

mod connection;
mod event;
mod reactor;
mod tls;
