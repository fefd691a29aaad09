mod network;
mod service;

pub use mio::Token;
pub use network::{
    Connection, EventCallback, EventSet, IntentFlags, IoOutcome, PollReactor, Reactor,
    RustlsSession, TlsContext, TlsError, TlsProgress, TlsRole, TlsSession, DEFAULT_POLL_CAPACITY,
};
pub use service::{setup_local_tracing, AppError, AppResult, HubConfig, NetworkConfig, TlsConfig};
