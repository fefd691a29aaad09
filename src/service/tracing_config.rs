use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use super::{AppError, AppResult};

/// Installs a console subscriber with local timestamps, filtered through
/// `RUST_LOG`. Call once at startup; a second call reports the subscriber
/// that is already installed.
pub fn setup_local_tracing() -> AppResult<()> {
    let timer = ChronoLocal::new("%Y-%m-%d %H:%M:%S%.6f".to_string());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_timer(timer)
        .with_target(true)
        .with_thread_names(true)
        .with_thread_ids(true)
        .with_line_number(true);
    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .try_init()
        .map_err(|err| AppError::IllegalStateError(format!("tracing init: {}", err)))?;
    Ok(())
}
