//! Process setup for binaries embedding the engine.
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install a formatting subscriber filtered by `RUST_LOG`, defaulting to
/// `info`.
///
/// Calling it again, or after another subscriber was installed, is a no-op.
pub fn tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().compact())
        .with(filter)
        .try_init();
}

#[cfg(test)]
mod test {
    #[test]
    fn installing_twice_is_harmless() {
        super::tracing();
        super::tracing();
        tracing::info!("subscriber installed");
    }
}
