// Logging module - tracing subscriber setup

use std::error::Error;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Registry};

/// Initialize the global tracing subscriber.
///
/// Compact single-line output to stdout; the level is taken from
/// `RUST_LOG` and defaults to `info`.
pub fn init_subscriber() -> Result<(), Box<dyn Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = fmt::layer()
        .compact()
        .with_target(false)
        .with_writer(std::io::stdout);

    let subscriber = Registry::default().with(filter).with(fmt_layer);

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| Box::new(e) as Box<dyn Error>)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_subscriber_is_idempotent_enough_for_tests() {
        // The first call in the process wins; later calls error because a
        // global default is already set. Both outcomes are acceptable here.
        let _ = init_subscriber();
        let second = init_subscriber();
        assert!(second.is_err() || second.is_ok());
    }
}
