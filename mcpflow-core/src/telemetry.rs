//! ABOUTME: Reusable `tracing` initializer for host applications and tests
//! ABOUTME: opt-in, not a CLI — this crate never calls it on its own

use std::sync::Once;

use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Installs a global `tracing` subscriber honoring `RUST_LOG`, falling back
/// to `default_level` when the environment variable is unset. Safe to call
/// more than once (and from multiple crates/tests in the same process):
/// only the first call takes effect.
pub fn init_tracing(default_level: &str) {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .init();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_tracing_is_idempotent() {
        init_tracing("info");
        init_tracing("debug");
    }
}
