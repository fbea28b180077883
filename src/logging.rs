//! Log setup shared by the server binary and clients that want it.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::ENV_LOG;

pub const DEFAULT_FILTER: &str = "info";

/// Install a stderr `fmt` subscriber filtered by `$BGI_LOG` (default `info`).
///
/// Returns `false` if a global subscriber was already set, which is not an
/// error: the host application's choice wins.
pub fn init() -> bool {
    let filter = EnvFilter::try_from_env(ENV_LOG).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .with(filter)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_is_harmless() {
        init();
        assert!(!init());
        tracing::info!("logging initialized");
    }
}
