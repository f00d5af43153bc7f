//! Diagnostic logging. Operator-facing output goes through `display`; this is
//! for `tracing` events only and always writes to stderr.

use crate::error::DkError;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const LOG_ENV: &str = "DKDEPLOY_LOG";

/// Filter directive when `DKDEPLOY_LOG` is unset.
pub fn default_directive(verbose: bool) -> &'static str {
    if verbose {
        "dkdeploy=debug"
    } else {
        "warn"
    }
}

pub fn init_logging(verbose: bool) -> Result<(), DkError> {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .try_init()
        .map_err(|err| DkError::Config(format!("failed to initialise logging: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbose_raises_to_debug() {
        assert_eq!(default_directive(false), "warn");
        assert_eq!(default_directive(true), "dkdeploy=debug");
    }
}
