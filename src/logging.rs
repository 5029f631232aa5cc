//! Process-wide diagnostics through `tracing`, written to stderr.

use crate::Result;
use tracing_subscriber::{util::SubscriberInitExt, EnvFilter};

/// Install the global subscriber on stderr. `RUST_LOG` overrides the default
/// filter. Later calls are no-ops.
pub fn init_logging(verbose: bool) -> Result<()> {
    if tracing::dispatcher::has_been_set() {
        return Ok(());
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("archive_backup=debug")
        } else {
            EnvFilter::new("archive_backup=info")
        }
    });

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_file(verbose)
        .with_line_number(verbose)
        .finish()
        .try_init();

    Ok(())
}
