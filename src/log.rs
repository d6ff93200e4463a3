use anyhow::Result;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Install the global subscriber.
///
/// `default_directive` (e.g. `info`, or `symdex::job=debug`) applies when `RUST_LOG` is unset.
pub fn init_logging(default_directive: &str) -> Result<()> {
    tracing::subscriber::set_global_default(
        FmtSubscriber::builder()
            .with_env_filter(
                EnvFilter::builder()
                    .with_default_directive(default_directive.parse()?)
                    .from_env()?,
            )
            .with_writer(std::io::stderr)
            .finish(),
    )?;
    Ok(())
}
