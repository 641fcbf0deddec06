use anyhow::Context as _;
use tracing_subscriber::EnvFilter;

/// Used when `RUST_LOG` is unset. HTTP internals stay quiet unless asked for.
const DEFAULT_FILTER: &str = "info,hyper_util=warn,reqwest=warn";

fn build_filter() -> anyhow::Result<EnvFilter> {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(DEFAULT_FILTER))
        .context("build log filter")
}

/// Logs go to stderr so stdout only carries the run report.
pub fn init() -> anyhow::Result<()> {
    let filter = build_filter()?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err| anyhow::anyhow!("initialize tracing subscriber: {err}"))?;

    Ok(())
}
