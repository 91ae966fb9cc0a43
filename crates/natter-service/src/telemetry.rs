use tracing_subscriber::EnvFilter;

pub const DEFAULT_FILTER: &str = "natter_db=info,natter_service=info";

/// Install the global fmt subscriber, filtered by `RUST_LOG`. Safe to call
/// more than once; later calls are ignored.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_FILTER.into()))
        .try_init();
}
