use tracing_subscriber::EnvFilter;

const CRATE_NAMES: &[&str] = &["loadgen", "loadgen_test"];

/// Initialize the logger for testing.
///
/// Logs go to the stdout captured by the Rust test runner. `RUST_LOG` takes precedence when
/// set, otherwise only the load generator crates are logged, at `TRACE`.
///
/// Calling this more than once is fine, only the first call installs a subscriber.
///
/// # Example
///
/// ```
/// loadgen_test::tracing::init();
/// ```
pub fn init() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| crate_filter("TRACE"));

    tracing_subscriber::fmt::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_test_writer()
        .compact()
        .try_init()
        .ok();
}

fn crate_filter(level: &str) -> EnvFilter {
    CRATE_NAMES
        .iter()
        .fold(EnvFilter::new("ERROR"), |filter, name| {
            filter.add_directive(format!("{name}={level}").parse().unwrap())
        })
}
