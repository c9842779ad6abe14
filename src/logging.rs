/// Logging initialization.
///
/// The core never calls `println!`/`eprintln!`; every subsystem logs
/// through `tracing`. This function is called exactly once, from `main`,
/// before any subsystem starts.
use tracing_subscriber::EnvFilter;

pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

#[cfg(test)]
mod tests {
    use tracing_test::{logs_contain, traced_test};

    #[traced_test]
    #[test]
    fn warn_level_events_are_captured() {
        tracing::warn!(product = "BTC-USD", "rate limited");
        assert!(logs_contain("rate limited"));
    }
}
