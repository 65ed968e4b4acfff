use tracing_subscriber::EnvFilter;

/// Install the process-wide `tracing` subscriber.
///
/// `RUST_LOG` wins when it is set; otherwise `default_level` applies to this
/// crate and everything else stays at `warn`. Safe to call more than once.
pub fn init(default_level: &str) {
    let level = match default_level.to_lowercase().as_str() {
        "error" => "error",
        "warn" | "warning" => "warn",
        "debug" => "debug",
        "trace" => "trace",
        _ => "info",
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("warn,mqtt_flow={level}")));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
