use tracing_subscriber::EnvFilter;

pub fn init_logging(verbosity: u8) {
    let filter = match verbosity {
        0 => EnvFilter::new("drilling=warn"),
        1 => EnvFilter::new("drilling=info"),
        2 => EnvFilter::new("drilling=debug"),
        _ => EnvFilter::new("drilling=trace"),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
