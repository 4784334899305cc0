//! Tracing setup, following the teacher's pattern of an `EnvFilter` seeded
//! from config with a `RUST_LOG` override, plain text in development and
//! JSON when running as a service.

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

pub fn init(log_level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().with_target(false)).init();
    }
}
