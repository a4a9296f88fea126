use std::env;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const DEFAULT_FILTER: &str = "mailshift=info,warn";

/// Stderr subscriber. `MAILSHIFT_LOG` takes an `EnvFilter` directive,
/// `MAILSHIFT_LOG_FORMAT` picks `compact` (default) or `json`.
pub fn init() {
    let filter = EnvFilter::try_from_env("MAILSHIFT_LOG")
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let format = env::var("MAILSHIFT_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());

    let registry = tracing_subscriber::registry().with(filter);
    let installed = match format.trim() {
        "json" => registry
            .with(fmt::layer().json().with_ansi(false).with_writer(std::io::stderr))
            .try_init(),
        _ => registry
            .with(fmt::layer().compact().with_writer(std::io::stderr))
            .try_init(),
    };
    if let Err(err) = installed {
        eprintln!("mailshift logging init warning: {err}");
    }
}
