//! Tracing subscriber setup and cache status formatting.
//!
//! The proxy logs through the `tracing` ecosystem. `init_logging` installs a
//! formatted subscriber honoring `RUST_LOG`, defaulting to `info`. The
//! capacity helpers render byte counts in decimal units to keep the
//! `CAPACITY` status lines readable.

use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Initializes the global tracing subscriber with formatted output.
pub fn init_logging() {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

/// Formats a byte count with decimal units (`B`, `kB`, `MB`, ...).
pub fn human_bytes(bytes: u64) -> String {
    const UNIT: u64 = 1000;
    if bytes < UNIT {
        return format!("{bytes} B");
    }
    let mut div = UNIT;
    let mut exp = 0;
    let mut n = bytes / UNIT;
    while n >= UNIT {
        div *= UNIT;
        exp += 1;
        n /= UNIT;
    }
    format!("{:.1} {}B", bytes as f64 / div as f64, ["k", "M", "G", "T", "P", "E"][exp])
}

/// Emits the capacity status line logged after every cache mutation.
pub fn log_capacity(current: u64, max: u64) {
    info!("CAPACITY - {} of {}", human_bytes(current), human_bytes(max));
}
