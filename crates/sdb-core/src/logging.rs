//! Structured logging with `tracing`.
//!
//! Library code only emits events; binaries and tests call
//! [`init_subscriber`] once to see them.

use tracing_subscriber::EnvFilter;

/// Crates whose events the default filter lets through.
const SDB_TARGETS: [&str; 5] = [
    "sdb_core",
    "sdb_tasks",
    "sdb_settings",
    "sdb_engine",
    "sdb_client",
];

/// Filter for `level`, limited to the sdb crates. `RUST_LOG` wins when set.
fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let directives = SDB_TARGETS.map(|target| format!("{target}={level}"));
        EnvFilter::new(directives.join(","))
    })
}

/// Install a compact stderr subscriber. Later calls are no-ops.
pub fn init_subscriber(level: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter(level))
        .with_target(true)
        .with_writer(std::io::stderr)
        .compact()
        .try_init();
}

/// Install a JSON subscriber, for log shipping.
pub fn init_json_subscriber(level: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter(level))
        .with_writer(std::io::stderr)
        .json()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_init_is_harmless() {
        init_subscriber("warn");
        init_subscriber("debug");
        init_json_subscriber("info");
    }

    #[test]
    fn default_filter_covers_every_crate() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        let rendered = env_filter("debug").to_string();
        for target in SDB_TARGETS {
            assert!(rendered.contains(&format!("{target}=debug")), "{rendered}");
        }
    }
}
