use tracing_subscriber::{fmt, EnvFilter};

use crate::Result;

/// Workspace crates that log at `info` unless `RUST_LOG` says otherwise.
const TEMPO_TARGETS: &[&str] = &[
    "tempo",
    "tempo_core",
    "tempo_sqlite",
    "tempo_postgres",
    "tempo_webhook",
];

/// Install the global fmt subscriber for `service`.
///
/// `RUST_LOG` replaces the default filter entirely. Calling this twice keeps
/// the first subscriber.
pub fn init(service: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(service)));

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_names(true)
        .compact()
        .try_init();

    Ok(())
}

/// `warn` globally, `info` for the tempo crates and `service`.
fn default_directives(service: &str) -> String {
    let service = service.replace('-', "_");
    let mut targets: Vec<&str> = TEMPO_TARGETS.to_vec();
    if !targets.contains(&service.as_str()) {
        targets.push(&service);
    }
    let mut directives = vec!["warn".to_string()];
    directives.extend(targets.iter().map(|target| format!("{target}=info")));
    directives.join(",")
}
