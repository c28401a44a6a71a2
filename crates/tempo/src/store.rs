use std::sync::Arc;

use anyhow::{bail, Context};
use tempo_core::{config::Config, store::ActionStore};
use tempo_postgres::PostgresActionStore;
use tempo_sqlite::SqliteActionStore;

#[derive(Debug, PartialEq, Eq)]
enum Backend<'a> {
    SqliteFile(&'a str),
    SqliteMemory,
    Postgres(&'a str),
}

fn backend(url: &str) -> anyhow::Result<Backend<'_>> {
    if url.starts_with("postgres://") || url.starts_with("postgresql://") {
        return Ok(Backend::Postgres(url));
    }
    if url == "sqlite::memory:" {
        return Ok(Backend::SqliteMemory);
    }
    match url.strip_prefix("sqlite://") {
        Some(path) if !path.is_empty() => Ok(Backend::SqliteFile(path)),
        _ => bail!("unsupported TEMPO_DATABASE_URL {url:?} (expected sqlite://<path> or postgres://...)"),
    }
}

/// Log-safe description of the store URL (no credentials).
pub fn describe(url: &str) -> String {
    match backend(url) {
        Ok(Backend::SqliteFile(path)) => format!("sqlite:{path}"),
        Ok(Backend::SqliteMemory) => "sqlite:memory".to_string(),
        Ok(Backend::Postgres(_)) => "postgres".to_string(),
        Err(_) => "unknown".to_string(),
    }
}

pub async fn open(cfg: &Config) -> anyhow::Result<Arc<dyn ActionStore>> {
    let retry = cfg.retry_policy();
    let store: Arc<dyn ActionStore> = match backend(&cfg.database_url)? {
        Backend::SqliteFile(path) => Arc::new(
            SqliteActionStore::open(path)
                .with_context(|| format!("opening sqlite store at {path}"))?
                .with_retry_policy(retry)
                .with_worker_id(cfg.worker_id.clone()),
        ),
        Backend::SqliteMemory => Arc::new(
            SqliteActionStore::open_in_memory()?
                .with_retry_policy(retry)
                .with_worker_id(cfg.worker_id.clone()),
        ),
        Backend::Postgres(url) => Arc::new(
            PostgresActionStore::connect(url)
                .await
                .context("connecting to postgres")?
                .with_retry_policy(retry)
                .with_worker_id(cfg.worker_id.clone()),
        ),
    };
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_url_selects_backend() {
        assert_eq!(backend("sqlite://tempo.db").unwrap(), Backend::SqliteFile("tempo.db"));
        assert_eq!(
            backend("sqlite:///var/lib/tempo/tempo.db").unwrap(),
            Backend::SqliteFile("/var/lib/tempo/tempo.db")
        );
        assert_eq!(backend("sqlite::memory:").unwrap(), Backend::SqliteMemory);
        assert!(matches!(
            backend("postgresql://u:p@db/tempo").unwrap(),
            Backend::Postgres(_)
        ));
        assert!(backend("sqlite://").is_err());
        assert!(backend("mysql://db").is_err());
    }

    #[test]
    fn describe_hides_credentials() {
        assert_eq!(describe("postgres://user:secret@db:5432/tempo"), "postgres");
        assert_eq!(describe("sqlite://tempo.db"), "sqlite:tempo.db");
    }
}
