use anyhow::{Context, Result};
use sqlx::{
    postgres::{PgConnectOptions, PgSslMode},
    Connection, PgConnection, Row,
};
use std::collections::HashSet;
use std::str::FromStr;
use tracing::{info, instrument};

use super::env::env_flag;

/// Ordered schema migrations: (version, description, sql).
const MIGRATIONS: &[(i64, &str, &str)] = &[
    (
        1,
        "catalog_tables",
        include_str!("../../migrations/0001_catalog_tables.sql"),
    ),
    (
        2,
        "merge_functions",
        include_str!("../../migrations/0002_merge_functions.sql"),
    ),
];

/// Build connect options from a DSN, honouring `USE_PREPARED` and `sslmode=require`.
pub fn connect_options(database_url: &str) -> Result<PgConnectOptions> {
    let mut opts = PgConnectOptions::from_str(database_url).context("invalid database url")?;

    // Ensure TLS is enabled when DSN contains sslmode=require
    if database_url.contains("sslmode=require") && !database_url.contains("sslmode=disable") {
        opts = opts.ssl_mode(PgSslMode::Require);
    }

    if !env_flag("USE_PREPARED", false) {
        // PgBouncer txn mode safe
        opts = opts.statement_cache_capacity(0);
    }
    Ok(opts)
}

/// Open the single session a run uses for resume lookup, staging, merges and audit writes.
// SECURITY: never include raw DSNs in tracing spans (they may contain credentials).
#[instrument(skip(database_url))]
pub async fn open_session(database_url: &str) -> Result<PgConnection> {
    let opts = connect_options(database_url)?;
    let conn = PgConnection::connect_with(&opts)
        .await
        .context("failed to connect to database")?;
    info!("connected to db");
    Ok(conn)
}

/// Apply every embedded migration not yet recorded in `_keyforge_migrations`.
/// Returns the versions applied by this call.
pub async fn run_migrations(conn: &mut PgConnection) -> Result<Vec<i64>> {
    // raw_sql avoids prepared statements under PgBouncer
    sqlx::raw_sql(
        "CREATE TABLE IF NOT EXISTS _keyforge_migrations (
            version BIGINT PRIMARY KEY,
            description TEXT,
            installed_at TIMESTAMPTZ DEFAULT now()
         )",
    )
    .execute(&mut *conn)
    .await?;

    let applied_rows = sqlx::raw_sql("SELECT version FROM _keyforge_migrations")
        .fetch_all(&mut *conn)
        .await?;
    let mut applied: HashSet<i64> = HashSet::new();
    for r in applied_rows {
        applied.insert(r.try_get::<i64, _>(0)?);
    }

    let mut newly_applied = Vec::new();
    for &(version, desc, sql) in MIGRATIONS {
        if applied.contains(&version) {
            continue;
        }
        info!(version, desc, "applying migration");
        let mut tx = conn.begin().await?;
        sqlx::raw_sql(sql)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("migration {version}_{desc} failed"))?;
        sqlx::query("INSERT INTO _keyforge_migrations (version, description) VALUES ($1, $2)")
            .persistent(false)
            .bind(version)
            .bind(desc)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        newly_applied.push(version);
    }
    if newly_applied.is_empty() {
        info!("schema up to date");
    }
    Ok(newly_applied)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_strictly_ordered() {
        let versions: Vec<i64> = MIGRATIONS.iter().map(|(v, _, _)| *v).collect();
        let mut sorted = versions.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(versions, sorted);
    }

    #[test]
    fn merge_functions_cover_every_record_set() {
        let sql = MIGRATIONS[1].2;
        for name in [
            "merge_houses",
            "merge_cards",
            "merge_decks",
            "merge_deck_houses",
            "merge_deck_cards",
        ] {
            assert!(sql.contains(name), "missing {name}");
        }
    }

    #[test]
    fn rejects_garbage_dsn() {
        assert!(connect_options("not a dsn").is_err());
    }
}
