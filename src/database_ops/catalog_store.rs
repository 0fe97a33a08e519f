//! Storage seam for the sync pipeline plus the Postgres implementation.
//!
//! The Postgres store owns exactly one session. Staging tables are `TEMP` tables on that session,
//! so every run (and every test) gets its own scratch area; merges are the `merge_*()` functions
//! installed by the migrations. A page's five stage/merge pairs run inside one transaction, so a
//! page lands in permanent storage completely or not at all.
use async_trait::async_trait;
use sqlx::{Executor, PgConnection, Row};
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use crate::database_ops::keyforge::audit::{AuditEntry, AuditSink};
use crate::database_ops::keyforge::error::StoreError;
use crate::database_ops::keyforge::models::{PageBatch, RecordSet};

/// Resume lookup, per-set staging and per-set keyed merge.
#[async_trait]
pub trait CatalogStore: AuditSink {
    /// Highest `page_number` over permanent decks; `None` when nothing was ingested yet.
    async fn max_page_number(&self) -> Result<Option<u32>, StoreError>;

    /// Clear the scratch area for `set`, then load the batch's records for it.
    /// Returns the number of staged rows.
    async fn stage(&self, set: RecordSet, batch: &PageBatch) -> Result<u64, StoreError>;

    /// Reconcile the scratch area for `set` into permanent storage. Returns rows touched.
    async fn merge(&self, set: RecordSet) -> Result<u64, StoreError>;

    /// Open the transaction a page's stage/merge calls run in.
    ///
    /// Audit appends belong outside it; the ingestion loop fetches (and audits) before opening.
    async fn begin_page(&self) -> Result<(), StoreError>;

    /// Make every merge since [`CatalogStore::begin_page`] durable.
    async fn commit_page(&self) -> Result<(), StoreError>;

    /// Discard every merge since [`CatalogStore::begin_page`].
    async fn rollback_page(&self) -> Result<(), StoreError>;
}

const STAGING_DDL: &str = r#"
CREATE TEMP TABLE IF NOT EXISTS stg_houses (
    id TEXT, name TEXT, image_url TEXT
);
CREATE TEMP TABLE IF NOT EXISTS stg_cards (
    id TEXT, title TEXT, house_id TEXT, card_type TEXT, front_image_url TEXT, card_text TEXT,
    traits TEXT, power INTEGER, armor INTEGER, rarity TEXT, flavor_text TEXT, card_number TEXT,
    expansion INTEGER, is_maverick BOOLEAN, is_anomaly BOOLEAN, is_enhanced BOOLEAN
);
CREATE TEMP TABLE IF NOT EXISTS stg_decks (
    id TEXT, name TEXT, expansion INTEGER, power_level INTEGER, chains INTEGER, wins INTEGER,
    losses INTEGER, casual_wins INTEGER, casual_losses INTEGER, shards_bonus INTEGER,
    page_number BIGINT
);
CREATE TEMP TABLE IF NOT EXISTS stg_deck_houses (deck_id TEXT, house_id TEXT);
CREATE TEMP TABLE IF NOT EXISTS stg_deck_cards (deck_id TEXT, card_id TEXT);
"#;

pub struct PgStore {
    conn: Mutex<PgConnection>,
}

impl PgStore {
    /// Wrap an open session and create its staging tables.
    pub async fn new(mut conn: PgConnection) -> Result<Self, StoreError> {
        sqlx::raw_sql(STAGING_DDL).execute(&mut conn).await?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Give the session back, e.g. to close it explicitly.
    pub fn into_inner(self) -> PgConnection {
        self.conn.into_inner()
    }
}

#[async_trait]
impl AuditSink for PgStore {
    async fn append(&self, entry: &AuditEntry) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().await;
        sqlx::query(
            "INSERT INTO api_call_log (url, called_at, response_code, error) VALUES ($1, $2, $3, $4)",
        )
        .persistent(false)
        .bind(&entry.url)
        .bind(entry.called_at)
        .bind(entry.response_code.map(i32::from))
        .bind(entry.error.as_deref())
        .execute(&mut *conn)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl CatalogStore for PgStore {
    async fn max_page_number(&self) -> Result<Option<u32>, StoreError> {
        let mut conn = self.conn.lock().await;
        let max: Option<i64> = sqlx::query_scalar("SELECT max(page_number) FROM decks")
            .persistent(false)
            .fetch_one(&mut *conn)
            .await?;
        max.map(|v| {
            u32::try_from(v)
                .map_err(|_| StoreError::Rejected(format!("decks.page_number out of range: {v}")))
        })
        .transpose()
    }

    #[instrument(skip(self, batch), fields(page = batch.page_number))]
    async fn stage(&self, set: RecordSet, batch: &PageBatch) -> Result<u64, StoreError> {
        let mut conn = self.conn.lock().await;
        let truncate = format!("TRUNCATE {}", set.staging_table());
        (&mut *conn).execute(sqlx::raw_sql(&truncate)).await?;
        if batch.len_of(set) == 0 {
            return Ok(0);
        }

        // Single batch INSERT per set using UNNEST to expand column arrays.
        let result = match set {
            RecordSet::Houses => {
                let ids: Vec<&str> = batch.houses.iter().map(|h| h.id.as_str()).collect();
                let names: Vec<&str> = batch.houses.iter().map(|h| h.name.as_str()).collect();
                let images: Vec<Option<&str>> =
                    batch.houses.iter().map(|h| h.image_url.as_deref()).collect();
                sqlx::query(
                    "INSERT INTO stg_houses (id, name, image_url)
                     SELECT * FROM UNNEST($1::text[], $2::text[], $3::text[])",
                )
                .persistent(false)
                .bind(ids)
                .bind(names)
                .bind(images)
                .execute(&mut *conn)
                .await?
            }
            RecordSet::Cards => {
                let c = &batch.cards;
                sqlx::query(
                    "INSERT INTO stg_cards (
                        id, title, house_id, card_type, front_image_url, card_text, traits, power,
                        armor, rarity, flavor_text, card_number, expansion, is_maverick,
                        is_anomaly, is_enhanced
                     )
                     SELECT * FROM UNNEST(
                        $1::text[], $2::text[], $3::text[], $4::text[], $5::text[], $6::text[],
                        $7::text[], $8::int4[], $9::int4[], $10::text[], $11::text[], $12::text[],
                        $13::int4[], $14::bool[], $15::bool[], $16::bool[]
                     )",
                )
                .persistent(false)
                .bind(c.iter().map(|x| x.id.as_str()).collect::<Vec<_>>())
                .bind(c.iter().map(|x| x.title.as_str()).collect::<Vec<_>>())
                .bind(c.iter().map(|x| x.house_id.as_str()).collect::<Vec<_>>())
                .bind(c.iter().map(|x| x.card_type.as_deref()).collect::<Vec<_>>())
                .bind(c.iter().map(|x| x.front_image_url.as_deref()).collect::<Vec<_>>())
                .bind(c.iter().map(|x| x.text.as_deref()).collect::<Vec<_>>())
                .bind(c.iter().map(|x| x.traits.as_deref()).collect::<Vec<_>>())
                .bind(c.iter().map(|x| x.power).collect::<Vec<i32>>())
                .bind(c.iter().map(|x| x.armor).collect::<Vec<i32>>())
                .bind(c.iter().map(|x| x.rarity.as_deref()).collect::<Vec<_>>())
                .bind(c.iter().map(|x| x.flavor_text.as_deref()).collect::<Vec<_>>())
                .bind(c.iter().map(|x| x.card_number.as_deref()).collect::<Vec<_>>())
                .bind(c.iter().map(|x| x.expansion).collect::<Vec<i32>>())
                .bind(c.iter().map(|x| x.is_maverick).collect::<Vec<bool>>())
                .bind(c.iter().map(|x| x.is_anomaly).collect::<Vec<bool>>())
                .bind(c.iter().map(|x| x.is_enhanced).collect::<Vec<bool>>())
                .execute(&mut *conn)
                .await?
            }
            RecordSet::Decks => {
                let d = &batch.decks;
                sqlx::query(
                    "INSERT INTO stg_decks (
                        id, name, expansion, power_level, chains, wins, losses, casual_wins,
                        casual_losses, shards_bonus, page_number
                     )
                     SELECT * FROM UNNEST(
                        $1::text[], $2::text[], $3::int4[], $4::int4[], $5::int4[], $6::int4[],
                        $7::int4[], $8::int4[], $9::int4[], $10::int4[], $11::int8[]
                     )",
                )
                .persistent(false)
                .bind(d.iter().map(|x| x.id.as_str()).collect::<Vec<_>>())
                .bind(d.iter().map(|x| x.name.as_str()).collect::<Vec<_>>())
                .bind(d.iter().map(|x| x.expansion).collect::<Vec<i32>>())
                .bind(d.iter().map(|x| x.power_level).collect::<Vec<i32>>())
                .bind(d.iter().map(|x| x.chains).collect::<Vec<i32>>())
                .bind(d.iter().map(|x| x.wins).collect::<Vec<i32>>())
                .bind(d.iter().map(|x| x.losses).collect::<Vec<i32>>())
                .bind(d.iter().map(|x| x.casual_wins).collect::<Vec<i32>>())
                .bind(d.iter().map(|x| x.casual_losses).collect::<Vec<i32>>())
                .bind(d.iter().map(|x| x.shards_bonus).collect::<Vec<i32>>())
                .bind(d.iter().map(|x| i64::from(x.page_number)).collect::<Vec<i64>>())
                .execute(&mut *conn)
                .await?
            }
            RecordSet::DeckHouses => {
                let pairs = &batch.deck_houses;
                sqlx::query(
                    "INSERT INTO stg_deck_houses (deck_id, house_id)
                     SELECT * FROM UNNEST($1::text[], $2::text[])",
                )
                .persistent(false)
                .bind(pairs.iter().map(|p| p.deck_id.as_str()).collect::<Vec<_>>())
                .bind(pairs.iter().map(|p| p.house_id.as_str()).collect::<Vec<_>>())
                .execute(&mut *conn)
                .await?
            }
            RecordSet::DeckCards => {
                let pairs = &batch.deck_cards;
                sqlx::query(
                    "INSERT INTO stg_deck_cards (deck_id, card_id)
                     SELECT * FROM UNNEST($1::text[], $2::text[])",
                )
                .persistent(false)
                .bind(pairs.iter().map(|p| p.deck_id.as_str()).collect::<Vec<_>>())
                .bind(pairs.iter().map(|p| p.card_id.as_str()).collect::<Vec<_>>())
                .execute(&mut *conn)
                .await?
            }
        };
        debug!(record_set = %set, rows = result.rows_affected(), "staged");
        Ok(result.rows_affected())
    }

    #[instrument(skip(self))]
    async fn merge(&self, set: RecordSet) -> Result<u64, StoreError> {
        let mut conn = self.conn.lock().await;
        let row = sqlx::query(&format!("SELECT {}() AS affected", set.merge_procedure()))
            .persistent(false)
            .fetch_one(&mut *conn)
            .await?;
        let affected: i64 = row.try_get("affected")?;
        debug!(record_set = %set, rows = affected, "merged");
        Ok(u64::try_from(affected).unwrap_or(0))
    }

    // The page transaction spans several trait calls, so it is driven with plain statements.
    async fn begin_page(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().await;
        (&mut *conn).execute(sqlx::raw_sql("BEGIN")).await?;
        Ok(())
    }

    async fn commit_page(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().await;
        (&mut *conn).execute(sqlx::raw_sql("COMMIT")).await?;
        Ok(())
    }

    async fn rollback_page(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().await;
        (&mut *conn).execute(sqlx::raw_sql("ROLLBACK")).await?;
        Ok(())
    }
}
