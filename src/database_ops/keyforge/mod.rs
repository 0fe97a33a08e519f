//! KeyForge deck catalog sync.
//!
//! One run: read the resume point, walk `pages_per_run` pages of `GET /decks/`, and push each
//! page's houses, cards, decks and the two junction sets through stage → merge.
pub mod audit;
pub mod error;
pub mod ingest;
pub mod models;
pub mod provider;
pub mod resume;

pub use audit::{AuditEntry, AuditSink};
pub use error::{FetchError, PipelineStage, RunFailure, StoreError, SyncError};
pub use ingest::{IngestionLoop, RunReport, RunSettings, StopReason};
pub use models::{Card, Deck, DeckCard, DeckHouse, House, PageBatch, RecordSet};
pub use provider::{KeyforgeClient, Page, RetryPolicy};
pub use resume::next_start_page;

use tokio::sync::watch;

use crate::config::SyncConfig;
use crate::database_ops::catalog_store::CatalogStore;

/// Run one sync pass against `store` with the given configuration.
pub async fn sync<S>(
    config: &SyncConfig,
    store: &S,
    cancel: watch::Receiver<bool>,
) -> anyhow::Result<RunReport>
where
    S: CatalogStore + ?Sized,
{
    config.validate()?;
    let client = config.build_client()?;
    let report = IngestionLoop::new(&client, store, config.run_settings())
        .with_cancel(cancel)
        .run()
        .await?;
    Ok(report)
}
