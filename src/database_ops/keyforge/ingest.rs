use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::error::{PipelineStage, RunFailure, SyncError};
use super::models::{PageBatch, RecordSet};
use super::provider::KeyforgeClient;
use super::resume::next_start_page;
use crate::database_ops::catalog_store::CatalogStore;
use crate::normalization::deck_page::normalize;

/// Run-length bound and pacing for one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSettings {
    /// Pages fetched per run, counting the re-fetched boundary page.
    pub pages_per_run: u32,
    /// Cooperative pause between two fetches.
    pub page_delay: Duration,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            pages_per_run: 200,
            page_delay: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The run-length bound was reached.
    Exhausted,
    /// The cancellation flag was raised between pages.
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub start_page: u32,
    pub pages_merged: u32,
    pub last_merged_page: Option<u32>,
    pub empty_pages: u32,
    pub decks_seen: u64,
    /// Latest total catalog size reported by the API.
    pub catalog_count: Option<i64>,
    pub stop: StopReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopState {
    Idle,
    Running { page: u32 },
    Paused { next_page: u32 },
    Stopped(StopReason),
}

/// Drives one run: resume point, bounded page walk, fetch → normalize → stage/merge per page.
///
/// Pages are processed strictly one after another on the store's single session. Any failure
/// stops the run; everything merged before the failing page stays.
pub struct IngestionLoop<'a, S: ?Sized> {
    client: &'a KeyforgeClient,
    store: &'a S,
    settings: RunSettings,
    cancel: Option<watch::Receiver<bool>>,
}

impl<'a, S> IngestionLoop<'a, S>
where
    S: CatalogStore + ?Sized,
{
    pub fn new(client: &'a KeyforgeClient, store: &'a S, settings: RunSettings) -> Self {
        Self {
            client,
            store,
            settings,
            cancel: None,
        }
    }

    /// Observe `cancel`; raising it to `true` stops the run before the next page starts.
    pub fn with_cancel(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub async fn run(mut self) -> Result<RunReport, RunFailure> {
        let run_id = Uuid::new_v4();
        let span = info_span!("keyforge_run", %run_id);
        async move { self.drive(run_id).await }.instrument(span).await
    }

    async fn drive(&mut self, run_id: Uuid) -> Result<RunReport, RunFailure> {
        let mut report = RunReport {
            run_id,
            start_page: 0,
            pages_merged: 0,
            last_merged_page: None,
            empty_pages: 0,
            decks_seen: 0,
            catalog_count: None,
            stop: StopReason::Exhausted,
        };
        let mut last_page = 0u32;
        let mut state = LoopState::Idle;

        loop {
            debug!(?state, "keyforge: loop state");
            state = match state {
                LoopState::Idle => {
                    let start = next_start_page(self.store)
                        .await
                        .map_err(|source| fail(&report, None, PipelineStage::ResumePoint, source))?;
                    if self.settings.pages_per_run == 0 {
                        LoopState::Stopped(StopReason::Exhausted)
                    } else {
                        last_page = start.saturating_add(self.settings.pages_per_run - 1);
                        report.start_page = start;
                        info!(start, last_page, "keyforge: run started");
                        LoopState::Running { page: start }
                    }
                }
                LoopState::Running { page } => {
                    if self.cancelled() {
                        LoopState::Stopped(StopReason::Cancelled)
                    } else {
                        if let Err((stage, source)) = self.process_page(page, &mut report).await {
                            return Err(fail(&report, Some(page), stage, source));
                        }
                        if page >= last_page {
                            LoopState::Stopped(StopReason::Exhausted)
                        } else {
                            LoopState::Paused {
                                next_page: page + 1,
                            }
                        }
                    }
                }
                LoopState::Paused { next_page } => {
                    self.pause().await;
                    LoopState::Running { page: next_page }
                }
                LoopState::Stopped(reason) => {
                    report.stop = reason;
                    info!(
                        ?reason,
                        pages_merged = report.pages_merged,
                        last_merged_page = ?report.last_merged_page,
                        decks_seen = report.decks_seen,
                        "keyforge: run stopped"
                    );
                    return Ok(report);
                }
            };
        }
    }

    async fn process_page(
        &self,
        page: u32,
        report: &mut RunReport,
    ) -> Result<(), (PipelineStage, SyncError)> {
        let fetched = self
            .client
            .fetch_page(page, self.store)
            .await
            .map_err(|e| (PipelineStage::Fetch, e))?;
        let batch = normalize(&fetched, page).map_err(|e| (PipelineStage::Normalize, e))?;

        if let Some(count) = batch.catalog_count {
            let advertised_pages = advertised_pages(count, self.client.page_size());
            if i64::from(page) > advertised_pages {
                warn!(
                    page,
                    catalog_count = count,
                    advertised_pages,
                    "keyforge: page lies beyond the advertised catalog size"
                );
            }
        }

        self.store
            .begin_page()
            .await
            .map_err(|e| (PipelineStage::BeginPage, SyncError::storage(e)))?;
        if let Err(failed) = self.merge_batch(page, &batch).await {
            if let Err(err) = self.store.rollback_page().await {
                warn!(page, error = %err, "keyforge: rollback of failed page did not complete");
            }
            return Err(failed);
        }
        self.store
            .commit_page()
            .await
            .map_err(|e| (PipelineStage::CommitPage, SyncError::storage(e)))?;

        info!(
            page,
            decks = batch.decks.len(),
            houses = batch.houses.len(),
            cards = batch.cards.len(),
            deck_houses = batch.deck_houses.len(),
            deck_cards = batch.deck_cards.len(),
            "keyforge: page merged"
        );

        report.pages_merged += 1;
        report.last_merged_page = Some(page);
        report.decks_seen += batch.decks.len() as u64;
        if batch.decks.is_empty() {
            report.empty_pages += 1;
        }
        if batch.catalog_count.is_some() {
            report.catalog_count = batch.catalog_count;
        }
        Ok(())
    }

    /// Stage and merge every record set of `batch` inside the open page transaction.
    async fn merge_batch(
        &self,
        page: u32,
        batch: &PageBatch,
    ) -> Result<(), (PipelineStage, SyncError)> {
        for set in RecordSet::MERGE_ORDER {
            let staged = self
                .store
                .stage(set, batch)
                .await
                .map_err(|e| (PipelineStage::Stage(set), SyncError::from_store(set, e)))?;
            let merged = self
                .store
                .merge(set)
                .await
                .map_err(|e| (PipelineStage::Merge(set), SyncError::from_store(set, e)))?;
            debug!(page, record_set = %set, staged, merged, "keyforge: record set merged");
        }
        Ok(())
    }

    fn cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|rx| *rx.borrow())
    }

    async fn pause(&mut self) {
        let delay = self.settings.page_delay;
        if delay.is_zero() {
            return;
        }
        match self.cancel.as_mut() {
            None => tokio::time::sleep(delay).await,
            Some(rx) => {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = wait_for_cancel(rx) => {
                        info!("keyforge: pause interrupted by cancellation");
                    }
                }
            }
        }
    }
}

async fn wait_for_cancel(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|cancelled| *cancelled).await.is_err() {
        // Sender gone: cancellation can no longer arrive.
        std::future::pending::<()>().await;
    }
}

/// Pages the catalog claims to have at `page_size` decks per page (ceiling division).
fn advertised_pages(count: i64, page_size: u32) -> i64 {
    let page_size = i64::from(page_size.max(1));
    count / page_size + i64::from(count % page_size != 0)
}

fn fail(
    report: &RunReport,
    page: Option<u32>,
    stage: PipelineStage,
    source: SyncError,
) -> RunFailure {
    RunFailure {
        run_id: report.run_id,
        page,
        stage,
        source,
        pages_merged: report.pages_merged,
        last_merged_page: report.last_merged_page,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advertised_pages_rounds_up() {
        assert_eq!(advertised_pages(0, 10), 0);
        assert_eq!(advertised_pages(10, 10), 1);
        assert_eq!(advertised_pages(11, 10), 2);
        assert_eq!(advertised_pages(5, 0), 5);
    }

    #[test]
    fn advertised_pages_survives_huge_counts() {
        assert_eq!(advertised_pages(i64::MAX, 10), i64::MAX / 10 + 1);
        assert_eq!(advertised_pages(i64::MAX, 1), i64::MAX);
    }
}
