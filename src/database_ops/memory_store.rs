//! In-process [`CatalogStore`] with the same staging/merge contract as the Postgres store.
//! Backs `--dry-run` and the test suite.
use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::database_ops::catalog_store::CatalogStore;
use crate::database_ops::keyforge::audit::{AuditEntry, AuditSink};
use crate::database_ops::keyforge::error::StoreError;
use crate::database_ops::keyforge::models::{
    Card, Deck, DeckCard, DeckHouse, House, PageBatch, RecordSet,
};

/// Permanent tables, keyed the same way as the SQL schema.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CatalogSnapshot {
    pub houses: BTreeMap<String, House>,
    pub cards: BTreeMap<String, Card>,
    pub decks: BTreeMap<String, Deck>,
    pub deck_houses: BTreeSet<DeckHouse>,
    /// Pair → copies observed when the pair was first merged.
    pub deck_cards: BTreeMap<DeckCard, u32>,
}

#[derive(Debug, Default)]
struct Staging {
    houses: Vec<House>,
    cards: Vec<Card>,
    decks: Vec<Deck>,
    deck_houses: Vec<DeckHouse>,
    deck_cards: Vec<DeckCard>,
}

#[derive(Debug, Default)]
struct Inner {
    staging: Staging,
    permanent: CatalogSnapshot,
    /// Copy of `permanent` that merges write to while a page is open.
    pending: Option<CatalogSnapshot>,
    audit: Vec<AuditEntry>,
    merge_calls: HashMap<RecordSet, usize>,
    stage_calls: HashMap<RecordSet, usize>,
    /// (set, 1-based merge invocation) that must be rejected.
    injected_failures: Vec<(RecordSet, usize)>,
    /// (set, 1-based stage invocation) that must fail as unreachable.
    injected_stage_failures: Vec<(RecordSet, usize)>,
    unavailable: bool,
}

impl Inner {
    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable {
            return Err(StoreError::Unavailable("memory store marked unavailable".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject the `call`-th merge of `set` (1-based) as a storage-side conflict.
    pub async fn fail_merge_on_call(&self, set: RecordSet, call: usize) {
        self.inner.lock().await.injected_failures.push((set, call));
    }

    /// Fail the `call`-th stage of `set` (1-based) as if the backend dropped the connection.
    pub async fn fail_stage_on_call(&self, set: RecordSet, call: usize) {
        self.inner
            .lock()
            .await
            .injected_stage_failures
            .push((set, call));
    }

    /// True while a page transaction is open.
    pub async fn page_open(&self) -> bool {
        self.inner.lock().await.pending.is_some()
    }

    /// Make every subsequent call fail as if the backend were unreachable.
    pub async fn set_unavailable(&self, unavailable: bool) {
        self.inner.lock().await.unavailable = unavailable;
    }

    pub async fn snapshot(&self) -> CatalogSnapshot {
        self.inner.lock().await.permanent.clone()
    }

    pub async fn audit_entries(&self) -> Vec<AuditEntry> {
        self.inner.lock().await.audit.clone()
    }

    pub async fn staged_len(&self, set: RecordSet) -> usize {
        let inner = self.inner.lock().await;
        let s = &inner.staging;
        match set {
            RecordSet::Houses => s.houses.len(),
            RecordSet::Cards => s.cards.len(),
            RecordSet::Decks => s.decks.len(),
            RecordSet::DeckHouses => s.deck_houses.len(),
            RecordSet::DeckCards => s.deck_cards.len(),
        }
    }
}

#[async_trait]
impl AuditSink for MemoryStore {
    async fn append(&self, entry: &AuditEntry) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.check_available()?;
        inner.audit.push(entry.clone());
        Ok(())
    }
}

#[async_trait]
impl CatalogStore for MemoryStore {
    async fn max_page_number(&self) -> Result<Option<u32>, StoreError> {
        let inner = self.inner.lock().await;
        inner.check_available()?;
        Ok(inner.permanent.decks.values().map(|d| d.page_number).max())
    }

    async fn stage(&self, set: RecordSet, batch: &PageBatch) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.check_available()?;
        let call = {
            let counter = inner.stage_calls.entry(set).or_insert(0);
            *counter += 1;
            *counter
        };
        if inner.injected_stage_failures.contains(&(set, call)) {
            return Err(StoreError::Unavailable(format!(
                "injected connection loss on {set} stage #{call}"
            )));
        }
        let s = &mut inner.staging;
        match set {
            RecordSet::Houses => s.houses = batch.houses.clone(),
            RecordSet::Cards => s.cards = batch.cards.clone(),
            RecordSet::Decks => s.decks = batch.decks.clone(),
            RecordSet::DeckHouses => s.deck_houses = batch.deck_houses.clone(),
            RecordSet::DeckCards => s.deck_cards = batch.deck_cards.clone(),
        }
        Ok(batch.len_of(set) as u64)
    }

    async fn merge(&self, set: RecordSet) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.check_available()?;
        let call = {
            let counter = inner.merge_calls.entry(set).or_insert(0);
            *counter += 1;
            *counter
        };
        if inner.injected_failures.contains(&(set, call)) {
            return Err(StoreError::Rejected(format!(
                "injected failure on {set} merge #{call}"
            )));
        }

        let Inner {
            staging,
            permanent,
            pending,
            ..
        } = &mut *inner;
        let permanent = match pending {
            Some(open) => open,
            None => permanent,
        };
        let mut touched = 0u64;
        match set {
            RecordSet::Houses => {
                for house in &staging.houses {
                    permanent.houses.insert(house.id.clone(), house.clone());
                    touched += 1;
                }
            }
            RecordSet::Cards => {
                for card in &staging.cards {
                    permanent.cards.insert(card.id.clone(), card.clone());
                    touched += 1;
                }
            }
            RecordSet::Decks => {
                for deck in &staging.decks {
                    match permanent.decks.get_mut(&deck.id) {
                        Some(existing) => {
                            // Provenance stays with the first observation.
                            let first_page = existing.page_number;
                            *existing = Deck {
                                page_number: first_page,
                                ..deck.clone()
                            };
                        }
                        None => {
                            permanent.decks.insert(deck.id.clone(), deck.clone());
                        }
                    }
                    touched += 1;
                }
            }
            RecordSet::DeckHouses => {
                for pair in &staging.deck_houses {
                    if permanent.deck_houses.insert(pair.clone()) {
                        touched += 1;
                    }
                }
            }
            RecordSet::DeckCards => {
                let mut copies: BTreeMap<&DeckCard, u32> = BTreeMap::new();
                for pair in &staging.deck_cards {
                    *copies.entry(pair).or_insert(0) += 1;
                }
                for (pair, n) in copies {
                    if !permanent.deck_cards.contains_key(pair) {
                        permanent.deck_cards.insert(pair.clone(), n);
                        touched += 1;
                    }
                }
            }
        }
        Ok(touched)
    }

    async fn begin_page(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.check_available()?;
        if inner.pending.is_some() {
            return Err(StoreError::Rejected("page transaction already open".into()));
        }
        inner.pending = Some(inner.permanent.clone());
        Ok(())
    }

    async fn commit_page(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.check_available()?;
        match inner.pending.take() {
            Some(open) => {
                inner.permanent = open;
                Ok(())
            }
            None => Err(StoreError::Rejected("no page transaction to commit".into())),
        }
    }

    async fn rollback_page(&self) -> Result<(), StoreError> {
        self.inner.lock().await.pending = None;
        Ok(())
    }
}
