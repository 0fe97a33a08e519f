use serde::Deserialize;

use crate::database_ops::keyforge::error::SyncError;
use crate::database_ops::keyforge::models::{
    Deck, DeckCard, DeckHouse, DecksPage, LinkedEntities, PageBatch,
};
use crate::database_ops::keyforge::provider::Page;

/// Reshape one fetched page into the five relational record sets.
///
/// Pure: no I/O. `page_number` is stamped on every deck regardless of what the payload says.
/// Repeated card references on a deck are kept (one pair per copy); house pairs are recorded as
/// observed, without any cardinality check.
///
/// A page with no decks is valid and yields an empty batch. Linked houses/cards are only required
/// when the page has decks.
pub fn normalize(page: &Page, page_number: u32) -> Result<PageBatch, SyncError> {
    let parsed = DecksPage::deserialize(&page.payload)
        .map_err(|e| SyncError::MalformedPage(format!("page {page_number}: {e}")))?;
    normalize_parsed(parsed, page_number)
}

fn normalize_parsed(parsed: DecksPage, page_number: u32) -> Result<PageBatch, SyncError> {
    let DecksPage { count, data, linked } = parsed;
    let LinkedEntities { houses, cards } = linked.unwrap_or_default();

    let (houses, cards) = if data.is_empty() {
        (houses.unwrap_or_default(), cards.unwrap_or_default())
    } else {
        let houses = houses.ok_or_else(|| missing(page_number, "_linked.houses"))?;
        let cards = cards.ok_or_else(|| missing(page_number, "_linked.cards"))?;
        (houses, cards)
    };

    let mut batch = PageBatch {
        page_number,
        catalog_count: count,
        houses,
        cards,
        decks: Vec::with_capacity(data.len()),
        deck_houses: Vec::new(),
        deck_cards: Vec::new(),
    };

    for entry in data {
        batch
            .deck_houses
            .extend(entry.links.houses.into_iter().map(|house_id| DeckHouse {
                deck_id: entry.id.clone(),
                house_id,
            }));
        batch
            .deck_cards
            .extend(entry.links.cards.into_iter().map(|card_id| DeckCard {
                deck_id: entry.id.clone(),
                card_id,
            }));
        batch.decks.push(Deck {
            id: entry.id,
            name: entry.name,
            expansion: entry.expansion,
            power_level: entry.power_level,
            chains: entry.chains,
            wins: entry.wins,
            losses: entry.losses,
            casual_wins: entry.casual_wins,
            casual_losses: entry.casual_losses,
            shards_bonus: entry.shards_bonus,
            page_number,
        });
    }

    Ok(batch)
}

fn missing(page_number: u32, field: &str) -> SyncError {
    SyncError::MalformedPage(format!("page {page_number}: missing {field}"))
}
