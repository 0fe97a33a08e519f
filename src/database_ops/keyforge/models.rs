use std::fmt;

use serde::{Deserialize, Serialize};

/// Faction reference data, copied verbatim from `_linked.houses`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct House {
    pub id: String,
    pub name: String,
    #[serde(rename = "image", default)]
    pub image_url: Option<String>,
}

/// A card as listed in `_linked.cards`. Wire names differ from the column names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Card {
    pub id: String,
    #[serde(rename = "card_title")]
    pub title: String,
    #[serde(rename = "house")]
    pub house_id: String,
    pub card_type: Option<String>,
    #[serde(rename = "front_image")]
    pub front_image_url: Option<String>,
    #[serde(rename = "card_text")]
    pub text: Option<String>,
    pub traits: Option<String>,
    #[serde(default)]
    pub power: i32,
    #[serde(default)]
    pub armor: i32,
    pub rarity: Option<String>,
    pub flavor_text: Option<String>,
    pub card_number: Option<String>,
    pub expansion: i32,
    #[serde(default)]
    pub is_maverick: bool,
    #[serde(default)]
    pub is_anomaly: bool,
    #[serde(default)]
    pub is_enhanced: bool,
}

/// Association lists carried on every deck entry.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeckLinks {
    pub houses: Vec<String>,
    pub cards: Vec<String>,
}

/// One element of the page's `data` array, before page stamping.
#[derive(Debug, Clone, Deserialize)]
pub struct DeckEntry {
    pub id: String,
    pub name: String,
    pub expansion: i32,
    pub power_level: i32,
    pub chains: i32,
    pub wins: i32,
    pub losses: i32,
    // Older API revisions omit these.
    #[serde(default)]
    pub casual_wins: i32,
    #[serde(default)]
    pub casual_losses: i32,
    #[serde(default)]
    pub shards_bonus: i32,
    #[serde(rename = "_links")]
    pub links: DeckLinks,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LinkedEntities {
    pub houses: Option<Vec<House>>,
    pub cards: Option<Vec<Card>>,
}

/// Top-level body of `GET /decks/`.
#[derive(Debug, Clone, Deserialize)]
pub struct DecksPage {
    pub count: Option<i64>,
    pub data: Vec<DeckEntry>,
    #[serde(rename = "_linked")]
    pub linked: Option<LinkedEntities>,
}

/// Flattened deck row; `page_number` is the page the deck was first seen on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Deck {
    pub id: String,
    pub name: String,
    pub expansion: i32,
    pub power_level: i32,
    pub chains: i32,
    pub wins: i32,
    pub losses: i32,
    pub casual_wins: i32,
    pub casual_losses: i32,
    pub shards_bonus: i32,
    pub page_number: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct DeckHouse {
    pub deck_id: String,
    pub house_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct DeckCard {
    pub deck_id: String,
    pub card_id: String,
}

/// The five relational fragments produced from one page.
///
/// This is the caller-owned scratch context for a page: it is rebuilt from scratch for every page
/// and handed to the store for staging, never shared between runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PageBatch {
    pub page_number: u32,
    /// Total catalog size reported by the API. Advisory only.
    pub catalog_count: Option<i64>,
    pub houses: Vec<House>,
    pub cards: Vec<Card>,
    pub decks: Vec<Deck>,
    pub deck_houses: Vec<DeckHouse>,
    pub deck_cards: Vec<DeckCard>,
}

impl PageBatch {
    pub fn len_of(&self, set: RecordSet) -> usize {
        match set {
            RecordSet::Houses => self.houses.len(),
            RecordSet::Cards => self.cards.len(),
            RecordSet::Decks => self.decks.len(),
            RecordSet::DeckHouses => self.deck_houses.len(),
            RecordSet::DeckCards => self.deck_cards.len(),
        }
    }

    /// True when all five record sets are empty.
    pub fn is_empty(&self) -> bool {
        RecordSet::MERGE_ORDER
            .iter()
            .all(|set| self.len_of(*set) == 0)
    }
}

/// Identifies one of the five staged/merged record sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum RecordSet {
    Houses,
    Cards,
    Decks,
    DeckHouses,
    DeckCards,
}

impl RecordSet {
    /// Stage→merge order for a page. Entities land before the junctions that reference them.
    pub const MERGE_ORDER: [RecordSet; 5] = [
        RecordSet::Houses,
        RecordSet::Cards,
        RecordSet::Decks,
        RecordSet::DeckHouses,
        RecordSet::DeckCards,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RecordSet::Houses => "houses",
            RecordSet::Cards => "cards",
            RecordSet::Decks => "decks",
            RecordSet::DeckHouses => "deck_houses",
            RecordSet::DeckCards => "deck_cards",
        }
    }

    /// Session-scoped scratch table the set is bulk-loaded into.
    pub fn staging_table(self) -> &'static str {
        match self {
            RecordSet::Houses => "stg_houses",
            RecordSet::Cards => "stg_cards",
            RecordSet::Decks => "stg_decks",
            RecordSet::DeckHouses => "stg_deck_houses",
            RecordSet::DeckCards => "stg_deck_cards",
        }
    }

    /// Server-side function reconciling the staging table into permanent storage.
    pub fn merge_procedure(self) -> &'static str {
        match self {
            RecordSet::Houses => "merge_houses",
            RecordSet::Cards => "merge_cards",
            RecordSet::Decks => "merge_decks",
            RecordSet::DeckHouses => "merge_deck_houses",
            RecordSet::DeckCards => "merge_deck_cards",
        }
    }
}

impl fmt::Display for RecordSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
