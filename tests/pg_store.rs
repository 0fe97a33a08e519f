//! Postgres store against a live database.
//!
//! Requires `DATABASE_URL` (or `KEYFORGE_DATABASE_URL`) and runs only with `--ignored`.

use keyforge_sync::database_ops::catalog_store::{CatalogStore, PgStore};
use keyforge_sync::database_ops::keyforge::{
    AuditEntry, AuditSink, Deck, DeckCard, DeckHouse, House, PageBatch, RecordSet,
};
use keyforge_sync::util::{db, env as env_util};
use pretty_assertions::assert_eq;
use sqlx::Row;
use uuid::Uuid;

async fn store() -> PgStore {
    env_util::init_env();
    let url = env_util::db_url().expect("DATABASE_URL required for pg tests");
    let mut conn = db::open_session(&url).await.expect("connect");
    db::run_migrations(&mut conn).await.expect("migrate");
    PgStore::new(conn).await.expect("staging tables")
}

fn batch(tag: &str) -> PageBatch {
    let deck_id = format!("test-deck-{tag}");
    let house_id = format!("test-house-{tag}");
    let card_id = format!("test-card-{tag}");
    PageBatch {
        page_number: 3,
        houses: vec![House {
            id: house_id.clone(),
            name: "Test".into(),
            image_url: None,
        }],
        decks: vec![Deck {
            id: deck_id.clone(),
            name: "Fixture Deck".into(),
            expansion: 341,
            power_level: 1,
            chains: 0,
            wins: 2,
            losses: 1,
            casual_wins: 0,
            casual_losses: 0,
            shards_bonus: 0,
            page_number: 3,
        }],
        deck_houses: vec![DeckHouse {
            deck_id: deck_id.clone(),
            house_id,
        }],
        deck_cards: vec![
            DeckCard {
                deck_id: deck_id.clone(),
                card_id: card_id.clone(),
            },
            DeckCard {
                deck_id,
                card_id,
            },
        ],
        ..PageBatch::default()
    }
}

async fn ingest(store: &PgStore, batch: &PageBatch) {
    for set in RecordSet::MERGE_ORDER {
        store.stage(set, batch).await.unwrap();
        store.merge(set).await.unwrap();
    }
}

#[tokio::test]
#[ignore = "needs a Postgres database"]
async fn merging_a_page_twice_changes_nothing() {
    let store = store().await;
    let tag = Uuid::new_v4().simple().to_string();
    let page = batch(&tag);

    ingest(&store, &page).await;
    ingest(&store, &page).await;

    // A later page re-observing the deck must not move its provenance.
    let mut later = page.clone();
    later.page_number = 9;
    later.decks[0].page_number = 9;
    later.decks[0].wins = 5;
    ingest(&store, &later).await;

    let deck_id = format!("test-deck-{tag}");
    let mut conn = store.into_inner();
    let row = sqlx::query("SELECT page_number, wins FROM decks WHERE id = $1")
        .bind(&deck_id)
        .fetch_one(&mut conn)
        .await
        .unwrap();
    assert_eq!(row.get::<i64, _>("page_number"), 3);
    assert_eq!(row.get::<i32, _>("wins"), 5);

    let copies: Vec<i32> = sqlx::query_scalar("SELECT copies FROM deck_cards WHERE deck_id = $1")
        .bind(&deck_id)
        .fetch_all(&mut conn)
        .await
        .unwrap();
    assert_eq!(copies, vec![2]);

    let houses: i64 = sqlx::query_scalar("SELECT count(*) FROM deck_houses WHERE deck_id = $1")
        .bind(&deck_id)
        .fetch_one(&mut conn)
        .await
        .unwrap();
    assert_eq!(houses, 1);

    sqlx::query("DELETE FROM deck_cards WHERE deck_id = $1")
        .bind(&deck_id)
        .execute(&mut conn)
        .await
        .unwrap();
    sqlx::query("DELETE FROM deck_houses WHERE deck_id = $1")
        .bind(&deck_id)
        .execute(&mut conn)
        .await
        .unwrap();
    sqlx::query("DELETE FROM decks WHERE id = $1")
        .bind(&deck_id)
        .execute(&mut conn)
        .await
        .unwrap();
    sqlx::query("DELETE FROM houses WHERE id = $1")
        .bind(format!("test-house-{tag}"))
        .execute(&mut conn)
        .await
        .unwrap();
}

#[tokio::test]
#[ignore = "needs a Postgres database"]
async fn rolled_back_page_leaves_no_rows_but_keeps_audit() {
    let store = store().await;
    let tag = Uuid::new_v4().simple().to_string();
    let url = format!("https://audit.test/decks/?page=3&tag={tag}");
    store
        .append(&AuditEntry::response(url.clone(), chrono::Utc::now(), 200))
        .await
        .unwrap();

    store.begin_page().await.unwrap();
    ingest(&store, &batch(&tag)).await;
    store.rollback_page().await.unwrap();

    let mut conn = store.into_inner();
    let decks: i64 = sqlx::query_scalar("SELECT count(*) FROM decks WHERE id = $1")
        .bind(format!("test-deck-{tag}"))
        .fetch_one(&mut conn)
        .await
        .unwrap();
    assert_eq!(decks, 0);
    let pairs: i64 = sqlx::query_scalar("SELECT count(*) FROM deck_cards WHERE deck_id = $1")
        .bind(format!("test-deck-{tag}"))
        .fetch_one(&mut conn)
        .await
        .unwrap();
    assert_eq!(pairs, 0);
    let audited: i64 = sqlx::query_scalar("SELECT count(*) FROM api_call_log WHERE url = $1")
        .bind(&url)
        .fetch_one(&mut conn)
        .await
        .unwrap();
    assert_eq!(audited, 1);
    sqlx::query("DELETE FROM api_call_log WHERE url = $1")
        .bind(&url)
        .execute(&mut conn)
        .await
        .unwrap();
}

#[tokio::test]
#[ignore = "needs a Postgres database"]
async fn audit_rows_land_in_api_call_log() {
    let store = store().await;
    let url = format!("https://audit.test/decks/?page=1&tag={}", Uuid::new_v4());
    store
        .append(&AuditEntry::response(url.clone(), chrono::Utc::now(), 503))
        .await
        .unwrap();

    let mut conn = store.into_inner();
    let code: Option<i32> =
        sqlx::query_scalar("SELECT response_code FROM api_call_log WHERE url = $1")
            .bind(&url)
            .fetch_one(&mut conn)
            .await
            .unwrap();
    assert_eq!(code, Some(503));
    sqlx::query("DELETE FROM api_call_log WHERE url = $1")
        .bind(&url)
        .execute(&mut conn)
        .await
        .unwrap();
}
