pub mod deck_page;
