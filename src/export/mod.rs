//! Export of aggregated flashcards.

pub mod deck;

pub use deck::{page_tag, write_deck, DeckRow, DECK_HEADER};
