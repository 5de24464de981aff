//! Data layer: models and SQLite persistence

pub mod database;
pub mod models;

pub use database::{ActorRecord, Database, NewAttachment, Page, PageCursor};
