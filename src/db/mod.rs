//! Database module for SQLite operations.
//!
//! This module provides:
//! - Database initialization and migrations
//! - SQLite pragma configuration
//! - Repository layer for the event log, entries, aggregates and journals

pub mod migrations;
pub mod repo;

pub use migrations::init_db;
pub use repo::{EntryFilter, Page, Repository, SeenIndex, StoredEvent};
