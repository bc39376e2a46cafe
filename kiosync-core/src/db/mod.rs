//! Database layer for kiosync
//!
//! This module provides the embedded store using SQLite with:
//! - Versioned migrations tracked in a ledger table
//! - Repository pattern for typed CRUD
//! - Explicit transactions for multi-statement operations

pub mod repo;
pub mod schema;

pub use repo::Database;
