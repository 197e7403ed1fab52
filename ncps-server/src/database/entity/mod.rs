//! Database entities.
//!
//! We use SeaORM and target SQLite (development, default), PostgreSQL, and
//! MySQL (production).

pub mod chunk;
pub mod config;
pub mod dlock;
pub mod narfile;
pub mod narfile_chunk;
pub mod narinfo;
pub mod narinfo_reference;
pub mod narinfo_signature;
