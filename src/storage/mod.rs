//! SQLite-backed registry, subscriber directory and subscription index.
//!
//! All operations are methods on [`Database`], grouped by concern:
//!
//! - `sources`: source registration, listing, pattern replacement, removal
//! - `subscribers`: access key lookup and subscriber creation
//! - `subscriptions`: the subscriber/source association
//! - `retention`: age-based source eviction

mod retention;
mod schema;
mod sources;
mod subscribers;
mod subscriptions;
mod types;

pub use schema::Database;
pub use types::{DatabaseError, Source, Subscriber, SweepReport, ValidationError};
