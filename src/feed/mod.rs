//! Feed handling for the aggregation pipeline.
//!
//! - **Fetching**: HTTP retrieval with bounded retries and a per-source timeout
//! - **Parsing**: RSS/Atom/JSON Feed documents into transient [`Entry`] values
//! - **Filtering**: per-source title patterns ([`PatternSet`])
//! - **Merging**: newest-first combination of every source's entries
//! - **Rendering**: the merged result as an Atom document
//!
//! # Example
//!
//! ```ignore
//! use crate::feed::{merge, Fetcher, PatternSet};
//!
//! let entries = fetcher.fetch(&source).await;
//! let kept = PatternSet::compile(&source.patterns)?.apply(entries);
//! let feed = merge(vec![kept]);
//! ```

mod fetcher;
mod filter;
mod merge;
mod parser;
mod render;

pub use fetcher::{FetchError, Fetcher};
pub use filter::{PatternError, PatternSet};
pub use merge::merge;
pub use parser::{parse_feed, Entry};
pub use render::{render_atom, AtomFeed};
