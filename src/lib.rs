//! feedsieve: per-subscriber merged RSS/Atom feeds with per-source title
//! filters.

pub mod api;
pub mod config;
pub mod feed;
pub mod retention;
pub mod service;
pub mod storage;
pub mod util;
