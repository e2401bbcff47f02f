use anyhow::Result;
use chrono::{DateTime, Utc};
use feed_rs::parser;
use sha2::{Digest, Sha256};

/// One syndication item fetched for a single aggregation request.
///
/// Entries are never persisted and carry no identity across requests.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    /// Registry id of the source this entry was fetched from
    pub source_id: i64,
    pub guid: String,
    /// Empty when the item had no title
    pub title: String,
    pub link: Option<String>,
    /// `None` when the feed gave no parseable date
    pub published: Option<DateTime<Utc>>,
    pub summary: Option<String>,
}

/// Parse RSS/Atom/JSON Feed bytes into entries attributed to `source_id`.
pub fn parse_feed(bytes: &[u8], source_id: i64) -> Result<Vec<Entry>> {
    let feed = parser::parse(bytes)?;

    let entries: Vec<Entry> = feed
        .entries
        .into_iter()
        .map(|entry| {
            let link = entry.links.first().map(|l| l.href.clone());
            let published = entry.published.or(entry.updated);
            let summary = entry
                .summary
                .map(|s| s.content)
                .or_else(|| entry.content.and_then(|c| c.body));
            let title = entry.title.map(|t| t.content).unwrap_or_default();

            let existing_id = if entry.id.is_empty() {
                None
            } else {
                Some(entry.id.as_str())
            };
            let guid = generate_guid(existing_id, link.as_deref(), &title, published);

            Entry {
                source_id,
                guid,
                title,
                link,
                published,
                summary,
            }
        })
        .collect();

    Ok(entries)
}

fn generate_guid(
    existing: Option<&str>,
    link: Option<&str>,
    title: &str,
    published: Option<DateTime<Utc>>,
) -> String {
    if let Some(guid) = existing {
        let trimmed = guid.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }

    let input = format!(
        "{}|{}|{}",
        link.unwrap_or(""),
        title,
        published.map(|p| p.timestamp().to_string()).unwrap_or_default()
    );
    let hash = Sha256::digest(input.as_bytes());
    format!("{:x}", hash)
}
