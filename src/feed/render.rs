//! Atom 1.0 serialization of a merged feed.

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use sha2::{Digest, Sha256};
use std::io::Cursor;

use super::Entry;

const ATOM_NS: &str = "http://www.w3.org/2005/Atom";

/// Everything needed to serialize one merged feed.
pub struct AtomFeed<'a> {
    pub title: &'a str,
    pub subtitle: &'a str,
    /// Absolute URL of the feed itself, used as both `<id>` and `rel="self"`
    pub self_link: &'a str,
    pub entries: &'a [Entry],
    /// Fallback `<updated>` for the feed and for undated entries
    pub generated_at: DateTime<Utc>,
}

/// Render the feed as an Atom document.
///
/// Entries are written in the order given. Text is escaped by the writer,
/// so titles and summaries from sources cannot inject markup.
pub fn render_atom(feed: &AtomFeed<'_>) -> Result<String> {
    let mut writer = Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2);

    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .context("Failed to write XML declaration")?;

    let mut root = BytesStart::new("feed");
    root.push_attribute(("xmlns", ATOM_NS));
    writer
        .write_event(Event::Start(root))
        .context("Failed to write feed element")?;

    let updated = feed
        .entries
        .iter()
        .filter_map(|e| e.published)
        .max()
        .unwrap_or(feed.generated_at);

    write_text_element(&mut writer, "title", feed.title)?;
    write_text_element(&mut writer, "subtitle", feed.subtitle)?;
    write_text_element(&mut writer, "id", feed.self_link)?;
    write_link(&mut writer, Some("self"), feed.self_link)?;
    write_text_element(&mut writer, "updated", &rfc3339(updated))?;
    write_text_element(&mut writer, "generator", "feedsieve")?;

    for entry in feed.entries {
        writer
            .write_event(Event::Start(BytesStart::new("entry")))
            .context("Failed to write entry element")?;

        let title = if entry.title.is_empty() {
            UNTITLED
        } else {
            entry.title.as_str()
        };
        write_text_element(&mut writer, "title", title)?;
        if let Some(link) = &entry.link {
            write_link(&mut writer, None, link)?;
        }
        write_text_element(&mut writer, "id", &entry_id(entry))?;
        write_text_element(
            &mut writer,
            "updated",
            &rfc3339(entry.published.unwrap_or(feed.generated_at)),
        )?;
        if let Some(published) = entry.published {
            write_text_element(&mut writer, "published", &rfc3339(published))?;
        }
        if let Some(summary) = &entry.summary {
            write_text_element(&mut writer, "summary", summary)?;
        }

        writer
            .write_event(Event::End(BytesEnd::new("entry")))
            .context("Failed to write entry end")?;
    }

    writer
        .write_event(Event::End(BytesEnd::new("feed")))
        .context("Failed to write feed end")?;

    let result = writer.into_inner().into_inner();
    String::from_utf8(result).context("Generated feed contains invalid UTF-8")
}

/// Shown for items without a title. Never seen by the title filters.
const UNTITLED: &str = "Untitled";

fn write_text_element(writer: &mut Writer<Cursor<Vec<u8>>>, name: &str, text: &str) -> Result<()> {
    writer
        .write_event(Event::Start(BytesStart::new(name)))
        .with_context(|| format!("Failed to write {name} element"))?;
    writer
        .write_event(Event::Text(BytesText::new(text)))
        .with_context(|| format!("Failed to write {name} text"))?;
    writer
        .write_event(Event::End(BytesEnd::new(name)))
        .with_context(|| format!("Failed to write {name} end"))?;
    Ok(())
}

fn write_link(writer: &mut Writer<Cursor<Vec<u8>>>, rel: Option<&str>, href: &str) -> Result<()> {
    let mut link = BytesStart::new("link");
    if let Some(rel) = rel {
        link.push_attribute(("rel", rel));
    }
    link.push_attribute(("href", href));
    writer
        .write_event(Event::Empty(link))
        .context("Failed to write link element")?;
    Ok(())
}

fn rfc3339(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Atom id scoped to the source, so the same guid from two sources stays two
/// entries. Permalink guids are hashed like any other.
fn entry_id(entry: &Entry) -> String {
    let hash = Sha256::digest(format!("{}|{}", entry.source_id, entry.guid).as_bytes());
    format!("urn:sha256:{:x}", hash)
}
