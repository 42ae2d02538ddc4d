use chrono::{DateTime, Utc};
use feed_rs::parser;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Errors that can occur while parsing a feed document.
#[derive(Debug, Error)]
pub enum ParseError {
    /// Document could not be parsed as RSS or Atom
    #[error("Malformed feed document: {0}")]
    Malformed(String),
}

/// A normalized feed entry.
///
/// Produced fresh on every parse. Identity is carried entirely by `id`;
/// two entries with the same id are the same entry no matter what the rest
/// of their fields say.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Stable identifier: the feed's own id, or a hash fallback when absent.
    pub id: String,
    pub title: String,
    /// First link in the entry, empty when the feed provides none.
    pub link: String,
    /// Publication time, falling back to the update time. `None` when the
    /// feed carries neither.
    pub published: Option<DateTime<Utc>>,
    /// Entry content flattened from HTML to plain text. Empty when absent.
    pub body_text: String,
}

/// Parse a feed document into entries, preserving document order.
///
/// RSS and Atom both normalize through the `feed-rs` document model.
/// Missing per-entry fields (link, body, published) degrade to empty values;
/// only an unparseable document is an error.
pub fn parse_entries(bytes: &[u8]) -> Result<Vec<Entry>, ParseError> {
    let feed = parser::parse(bytes).map_err(|e| ParseError::Malformed(e.to_string()))?;

    let entries: Vec<Entry> = feed
        .entries
        .into_iter()
        .map(|entry| {
            let link = entry
                .links
                .first()
                .map(|l| l.href.clone())
                .unwrap_or_default();
            let published = entry.published.or(entry.updated);
            let title = entry
                .title
                .map(|t| t.content)
                .unwrap_or_else(|| "Untitled".to_string());

            // Try content first, then fall back to summary.
            let body_html = entry
                .content
                .and_then(|c| c.body)
                .or_else(|| entry.summary.map(|s| s.content));
            let body_text = body_html
                .and_then(|html| html2text::from_read(html.as_bytes(), 80).ok())
                .map(|text| text.trim().to_string())
                .unwrap_or_default();

            let existing_id = if entry.id.trim().is_empty() {
                None
            } else {
                Some(entry.id.as_str())
            };
            let id = entry_id(existing_id, &link, &title);

            Entry {
                id,
                title,
                link,
                published,
                body_text,
            }
        })
        .collect();

    Ok(entries)
}

/// Entry identity: the feed's own id when present, otherwise a sha256 of
/// link and title.
///
/// The fallback hashes only fields that repeat identically across parses,
/// so an unchanged entry keeps its id across polls and restarts. The
/// newline separator keeps ("ab", "c") and ("a", "bc") distinct.
fn entry_id(existing: Option<&str>, link: &str, title: &str) -> String {
    if let Some(id) = existing {
        return id.trim().to_string();
    }

    let mut hasher = Sha256::new();
    hasher.update(link.as_bytes());
    hasher.update(b"\n");
    hasher.update(title.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const RSS_TWO_ITEMS: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel>
    <title>Example</title>
    <item>
        <guid>item-1</guid>
        <title>First post</title>
        <link>https://example.org/1</link>
        <pubDate>Mon, 06 Jan 2025 12:00:00 GMT</pubDate>
        <description>&lt;p&gt;Hello &lt;b&gt;world&lt;/b&gt;&lt;/p&gt;</description>
    </item>
    <item>
        <guid>item-2</guid>
        <title>Second post</title>
        <link>https://example.org/2</link>
    </item>
</channel></rss>"#;

    const ATOM_ONE_ENTRY: &str = r#"<?xml version="1.0"?>
<feed xmlns="http://www.w3.org/2005/Atom">
    <title>Example</title>
    <id>urn:example</id>
    <updated>2025-01-06T12:00:00Z</updated>
    <entry>
        <id>atom-entry-1</id>
        <title>Atom post</title>
        <link href="https://example.org/atom/1"/>
        <updated>2025-01-06T12:00:00Z</updated>
        <summary>A summary</summary>
    </entry>
</feed>"#;

    #[test]
    fn test_rss_parse_preserves_document_order() {
        let entries = parse_entries(RSS_TWO_ITEMS.as_bytes()).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].id, "item-1");
        assert_eq!(entries[0].title, "First post");
        assert_eq!(entries[0].link, "https://example.org/1");
        assert_eq!(entries[1].id, "item-2");
    }

    #[test]
    fn test_html_body_is_flattened_to_text() {
        let entries = parse_entries(RSS_TWO_ITEMS.as_bytes()).unwrap();
        assert!(entries[0].body_text.contains("Hello"));
        assert!(entries[0].body_text.contains("world"));
        assert!(!entries[0].body_text.contains("<p>"));
        assert!(!entries[0].body_text.contains("<b>"));
    }

    #[test]
    fn test_missing_optionals_degrade_to_empty() {
        let entries = parse_entries(RSS_TWO_ITEMS.as_bytes()).unwrap();
        let second = &entries[1];
        assert!(second.published.is_none());
        assert!(second.body_text.is_empty());
    }

    #[test]
    fn test_published_parsed_as_utc() {
        let entries = parse_entries(RSS_TWO_ITEMS.as_bytes()).unwrap();
        let published = entries[0].published.unwrap();
        assert_eq!(published.to_rfc3339(), "2025-01-06T12:00:00+00:00");
    }

    #[test]
    fn test_atom_updated_stands_in_for_published() {
        let entries = parse_entries(ATOM_ONE_ENTRY.as_bytes()).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, "atom-entry-1");
        assert!(entries[0].published.is_some());
        assert_eq!(entries[0].body_text, "A summary");
    }

    #[test]
    fn test_malformed_document_is_error() {
        let result = parse_entries(b"<not a feed");
        assert!(matches!(result, Err(ParseError::Malformed(_))));
    }

    #[test]
    fn test_missing_guid_still_yields_stable_id() {
        let rss = r#"<?xml version="1.0"?>
<rss version="2.0"><channel>
    <item><title>No guid here</title><link>https://example.org/x</link></item>
</channel></rss>"#;
        let entries = parse_entries(rss.as_bytes()).unwrap();
        assert_eq!(entries.len(), 1);
        assert!(!entries[0].id.is_empty());

        // Same document parses to the same id
        let again = parse_entries(rss.as_bytes()).unwrap();
        assert_eq!(entries[0].id, again[0].id);
    }

    #[test]
    fn test_blank_guid_treated_as_missing() {
        assert_eq!(entry_id(Some("  real-id  "), "l", "t"), "real-id");
        let fallback = entry_id(None, "l", "t");
        assert_eq!(entry_id(None, "l", "t"), fallback);
    }

    #[test]
    fn test_hash_separator_prevents_field_bleed() {
        assert_ne!(entry_id(None, "ab", "c"), entry_id(None, "a", "bc"));
    }

    proptest! {
        #[test]
        fn prop_fallback_id_is_deterministic(link in ".*", title in ".*") {
            let a = entry_id(None, &link, &title);
            let b = entry_id(None, &link, &title);
            prop_assert_eq!(&a, &b);
            prop_assert_eq!(a.len(), 64);
        }
    }
}
