//! Announcement rendering.
//!
//! Pure string work: an [`Entry`] plus an optional pre-computed summary in,
//! IRC-ready lines out. The summarizer call itself happens in the scheduler
//! so this module stays synchronous and deterministic.
use crate::feed::Entry;

/// Byte cap for a single announcement line. IRC messages are limited to 512
/// bytes including the `PRIVMSG #channel :` framing and trailing CRLF, so
/// the payload budget is kept well under that.
pub const MAX_LINE_BYTES: usize = 400;

const TRUNCATION_MARKER: char = '…';

/// Render one entry into announcement lines.
///
/// The first line is a feed-tagged headline; any summary follows, one line
/// per non-blank summary line. Every line is capped at [`MAX_LINE_BYTES`].
pub fn format_entry(feed_id: &str, entry: &Entry, summary: Option<&str>) -> Vec<String> {
    let headline = if entry.link.is_empty() {
        format!("[{}] {}", feed_id, entry.title)
    } else {
        format!("[{}] {} - {}", feed_id, entry.title, entry.link)
    };

    let mut lines = vec![truncate_line(&headline)];

    if let Some(summary) = summary {
        for line in summary.lines() {
            let line = line.trim();
            if !line.is_empty() {
                lines.push(truncate_line(line));
            }
        }
    }

    lines
}

/// Deterministic stand-in for a remote summary: the entry body with all
/// whitespace runs collapsed to single spaces. Returns `None` when the body
/// has no visible text, in which case the announcement is headline-only.
pub fn fallback_summary(body_text: &str) -> Option<String> {
    let collapsed = body_text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

/// Cap `line` at [`MAX_LINE_BYTES`], cutting only at a char boundary and
/// marking the cut with `…`.
fn truncate_line(line: &str) -> String {
    if line.len() <= MAX_LINE_BYTES {
        return line.to_string();
    }

    let mut end = MAX_LINE_BYTES - TRUNCATION_MARKER.len_utf8();
    while end > 0 && !line.is_char_boundary(end) {
        end -= 1;
    }

    let mut truncated = line[..end].to_string();
    truncated.push(TRUNCATION_MARKER);
    truncated
}

// ============================================================================
// Tests
// ============================================================================
