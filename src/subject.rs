//! Subject extraction from rendered email content.

use std::sync::LazyLock;

use regex::Regex;

static TITLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title\s*>").expect("valid regex"));

static INVISIBLE_BLOCKS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<head[^>]*>.*?</head\s*>|<script[^>]*>.*?</script\s*>|<style[^>]*>.*?</style\s*>")
        .expect("valid regex")
});

static TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<[^>]*>").expect("valid regex"));

/// Derive a subject line from HTML (or plain text) content.
///
/// Uses the `<title>` element when present. Otherwise takes the first
/// non-blank line of the markup-free text; lines longer than `max_len`
/// characters are cut to `max_len` and suffixed with `...`.
pub fn extract_subject(content: &str, max_len: usize) -> String {
    if let Some(title) = TITLE
        .captures(content)
        .and_then(|c| c.get(1))
        .map(|m| collapse_whitespace(&decode_entities(m.as_str())))
        .filter(|t| !t.is_empty())
    {
        return title;
    }

    let visible = INVISIBLE_BLOCKS.replace_all(content, "");
    let text = decode_entities(&TAG.replace_all(&visible, ""));
    let first_line = text
        .lines()
        .map(collapse_whitespace)
        .find(|line| !line.is_empty())
        .unwrap_or_default();

    truncate_chars(&first_line, max_len)
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn truncate_chars(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        return s.to_string();
    }
    let mut cut: String = s.chars().take(max_len).collect();
    cut.push_str("...");
    cut
}

fn decode_entities(s: &str) -> String {
    s.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}
