// src/ingest/mod.rs
pub mod fetcher;
pub mod normalize;
pub mod providers;
pub mod types;

pub use fetcher::{fetch_updates, FetchOptions, FetchedBatch};
pub use normalize::{normalize, MediaRef, PostDraft};

use once_cell::sync::OnceCell;
use regex::Regex;

/// Stateless text pass applied to post text before storage.
///
/// Content is kept verbatim apart from invisible and control characters; ZWJ
/// stays so emoji sequences are not split.
pub fn normalize_text(s: &str) -> String {
    // 1) Line endings
    let out = s.replace("\r\n", "\n").replace('\r', "\n");

    // 2) Control characters other than newline and tab
    let out: String = out
        .chars()
        .filter(|c| !c.is_control() || matches!(c, '\n' | '\t'))
        .collect();

    // 3) Zero-width space/non-joiner, word joiner, BOM, text presentation selector
    static RE_INVISIBLE: OnceCell<Regex> = OnceCell::new();
    let re_invisible = RE_INVISIBLE
        .get_or_init(|| Regex::new("[\u{200B}\u{200C}\u{2060}\u{FEFF}\u{FE0E}]").unwrap());
    let out = re_invisible.replace_all(&out, "");

    // 4) Trailing whitespace per line
    static RE_TRAILING: OnceCell<Regex> = OnceCell::new();
    let re_trailing = RE_TRAILING.get_or_init(|| Regex::new(r"(?m)[ \t]+$").unwrap());
    let out = re_trailing.replace_all(&out, "");

    // 5) At most one blank line in a row
    static RE_BLANK: OnceCell<Regex> = OnceCell::new();
    let re_blank = RE_BLANK.get_or_init(|| Regex::new(r"\n{3,}").unwrap());
    let out = re_blank.replace_all(&out, "\n\n");

    out.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_text_keeps_emoji_sequences() {
        // family emoji joined by ZWJ must survive
        let s = "Hi \u{1F468}\u{200D}\u{1F469}\u{200D}\u{1F467}!";
        assert_eq!(normalize_text(s), s);
    }

    #[test]
    fn normalize_text_strips_invisibles_and_controls() {
        let s = "\u{FEFF}Hello\u{200B} wo\u{0007}rld\u{2764}\u{FE0E}";
        assert_eq!(normalize_text(s), "Hello world\u{2764}");
    }

    #[test]
    fn normalize_text_folds_line_endings_and_blank_runs() {
        let s = "line one   \r\n\r\n\r\n\r\nline two\t\r\n";
        assert_eq!(normalize_text(s), "line one\n\nline two");
    }
}
