//! Text helpers for embedding inputs and result titles

use std::borrow::Cow;
use regex::Regex;
use lazy_static::lazy_static;

lazy_static! {
    static ref WHITESPACE_REGEX: Regex = Regex::new(r"\s+").expect("static whitespace pattern");
}

pub struct TextUtils;

impl TextUtils {
    /// Collapse runs of whitespace into single spaces and trim the ends.
    pub fn normalize_whitespace(text: &str) -> Cow<'_, str> {
        let trimmed = text.trim();
        if WHITESPACE_REGEX.find_iter(trimmed).any(|m| m.as_str() != " ") {
            Cow::Owned(WHITESPACE_REGEX.replace_all(trimmed, " ").into_owned())
        } else {
            Cow::Borrowed(trimmed)
        }
    }

    /// Truncate to at most `max_chars` characters, ending with "..." when cut.
    pub fn truncate_with_ellipsis(text: &str, max_chars: usize) -> Cow<'_, str> {
        if text.chars().count() <= max_chars {
            return Cow::Borrowed(text);
        }
        if max_chars <= 3 {
            return Cow::Borrowed("...");
        }
        let mut result: String = text.chars().take(max_chars - 3).collect();
        result.push_str("...");
        Cow::Owned(result)
    }

    /// Join the non-blank parts with single spaces, normalizing each.
    pub fn join_nonempty<'a, I>(parts: I) -> String
    where
        I: IntoIterator<Item = Option<&'a str>>,
    {
        parts
            .into_iter()
            .flatten()
            .map(Self::normalize_whitespace)
            .filter(|p| !p.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// First line of `text`, shortened for display.
    pub fn headline(text: &str, max_chars: usize) -> String {
        let first_line = text.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
        Self::truncate_with_ellipsis(first_line.trim(), max_chars).into_owned()
    }
}
