//! Prose chunking for speak actions.
//!
//! TTS front-ends cap how much text one speak action may carry, so agent
//! prose is split into chunks of at most the configured character limit.
//! Sentence mode prefers sentence boundaries and falls back to words, then
//! to hard cuts, so a chunk never exceeds the limit; fixed mode cuts at the
//! limit directly. Chunks are counted in characters, never split inside a
//! UTF-8 character.

use serde::{Deserialize, Serialize};

/// How prose is split into speak actions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChunkMode {
    /// Pack whole sentences up to the limit
    #[default]
    Sentence,
    /// Cut at the limit regardless of content
    Fixed,
}

/// Split `text` into chunks of at most `limit` characters.
pub fn chunk_text(text: &str, limit: usize, mode: ChunkMode) -> Vec<String> {
    let text = text.trim();
    if text.is_empty() {
        return Vec::new();
    }
    let limit = limit.max(1);
    if text.chars().count() <= limit {
        return vec![text.to_string()];
    }

    match mode {
        ChunkMode::Fixed => hard_chunks(text, limit),
        ChunkMode::Sentence => {
            let mut units = Vec::new();
            for sentence in split_sentences(text) {
                if sentence.chars().count() <= limit {
                    units.push(sentence);
                } else {
                    units.extend(word_units(&sentence, limit));
                }
            }
            pack(units, limit)
        }
    }
}

/// Cut into pieces of exactly `limit` characters (except the last).
fn hard_chunks(text: &str, limit: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut count = 0;

    for ch in text.chars() {
        if count == limit {
            out.push(std::mem::take(&mut current));
            count = 0;
        }
        current.push(ch);
        count += 1;
    }
    if !current.is_empty() {
        out.push(current);
    }

    out.into_iter()
        .map(|chunk| chunk.trim().to_string())
        .filter(|chunk| !chunk.is_empty())
        .collect()
}

/// Split on sentence terminators followed by whitespace, and on newlines.
fn split_sentences(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();

    while let Some(ch) = chars.next() {
        current.push(ch);
        let boundary = match ch {
            '\n' => true,
            '.' | '!' | '?' => chars.peek().map_or(true, |next| next.is_whitespace()),
            _ => false,
        };
        if boundary {
            let sentence = current.trim();
            if !sentence.is_empty() {
                out.push(sentence.to_string());
            }
            current.clear();
        }
    }

    let sentence = current.trim();
    if !sentence.is_empty() {
        out.push(sentence.to_string());
    }
    out
}

/// Break an oversize sentence into word-packed units of at most `limit`
/// characters; words longer than the limit are hard-cut.
fn word_units(sentence: &str, limit: usize) -> Vec<String> {
    let mut pieces = Vec::new();
    for word in sentence.split_whitespace() {
        if word.chars().count() > limit {
            pieces.extend(hard_chunks(word, limit));
        } else {
            pieces.push(word.to_string());
        }
    }
    pack(pieces, limit)
}

/// Greedily join units with single spaces without exceeding `limit`.
fn pack(units: Vec<String>, limit: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();

    for unit in units {
        let unit_len = unit.chars().count();
        let current_len = current.chars().count();
        if current_len > 0 && current_len + 1 + unit_len > limit {
            out.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(&unit);
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}
