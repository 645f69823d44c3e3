//! Markdown preparation for speech.
//!
//! Pipe tables read terribly over TTS, and the voice link cannot transport
//! media. Tables are rewritten per the configured mode, and media URLs a
//! reply references are surfaced as bracketed notices.

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// What to do with pipe tables in agent prose
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TableMode {
    /// Leave tables untouched
    Keep,
    /// Rewrite each data row as a "header: value" bullet line
    #[default]
    Bullets,
    /// Drop table lines entirely
    Strip,
}

/// Rewrite pipe tables in `text` per `mode`.
pub fn sanitize_tables(text: &str, mode: TableMode) -> String {
    if mode == TableMode::Keep || !text.contains('|') {
        return text.to_string();
    }

    let lines: Vec<&str> = text.lines().collect();
    let mut out: Vec<String> = Vec::with_capacity(lines.len());
    let mut i = 0;

    while i < lines.len() {
        if is_table_row(lines[i]) && i + 1 < lines.len() && is_separator_row(lines[i + 1]) {
            let header = split_row(lines[i]);
            let mut j = i + 2;
            while j < lines.len() && is_table_row(lines[j]) {
                if mode == TableMode::Bullets {
                    let row = split_row(lines[j]);
                    let cells: Vec<String> = row
                        .iter()
                        .enumerate()
                        .map(|(idx, cell)| match header.get(idx) {
                            Some(h) if !h.is_empty() => format!("{}: {}", h, cell),
                            _ => cell.clone(),
                        })
                        .collect();
                    out.push(format!("- {}", cells.join(", ")));
                }
                j += 1;
            }
            i = j;
        } else {
            out.push(lines[i].to_string());
            i += 1;
        }
    }

    out.join("\n")
}

fn is_table_row(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.len() > 1 && trimmed.starts_with('|')
}

fn is_separator_row(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.starts_with('|')
        && trimmed.contains('-')
        && trimmed.chars().all(|c| matches!(c, '|' | '-' | ':' | ' '))
}

fn split_row(line: &str) -> Vec<String> {
    line.trim()
        .trim_matches('|')
        .split('|')
        .map(|cell| cell.trim().to_string())
        .collect()
}

/// Append a `[media: <url>]` notice for every media URL the text references.
pub fn append_media_notices(text: &str) -> String {
    let urls = media_urls(text);
    if urls.is_empty() {
        return text.to_string();
    }

    let mut out = text.trim_end().to_string();
    for url in urls {
        out.push_str("\n[media: ");
        out.push_str(&url);
        out.push(']');
    }
    out
}

fn media_urls(text: &str) -> Vec<String> {
    static URL_RE: OnceLock<Regex> = OnceLock::new();
    let re = URL_RE.get_or_init(|| Regex::new(r"https?://[^\s)\]>]+").unwrap());

    let mut seen = HashSet::new();
    re.find_iter(text)
        .map(|m| m.as_str().trim_end_matches(['.', ',', ';']).to_string())
        .filter(|url| is_media_url(url))
        .filter(|url| seen.insert(url.clone()))
        .collect()
}

fn is_media_url(url: &str) -> bool {
    const MEDIA_EXTENSIONS: [&str; 12] = [
        ".png", ".jpg", ".jpeg", ".gif", ".webp", ".svg", ".mp3", ".wav", ".ogg", ".m4a", ".mp4",
        ".webm",
    ];
    let lower = url.to_ascii_lowercase();
    let path = lower.split(['?', '#']).next().unwrap_or_default();
    MEDIA_EXTENSIONS.iter().any(|ext| path.ends_with(ext))
}
