use regex::Regex;
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Maximum length, in characters, of a filename derived from a theme title.
const MAX_FILENAME_CHARS: usize = 100;

fn think_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<think>.*?</think>").expect("valid think regex"))
}

fn leftover_marker_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"_[A-Z_]+_").expect("valid marker regex"))
}

fn filename_reject_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^\w-]").expect("valid filename regex"))
}

fn blank_run_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\n{3,}").expect("valid newline regex"))
}

/// Removes every `<think>...</think>` block a reasoning model left in its reply.
/// The result is not trimmed.
pub fn strip_think_tags(text: &str) -> String {
    think_regex().replace_all(text, "").into_owned()
}

/// Turns wiki40b marker text into plain paragraphs.
///
/// Paragraph and section markers become blank lines, the article marker is
/// dropped, and any marker left over afterwards is removed. Runs of three or
/// more newlines collapse into one blank line.
pub fn clean_wiki_markup(marked: &str) -> String {
    let text = marked
        .replace("_NEWLINE_", "\n")
        .replace("_START_PARAGRAPH_", "\n\n")
        .replace("_START_SECTION_", "\n\n")
        .replace("_START_ARTICLE_", "");
    let text = leftover_marker_regex().replace_all(&text, "");
    let text = text.trim();
    blank_run_regex().replace_all(text, "\n\n").into_owned()
}

#[derive(Debug, Error, PartialEq)]
pub enum LiteralError {
    #[error("text is not a bytes literal")]
    NotALiteral,
    #[error("unterminated bytes literal")]
    Unterminated,
    #[error("invalid \\x escape at byte {0}")]
    BadHexEscape(usize),
    #[error("decoded bytes are not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Decodes a Python bytes literal such as `b'\xd0\x9f...'` and interprets the
/// bytes as UTF-8. wiki40b exports store article text this way.
pub fn decode_bytes_literal(literal: &str) -> Result<String, LiteralError> {
    let literal = literal.trim();
    let body = literal
        .strip_prefix('b')
        .or_else(|| literal.strip_prefix('B'))
        .ok_or(LiteralError::NotALiteral)?;
    let quote = match body.chars().next() {
        Some(q @ ('\'' | '"')) => q,
        _ => return Err(LiteralError::NotALiteral),
    };
    let inner = body[1..]
        .strip_suffix(quote)
        .ok_or(LiteralError::Unterminated)?;

    let raw = inner.as_bytes();
    let mut out = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        let b = raw[i];
        if b != b'\\' {
            out.push(b);
            i += 1;
            continue;
        }
        let Some(&esc) = raw.get(i + 1) else {
            return Err(LiteralError::Unterminated);
        };
        i += 2;
        match esc {
            b'\\' => out.push(b'\\'),
            b'\'' => out.push(b'\''),
            b'"' => out.push(b'"'),
            b'n' => out.push(b'\n'),
            b'r' => out.push(b'\r'),
            b't' => out.push(b'\t'),
            b'a' => out.push(0x07),
            b'b' => out.push(0x08),
            b'f' => out.push(0x0c),
            b'v' => out.push(0x0b),
            b'\n' => {}
            b'x' => {
                let hex = raw
                    .get(i..i + 2)
                    .and_then(|h| std::str::from_utf8(h).ok())
                    .and_then(|h| u8::from_str_radix(h, 16).ok())
                    .ok_or(LiteralError::BadHexEscape(i - 2))?;
                out.push(hex);
                i += 2;
            }
            b'0'..=b'7' => {
                let mut value = (esc - b'0') as u32;
                let mut digits = 1;
                while digits < 3 {
                    match raw.get(i).copied() {
                        Some(d @ b'0'..=b'7') => {
                            value = value * 8 + (d - b'0') as u32;
                            i += 1;
                            digits += 1;
                        }
                        _ => break,
                    }
                }
                out.push((value & 0xff) as u8);
            }
            // unknown escapes are kept verbatim
            other => {
                out.push(b'\\');
                out.push(other);
            }
        }
    }

    Ok(String::from_utf8(out)?)
}

/// Returns the article text stored in a wiki40b record, decoding bytes
/// literals when the export kept them.
pub fn decode_article_text(stored: &str) -> Result<String, LiteralError> {
    let trimmed = stored.trim_start();
    if trimmed.starts_with("b'") || trimmed.starts_with("b\"") {
        decode_bytes_literal(trimmed)
    } else {
        Ok(stored.to_string())
    }
}

/// Finds the outermost JSON-looking span in a model reply: from the first `[`
/// or `{` to the last `]` or `}`.
pub fn extract_json_span(text: &str) -> Option<&str> {
    let start = text.find(&['[', '{'][..])?;
    let end = text.rfind(&[']', '}'][..])?;
    if start < end {
        Some(text[start..=end].trim())
    } else {
        None
    }
}

/// Makes a theme title usable as a file name. Word characters, `_` and `-`
/// survive; spaces become underscores.
pub fn sanitize_filename(title: &str, extension: &str) -> String {
    let replaced = title.replace(' ', "_");
    let kept = filename_reject_regex().replace_all(&replaced, "");
    let mut name = kept.trim_matches(|c| c == '_' || c == '-').to_string();
    if name.chars().count() > MAX_FILENAME_CHARS {
        name = take_chars(&name, MAX_FILENAME_CHARS)
            .trim_end_matches(|c| c == '_' || c == '-')
            .to_string();
    }
    if name.is_empty() {
        name = format!("untitled_theme_{}", unix_timestamp());
    }
    name + extension
}

/// First line of an article, which in cleaned wiki40b text is its title.
pub fn title_of(text: &str) -> String {
    text.split('\n').next().unwrap_or("").trim().to_string()
}

/// The first `max_chars` characters after the title line. Empty when the text
/// has no second line.
pub fn beginning_of_text(text: &str, max_chars: usize) -> String {
    match text.find('\n') {
        Some(pos) => take_chars(text[pos + 1..].trim(), max_chars).to_string(),
        None => String::new(),
    }
}

/// Length in Unicode scalar values.
pub fn char_len(text: &str) -> usize {
    text.chars().count()
}

/// Prefix of at most `n` characters, never splitting a code point.
pub fn take_chars(text: &str, n: usize) -> &str {
    match text.char_indices().nth(n) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

pub fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
