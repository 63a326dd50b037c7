//! Command Parser
//!
//! Model output is free text that is supposed to contain a JSON array of
//! commands, but is not trusted to contain only that. The parser finds the
//! first balanced array literal that is valid JSON, decodes it, and rejects
//! empty or undecodable streams. Payload shapes are not checked here.

use crate::command::Command;
use serde_json::Value;
use thiserror::Error;

/// What the user hears when the model's output cannot be turned into commands.
pub const FALLBACK_MESSAGE: &str =
    "I seem to be having trouble formatting my thoughts. Please try again.";

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("no JSON array found in model output")]
    NoArrayFound,
    #[error("command array could not be decoded: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("command array is empty")]
    Empty,
}

/// Extracts the ordered command stream embedded in `text`.
pub fn parse_command_stream(text: &str) -> Result<Vec<Command>, ParseError> {
    let value = balanced_literals(text, b'[', b']')
        .find_map(|candidate| serde_json::from_str::<Value>(candidate).ok())
        .ok_or(ParseError::NoArrayFound)?;

    let Value::Array(items) = value else {
        return Err(ParseError::NoArrayFound);
    };
    if items.is_empty() {
        return Err(ParseError::Empty);
    }

    items
        .into_iter()
        .map(|item| serde_json::from_value(item).map_err(ParseError::from))
        .collect()
}

/// The single-step stream substituted when parsing fails.
pub fn fallback_stream() -> Vec<Command> {
    vec![Command::speak(FALLBACK_MESSAGE)]
}

/// Yields every balanced `open`..`close` slice of `text`, in order of their
/// opening delimiter. Delimiters inside JSON string literals are ignored.
///
/// One pass over the text; string tracking only applies inside a literal, so
/// stray quotes in surrounding prose do not hide it.
pub(crate) fn balanced_literals(text: &str, open: u8, close: u8) -> impl Iterator<Item = &str> {
    let mut spans = Vec::new();
    let mut opened: Vec<usize> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in text.as_bytes().iter().enumerate() {
        if in_string {
            match b {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match b {
            b'"' if !opened.is_empty() => in_string = true,
            _ if b == open => opened.push(i),
            _ if b == close => {
                if let Some(start) = opened.pop() {
                    spans.push((start, i + 1));
                }
            }
            _ => {}
        }
    }

    // Inner literals close first.
    spans.sort_unstable_by_key(|&(start, _)| start);
    spans.into_iter().map(move |(start, end)| &text[start..end])
}
