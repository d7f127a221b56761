//! Two-stage JSON extraction from model output.
//!
//! Stage one parses the whole reply. Stage two parses the first fenced code
//! block (```` ```json ```` or a bare fence). Anything else is a failure the
//! caller has to handle; nothing is defaulted.

use serde::de::DeserializeOwned;

#[derive(Debug, Clone, PartialEq)]
pub enum ParseOutcome<T> {
    Parsed(T),
    Failed(String),
}

pub fn parse_json<T: DeserializeOwned>(raw: &str) -> ParseOutcome<T> {
    let direct = match serde_json::from_str::<T>(raw.trim()) {
        Ok(v) => return ParseOutcome::Parsed(v),
        Err(e) => e,
    };

    let Some(block) = extract_fenced_block(raw) else {
        return ParseOutcome::Failed(format!(
            "response is not JSON ({direct}) and contains no fenced block"
        ));
    };

    match serde_json::from_str::<T>(block.trim()) {
        Ok(v) => ParseOutcome::Parsed(v),
        Err(e) => ParseOutcome::Failed(format!("fenced block is not valid JSON: {e}")),
    }
}

/// Body of the first ```` ```json ```` block, else of the first bare fence.
pub fn extract_fenced_block(raw: &str) -> Option<&str> {
    fenced_after(raw, "```json").or_else(|| fenced_after(raw, "```"))
}

fn fenced_after<'a>(raw: &'a str, opener: &str) -> Option<&'a str> {
    let start = raw.find(opener)? + opener.len();
    let rest = &raw[start..];
    // The opener line may carry a language tag we did not match on.
    let body_start = rest.find('\n').map(|i| i + 1).unwrap_or(0);
    let body = &rest[body_start..];
    let end = body.find("```")?;
    Some(&body[..end])
}
