//! Recovery of a JSON object from free-text model output.
//!
//! The upstream model is not obliged to answer with clean JSON. Its text may carry control
//! characters, markdown fences or trailing commentary, so the response is treated as text that
//! probably contains one object. Parsing is left to the caller.

use crate::errors::VerificationError;

/// Extracts and lightly repairs the outermost `{...}` span of `raw`.
pub fn extract_json(raw: &str) -> Result<String, VerificationError> {
    let cleaned = strip_control_chars(raw);
    let Some(start) = cleaned.find('{') else {
        return Err(VerificationError::extraction(
            "no opening brace in model response",
        ));
    };
    let Some(end) = cleaned.rfind('}') else {
        return Err(VerificationError::extraction(
            "no closing brace in model response",
        ));
    };
    if end <= start {
        return Err(VerificationError::extraction(
            "closing brace precedes opening brace in model response",
        ));
    }
    Ok(repair_json(&cleaned[start..=end]))
}

/// Drops C0/C1 control characters and collapses whitespace runs to one space.
///
/// Whitespace controls (newline, tab, carriage return) count as whitespace so that tokens on
/// separate lines stay separated.
pub fn strip_control_chars(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut pending_space = false;
    for ch in raw.chars() {
        if ch.is_whitespace() {
            pending_space = true;
            continue;
        }
        if ch.is_control() {
            continue;
        }
        if pending_space && !out.is_empty() {
            out.push(' ');
        }
        pending_space = false;
        out.push(ch);
    }
    out
}

/// Removes trailing commas before `}`/`]` and collapses doubled backslashes.
fn repair_json(candidate: &str) -> String {
    let chars: Vec<char> = candidate.chars().collect();
    let mut out = String::with_capacity(candidate.len());
    let mut idx = 0;
    while idx < chars.len() {
        let ch = chars[idx];
        if ch == ',' {
            let next = chars[idx + 1..]
                .iter()
                .find(|next| !next.is_whitespace())
                .copied();
            if matches!(next, Some('}') | Some(']')) {
                idx += 1;
                continue;
            }
        }
        if ch == '\\' && chars.get(idx + 1) == Some(&'\\') {
            out.push('\\');
            idx += 2;
            continue;
        }
        out.push(ch);
        idx += 1;
    }
    out
}
