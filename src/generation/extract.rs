//! Fenced code block extraction from model replies

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    /// First ```python block. The tag is matched case-insensitively and the
    /// body must sit between a newline after the tag and one before the fence.
    static ref PYTHON_BLOCK: Regex =
        Regex::new(r"(?i)```python\n([\s\S]*?)\n```").expect("valid fenced block pattern");
}

/// Extract the first python fenced block from `text`.
///
/// Returns `(code, remainder)` where `code` is the trimmed block body and
/// `remainder` is `text` with the whole block span removed, trimmed. When no
/// block exists, `code` is empty and `remainder` is the trimmed input.
///
/// Later blocks are left untouched inside `remainder`.
pub fn extract_code(text: &str) -> (String, String) {
    let Some(caps) = PYTHON_BLOCK.captures(text) else {
        return (String::new(), text.trim().to_string());
    };

    // Group 0 always exists for a successful match
    let span = caps.get(0).map(|m| m.range()).unwrap_or(0..0);
    let code = caps
        .get(1)
        .map(|m| m.as_str().trim().to_string())
        .unwrap_or_default();

    let mut remainder = String::with_capacity(text.len() - span.len());
    remainder.push_str(&text[..span.start]);
    remainder.push_str(&text[span.end..]);

    (code, remainder.trim().to_string())
}
