//! Translation of webdriver key code points into platform key gestures.
//!
//! A key combination is an ordered list of strings, each either a code
//! point from the webdriver Unicode private-use range (`\u{E000}` ..) naming
//! a control key, or a literal printable character. Both back ends report
//! unknown input with the same error text so clients see stable messages
//! regardless of the host.

pub mod macos;
pub mod windows;

use thiserror::Error;

/// Ordered key code points to be pressed together.
pub type KeyCombination = [String];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    /// A single code point with no mapping. Carries its first UTF-16 unit.
    #[error("unknown key (\\u{0:x})")]
    UnknownKey(u16),
    /// A multi-character or otherwise unusable key string.
    #[error("Invalid key code specified.")]
    InvalidKeyCode,
    #[error("unknown code \"{0}\"")]
    UnknownCode(String),
    #[error("unknown modifier \"{0}\"")]
    UnknownModifier(String),
}

impl KeyError {
    pub(crate) fn unknown_key(code: &str) -> Self {
        KeyError::UnknownKey(code.encode_utf16().next().unwrap_or_default())
    }
}

/// Returns the sole character of `code`, if it has exactly one.
pub(crate) fn single_char(code: &str) -> Option<char> {
    let mut chars = code.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) => Some(c),
        _ => None,
    }
}
