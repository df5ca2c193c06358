// ==============================================================================
// codec/keys.rs - Document Key Escaping
// ==============================================================================
// Description: Document field names may not contain '.', so it is swapped for
//              an escape token on the way in and restored on the way out
// Author: Matt Barham
// Created: 2026-09-29
// Modified: 2026-09-29
// Version: 1.0.0
// ==============================================================================

use std::borrow::Cow;

/// Replacement for '.' inside stored field names
pub const DOT_ESCAPE: &str = "&#46;";

pub fn escape_key(key: &str) -> Cow<'_, str> {
    if key.contains('.') {
        Cow::Owned(key.replace('.', DOT_ESCAPE))
    } else {
        Cow::Borrowed(key)
    }
}

pub fn unescape_key(key: &str) -> Cow<'_, str> {
    if key.contains(DOT_ESCAPE) {
        Cow::Owned(key.replace(DOT_ESCAPE, "."))
    } else {
        Cow::Borrowed(key)
    }
}
