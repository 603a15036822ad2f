//! Text canonicalization applied to extracted document text before chunking

/// Normalize raw extracted text into a byte-stable ASCII string.
///
/// Lower-cases, replaces anything outside printable ASCII with a space,
/// collapses whitespace runs to a single space and trims both ends.
/// Queries are never passed through this function.
pub fn normalize_text(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut pending_space = false;

    for c in raw.chars().flat_map(char::to_lowercase) {
        if c.is_ascii_graphic() {
            if pending_space && !out.is_empty() {
                out.push(' ');
            }
            pending_space = false;
            out.push(c);
        } else {
            // Whitespace, control characters and non-ASCII all act as separators
            pending_space = true;
        }
    }

    out
}
