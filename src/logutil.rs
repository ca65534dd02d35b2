//! Single-line sanitizing for radio-supplied text.
//!
//! Advertised names and decrypted channel messages come from untrusted
//! senders and may embed control characters that would split or corrupt
//! a log line.

/// Characters shown before the preview is cut with an ellipsis. Channel
/// messages can run long; advertised names never get near this.
const MAX_PREVIEW: usize = 200;

/// Render an untrusted mesh string on one log line. Backslashes are
/// doubled and control characters become visible escapes.
pub fn escape_log(s: &str) -> String {
    let mut out = String::with_capacity(s.len().min(MAX_PREVIEW) + 8);
    for ch in s.chars().take(MAX_PREVIEW) {
        match fixed_escape(ch) {
            Some(esc) => out.push_str(esc),
            None if ch.is_control() => {
                use std::fmt::Write;
                let _ = write!(&mut out, "\\x{:02X}", ch as u32);
            }
            None => out.push(ch),
        }
    }
    if s.chars().nth(MAX_PREVIEW).is_some() {
        out.push('…');
    }
    out
}

fn fixed_escape(ch: char) -> Option<&'static str> {
    match ch {
        '\\' => Some("\\\\"),
        '\n' => Some("\\n"),
        '\r' => Some("\\r"),
        '\t' => Some("\\t"),
        _ => None,
    }
}
