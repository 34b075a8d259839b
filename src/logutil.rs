//! Logging helpers so device-provided text and payloads stay single-line.

use std::fmt::Write;

/// Escape a string for single-line logging:
/// - `\n` => `\\n`
/// - `\r` => `\\r`
/// - `\t` => `\\t`
/// - backslash => `\\\\`
///
/// Other control characters become `\xNN`. Long strings are cut with an
/// ellipsis; user descriptors are at most 16 bytes but nothing guarantees a
/// device sticks to that.
pub fn escape_log(s: &str) -> String {
    const MAX_PREVIEW: usize = 64;
    let mut out = String::with_capacity(s.len().min(MAX_PREVIEW) + 8);
    for (count, ch) in s.chars().enumerate() {
        if count >= MAX_PREVIEW {
            out.push('…');
            break;
        }
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                let _ = write!(&mut out, "\\x{:02X}", c as u32);
            }
            c => out.push(c),
        }
    }
    out
}

/// Hex dump of the first bytes of a payload, `01 02 ff ... (+12)`.
pub fn hex_snippet(data: &[u8]) -> String {
    const MAX_BYTES: usize = 24;
    let mut out = String::with_capacity(data.len().min(MAX_BYTES) * 3 + 8);
    for (i, b) in data.iter().take(MAX_BYTES).enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let _ = write!(&mut out, "{:02x}", b);
    }
    if data.len() > MAX_BYTES {
        let _ = write!(&mut out, " ... (+{})", data.len() - MAX_BYTES);
    }
    out
}

/// EUI-64 in the usual colon form, `00:21:2e:ff:ff:00:00:01`.
pub fn fmt_ext(ext: u64) -> String {
    let b = ext.to_be_bytes();
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]
    )
}
