//! Helpers for putting raw serial payloads into log lines.
//!
//! Payloads crossing the bridge are arbitrary bytes: modem responses, ANSI
//! escape sequences, occasionally pure binary. Log lines must stay
//! single-line and printable regardless.

/// Render payload bytes as a single-line printable preview.
///
/// `\n`, `\r`, `\t` and backslash get their usual escapes; every other byte
/// outside printable ASCII (controls, 0x80 and above) is rendered as
/// `\xNN`. Previews longer than 300 bytes are truncated with an ellipsis so
/// one chatty payload cannot flood the log.
pub fn escape_log(data: &[u8]) -> String {
    const MAX_PREVIEW: usize = 300;
    let mut out = String::with_capacity(data.len().min(MAX_PREVIEW) + 8);
    for (count, byte) in data.iter().enumerate() {
        if count >= MAX_PREVIEW {
            out.push('…');
            break;
        }
        match *byte {
            b'\\' => out.push_str("\\\\"),
            b'\n' => out.push_str("\\n"),
            b'\r' => out.push_str("\\r"),
            b'\t' => out.push_str("\\t"),
            b @ 0x20..=0x7e => out.push(b as char),
            b => {
                use std::fmt::Write;
                let _ = write!(&mut out, "\\x{:02X}", b);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::escape_log;

    #[test]
    fn escapes_newlines_and_tabs() {
        assert_eq!(escape_log(b"AT+CSQ\r\n\tOK"), "AT+CSQ\\r\\n\\tOK");
    }

    #[test]
    fn hex_escapes_binary_and_control_bytes() {
        assert_eq!(escape_log(&[b'a', 0x1b, 0x00, 0xff]), "a\\x1B\\x00\\xFF");
    }

    #[test]
    fn long_payloads_truncate_with_ellipsis() {
        let escaped = escape_log(&[b'x'; 400]);
        assert!(escaped.ends_with('…'));
        assert_eq!(escaped.chars().count(), 301);
    }
}
