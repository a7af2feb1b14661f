//! Helpers that keep device-originated text and bytes on a single log line.

use std::fmt::{self, Write};

const MAX_CHARS: usize = 200;

/// Device text rendered on one line: control characters and backslashes are
/// escaped, and anything past `MAX_CHARS` characters becomes a single `…`.
pub fn escape_log(s: &str) -> String {
    OneLine(s).to_string()
}

struct OneLine<'a>(&'a str);

impl fmt::Display for OneLine<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut chars = self.0.chars();
        for ch in chars.by_ref().take(MAX_CHARS) {
            if ch.is_control() || ch == '\\' {
                write!(f, "{}", ch.escape_debug())?;
            } else {
                f.write_char(ch)?;
            }
        }
        if chars.next().is_some() {
            f.write_char('…')?;
        }
        Ok(())
    }
}

/// Lower-case hex of at most `max` leading bytes, with a `…(+N)` suffix when cut.
pub fn hex_snippet(data: &[u8], max: usize) -> String {
    let shown = data.len().min(max);
    let mut out = hex::encode(&data[..shown]);
    if data.len() > shown {
        let _ = write!(&mut out, "…(+{})", data.len() - shown);
    }
    out
}
