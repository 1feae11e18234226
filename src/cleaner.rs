//! Cleans raw PTY bytes into agent-friendly plain text.
//!
//! Applied to `/out` (when the caller doesn't request the rendered grid) and
//! to `run()`'s returned `output` field. Never applied before bytes reach the
//! VT100 renderer — that path always sees raw bytes.

use regex::Regex;
use std::sync::LazyLock;

static ANSI_ESCAPE: LazyLock<Regex> = LazyLock::new(|| {
    // CSI/OSC/DCS/SOS/PM/APC sequences, plus bare two-byte ESC commands.
    Regex::new(r"\x1b(\[[0-9;?]*[ -/]*[@-~]|\][^\x07\x1b]*(\x07|\x1b\\)|[PX^_][^\x1b]*\x1b\\|[@-Z\\-_])").unwrap()
});

static SENTINEL_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^__SILC_(BEGIN|END)_[0-9a-f]{8}__(:-?\d+)?$").unwrap());

/// Clean raw bytes into plain text, per the pipeline in the run-protocol
/// design: carriage-return overwrite collapsing, ANSI stripping, control-char
/// removal, trailing-whitespace trim, blank-line collapsing, sentinel removal.
///
/// Idempotent: `clean(clean(b)) == clean(b)`.
pub fn clean(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);

    let mut lines: Vec<String> = Vec::new();
    for line in text.split('\n') {
        let after_cr = line.rsplit('\r').next().unwrap_or(line);
        let stripped = ANSI_ESCAPE.replace_all(after_cr, "");
        let printable: String = stripped
            .chars()
            .filter(|&c| c == '\t' || !c.is_control())
            .collect();
        let trimmed = printable.trim_end();
        if SENTINEL_LINE.is_match(trimmed) {
            continue;
        }
        lines.push(trimmed.to_string());
    }

    let mut collapsed: Vec<String> = Vec::with_capacity(lines.len());
    let mut prev_blank = false;
    for line in lines {
        let blank = line.is_empty();
        if blank && prev_blank {
            continue;
        }
        prev_blank = blank;
        collapsed.push(line);
    }

    collapsed.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idempotent_on_arbitrary_bytes() {
        let raw = b"hello\x1b[31m world\r\nfoo\n\n\n\nbar\t\x07baz";
        let once = clean(raw);
        let twice = clean(once.as_bytes());
        assert_eq!(once, twice);
    }

    #[test]
    fn strips_ansi_color_codes() {
        let raw = b"\x1b[1;32mgreen\x1b[0m text";
        assert_eq!(clean(raw), "green text");
    }

    #[test]
    fn keeps_segment_after_last_carriage_return() {
        let raw = b"progress: 10%\rprogress: 100%";
        assert_eq!(clean(raw), "progress: 100%");
    }

    #[test]
    fn collapses_consecutive_blank_lines() {
        let raw = b"a\n\n\n\nb";
        assert_eq!(clean(raw), "a\n\nb");
    }

    #[test]
    fn removes_sentinel_lines() {
        let raw = b"__SILC_BEGIN_deadbeef__\nhello\n__SILC_END_deadbeef__:0\n";
        assert_eq!(clean(raw), "hello");
    }
}
