//! Virtual-screen rendering via a real VT100 emulator.
//!
//! Grounded on the `vt100::Parser` usage pattern in the agency PTY session
//! (`crates/agency/src/pty/session.rs` in the retrieval pack): feed raw bytes
//! in, read the visible grid back out. The grid view served to `/stream` and
//! the WebSocket always sees unmodified raw bytes fed through this parser —
//! never pre-cleaned text, per the run-protocol's sentinel-hygiene contract
//! (sentinels are stripped from the grid's text extraction here too).

use vt100::Parser;

/// Renders raw PTY bytes into a fixed `rows x cols` screen grid.
pub struct Renderer {
    parser: Parser,
}

impl Renderer {
    pub fn new(rows: u16, cols: u16) -> Self {
        Self {
            parser: Parser::new(rows, cols, 10_000),
        }
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.parser.process(bytes);
    }

    pub fn resize(&mut self, rows: u16, cols: u16) {
        self.parser.set_size(rows, cols);
    }

    /// Render the current screen as plain text, one line per row, trailing
    /// whitespace trimmed. Sentinel lines are filtered the same way the
    /// cleaner does, since a command's sentinel wrapper can legitimately land
    /// inside the visible screen region.
    pub fn render_text(&self) -> String {
        let screen = self.parser.screen();
        let (rows, _) = screen.size();
        let mut lines = Vec::with_capacity(rows as usize);
        for row in 0..rows {
            let line = screen.rows(row, row + 1).next().unwrap_or_default();
            let trimmed = line.trim_end();
            if crate::cleaner::clean(trimmed.as_bytes()).is_empty() && trimmed.is_empty() {
                lines.push(String::new());
            } else if is_sentinel_line(trimmed) {
                continue;
            } else {
                lines.push(trimmed.to_string());
            }
        }
        lines.join("\n")
    }
}

fn is_sentinel_line(line: &str) -> bool {
    line.starts_with("__SILC_BEGIN_") || line.starts_with("__SILC_END_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_fed_bytes_into_grid_text() {
        let mut r = Renderer::new(5, 20);
        r.feed(b"hello world\r\n");
        assert!(r.render_text().contains("hello world"));
    }

    #[test]
    fn filters_sentinel_lines_from_rendered_grid() {
        let mut r = Renderer::new(5, 40);
        r.feed(b"__SILC_BEGIN_deadbeef__\r\nhi\r\n__SILC_END_deadbeef__:0\r\n");
        let text = r.render_text();
        assert!(!text.contains("__SILC_BEGIN"));
        assert!(!text.contains("__SILC_END"));
        assert!(text.contains("hi"));
    }
}
