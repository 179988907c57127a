//! Local terminal grid fed by the server's output stream.
//!
//! Output payloads are an append-only byte stream; the grid keeps the
//! emulated screen and hands back the escape sequences needed to bring a
//! real terminal up to date.

use protocol::TerminalSize;
use vt100::Parser;

/// Scrollback lines kept by default.
pub const DEFAULT_SCROLLBACK: usize = 1000;

/// Size of one character cell on the rendering surface.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FontMetrics {
    pub cell_width: f64,
    pub cell_height: f64,
}

impl FontMetrics {
    pub fn new(cell_width: f64, cell_height: f64) -> Self {
        Self {
            cell_width,
            cell_height,
        }
    }

    /// One unit per cell, for surfaces already measured in cells.
    pub fn unit() -> Self {
        Self::new(1.0, 1.0)
    }
}

impl Default for FontMetrics {
    fn default() -> Self {
        Self::unit()
    }
}

/// Dimensions of the rendering surface.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SurfaceSize {
    pub width: f64,
    pub height: f64,
}

impl SurfaceSize {
    pub fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }
}

/// Compute the grid that fits a surface, never smaller than 1x1.
pub fn fit(surface: SurfaceSize, font: FontMetrics) -> TerminalSize {
    TerminalSize::new(
        cells(surface.width, font.cell_width),
        cells(surface.height, font.cell_height),
    )
}

fn cells(extent: f64, cell: f64) -> u16 {
    if cell.is_nan() || cell <= 0.0 || !extent.is_finite() {
        return 1;
    }
    (extent / cell).floor().clamp(1.0, u16::MAX as f64) as u16
}

/// Emulated screen for one connection.
pub struct TerminalGrid {
    parser: Parser,
    last_rendered: Option<vt100::Screen>,
}

impl TerminalGrid {
    pub fn new(size: TerminalSize, scrollback: usize) -> Self {
        Self {
            parser: Parser::new(size.rows.max(1), size.columns.max(1), scrollback),
            last_rendered: None,
        }
    }

    pub fn size(&self) -> TerminalSize {
        let (rows, columns) = self.parser.screen().size();
        TerminalSize::new(columns, rows)
    }

    /// Append an output payload.
    pub fn feed(&mut self, data: &str) {
        self.parser.process(data.as_bytes());
    }

    /// Change the grid size. Returns false if it was already that size.
    pub fn resize(&mut self, size: TerminalSize) -> bool {
        if size == self.size() || !size.is_valid() {
            return false;
        }
        self.parser.set_size(size.rows, size.columns);
        // Reflowed screens do not diff cleanly against the old one
        self.last_rendered = None;
        true
    }

    /// Escape sequences that move the display from the last render to now.
    pub fn render_diff(&mut self) -> Vec<u8> {
        let screen = self.parser.screen();
        let mut bytes = match &self.last_rendered {
            Some(previous) => screen.contents_diff(previous),
            None => {
                let mut full = b"\x1b[H\x1b[2J".to_vec();
                full.extend(screen.contents_formatted());
                full
            }
        };

        let (row, col) = screen.cursor_position();
        bytes.extend(format!("\x1b[{};{}H", row + 1, col + 1).into_bytes());
        self.last_rendered = Some(screen.clone());
        bytes
    }

    /// Escape sequences that repaint the whole screen.
    pub fn full_render(&mut self) -> Vec<u8> {
        self.last_rendered = None;
        self.render_diff()
    }

    /// Plain text of the visible screen.
    pub fn contents(&self) -> String {
        self.parser.screen().contents()
    }

    /// Drop all state, keeping the size. Used when a new stream begins.
    pub fn reset(&mut self) {
        let size = self.size();
        let (rows, columns) = (size.rows, size.columns);
        self.parser = Parser::new(rows, columns, DEFAULT_SCROLLBACK);
        self.last_rendered = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fit_floors() {
        let font = FontMetrics::new(9.0, 18.0);
        assert_eq!(
            fit(SurfaceSize::new(800.0, 600.0), font),
            TerminalSize::new(88, 33)
        );
    }

    #[test]
    fn test_fit_minimum() {
        let font = FontMetrics::new(9.0, 18.0);
        assert_eq!(fit(SurfaceSize::new(3.0, 0.0), font), TerminalSize::new(1, 1));
        assert_eq!(
            fit(SurfaceSize::new(100.0, 100.0), FontMetrics::new(0.0, -1.0)),
            TerminalSize::new(1, 1)
        );
    }

    #[test]
    fn test_fit_unit_metrics() {
        assert_eq!(
            fit(SurfaceSize::new(120.0, 40.0), FontMetrics::unit()),
            TerminalSize::new(120, 40)
        );
    }

    #[test]
    fn test_feed_across_chunks() {
        let mut grid = TerminalGrid::new(TerminalSize::new(20, 5), 100);
        grid.feed("hel");
        grid.feed("lo\r\nworld");
        let text = grid.contents();
        assert!(text.starts_with("hello\nworld"), "got {:?}", text);
    }

    #[test]
    fn test_resize_once() {
        let mut grid = TerminalGrid::new(TerminalSize::new(80, 24), 100);
        assert!(!grid.resize(TerminalSize::new(80, 24)));
        assert!(grid.resize(TerminalSize::new(100, 30)));
        assert_eq!(grid.size(), TerminalSize::new(100, 30));
        assert!(!grid.resize(TerminalSize::new(0, 30)));
    }

    #[test]
    fn test_render_diff_is_incremental() {
        let mut grid = TerminalGrid::new(TerminalSize::new(20, 5), 100);
        grid.feed("abc");
        let first = grid.render_diff();
        assert!(first.starts_with(b"\x1b[H\x1b[2J"));

        grid.feed("d");
        let second = grid.render_diff();
        assert!(!second.starts_with(b"\x1b[H\x1b[2J"));
        assert!(second.len() < first.len() + 8);
    }

    #[test]
    fn test_reset_clears_screen() {
        let mut grid = TerminalGrid::new(TerminalSize::new(20, 5), 100);
        grid.feed("stale");
        grid.reset();
        assert_eq!(grid.contents().trim(), "");
        assert_eq!(grid.size(), TerminalSize::new(20, 5));
    }
}
