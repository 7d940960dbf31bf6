//! Optional local status panel.
//!
//! Panels hold a character grid; the controller writes preformatted status
//! lines into it and asks for a render.  The physical driver is not wired
//! up here, rendered frames go to the log at debug level.

use serde::Deserialize;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DisplayKind {
    #[default]
    None,
    /// 128x64 monochrome OLED.
    Bitmap,
    /// 250x122 e-paper.
    Eink,
}

/// Fixed-size character grid.
#[derive(Debug, Clone, PartialEq)]
pub struct TextPanel {
    cols: usize,
    rows: Vec<Vec<char>>,
}

impl TextPanel {
    pub fn new(cols: usize, rows: usize) -> Self {
        Self {
            cols,
            rows: vec![vec![' '; cols]; rows],
        }
    }

    pub fn clear(&mut self) {
        for row in &mut self.rows {
            row.fill(' ');
        }
    }

    /// Write `text` starting at (`col`, `row`), clipped at the right edge.
    /// Writes outside the grid are dropped.
    pub fn print_at(&mut self, col: usize, row: usize, text: &str) {
        let Some(line) = self.rows.get_mut(row) else {
            return;
        };
        for (cell, ch) in line.iter_mut().skip(col).zip(text.chars()) {
            *cell = ch;
        }
    }

    /// Rows joined by newlines, trailing blanks trimmed.
    pub fn frame(&self) -> String {
        self.rows
            .iter()
            .map(|r| r.iter().collect::<String>().trim_end().to_string())
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn cols(&self) -> usize {
        self.cols
    }
}

pub enum Display {
    None,
    Bitmap {
        panel: TextPanel,
        on: bool,
    },
    Eink {
        panel: TextPanel,
        /// Last frame pushed to the glass.
        shown: Option<String>,
        refreshes: u32,
    },
}

impl Display {
    pub fn new(kind: DisplayKind) -> Self {
        match kind {
            DisplayKind::None => Self::None,
            DisplayKind::Bitmap => Self::Bitmap {
                panel: TextPanel::new(21, 8),
                on: false,
            },
            DisplayKind::Eink => Self::Eink {
                panel: TextPanel::new(41, 15),
                shown: None,
                refreshes: 0,
            },
        }
    }

    fn panel_mut(&mut self) -> Option<&mut TextPanel> {
        match self {
            Self::None => None,
            Self::Bitmap { panel, .. } | Self::Eink { panel, .. } => Some(panel),
        }
    }

    pub fn is_present(&self) -> bool {
        !matches!(self, Self::None)
    }

    pub fn clear(&mut self) {
        if let Some(p) = self.panel_mut() {
            p.clear();
        }
    }

    pub fn print_at(&mut self, col: usize, row: usize, text: &str) {
        if let Some(p) = self.panel_mut() {
            p.print_at(col, row, text);
        }
    }

    /// Push the grid to the panel.  Returns whether the panel was actually
    /// redrawn; e-paper skips the refresh when nothing changed.
    pub fn render(&mut self) -> bool {
        match self {
            Self::None => false,
            Self::Bitmap { panel, on } => {
                *on = true;
                debug!(panel = "bitmap", frame = %panel.frame(), "render");
                true
            }
            Self::Eink {
                panel,
                shown,
                refreshes,
            } => {
                let frame = panel.frame();
                if shown.as_deref() == Some(frame.as_str()) {
                    debug!(panel = "eink", "frame unchanged, refresh skipped");
                    return false;
                }
                debug!(panel = "eink", frame = %frame, "render");
                *shown = Some(frame);
                *refreshes += 1;
                true
            }
        }
    }

    /// Low-power state until the next render.
    pub fn sleep(&mut self) {
        match self {
            Self::None => {}
            Self::Bitmap { on, .. } => {
                *on = false;
                debug!(panel = "bitmap", "display off");
            }
            // E-paper keeps its image without power.
            Self::Eink { .. } => debug!(panel = "eink", "panel asleep"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn print_at_clips_to_grid() {
        let mut p = TextPanel::new(5, 2);
        p.print_at(2, 0, "abcdef");
        p.print_at(0, 1, "xy");
        p.print_at(0, 7, "lost");
        assert_eq!(p.frame(), "  abc\nxy");
    }

    #[test]
    fn clear_blanks_every_cell() {
        let mut p = TextPanel::new(4, 2);
        p.print_at(0, 0, "full");
        p.clear();
        assert_eq!(p.frame(), "\n");
    }

    #[test]
    fn grid_sizes_per_variant() {
        match Display::new(DisplayKind::Bitmap) {
            Display::Bitmap { panel, .. } => assert_eq!(panel.cols(), 21),
            _ => panic!("wrong variant"),
        }
        match Display::new(DisplayKind::Eink) {
            Display::Eink { panel, .. } => assert_eq!(panel.cols(), 41),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn none_accepts_everything_and_renders_nothing() {
        let mut d = Display::new(DisplayKind::None);
        d.clear();
        d.print_at(0, 0, "ignored");
        assert!(!d.render());
        d.sleep();
        assert!(!d.is_present());
    }

    #[test]
    fn bitmap_redraws_every_time() {
        let mut d = Display::new(DisplayKind::Bitmap);
        d.print_at(0, 0, "T 22.5C");
        assert!(d.render());
        assert!(d.render());
        d.sleep();
        assert!(matches!(d, Display::Bitmap { on: false, .. }));
    }

    #[test]
    fn eink_refreshes_only_on_change() {
        let mut d = Display::new(DisplayKind::Eink);
        d.print_at(0, 0, "Soil 40%");
        assert!(d.render());
        d.clear();
        d.print_at(0, 0, "Soil 40%");
        assert!(!d.render());
        d.print_at(0, 1, "Batt 75%");
        assert!(d.render());
        match d {
            Display::Eink { refreshes, .. } => assert_eq!(refreshes, 2),
            _ => panic!("wrong variant"),
        }
    }
}
