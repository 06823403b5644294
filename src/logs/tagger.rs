use colored::Color;

/// Number of distinct source colors, and so the session source cap
pub const PALETTE_SIZE: usize = 8;

/// Longest label rendered before truncation
pub const MAX_LABEL_LEN: usize = 20;

/// Source colors, ordered so neighbouring registrations contrast
pub const PALETTE: [Color; PALETTE_SIZE] = [
    Color::Cyan,
    Color::Yellow,
    Color::Green,
    Color::Magenta,
    Color::Blue,
    Color::Red,
    Color::BrightCyan,
    Color::BrightYellow,
];

/// Display identity of a source for the whole session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub label: String,
    pub color_index: usize,
}

impl Tag {
    /// Palette color for this tag
    pub fn color(&self) -> Color {
        PALETTE[self.color_index % PALETTE_SIZE]
    }
}

/// Assigns labels and colors from registration order alone
pub struct LineTagger;

impl LineTagger {
    /// Tag for the source registered at `index`
    ///
    /// Pure: the same index and identity always produce the same tag.
    pub fn assign(index: usize, identity: &str) -> Tag {
        Tag {
            label: truncate(identity, MAX_LABEL_LEN),
            color_index: index % PALETTE_SIZE,
        }
    }
}

/// Truncate a label to `max_len` characters, marking the cut with `...`
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
