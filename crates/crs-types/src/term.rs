//! Operator terminal line types.

/// Colors the operator terminal knows how to render.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Color {
    /// Print without any color.
    #[default]
    None,
    /// Errors and rejected connections.
    Red,
    /// Happy session lifecycle messages.
    Green,
    /// Callback one-liners and scripts.
    Cyan,
    /// Static file requests.
    Blue,
}

/// A line destined for the operator terminal.
///
/// When `plain` is set the terminal writes `line` raw: no color, no appended
/// newline, no timestamp. Shell output arrives this way so the target's bytes
/// reach the operator unmodified.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OutLine {
    /// Color in which to print the line.
    pub color: Color,
    /// The text itself.
    pub line: String,
    /// If set, the terminal switches its prompt to this before printing.
    pub prompt: Option<String>,
    /// Suppress the timestamp for this line.
    pub no_timestamp: bool,
    /// Write the bytes exactly as-is.
    pub plain: bool,
}

impl OutLine {
    /// A colored line with a timestamp.
    pub fn line(color: Color, line: impl Into<String>) -> Self {
        Self {
            color,
            line: line.into(),
            ..Self::default()
        }
    }

    /// A colored line with no timestamp.
    pub fn untimestamped(color: Color, line: impl Into<String>) -> Self {
        Self {
            color,
            line: line.into(),
            no_timestamp: true,
            ..Self::default()
        }
    }

    /// Raw bytes from the target, passed through unmodified.
    pub fn plain(line: impl Into<String>) -> Self {
        Self {
            line: line.into(),
            plain: true,
            ..Self::default()
        }
    }

    /// A prompt change with no line to print.
    pub fn prompt(prompt: impl Into<String>) -> Self {
        Self {
            prompt: Some(prompt.into()),
            ..Self::default()
        }
    }
}
