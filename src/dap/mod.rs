pub mod protocol;
pub mod sourcemap;
pub mod tracer;
pub mod transport;

/// Line and column numbering used by the client.
///
/// Internally every line and column is 1-based.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Numbering {
    pub lines_start_at1: bool,
    pub columns_start_at1: bool,
}

impl Default for Numbering {
    fn default() -> Self {
        Self {
            lines_start_at1: true,
            columns_start_at1: true,
        }
    }
}

impl Numbering {
    pub fn line_to_client(&self, line: u32) -> i64 {
        if self.lines_start_at1 {
            line as i64
        } else {
            line as i64 - 1
        }
    }

    /// Client line into internal numbering. None when the client line names no line
    /// of a file.
    pub fn line_from_client(&self, line: i64) -> Option<u32> {
        let line = if self.lines_start_at1 {
            Some(line)
        } else {
            line.checked_add(1)
        };
        line.filter(|line| *line >= 1)
            .and_then(|line| u32::try_from(line).ok())
    }

    pub fn column_to_client(&self, column: u32) -> i64 {
        if self.columns_start_at1 {
            column as i64
        } else {
            column as i64 - 1
        }
    }
}
