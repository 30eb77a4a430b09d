//! Input parsing: the deterministic query text format, VNN-LIB
//! properties, and the builder network front-ends target.

mod builder;
mod query_file;
mod vnnlib;

pub use builder::QueryBuilder;
pub use query_file::{load_query, parse_query_text, query_to_text, save_query};
pub use vnnlib::{apply_vnnlib_property, load_vnnlib_property};

use ariadne::{Color, Label, Report, ReportKind, Source};

/// A spanned parse error, rendered with ariadne.
#[derive(Clone, Debug)]
pub struct ParseDiagnostic {
    pub message: String,
    /// Byte range into the source text.
    pub start: usize,
    pub end: usize,
    pub help: Option<String>,
}

impl ParseDiagnostic {
    pub fn new(message: impl Into<String>, start: usize, end: usize) -> Self {
        Self {
            message: message.into(),
            start,
            end,
            help: None,
        }
    }

    pub fn with_help(mut self, help: impl Into<String>) -> Self {
        self.help = Some(help.into());
        self
    }

    /// Render to stderr against the offending source.
    pub fn render(&self, filename: &str, source: &str) {
        let mut report = Report::build(ReportKind::Error, filename, self.start)
            .with_message(&self.message)
            .with_label(
                Label::new((filename, self.start..self.end))
                    .with_message(&self.message)
                    .with_color(Color::Red),
            );
        if let Some(help) = &self.help {
            report = report.with_help(help);
        }
        let _ = report.finish().eprint((filename, Source::from(source)));
    }
}

/// Byte span of the `index`-th line of `source`.
pub(crate) fn line_span(source: &str, index: usize) -> (usize, usize) {
    let mut offset = 0;
    for (i, line) in source.lines().enumerate() {
        if i == index {
            return (offset, offset + line.len());
        }
        offset += line.len() + 1;
    }
    (source.len(), source.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_span() {
        let source = "first\nsecond\nthird";
        assert_eq!(line_span(source, 0), (0, 5));
        assert_eq!(line_span(source, 1), (6, 12));
        assert_eq!(line_span(source, 2), (13, 18));
        assert_eq!(line_span(source, 9), (18, 18));
    }
}
