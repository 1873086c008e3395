use std::fmt::Write as _;

use colored::Colorize;

use crate::frontend::{lexer::SourceLocation, SourceFile};

/// Pipeline stage a diagnostic originated from, used in the rendered header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Lexer,
    Parser,
    Semantic,
    Type,
    Codegen,
    /// Invariant violations inside the compiler itself; carry no location.
    Internal,
}

impl core::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Lexer => "lexer",
            Self::Parser => "parse",
            Self::Semantic => "semantic",
            Self::Type => "type",
            Self::Codegen => "code generation",
            Self::Internal => "internal",
        };

        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub stage: Stage,
    pub message: String,
    pub location: SourceLocation,
    /// Column offset within the span of the exact offending character.
    pub error_offset: usize,
}

impl Diagnostic {
    pub fn new(stage: Stage, message: impl Into<String>, location: SourceLocation) -> Self {
        Self {
            stage,
            message: message.into(),
            location,
            error_offset: 0,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Stage::Internal, message, SourceLocation::UNKNOWN)
    }

    /// Two-line rendering: a header and, when the location is known, a source
    /// excerpt with the offending span underlined.
    pub fn render(&self, source: &SourceFile) -> String {
        let mut out = String::new();

        let header = if self.location.line == 0 {
            format!("{} {}: {}", self.stage, "error".red().bold(), self.message)
        } else {
            format!(
                "{} {} at {}:{}:{}: {}",
                self.stage,
                "error".red().bold(),
                source.origin,
                self.location.line,
                self.location.column,
                self.message
            )
        };
        let _ = writeln!(out, "{header}");

        if let Some(line_text) = source.line_text(self.location.line) {
            let line = self.location.line;
            let gutter = " ".repeat(line.to_string().len());

            let _ = writeln!(out, "  {line} | {line_text}");
            let _ = write!(out, "  {gutter} | ");

            for _ in 1..self.location.column {
                out.push(' ');
            }

            let column = self.location.column;
            let end_column = self.location.end_column;

            if end_column > column + 1 {
                // Span: wavy underline with the caret at the precise
                // offending character when error_offset is non-zero
                let caret_column = column + self.error_offset;
                for at in column..end_column {
                    if self.error_offset > 0 && at == caret_column {
                        let _ = write!(out, "{}", "^".red().bold());
                    } else {
                        let _ = write!(out, "{}", "~".red());
                    }
                }
            } else {
                let _ = write!(out, "{}", "^".red().bold());
            }

            out.push('\n');
        }

        out
    }

    pub fn emit(&self, source: &SourceFile) {
        eprint!("{}", self.render(source));
    }
}

pub fn emit_all(diagnostics: &[Diagnostic], source: &SourceFile) {
    for diagnostic in diagnostics {
        diagnostic.emit(source);
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn plain(text: &str) -> String {
        // Strip ANSI color codes so assertions are stable regardless of tty
        let mut out = String::new();
        let mut chars = text.chars();
        while let Some(c) = chars.next() {
            if c == '\u{1b}' {
                for d in chars.by_ref() {
                    if d == 'm' {
                        break;
                    }
                }
            } else {
                out.push(c);
            }
        }
        out
    }

    #[test]
    fn renders_caret_for_point_errors() {
        let source = SourceFile::from_string("let x = ;\n");
        let diagnostic = Diagnostic::new(
            Stage::Parser,
            "Expected expression",
            SourceLocation::new(1, 9, 10),
        );

        assert_eq!(
            plain(&diagnostic.render(&source)),
            "parse error at <memory>:1:9: Expected expression\n  1 | let x = ;\n    |         ^\n"
        );
    }

    #[test]
    fn renders_wavy_span_with_offset_caret() {
        let source = SourceFile::from_string("\"bad\\qescape\"\n");
        let mut diagnostic = Diagnostic::new(
            Stage::Lexer,
            "Invalid string escape",
            SourceLocation::new(1, 1, 14),
        );
        diagnostic.error_offset = 4;

        let rendered = plain(&diagnostic.render(&source));
        let marker_line = rendered.lines().nth(2).unwrap();
        assert_eq!(marker_line, "    | ~~~~^~~~~~~~~");
    }

    #[test]
    fn internal_errors_have_no_location() {
        let source = SourceFile::from_string("");
        let diagnostic = Diagnostic::internal("module verification failed");

        assert_eq!(
            plain(&diagnostic.render(&source)),
            "internal error: module verification failed\n"
        );
    }
}
