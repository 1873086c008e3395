use std::str::Chars;

use itertools::{peek_nth, PeekNth};
use strum::EnumString;

use crate::frontend::SourceFile;

const OPERATOR_CHARS: &str = "+-*/%=&|^!<>?.";
const PUNCTUATION_CHARS: &str = "(){}[],;:";

/// A position within a source file. All fields are 1-based; zero means the
/// position is unknown. `end_column` is exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceLocation {
    pub line: usize,
    pub column: usize,
    pub end_column: usize,
}

impl SourceLocation {
    pub const UNKNOWN: Self = Self {
        line: 0,
        column: 0,
        end_column: 0,
    };

    pub fn new(line: usize, column: usize, end_column: usize) -> Self {
        Self {
            line,
            column,
            end_column,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    /// Raw lexeme text for most tokens, the decoded contents for strings, and
    /// the error message for error tokens.
    pub text: String,
    pub location: SourceLocation,
    /// For error tokens: column offset within the span of the exact offending
    /// character (zero when the whole span is at fault).
    pub error_offset: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Integer,
    Float,
    String,
    Identifier,
    Keyword(Keyword),
    Operator,
    Punctuation,
    Comment,
    EndOfFile,
    Error,
}

impl core::fmt::Display for TokenKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Integer => "Integer",
            Self::Float => "Float",
            Self::String => "String",
            Self::Identifier => "Identifier",
            Self::Keyword(_) => "Keyword",
            Self::Operator => "Operator",
            Self::Punctuation => "Punctuation",
            Self::Comment => "Comment",
            Self::EndOfFile => "EndOfFile",
            Self::Error => "Error",
        };

        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum Keyword {
    Let,
    Func,
    If,
    Else,
    Return,
    While,
    True,
    False,
    Operator,
    Prefix,
    Postfix,
    Infix,
    Prec,
    AssocLeft,
    AssocRight,
}

#[derive(Debug)]
pub struct Lexer<'source> {
    source: &'source SourceFile,
    chars: PeekNth<Chars<'source>>,
    position: usize,
    line: usize,
    column: usize,
}

impl<'source> Lexer<'source> {
    pub fn new(source: &'source SourceFile) -> Self {
        Self {
            source,
            chars: peek_nth(source.contents.chars()),
            position: 0,
            line: 1,
            column: 1,
        }
    }

    /// Scans the entire source. The returned stream always ends with an
    /// `EndOfFile` token; error tokens do not stop the scan.
    pub fn tokenize_all(source: &'source SourceFile) -> Vec<Token> {
        let mut lexer = Self::new(source);
        let mut tokens = Vec::new();

        loop {
            let token = lexer.next_token();
            let done = token.kind == TokenKind::EndOfFile;
            tokens.push(token);

            if done {
                break;
            }
        }

        tokens
    }

    pub fn next_token(&mut self) -> Token {
        self.skip_whitespace();

        let Some(c) = self.peek() else {
            return Token {
                kind: TokenKind::EndOfFile,
                text: String::new(),
                location: SourceLocation::new(self.line, self.column, self.column),
                error_offset: 0,
            };
        };

        if c.is_ascii_digit() {
            return self.lex_number();
        }
        if c.is_ascii_alphabetic() || c == '_' {
            return self.lex_word();
        }
        if c == '"' {
            return self.lex_string();
        }
        if c == '#' {
            return self.lex_comment();
        }
        if OPERATOR_CHARS.contains(c) {
            return self.lex_operator();
        }
        if PUNCTUATION_CHARS.contains(c) {
            return self.lex_punctuation();
        }

        // Unknown character; consume it and keep scanning.
        let line = self.line;
        let column = self.column;
        self.advance();

        Token {
            kind: TokenKind::Error,
            text: format!("Unexpected character: {c}"),
            location: SourceLocation::new(line, column, self.column),
            error_offset: 0,
        }
    }

    fn peek(&mut self) -> Option<char> {
        self.chars.peek().copied()
    }

    fn peek_nth(&mut self, n: usize) -> Option<char> {
        self.chars.peek_nth(n).copied()
    }

    fn advance(&mut self) -> Option<char> {
        let c = self.chars.next()?;

        self.position += c.len_utf8();
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }

        Some(c)
    }

    fn skip_whitespace(&mut self) {
        while let Some(c) = self.peek() {
            if !matches!(c, ' ' | '\t' | '\r' | '\n') {
                break;
            }

            self.advance();
        }
    }

    fn slice_from(&self, start_position: usize) -> &'source str {
        &self.source.contents[start_position..self.position]
    }

    /// Digit-first numbers. A decimal point or an exponent turns the token
    /// into a float; `123abc` stays an integer followed by an identifier.
    fn lex_number(&mut self) -> Token {
        let start_position = self.position;
        let line = self.line;
        let column = self.column;

        let mut saw_dot = false;
        let mut saw_exponent = false;

        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                self.advance();
                continue;
            }

            if c == '.' && !saw_dot && !saw_exponent {
                saw_dot = true;
                self.advance();
                continue;
            }

            if (c == 'e' || c == 'E') && !saw_exponent {
                // Only commit to the exponent if digits actually follow it
                let consumed_sign = match self.peek_nth(1) {
                    Some(d) if d.is_ascii_digit() => false,
                    Some('+') | Some('-')
                        if self.peek_nth(2).is_some_and(|d| d.is_ascii_digit()) =>
                    {
                        true
                    }
                    _ => break,
                };

                saw_exponent = true;
                self.advance();
                if consumed_sign {
                    self.advance();
                }
                continue;
            }

            break;
        }

        Token {
            kind: if saw_dot || saw_exponent {
                TokenKind::Float
            } else {
                TokenKind::Integer
            },
            text: self.slice_from(start_position).to_owned(),
            location: SourceLocation::new(line, column, self.column),
            error_offset: 0,
        }
    }

    // Keyword or identifier
    fn lex_word(&mut self) -> Token {
        let start_position = self.position;
        let line = self.line;
        let column = self.column;

        while let Some(c) = self.peek() {
            if !(c.is_ascii_alphanumeric() || c == '_') {
                break;
            }

            self.advance();
        }

        let text = self.slice_from(start_position);
        let kind = match text.parse::<Keyword>() {
            Ok(keyword) => TokenKind::Keyword(keyword),
            Err(_) => TokenKind::Identifier,
        };

        Token {
            kind,
            text: text.to_owned(),
            location: SourceLocation::new(line, column, self.column),
            error_offset: 0,
        }
    }

    fn lex_string(&mut self) -> Token {
        let line = self.line;
        let column = self.column;

        self.advance(); // opening quote
        let content_start = self.position;

        let mut terminated = false;
        loop {
            let Some(c) = self.advance() else {
                break;
            };

            if c == '\\' {
                // The escaped character is part of the literal no matter what
                // it is; validity is checked during decoding below.
                self.advance();
                continue;
            }

            if c == '"' {
                terminated = true;
                break;
            }

            if c == '\n' {
                return Token {
                    kind: TokenKind::Error,
                    text: "Unterminated string literal".to_owned(),
                    location: SourceLocation::new(line, column, self.column),
                    error_offset: 0,
                };
            }
        }

        if !terminated {
            return Token {
                kind: TokenKind::Error,
                text: "Unterminated string literal".to_owned(),
                location: SourceLocation::new(line, column, self.column),
                error_offset: 0,
            };
        }

        let raw = &self.source.contents[content_start..self.position - 1];

        match decode_string(raw) {
            Ok(decoded) => Token {
                kind: TokenKind::String,
                text: decoded,
                location: SourceLocation::new(line, column, self.column),
                error_offset: 0,
            },
            Err(backslash_offset) => Token {
                kind: TokenKind::Error,
                text: "Invalid string escape".to_owned(),
                location: SourceLocation::new(line, column, self.column),
                // +1 for the opening quote
                error_offset: backslash_offset + 1,
            },
        }
    }

    // Greedy maximal munch: `<<=` is one token, as is any user-invented run
    fn lex_operator(&mut self) -> Token {
        let start_position = self.position;
        let line = self.line;
        let column = self.column;

        while let Some(c) = self.peek() {
            if !OPERATOR_CHARS.contains(c) {
                break;
            }

            self.advance();
        }

        Token {
            kind: TokenKind::Operator,
            text: self.slice_from(start_position).to_owned(),
            location: SourceLocation::new(line, column, self.column),
            error_offset: 0,
        }
    }

    fn lex_punctuation(&mut self) -> Token {
        let line = self.line;
        let column = self.column;
        let c = self.advance().expect("caller checked for punctuation");

        Token {
            kind: TokenKind::Punctuation,
            text: c.to_string(),
            location: SourceLocation::new(line, column, self.column),
            error_offset: 0,
        }
    }

    /// `#` to end of line. Comments are emitted as tokens so the driver can
    /// dump them; the parser skips them transparently.
    fn lex_comment(&mut self) -> Token {
        let line = self.line;
        let column = self.column;

        self.advance(); // consume '#'
        let content_start = self.position;

        while let Some(c) = self.peek() {
            if c == '\n' {
                break;
            }

            self.advance();
        }

        let text = self.slice_from(content_start).to_owned();
        let end_column = self.column;

        if self.peek() == Some('\n') {
            self.advance();
        }

        Token {
            kind: TokenKind::Comment,
            text,
            location: SourceLocation::new(line, column, end_column),
            error_offset: 0,
        }
    }
}

/// Resolves the escape sequences of a string literal body. On an unknown
/// escape, returns the character offset of the offending backslash.
fn decode_string(raw: &str) -> Result<String, usize> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    let mut offset = 0usize;

    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            offset += 1;
            continue;
        }

        let Some(escaped) = chars.next() else {
            return Err(offset);
        };

        match escaped {
            '\\' | '"' | '\'' => out.push(escaped),
            'n' => out.push('\n'),
            't' => out.push('\t'),
            'r' => out.push('\r'),
            'b' => out.push('\u{8}'),
            'f' => out.push('\u{c}'),
            '0' => out.push('\0'),
            _ => return Err(offset),
        }

        offset += 2;
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn lex(source: &str) -> Vec<Token> {
        let file = SourceFile::from_string(source);
        Lexer::tokenize_all(&file)
    }

    fn kinds(source: &str) -> Vec<TokenKind> {
        lex(source).into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn ends_with_eof() {
        let tokens = lex("");
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].kind, TokenKind::EndOfFile);
        assert_eq!(tokens[0].location, SourceLocation::new(1, 1, 1));
    }

    #[test]
    fn numbers() {
        let tokens = lex("42 3.14 1e10 2.5e-3 123abc 7e");

        assert_eq!(tokens[0].kind, TokenKind::Integer);
        assert_eq!(tokens[0].text, "42");
        assert_eq!(tokens[1].kind, TokenKind::Float);
        assert_eq!(tokens[1].text, "3.14");
        assert_eq!(tokens[2].kind, TokenKind::Float);
        assert_eq!(tokens[2].text, "1e10");
        assert_eq!(tokens[3].kind, TokenKind::Float);
        assert_eq!(tokens[3].text, "2.5e-3");

        // Digit-first rule: `123abc` is an integer then an identifier
        assert_eq!(tokens[4].kind, TokenKind::Integer);
        assert_eq!(tokens[4].text, "123");
        assert_eq!(tokens[5].kind, TokenKind::Identifier);
        assert_eq!(tokens[5].text, "abc");

        // A bare `e` with no digits does not start an exponent
        assert_eq!(tokens[6].kind, TokenKind::Integer);
        assert_eq!(tokens[6].text, "7");
        assert_eq!(tokens[7].kind, TokenKind::Identifier);
        assert_eq!(tokens[7].text, "e");
    }

    #[test]
    fn keywords_and_identifiers() {
        let tokens = lex("let while assoc_left foo _bar");

        assert_eq!(tokens[0].kind, TokenKind::Keyword(Keyword::Let));
        assert_eq!(tokens[1].kind, TokenKind::Keyword(Keyword::While));
        assert_eq!(tokens[2].kind, TokenKind::Keyword(Keyword::AssocLeft));
        assert_eq!(tokens[3].kind, TokenKind::Identifier);
        assert_eq!(tokens[4].kind, TokenKind::Identifier);
    }

    #[test]
    fn operators_use_maximal_munch() {
        let tokens = lex("a <= b ** c->d");

        assert_eq!(tokens[1].text, "<=");
        assert_eq!(tokens[3].text, "**");
        assert_eq!(tokens[5].text, "->");
    }

    #[test]
    fn consecutive_operator_chars_are_one_token() {
        let tokens = lex("x+=-1");

        assert_eq!(tokens[0].kind, TokenKind::Identifier);
        assert_eq!(tokens[1].kind, TokenKind::Operator);
        assert_eq!(tokens[1].text, "+=-");
        assert_eq!(tokens[2].kind, TokenKind::Integer);
    }

    #[test]
    fn string_escapes_decode() {
        let tokens = lex(r#""a\tb\n\"q\" \\" "#);

        assert_eq!(tokens[0].kind, TokenKind::String);
        assert_eq!(tokens[0].text, "a\tb\n\"q\" \\");
    }

    #[test]
    fn invalid_escape_points_at_backslash() {
        let tokens = lex(r#""bad\qescape""#);

        assert_eq!(tokens[0].kind, TokenKind::Error);
        assert_eq!(tokens[0].text, "Invalid string escape");
        // column 1 is the quote, columns 2-4 are `bad`, column 5 the backslash
        assert_eq!(tokens[0].location.column, 1);
        assert_eq!(tokens[0].error_offset, 4);
    }

    #[test]
    fn newline_in_string_is_an_error() {
        let tokens = lex("\"abc\ndef\"");

        assert_eq!(tokens[0].kind, TokenKind::Error);
        assert_eq!(tokens[0].text, "Unterminated string literal");
    }

    #[test]
    fn escaped_quote_does_not_terminate() {
        // `\\"` is an escaped backslash followed by the closing quote
        let tokens = lex(r#""x\\""#);

        assert_eq!(tokens[0].kind, TokenKind::String);
        assert_eq!(tokens[0].text, "x\\");
        assert_eq!(tokens[1].kind, TokenKind::EndOfFile);
    }

    #[test]
    fn comments_are_tokens() {
        let tokens = lex("1 # trailing\n2");

        assert_eq!(tokens[0].kind, TokenKind::Integer);
        assert_eq!(tokens[1].kind, TokenKind::Comment);
        assert_eq!(tokens[1].text, " trailing");
        assert_eq!(tokens[2].kind, TokenKind::Integer);
        assert_eq!(tokens[2].location.line, 2);
    }

    #[test]
    fn errors_do_not_stop_the_scan() {
        let tokens = lex("1 @ 2 ` 3");

        assert_eq!(
            kinds("1 @ 2 ` 3"),
            vec![
                TokenKind::Integer,
                TokenKind::Error,
                TokenKind::Integer,
                TokenKind::Error,
                TokenKind::Integer,
                TokenKind::EndOfFile,
            ]
        );
        assert_eq!(tokens[1].text, "Unexpected character: @");
    }

    #[test]
    fn positions_are_monotonic() {
        let source = "let x = 1 + 2; # c\nfunc f(a: i32): i32;";
        let tokens = lex(source);

        let mut last = (0usize, 0usize);
        for token in &tokens {
            let at = (token.location.line, token.location.column);
            assert!(at >= last, "token {token:?} went backwards");
            last = at;
        }
    }

    #[test]
    fn punctuation_and_columns() {
        let tokens = lex("f(x);");

        assert_eq!(tokens[0].location, SourceLocation::new(1, 1, 2));
        assert_eq!(tokens[1].text, "(");
        assert_eq!(tokens[1].location, SourceLocation::new(1, 2, 3));
        assert_eq!(tokens[3].text, ")");
        assert_eq!(tokens[4].text, ";");
        assert_eq!(tokens[4].location, SourceLocation::new(1, 5, 6));
    }
}
