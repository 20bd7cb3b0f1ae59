//! Token vocabulary and lexer for the policy language.
//!
//! The lexer is line-aware: it emits a `Newline` token at each logical line
//! end (blank and comment-only lines collapse) and records the indentation
//! of every line, which the parser uses to delimit `raise ... if:` blocks.
//! Every token carries a [`Span`] for error localization.

use std::fmt;

use crate::error::ParseError;

/// Source position of a token or AST node within the policy text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    /// 1-based line.
    pub line: u32,
    /// 1-based column in characters.
    pub col: u32,
    /// Character offset from the start of the source.
    pub offset: usize,
    /// Length in characters.
    pub len: usize,
}

impl Span {
    #[must_use]
    pub fn new(line: u32, col: u32, offset: usize, len: usize) -> Self {
        Self {
            line,
            col,
            offset,
            len,
        }
    }

    /// Smallest span covering both operands.
    #[must_use]
    pub fn merge(self, other: Self) -> Self {
        let (first, last) = if self.offset <= other.offset {
            (self, other)
        } else {
            (other, self)
        };
        Self {
            line: first.line,
            col: first.col,
            offset: first.offset,
            len: (last.offset + last.len).saturating_sub(first.offset),
        }
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.col)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Ident(String),
    /// `"..."` with escapes resolved.
    Str(String),
    /// `r"..."` with the body kept raw.
    Regex(String),
    Number(f64),
    /// `<UPPER_SNAKE>` value classifier inside patterns.
    Classifier(String),

    // Keywords
    From,
    Import,
    Raise,
    If,
    Is,
    In,
    And,
    Or,
    Not,
    True,
    False,
    Null,

    // Punctuation
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Colon,
    Semicolon,
    Dot,
    Star,
    Assign,    // =
    Define,    // :=
    Arrow,     // ->
    Eq,        // ==
    NotEq,     // !=
    Lt,
    LtEq,
    Gt,
    GtEq,

    /// Logical end of line.
    Newline,
    /// End of input.
    Eof,
}

impl TokenKind {
    /// Short printable name for diagnostics.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Ident(name) => format!("identifier `{name}`"),
            Self::Str(_) => "string literal".to_string(),
            Self::Regex(_) => "regex literal".to_string(),
            Self::Number(_) => "number".to_string(),
            Self::Classifier(name) => format!("classifier `<{name}>`"),
            Self::From => "`from`".to_string(),
            Self::Import => "`import`".to_string(),
            Self::Raise => "`raise`".to_string(),
            Self::If => "`if`".to_string(),
            Self::Is => "`is`".to_string(),
            Self::In => "`in`".to_string(),
            Self::And => "`and`".to_string(),
            Self::Or => "`or`".to_string(),
            Self::Not => "`not`".to_string(),
            Self::True => "`True`".to_string(),
            Self::False => "`False`".to_string(),
            Self::Null => "`None`".to_string(),
            Self::LParen => "`(`".to_string(),
            Self::RParen => "`)`".to_string(),
            Self::LBracket => "`[`".to_string(),
            Self::RBracket => "`]`".to_string(),
            Self::LBrace => "`{`".to_string(),
            Self::RBrace => "`}`".to_string(),
            Self::Comma => "`,`".to_string(),
            Self::Colon => "`:`".to_string(),
            Self::Semicolon => "`;`".to_string(),
            Self::Dot => "`.`".to_string(),
            Self::Star => "`*`".to_string(),
            Self::Assign => "`=`".to_string(),
            Self::Define => "`:=`".to_string(),
            Self::Arrow => "`->`".to_string(),
            Self::Eq => "`==`".to_string(),
            Self::NotEq => "`!=`".to_string(),
            Self::Lt => "`<`".to_string(),
            Self::LtEq => "`<=`".to_string(),
            Self::Gt => "`>`".to_string(),
            Self::GtEq => "`>=`".to_string(),
            Self::Newline => "end of line".to_string(),
            Self::Eof => "end of input".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
    /// Indentation (in characters) of the line this token starts.
    pub indent: u32,
}

fn keyword(ident: &str) -> Option<TokenKind> {
    Some(match ident {
        "from" => TokenKind::From,
        "import" => TokenKind::Import,
        "raise" => TokenKind::Raise,
        "if" => TokenKind::If,
        "is" => TokenKind::Is,
        "in" => TokenKind::In,
        "and" => TokenKind::And,
        "or" => TokenKind::Or,
        "not" => TokenKind::Not,
        "True" | "true" => TokenKind::True,
        "False" | "false" => TokenKind::False,
        "None" | "null" => TokenKind::Null,
        _ => return None,
    })
}

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: u32,
    col: u32,
    indent: u32,
    tokens: Vec<Token>,
}

/// Tokenize a policy source. Comments (`#`) run to end of line; blank and
/// comment-only lines produce no tokens.
pub fn tokenize(source: &str) -> Result<Vec<Token>, ParseError> {
    let mut lexer = Lexer {
        chars: source.chars().collect(),
        pos: 0,
        line: 1,
        col: 1,
        indent: 0,
        tokens: Vec::new(),
    };
    lexer.run()?;
    Ok(lexer.tokens)
}

impl Lexer {
    fn run(&mut self) -> Result<(), ParseError> {
        self.measure_indent();
        while let Some(ch) = self.peek() {
            match ch {
                ' ' | '\t' | '\r' => {
                    self.bump();
                }
                '\n' => {
                    self.newline();
                }
                '#' => {
                    while self.peek().is_some_and(|c| c != '\n') {
                        self.bump();
                    }
                }
                '"' => self.string()?,
                'r' if self.peek_at(1) == Some('"') => {
                    self.bump();
                    self.regex()?;
                }
                c if c.is_alphabetic() || c == '_' => self.ident(),
                c if c.is_ascii_digit() => self.number()?,
                '-' if self.peek_at(1) == Some('>') => {
                    self.punct(TokenKind::Arrow, 2);
                }
                '-' if self.peek_at(1).is_some_and(|c| c.is_ascii_digit()) => self.number()?,
                '<' => self.angle()?,
                _ => self.operator()?,
            }
        }
        self.flush_newline();
        let span = Span::new(self.line, self.col, self.pos, 0);
        self.push(TokenKind::Eof, span);
        Ok(())
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, ahead: usize) -> Option<char> {
        self.chars.get(self.pos + ahead).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let ch = self.peek()?;
        self.pos += 1;
        self.col += 1;
        Some(ch)
    }

    fn push(&mut self, kind: TokenKind, span: Span) {
        self.tokens.push(Token {
            kind,
            span,
            indent: self.indent,
        });
    }

    fn span_from(&self, start_pos: usize, start_col: u32) -> Span {
        Span::new(self.line, start_col, start_pos, self.pos - start_pos)
    }

    fn newline(&mut self) {
        self.flush_newline();
        self.bump();
        self.line += 1;
        self.col = 1;
        self.measure_indent();
    }

    /// Emit a `Newline` only when the line carried tokens.
    fn flush_newline(&mut self) {
        if matches!(
            self.tokens.last().map(|t| &t.kind),
            Some(TokenKind::Newline) | None
        ) {
            return;
        }
        let span = Span::new(self.line, self.col, self.pos, 0);
        self.push(TokenKind::Newline, span);
    }

    fn measure_indent(&mut self) {
        let mut indent = 0;
        let mut ahead = 0;
        while let Some(ch) = self.peek_at(ahead) {
            match ch {
                ' ' => indent += 1,
                '\t' => indent += 8,
                _ => break,
            }
            ahead += 1;
        }
        self.indent = indent;
    }

    fn ident(&mut self) {
        let start_pos = self.pos;
        let start_col = self.col;
        while self
            .peek()
            .is_some_and(|c| c.is_alphanumeric() || c == '_')
        {
            self.bump();
        }
        let text: String = self.chars[start_pos..self.pos].iter().collect();
        let span = self.span_from(start_pos, start_col);
        let kind = keyword(&text).unwrap_or(TokenKind::Ident(text));
        self.push(kind, span);
    }

    fn number(&mut self) -> Result<(), ParseError> {
        let start_pos = self.pos;
        let start_col = self.col;
        if self.peek() == Some('-') {
            self.bump();
        }
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.bump();
        }
        if self.peek() == Some('.') && self.peek_at(1).is_some_and(|c| c.is_ascii_digit()) {
            self.bump();
            while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                self.bump();
            }
        }
        let text: String = self.chars[start_pos..self.pos].iter().collect();
        let span = self.span_from(start_pos, start_col);
        let value: f64 = text.parse().map_err(|_| ParseError {
            line: span.line,
            col: span.col,
            message: format!("invalid number literal `{text}`"),
        })?;
        self.push(TokenKind::Number(value), span);
        Ok(())
    }

    fn string(&mut self) -> Result<(), ParseError> {
        let start_pos = self.pos;
        let start_col = self.col;
        self.bump(); // opening quote
        let mut value = String::new();
        loop {
            match self.bump() {
                Some('"') => break,
                Some('\\') => match self.bump() {
                    Some('n') => value.push('\n'),
                    Some('t') => value.push('\t'),
                    Some('\\') => value.push('\\'),
                    Some('"') => value.push('"'),
                    Some(other) => {
                        value.push('\\');
                        value.push(other);
                    }
                    None => return Err(self.unterminated(start_col, "string")),
                },
                Some('\n') | None => return Err(self.unterminated(start_col, "string")),
                Some(ch) => value.push(ch),
            }
        }
        let span = self.span_from(start_pos, start_col);
        self.push(TokenKind::Str(value), span);
        Ok(())
    }

    /// Body of `r"..."`; backslashes pass through untouched so regex escapes
    /// survive. Only `\"` is special, to allow quotes inside the pattern.
    fn regex(&mut self) -> Result<(), ParseError> {
        let start_pos = self.pos - 1; // include the `r`
        let start_col = self.col - 1;
        self.bump(); // opening quote
        let mut value = String::new();
        loop {
            match self.bump() {
                Some('"') => break,
                Some('\\') if self.peek() == Some('"') => {
                    self.bump();
                    value.push('"');
                }
                Some('\\') => value.push('\\'),
                Some('\n') | None => return Err(self.unterminated(start_col, "regex")),
                Some(ch) => value.push(ch),
            }
        }
        let span = self.span_from(start_pos, start_col);
        self.push(TokenKind::Regex(value), span);
        Ok(())
    }

    /// `<` starts either a comparison or a `<CLASSIFIER>`.
    fn angle(&mut self) -> Result<(), ParseError> {
        let mut ahead = 1;
        while self
            .peek_at(ahead)
            .is_some_and(|c| c.is_ascii_uppercase() || c == '_')
        {
            ahead += 1;
        }
        if ahead > 1 && self.peek_at(ahead) == Some('>') {
            let start_pos = self.pos;
            let start_col = self.col;
            self.bump(); // <
            let name: String = self.chars[self.pos..self.pos + ahead - 1].iter().collect();
            for _ in 0..ahead {
                self.bump(); // name + >
            }
            let span = self.span_from(start_pos, start_col);
            self.push(TokenKind::Classifier(name), span);
            return Ok(());
        }
        self.operator()
    }

    fn operator(&mut self) -> Result<(), ParseError> {
        let ch = self.peek().unwrap_or_default();
        let next = self.peek_at(1);
        let (kind, len) = match (ch, next) {
            (':', Some('=')) => (TokenKind::Define, 2),
            ('=', Some('=')) => (TokenKind::Eq, 2),
            ('!', Some('=')) => (TokenKind::NotEq, 2),
            ('<', Some('=')) => (TokenKind::LtEq, 2),
            ('>', Some('=')) => (TokenKind::GtEq, 2),
            ('(', _) => (TokenKind::LParen, 1),
            (')', _) => (TokenKind::RParen, 1),
            ('[', _) => (TokenKind::LBracket, 1),
            (']', _) => (TokenKind::RBracket, 1),
            ('{', _) => (TokenKind::LBrace, 1),
            ('}', _) => (TokenKind::RBrace, 1),
            (',', _) => (TokenKind::Comma, 1),
            (':', _) => (TokenKind::Colon, 1),
            (';', _) => (TokenKind::Semicolon, 1),
            ('.', _) => (TokenKind::Dot, 1),
            ('*', _) => (TokenKind::Star, 1),
            ('=', _) => (TokenKind::Assign, 1),
            ('<', _) => (TokenKind::Lt, 1),
            ('>', _) => (TokenKind::Gt, 1),
            _ => {
                return Err(ParseError {
                    line: self.line,
                    col: self.col,
                    message: format!("unexpected character `{ch}`"),
                });
            }
        };
        self.punct(kind, len);
        Ok(())
    }

    fn punct(&mut self, kind: TokenKind, len: usize) {
        let start_pos = self.pos;
        let start_col = self.col;
        for _ in 0..len {
            self.bump();
        }
        let span = self.span_from(start_pos, start_col);
        self.push(kind, span);
    }

    fn unterminated(&self, col: u32, what: &str) -> ParseError {
        ParseError {
            line: self.line,
            col,
            message: format!("unterminated {what} literal"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        tokenize(source).unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn lexes_rule_header() {
        let tokens = kinds("raise \"X\" if:\n");
        assert_eq!(
            tokens,
            vec![
                TokenKind::Raise,
                TokenKind::Str("X".to_string()),
                TokenKind::If,
                TokenKind::Colon,
                TokenKind::Newline,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn lexes_arrow_and_define() {
        let tokens = kinds("a -> b := c");
        assert!(tokens.contains(&TokenKind::Arrow));
        assert!(tokens.contains(&TokenKind::Define));
    }

    #[test]
    fn regex_literal_keeps_backslashes() {
        let tokens = kinds(r#"r"^\d+$""#);
        assert_eq!(tokens[0], TokenKind::Regex(r"^\d+$".to_string()));
    }

    #[test]
    fn classifier_is_distinguished_from_comparison() {
        let tokens = kinds("<EMAIL_ADDRESS> a < b");
        assert_eq!(tokens[0], TokenKind::Classifier("EMAIL_ADDRESS".to_string()));
        assert!(tokens.contains(&TokenKind::Lt));
    }

    #[test]
    fn comments_and_blank_lines_vanish() {
        let tokens = kinds("# comment only\n\nx\n# trailing\n");
        assert_eq!(
            tokens,
            vec![
                TokenKind::Ident("x".to_string()),
                TokenKind::Newline,
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn indent_is_recorded_per_line() {
        let tokens = tokenize("raise \"X\" if:\n    a is tool:send\n").unwrap();
        let atom = tokens
            .iter()
            .find(|t| matches!(&t.kind, TokenKind::Ident(name) if name == "a"))
            .unwrap();
        assert_eq!(atom.indent, 4);
        assert_eq!(tokens[0].indent, 0);
    }

    #[test]
    fn negative_number_lexes() {
        let tokens = kinds("-3.5");
        assert_eq!(tokens[0], TokenKind::Number(-3.5));
    }

    #[test]
    fn unterminated_string_reports_position() {
        let err = tokenize("\"oops").unwrap_err();
        assert_eq!(err.line, 1);
        assert!(err.message.contains("unterminated"));
    }
}
