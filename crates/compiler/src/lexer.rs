//! Lexer
//!
//! Scans a source buffer into tokens on demand. The parser keeps one
//! token of lookahead (`previous`, `current`, `next`); the lexer itself
//! is a plain cursor with no global state.
//!
//! Skipped between tokens: whitespace, `//` line comments, and nestable
//! block comments in either `/- ... -/` or `/* ... */` form. Numeric
//! literals accept decimal, hexadecimal (`0x`), octal (`0o`/`0q`),
//! underscores as digit separators, and exponents. Strings use `"` or
//! `'`; an unterminated string yields an error token.

use crate::token::{Token, TokenKind};

pub struct Lexer<'src> {
    source: &'src str,
    start: usize,
    current: usize,
    line: i32,
}

impl<'src> Lexer<'src> {
    pub fn new(source: &'src str) -> Self {
        Lexer {
            source,
            start: 0,
            current: 0,
            line: 1,
        }
    }

    fn at_end(&self) -> bool {
        self.current >= self.source.len()
    }

    fn peek(&self) -> u8 {
        self.source.as_bytes().get(self.current).copied().unwrap_or(0)
    }

    fn peek_next(&self) -> u8 {
        self.source
            .as_bytes()
            .get(self.current + 1)
            .copied()
            .unwrap_or(0)
    }

    fn advance(&mut self) -> u8 {
        let c = self.peek();
        self.current += 1;
        c
    }

    fn matches(&mut self, expected: u8) -> bool {
        if self.peek() != expected {
            return false;
        }
        self.current += 1;
        true
    }

    fn make_token(&self, kind: TokenKind) -> Token<'src> {
        Token {
            kind,
            lexeme: &self.source[self.start..self.current],
            line: self.line,
        }
    }

    fn error_token(&self, message: &'static str) -> Token<'src> {
        Token {
            kind: TokenKind::Error,
            lexeme: message,
            line: self.line,
        }
    }

    fn skip_whitespace(&mut self) {
        loop {
            match self.peek() {
                b' ' | b'\r' | b'\t' => {
                    self.advance();
                }
                b'\n' => {
                    self.line += 1;
                    self.advance();
                }
                b'/' => {
                    if self.peek_next() == b'/' {
                        while self.peek() != b'\n' && !self.at_end() {
                            self.advance();
                        }
                    } else if self.peek_next() == b'-' || self.peek_next() == b'*' {
                        self.block_comment();
                    } else {
                        return;
                    }
                }
                _ => return,
            }
        }
    }

    // Block comments nest: `/- a /- b -/ c -/` is one comment.
    fn block_comment(&mut self) {
        self.advance(); // /
        self.advance(); // - or *
        let mut level = 1;
        while !self.at_end() && level > 0 {
            let c = self.peek();
            if c == b'\n' {
                self.line += 1;
                self.advance();
            } else if c == b'/' && (self.peek_next() == b'-' || self.peek_next() == b'*') {
                level += 1;
                self.advance();
                self.advance();
            } else if (c == b'-' || c == b'*') && self.peek_next() == b'/' {
                level -= 1;
                self.advance();
                self.advance();
            } else {
                self.advance();
            }
        }
    }

    fn check_keyword(
        &self,
        offset: usize,
        rest: &str,
        kind: TokenKind,
    ) -> TokenKind {
        let lexeme = &self.source[self.start..self.current];
        if lexeme.len() == offset + rest.len() && &lexeme[offset..] == rest {
            return kind;
        }
        TokenKind::Ident
    }

    // Keyword recognition dispatches on the first one or two characters;
    // the exact-length check in check_keyword keeps keyword-prefixed
    // identifiers (`falsey`, `classic`) as plain identifiers.
    fn ident_kind(&mut self) -> TokenKind {
        let lexeme = self.source[self.start..self.current].as_bytes();
        match lexeme[0] {
            b'a' if lexeme.len() > 1 => match lexeme[1] {
                b'b' => self.check_keyword(2, "stract", TokenKind::Abstract),
                b'n' => self.check_keyword(2, "d", TokenKind::And),
                b's' => {
                    if lexeme.len() > 2 && lexeme[2] == b's' {
                        self.check_keyword(2, "sert", TokenKind::Assert)
                    } else {
                        self.check_keyword(2, "", TokenKind::As)
                    }
                }
                _ => TokenKind::Ident,
            },
            b'b' => self.check_keyword(1, "reak", TokenKind::Break),
            b'c' if lexeme.len() > 1 => match lexeme[1] {
                b'a' => self.check_keyword(2, "se", TokenKind::Case),
                b'l' => self.check_keyword(2, "ass", TokenKind::Class),
                b'o' => {
                    let kind = self.check_keyword(2, "nst", TokenKind::Const);
                    if kind == TokenKind::Ident {
                        self.check_keyword(2, "ntinue", TokenKind::Continue)
                    } else {
                        kind
                    }
                }
                _ => TokenKind::Ident,
            },
            b'd' if lexeme.len() > 1 => match lexeme[1] {
                b'e' => self.check_keyword(2, "fault", TokenKind::Default),
                b'o' => self.check_keyword(2, "", TokenKind::Do),
                _ => TokenKind::Ident,
            },
            b'e' if lexeme.len() > 1 => match lexeme[1] {
                b'l' if lexeme.len() > 2 => match lexeme[2] {
                    b'i' => self.check_keyword(3, "f", TokenKind::Elif),
                    b's' => self.check_keyword(3, "e", TokenKind::Else),
                    _ => TokenKind::Ident,
                },
                b'n' => self.check_keyword(2, "um", TokenKind::Enum),
                _ => TokenKind::Ident,
            },
            b'f' if lexeme.len() > 1 => match lexeme[1] {
                b'a' => self.check_keyword(2, "lse", TokenKind::False),
                b'n' => self.check_keyword(2, "", TokenKind::Fn),
                b'o' => self.check_keyword(2, "r", TokenKind::For),
                b'r' => self.check_keyword(2, "om", TokenKind::From),
                _ => TokenKind::Ident,
            },
            b'i' if lexeme.len() > 1 => match lexeme[1] {
                b'f' => self.check_keyword(2, "", TokenKind::If),
                b'n' => self.check_keyword(2, "herits", TokenKind::Inherits),
                _ => TokenKind::Ident,
            },
            b'n' => self.check_keyword(1, "ull", TokenKind::Null),
            b'o' => self.check_keyword(1, "r", TokenKind::Or),
            b'p' if lexeme.len() > 1 => match lexeme[1] {
                b'a' => {
                    // `panic` is only a keyword in its call form `panic!`.
                    if self.check_keyword(2, "nic", TokenKind::Panic) == TokenKind::Panic
                        && self.matches(b'!')
                    {
                        TokenKind::Panic
                    } else {
                        TokenKind::Ident
                    }
                }
                b'r' => self.check_keyword(2, "ivate", TokenKind::Private),
                b'u' => self.check_keyword(2, "blic", TokenKind::Public),
                _ => TokenKind::Ident,
            },
            b'r' => self.check_keyword(1, "eturn", TokenKind::Return),
            b's' if lexeme.len() > 1 => match lexeme[1] {
                b'u' => self.check_keyword(2, "per", TokenKind::Super),
                b'w' => self.check_keyword(2, "itch", TokenKind::Switch),
                b't' => self.check_keyword(2, "atic", TokenKind::Static),
                _ => TokenKind::Ident,
            },
            b't' if lexeme.len() > 1 => match lexeme[1] {
                b'h' => self.check_keyword(2, "is", TokenKind::This),
                b'r' => self.check_keyword(2, "ue", TokenKind::True),
                _ => TokenKind::Ident,
            },
            b'u' => self.check_keyword(1, "se", TokenKind::Use),
            b'v' => self.check_keyword(1, "ar", TokenKind::Var),
            b'w' if lexeme.len() > 1 => match lexeme[1] {
                b'h' => self.check_keyword(2, "ile", TokenKind::While),
                b'i' => self.check_keyword(2, "thFile", TokenKind::WithFile),
                _ => TokenKind::Ident,
            },
            _ => TokenKind::Ident,
        }
    }

    fn ident(&mut self) -> Token<'src> {
        while is_alpha_numeric(self.peek()) {
            self.advance();
        }
        let kind = self.ident_kind();
        self.make_token(kind)
    }

    fn string(&mut self, quote: u8) -> Token<'src> {
        loop {
            if self.at_end() {
                return self.error_token("Unterminated string.");
            }
            let c = self.peek();
            if c == quote {
                break;
            }
            if c == b'\\' && self.peek_next() == quote {
                self.advance(); // escape, keep the quote in the lexeme
            } else if c == b'\n' {
                self.line += 1;
            }
            self.advance();
        }

        self.advance(); // closing quote
        self.make_token(TokenKind::String)
    }

    fn exponent(&mut self) -> Token<'src> {
        self.advance(); // e/E
        while self.peek() == b'_' {
            self.advance();
        }
        if self.peek() == b'-' || self.peek() == b'+' {
            self.advance();
        }
        if !self.peek().is_ascii_digit() && self.peek() != b'_' {
            return self.error_token("Invalid exponent literal.");
        }
        while self.peek().is_ascii_digit() || self.peek() == b'_' {
            self.advance();
        }
        self.make_token(TokenKind::Number)
    }

    fn number(&mut self) -> Token<'src> {
        while self.peek().is_ascii_digit() || self.peek() == b'_' {
            self.advance();
        }

        if self.peek() == b'e' || self.peek() == b'E' {
            return self.exponent();
        }

        if self.peek() == b'.' && self.peek_next().is_ascii_digit() {
            self.advance();
            while self.peek().is_ascii_digit() || self.peek() == b'_' {
                self.advance();
            }
            if self.peek() == b'e' || self.peek() == b'E' {
                return self.exponent();
            }
        }

        self.make_token(TokenKind::Number)
    }

    // `0x`/`0o`/`0q` prefixed literals; anything else falls back to the
    // decimal scanner.
    fn prefixed_number(&mut self) -> Token<'src> {
        match self.peek() {
            b'x' | b'X' => {
                self.advance();
                if !is_hex_digit(self.peek()) {
                    return self.error_token("Invalid hex literal.");
                }
                while is_hex_digit(self.peek()) {
                    self.advance();
                }
                self.make_token(TokenKind::Number)
            }
            b'o' | b'O' | b'q' | b'Q' => {
                self.advance();
                if !is_oct_digit(self.peek()) {
                    return self.error_token("Invalid octal literal.");
                }
                while is_oct_digit(self.peek()) {
                    self.advance();
                }
                self.make_token(TokenKind::Number)
            }
            _ => self.number(),
        }
    }

    pub fn next_token(&mut self) -> Token<'src> {
        self.skip_whitespace();
        self.start = self.current;

        if self.at_end() {
            return self.make_token(TokenKind::Eof);
        }

        let c = self.advance();
        if is_alpha(c) {
            return self.ident();
        }
        if c.is_ascii_digit() {
            if c == b'0' {
                return self.prefixed_number();
            }
            return self.number();
        }

        match c {
            b'$' => self.ident(),
            b'(' => self.make_token(TokenKind::LParen),
            b')' => self.make_token(TokenKind::RParen),
            b'{' => self.make_token(TokenKind::LBrace),
            b'}' => self.make_token(TokenKind::RBrace),
            b'[' => self.make_token(TokenKind::LBracket),
            b']' => self.make_token(TokenKind::RBracket),
            b';' => self.make_token(TokenKind::Semicolon),
            b',' => self.make_token(TokenKind::Comma),
            b'.' => {
                let kind = if self.matches(b'.') {
                    TokenKind::DotDot
                } else {
                    TokenKind::Dot
                };
                self.make_token(kind)
            }
            b'-' => {
                if self.matches(b'-') {
                    self.make_token(TokenKind::Dec)
                } else if self.matches(b'=') {
                    self.make_token(TokenKind::MinusEq)
                } else if self.matches(b'>') {
                    self.make_token(TokenKind::Arrow)
                } else {
                    self.make_token(TokenKind::Minus)
                }
            }
            b'+' => {
                if self.matches(b'+') {
                    self.make_token(TokenKind::Inc)
                } else if self.matches(b'=') {
                    self.make_token(TokenKind::PlusEq)
                } else {
                    self.make_token(TokenKind::Plus)
                }
            }
            b'/' => {
                let kind = if self.matches(b'=') {
                    TokenKind::DivEq
                } else {
                    TokenKind::Div
                };
                self.make_token(kind)
            }
            b'*' => {
                if self.matches(b'=') {
                    self.make_token(TokenKind::MulEq)
                } else if self.matches(b'*') {
                    let kind = if self.matches(b'=') {
                        TokenKind::PowEq
                    } else {
                        TokenKind::Pow
                    };
                    self.make_token(kind)
                } else {
                    self.make_token(TokenKind::Mul)
                }
            }
            b'%' => {
                let kind = if self.matches(b'=') {
                    TokenKind::ModEq
                } else {
                    TokenKind::Mod
                };
                self.make_token(kind)
            }
            b'!' => {
                let kind = if self.matches(b'=') {
                    TokenKind::NotEq
                } else {
                    TokenKind::Not
                };
                self.make_token(kind)
            }
            b'=' => {
                let kind = if self.matches(b'=') {
                    TokenKind::Eq
                } else {
                    TokenKind::Assign
                };
                self.make_token(kind)
            }
            b'<' => {
                if self.matches(b'<') {
                    self.make_token(TokenKind::BitLs)
                } else if self.matches(b'=') {
                    self.make_token(TokenKind::LtEq)
                } else {
                    self.make_token(TokenKind::Lt)
                }
            }
            b'>' => {
                if self.matches(b'>') {
                    self.make_token(TokenKind::BitRs)
                } else if self.matches(b'=') {
                    self.make_token(TokenKind::GrEq)
                } else {
                    self.make_token(TokenKind::Gr)
                }
            }
            b':' => {
                if self.matches(b'=') {
                    self.make_token(TokenKind::VarDecl)
                } else if self.matches(b':') {
                    let kind = if self.matches(b'=') {
                        TokenKind::ConstDecl
                    } else {
                        TokenKind::Scope
                    };
                    self.make_token(kind)
                } else {
                    self.make_token(TokenKind::Colon)
                }
            }
            b'?' => {
                if self.matches(b'.') {
                    self.make_token(TokenKind::Opt)
                } else if self.matches(b'?') {
                    let kind = if self.matches(b'=') {
                        TokenKind::NullCoalesceEq
                    } else {
                        TokenKind::NullCoalesce
                    };
                    self.make_token(kind)
                } else {
                    self.make_token(TokenKind::Ter)
                }
            }
            b'&' => {
                if self.matches(b'&') {
                    self.make_token(TokenKind::And)
                } else if self.matches(b'=') {
                    self.make_token(TokenKind::BitAndEq)
                } else {
                    self.make_token(TokenKind::BitAnd)
                }
            }
            b'|' => {
                if self.matches(b'|') {
                    self.make_token(TokenKind::Or)
                } else if self.matches(b'=') {
                    self.make_token(TokenKind::BitOrEq)
                } else {
                    self.make_token(TokenKind::BitOr)
                }
            }
            b'^' => {
                let kind = if self.matches(b'=') {
                    TokenKind::BitXorEq
                } else {
                    TokenKind::BitXor
                };
                self.make_token(kind)
            }
            b'~' => self.make_token(TokenKind::BitNot),
            b'"' => self.string(b'"'),
            b'\'' => self.string(b'\''),
            _ => self.error_token("Unexpected character."),
        }
    }
}

fn is_alpha(c: u8) -> bool {
    c.is_ascii_alphabetic() || c == b'_'
}

fn is_alpha_numeric(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_'
}

fn is_hex_digit(c: u8) -> bool {
    c.is_ascii_hexdigit() || c == b'_'
}

fn is_oct_digit(c: u8) -> bool {
    (b'0'..=b'7').contains(&c) || c == b'_'
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        let mut lexer = Lexer::new(source);
        let mut out = Vec::new();
        loop {
            let token = lexer.next_token();
            let kind = token.kind;
            out.push(kind);
            if kind == TokenKind::Eof {
                return out;
            }
        }
    }

    #[test]
    fn keywords_and_identifiers() {
        assert_eq!(
            kinds("var x while whale fn fnord"),
            vec![
                TokenKind::Var,
                TokenKind::Ident,
                TokenKind::While,
                TokenKind::Ident,
                TokenKind::Fn,
                TokenKind::Ident,
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn keyword_prefixed_identifiers_stay_identifiers() {
        // The length guard in check_keyword must reject these.
        for source in ["falsey", "classic", "form", "nullable", "thistle", "switcher"] {
            assert_eq!(kinds(source), vec![TokenKind::Ident, TokenKind::Eof], "{source}");
        }
    }

    #[test]
    fn panic_requires_bang() {
        assert_eq!(kinds("panic!"), vec![TokenKind::Panic, TokenKind::Eof]);
        assert_eq!(kinds("panic"), vec![TokenKind::Ident, TokenKind::Eof]);
    }

    #[test]
    fn operators_disambiguate_greedily() {
        assert_eq!(
            kinds("== != <= >= ++ -- += -= *= /= ** **= && || ?? ??= :: := ::= ?. -> << >>"),
            vec![
                TokenKind::Eq,
                TokenKind::NotEq,
                TokenKind::LtEq,
                TokenKind::GrEq,
                TokenKind::Inc,
                TokenKind::Dec,
                TokenKind::PlusEq,
                TokenKind::MinusEq,
                TokenKind::MulEq,
                TokenKind::DivEq,
                TokenKind::Pow,
                TokenKind::PowEq,
                TokenKind::And,
                TokenKind::Or,
                TokenKind::NullCoalesce,
                TokenKind::NullCoalesceEq,
                TokenKind::Scope,
                TokenKind::VarDecl,
                TokenKind::ConstDecl,
                TokenKind::Opt,
                TokenKind::Arrow,
                TokenKind::BitLs,
                TokenKind::BitRs,
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn numbers() {
        let mut lexer = Lexer::new("12 3.5 1_000 0xFF 0o17 1e10 2.5e-3");
        let mut lexemes = Vec::new();
        loop {
            let token = lexer.next_token();
            if token.kind == TokenKind::Eof {
                break;
            }
            assert_eq!(token.kind, TokenKind::Number, "{}", token.lexeme);
            lexemes.push(token.lexeme.to_string());
        }
        assert_eq!(lexemes, vec!["12", "3.5", "1_000", "0xFF", "0o17", "1e10", "2.5e-3"]);
    }

    #[test]
    fn invalid_hex_is_an_error() {
        let mut lexer = Lexer::new("0xZ");
        assert_eq!(lexer.next_token().kind, TokenKind::Error);
    }

    #[test]
    fn strings_both_quotes() {
        let mut lexer = Lexer::new("\"hello\" 'world'");
        let a = lexer.next_token();
        assert_eq!(a.kind, TokenKind::String);
        assert_eq!(a.lexeme, "\"hello\"");
        let b = lexer.next_token();
        assert_eq!(b.kind, TokenKind::String);
        assert_eq!(b.lexeme, "'world'");
    }

    #[test]
    fn unterminated_string_is_an_error() {
        let mut lexer = Lexer::new("\"oops");
        let token = lexer.next_token();
        assert_eq!(token.kind, TokenKind::Error);
        assert_eq!(token.lexeme, "Unterminated string.");
    }

    #[test]
    fn comments_are_skipped_and_nest() {
        assert_eq!(
            kinds("1 // line\n2 /* a /* b */ c */ 3 /- x /- y -/ z -/ 4"),
            vec![
                TokenKind::Number,
                TokenKind::Number,
                TokenKind::Number,
                TokenKind::Number,
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn line_numbers_advance() {
        let mut lexer = Lexer::new("a\nb\n\nc");
        assert_eq!(lexer.next_token().line, 1);
        assert_eq!(lexer.next_token().line, 2);
        assert_eq!(lexer.next_token().line, 4);
    }

    #[test]
    fn dollar_starts_identifier() {
        let mut lexer = Lexer::new("$tmp");
        let token = lexer.next_token();
        assert_eq!(token.kind, TokenKind::Ident);
        assert_eq!(token.lexeme, "$tmp");
    }
}
