//! Modal, stateful tokenizer.
//!
//! A mode stack (not just a state) drives lexing: strings, bracketed
//! interpolations and multiline strings nest with different termination
//! rules. Symbols are matched with maximal munch, so `>>>=` is one token.

use crate::error::TemplateError;
use crate::json::JsonValue;
use crate::token::{Pos, Span, Token, TokenType};

/// Active lexing mode. `Default` is the bottom of the stack and never pops;
/// an `Interpolation` lexes ordinary tokens until its matching `]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Default,
    Interpolation { depth: u32 },
    DqString,
    MlString { dq: bool, line_start: bool },
}

/// Symbol inventory, used for maximal munch. Every proper prefix of a symbol
/// is itself a symbol, so the munch can stop at any point and still hold a
/// valid token.
const SYMBOLS: &[(&str, TokenType)] = &[
    ("(", TokenType::ParenOpen),
    (")", TokenType::ParenClose),
    ("[", TokenType::BracketOpen),
    ("]", TokenType::BracketClose),
    ("{", TokenType::BraceOpen),
    ("}", TokenType::BraceClose),
    (",", TokenType::Comma),
    (":", TokenType::Colon),
    ("+", TokenType::Plus),
    ("-", TokenType::Dash),
    ("*", TokenType::Star),
    ("/", TokenType::Slash),
    ("%", TokenType::Percent),
    (".", TokenType::Period),
    ("..", TokenType::DoublePeriod),
    ("...", TokenType::TriplePeriod),
    ("!", TokenType::Excl),
    ("~", TokenType::Tilde),
    ("#", TokenType::Hash),
    ("<<", TokenType::Lsh),
    (">>", TokenType::Rsh),
    (">>>", TokenType::Rrsh),
    ("<", TokenType::LessThan),
    (">", TokenType::GreaterThan),
    ("<=", TokenType::LessEqual),
    (">=", TokenType::GreaterEqual),
    ("==", TokenType::Equal),
    ("!=", TokenType::Inequal),
    ("&", TokenType::And),
    ("|", TokenType::Or),
    ("^", TokenType::Xor),
    ("&&", TokenType::And2),
    ("||", TokenType::Or2),
    ("?", TokenType::Question),
    ("@", TokenType::At),
    ("++", TokenType::Plus2),
    ("--", TokenType::Minus2),
    ("=", TokenType::Assign),
    ("+=", TokenType::PlusIs),
    ("-=", TokenType::MinusIs),
    ("*=", TokenType::StarIs),
    ("/=", TokenType::SlashIs),
    ("%=", TokenType::PercentIs),
    ("<<=", TokenType::LshIs),
    (">>=", TokenType::RshIs),
    (">>>=", TokenType::RrshIs),
    ("&=", TokenType::AndIs),
    ("|=", TokenType::OrIs),
    ("^=", TokenType::XorIs),
    ("->", TokenType::Arrow),
];

fn keyword(word: &str) -> Option<TokenType> {
    Some(match word {
        "null" => TokenType::Null,
        "copy" => TokenType::Copy,
        "is" => TokenType::Is,
        "isnt" => TokenType::Isnt,
        "has" => TokenType::Has,
        "hasnt" => TokenType::Hasnt,
        "if" => TokenType::If,
        "else" => TokenType::Else,
        "for" => TokenType::For,
        "in" => TokenType::In,
        "from" => TokenType::From,
        "to" => TokenType::To,
        "switch" => TokenType::Switch,
        "match" => TokenType::Match,
        "case" => TokenType::Case,
        "do" => TokenType::Do,
        "then" => TokenType::Then,
        "def" => TokenType::Def,
        "gen" => TokenType::Gen,
        "break" => TokenType::Break,
        "continue" => TokenType::Continue,
        "return" => TokenType::Return,
        _ => return None,
    })
}

pub struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: u32,
    col: u32,
    modes: Vec<Mode>,
}

impl Lexer {
    pub fn new(source: &str) -> Lexer {
        // Normalize CRLF and bare CR to LF up front; positions then count
        // normalized characters.
        let mut chars = Vec::with_capacity(source.len());
        let mut iter = source.chars().peekable();
        while let Some(c) = iter.next() {
            if c == '\r' {
                if iter.peek() == Some(&'\n') {
                    iter.next();
                }
                chars.push('\n');
            } else {
                chars.push(c);
            }
        }
        Lexer {
            chars,
            pos: 0,
            line: 1,
            col: 1,
            modes: vec![Mode::Default],
        }
    }

    /// Lex the whole input, including the trailing EOF token.
    pub fn tokenize(source: &str) -> Result<Vec<Token>, TemplateError> {
        let mut lexer = Lexer::new(source);
        let mut tokens = Vec::new();
        loop {
            let token = lexer.next_token()?;
            let done = token.ty == TokenType::Eof;
            tokens.push(token);
            if done {
                return Ok(tokens);
            }
        }
    }

    fn here(&self) -> Pos {
        Pos {
            line: self.line,
            col: self.col,
            offset: self.pos,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, ahead: usize) -> Option<char> {
        self.chars.get(self.pos + ahead).copied()
    }

    fn advance(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(c)
    }

    fn error(&self, from: Pos, message: impl Into<String>) -> TemplateError {
        TemplateError::lexical(Span::new(from, self.here()), message)
    }

    fn error_here(&self, message: impl Into<String>) -> TemplateError {
        TemplateError::lexical(Span::at(self.here()), message)
    }

    fn mode(&self) -> Mode {
        *self.modes.last().unwrap_or(&Mode::Default)
    }

    fn set_mode(&mut self, mode: Mode) {
        if let Some(top) = self.modes.last_mut() {
            *top = mode;
        }
    }

    pub fn next_token(&mut self) -> Result<Token, TemplateError> {
        match self.mode() {
            Mode::Default | Mode::Interpolation { .. } => self.next_default(),
            Mode::DqString => self.next_dq_string(),
            Mode::MlString { dq, line_start } => self.next_ml_string(dq, line_start),
        }
    }

    // === Default mode (and interpolations) ===

    fn next_default(&mut self) -> Result<Token, TemplateError> {
        self.skip_whitespace_and_comments()?;

        let from = self.here();
        let c = match self.peek() {
            Some(c) => c,
            None => {
                if self.modes.len() > 1 {
                    return Err(self.error_here("unterminated interpolation"));
                }
                return Ok(Token::new(TokenType::Eof, Span::at(from)));
            }
        };

        if c.is_ascii_digit() {
            return self.lex_number(from);
        }
        if c == '.' && self.peek_at(1).is_some_and(|d| d.is_ascii_digit()) {
            return self.lex_number(from);
        }
        if c == '_' && !self.peek_at(1).is_some_and(is_identifier_part) {
            self.advance();
            return Ok(Token::new(TokenType::Underscore, Span::new(from, self.here())));
        }
        if c == '$' {
            self.advance();
            return Ok(Token::new(TokenType::Dollar, Span::new(from, self.here())));
        }
        if c.is_alphabetic() || c == '_' {
            return Ok(self.lex_word(from));
        }
        if c == '\'' {
            return self.lex_single_quote(from);
        }
        if c == '"' {
            return self.lex_double_quote_open(from);
        }

        // Interpolation bracket bookkeeping: the `]` matching the opening
        // `#[` returns to string mode.
        if let Mode::Interpolation { depth } = self.mode() {
            if c == '[' {
                self.advance();
                self.set_mode(Mode::Interpolation { depth: depth + 1 });
                return Ok(Token::new(TokenType::BracketOpen, Span::new(from, self.here())));
            }
            if c == ']' {
                self.advance();
                if depth == 0 {
                    self.modes.pop();
                } else {
                    self.set_mode(Mode::Interpolation { depth: depth - 1 });
                }
                return Ok(Token::new(TokenType::BracketClose, Span::new(from, self.here())));
            }
        }

        self.lex_symbol(from)
    }

    fn skip_whitespace_and_comments(&mut self) -> Result<(), TemplateError> {
        loop {
            match self.peek() {
                Some(c) if c.is_whitespace() => {
                    self.advance();
                }
                Some('/') if self.peek_at(1) == Some('/') => {
                    while let Some(c) = self.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.advance();
                    }
                }
                Some('/') if self.peek_at(1) == Some('*') => {
                    let from = self.here();
                    self.advance();
                    self.advance();
                    loop {
                        match self.peek() {
                            Some('*') if self.peek_at(1) == Some('/') => {
                                self.advance();
                                self.advance();
                                break;
                            }
                            Some(_) => {
                                self.advance();
                            }
                            None => {
                                return Err(self.error(from, "unterminated block comment"));
                            }
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    /// Maximal munch: extend the symbol while the extension is still the
    /// prefix of some symbol, then emit the (necessarily valid) result.
    fn lex_symbol(&mut self, from: Pos) -> Result<Token, TemplateError> {
        let mut munched = String::new();
        loop {
            let next = match self.peek() {
                Some(c) => c,
                None => break,
            };
            let mut attempt = munched.clone();
            attempt.push(next);
            if !SYMBOLS.iter().any(|(sym, _)| sym.starts_with(&attempt)) {
                break;
            }
            munched = attempt;
            self.advance();
        }

        match SYMBOLS.iter().find(|(sym, _)| *sym == munched) {
            Some((_, ty)) => Ok(Token::new(*ty, Span::new(from, self.here()))),
            None => {
                self.advance();
                Err(self.error(from, format!("illegal character '{}'", self.chars[from.offset])))
            }
        }
    }

    fn lex_word(&mut self, from: Pos) -> Token {
        let mut word = String::new();
        while let Some(c) = self.peek() {
            if !is_identifier_part(c) {
                break;
            }
            word.push(c);
            self.advance();
        }
        let span = Span::new(from, self.here());

        match word.as_str() {
            "true" => Token::with_value(TokenType::Boolean, JsonValue::Bool(true), span),
            "false" => Token::with_value(TokenType::Boolean, JsonValue::Bool(false), span),
            "Infinity" => Token::with_value(TokenType::Number, JsonValue::Float(f64::INFINITY), span),
            "NaN" => Token::with_value(TokenType::Number, JsonValue::Float(f64::NAN), span),
            _ => match keyword(&word) {
                Some(ty) => Token::new(ty, span),
                None => Token::with_value(TokenType::Identifier, JsonValue::string(&word), span),
            },
        }
    }

    // === Numbers ===

    fn lex_number(&mut self, from: Pos) -> Result<Token, TemplateError> {
        if self.peek() == Some('0') && matches!(self.peek_at(1), Some('x') | Some('X')) {
            self.advance();
            self.advance();
            let mut digits = String::new();
            while let Some(c) = self.peek() {
                if !c.is_ascii_hexdigit() {
                    break;
                }
                digits.push(c);
                self.advance();
            }
            if digits.is_empty() {
                return Err(self.error(from, "incomplete hexadecimal number"));
            }
            return match i64::from_str_radix(&digits, 16) {
                Ok(n) => Ok(Token::with_value(
                    TokenType::Number,
                    JsonValue::Int(n),
                    Span::new(from, self.here()),
                )),
                Err(_) => Err(self.error(from, "hexadecimal number out of range")),
            };
        }

        let mut text = String::new();
        let mut is_float = false;

        while let Some(c) = self.peek() {
            if !c.is_ascii_digit() {
                break;
            }
            text.push(c);
            self.advance();
        }
        // A fraction needs a digit right after the period, otherwise the
        // period is member access (or a slice `..`).
        if self.peek() == Some('.') && self.peek_at(1).is_some_and(|d| d.is_ascii_digit()) {
            is_float = true;
            text.push('.');
            self.advance();
            while let Some(c) = self.peek() {
                if !c.is_ascii_digit() {
                    break;
                }
                text.push(c);
                self.advance();
            }
        }
        if matches!(self.peek(), Some('e') | Some('E')) {
            let mut ahead = 1;
            if matches!(self.peek_at(1), Some('+') | Some('-')) {
                ahead = 2;
            }
            if self.peek_at(ahead).is_some_and(|d| d.is_ascii_digit()) {
                is_float = true;
                for _ in 0..ahead {
                    text.push(self.advance().unwrap_or_default());
                }
                while let Some(c) = self.peek() {
                    if !c.is_ascii_digit() {
                        break;
                    }
                    text.push(c);
                    self.advance();
                }
            }
        }

        let span = Span::new(from, self.here());
        let value = if is_float {
            match text.parse::<f64>() {
                Ok(f) => JsonValue::Float(f),
                Err(_) => return Err(self.error(from, "malformed number")),
            }
        } else {
            match text.parse::<i64>() {
                Ok(n) => JsonValue::Int(n),
                // Out-of-range integers degrade to floats.
                Err(_) => match text.parse::<f64>() {
                    Ok(f) => JsonValue::Float(f),
                    Err(_) => return Err(self.error(from, "malformed number")),
                },
            }
        };
        Ok(Token::with_value(TokenType::Number, value, span))
    }

    // === Strings ===

    fn lex_single_quote(&mut self, from: Pos) -> Result<Token, TemplateError> {
        if self.peek_at(1) == Some('\'') && self.peek_at(2) == Some('\'') {
            self.advance();
            self.advance();
            self.advance();
            self.modes.push(Mode::MlString {
                dq: false,
                line_start: true,
            });
            // The body conventionally starts on the next line.
            if self.peek() == Some('\n') {
                self.advance();
            }
            return Ok(Token::new(TokenType::MlDelimiter, Span::new(from, self.here())));
        }

        self.advance();
        let mut content = String::new();
        loop {
            match self.peek() {
                None => return Err(self.error_here("unterminated string")),
                Some('\n') => return Err(self.error_here("unterminated string")),
                Some('\'') => {
                    self.advance();
                    return Ok(Token::with_value(
                        TokenType::PureString,
                        JsonValue::string(&content),
                        Span::new(from, self.here()),
                    ));
                }
                Some('\\') => content.push(self.read_escape()?),
                Some(c) => {
                    content.push(c);
                    self.advance();
                }
            }
        }
    }

    fn lex_double_quote_open(&mut self, from: Pos) -> Result<Token, TemplateError> {
        if self.peek_at(1) == Some('"') && self.peek_at(2) == Some('"') {
            self.advance();
            self.advance();
            self.advance();
            self.modes.push(Mode::MlString {
                dq: true,
                line_start: true,
            });
            if self.peek() == Some('\n') {
                self.advance();
            }
            return Ok(Token::new(TokenType::DqMlDelimiter, Span::new(from, self.here())));
        }

        self.advance();
        self.modes.push(Mode::DqString);
        Ok(Token::new(TokenType::DqDelimiter, Span::new(from, self.here())))
    }

    fn next_dq_string(&mut self) -> Result<Token, TemplateError> {
        let from = self.here();
        let mut content = String::new();
        loop {
            match self.peek() {
                None => return Err(self.error_here("unterminated string")),
                Some('\n') => return Err(self.error_here("unterminated string")),
                Some('"') => {
                    if !content.is_empty() {
                        return Ok(Token::with_value(
                            TokenType::StringContent,
                            JsonValue::string(&content),
                            Span::new(from, self.here()),
                        ));
                    }
                    self.advance();
                    self.modes.pop();
                    return Ok(Token::new(TokenType::DqDelimiter, Span::new(from, self.here())));
                }
                Some('#') if self.peek_at(1) == Some('[') => {
                    if !content.is_empty() {
                        return Ok(Token::with_value(
                            TokenType::StringContent,
                            JsonValue::string(&content),
                            Span::new(from, self.here()),
                        ));
                    }
                    self.advance();
                    self.advance();
                    self.modes.push(Mode::Interpolation { depth: 0 });
                    return Ok(Token::new(TokenType::Interpolation, Span::new(from, self.here())));
                }
                Some('\\') => content.push(self.read_escape()?),
                Some(c) => {
                    content.push(c);
                    self.advance();
                }
            }
        }
    }

    fn next_ml_string(&mut self, dq: bool, line_start: bool) -> Result<Token, TemplateError> {
        let from = self.here();

        if line_start {
            // Leading indentation of a line is its own token; tabs in it are
            // illegal per the multiline rules.
            if self.peek() == Some('\t') {
                return Err(self.error_here("tabs are not allowed in multiline string indentation"));
            }
            if self.peek() == Some(' ') {
                let mut ws = String::new();
                while self.peek() == Some(' ') {
                    ws.push(' ');
                    self.advance();
                }
                if self.peek() == Some('\t') {
                    return Err(self.error_here("tabs are not allowed in multiline string indentation"));
                }
                return Ok(Token::with_value(
                    TokenType::MlWhitespace,
                    JsonValue::string(&ws),
                    Span::new(from, self.here()),
                ));
            }
            self.set_mode(Mode::MlString {
                dq,
                line_start: false,
            });
            if self.peek() == Some('\\') {
                if self.peek_at(1) == Some('~') {
                    self.advance();
                    self.advance();
                    return Ok(Token::new(TokenType::MlNoLineBreak, Span::new(from, self.here())));
                }
                if !matches!(self.peek_at(1), Some(c) if is_escape_start(c)) {
                    self.advance();
                    return Ok(Token::new(
                        TokenType::MlBoundaryIndicator,
                        Span::new(from, self.here()),
                    ));
                }
            }
            return self.next_ml_string(dq, false);
        }

        let mut content = String::new();
        loop {
            match self.peek() {
                None => return Err(self.error_here("unterminated multiline string")),
                Some('\n') => {
                    if !content.is_empty() {
                        return Ok(self.ml_content(from, content));
                    }
                    self.advance();
                    self.set_mode(Mode::MlString {
                        dq,
                        line_start: true,
                    });
                    return Ok(Token::new(TokenType::MlLineBreak, Span::new(from, self.here())));
                }
                Some('\'') if !dq && self.peek_at(1) == Some('\'') && self.peek_at(2) == Some('\'') => {
                    if !content.is_empty() {
                        return Ok(self.ml_content(from, content));
                    }
                    self.advance();
                    self.advance();
                    self.advance();
                    self.modes.pop();
                    return Ok(Token::new(TokenType::MlDelimiter, Span::new(from, self.here())));
                }
                Some('"') if dq && self.peek_at(1) == Some('"') && self.peek_at(2) == Some('"') => {
                    if !content.is_empty() {
                        return Ok(self.ml_content(from, content));
                    }
                    self.advance();
                    self.advance();
                    self.advance();
                    self.modes.pop();
                    return Ok(Token::new(TokenType::DqMlDelimiter, Span::new(from, self.here())));
                }
                Some('#') if dq && self.peek_at(1) == Some('[') => {
                    if !content.is_empty() {
                        return Ok(self.ml_content(from, content));
                    }
                    self.advance();
                    self.advance();
                    self.modes.push(Mode::Interpolation { depth: 0 });
                    return Ok(Token::new(TokenType::Interpolation, Span::new(from, self.here())));
                }
                Some('\\') if self.peek_at(1) == Some('~') => {
                    if !content.is_empty() {
                        return Ok(self.ml_content(from, content));
                    }
                    self.advance();
                    self.advance();
                    return Ok(Token::new(TokenType::MlNoLineBreak, Span::new(from, self.here())));
                }
                Some('\\') => content.push(self.read_escape()?),
                Some(c) => {
                    content.push(c);
                    self.advance();
                }
            }
        }
    }

    fn ml_content(&self, from: Pos, content: String) -> Token {
        Token::with_value(
            TokenType::StringContent,
            JsonValue::string(&content),
            Span::new(from, self.here()),
        )
    }

    fn read_escape(&mut self) -> Result<char, TemplateError> {
        let from = self.here();
        self.advance(); // the backslash
        let c = match self.advance() {
            Some(c) => c,
            None => return Err(self.error(from, "unterminated escape sequence")),
        };
        Ok(match c {
            '\\' => '\\',
            '\'' => '\'',
            '"' => '"',
            '#' => '#',
            'n' => '\n',
            't' => '\t',
            'r' => '\r',
            'f' => '\u{000C}',
            'b' => '\u{0008}',
            '0' => '\0',
            'u' => {
                let mut code = 0u32;
                for _ in 0..4 {
                    let d = match self.advance().and_then(|c| c.to_digit(16)) {
                        Some(d) => d,
                        None => return Err(self.error(from, "malformed unicode escape")),
                    };
                    code = code * 16 + d;
                }
                match char::from_u32(code) {
                    Some(c) => c,
                    None => return Err(self.error(from, "invalid unicode escape")),
                }
            }
            other => return Err(self.error(from, format!("illegal escape '\\{}'", other))),
        })
    }
}

fn is_identifier_part(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn is_escape_start(c: char) -> bool {
    matches!(
        c,
        '\\' | '\'' | '"' | '#' | 'n' | 't' | 'r' | 'f' | 'b' | '0' | 'u'
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn types(source: &str) -> Vec<TokenType> {
        Lexer::tokenize(source)
            .expect("lexing failed")
            .into_iter()
            .map(|t| t.ty)
            .collect()
    }

    #[test]
    fn test_maximal_munch_compound_assignment() {
        // ">>>=" must be one token, not four.
        assert_eq!(types(">>>="), vec![TokenType::RrshIs, TokenType::Eof]);
        assert_eq!(types(">>> ="), vec![TokenType::Rrsh, TokenType::Assign, TokenType::Eof]);
        assert_eq!(
            types("<<= << <"),
            vec![TokenType::LshIs, TokenType::Lsh, TokenType::LessThan, TokenType::Eof]
        );
    }

    #[test]
    fn test_periods() {
        assert_eq!(
            types("a.b"),
            vec![TokenType::Identifier, TokenType::Period, TokenType::Identifier, TokenType::Eof]
        );
        assert_eq!(types(".."), vec![TokenType::DoublePeriod, TokenType::Eof]);
        assert_eq!(types("..."), vec![TokenType::TriplePeriod, TokenType::Eof]);
        // A digit after the period means a fractional number.
        let tokens = Lexer::tokenize(".25").unwrap();
        assert_eq!(tokens[0].ty, TokenType::Number);
        assert_eq!(tokens[0].value, Some(JsonValue::Float(0.25)));
    }

    #[test]
    fn test_numbers() {
        let tokens = Lexer::tokenize("12 0x1F 1.5 2e3 9999999999999999999").unwrap();
        assert_eq!(tokens[0].value, Some(JsonValue::Int(12)));
        assert_eq!(tokens[1].value, Some(JsonValue::Int(31)));
        assert_eq!(tokens[2].value, Some(JsonValue::Float(1.5)));
        assert_eq!(tokens[3].value, Some(JsonValue::Float(2000.0)));
        assert!(matches!(tokens[4].value, Some(JsonValue::Float(_))));
    }

    #[test]
    fn test_keywords_and_identifiers() {
        assert_eq!(
            types("for x in _ $ null if break"),
            vec![
                TokenType::For,
                TokenType::Identifier,
                TokenType::In,
                TokenType::Underscore,
                TokenType::Dollar,
                TokenType::Null,
                TokenType::If,
                TokenType::Break,
                TokenType::Eof,
            ]
        );
        // `_x` is an identifier, `_` alone is the underscore token.
        assert_eq!(types("_x"), vec![TokenType::Identifier, TokenType::Eof]);
    }

    #[test]
    fn test_single_quoted_string() {
        let tokens = Lexer::tokenize(r"'a\n\u0041'").unwrap();
        assert_eq!(tokens[0].ty, TokenType::PureString);
        assert_eq!(tokens[0].value, Some(JsonValue::string("a\nA")));
    }

    #[test]
    fn test_double_quoted_interpolation() {
        assert_eq!(
            types(r#""a#[x + 1]b""#),
            vec![
                TokenType::DqDelimiter,
                TokenType::StringContent,
                TokenType::Interpolation,
                TokenType::Identifier,
                TokenType::Plus,
                TokenType::Number,
                TokenType::BracketClose,
                TokenType::StringContent,
                TokenType::DqDelimiter,
                TokenType::Eof,
            ]
        );
    }

    #[test]
    fn test_interpolation_bracket_nesting() {
        // The `]` of the index access must not terminate the interpolation.
        assert_eq!(
            types(r##""#[a[0]]""##),
            vec![
                TokenType::DqDelimiter,
                TokenType::Interpolation,
                TokenType::Identifier,
                TokenType::BracketOpen,
                TokenType::Number,
                TokenType::BracketClose,
                TokenType::BracketClose,
                TokenType::DqDelimiter,
                TokenType::Eof,
            ]
        );
    }

    #[test]
    fn test_unterminated_string_positions_at_input_end() {
        let err = Lexer::tokenize("\"unterminated").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Lexical);
        assert_eq!(err.span.from.offset, 13);
    }

    #[test]
    fn test_unterminated_block_comment() {
        let err = Lexer::tokenize("1 /* never closed").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Lexical);
    }

    #[test]
    fn test_multiline_string_tokens() {
        let source = "'''\n  hello\n  world\n'''";
        assert_eq!(
            types(source),
            vec![
                TokenType::MlDelimiter,
                TokenType::MlWhitespace,
                TokenType::StringContent,
                TokenType::MlLineBreak,
                TokenType::MlWhitespace,
                TokenType::StringContent,
                TokenType::MlLineBreak,
                TokenType::MlDelimiter,
                TokenType::Eof,
            ]
        );
    }

    #[test]
    fn test_multiline_boundary_and_no_line_break() {
        let source = "'''\n  \\content\n  next \\~\n'''";
        let tys = types(source);
        assert!(tys.contains(&TokenType::MlBoundaryIndicator));
        assert!(tys.contains(&TokenType::MlNoLineBreak));
    }

    #[test]
    fn test_multiline_tab_indent_is_illegal() {
        let err = Lexer::tokenize("'''\n\thello\n'''").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Lexical);
    }

    #[test]
    fn test_comments_are_skipped() {
        assert_eq!(
            types("1 // line\n/* block */ 2"),
            vec![TokenType::Number, TokenType::Number, TokenType::Eof]
        );
    }

    #[test]
    fn test_crlf_normalization() {
        let tokens = Lexer::tokenize("1\r\n2").unwrap();
        assert_eq!(tokens[1].span.from.line, 2);
    }

    #[test]
    fn test_illegal_character() {
        let err = Lexer::tokenize("`").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Lexical);
    }
}
