//! Single-pass tokenizer for label selectors

use super::QueryError;

/// Lexical token kinds of the selector grammar
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Token {
    EndOfString,
    Identifier,
    Comma,
    OpenPar,
    ClosedPar,
    DoesNotExist,
    Equals,
    DoubleEquals,
    NotEquals,
    In,
    NotIn,
    Less,
    LessEquals,
    Greater,
    GreaterEquals,
}

/// A token together with the text it was scanned from
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Lexeme {
    pub token: Token,
    pub literal: String,
}

impl Lexeme {
    fn new(token: Token, literal: impl Into<String>) -> Self {
        Self {
            token,
            literal: literal.into(),
        }
    }

    /// Text used in error messages
    pub fn describe(&self) -> &str {
        if self.token == Token::EndOfString {
            "end of string"
        } else {
            &self.literal
        }
    }
}

const QUOTE: char = '"';
const ESCAPE: char = '\\';

fn is_special_symbol(ch: char) -> bool {
    matches!(ch, '=' | '!' | '(' | ')' | ',' | '<' | '>')
}

fn is_identifier_char(ch: char) -> bool {
    !ch.is_whitespace() && !is_special_symbol(ch) && ch != QUOTE
}

/// Operators longer than one character, matched greedily
fn two_char_operator(first: char, second: char) -> Option<Token> {
    match (first, second) {
        ('=', '=') => Some(Token::DoubleEquals),
        ('!', '=') => Some(Token::NotEquals),
        ('<', '=') => Some(Token::LessEquals),
        ('>', '=') => Some(Token::GreaterEquals),
        _ => None,
    }
}

fn single_char_operator(ch: char) -> Token {
    match ch {
        '=' => Token::Equals,
        '!' => Token::DoesNotExist,
        '(' => Token::OpenPar,
        ')' => Token::ClosedPar,
        ',' => Token::Comma,
        '<' => Token::Less,
        _ => Token::Greater,
    }
}

pub(crate) struct Lexer {
    input: Vec<char>,
    pos: usize,
}

impl Lexer {
    pub fn new(input: &str) -> Self {
        Self {
            input: input.chars().collect(),
            pos: 0,
        }
    }

    fn peek(&self) -> Option<char> {
        self.input.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let ch = self.peek()?;
        self.pos += 1;
        Some(ch)
    }

    /// Scan the next token, skipping leading whitespace
    pub fn lex(&mut self) -> Result<Lexeme, QueryError> {
        while self.peek().is_some_and(char::is_whitespace) {
            self.pos += 1;
        }

        match self.peek() {
            None => Ok(Lexeme::new(Token::EndOfString, "")),
            Some(QUOTE) => self.scan_quoted(),
            Some(ch) if is_special_symbol(ch) => Ok(self.scan_special_symbol()),
            Some(_) => Ok(self.scan_identifier_or_keyword()),
        }
    }

    fn scan_special_symbol(&mut self) -> Lexeme {
        let start = self.pos;
        let first = self.bump().unwrap_or_default();

        if let Some(second) = self.peek() {
            if let Some(token) = two_char_operator(first, second) {
                self.pos += 1;
                return Lexeme::new(token, self.input[start..self.pos].iter().collect::<String>());
            }
        }

        Lexeme::new(single_char_operator(first), first.to_string())
    }

    fn scan_identifier_or_keyword(&mut self) -> Lexeme {
        let start = self.pos;
        while self.peek().is_some_and(is_identifier_char) {
            self.pos += 1;
        }

        let literal: String = self.input[start..self.pos].iter().collect();
        let token = match literal.as_str() {
            "in" => Token::In,
            "notin" => Token::NotIn,
            _ => Token::Identifier,
        };
        Lexeme::new(token, literal)
    }

    /// Quoted strings are always identifiers, never keywords
    fn scan_quoted(&mut self) -> Result<Lexeme, QueryError> {
        let start = self.pos;
        self.pos += 1;

        let mut value = String::new();
        loop {
            match self.bump() {
                None => return Err(QueryError::UnterminatedQuote { position: start }),
                Some(QUOTE) => return Ok(Lexeme::new(Token::Identifier, value)),
                Some(ESCAPE) => match self.bump() {
                    None => {
                        return Err(QueryError::UnterminatedEscape {
                            position: self.pos - 1,
                        })
                    }
                    Some(ch @ (QUOTE | ESCAPE)) => value.push(ch),
                    Some(other) => {
                        value.push(ESCAPE);
                        value.push(other);
                    }
                },
                Some(ch) => value.push(ch),
            }
        }
    }
}
