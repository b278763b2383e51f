//! Recursive-descent selector parser
//!
//! One token of lookahead with a single pushback slot. Lookahead is taken
//! in an explicit context: in value position the `in`/`notin` keywords are
//! read back as plain identifiers, so `value in (in)` parses.

use std::collections::BTreeSet;

use super::lexer::{Lexeme, Lexer, Token};
use super::{LabelOp, Query, QueryError, Term};

const EXPECTED_OPERATORS: &str = "'=', '==', '!=', 'in', 'notin', '<', '<=', '>', '>='";

/// Position the next token is read in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Context {
    KeyAndOperator,
    Values,
}

pub(crate) struct Parser {
    lexer: Lexer,
    pushback: Option<Lexeme>,
}

fn unexpected(found: &Lexeme, expected: &str) -> QueryError {
    QueryError::Unexpected {
        found: found.describe().to_string(),
        expected: expected.to_string(),
    }
}

impl Parser {
    pub fn new(selector: &str) -> Self {
        Self {
            lexer: Lexer::new(selector),
            pushback: None,
        }
    }

    fn read(&mut self) -> Result<Lexeme, QueryError> {
        match self.pushback.take() {
            Some(lexeme) => Ok(lexeme),
            None => self.lexer.lex(),
        }
    }

    fn reinterpret(mut lexeme: Lexeme, context: Context) -> Lexeme {
        if context == Context::Values && matches!(lexeme.token, Token::In | Token::NotIn) {
            lexeme.token = Token::Identifier;
        }
        lexeme
    }

    /// Peek at the next token without consuming it
    fn lookahead(&mut self, context: Context) -> Result<Lexeme, QueryError> {
        let lexeme = self.read()?;
        self.pushback = Some(lexeme.clone());
        Ok(Self::reinterpret(lexeme, context))
    }

    fn consume(&mut self, context: Context) -> Result<Lexeme, QueryError> {
        let lexeme = self.read()?;
        Ok(Self::reinterpret(lexeme, context))
    }

    /// Parse the whole selector; any error rejects it as a unit
    pub fn parse(mut self) -> Result<Query, QueryError> {
        let mut terms = Vec::new();

        loop {
            let next = self.lookahead(Context::Values)?;
            match next.token {
                Token::Identifier | Token::DoesNotExist => {
                    terms.push(self.parse_term()?);

                    let separator = self.consume(Context::Values)?;
                    match separator.token {
                        Token::EndOfString => return Ok(Query { terms }),
                        Token::Comma => {
                            let after = self.lookahead(Context::Values)?;
                            if !matches!(after.token, Token::Identifier | Token::DoesNotExist) {
                                return Err(unexpected(&after, "identifier after ','"));
                            }
                        }
                        _ => return Err(unexpected(&separator, "',' or 'end of string'")),
                    }
                }
                Token::EndOfString => return Ok(Query { terms }),
                _ => return Err(unexpected(&next, "'!', identifier, or 'end of string'")),
            }
        }
    }

    fn parse_term(&mut self) -> Result<Term, QueryError> {
        let (key, inferred) = self.parse_key_and_infer_operator()?;
        if let Some(invert) = inferred {
            return Ok(Term {
                key,
                op: LabelOp::Exists,
                values: Vec::new(),
                invert,
            });
        }

        let (op, invert) = self.parse_operator()?;
        let values = match op {
            LabelOp::In => self.parse_values()?,
            _ => vec![self.parse_exact_value()?],
        };

        Ok(Term {
            key,
            op,
            values,
            invert,
        })
    }

    /// Returns the key and, for bare `key` / `!key`, the existence inversion
    fn parse_key_and_infer_operator(&mut self) -> Result<(String, Option<bool>), QueryError> {
        let mut lexeme = self.consume(Context::Values)?;
        let mut does_not_exist = false;
        if lexeme.token == Token::DoesNotExist {
            does_not_exist = true;
            lexeme = self.consume(Context::Values)?;
        }

        if lexeme.token != Token::Identifier {
            return Err(unexpected(&lexeme, "identifier"));
        }
        let key = lexeme.literal;

        if does_not_exist {
            return Ok((key, Some(true)));
        }

        let next = self.lookahead(Context::Values)?;
        if matches!(next.token, Token::EndOfString | Token::Comma) {
            return Ok((key, Some(false)));
        }

        Ok((key, None))
    }

    /// `>` and `>=` are the inverted forms of `<=` and `<`
    fn parse_operator(&mut self) -> Result<(LabelOp, bool), QueryError> {
        let lexeme = self.consume(Context::KeyAndOperator)?;
        let parsed = match lexeme.token {
            Token::Equals | Token::DoubleEquals => (LabelOp::Equal, false),
            Token::NotEquals => (LabelOp::Equal, true),
            Token::In => (LabelOp::In, false),
            Token::NotIn => (LabelOp::In, true),
            Token::Less => (LabelOp::LtNumeric, false),
            Token::LessEquals => (LabelOp::LteNumeric, false),
            Token::Greater => (LabelOp::LteNumeric, true),
            Token::GreaterEquals => (LabelOp::LtNumeric, true),
            _ => return Err(unexpected(&lexeme, EXPECTED_OPERATORS)),
        };
        Ok(parsed)
    }

    fn parse_values(&mut self) -> Result<Vec<String>, QueryError> {
        let open = self.consume(Context::Values)?;
        if open.token != Token::OpenPar {
            return Err(unexpected(&open, "'('"));
        }

        let next = self.lookahead(Context::Values)?;
        match next.token {
            Token::Identifier | Token::Comma => {
                let values = self.parse_identifiers_list()?;
                let close = self.consume(Context::Values)?;
                if close.token != Token::ClosedPar {
                    return Err(unexpected(&close, "')'"));
                }
                Ok(values.into_iter().collect())
            }
            Token::ClosedPar => {
                self.consume(Context::Values)?;
                Ok(vec![String::new()])
            }
            _ => Err(unexpected(&next, "',', ')' or identifier")),
        }
    }

    /// Empty list positions such as `(,)` contribute the empty string
    fn parse_identifiers_list(&mut self) -> Result<BTreeSet<String>, QueryError> {
        let mut values = BTreeSet::new();

        loop {
            let lexeme = self.consume(Context::Values)?;
            match lexeme.token {
                Token::Identifier => {
                    values.insert(lexeme.literal);
                    let next = self.lookahead(Context::Values)?;
                    match next.token {
                        Token::Comma => continue,
                        Token::ClosedPar => return Ok(values),
                        _ => return Err(unexpected(&next, "',' or ')'")),
                    }
                }
                Token::Comma => {
                    if values.is_empty() {
                        values.insert(String::new());
                    }
                    let next = self.lookahead(Context::Values)?;
                    match next.token {
                        Token::ClosedPar => {
                            values.insert(String::new());
                            return Ok(values);
                        }
                        Token::Comma => {
                            self.consume(Context::Values)?;
                            values.insert(String::new());
                        }
                        _ => {}
                    }
                }
                _ => return Err(unexpected(&lexeme, "',', or identifier")),
            }
        }
    }

    fn parse_exact_value(&mut self) -> Result<String, QueryError> {
        let next = self.lookahead(Context::Values)?;
        if matches!(next.token, Token::EndOfString | Token::Comma) {
            return Ok(String::new());
        }

        let lexeme = self.consume(Context::Values)?;
        if lexeme.token == Token::Identifier {
            Ok(lexeme.literal)
        } else {
            Err(unexpected(&lexeme, "identifier"))
        }
    }
}
