//! Label query engine
//!
//! Compiles a human-readable selector such as
//! `infrakit.dev/provider-id=kvm, !infrakit.dev/decommissioned, cores>=4`
//! into a [`Query`]: an ordered list of [`Term`]s that must all match a
//! resource's labels.
//!
//! Supported forms:
//! - `key` / `!key`: key exists / does not exist
//! - `key=value`, `key==value`, `key!=value`
//! - `key in (a, b)`, `key notin (a, b)`
//! - `key<n`, `key<=n`, `key>n`, `key>=n` (numeric)
//!
//! Values may be double-quoted with `\"` and `\\` escapes.

mod lexer;
mod parser;

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::resource::Labels;

/// Errors produced while parsing a selector
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    /// A quoted value is missing its closing quote
    #[error("unterminated quoted string starting at position {position}")]
    UnterminatedQuote {
        /// Character offset of the opening quote
        position: usize,
    },

    /// A quoted value ends in a lone backslash
    #[error("unterminated escape sequence at position {position}")]
    UnterminatedEscape {
        /// Character offset of the backslash
        position: usize,
    },

    /// A token appeared where the grammar does not allow it
    #[error("found '{found}', expected: {expected}")]
    Unexpected {
        /// The offending token
        found: String,
        /// Tokens that would have been accepted
        expected: String,
    },
}

/// Comparison performed by a [`Term`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LabelOp {
    /// Key is present
    Exists,
    /// Value equals the single term value
    Equal,
    /// Value is one of the term values
    In,
    /// Value is numerically less than the term value
    LtNumeric,
    /// Value is numerically less than or equal to the term value
    LteNumeric,
}

/// One conjunct of a query
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Term {
    /// Label key
    pub key: String,
    /// Operator
    pub op: LabelOp,
    /// Operand values; sorted and deduplicated for [`LabelOp::In`]
    pub values: Vec<String>,
    /// Negate the operator
    pub invert: bool,
}

impl Term {
    /// Evaluate this term against a label set
    ///
    /// A missing key only satisfies inverted existence, equality and
    /// membership terms. Numeric terms never match unless both sides parse
    /// as integers.
    pub fn matches(&self, labels: &Labels) -> bool {
        let Some(value) = labels.get(&self.key) else {
            return match self.op {
                LabelOp::LtNumeric | LabelOp::LteNumeric => false,
                _ => self.invert,
            };
        };

        match self.op {
            LabelOp::Exists => !self.invert,
            LabelOp::Equal => (self.values.first().map(String::as_str) == Some(value)) != self.invert,
            LabelOp::In => self.values.iter().any(|v| v == value) != self.invert,
            LabelOp::LtNumeric | LabelOp::LteNumeric => {
                let (Ok(left), Some(Ok(right))) = (
                    value.parse::<i64>(),
                    self.values.first().map(|v| v.parse::<i64>()),
                ) else {
                    return false;
                };
                let holds = if self.op == LabelOp::LtNumeric {
                    left < right
                } else {
                    left <= right
                };
                holds != self.invert
            }
        }
    }
}

/// A conjunctive label selector
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Query {
    /// Terms in declaration order
    pub terms: Vec<Term>,
}

/// Compile a selector string into a [`Query`]
pub fn parse(selector: &str) -> Result<Query, QueryError> {
    parser::Parser::new(selector).parse()
}

impl Query {
    /// An empty query, matching every label set
    pub fn new() -> Self {
        Self::default()
    }

    /// True if the query has no terms
    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    /// True if every term matches
    pub fn matches(&self, labels: &Labels) -> bool {
        self.terms.iter().all(|term| term.matches(labels))
    }

    fn term(mut self, key: impl Into<String>, op: LabelOp, values: Vec<String>, invert: bool) -> Self {
        self.terms.push(Term {
            key: key.into(),
            op,
            values,
            invert,
        });
        self
    }

    /// Require `key` to be present
    pub fn exists(self, key: impl Into<String>) -> Self {
        self.term(key, LabelOp::Exists, Vec::new(), false)
    }

    /// Require `key` to be absent
    pub fn not_exists(self, key: impl Into<String>) -> Self {
        self.term(key, LabelOp::Exists, Vec::new(), true)
    }

    /// Require `key` to equal `value`
    pub fn equal(self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.term(key, LabelOp::Equal, vec![value.into()], false)
    }

    /// Require `key` to differ from `value` (or be absent)
    pub fn not_equal(self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.term(key, LabelOp::Equal, vec![value.into()], true)
    }

    /// Require `key` to be one of `values`
    pub fn in_set<I, V>(self, key: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<String>,
    {
        let mut values: Vec<String> = values.into_iter().map(Into::into).collect();
        values.sort();
        values.dedup();
        self.term(key, LabelOp::In, values, false)
    }
}

impl FromStr for Query {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse(s)
    }
}

fn needs_quoting(value: &str) -> bool {
    value.is_empty()
        || value == "in"
        || value == "notin"
        || value
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '=' | '!' | '(' | ')' | ',' | '<' | '>' | '"'))
}

struct Literal<'a>(&'a str);

impl fmt::Display for Literal<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !needs_quoting(self.0) {
            return f.write_str(self.0);
        }
        f.write_str("\"")?;
        for ch in self.0.chars() {
            if matches!(ch, '"' | '\\') {
                f.write_str("\\")?;
            }
            write!(f, "{ch}")?;
        }
        f.write_str("\"")
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let key = Literal(&self.key);
        let first = self.values.first().map(String::as_str).unwrap_or_default();
        match (self.op, self.invert) {
            (LabelOp::Exists, false) => write!(f, "{key}"),
            (LabelOp::Exists, true) => write!(f, "!{key}"),
            (LabelOp::Equal, false) => write!(f, "{key}={}", Literal(first)),
            (LabelOp::Equal, true) => write!(f, "{key}!={}", Literal(first)),
            (LabelOp::In, invert) => {
                let keyword = if invert { "notin" } else { "in" };
                let values: Vec<String> = self
                    .values
                    .iter()
                    .map(|v| Literal(v).to_string())
                    .collect();
                write!(f, "{key} {keyword} ({})", values.join(", "))
            }
            (LabelOp::LtNumeric, false) => write!(f, "{key}<{}", Literal(first)),
            (LabelOp::LtNumeric, true) => write!(f, "{key}>={}", Literal(first)),
            (LabelOp::LteNumeric, false) => write!(f, "{key}<={}", Literal(first)),
            (LabelOp::LteNumeric, true) => write!(f, "{key}>{}", Literal(first)),
        }
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, term) in self.terms.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{term}")?;
        }
        Ok(())
    }
}
