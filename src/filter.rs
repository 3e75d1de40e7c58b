//! Keyword and marker filter expressions
//!
//! Both expression kinds share one boolean grammar:
//!
//! ```text
//! expr    := and ("or" and)*
//! and     := unary ("and" unary)*
//! unary   := "not" unary | primary
//! primary := "(" expr ")" | LITERAL
//! ```
//!
//! Keyword literals are case-insensitive substring tests against the item's
//! name, enclosing class and file path. Marker literals are case-insensitive
//! membership tests against the item's markers. An item passes a filter only
//! when every supplied expression evaluates true.

use std::collections::{BTreeSet, HashSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::schema::{CollectedData, TestItem};

/// Errors produced while parsing a filter expression
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FilterError {
    #[error("unexpected end of expression '{expr}'")]
    UnexpectedEnd { expr: String },

    #[error("unexpected token '{token}' in '{expr}'")]
    UnexpectedToken { token: String, expr: String },

    #[error("unbalanced parentheses in '{expr}'")]
    UnbalancedParens { expr: String },
}

/// Filter options as they travel on the wire
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyword: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub marker: Option<String>,
}

impl FilterSpec {
    pub fn new(keyword: Option<String>, marker: Option<String>) -> Self {
        Self { keyword, marker }
    }

    /// True when neither expression would filter anything
    pub fn is_empty(&self) -> bool {
        is_blank(self.keyword.as_deref()) && is_blank(self.marker.as_deref())
    }
}

fn is_blank(expr: Option<&str>) -> bool {
    expr.map_or(true, |e| e.trim().is_empty())
}

/// Parsed boolean expression over literal predicates
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    Literal(String),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

impl Expr {
    /// Parse an expression; blank input yields `None` (matches everything)
    pub fn parse(input: &str) -> Result<Option<Expr>, FilterError> {
        let tokens = tokenize(input);
        if tokens.is_empty() {
            return Ok(None);
        }
        let mut parser = ExprParser {
            tokens,
            pos: 0,
            source: input,
        };
        let expr = parser.parse_or()?;
        if let Some(token) = parser.peek() {
            return Err(match token {
                Token::RParen => FilterError::UnbalancedParens {
                    expr: input.to_string(),
                },
                other => FilterError::UnexpectedToken {
                    token: other.to_string(),
                    expr: input.to_string(),
                },
            });
        }
        Ok(Some(expr))
    }

    /// Evaluate with a predicate deciding each (lowercased) literal
    pub fn eval<F>(&self, literal: &F) -> bool
    where
        F: Fn(&str) -> bool,
    {
        match self {
            Expr::Literal(word) => literal(word),
            Expr::Not(inner) => !inner.eval(literal),
            Expr::And(lhs, rhs) => lhs.eval(literal) && rhs.eval(literal),
            Expr::Or(lhs, rhs) => lhs.eval(literal) || rhs.eval(literal),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    And,
    Or,
    Not,
    LParen,
    RParen,
    Word(String),
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Token::And => f.write_str("and"),
            Token::Or => f.write_str("or"),
            Token::Not => f.write_str("not"),
            Token::LParen => f.write_str("("),
            Token::RParen => f.write_str(")"),
            Token::Word(w) => f.write_str(w),
        }
    }
}

fn tokenize(input: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    for chunk in input.split_whitespace() {
        let mut word = String::new();
        for ch in chunk.chars() {
            if ch == '(' || ch == ')' {
                if !word.is_empty() {
                    tokens.push(classify(std::mem::take(&mut word)));
                }
                tokens.push(if ch == '(' { Token::LParen } else { Token::RParen });
            } else {
                word.push(ch);
            }
        }
        if !word.is_empty() {
            tokens.push(classify(word));
        }
    }
    tokens
}

fn classify(word: String) -> Token {
    match word.as_str() {
        "and" => Token::And,
        "or" => Token::Or,
        "not" => Token::Not,
        _ => Token::Word(word.to_lowercase()),
    }
}

struct ExprParser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    source: &'a str,
}

impl ExprParser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn parse_or(&mut self) -> Result<Expr, FilterError> {
        let mut lhs = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let rhs = self.parse_and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, FilterError> {
        let mut lhs = self.parse_unary()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let rhs = self.parse_unary()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, FilterError> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            let inner = self.parse_unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, FilterError> {
        match self.next() {
            Some(Token::Word(word)) => Ok(Expr::Literal(word)),
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(FilterError::UnbalancedParens {
                        expr: self.source.to_string(),
                    }),
                }
            }
            Some(Token::RParen) => Err(FilterError::UnbalancedParens {
                expr: self.source.to_string(),
            }),
            Some(other) => Err(FilterError::UnexpectedToken {
                token: other.to_string(),
                expr: self.source.to_string(),
            }),
            None => Err(FilterError::UnexpectedEnd {
                expr: self.source.to_string(),
            }),
        }
    }
}

/// Compiled keyword and marker filter
#[derive(Debug, Clone, Default)]
pub struct TestFilter {
    keyword: Option<Expr>,
    marker: Option<Expr>,
}

impl TestFilter {
    /// Compile both expressions; blank expressions are treated as absent
    pub fn new(keyword_expr: Option<&str>, marker_expr: Option<&str>) -> Result<Self, FilterError> {
        let keyword = match keyword_expr {
            Some(expr) => Expr::parse(expr)?,
            None => None,
        };
        let marker = match marker_expr {
            Some(expr) => Expr::parse(expr)?,
            None => None,
        };
        Ok(Self { keyword, marker })
    }

    pub fn from_spec(spec: &FilterSpec) -> Result<Self, FilterError> {
        Self::new(spec.keyword.as_deref(), spec.marker.as_deref())
    }

    /// True when no expression was supplied
    pub fn is_empty(&self) -> bool {
        self.keyword.is_none() && self.marker.is_none()
    }

    /// Decide whether an item is in scope for this run
    pub fn matches(&self, item: &TestItem) -> bool {
        if let Some(expr) = &self.keyword {
            if !keyword_matches(expr, item) {
                return false;
            }
        }
        if let Some(expr) = &self.marker {
            if !marker_matches(expr, item) {
                return false;
            }
        }
        true
    }
}

fn keyword_matches(expr: &Expr, item: &TestItem) -> bool {
    // Items without a name never match a keyword filter
    if item.name.is_empty() {
        return false;
    }
    let mut haystacks = vec![item.name.to_lowercase()];
    if let Some(class) = item.enclosing_class() {
        haystacks.push(class.to_lowercase());
    }
    if !item.file_path.is_empty() {
        haystacks.push(item.file_path.to_lowercase());
    }
    expr.eval(&|word: &str| haystacks.iter().any(|h| h.contains(word)))
}

fn marker_matches(expr: &Expr, item: &TestItem) -> bool {
    let markers: HashSet<String> = item.markers.iter().map(|m| m.to_lowercase()).collect();
    expr.eval(&|word: &str| markers.contains(word))
}

/// Keep only matching items; files left with no items are dropped
pub fn filter_collected_data(data: &CollectedData, filter: &TestFilter) -> CollectedData {
    if filter.is_empty() {
        return data
            .iter()
            .filter(|(_, items)| !items.is_empty())
            .map(|(path, items)| (path.clone(), items.clone()))
            .collect();
    }

    data.iter()
        .filter_map(|(path, items)| {
            let kept: Vec<TestItem> = items.iter().filter(|i| filter.matches(i)).cloned().collect();
            if kept.is_empty() {
                None
            } else {
                Some((path.clone(), kept))
            }
        })
        .collect()
}

/// Files that contain at least one matching test
pub fn files_with_matching_tests(data: &CollectedData, filter: &TestFilter) -> BTreeSet<String> {
    data.iter()
        .filter(|(_, items)| items.iter().any(|i| filter.matches(i)))
        .map(|(path, _)| path.clone())
        .collect()
}
