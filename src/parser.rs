//! Builds the node tree out of lexer tokens.
//!
//! The parser is deliberately small: every token maps to exactly one node, so
//! a field access like `obj.field` comes out as two sibling nodes inside the
//! enclosing list, which is what the compiler's call handling expects. The
//! root of a parse is always a list starting with the `begin` keyword,
//! followed by every top-level form.

use std::ops::Range;
use std::sync::Arc;

use logos::Logos;

use crate::lexer::Token;
use crate::node::{Keyword, Node, NodeValue, SourceLocation};

#[derive(thiserror::Error, Debug, Clone)]
#[error("{message} ({location})")]
pub struct ParseError {
    pub message: String,
    pub location: SourceLocation,
}

impl ParseError {
    fn new(message: impl Into<String>, location: SourceLocation) -> Self {
        Self {
            message: message.into(),
            location,
        }
    }
}

/// Parse a whole source string into the root tree.
pub fn parse(source: &str, filename: &str) -> Result<Node, ParseError> {
    Parser::new(source, filename)?.parse_root()
}

struct Parser {
    filename: Arc<str>,
    /// byte offset of the start of every line, for line/column lookups
    line_starts: Vec<usize>,
    source_len: usize,
    tokens: Vec<(Token, Range<usize>)>,
    cursor: usize,
}

impl Parser {
    fn new(source: &str, filename: &str) -> Result<Self, ParseError> {
        let filename: Arc<str> = Arc::from(filename);
        let mut line_starts = vec![0];
        line_starts.extend(source.match_indices('\n').map(|(i, _)| i + 1));

        let mut tokens = Vec::new();
        for (token, span) in Token::lexer(source).spanned() {
            match token {
                Ok(token) => tokens.push((token, span)),
                Err(err) => {
                    let location = locate(&filename, &line_starts, span);
                    return Err(ParseError::new(err.to_string(), location));
                }
            }
        }

        Ok(Self {
            filename,
            line_starts,
            source_len: source.len(),
            tokens,
            cursor: 0,
        })
    }

    fn parse_root(mut self) -> Result<Node, ParseError> {
        let root_location = self.location_of(&(0..0));
        let mut children = vec![Node::new(
            NodeValue::Keyword(Keyword::Begin),
            root_location.clone(),
        )];
        while self.cursor < self.tokens.len() {
            children.push(self.parse_form()?);
        }
        Ok(Node::new(NodeValue::List(children), root_location))
    }

    fn next(&mut self) -> Option<(Token, Range<usize>)> {
        let entry = self.tokens.get(self.cursor).cloned();
        if entry.is_some() {
            self.cursor += 1;
        }
        entry
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.cursor).map(|(token, _)| token)
    }

    fn location_of(&self, span: &Range<usize>) -> SourceLocation {
        locate(&self.filename, &self.line_starts, span.clone())
    }

    fn end_location(&self) -> SourceLocation {
        locate(
            &self.filename,
            &self.line_starts,
            self.source_len..self.source_len,
        )
    }

    fn parse_form(&mut self) -> Result<Node, ParseError> {
        let Some((token, span)) = self.next() else {
            return Err(ParseError::new(
                "unexpected end of input",
                self.end_location(),
            ));
        };
        let location = self.location_of(&span);

        let node = match token {
            Token::LParen => {
                let children = self.parse_until(&Token::RParen, &location)?;
                Node::new(NodeValue::List(children), location)
            }
            Token::LBracket => {
                // [a b] desugars to (list a b); the leading `list` symbol is
                // what marks a data list for the macro evaluator
                let mut children = vec![Node::new(
                    NodeValue::Symbol("list".into()),
                    location.clone(),
                )];
                children.extend(self.parse_until(&Token::RBracket, &location)?);
                Node::new(NodeValue::List(children), location)
            }
            Token::LBrace => {
                // {a b} desugars to (begin a b)
                let mut children = vec![Node::new(
                    NodeValue::Keyword(Keyword::Begin),
                    location.clone(),
                )];
                children.extend(self.parse_until(&Token::RBrace, &location)?);
                Node::new(NodeValue::List(children), location)
            }
            Token::MacroStart => {
                let children = self.parse_until(&Token::RBrace, &location)?;
                Node::new(NodeValue::Macro(children), location)
            }
            Token::Quote => {
                if self.peek().is_none() {
                    return Err(ParseError::new("nothing to quote", location));
                }
                let quoted = self.parse_form()?;
                Node::new(
                    NodeValue::List(vec![
                        Node::new(NodeValue::Keyword(Keyword::Quote), location.clone()),
                        quoted,
                    ]),
                    location,
                )
            }
            Token::Number(n) => Node::new(NodeValue::Number(n), location),
            Token::String(s) => Node::new(NodeValue::String(s), location),
            Token::Spread(s) => Node::new(NodeValue::Spread(s), location),
            Token::Capture(s) => Node::new(NodeValue::Capture(s), location),
            Token::GetField(s) => Node::new(NodeValue::GetField(s), location),
            Token::Identifier(name) => match Keyword::from_name(&name) {
                Some(keyword) => Node::new(NodeValue::Keyword(keyword), location),
                None => Node::new(NodeValue::Symbol(name), location),
            },
            Token::RParen | Token::RBracket | Token::RBrace => {
                return Err(ParseError::new("unexpected closing delimiter", location));
            }
        };

        Ok(node)
    }

    fn parse_until(
        &mut self,
        end: &Token,
        opening: &SourceLocation,
    ) -> Result<Vec<Node>, ParseError> {
        let mut children = Vec::new();
        loop {
            match self.peek() {
                Some(token) if token == end => {
                    self.cursor += 1;
                    return Ok(children);
                }
                Some(_) => children.push(self.parse_form()?),
                None => {
                    return Err(ParseError::new(
                        "unclosed block, missing a closing delimiter",
                        opening.clone(),
                    ));
                }
            }
        }
    }
}

fn locate(filename: &Arc<str>, line_starts: &[usize], span: Range<usize>) -> SourceLocation {
    let line_index = line_starts.partition_point(|&start| start <= span.start) - 1;
    SourceLocation {
        filename: Arc::clone(filename),
        line: line_index as u32 + 1,
        column: (span.start - line_starts[line_index]) as u32 + 1,
        span,
    }
}
