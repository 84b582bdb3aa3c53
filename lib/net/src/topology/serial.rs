// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Textual topology specification.
//!
//! Recursive grammar, used for the startup topology file and for live update
//! payloads (attach handshakes carry the joining subtree in this form):
//!
//! ```text
//! node := host ":" port ":" rank [ ":=>" "(" node { "," node } ")" ]
//! ```
//!
//! Example: `fe:5000:0:=>(cp:5001:1:=>(be:0:3,be:0:4),be:0:2)`.
//! A node without children is a back-end; whitespace is insignificant.

use thiserror::Error;

use super::Rank;

/// Parsed form of one node in a topology specification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpecNode {
    pub host: String,
    pub port: u16,
    pub rank: Rank,
    pub children: Vec<SpecNode>,
}

impl SpecNode {
    pub fn leaf(host: impl Into<String>, port: u16, rank: Rank) -> Self {
        Self {
            host: host.into(),
            port,
            rank,
            children: Vec::new(),
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// Serialize back into the textual grammar.
    pub fn serialize(&self) -> String {
        let mut out = String::new();
        self.write(&mut out);
        out
    }

    fn write(&self, out: &mut String) {
        out.push_str(&self.host);
        out.push(':');
        out.push_str(&self.port.to_string());
        out.push(':');
        out.push_str(&self.rank.to_string());
        if !self.children.is_empty() {
            out.push_str(":=>(");
            for (i, child) in self.children.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                child.write(out);
            }
            out.push(')');
        }
    }

    /// All ranks in this subtree, preorder.
    pub fn ranks(&self) -> Vec<Rank> {
        let mut out = vec![self.rank];
        for child in &self.children {
            out.extend(child.ranks());
        }
        out
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("unexpected end of input at offset {0}")]
    UnexpectedEnd(usize),
    #[error("expected '{expected}' at offset {offset}")]
    Expected { expected: char, offset: usize },
    #[error("invalid port '{0}'")]
    InvalidPort(String),
    #[error("invalid rank '{0}'")]
    InvalidRank(String),
    #[error("empty hostname at offset {0}")]
    EmptyHost(usize),
    #[error("trailing input at offset {0}")]
    Trailing(usize),
}

/// Parse a full topology specification.
pub fn parse(input: &str) -> Result<SpecNode, ParseError> {
    let mut parser = Parser {
        bytes: input.as_bytes(),
        pos: 0,
    };
    parser.skip_ws();
    let node = parser.node()?;
    parser.skip_ws();
    if parser.pos != parser.bytes.len() {
        return Err(ParseError::Trailing(parser.pos));
    }
    Ok(node)
}

struct Parser<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn skip_ws(&mut self) {
        while self.pos < self.bytes.len() && self.bytes[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn expect(&mut self, c: char) -> Result<(), ParseError> {
        if self.peek() == Some(c as u8) {
            self.pos += 1;
            Ok(())
        } else {
            Err(ParseError::Expected {
                expected: c,
                offset: self.pos,
            })
        }
    }

    fn until_delim(&mut self) -> &'a str {
        let start = self.pos;
        while let Some(b) = self.peek() {
            if matches!(b, b':' | b',' | b'(' | b')') || b.is_ascii_whitespace() {
                break;
            }
            self.pos += 1;
        }
        // Safety of from_utf8: delimiters are ASCII, so slicing at their
        // offsets keeps UTF-8 boundaries intact.
        std::str::from_utf8(&self.bytes[start..self.pos]).unwrap_or("")
    }

    fn node(&mut self) -> Result<SpecNode, ParseError> {
        self.skip_ws();
        let host_offset = self.pos;
        let host = self.until_delim().to_string();
        if host.is_empty() {
            return Err(ParseError::EmptyHost(host_offset));
        }
        self.expect(':')?;
        let port_str = self.until_delim();
        let port: u16 = port_str
            .parse()
            .map_err(|_| ParseError::InvalidPort(port_str.to_string()))?;
        self.expect(':')?;
        let rank_str = self.until_delim();
        let rank: Rank = rank_str
            .parse()
            .map_err(|_| ParseError::InvalidRank(rank_str.to_string()))?;

        let mut children = Vec::new();
        self.skip_ws();
        if self.peek() == Some(b':') {
            self.pos += 1;
            self.expect('=')?;
            self.expect('>')?;
            self.skip_ws();
            self.expect('(')?;
            loop {
                children.push(self.node()?);
                self.skip_ws();
                match self.peek() {
                    Some(b',') => {
                        self.pos += 1;
                    }
                    Some(b')') => {
                        self.pos += 1;
                        break;
                    }
                    Some(_) => {
                        return Err(ParseError::Expected {
                            expected: ')',
                            offset: self.pos,
                        })
                    }
                    None => return Err(ParseError::UnexpectedEnd(self.pos)),
                }
            }
        }

        Ok(SpecNode {
            host,
            port,
            rank,
            children,
        })
    }
}
