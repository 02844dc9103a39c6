// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Binding Patterns
//!
//! Routing keys are split into segments on a delimiter (`.` by default). A binding
//! pattern is a sequence of segments where `*` matches exactly one key segment and
//! `#` matches zero or more contiguous key segments, at any position.

use crate::errors::AmqpError;
use std::fmt;

/// Default routing key segment delimiter
pub const DEFAULT_DELIMITER: char = '.';
/// Pattern segment matching exactly one routing key segment
pub const SINGLE_WILDCARD: &str = "*";
/// Pattern segment matching zero or more routing key segments
pub const MULTI_WILDCARD: &str = "#";

/// One segment of a binding pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Segment {
    Literal(String),
    Single,
    Multi,
}

/// A parsed binding pattern. Never empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BindingPattern {
    source: String,
    segments: Vec<Segment>,
    delimiter: char,
    literal: bool,
}

impl BindingPattern {
    /// Parses a topic pattern, recognising `*` and `#` segments.
    pub fn parse(pattern: &str, delimiter: char) -> Result<Self, AmqpError> {
        if pattern.is_empty() {
            return Err(AmqpError::InvalidPattern(pattern.to_owned()));
        }

        let segments = pattern
            .split(delimiter)
            .map(|seg| match seg {
                SINGLE_WILDCARD => Segment::Single,
                MULTI_WILDCARD => Segment::Multi,
                lit => Segment::Literal(lit.to_owned()),
            })
            .collect();

        Ok(BindingPattern {
            source: pattern.to_owned(),
            segments,
            delimiter,
            literal: false,
        })
    }

    /// Builds a pattern whose segments are all literal, so wildcard characters
    /// carry no meaning. Used by direct exchanges.
    ///
    /// Unlike topic patterns, an empty key is accepted: direct bindings on the
    /// empty routing key are legal.
    pub fn literal(key: &str) -> Self {
        BindingPattern {
            source: key.to_owned(),
            segments: vec![Segment::Literal(key.to_owned())],
            delimiter: DEFAULT_DELIMITER,
            literal: true,
        }
    }

    /// The pattern as it was written in the binding.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Returns true when the full routing key is consumed by the pattern.
    pub fn matches(&self, routing_key: &str) -> bool {
        if self.literal {
            return self.source == routing_key;
        }

        let key: Vec<&str> = routing_key.split(self.delimiter).collect();
        segments_match(&self.segments, &key)
    }
}

impl fmt::Display for BindingPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Dynamic programming over (pattern prefix, key prefix) so patterns with several
/// `#` segments stay linear in `pattern.len() * key.len()`.
fn segments_match(pattern: &[Segment], key: &[&str]) -> bool {
    // reachable[j]: the pattern prefix processed so far consumes exactly key[..j]
    let mut reachable = vec![false; key.len() + 1];
    reachable[0] = true;

    for seg in pattern {
        let mut next = vec![false; key.len() + 1];
        match seg {
            Segment::Multi => {
                let mut seen = false;
                for j in 0..=key.len() {
                    seen |= reachable[j];
                    next[j] = seen;
                }
            }
            Segment::Single => {
                for j in 0..key.len() {
                    next[j + 1] = reachable[j];
                }
            }
            Segment::Literal(lit) => {
                for j in 0..key.len() {
                    next[j + 1] = reachable[j] && key[j] == lit;
                }
            }
        }
        reachable = next;
    }

    reachable[key.len()]
}
