//! Expression chain
//!
//! The chain records the properties and operators traversed while
//! descending into a match or group expression. Descending never mutates a
//! chain in place: each branch concatenates its own copy, so siblings cannot
//! observe one another's frames.

use std::fmt;

use crate::schema::ResolvedProperty;

use super::errors::{QueryError, QueryResult};
use super::operators::ChainOperator;

/// One step of a chain
#[derive(Debug, Clone)]
pub enum Frame {
    Property(ResolvedProperty),
    Operator(ChainOperator),
}

impl Frame {
    pub fn as_property(&self) -> Option<&ResolvedProperty> {
        match self {
            Frame::Property(p) => Some(p),
            Frame::Operator(_) => None,
        }
    }

    pub fn as_operator(&self) -> Option<ChainOperator> {
        match self {
            Frame::Operator(op) => Some(*op),
            Frame::Property(_) => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Chain {
    frames: Vec<Frame>,
}

impl Chain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn get_at(&self, index: usize) -> Option<&Frame> {
        self.frames.get(index)
    }

    /// The innermost frame
    pub fn last(&self) -> Option<&Frame> {
        self.frames.last()
    }

    /// The frame directly above the innermost one
    pub fn parent_of_last(&self) -> Option<&Frame> {
        self.frames.len().checked_sub(2).and_then(|i| self.frames.get(i))
    }

    /// Appends a property frame. A property may not directly follow another
    /// property; nested fields are addressed with dotted paths instead.
    pub fn push_property(&mut self, property: ResolvedProperty) -> QueryResult<()> {
        if matches!(self.frames.last(), Some(Frame::Property(_))) {
            return Err(QueryError::unsupported(
                "Embedded property matching is unsupported. Use dot syntax.",
            )
            .at(self.to_string()));
        }
        self.frames.push(Frame::Property(property));
        Ok(())
    }

    /// Returns a new chain with `frame` appended
    pub fn concat(&self, frame: Frame) -> QueryResult<Chain> {
        let mut chain = self.clone();
        match frame {
            Frame::Property(p) => chain.push_property(p)?,
            Frame::Operator(op) => chain.frames.push(Frame::Operator(op)),
        }
        Ok(chain)
    }

    /// Returns a new chain with an operator frame appended
    pub fn with_operator(&self, operator: impl Into<ChainOperator>) -> Chain {
        let mut chain = self.clone();
        chain.frames.push(Frame::Operator(operator.into()));
        chain
    }

    /// Walks backwards to the nearest property frame.
    ///
    /// With a non-empty `allowed` list, the walk gives up at the first
    /// operator frame that is not in the list.
    pub fn last_property(&self, allowed: &[ChainOperator]) -> Option<&ResolvedProperty> {
        for frame in self.frames.iter().rev() {
            match frame {
                Frame::Property(p) => return Some(p),
                Frame::Operator(op) => {
                    if !allowed.is_empty() && !allowed.contains(op) {
                        return None;
                    }
                }
            }
        }
        None
    }

    pub fn last_operator(&self) -> Option<ChainOperator> {
        self.frames.iter().rev().find_map(Frame::as_operator)
    }

    /// True when any enclosing frame is the given operator
    pub fn contains_operator(&self, operator: impl Into<ChainOperator>) -> bool {
        let operator = operator.into();
        self.frames
            .iter()
            .any(|frame| frame.as_operator() == Some(operator))
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, frame) in self.frames.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            match frame {
                Frame::Property(p) => f.write_str(p.full_path())?,
                Frame::Operator(op) => f.write_str(op.as_str())?,
            }
        }
        Ok(())
    }
}
