//! Generation vectors.
//!
//! A generation identifies one epoch of a layer's failure history. The vector
//! holds one counter per ancestor layer followed by the layer's own counter, so
//! a child's generation is always its parent's generation with exactly one
//! extra trailing coordinate. Operations carrying a superseded generation are
//! rejected instead of acting on stale monitoring state.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A single generation counter.
pub type GenNo = u32;

/// Immutable vector of generation counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Generation(Vec<GenNo>);

/// Result of comparing a queried generation against the enforcer's own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenComparison {
    /// Vectors are identical.
    Current,
    /// Lengths differ; the query is malformed for this layer.
    BadLength,
    /// Some query coordinate is below the local value: the enforcer has moved on.
    FutureGen,
    /// Some query coordinate is above the local value: the query names a
    /// generation this enforcer never produced.
    LongDead,
}

impl Generation {
    /// The empty generation used by the client-local base layer.
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn new(counters: Vec<GenNo>) -> Self {
        Self(counters)
    }

    /// Extend this generation by one trailing counter.
    pub fn compose(&self, counter: GenNo) -> Self {
        let mut counters = Vec::with_capacity(self.0.len() + 1);
        counters.extend_from_slice(&self.0);
        counters.push(counter);
        Self(counters)
    }

    /// Returns true iff `candidate` extends `self` by exactly one coordinate
    /// and agrees with it on the shared prefix.
    pub fn is_parent_of(&self, candidate: &Generation) -> bool {
        candidate.0.len() == self.0.len() + 1 && candidate.0[..self.0.len()] == self.0[..]
    }

    /// Compare `query` against this (local) generation, coordinate by coordinate.
    ///
    /// The first differing coordinate decides the outcome.
    pub fn compare_query(&self, query: &Generation) -> GenComparison {
        if self.0.len() != query.0.len() {
            return GenComparison::BadLength;
        }
        for (local, queried) in self.0.iter().zip(query.0.iter()) {
            if queried < local {
                return GenComparison::FutureGen;
            }
            if queried > local {
                return GenComparison::LongDead;
            }
        }
        GenComparison::Current
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn counters(&self) -> &[GenNo] {
        &self.0
    }

    /// The layer's own (last) counter, if any.
    pub fn local_counter(&self) -> Option<GenNo> {
        self.0.last().copied()
    }
}

/// `IsChild(parent, candidate)`.
pub fn is_child(parent: &Generation, candidate: &Generation) -> bool {
    parent.is_parent_of(candidate)
}

impl From<Vec<GenNo>> for Generation {
    fn from(counters: Vec<GenNo>) -> Self {
        Self(counters)
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, counter) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ".")?;
            }
            write!(f, "{counter}")?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compose_is_child() {
        let samples = [
            Generation::empty(),
            Generation::new(vec![0]),
            Generation::new(vec![3, 1]),
            Generation::new(vec![7, 0, 12]),
        ];
        for g in &samples {
            for n in [0, 1, 42, GenNo::MAX] {
                assert!(is_child(g, &g.compose(n)), "{g} should parent {n}");
            }
        }
    }

    #[test]
    fn test_generation_is_not_its_own_child() {
        let g = Generation::new(vec![2, 5]);
        assert!(!is_child(&g, &g));
        assert!(!is_child(&Generation::empty(), &Generation::empty()));
    }

    #[test]
    fn test_is_child_requires_matching_prefix() {
        let parent = Generation::new(vec![1, 2]);
        assert!(!is_child(&parent, &Generation::new(vec![1, 3, 0])));
        assert!(!is_child(&parent, &Generation::new(vec![0, 2, 0])));
        assert!(is_child(&parent, &Generation::new(vec![1, 2, 9])));
    }

    #[test]
    fn test_is_child_rejects_grandchildren() {
        let parent = Generation::new(vec![1]);
        assert!(!is_child(&parent, &Generation::new(vec![1, 0, 0])));
        assert!(!is_child(&parent, &Generation::empty()));
    }

    #[test]
    fn test_equality_is_elementwise() {
        assert_eq!(Generation::new(vec![1, 2]), Generation::new(vec![1, 2]));
        assert_ne!(Generation::new(vec![1, 2]), Generation::new(vec![2, 1]));
        assert_ne!(Generation::new(vec![1]), Generation::new(vec![1, 0]));
    }

    #[test]
    fn test_compare_query() {
        let local = Generation::new(vec![4, 2]);
        assert_eq!(local.compare_query(&local.clone()), GenComparison::Current);
        assert_eq!(
            local.compare_query(&Generation::new(vec![4])),
            GenComparison::BadLength
        );
        assert_eq!(
            local.compare_query(&Generation::new(vec![4, 1])),
            GenComparison::FutureGen
        );
        assert_eq!(
            local.compare_query(&Generation::new(vec![4, 3])),
            GenComparison::LongDead
        );
        // First differing coordinate wins.
        assert_eq!(
            local.compare_query(&Generation::new(vec![3, 9])),
            GenComparison::FutureGen
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(Generation::new(vec![1, 0, 7]).to_string(), "[1.0.7]");
        assert_eq!(Generation::empty().to_string(), "[]");
    }

    #[test]
    fn test_serializes_as_plain_array() {
        let json = serde_json::to_string(&Generation::new(vec![3, 4])).unwrap();
        assert_eq!(json, "[3,4]");
    }
}
