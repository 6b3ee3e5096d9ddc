//! Exclusion filter evaluation.
//!
//! The children of an `Exclude` element are read in order. Literal
//! components act as fence posts and must be sorted; each gap between fence
//! posts (and before the first and after the last) may be covered by `Any`,
//! excluding everything in it, or by a `Bloom` filter, excluding members of
//! the filter. `Any` wins when both cover the same gap. A component equal to
//! a fence post is excluded.

use crate::bloom::BloomRef;
use crate::wire::{self, ExcludeItem};
use ccnidx_common::Result;
use std::cmp::Ordering;

/// Canonical component order: shorter first, then bytewise.
pub fn compare_components(a: &[u8], b: &[u8]) -> Ordering {
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

#[derive(Debug, Clone, Copy)]
enum Gap<'a> {
    Open,
    Any,
    Bloom(&'a [u8]),
}

impl<'a> Gap<'a> {
    fn cover(self, item: &ExcludeItem<'a>) -> Self {
        match (self, item) {
            (Gap::Any, _) => Gap::Any,
            (_, ExcludeItem::Any) => Gap::Any,
            (_, ExcludeItem::Bloom(b)) => Gap::Bloom(*b),
            (gap, ExcludeItem::Component(_)) => gap,
        }
    }

    fn excludes(self, comp: &[u8]) -> Result<bool> {
        match self {
            Gap::Open => Ok(false),
            Gap::Any => Ok(true),
            Gap::Bloom(bits) => Ok(BloomRef::parse(bits)?.matches(comp)),
        }
    }
}

/// Evaluates decoded exclusion items against a component.
pub fn excluded_by(items: &[ExcludeItem<'_>], comp: &[u8]) -> Result<bool> {
    let mut gap = Gap::Open;
    for item in items {
        match item {
            ExcludeItem::Component(fence) => match compare_components(comp, fence) {
                Ordering::Equal => return Ok(true),
                Ordering::Less => return gap.excludes(comp),
                Ordering::Greater => gap = Gap::Open,
            },
            other => gap = gap.cover(other),
        }
    }
    gap.excludes(comp)
}

/// Evaluates a wire-encoded `Exclude` element against a component.
pub fn excluded(exclude_wire: &[u8], comp: &[u8]) -> Result<bool> {
    let items = wire::exclude_items(exclude_wire)?;
    excluded_by(&items, comp)
}
