// Ordered price ladder for one side of the book
// BTreeMap keyed by exact decimal price: O(log n) mutation, O(1) best level

use rust_decimal::Decimal;
use std::collections::BTreeMap;

use crate::core::types::{PriceLevel, Px, Qty};

/// Which side of the book, fixing the priority direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SideKind {
    /// Best = highest price, iterate descending.
    Bid,
    /// Best = lowest price, iterate ascending.
    Ask,
}

/// One side of a level-2 book. No two levels share a price; a stored level
/// always has positive quantity.
#[derive(Debug, Clone)]
pub struct BookSide {
    kind: SideKind,
    levels: BTreeMap<Px, Qty>,
}

impl BookSide {
    pub fn bid() -> Self {
        Self {
            kind: SideKind::Bid,
            levels: BTreeMap::new(),
        }
    }

    pub fn ask() -> Self {
        Self {
            kind: SideKind::Ask,
            levels: BTreeMap::new(),
        }
    }

    pub fn kind(&self) -> SideKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    pub fn clear(&mut self) {
        self.levels.clear();
    }

    /// Apply an absolute quantity at a price. Zero quantity removes the
    /// level; removing a missing level is a no-op.
    pub fn apply(&mut self, price: Px, qty: Qty) {
        if qty.is_zero() {
            self.levels.remove(&price);
        } else {
            self.levels.insert(price, qty);
        }
    }

    pub fn contains(&self, price: &Px) -> bool {
        self.levels.contains_key(price)
    }

    /// Best level: highest bid or lowest ask.
    pub fn best(&self) -> Option<(Px, Qty)> {
        match self.kind {
            SideKind::Bid => self.levels.iter().next_back().map(|(p, q)| (*p, *q)),
            SideKind::Ask => self.levels.iter().next().map(|(p, q)| (*p, *q)),
        }
    }

    /// Levels in price priority (best first).
    pub fn iter_priority(&self) -> Box<dyn Iterator<Item = (Px, Qty)> + '_> {
        match self.kind {
            SideKind::Bid => Box::new(self.levels.iter().rev().map(|(p, q)| (*p, *q))),
            SideKind::Ask => Box::new(self.levels.iter().map(|(p, q)| (*p, *q))),
        }
    }

    /// Top k levels in priority order.
    pub fn top(&self, k: usize) -> Vec<PriceLevel> {
        self.iter_priority()
            .take(k)
            .map(|(price, qty)| PriceLevel::new(price, qty))
            .collect()
    }

    /// Total resting notional on this side.
    pub fn notional(&self) -> Decimal {
        self.levels.iter().map(|(p, q)| *p * *q).sum()
    }
}
