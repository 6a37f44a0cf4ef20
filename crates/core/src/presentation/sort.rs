use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use super::node::NodeValues;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SortKey {
    Name,
    #[default]
    TotalTime0,
    TotalTime1,
    SelfTime0,
    Calls,
}

/// Sibling order applied whenever children are listed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SortConfig {
    pub key: SortKey,
    pub descending: bool,
}

impl Default for SortConfig {
    fn default() -> Self {
        Self {
            key: SortKey::TotalTime0,
            descending: true,
        }
    }
}

impl SortConfig {
    pub fn new(key: SortKey, descending: bool) -> Self {
        Self { key, descending }
    }

    /// Orders two siblings. Ties fall back to the name so listings are
    /// stable across recomputations.
    pub fn compare(&self, a: (&str, &NodeValues), b: (&str, &NodeValues)) -> Ordering {
        let primary = match self.key {
            SortKey::Name => a.0.cmp(b.0),
            SortKey::TotalTime0 => a.1.total_time[0].cmp(&b.1.total_time[0]),
            SortKey::TotalTime1 => a.1.total_time[1].cmp(&b.1.total_time[1]),
            SortKey::SelfTime0 => a.1.self_time[0].cmp(&b.1.self_time[0]),
            SortKey::Calls => a.1.n_calls.cmp(&b.1.n_calls),
        };
        let primary = if self.descending {
            primary.reverse()
        } else {
            primary
        };
        primary.then_with(|| a.0.cmp(b.0))
    }
}
