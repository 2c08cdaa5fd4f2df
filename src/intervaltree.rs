// Copyright (C) 2023 Ant Group CO., Ltd. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::btree_map::BTreeMap;
use std::ops::Range;

use crate::error::EpcResult;

/// Non-overlapping ranges, each carrying a value.
#[derive(Debug)]
pub struct IntervalTree<V> {
    tree: BTreeMap<usize, (Range<usize>, V)>,
}

pub fn overlap(left: &Range<usize>, right: &Range<usize>) -> Option<Range<usize>> {
    let overlap_start = left.start.max(right.start);
    let overlap_end = left.end.min(right.end);
    if overlap_start >= overlap_end {
        None
    } else {
        Some(overlap_start..overlap_end)
    }
}

impl<V> Default for IntervalTree<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> IntervalTree<V> {
    pub fn new() -> Self {
        Self {
            tree: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// Insert a value into the tree for a given range.
    pub fn insert(&mut self, range: Range<usize>, value: V) -> EpcResult {
        if range.start >= range.end {
            return epc_result_err!(EINVAL, "Insert empty range");
        }
        // checking to see if any overlapping occurs
        let nodes = self.tree.range(..range.end);
        if let Some((_, node)) = nodes.last() {
            if overlap(&node.0, &range).is_some() {
                return epc_result_err!(EEXIST, "Insert overlap");
            }
        }
        self.tree.insert(range.start, (range, value));
        Ok(())
    }

    /// Remove the value stored for a given range.
    /// It only allows to remove the entire range which completely matches the input range.
    pub fn remove(&mut self, range: &Range<usize>) -> EpcResult<V> {
        match self.tree.remove(&range.start) {
            Some((var, value)) if &var == range => Ok(value),
            Some(node) => {
                self.tree.insert(range.start, node);
                epc_result_err!(EINVAL, "Range does not match")
            }
            None => epc_result_err!(EINVAL, "Range does not exist"),
        }
    }

    /// Returns the range and value that contains the point argument.
    pub fn find(&self, point: usize) -> Option<(&Range<usize>, &V)> {
        let nodes = self.tree.range(..=point);
        if let Some((_, (range, value))) = nodes.last() {
            if range.contains(&point) {
                return Some((range, value));
            }
        }
        None
    }

    /// Returns true if there is a range that contains the point argument.
    pub fn contains(&self, point: usize) -> bool {
        self.find(point).is_some()
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.tree.values().map(|(_, v)| v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_find_remove() {
        let mut tree = IntervalTree::new();
        tree.insert(0x1000..0x5000, 1).unwrap();
        tree.insert(0x8000..0xb000, 2).unwrap();
        assert!(tree.insert(0x4000..0x9000, 3).is_err());
        assert!(tree.insert(0x7000..0x9000, 3).is_err());

        assert_eq!(tree.find(0x1000).map(|(_, v)| *v), Some(1));
        assert_eq!(tree.find(0x4fff).map(|(_, v)| *v), Some(1));
        assert!(tree.find(0x5000).is_none());
        assert_eq!(tree.find(0xa000).map(|(_, v)| *v), Some(2));
        assert!(!tree.contains(0x0));

        assert!(tree.remove(&(0x1000..0x4000)).is_err());
        assert_eq!(tree.remove(&(0x1000..0x5000)).unwrap(), 1);
        assert_eq!(tree.len(), 1);
        assert!(tree.remove(&(0x1000..0x5000)).is_err());
    }
}
