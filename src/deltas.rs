/*
 * Copyright 2020 Actyx AG
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */
use std::collections::{btree_map, BTreeMap};
use std::ops::AddAssign;

/// Consolidated batch of output changes
///
/// Pairs of element and multiplicity are added with `+=`; changes that cancel out (a row
/// retracted and re-asserted within the same batch) leave no trace. Iteration is in the
/// element’s sort order, which makes batches deterministic.
#[derive(Debug, Clone, PartialEq)]
pub struct Deltas<D: Ord>(BTreeMap<D, isize>);

impl<D: Ord> Default for Deltas<D> {
    fn default() -> Self {
        Self(BTreeMap::new())
    }
}

impl<D: Ord> Deltas<D> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> btree_map::Iter<D, isize> {
        self.0.iter()
    }

    /// Number of retractions (rows to delete) in this batch
    pub fn removals(&self) -> usize {
        self.0.values().filter(|m| **m < 0).count()
    }

    pub fn into_vec(self) -> Vec<(D, isize)> {
        self.0.into_iter().collect()
    }
}

impl<D: Ord + Clone> Deltas<D> {
    pub fn to_vec(&self) -> Vec<(D, isize)> {
        self.0.iter().map(|(d, m)| (d.clone(), *m)).collect()
    }
}

impl<D: Ord> AddAssign<(D, isize)> for Deltas<D> {
    fn add_assign(&mut self, (elem, mult): (D, isize)) {
        if mult == 0 {
            return;
        }
        match self.0.entry(elem) {
            btree_map::Entry::Vacant(e) => {
                e.insert(mult);
            }
            btree_map::Entry::Occupied(mut e) => {
                *e.get_mut() += mult;
                if *e.get() == 0 {
                    e.remove();
                }
            }
        }
    }
}

impl<D: Ord> IntoIterator for Deltas<D> {
    type Item = (D, isize);
    type IntoIter = btree_map::IntoIter<D, isize>;
    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a, D: Ord> IntoIterator for &'a Deltas<D> {
    type Item = (&'a D, &'a isize);
    type IntoIter = btree_map::Iter<'a, D, isize>;
    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn must_cancel_out() {
        let mut d = Deltas::new();
        d += ("Mixer", 1);
        d += ("Filler", -1);
        d += ("Mixer", -1);
        d += ("Packer", 0);
        assert_eq!(d.to_vec(), vec![("Filler", -1)]);
        assert_eq!(d.removals(), 1);
    }

    #[test]
    fn must_iterate_in_sort_order() {
        let mut d = Deltas::new();
        d += ("Packer", 1);
        d += ("Filler", 2);
        d += ("Mixer", -1);
        d += ("Filler", -2);
        d += ("Filler", 1);
        assert_eq!(d.len(), 3);
        assert_eq!(d.into_vec(), vec![("Filler", 1), ("Mixer", -1), ("Packer", 1)]);
    }
}
