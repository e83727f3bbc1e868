/***
SMOPT: stochastic model of protein translation
    Copyright (C) 2025 Andrew T. Martens

    This program is free software: you can redistribute it and/or modify
    it under the terms of the GNU Affero General Public License, version 3,
    as published by the Free Software Foundation.

    This program is distributed in the hope that it will be useful,
    but WITHOUT ANY WARRANTY; without even the implied warranty of
    MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
    GNU Affero General Public License for more details.

    You should have received a copy of the GNU Affero General Public License
    along with this program.  If not, see <https://www.gnu.org/licenses/>.

e-mail: simplton@logical.bio
***/

/* swap_set.rs: a dense, unordered collection with O(1) removal by slot. */

/// Dense unordered set addressed by slot.
///
/// Removal overwrites the removed slot with the last element and shrinks the
/// set, so order is not preserved. Whoever keeps a back-pointer to the element
/// that used to be last must re-point it to the removed slot: after
/// `swap_remove(slot)`, `get(slot)` is exactly that relocated element (or
/// `None` if the removed element was the last one).
#[derive(Clone, Debug)]
pub struct SwapSet<T> {
    items: Vec<T>,
}

impl<T> Default for SwapSet<T> {
    fn default() -> Self {
	Self { items: Vec::new() }
    }
}

impl<T> SwapSet<T> {
    pub fn new() -> Self {
	Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
	Self { items: Vec::with_capacity(capacity) }
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
	self.items.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
	self.items.is_empty()
    }

    /// Append an element, returning the slot it now occupies.
    #[inline(always)]
    pub fn push(&mut self, item: T) -> usize {
	self.items.push(item);
	self.items.len() - 1
    }

    #[inline(always)]
    pub fn get(&self, slot: usize) -> Option<&T> {
	self.items.get(slot)
    }

    #[inline(always)]
    pub fn get_mut(&mut self, slot: usize) -> Option<&mut T> {
	self.items.get_mut(slot)
    }

    /// Remove the element at `slot` by moving the last element into it.
    ///
    /// Panics if `slot` is out of range: a stale back-pointer is a broken
    /// invariant, not a recoverable condition.
    #[inline(always)]
    pub fn swap_remove(&mut self, slot: usize) -> T {
	self.items.swap_remove(slot)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
	self.items.iter()
    }

    pub fn as_slice(&self) -> &[T] {
	&self.items
    }
}

impl<T: Copy> SwapSet<T> {
    /// Overwrite the element at `slot` in place.
    #[inline(always)]
    pub fn set(&mut self, slot: usize, item: T) {
	self.items[slot] = item;
    }
}

impl<'a, T> IntoIterator for &'a SwapSet<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
	self.items.iter()
    }
}
