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

/* grid.rs: which ribosome (if any) sits on every codon of every transcript. */

use std::num::NonZeroU32;

use crate::model::{RibosomeId, TranscriptId};

/*
A cell stores ribosome id + 1 in a NonZeroU32 so that Option<Cell> stays four
bytes wide. With tens of thousands of transcripts several hundred codons long
the grid is by far the largest table in the run.
*/
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Cell(NonZeroU32);

impl Cell {
    #[inline(always)]
    fn new(id: RibosomeId) -> Self {
	match NonZeroU32::new(id.0.wrapping_add(1)) {
	    Some(v) => Cell(v),
	    None => panic!("ribosome id {} out of range", id.0),
	}
    }

    #[inline(always)]
    fn ribosome(self) -> RibosomeId {
	RibosomeId(self.0.get() - 1)
    }
}

/// Flat per-transcript occupancy rows.
#[derive(Clone, Debug)]
pub struct OccupancyGrid {
    cells: Vec<Option<Cell>>,
    offsets: Vec<usize>,
}

impl OccupancyGrid {
    /// One empty row per transcript, `lengths[t]` codons long.
    pub fn new<I: IntoIterator<Item = usize>>(lengths: I) -> Self {
	let mut offsets = vec![0];
	for len in lengths {
	    let last = *offsets.last().unwrap_or(&0);
	    offsets.push(last + len);
	}
	let total = *offsets.last().unwrap_or(&0);

	Self {
	    cells: vec![None; total],
	    offsets,
	}
    }

    pub fn num_transcripts(&self) -> usize {
	self.offsets.len() - 1
    }

    #[inline(always)]
    pub fn len_of(&self, transcript: TranscriptId) -> usize {
	let t = transcript.index();
	self.offsets[t + 1] - self.offsets[t]
    }

    /// Ribosome at `position`. Positions past the end of the transcript are
    /// always empty.
    #[inline(always)]
    pub fn get(&self, transcript: TranscriptId, position: usize) -> Option<RibosomeId> {
	if position >= self.len_of(transcript) {
	    return None;
	}
	self.cells[self.offsets[transcript.index()] + position].map(Cell::ribosome)
    }

    #[inline(always)]
    pub fn is_empty_at(&self, transcript: TranscriptId, position: usize) -> bool {
	self.get(transcript, position).is_none()
    }

    #[inline(always)]
    pub fn set(&mut self, transcript: TranscriptId, position: usize, ribosome: RibosomeId) {
	debug_assert!(position < self.len_of(transcript));
	let at = self.offsets[transcript.index()] + position;
	self.cells[at] = Some(Cell::new(ribosome));
    }

    #[inline(always)]
    pub fn clear(&mut self, transcript: TranscriptId, position: usize) {
	debug_assert!(position < self.len_of(transcript));
	let at = self.offsets[transcript.index()] + position;
	self.cells[at] = None;
    }

    /// Occupancy of one transcript as booleans, 5' to 3'.
    pub fn occupied(&self, transcript: TranscriptId) -> impl Iterator<Item = bool> + '_ {
	let t = transcript.index();
	self.cells[self.offsets[t]..self.offsets[t + 1]]
	    .iter()
	    .map(Option::is_some)
    }

    /// Every occupied `(position, ribosome)` of one transcript.
    pub fn ribosomes_on(&self, transcript: TranscriptId) -> impl Iterator<Item = (usize, RibosomeId)> + '_ {
	let t = transcript.index();
	self.cells[self.offsets[t]..self.offsets[t + 1]]
	    .iter()
	    .enumerate()
	    .filter_map(|(pos, cell)| cell.map(|c| (pos, c.ribosome())))
    }
}
