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

/* stats.rs: running accumulators and the end-of-run summary. */

use crate::model::{CodonId, GeneId, GeneTable, TranscriptCopy};

/// Accumulators updated by the engine.
///
/// Event statistics (elongation times, stall counts) are cheap and always
/// kept. Time-weighted integrals cost a pass over genes or species per tick
/// and are only kept when the matching output was requested.
#[derive(Clone, Debug)]
pub struct Statistics {
    pub codon_elongation_time: Vec<f64>,
    pub codon_elongation_events: Vec<u64>,

    /// Ribosomes currently stalled, per gene and per position of the tracked gene.
    pub stalled_by_gene: Vec<u64>,
    pub stalled_by_position: Vec<u64>,

    pub free_ribosome_integral: f64,
    pub free_trna_integral: Vec<f64>,
    pub stall_integral_by_gene: Vec<f64>,
    pub stall_integral_by_position: Vec<f64>,

    pub initiations: u64,
    pub terminations: u64,
}

impl Statistics {
    pub fn new(num_codons: usize, num_species: usize, num_genes: usize, tracked_len: usize) -> Self {
	Self {
	    codon_elongation_time: vec![0.0; num_codons],
	    codon_elongation_events: vec![0; num_codons],
	    stalled_by_gene: vec![0; num_genes],
	    stalled_by_position: vec![0; tracked_len],
	    free_ribosome_integral: 0.0,
	    free_trna_integral: vec![0.0; num_species],
	    stall_integral_by_gene: vec![0.0; num_genes],
	    stall_integral_by_position: vec![0.0; tracked_len],
	    initiations: 0,
	    terminations: 0,
	}
    }

    #[inline(always)]
    pub fn record_elongation(&mut self, codon: CodonId, duration: f64) {
	self.codon_elongation_time[codon.index()] += duration;
	self.codon_elongation_events[codon.index()] += 1;
    }

    pub fn accumulate_free_pools(&mut self, free_ribosomes: u64, free_trna: &[u64], dt: f64) {
	for (acc, &free) in self.free_trna_integral.iter_mut().zip(free_trna) {
	    *acc += free as f64 * dt;
	}
	self.free_ribosome_integral += free_ribosomes as f64 * dt;
    }

    pub fn accumulate_stalls(&mut self, dt: f64) {
	for (acc, &n) in self.stall_integral_by_gene.iter_mut().zip(&self.stalled_by_gene) {
	    *acc += n as f64 * dt;
	}
	for (acc, &n) in self.stall_integral_by_position.iter_mut().zip(&self.stalled_by_position) {
	    *acc += n as f64 * dt;
	}
    }

    pub fn total_stalled(&self) -> u64 {
	self.stalled_by_gene.iter().sum()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct CountedMean {
    pub events: u64,
    /// NaN when nothing was counted.
    pub mean: f64,
}

impl CountedMean {
    fn new(total: f64, events: u64) -> Self {
	Self { events, mean: total / events as f64 }
    }
}

/// Everything the report writers need, already averaged.
#[derive(Clone, Debug)]
pub struct Summary {
    pub codon_elongation: Vec<CountedMean>,
    pub gene_translation: Vec<CountedMean>,
    pub gene_initiation: Vec<CountedMean>,
    pub free_ribosomes: f64,
    /// `(species, average free count)` for species with a positive average.
    pub free_trna: Vec<(usize, f64)>,
    pub stall_by_gene: Vec<f64>,
    pub stall_by_position: Vec<f64>,
    pub tracked_gene: GeneId,
    pub initiations: u64,
    pub terminations: u64,
}

impl Summary {
    /// Fold per-transcript counters into per-gene figures and divide the
    /// time-weighted integrals by the averaging window.
    pub fn new(
	stats: &Statistics,
	transcripts: &[TranscriptCopy],
	genes: &GeneTable,
	tracked_gene: GeneId,
	window: f64,
    ) -> Self {
	let codon_elongation = stats
	    .codon_elongation_time
	    .iter()
	    .zip(&stats.codon_elongation_events)
	    .map(|(&total, &events)| CountedMean::new(total, events))
	    .collect();

	let mut translation_time = vec![0.0; genes.len()];
	let mut translations = vec![0u64; genes.len()];
	let mut initiation_gap = vec![0.0; genes.len()];
	let mut initiations = vec![0u64; genes.len()];
	for mRNA in transcripts {
	    let g = mRNA.gene.index();
	    translation_time[g] += mRNA.sum_translation_time;
	    translations[g] += mRNA.translation_events;
	    initiation_gap[g] += mRNA.sum_time_between_initiations;
	    initiations[g] += mRNA.initiation_events;
	}

	let gene_translation = translation_time
	    .iter()
	    .zip(&translations)
	    .map(|(&total, &n)| CountedMean::new(total, n))
	    .collect();
	let gene_initiation = initiation_gap
	    .iter()
	    .zip(&initiations)
	    .map(|(&total, &n)| CountedMean::new(total, n))
	    .collect();

	let free_trna = stats
	    .free_trna_integral
	    .iter()
	    .enumerate()
	    .filter(|&(_, &acc)| acc > 0.0)
	    .map(|(s, &acc)| (s, acc / window))
	    .collect();

	Self {
	    codon_elongation,
	    gene_translation,
	    gene_initiation,
	    free_ribosomes: stats.free_ribosome_integral / window,
	    free_trna,
	    stall_by_gene: stats.stall_integral_by_gene.iter().map(|v| v / window).collect(),
	    stall_by_position: stats.stall_integral_by_position.iter().map(|v| v / window).collect(),
	    tracked_gene,
	    initiations: stats.initiations,
	    terminations: stats.terminations,
	}
    }
}
