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

/* model.rs: genes, codons/tRNA species, transcripts and ribosome records. */

use anyhow::{Result, bail};

use crate::config::{CHAR_TIME_TRNA, MAX_GENE_LEN, MAX_GENES};

/*
Integer handles. Everything in the engine lives in dense arrays indexed by
one of these, so lookups stay O(1) without mixing up which array an index
belongs to.
*/
macro_rules! handle {
    ($(#[$meta:meta])* $name:ident) => {
	$(#[$meta])*
	#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
	pub struct $name(pub u32);

	impl $name {
	    #[inline(always)]
	    pub fn index(self) -> usize {
		self.0 as usize
	    }

	    #[inline(always)]
	    pub fn from_index(index: usize) -> Self {
		Self(index as u32)
	    }
	}
    };
}

handle!(
    /// Row of the gene table.
    GeneId
);
handle!(
    /// One mRNA copy. Copies of a gene are numbered contiguously.
    TranscriptId
);
handle!(
    /// Slot in the dense active-ribosome array. Changes on compaction.
    RibosomeId
);
handle!(
    /// Sense codon, 0..61 in the order of the tRNA table.
    CodonId
);
handle!(
    /// tRNA species (anticodon class).
    SpeciesId
);

#[derive(Clone, Debug)]
pub struct Gene {
    pub sequence: Vec<CodonId>,
    pub copies: usize,
    pub initiation_weight: f64,
}

impl Gene {
    #[inline(always)]
    pub fn len(&self) -> usize {
	self.sequence.len()
    }
}

/// Immutable gene table.
#[derive(Clone, Debug)]
pub struct GeneTable {
    genes: Vec<Gene>,
}

impl GeneTable {
    /// Validate and wrap a list of genes. `num_codons` is the size of the
    /// codon table the sequences index into.
    pub fn new(genes: Vec<Gene>, num_codons: usize) -> Result<Self> {
	if genes.is_empty() {
	    bail!("gene table is empty");
	}
	if genes.len() > MAX_GENES {
	    bail!("{} genes exceeds maximum genes = {}", genes.len(), MAX_GENES);
	}

	for (g, gene) in genes.iter().enumerate() {
	    if gene.len() == 0 {
		bail!("gene {} has no codons", g);
	    }
	    if gene.len() > MAX_GENE_LEN {
		bail!(
		    "gene {} has {} codons, maximum allowed gene length is {}",
		    g, gene.len(), MAX_GENE_LEN
		);
	    }
	    if !(gene.initiation_weight >= 0.0) || !gene.initiation_weight.is_finite() {
		bail!("gene {} has invalid initiation probability {}", g, gene.initiation_weight);
	    }
	    if let Some(bad) = gene.sequence.iter().find(|c| c.index() >= num_codons) {
		bail!("gene {} refers to codon {} but only {} codons are defined", g, bad.0, num_codons);
	    }
	}

	Ok(Self { genes })
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
	self.genes.len()
    }

    #[inline(always)]
    pub fn get(&self, id: GeneId) -> &Gene {
	&self.genes[id.index()]
    }

    pub fn iter(&self) -> impl Iterator<Item = (GeneId, &Gene)> {
	self.genes
	    .iter()
	    .enumerate()
	    .map(|(g, gene)| (GeneId::from_index(g), gene))
    }

    pub fn total_copies(&self) -> usize {
	self.genes.iter().map(|g| g.copies).sum()
    }

    pub fn max_len(&self) -> usize {
	self.genes.iter().map(Gene::len).max().unwrap_or(0)
    }
}

/// One row of the tRNA table as read from disk.
#[derive(Clone, Debug, PartialEq)]
pub struct TrnaEntry {
    pub codon: String,
    pub species: SpeciesId,
    pub gene_copies: u64,
    pub wobble: f64,
}

#[derive(Clone, Debug)]
pub struct Codon {
    pub token: String,
    pub species: SpeciesId,
    /// Elongation rate per free tRNA per waiting ribosome.
    pub rate_constant: f64,
}

/// Codon → species mapping, per-codon rate constants and per-species pools.
#[derive(Clone, Debug)]
pub struct CodonTable {
    codons: Vec<Codon>,
    pools: Vec<u64>,
}

impl CodonTable {
    pub fn new(codons: Vec<Codon>, pools: Vec<u64>) -> Result<Self> {
	if codons.is_empty() {
	    bail!("codon table is empty");
	}
	for (c, codon) in codons.iter().enumerate() {
	    if codon.species.index() >= pools.len() {
		bail!("codon {} maps to undefined tRNA species {}", c, codon.species.0);
	    }
	    if !(codon.rate_constant >= 0.0) || !codon.rate_constant.is_finite() {
		bail!("codon {} has invalid rate constant {}", c, codon.rate_constant);
	    }
	}
	Ok(Self { codons, pools })
    }

    /// Derive pools and rate constants from raw tRNA table rows.
    ///
    /// Pools are sized from the canonical (wobble == 1.0) rows in proportion
    /// to their tRNA gene copy numbers; every codon's wobble efficiency is
    /// pre-scaled by the diffusion-limited constant of a tRNA.
    pub fn derive(entries: &[TrnaEntry], total_trna: u64, trna_sites: f64) -> Result<Self> {
	let num_species = entries
	    .iter()
	    .map(|e| e.species.index() + 1)
	    .max()
	    .unwrap_or(0);

	let total_gcn: u64 = entries
	    .iter()
	    .filter(|e| e.wobble == 1.0)
	    .map(|e| e.gene_copies)
	    .sum();
	if total_gcn == 0 {
	    bail!("tRNA table has no canonical (wobble = 1) entries with copies");
	}

	let mut pools = vec![0u64; num_species];
	for e in entries.iter().filter(|e| e.wobble == 1.0) {
	    let share = (e.gene_copies as f64) * (total_trna as f64) / (total_gcn as f64);
	    pools[e.species.index()] = share.floor() as u64;
	}

	let codons = entries
	    .iter()
	    .map(|e| Codon {
		token: e.codon.clone(),
		species: e.species,
		rate_constant: e.wobble / (CHAR_TIME_TRNA * trna_sites),
	    })
	    .collect();

	Self::new(codons, pools)
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
	self.codons.len()
    }

    #[inline(always)]
    pub fn get(&self, id: CodonId) -> &Codon {
	&self.codons[id.index()]
    }

    #[inline(always)]
    pub fn species(&self, id: CodonId) -> SpeciesId {
	self.codons[id.index()].species
    }

    pub fn num_species(&self) -> usize {
	self.pools.len()
    }

    pub fn pools(&self) -> &[u64] {
	&self.pools
    }

    pub fn iter(&self) -> impl Iterator<Item = (CodonId, &Codon)> {
	self.codons
	    .iter()
	    .enumerate()
	    .map(|(c, codon)| (CodonId::from_index(c), codon))
    }

    /// Look up a codon by its nucleotide token. T and U are interchangeable.
    pub fn find(&self, token: &str) -> Option<CodonId> {
	let wanted = normalize_codon(token);
	self.codons
	    .iter()
	    .position(|c| normalize_codon(&c.token) == wanted)
	    .map(CodonId::from_index)
    }
}

pub fn normalize_codon(token: &str) -> String {
    token
	.chars()
	.map(|ch| match ch.to_ascii_uppercase() {
	    'U' => 'T',
	    other => other,
	})
	.collect()
}

/// Per-copy record. Lives for the whole run.
#[derive(Clone, Debug)]
pub struct TranscriptCopy {
    pub gene: GeneId,
    pub initiation_events: u64,
    pub translation_events: u64,
    pub last_initiation: f64,
    pub sum_time_between_initiations: f64,
    pub sum_translation_time: f64,
    /// Slot in the gene's initiation queue, if initiable.
    pub initiation_slot: Option<usize>,
}

impl TranscriptCopy {
    pub fn new(gene: GeneId) -> Self {
	Self {
	    gene,
	    initiation_events: 0,
	    translation_events: 0,
	    last_initiation: 0.0,
	    sum_time_between_initiations: 0.0,
	    sum_translation_time: 0.0,
	    initiation_slot: None,
	}
    }
}

/// Back-pointer into an elongation queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueSlot {
    pub codon: CodonId,
    pub slot: usize,
}

/// A bound ribosome. Unbound ribosomes are only a count.
#[derive(Clone, Copy, Debug)]
pub struct RibosomeRecord {
    pub transcript: TranscriptId,
    pub position: usize,
    pub translation_start: f64,
    pub codon_arrival: f64,
    /// `Some` iff the ribosome is elongatable.
    pub queue: Option<QueueSlot>,
}
