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

/* config.rs: physical constants, caps and run configuration. */

use anyhow::{Result, bail};

pub const MAX_GENES: usize = 5000;
pub const MAX_GENE_LEN: usize = 5000;
pub const MAX_TIME: f64 = 2_400_000.0;
pub const MAX_RIBOSOMES: u64 = 10_000_000;
pub const MAX_TRNAS: u64 = 1_000_000_000;
pub const NUM_SENSE_CODONS: usize = 61;

// Characteristic lengths (m) and movement times (s)
pub const CHAR_LEN_TRNA: f64 = 1.5e-8;
pub const CHAR_LEN_RIBO: f64 = 3e-8;
pub const CHAR_TIME_TRNA: f64 = 5.719e-4; // 4.45e-7 * 1285.1
pub const CHAR_TIME_RIBO: f64 = 5e-4;

// Lattice sites of a yeast-sized cell when no volume is given
pub const DEFAULT_TRNA_SITES: f64 = 1.24e7;
pub const DEFAULT_RIBOSOME_SITES: f64 = 1.56e6;
pub const MIN_SITES: f64 = 1e3;

/*
NOTE: the ribosome footprint is checked with two different offsets. At
initiation the codon 10 positions ahead of the new ribosome must be empty;
during elongation the codon 11 positions ahead of the *departing* codon is
checked, which is the same cell seen from one codon earlier. They are kept as
two constants rather than one: an 11-codon footprint probed conservatively at
the 5' end would look exactly the same.
*/
pub const INITIATION_FOOTPRINT: usize = 10;
pub const ELONGATION_FOOTPRINT: usize = 11;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Footprint {
    /// Offset probed ahead of a ribosome sitting on its destination codon.
    pub initiation: usize,
    /// Offset probed ahead of the codon a ribosome is leaving.
    pub elongation: usize,
}

impl Default for Footprint {
    fn default() -> Self {
	Self {
	    initiation: INITIATION_FOOTPRINT,
	    elongation: ELONGATION_FOOTPRINT,
	}
    }
}

impl Footprint {
    pub fn new(initiation: usize, elongation: usize) -> Result<Self> {
	if initiation == 0 {
	    bail!("ribosome footprint must cover at least one codon");
	}
	// Any other pairing lets a trailing ribosome run into the one ahead
	if elongation != initiation + 1 {
	    bail!(
		"elongation footprint offset {} must be one past the initiation offset {}",
		elongation, initiation
	    );
	}
	Ok(Self { initiation, elongation })
    }
}

/// Lattice sites available to tRNAs and ribosomes.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LatticeSites {
    pub trna: f64,
    pub ribosome: f64,
}

impl Default for LatticeSites {
    fn default() -> Self {
	Self {
	    trna: DEFAULT_TRNA_SITES,
	    ribosome: DEFAULT_RIBOSOME_SITES,
	}
    }
}

impl LatticeSites {
    /// Discretize a cell volume (m^3) into sites the size of a tRNA and of a
    /// ribosome.
    pub fn from_volume(volume: f64) -> Result<Self> {
	if !(volume > 0.0) || !volume.is_finite() {
	    bail!("Cell volume must be a positive number, got {}", volume);
	}
	let trna = (volume / CHAR_LEN_TRNA.powi(3)).floor();
	let ribosome = (volume / CHAR_LEN_RIBO.powi(3)).floor();

	if ribosome < MIN_SITES || trna < MIN_SITES {
	    bail!(
		"Available cytoplasmic space is too small: {} tRNA sites, {} ribosome sites",
		trna, ribosome
	    );
	}
	Ok(Self { trna, ribosome })
    }

    /// Denominator of the initiation propensity.
    pub fn initiation_normalizer(&self) -> f64 {
	CHAR_TIME_RIBO * self.ribosome
    }
}

/// Which statistics to accumulate and report (`-p1` .. `-p7`).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OutputSelection {
    pub codon_times: bool,
    pub gene_translation_times: bool,
    pub gene_initiation_times: bool,
    pub free_pools: bool,
    pub final_occupancy: bool,
    pub stalls: bool,
    pub snapshots: bool,
}

impl OutputSelection {
    pub fn from_flags(flags: &[u8]) -> Result<Self> {
	let mut outputs = Self::default();
	for &flag in flags {
	    match flag {
		1 => outputs.codon_times = true,
		2 => outputs.gene_translation_times = true,
		3 => outputs.gene_initiation_times = true,
		4 => outputs.free_pools = true,
		5 => outputs.final_occupancy = true,
		6 => outputs.stalls = true,
		7 => outputs.snapshots = true,
		_ => bail!("Invalid print option -p{}", flag),
	    }
	}
	Ok(outputs)
    }
}

/// Validated run parameters consumed by the engine.
#[derive(Clone, Debug)]
pub struct SimulationConfig {
    pub total_time: f64,
    pub burn_in: f64,
    pub total_ribosomes: u64,
    pub total_trna: u64,
    pub sites: LatticeSites,
    pub footprint: Footprint,
    pub tracked_gene: usize,
    pub seed: u64,
    pub outputs: OutputSelection,
}

impl Default for SimulationConfig {
    fn default() -> Self {
	Self {
	    total_time: 1500.0,
	    burn_in: 1000.0,
	    total_ribosomes: 200_000,
	    total_trna: 3_300_000,
	    sites: LatticeSites::default(),
	    footprint: Footprint::default(),
	    tracked_gene: 0,
	    seed: 1,
	    outputs: OutputSelection::default(),
	}
    }
}

impl SimulationConfig {
    pub fn validate(&self) -> Result<()> {
	if !(self.total_time > 0.0) {
	    bail!("Total time for simulation must be positive, got {}", self.total_time);
	}
	if self.total_time > MAX_TIME {
	    bail!("Total time for simulation exceeds maximum allowed time = {}", MAX_TIME);
	}
	if !(self.burn_in >= 0.0) || self.burn_in >= self.total_time {
	    bail!(
		"Time threshold {} should be >= 0 and < Total time {}",
		self.burn_in, self.total_time
	    );
	}
	if self.total_ribosomes == 0 || self.total_ribosomes > MAX_RIBOSOMES {
	    bail!(
		"Total # of ribosomes {} must lie in 1..={}",
		self.total_ribosomes, MAX_RIBOSOMES
	    );
	}
	if self.total_trna > MAX_TRNAS {
	    bail!("Total # of tRNAs {} exceeds maximum = {}", self.total_trna, MAX_TRNAS);
	}
	if self.sites.trna < MIN_SITES || self.sites.ribosome < MIN_SITES {
	    bail!("Available cytoplasmic space is too small");
	}
	Ok(())
    }

    /// Length of the window statistics are averaged over.
    pub fn averaging_window(&self) -> f64 {
	self.total_time - self.burn_in
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yeast_volume_gives_expected_sites() {
	let sites = LatticeSites::from_volume(4.2e-17).unwrap();
	assert!((sites.trna - 12_444_444.0).abs() <= 1.0);
	assert_eq!(sites.trna, sites.trna.floor());
	assert!(sites.ribosome > 1.5e6 && sites.ribosome < 1.6e6);
    }

    #[test]
    fn tiny_volume_is_fatal() {
	assert!(LatticeSites::from_volume(1e-22).is_err());
	assert!(LatticeSites::from_volume(0.0).is_err());
	assert!(LatticeSites::from_volume(f64::NAN).is_err());
    }

    #[test]
    fn burn_in_must_precede_end() {
	let mut config = SimulationConfig::default();
	assert!(config.validate().is_ok());

	config.burn_in = config.total_time;
	assert!(config.validate().is_err());

	config.burn_in = -1.0;
	assert!(config.validate().is_err());
    }

    #[test]
    fn total_time_is_capped() {
	let config = SimulationConfig {
	    total_time: MAX_TIME + 1.0,
	    burn_in: 0.0,
	    ..Default::default()
	};
	assert!(config.validate().is_err());
    }

    #[test]
    fn footprint_offsets_stay_distinct() {
	let footprint = Footprint::default();
	assert_eq!(footprint.initiation, 10);
	assert_eq!(footprint.elongation, 11);

	assert!(Footprint::new(1, 2).is_ok());
	assert!(Footprint::new(10, 10).is_err());
	assert!(Footprint::new(0, 1).is_err());
    }

    #[test]
    fn print_flags_map_to_outputs() {
	let outputs = OutputSelection::from_flags(&[1, 4, 7]).unwrap();
	assert!(outputs.codon_times && outputs.free_pools && outputs.snapshots);
	assert!(!outputs.stalls);
	assert!(OutputSelection::from_flags(&[8]).is_err());
    }
}
