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

/* engine.rs: the kinetic core. Propensities, event sampling, and the
incremental bookkeeping that keeps every queue consistent in O(1) per event. */

use anyhow::{Result, bail};

use std::sync::Arc;

use rand::Rng;
use rand_distr::StandardUniform;

use thiserror::Error;
use tracing::debug;

use crate::config::SimulationConfig;
use crate::grid::OccupancyGrid;
use crate::model::{
    CodonId, CodonTable, GeneId, GeneTable, QueueSlot, RibosomeId, RibosomeRecord,
    TranscriptCopy, TranscriptId,
};
use crate::stats::{Statistics, Summary};
use crate::swap_set::SwapSet;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SimulationError {
    /// Nothing can happen any more: every bound ribosome is blocked or
    /// starved of tRNA and no initiation is possible.
    #[error(
	"deadlock at t = {time}: total propensity is {total} \
	 ({free_ribosomes} free ribosomes, {stalled} stalled)"
    )]
    Deadlock {
	time: f64,
	total: f64,
	free_ribosomes: u64,
	stalled: u64,
    },

    #[error("invariant violated at t = {time}: {message}")]
    InvariantViolation { time: f64, message: String },
}

/// What a tick did.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Event {
    Initiation {
	transcript: TranscriptId,
	ribosome: RibosomeId,
    },
    /// The ribosome left `codon` and is still bound.
    Elongation {
	ribosome: RibosomeId,
	codon: CodonId,
    },
    /// A ribosome left the last codon `codon` and was released.
    Termination {
	transcript: TranscriptId,
	codon: CodonId,
    },
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Tick {
    /// Time at which the event fired.
    pub time: f64,
    pub dt: f64,
    pub event: Event,
}

/// State of every transcript at a whole simulated second.
pub struct Snapshot<'a> {
    pub second: u64,
    pub time: f64,
    pub grid: &'a OccupancyGrid,
    pub transcripts: &'a [TranscriptCopy],
}

/// Bound ribosomes, kept dense: the id of a ribosome is its slot.
#[derive(Clone, Debug)]
pub struct RibosomePool {
    active: SwapSet<RibosomeRecord>,
    free: u64,
    total: u64,
}

impl RibosomePool {
    fn new(total: u64) -> Self {
	Self {
	    active: SwapSet::new(),
	    free: total,
	    total,
	}
    }

    #[inline(always)]
    pub fn get(&self, id: RibosomeId) -> &RibosomeRecord {
	&self.active.as_slice()[id.index()]
    }

    #[inline(always)]
    fn get_mut(&mut self, id: RibosomeId) -> &mut RibosomeRecord {
	match self.active.get_mut(id.index()) {
	    Some(record) => record,
	    None => panic!("ribosome {} is not bound", id.0),
	}
    }

    #[inline(always)]
    fn bind(&mut self, record: RibosomeRecord) -> RibosomeId {
	self.free -= 1;
	RibosomeId::from_index(self.active.push(record))
    }

    /// Unbind `id`. The last bound ribosome takes over the slot, so its old id
    /// becomes `id`; the caller re-points the grid and queues at it.
    #[inline(always)]
    fn release(&mut self, id: RibosomeId) -> Option<RibosomeRecord> {
	self.active.swap_remove(id.index());
	self.free += 1;
	self.active.get(id.index()).copied()
    }

    pub fn free(&self) -> u64 {
	self.free
    }

    pub fn bound(&self) -> usize {
	self.active.len()
    }

    pub fn total(&self) -> u64 {
	self.total
    }

    pub fn iter(&self) -> impl Iterator<Item = (RibosomeId, &RibosomeRecord)> {
	self.active
	    .iter()
	    .enumerate()
	    .map(|(r, record)| (RibosomeId::from_index(r), record))
    }
}

/// Elongatable ribosomes, grouped by the codon they sit on.
#[derive(Clone, Debug)]
pub struct ElongationQueues {
    queues: Vec<SwapSet<RibosomeId>>,
}

impl ElongationQueues {
    fn new(num_codons: usize) -> Self {
	Self { queues: vec![SwapSet::new(); num_codons] }
    }

    #[inline(always)]
    pub fn len(&self, codon: CodonId) -> usize {
	self.queues[codon.index()].len()
    }

    #[inline(always)]
    pub fn get(&self, codon: CodonId, slot: usize) -> Option<RibosomeId> {
	self.queues[codon.index()].get(slot).copied()
    }

    #[inline(always)]
    fn push(&mut self, codon: CodonId, ribosome: RibosomeId) -> usize {
	self.queues[codon.index()].push(ribosome)
    }

    /// Swap-remove, returning whichever ribosome moved into `slot`.
    #[inline(always)]
    fn remove(&mut self, codon: CodonId, slot: usize) -> Option<RibosomeId> {
	let queue = &mut self.queues[codon.index()];
	queue.swap_remove(slot);
	queue.get(slot).copied()
    }

    #[inline(always)]
    fn set(&mut self, codon: CodonId, slot: usize, ribosome: RibosomeId) {
	self.queues[codon.index()].set(slot, ribosome);
    }

    pub fn total(&self) -> usize {
	self.queues.iter().map(SwapSet::len).sum()
    }
}

/// Initiable transcripts per gene, plus Σ |queue_g| × weight_g.
#[derive(Clone, Debug)]
pub struct InitiationQueues {
    queues: Vec<SwapSet<TranscriptId>>,
    weights: Vec<f64>,
    weight_total: f64,
    /// Initiable transcripts of genes with a positive weight. When this drops
    /// to zero the running total is reset, so rounding never leaves a phantom
    /// initiation propensity behind.
    weighted_eligible: usize,
}

impl InitiationQueues {
    fn new(genes: &GeneTable) -> Self {
	Self {
	    queues: genes
		.iter()
		.map(|(_, gene)| SwapSet::with_capacity(gene.copies))
		.collect(),
	    weights: genes.iter().map(|(_, gene)| gene.initiation_weight).collect(),
	    weight_total: 0.0,
	    weighted_eligible: 0,
	}
    }

    #[inline(always)]
    pub fn len(&self, gene: GeneId) -> usize {
	self.queues[gene.index()].len()
    }

    pub fn get(&self, gene: GeneId, slot: usize) -> Option<TranscriptId> {
	self.queues[gene.index()].get(slot).copied()
    }

    #[inline(always)]
    pub fn total_weight(&self) -> f64 {
	if self.weighted_eligible == 0 {
	    0.0
	} else {
	    self.weight_total.max(0.0)
	}
    }

    fn push(&mut self, gene: GeneId, transcript: TranscriptId) -> usize {
	let weight = self.weights[gene.index()];
	if weight > 0.0 {
	    self.weight_total += weight;
	    self.weighted_eligible += 1;
	}
	self.queues[gene.index()].push(transcript)
    }

    fn remove(&mut self, gene: GeneId, slot: usize) -> Option<TranscriptId> {
	let weight = self.weights[gene.index()];
	if weight > 0.0 {
	    self.weighted_eligible -= 1;
	    if self.weighted_eligible == 0 {
		self.weight_total = 0.0;
	    } else {
		self.weight_total -= weight;
	    }
	}
	let queue = &mut self.queues[gene.index()];
	queue.swap_remove(slot);
	queue.get(slot).copied()
    }

    /// Pick a gene by cumulative eligible weight; `u` lies in
    /// `[0, total_weight)`. Genes with zero weight are never returned.
    fn choose_gene(&self, u: f64) -> Option<GeneId> {
	let mut cumulative = 0.0;
	let mut last = None;
	for (g, (queue, &weight)) in self.queues.iter().zip(&self.weights).enumerate() {
	    let eligible = queue.len() as f64 * weight;
	    if eligible > 0.0 {
		cumulative += eligible;
		last = Some(GeneId::from_index(g));
		if u < cumulative {
		    return last;
		}
	    }
	}
	// Rounding in the running total can leave u just past the sum
	last
    }

    fn recomputed_weight(&self) -> f64 {
	self.queues
	    .iter()
	    .zip(&self.weights)
	    .map(|(queue, &weight)| queue.len() as f64 * weight)
	    .sum()
    }
}

/// One simulated cell. Owns every piece of mutable run state.
pub struct Engine<R> {
    genes: Arc<GeneTable>,
    codons: Arc<CodonTable>,
    config: SimulationConfig,
    initiation_normalizer: f64,
    tracked_gene: GeneId,
    verify: bool,

    transcripts: Vec<TranscriptCopy>,
    grid: OccupancyGrid,
    ribosomes: RibosomePool,
    elongation: ElongationQueues,
    initiation: InitiationQueues,
    free_trna: Vec<u64>,
    elongation_propensity: Vec<f64>,

    stats: Statistics,
    time: f64,
    rng: R,
}

impl<R: Rng> Engine<R> {
    pub fn new(
	genes: Arc<GeneTable>,
	codons: Arc<CodonTable>,
	config: SimulationConfig,
	rng: R,
    ) -> Result<Self> {
	config.validate()?;
	if config.tracked_gene >= genes.len() {
	    bail!(
		"tracked gene {} does not exist ({} genes loaded)",
		config.tracked_gene, genes.len()
	    );
	}
	if let Some((g, _)) = genes
	    .iter()
	    .find(|(_, gene)| gene.sequence.iter().any(|c| c.index() >= codons.len()))
	{
	    bail!("gene {} uses codons missing from the codon table", g.0);
	}

	let tracked_gene = GeneId::from_index(config.tracked_gene);

	// Copies of a gene get contiguous transcript ids
	let transcripts: Vec<TranscriptCopy> = genes
	    .iter()
	    .flat_map(|(g, gene)| (0..gene.copies).map(move |_| TranscriptCopy::new(g)))
	    .collect();

	let grid = OccupancyGrid::new(
	    transcripts.iter().map(|mRNA| genes.get(mRNA.gene).len())
	);

	let stats = Statistics::new(
	    codons.len(),
	    codons.num_species(),
	    genes.len(),
	    genes.get(tracked_gene).len(),
	);

	let mut engine = Self {
	    initiation_normalizer: config.sites.initiation_normalizer(),
	    ribosomes: RibosomePool::new(config.total_ribosomes),
	    elongation: ElongationQueues::new(codons.len()),
	    initiation: InitiationQueues::new(&genes),
	    free_trna: codons.pools().to_vec(),
	    elongation_propensity: vec![0.0; codons.len()],
	    verify: false,
	    time: 0.0,
	    tracked_gene,
	    transcripts,
	    grid,
	    stats,
	    genes,
	    codons,
	    config,
	    rng,
	};

	// At the start every transcript is bare and can be initiated
	for t in 0..engine.transcripts.len() {
	    engine.open_for_initiation(TranscriptId::from_index(t));
	}

	debug!(
	    genes = engine.genes.len(),
	    transcripts = engine.transcripts.len(),
	    codons = engine.codons.len(),
	    species = engine.codons.num_species(),
	    ribosomes = engine.ribosomes.total(),
	    "engine initialized"
	);

	Ok(engine)
    }

    /// Verify every invariant after each event. Slow; meant for debugging.
    pub fn with_invariant_checks(mut self, enabled: bool) -> Self {
	self.verify = enabled;
	self
    }

    pub fn time(&self) -> f64 {
	self.time
    }

    pub fn grid(&self) -> &OccupancyGrid {
	&self.grid
    }

    pub fn transcripts(&self) -> &[TranscriptCopy] {
	&self.transcripts
    }

    pub fn ribosomes(&self) -> &RibosomePool {
	&self.ribosomes
    }

    pub fn elongation_queues(&self) -> &ElongationQueues {
	&self.elongation
    }

    pub fn stats(&self) -> &Statistics {
	&self.stats
    }

    pub fn summary(&self) -> Summary {
	Summary::new(
	    &self.stats,
	    &self.transcripts,
	    &self.genes,
	    self.tracked_gene,
	    self.config.averaging_window(),
	)
    }

    /// Run until the configured total time. `on_second` sees the grid once
    /// for every whole simulated second the clock passes.
    pub fn run<F>(&mut self, mut on_second: F) -> Result<()>
    where
	F: FnMut(&Snapshot<'_>) -> Result<()>,
    {
	let mut next_second: u64 = 0;

	while self.time < self.config.total_time {
	    self.step()?;

	    if self.verify {
		self.check_invariants()?;
	    }

	    while (next_second as f64) < self.time {
		on_second(&Snapshot {
		    second: next_second,
		    time: self.time,
		    grid: &self.grid,
		    transcripts: &self.transcripts,
		})?;
		next_second += 1;
	    }
	}

	debug!(
	    time = self.time,
	    initiations = self.stats.initiations,
	    terminations = self.stats.terminations,
	    bound = self.ribosomes.bound(),
	    "run finished"
	);

	Ok(())
    }

    /// One event: propensities, time advance, sampling, state update.
    pub fn step(&mut self) -> Result<Tick, SimulationError> {
	let free_ribosomes = self.ribosomes.free;
	let initiation = self.initiation.total_weight()
	    * free_ribosomes as f64 / self.initiation_normalizer;

	let mut total = initiation;
	for (c, codon) in self.codons.iter() {
	    let rate = self.free_trna[codon.species.index()] as f64
		* codon.rate_constant
		* self.elongation.len(c) as f64;
	    self.elongation_propensity[c.index()] = rate;
	    total += rate;
	}

	if !(total > 0.0) || !total.is_finite() {
	    return Err(SimulationError::Deadlock {
		time: self.time,
		total,
		free_ribosomes,
		stalled: self.stats.total_stalled(),
	    });
	}

	// Mean waiting time, not an exponential draw
	let dt = 1.0 / total;

	// Time-weighted statistics use the state valid over [t, t + dt)
	if self.time > self.config.burn_in {
	    if self.config.outputs.free_pools {
		self.stats.accumulate_free_pools(free_ribosomes, &self.free_trna, dt);
	    }
	    if self.config.outputs.stalls {
		self.stats.accumulate_stalls(dt);
	    }
	}
	self.time += dt;

	let u: f64 = self.rng.sample(StandardUniform);
	let coin = u * total;

	let event = match self.choose_event(coin, initiation) {
	    None => self.initiate()?,
	    Some(codon) => {
		let len = self.elongation.len(codon);
		let slot = self.rng.random_range(0..len);
		let ribosome = self.elongation.get(codon, slot).ok_or_else(|| {
		    SimulationError::InvariantViolation {
			time: self.time,
			message: format!("elongation queue {} has no slot {}", codon.0, slot),
		    }
		})?;
		self.elongate(ribosome)
	    }
	};

	Ok(Tick { time: self.time, dt, event })
    }

    /// `None` for initiation, otherwise the codon whose queue fires.
    fn choose_event(&self, coin: f64, initiation: f64) -> Option<CodonId> {
	if coin < initiation {
	    return None;
	}
	let mut cumulative = initiation;
	let mut last = None;
	for (c, &rate) in self.elongation_propensity.iter().enumerate() {
	    if rate > 0.0 {
		cumulative += rate;
		last = Some(CodonId::from_index(c));
		if coin < cumulative {
		    return last;
		}
	    }
	}
	// Fell off the end by rounding: take the last codon that could fire,
	// or initiation if none could
	last
    }

    fn initiate(&mut self) -> Result<Event, SimulationError> {
	let u: f64 = self.rng.sample(StandardUniform);
	let gene = self
	    .initiation
	    .choose_gene(u * self.initiation.total_weight())
	    .ok_or_else(|| SimulationError::InvariantViolation {
		time: self.time,
		message: "initiation selected with no initiable transcript".to_string(),
	    })?;

	let slot = self.rng.random_range(0..self.initiation.len(gene));
	let transcript = self.initiation.queues[gene.index()].as_slice()[slot];

	Ok(self.initiate_on(transcript))
    }

    /// Bind a free ribosome to codon 0 of `transcript`.
    fn initiate_on(&mut self, transcript: TranscriptId) -> Event {
	self.close_for_initiation(transcript);

	let time = self.time;
	let mRNA = &mut self.transcripts[transcript.index()];
	if time > self.config.burn_in {
	    mRNA.initiation_events += 1;
	    mRNA.sum_time_between_initiations += time - mRNA.last_initiation;
	}
	mRNA.last_initiation = time;
	let gene = mRNA.gene;

	let ribosome = self.ribosomes.bind(RibosomeRecord {
	    transcript,
	    position: 0,
	    translation_start: time,
	    codon_arrival: time,
	    queue: None,
	});
	self.grid.set(transcript, 0, ribosome);

	if self.grid.is_empty_at(transcript, self.config.footprint.initiation) {
	    self.enqueue(ribosome);
	} else {
	    self.stall(gene, 0);
	}

	self.stats.initiations += 1;
	Event::Initiation { transcript, ribosome }
    }

    /// Move an elongatable ribosome one codon forward, or release it from the
    /// stop codon.
    fn elongate(&mut self, ribosome: RibosomeId) -> Event {
	let genes = Arc::clone(&self.genes);
	let record = *self.ribosomes.get(ribosome);
	let transcript = record.transcript;
	let p = record.position;
	let gene = self.transcripts[transcript.index()].gene;
	let sequence = &genes.get(gene).sequence;
	let codon = sequence[p];
	let time = self.time;

	// The tRNA decoded at the previous codon leaves through the E site
	if p > 0 {
	    let species = self.codons.species(sequence[p - 1]);
	    self.free_trna[species.index()] += 1;
	}

	if time > self.config.burn_in {
	    self.stats.record_elongation(codon, time - record.codon_arrival);
	}

	if p == sequence.len() - 1 {
	    return self.terminate(ribosome);
	}

	let footprint = self.config.footprint;
	let clear_ahead = self.grid.is_empty_at(transcript, p + footprint.elongation);

	self.grid.clear(transcript, p);
	let new = p + 1;
	self.grid.set(transcript, new, ribosome);
	self.ribosomes.get_mut(ribosome).position = new;

	if clear_ahead {
	    if sequence[new] != codon {
		self.dequeue(ribosome);
		self.enqueue(ribosome);
	    }
	} else {
	    self.dequeue(ribosome);
	    self.stall(gene, new);
	}

	// The tRNA of the codon just decoded stays bound in the P site
	let species = self.codons.species(codon);
	self.free_trna[species.index()] -= 1;

	if new >= footprint.elongation {
	    self.release_blocked(transcript, new - footprint.elongation);
	}
	if new == footprint.elongation - 1 {
	    self.open_for_initiation(transcript);
	}

	self.ribosomes.get_mut(ribosome).codon_arrival = time;
	Event::Elongation { ribosome, codon }
    }

    fn terminate(&mut self, ribosome: RibosomeId) -> Event {
	let record = *self.ribosomes.get(ribosome);
	let transcript = record.transcript;
	let p = record.position;
	let time = self.time;

	self.grid.clear(transcript, p);
	self.dequeue(ribosome);

	let mRNA = &mut self.transcripts[transcript.index()];
	if time > self.config.burn_in {
	    mRNA.translation_events += 1;
	    mRNA.sum_translation_time += time - record.translation_start;
	}
	let codon = self.genes.get(mRNA.gene).sequence[p];
	self.stats.terminations += 1;

	let footprint = self.config.footprint;
	if p + 1 >= footprint.elongation {
	    self.release_blocked(transcript, p + 1 - footprint.elongation);
	} else {
	    // Never got past the 5' window, so nothing else re-opened it
	    self.open_for_initiation(transcript);
	}

	// Keep the bound ribosomes dense
	if let Some(moved) = self.ribosomes.release(ribosome) {
	    self.grid.set(moved.transcript, moved.position, ribosome);
	    if let Some(q) = moved.queue {
		self.elongation.set(q.codon, q.slot, ribosome);
	    }
	}

	Event::Termination { transcript, codon }
    }

    /// A ribosome at `position` that was waiting on the one ahead may now move.
    fn release_blocked(&mut self, transcript: TranscriptId, position: usize) {
	let Some(behind) = self.grid.get(transcript, position) else {
	    return;
	};
	if self.ribosomes.get(behind).queue.is_some() {
	    return;
	}
	self.enqueue(behind);
	let gene = self.transcripts[transcript.index()].gene;
	self.unstall(gene, position);
    }

    #[inline(always)]
    fn codon_under(&self, ribosome: RibosomeId) -> CodonId {
	let record = self.ribosomes.get(ribosome);
	let gene = self.transcripts[record.transcript.index()].gene;
	self.genes.get(gene).sequence[record.position]
    }

    #[inline(always)]
    fn enqueue(&mut self, ribosome: RibosomeId) {
	let codon = self.codon_under(ribosome);
	let slot = self.elongation.push(codon, ribosome);
	self.ribosomes.get_mut(ribosome).queue = Some(QueueSlot { codon, slot });
    }

    #[inline(always)]
    fn dequeue(&mut self, ribosome: RibosomeId) {
	let Some(q) = self.ribosomes.get_mut(ribosome).queue.take() else {
	    return;
	};
	if let Some(moved) = self.elongation.remove(q.codon, q.slot) {
	    self.ribosomes.get_mut(moved).queue = Some(q);
	}
    }

    fn open_for_initiation(&mut self, transcript: TranscriptId) {
	let mRNA = &self.transcripts[transcript.index()];
	if mRNA.initiation_slot.is_some() {
	    return;
	}
	let slot = self.initiation.push(mRNA.gene, transcript);
	self.transcripts[transcript.index()].initiation_slot = Some(slot);
    }

    fn close_for_initiation(&mut self, transcript: TranscriptId) {
	let mRNA = &mut self.transcripts[transcript.index()];
	let Some(slot) = mRNA.initiation_slot.take() else {
	    return;
	};
	let gene = mRNA.gene;
	if let Some(moved) = self.initiation.remove(gene, slot) {
	    self.transcripts[moved.index()].initiation_slot = Some(slot);
	}
    }

    #[inline(always)]
    fn stall(&mut self, gene: GeneId, position: usize) {
	self.stats.stalled_by_gene[gene.index()] += 1;
	if gene == self.tracked_gene {
	    self.stats.stalled_by_position[position] += 1;
	}
    }

    #[inline(always)]
    fn unstall(&mut self, gene: GeneId, position: usize) {
	self.stats.stalled_by_gene[gene.index()] -= 1;
	if gene == self.tracked_gene {
	    self.stats.stalled_by_position[position] -= 1;
	}
    }

    /// Full O(state) audit of every conservation, exclusion and back-pointer
    /// invariant.
    pub fn check_invariants(&self) -> Result<(), SimulationError> {
	let fail = |message: String| {
	    Err(SimulationError::InvariantViolation { time: self.time, message })
	};
	let footprint = self.config.footprint;

	if self.ribosomes.free + self.ribosomes.bound() as u64 != self.ribosomes.total {
	    return fail(format!(
		"{} free + {} bound != {} ribosomes",
		self.ribosomes.free, self.ribosomes.bound(), self.ribosomes.total
	    ));
	}

	let mut held = vec![0u64; self.codons.num_species()];
	let mut queued = 0usize;
	let mut stalled = vec![0u64; self.genes.len()];
	let mut stalled_tracked = vec![0u64; self.stats.stalled_by_position.len()];

	for (id, record) in self.ribosomes.iter() {
	    let t = record.transcript;
	    let gene = self.transcripts[t.index()].gene;
	    let sequence = &self.genes.get(gene).sequence;

	    if record.position >= sequence.len() {
		return fail(format!("ribosome {} is past the end of transcript {}", id.0, t.0));
	    }
	    if self.grid.get(t, record.position) != Some(id) {
		return fail(format!(
		    "grid cell ({}, {}) does not hold ribosome {}",
		    t.0, record.position, id.0
		));
	    }
	    if record.position > 0 {
		held[self.codons.species(sequence[record.position - 1]).index()] += 1;
	    }

	    let elongatable = self.grid.is_empty_at(t, record.position + footprint.initiation);
	    match record.queue {
		Some(q) => {
		    if !elongatable {
			return fail(format!("blocked ribosome {} is queued", id.0));
		    }
		    if q.codon != sequence[record.position] {
			return fail(format!("ribosome {} queued under the wrong codon", id.0));
		    }
		    if self.elongation.get(q.codon, q.slot) != Some(id) {
			return fail(format!(
			    "queue {} slot {} does not point back at ribosome {}",
			    q.codon.0, q.slot, id.0
			));
		    }
		    queued += 1;
		}
		None => {
		    if elongatable {
			return fail(format!("elongatable ribosome {} is not queued", id.0));
		    }
		    stalled[gene.index()] += 1;
		    if gene == self.tracked_gene {
			stalled_tracked[record.position] += 1;
		    }
		}
	    }
	}

	if queued != self.elongation.total() {
	    return fail(format!(
		"{} queued ribosomes but elongation queues hold {}",
		queued, self.elongation.total()
	    ));
	}
	if stalled != self.stats.stalled_by_gene || stalled_tracked != self.stats.stalled_by_position {
	    return fail("stall counters disagree with the grid".to_string());
	}

	for (s, ((&free, &held), &pool)) in self
	    .free_trna
	    .iter()
	    .zip(&held)
	    .zip(self.codons.pools())
	    .enumerate()
	{
	    if free + held != pool {
		return fail(format!("tRNA species {}: {} free + {} held != {}", s, free, held, pool));
	    }
	}

	let mut occupied = 0usize;
	for (t, mRNA) in self.transcripts.iter().enumerate() {
	    let t = TranscriptId::from_index(t);

	    let mut previous: Option<usize> = None;
	    for (pos, _) in self.grid.ribosomes_on(t) {
		if let Some(prev) = previous {
		    if pos - prev < footprint.initiation {
			return fail(format!(
			    "ribosomes at {} and {} on transcript {} overlap",
			    prev, pos, t.0
			));
		    }
		}
		previous = Some(pos);
		occupied += 1;
	    }

	    let window = footprint.initiation.min(self.grid.len_of(t));
	    let clear = (0..window).all(|pos| self.grid.is_empty_at(t, pos));
	    match mRNA.initiation_slot {
		Some(slot) => {
		    if !clear {
			return fail(format!("transcript {} is initiable with a ribosome in its 5' window", t.0));
		    }
		    if self.initiation.get(mRNA.gene, slot) != Some(t) {
			return fail(format!("initiation queue slot {} does not point back at {}", slot, t.0));
		    }
		}
		None => {
		    if clear {
			return fail(format!("transcript {} has a clear 5' window but is not initiable", t.0));
		    }
		}
	    }
	}

	if occupied != self.ribosomes.bound() {
	    return fail(format!("{} occupied cells for {} bound ribosomes", occupied, self.ribosomes.bound()));
	}

	let expected = self.initiation.recomputed_weight();
	if (self.initiation.total_weight() - expected).abs() > 1e-9 * expected.max(1.0) {
	    return fail(format!(
		"initiation weight {} drifted from {}",
		self.initiation.total_weight(), expected
	    ));
	}

	Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Footprint, LatticeSites, OutputSelection};
    use crate::model::{Codon, Gene, SpeciesId};
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn codons(rates: &[(u32, f64)], pools: Vec<u64>) -> Arc<CodonTable> {
	let codons = rates
	    .iter()
	    .enumerate()
	    .map(|(c, &(species, rate_constant))| Codon {
		token: format!("C{}", c),
		species: SpeciesId(species),
		rate_constant,
	    })
	    .collect();
	Arc::new(CodonTable::new(codons, pools).unwrap())
    }

    fn gene(sequence: &[u32], copies: usize, weight: f64) -> Gene {
	Gene {
	    sequence: sequence.iter().map(|&c| CodonId(c)).collect(),
	    copies,
	    initiation_weight: weight,
	}
    }

    fn genes(genes: Vec<Gene>, num_codons: usize) -> Arc<GeneTable> {
	Arc::new(GeneTable::new(genes, num_codons).unwrap())
    }

    // Normalizer of exactly 1 so initiation rates are easy to reason about
    fn config(ribosomes: u64, footprint: Footprint) -> SimulationConfig {
	SimulationConfig {
	    total_time: 1.0e6,
	    burn_in: 0.0,
	    total_ribosomes: ribosomes,
	    total_trna: 0,
	    sites: LatticeSites { trna: 1.0e7, ribosome: 2000.0 },
	    footprint,
	    tracked_gene: 0,
	    seed: 7,
	    outputs: OutputSelection {
		free_pools: true,
		stalls: true,
		..Default::default()
	    },
	}
    }

    fn engine(
	genes: Arc<GeneTable>,
	codons: Arc<CodonTable>,
	config: SimulationConfig,
    ) -> Engine<StdRng> {
	let seed = config.seed;
	Engine::new(genes, codons, config, StdRng::seed_from_u64(seed)).unwrap()
    }

    fn mixed_engine(seed: u64) -> Engine<StdRng> {
	let table = codons(&[(0, 0.01), (1, 0.02), (0, 0.005)], vec![40, 50]);
	let genes = genes(
	    vec![
		gene(&[0, 1, 2, 0, 1], 3, 1.0),
		gene(&[1; 15], 2, 0.5),
		gene(&(0..40).map(|i| i % 3).collect::<Vec<_>>(), 4, 2.0),
		gene(&(0..60).map(|i| (i * 7) % 3).collect::<Vec<_>>(), 5, 1.5),
	    ],
	    3,
	);
	let mut config = config(30, Footprint::default());
	config.seed = seed;
	config.tracked_gene = 3;
	engine(genes, table, config)
    }

    fn is_initiable(engine: &Engine<StdRng>, t: usize) -> bool {
	let mRNA = &engine.transcripts()[t];
	let gene = mRNA.gene;
	let in_queue = (0..engine.initiation.len(gene))
	    .any(|slot| engine.initiation.get(gene, slot) == Some(TranscriptId::from_index(t)));
	assert_eq!(in_queue, mRNA.initiation_slot.is_some());
	in_queue
    }

    #[test]
    fn invariants_hold_through_a_long_random_run() {
	for seed in [1, 2, 3] {
	    let mut engine = mixed_engine(seed);
	    engine.check_invariants().unwrap();

	    let mut last_time = engine.time();
	    for _ in 0..20_000 {
		let tick = engine.step().unwrap();
		assert!(tick.time > last_time, "time must strictly increase");
		assert!((tick.time - last_time - tick.dt).abs() <= 1e-9 * tick.time);
		last_time = tick.time;
		engine.check_invariants().unwrap();
	    }
	    assert!(engine.stats().terminations > 0);
	}
    }

    #[test]
    fn single_ribosome_behaves_like_a_simple_queue() {
	// Footprint of one codon, one codon type, tRNA effectively unlimited
	let pool = 1_000_000_000;
	let k = 1.0e-9;
	let table = codons(&[(0, k)], vec![pool]);
	let genes = genes(vec![gene(&[0, 0, 0], 1, 1.0)], 1);
	let mut engine = engine(genes, table, config(1, Footprint::new(1, 2).unwrap()));

	while engine.stats().terminations < 100 {
	    engine.step().unwrap();
	    engine.check_invariants().unwrap();
	    assert_eq!(engine.stats().total_stalled(), 0);
	}

	let mRNA = &engine.transcripts()[0];
	assert_eq!(engine.stats().initiations, 100);
	assert_eq!(mRNA.initiation_events, 100);
	assert_eq!(mRNA.translation_events, 100);
	assert_eq!(engine.ribosomes().bound(), 0);

	// Three codons left per translation, each after a mean wait of 1/(k T)
	let events = engine.stats().codon_elongation_events[0];
	assert_eq!(events, 300);
	let mean = engine.stats().codon_elongation_time[0] / events as f64;
	let expected = 1.0 / (k * pool as f64);
	assert!((mean - expected).abs() / expected < 1e-6, "mean {} vs {}", mean, expected);
    }

    #[test]
    fn transcript_stays_closed_until_the_5_prime_window_clears() {
	let table = codons(&[(0, 0.01)], vec![1_000_000]);
	let genes = genes(vec![gene(&[0; 30], 1, 1.0)], 1);
	let mut engine = engine(genes, table, config(5, Footprint::default()));
	let t = TranscriptId(0);

	// Nothing is bound, so the first event has to be an initiation
	let tick = engine.step().unwrap();
	assert!(matches!(tick.event, Event::Initiation { transcript, .. } if transcript == t));
	assert!(!is_initiable(&engine, 0));

	// With the only transcript closed, every event moves the pioneer
	loop {
	    let tick = engine.step().unwrap();
	    assert!(matches!(tick.event, Event::Elongation { .. }));
	    let position = engine.ribosomes().get(RibosomeId(0)).position;
	    if position < 10 {
		assert!(!is_initiable(&engine, 0), "re-opened early at {}", position);
	    } else {
		assert_eq!(position, 10);
		assert!(is_initiable(&engine, 0));
		break;
	    }
	}

	// A second ribosome lands 10 codons behind the pioneer: blocked
	engine.initiate().unwrap();
	let second = RibosomeId(1);
	assert_eq!(engine.ribosomes().get(second).position, 0);
	assert!(engine.ribosomes().get(second).queue.is_none());
	assert_eq!(engine.stats().stalled_by_gene[0], 1);
	assert_eq!(engine.stats().stalled_by_position[0], 1);
	assert!(!is_initiable(&engine, 0));
	engine.check_invariants().unwrap();

	// The pioneer steps on and the trailing ribosome is released
	engine.elongate(RibosomeId(0));
	assert!(engine.ribosomes().get(second).queue.is_some());
	assert_eq!(engine.stats().stalled_by_gene[0], 0);
	assert!(!is_initiable(&engine, 0));
	engine.check_invariants().unwrap();
    }

    #[test]
    fn termination_compacts_the_active_ribosomes() {
	let table = codons(&[(0, 0.01), (0, 0.01)], vec![1_000]);
	let genes = genes(
	    vec![gene(&[0, 0], 1, 1.0), gene(&[0, 1, 0, 1, 0, 1, 0, 1], 1, 1.0)],
	    2,
	);
	let mut engine = engine(genes, table, config(3, Footprint::default()));

	engine.initiate_on(TranscriptId(0));
	engine.initiate_on(TranscriptId(1));
	for _ in 0..3 {
	    engine.elongate(RibosomeId(1));
	}
	engine.check_invariants().unwrap();

	// Ribosome 0 is not last in the active array when it terminates
	engine.elongate(RibosomeId(0));
	let event = engine.elongate(RibosomeId(0));
	assert!(matches!(event, Event::Termination { transcript, .. } if transcript == TranscriptId(0)));

	assert_eq!(engine.ribosomes().bound(), 1);
	let moved = *engine.ribosomes().get(RibosomeId(0));
	assert_eq!(moved.transcript, TranscriptId(1));
	assert_eq!(moved.position, 3);
	assert_eq!(engine.grid().get(TranscriptId(1), 3), Some(RibosomeId(0)));
	let q = moved.queue.expect("moved ribosome should still be elongatable");
	assert_eq!(q.codon, CodonId(1));
	assert_eq!(engine.elongation_queues().get(q.codon, q.slot), Some(RibosomeId(0)));

	// A transcript too short to clear its 5' window re-opens on termination
	assert!(is_initiable(&engine, 0));
	engine.check_invariants().unwrap();
    }

    #[test]
    fn zero_weight_gene_is_never_initiated() {
	let table = codons(&[(0, 0.05)], vec![10_000]);
	let genes = genes(vec![gene(&[0; 20], 3, 0.0), gene(&[0; 20], 3, 1.0)], 1);
	let mut engine = engine(genes, table, config(50, Footprint::default()));

	for _ in 0..5_000 {
	    engine.step().unwrap();
	    for t in 0..3 {
		let t = TranscriptId(t);
		assert_eq!(engine.grid().ribosomes_on(t).count(), 0);
		assert_eq!(engine.transcripts()[t.index()].initiation_events, 0);
	    }
	}
	assert!(engine.stats().initiations > 0);
	engine.check_invariants().unwrap();
    }

    #[test]
    fn empty_trna_pool_is_reported_as_deadlock() {
	let table = codons(&[(0, 1.0)], vec![0]);
	let genes = genes(vec![gene(&[0; 5], 1, 1.0)], 1);
	let mut engine = engine(genes, table, config(1, Footprint::default()));

	let tick = engine.step().unwrap();
	assert!(matches!(tick.event, Event::Initiation { .. }));

	match engine.step() {
	    Err(SimulationError::Deadlock { free_ribosomes, .. }) => assert_eq!(free_ribosomes, 0),
	    other => panic!("expected deadlock, got {:?}", other),
	}

	let err = engine.run(|_| Ok(())).unwrap_err();
	assert!(err.downcast_ref::<SimulationError>().is_some());
    }

    #[test]
    fn nothing_is_recorded_before_burn_in() {
	let mut engine = mixed_engine(11);
	engine.config.burn_in = 5.0;

	while engine.time() <= 5.0 {
	    engine.step().unwrap();
	    if engine.time() <= 5.0 {
		let stats = engine.stats();
		assert!(stats.codon_elongation_events.iter().all(|&n| n == 0));
		assert_eq!(stats.free_ribosome_integral, 0.0);
		assert!(stats.stall_integral_by_gene.iter().all(|&v| v == 0.0));
		assert!(engine.transcripts().iter().all(|m| m.initiation_events == 0));
	    }
	}

	for _ in 0..2_000 {
	    engine.step().unwrap();
	}
	assert!(engine.stats().free_ribosome_integral > 0.0);
    }

    #[test]
    fn run_reports_every_whole_second_and_averages_stay_in_range() {
	let mut engine = mixed_engine(5);
	engine.config.total_time = 20.0;
	engine.config.burn_in = 2.0;

	let mut seconds = Vec::new();
	engine
	    .run(|snapshot| {
		assert_eq!(snapshot.grid.num_transcripts(), snapshot.transcripts.len());
		seconds.push(snapshot.second);
		Ok(())
	    })
	    .unwrap();

	assert!(engine.time() >= 20.0);
	assert_eq!(seconds, (0..seconds.len() as u64).collect::<Vec<_>>());
	assert!(seconds.len() >= 20);

	let summary = engine.summary();
	assert!(summary.free_ribosomes >= 0.0 && summary.free_ribosomes <= 30.0 * 1.01);
	assert_eq!(summary.stall_by_position.len(), 60);
    }

    #[test]
    fn same_seed_same_trajectory() {
	let mut a = mixed_engine(42);
	let mut b = mixed_engine(42);
	for _ in 0..1_000 {
	    assert_eq!(a.step().unwrap(), b.step().unwrap());
	}
    }

    #[test]
    fn rejects_missing_tracked_gene() {
	let table = codons(&[(0, 1.0)], vec![10]);
	let genes = genes(vec![gene(&[0; 5], 1, 1.0)], 1);
	let mut config = config(1, Footprint::default());
	config.tracked_gene = 3;
	assert!(Engine::new(genes, table, config, StdRng::seed_from_u64(0)).is_err());
    }
}
