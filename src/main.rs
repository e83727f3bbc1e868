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

/* main.rs: command-line interface */

#![allow(non_snake_case)] // allow variables with "mRNA" in them

use polars::prelude::{ParquetReader, ParquetWriter, SerReader};

use threadpool::ThreadPool;

use std::fs::{create_dir_all, File, write, remove_file};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use rand::SeedableRng;
use rand::rngs::StdRng;

use clap::{Args, Parser, Subcommand, ArgAction};

use anyhow::{Context, Result, bail};
use tracing::{info, info_span, warn};
use tracing_subscriber::EnvFilter;

use std::sync::mpsc::{channel, Sender};
use std::sync::Arc;

mod config;
mod dataframe_operations;
mod engine;
mod grid;
mod model;
mod report;
mod snapshot;
mod stats;
mod swap_set;
mod util;

use config::{DEFAULT_TRNA_SITES, Footprint, LatticeSites, OutputSelection, SimulationConfig};
use engine::Engine;
use model::{CodonTable, GeneTable};
use snapshot::{SnapshotFormat, SnapshotRecorder};

/* Messages from the replicate threads to the main thread */
pub enum SimulationMessage {
    Progress { replicate: usize, second: u64 },
    Finished { replicate: usize, outcome: Result<ReplicateOutcome> },
}

pub struct ReplicateOutcome {
    time: f64,
    initiations: u64,
    terminations: u64,
    bound: usize,
    reports: usize,
    snapshots: usize,
}

#[derive(Parser)]
#[command(
    name = "smopt",
    version = "1.0.0",
    author = "Andrew T. Martens <andrew_martens@hms.harvard.edu>",
    about = "SMoPT -- Stochastic Model of Protein Translation",
    disable_help_subcommand = true,
    disable_version_flag = true
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// More output (-v info, -vv debug, -vvv trace). RUST_LOG overrides.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbosity: u8,
}

#[derive(Subcommand)]
enum Commands {
    #[command(
	about = "Simulate translation of a whole transcriptome competing for \
		 ribosomes and tRNAs"
    )]
    Simulate(SimulateArgs),

    #[command(
	about = "Build a gene table from coding sequences in a FASTA file"
    )]
    Convert {
	#[arg(
	    short = 'f',
	    long = "fasta",
	    help = "FASTA file of coding sequences. Header keys exp=<copies> \
		    and ini=<probability> override the defaults",
	    required = true
	)]
	fasta_path: String,

	#[arg(
	    short = 'C',
	    long = "codes",
	    default_value = "example/input/S.cer.tRNA",
	    help = "tRNA table giving the codon order"
	)]
	codes: String,

	#[arg(
	    short = 'o',
	    long = "out-file",
	    help = "Gene table to write",
	    required = true
	)]
	out_file: String,

	#[arg(
	    long = "copies",
	    default_value_t = 1,
	    help = "mRNA copies per gene when the header has no exp="
	)]
	copies: usize,

	#[arg(
	    long = "ini",
	    default_value_t = 1.0,
	    help = "Initiation probability when the header has no ini="
	)]
	initiation_probability: f64,
    },

    #[command(
	about = "Mean ribosomes per gene position from a parquet snapshot file"
    )]
    Profile {
	#[arg(
	    short = 'i',
	    long = "snapshots",
	    help = "Snapshot file written with --snapshot-format parquet",
	    required = true
	)]
	snapshots_path: String,

	#[arg(
	    short = 'o',
	    long = "out-file",
	    help = "Output file (parquet)",
	    required = true
	)]
	out_file: String,

	#[arg(
	    short = 'g',
	    long = "gene",
	    help = "Only profile this gene"
	)]
	gene: Option<u32>,
    },
}

#[derive(Args)]
struct SimulateArgs {
    #[arg(
	short = 'V',
	long = "volume",
	help = "Cell volume in m^3. Without it, yeast-sized lattices are used"
    )]
    volume: Option<f64>,

    #[arg(
	short = 'T',
	long = "total-time",
	default_value_t = 1500.0,
	help = "Total simulation time in seconds"
    )]
    total_time: f64,

    #[arg(
	short = 'H',
	long = "burn-in",
	default_value_t = 1000.0,
	help = "Only collect statistics after this time"
    )]
    burn_in: f64,

    #[arg(
	short = 'R',
	long = "ribosomes",
	default_value_t = 200_000,
	help = "Total number of ribosomes"
    )]
    ribosomes: u64,

    #[arg(
	short = 't',
	long = "trnas",
	default_value_t = 3_300_000,
	help = "Total number of tRNAs"
    )]
    trnas: u64,

    #[arg(
	short = 'N',
	long = "num-genes",
	help = "Only simulate the first N genes of the gene table"
    )]
    num_genes: Option<usize>,

    #[arg(
	short = 'F',
	long = "genome",
	default_value = "example/input/S.cer.genom",
	help = "Gene table: initiation probability, copies, codon ids"
    )]
    genome: String,

    #[arg(
	short = 'C',
	long = "codes",
	default_value = "example/input/S.cer.tRNA",
	help = "tRNA table: codon, tRNA species, gene copy number, wobble"
    )]
    codes: String,

    #[arg(
	short = 's',
	long = "seed",
	default_value_t = 1,
	help = "Random number seed"
    )]
    seed: u64,

    #[arg(
	short = 'O',
	long = "out-prefix",
	default_value = "output",
	help = "Prefix of every output file"
    )]
    out_prefix: String,

    #[arg(
	short = 'p',
	long = "print",
	action = ArgAction::Append,
	value_parser = clap::value_parser!(u8).range(1..=7),
	help = "Output to write (repeatable): 1 codon elongation times, \
		2 gene translation times, 3 gene initiation times, \
		4 free ribosomes and tRNAs, 5 final ribosome positions, \
		6 stalled ribosomes, 7 ribosome positions every second"
    )]
    print: Vec<u8>,

    #[arg(
	long = "snapshot-format",
	value_enum,
	default_value_t = SnapshotFormat::Text,
	help = "Format of the per-second snapshots (-p 7)"
    )]
    snapshot_format: SnapshotFormat,

    #[arg(
	long = "tracked-gene",
	default_value_t = 0,
	help = "Gene whose stalls are reported per position (-p 6)"
    )]
    tracked_gene: usize,

    #[arg(
	long = "replicates",
	default_value_t = 1,
	help = "Independent runs with seeds seed, seed+1, ..."
    )]
    replicates: usize,

    #[arg(
	long = "num-threads",
	default_value_t = 1,
	help = "Maximum number of threads"
    )]
    num_threads: usize,

    #[arg(
	long = "check-invariants",
	help = "Audit the whole state after every event (slow)"
    )]
    check_invariants: bool,
}

/*
   Boilerplate function that starts the program and immediately calls run(),
   and takes care of error handling.
*/
fn main() -> Result<()> {
    if let Err(e) = run() {
	eprintln!("Error: {:?}", e);
	std::process::exit(1);
    }
    Ok(())
}

fn init_logging(verbosity: u8) {
    let default = match verbosity {
	0 => "warn",
	1 => "info",
	2 => "debug",
	_ => "trace",
    };
    tracing_subscriber::fmt()
	.with_env_filter(
	    EnvFilter::try_from_default_env()
		.unwrap_or_else(|_| EnvFilter::new(default)),
	)
	.with_writer(io::stderr)
	.init();
}

/*
   Process command-line arguments & invoke the corresponding subroutine.
*/
fn run() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbosity);

    match cli.command {
	Commands::Simulate(args) => run_simulation(args, cli.verbosity),

	Commands::Convert {
	    fasta_path, codes, out_file, copies, initiation_probability
	} => {
	    run_convert(fasta_path, codes, out_file, copies, initiation_probability)
	}

	Commands::Profile { snapshots_path, out_file, gene } => {
	    run_profile(snapshots_path, out_file, gene)
	}
    }
}

fn run_convert(
    fasta_path: String,
    codes: String,
    out_file: String,
    copies: usize,
    initiation_probability: f64,
) -> Result<()> {
    // Only the codon order matters here, not the pools
    let codons = util::read_codon_table(&codes, 0, DEFAULT_TRNA_SITES)?;

    let genes = util::read_fasta_genes(&fasta_path, &codons, copies, initiation_probability)?;
    GeneTable::new(genes.clone(), codons.len())
	.context("Converted genes do not form a valid gene table")?;

    util::write_gene_table(&out_file, &genes)?;
    info!(genes = genes.len(), out = %out_file, "gene table written");

    Ok(())
}

fn run_profile(
    snapshots_path: String,
    out_file: String,
    gene: Option<u32>,
) -> Result<()> {
    let r = File::open(&snapshots_path)
	.with_context(|| format!("Failed to open '{}'", snapshots_path))?;
    let snapshots_df = ParquetReader::new(r).finish()?;

    let mut profile = dataframe_operations::calculate_ribosome_profile(&snapshots_df, gene)?;
    if profile.height() == 0 {
	warn!("no ribosomes found in '{}'", snapshots_path);
    }

    let of = File::create(PathBuf::from(&out_file))?;
    let writer = ParquetWriter::new(of);
    writer.finish(&mut profile)?;

    Ok(())
}

// Does a directory exist? Is it writeable?
fn ensure_writable_dir<P: AsRef<Path>>(path: P, temp_filename: &str) -> Result<()> {
    let path = path.as_ref();

    if path.exists() {
	if !path.is_dir() {
	    bail!("Path exists but is not a directory: {}", path.display());
	}

	// Check writability by trying to create a temp file
	let test_path = path.join(temp_filename);
	write(&test_path, b"test").context("Directory exists but is not writable")?;
	remove_file(&test_path).ok(); // Cleanup, ignore error
    } else {
	create_dir_all(path)
	    .with_context(|| format!("Failed to create directory: {}", path.display()))?;
    }

    Ok(())
}

fn replicate_prefix(prefix: &str, replicate: usize, replicates: usize) -> String {
    if replicates == 1 {
	prefix.to_string()
    } else {
	format!("{}_rep{}", prefix, replicate)
    }
}

fn run_simulation(args: SimulateArgs, verbosity: u8) -> Result<()> {
    if args.replicates == 0 || args.num_threads == 0 {
	bail!("At least one replicate and one thread are needed");
    }

    let sites = match args.volume {
	Some(volume) => LatticeSites::from_volume(volume)?,
	None => LatticeSites::default(),
    };

    let config = SimulationConfig {
	total_time: args.total_time,
	burn_in: args.burn_in,
	total_ribosomes: args.ribosomes,
	total_trna: args.trnas,
	sites,
	footprint: Footprint::default(),
	tracked_gene: args.tracked_gene,
	seed: args.seed,
	outputs: OutputSelection::from_flags(&args.print)?,
    };
    config.validate()?;

    let codons: Arc<CodonTable> = Arc::new(
	util::read_codon_table(&args.codes, config.total_trna, config.sites.trna)?
    );
    let genes: Arc<GeneTable> = Arc::new(
	util::read_gene_table(&args.genome, codons.len(), args.num_genes)?
    );
    if config.tracked_gene >= genes.len() {
	bail!(
	    "Tracked gene {} does not exist ({} genes loaded)",
	    config.tracked_gene, genes.len()
	);
    }

    // Make sure that the output directory exists and can be written to
    if let Some(dir) = Path::new(&args.out_prefix).parent() {
	if !dir.as_os_str().is_empty() {
	    ensure_writable_dir(dir, ".smopt_write_test")?;
	}
    }

    info!(
	genes = genes.len(),
	transcripts = genes.total_copies(),
	ribosomes = config.total_ribosomes,
	trnas = config.total_trna,
	total_time = config.total_time,
	burn_in = config.burn_in,
	"starting simulation"
    );

    /* This channel is used to transfer information out of the
       threadpool. */
    let (tx, rx) = channel();
    let pool = ThreadPool::new(args.num_threads);

    for replicate in 0..args.replicates {
	let tx = tx.clone();
	let genes = Arc::clone(&genes);
	let codons = Arc::clone(&codons);
	let config = SimulationConfig {
	    seed: args.seed + replicate as u64,
	    ..config.clone()
	};
	let prefix = replicate_prefix(&args.out_prefix, replicate, args.replicates);
	let snapshot_format = args.snapshot_format;
	let check_invariants = args.check_invariants;

	pool.execute(move || {
	    let outcome = run_replicate(
		replicate,
		genes,
		codons,
		config,
		&prefix,
		snapshot_format,
		check_invariants,
		&tx
	    );

	    tx
		.send(SimulationMessage::Finished { replicate, outcome })
		.expect("Message channel should be open");
	});
    }

    drop(tx);

    /* Process each message: progress or a completed replicate */
    let mut terminal = match verbosity {
	0 => None,
	_ => Some(term::stdout().context("Failed to create stdout terminal")?),
    };
    let total_seconds = config.total_time.ceil() as u64;

    for message in rx.iter() {
	match message {
	    SimulationMessage::Progress { replicate, second } => {
		if let Some(terminal) = terminal.as_mut() {
		    terminal.carriage_return().context("Failed carriage return")?;
		    terminal.delete_line().context("Failed delete line")?;
		    write!(terminal, "replicate {}: {} / {} s", replicate, second, total_seconds)?;
		    io::stdout().flush().context("Failed to flush stdout")?;
		}
	    }

	    SimulationMessage::Finished { replicate, outcome } => {
		// Handle errors on replicates here, in the main thread
		let outcome = outcome
		    .with_context(|| format!("Replicate {} failed", replicate))?;

		if let Some(terminal) = terminal.as_mut() {
		    terminal.carriage_return().context("Failed carriage return")?;
		    terminal.delete_line().context("Failed delete line")?;
		}
		info!(
		    replicate,
		    time = outcome.time,
		    initiations = outcome.initiations,
		    terminations = outcome.terminations,
		    bound = outcome.bound,
		    reports = outcome.reports,
		    snapshots = outcome.snapshots,
		    "replicate finished"
		);
	    }
	}
    }

    /* Simulations complete */
    if let Some(terminal) = terminal.as_mut() {
	writeln!(terminal)?;
    }

    Ok(())
}

/* One independent run: simulate, then write every selected output. */
fn run_replicate(
    replicate: usize,
    genes: Arc<GeneTable>,
    codons: Arc<CodonTable>,
    config: SimulationConfig,
    prefix: &str,
    snapshot_format: SnapshotFormat,
    check_invariants: bool,
    tx: &Sender<SimulationMessage>,
) -> Result<ReplicateOutcome> {
    let span = info_span!("replicate", replicate, seed = config.seed);
    let _enter = span.enter();

    let outputs = config.outputs;
    // Snapshots are written from the end of burn-in on
    let first_second = config.burn_in.floor() as u64;

    let rng = StdRng::seed_from_u64(config.seed);
    let mut engine = Engine::new(genes, codons, config, rng)?
	.with_invariant_checks(check_invariants);

    let mut recorder = match outputs.snapshots {
	true => Some(SnapshotRecorder::new(prefix, snapshot_format, first_second)?),
	false => None,
    };

    engine.run(|snapshot| {
	// The main thread may already have given up on us
	let _ = tx.send(SimulationMessage::Progress { replicate, second: snapshot.second });
	match recorder.as_mut() {
	    Some(recorder) => recorder.record(snapshot),
	    None => Ok(()),
	}
    })?;

    let snapshots = match recorder {
	Some(recorder) => recorder.finish()?,
	None => 0,
    };

    let summary = engine.summary();
    let reports = report::write_reports(prefix, &outputs, &summary, engine.grid())?;

    Ok(ReplicateOutcome {
	time: engine.time(),
	initiations: summary.initiations,
	terminations: summary.terminations,
	bound: engine.ribosomes().bound(),
	reports: reports.len(),
	snapshots,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NUM_SENSE_CODONS;
    use std::fs::read_to_string;
    use tempfile::tempdir;

    fn write_inputs(dir: &Path) -> (PathBuf, PathBuf) {
	let codes = dir.join("codes.tRNA");
	let mut table = String::new();
	for c in 0..NUM_SENSE_CODONS {
	    table.push_str(&format!("C{}\t{}\t{}\t1.0\n", c, c % 41, 1 + c % 3));
	}
	write(&codes, table).unwrap();

	let genome = dir.join("genes.genom");
	let mut genes = String::new();
	for g in 0..4 {
	    let codons: Vec<String> = (0..40 + 10 * g).map(|i| ((i * 7 + g) % 61).to_string()).collect();
	    genes.push_str(&format!("0.{} {}\n{}\n", g + 1, 2 + g, codons.join(" ")));
	}
	write(&genome, genes).unwrap();

	(codes, genome)
    }

    fn args(dir: &Path, codes: &Path, genome: &Path) -> SimulateArgs {
	SimulateArgs {
	    volume: None,
	    total_time: 12.0,
	    burn_in: 4.0,
	    ribosomes: 2_000,
	    trnas: 500_000,
	    num_genes: None,
	    genome: genome.to_string_lossy().into_owned(),
	    codes: codes.to_string_lossy().into_owned(),
	    seed: 3,
	    out_prefix: dir.join("out").join("run").to_string_lossy().into_owned(),
	    print: vec![1, 2, 3, 4, 5, 6, 7],
	    snapshot_format: SnapshotFormat::Text,
	    tracked_gene: 1,
	    replicates: 1,
	    num_threads: 1,
	    check_invariants: true,
	}
    }

    #[test]
    fn simulate_writes_every_selected_report() {
	let dir = tempdir().unwrap();
	let (codes, genome) = write_inputs(dir.path());
	let args = args(dir.path(), &codes, &genome);
	let prefix = args.out_prefix.clone();

	run_simulation(args, 0).unwrap();

	let etimes = read_to_string(format!("{}_etimes.out", prefix)).unwrap();
	assert!(etimes.starts_with("Codon\tNum_of_events\tAvg_elong_time(sec)\n"));
	assert_eq!(etimes.lines().count(), 1 + NUM_SENSE_CODONS);

	let final_pos = read_to_string(format!("{}_final_ribo_pos.out", prefix)).unwrap();
	assert_eq!(final_pos.lines().count(), 2 + 3 + 4 + 5);

	assert!(Path::new(&format!("{}_gene1_pos_stall_ribo.out", prefix)).exists());
	// Snapshots from floor(burn-in) on
	assert!(!report::snapshot_path(&prefix, 3).exists());
	assert!(report::snapshot_path(&prefix, 4).exists());
	assert!(report::snapshot_path(&prefix, 11).exists());
    }

    #[test]
    fn replicates_get_their_own_prefix() {
	let dir = tempdir().unwrap();
	let (codes, genome) = write_inputs(dir.path());
	let mut args = args(dir.path(), &codes, &genome);
	args.replicates = 2;
	args.num_threads = 2;
	args.print = vec![4];
	args.check_invariants = false;
	let prefix = args.out_prefix.clone();

	run_simulation(args, 0).unwrap();

	let a = read_to_string(format!("{}_rep0_avg_ribo_tRNA.out", prefix)).unwrap();
	let b = read_to_string(format!("{}_rep1_avg_ribo_tRNA.out", prefix)).unwrap();
	assert!(a.starts_with("Free_ribo\t"));
	assert_ne!(a, b);
    }

    #[test]
    fn missing_tracked_gene_is_fatal() {
	let dir = tempdir().unwrap();
	let (codes, genome) = write_inputs(dir.path());
	let mut args = args(dir.path(), &codes, &genome);
	args.tracked_gene = 9;
	assert!(run_simulation(args, 0).is_err());
    }

    #[test]
    fn cli_accepts_original_flags() {
	let cli = Cli::try_parse_from([
	    "smopt", "simulate", "-T", "100", "-H", "10", "-R", "500", "-t", "9000",
	    "-p", "1", "-p7", "-O", "x/y", "-vv",
	])
	.unwrap();
	assert_eq!(cli.verbosity, 2);
	match cli.command {
	    Commands::Simulate(args) => {
		assert_eq!(args.print, vec![1, 7]);
		assert_eq!(args.total_time, 100.0);
		assert_eq!(args.out_prefix, "x/y");
	    }
	    _ => panic!("expected simulate"),
	}

	assert!(Cli::try_parse_from(["smopt", "simulate", "-p", "8"]).is_err());
    }
}
