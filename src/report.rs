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

/* report.rs: end-of-run text reports */

use anyhow::{Context, Result};
use csv::{Writer, WriterBuilder};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::config::OutputSelection;
use crate::grid::OccupancyGrid;
use crate::model::TranscriptId;
use crate::stats::{CountedMean, Summary};

/// Format a number the way C's `%g` does: six significant digits, trailing
/// zeros removed, exponent notation outside `1e-4 <= |v| < 1e6`.
pub fn format_g(v: f64) -> String {
    if v.is_nan() {
	return "nan".to_string();
    }
    if v.is_infinite() {
	return if v > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    if v == 0.0 {
	return "0".to_string();
    }

    // Round to six significant digits first; that decides the exponent
    let sci = format!("{:.5e}", v);
    let (mantissa, exp) = match sci.split_once('e') {
	Some((m, e)) => (m, e.parse::<i32>().unwrap_or(0)),
	None => (sci.as_str(), 0),
    };

    if exp < -4 || exp >= 6 {
	let sign = if exp < 0 { '-' } else { '+' };
	format!("{}e{}{:02}", strip_zeros(mantissa), sign, exp.abs())
    } else {
	let decimals = (5 - exp) as usize;
	strip_zeros(&format!("{:.*}", decimals, v)).to_string()
    }
}

fn strip_zeros(s: &str) -> &str {
    if s.contains('.') {
	s.trim_end_matches('0').trim_end_matches('.')
    } else {
	s
    }
}

fn output_path(prefix: &str, suffix: &str) -> PathBuf {
    PathBuf::from(format!("{}{}", prefix, suffix))
}

fn tsv_writer(path: &Path) -> Result<Writer<File>> {
    WriterBuilder::new()
	.delimiter(b'\t')
	.from_path(path)
	.with_context(|| format!("Failed to create report '{}'", path.display()))
}

fn write_counted_means(path: &Path, header: [&str; 3], rows: &[CountedMean]) -> Result<()> {
    let mut w = tsv_writer(path)?;
    w.write_record(header)?;
    for (i, row) in rows.iter().enumerate() {
	w.write_record([i.to_string(), row.events.to_string(), format_g(row.mean)])?;
    }
    w.flush()?;
    Ok(())
}

fn write_averages(path: &Path, header: [&str; 2], rows: &[f64]) -> Result<()> {
    let mut w = tsv_writer(path)?;
    w.write_record(header)?;
    for (i, &v) in rows.iter().enumerate() {
	w.write_record([i.to_string(), format_g(v)])?;
    }
    w.flush()?;
    Ok(())
}

/// Mean time a ribosome spends on each codon.
pub fn write_codon_times(path: &Path, summary: &Summary) -> Result<()> {
    write_counted_means(
	path,
	["Codon", "Num_of_events", "Avg_elong_time(sec)"],
	&summary.codon_elongation
    )
}

/// Mean initiation-to-termination time per gene.
pub fn write_gene_translation_times(path: &Path, summary: &Summary) -> Result<()> {
    write_counted_means(
	path,
	["Gene", "Num_of_events", "Avg_total_elong_time(sec)"],
	&summary.gene_translation
    )
}

/// Mean time between successive initiations per gene.
pub fn write_gene_initiation_times(path: &Path, summary: &Summary) -> Result<()> {
    write_counted_means(
	path,
	["Gene", "Num_of_events", "Avg_initiation_time(sec)"],
	&summary.gene_initiation
    )
}

pub fn write_free_pools(path: &Path, summary: &Summary) -> Result<()> {
    let mut w = tsv_writer(path)?;
    w.write_record(["Free_ribo".to_string(), format_g(summary.free_ribosomes)])?;
    for &(species, avg) in &summary.free_trna {
	w.write_record([format!("Free_tRNA{}", species), format_g(avg)])?;
    }
    w.flush()?;
    Ok(())
}

/// One line per transcript, `1 ` for an occupied codon and `0 ` otherwise.
pub fn write_occupancy(path: &Path, grid: &OccupancyGrid) -> Result<()> {
    let file = File::create(path)
	.with_context(|| format!("Failed to create '{}'", path.display()))?;
    let mut w = BufWriter::new(file);

    for t in 0..grid.num_transcripts() {
	for occupied in grid.occupied(TranscriptId::from_index(t)) {
	    w.write_all(if occupied { b"1 " } else { b"0 " })?;
	}
	w.write_all(b"\n")?;
    }
    w.flush()?;
    Ok(())
}

/// Time-averaged stalled ribosomes: per position of the tracked gene, and
/// per gene.
pub fn write_stalls(by_position: &Path, by_gene: &Path, summary: &Summary) -> Result<()> {
    write_averages(by_position, ["Pos", "Avg_ribo_stall"], &summary.stall_by_position)?;
    write_averages(by_gene, ["Gene", "Avg_ribo_stall"], &summary.stall_by_gene)
}

/// File name of a per-second occupancy snapshot.
pub fn snapshot_path(prefix: &str, second: u64) -> PathBuf {
    output_path(prefix, &format!("_ribo_pos_{}", second))
}

/// Write every selected end-of-run report. Returns the paths written.
pub fn write_reports(
    prefix: &str,
    outputs: &OutputSelection,
    summary: &Summary,
    grid: &OccupancyGrid
) -> Result<Vec<PathBuf>> {
    let mut written = Vec::new();

    if outputs.codon_times {
	let path = output_path(prefix, "_etimes.out");
	write_codon_times(&path, summary)?;
	written.push(path);
    }
    if outputs.gene_translation_times {
	let path = output_path(prefix, "_gene_totetimes.out");
	write_gene_translation_times(&path, summary)?;
	written.push(path);
    }
    if outputs.gene_initiation_times {
	let path = output_path(prefix, "_gene_initimes.out");
	write_gene_initiation_times(&path, summary)?;
	written.push(path);
    }
    if outputs.free_pools {
	let path = output_path(prefix, "_avg_ribo_tRNA.out");
	write_free_pools(&path, summary)?;
	written.push(path);
    }
    if outputs.final_occupancy {
	let path = output_path(prefix, "_final_ribo_pos.out");
	write_occupancy(&path, grid)?;
	written.push(path);
    }
    if outputs.stalls {
	let by_position = output_path(
	    prefix, &format!("_gene{}_pos_stall_ribo.out", summary.tracked_gene.0)
	);
	let by_gene = output_path(prefix, "_allgene_stall_ribo.out");
	write_stalls(&by_position, &by_gene, summary)?;
	written.push(by_position);
	written.push(by_gene);
    }

    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{GeneId, RibosomeId};
    use std::fs::read_to_string;
    use tempfile::tempdir;

    fn summary() -> Summary {
	Summary {
	    codon_elongation: vec![
		CountedMean { events: 4, mean: 0.125 },
		CountedMean { events: 0, mean: f64::NAN },
	    ],
	    gene_translation: vec![CountedMean { events: 2, mean: 33.5 }],
	    gene_initiation: vec![CountedMean { events: 3, mean: 1.0e-5 }],
	    free_ribosomes: 1234567.0,
	    free_trna: vec![(0, 250.5), (7, 3.0)],
	    stall_by_gene: vec![0.5],
	    stall_by_position: vec![0.0, 2.25],
	    tracked_gene: GeneId(0),
	    initiations: 3,
	    terminations: 2,
	}
    }

    #[test]
    fn format_g_matches_printf() {
	assert_eq!(format_g(0.0), "0");
	assert_eq!(format_g(1.0), "1");
	assert_eq!(format_g(0.125), "0.125");
	assert_eq!(format_g(33.5), "33.5");
	assert_eq!(format_g(1.0 / 3.0), "0.333333");
	assert_eq!(format_g(123456.0), "123456");
	assert_eq!(format_g(1234567.0), "1.23457e+06");
	assert_eq!(format_g(999999.5), "1e+06");
	assert_eq!(format_g(0.0001), "0.0001");
	assert_eq!(format_g(1.0e-5), "1e-05");
	assert_eq!(format_g(-2.5e-7), "-2.5e-07");
	assert_eq!(format_g(f64::NAN), "nan");
	assert_eq!(format_g(f64::INFINITY), "inf");
    }

    #[test]
    fn selected_reports_have_original_layout() {
	let dir = tempdir().unwrap();
	let prefix = dir.path().join("run").to_string_lossy().into_owned();

	let mut grid = OccupancyGrid::new([3, 2]);
	grid.set(TranscriptId(0), 1, RibosomeId(0));

	let outputs = OutputSelection::from_flags(&[1, 3, 4, 5, 6]).unwrap();
	let written = write_reports(&prefix, &outputs, &summary(), &grid).unwrap();
	assert_eq!(written.len(), 6);

	let etimes = read_to_string(format!("{}_etimes.out", prefix)).unwrap();
	assert_eq!(etimes, "Codon\tNum_of_events\tAvg_elong_time(sec)\n0\t4\t0.125\n1\t0\tnan\n");

	let initimes = read_to_string(format!("{}_gene_initimes.out", prefix)).unwrap();
	assert_eq!(initimes, "Gene\tNum_of_events\tAvg_initiation_time(sec)\n0\t3\t1e-05\n");

	let pools = read_to_string(format!("{}_avg_ribo_tRNA.out", prefix)).unwrap();
	assert_eq!(pools, "Free_ribo\t1.23457e+06\nFree_tRNA0\t250.5\nFree_tRNA7\t3\n");

	let occupancy = read_to_string(format!("{}_final_ribo_pos.out", prefix)).unwrap();
	assert_eq!(occupancy, "0 1 0 \n0 0 \n");

	let stall = read_to_string(format!("{}_gene0_pos_stall_ribo.out", prefix)).unwrap();
	assert_eq!(stall, "Pos\tAvg_ribo_stall\n0\t0\n1\t2.25\n");
	let all = read_to_string(format!("{}_allgene_stall_ribo.out", prefix)).unwrap();
	assert_eq!(all, "Gene\tAvg_ribo_stall\n0\t0.5\n");

	// Not selected
	assert!(!Path::new(&format!("{}_gene_totetimes.out", prefix)).exists());
    }

    #[test]
    fn snapshot_files_are_named_by_second() {
	assert_eq!(snapshot_path("out/x", 1000), PathBuf::from("out/x_ribo_pos_1000"));
    }
}
