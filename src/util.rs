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

/* util.rs: input tables and FASTA conversion */

use anyhow::{Context, Result, bail};
use std::{fs::File, io::{BufReader, BufWriter, Write}, path::Path};
use bio::io::fasta::Reader;
use tracing::{debug, warn};

use crate::config::NUM_SENSE_CODONS;
use crate::model::{CodonId, CodonTable, Gene, GeneTable, SpeciesId, TrnaEntry, normalize_codon};

const STOP_CODONS: [&str; 3] = ["TAA", "TAG", "TGA"];

/// Returns `true` if the sequence is made *exclusively* of A, T, G, C or U
/// (case-insensitive).
fn looks_like_nucleotide_only(seq: &[u8]) -> bool {
    seq
	.iter()
	.all(|&b| matches!(b.to_ascii_uppercase(), b'A' | b'T' | b'G' | b'C' | b'U'))
}

/* Whitespace tokens, each tagged with the (1-based) line it came from. */
fn tokens(text: &str) -> impl Iterator<Item = (usize, &str)> {
    text
	.lines()
	.enumerate()
	.flat_map(|(n, line)| line.split_whitespace().map(move |tok| (n + 1, tok)))
}

/* The gene table is a stream of records: initiation probability, number of
transcript copies, then the codon ids of the gene, which run to the end of the
line they start on. The first two fields may sit on lines of their own. */
pub fn parse_gene_table(
    text: &str,
    num_codons: usize,
    requested: Option<usize>
) -> Result<GeneTable> {
    let mut toks = tokens(text).peekable();
    let mut genes = Vec::new();

    while let Some((line, tok)) = toks.next() {
	if requested.is_some_and(|n| genes.len() == n) {
	    break;
	}
	let g = genes.len();

	let initiation_weight: f64 = tok.parse()
	    .with_context(|| format!("line {}: bad initiation probability '{}' for gene {}", line, tok, g))?;

	let Some((line, tok)) = toks.next() else {
	    bail!("gene {} ends after its initiation probability", g);
	};
	let copies: usize = tok.parse()
	    .with_context(|| format!("line {}: bad copy number '{}' for gene {}", line, tok, g))?;

	let Some(&(codon_line, _)) = toks.peek() else {
	    bail!("gene {} has no codons", g);
	};

	let mut sequence = Vec::new();
	while let Some((_, tok)) = toks.next_if(|&(l, _)| l == codon_line) {
	    let c: usize = tok.parse()
		.with_context(|| format!("line {}: bad codon id '{}' in gene {}", codon_line, tok, g))?;
	    if c >= num_codons {
		bail!("line {}: codon id {} in gene {} is not below {}", codon_line, c, g, num_codons);
	    }
	    sequence.push(CodonId::from_index(c));
	}

	genes.push(Gene { sequence, copies, initiation_weight });
    }

    if let Some(n) = requested {
	if genes.len() < n {
	    bail!("{} genes requested but the gene table only holds {}", n, genes.len());
	}
    }

    GeneTable::new(genes, num_codons)
}

pub fn read_gene_table<P: AsRef<Path>>(
    path: P,
    num_codons: usize,
    requested: Option<usize>
) -> Result<GeneTable> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
	.with_context(|| format!("Failed to open gene table '{}'", path.display()))?;
    let genes = parse_gene_table(&text, num_codons, requested)
	.with_context(|| format!("Malformed gene table '{}'", path.display()))?;

    debug!(genes = genes.len(), transcripts = genes.total_copies(), "read gene table");
    Ok(genes)
}

/* tRNA table: whitespace-separated `codon species gene_copies wobble` rows,
one per sense codon. */
pub fn parse_trna_table(text: &str) -> Result<Vec<TrnaEntry>> {
    let toks: Vec<(usize, &str)> = tokens(text).collect();
    if toks.len() % 4 != 0 {
	bail!("tRNA table has a truncated record ({} fields is not a multiple of 4)", toks.len());
    }

    toks
	.chunks(4)
	.map(|rec| {
	    let (line, codon) = rec[0];
	    let species: u32 = rec[1].1.parse()
		.with_context(|| format!("line {}: bad tRNA species '{}'", line, rec[1].1))?;
	    let gene_copies: u64 = rec[2].1.parse()
		.with_context(|| format!("line {}: bad tRNA gene copy number '{}'", line, rec[2].1))?;
	    let wobble: f64 = rec[3].1.parse()
		.with_context(|| format!("line {}: bad wobble parameter '{}'", line, rec[3].1))?;
	    if !(0.0..=1.0).contains(&wobble) {
		bail!("line {}: wobble parameter {} is outside [0, 1]", line, wobble);
	    }
	    Ok(TrnaEntry {
		codon: codon.to_string(),
		species: SpeciesId(species),
		gene_copies,
		wobble,
	    })
	})
	.collect()
}

/// Read the tRNA table and turn it into pools and rate constants.
pub fn read_codon_table<P: AsRef<Path>>(
    path: P,
    total_trna: u64,
    trna_sites: f64
) -> Result<CodonTable> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
	.with_context(|| format!("Failed to open tRNA table '{}'", path.display()))?;
    let entries = parse_trna_table(&text)
	.with_context(|| format!("Malformed tRNA table '{}'", path.display()))?;

    if entries.len() != NUM_SENSE_CODONS {
	bail!(
	    "tRNA table '{}' has {} codons, expected {}",
	    path.display(), entries.len(), NUM_SENSE_CODONS
	);
    }

    let table = CodonTable::derive(&entries, total_trna, trna_sites)?;
    debug!(codons = table.len(), species = table.num_species(), "read tRNA table");
    Ok(table)
}

/* Header keys understood by `convert`, e.g. `>YAL001C exp=12 ini=0.8`. */
fn header_value<T: std::str::FromStr>(desc: Option<&str>, key: &str) -> Result<Option<T>>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let Some(desc) = desc else {
	return Ok(None);
    };
    for field in desc.split_whitespace() {
	if let Some(value) = field.strip_prefix(key).and_then(|f| f.strip_prefix('=')) {
	    let v = value.parse::<T>()
		.with_context(|| format!("bad value '{}' for header key {}", value, key))?;
	    return Ok(Some(v));
	}
    }
    Ok(None)
}

/// Translate one coding sequence into codon ids. The trailing stop codon is
/// dropped; any other stop codon is an error.
pub fn encode_coding_sequence(id: &str, seq: &[u8], codons: &CodonTable) -> Result<Vec<CodonId>> {
    if !looks_like_nucleotide_only(seq) {
	bail!("sequence {} contains non-nucleotide characters. Is it protein?", id);
    }
    if seq.len() % 3 != 0 {
	bail!("sequence {} has length {}, not a whole number of codons", id, seq.len());
    }

    let triplets: Vec<String> = seq
	.chunks(3)
	.map(|c| normalize_codon(&String::from_utf8_lossy(c)))
	.collect();
    let last = triplets.len();

    let mut encoded = Vec::with_capacity(last);
    for (i, triplet) in triplets.iter().enumerate() {
	if STOP_CODONS.contains(&triplet.as_str()) {
	    if i + 1 == last {
		break;
	    }
	    bail!("sequence {} has an internal stop codon {} at codon {}", id, triplet, i);
	}
	match codons.find(triplet) {
	    Some(c) => encoded.push(c),
	    None => bail!("sequence {} has codon {} at {} missing from the tRNA table", id, triplet, i),
	}
    }

    if encoded.is_empty() {
	bail!("sequence {} has no sense codons", id);
    }
    if !STOP_CODONS.contains(&triplets[last - 1].as_str()) {
	warn!("sequence {} does not end with a stop codon", id);
    }
    Ok(encoded)
}

/// Read coding sequences from a FASTA file into genes. `exp=` and `ini=`
/// header keys override the default copy number and initiation probability.
pub fn read_fasta_genes<P: AsRef<Path>>(
    path: P,
    codons: &CodonTable,
    default_copies: usize,
    default_weight: f64
) -> Result<Vec<Gene>> {
    let path = path.as_ref();
    let file = File::open(path)
	.with_context(|| format!("Failed to open FASTA file '{}'", path.display()))?;
    let fasta_reader = Reader::new(BufReader::new(file));

    let mut genes = Vec::new();
    for record in fasta_reader.records() {
	let record = record
	    .with_context(|| format!("Error while reading FASTA record {}", genes.len() + 1))?;
	let id = record.id();

	let copies = header_value(record.desc(), "exp")?.unwrap_or(default_copies);
	let initiation_weight = header_value(record.desc(), "ini")?.unwrap_or(default_weight);
	let sequence = encode_coding_sequence(id, record.seq(), codons)?;

	genes.push(Gene { sequence, copies, initiation_weight });
    }

    if genes.is_empty() {
	bail!("FASTA file contained no records");
    }
    Ok(genes)
}

/// Write genes in the format `read_gene_table` expects, one gene per line.
pub fn write_gene_table<P: AsRef<Path>>(path: P, genes: &[Gene]) -> Result<()> {
    let path = path.as_ref();
    let file = File::create(path)
	.with_context(|| format!("Failed to create gene table '{}'", path.display()))?;
    let mut w = BufWriter::new(file);

    for gene in genes {
	write!(w, "{} {}", gene.initiation_weight, gene.copies)?;
	for c in &gene.sequence {
	    write!(w, " {}", c.0)?;
	}
	writeln!(w)?;
    }
    w.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Codon;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn small_codon_table() -> CodonTable {
	let codons = ["AAA", "GCU", "UUU"]
	    .iter()
	    .enumerate()
	    .map(|(c, tok)| Codon {
		token: tok.to_string(),
		species: SpeciesId(c as u32),
		rate_constant: 1.0,
	    })
	    .collect();
	CodonTable::new(codons, vec![10, 10, 10]).unwrap()
    }

    #[test]
    fn gene_records_may_span_lines() {
	let text = "0.5\n3\n0 1 2 2\n1.0 1 5 6\n  0.25 2\n7\n";
	let genes = parse_gene_table(text, 61, None).unwrap();

	assert_eq!(genes.len(), 3);
	let g0 = genes.get(crate::model::GeneId(0));
	assert_eq!(g0.initiation_weight, 0.5);
	assert_eq!(g0.copies, 3);
	assert_eq!(g0.sequence, vec![CodonId(0), CodonId(1), CodonId(2), CodonId(2)]);
	assert_eq!(genes.get(crate::model::GeneId(1)).sequence, vec![CodonId(5), CodonId(6)]);
	assert_eq!(genes.get(crate::model::GeneId(2)).sequence, vec![CodonId(7)]);
    }

    #[test]
    fn requested_gene_count_truncates_or_fails() {
	let text = "1 1 0 1\n1 1 2\n1 1 3\n";
	assert_eq!(parse_gene_table(text, 61, Some(2)).unwrap().len(), 2);
	assert!(parse_gene_table(text, 61, Some(4)).is_err());
    }

    #[test]
    fn gene_table_rejects_out_of_range_codons() {
	assert!(parse_gene_table("1 1 0 61\n", 61, None).is_err());
	assert!(parse_gene_table("1 1\n", 61, None).is_err());
	assert!(parse_gene_table("x 1 0\n", 61, None).is_err());
    }

    #[test]
    fn codon_table_needs_all_sense_codons() {
	let mut f = NamedTempFile::new().unwrap();
	for c in 0..NUM_SENSE_CODONS {
	    writeln!(f, "C{}\t{}\t{}\t1.0", c, c, 2).unwrap();
	}
	let table = read_codon_table(f.path(), 6100, 1.24e7).unwrap();
	assert_eq!(table.len(), 61);
	assert!(table.pools().iter().all(|&p| p == 100));

	let mut short = NamedTempFile::new().unwrap();
	writeln!(short, "AAA 0 1 1.0").unwrap();
	assert!(read_codon_table(short.path(), 100, 1.24e7).is_err());
    }

    #[test]
    fn trna_rows_are_validated() {
	assert!(parse_trna_table("AAA 0 1\n").is_err());
	assert!(parse_trna_table("AAA 0 1 1.5\n").is_err());
	let rows = parse_trna_table("AAA 0 3 1.0\nAAG 0 3 0.64\n").unwrap();
	assert_eq!(rows[1].wobble, 0.64);
    }

    #[test]
    fn coding_sequence_drops_the_final_stop() {
	let codons = small_codon_table();
	let encoded = encode_coding_sequence("g", b"AAAGCTTTTtaa", &codons).unwrap();
	assert_eq!(encoded, vec![CodonId(0), CodonId(1), CodonId(2)]);

	assert!(encode_coding_sequence("g", b"AAATAAGCT", &codons).is_err());
	assert!(encode_coding_sequence("g", b"AAAGC", &codons).is_err());
	assert!(encode_coding_sequence("g", b"AAACCC", &codons).is_err());
	assert!(encode_coding_sequence("g", b"MKV", &codons).is_err());
    }

    #[test]
    fn fasta_conversion_round_trips_through_the_gene_table() {
	let codons = small_codon_table();
	let mut fasta = NamedTempFile::new().unwrap();
	writeln!(fasta, ">YAL001 exp=4 ini=0.75\nAAAGCT\nTTTTAA\n>YAL002\nGCTTGA").unwrap();

	let genes = read_fasta_genes(fasta.path(), &codons, 1, 1.0).unwrap();
	assert_eq!(genes.len(), 2);
	assert_eq!(genes[0].copies, 4);
	assert_eq!(genes[0].initiation_weight, 0.75);
	assert_eq!(genes[1].copies, 1);
	assert_eq!(genes[1].sequence, vec![CodonId(1)]);

	let out = NamedTempFile::new().unwrap();
	write_gene_table(out.path(), &genes).unwrap();
	let table = read_gene_table(out.path(), codons.len(), None).unwrap();
	assert_eq!(table.len(), 2);
	assert_eq!(table.get(crate::model::GeneId(0)).sequence, genes[0].sequence);
	assert_eq!(table.get(crate::model::GeneId(0)).copies, 4);
    }
}
