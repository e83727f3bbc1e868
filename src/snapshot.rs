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

/* snapshot.rs: per-second ribosome positions, as text grids or parquet */

use anyhow::{Context, Result};
use clap::ValueEnum;
use tracing::trace;

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use std::sync::Arc;

use arrow2::datatypes::{Schema, Field, DataType};
use arrow2::array::*;
use arrow2::chunk::Chunk;
use arrow2::io::parquet::write::{
    CompressionOptions, WriteOptions, FileWriter, Version, Encoding,
    RowGroupIterator
};

use crate::engine::Snapshot;
use crate::model::TranscriptId;
use crate::report::{snapshot_path, write_occupancy};

// Buffered rows before a row group is written out
const ROW_GROUP_ROWS: usize = 1 << 20;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum SnapshotFormat {
    /// One `<prefix>_ribo_pos_<second>` grid file per second
    Text,
    /// A single `<prefix>_snapshots.pq` with one row per bound ribosome
    Parquet,
}

/* Occupied cells of every snapshot, long format:
   Column 1: second
   Column 2: mRNA (transcript copy)
   Column 3: gene
   Column 4: pos (codon) */
pub struct ParquetSnapshots {
    writer: FileWriter<BufWriter<File>>,
    schema: Schema,
    options: WriteOptions,
    seconds: Vec<u32>,
    transcripts: Vec<u32>,
    genes: Vec<u32>,
    positions: Vec<u32>,
}

impl ParquetSnapshots {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
	let path = path.as_ref();

	let schema = Schema::from(vec![
	    Field::new("second", DataType::UInt32, false),
	    Field::new("mRNA", DataType::UInt32, false),
	    Field::new("gene", DataType::UInt32, false),
	    Field::new("pos", DataType::UInt32, false),
	]);

	let options = WriteOptions {
	    write_statistics: true,
	    compression: CompressionOptions::Snappy,
	    version: Version::V2,
	    data_pagesize_limit: None,
	};

	let out_file = BufWriter::new(
	    File::create(path)
		.with_context(|| format!("Failed to create '{}'", path.display()))?
	);
	let writer = FileWriter::try_new(out_file, schema.clone(), options)?;

	Ok(Self {
	    writer,
	    schema,
	    options,
	    seconds: Vec::new(),
	    transcripts: Vec::new(),
	    genes: Vec::new(),
	    positions: Vec::new(),
	})
    }

    pub fn record(&mut self, snapshot: &Snapshot<'_>) -> Result<()> {
	let second = snapshot.second as u32;
	for (t, mRNA) in snapshot.transcripts.iter().enumerate() {
	    for (pos, _) in snapshot.grid.ribosomes_on(TranscriptId::from_index(t)) {
		self.seconds.push(second);
		self.transcripts.push(t as u32);
		self.genes.push(mRNA.gene.0);
		self.positions.push(pos as u32);
	    }
	}

	if self.seconds.len() >= ROW_GROUP_ROWS {
	    self.flush()?;
	}
	Ok(())
    }

    fn flush(&mut self) -> Result<()> {
	if self.seconds.is_empty() {
	    return Ok(());
	}

	let arrays: Vec<Arc<dyn Array>> = vec![
	    PrimitiveArray::from_vec(std::mem::take(&mut self.seconds)).arced(),
	    PrimitiveArray::from_vec(std::mem::take(&mut self.transcripts)).arced(),
	    PrimitiveArray::from_vec(std::mem::take(&mut self.genes)).arced(),
	    PrimitiveArray::from_vec(std::mem::take(&mut self.positions)).arced(),
	];
	let chunk = Chunk::try_new(arrays)?;

	/* Rows arrive sorted by second, then mRNA, then pos, so the first three
	   columns could be delta-encoded; Plain keeps them readable everywhere. */
	let encodings = vec![
	    vec![Encoding::Plain], // second
	    vec![Encoding::Plain], // mRNA
	    vec![Encoding::Plain], // gene
	    vec![Encoding::Plain], // pos
	];

	let row_groups = RowGroupIterator::try_new(
	    vec![Ok(chunk)].into_iter(),
	    &self.schema,
	    self.options,
	    encodings,
	)?;

	for group in row_groups {
	    self.writer.write(group?)?;
	}
	Ok(())
    }

    /// Flush what is buffered and close the file.
    pub fn finish(mut self) -> Result<()> {
	self.flush()?;
	let _ = self.writer.end(None)?;
	Ok(())
    }
}

pub enum SnapshotSink {
    Text { prefix: String },
    Parquet(ParquetSnapshots),
}

/// Writes the snapshots a run produces from `first_second` onward.
pub struct SnapshotRecorder {
    sink: SnapshotSink,
    first_second: u64,
    recorded: usize,
}

impl SnapshotRecorder {
    pub fn new(prefix: &str, format: SnapshotFormat, first_second: u64) -> Result<Self> {
	let sink = match format {
	    SnapshotFormat::Text => SnapshotSink::Text { prefix: prefix.to_string() },
	    SnapshotFormat::Parquet => SnapshotSink::Parquet(
		ParquetSnapshots::create(format!("{}_snapshots.pq", prefix))?
	    ),
	};
	Ok(Self { sink, first_second, recorded: 0 })
    }

    pub fn record(&mut self, snapshot: &Snapshot<'_>) -> Result<()> {
	if snapshot.second < self.first_second {
	    return Ok(());
	}
	match &mut self.sink {
	    SnapshotSink::Text { prefix } => {
		write_occupancy(&snapshot_path(prefix, snapshot.second), snapshot.grid)?
	    }
	    SnapshotSink::Parquet(writer) => writer.record(snapshot)?,
	}
	self.recorded += 1;
	trace!(second = snapshot.second, time = snapshot.time, "snapshot written");
	Ok(())
    }

    /// Close the sink. Returns how many snapshots were written.
    pub fn finish(self) -> Result<usize> {
	if let SnapshotSink::Parquet(writer) = self.sink {
	    writer.finish()?;
	}
	Ok(self.recorded)
    }
}
