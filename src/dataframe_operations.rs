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

/* dataframe_operations.rs: statistics on parquet snapshots using Polars
dataframes. */

use polars::prelude::*;
use polars::datatypes::DataType::Float64;

/// Mean number of ribosomes at each (gene, pos) per snapshot, i.e. a
/// ribosome profile summed over the copies of each gene. `gene` restricts the
/// result to one gene.
///
/// NOTE: snapshots are counted before filtering, so a gene with no bound
/// ribosome in some second still has that second in its denominator.
pub fn calculate_ribosome_profile(
    df_snapshots: &DataFrame,
    gene: Option<u32>
) -> PolarsResult<DataFrame> {
    let sort_opts = SortMultipleOptions::default()
	.with_maintain_order(false)
	.with_multithreaded(true)
	.with_nulls_last(true)
	.with_order_descending_multi([false, false]);

    let mut lf = df_snapshots
	.clone()
	.lazy()
	.with_column(col("second").n_unique().alias("snapshots"));

    if let Some(gene) = gene {
	lf = lf.filter(col("gene").eq(lit(gene)));
    }

    let result = lf
	.group_by([col("gene"), col("pos")])
	.agg([
	    col("pos").count().alias("ribosomes"),
	    col("snapshots").first(),
	])
	.with_column(
	    (col("ribosomes").cast(Float64) / col("snapshots").cast(Float64))
		.alias("mean ribosomes")
	)
	.select([col("gene"), col("pos"), col("mean ribosomes")])
	.sort(["gene", "pos"], sort_opts)
	.collect()?;

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshots() -> DataFrame {
	df!(
	    "second" => [0u32, 0, 0, 1, 1],
	    "mRNA" => [0u32, 0, 2, 0, 2],
	    "gene" => [0u32, 0, 1, 0, 1],
	    "pos" => [0u32, 12, 3, 0, 3],
	)
	.unwrap()
    }

    fn column_f64(df: &DataFrame, name: &str) -> Vec<f64> {
	df.column(name).unwrap().f64().unwrap().into_no_null_iter().collect()
    }

    fn column_u32(df: &DataFrame, name: &str) -> Vec<u32> {
	df.column(name).unwrap().u32().unwrap().into_no_null_iter().collect()
    }

    #[test]
    fn profile_averages_over_snapshots() {
	let profile = calculate_ribosome_profile(&snapshots(), None).unwrap();

	assert_eq!(column_u32(&profile, "gene"), vec![0, 0, 1]);
	assert_eq!(column_u32(&profile, "pos"), vec![0, 12, 3]);
	assert_eq!(column_f64(&profile, "mean ribosomes"), vec![1.0, 0.5, 1.0]);
    }

    #[test]
    fn gene_filter_keeps_every_snapshot_in_the_denominator() {
	let df = df!(
	    "second" => [0u32, 1, 1],
	    "mRNA" => [0u32, 1, 1],
	    "gene" => [0u32, 1, 1],
	    "pos" => [4u32, 0, 11],
	)
	.unwrap();

	let profile = calculate_ribosome_profile(&df, Some(1)).unwrap();
	assert_eq!(column_u32(&profile, "pos"), vec![0, 11]);
	assert_eq!(column_f64(&profile, "mean ribosomes"), vec![0.5, 0.5]);
    }
}
