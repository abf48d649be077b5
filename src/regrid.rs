//! Resampling of scattered (x, y) samples onto a regular lattice.
//!
//! Each lattice point takes the inverse-distance weighted mean of its `k` nearest input samples.
//! Samples sharing exact coordinates are first merged by averaging.

use crate::error::IngestError;
use crate::models::GridSpec;
use crate::table::Table;

use hashbrown::HashMap;
use ndarray::{Array2, ArrayView1};
use rayon::prelude::*;
use rstar::primitives::GeomWithData;
use rstar::RTree;

/// Added to weighted distances so that near-coincident points stay finite.
const EPSILON: f64 = 1e-12;

/// Distances at or below this are treated as an exact match.
const ZERO_DISTANCE: f64 = 1e-12;

/// Lattices with at least this many points are evaluated in parallel.
const PARALLEL_THRESHOLD: usize = 4096;

/// Name of the first coordinate column.
pub const X_COLUMN: &str = "x";

/// Name of the second coordinate column.
pub const Y_COLUMN: &str = "y";

/// Interpolation parameters.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RegridConfig {
    /// Number of nearest neighbours contributing to each lattice point
    pub k: usize,
    /// Inverse distance weighting exponent. Zero gives uniform weights.
    pub power: f64,
}

impl Default for RegridConfig {
    fn default() -> Self {
        RegridConfig { k: 3, power: 1.0 }
    }
}

type IndexedPoint = GeomWithData<[f64; 2], usize>;

/// Merge samples sharing exact coordinates by averaging all of their columns.
///
/// Returns one row per distinct point, in order of first appearance.
fn deduplicate(data: &Array2<f64>, x: usize, y: usize) -> Result<Array2<f64>, IngestError> {
    let ncols = data.ncols();
    let mut index: HashMap<(u64, u64), usize> = HashMap::with_capacity(data.nrows());
    let mut sums: Vec<f64> = Vec::with_capacity(data.len());
    let mut counts: Vec<f64> = Vec::new();
    for row in data.rows() {
        // Adding zero maps -0.0 onto 0.0.
        let key = ((row[x] + 0.0).to_bits(), (row[y] + 0.0).to_bits());
        let slot = *index.entry(key).or_insert_with(|| {
            sums.extend(std::iter::repeat(0.0).take(ncols));
            counts.push(0.0);
            counts.len() - 1
        });
        let sum = &mut sums[slot * ncols..(slot + 1) * ncols];
        for (acc, value) in sum.iter_mut().zip(row.iter()) {
            *acc += value;
        }
        counts[slot] += 1.0;
    }
    for (slot, count) in counts.iter().enumerate() {
        for acc in &mut sums[slot * ncols..(slot + 1) * ncols] {
            *acc /= count;
        }
    }
    Ok(Array2::from_shape_vec((counts.len(), ncols), sums)?)
}

/// Returns the normalised weights of neighbours at the given distances.
fn weights(distances: &[f64], power: f64) -> Vec<f64> {
    let exact = distances.iter().filter(|d| **d <= ZERO_DISTANCE).count();
    if exact > 0 {
        let share = 1.0 / exact as f64;
        return distances
            .iter()
            .map(|d| if *d <= ZERO_DISTANCE { share } else { 0.0 })
            .collect();
    }
    if power == 0.0 {
        let share = 1.0 / distances.len() as f64;
        return vec![share; distances.len()];
    }
    let raw: Vec<f64> = distances
        .iter()
        .map(|d| 1.0 / (d.powf(power) + EPSILON))
        .collect();
    let total: f64 = raw.iter().sum();
    raw.into_iter().map(|w| w / total).collect()
}

/// Interpolate one lattice point, returning a full output row.
fn interpolate(
    tree: &RTree<IndexedPoint>,
    samples: &Array2<f64>,
    point: [f64; 2],
    k: usize,
    power: f64,
    x: usize,
    y: usize,
) -> Vec<f64> {
    let (neighbours, distances): (Vec<usize>, Vec<f64>) = tree
        .nearest_neighbor_iter_with_distance_2(&point)
        .take(k)
        .map(|(neighbour, distance_2)| (neighbour.data, distance_2.sqrt()))
        .unzip();
    let weights = weights(&distances, power);
    let mut row = vec![0.0; samples.ncols()];
    for (neighbour, weight) in neighbours.into_iter().zip(weights) {
        let sample: ArrayView1<f64> = samples.row(neighbour);
        for (out, value) in row.iter_mut().zip(sample.iter()) {
            *out += weight * value;
        }
    }
    row[x] = point[0];
    row[y] = point[1];
    row
}

/// Regrid a table onto the lattice described by `grid`.
///
/// The output has `grid.x.n * grid.y.n` rows with `x` varying fastest, and the same columns as
/// the input. Coordinate columns hold the lattice coordinates and every other column holds the
/// interpolated values.
///
/// # Arguments
///
/// * `table`: Scattered samples, including `x` and `y` columns
/// * `grid`: Target lattice
/// * `config`: Interpolation parameters
/// * `file`: Name of the source file, used in errors
pub fn regrid(
    table: &Table,
    grid: &GridSpec,
    config: &RegridConfig,
    file: &str,
) -> Result<Table, IngestError> {
    let column = |name: &str| {
        table
            .column_index(name)
            .ok_or_else(|| IngestError::GridColumnMissing {
                file: file.to_string(),
                column: name.to_string(),
            })
    };
    let x = column(X_COLUMN)?;
    let y = column(Y_COLUMN)?;
    if table.nrows() == 0 {
        return Err(IngestError::EmptyInput {
            file: file.to_string(),
        });
    }

    let samples = deduplicate(table.data(), x, y)?;
    let points: Vec<IndexedPoint> = samples
        .rows()
        .into_iter()
        .enumerate()
        .map(|(i, row)| GeomWithData::new([row[x], row[y]], i))
        .collect();
    let tree = RTree::bulk_load(points);
    let k = config.k.clamp(1, samples.nrows());

    let xs = grid.x.values();
    let ys = grid.y.values();
    let lattice: Vec<[f64; 2]> = ys
        .iter()
        .flat_map(|y| xs.iter().map(move |x| [*x, *y]))
        .collect();
    let evaluate = |point: &[f64; 2]| interpolate(&tree, &samples, *point, k, config.power, x, y);
    let rows: Vec<Vec<f64>> = if lattice.len() >= PARALLEL_THRESHOLD {
        lattice.par_iter().map(evaluate).collect()
    } else {
        lattice.iter().map(evaluate).collect()
    };

    tracing::debug!(
        file,
        input_rows = table.nrows(),
        distinct_points = samples.nrows(),
        output_rows = rows.len(),
        k,
        "regridded table"
    );
    let data = Array2::from_shape_vec((rows.len(), table.ncols()), rows.concat())?;
    Table::new(table.names().to_vec(), data)
}
