use crate::SampleShape;

use super::{find_run, U32Table};

#[derive(Debug, Clone, PartialEq, Eq)]
struct ShapeRow {
    shape: SampleShape,
    last_index: u64,
}

/// Run-length encoding of a sequence of sample shapes.
///
/// Consecutive identical shapes collapse into one row holding the cumulative
/// last index; lookup is a binary search over those indices.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShapeEncoder {
    rows: Vec<ShapeRow>,
}

impl ShapeEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn num_samples(&self) -> u64 {
        self.rows.last().map(|r| r.last_index + 1).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn num_runs(&self) -> usize {
        self.rows.len()
    }

    /// Dimensionality of the stored shapes, if any sample is registered.
    pub fn ndim(&self) -> Option<usize> {
        self.rows.first().map(|r| r.shape.len())
    }

    /// Appends `count` samples of the given shape.
    pub fn register_samples(&mut self, shape: &SampleShape, count: u64) {
        if count == 0 {
            return;
        }
        let next_last = self.num_samples() + count - 1;
        match self.rows.last_mut() {
            Some(last) if last.shape == *shape => last.last_index = next_last,
            _ => self.rows.push(ShapeRow {
                shape: shape.clone(),
                last_index: next_last,
            }),
        }
    }

    pub fn get(&self, i: u64) -> Option<&SampleShape> {
        find_run(&self.rows, i, |r| r.last_index).map(|r| &self.rows[r].shape)
    }

    /// Overwrites the shape at index `i`, splitting its run into up to three
    /// runs and re-merging equal neighbours.
    pub fn set(&mut self, i: u64, shape: SampleShape) {
        let r = find_run(&self.rows, i, |r| r.last_index).expect("sample index out of range");
        if self.rows[r].shape == shape {
            return;
        }
        let first = if r == 0 {
            0
        } else {
            self.rows[r - 1].last_index + 1
        };
        let last = self.rows[r].last_index;
        let old = self.rows[r].shape.clone();

        let mut repl = Vec::with_capacity(3);
        if i > first {
            repl.push(ShapeRow {
                shape: old.clone(),
                last_index: i - 1,
            });
        }
        let mid = r + repl.len();
        repl.push(ShapeRow {
            shape,
            last_index: i,
        });
        if i < last {
            repl.push(ShapeRow {
                shape: old,
                last_index: last,
            });
        }
        self.rows.splice(r..=r, repl);
        self.coalesce(mid);
    }

    fn coalesce(&mut self, idx: usize) {
        if idx + 1 < self.rows.len() && self.rows[idx].shape == self.rows[idx + 1].shape {
            self.rows.remove(idx);
        }
        if idx > 0 && idx < self.rows.len() && self.rows[idx - 1].shape == self.rows[idx].shape {
            self.rows.remove(idx - 1);
        }
    }

    /// Wire form: one row per run, `ndim` shape columns plus the last index.
    pub fn to_table(&self) -> U32Table {
        let cols = self.ndim().map(|n| n + 1).unwrap_or(0);
        let mut table = U32Table::new(cols);
        for row in &self.rows {
            let mut vals: Vec<u32> = row
                .shape
                .iter()
                .map(|d| (*d).try_into().expect("axis exceeds u32 range"))
                .collect();
            vals.push(row.last_index.try_into().expect("index exceeds u32 range"));
            table.push_row(&vals);
        }
        table
    }

    pub fn from_table(table: &U32Table) -> Result<Self, &'static str> {
        if table.is_empty() {
            return Ok(Self::new());
        }
        if table.cols == 0 {
            return Err("shape table has no columns");
        }
        let mut rows = Vec::with_capacity(table.num_rows());
        let mut prev_last: Option<u64> = None;
        for r in 0..table.num_rows() {
            let vals = table.row(r);
            let (shape_vals, last) = vals.split_at(table.cols - 1);
            let last = last[0] as u64;
            if prev_last.map_or(false, |p| last <= p) {
                return Err("shape table indices are not increasing");
            }
            prev_last = Some(last);
            rows.push(ShapeRow {
                shape: shape_vals.iter().map(|v| *v as u64).collect(),
                last_index: last,
            });
        }
        Ok(Self { rows })
    }
}
