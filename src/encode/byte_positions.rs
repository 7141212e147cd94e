use super::{find_run, U32Table};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PositionRow {
    nbytes: u64,
    first_start: u64,
    last_index: u64,
}

/// Run-length encoding of per-sample byte ranges within a chunk's data
/// block.
///
/// A run covers consecutive samples of equal size; starts inside a run form
/// an arithmetic progression from `first_start`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BytePositionsEncoder {
    rows: Vec<PositionRow>,
}

impl BytePositionsEncoder {
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

    /// First sample index covered by run `r`.
    fn run_first(&self, r: usize) -> u64 {
        if r == 0 {
            0
        } else {
            self.rows[r - 1].last_index + 1
        }
    }

    fn run_len(&self, r: usize) -> u64 {
        self.rows[r].last_index - self.run_first(r) + 1
    }

    fn run_end_byte(&self, r: usize) -> u64 {
        let row = &self.rows[r];
        row.first_start + row.nbytes * self.run_len(r)
    }

    /// Total number of data bytes covered by the registered samples.
    pub fn num_bytes(&self) -> u64 {
        if self.rows.is_empty() {
            0
        } else {
            self.run_end_byte(self.rows.len() - 1)
        }
    }

    /// Appends `count` samples of `nbytes` each, starting where the previous
    /// run ended.
    pub fn register_samples(&mut self, nbytes: u64, count: u64) {
        if count == 0 {
            return;
        }
        let next_last = self.num_samples() + count - 1;
        let next_start = self.num_bytes();
        match self.rows.last_mut() {
            Some(last) if last.nbytes == nbytes => last.last_index = next_last,
            _ => self.rows.push(PositionRow {
                nbytes,
                first_start: next_start,
                last_index: next_last,
            }),
        }
    }

    /// Absolute `(start, end)` byte range of sample `i`.
    pub fn get(&self, i: u64) -> Option<(u64, u64)> {
        let r = find_run(&self.rows, i, |r| r.last_index)?;
        let row = &self.rows[r];
        let start = row.first_start + (i - self.run_first(r)) * row.nbytes;
        Some((start, start + row.nbytes))
    }

    /// Resizes sample `i` to `nbytes`, splitting its run and relocating
    /// every downstream start by the size delta.
    pub fn set(&mut self, i: u64, nbytes: u64) {
        let r = find_run(&self.rows, i, |r| r.last_index).expect("sample index out of range");
        let old = self.rows[r].nbytes;
        if old == nbytes {
            return;
        }
        let (start, _) = self.get(i).expect("run lookup cannot fail here");
        let first = self.run_first(r);
        let last = self.rows[r].last_index;
        let first_start = self.rows[r].first_start;
        let delta = nbytes as i64 - old as i64;

        let mut repl = Vec::with_capacity(3);
        if i > first {
            repl.push(PositionRow {
                nbytes: old,
                first_start,
                last_index: i - 1,
            });
        }
        let mid = r + repl.len();
        repl.push(PositionRow {
            nbytes,
            first_start: start,
            last_index: i,
        });
        if i < last {
            repl.push(PositionRow {
                nbytes: old,
                first_start: start + nbytes,
                last_index: last,
            });
        }
        let repl_len = repl.len();
        self.rows.splice(r..=r, repl);
        for row in self.rows[r + repl_len..].iter_mut() {
            row.first_start = (row.first_start as i64 + delta) as u64;
        }
        self.coalesce(mid);
    }

    fn mergeable(&self, a: usize) -> bool {
        a + 1 < self.rows.len()
            && self.rows[a].nbytes == self.rows[a + 1].nbytes
            && self.rows[a + 1].first_start == self.run_end_byte(a)
    }

    fn coalesce(&mut self, idx: usize) {
        if self.mergeable(idx) {
            self.rows[idx + 1].first_start = self.rows[idx].first_start;
            self.rows.remove(idx);
        }
        if idx > 0 && idx < self.rows.len() && self.mergeable(idx - 1) {
            self.rows[idx].first_start = self.rows[idx - 1].first_start;
            self.rows.remove(idx - 1);
        }
    }

    /// Wire form: `(nbytes, first_start, last_index)` per run.
    pub fn to_table(&self) -> U32Table {
        let mut table = U32Table::new(3);
        for row in &self.rows {
            table.push_row(&[
                row.nbytes.try_into().expect("nbytes exceeds u32 range"),
                row.first_start
                    .try_into()
                    .expect("byte offset exceeds u32 range"),
                row.last_index.try_into().expect("index exceeds u32 range"),
            ]);
        }
        table
    }

    pub fn from_table(table: &U32Table) -> Result<Self, &'static str> {
        if table.is_empty() {
            return Ok(Self::new());
        }
        if table.cols != 3 {
            return Err("byte position table must have three columns");
        }
        let mut rows = Vec::with_capacity(table.num_rows());
        let mut prev_last: Option<u64> = None;
        for r in 0..table.num_rows() {
            let vals = table.row(r);
            let last = vals[2] as u64;
            if prev_last.map_or(false, |p| last <= p) {
                return Err("byte position indices are not increasing");
            }
            prev_last = Some(last);
            rows.push(PositionRow {
                nbytes: vals[0] as u64,
                first_start: vals[1] as u64,
                last_index: last,
            });
        }
        Ok(Self { rows })
    }

    /// Rebuilds an encoder from `(nbytes, last_index)` pairs, assuming the
    /// ranges were contiguous from byte zero. Used when upgrading legacy
    /// chunks whose tables lacked the start column.
    pub fn from_sizes(pairs: impl IntoIterator<Item = (u64, u64)>) -> Result<Self, &'static str> {
        let mut enc = Self::new();
        for (nbytes, last) in pairs {
            let registered = enc.num_samples();
            if last < registered {
                return Err("byte position indices are not increasing");
            }
            enc.register_samples(nbytes, last - registered + 1);
        }
        Ok(enc)
    }
}
