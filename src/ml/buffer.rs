//! Feature preprocessing for training and scoring.
//!
//! Owns a dense `rows x dims` block of reals and rolls it through the
//! configured difference / smooth / lag stages. Rows are ordered oldest
//! to newest; every stage anchors at the newest end, so the surviving
//! rows are always the most recent ones.

/// Preprocessing parameters.
#[derive(Debug, Clone, Copy)]
pub struct Preprocess {
    /// First-difference distance, >= 0 (0 disables).
    pub diff_n: usize,
    /// Trailing moving-average window, >= 1 (1 disables).
    pub smooth_n: usize,
    /// Embedding depth: each output row concatenates `lag_n + 1` rows.
    pub lag_n: usize,
}

impl Preprocess {
    /// Raw rows consumed to produce a single output row.
    pub fn rows_for_one(&self) -> usize {
        self.diff_n + self.smooth_n + self.lag_n
    }
}

pub struct SamplesBuffer {
    data: Vec<f64>,
    rows: usize,
    dims: usize,
    prep: Preprocess,
}

impl SamplesBuffer {
    /// Takes ownership of a `rows x dims` row-major block.
    pub fn new(data: Vec<f64>, rows: usize, dims: usize, prep: Preprocess) -> Self {
        assert_eq!(data.len(), rows * dims, "samples buffer shape mismatch");
        Self {
            data,
            rows,
            dims,
            prep,
        }
    }

    /// Output row count for a given input row count:
    /// `max(0, rows - DiffN - (SmoothN - 1) - LagN)`.
    pub fn output_rows(rows: usize, prep: Preprocess) -> usize {
        rows.saturating_sub(prep.diff_n + prep.smooth_n.saturating_sub(1) + prep.lag_n)
    }

    /// Run diff, smooth and lag in order. Returns the final feature
    /// matrix, one `dims * (lag_n + 1)` vector per surviving row, or an
    /// empty vec if any stage would leave no rows.
    pub fn preprocess(mut self) -> Vec<Vec<f64>> {
        let Preprocess {
            diff_n,
            smooth_n,
            lag_n,
        } = self.prep;

        if smooth_n == 0 || Self::output_rows(self.rows, self.prep) == 0 {
            return Vec::new();
        }

        self.diff(diff_n);
        self.smooth(diff_n, smooth_n);
        self.lag(diff_n, smooth_n, lag_n)
    }

    /// Replace each row (from the newest end) with its difference against
    /// the row `diff_n` back. Rows `[diff_n, rows)` stay meaningful.
    fn diff(&mut self, diff_n: usize) {
        if diff_n == 0 {
            return;
        }

        for idx in 0..self.rows - diff_n {
            let high = self.rows - 1 - idx;
            let low = high - diff_n;
            for d in 0..self.dims {
                self.data[high * self.dims + d] -= self.data[low * self.dims + d];
            }
        }
    }

    /// Trailing moving average of window `smooth_n` over the diffed rows,
    /// back to front; a single `1/smooth_n` scale per window. Rows
    /// `[diff_n + smooth_n - 1, rows)` stay meaningful.
    fn smooth(&mut self, diff_n: usize, smooth_n: usize) {
        if smooth_n == 1 {
            return;
        }

        let snapshot = self.data.clone();
        let factor = 1.0 / smooth_n as f64;

        for t in (diff_n + smooth_n - 1)..self.rows {
            for d in 0..self.dims {
                let sum: f64 = (t + 1 - smooth_n..=t)
                    .map(|r| snapshot[r * self.dims + d])
                    .sum();
                self.data[t * self.dims + d] = sum * factor;
            }
        }
    }

    /// Expand each surviving row into the concatenation of itself and its
    /// `lag_n` predecessors, oldest first.
    fn lag(&self, diff_n: usize, smooth_n: usize, lag_n: usize) -> Vec<Vec<f64>> {
        let first = diff_n + smooth_n - 1 + lag_n;

        (first..self.rows)
            .map(|i| {
                let mut row = Vec::with_capacity(self.dims * (lag_n + 1));
                for j in i - lag_n..=i {
                    row.extend_from_slice(&self.data[j * self.dims..(j + 1) * self.dims]);
                }
                row
            })
            .collect()
    }
}
