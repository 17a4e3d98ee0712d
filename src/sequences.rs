//! Observation containers and the per-sequence index over them.
//!
//! A training batch is one concatenated buffer holding every sequence back to
//! back, plus the length of each sequence. [`SequenceIndex`] turns those lengths
//! into half-open spans over the buffer. Each emission family reads its own
//! container type through the [`ObservationSet`] trait:
//!
//! - [`FeatureMatrix`]: fixed-width feature rows (Gaussian, Poisson, mixtures)
//! - `Vec<usize>`: discrete symbols (categorical)
//! - [`MarkArena`]: ragged per-timestep mark lists (clusterless Poisson)
//! - [`MultiProbeMarks`]: one mark arena per probe sharing a time axis

use std::ops::Range;

use crate::errors::{validate_all_finite, HmmError, HmmResult};

/// Common interface of every observation buffer.
pub trait ObservationSet: Send + Sync {
    /// Observation emitted at a single timestep.
    type Frame;

    /// Total number of timesteps across all sequences.
    fn n_timesteps(&self) -> usize;

    /// Append one timestep.
    fn push_frame(&mut self, frame: Self::Frame) -> HmmResult<()>;
}

/// Spans of the individual sequences inside a concatenated buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceIndex {
    spans: Vec<Range<usize>>,
    total: usize,
}

impl SequenceIndex {
    /// Build the index from optional sequence lengths.
    ///
    /// `None` treats the whole buffer as a single sequence. Lengths must be
    /// positive and sum to `n_timesteps`.
    pub fn from_lengths(lengths: Option<&[usize]>, n_timesteps: usize) -> HmmResult<Self> {
        if n_timesteps == 0 {
            return Err(HmmError::InsufficientData {
                required: 1,
                actual: 0,
            });
        }

        let lengths = match lengths {
            Some(l) => l,
            None => return Ok(Self::single(n_timesteps)),
        };

        if let Some(i) = lengths.iter().position(|&l| l == 0) {
            return Err(HmmError::observation(
                Some(i),
                "sequence lengths must be positive",
            ));
        }

        let total: usize = lengths.iter().sum();
        if total != n_timesteps {
            return Err(HmmError::shape(
                "sum of sequence lengths",
                n_timesteps,
                total,
            ));
        }

        let mut spans = Vec::with_capacity(lengths.len());
        let mut start = 0;
        for &len in lengths {
            spans.push(start..start + len);
            start += len;
        }

        Ok(Self { spans, total })
    }

    /// Index describing one sequence covering the whole buffer.
    pub fn single(n_timesteps: usize) -> Self {
        Self {
            spans: vec![0..n_timesteps],
            total: n_timesteps,
        }
    }

    /// Number of sequences.
    pub fn n_sequences(&self) -> usize {
        self.spans.len()
    }

    /// Total number of timesteps covered.
    pub fn n_timesteps(&self) -> usize {
        self.total
    }

    /// Span of the `i`-th sequence.
    pub fn span(&self, i: usize) -> Range<usize> {
        self.spans[i].clone()
    }

    /// Iterate over all spans in order.
    pub fn iter(&self) -> impl Iterator<Item = Range<usize>> + '_ {
        self.spans.iter().cloned()
    }

    /// Slice view of the spans.
    pub fn spans(&self) -> &[Range<usize>] {
        &self.spans
    }
}

/// Row-major buffer of fixed-width feature vectors.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FeatureMatrix {
    data: Vec<f64>,
    n_features: usize,
}

impl FeatureMatrix {
    /// Wrap a flat buffer holding `data.len() / n_features` rows.
    pub fn new(data: Vec<f64>, n_features: usize) -> HmmResult<Self> {
        if n_features == 0 {
            return Err(HmmError::shape("n_features", "at least 1", 0));
        }
        if data.len() % n_features != 0 {
            return Err(HmmError::shape(
                "feature buffer length",
                format!("a multiple of {}", n_features),
                data.len(),
            ));
        }
        validate_all_finite(&data, "feature buffer")?;
        Ok(Self { data, n_features })
    }

    /// Build from a list of rows, all of which must share a width.
    pub fn from_rows(rows: &[Vec<f64>]) -> HmmResult<Self> {
        let n_features = rows.first().map(|r| r.len()).unwrap_or(0);
        let mut data = Vec::with_capacity(rows.len() * n_features);
        for (i, row) in rows.iter().enumerate() {
            if row.len() != n_features {
                return Err(HmmError::ShapeMismatch {
                    what: format!("feature row {}", i),
                    expected: n_features.to_string(),
                    actual: row.len().to_string(),
                });
            }
            data.extend_from_slice(row);
        }
        Self::new(data, n_features)
    }

    /// Build from a single feature column.
    pub fn from_column(values: &[f64]) -> HmmResult<Self> {
        Self::new(values.to_vec(), 1)
    }

    /// Empty buffer with a fixed width, filled through [`ObservationSet::push_frame`].
    pub fn empty(n_features: usize) -> Self {
        Self {
            data: Vec::new(),
            n_features,
        }
    }

    /// Number of features per row.
    pub fn n_features(&self) -> usize {
        self.n_features
    }

    /// Number of rows.
    pub fn n_rows(&self) -> usize {
        if self.n_features == 0 {
            0
        } else {
            self.data.len() / self.n_features
        }
    }

    /// Row at timestep `t`.
    pub fn row(&self, t: usize) -> &[f64] {
        &self.data[t * self.n_features..(t + 1) * self.n_features]
    }

    /// Rows covered by `span`.
    pub fn rows(&self, span: Range<usize>) -> impl Iterator<Item = &[f64]> + '_ {
        span.map(move |t| self.row(t))
    }

    /// All rows as borrowed slices.
    pub fn all_rows(&self) -> Vec<&[f64]> {
        self.data.chunks(self.n_features.max(1)).collect()
    }

    /// Flat underlying buffer.
    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }
}

impl ObservationSet for FeatureMatrix {
    type Frame = Vec<f64>;

    fn n_timesteps(&self) -> usize {
        self.n_rows()
    }

    fn push_frame(&mut self, frame: Vec<f64>) -> HmmResult<()> {
        if frame.len() != self.n_features {
            return Err(HmmError::shape("feature row", self.n_features, frame.len()));
        }
        self.data.extend(frame);
        Ok(())
    }
}

impl ObservationSet for Vec<usize> {
    type Frame = usize;

    fn n_timesteps(&self) -> usize {
        self.len()
    }

    fn push_frame(&mut self, frame: usize) -> HmmResult<()> {
        self.push(frame);
        Ok(())
    }
}

/// Flat arena of marks with an `(offset, count)` entry per timestep.
///
/// Mark `k` of timestep `t` occupies
/// `values[(offset + k) * dim .. (offset + k + 1) * dim]`.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MarkArena {
    dim: usize,
    values: Vec<f64>,
    frames: Vec<(usize, usize)>,
}

impl MarkArena {
    /// Empty arena for marks of dimension `dim`.
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            values: Vec::new(),
            frames: Vec::new(),
        }
    }

    /// Build an arena from nested per-timestep mark lists.
    pub fn from_frames(dim: usize, frames: &[Vec<Vec<f64>>]) -> HmmResult<Self> {
        let mut arena = Self::new(dim);
        for frame in frames {
            arena.push_marks(frame)?;
        }
        Ok(arena)
    }

    /// Append one timestep's marks (possibly none).
    pub fn push_marks(&mut self, marks: &[Vec<f64>]) -> HmmResult<()> {
        let offset = self.n_marks();
        for (k, mark) in marks.iter().enumerate() {
            if mark.len() != self.dim {
                return Err(HmmError::ShapeMismatch {
                    what: format!("mark {} of timestep {}", k, self.frames.len()),
                    expected: self.dim.to_string(),
                    actual: mark.len().to_string(),
                });
            }
            if mark.iter().any(|v| !v.is_finite()) {
                return Err(HmmError::observation(
                    Some(self.frames.len()),
                    format!("mark {} contains non-finite values", k),
                ));
            }
        }
        for mark in marks {
            self.values.extend_from_slice(mark);
        }
        self.frames.push((offset, marks.len()));
        Ok(())
    }

    /// Mark dimensionality.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Total number of marks across all timesteps.
    pub fn n_marks(&self) -> usize {
        if self.dim == 0 {
            0
        } else {
            self.values.len() / self.dim
        }
    }

    /// Number of marks observed at timestep `t`.
    pub fn count_at(&self, t: usize) -> usize {
        self.frames[t].1
    }

    /// Marks observed at timestep `t`.
    pub fn marks_at(&self, t: usize) -> impl Iterator<Item = &[f64]> + '_ {
        let (offset, count) = self.frames[t];
        let start = offset * self.dim;
        let end = (offset + count) * self.dim;
        self.values[start..end].chunks(self.dim.max(1))
    }

    /// Every mark in the arena regardless of timestep.
    pub fn all_marks(&self) -> Vec<&[f64]> {
        if self.dim == 0 {
            return Vec::new();
        }
        self.values.chunks(self.dim).collect()
    }
}

impl ObservationSet for MarkArena {
    type Frame = Vec<Vec<f64>>;

    fn n_timesteps(&self) -> usize {
        self.frames.len()
    }

    fn push_frame(&mut self, frame: Vec<Vec<f64>>) -> HmmResult<()> {
        self.push_marks(&frame)
    }
}

/// Mark arenas for several probes recorded over the same timesteps.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MultiProbeMarks {
    probes: Vec<MarkArena>,
}

impl MultiProbeMarks {
    /// Combine per-probe arenas, which must agree on the number of timesteps.
    pub fn new(probes: Vec<MarkArena>) -> HmmResult<Self> {
        if probes.is_empty() {
            return Err(HmmError::shape("probes", "at least 1", 0));
        }
        let n = probes[0].n_timesteps();
        for (p, arena) in probes.iter().enumerate() {
            if arena.n_timesteps() != n {
                return Err(HmmError::ShapeMismatch {
                    what: format!("timesteps of probe {}", p),
                    expected: n.to_string(),
                    actual: arena.n_timesteps().to_string(),
                });
            }
        }
        Ok(Self { probes })
    }

    /// Empty container with one arena per probe dimension.
    pub fn empty(dims: &[usize]) -> Self {
        Self {
            probes: dims.iter().map(|&d| MarkArena::new(d)).collect(),
        }
    }

    /// Number of probes.
    pub fn n_probes(&self) -> usize {
        self.probes.len()
    }

    /// Arena of probe `p`.
    pub fn probe(&self, p: usize) -> &MarkArena {
        &self.probes[p]
    }

    /// All probe arenas.
    pub fn probes(&self) -> &[MarkArena] {
        &self.probes
    }
}

impl ObservationSet for MultiProbeMarks {
    type Frame = Vec<Vec<Vec<f64>>>;

    fn n_timesteps(&self) -> usize {
        self.probes.first().map(|p| p.n_timesteps()).unwrap_or(0)
    }

    fn push_frame(&mut self, frame: Vec<Vec<Vec<f64>>>) -> HmmResult<()> {
        if frame.len() != self.probes.len() {
            return Err(HmmError::shape("probes in frame", self.probes.len(), frame.len()));
        }
        for (arena, marks) in self.probes.iter_mut().zip(frame.iter()) {
            arena.push_marks(marks)?;
        }
        Ok(())
    }
}
