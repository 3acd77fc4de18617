//! The feed-forward network scoring transitions: embeddings in, optional
//! direct connections and an optional hidden layer, softmax out.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::binary::{BinaryDecoder, BinaryEncoder, ModelError};
use crate::embedding::Embedding;
use crate::Err;

/// Storage for a single weight.
pub trait WeightCell: Send + Sync {
  fn new(value: f32) -> Self;
  fn get(&self) -> f32;
}

impl WeightCell for f32 {
  fn new(value: f32) -> Self {
    value
  }

  fn get(&self) -> f32 {
    *self
  }
}

/// A weight shared between training threads.
///
/// Training threads read and update weights concurrently without any
/// locking: a thread may overwrite an update another thread made in the
/// meantime, which asynchronous SGD tolerates. Each load and store is a
/// relaxed atomic, so there is no undefined behaviour, only lost updates.
#[derive(Debug, Default)]
pub struct HogwildCell(AtomicU32);

impl HogwildCell {
  pub fn set(&self, value: f32) {
    self.0.store(value.to_bits(), Ordering::Relaxed);
  }

  /// Adds `delta`. Not atomic as a whole; concurrent additions may be lost.
  pub fn add(&self, delta: f32) {
    self.set(self.get() + delta);
  }
}

impl WeightCell for HogwildCell {
  fn new(value: f32) -> Self {
    Self(AtomicU32::new(value.to_bits()))
  }

  fn get(&self) -> f32 {
    f32::from_bits(self.0.load(Ordering::Relaxed))
  }
}

impl Clone for HogwildCell {
  fn clone(&self) -> Self {
    Self::new(self.get())
  }
}

/// Row-major weight matrix. Row `i` holds the weights leaving input `i`; the
/// trailing row is the bias.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Matrix<W = f32> {
  rows: usize,
  cols: usize,
  data: Vec<W>,
}

impl<W: WeightCell> Matrix<W> {
  pub fn from_fn(rows: usize, cols: usize, mut f: impl FnMut(usize, usize) -> f32) -> Self {
    let mut data = Vec::with_capacity(rows * cols);
    for r in 0..rows {
      for c in 0..cols {
        data.push(W::new(f(r, c)));
      }
    }
    Self { rows, cols, data }
  }

  pub fn empty() -> Self {
    Self {
      rows: 0,
      cols: 0,
      data: Vec::new(),
    }
  }

  pub fn rows(&self) -> usize {
    self.rows
  }

  pub fn cols(&self) -> usize {
    self.cols
  }

  pub fn is_empty(&self) -> bool {
    self.data.is_empty()
  }

  pub fn row(&self, r: usize) -> &[W] {
    &self.data[r * self.cols..(r + 1) * self.cols]
  }

  pub fn get(&self, r: usize, c: usize) -> f32 {
    self.data[r * self.cols + c].get()
  }

  /// The bias row.
  pub fn bias(&self) -> &[W] {
    self.row(self.rows - 1)
  }

  pub fn cells(&self) -> &[W] {
    &self.data
  }

  /// Copies the matrix into another weight representation.
  pub fn convert<V: WeightCell>(&self) -> Matrix<V> {
    Matrix {
      rows: self.rows,
      cols: self.cols,
      data: self.data.iter().map(|w| V::new(w.get())).collect(),
    }
  }
}

impl Matrix<f32> {
  pub fn row_mut(&mut self, r: usize) -> &mut [f32] {
    &mut self.data[r * self.cols..(r + 1) * self.cols]
  }

  pub fn save(&self, enc: &mut BinaryEncoder) {
    enc.add_u32(self.rows as u32);
    enc.add_u32(self.cols as u32);
    enc.add_f32s(&self.data);
  }

  pub fn load(dec: &mut BinaryDecoder) -> Result<Self, ModelError> {
    let rows = dec.next_u32()? as usize;
    let cols = dec.next_u32()? as usize;
    let count = rows
      .checked_mul(cols)
      .ok_or_else(|| ModelError::malformed("matrix size overflows"))?;
    if (rows == 0) != (cols == 0) {
      return Err(ModelError::malformed(format!("degenerate {}x{} matrix", rows, cols)));
    }
    let data = dec.next_f32s(count)?;
    Ok(Self { rows, cols, data })
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Activation {
  Tanh = 0,
  Cubic = 1,
}

impl Activation {
  pub fn name(self) -> &'static str {
    match self {
      Self::Tanh => "tanh",
      Self::Cubic => "cubic",
    }
  }

  pub fn apply(self, x: f64) -> f64 {
    match self {
      Self::Tanh => x.tanh(),
      Self::Cubic => x * x * x,
    }
  }

  /// Derivative expressed through the activated value `y = apply(x)`.
  pub fn derivative(self, y: f64) -> f64 {
    match self {
      Self::Tanh => 1.0 - y * y,
      Self::Cubic => {
        let x = y.cbrt();
        3.0 * x * x
      }
    }
  }

  fn from_u8(value: u8) -> Option<Self> {
    match value {
      0 => Some(Self::Tanh),
      1 => Some(Self::Cubic),
      _ => None,
    }
  }
}

impl FromStr for Activation {
  type Err = Err;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "tanh" => Ok(Self::Tanh),
      "cubic" => Ok(Self::Cubic),
      _ => Err(format!("unknown hidden layer type '{}'", s).into()),
    }
  }
}

impl fmt::Display for Activation {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.name())
  }
}

/// Embedding ids of one selected node, one entry per embedding table. `None`
/// marks a value missing from that table.
pub type EmbeddingIds = Vec<Option<usize>>;

/// Scratch space for a forward pass.
#[derive(Debug, Clone, Default)]
pub struct PropagationBuffers {
  pub hidden: Vec<f64>,
  pub outcomes: Vec<f64>,
}

/// Calls `f(input_row, embedding_row)` for every embedding row that is part of
/// the network input. Rows of missing nodes and missing values are skipped,
/// which is the same as feeding zeros.
pub(crate) fn for_each_input<'e, W: WeightCell>(
  embeddings: &'e [Embedding<W>],
  inputs: &[Option<&EmbeddingIds>],
  mut f: impl FnMut(usize, usize, usize, &'e [W]),
) {
  let mut index = 0;
  for &ids in inputs {
    for (e, embedding) in embeddings.iter().enumerate() {
      let dimension = embedding.dimension();
      if let Some(id) = ids.and_then(|ids| ids.get(e).copied().flatten()) {
        if let Some(row) = embedding.weight(id) {
          f(index, e, id, row);
        }
      }
      index += dimension;
    }
  }
}

/// Number of network inputs for `nodes` selected nodes.
pub fn input_size<W: WeightCell>(embeddings: &[Embedding<W>], nodes: usize) -> usize {
  nodes * embeddings.iter().map(|e| e.dimension()).sum::<usize>()
}

#[derive(Debug, Clone, PartialEq)]
pub struct NeuralNetwork<W = f32> {
  pub activation: Activation,
  /// input to output, empty when disabled
  pub direct: Matrix<W>,
  /// input to hidden and hidden to output, both empty without a hidden layer
  pub hidden: [Matrix<W>; 2],
}

impl<W: WeightCell> NeuralNetwork<W> {
  pub fn input_size(&self) -> usize {
    let m = if self.direct.is_empty() { &self.hidden[0] } else { &self.direct };
    m.rows().saturating_sub(1)
  }

  pub fn output_size(&self) -> usize {
    if self.direct.is_empty() { self.hidden[1].cols() } else { self.direct.cols() }
  }

  pub fn hidden_size(&self) -> usize {
    self.hidden[0].cols()
  }

  /// Computes the outcome distribution into `buffers.outcomes`, leaving the
  /// activated hidden layer in `buffers.hidden`.
  pub fn propagate(&self, embeddings: &[Embedding<W>], inputs: &[Option<&EmbeddingIds>], buffers: &mut PropagationBuffers) {
    let outcomes_size = self.output_size();
    let hidden_size = self.hidden_size();
    let outcomes = &mut buffers.outcomes;
    let hidden = &mut buffers.hidden;
    outcomes.clear();
    outcomes.resize(outcomes_size, 0.0);
    hidden.clear();
    hidden.resize(hidden_size, 0.0);

    if !self.direct.is_empty() {
      for_each_input(embeddings, inputs, |index, _, _, row| {
        for (d, value) in row.iter().enumerate() {
          let value = value.get() as f64;
          for (o, w) in outcomes.iter_mut().zip(self.direct.row(index + d)) {
            *o += value * w.get() as f64;
          }
        }
      });
      for (o, w) in outcomes.iter_mut().zip(self.direct.bias()) {
        *o += w.get() as f64;
      }
    }

    if hidden_size > 0 {
      for_each_input(embeddings, inputs, |index, _, _, row| {
        for (d, value) in row.iter().enumerate() {
          let value = value.get() as f64;
          for (h, w) in hidden.iter_mut().zip(self.hidden[0].row(index + d)) {
            *h += value * w.get() as f64;
          }
        }
      });
      for (h, w) in hidden.iter_mut().zip(self.hidden[0].bias()) {
        *h = self.activation.apply(*h + w.get() as f64);
      }

      for (i, h) in hidden.iter().enumerate() {
        for (o, w) in outcomes.iter_mut().zip(self.hidden[1].row(i)) {
          *o += h * w.get() as f64;
        }
      }
      for (o, w) in outcomes.iter_mut().zip(self.hidden[1].bias()) {
        *o += w.get() as f64;
      }
    }

    softmax(outcomes);
  }

  pub fn convert<V: WeightCell>(&self) -> NeuralNetwork<V> {
    NeuralNetwork {
      activation: self.activation,
      direct: self.direct.convert(),
      hidden: [self.hidden[0].convert(), self.hidden[1].convert()],
    }
  }
}

/// In-place softmax, subtracting the maximum first.
pub fn softmax(values: &mut [f64]) {
  let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
  let mut sum = 0.0;
  for v in values.iter_mut() {
    *v = (*v - max).exp();
    sum += *v;
  }
  for v in values.iter_mut() {
    *v /= sum;
  }
}

impl NeuralNetwork<f32> {
  pub fn save(&self, enc: &mut BinaryEncoder) {
    enc.add_u8(self.activation as u8);
    self.direct.save(enc);
    self.hidden[0].save(enc);
    self.hidden[1].save(enc);
  }

  pub fn load(dec: &mut BinaryDecoder) -> Result<Self, ModelError> {
    let activation = dec.next_u8()?;
    let activation = Activation::from_u8(activation)
      .ok_or_else(|| ModelError::malformed(format!("unknown activation function {}", activation)))?;
    let direct = Matrix::load(dec)?;
    let hidden = [Matrix::load(dec)?, Matrix::load(dec)?];

    if direct.is_empty() && hidden[0].is_empty() {
      return Err(ModelError::malformed("network has neither direct connections nor a hidden layer"));
    }
    if hidden[0].is_empty() != hidden[1].is_empty() {
      return Err(ModelError::malformed("incomplete hidden layer"));
    }
    if !hidden[0].is_empty() {
      if hidden[1].rows() != hidden[0].cols() + 1 {
        return Err(ModelError::malformed(format!(
          "hidden layer of size {} followed by a {}-row matrix",
          hidden[0].cols(),
          hidden[1].rows()
        )));
      }
      if !direct.is_empty() && (direct.rows() != hidden[0].rows() || direct.cols() != hidden[1].cols()) {
        return Err(ModelError::malformed("direct connections disagree with the hidden layer"));
      }
    }

    Ok(Self {
      activation,
      direct,
      hidden,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn embedding() -> Embedding {
    let words = vec![
      ("a".to_string(), vec![0.5, -0.25]),
      ("b".to_string(), vec![1.0, 2.0]),
    ];
    Embedding::create(2, 0, words, Some(vec![0.0, 0.1])).unwrap()
  }

  fn network(activation: Activation, direct: bool, bias_shift: f32) -> NeuralNetwork {
    // 2 nodes x 2 dims = 4 inputs, hidden 3, 5 outcomes
    let weight = |r: usize, c: usize| ((r * 7 + c * 3) % 11) as f32 / 10.0 - 0.5;
    let hidden1 = Matrix::from_fn(4, 5, |r, c| if r == 3 { weight(r, c) + bias_shift } else { weight(r, c) });
    NeuralNetwork {
      activation,
      direct: if direct { Matrix::from_fn(5, 5, weight) } else { Matrix::empty() },
      hidden: [Matrix::from_fn(5, 3, weight), hidden1],
    }
  }

  fn run(n: &NeuralNetwork, inputs: &[Option<&EmbeddingIds>]) -> Vec<f64> {
    let mut buffers = PropagationBuffers::default();
    n.propagate(&[embedding()], inputs, &mut buffers);
    buffers.outcomes
  }

  #[test]
  fn softmax_sums_to_one() {
    let ids = vec![Some(1)];
    for activation in [Activation::Tanh, Activation::Cubic] {
      for direct in [false, true] {
        let outcomes = run(&network(activation, direct, 0.0), &[Some(&ids), None]);
        assert_eq!(outcomes.len(), 5);
        assert!((outcomes.iter().sum::<f64>() - 1.0).abs() < 1e-6);
        assert!(outcomes.iter().all(|&p| p > 0.0));
      }
    }
  }

  #[test]
  fn softmax_is_shift_invariant() {
    let ids = vec![Some(0)];
    let plain = run(&network(Activation::Tanh, false, 0.0), &[Some(&ids), Some(&ids)]);
    let shifted = run(&network(Activation::Tanh, false, 3.5), &[Some(&ids), Some(&ids)]);
    for (a, b) in plain.iter().zip(shifted.iter()) {
      assert!((a - b).abs() < 1e-6);
    }

    let mut big = vec![1000.0, 1001.0, 999.0];
    softmax(&mut big);
    assert!(big.iter().all(|p| p.is_finite()));
    assert!((big.iter().sum::<f64>() - 1.0).abs() < 1e-12);
  }

  #[test]
  fn missing_nodes_and_values_contribute_nothing() {
    let n = network(Activation::Tanh, true, 0.0);
    let missing = vec![None];
    assert_eq!(run(&n, &[None, None]), run(&n, &[Some(&missing), None]));
  }

  #[test]
  fn cubic_derivative_uses_activated_value() {
    let x: f64 = 0.7;
    let y = Activation::Cubic.apply(x);
    assert!((Activation::Cubic.derivative(y) - 3.0 * x * x).abs() < 1e-9);
    let y = Activation::Tanh.apply(x);
    assert!((Activation::Tanh.derivative(y) - (1.0 - x.tanh().powi(2))).abs() < 1e-12);
  }

  #[test]
  fn hogwild_cells_behave_like_floats() {
    let cell = HogwildCell::new(1.5);
    cell.add(0.25);
    assert_eq!(cell.get(), 1.75);
    let m: Matrix<HogwildCell> = Matrix::from_fn(2, 2, |r, c| (r * 2 + c) as f32);
    assert_eq!(m.convert::<f32>(), Matrix::from_fn(2, 2, |r, c| (r * 2 + c) as f32));
  }

  #[test]
  fn save_and_load_validate_shapes() {
    let n = network(Activation::Cubic, true, 0.0);
    let mut enc = BinaryEncoder::new();
    n.save(&mut enc);
    let loaded = NeuralNetwork::load(&mut BinaryDecoder::new(enc.as_bytes())).unwrap();
    assert_eq!(loaded, n);
    assert_eq!(loaded.input_size(), 4);
    assert_eq!(loaded.output_size(), 5);

    let mut broken = n.clone();
    broken.hidden[1] = Matrix::from_fn(3, 5, |_, _| 0.0);
    let mut enc = BinaryEncoder::new();
    broken.save(&mut enc);
    assert!(matches!(
      NeuralNetwork::load(&mut BinaryDecoder::new(enc.as_bytes())),
      Err(ModelError::Malformed(_))
    ));

    let bytes = enc.into_bytes();
    assert!(NeuralNetwork::load(&mut BinaryDecoder::new(&bytes[..bytes.len() - 1])).is_err());
  }
}
