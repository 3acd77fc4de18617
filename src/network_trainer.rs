//! Backpropagation with batched, optionally adaptive weight updates.
//!
//! The trainer owns weights that several threads update at once through
//! [`HogwildCell`]s. Everything mutable that belongs to a single thread lives
//! in a [`TrainerWorkspace`].

use std::collections::HashMap;

use rand::Rng;

use crate::embedding::Embedding;
use crate::network::{for_each_input, EmbeddingIds, HogwildCell, Matrix, NeuralNetwork, PropagationBuffers, WeightCell};
use crate::network_parameters::{NetworkParameters, Optimizer};

/// Per-weight optimizer memory.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct OptimizerState {
  pub delta: f64,
  pub gradient: f64,
}

/// Weight change for the accumulated gradient `g`.
fn optimizer_delta(optimizer: Optimizer, learning_rate: f64, g: f64, state: &mut OptimizerState) -> f64 {
  match optimizer {
    Optimizer::Sgd => learning_rate * g,
    Optimizer::SgdMomentum { momentum } => {
      state.delta = momentum * state.delta + learning_rate * g;
      state.delta
    }
    Optimizer::AdaGrad { epsilon } => {
      state.gradient += g * g;
      learning_rate / (state.gradient + epsilon).sqrt() * g
    }
    Optimizer::AdaDelta { momentum, epsilon } => {
      state.gradient = momentum * state.gradient + (1.0 - momentum) * g * g;
      let delta = (state.delta + epsilon).sqrt() / (state.gradient + epsilon).sqrt() * g;
      state.delta = momentum * state.delta + (1.0 - momentum) * delta * delta;
      delta
    }
  }
}

/// Gradient sums for one weight matrix. Only rows written since the last
/// flush are visited when flushing.
#[derive(Debug, Clone, Default)]
struct Accumulator {
  cols: usize,
  data: Vec<f32>,
  touched: Vec<bool>,
  touched_rows: Vec<usize>,
}

impl Accumulator {
  fn new(rows: usize, cols: usize) -> Self {
    Self {
      cols,
      data: vec![0.0; rows * cols],
      touched: vec![false; rows],
      touched_rows: Vec::new(),
    }
  }

  fn row_mut(&mut self, r: usize) -> &mut [f32] {
    if !self.touched[r] {
      self.touched[r] = true;
      self.touched_rows.push(r);
    }
    &mut self.data[r * self.cols..(r + 1) * self.cols]
  }

  /// Hands every touched row to `f` and zeroes it afterwards.
  fn drain(&mut self, mut f: impl FnMut(usize, &[f32])) {
    for r in self.touched_rows.drain(..) {
      let row = &mut self.data[r * self.cols..(r + 1) * self.cols];
      f(r, row);
      row.fill(0.0);
      self.touched[r] = false;
    }
  }

  fn is_clear(&self) -> bool {
    self.touched_rows.is_empty() && self.data.iter().all(|&g| g == 0.0)
  }
}

/// Thread-private training state: forward pass buffers, error vectors,
/// gradient accumulators and optimizer memory.
#[derive(Debug, Clone, Default)]
pub struct TrainerWorkspace {
  pub buffers: PropagationBuffers,
  batch: usize,
  updates: usize,
  error_outcomes: Vec<f64>,
  error_hidden: Vec<f64>,
  direct_batch: Accumulator,
  hidden_batch: [Accumulator; 2],
  /// per embedding, error of every updatable row touched in this batch
  error_embedding: Vec<HashMap<usize, Vec<f32>>>,
  direct_state: Vec<OptimizerState>,
  hidden_state: [Vec<OptimizerState>; 2],
  /// per embedding and row, grown on demand
  embedding_state: Vec<Vec<Vec<OptimizerState>>>,
}

impl TrainerWorkspace {
  pub fn new(trainer: &NeuralNetworkTrainer, embeddings: &[Embedding<HogwildCell>]) -> Self {
    let network = &trainer.network;
    let state = |m: &Matrix<HogwildCell>| {
      if trainer.optimizer.needs_state() {
        vec![OptimizerState::default(); m.rows() * m.cols()]
      } else {
        Vec::new()
      }
    };
    Self {
      buffers: PropagationBuffers::default(),
      batch: 0,
      updates: 0,
      error_outcomes: Vec::new(),
      error_hidden: Vec::new(),
      direct_batch: Accumulator::new(network.direct.rows(), network.direct.cols()),
      hidden_batch: [
        Accumulator::new(network.hidden[0].rows(), network.hidden[0].cols()),
        Accumulator::new(network.hidden[1].rows(), network.hidden[1].cols()),
      ],
      error_embedding: vec![HashMap::new(); embeddings.len()],
      direct_state: state(&network.direct),
      hidden_state: [state(&network.hidden[0]), state(&network.hidden[1])],
      embedding_state: vec![Vec::new(); embeddings.len()],
    }
  }

  /// Number of flushes performed so far.
  pub fn updates(&self) -> usize {
    self.updates
  }

  /// Examples accumulated since the last flush.
  pub fn pending(&self) -> usize {
    self.batch
  }

  /// True when no gradient is waiting to be applied.
  pub fn is_clear(&self) -> bool {
    self.direct_batch.is_clear()
      && self.hidden_batch.iter().all(Accumulator::is_clear)
      && self.error_embedding.iter().all(HashMap::is_empty)
  }
}

/// Owns the shared weights being trained and the training schedule.
#[derive(Debug)]
pub struct NeuralNetworkTrainer {
  network: NeuralNetwork<HogwildCell>,
  iteration: usize,
  iterations: usize,
  learning_rate: f64,
  learning_rate_initial: f64,
  learning_rate_final: f64,
  optimizer: Optimizer,
  batch_size: usize,
  l1_regularization: f64,
  l2_regularization: f64,
  maxnorm_regularization: f64,
}

impl NeuralNetworkTrainer {
  /// Creates a network with weights drawn uniformly from
  /// `[-initialization_range, initialization_range]`. Every matrix has an
  /// extra bias row.
  pub fn new<R: Rng>(input_size: usize, output_size: usize, parameters: &NetworkParameters, rng: &mut R) -> Self {
    let range = parameters.initialization_range as f32;
    let mut random = |_: usize, _: usize| rng.gen_range(-range..=range);

    let direct = if parameters.direct_connections {
      Matrix::from_fn(input_size + 1, output_size, &mut random)
    } else {
      Matrix::empty()
    };
    let hidden = if parameters.hidden_layer > 0 {
      [
        Matrix::from_fn(input_size + 1, parameters.hidden_layer, &mut random),
        Matrix::from_fn(parameters.hidden_layer + 1, output_size, &mut random),
      ]
    } else {
      [Matrix::empty(), Matrix::empty()]
    };

    let network = NeuralNetwork {
      activation: parameters.hidden_layer_type,
      direct,
      hidden,
    };
    Self::from_network(&network, parameters)
  }

  /// Continues training the given weights.
  pub fn from_network(network: &NeuralNetwork, parameters: &NetworkParameters) -> Self {
    Self {
      network: network.convert(),
      iteration: 0,
      iterations: parameters.iterations,
      learning_rate: parameters.learning_rate,
      learning_rate_initial: parameters.learning_rate,
      learning_rate_final: parameters.learning_rate_final,
      optimizer: parameters.optimizer,
      batch_size: parameters.batch_size.max(1),
      l1_regularization: parameters.l1_regularization,
      l2_regularization: parameters.l2_regularization,
      maxnorm_regularization: parameters.maxnorm_regularization,
    }
  }

  pub fn iteration(&self) -> usize {
    self.iteration
  }

  pub fn learning_rate(&self) -> f64 {
    self.learning_rate
  }

  /// Starts the next iteration, interpolating the learning rate
  /// log-linearly from the initial to the final one. Returns `false` once
  /// all iterations are done.
  pub fn next_iteration(&mut self) -> bool {
    if self.iteration >= self.iterations {
      return false;
    }
    self.iteration += 1;

    self.learning_rate = if self.learning_rate_final > 0.0 && self.iterations > 1 {
      let (iteration, iterations) = (self.iteration as f64, self.iterations as f64);
      (((iterations - iteration) * self.learning_rate_initial.ln()
        + (iteration - 1.0) * self.learning_rate_final.ln())
        / (iterations - 1.0))
        .exp()
    } else {
      self.learning_rate_initial
    };
    true
  }

  pub fn propagate(&self, embeddings: &[Embedding<HogwildCell>], inputs: &[Option<&EmbeddingIds>], w: &mut TrainerWorkspace) {
    self.network.propagate(embeddings, inputs, &mut w.buffers);
  }

  /// Accumulates the gradient of `-log p(required_outcome)` for the last
  /// [`propagate`](Self::propagate) call on the same inputs. Returns whether
  /// the batch was complete and the weights were updated.
  pub fn backpropagate(
    &self,
    embeddings: &[Embedding<HogwildCell>],
    inputs: &[Option<&EmbeddingIds>],
    required_outcome: usize,
    w: &mut TrainerWorkspace,
  ) -> bool {
    let network = &self.network;
    let TrainerWorkspace {
      buffers,
      error_outcomes,
      error_hidden,
      direct_batch,
      hidden_batch,
      error_embedding,
      ..
    } = w;

    error_outcomes.clear();
    error_outcomes.extend(
      buffers
        .outcomes
        .iter()
        .enumerate()
        .map(|(k, &p)| (if k == required_outcome { 1.0 } else { 0.0 }) - p),
    );

    let mut embedding_error = |e: usize, id: usize, d: usize, dimension: usize, error: f64| {
      let row = error_embedding[e].entry(id).or_insert_with(|| vec![0.0; dimension]);
      row[d] += error as f32;
    };

    if !network.direct.is_empty() {
      for_each_input(embeddings, inputs, |index, e, id, row| {
        let updatable = embeddings[e].is_updatable(id);
        for (d, value) in row.iter().enumerate() {
          let value = value.get();
          for (g, err) in direct_batch.row_mut(index + d).iter_mut().zip(error_outcomes.iter()) {
            *g += value * *err as f32;
          }
          if updatable {
            let weights = network.direct.row(index + d);
            let error = weights.iter().zip(error_outcomes.iter()).map(|(w, err)| w.get() as f64 * err).sum();
            embedding_error(e, id, d, row.len(), error);
          }
        }
      });
      let bias = direct_batch.row_mut(network.direct.rows() - 1);
      for (g, err) in bias.iter_mut().zip(error_outcomes.iter()) {
        *g += *err as f32;
      }
    }

    if !network.hidden[0].is_empty() {
      let hidden = &buffers.hidden;
      error_hidden.clear();
      error_hidden.extend((0..hidden.len()).map(|i| {
        let error: f64 = network.hidden[1]
          .row(i)
          .iter()
          .zip(error_outcomes.iter())
          .map(|(w, err)| w.get() as f64 * err)
          .sum();
        error * network.activation.derivative(hidden[i])
      }));

      for (i, &h) in hidden.iter().enumerate() {
        for (g, err) in hidden_batch[1].row_mut(i).iter_mut().zip(error_outcomes.iter()) {
          *g += (h * err) as f32;
        }
      }
      for (g, err) in hidden_batch[1].row_mut(hidden.len()).iter_mut().zip(error_outcomes.iter()) {
        *g += *err as f32;
      }

      for_each_input(embeddings, inputs, |index, e, id, row| {
        let updatable = embeddings[e].is_updatable(id);
        for (d, value) in row.iter().enumerate() {
          let value = value.get();
          for (g, err) in hidden_batch[0].row_mut(index + d).iter_mut().zip(error_hidden.iter()) {
            *g += value * *err as f32;
          }
          if updatable {
            let weights = network.hidden[0].row(index + d);
            let error = weights.iter().zip(error_hidden.iter()).map(|(w, err)| w.get() as f64 * err).sum();
            embedding_error(e, id, d, row.len(), error);
          }
        }
      });
      let bias_row = network.hidden[0].rows() - 1;
      for (g, err) in hidden_batch[0].row_mut(bias_row).iter_mut().zip(error_hidden.iter()) {
        *g += *err as f32;
      }
    }

    w.batch += 1;
    if w.batch >= self.batch_size {
      self.flush(embeddings, w);
      true
    } else {
      false
    }
  }

  /// Applies and clears all accumulated gradients.
  pub fn flush(&self, embeddings: &[Embedding<HogwildCell>], w: &mut TrainerWorkspace) {
    let (optimizer, learning_rate, l2) = (self.optimizer, self.learning_rate, self.l2_regularization);
    let mut scratch = OptimizerState::default();
    let update = |cell: &HogwildCell, g: f32, state: &mut OptimizerState| {
      let weight = cell.get() as f64;
      let delta = optimizer_delta(optimizer, learning_rate, g as f64, state) - l2 * weight;
      cell.set((weight + delta) as f32);
    };

    let matrices = [&self.network.direct, &self.network.hidden[0], &self.network.hidden[1]];
    let TrainerWorkspace {
      direct_batch,
      hidden_batch,
      direct_state,
      hidden_state,
      ..
    } = w;
    let [hidden_batch_0, hidden_batch_1] = hidden_batch;
    let [hidden_state_0, hidden_state_1] = hidden_state;
    let batches = [
      (direct_batch, direct_state),
      (hidden_batch_0, hidden_state_0),
      (hidden_batch_1, hidden_state_1),
    ];
    for (matrix, (batch, states)) in matrices.into_iter().zip(batches) {
      let cols = matrix.cols();
      batch.drain(|r, gradients| {
        for (c, (cell, &g)) in matrix.row(r).iter().zip(gradients).enumerate() {
          let state = states.get_mut(r * cols + c).unwrap_or(&mut scratch);
          update(cell, g, state);
        }
      });
    }

    for (e, errors) in w.error_embedding.iter_mut().enumerate() {
      let states = &mut w.embedding_state[e];
      for (id, gradients) in errors.drain() {
        let Some(row) = embeddings[e].weight(id) else {
          continue;
        };
        if optimizer.needs_state() {
          if states.len() <= id {
            states.resize_with(id + 1, Vec::new);
          }
          let row_states = &mut states[id];
          if row_states.is_empty() {
            row_states.resize(row.len(), OptimizerState::default());
          }
          for ((cell, &g), state) in row.iter().zip(&gradients).zip(row_states.iter_mut()) {
            update(cell, g, state);
          }
        } else {
          for (cell, &g) in row.iter().zip(&gradients) {
            update(cell, g, &mut scratch);
          }
        }
      }
    }

    w.batch = 0;
    w.updates += 1;
  }

  /// Sentence-level regularisation: L1 shrinkage of every network weight,
  /// then max-norm rescaling of every unit's incoming weights.
  pub fn finalize_sentence(&self) {
    let matrices = [&self.network.direct, &self.network.hidden[0], &self.network.hidden[1]];

    if self.l1_regularization > 0.0 {
      let l1 = self.l1_regularization as f32;
      for matrix in matrices {
        for cell in matrix.cells() {
          let weight = cell.get();
          cell.set(weight.signum() * (weight.abs() - l1).max(0.0));
        }
      }
    }

    if self.maxnorm_regularization > 0.0 {
      for matrix in matrices {
        if matrix.is_empty() {
          continue;
        }
        let inputs = matrix.rows() - 1;
        for c in 0..matrix.cols() {
          let norm = (0..inputs).map(|r| (matrix.get(r, c) as f64).powi(2)).sum::<f64>().sqrt();
          if norm > self.maxnorm_regularization {
            let scale = (self.maxnorm_regularization / norm) as f32;
            for r in 0..inputs {
              let cell = &matrix.row(r)[c];
              cell.set(cell.get() * scale);
            }
          }
        }
      }
    }
  }

  /// Copies the current weights into an inference network.
  pub fn snapshot(&self) -> NeuralNetwork {
    self.network.convert()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::network::Activation;
  use rand::SeedableRng;
  use rand_chacha::ChaCha8Rng;

  fn embeddings(update_all: bool) -> Vec<Embedding<HogwildCell>> {
    let words = vec![
      ("a".to_string(), vec![0.5, -0.5]),
      ("b".to_string(), vec![0.25, 1.0]),
    ];
    let updatable = if update_all { 0 } else { 2 };
    vec![Embedding::create(2, updatable, words, Some(vec![0.1, 0.1])).unwrap().convert()]
  }

  fn parameters(batch_size: usize) -> NetworkParameters {
    NetworkParameters {
      hidden_layer: 4,
      direct_connections: true,
      batch_size,
      learning_rate: 0.1,
      learning_rate_final: 0.0,
      ..Default::default()
    }
  }

  fn trainer(parameters: &NetworkParameters) -> NeuralNetworkTrainer {
    let mut rng = ChaCha8Rng::seed_from_u64(42);
    let mut trainer = NeuralNetworkTrainer::new(4, 3, parameters, &mut rng);
    assert!(trainer.next_iteration());
    trainer
  }

  #[test]
  fn initial_weights_respect_range_and_shapes() {
    let p = parameters(1);
    let t = trainer(&p);
    let n = t.snapshot();
    assert_eq!(n.input_size(), 4);
    assert_eq!(n.output_size(), 3);
    assert_eq!(n.hidden[0].rows(), 5);
    assert_eq!(n.hidden[1].rows(), 5);
    let range = p.initialization_range as f32;
    assert!(n.hidden[0].cells().iter().all(|w| w.abs() <= range));
  }

  #[test]
  fn batch_of_one_updates_after_every_example() {
    let e = embeddings(true);
    let t = trainer(&parameters(1));
    let mut w = TrainerWorkspace::new(&t, &e);
    let ids = vec![Some(0)];
    let inputs = [Some(&ids), None];

    for step in 1..=3 {
      let before = t.snapshot();
      t.propagate(&e, &inputs, &mut w);
      assert!(t.backpropagate(&e, &inputs, 1, &mut w));
      assert_ne!(t.snapshot(), before);
      assert_eq!(w.updates(), step);
      assert!(w.is_clear());
    }
  }

  #[test]
  fn batch_of_n_updates_once_per_n_examples() {
    let e = embeddings(true);
    let t = trainer(&parameters(3));
    let mut w = TrainerWorkspace::new(&t, &e);
    let ids = vec![Some(1)];
    let inputs = [Some(&ids), Some(&ids)];

    let before = t.snapshot();
    for _ in 0..2 {
      t.propagate(&e, &inputs, &mut w);
      assert!(!t.backpropagate(&e, &inputs, 0, &mut w));
      assert!(!w.is_clear());
    }
    assert_eq!(t.snapshot(), before);
    assert_eq!(w.updates(), 0);
    assert_eq!(w.pending(), 2);

    t.propagate(&e, &inputs, &mut w);
    assert!(t.backpropagate(&e, &inputs, 0, &mut w));
    assert_eq!(w.updates(), 1);
    assert_eq!(w.pending(), 0);
    assert!(w.is_clear());
    assert_ne!(t.snapshot(), before);
  }

  #[test]
  fn training_increases_gold_probability() {
    for optimizer in ["sgd", "sgd_momentum=0.5", "adagrad", "adadelta"] {
      let e = embeddings(true);
      let mut p = parameters(1);
      p.optimizer = optimizer.parse().unwrap();
      let t = trainer(&p);
      let mut w = TrainerWorkspace::new(&t, &e);
      let ids = vec![Some(0)];
      let inputs = [Some(&ids), Some(&ids)];

      t.propagate(&e, &inputs, &mut w);
      let initial = w.buffers.outcomes[2];
      for _ in 0..20 {
        t.propagate(&e, &inputs, &mut w);
        t.backpropagate(&e, &inputs, 2, &mut w);
      }
      t.propagate(&e, &inputs, &mut w);
      assert!(w.buffers.outcomes[2] > initial, "{} did not learn", optimizer);
    }
  }

  #[test]
  fn frozen_embedding_rows_stay_fixed() {
    let e = embeddings(false);
    let t = trainer(&parameters(1));
    let mut w = TrainerWorkspace::new(&t, &e);
    let frozen = vec![Some(0)];
    let unknown = vec![Some(2)];
    let inputs = [Some(&frozen), Some(&unknown)];

    let row = |id: usize| e[0].weight(id).unwrap().iter().map(|c| c.get()).collect::<Vec<_>>();
    let (frozen_before, unknown_before) = (row(0), row(2));
    t.propagate(&e, &inputs, &mut w);
    t.backpropagate(&e, &inputs, 0, &mut w);
    assert_eq!(row(0), frozen_before);
    assert_ne!(row(2), unknown_before);
  }

  #[test]
  fn learning_rate_decays_log_linearly() {
    let p = NetworkParameters {
      iterations: 3,
      learning_rate: 0.1,
      learning_rate_final: 0.001,
      ..parameters(1)
    };
    let mut rng = ChaCha8Rng::seed_from_u64(1);
    let mut t = NeuralNetworkTrainer::new(2, 2, &p, &mut rng);
    let mut rates = Vec::new();
    while t.next_iteration() {
      rates.push(t.learning_rate());
    }
    assert_eq!(rates.len(), 3);
    assert!((rates[0] - 0.1).abs() < 1e-12);
    assert!((rates[1] - 0.01).abs() < 1e-12);
    assert!((rates[2] - 0.001).abs() < 1e-12);
    assert_eq!(t.iteration(), 3);
  }

  #[test]
  fn l1_shrinks_towards_zero_and_maxnorm_caps_columns() {
    let network = NeuralNetwork {
      activation: Activation::Tanh,
      direct: Matrix::from_fn(3, 2, |r, c| match (r, c) {
        (0, 0) => 3.0,
        (1, 0) => -4.0,
        (0, 1) => 0.05,
        (1, 1) => -0.05,
        _ => 7.0,
      }),
      hidden: [Matrix::empty(), Matrix::empty()],
    };

    let p = NetworkParameters {
      l1_regularization: 0.1,
      ..parameters(1)
    };
    let t = NeuralNetworkTrainer::from_network(&network, &p);
    t.finalize_sentence();
    let n = t.snapshot();
    assert!((n.direct.get(0, 0) - 2.9).abs() < 1e-6);
    assert!((n.direct.get(1, 0) + 3.9).abs() < 1e-6);
    assert_eq!(n.direct.get(0, 1), 0.0);
    assert_eq!(n.direct.get(1, 1), 0.0);

    let p = NetworkParameters {
      maxnorm_regularization: 1.0,
      ..parameters(1)
    };
    let t = NeuralNetworkTrainer::from_network(&network, &p);
    t.finalize_sentence();
    let n = t.snapshot();
    // column 0 has norm 5 and is scaled to 1, the bias row is left alone
    assert!((n.direct.get(0, 0) - 0.6).abs() < 1e-6);
    assert!((n.direct.get(1, 0) + 0.8).abs() < 1e-6);
    assert_eq!(n.direct.get(2, 0), 7.0);
    assert_eq!(n.direct.get(0, 1), 0.05);
  }
}
