//! Training a neural network parser from gold trees.
//!
//! Training threads share one set of weights and update them without locks
//! through [`HogwildCell`]s; races between concurrent updates are accepted
//! and results are only reproducible with a single thread.

use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;
use tracing::{debug, info, warn};

use crate::accuracy::{self, Evaluation};
use crate::configuration::Configuration;
use crate::embedding::{Embedding, Word2Vec};
use crate::network::{self, EmbeddingIds, HogwildCell};
use crate::network_parameters::NetworkParameters;
use crate::network_trainer::{NeuralNetworkTrainer, TrainerWorkspace};
use crate::node_extractor::NodeExtractor;
use crate::oracle::TransitionOracle;
use crate::parser::{node_embedding_ids, selected_inputs, ParserNn};
use crate::transition_system::{TransitionSystem, TransitionSystemKind};
use crate::tree::Tree;
use crate::utils::{description_lines, parse_number};
use crate::value_extractor::ValueExtractor;
use crate::Err;

/// Everything needed to train a parser besides the data.
#[derive(Debug, Clone)]
pub struct TrainerConfig {
  pub transition_system: String,
  pub transition_oracle: String,
  /// one `<value> <dimension> <max_size> <update_weights> [<word2vec file>]`
  /// line per value extractor
  pub embeddings: String,
  /// node selectors, see [`NodeExtractor`]
  pub nodes: String,
  pub parameters: NetworkParameters,
  pub threads: usize,
  pub seed: u64,
}

impl Default for TrainerConfig {
  fn default() -> Self {
    Self {
      transition_system: "projective".to_string(),
      transition_oracle: "dynamic".to_string(),
      embeddings: String::new(),
      nodes: String::new(),
      parameters: NetworkParameters::default(),
      threads: 1,
      seed: 42,
    }
  }
}

/// One parsed line of the embeddings description.
#[derive(Debug, Clone, PartialEq)]
struct EmbeddingSpec {
  value: ValueExtractor,
  dimension: usize,
  /// 0 for no limit
  max_size: usize,
  update_weights: bool,
  file: Option<String>,
}

fn parse_embedding_specs(description: &str) -> Result<Vec<EmbeddingSpec>, Err> {
  regex_static!(
    LINE,
    r"^(\S+)\s+([0-9]+)\s+(-?[0-9]+)\s+([01])(?:\s+(\S+))?\s*$"
  );

  let mut specs = Vec::new();
  for line in description_lines(description) {
    let caps = LINE.captures(line).ok_or_else(|| {
      format!(
        "cannot parse embedding description line '{}', expected '<value> <dimension> <max_size> <update_weights> [<file>]'",
        line
      )
    })?;
    let dimension = parse_number(&caps[2], "embedding dimension")?;
    if dimension == 0 {
      return Err(format!("embedding dimension must be positive on line '{}'", line).into());
    }
    let max_size: i64 = parse_number(&caps[3], "maximum embedding size")?;
    specs.push(EmbeddingSpec {
      value: caps[1].parse()?,
      dimension,
      max_size: max_size.max(0) as usize,
      update_weights: &caps[4] == "1",
      file: caps.get(5).map(|m| m.as_str().to_string()),
    });
  }
  if specs.is_empty() {
    return Err("the embeddings description names no values".into());
  }
  Ok(specs)
}

fn random_row<R: Rng>(dimension: usize, rng: &mut R) -> Vec<f32> {
  (0..dimension).map(|_| rng.sample::<f32, _>(StandardNormal)).collect()
}

/// Reads word vectors from `path`, projecting them down to `dimension`.
fn read_word_vectors<R: Rng>(spec: &EmbeddingSpec, path: &str, rng: &mut R) -> Result<Vec<(String, Vec<f32>)>, Err> {
  let file = File::open(path).map_err(|e| format!("cannot load '{}' embedding from file '{}': {}", spec.value, path, e))?;
  let vectors = Word2Vec::read(BufReader::new(file))?;
  if vectors.dimension < spec.dimension {
    return Err(format!(
      "the embedding file '{}' has dimension {}, lower than the required {}",
      path, vectors.dimension, spec.dimension
    )
    .into());
  }

  let mut words = vectors.words;
  if spec.max_size > 0 {
    words.truncate(spec.max_size);
  }
  if vectors.dimension == spec.dimension {
    return Ok(words);
  }

  info!(
    value = %spec.value,
    from = vectors.dimension,
    to = spec.dimension,
    "reducing embedding dimension by random projection"
  );
  let projection = (0..spec.dimension)
    .map(|_| {
      let row = (0..vectors.dimension).map(|_| rng.gen_range(0.0..1.0)).collect::<Vec<f64>>();
      let sum = row.iter().sum::<f64>().max(f64::MIN_POSITIVE);
      row.into_iter().map(|w| w / sum).collect::<Vec<_>>()
    })
    .collect::<Vec<_>>();
  Ok(
    words
      .into_iter()
      .map(|(word, weights)| {
        let projected = projection
          .iter()
          .map(|row| row.iter().zip(&weights).map(|(p, &w)| p * w as f64).sum::<f64>() as f32)
          .collect();
        (word, projected)
      })
      .collect(),
  )
}

/// The `max_size` most frequent values in `train`, ties broken alphabetically.
fn frequent_values(value: ValueExtractor, max_size: usize, train: &[Tree]) -> Vec<String> {
  let mut counts: HashMap<&str, usize> = HashMap::new();
  for tree in train {
    for node in tree.nodes.iter().skip(1) {
      *counts.entry(value.extract(Some(node))).or_default() += 1;
    }
  }
  let mut sorted = counts.into_iter().collect::<Vec<_>>();
  sorted.sort_by(|(a, a_count), (b, b_count)| b_count.cmp(a_count).then_with(|| a.cmp(b)));
  if max_size > 0 {
    sorted.truncate(max_size);
  }
  sorted.into_iter().map(|(word, _)| word.to_string()).collect()
}

fn create_embedding<R: Rng>(spec: &EmbeddingSpec, train: &[Tree], rng: &mut R) -> Result<Embedding, Err> {
  let words = match &spec.file {
    Some(path) => read_word_vectors(spec, path, rng)?,
    None => frequent_values(spec.value, spec.max_size, train)
      .into_iter()
      .map(|word| {
        let row = random_row(spec.dimension, rng);
        (word, row)
      })
      .collect(),
  };
  let updatable_index = if spec.update_weights { 0 } else { words.len() };
  let unknown = random_row(spec.dimension, rng);
  let embedding = Embedding::create(spec.dimension, updatable_index, words, Some(unknown))?;

  let (mut total, mut covered) = (0usize, 0usize);
  for tree in train {
    for node in tree.nodes.iter().skip(1) {
      total += 1;
      let id = embedding.lookup_word(spec.value.extract(Some(node)));
      covered += (id.is_some() && id != embedding.unknown_index()) as usize;
    }
  }
  info!(
    value = %spec.value,
    words = embedding.words().len(),
    "initialized embedding with {:.2}% coverage",
    100.0 * covered as f64 / total.max(1) as f64
  );
  Ok(embedding)
}

/// Checks that every training node is attached and labeled, and collects
/// the labels in order of first appearance.
fn collect_labels(train: &[Tree]) -> Result<Vec<String>, Err> {
  let mut labels = Vec::new();
  let mut seen = std::collections::HashSet::new();
  for tree in train {
    for node in tree.nodes.iter().skip(1) {
      if node.head.is_none() {
        return Err(format!("the node '{}' with id {} has no head set", node.form, node.id).into());
      }
      if node.deprel.is_empty() {
        return Err(format!("the node '{}' with id {} has no deprel set", node.form, node.id).into());
      }
      if seen.insert(node.deprel.as_str()) {
        labels.push(node.deprel.clone());
      }
    }
  }
  Ok(labels)
}

/// Per-thread scratch space for training on one sentence at a time.
#[derive(Debug)]
struct SentenceWorkspace {
  tree: Tree,
  conf: Configuration,
  selected: Vec<Option<usize>>,
  embedding_ids: Vec<EmbeddingIds>,
  trainer: TrainerWorkspace,
}

/// Log-probability of the gold transitions and number of steps taken.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct SentenceStats {
  logprob: f64,
  steps: usize,
}

/// The read-only state shared by all training threads.
struct Training<'a> {
  system: &'a TransitionSystem,
  oracle: &'a TransitionOracle,
  nodes: &'a NodeExtractor,
  values: &'a [ValueExtractor],
  embeddings: &'a [Embedding<HogwildCell>],
  trainer: &'a NeuralNetworkTrainer,
}

impl Training<'_> {
  fn workspace(&self) -> SentenceWorkspace {
    SentenceWorkspace {
      tree: Tree::new(),
      conf: Configuration::default(),
      selected: Vec::new(),
      embedding_ids: Vec::new(),
      trainer: TrainerWorkspace::new(self.trainer, self.embeddings),
    }
  }

  /// Follows the oracle through `gold`, backpropagating after every step.
  fn train_sentence(&self, gold: &Tree, iteration: usize, ws: &mut SentenceWorkspace) -> SentenceStats {
    let SentenceWorkspace {
      tree,
      conf,
      selected,
      embedding_ids,
      trainer: trainer_ws,
    } = ws;
    tree.clone_from(gold);
    tree.unlink_all_nodes();
    conf.init(tree);
    embedding_ids.resize_with(tree.len(), Vec::new);
    embedding_ids.truncate(tree.len());
    for (node, ids) in tree.nodes.iter().zip(embedding_ids.iter_mut()) {
      node_embedding_ids(self.values, self.embeddings, node, ids);
    }

    let tree_oracle = self.oracle.create_tree_oracle(gold);
    let mut stats = SentenceStats::default();
    while !conf.is_final() {
      self.nodes.extract(conf, tree, selected);
      let inputs = selected_inputs(selected, embedding_ids);
      self.trainer.propagate(self.embeddings, &inputs, trainer_ws);

      let outcomes = &trainer_ws.buffers.outcomes;
      let network_outcome = self
        .system
        .best_applicable(conf, outcomes)
        .unwrap_or(self.system.kind().shift());
      let prediction = tree_oracle.predict(conf, tree, network_outcome, iteration);
      stats.logprob += outcomes[prediction.best].ln();
      self.trainer.backpropagate(self.embeddings, &inputs, prediction.best, trainer_ws);

      if !self.system.applicable(conf, prediction.to_follow) {
        warn!(
          transition = prediction.to_follow,
          step = stats.steps,
          "oracle proposed an inapplicable transition, abandoning sentence"
        );
        break;
      }
      if let Some(child) = self.system.perform(conf, tree, prediction.to_follow) {
        node_embedding_ids(self.values, self.embeddings, &tree.nodes[child], &mut embedding_ids[child]);
      }
      stats.steps += 1;
    }

    self.trainer.finalize_sentence();
    stats
  }
}

/// Adds `value` to an `f64` stored as bits in `target`.
fn atomic_add_f64(target: &AtomicU64, value: f64) {
  let mut current = target.load(Ordering::Relaxed);
  loop {
    let updated = (f64::from_bits(current) + value).to_bits();
    match target.compare_exchange_weak(current, updated, Ordering::Relaxed, Ordering::Relaxed) {
      Ok(_) => return,
      Err(actual) => current = actual,
    }
  }
}

/// Trains a parser on `train`, evaluating on `heldout` after every iteration.
pub fn train(config: &TrainerConfig, train: &[Tree], heldout: &[Tree]) -> Result<ParserNn, Err> {
  if train.is_empty() {
    return Err("no training data was given".into());
  }
  if config.threads == 0 {
    return Err("the number of training threads must be positive".into());
  }
  let parameters = &config.parameters;
  parameters.validate()?;

  let labels = collect_labels(train)?;
  let system = TransitionSystem::create(&config.transition_system, labels)?;
  let oracle = system.oracle(&config.transition_oracle).ok_or_else(|| {
    format!(
      "cannot create transition oracle '{}' for transition system '{}'",
      config.transition_oracle, config.transition_system
    )
  })?;
  if system.kind() == TransitionSystemKind::Projective {
    let non_projective = train.iter().filter(|t| !t.is_projective()).count();
    if non_projective > 0 {
      warn!(
        trees = non_projective,
        "training data contains non-projective trees the projective system cannot reproduce"
      );
    }
  }
  let nodes = NodeExtractor::create(&config.nodes)?;
  if nodes.node_count() == 0 {
    return Err("the node selector description names no nodes".into());
  }

  let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
  let specs = parse_embedding_specs(&config.embeddings)?;
  let values = specs.iter().map(|spec| spec.value).collect::<Vec<_>>();
  let mut embeddings = Vec::with_capacity(specs.len());
  for spec in &specs {
    embeddings.push(create_embedding(spec, train, &mut rng)?);
  }

  let input_size = network::input_size(&embeddings, nodes.node_count());
  let mut trainer = NeuralNetworkTrainer::new(input_size, system.transition_count(), parameters, &mut rng);
  let shared_embeddings = embeddings.iter().map(|e| e.convert()).collect::<Vec<Embedding<HogwildCell>>>();
  info!(
    sentences = train.len(),
    labels = system.labels().len(),
    transitions = system.transition_count(),
    inputs = input_size,
    threads = config.threads,
    "starting training"
  );

  let snapshot = |trainer: &NeuralNetworkTrainer| -> Result<ParserNn, Err> {
    Ok(ParserNn::new(
      system.clone(),
      nodes.clone(),
      values.clone(),
      shared_embeddings.iter().map(|e| e.convert()).collect(),
      trainer.snapshot(),
    )?)
  };

  let mut permutation = (0..train.len()).collect::<Vec<_>>();
  let mut best: Option<(usize, Evaluation, ParserNn)> = None;
  while trainer.next_iteration() {
    let iteration = trainer.iteration();
    permutation.shuffle(&mut rng);

    let cursor = AtomicUsize::new(0);
    let logprob = AtomicU64::new(0f64.to_bits());
    let steps = AtomicUsize::new(0);
    let training = Training {
      system: &system,
      oracle: &oracle,
      nodes: &nodes,
      values: &values,
      embeddings: &shared_embeddings,
      trainer: &trainer,
    };
    std::thread::scope(|s| {
      for _ in 0..config.threads {
        s.spawn(|| {
          let mut ws = training.workspace();
          loop {
            let next = cursor.fetch_add(1, Ordering::Relaxed);
            let Some(&sentence) = permutation.get(next) else {
              break;
            };
            let stats = training.train_sentence(&train[sentence], iteration, &mut ws);
            atomic_add_f64(&logprob, stats.logprob);
            steps.fetch_add(stats.steps, Ordering::Relaxed);
          }
          if ws.trainer.pending() > 0 {
            training.trainer.flush(training.embeddings, &mut ws.trainer);
          }
          debug!(updates = ws.trainer.updates(), "training thread finished");
        });
      }
    });

    let steps = steps.into_inner();
    let logprob = f64::from_bits(logprob.into_inner());
    info!(
      iteration,
      learning_rate = trainer.learning_rate(),
      "iteration {} done, mean log-probability {:.4}",
      iteration,
      logprob / steps.max(1) as f64
    );

    if heldout.is_empty() {
      continue;
    }
    let parser = snapshot(&trainer)?;
    let evaluation = accuracy::evaluate(heldout, |t| parser.parse(t));
    info!(
      iteration,
      uas = evaluation.all.uas(),
      las = evaluation.all.las(),
      "heldout {}",
      evaluation
    );
    if parameters.early_stopping && best.as_ref().is_none_or(|(_, e, _)| evaluation.all.las() > e.all.las()) {
      best = Some((iteration, evaluation, parser));
    }
  }

  if let Some((iteration, evaluation, parser)) = best {
    info!(iteration, las = evaluation.all.las(), "early stopping selected the weights of iteration {}", iteration);
    return Ok(parser);
  }
  snapshot(&trainer)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::conllu::parse_trees;
  use crate::network_parameters::Optimizer;

  const TRAIN: &str = "\
1\tDogs\tdog\tNOUN\tNNS\t_\t2\tnsubj\t_\t_
2\tbark\tbark\tVERB\tVBP\t_\t0\troot\t_\t_
3\tloudly\tloudly\tADV\tRB\t_\t2\tadvmod\t_\t_

1\tCats\tcat\tNOUN\tNNS\t_\t2\tnsubj\t_\t_
2\tsleep\tsleep\tVERB\tVBP\t_\t0\troot\t_\t_

1\tThe\tthe\tDET\tDT\t_\t2\tdet\t_\t_
2\tdog\tdog\tNOUN\tNN\t_\t3\tnsubj\t_\t_
3\tsleeps\tsleep\tVERB\tVBZ\t_\t0\troot\t_\t_
4\tquietly\tquietly\tADV\tRB\t_\t3\tadvmod\t_\t_

";

  const NODES: &str = "\
# stack and buffer fronts
stack 0
stack 1
stack 2
buffer 0
buffer 1
stack 0,child 0
stack 1,child -1
";

  fn config(system: &str, oracle: &str) -> TrainerConfig {
    let mut parameters = NetworkParameters {
      iterations: 8,
      hidden_layer: 16,
      learning_rate: 0.05,
      learning_rate_final: 0.005,
      ..NetworkParameters::default()
    };
    parameters.optimizer = Optimizer::SgdMomentum { momentum: 0.9 };
    TrainerConfig {
      transition_system: system.to_string(),
      transition_oracle: oracle.to_string(),
      embeddings: "form 8 0 1\nuniversal_tag 4 0 1\ndeprel 4 0 1\n".to_string(),
      nodes: NODES.to_string(),
      parameters,
      ..TrainerConfig::default()
    }
  }

  #[test]
  fn parses_embedding_descriptions() {
    let specs = parse_embedding_specs("# comment\nform 50 -1 0 vectors.txt\n\nlemma 20 1000 1\n").unwrap();
    assert_eq!(
      specs,
      vec![
        EmbeddingSpec {
          value: ValueExtractor::Form,
          dimension: 50,
          max_size: 0,
          update_weights: false,
          file: Some("vectors.txt".to_string()),
        },
        EmbeddingSpec {
          value: ValueExtractor::Lemma,
          dimension: 20,
          max_size: 1000,
          update_weights: true,
          file: None,
        },
      ]
    );
    assert!(parse_embedding_specs("form 50 0").is_err());
    assert!(parse_embedding_specs("shape 50 0 1").is_err());
    assert!(parse_embedding_specs("form 0 0 1").is_err());
    assert!(parse_embedding_specs("# nothing").is_err());
  }

  #[test]
  fn frequent_values_are_sorted_by_count_then_alphabetically() {
    let train = parse_trees(TRAIN).unwrap();
    assert_eq!(
      frequent_values(ValueExtractor::UniversalTag, 0, &train),
      vec!["NOUN", "VERB", "ADV", "DET"]
    );
    assert_eq!(frequent_values(ValueExtractor::Deprel, 2, &train), vec!["nsubj", "root"]);
  }

  #[test]
  fn random_rows_are_standard_normal() {
    let mut rng = ChaCha8Rng::seed_from_u64(7);
    let row = random_row(20_000, &mut rng);
    let mean = row.iter().map(|&w| w as f64).sum::<f64>() / row.len() as f64;
    let variance = row.iter().map(|&w| (w as f64 - mean).powi(2)).sum::<f64>() / row.len() as f64;
    assert!(mean.abs() < 0.05, "mean {}", mean);
    assert!((variance - 1.0).abs() < 0.1, "variance {}", variance);
    assert!(row.iter().all(|w| w.is_finite()));
  }

  #[test]
  fn frozen_embeddings_only_train_the_unknown_row() {
    let train = parse_trees(TRAIN).unwrap();
    let mut rng = ChaCha8Rng::seed_from_u64(1);
    let spec = parse_embedding_specs("lemma 3 2 0").unwrap().remove(0);
    let embedding = create_embedding(&spec, &train, &mut rng).unwrap();
    assert_eq!(embedding.words().len(), 2);
    assert_eq!(embedding.unknown_index(), Some(2));
    assert!(!embedding.is_updatable(0));
    assert!(embedding.is_updatable(2));
  }

  #[test]
  fn word_vectors_are_projected_to_the_requested_dimension() {
    let path = std::env::temp_dir().join(format!("nndep-vectors-{}.txt", std::process::id()));
    std::fs::write(&path, "3 4\ndogs 1 1 1 1\nbark 2 2 2 2\nloudly 0 0 0 0\n").unwrap();
    let path = path.to_string_lossy().to_string();

    let mut rng = ChaCha8Rng::seed_from_u64(1);
    let spec = parse_embedding_specs(&format!("form 2 2 1 {}", path)).unwrap().remove(0);
    let words = read_word_vectors(&spec, &path, &mut rng).unwrap();
    assert_eq!(words.len(), 2);
    // rows of the projection sum to one
    for w in &words[0].1 {
      assert!((w - 1.0).abs() < 1e-5);
    }
    for w in &words[1].1 {
      assert!((w - 2.0).abs() < 1e-5);
    }

    let spec = parse_embedding_specs(&format!("form 8 0 1 {}", path)).unwrap().remove(0);
    assert!(read_word_vectors(&spec, &path, &mut rng).is_err());
    std::fs::remove_file(&path).unwrap();
  }

  #[test]
  fn rejects_incomplete_training_data() {
    let mut train = parse_trees(TRAIN).unwrap();
    train[1].nodes[2].deprel.clear();
    let err = super::train(&config("projective", "static"), &train, &[]).unwrap_err();
    assert!(err.to_string().contains("no deprel"));

    train[1].nodes[2].head = None;
    let err = super::train(&config("projective", "static"), &train, &[]).unwrap_err();
    assert!(err.to_string().contains("no head"));
  }

  #[test]
  fn rejects_bad_configuration() {
    let train = parse_trees(TRAIN).unwrap();
    assert!(super::train(&config("arc-eager", "static"), &train, &[]).is_err());
    assert!(super::train(&config("projective", "static_eager"), &train, &[]).is_err());
    assert!(super::train(&config("projective", "static"), &[], &[]).is_err());
    let mut bad_threads = config("projective", "static");
    bad_threads.threads = 0;
    assert!(super::train(&bad_threads, &train, &[]).is_err());
  }

  #[test]
  fn learns_the_training_data() {
    let train = parse_trees(TRAIN).unwrap();
    for (system, oracle) in [("projective", "static"), ("projective", "dynamic"), ("swap", "static_eager"), ("link2", "static")] {
      let mut config = config(system, oracle);
      config.parameters.iterations = 40;
      let parser = super::train(&config, &train, &train).unwrap();
      let evaluation = accuracy::evaluate(&train, |t| parser.parse(t));
      assert!(
        evaluation.all.uas() > 75.0,
        "{}/{} reached only {}",
        system,
        oracle,
        evaluation
      );
      assert_eq!(parser.labels(), ["nsubj", "root", "advmod", "det"]);
    }
  }

  #[test]
  fn single_thread_training_is_reproducible() {
    let train = parse_trees(TRAIN).unwrap();
    let config = config("projective", "static");
    let a = super::train(&config, &train, &[]).unwrap();
    let b = super::train(&config, &train, &[]).unwrap();
    assert_eq!(a.network(), b.network());
    assert_eq!(a.embeddings(), b.embeddings());
  }

  #[test]
  fn trains_with_several_threads_and_early_stopping() {
    let train = parse_trees(TRAIN).unwrap();
    let mut config = config("projective", "dynamic");
    config.threads = 3;
    config.parameters.batch_size = 2;
    config.parameters.early_stopping = true;
    let parser = super::train(&config, &train, &train[..1]).unwrap();
    let mut tree = Tree::from_forms(&["Dogs", "bark"]);
    parser.parse(&mut tree);
    assert!(tree.nodes.iter().skip(1).all(|n| n.head.is_some()));
  }
}
