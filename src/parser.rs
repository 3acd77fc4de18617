//! Loading, saving and running trained parsers.

use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::Path;

use tracing::{debug, info};

use crate::binary::{BinaryDecoder, BinaryEncoder, ModelError};
use crate::compressor;
use crate::configuration::Configuration;
use crate::embedding::Embedding;
use crate::network::{self, EmbeddingIds, NeuralNetwork, PropagationBuffers, WeightCell};
use crate::node_extractor::NodeExtractor;
use crate::pool::WorkspacePool;
use crate::transition_system::TransitionSystem;
use crate::tree::{Node, Tree};
use crate::value_extractor::ValueExtractor;

/// Identifier of the neural network parser in the model format.
pub const NN_IDENTIFIER: &str = "nn";
/// Current version of the neural network model format.
pub const NN_VERSION: u8 = 1;

/// Looks up the embedding row of every value of `node`.
pub(crate) fn node_embedding_ids<W: WeightCell>(
  values: &[ValueExtractor],
  embeddings: &[Embedding<W>],
  node: &Node,
  ids: &mut EmbeddingIds,
) {
  ids.clear();
  ids.extend(
    values
      .iter()
      .zip(embeddings)
      .map(|(value, embedding)| embedding.lookup_word(value.extract(Some(node)))),
  );
}

/// Network inputs for the selected nodes; missing nodes are `None`.
pub(crate) fn selected_inputs<'a>(selected: &[Option<usize>], ids: &'a [EmbeddingIds]) -> Vec<Option<&'a EmbeddingIds>> {
  selected.iter().map(|node| node.and_then(|n| ids.get(n))).collect()
}

#[derive(Debug, Default)]
struct Workspace {
  conf: Configuration,
  selected: Vec<Option<usize>>,
  embedding_ids: Vec<EmbeddingIds>,
  buffers: PropagationBuffers,
}

#[derive(Debug, Clone)]
struct Hypothesis {
  tree: Tree,
  conf: Configuration,
  embedding_ids: Vec<EmbeddingIds>,
  logprob: f64,
}

/// The neural network transition parser.
#[derive(Debug)]
pub struct ParserNn {
  system: TransitionSystem,
  nodes: NodeExtractor,
  values: Vec<ValueExtractor>,
  embeddings: Vec<Embedding>,
  network: NeuralNetwork,
  workspaces: WorkspacePool<Workspace>,
}

impl ParserNn {
  /// Assembles a parser, checking that the network fits the extractors and
  /// the transition system.
  pub fn new(
    system: TransitionSystem,
    nodes: NodeExtractor,
    values: Vec<ValueExtractor>,
    embeddings: Vec<Embedding>,
    network: NeuralNetwork,
  ) -> Result<Self, ModelError> {
    if values.len() != embeddings.len() {
      return Err(ModelError::malformed(format!(
        "{} value extractors but {} embeddings",
        values.len(),
        embeddings.len()
      )));
    }
    let input_size = network::input_size(&embeddings, nodes.node_count());
    if network.input_size() != input_size {
      return Err(ModelError::malformed(format!(
        "network expects {} inputs, the extractors produce {}",
        network.input_size(),
        input_size
      )));
    }
    if network.output_size() != system.transition_count() {
      return Err(ModelError::malformed(format!(
        "network has {} outcomes for {} transitions",
        network.output_size(),
        system.transition_count()
      )));
    }
    Ok(Self {
      system,
      nodes,
      values,
      embeddings,
      network,
      workspaces: WorkspacePool::new(),
    })
  }

  pub fn system(&self) -> &TransitionSystem {
    &self.system
  }

  pub fn labels(&self) -> &[String] {
    self.system.labels()
  }

  pub fn values(&self) -> &[ValueExtractor] {
    &self.values
  }

  pub fn embeddings(&self) -> &[Embedding] {
    &self.embeddings
  }

  pub fn embeddings_mut(&mut self) -> &mut [Embedding] {
    &mut self.embeddings
  }

  pub fn network(&self) -> &NeuralNetwork {
    &self.network
  }

  fn encode(&self, enc: &mut BinaryEncoder) {
    enc.add_u8(NN_VERSION);
    let labels = self.system.labels();
    enc.add_u16(labels.len() as u16);
    for label in labels {
      enc.add_str(label);
    }
    enc.add_str(self.system.name());
    enc.add_str(self.nodes.description());
    enc.add_u16(self.values.len() as u16);
    for value in &self.values {
      enc.add_str(value.name());
    }
    for embedding in &self.embeddings {
      embedding.save(enc);
    }
    self.network.save(enc);
  }

  fn decode(dec: &mut BinaryDecoder) -> Result<Self, ModelError> {
    let version = dec.next_u8()?;
    if version != NN_VERSION {
      return Err(ModelError::UnsupportedVersion(version));
    }

    let label_count = dec.next_u16()?;
    let mut labels = Vec::with_capacity(label_count as usize);
    for _ in 0..label_count {
      labels.push(dec.next_str()?);
    }
    let system_name = dec.next_str()?;
    let system = TransitionSystem::create(&system_name, labels).map_err(|e| ModelError::malformed(e.to_string()))?;
    let nodes = NodeExtractor::create(&dec.next_str()?).map_err(|e| ModelError::malformed(e.to_string()))?;

    let value_count = dec.next_u16()?;
    let mut values = Vec::with_capacity(value_count as usize);
    for _ in 0..value_count {
      let name = dec.next_str()?;
      values.push(name.parse::<ValueExtractor>().map_err(|e| ModelError::malformed(e.to_string()))?);
    }
    let mut embeddings = Vec::with_capacity(values.len());
    for _ in 0..values.len() {
      embeddings.push(Embedding::load(dec)?);
    }
    let network = NeuralNetwork::load(dec)?;
    if !dec.is_end() {
      return Err(ModelError::malformed(format!("{} bytes of trailing data", dec.remaining())));
    }

    Self::new(system, nodes, values, embeddings, network)
  }

  fn init_embedding_ids(&self, tree: &Tree, ids: &mut Vec<EmbeddingIds>) {
    ids.resize_with(tree.len(), Vec::new);
    ids.truncate(tree.len());
    for (node, node_ids) in tree.nodes.iter().zip(ids.iter_mut()) {
      node_embedding_ids(&self.values, &self.embeddings, node, node_ids);
    }
  }

  /// Scores the transitions of configuration `c` into `buffers.outcomes`.
  fn score(
    &self,
    c: &Configuration,
    t: &Tree,
    ids: &[EmbeddingIds],
    selected: &mut Vec<Option<usize>>,
    buffers: &mut PropagationBuffers,
  ) {
    self.nodes.extract(c, t, selected);
    let inputs = selected_inputs(selected, ids);
    self.network.propagate(&self.embeddings, &inputs, buffers);
  }

  /// Parses `tree` greedily, replacing any existing arcs.
  pub fn parse(&self, tree: &mut Tree) {
    self.parse_with_beam(tree, 1);
  }

  /// Parses `tree` keeping the `beam_size` best partial analyses. A beam of
  /// one is greedy decoding.
  pub fn parse_with_beam(&self, tree: &mut Tree, beam_size: usize) {
    tree.unlink_all_nodes();
    let mut ws = self.workspaces.acquire_or(Workspace::default);
    if beam_size <= 1 {
      self.parse_greedy(tree, &mut ws);
    } else {
      self.parse_beam(tree, beam_size, &mut ws);
    }
  }

  fn parse_greedy(&self, tree: &mut Tree, ws: &mut Workspace) {
    let Workspace {
      conf,
      selected,
      embedding_ids,
      buffers,
    } = ws;
    conf.init(tree);
    self.init_embedding_ids(tree, embedding_ids);

    let mut steps = 0;
    while !conf.is_final() {
      self.score(conf, tree, embedding_ids, selected, buffers);
      let Some(best) = self.system.best_applicable(conf, &buffers.outcomes) else {
        break;
      };
      if let Some(child) = self.system.perform(conf, tree, best) {
        node_embedding_ids(&self.values, &self.embeddings, &tree.nodes[child], &mut embedding_ids[child]);
      }
      steps += 1;
    }
    debug!(tokens = tree.len() - 1, steps, "parsed sentence greedily");
  }

  fn parse_beam(&self, tree: &mut Tree, beam_size: usize, ws: &mut Workspace) {
    let mut start = Hypothesis {
      tree: tree.clone(),
      conf: Configuration::new(tree),
      embedding_ids: Vec::new(),
      logprob: 0.0,
    };
    self.init_embedding_ids(tree, &mut start.embedding_ids);
    let mut beam = vec![start];

    let mut steps = 0;
    let mut candidates: Vec<(f64, usize, Option<usize>)> = Vec::new();
    while beam.iter().any(|h| !h.conf.is_final()) {
      candidates.clear();
      for (index, h) in beam.iter().enumerate() {
        if h.conf.is_final() {
          candidates.push((h.logprob, index, None));
          continue;
        }
        self.score(&h.conf, &h.tree, &h.embedding_ids, &mut ws.selected, &mut ws.buffers);
        for (transition, &p) in ws.buffers.outcomes.iter().enumerate() {
          if self.system.applicable(&h.conf, transition) {
            candidates.push((h.logprob + p.ln(), index, Some(transition)));
          }
        }
      }
      // stable, so equal scores keep hypothesis and transition order
      candidates.sort_by(|a, b| b.0.total_cmp(&a.0));
      candidates.truncate(beam_size);

      beam = candidates
        .iter()
        .map(|&(logprob, index, transition)| {
          let mut h = beam[index].clone();
          h.logprob = logprob;
          if let Some(transition) = transition {
            if let Some(child) = self.system.perform(&mut h.conf, &mut h.tree, transition) {
              node_embedding_ids(&self.values, &self.embeddings, &h.tree.nodes[child], &mut h.embedding_ids[child]);
            }
          }
          h
        })
        .collect();
      steps += 1;
    }

    debug!(tokens = tree.len() - 1, steps, beam_size, "parsed sentence with beam search");
    if let Some(best) = beam.into_iter().max_by(|a, b| a.logprob.total_cmp(&b.logprob)) {
      *tree = best.tree;
    }
  }
}

/// A trained parser of any supported kind.
#[derive(Debug)]
pub enum Parser {
  Nn(ParserNn),
}

impl Parser {
  /// Reads a compressed model.
  pub fn load<R: Read>(reader: R) -> Result<Self, ModelError> {
    let data = compressor::load(reader)?;
    info!(bytes = data.len(), "loaded model");
    Self::decode(&data)
  }

  pub fn load_file(path: impl AsRef<Path>) -> Result<Self, ModelError> {
    let file = File::open(path)?;
    Self::load(BufReader::new(file))
  }

  /// Decodes an uncompressed model.
  pub fn decode(data: &[u8]) -> Result<Self, ModelError> {
    let mut dec = BinaryDecoder::new(data);
    let identifier = dec.next_str()?;
    match identifier.as_str() {
      NN_IDENTIFIER => Ok(Self::Nn(ParserNn::decode(&mut dec)?)),
      _ => Err(ModelError::UnknownModel(identifier)),
    }
  }

  /// Encodes the model without compression.
  pub fn encode(&self) -> Vec<u8> {
    let mut enc = BinaryEncoder::new();
    match self {
      Self::Nn(parser) => {
        enc.add_str(NN_IDENTIFIER);
        parser.encode(&mut enc);
      }
    }
    enc.into_bytes()
  }

  /// Writes the compressed model.
  pub fn save<W: Write>(&self, writer: W) -> Result<(), ModelError> {
    let data = self.encode();
    info!(bytes = data.len(), "saving model");
    compressor::save(&data, writer)
  }

  pub fn save_file(&self, path: impl AsRef<Path>) -> Result<(), ModelError> {
    let file = File::create(path)?;
    self.save(std::io::BufWriter::new(file))
  }

  pub fn parse(&self, tree: &mut Tree) {
    match self {
      Self::Nn(parser) => parser.parse(tree),
    }
  }

  pub fn parse_with_beam(&self, tree: &mut Tree, beam_size: usize) {
    match self {
      Self::Nn(parser) => parser.parse_with_beam(tree, beam_size),
    }
  }
}

impl From<ParserNn> for Parser {
  fn from(parser: ParserNn) -> Self {
    Self::Nn(parser)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::network::{Activation, Matrix};

  const SELECTORS: &str = "stack 0\nstack 1\nbuffer 0";

  /// A small untrained parser with deterministic weights.
  fn tiny_parser(system: &str) -> ParserNn {
    let system = TransitionSystem::create(system, vec!["nsubj".to_string(), "root".to_string()]).unwrap();
    let nodes = NodeExtractor::create(SELECTORS).unwrap();
    let values = vec![ValueExtractor::Form, ValueExtractor::Deprel];
    let forms = Embedding::create(
      2,
      0,
      vec![("dogs".to_string(), vec![0.5, -0.5]), ("bark".to_string(), vec![-0.25, 0.75])],
      Some(vec![0.1, 0.2]),
    )
    .unwrap();
    let deprels = Embedding::create(1, 0, vec![("nsubj".to_string(), vec![1.0])], Some(vec![-1.0])).unwrap();
    let embeddings = vec![forms, deprels];
    let inputs = network::input_size(&embeddings, 3);
    let outputs = system.transition_count();
    let weight = |r: usize, c: usize| ((r * 13 + c * 7) % 17) as f32 / 17.0 - 0.5;
    let network = NeuralNetwork {
      activation: Activation::Tanh,
      direct: Matrix::from_fn(inputs + 1, outputs, weight),
      hidden: [Matrix::from_fn(inputs + 1, 4, weight), Matrix::from_fn(5, outputs, weight)],
    };
    ParserNn::new(system, nodes, values, embeddings, network).unwrap()
  }

  fn all_attached(tree: &Tree) -> bool {
    tree.nodes.iter().skip(1).all(|n| n.head.is_some())
  }

  #[test]
  fn greedy_parse_attaches_every_node() {
    for system in ["projective", "swap", "link2"] {
      let parser = tiny_parser(system);
      let mut tree = Tree::from_forms(&["Dogs", "bark", "loudly", "today"]);
      parser.parse(&mut tree);
      assert!(all_attached(&tree), "{} left nodes unattached", system);
      if system == "projective" {
        assert!(tree.is_projective());
      }
    }
  }

  #[test]
  fn parse_replaces_existing_arcs() {
    let parser = tiny_parser("projective");
    let mut fresh = Tree::from_forms(&["dogs", "bark"]);
    parser.parse(&mut fresh);

    let mut stale = Tree::from_forms(&["dogs", "bark"]);
    stale.set_head(1, Some(2), "bogus");
    parser.parse(&mut stale);
    assert_eq!(stale, fresh);
  }

  #[test]
  fn beam_of_one_is_greedy_and_wider_beams_finish() {
    let parser = tiny_parser("projective");
    let mut greedy = Tree::from_forms(&["dogs", "bark", "at", "cats"]);
    parser.parse(&mut greedy);
    let mut beam1 = Tree::from_forms(&["dogs", "bark", "at", "cats"]);
    parser.parse_with_beam(&mut beam1, 1);
    assert_eq!(greedy, beam1);

    for beam_size in [2, 5] {
      let mut tree = Tree::from_forms(&["dogs", "bark", "at", "cats"]);
      parser.parse_with_beam(&mut tree, beam_size);
      assert!(all_attached(&tree));
      assert!(tree.is_projective());
    }
  }

  #[test]
  fn empty_sentence_is_fine() {
    let parser = tiny_parser("swap");
    let mut tree = Tree::new();
    parser.parse(&mut tree);
    parser.parse_with_beam(&mut tree, 3);
    assert!(tree.is_empty());
  }

  #[test]
  fn workspaces_are_reused() {
    let parser = tiny_parser("projective");
    let mut tree = Tree::from_forms(&["dogs"]);
    parser.parse(&mut tree);
    parser.parse(&mut tree);
    assert_eq!(parser.workspaces.idle(), 1);
  }

  #[test]
  fn model_round_trip() {
    let parser = Parser::from(tiny_parser("swap"));
    let mut saved = Vec::new();
    parser.save(&mut saved).unwrap();
    let loaded = Parser::load(saved.as_slice()).unwrap();
    assert_eq!(loaded.encode(), parser.encode());

    let mut a = Tree::from_forms(&["dogs", "bark", "loudly"]);
    let mut b = a.clone();
    parser.parse(&mut a);
    loaded.parse(&mut b);
    assert_eq!(a, b);
  }

  #[test]
  fn decode_distinguishes_failures() {
    let parser = Parser::from(tiny_parser("projective"));
    let data = parser.encode();

    let mut enc = BinaryEncoder::new();
    enc.add_str("svm");
    enc.add_data(&data[3..]);
    assert!(matches!(Parser::decode(enc.as_bytes()), Err(ModelError::UnknownModel(id)) if id == "svm"));

    let mut wrong_version = data.clone();
    wrong_version[3] = 9;
    assert!(matches!(Parser::decode(&wrong_version), Err(ModelError::UnsupportedVersion(9))));

    assert!(matches!(Parser::decode(&data[..data.len() - 2]), Err(ModelError::Truncated { .. })));

    let mut trailing = data.clone();
    trailing.push(0);
    assert!(matches!(Parser::decode(&trailing), Err(ModelError::Malformed(_))));

    let mut saved = Vec::new();
    parser.save(&mut saved).unwrap();
    saved.truncate(saved.len() / 2);
    assert!(Parser::load(saved.as_slice()).is_err());
  }

  struct FullDisk;

  impl Write for FullDisk {
    fn write(&mut self, _: &[u8]) -> std::io::Result<usize> {
      Err(std::io::Error::other("disk full"))
    }

    fn flush(&mut self) -> std::io::Result<()> {
      Ok(())
    }
  }

  #[test]
  fn save_reports_write_failures() {
    let parser = Parser::from(tiny_parser("projective"));
    let error = parser.save(FullDisk).unwrap_err();
    assert!(matches!(error, ModelError::Io(_)));
    assert!(error.to_string().contains("disk full"));
  }

  #[test]
  fn new_rejects_mismatched_network() {
    let parser = tiny_parser("projective");
    let ParserNn {
      nodes,
      values,
      embeddings,
      network,
      ..
    } = parser;
    let bigger = TransitionSystem::create("link2", vec!["nsubj".to_string(), "root".to_string()]).unwrap();
    assert!(ParserNn::new(bigger, nodes, values, embeddings, network).is_err());
  }
}
