#[macro_use]
extern crate lazy_static;

#[macro_use]
pub mod utils;

pub mod accuracy;
pub mod binary;
pub mod compressor;
pub mod configuration;
pub mod conllu;
pub mod embedding;
pub mod network;
pub mod network_parameters;
pub mod network_trainer;
pub mod node_extractor;
pub mod oracle;
pub mod parser;
pub mod parser_trainer;
pub mod pool;
pub mod transition;
pub mod transition_system;
pub mod tree;
pub mod value_extractor;

use std::io::BufRead;

use crate::conllu::{write_tree, ConlluReader};
pub use crate::binary::ModelError;
pub use crate::parser::{Parser, ParserNn};
pub use crate::parser_trainer::{train, TrainerConfig};
pub use crate::tree::{Node, Tree};
pub use crate::utils::Err;

impl Parser {
  /// Parses every sentence of a CoNLL-U stream and returns the parsed
  /// sentences in CoNLL-U format.
  pub fn parse_conllu<R: BufRead>(&self, input: R, beam_size: usize) -> Result<String, Err> {
    let mut output = String::new();
    let mut sentences = 0;
    for tree in ConlluReader::new(input) {
      let mut tree = tree?;
      self.parse_with_beam(&mut tree, beam_size);
      write_tree(&tree, &mut output);
      sentences += 1;
    }
    tracing::debug!(sentences, "parsed CoNLL-U input");
    Ok(output)
  }
}

#[test]
fn parse_conllu_keeps_sentence_metadata() -> Result<(), Err> {
  let mut embedding_lines = String::new();
  for value in ["form", "universal_tag", "deprel"] {
    embedding_lines.push_str(&format!("{} 6 0 1\n", value));
  }
  let config = TrainerConfig {
    embeddings: embedding_lines,
    nodes: "stack 0\nstack 1\nbuffer 0\nstack 0,child 0\n".to_string(),
    parameters: network_parameters::NetworkParameters {
      iterations: 2,
      hidden_layer: 8,
      ..Default::default()
    },
    ..TrainerConfig::default()
  };
  let gold = "\
# text = Dogs bark.
1\tDogs\tdog\tNOUN\tNNS\t_\t2\tnsubj\t_\t_
2\tbark\tbark\tVERB\tVBP\t_\t0\troot\t_\t_
3\t.\t.\tPUNCT\t.\t_\t2\tpunct\t_\t_

";
  let parser = Parser::from(train(&config, &conllu::parse_trees(gold)?, &[])?);

  let parsed = parser.parse_conllu(gold.as_bytes(), 1)?;
  let trees = conllu::parse_trees(&parsed)?;
  assert_eq!(trees.len(), 1);
  assert_eq!(trees[0].comments, vec![" text = Dogs bark.".to_string()]);
  assert!(trees[0].nodes.iter().skip(1).all(|n| n.head.is_some()));
  Ok(())
}
