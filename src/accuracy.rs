//! Attachment scores of parsed trees against gold trees.

use std::fmt;

use crate::tree::Tree;
use crate::Err;

/// Universal tag marking punctuation.
pub const PUNCTUATION_TAG: &str = "PUNCT";

/// Counts of correctly attached nodes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Accuracy {
  pub total: usize,
  pub head_correct: usize,
  pub label_correct: usize,
}

impl Accuracy {
  /// Unlabeled attachment score in percent.
  pub fn uas(&self) -> f64 {
    percent(self.head_correct, self.total)
  }

  /// Labeled attachment score in percent.
  pub fn las(&self) -> f64 {
    percent(self.label_correct, self.total)
  }
}

fn percent(correct: usize, total: usize) -> f64 {
  if total == 0 {
    0.0
  } else {
    100.0 * correct as f64 / total as f64
  }
}

impl fmt::Display for Accuracy {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "UAS: {:.2}%, LAS: {:.2}%", self.uas(), self.las())
  }
}

/// Scores over all nodes and over non-punctuation nodes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Evaluation {
  pub all: Accuracy,
  pub without_punctuation: Accuracy,
}

impl Evaluation {
  /// Adds the nodes of `system` scored against `gold`. Both trees must have
  /// the same nodes.
  pub fn add(&mut self, gold: &Tree, system: &Tree) -> Result<(), Err> {
    if gold.len() != system.len() {
      return Err(format!("gold tree has {} nodes, parsed tree has {}", gold.len() - 1, system.len() - 1).into());
    }
    for (g, s) in gold.nodes.iter().zip(&system.nodes).skip(1) {
      if g.form != s.form {
        return Err(format!("node {} is '{}' in the gold tree but '{}' in the parsed tree", g.id, g.form, s.form).into());
      }
      let head = g.head == s.head;
      let label = head && g.deprel == s.deprel;
      let mut counts = vec![&mut self.all];
      if g.upostag != PUNCTUATION_TAG {
        counts.push(&mut self.without_punctuation);
      }
      for accuracy in counts {
        accuracy.total += 1;
        accuracy.head_correct += head as usize;
        accuracy.label_correct += label as usize;
      }
    }
    Ok(())
  }
}

impl fmt::Display for Evaluation {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "{} (without punctuation {})",
      self.all, self.without_punctuation
    )
  }
}

/// Parses a copy of every gold tree with `parse` and scores the results.
pub fn evaluate(gold: &[Tree], mut parse: impl FnMut(&mut Tree)) -> Evaluation {
  let mut evaluation = Evaluation::default();
  let mut system = Tree::new();
  for tree in gold {
    system.clone_from(tree);
    parse(&mut system);
    // same nodes by construction
    let _ = evaluation.add(tree, &system);
  }
  evaluation
}
