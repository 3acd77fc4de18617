use std::fmt;
use std::str::FromStr;

use crate::tree::Node;
use crate::Err;

/// Value produced for a missing node. Distinct from any real word so that it
/// gets its own embedding row.
pub const NOT_FOUND: &str = "</s>";

/// The node field an embedding table is indexed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueExtractor {
  Form,
  Lemma,
  /// the `LId=` entry of the misc column, falling back to the lemma
  LemmaId,
  Tag,
  UniversalTag,
  Deprel,
}

impl ValueExtractor {
  pub fn name(self) -> &'static str {
    match self {
      Self::Form => "form",
      Self::Lemma => "lemma",
      Self::LemmaId => "lemma_id",
      Self::Tag => "tag",
      Self::UniversalTag => "universal_tag",
      Self::Deprel => "deprel",
    }
  }

  pub fn extract(self, node: Option<&Node>) -> &str {
    let Some(node) = node else {
      return NOT_FOUND;
    };
    match self {
      Self::Form => &node.form,
      Self::Lemma => &node.lemma,
      Self::LemmaId => lemma_id(&node.misc).unwrap_or(&node.lemma),
      Self::Tag => &node.xpostag,
      Self::UniversalTag => &node.upostag,
      Self::Deprel => &node.deprel,
    }
  }
}

fn lemma_id(misc: &str) -> Option<&str> {
  let start = misc.find("LId=")? + "LId=".len();
  let rest = &misc[start..];
  Some(rest.split('|').next().unwrap_or(rest))
}

impl FromStr for ValueExtractor {
  type Err = Err;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "form" => Ok(Self::Form),
      "lemma" => Ok(Self::Lemma),
      "lemma_id" => Ok(Self::LemmaId),
      "tag" => Ok(Self::Tag),
      "universal_tag" => Ok(Self::UniversalTag),
      "deprel" => Ok(Self::Deprel),
      _ => Err(format!("cannot parse value selector '{}'", s).into()),
    }
  }
}

impl fmt::Display for ValueExtractor {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.name())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn node() -> Node {
    let mut n = Node::new(1, "Dogs");
    n.lemma = "dog".to_string();
    n.upostag = "NOUN".to_string();
    n.xpostag = "NNS".to_string();
    n.deprel = "nsubj".to_string();
    n
  }

  #[test]
  fn extracts_fields() {
    let n = node();
    assert_eq!(ValueExtractor::Form.extract(Some(&n)), "Dogs");
    assert_eq!(ValueExtractor::Lemma.extract(Some(&n)), "dog");
    assert_eq!(ValueExtractor::Tag.extract(Some(&n)), "NNS");
    assert_eq!(ValueExtractor::UniversalTag.extract(Some(&n)), "NOUN");
    assert_eq!(ValueExtractor::Deprel.extract(Some(&n)), "nsubj");
    assert_eq!(ValueExtractor::Form.extract(None), NOT_FOUND);
  }

  #[test]
  fn lemma_id_reads_misc() {
    let mut n = node();
    assert_eq!(ValueExtractor::LemmaId.extract(Some(&n)), "dog");
    n.misc = "SpaceAfter=No|LId=dog-1|Other=x".to_string();
    assert_eq!(ValueExtractor::LemmaId.extract(Some(&n)), "dog-1");
    n.misc = "LId=dog-2".to_string();
    assert_eq!(ValueExtractor::LemmaId.extract(Some(&n)), "dog-2");
  }

  #[test]
  fn names_round_trip() {
    for v in [
      ValueExtractor::Form,
      ValueExtractor::Lemma,
      ValueExtractor::LemmaId,
      ValueExtractor::Tag,
      ValueExtractor::UniversalTag,
      ValueExtractor::Deprel,
    ] {
      assert_eq!(v.name().parse::<ValueExtractor>().unwrap(), v);
    }
    assert!("upos".parse::<ValueExtractor>().is_err());
  }
}
