//! Reading and writing trees in the CoNLL-U format.

use std::io::BufRead;

use crate::tree::{EmptyNode, MultiwordToken, Tree};
use crate::utils::parse_number;
use crate::Err;

const COLUMNS: usize = 10;

/// Reads one tree per blank-line separated block.
pub struct ConlluReader<R> {
  reader: R,
  line_number: usize,
}

impl<R: BufRead> ConlluReader<R> {
  pub fn new(reader: R) -> Self {
    Self {
      reader,
      line_number: 0,
    }
  }

  /// Reads the lines of the next sentence, skipping leading blank lines.
  fn read_block(&mut self, block: &mut Vec<String>) -> Result<bool, Err> {
    block.clear();
    let mut line = String::new();
    loop {
      line.clear();
      if self.reader.read_line(&mut line)? == 0 {
        return Ok(!block.is_empty());
      }
      self.line_number += 1;
      let trimmed = line.trim_end_matches(['\n', '\r']);
      if trimmed.is_empty() {
        if !block.is_empty() {
          return Ok(true);
        }
      } else {
        block.push(trimmed.to_string());
      }
    }
  }

  /// Returns the next tree, or `None` at the end of input.
  pub fn read_tree(&mut self) -> Result<Option<Tree>, Err> {
    let mut block = Vec::new();
    if !self.read_block(&mut block)? {
      return Ok(None);
    }
    let first_line = self.line_number + 1 - block.len();
    parse_block(&block)
      .map(Some)
      .map_err(|e| format!("sentence ending on line {} (starting near line {}): {}", self.line_number, first_line, e).into())
  }
}

impl<R: BufRead> Iterator for ConlluReader<R> {
  type Item = Result<Tree, Err>;

  fn next(&mut self) -> Option<Self::Item> {
    self.read_tree().transpose()
  }
}

/// Parses every tree in `text`.
pub fn parse_trees(text: &str) -> Result<Vec<Tree>, Err> {
  ConlluReader::new(text.as_bytes()).collect()
}

fn column(value: &str) -> String {
  if value == "_" { String::new() } else { value.to_string() }
}

fn parse_block(lines: &[String]) -> Result<Tree, Err> {
  regex_static!(MULTIWORD, r"^(\d+)-(\d+)$");
  regex_static!(EMPTY_NODE, r"^(\d+)\.(\d+)$");
  regex_static!(WORD, r"^\d+$");

  let mut tree = Tree::new();
  for line in lines {
    if let Some(comment) = line.strip_prefix('#') {
      tree.comments.push(comment.to_string());
      continue;
    }

    let columns = line.split('\t').collect::<Vec<_>>();
    if columns.len() != COLUMNS {
      return Err(format!("expected {} tab separated columns, found {} in '{}'", COLUMNS, columns.len(), line).into());
    }

    if let Some(caps) = MULTIWORD.captures(columns[0]) {
      let first: usize = parse_number(&caps[1], "multiword token start")?;
      let last: usize = parse_number(&caps[2], "multiword token end")?;
      if first != tree.len() || last < first {
        return Err(format!("invalid multiword token range '{}'", columns[0]).into());
      }
      tree.multiword_tokens.push(MultiwordToken {
        first,
        last,
        form: columns[1].to_string(),
        misc: column(columns[9]),
      });
    } else if let Some(caps) = EMPTY_NODE.captures(columns[0]) {
      let after: usize = parse_number(&caps[1], "empty node id")?;
      if after + 1 != tree.len() {
        return Err(format!("empty node '{}' is out of order", columns[0]).into());
      }
      tree.empty_nodes.push(EmptyNode {
        after,
        line: line.clone(),
      });
    } else if WORD.is_match(columns[0]) {
      let id: usize = parse_number(columns[0], "node id")?;
      if id != tree.len() {
        return Err(format!("expected node id {}, found {}", tree.len(), id).into());
      }
      let head = if columns[6] == "_" {
        None
      } else {
        Some(parse_number::<usize>(columns[6], "head")?)
      };

      let node = tree.add_node(columns[1]);
      node.lemma = column(columns[2]);
      node.upostag = column(columns[3]);
      node.xpostag = column(columns[4]);
      node.feats = column(columns[5]);
      node.head = head;
      node.deprel = column(columns[7]);
      node.deps = column(columns[8]);
      node.misc = column(columns[9]);
    } else {
      return Err(format!("cannot parse node id '{}'", columns[0]).into());
    }
  }

  if tree.is_empty() {
    return Err("sentence without any nodes".into());
  }
  for node in tree.nodes.iter().skip(1) {
    if let Some(head) = node.head {
      if head >= tree.len() {
        return Err(format!("node {} has head {} outside of the sentence", node.id, head).into());
      }
      if head == node.id {
        return Err(format!("node {} is its own head", node.id).into());
      }
    }
  }
  tree.rebuild_children();

  Ok(tree)
}

fn push_column(out: &mut String, value: &str) {
  out.push_str(if value.is_empty() { "_" } else { value });
}

/// Appends `tree` in CoNLL-U format, including the terminating blank line.
pub fn write_tree(tree: &Tree, out: &mut String) {
  for comment in tree.comments.iter() {
    out.push('#');
    out.push_str(comment);
    out.push('\n');
  }

  let mut multiword = tree.multiword_tokens.iter().peekable();
  let mut empty = tree.empty_nodes.iter().peekable();
  while let Some(e) = empty.next_if(|e| e.after == 0) {
    out.push_str(&e.line);
    out.push('\n');
  }

  for node in tree.nodes.iter().skip(1) {
    while let Some(mwt) = multiword.next_if(|m| m.first == node.id) {
      out.push_str(&format!("{}-{}\t{}\t_\t_\t_\t_\t_\t_\t_\t", mwt.first, mwt.last, mwt.form));
      push_column(out, &mwt.misc);
      out.push('\n');
    }

    out.push_str(&node.id.to_string());
    for value in [&node.form, &node.lemma, &node.upostag, &node.xpostag, &node.feats] {
      out.push('\t');
      push_column(out, value);
    }
    out.push('\t');
    match node.head {
      Some(head) => out.push_str(&head.to_string()),
      None => out.push('_'),
    }
    for value in [&node.deprel, &node.deps, &node.misc] {
      out.push('\t');
      push_column(out, value);
    }
    out.push('\n');

    while let Some(e) = empty.next_if(|e| e.after == node.id) {
      out.push_str(&e.line);
      out.push('\n');
    }
  }
  out.push('\n');
}
