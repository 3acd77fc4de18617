use crate::configuration::Configuration;
use crate::tree::Tree;
use crate::utils::{description_lines, parse_number};
use crate::Err;

/// Where a selector starts looking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Start {
  /// `k`-th item from the top of the stack
  Stack(usize),
  /// `k`-th item from the front of the buffer
  Buffer(usize),
}

/// One step taken from the current node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
  Parent,
  /// `k`-th child in id order, negative `k` counting from the last child
  Child(i32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selector {
  pub start: Start,
  pub directions: Vec<Direction>,
}

impl Selector {
  fn select(&self, c: &Configuration, t: &Tree) -> Option<usize> {
    let mut current = match self.start {
      Start::Stack(k) => c.stack_top(k)?,
      Start::Buffer(k) => c.buffer_front(k)?,
    };
    for direction in self.directions.iter() {
      let node = &t.nodes[current];
      current = match *direction {
        Direction::Parent => node.head?,
        Direction::Child(k) if k >= 0 => *node.children.get(k as usize)?,
        Direction::Child(k) => {
          let from_end = k.unsigned_abs() as usize;
          let index = node.children.len().checked_sub(from_end)?;
          node.children[index]
        }
      };
    }
    Some(current)
  }
}

/// Selects the configuration nodes whose values feed the network.
///
/// Selectors are read one per line:
///
/// ```text
/// # top of the stack and its leftmost child
/// stack 0
/// stack 0,child 0
/// # grandparent of the next token
/// buffer 0,parent,parent
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeExtractor {
  selectors: Vec<Selector>,
  description: String,
}

impl NodeExtractor {
  pub fn create(description: &str) -> Result<Self, Err> {
    regex_static!(START, r"^(stack|buffer) ([0-9]+)$");
    regex_static!(CHILD, r"^child (-?[0-9]+)$");

    let mut selectors = Vec::new();
    for line in description_lines(description) {
      let mut parts = line.split(',').map(str::trim);
      let start = parts.next().unwrap_or_default();
      let caps = START
        .captures(start)
        .ok_or_else(|| format!("cannot parse node selector start '{}' on line '{}'", start, line))?;
      let index = parse_number(&caps[2], "starting index")?;
      let start = if &caps[1] == "stack" {
        Start::Stack(index)
      } else {
        Start::Buffer(index)
      };

      let mut directions = Vec::new();
      for part in parts {
        if part == "parent" {
          directions.push(Direction::Parent);
        } else if let Some(caps) = CHILD.captures(part) {
          directions.push(Direction::Child(parse_number(&caps[1], "child index")?));
        } else {
          return Err(format!("cannot parse node selector direction '{}' on line '{}'", part, line).into());
        }
      }
      selectors.push(Selector { start, directions });
    }

    Ok(Self {
      selectors,
      description: description.to_string(),
    })
  }

  pub fn node_count(&self) -> usize {
    self.selectors.len()
  }

  pub fn selectors(&self) -> &[Selector] {
    &self.selectors
  }

  /// The text this extractor was created from.
  pub fn description(&self) -> &str {
    &self.description
  }

  /// Fills `nodes` with one entry per selector, `None` where the selector
  /// walks off the configuration or the tree.
  pub fn extract(&self, c: &Configuration, t: &Tree, nodes: &mut Vec<Option<usize>>) {
    nodes.clear();
    nodes.extend(self.selectors.iter().map(|s| s.select(c, t)));
  }
}
