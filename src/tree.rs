use std::fmt;

/// Form of the synthetic root node that every tree starts with.
pub const ROOT_FORM: &str = "<root>";

/// One token of a sentence, plus the synthetic root at id 0.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Node {
  /// 0 is the root, real tokens are numbered from 1
  pub id: usize,
  pub form: String,
  pub lemma: String,
  /// universal part-of-speech tag
  pub upostag: String,
  /// language-specific part-of-speech tag
  pub xpostag: String,
  pub feats: String,
  /// `None` while the node is unattached, `Some(0)` when attached to the root
  pub head: Option<usize>,
  pub deprel: String,
  pub deps: String,
  pub misc: String,
  /// ids of nodes whose head is this node, sorted ascending
  pub children: Vec<usize>,
}

impl Node {
  pub fn new(id: usize, form: impl Into<String>) -> Self {
    Self {
      id,
      form: form.into(),
      ..Default::default()
    }
  }
}

/// A multiword token spanning the nodes `first..=last`, kept for writing
/// trees back out.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MultiwordToken {
  pub first: usize,
  pub last: usize,
  pub form: String,
  pub misc: String,
}

/// An empty (enhanced-dependency) node line, kept verbatim. It follows the
/// node `after` in the output.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EmptyNode {
  pub after: usize,
  pub line: String,
}

/// A dependency tree. Node 0 is always the synthetic root.
#[derive(Debug, Clone, PartialEq)]
pub struct Tree {
  pub nodes: Vec<Node>,
  pub comments: Vec<String>,
  pub multiword_tokens: Vec<MultiwordToken>,
  pub empty_nodes: Vec<EmptyNode>,
}

impl Default for Tree {
  fn default() -> Self {
    Self::new()
  }
}

impl Tree {
  pub fn new() -> Self {
    Self {
      nodes: vec![Node::new(0, ROOT_FORM)],
      comments: Vec::new(),
      multiword_tokens: Vec::new(),
      empty_nodes: Vec::new(),
    }
  }

  /// Builds an unattached tree from token forms.
  pub fn from_forms<S: AsRef<str>>(forms: &[S]) -> Self {
    let mut tree = Self::new();
    for form in forms {
      tree.add_node(form.as_ref());
    }
    tree
  }

  /// True when the tree contains only the root.
  pub fn is_empty(&self) -> bool {
    self.nodes.len() == 1
  }

  /// Number of nodes including the root.
  pub fn len(&self) -> usize {
    self.nodes.len()
  }

  pub fn clear(&mut self) {
    *self = Self::new();
  }

  pub fn add_node(&mut self, form: &str) -> &mut Node {
    let id = self.nodes.len();
    self.nodes.push(Node::new(id, form));
    let last = self.nodes.len() - 1;
    &mut self.nodes[last]
  }

  /// Makes `head` the head of `id` with the given relation, first unlinking
  /// `id` from its previous head. Relinking to the same head leaves exactly
  /// one entry in the head's children.
  ///
  /// Callers guarantee that `id` is not the root; arcs are not checked for
  /// cycles.
  pub fn set_head(&mut self, id: usize, head: Option<usize>, deprel: &str) {
    debug_assert!(id < self.nodes.len(), "node {} out of range", id);
    debug_assert!(head.is_none_or(|h| h < self.nodes.len()), "head out of range");

    if let Some(old) = self.nodes[id].head {
      let children = &mut self.nodes[old].children;
      if let Ok(pos) = children.binary_search(&id) {
        children.remove(pos);
      }
    }

    self.nodes[id].head = head;
    self.nodes[id].deprel.clear();
    self.nodes[id].deprel.push_str(deprel);
    if let Some(head) = head {
      let children = &mut self.nodes[head].children;
      if let Err(pos) = children.binary_search(&id) {
        children.insert(pos, id);
      }
    }
  }

  /// Detaches every node: heads become `None`, deprels and children are cleared.
  pub fn unlink_all_nodes(&mut self) {
    for node in self.nodes.iter_mut() {
      node.head = None;
      node.deprel.clear();
      node.children.clear();
    }
  }

  /// Rebuilds all children lists from the heads. Only needed after heads
  /// were assigned directly, e.g. while reading a treebank.
  pub fn rebuild_children(&mut self) {
    for node in self.nodes.iter_mut() {
      node.children.clear();
    }
    for id in 1..self.nodes.len() {
      if let Some(head) = self.nodes[id].head {
        if head < self.nodes.len() {
          self.nodes[head].children.push(id);
        }
      }
    }
  }

  /// True when every arc is projective: all nodes between a head and its
  /// dependent are descendants of that head. Unattached nodes are ignored.
  pub fn is_projective(&self) -> bool {
    for id in 1..self.nodes.len() {
      let Some(head) = self.nodes[id].head else {
        continue;
      };
      let (lo, hi) = if head < id { (head, id) } else { (id, head) };
      for between in lo + 1..hi {
        if !self.is_descendant(between, head) {
          return false;
        }
      }
    }
    true
  }

  /// Walks up from `node` looking for `ancestor`, giving up after `len` steps
  /// so that cyclic trees terminate.
  fn is_descendant(&self, mut node: usize, ancestor: usize) -> bool {
    for _ in 0..self.nodes.len() {
      match self.nodes[node].head {
        Some(head) if head == ancestor => return true,
        Some(head) => node = head,
        None => return false,
      }
    }
    false
  }
}

impl fmt::Display for Tree {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    for node in self.nodes.iter().skip(1) {
      match node.head {
        Some(head) => writeln!(f, "{} {} <-{}- {}", node.id, node.form, node.deprel, head)?,
        None => writeln!(f, "{} {} (unattached)", node.id, node.form)?,
      }
    }
    Ok(())
  }
}
