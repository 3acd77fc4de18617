use crate::tree::Tree;

/// Parser state for one sentence: a stack and a buffer of node ids. The
/// buffer holds the unprocessed nodes in reverse order, so its last element
/// is the next token to shift. The tree being built is passed alongside
/// wherever it is needed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Configuration {
  pub stack: Vec<usize>,
  pub buffer: Vec<usize>,
}

impl Configuration {
  pub fn new(tree: &Tree) -> Self {
    let mut c = Self::default();
    c.init(tree);
    c
  }

  /// Resets the configuration to the start state for `tree`: the root alone
  /// on the stack, every real token in the buffer.
  pub fn init(&mut self, tree: &Tree) {
    self.stack.clear();
    self.stack.push(0);
    self.buffer.clear();
    self.buffer.extend((1..tree.len()).rev());
  }

  /// The configuration is final once the buffer is exhausted and at most the
  /// root remains on the stack.
  pub fn is_final(&self) -> bool {
    self.buffer.is_empty() && self.stack.len() <= 1
  }

  /// `k`-th element from the top of the stack.
  pub fn stack_top(&self, k: usize) -> Option<usize> {
    self.stack.len().checked_sub(k + 1).map(|i| self.stack[i])
  }

  /// `k`-th element from the front of the buffer.
  pub fn buffer_front(&self, k: usize) -> Option<usize> {
    self.buffer.len().checked_sub(k + 1).map(|i| self.buffer[i])
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn init_puts_tokens_in_reverse_order() {
    let t = Tree::from_forms(&["a", "b", "c"]);
    let c = Configuration::new(&t);
    assert_eq!(c.stack, vec![0]);
    assert_eq!(c.buffer, vec![3, 2, 1]);
    assert_eq!(c.buffer_front(0), Some(1));
    assert_eq!(c.buffer_front(2), Some(3));
    assert_eq!(c.buffer_front(3), None);
    assert_eq!(c.stack_top(0), Some(0));
    assert_eq!(c.stack_top(1), None);
    assert!(!c.is_final());
  }

  #[test]
  fn empty_sentence_is_final_immediately() {
    let c = Configuration::new(&Tree::new());
    assert!(c.is_final());
  }

  #[test]
  fn reinit_discards_previous_state() {
    let mut c = Configuration::new(&Tree::from_forms(&["a", "b"]));
    c.stack.push(7);
    c.init(&Tree::from_forms(&["x"]));
    assert_eq!(c.stack, vec![0]);
    assert_eq!(c.buffer, vec![1]);
  }
}
