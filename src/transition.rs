use std::fmt;

use crate::configuration::Configuration;
use crate::tree::Tree;

/// An atomic parser move. Arc transitions carry the dependency label they
/// assign.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Transition {
  /// Moves the next buffer token onto the stack.
  Shift,
  /// Returns the second stack item to the buffer, reordering the top two.
  Swap,
  /// Attaches the second stack item to the top one.
  LeftArc(String),
  /// Attaches the top stack item to the second one.
  RightArc(String),
  /// Attaches the third stack item to the top one.
  LeftArc2(String),
  /// Attaches the top stack item to the third one, returning the second to the buffer.
  RightArc2(String),
}

impl Transition {
  pub fn label(&self) -> Option<&str> {
    match self {
      Self::Shift | Self::Swap => None,
      Self::LeftArc(l) | Self::RightArc(l) | Self::LeftArc2(l) | Self::RightArc2(l) => Some(l),
    }
  }

  pub fn applicable(&self, c: &Configuration) -> bool {
    let len = c.stack.len();
    match self {
      Self::Shift => !c.buffer.is_empty(),
      Self::Swap => len >= 2 && c.stack[len - 2] != 0 && c.stack[len - 2] < c.stack[len - 1],
      Self::LeftArc(_) => len >= 2 && c.stack[len - 2] != 0,
      Self::RightArc(_) => len >= 2,
      Self::LeftArc2(_) => len >= 3 && c.stack[len - 3] != 0,
      Self::RightArc2(_) => len >= 3,
    }
  }

  /// Performs the transition, returning the node whose head was set, if any.
  /// Performing an inapplicable transition is a caller bug; it is a no-op in
  /// release builds.
  pub fn perform(&self, c: &mut Configuration, t: &mut Tree) -> Option<usize> {
    debug_assert!(self.applicable(c), "performing inapplicable transition {}", self);
    if !self.applicable(c) {
      return None;
    }

    match self {
      Self::Shift => {
        let next = c.buffer.pop()?;
        c.stack.push(next);
        None
      }
      Self::Swap => {
        let top = c.stack.pop()?;
        let to_buffer = c.stack.pop()?;
        c.stack.push(top);
        c.buffer.push(to_buffer);
        None
      }
      Self::LeftArc(label) => {
        let parent = c.stack.pop()?;
        let child = c.stack.pop()?;
        c.stack.push(parent);
        t.set_head(child, Some(parent), label);
        Some(child)
      }
      Self::RightArc(label) => {
        let child = c.stack.pop()?;
        let parent = *c.stack.last()?;
        t.set_head(child, Some(parent), label);
        Some(child)
      }
      Self::LeftArc2(label) => {
        let parent = c.stack.pop()?;
        let ignore = c.stack.pop()?;
        let child = c.stack.pop()?;
        c.stack.push(ignore);
        c.stack.push(parent);
        t.set_head(child, Some(parent), label);
        Some(child)
      }
      Self::RightArc2(label) => {
        let child = c.stack.pop()?;
        let to_buffer = c.stack.pop()?;
        let parent = *c.stack.last()?;
        c.buffer.push(to_buffer);
        t.set_head(child, Some(parent), label);
        Some(child)
      }
    }
  }
}

impl fmt::Display for Transition {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Shift => write!(f, "shift"),
      Self::Swap => write!(f, "swap"),
      Self::LeftArc(l) => write!(f, "left_arc({})", l),
      Self::RightArc(l) => write!(f, "right_arc({})", l),
      Self::LeftArc2(l) => write!(f, "left_arc_2({})", l),
      Self::RightArc2(l) => write!(f, "right_arc_2({})", l),
    }
  }
}
