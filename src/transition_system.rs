use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::configuration::Configuration;
use crate::oracle::{OracleKind, TransitionOracle};
use crate::transition::Transition;
use crate::tree::Tree;
use crate::Err;

/// The available transition inventories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransitionSystemKind {
  /// Shift plus a left/right arc pair per label. Builds projective trees only.
  Projective,
  /// Like `Projective` with an additional swap, able to build non-projective trees.
  Swap,
  /// Shift plus left/right arcs reaching one and two stack items back.
  Link2,
}

impl TransitionSystemKind {
  pub fn name(self) -> &'static str {
    match self {
      Self::Projective => "projective",
      Self::Swap => "swap",
      Self::Link2 => "link2",
    }
  }

  pub fn transition_count(self, labels: usize) -> usize {
    match self {
      Self::Projective => 1 + 2 * labels,
      Self::Swap => 2 + 2 * labels,
      Self::Link2 => 1 + 4 * labels,
    }
  }

  pub fn shift(self) -> usize {
    0
  }

  pub fn swap(self) -> Option<usize> {
    match self {
      Self::Swap => Some(1),
      _ => None,
    }
  }

  pub fn left_arc(self, label: usize) -> usize {
    match self {
      Self::Projective => 1 + 2 * label,
      Self::Swap => 2 + 2 * label,
      Self::Link2 => 1 + 4 * label,
    }
  }

  pub fn right_arc(self, label: usize) -> usize {
    self.left_arc(label) + 1
  }

  pub fn left_arc_2(self, label: usize) -> Option<usize> {
    match self {
      Self::Link2 => Some(3 + 4 * label),
      _ => None,
    }
  }

  pub fn right_arc_2(self, label: usize) -> Option<usize> {
    self.left_arc_2(label).map(|i| i + 1)
  }

  fn transitions(self, labels: &[String]) -> Vec<Transition> {
    let mut transitions = Vec::with_capacity(self.transition_count(labels.len()));
    transitions.push(Transition::Shift);
    if self == Self::Swap {
      transitions.push(Transition::Swap);
    }
    for label in labels {
      transitions.push(Transition::LeftArc(label.clone()));
      transitions.push(Transition::RightArc(label.clone()));
      if self == Self::Link2 {
        transitions.push(Transition::LeftArc2(label.clone()));
        transitions.push(Transition::RightArc2(label.clone()));
      }
    }
    transitions
  }
}

impl FromStr for TransitionSystemKind {
  type Err = Err;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "projective" => Ok(Self::Projective),
      "swap" => Ok(Self::Swap),
      "link2" => Ok(Self::Link2),
      _ => Err(format!("cannot create transition system '{}'", s).into()),
    }
  }
}

impl fmt::Display for TransitionSystemKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.name())
  }
}

/// A fixed, ordered list of transitions over a label vocabulary. Transition
/// 0 is always shift.
#[derive(Debug, Clone)]
pub struct TransitionSystem {
  kind: TransitionSystemKind,
  labels: Vec<String>,
  label_ids: HashMap<String, usize>,
  transitions: Vec<Transition>,
}

impl TransitionSystem {
  pub fn new(kind: TransitionSystemKind, labels: Vec<String>) -> Self {
    let label_ids = labels.iter().enumerate().map(|(i, l)| (l.clone(), i)).collect();
    let transitions = kind.transitions(&labels);
    Self {
      kind,
      labels,
      label_ids,
      transitions,
    }
  }

  /// Creates the system called `name`.
  pub fn create(name: &str, labels: Vec<String>) -> Result<Self, Err> {
    Ok(Self::new(name.parse()?, labels))
  }

  pub fn kind(&self) -> TransitionSystemKind {
    self.kind
  }

  pub fn name(&self) -> &'static str {
    self.kind.name()
  }

  pub fn labels(&self) -> &[String] {
    &self.labels
  }

  pub fn label_index(&self, label: &str) -> Option<usize> {
    self.label_ids.get(label).copied()
  }

  pub fn transition_count(&self) -> usize {
    self.transitions.len()
  }

  pub fn transition(&self, index: usize) -> Option<&Transition> {
    self.transitions.get(index)
  }

  pub fn applicable(&self, c: &Configuration, index: usize) -> bool {
    self.transitions.get(index).is_some_and(|t| t.applicable(c))
  }

  /// Performs transition `index`, returning the node whose head changed.
  /// Out-of-range indices are ignored.
  pub fn perform(&self, c: &mut Configuration, t: &mut Tree, index: usize) -> Option<usize> {
    self.transitions.get(index)?.perform(c, t)
  }

  /// Highest scoring applicable transition; ties go to the lowest index.
  pub fn best_applicable(&self, c: &Configuration, scores: &[f64]) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (i, transition) in self.transitions.iter().enumerate() {
      if i < scores.len() && transition.applicable(c) && best.is_none_or(|b| scores[i] > scores[b]) {
        best = Some(i);
      }
    }
    best
  }

  /// The oracle called `name` for this system, or `None` if the system has no
  /// such oracle.
  pub fn oracle(&self, name: &str) -> Option<TransitionOracle> {
    let kind = match (self.kind, name) {
      (TransitionSystemKind::Projective, "static") => OracleKind::ProjectiveStatic,
      (TransitionSystemKind::Projective, "dynamic") => OracleKind::ProjectiveDynamic,
      (TransitionSystemKind::Swap, "static_eager") => OracleKind::SwapStaticEager,
      (TransitionSystemKind::Link2, "static") => OracleKind::Link2Static,
      _ => return None,
    };
    Some(TransitionOracle::new(kind, self))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn labels() -> Vec<String> {
    vec!["nsubj".to_string(), "obj".to_string()]
  }

  #[test]
  fn transition_counts() {
    assert_eq!(TransitionSystem::create("projective", labels()).unwrap().transition_count(), 5);
    assert_eq!(TransitionSystem::create("swap", labels()).unwrap().transition_count(), 6);
    assert_eq!(TransitionSystem::create("link2", labels()).unwrap().transition_count(), 9);
    assert!(TransitionSystem::create("arc-eager", labels()).is_err());
  }

  #[test]
  fn index_helpers_match_transition_order() {
    for kind in [TransitionSystemKind::Projective, TransitionSystemKind::Swap, TransitionSystemKind::Link2] {
      let system = TransitionSystem::new(kind, labels());
      assert_eq!(system.transition(kind.shift()), Some(&Transition::Shift));
      for (i, label) in labels().into_iter().enumerate() {
        assert_eq!(system.transition(kind.left_arc(i)), Some(&Transition::LeftArc(label.clone())));
        assert_eq!(system.transition(kind.right_arc(i)), Some(&Transition::RightArc(label.clone())));
        if let Some(l2) = kind.left_arc_2(i) {
          assert_eq!(system.transition(l2), Some(&Transition::LeftArc2(label.clone())));
          assert_eq!(system.transition(l2 + 1), Some(&Transition::RightArc2(label)));
        }
      }
      if let Some(swap) = kind.swap() {
        assert_eq!(system.transition(swap), Some(&Transition::Swap));
      }
    }
  }

  #[test]
  fn out_of_range_is_ignored() {
    let system = TransitionSystem::create("projective", labels()).unwrap();
    let mut t = Tree::from_forms(&["a"]);
    let mut c = Configuration::new(&t);
    assert!(!system.applicable(&c, 99));
    assert_eq!(system.perform(&mut c, &mut t, 99), None);
    assert_eq!(c, Configuration::new(&t));
  }

  #[test]
  fn best_applicable_skips_inapplicable_and_prefers_lowest_index() {
    let system = TransitionSystem::create("projective", labels()).unwrap();
    let t = Tree::from_forms(&["a"]);
    let c = Configuration::new(&t);
    // only shift is applicable in the initial configuration
    assert_eq!(system.best_applicable(&c, &[0.1, 0.3, 0.3, 0.2, 0.1]), Some(0));

    let mut c2 = c.clone();
    c2.stack.push(1);
    // right arcs (2 and 4) are applicable on [root, 1] with empty buffer; tie goes to 2
    c2.buffer.clear();
    assert_eq!(system.best_applicable(&c2, &[0.0, 0.5, 0.25, 0.0, 0.25]), Some(2));
  }

  #[test]
  fn oracle_factory() {
    let projective = TransitionSystem::create("projective", labels()).unwrap();
    assert!(projective.oracle("static").is_some());
    assert!(projective.oracle("dynamic").is_some());
    assert!(projective.oracle("static_eager").is_none());

    let swap = TransitionSystem::create("swap", labels()).unwrap();
    assert!(swap.oracle("static_eager").is_some());
    assert!(swap.oracle("static").is_none());

    let link2 = TransitionSystem::create("link2", labels()).unwrap();
    assert!(link2.oracle("static").is_some());
  }

  mod properties {
    use super::*;
    use proptest::prelude::*;

    /// Performs transitions picked by `choices` among the applicable ones
    /// until the configuration is final or `limit` steps were taken.
    fn run(system: &TransitionSystem, tokens: usize, choices: &[usize], limit: usize) -> (Configuration, Tree, usize) {
      let forms = (0..tokens).map(|i| format!("w{}", i)).collect::<Vec<_>>();
      let mut t = Tree::from_forms(&forms);
      let mut c = Configuration::new(&t);
      let mut steps = 0;
      let mut choices = choices.iter().cycle();
      while !c.is_final() && steps < limit {
        let applicable = (0..system.transition_count()).filter(|&i| system.applicable(&c, i)).collect::<Vec<_>>();
        assert!(!applicable.is_empty(), "stuck in {:?}", c);
        let pick = applicable[choices.next().copied().unwrap_or(0) % applicable.len()];
        let size = c.stack.len() + c.buffer.len();
        system.perform(&mut c, &mut t, pick);
        assert!(c.stack.len() + c.buffer.len() <= size);
        steps += 1;
      }
      (c, t, steps)
    }

    proptest! {
      #[test]
      fn projective_parses_finish_in_two_steps_per_token(
        tokens in 0usize..15,
        choices in prop::collection::vec(0usize..64, 1..40),
      ) {
        let system = TransitionSystem::create("projective", labels()).unwrap();
        let (c, t, steps) = run(&system, tokens, &choices, 4 * tokens + 4);
        prop_assert!(c.is_final());
        prop_assert_eq!(steps, 2 * tokens);
        prop_assert!(t.nodes.iter().skip(1).all(|n| n.head.is_some()));
        prop_assert!(t.is_projective());
      }

      #[test]
      fn no_transition_grows_the_configuration(
        system in prop::sample::select(vec!["projective", "swap", "link2"]),
        tokens in 0usize..10,
        choices in prop::collection::vec(0usize..64, 1..40),
      ) {
        let system = TransitionSystem::create(system, labels()).unwrap();
        let (c, t, _) = run(&system, tokens, &choices, 200);
        if c.is_final() {
          prop_assert!(t.nodes.iter().skip(1).all(|n| n.head.is_some()));
        }
      }
    }
  }
}
