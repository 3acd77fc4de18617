//! Training oracles: given a gold tree and the current configuration they
//! name the transition to learn and the transition to execute.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::configuration::Configuration;
use crate::transition::Transition;
use crate::transition_system::{TransitionSystem, TransitionSystemKind};
use crate::tree::Tree;

/// Result of an oracle query. `best` is the training target, `to_follow` the
/// transition actually performed next. They differ only while exploring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PredictedTransition {
  pub best: usize,
  pub to_follow: usize,
}

impl PredictedTransition {
  pub fn new(best: usize, to_follow: usize) -> Self {
    Self { best, to_follow }
  }

  pub fn same(transition: usize) -> Self {
    Self::new(transition, transition)
  }
}

/// Picks the transition to train on once the dynamic oracle starts exploring.
///
/// `zero_cost` lists every transition that keeps the best reachable tree
/// unchanged, `static_choice` is what the static oracle would do and
/// `network_outcome` is the network's greedy pick.
pub trait ExplorationStrategy: Send + Sync + fmt::Debug {
  fn select(
    &self,
    zero_cost: &[usize],
    static_choice: PredictedTransition,
    network_outcome: usize,
    iteration: usize,
  ) -> PredictedTransition;
}

/// Follows the network whenever its pick is gold-consistent, otherwise the
/// static oracle.
#[derive(Debug, Default, Clone, Copy)]
pub struct FollowConsistentPrediction;

impl ExplorationStrategy for FollowConsistentPrediction {
  fn select(
    &self,
    zero_cost: &[usize],
    static_choice: PredictedTransition,
    network_outcome: usize,
    _iteration: usize,
  ) -> PredictedTransition {
    if zero_cost.contains(&network_outcome) {
      PredictedTransition::same(network_outcome)
    } else {
      static_choice
    }
  }
}

/// Never explores. Turns the dynamic oracle back into the static one.
#[derive(Debug, Default, Clone, Copy)]
pub struct StaticOnly;

impl ExplorationStrategy for StaticOnly {
  fn select(&self, _: &[usize], static_choice: PredictedTransition, _: usize, _: usize) -> PredictedTransition {
    static_choice
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OracleKind {
  ProjectiveStatic,
  ProjectiveDynamic,
  SwapStaticEager,
  Link2Static,
}

impl OracleKind {
  pub fn name(self) -> &'static str {
    match self {
      Self::ProjectiveStatic | Self::Link2Static => "static",
      Self::ProjectiveDynamic => "dynamic",
      Self::SwapStaticEager => "static_eager",
    }
  }
}

/// An oracle bound to one transition system and its label vocabulary.
#[derive(Debug, Clone)]
pub struct TransitionOracle {
  kind: OracleKind,
  system: TransitionSystemKind,
  labels: HashMap<String, usize>,
  exploration: Arc<dyn ExplorationStrategy>,
}

impl TransitionOracle {
  pub(crate) fn new(kind: OracleKind, system: &TransitionSystem) -> Self {
    let labels = system.labels().iter().enumerate().map(|(i, l)| (l.clone(), i)).collect();
    Self {
      kind,
      system: system.kind(),
      labels,
      exploration: Arc::new(FollowConsistentPrediction),
    }
  }

  /// Replaces the exploration policy used by the dynamic oracle.
  pub fn with_exploration(mut self, exploration: Arc<dyn ExplorationStrategy>) -> Self {
    self.exploration = exploration;
    self
  }

  pub fn kind(&self) -> OracleKind {
    self.kind
  }

  pub fn name(&self) -> &'static str {
    self.kind.name()
  }

  /// Prepares the oracle for one gold tree.
  pub fn create_tree_oracle<'a>(&'a self, gold: &'a Tree) -> TreeOracle<'a> {
    let projective_order = if self.kind == OracleKind::SwapStaticEager {
      projective_order(gold)
    } else {
      Vec::new()
    };
    TreeOracle {
      oracle: self,
      gold,
      projective_order,
    }
  }
}

/// Position of every node in the in-order traversal of `gold`, which is the
/// word order under which the tree would be projective.
fn projective_order(gold: &Tree) -> Vec<usize> {
  fn visit(gold: &Tree, node: usize, order: &mut Vec<usize>, next: &mut usize) {
    let children = &gold.nodes[node].children;
    let split = children.partition_point(|&c| c < node);
    for &child in &children[..split] {
      visit(gold, child, order, next);
    }
    order[node] = *next;
    *next += 1;
    for &child in &children[split..] {
      visit(gold, child, order, next);
    }
  }

  let mut order = vec![usize::MAX; gold.len()];
  let mut next = 0;
  visit(gold, 0, &mut order, &mut next);
  // unreachable nodes (broken gold trees) keep their surface position
  for (id, position) in order.iter_mut().enumerate() {
    if *position == usize::MAX {
      *position = next + id;
    }
  }
  order
}

/// Oracle state for a single gold tree.
pub struct TreeOracle<'a> {
  oracle: &'a TransitionOracle,
  gold: &'a Tree,
  projective_order: Vec<usize>,
}

impl TreeOracle<'_> {
  /// Decides the transition to learn and the transition to perform in `c`,
  /// where `t` is the tree built so far.
  pub fn predict(&self, c: &Configuration, t: &Tree, network_outcome: usize, iteration: usize) -> PredictedTransition {
    match self.oracle.kind {
      OracleKind::ProjectiveStatic => self.projective_static(c, t),
      OracleKind::ProjectiveDynamic => {
        let static_choice = self.projective_static(c, t);
        if iteration <= 1 {
          return static_choice;
        }
        let zero_cost = self.zero_cost_transitions(c, t);
        self.oracle.exploration.select(&zero_cost, static_choice, network_outcome, iteration)
      }
      OracleKind::SwapStaticEager => self.swap_static_eager(c, t),
      OracleKind::Link2Static => self.link2_static(c, t),
    }
  }

  /// Every projective transition that does not lose a reachable gold arc.
  pub fn zero_cost_transitions(&self, c: &Configuration, t: &Tree) -> Vec<usize> {
    let system = self.oracle.system;
    let mut result = Vec::new();
    let mut left_ready = false;
    let mut right_ready = false;

    if let (Some(s0), Some(s1)) = (c.stack_top(0), c.stack_top(1)) {
      if s1 != 0 && self.gold_head(s1) == Some(s0) && self.children_complete(s1, t) {
        if let Some(label) = self.label(s1) {
          left_ready = true;
          result.push(system.left_arc(label));
        }
      }
      if self.gold_head(s0) == Some(s1) && self.children_complete(s0, t) {
        if let Some(label) = self.label(s0) {
          right_ready = true;
          result.push(system.right_arc(label));
        }
      }
    }

    if !c.buffer.is_empty() && !right_ready {
      let s0_waits = c.stack_top(0).is_some_and(|s0| self.pending_in_buffer(s0, c));
      if !left_ready || s0_waits {
        result.push(system.shift());
      }
    }
    result
  }

  fn projective_static(&self, c: &Configuration, t: &Tree) -> PredictedTransition {
    let system = self.oracle.system;
    if let (Some(s0), Some(s1)) = (c.stack_top(0), c.stack_top(1)) {
      if let Some(label) = self.left_arc_label(s0, s1, t) {
        return PredictedTransition::same(system.left_arc(label));
      }
      // the top may only be reduced once none of its gold dependents are left to shift
      if self.gold_head(s0) == Some(s1) && !self.pending_in_buffer(s0, c) {
        if let Some(label) = self.label(s0) {
          return PredictedTransition::same(system.right_arc(label));
        }
      }
      if c.buffer.is_empty() {
        return PredictedTransition::same(system.right_arc(self.label(s0).unwrap_or(0)));
      }
    }
    PredictedTransition::same(system.shift())
  }

  fn swap_static_eager(&self, c: &Configuration, t: &Tree) -> PredictedTransition {
    let system = self.oracle.system;
    if let (Some(s0), Some(s1)) = (c.stack_top(0), c.stack_top(1)) {
      if let Some(label) = self.left_arc_label(s0, s1, t) {
        return PredictedTransition::same(system.left_arc(label));
      }
      if let Some(label) = self.right_arc_label(s0, s1, t) {
        return PredictedTransition::same(system.right_arc(label));
      }
      if let Some(swap) = system.swap() {
        if self.projective_order[s0] < self.projective_order[s1] && Transition::Swap.applicable(c) {
          return PredictedTransition::same(swap);
        }
      }
      if c.buffer.is_empty() {
        return PredictedTransition::same(system.right_arc(self.label(s0).unwrap_or(0)));
      }
    }
    PredictedTransition::same(system.shift())
  }

  fn link2_static(&self, c: &Configuration, t: &Tree) -> PredictedTransition {
    let system = self.oracle.system;
    if let (Some(s0), Some(s1)) = (c.stack_top(0), c.stack_top(1)) {
      if let Some(label) = self.left_arc_label(s0, s1, t) {
        return PredictedTransition::same(system.left_arc(label));
      }
      if let Some(label) = self.right_arc_label(s0, s1, t) {
        return PredictedTransition::same(system.right_arc(label));
      }
      if let Some(s2) = c.stack_top(2) {
        if let Some(label) = self.left_arc_label(s0, s2, t) {
          if let Some(transition) = system.left_arc_2(label) {
            return PredictedTransition::same(transition);
          }
        }
        if let Some(label) = self.right_arc_label(s0, s2, t) {
          if let Some(transition) = system.right_arc_2(label) {
            return PredictedTransition::same(transition);
          }
        }
      }
      if c.buffer.is_empty() {
        return PredictedTransition::same(system.right_arc(self.label(s0).unwrap_or(0)));
      }
    }
    PredictedTransition::same(system.shift())
  }

  /// Label for attaching `dependent` to `head` by a left arc, if the gold tree
  /// has that arc and the dependent already has all its gold children.
  fn left_arc_label(&self, head: usize, dependent: usize, t: &Tree) -> Option<usize> {
    if dependent != 0 && self.gold_head(dependent) == Some(head) && self.children_complete(dependent, t) {
      self.label(dependent)
    } else {
      None
    }
  }

  /// Label for attaching `dependent` to `head` by a right arc.
  fn right_arc_label(&self, dependent: usize, head: usize, t: &Tree) -> Option<usize> {
    if self.gold_head(dependent) == Some(head) && self.children_complete(dependent, t) {
      self.label(dependent)
    } else {
      None
    }
  }

  fn gold_head(&self, node: usize) -> Option<usize> {
    self.gold.nodes.get(node).and_then(|n| n.head)
  }

  fn label(&self, node: usize) -> Option<usize> {
    self.oracle.labels.get(&self.gold.nodes.get(node)?.deprel).copied()
  }

  fn children_complete(&self, node: usize, t: &Tree) -> bool {
    t.nodes[node].children.len() == self.gold.nodes[node].children.len()
  }

  fn pending_in_buffer(&self, node: usize, c: &Configuration) -> bool {
    self.gold.nodes[node].children.iter().any(|child| c.buffer.contains(child))
  }
}
