use std::fmt;
use std::str::FromStr;

use crate::network::Activation;
use crate::utils::parse_number;
use crate::Err;

const ADAGRAD_EPSILON: f64 = 1e-8;
const ADADELTA_MOMENTUM: f64 = 0.95;
const ADADELTA_EPSILON: f64 = 1e-6;

/// Weight update rule.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Optimizer {
  #[default]
  Sgd,
  SgdMomentum { momentum: f64 },
  AdaGrad { epsilon: f64 },
  AdaDelta { momentum: f64, epsilon: f64 },
}

impl Optimizer {
  /// Whether the rule keeps per-weight state between updates.
  pub fn needs_state(&self) -> bool {
    !matches!(self, Self::Sgd)
  }
}

impl FromStr for Optimizer {
  type Err = Err;

  /// Parses `sgd`, `sgd_momentum=M`, `adagrad[=EPS]` or `adadelta[=M,EPS]`.
  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let (name, args) = match s.split_once('=') {
      Some((name, args)) => (name, Some(args)),
      None => (s, None),
    };
    let args = args
      .map(|args| args.split(',').map(|a| parse_number::<f64>(a, "optimizer parameter")).collect::<Result<Vec<_>, _>>())
      .transpose()?
      .unwrap_or_default();

    match (name, args.as_slice()) {
      ("sgd", []) => Ok(Self::Sgd),
      ("sgd_momentum", &[momentum]) => Ok(Self::SgdMomentum { momentum }),
      ("adagrad", []) => Ok(Self::AdaGrad {
        epsilon: ADAGRAD_EPSILON,
      }),
      ("adagrad", &[epsilon]) => Ok(Self::AdaGrad { epsilon }),
      ("adadelta", []) => Ok(Self::AdaDelta {
        momentum: ADADELTA_MOMENTUM,
        epsilon: ADADELTA_EPSILON,
      }),
      ("adadelta", &[momentum, epsilon]) => Ok(Self::AdaDelta { momentum, epsilon }),
      _ => Err(format!("cannot parse optimizer '{}'", s).into()),
    }
  }
}

impl fmt::Display for Optimizer {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Sgd => write!(f, "sgd"),
      Self::SgdMomentum { momentum } => write!(f, "sgd_momentum={}", momentum),
      Self::AdaGrad { epsilon } => write!(f, "adagrad={}", epsilon),
      Self::AdaDelta { momentum, epsilon } => write!(f, "adadelta={},{}", momentum, epsilon),
    }
  }
}

/// Network shape and training hyperparameters.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkParameters {
  pub iterations: usize,
  pub direct_connections: bool,
  /// hidden layer size, 0 for none
  pub hidden_layer: usize,
  pub hidden_layer_type: Activation,
  pub optimizer: Optimizer,
  pub learning_rate: f64,
  /// learning rate of the last iteration, 0 to keep `learning_rate` fixed
  pub learning_rate_final: f64,
  pub batch_size: usize,
  pub initialization_range: f64,
  pub l1_regularization: f64,
  pub l2_regularization: f64,
  /// maximum L2 norm of the weights entering one unit, 0 for no limit
  pub maxnorm_regularization: f64,
  /// keep the weights of the iteration with the best heldout LAS
  pub early_stopping: bool,
}

impl Default for NetworkParameters {
  fn default() -> Self {
    Self {
      iterations: 10,
      direct_connections: false,
      hidden_layer: 200,
      hidden_layer_type: Activation::Tanh,
      optimizer: Optimizer::Sgd,
      learning_rate: 0.02,
      learning_rate_final: 0.001,
      batch_size: 1,
      initialization_range: 0.1,
      l1_regularization: 0.0,
      l2_regularization: 0.0,
      maxnorm_regularization: 0.0,
      early_stopping: false,
    }
  }
}

fn parse_bool(value: &str, what: &str) -> Result<bool, Err> {
  match value {
    "1" | "true" | "yes" => Ok(true),
    "0" | "false" | "no" => Ok(false),
    _ => Err(format!("cannot parse {} '{}' as a boolean", what, value).into()),
  }
}

impl NetworkParameters {
  /// Sets the parameter `key` from its textual `value`.
  pub fn set(&mut self, key: &str, value: &str) -> Result<(), Err> {
    match key {
      "iterations" => self.iterations = parse_number(value, key)?,
      "direct_connections" => self.direct_connections = parse_bool(value, key)?,
      "hidden_layer" => self.hidden_layer = parse_number(value, key)?,
      "hidden_layer_type" => self.hidden_layer_type = value.parse()?,
      "optimizer" => self.optimizer = value.parse()?,
      "learning_rate" => self.learning_rate = parse_number(value, key)?,
      "learning_rate_final" => self.learning_rate_final = parse_number(value, key)?,
      "batch_size" => self.batch_size = parse_number(value, key)?,
      "initialization_range" => self.initialization_range = parse_number(value, key)?,
      "l1_regularization" => self.l1_regularization = parse_number(value, key)?,
      "l2_regularization" => self.l2_regularization = parse_number(value, key)?,
      "maxnorm_regularization" => self.maxnorm_regularization = parse_number(value, key)?,
      "early_stopping" => self.early_stopping = parse_bool(value, key)?,
      _ => return Err(format!("unknown network parameter '{}'", key).into()),
    }
    Ok(())
  }

  /// Sets a parameter from a `key=value` option.
  pub fn set_option(&mut self, option: &str) -> Result<(), Err> {
    let (key, value) = option
      .split_once('=')
      .ok_or_else(|| format!("network parameter '{}' is not of the form key=value", option))?;
    self.set(key.trim(), value.trim())
  }

  pub fn validate(&self) -> Result<(), Err> {
    if self.iterations == 0 {
      return Err("the number of iterations must be positive".into());
    }
    if !self.direct_connections && self.hidden_layer == 0 {
      return Err("the network needs direct connections or a hidden layer".into());
    }
    if self.batch_size == 0 {
      return Err("the batch size must be positive".into());
    }
    if !(self.learning_rate > 0.0) {
      return Err(format!("learning rate {} must be positive", self.learning_rate).into());
    }
    if !(self.learning_rate_final >= 0.0) {
      return Err(format!("final learning rate {} must not be negative", self.learning_rate_final).into());
    }
    if !(self.initialization_range > 0.0) {
      return Err(format!("initialization range {} must be positive", self.initialization_range).into());
    }
    for (name, value) in [
      ("l1_regularization", self.l1_regularization),
      ("l2_regularization", self.l2_regularization),
      ("maxnorm_regularization", self.maxnorm_regularization),
    ] {
      if !(value >= 0.0) {
        return Err(format!("{} {} must not be negative", name, value).into());
      }
    }
    match self.optimizer {
      Optimizer::SgdMomentum { momentum } | Optimizer::AdaDelta { momentum, .. } if !(0.0..1.0).contains(&momentum) => {
        Err(format!("momentum {} must be in [0, 1)", momentum).into())
      }
      Optimizer::AdaGrad { epsilon } | Optimizer::AdaDelta { epsilon, .. } if !(epsilon > 0.0) => {
        Err(format!("optimizer epsilon {} must be positive", epsilon).into())
      }
      _ => Ok(()),
    }
  }
}
