use std::env;
use std::fs;
use std::io::{self, BufReader, Write};
use std::process;

use tracing::info;
use tracing_subscriber::EnvFilter;

use nndep::accuracy;
use nndep::conllu::parse_trees;
use nndep::embedding::Word2Vec;
use nndep::value_extractor::ValueExtractor;
use nndep::{Err, Parser, TrainerConfig};

fn usage(prog_name: &str) -> String {
  format!(
    r"Usage:
  {0} train [options] TRAIN_FILE MODEL_FILE
  {0} parse [--beam N] MODEL_FILE [INPUT_FILE]
  {0} accuracy [--beam N] MODEL_FILE GOLD_FILE
  {0} embeddings extract MODEL_FILE VALUE OUTPUT_FILE
  {0} embeddings replace MODEL_FILE VALUE WORD2VEC_FILE OUTPUT_MODEL_FILE

Training options:
  --system NAME         Transition system: projective, swap or link2 (default projective)
  --oracle NAME         Transition oracle (default dynamic)
  --embeddings FILE     Embeddings description, one value per line
  --nodes FILE          Node selectors, one per line
  --heldout FILE        Heldout CoNLL-U data evaluated after every iteration
  --threads N           Training threads (default 1)
  --seed N              Random seed (default 42)
  -o, --option KEY=VAL  Network parameter, e.g. hidden_layer=200 or optimizer=adagrad

Parse options:
  --beam N              Beam size, 1 for greedy decoding (default 1)

Other:
  -h, --help            Print this message

Logging is configured with RUST_LOG and defaults to info.",
    prog_name
  )
}

enum Command {
  Train {
    config: TrainerConfig,
    train_file: String,
    heldout_file: Option<String>,
    model_file: String,
  },
  Parse {
    beam: usize,
    model_file: String,
    input_file: Option<String>,
  },
  Accuracy {
    beam: usize,
    model_file: String,
    gold_file: String,
  },
  ExtractEmbedding {
    model_file: String,
    value: ValueExtractor,
    output_file: String,
  },
  ReplaceEmbedding {
    model_file: String,
    value: ValueExtractor,
    word2vec_file: String,
    output_file: String,
  },
}

struct Args {
  command: Command,
}

impl Args {
  fn make_error_message(msg: &str, prog_name: impl AsRef<str>) -> String {
    format!("argument error: {}.\n\n{}", msg, usage(prog_name.as_ref()))
  }

  fn parse(v: Vec<String>) -> Result<Self, String> {
    let mut iter = v.into_iter();
    let Some(prog_name) = iter.next() else {
      return Err(Self::make_error_message("bad argument vector", "nndep"));
    };
    let error = |msg: &str| Self::make_error_message(msg, &prog_name);

    let mut positional = Vec::new();
    let mut config = TrainerConfig::default();
    let mut embeddings_file = None;
    let mut nodes_file = None;
    let mut heldout_file = None;
    let mut beam = 1;

    while let Some(o) = iter.next() {
      if o == "-h" || o == "--help" {
        println!("{}", usage(&prog_name));
        process::exit(0);
      }
      if !o.starts_with('-') {
        positional.push(o);
        continue;
      }

      let value = iter.next().ok_or_else(|| error(&format!("option {} needs a value", o)))?;
      let number = |what: &str, value: &str| {
        value
          .parse::<usize>()
          .map_err(|_| error(&format!("{} '{}' is not a number", what, value)))
      };
      match o.as_str() {
        "--system" => config.transition_system = value,
        "--oracle" => config.transition_oracle = value,
        "--embeddings" => embeddings_file = Some(value),
        "--nodes" => nodes_file = Some(value),
        "--heldout" => heldout_file = Some(value),
        "--threads" => config.threads = number("thread count", &value)?,
        "--seed" => config.seed = number("seed", &value)? as u64,
        "--beam" => beam = number("beam size", &value)?,
        "-o" | "--option" => config
          .parameters
          .set_option(&value)
          .map_err(|e| error(&e.to_string()))?,
        _ => return Err(error(&format!("unknown option {}", o))),
      }
    }

    let mut positional = positional.into_iter();
    let command = match (positional.next().as_deref(), positional.as_slice()) {
      (Some("train"), [train_file, model_file]) => {
        let read = |file: Option<String>, what: &str| {
          let file = file.ok_or_else(|| error(&format!("training needs --{}", what)))?;
          fs::read_to_string(&file).map_err(|e| error(&format!("cannot read {} file '{}': {}", what, file, e)))
        };
        config.embeddings = read(embeddings_file, "embeddings")?;
        config.nodes = read(nodes_file, "nodes")?;
        Command::Train {
          config,
          train_file: train_file.clone(),
          heldout_file,
          model_file: model_file.clone(),
        }
      }
      (Some("parse"), [model_file]) => Command::Parse {
        beam,
        model_file: model_file.clone(),
        input_file: None,
      },
      (Some("parse"), [model_file, input_file]) => Command::Parse {
        beam,
        model_file: model_file.clone(),
        input_file: Some(input_file.clone()),
      },
      (Some("accuracy"), [model_file, gold_file]) => Command::Accuracy {
        beam,
        model_file: model_file.clone(),
        gold_file: gold_file.clone(),
      },
      (Some("embeddings"), [action, model_file, value, rest @ ..]) => {
        let value: ValueExtractor = value.parse().map_err(|e: Err| error(&e.to_string()))?;
        match (action.as_str(), rest) {
          ("extract", [output_file]) => Command::ExtractEmbedding {
            model_file: model_file.clone(),
            value,
            output_file: output_file.clone(),
          },
          ("replace", [word2vec_file, output_file]) => Command::ReplaceEmbedding {
            model_file: model_file.clone(),
            value,
            word2vec_file: word2vec_file.clone(),
            output_file: output_file.clone(),
          },
          _ => return Err(error("expected 'embeddings extract' or 'embeddings replace' with their files")),
        }
      }
      (Some(command), _) => return Err(error(&format!("unknown command or wrong arguments for '{}'", command))),
      (None, _) => return Err(error("missing command")),
    };

    Ok(Self { command })
  }
}

fn read_trees(file: &str) -> Result<Vec<nndep::Tree>, Err> {
  let text = fs::read_to_string(file).map_err(|e| format!("cannot read '{}': {}", file, e))?;
  parse_trees(&text).map_err(|e| format!("cannot load '{}': {}", file, e).into())
}

fn load_parser(file: &str) -> Result<Parser, Err> {
  Parser::load_file(file).map_err(|e| format!("cannot load model '{}': {}", file, e).into())
}

fn embedding_position(parser: &nndep::ParserNn, value: ValueExtractor) -> Result<usize, Err> {
  parser
    .values()
    .iter()
    .position(|&v| v == value)
    .ok_or_else(|| format!("the model has no '{}' embedding", value).into())
}

fn run(command: Command) -> Result<(), Err> {
  match command {
    Command::Train {
      config,
      train_file,
      heldout_file,
      model_file,
    } => {
      let train = read_trees(&train_file)?;
      let heldout = match heldout_file {
        Some(file) => read_trees(&file)?,
        None => Vec::new(),
      };
      info!(train = train.len(), heldout = heldout.len(), "loaded data");
      let parser = Parser::from(nndep::train(&config, &train, &heldout)?);
      parser.save_file(&model_file)?;
      info!(model = %model_file, "saved model");
    }
    Command::Parse {
      beam,
      model_file,
      input_file,
    } => {
      let parser = load_parser(&model_file)?;
      let output = match input_file {
        Some(file) => parser.parse_conllu(BufReader::new(fs::File::open(&file)?), beam)?,
        None => parser.parse_conllu(io::stdin().lock(), beam)?,
      };
      io::stdout().write_all(output.as_bytes())?;
    }
    Command::Accuracy {
      beam,
      model_file,
      gold_file,
    } => {
      let parser = load_parser(&model_file)?;
      let gold = read_trees(&gold_file)?;
      let evaluation = accuracy::evaluate(&gold, |t| parser.parse_with_beam(t, beam));
      println!(
        "Parsing accuracy: UAS {:.2}%, LAS {:.2}%",
        evaluation.all.uas(),
        evaluation.all.las()
      );
      println!(
        "Without punctuation: UAS {:.2}%, LAS {:.2}%",
        evaluation.without_punctuation.uas(),
        evaluation.without_punctuation.las()
      );
    }
    Command::ExtractEmbedding {
      model_file,
      value,
      output_file,
    } => {
      let Parser::Nn(parser) = load_parser(&model_file)?;
      let position = embedding_position(&parser, value)?;
      fs::write(&output_file, parser.embeddings()[position].export_word2vec())?;
      info!(value = %value, output = %output_file, "exported embedding");
    }
    Command::ReplaceEmbedding {
      model_file,
      value,
      word2vec_file,
      output_file,
    } => {
      let Parser::Nn(mut parser) = load_parser(&model_file)?;
      let position = embedding_position(&parser, value)?;
      let vectors = Word2Vec::read(BufReader::new(fs::File::open(&word2vec_file)?))?;
      parser.embeddings_mut()[position].replace_words(vectors)?;
      Parser::from(parser).save_file(&output_file)?;
      info!(value = %value, output = %output_file, "replaced embedding");
    }
  }
  Ok(())
}

fn main() -> Result<(), Err> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .with_writer(io::stderr)
    .init();

  let opts = match Args::parse(env::args().collect()) {
    Ok(opts) => opts,
    Err(msg) => {
      eprintln!("{}", msg);
      process::exit(255);
    }
  };

  run(opts.command)
}
