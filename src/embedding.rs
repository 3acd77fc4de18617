//! Embedding tables mapping node values to dense vectors.

use std::collections::HashMap;
use std::io::BufRead;

use crate::binary::{BinaryDecoder, BinaryEncoder, ModelError};
use crate::network::WeightCell;
use crate::utils::parse_number;
use crate::Err;

/// Name of the unknown-word row in word2vec exports.
pub const UNKNOWN_WORD: &str = "<unk>";

fn is_titlecase(c: char) -> bool {
  matches!(
    c,
    '\u{01C5}'
      | '\u{01C8}'
      | '\u{01CB}'
      | '\u{01F2}'
      | '\u{1F88}'..='\u{1F8F}'
      | '\u{1F98}'..='\u{1F9F}'
      | '\u{1FA8}'..='\u{1FAF}'
      | '\u{1FBC}'
      | '\u{1FCC}'
      | '\u{1FFC}'
  )
}

fn is_upper_or_title(c: char) -> bool {
  c.is_uppercase() || is_titlecase(c)
}

/// A dictionary plus one row of `dimension` weights per word. An optional
/// unknown-word row follows the dictionary rows. Rows from `updatable_index`
/// on are changed by training; earlier rows stay frozen.
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding<W = f32> {
  dimension: usize,
  updatable_index: usize,
  unknown_index: Option<usize>,
  words: Vec<String>,
  dictionary: HashMap<String, usize>,
  weights: Vec<W>,
}

impl<W: WeightCell> Embedding<W> {
  pub fn dimension(&self) -> usize {
    self.dimension
  }

  /// Number of rows, including the unknown-word row.
  pub fn rows(&self) -> usize {
    self.words.len() + self.unknown_index.map_or(0, |_| 1)
  }

  pub fn words(&self) -> &[String] {
    &self.words
  }

  pub fn unknown_index(&self) -> Option<usize> {
    self.unknown_index
  }

  pub fn updatable_index(&self) -> usize {
    self.updatable_index
  }

  pub fn is_updatable(&self, id: usize) -> bool {
    id >= self.updatable_index && id < self.rows()
  }

  /// Finds the row for `word`, trying case and digit normalisations before
  /// falling back to the unknown-word row:
  ///
  /// 1. the word itself,
  /// 2. with a capitalised first letter and mixed case after it, everything
  ///    but the first letter lowercased (`"McDONALD"` -> `"Mcdonald"`),
  /// 3. fully lowercased,
  /// 4. for numbers, just the first digit (`"1984"` -> `"1"`). A trailing
  ///    letter suffix is allowed (`"1990s"`, `"2nd"`), other letters are not.
  pub fn lookup_word(&self, word: &str) -> Option<usize> {
    if let Some(&id) = self.dictionary.get(word) {
      return Some(id);
    }

    let mut chars = word.chars();
    if let Some(first) = chars.next() {
      let rest = chars.as_str();
      let first_upper = is_upper_or_title(first);
      let rest_upper = rest.chars().any(is_upper_or_title);
      let rest_lower = rest.chars().any(char::is_lowercase);

      if first_upper && rest_upper && rest_lower {
        let mut candidate = String::with_capacity(word.len());
        candidate.push(first);
        candidate.push_str(&rest.to_lowercase());
        if let Some(&id) = self.dictionary.get(&candidate) {
          return Some(id);
        }
      }

      if first_upper || rest_upper {
        if let Some(&id) = self.dictionary.get(&word.to_lowercase()) {
          return Some(id);
        }
      }

      let number = rest.trim_end_matches(char::is_alphabetic);
      if first.is_numeric() && !number.chars().any(char::is_alphabetic) {
        let mut buf = [0; 4];
        if let Some(&id) = self.dictionary.get(&*first.encode_utf8(&mut buf)) {
          return Some(id);
        }
      }
    }

    self.unknown_index
  }

  /// Weights of row `id`, or `None` for ids past the table.
  pub fn weight(&self, id: usize) -> Option<&[W]> {
    let start = id.checked_mul(self.dimension)?;
    let end = start.checked_add(self.dimension)?;
    self.weights.get(start..end)
  }

  /// Copies the table into another weight representation.
  pub fn convert<V: WeightCell>(&self) -> Embedding<V> {
    Embedding {
      dimension: self.dimension,
      updatable_index: self.updatable_index,
      unknown_index: self.unknown_index,
      words: self.words.clone(),
      dictionary: self.dictionary.clone(),
      weights: self.weights.iter().map(|w| V::new(w.get())).collect(),
    }
  }
}

impl Embedding<f32> {
  /// Builds a table from `(word, weights)` pairs in row order, followed by
  /// the unknown-word row if one is given.
  pub fn create(
    dimension: usize,
    updatable_index: usize,
    words: Vec<(String, Vec<f32>)>,
    unknown: Option<Vec<f32>>,
  ) -> Result<Self, Err> {
    if dimension == 0 {
      return Err("embedding dimension must be positive".into());
    }

    let mut embedding = Self {
      dimension,
      updatable_index,
      unknown_index: None,
      words: Vec::with_capacity(words.len()),
      dictionary: HashMap::with_capacity(words.len()),
      weights: Vec::with_capacity((words.len() + 1) * dimension),
    };
    for (word, weights) in words {
      if weights.len() != dimension {
        return Err(format!("word '{}' has {} weights instead of {}", word, weights.len(), dimension).into());
      }
      if embedding.dictionary.insert(word.clone(), embedding.words.len()).is_some() {
        return Err(format!("word '{}' appears twice in the embedding", word).into());
      }
      embedding.words.push(word);
      embedding.weights.extend(weights);
    }
    if let Some(weights) = unknown {
      if weights.len() != dimension {
        return Err(format!("unknown word has {} weights instead of {}", weights.len(), dimension).into());
      }
      embedding.unknown_index = Some(embedding.words.len());
      embedding.weights.extend(weights);
    }
    if embedding.updatable_index > embedding.rows() {
      return Err(format!("updatable index {} is past the {} rows", updatable_index, embedding.rows()).into());
    }
    Ok(embedding)
  }

  pub fn save(&self, enc: &mut BinaryEncoder) {
    enc.add_u32(self.dimension as u32);
    enc.add_u32(self.words.len() as u32);
    for word in &self.words {
      enc.add_str(word);
    }
    enc.add_u8(self.unknown_index.is_some() as u8);
    enc.add_u32(self.updatable_index as u32);
    enc.add_f32s(&self.weights);
  }

  pub fn load(dec: &mut BinaryDecoder) -> Result<Self, ModelError> {
    let dimension = dec.next_u32()? as usize;
    if dimension == 0 {
      return Err(ModelError::malformed("embedding of dimension 0"));
    }
    let count = dec.next_u32()? as usize;
    // every word takes at least one byte, which bounds the allocation
    if count > dec.remaining() {
      return Err(ModelError::malformed(format!("embedding claims {} words", count)));
    }

    let mut words = Vec::with_capacity(count);
    let mut dictionary = HashMap::with_capacity(count);
    for id in 0..count {
      let word = dec.next_str()?;
      if dictionary.insert(word.clone(), id).is_some() {
        return Err(ModelError::malformed(format!("word '{}' appears twice in the embedding", word)));
      }
      words.push(word);
    }

    let unknown_index = match dec.next_u8()? {
      0 => None,
      1 => Some(count),
      flag => return Err(ModelError::malformed(format!("invalid unknown word flag {}", flag))),
    };
    let rows = count + unknown_index.map_or(0, |_| 1);
    let updatable_index = dec.next_u32()? as usize;
    if updatable_index > rows {
      return Err(ModelError::malformed(format!("updatable index {} is past the {} rows", updatable_index, rows)));
    }
    let size = rows
      .checked_mul(dimension)
      .ok_or_else(|| ModelError::malformed("embedding size overflows"))?;
    let weights = dec.next_f32s(size)?;

    Ok(Self {
      dimension,
      updatable_index,
      unknown_index,
      words,
      dictionary,
      weights,
    })
  }

  /// Writes the table in word2vec text format. The unknown-word row, if any,
  /// comes last as [`UNKNOWN_WORD`].
  pub fn export_word2vec(&self) -> String {
    let mut out = format!("{} {}\n", self.rows(), self.dimension);
    let names = self.words.iter().map(String::as_str).chain(self.unknown_index.map(|_| UNKNOWN_WORD));
    for (id, name) in names.enumerate() {
      out.push_str(name);
      for w in self.weight(id).unwrap_or_default() {
        out.push(' ');
        out.push_str(&w.to_string());
      }
      out.push('\n');
    }
    out
  }

  /// Replaces the dictionary and its rows with `vectors`. The unknown-word
  /// row is kept, and a table that trained all rows keeps doing so.
  pub fn replace_words(&mut self, vectors: Word2Vec) -> Result<(), Err> {
    if vectors.dimension != self.dimension {
      return Err(format!("cannot replace embedding of dimension {} with vectors of dimension {}", self.dimension, vectors.dimension).into());
    }
    let unknown = self.unknown_index.and_then(|id| self.weight(id)).map(|w| w.to_vec());
    let words = vectors.words.into_iter().filter(|(word, _)| word != UNKNOWN_WORD).collect::<Vec<_>>();
    let updatable_index = if self.updatable_index == 0 { 0 } else { words.len() };
    *self = Self::create(self.dimension, updatable_index, words, unknown)?;
    Ok(())
  }
}

/// Vectors read from a word2vec text file.
#[derive(Debug, Clone, PartialEq)]
pub struct Word2Vec {
  pub dimension: usize,
  pub words: Vec<(String, Vec<f32>)>,
}

impl Word2Vec {
  /// Reads the `count dimension` header and one `word v1 .. vn` line per
  /// word. Lines with the wrong number of values and repeated words are
  /// skipped with a warning.
  pub fn read<R: BufRead>(reader: R) -> Result<Self, Err> {
    let mut lines = reader.lines();
    let header = lines.next().ok_or("empty word2vec file")??;
    let mut parts = header.split_whitespace();
    let (Some(count), Some(dimension), None) = (parts.next(), parts.next(), parts.next()) else {
      return Err(format!("cannot parse word2vec header '{}'", header).into());
    };
    let count: usize = parse_number(count, "word2vec word count")?;
    let dimension: usize = parse_number(dimension, "word2vec dimension")?;

    let mut seen = std::collections::HashSet::new();
    let mut words = Vec::with_capacity(count.min(1 << 20));
    for (number, line) in lines.enumerate() {
      let line = line?;
      let mut parts = line.split_whitespace();
      let Some(word) = parts.next() else {
        continue;
      };
      let weights = parts.map(|v| parse_number::<f32>(v, "word2vec weight")).collect::<Result<Vec<_>, _>>()?;
      if weights.len() != dimension {
        tracing::warn!(line = number + 2, word, "skipping word2vec line with {} values instead of {}", weights.len(), dimension);
        continue;
      }
      if !seen.insert(word.to_string()) {
        tracing::warn!(line = number + 2, word, "skipping repeated word2vec word");
        continue;
      }
      words.push((word.to_string(), weights));
    }
    if words.len() != count {
      tracing::warn!("word2vec header announced {} words, read {}", count, words.len());
    }
    Ok(Self { dimension, words })
  }
}
