use std::error::Error;
use std::fmt::Display;
use std::str::FromStr;

/// Boxed static error type
pub type Err = Box<dyn Error + 'static>;

/// helper macro for initializing a regex with lazy_static!
macro_rules! regex_static {
  ($name:ident, $pattern:expr) => {
    lazy_static! {
      static ref $name: regex::Regex = regex::Regex::new($pattern).unwrap();
    }
  };
}

/// Parses `s` as a `T`, naming `what` was being parsed in the error.
///
/// ```
/// let dim: usize = nndep::utils::parse_number("50", "embedding dimension").unwrap();
/// assert_eq!(dim, 50);
/// assert!(nndep::utils::parse_number::<usize>("fifty", "embedding dimension").is_err());
/// ```
pub fn parse_number<T>(s: &str, what: &str) -> Result<T, Err>
where
  T: FromStr,
  T::Err: Display,
{
  s.trim()
    .parse::<T>()
    .map_err(|e| format!("cannot parse {} '{}': {}", what, s, e).into())
}

/// Iterates over the meaningful lines of a line-oriented description:
/// blank lines and lines starting with `#` are skipped.
pub fn description_lines(description: &str) -> impl Iterator<Item = &str> {
  description
    .lines()
    .map(|line| line.trim_end_matches('\r'))
    .filter(|line| !line.trim().is_empty() && !line.starts_with('#'))
}
