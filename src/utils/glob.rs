//! Glob patterns over dotted names.
//!
//! Policy rules name builtins (`print`, `is*`) and attributes qualified by
//! the owning type (`str.format`, `Response.*`). Patterns are translated
//! into anchored regular expressions once, when the policy is loaded.
//!
//! Supported glob syntax:
//! - `*` - Any run of characters within one dotted segment
//! - `**` - Any run of characters, crossing `.` separators
//! - `?` - Exactly one character other than `.`
//! - `[...]` - Character class (passed through to regex)
//! - Everything else is literal
//!
//! # Examples
//!
//! ```
//! use scriptbox::utils::glob::glob_to_regex;
//!
//! # fn main() -> anyhow::Result<()> {
//! let re = glob_to_regex("str.*")?;
//! assert!(re.is_match("str.format"));
//! assert!(!re.is_match("str"));
//!
//! let re = glob_to_regex("*.format")?;
//! assert!(re.is_match("str.format"));
//! assert!(!re.is_match("a.b.format"));
//!
//! let re = glob_to_regex("**.secret")?;
//! assert!(re.is_match("a.b.secret"));
//! # Ok(())
//! # }
//! ```

use anyhow::{anyhow, Result};
use regex::Regex;

/// Segment separator for qualified names.
const SEPARATOR: char = '.';

/// Converts a glob pattern to a compiled, anchored regular expression.
///
/// # Arguments
///
/// * `glob` - A glob pattern such as `str.format*`
///
/// # Errors
///
/// Fails on an unclosed character class or if the resulting regex does not
/// compile.
pub fn glob_to_regex(glob: &str) -> Result<Regex> {
    let regex_str = glob_to_regex_string(glob)?;
    Regex::new(&regex_str).map_err(|e| anyhow!("Failed to compile glob pattern '{}': {}", glob, e))
}

/// Builds the regex source for `glob`, anchored with `^` and `$`.
fn glob_to_regex_string(glob: &str) -> Result<String> {
    let segment_char = format!("[^{}]", regex::escape(&SEPARATOR.to_string()));
    let mut regex = String::from("^");
    let chars: Vec<char> = glob.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            '*' if chars.get(i + 1) == Some(&'*') => {
                regex.push_str(".*");
                i += 2;
            }
            '*' => {
                regex.push_str(&segment_char);
                regex.push('*');
                i += 1;
            }
            '?' => {
                regex.push_str(&segment_char);
                i += 1;
            }
            '[' => {
                let Some(offset) = chars[i..].iter().position(|&c| c == ']') else {
                    return Err(anyhow!(
                        "Unclosed character class '[' at position {} in glob pattern: {}",
                        i,
                        glob
                    ));
                };
                regex.extend(&chars[i..=i + offset]);
                i += offset + 1;
            }
            other => {
                regex.push_str(&regex::escape(&other.to_string()));
                i += 1;
            }
        }
    }

    regex.push('$');
    Ok(regex)
}

/// Compiles `glob` and tests a single `name` against it.
///
/// For repeated matching, compile once with [`glob_to_regex`].
///
/// # Examples
///
/// ```
/// use scriptbox::utils::glob::matches_glob;
///
/// assert!(matches_glob("is*", "isdigit").unwrap_or(false));
/// assert!(!matches_glob("is*", "print").unwrap_or(false));
/// ```
pub fn matches_glob(glob: &str, name: &str) -> Result<bool> {
    Ok(glob_to_regex(glob)?.is_match(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_pattern() -> Result<()> {
        let re = glob_to_regex("print")?;
        assert!(re.is_match("print"));
        assert!(!re.is_match("sprint"));
        assert!(!re.is_match("printer"));
        Ok(())
    }

    #[test]
    fn test_dot_is_literal() -> Result<()> {
        let re = glob_to_regex("str.format")?;
        assert!(re.is_match("str.format"));
        assert!(!re.is_match("strXformat"));
        Ok(())
    }

    #[test]
    fn test_single_asterisk_stays_in_segment() -> Result<()> {
        let re = glob_to_regex("str.*")?;
        assert!(re.is_match("str.upper"));
        assert!(re.is_match("str."));
        assert!(!re.is_match("str.a.b"));
        assert!(!re.is_match("bytes.upper"));
        Ok(())
    }

    #[test]
    fn test_double_asterisk_crosses_segments() -> Result<()> {
        let re = glob_to_regex("**format*")?;
        assert!(re.is_match("format"));
        assert!(re.is_match("str.format"));
        assert!(re.is_match("str.format_map"));
        assert!(!re.is_match("str.upper"));
        Ok(())
    }

    #[test]
    fn test_question_mark() -> Result<()> {
        let re = glob_to_regex("ma?")?;
        assert!(re.is_match("map"));
        assert!(re.is_match("max"));
        assert!(!re.is_match("ma"));
        assert!(!re.is_match("ma."));
        Ok(())
    }

    #[test]
    fn test_character_class() -> Result<()> {
        let re = glob_to_regex("[mn]*")?;
        assert!(re.is_match("map"));
        assert!(re.is_match("min"));
        assert!(!re.is_match("sum"));
        Ok(())
    }

    #[test]
    fn test_unclosed_character_class() {
        let result = glob_to_regex_string("is[abc");
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Unclosed character class"));
    }

    #[test]
    fn test_empty_pattern() -> Result<()> {
        let re = glob_to_regex("")?;
        assert!(re.is_match(""));
        assert!(!re.is_match("len"));
        Ok(())
    }

    #[test]
    fn test_matches_glob_convenience() -> Result<()> {
        assert!(matches_glob("*", "len")?);
        assert!(!matches_glob("*", "str.format")?);
        assert!(matches_glob("**", "str.format")?);
        Ok(())
    }
}
