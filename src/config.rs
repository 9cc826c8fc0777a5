//! Policy configuration for the script sandbox.
//!
//! A policy narrows what scripts can reach: which safe builtins are bound in
//! the execution scope and which attributes the attribute guard refuses on
//! top of the always-refused `_`-prefixed names. Policies load from JSON
//! files or strings and are validated before use.
//!
//! # Examples
//!
//! ```
//! use scriptbox::config::PolicyConfig;
//!
//! # fn main() -> anyhow::Result<()> {
//! let json = r#"{"builtins": {"blocked": ["print"]}, "attributes": {"blocked": ["Response.raw"]}}"#;
//! let policy = PolicyConfig::from_json_string(json)?;
//! assert!(policy.builtin_permitted("len"));
//! assert!(!policy.builtin_permitted("print"));
//! # Ok(())
//! # }
//! ```

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

use crate::runtime::AttributePolicy;
use crate::utils::glob::{glob_to_regex, matches_glob};

/// Which safe builtins are bound in the execution scope.
///
/// Patterns are globs over builtin names (`print`, `is*`). A builtin is
/// available when it matches an allowed pattern and no blocked pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct BuiltinsConfig {
    /// Builtins made available. Defaults to every safe builtin.
    #[serde(default = "default_allowed_builtins")]
    pub allowed: Vec<String>,

    /// Builtins withheld even if allowed. Blocked takes precedence.
    #[serde(default)]
    pub blocked: Vec<String>,
}

/// Attributes the attribute guard refuses.
///
/// Patterns are matched against the bare attribute name and against the
/// name qualified by the owner's type (`str.format`, `Response.*`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct AttributesConfig {
    /// Attributes refused by the guard. Defaults to `str.format` and
    /// `str.format_map`; a configured list replaces those defaults rather
    /// than adding to them, so list them again to keep them blocked.
    #[serde(default = "default_blocked_attributes")]
    pub blocked: Vec<String>,
}

/// Complete sandbox policy.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PolicyConfig {
    #[serde(default)]
    pub builtins: BuiltinsConfig,

    #[serde(default)]
    pub attributes: AttributesConfig,
}

/// Drops repeated patterns, keeping the first occurrence of each.
fn dedup_patterns(patterns: &mut Vec<String>) {
    let mut seen = HashSet::new();
    patterns.retain(|pattern| seen.insert(pattern.clone()));
}

fn default_allowed_builtins() -> Vec<String> {
    vec!["*".to_string()]
}

// String formatting can walk attributes of its arguments.
fn default_blocked_attributes() -> Vec<String> {
    vec!["str.format".to_string(), "str.format_map".to_string()]
}

impl Default for BuiltinsConfig {
    fn default() -> Self {
        Self {
            allowed: default_allowed_builtins(),
            blocked: vec![],
        }
    }
}

impl Default for AttributesConfig {
    fn default() -> Self {
        Self {
            blocked: default_blocked_attributes(),
        }
    }
}

impl BuiltinsConfig {
    /// Creates a builtins configuration.
    ///
    /// # Arguments
    ///
    /// * `allowed` - Builtins to bind (glob patterns supported)
    /// * `blocked` - Builtins to withhold (glob patterns supported)
    pub fn new(allowed: Vec<String>, blocked: Vec<String>) -> Self {
        Self { allowed, blocked }
    }

    /// Validates every pattern.
    ///
    /// # Errors
    ///
    /// Returns an error if a pattern is empty, contains null bytes or is not
    /// a valid glob.
    pub fn validate(&self) -> Result<()> {
        for pattern in &self.allowed {
            validate_pattern(pattern)
                .with_context(|| format!("Invalid allowed builtin pattern: {}", pattern))?;
        }
        for pattern in &self.blocked {
            validate_pattern(pattern)
                .with_context(|| format!("Invalid blocked builtin pattern: {}", pattern))?;
        }

        if self.allowed.is_empty() {
            tracing::warn!("Builtins config allows nothing; scripts get no safe builtins");
        }

        Ok(())
    }

    /// Checks whether the builtin `name` should be bound.
    ///
    /// Blocked patterns take precedence over allowed ones.
    pub fn is_permitted(&self, name: &str) -> bool {
        if self.blocked.iter().any(|pattern| pattern_matches(pattern, name)) {
            return false;
        }
        self.allowed.iter().any(|pattern| pattern_matches(pattern, name))
    }
}

impl AttributesConfig {
    pub fn new(blocked: Vec<String>) -> Self {
        Self { blocked }
    }

    /// Validates every pattern.
    ///
    /// # Errors
    ///
    /// Returns an error if a pattern is empty, contains null bytes or is not
    /// a valid glob.
    pub fn validate(&self) -> Result<()> {
        for pattern in &self.blocked {
            validate_pattern(pattern)
                .with_context(|| format!("Invalid blocked attribute pattern: {}", pattern))?;
        }
        Ok(())
    }
}

impl PolicyConfig {
    /// Creates a policy from its parts.
    pub fn new(builtins: BuiltinsConfig, attributes: AttributesConfig) -> Self {
        Self {
            builtins,
            attributes,
        }
    }

    /// Loads a policy from a JSON file.
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the JSON policy file
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The file cannot be read
    /// - The file content is not valid JSON
    /// - The JSON does not match the expected schema
    /// - The policy validation fails
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read policy file: {}", path.display()))?;

        Self::from_json_string(&content)
            .with_context(|| format!("Invalid policy file: {}", path.display()))
    }

    /// Loads a policy from a JSON string.
    ///
    /// Missing sections take their defaults: all builtins allowed, and
    /// `str.format`/`str.format_map` blocked.
    ///
    /// # Errors
    ///
    /// Returns an error if the string is not valid JSON, does not match the
    /// schema, or fails validation.
    pub fn from_json_string(json: &str) -> Result<Self> {
        let config: PolicyConfig =
            serde_json::from_str(json).context("Failed to parse JSON policy")?;

        config.validate()?;

        Ok(config)
    }

    /// Converts the policy to pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the policy cannot be serialized.
    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize policy to JSON")
    }

    /// Validates the entire policy.
    ///
    /// # Errors
    ///
    /// Returns an error if any pattern is invalid.
    pub fn validate(&self) -> Result<()> {
        self.builtins.validate()?;
        self.attributes.validate()?;
        Ok(())
    }

    /// Merges another policy into this one.
    ///
    /// Pattern lists from `other` are appended, so the result allows the
    /// union of both and blocks the union of both.
    ///
    /// # Arguments
    ///
    /// * `other` - The policy to merge
    pub fn merge(&mut self, other: PolicyConfig) -> Result<()> {
        self.builtins.allowed.extend(other.builtins.allowed);
        self.builtins.blocked.extend(other.builtins.blocked);
        self.attributes.blocked.extend(other.attributes.blocked);

        dedup_patterns(&mut self.builtins.allowed);
        dedup_patterns(&mut self.builtins.blocked);
        dedup_patterns(&mut self.attributes.blocked);
        self.validate()
    }

    /// Checks whether the safe builtin `name` is bound under this policy.
    pub fn builtin_permitted(&self, name: &str) -> bool {
        self.builtins.is_permitted(name)
    }

    /// Compiles the attribute rules for the attribute guard.
    ///
    /// # Errors
    ///
    /// Returns an error if a pattern fails to compile.
    pub fn attribute_policy(&self) -> Result<AttributePolicy> {
        AttributePolicy::from_patterns(&self.attributes.blocked)
            .context("Failed to compile attribute policy")
    }
}

/// Validates a glob pattern string for use in a policy.
fn validate_pattern(pattern: &str) -> Result<()> {
    if pattern.contains('\0') {
        return Err(anyhow!("Pattern contains null bytes"));
    }

    if pattern.trim().is_empty() {
        return Err(anyhow!("Pattern cannot be empty"));
    }

    glob_to_regex(pattern)?;
    Ok(())
}

/// Matches a name against a glob pattern; an invalid pattern matches nothing.
fn pattern_matches(pattern: &str, name: &str) -> bool {
    matches_glob(pattern, name).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_policy_config_default() {
        let config = PolicyConfig::default();
        assert_eq!(config.builtins.allowed, vec!["*"]);
        assert!(config.builtins.blocked.is_empty());
        assert_eq!(config.attributes.blocked, vec!["str.format", "str.format_map"]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builtins_blocked_takes_precedence() {
        let config = BuiltinsConfig::new(strings(&["*"]), strings(&["print", "is*"]));
        assert!(config.is_permitted("len"));
        assert!(!config.is_permitted("print"));
        assert!(!config.is_permitted("isinstance"));
    }

    #[test]
    fn test_builtins_allow_list() {
        let config = BuiltinsConfig::new(strings(&["len", "s*"]), vec![]);
        assert!(config.is_permitted("len"));
        assert!(config.is_permitted("sorted"));
        assert!(!config.is_permitted("print"));
    }

    #[test]
    fn test_empty_allow_list_permits_nothing() {
        let config = BuiltinsConfig::new(vec![], vec![]);
        assert!(config.validate().is_ok());
        assert!(!config.is_permitted("len"));
    }

    #[test]
    fn test_validate_rejects_bad_patterns() {
        assert!(BuiltinsConfig::new(strings(&["len\0"]), vec![]).validate().is_err());
        assert!(BuiltinsConfig::new(vec![], strings(&[""])).validate().is_err());
        assert!(AttributesConfig::new(strings(&["[abc"])).validate().is_err());
    }

    #[test]
    fn test_from_json_string_fills_defaults() {
        let config = PolicyConfig::from_json_string(r#"{"builtins": {"blocked": ["print"]}}"#)
            .unwrap();
        assert_eq!(config.builtins.allowed, vec!["*"]);
        assert!(!config.builtin_permitted("print"));
        assert_eq!(config.attributes, AttributesConfig::default());

        let empty = PolicyConfig::from_json_string("{}").unwrap();
        assert_eq!(empty, PolicyConfig::default());
    }

    #[test]
    fn test_from_json_string_invalid() {
        assert!(PolicyConfig::from_json_string("{ invalid json }").is_err());
        assert!(PolicyConfig::from_json_string(r#"{"builtins": {"allowed": [""]}}"#).is_err());
    }

    #[test]
    fn test_to_json_string_round_trips() {
        let config = PolicyConfig::new(
            BuiltinsConfig::new(strings(&["len"]), strings(&["print"])),
            AttributesConfig::new(strings(&["Response.*"])),
        );
        let json = config.to_json_string().unwrap();
        assert!(json.contains("builtins"));
        assert!(json.contains("attributes"));
        assert_eq!(PolicyConfig::from_json_string(&json).unwrap(), config);
    }

    #[test]
    fn test_merge() {
        let mut base = PolicyConfig::new(
            BuiltinsConfig::new(strings(&["len"]), vec![]),
            AttributesConfig::new(vec![]),
        );
        let extra = PolicyConfig::new(
            BuiltinsConfig::new(strings(&["sorted"]), strings(&["len"])),
            AttributesConfig::new(strings(&["secret"])),
        );
        base.merge(extra).unwrap();

        assert!(base.builtin_permitted("sorted"));
        assert!(!base.builtin_permitted("len"));
        assert_eq!(base.attributes.blocked, vec!["secret"]);
    }

    #[test]
    fn test_merge_drops_repeated_patterns() {
        let mut base = PolicyConfig::new(
            BuiltinsConfig::new(strings(&["len", "sorted"]), strings(&["print"])),
            AttributesConfig::new(strings(&["secret", "token"])),
        );
        let extra = PolicyConfig::new(
            BuiltinsConfig::new(strings(&["len", "max", "sorted"]), strings(&["print", "repr"])),
            AttributesConfig::new(strings(&["secret", "token", "key"])),
        );
        base.merge(extra).unwrap();

        assert_eq!(base.builtins.allowed, vec!["len", "sorted", "max"]);
        assert_eq!(base.builtins.blocked, vec!["print", "repr"]);
        assert_eq!(base.attributes.blocked, vec!["secret", "token", "key"]);
    }

    #[test]
    fn test_configured_attributes_replace_defaults() {
        let config = PolicyConfig::from_json_string(r#"{"attributes": {}}"#).unwrap();
        assert_eq!(config.attributes.blocked, vec!["str.format", "str.format_map"]);

        let config =
            PolicyConfig::from_json_string(r#"{"attributes": {"blocked": ["Response.raw"]}}"#)
                .unwrap();
        assert_eq!(config.attributes.blocked, vec!["Response.raw"]);
        let policy = config.attribute_policy().unwrap();
        assert!(!crate::runtime::is_sensitive_attribute(&policy, "str", "format"));
        assert!(crate::runtime::is_sensitive_attribute(&policy, "Response", "raw"));
    }

    #[test]
    fn test_attribute_policy_compiles() {
        let config = PolicyConfig::default();
        let policy = config.attribute_policy().unwrap();
        assert!(crate::runtime::is_sensitive_attribute(&policy, "str", "format"));
        assert!(!crate::runtime::is_sensitive_attribute(&policy, "str", "upper"));
    }

    #[test]
    fn test_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{"attributes": {{"blocked": ["Response.raw"]}}}}"#).unwrap();
        let config = PolicyConfig::from_file(file.path()).unwrap();
        assert_eq!(config.attributes.blocked, vec!["Response.raw"]);
    }

    #[test]
    fn test_from_file_missing() {
        let dir = tempfile::tempdir().unwrap();
        let err = PolicyConfig::from_file(dir.path().join("absent.json")).unwrap_err();
        assert!(err.to_string().contains("Failed to read policy file"));
    }
}
