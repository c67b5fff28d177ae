//! Glob matching for tag-value filters
//!
//! `?` matches exactly one code point, `*` any run of code points
//! including the empty one; everything else is literal. Patterns compile
//! once per query and match the full value.

use regex::Regex;

use crate::error::{Error, Result};

/// Compile a glob pattern into an anchored regex
pub fn compile(pattern: &str) -> Result<Regex> {
    let mut built = String::with_capacity(pattern.len() + 8);
    let mut literal = String::new();
    for ch in pattern.chars() {
        match ch {
            '?' | '*' => {
                built.push_str(&regex::escape(&literal));
                literal.clear();
                built.push_str(if ch == '?' { "." } else { ".*" });
            }
            other => literal.push(other),
        }
    }
    built.push_str(&regex::escape(&literal));

    Regex::new(&format!(r"\A(?s:{built})\z"))
        .map_err(|e| Error::Datastore(format!("glob pattern {pattern:?} failed to compile: {e}")))
}

/// Whether `value` fully matches any of the compiled patterns
pub fn matches_any(value: &str, patterns: &[Regex]) -> bool {
    patterns.iter().any(|pattern| pattern.is_match(value))
}
