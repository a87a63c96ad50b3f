//! Taint-seed configuration: the set of variable names (and shell-glob
//! patterns) that mark a function as interesting from the start.

use std::collections::HashSet;
use std::io::BufRead;
use std::path::Path;

use regex::Regex;

use crate::error::{AnalysisError, Result};

pub struct TaintSeeds {
    literals: HashSet<String>,
    globs: Vec<Regex>,
}

impl TaintSeeds {
    /// Loads one literal name or shell glob per non-blank, non-`#` line.
    pub fn load(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path).map_err(|_| AnalysisError::SeedsMissing(path.to_path_buf()))?;
        let mut literals = HashSet::new();
        let mut globs = Vec::new();
        for line in std::io::BufReader::new(file).lines() {
            let line = line?;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            if trimmed.contains('*') || trimmed.contains('?') {
                globs.push(compile_glob(trimmed)?);
            } else {
                literals.insert(trimmed.to_string());
            }
        }
        Ok(TaintSeeds { literals, globs })
    }

    /// Merges in seeds from a `|`-separated environment fallback, mirroring
    /// the historical `EnvSchema` filter this config file replaces.
    pub fn extend_from_env(&mut self, value: &str) {
        for part in value.split('|') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            if part.contains('*') || part.contains('?') {
                if let Ok(re) = compile_glob(part) {
                    self.globs.push(re);
                }
            } else {
                self.literals.insert(part.to_string());
            }
        }
    }

    /// A name matches if it's in the literal set, or any glob matches it
    /// as a substring (shell semantics, not full-string anchoring).
    pub fn matches(&self, name: &str) -> bool {
        if self.literals.contains(name) {
            return true;
        }
        self.globs.iter().any(|re| re.is_match(name))
    }
}

fn compile_glob(pattern: &str) -> Result<Regex> {
    let mut out = String::new();
    for c in pattern.chars() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '\\' | '^' | '$' | '+' | '.' | '(' | ')' | '|' | '{' | '}' | '[' | ']' => {
                out.push('\\');
                out.push(c);
            }
            _ => out.push(c),
        }
    }
    Regex::new(&out).map_err(|source| AnalysisError::BadTaintGlob {
        pattern: pattern.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn literal_and_glob_seeds_both_match() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seeds.txt");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "# comment").unwrap();
        writeln!(f, "conf_timeout").unwrap();
        writeln!(f, "knob_*").unwrap();
        let seeds = TaintSeeds::load(&path).unwrap();
        assert!(seeds.matches("conf_timeout"));
        assert!(seeds.matches("knob_retry_count"));
        assert!(!seeds.matches("unrelated"));
    }

    #[test]
    fn glob_matches_as_substring() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seeds.txt");
        std::fs::write(&path, "*_limit\n").unwrap();
        let seeds = TaintSeeds::load(&path).unwrap();
        assert!(seeds.matches("request_limit"));
    }

    #[test]
    fn env_fallback_splits_on_pipe() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seeds.txt");
        std::fs::write(&path, "a\n").unwrap();
        let mut seeds = TaintSeeds::load(&path).unwrap();
        seeds.extend_from_env("b|c_*");
        assert!(seeds.matches("b"));
        assert!(seeds.matches("c_thing"));
    }
}
