//! Dangerous command pattern store
//!
//! Loads a corpus of regex blocklist rules from versioned rule-set files and
//! caches it until an explicit reload. A missing or empty corpus is an error:
//! without it every shell command would pass unchecked.
//!
//! Rule-set schema (YAML or JSON):
//!
//! ```yaml
//! patterns:
//!   - pattern: '\brm\s+-[a-z]*r[a-z]*f'
//!     test-exploit-string: 'rm -rf /'
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use regex::Regex;
use serde::Deserialize;

use crate::core::{GuardError, GuardResult};

const RULE_EXTENSIONS: &[&str] = &["yaml", "yml", "json"];

#[derive(Debug, Deserialize)]
struct RuleSetFile {
    patterns: Vec<RuleEntry>,
}

#[derive(Debug, Deserialize)]
struct RuleEntry {
    pattern: String,
    #[serde(rename = "test-exploit-string")]
    test_exploit_string: String,
}

/// One compiled blocklist rule
#[derive(Debug, Clone)]
pub struct DangerousPattern {
    regex: Regex,
    test_exploit: String,
    origin_file: String,
}

impl DangerousPattern {
    pub fn as_str(&self) -> &str {
        self.regex.as_str()
    }

    pub fn is_match(&self, command: &str) -> bool {
        self.regex.is_match(command)
    }

    /// Sample command this rule must catch
    pub fn test_exploit(&self) -> &str {
        &self.test_exploit
    }

    /// File name of the rule set this pattern came from
    pub fn origin_file(&self) -> &str {
        &self.origin_file
    }
}

/// Shared, read-mostly pattern store
///
/// One instance may serve every session of a process. The first `load`
/// populates the cache; concurrent first callers wait on the same write lock.
#[derive(Debug)]
pub struct DangerousPatternStore {
    dir: PathBuf,
    /// Ordered rule-set file names (empty = every rule file, sorted)
    sources: Vec<String>,
    cache: RwLock<Option<Arc<Vec<DangerousPattern>>>>,
}

impl DangerousPatternStore {
    /// Create a store over a rule directory
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            sources: Vec::new(),
            cache: RwLock::new(None),
        }
    }

    /// Restrict loading to an ordered list of rule-set files
    pub fn with_sources(mut self, sources: Vec<String>) -> Self {
        self.sources = sources;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Return the cached patterns, loading them on first use or when forced
    pub fn load(&self, force_reload: bool) -> GuardResult<Arc<Vec<DangerousPattern>>> {
        if !force_reload {
            let cache = self.cache.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(patterns) = cache.as_ref() {
                return Ok(patterns.clone());
            }
        }

        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        if !force_reload {
            if let Some(patterns) = cache.as_ref() {
                return Ok(patterns.clone());
            }
        }

        let patterns = Arc::new(self.read_all()?);
        tracing::info!(
            "Loaded {} dangerous command patterns from {}",
            patterns.len(),
            self.dir.display()
        );
        *cache = Some(patterns.clone());
        Ok(patterns)
    }

    /// Drop the cache and load again from disk
    pub fn reload(&self) -> GuardResult<Arc<Vec<DangerousPattern>>> {
        tracing::info!("Reloading dangerous command patterns");
        self.load(true)
    }

    /// Patterns contributed by one rule-set file
    pub fn patterns_from_source(&self, name: &str) -> GuardResult<Vec<DangerousPattern>> {
        Ok(self
            .load(false)?
            .iter()
            .filter(|p| p.origin_file == name)
            .cloned()
            .collect())
    }

    /// Every loaded rule-set file with its pattern count, in load order
    pub fn sources(&self) -> GuardResult<Vec<(String, usize)>> {
        let mut counts: Vec<(String, usize)> = Vec::new();
        for pattern in self.load(false)?.iter() {
            match counts.last_mut() {
                Some((name, count)) if *name == pattern.origin_file => *count += 1,
                _ => counts.push((pattern.origin_file.clone(), 1)),
            }
        }
        Ok(counts)
    }

    /// First pattern matching a shell command, if any
    pub fn find_match(&self, command: &str) -> GuardResult<Option<DangerousPattern>> {
        Ok(self.load(false)?.iter().find(|p| p.is_match(command)).cloned())
    }

    fn source_files(&self) -> GuardResult<Vec<PathBuf>> {
        if !self.dir.is_dir() {
            return Err(GuardError::patterns(format!(
                "rule directory {} does not exist",
                self.dir.display()
            )));
        }

        if !self.sources.is_empty() {
            return Ok(self.sources.iter().map(|s| self.dir.join(s)).collect());
        }

        let mut files: Vec<PathBuf> = fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.is_file()
                    && path
                        .extension()
                        .and_then(|e| e.to_str())
                        .is_some_and(|e| RULE_EXTENSIONS.contains(&e))
            })
            .collect();
        files.sort();
        Ok(files)
    }

    fn read_all(&self) -> GuardResult<Vec<DangerousPattern>> {
        let files = self.source_files()?;
        let mut patterns = Vec::new();
        let mut valid_files = 0;

        for path in &files {
            match parse_rule_file(path) {
                Ok(mut parsed) => {
                    valid_files += 1;
                    tracing::debug!("{}: {} patterns", path.display(), parsed.len());
                    patterns.append(&mut parsed);
                }
                Err(e) => {
                    tracing::warn!("Skipping rule file {}: {}", path.display(), e);
                }
            }
        }

        if valid_files == 0 {
            return Err(GuardError::patterns(format!(
                "no valid rule files in {}",
                self.dir.display()
            )));
        }
        if patterns.is_empty() {
            return Err(GuardError::patterns(format!(
                "rule files in {} contain no usable patterns",
                self.dir.display()
            )));
        }

        Ok(patterns)
    }
}

fn parse_rule_file(path: &Path) -> GuardResult<Vec<DangerousPattern>> {
    let contents = fs::read_to_string(path)?;
    let rule_set: RuleSetFile = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => serde_json::from_str(&contents)?,
        _ => serde_yaml::from_str(&contents)?,
    };

    let origin_file = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut patterns = Vec::with_capacity(rule_set.patterns.len());
    for entry in rule_set.patterns {
        let regex = match Regex::new(&entry.pattern) {
            Ok(regex) => regex,
            Err(e) => {
                tracing::warn!(
                    "Skipping invalid pattern {:?} in {}: {}",
                    entry.pattern,
                    origin_file,
                    e
                );
                continue;
            }
        };
        if !regex.is_match(&entry.test_exploit_string) {
            tracing::warn!(
                "Pattern {:?} in {} does not match its own test exploit",
                entry.pattern,
                origin_file
            );
        }
        patterns.push(DangerousPattern {
            regex,
            test_exploit: entry.test_exploit_string,
            origin_file: origin_file.clone(),
        });
    }

    Ok(patterns)
}
