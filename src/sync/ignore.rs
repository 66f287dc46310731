//! Ignore rules for sync operations.
//!
//! Gitignore-style patterns evaluated in declaration order; the last rule
//! that matches a path decides whether it is ignored.

use globset::{GlobBuilder, GlobMatcher};
use std::path::{Component, Path};

use crate::error::{Result, SyncError};

/// Name of the per-project ignore file read from the source root.
pub const IGNORE_FILE_NAME: &str = ".deployignore";

/// Rules applied before any ignore-file or configured pattern.
pub const DEFAULT_IGNORES: &[&str] = &[
    // Version control
    ".git/",
    ".gitignore",
    ".gitattributes",
    ".svn/",
    ".hg/",

    // OS-specific
    ".DS_Store",
    "Thumbs.db",
    "desktop.ini",

    // Editor swap and backup files
    "*.swp",
    "*.swo",
    "*~",
    "*.bak",

    // Caches
    "__pycache__/",
    "*.pyc",
    "*.pyo",
    ".pytest_cache/",
    ".cache/",
    ".coverage",
    "htmlcov/",
    "*.egg-info/",

    // Secrets and local environments
    ".env",
    ".venv/",
    "venv/",
    "node_modules/",

    // IDE settings
    ".idea/",
    ".vscode/",

    // Scratch files
    "*.tmp",
    "*.temp",

    // The ignore file itself
    IGNORE_FILE_NAME,
];

/// One compiled ignore pattern.
#[derive(Debug, Clone)]
pub struct IgnoreRule {
    /// Pattern as written, without `!` prefix or trailing `/`.
    pub pattern: String,
    pub negated: bool,
    /// Only matches directories (pattern had a trailing `/`).
    pub dir_only: bool,
    /// Pattern contains a `/` and is matched against the whole relative
    /// path instead of the file name.
    anchored: bool,
    matcher: GlobMatcher,
}

impl IgnoreRule {
    /// Parse one pattern line such as `*.log`, `!keep.log` or `build/`.
    pub fn parse(line: &str) -> Result<Self> {
        let raw = line.trim();
        let (negated, body) = match raw.strip_prefix('!') {
            Some(rest) => (true, rest),
            None => (false, raw),
        };
        let dir_only = body.ends_with('/');
        let body = body.trim_end_matches('/');
        let anchored = body.contains('/');
        let glob_text = body.trim_start_matches('/');

        if glob_text.is_empty() {
            return Err(SyncError::IgnoreRule {
                pattern: line.to_string(),
                reason: "empty pattern".to_string(),
            });
        }

        let glob = GlobBuilder::new(glob_text)
            .literal_separator(true)
            .backslash_escape(true)
            .build()
            .map_err(|e| SyncError::IgnoreRule {
                pattern: line.to_string(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            pattern: glob_text.to_string(),
            negated,
            dir_only,
            anchored,
            matcher: glob.compile_matcher(),
        })
    }

    /// Whether this rule's pattern matches `relative` (ignoring negation).
    pub fn matches(&self, relative: &str, is_dir: bool) -> bool {
        if self.dir_only && !is_dir {
            return false;
        }
        if self.anchored {
            self.matcher.is_match(relative)
        } else {
            let name = relative.rsplit('/').next().unwrap_or(relative);
            self.matcher.is_match(name)
        }
    }
}

/// Immutable rule set for one session.
#[derive(Debug, Clone, Default)]
pub struct IgnoreMatcher {
    rules: Vec<IgnoreRule>,
}

impl IgnoreMatcher {
    /// A matcher with no rules; nothing is ignored.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build from explicit patterns only.
    pub fn from_patterns<S: AsRef<str>>(patterns: &[S]) -> Result<Self> {
        let rules = patterns
            .iter()
            .map(|p| IgnoreRule::parse(p.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { rules })
    }

    /// Built-in defaults, then ignore-file lines, then explicit patterns.
    /// Later rules take precedence because the last match wins.
    pub fn load<S: AsRef<str>>(ignore_file: Option<&str>, explicit: &[S]) -> Result<Self> {
        let mut rules = Vec::new();
        for pattern in DEFAULT_IGNORES {
            rules.push(IgnoreRule::parse(pattern)?);
        }
        if let Some(content) = ignore_file {
            for line in parse_ignore_file(content) {
                rules.push(IgnoreRule::parse(line)?);
            }
        }
        for pattern in explicit {
            rules.push(IgnoreRule::parse(pattern.as_ref())?);
        }
        Ok(Self { rules })
    }

    pub fn rules(&self) -> &[IgnoreRule] {
        &self.rules
    }

    /// Evaluate one path on its own. `relative` uses `/` separators.
    pub fn should_ignore(&self, relative: &str, is_dir: bool) -> bool {
        let relative = relative.trim_start_matches("./").trim_matches('/');
        let mut ignored = false;
        for rule in &self.rules {
            if rule.matches(relative, is_dir) {
                ignored = !rule.negated;
            }
        }
        ignored
    }

    /// Evaluate a file reported by a change event: every ancestor directory
    /// is checked first (an ignored directory hides its whole subtree, as in
    /// a tree walk), then the file itself.
    pub fn is_path_ignored(&self, relative: &Path) -> bool {
        let parts: Vec<String> = relative
            .components()
            .filter_map(|c| match c {
                Component::Normal(name) => Some(name.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect();
        if parts.is_empty() {
            return false;
        }

        let mut prefix = String::new();
        for (idx, part) in parts.iter().enumerate() {
            if !prefix.is_empty() {
                prefix.push('/');
            }
            prefix.push_str(part);
            let is_last = idx + 1 == parts.len();
            if self.should_ignore(&prefix, !is_last) {
                return true;
            }
        }
        false
    }
}

/// Pattern lines of an ignore file: blank lines and `#` comments dropped.
pub fn parse_ignore_file(content: &str) -> impl Iterator<Item = &str> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
}

/// Relative path of `path` under `root` with `/` separators.
pub fn relative_slash_path(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(name) => Some(name.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}
