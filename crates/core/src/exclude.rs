//! Exclusion rules compiled into a gitignore-style matcher
//!
//! Rules are anchored at the sync root unless they apply recursively. A rule
//! that matches a directory excludes everything beneath it, and there is no
//! way to re-include a descendant.

use std::path::Path;

use ignore::gitignore::{Gitignore, GitignoreBuilder};

use crate::error::{Result, SyncError};
use crate::path::RelPath;
use crate::snapshot::EntryKind;

/// Directory holding the tool's own staging state, excluded on both sides
pub const STATE_DIR: &str = ".livesync";

/// One user-supplied ignore pattern
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExclusionRule {
    pub pattern: String,
    /// Match at any depth instead of only relative to the root
    pub applies_recursively: bool,
}

impl ExclusionRule {
    /// A rule anchored at the sync root
    #[must_use]
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            applies_recursively: false,
        }
    }

    /// A rule matching at any depth
    #[must_use]
    pub fn anywhere(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            applies_recursively: true,
        }
    }

    /// Validate the pattern and render it as a gitignore line
    fn gitignore_line(&self) -> Result<String> {
        let invalid = |reason: &str| SyncError::InvalidExclusionPattern {
            pattern: self.pattern.clone(),
            reason: reason.to_string(),
        };

        let trimmed = self.pattern.trim();
        let trimmed = trimmed.strip_prefix("./").unwrap_or(trimmed);
        if trimmed.is_empty() || trimmed == "/" {
            return Err(invalid("pattern is empty"));
        }
        if trimmed.starts_with('/') || trimmed.starts_with('\\') || has_drive_prefix(trimmed) {
            return Err(invalid("pattern is an absolute path"));
        }
        if trimmed.starts_with('!') {
            return Err(invalid("negated patterns are not supported"));
        }
        if trimmed.split('/').any(|segment| segment == "..") {
            return Err(invalid("pattern escapes the sync root"));
        }

        Ok(if self.applies_recursively {
            format!("**/{trimmed}")
        } else {
            format!("/{trimmed}")
        })
    }
}

fn has_drive_prefix(raw: &str) -> bool {
    let bytes = raw.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

/// Compiled predicate answering "is this relative path excluded"
#[derive(Debug, Clone)]
pub struct ExclusionMatcher {
    rules: Vec<ExclusionRule>,
    gitignore: Gitignore,
}

impl ExclusionMatcher {
    /// Compile an ordered set of rules.
    ///
    /// # Errors
    /// Returns `InvalidExclusionPattern` naming the first rule that is empty,
    /// absolute, negated, escapes the root, or fails to compile.
    pub fn new(rules: impl IntoIterator<Item = ExclusionRule>) -> Result<Self> {
        let rules: Vec<ExclusionRule> = rules.into_iter().collect();
        let mut builder = GitignoreBuilder::new("");

        for rule in &rules {
            let line = rule.gitignore_line()?;
            builder
                .add_line(None, &line)
                .map_err(|e| SyncError::InvalidExclusionPattern {
                    pattern: rule.pattern.clone(),
                    reason: e.to_string(),
                })?;
        }

        let gitignore = builder
            .build()
            .map_err(|e| SyncError::InvalidExclusionPattern {
                pattern: rules
                    .iter()
                    .map(|r| r.pattern.as_str())
                    .collect::<Vec<_>>()
                    .join(", "),
                reason: e.to_string(),
            })?;

        Ok(Self { rules, gitignore })
    }

    /// A matcher without user rules. Only the state directory is excluded.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            rules: Vec::new(),
            gitignore: Gitignore::empty(),
        }
    }

    #[must_use]
    pub fn rules(&self) -> &[ExclusionRule] {
        &self.rules
    }

    /// Whether `path` (of the given kind) or any of its ancestors is excluded
    #[must_use]
    pub fn is_excluded(&self, path: &RelPath, kind: EntryKind) -> bool {
        if path.is_root() {
            return false;
        }
        if path.segments().next() == Some(STATE_DIR) {
            return true;
        }
        self.gitignore
            .matched_path_or_any_parents(Path::new(path.as_str()), kind == EntryKind::Dir)
            .is_ignore()
    }
}

impl Default for ExclusionMatcher {
    fn default() -> Self {
        Self::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rel(s: &str) -> RelPath {
        RelPath::new(s).unwrap()
    }

    fn matcher(rules: &[ExclusionRule]) -> ExclusionMatcher {
        ExclusionMatcher::new(rules.iter().cloned()).unwrap()
    }

    #[test]
    fn test_reference_exclusions() {
        let m = matcher(&[
            ExclusionRule::new("ignoredFile"),
            ExclusionRule::new("testFolder/ignoredFile"),
            ExclusionRule::new("ignoredFolder"),
        ]);

        assert!(m.is_excluded(&rel("ignoredFile"), EntryKind::File));
        assert!(m.is_excluded(&rel("testFolder/ignoredFile"), EntryKind::File));
        assert!(m.is_excluded(&rel("ignoredFolder"), EntryKind::Dir));
        assert!(m.is_excluded(&rel("ignoredFolder/testFile1"), EntryKind::File));

        assert!(!m.is_excluded(&rel("testFile1"), EntryKind::File));
        assert!(!m.is_excluded(&rel("testFolder"), EntryKind::Dir));
        assert!(!m.is_excluded(&rel("testFolder/testFile1"), EntryKind::File));
        assert!(!m.is_excluded(&rel("testFolder2"), EntryKind::Dir));
        assert!(!m.is_excluded(&rel("ignoredFolder2"), EntryKind::Dir));
        assert!(!m.is_excluded(&RelPath::root(), EntryKind::Dir));
    }

    #[test]
    fn test_anchored_versus_anywhere() {
        let anchored = matcher(&[ExclusionRule::new("ignoredFile")]);
        assert!(!anchored.is_excluded(&rel("testFolder/ignoredFile"), EntryKind::File));

        let anywhere = matcher(&[ExclusionRule::anywhere("ignoredFile")]);
        assert!(anywhere.is_excluded(&rel("ignoredFile"), EntryKind::File));
        assert!(anywhere.is_excluded(&rel("testFolder/ignoredFile"), EntryKind::File));
    }

    #[test]
    fn test_globs() {
        let m = matcher(&[ExclusionRule::anywhere("*.log"), ExclusionRule::new("*.tmp")]);
        assert!(m.is_excluded(&rel("a/b/debug.log"), EntryKind::File));
        assert!(m.is_excluded(&rel("scratch.tmp"), EntryKind::File));
        assert!(!m.is_excluded(&rel("nested/scratch.tmp"), EntryKind::File));
        assert!(!m.is_excluded(&rel("main.rs"), EntryKind::File));
    }

    #[test]
    fn test_trailing_slash_is_directory_only() {
        let m = matcher(&[ExclusionRule::new("build/")]);
        assert!(m.is_excluded(&rel("build"), EntryKind::Dir));
        assert!(m.is_excluded(&rel("build/out.o"), EntryKind::File));
        assert!(!m.is_excluded(&rel("build"), EntryKind::File));
    }

    #[test]
    fn test_state_dir_always_excluded() {
        let m = ExclusionMatcher::empty();
        assert!(m.is_excluded(&rel(".livesync"), EntryKind::Dir));
        assert!(m.is_excluded(&rel(".livesync/tmp/x"), EntryKind::File));
        assert!(!m.is_excluded(&rel(".livesyncrc"), EntryKind::File));
        assert!(m.rules().is_empty());
    }

    #[test]
    fn test_invalid_patterns() {
        for bad in ["", "   ", "/etc/passwd", "C:/Windows", "a/../b", "!keep.txt"] {
            let err = ExclusionMatcher::new([ExclusionRule::new(bad)]).unwrap_err();
            assert!(
                matches!(err, SyncError::InvalidExclusionPattern { .. }),
                "{bad:?} gave {err:?}"
            );
        }
    }

    #[test]
    fn test_leading_dot_slash_is_stripped() {
        let m = matcher(&[ExclusionRule::new("./dist")]);
        assert!(m.is_excluded(&rel("dist/bundle.js"), EntryKind::File));
        assert_eq!(m.rules()[0].pattern, "./dist");
    }
}
