//! Glob pattern helpers shared by the backends.

use globset::{GlobBuilder, GlobMatcher};

use super::error::{VfsError, VfsResult};

/// Compile a single-component glob pattern.
pub fn matcher(pattern: &str) -> VfsResult<GlobMatcher> {
    GlobBuilder::new(pattern)
        .literal_separator(false)
        .backslash_escape(true)
        .build()
        .map(|g| g.compile_matcher())
        .map_err(|e| VfsError::invalid_argument(format!("bad glob pattern \"{pattern}\": {e}")))
}

/// Whether `s` contains glob metacharacters.
pub fn has_glob_chars(s: &str) -> bool {
    s.chars().any(|c| matches!(c, '*' | '?' | '[' | '{' | '\\'))
}

/// Hidden names only match patterns that start with a dot.
pub fn hidden_ok(name: &str, pattern: &str) -> bool {
    !name.starts_with('.') || pattern.starts_with('.')
}
