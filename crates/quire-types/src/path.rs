//! Drive path normalization.
//!
//! Drive paths are `/`-separated; empty segments are ignored, so `a/1`,
//! `/a/1` and `a//1/` all name the same file. The root is the empty string.

/// Normalize a path into its canonical form (no leading, trailing, or
/// repeated separators).
pub fn normalize(path: &str) -> String {
    segments(path).collect::<Vec<_>>().join("/")
}

/// Iterate over the non-empty segments of a path.
pub fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

/// If `path` lies strictly below `dir` (both normalized), return the name of
/// the child of `dir` that contains it.
pub fn child_of<'a>(dir: &str, path: &'a str) -> Option<&'a str> {
    let rest = if dir.is_empty() {
        path
    } else {
        path.strip_prefix(dir)?.strip_prefix('/')?
    };
    if rest.is_empty() {
        return None;
    }
    rest.split('/').next()
}

/// Returns `true` if `path` is `dir` itself or lies below it.
pub fn is_within(dir: &str, path: &str) -> bool {
    dir.is_empty() || path == dir || child_of(dir, path).is_some()
}
