//! Caller filters: which modules get their slots rewritten.

use std::fmt;
use std::sync::Arc;

/// Predicate over a caller module's path. `true` means the module is hooked.
#[derive(Clone)]
pub struct CallerFilter(Arc<dyn Fn(&str) -> bool + Send + Sync>);

impl CallerFilter {
    pub fn new(f: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn allow_all() -> Self {
        Self::new(|_| true)
    }

    /// Reject modules whose path or basename matches any of `patterns`.
    pub fn deny_globs<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let patterns: Vec<String> = patterns.into_iter().map(Into::into).collect();
        Self::new(move |path| {
            let name = crate::types::basename(path);
            !patterns
                .iter()
                .any(|p| matches_glob(p, path) || matches_glob(p, name))
        })
    }

    pub fn accepts(&self, path: &str) -> bool {
        (self.0)(path)
    }
}

impl Default for CallerFilter {
    fn default() -> Self {
        Self::allow_all()
    }
}

impl fmt::Debug for CallerFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CallerFilter(..)")
    }
}

/// Glob matching where `*` matches any run of characters, including none.
pub fn matches_glob(pattern: &str, name: &str) -> bool {
    let mut segments = pattern.split('*');
    let head = segments.next().unwrap_or_default();
    let mut middle: Vec<&str> = segments.collect();
    let Some(tail) = middle.pop() else {
        return pattern == name;
    };

    let Some(mut rest) = name.strip_prefix(head) else {
        return false;
    };
    for segment in middle {
        match rest.find(segment) {
            Some(idx) => rest = &rest[idx + segment.len()..],
            None => return false,
        }
    }
    rest.ends_with(tail)
}
