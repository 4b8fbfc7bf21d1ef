//! Domain pattern matching
//!
//! The resolution table and the block check share one matching rule. A
//! pattern's shape selects the mode:
//!
//! 1. **Regex**: the pattern begins with `^`. A trailing `$` is implied when
//!    absent. Applied to the lowercased candidate.
//! 2. **Glob**: the pattern contains `*` or `?`. `*` matches zero or more
//!    characters, `?` exactly one. Case-insensitive, anchored at both ends.
//! 3. **Literal**: exact case-insensitive equality.
//!
//! The matcher sits on the per-query path, so compiled regexes are cached.
//! A pattern that fails to compile matches nothing; the failure is cached
//! too so the compile cost is paid once.
//!
//! # Example
//!
//! ```
//! use homedns::matcher::matches;
//!
//! assert!(matches("*.example.com.", "a.b.example.com."));
//! assert!(matches("^(.*\\.)?ads\\.test\\.$", "tracker.ads.test."));
//! assert!(!matches("example.com.", "a.example.com."));
//! ```

use dashmap::DashMap;
use once_cell::sync::Lazy;
use regex::Regex;

/// Compiled-regex cache keyed by the raw pattern
///
/// `None` marks a pattern that failed to compile, so malformed patterns are
/// rejected without recompiling on every query.
static REGEX_CACHE: Lazy<DashMap<String, Option<Regex>>> = Lazy::new(DashMap::new);

/// Check whether `candidate` matches `pattern`
///
/// The mode is selected from the pattern's shape; see the module docs.
/// Matching is case-insensitive on the candidate side in every mode.
#[must_use]
pub fn matches(pattern: &str, candidate: &str) -> bool {
    let candidate = candidate.to_ascii_lowercase();

    if pattern.starts_with('^') {
        return regex_matches(pattern, &candidate);
    }
    if pattern.contains('*') || pattern.contains('?') {
        return glob_matches(pattern, &candidate);
    }
    pattern.eq_ignore_ascii_case(&candidate)
}

/// Apply a regex pattern, compiling and caching on first use
fn regex_matches(pattern: &str, candidate: &str) -> bool {
    if let Some(cached) = REGEX_CACHE.get(pattern) {
        return cached
            .as_ref()
            .is_some_and(|re| re.is_match(candidate));
    }

    let anchored = if pattern.ends_with('$') {
        pattern.to_string()
    } else {
        format!("{pattern}$")
    };
    let compiled = Regex::new(&anchored).ok();
    if compiled.is_none() {
        tracing::debug!(pattern = %pattern, "pattern failed to compile, treating as non-match");
    }

    let hit = compiled
        .as_ref()
        .is_some_and(|re| re.is_match(candidate));
    REGEX_CACHE.insert(pattern.to_string(), compiled);
    hit
}

/// Anchored glob match with `*` and `?` wildcards
///
/// Iterative two-pointer scan with single-star backtracking; domain names
/// are ASCII so matching works on bytes.
fn glob_matches(pattern: &str, candidate: &str) -> bool {
    let pattern = pattern.to_ascii_lowercase();
    let (pat, text) = (pattern.as_bytes(), candidate.as_bytes());

    let (mut p, mut t) = (0usize, 0usize);
    let mut star: Option<usize> = None;
    let mut mark = 0usize;

    while t < text.len() {
        if p < pat.len() && (pat[p] == b'?' || pat[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pat.len() && pat[p] == b'*' {
            star = Some(p);
            mark = t;
            p += 1;
        } else if let Some(s) = star {
            // Backtrack: let the last star consume one more character.
            p = s + 1;
            mark += 1;
            t = mark;
        } else {
            return false;
        }
    }

    while p < pat.len() && pat[p] == b'*' {
        p += 1;
    }
    p == pat.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    // ========================================================================
    // Literal Mode
    // ========================================================================

    #[test]
    fn test_literal_exact() {
        assert!(matches("example.com.", "example.com."));
        assert!(!matches("example.com.", "other.com."));
    }

    #[test]
    fn test_literal_case_insensitive() {
        assert!(matches("example.com.", "EXAMPLE.COM."));
        assert!(matches("EXAMPLE.com.", "example.com."));
    }

    #[test]
    fn test_literal_does_not_match_subdomain() {
        assert!(!matches("example.com.", "a.example.com."));
    }

    // ========================================================================
    // Glob Mode
    // ========================================================================

    #[test]
    fn test_glob_star_matches_subdomains() {
        assert!(matches("*.example.com.", "a.example.com."));
        assert!(matches("*.example.com.", "a.b.example.com."));
    }

    #[test]
    fn test_glob_star_is_anchored() {
        assert!(!matches("*.example.com.", "example.org."));
        assert!(!matches("*.example.com.", "example.com.extra."));
    }

    #[test]
    fn test_glob_star_matches_empty() {
        // `*` matches zero characters, so the leading label may be empty.
        assert!(matches("*example.com.", "example.com."));
    }

    #[test]
    fn test_glob_question_mark() {
        assert!(matches("?.example.com.", "a.example.com."));
        assert!(!matches("?.example.com.", "ab.example.com."));
        assert!(!matches("?.example.com.", ".example.com."));
    }

    #[test]
    fn test_glob_case_insensitive() {
        assert!(matches("*.Example.COM.", "a.example.com."));
    }

    #[test]
    fn test_glob_multiple_stars() {
        assert!(matches("*.ads.*", "tracker.ads.net."));
        assert!(!matches("*.ads.*", "tracker.adserver"));
    }

    // ========================================================================
    // Regex Mode
    // ========================================================================

    #[test]
    fn test_regex_basic() {
        assert!(matches("^(.*\\.)?doubleclick\\.net\\.$", "doubleclick.net."));
        assert!(matches("^(.*\\.)?doubleclick\\.net\\.$", "ads.doubleclick.net."));
        assert!(!matches("^(.*\\.)?doubleclick\\.net\\.$", "notdoubleclick.net."));
    }

    #[test]
    fn test_regex_implied_end_anchor() {
        // Without an explicit `$` the match must still cover the tail.
        assert!(matches("^example\\.com\\.", "example.com."));
        assert!(!matches("^example\\.com\\.", "example.com.extra."));
    }

    #[test]
    fn test_regex_lowercases_candidate() {
        assert!(matches("^tracker\\.ads\\.$", "TRACKER.ADS."));
    }

    #[test]
    fn test_regex_malformed_is_non_match() {
        assert!(!matches("^(unclosed", "anything."));
        // Second call exercises the cached-failure path.
        assert!(!matches("^(unclosed", "anything."));
    }

    // ========================================================================
    // Cross-Mode Round-Trips
    // ========================================================================

    #[test]
    fn test_wildcard_round_trip() {
        assert!(matches("*.example.com.", "a.b.example.com."));
        assert!(!matches("example.com.", "a.example.com."));
    }
}
