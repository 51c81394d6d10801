use std::fmt;

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};

use crate::error::{Error, Result};

/// A glob over repository paths.
///
/// `**` matches any number of path segments, `*` matches within a single
/// segment, and `,` separates alternatives; an entry matches if any
/// alternative matches:
///   * `"/**"` - all files recursively
///   * `"*.json"` - all JSON files recursively
///   * `"/foo/*.json"` - JSON files directly under /foo
///   * `"/*/foo.txt"` - files named foo.txt at the second depth level
///   * `"*.json,/bar/*.txt"` - either pattern
///
/// An empty pattern matches nothing.
#[derive(Debug, Clone)]
pub struct PathPattern {
    source: String,
    set: Option<GlobSet>,
}

impl PathPattern {
    /// Compiles a path pattern. Alternatives that do not start with `/` are
    /// anchored at any depth (`"x" ≡ "/**/x"`), and a leading `**` gets the
    /// root slash prepended, matching the wire normalization clients apply.
    pub fn new(pattern: &str) -> Result<PathPattern> {
        let source = pattern.to_string();
        if pattern.trim().is_empty() {
            return Ok(PathPattern { source, set: None });
        }

        let mut builder = GlobSetBuilder::new();
        for alt in pattern.split(',') {
            let alt = alt.trim();
            if alt.is_empty() {
                continue;
            }
            let normalized = if alt.starts_with("**") {
                format!("/{}", alt)
            } else if !alt.starts_with('/') {
                format!("/**/{}", alt)
            } else {
                alt.to_string()
            };
            add_glob(&mut builder, &normalized)?;
            // globset requires at least one segment where `/**/` sits, so a
            // collapsed variant covers the zero-segment case.
            if normalized.contains("/**/") {
                add_glob(&mut builder, &normalized.replace("/**/", "/"))?;
            }
        }
        let set = builder
            .build()
            .map_err(|e| Error::InvalidInput(format!("invalid path pattern: {}", e)))?;
        Ok(PathPattern {
            source,
            set: Some(set),
        })
    }

    /// The pattern matching every entry.
    pub fn all() -> PathPattern {
        PathPattern::new("/**").expect("/** is a valid pattern")
    }

    pub fn matches(&self, path: &str) -> bool {
        match &self.set {
            Some(set) => set.is_match(path),
            None => false,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

fn add_glob(builder: &mut GlobSetBuilder, glob: &str) -> Result<()> {
    let g = GlobBuilder::new(glob)
        .literal_separator(true)
        .build()
        .map_err(|e| Error::InvalidInput(format!("invalid path pattern: {}", e)))?;
    builder.add(g);
    Ok(())
}

impl fmt::Display for PathPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl PartialEq for PathPattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl Eq for PathPattern {}

impl std::hash::Hash for PathPattern {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.source.hash(state);
    }
}

/// Validates an absolute entry path: slash-rooted, normalized, no `..`
/// segments, and no trailing slash except the root itself.
pub fn validate_file_path(path: &str) -> Result<()> {
    if !path.starts_with('/') {
        return Err(Error::InvalidInput(format!(
            "path must be absolute: {}",
            path
        )));
    }
    if path != "/" && path.ends_with('/') {
        return Err(Error::InvalidInput(format!(
            "path must not end with '/': {}",
            path
        )));
    }
    for segment in path.split('/').skip(1) {
        if segment.is_empty() && path != "/" {
            return Err(Error::InvalidInput(format!(
                "path has an empty segment: {}",
                path
            )));
        }
        if segment == "." || segment == ".." {
            return Err(Error::InvalidInput(format!(
                "path must be normalized: {}",
                path
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn all_matches_everything() {
        let p = PathPattern::all();
        assert!(p.matches("/a.json"));
        assert!(p.matches("/deep/ly/nested/file.txt"));
    }

    #[test]
    fn empty_matches_nothing() {
        let p = PathPattern::new("").unwrap();
        assert!(!p.matches("/a.json"));
    }

    #[test]
    fn star_stays_within_a_segment() {
        let p = PathPattern::new("/foo/*.json").unwrap();
        assert!(p.matches("/foo/a.json"));
        assert!(!p.matches("/foo/bar/a.json"));
        assert!(!p.matches("/a.json"));
    }

    #[test]
    fn unanchored_matches_at_any_depth() {
        let p = PathPattern::new("*.json").unwrap();
        assert!(p.matches("/a.json"));
        assert!(p.matches("/x/y/a.json"));
        assert!(!p.matches("/a.txt"));
    }

    #[test]
    fn second_level_only() {
        let p = PathPattern::new("/*/foo.txt").unwrap();
        assert!(p.matches("/a/foo.txt"));
        assert!(!p.matches("/foo.txt"));
        assert!(!p.matches("/a/b/foo.txt"));
    }

    #[test]
    fn alternatives_are_a_union() {
        let p = PathPattern::new("*.json,/bar/*.txt").unwrap();
        assert!(p.matches("/x/a.json"));
        assert!(p.matches("/bar/b.txt"));
        assert!(!p.matches("/baz/b.txt"));
    }

    #[test]
    fn file_path_validation() {
        assert!(validate_file_path("/a/b.json").is_ok());
        assert!(validate_file_path("a.json").is_err());
        assert!(validate_file_path("/a/../b.json").is_err());
        assert!(validate_file_path("/a/").is_err());
        assert!(validate_file_path("/a//b").is_err());
    }
}
