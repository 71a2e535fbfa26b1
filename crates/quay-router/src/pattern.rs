//! Servlet-style URL patterns

use std::collections::HashMap;
use std::fmt;

/// Error raised when a pattern cannot be parsed or registered
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatternError {
    /// Pattern string is empty or blank
    Empty,
    /// Pattern is neither `/...` nor `*.ext`
    Malformed(String),
    /// Pattern is already mapped in the table
    Duplicate(String),
    /// Route names a parameter differently from an earlier route at the
    /// same position
    ParamConflict {
        route: String,
        existing: String,
        name: String,
    },
}

impl fmt::Display for PatternError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatternError::Empty => write!(f, "empty URL pattern"),
            PatternError::Malformed(p) => write!(f, "malformed URL pattern '{}'", p),
            PatternError::Duplicate(p) => write!(f, "URL pattern '{}' is mapped more than once", p),
            PatternError::ParamConflict { route, existing, name } => write!(
                f,
                "route '{}' names parameter '{}' where an earlier route named it '{}'",
                route, name, existing
            ),
        }
    }
}

impl std::error::Error for PatternError {}

/// A parsed URL pattern
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum UrlPattern {
    /// `/` - matches anything no other pattern claims
    Default,
    /// `/users/list`
    Exact(String),
    /// `/api/*` - stored without the trailing `/*` (`""` for `/*`)
    Prefix(String),
    /// `*.txt` - stored without the leading `*.`
    Extension(String),
}

impl UrlPattern {
    /// Parse a pattern string
    pub fn parse(pattern: &str) -> Result<Self, PatternError> {
        let pattern = pattern.trim();
        if pattern.is_empty() {
            return Err(PatternError::Empty);
        }

        if pattern == "/" {
            return Ok(UrlPattern::Default);
        }

        if let Some(ext) = pattern.strip_prefix("*.") {
            if ext.is_empty() || ext.contains('/') || ext.contains('*') {
                return Err(PatternError::Malformed(pattern.to_string()));
            }
            return Ok(UrlPattern::Extension(ext.to_string()));
        }

        if !pattern.starts_with('/') {
            return Err(PatternError::Malformed(pattern.to_string()));
        }

        if let Some(prefix) = pattern.strip_suffix("/*") {
            if prefix.contains('*') {
                return Err(PatternError::Malformed(pattern.to_string()));
            }
            return Ok(UrlPattern::Prefix(prefix.to_string()));
        }

        if pattern.contains('*') {
            return Err(PatternError::Malformed(pattern.to_string()));
        }

        Ok(UrlPattern::Exact(pattern.to_string()))
    }

    /// Check whether a request path (relative to the context root) matches
    ///
    /// The default pattern matches every path.
    pub fn matches(&self, path: &str) -> bool {
        match self {
            UrlPattern::Default => true,
            UrlPattern::Exact(p) => p == path,
            UrlPattern::Prefix(prefix) => prefix_matches(prefix, path),
            UrlPattern::Extension(ext) => extension_of(path) == Some(ext.as_str()),
        }
    }
}

impl fmt::Display for UrlPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UrlPattern::Default => write!(f, "/"),
            UrlPattern::Exact(p) => write!(f, "{}", p),
            UrlPattern::Prefix(p) => write!(f, "{}/*", p),
            UrlPattern::Extension(e) => write!(f, "*.{}", e),
        }
    }
}

fn prefix_matches(prefix: &str, path: &str) -> bool {
    if prefix.is_empty() {
        return true;
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

fn extension_of(path: &str) -> Option<&str> {
    let last = path.rsplit('/').next()?;
    let (_, ext) = last.rsplit_once('.')?;
    Some(ext)
}

/// Result of a table lookup
#[derive(Debug, PartialEq)]
pub struct PatternMatch<'a, T> {
    /// The mapped value
    pub value: &'a T,
    /// Part of the path consumed by the pattern
    pub servlet_path: &'a str,
    /// Remainder after a prefix match (`None` when nothing remains)
    pub path_info: Option<&'a str>,
}

/// URL pattern table with servlet precedence
#[derive(Debug)]
pub struct PatternTable<T> {
    exact: HashMap<String, T>,
    /// Kept sorted by prefix length, longest first
    prefixes: Vec<(String, T)>,
    extensions: HashMap<String, T>,
    default: Option<T>,
}

impl<T> Default for PatternTable<T> {
    fn default() -> Self {
        Self {
            exact: HashMap::new(),
            prefixes: Vec::new(),
            extensions: HashMap::new(),
            default: None,
        }
    }
}

impl<T> PatternTable<T> {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Map a pattern to a value
    ///
    /// Mapping the same pattern twice is an error.
    pub fn insert(&mut self, pattern: &UrlPattern, value: T) -> Result<(), PatternError> {
        let duplicate = || PatternError::Duplicate(pattern.to_string());
        match pattern {
            UrlPattern::Default => {
                if self.default.is_some() {
                    return Err(duplicate());
                }
                self.default = Some(value);
            }
            UrlPattern::Exact(p) => {
                if self.exact.contains_key(p) {
                    return Err(duplicate());
                }
                self.exact.insert(p.clone(), value);
            }
            UrlPattern::Prefix(p) => {
                if self.prefixes.iter().any(|(existing, _)| existing == p) {
                    return Err(duplicate());
                }
                let at = self
                    .prefixes
                    .iter()
                    .position(|(existing, _)| existing.len() < p.len())
                    .unwrap_or(self.prefixes.len());
                self.prefixes.insert(at, (p.clone(), value));
            }
            UrlPattern::Extension(e) => {
                if self.extensions.contains_key(e) {
                    return Err(duplicate());
                }
                self.extensions.insert(e.clone(), value);
            }
        }
        Ok(())
    }

    /// Check if a default target is mapped
    pub fn has_default(&self) -> bool {
        self.default.is_some()
    }

    /// Find the value for a path
    pub fn lookup<'a>(&'a self, path: &'a str) -> Option<PatternMatch<'a, T>> {
        // Priority 1: exact
        if let Some(value) = self.exact.get(path) {
            return Some(PatternMatch {
                value,
                servlet_path: path,
                path_info: None,
            });
        }

        // Priority 2: longest prefix
        for (prefix, value) in &self.prefixes {
            if prefix_matches(prefix, path) {
                let rest = &path[prefix.len()..];
                return Some(PatternMatch {
                    value,
                    servlet_path: &path[..prefix.len()],
                    path_info: if rest.is_empty() { None } else { Some(rest) },
                });
            }
        }

        // Priority 3: extension
        if let Some(ext) = extension_of(path) {
            if let Some(value) = self.extensions.get(ext) {
                return Some(PatternMatch {
                    value,
                    servlet_path: path,
                    path_info: None,
                });
            }
        }

        // Priority 4: default
        self.default.as_ref().map(|value| PatternMatch {
            value,
            servlet_path: path,
            path_info: None,
        })
    }

    /// Number of mapped patterns
    pub fn len(&self) -> usize {
        self.exact.len()
            + self.prefixes.len()
            + self.extensions.len()
            + usize::from(self.default.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> UrlPattern {
        UrlPattern::parse(s).unwrap()
    }

    #[test]
    fn test_parse() {
        assert_eq!(p("/"), UrlPattern::Default);
        assert_eq!(p("/test0"), UrlPattern::Exact("/test0".to_string()));
        assert_eq!(p("/*"), UrlPattern::Prefix(String::new()));
        assert_eq!(p("/api/*"), UrlPattern::Prefix("/api".to_string()));
        assert_eq!(p("*.txt"), UrlPattern::Extension("txt".to_string()));
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(UrlPattern::parse(""), Err(PatternError::Empty));
        assert_eq!(UrlPattern::parse("   "), Err(PatternError::Empty));
        assert!(matches!(UrlPattern::parse("test"), Err(PatternError::Malformed(_))));
        assert!(matches!(UrlPattern::parse("/a*b"), Err(PatternError::Malformed(_))));
        assert!(matches!(UrlPattern::parse("/*/x/*"), Err(PatternError::Malformed(_))));
        assert!(matches!(UrlPattern::parse("*."), Err(PatternError::Malformed(_))));
    }

    #[test]
    fn test_display_round_trip() {
        for s in ["/", "/test0", "/*", "/api/*", "*.txt"] {
            assert_eq!(p(s).to_string(), s);
        }
    }

    #[test]
    fn test_pattern_matches() {
        assert!(p("/*").matches("/anything/at/all"));
        assert!(p("/api/*").matches("/api"));
        assert!(p("/api/*").matches("/api/test"));
        assert!(!p("/api/*").matches("/apix"));
        assert!(p("*.txt").matches("/docs/test.txt"));
        assert!(!p("*.txt").matches("/docs.txt/readme"));
        assert!(p("/").matches("/whatever"));
        assert!(!p("/test0").matches("/test1"));
    }

    #[test]
    fn test_precedence() {
        let mut table = PatternTable::new();
        table.insert(&p("/"), "default").unwrap();
        table.insert(&p("*.txt"), "text").unwrap();
        table.insert(&p("/files/*"), "files").unwrap();
        table.insert(&p("/files/special/*"), "special").unwrap();
        table.insert(&p("/files/exact.txt"), "exact").unwrap();

        assert_eq!(*table.lookup("/files/exact.txt").unwrap().value, "exact");
        assert_eq!(*table.lookup("/files/other.txt").unwrap().value, "files");
        assert_eq!(*table.lookup("/files/special/a").unwrap().value, "special");
        assert_eq!(*table.lookup("/notes.txt").unwrap().value, "text");
        assert_eq!(*table.lookup("/index.html").unwrap().value, "default");
    }

    #[test]
    fn test_prefix_split() {
        let mut table = PatternTable::new();
        table.insert(&p("/api/*"), 1).unwrap();

        let m = table.lookup("/api/users/7").unwrap();
        assert_eq!(m.servlet_path, "/api");
        assert_eq!(m.path_info, Some("/users/7"));

        let m = table.lookup("/api").unwrap();
        assert_eq!(m.path_info, None);

        assert!(table.lookup("/other").is_none());
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut table = PatternTable::new();
        table.insert(&p("/test0"), 0).unwrap();
        assert_eq!(
            table.insert(&p("/test0"), 1),
            Err(PatternError::Duplicate("/test0".to_string()))
        );
        table.insert(&p("/"), 2).unwrap();
        assert!(table.insert(&p("/"), 3).is_err());
        assert_eq!(table.len(), 2);
        assert!(table.has_default());
    }
}
