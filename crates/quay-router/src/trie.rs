//! Per-method segment trie
//!
//! ## Path Syntax
//! - `:name` or `{name}` - named parameter (captures one segment)
//! - `*` or `*name` - wildcard (captures remaining path)
//!
//! Static segments win over parameters, parameters win over wildcards.

use crate::PatternError;
use std::collections::HashMap;

/// Route match result
#[derive(Debug, Clone, PartialEq)]
pub struct Match<'a, T> {
    /// The matched value
    pub value: &'a T,
    /// Captured path parameters as (name, value) pairs
    pub params: Vec<(String, String)>,
}

impl<T> Match<'_, T> {
    /// Get params as HashMap for convenient access
    pub fn params_map(&self) -> HashMap<String, String> {
        self.params.iter().cloned().collect()
    }
}

/// Outcome of a method-aware lookup
#[derive(Debug, PartialEq)]
pub enum Lookup<'a, T> {
    Found(Match<'a, T>),
    /// The path exists for other methods
    MethodNotAllowed(Vec<String>),
    NotFound,
}

#[derive(Debug)]
struct Node<T> {
    children: HashMap<String, Node<T>>,
    param_child: Option<Box<ParamNode<T>>>,
    wildcard_child: Option<Box<WildcardNode<T>>>,
    value: Option<T>,
}

impl<T> Default for Node<T> {
    fn default() -> Self {
        Self {
            children: HashMap::new(),
            param_child: None,
            wildcard_child: None,
            value: None,
        }
    }
}

#[derive(Debug)]
struct ParamNode<T> {
    name: String,
    node: Node<T>,
}

#[derive(Debug)]
struct WildcardNode<T> {
    name: String,
    value: T,
}

/// Method-keyed radix trie router
#[derive(Debug)]
pub struct Router<T> {
    /// Method -> Trie root
    trees: HashMap<String, Node<T>>,
}

impl<T> Default for Router<T> {
    fn default() -> Self {
        Self {
            trees: HashMap::new(),
        }
    }
}

fn segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

fn param_name(segment: &str) -> Option<&str> {
    segment
        .strip_prefix(':')
        .or_else(|| segment.strip_prefix('{').and_then(|s| s.strip_suffix('}')))
}

impl<T> Router<T> {
    /// Create a new router
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a route, replacing any value already at the same position
    ///
    /// Fails when a parameter is named differently from one an earlier route
    /// declared at the same position, since one segment captures under a
    /// single name.
    ///
    /// # Example
    /// ```
    /// use quay_router::Router;
    ///
    /// let mut router = Router::new();
    /// router.insert("GET", "/users/{id}", "get_user").unwrap();
    /// router.insert("POST", "/users", "create_user").unwrap();
    /// assert!(router.insert("GET", "/users/{uid}/posts", "posts").is_err());
    /// ```
    pub fn insert(&mut self, method: &str, path: &str, value: T) -> Result<(), PatternError> {
        let tree = self.trees.entry(method.to_uppercase()).or_default();
        Self::insert_node(tree, &segments(path), value).map_err(|(existing, name)| {
            PatternError::ParamConflict {
                route: path.to_string(),
                existing,
                name,
            }
        })
    }

    /// Errors with (existing, new) parameter names on a conflict
    fn insert_node(node: &mut Node<T>, segments: &[&str], value: T) -> Result<(), (String, String)> {
        let Some((segment, rest)) = segments.split_first() else {
            node.value = Some(value);
            return Ok(());
        };

        if let Some(name) = param_name(segment) {
            let param = node.param_child.get_or_insert_with(|| {
                Box::new(ParamNode {
                    name: name.to_string(),
                    node: Node::default(),
                })
            });
            if param.name != name {
                return Err((param.name.clone(), name.to_string()));
            }
            Self::insert_node(&mut param.node, rest, value)
        } else if let Some(name) = segment.strip_prefix('*') {
            let wildcard_name = if name.is_empty() { "*" } else { name };
            node.wildcard_child = Some(Box::new(WildcardNode {
                name: wildcard_name.to_string(),
                value,
            }));
            Ok(())
        } else {
            let child = node.children.entry(segment.to_string()).or_default();
            Self::insert_node(child, rest, value)
        }
    }

    /// Find a matching route
    ///
    /// # Example
    /// ```
    /// use quay_router::Router;
    ///
    /// let mut router = Router::new();
    /// router.insert("GET", "/users/:id", 0).unwrap();
    ///
    /// let m = router.find("GET", "/users/42").unwrap();
    /// assert_eq!(*m.value, 0);
    /// assert_eq!(m.params[0], ("id".to_string(), "42".to_string()));
    /// ```
    pub fn find(&self, method: &str, path: &str) -> Option<Match<'_, T>> {
        let tree = self.trees.get(&method.to_uppercase())?;
        let mut params = Vec::new();
        Self::find_node(tree, &segments(path), &mut params)
    }

    /// Find a route, distinguishing unknown paths from unsupported methods
    ///
    /// HEAD falls back to GET.
    pub fn lookup(&self, method: &str, path: &str) -> Lookup<'_, T> {
        if let Some(m) = self.find(method, path) {
            return Lookup::Found(m);
        }
        if method.eq_ignore_ascii_case("HEAD") {
            if let Some(m) = self.find("GET", path) {
                return Lookup::Found(m);
            }
        }

        let mut allowed: Vec<String> = self
            .trees
            .keys()
            .filter(|m| self.find(m, path).is_some())
            .cloned()
            .collect();
        if allowed.is_empty() {
            return Lookup::NotFound;
        }
        allowed.sort();
        Lookup::MethodNotAllowed(allowed)
    }

    fn find_node<'a>(
        node: &'a Node<T>,
        segments: &[&str],
        params: &mut Vec<(String, String)>,
    ) -> Option<Match<'a, T>> {
        let Some((segment, rest)) = segments.split_first() else {
            return node.value.as_ref().map(|value| Match {
                value,
                params: params.clone(),
            });
        };

        if let Some(child) = node.children.get(*segment) {
            if let Some(m) = Self::find_node(child, rest, params) {
                return Some(m);
            }
        }

        if let Some(ref param) = node.param_child {
            params.push((param.name.clone(), segment.to_string()));
            if let Some(m) = Self::find_node(&param.node, rest, params) {
                return Some(m);
            }
            params.pop();
        }

        if let Some(ref wildcard) = node.wildcard_child {
            params.push((wildcard.name.clone(), segments.join("/")));
            return Some(Match {
                value: &wildcard.value,
                params: params.clone(),
            });
        }

        None
    }

    /// Check if a method has any routes registered
    pub fn has_method(&self, method: &str) -> bool {
        self.trees.contains_key(&method.to_uppercase())
    }

    /// Get all registered methods
    pub fn methods(&self) -> Vec<String> {
        self.trees.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_routes() {
        let mut router = Router::new();
        router.insert("GET", "/", 0).unwrap();
        router.insert("GET", "/test", 1).unwrap();
        router.insert("POST", "/test", 2).unwrap();

        assert_eq!(*router.find("GET", "/").unwrap().value, 0);
        assert_eq!(*router.find("GET", "/test").unwrap().value, 1);
        assert_eq!(*router.find("POST", "/test").unwrap().value, 2);
        assert!(router.find("GET", "/unknown").is_none());
    }

    #[test]
    fn test_brace_and_colon_params() {
        let mut router = Router::new();
        router.insert("GET", "/items/{id}", "braces").unwrap();
        router.insert("GET", "/users/:id/posts/:post_id", "colons").unwrap();

        let m = router.find("GET", "/items/9").unwrap();
        assert_eq!(*m.value, "braces");
        assert_eq!(m.params_map().get("id"), Some(&"9".to_string()));

        let m = router.find("GET", "/users/42/posts/99").unwrap();
        assert_eq!(
            m.params,
            vec![
                ("id".to_string(), "42".to_string()),
                ("post_id".to_string(), "99".to_string()),
            ]
        );
    }

    #[test]
    fn test_priority() {
        let mut router = Router::new();
        router.insert("GET", "/users/:id", 1).unwrap();
        router.insert("GET", "/users/me", 2).unwrap();
        router.insert("GET", "/users/*rest", 3).unwrap();

        assert_eq!(*router.find("GET", "/users/me").unwrap().value, 2);
        assert_eq!(*router.find("GET", "/users/123").unwrap().value, 1);
        let m = router.find("GET", "/users/123/extra").unwrap();
        assert_eq!(*m.value, 3);
        assert_eq!(m.params, vec![("rest".to_string(), "123/extra".to_string())]);
    }

    #[test]
    fn test_lookup_method_not_allowed() {
        let mut router = Router::new();
        router.insert("GET", "/test", 1).unwrap();
        router.insert("PUT", "/test", 2).unwrap();

        assert!(matches!(router.lookup("GET", "/test"), Lookup::Found(_)));
        assert_eq!(
            router.lookup("DELETE", "/test"),
            Lookup::MethodNotAllowed(vec!["GET".to_string(), "PUT".to_string()])
        );
        assert_eq!(router.lookup("GET", "/nope"), Lookup::NotFound);
    }

    #[test]
    fn test_head_falls_back_to_get() {
        let mut router = Router::new();
        router.insert("get", "/resource", 7).unwrap();

        match router.lookup("HEAD", "/resource") {
            Lookup::Found(m) => assert_eq!(*m.value, 7),
            other => panic!("unexpected lookup result: {:?}", other),
        }
        assert!(router.has_method("GET"));
        assert_eq!(router.methods(), vec!["GET".to_string()]);
    }

    #[test]
    fn test_trailing_slash() {
        let mut router = Router::new();
        router.insert("GET", "/users/", 1).unwrap();

        assert_eq!(*router.find("GET", "/users").unwrap().value, 1);
        assert_eq!(*router.find("GET", "/users/").unwrap().value, 1);
    }

    #[test]
    fn test_conflicting_param_names() {
        let mut router = Router::new();
        router.insert("GET", "/users/{id}", 1).unwrap();
        // same name in either syntax shares the node
        router.insert("GET", "/users/:id/posts", 2).unwrap();

        let err = router.insert("GET", "/users/{uid}/comments", 3).unwrap_err();
        assert_eq!(
            err,
            PatternError::ParamConflict {
                route: "/users/{uid}/comments".to_string(),
                existing: "id".to_string(),
                name: "uid".to_string(),
            }
        );
        assert!(router.find("GET", "/users/7/comments").is_none());
        assert_eq!(router.find("GET", "/users/7/posts").unwrap().params[0].0, "id");

        // each method has its own trie
        router.insert("DELETE", "/users/{uid}", 4).unwrap();
    }
}
