//! quay-router: Zero-dependency URL matching
//!
//! Two matchers shared by the quay server:
//!
//! - [`PatternTable`] - servlet-style URL patterns used to pick the target of a
//!   request (route handler, REST application mount, static files).
//! - [`Router`] - a per-method segment trie with parameters and wildcards, used
//!   to dispatch inside a REST application.
//!
//! ## Pattern Syntax
//! - `/exact/path` - exact match
//! - `/prefix/*` - prefix match (also matches `/prefix` itself)
//! - `*.ext` - extension match on the last segment
//! - `/` - default target
//!
//! ## Precedence
//! 1. Exact match (highest)
//! 2. Longest prefix match
//! 3. Extension match
//! 4. Default (lowest)
//!
//! ## Example
//! ```
//! use quay_router::{PatternTable, UrlPattern};
//!
//! let mut table = PatternTable::new();
//! table.insert(&UrlPattern::parse("/api/*").unwrap(), "rest").unwrap();
//! table.insert(&UrlPattern::parse("/").unwrap(), "static").unwrap();
//!
//! let m = table.lookup("/api/users").unwrap();
//! assert_eq!(*m.value, "rest");
//! assert_eq!(m.path_info, Some("/users"));
//! assert_eq!(*table.lookup("/index.html").unwrap().value, "static");
//! ```

mod pattern;
mod trie;

pub use pattern::{PatternError, PatternMatch, PatternTable, UrlPattern};
pub use trie::{Lookup, Match, Router};
