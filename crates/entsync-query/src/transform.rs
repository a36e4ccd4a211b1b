//! Query-string services.
//!
//! Rewriting (macro expansion, constant substitution, entity-name mapping) is
//! supplied by the application through [`QueryTransformer`]. Parsing needs are
//! small: the loader asks a [`QueryParser`] for parameter names, the entity
//! names a query touches and its `where` clause. [`RegexQueryParser`] covers
//! the query dialect rendered by [`crate::LoadSpec::build`].

use entsync_core::{Error, Result};
use regex::Regex;
use std::collections::BTreeSet;

/// Pure `string -> string` rewrite applied to non-native query text.
pub trait QueryTransformer: Send + Sync {
    fn transform(&self, query: &str) -> Result<String>;
}

/// Read-only facts about query text.
pub trait QueryParser: Send + Sync {
    /// Named parameters, in order of first appearance.
    fn parameter_names(&self, query: &str) -> Vec<String>;

    /// Main entity of the query.
    fn entity_name(&self, query: &str) -> Option<String>;

    /// Every entity named in `from` and `join` clauses.
    fn entity_names(&self, query: &str) -> BTreeSet<String>;

    /// Text of the `where` clause, without the keyword.
    fn where_clause(&self, query: &str) -> Option<String>;
}

/// [`QueryParser`] built on regular expressions.
#[derive(Debug, Clone)]
pub struct RegexQueryParser {
    parameter: Regex,
    from: Regex,
    join: Regex,
    where_clause: Regex,
}

impl RegexQueryParser {
    pub fn new() -> Result<Self> {
        let compile = |pattern: &str| {
            Regex::new(pattern)
                .map_err(|e| Error::Config(format!("invalid query parser pattern {pattern:?}: {e}")))
        };
        Ok(Self {
            parameter: compile(r":([A-Za-z_][A-Za-z0-9_]*)")?,
            from: compile(r"(?i)\bfrom\s+([A-Za-z_][A-Za-z0-9_$]*)")?,
            join: compile(r"(?i)\bjoin\s+([A-Za-z_][A-Za-z0-9_$]*)\s")?,
            where_clause: compile(r"(?is)\bwhere\s+(.+?)(?:\s+order\s+by\s+.*|\s+group\s+by\s+.*)?$")?,
        })
    }
}

impl QueryParser for RegexQueryParser {
    fn parameter_names(&self, query: &str) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for caps in self.parameter.captures_iter(query) {
            let name = &caps[1];
            if !names.iter().any(|n| n == name) {
                names.push(name.to_string());
            }
        }
        names
    }

    fn entity_name(&self, query: &str) -> Option<String> {
        self.from.captures(query).map(|c| c[1].to_string())
    }

    fn entity_names(&self, query: &str) -> BTreeSet<String> {
        self.from
            .captures_iter(query)
            .chain(self.join.captures_iter(query))
            .map(|c| c[1].to_string())
            .collect()
    }

    fn where_clause(&self, query: &str) -> Option<String> {
        self.where_clause
            .captures(query)
            .map(|c| c[1].trim().to_string())
    }
}
