//! Table name filters
//!
//! An empty filter set matches every table. Otherwise a table matches if its
//! name matches one of the glob patterns (`*`, `?` and `[...]` classes).

use glob::{Pattern, PatternError};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableFilter {
    patterns: Vec<Pattern>,
}

impl TableFilter {
    /// Compile the patterns, failing on the first invalid one
    pub fn new<I, S>(patterns: I) -> Result<Self, PatternError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = patterns
            .into_iter()
            .map(|p| Pattern::new(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    /// Filter matching every table
    pub fn all() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn matches(&self, table_name: &str) -> bool {
        self.is_empty() || self.patterns.iter().any(|p| p.matches(table_name))
    }
}
