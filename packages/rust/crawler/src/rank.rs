//! Relevance ranking for discovered links.

use regex::Regex;
use url::Url;

use batchscout_shared::{BatchScoutError, Result};

/// Scores a link by how many selection patterns match its path.
#[derive(Debug, Clone)]
pub(crate) struct LinkRanker {
    patterns: Vec<Regex>,
}

impl LinkRanker {
    /// Compile `patterns` case-insensitively. An invalid pattern is a
    /// configuration error.
    pub fn new(patterns: &[String]) -> Result<Self> {
        let patterns = patterns
            .iter()
            .map(|p| {
                Regex::new(&format!("(?i){p}"))
                    .map_err(|e| BatchScoutError::config(format!("invalid select pattern `{p}`: {e}")))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    pub fn score(&self, url: &Url) -> usize {
        let path = url.path();
        self.patterns.iter().filter(|p| p.is_match(path)).count()
    }

    /// The `limit` best links, highest score first. Ties keep discovery order.
    pub fn top(&self, links: Vec<Url>, limit: usize) -> Vec<Url> {
        let mut scored: Vec<(usize, Url)> = links
            .into_iter()
            .map(|url| (self.score(&url), url))
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0));
        scored.into_iter().take(limit).map(|(_, url)| url).collect()
    }
}
