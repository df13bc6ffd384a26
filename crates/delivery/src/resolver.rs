use std::collections::HashSet;

use async_trait::async_trait;
use shared::{domain::Nation, error::ResolutionError};

/// Seam for the external recipient-specification evaluator.
#[async_trait]
pub trait RecipientResolver: Send + Sync {
    async fn resolve(&self, spec: &str) -> Result<Vec<Nation>, ResolutionError>;
}

/// Evaluates comma-separated nation lists. Names are canonicalized to
/// lowercase with underscores; duplicates collapse to the first
/// occurrence. Anything outside `[a-z0-9_-]` after canonicalization is
/// a syntax error.
pub struct ListResolver;

#[async_trait]
impl RecipientResolver for ListResolver {
    async fn resolve(&self, spec: &str) -> Result<Vec<Nation>, ResolutionError> {
        let mut seen = HashSet::new();
        let mut nations = Vec::new();
        for raw in spec.split(',') {
            let name = raw.trim();
            if name.is_empty() {
                continue;
            }
            let canonical = canonicalize(name)?;
            if seen.insert(canonical.clone()) {
                nations.push(Nation(canonical));
            }
        }
        Ok(nations)
    }
}

fn canonicalize(name: &str) -> Result<String, ResolutionError> {
    let canonical = name.to_ascii_lowercase().replace(' ', "_");
    if let Some(bad) = canonical
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-'))
    {
        return Err(ResolutionError::new(format!(
            "unexpected character '{bad}' in nation name \"{name}\""
        )));
    }
    Ok(canonical)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn canonicalizes_and_deduplicates() {
        let nations = ListResolver
            .resolve("Testlandia, the noOb, testlandia")
            .await
            .expect("resolve");
        assert_eq!(
            nations,
            vec![Nation::new("testlandia"), Nation::new("the_noob")]
        );
    }

    #[tokio::test]
    async fn empty_specification_resolves_to_nobody() {
        let nations = ListResolver.resolve("  , ,").await.expect("resolve");
        assert!(nations.is_empty());
    }

    #[tokio::test]
    async fn malformed_name_is_a_syntax_error() {
        let err = ListResolver
            .resolve("-nations [nonexistent_syntax")
            .await
            .expect_err("must fail");
        assert!(err.message.contains("unexpected character"));
    }
}
