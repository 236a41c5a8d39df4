//! Linking-code resolution via sponsor prefix patterns.
//!
//! Codes are normalized (uppercased, separators stripped) and matched
//! longest-prefix-first against the active pattern set, so a specific
//! sub-brand prefix like `CALL` beats a shorter generic `CA`. The active set
//! is cached with a TTL; staleness is bounded, not eliminated.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use super::models::SponsorPattern;
use super::repository::{RepositoryError, SponsorPatternRepository};

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(5 * 60);
/// Longest a cached set may be served past its TTL during a store outage.
pub const DEFAULT_MAX_STALE: Duration = Duration::from_secs(30 * 60);

/// Result of resolving a linking code. No match is a value, not an error;
/// callers map it to their "unknown sponsor prefix" condition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PatternMatch {
    Matched(SponsorPattern),
    NotMatched,
}

/// Uppercase and strip non-alphanumeric separators such as `-`.
#[must_use]
pub fn normalize_code(code: &str) -> String {
    code.chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

struct CachedPatterns {
    patterns: Vec<SponsorPattern>,
    fetched_at: Instant,
}

/// Cached longest-prefix matcher over the sponsor pattern store.
pub struct SponsorPatternMatcher {
    repository: Arc<dyn SponsorPatternRepository>,
    ttl: Duration,
    max_stale: Duration,
    cache: RwLock<Option<CachedPatterns>>,
    // Collapses concurrent refreshes into one in-flight reload.
    refresh_lock: Mutex<()>,
}

impl SponsorPatternMatcher {
    #[must_use]
    pub fn new(repository: Arc<dyn SponsorPatternRepository>, ttl: Duration) -> Self {
        Self {
            repository,
            ttl,
            max_stale: DEFAULT_MAX_STALE,
            cache: RwLock::new(None),
            refresh_lock: Mutex::new(()),
        }
    }

    /// Cap how long a cached set may outlive its TTL when reloads fail.
    #[must_use]
    pub fn with_max_stale(mut self, max_stale: Duration) -> Self {
        self.max_stale = max_stale;
        self
    }

    /// Resolve a linking code to its sponsor pattern.
    ///
    /// # Errors
    ///
    /// Propagates repository errors when the cache is cold and the reload
    /// fails; a stale-but-present cache is served instead of failing.
    pub async fn find_sponsor_by_linking_code(
        &self,
        code: &str,
    ) -> Result<PatternMatch, RepositoryError> {
        let normalized = normalize_code(code);
        if normalized.is_empty() {
            return Ok(PatternMatch::NotMatched);
        }

        let patterns = self.active_patterns().await?;
        Ok(match_longest_prefix(&patterns, &normalized))
    }

    /// Snapshot of the active patterns, refreshing the cache when stale.
    ///
    /// # Errors
    ///
    /// Propagates repository errors only when no cached set exists.
    pub async fn get_active_patterns(&self) -> Result<Vec<SponsorPattern>, RepositoryError> {
        self.active_patterns().await
    }

    /// Force an immediate reload from the repository.
    ///
    /// # Errors
    ///
    /// Propagates repository errors; the previous cache is left in place.
    pub async fn refresh_patterns(&self) -> Result<(), RepositoryError> {
        let _guard = self.refresh_lock.lock().await;
        self.reload().await
    }

    async fn active_patterns(&self) -> Result<Vec<SponsorPattern>, RepositoryError> {
        if let Some(patterns) = self.fresh_snapshot().await {
            return Ok(patterns);
        }

        let _guard = self.refresh_lock.lock().await;
        // Another caller may have refreshed while we waited for the lock.
        if let Some(patterns) = self.fresh_snapshot().await {
            return Ok(patterns);
        }

        match self.reload().await {
            Ok(()) => {}
            Err(err) => {
                // Serve stale data inside an outage rather than failing every
                // lookup, but only up to max_stale past the fetch; a cold
                // cache has nothing to serve and must fail.
                let cache = self.cache.read().await;
                if let Some(cached) = cache
                    .as_ref()
                    .filter(|cached| cached.fetched_at.elapsed() <= self.ttl + self.max_stale)
                {
                    debug!("serving stale sponsor patterns after refresh failure: {err}");
                    return Ok(cached.patterns.clone());
                }
                return Err(err);
            }
        }

        let cache = self.cache.read().await;
        Ok(cache
            .as_ref()
            .map(|cached| cached.patterns.clone())
            .unwrap_or_default())
    }

    async fn fresh_snapshot(&self) -> Option<Vec<SponsorPattern>> {
        let cache = self.cache.read().await;
        cache
            .as_ref()
            .filter(|cached| cached.fetched_at.elapsed() < self.ttl)
            .map(|cached| cached.patterns.clone())
    }

    async fn reload(&self) -> Result<(), RepositoryError> {
        let mut patterns = self.repository.get_all_active_patterns().await?;
        // Longest prefix first; ties break lexicographically for determinism.
        patterns.sort_by(|a, b| {
            b.pattern_prefix
                .len()
                .cmp(&a.pattern_prefix.len())
                .then_with(|| a.pattern_prefix.cmp(&b.pattern_prefix))
        });
        debug!("sponsor pattern cache reloaded: {} patterns", patterns.len());

        let mut cache = self.cache.write().await;
        *cache = Some(CachedPatterns {
            patterns,
            fetched_at: Instant::now(),
        });
        Ok(())
    }
}

/// First prefix match over a longest-first sorted active pattern list.
fn match_longest_prefix(patterns: &[SponsorPattern], normalized_code: &str) -> PatternMatch {
    for pattern in patterns {
        if !pattern.active {
            continue;
        }
        let prefix = normalize_code(&pattern.pattern_prefix);
        if !prefix.is_empty() && normalized_code.starts_with(&prefix) {
            return PatternMatch::Matched(pattern.clone());
        }
    }
    PatternMatch::NotMatched
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    fn pattern(prefix: &str, sponsor: &str, active: bool) -> SponsorPattern {
        SponsorPattern {
            pattern_prefix: prefix.to_string(),
            sponsor_id: sponsor.to_string(),
            sponsor_name: format!("{sponsor} Trials"),
            portal_url: format!("https://{sponsor}.example.com"),
            firestore_project: format!("{sponsor}-prod"),
            active,
            created_at: Utc::now(),
            decommissioned_at: if active { None } else { Some(Utc::now()) },
        }
    }

    struct StubPatternRepository {
        patterns: StdMutex<Vec<SponsorPattern>>,
        loads: AtomicUsize,
        fail: std::sync::atomic::AtomicBool,
    }

    impl StubPatternRepository {
        fn with(patterns: Vec<SponsorPattern>) -> Arc<Self> {
            Arc::new(Self {
                patterns: StdMutex::new(patterns),
                loads: AtomicUsize::new(0),
                fail: std::sync::atomic::AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl SponsorPatternRepository for StubPatternRepository {
        async fn get_all_active_patterns(&self) -> Result<Vec<SponsorPattern>, RepositoryError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(RepositoryError::Unavailable("stub outage".to_string()));
            }
            self.loads.fetch_add(1, Ordering::SeqCst);
            let patterns = self.patterns.lock().expect("stub poisoned");
            Ok(patterns.iter().filter(|p| p.active).cloned().collect())
        }

        async fn find_by_linking_code(
            &self,
            normalized_code: &str,
        ) -> Result<Option<SponsorPattern>, RepositoryError> {
            let active = self.get_all_active_patterns().await?;
            let mut sorted = active;
            sorted.sort_by(|a, b| b.pattern_prefix.len().cmp(&a.pattern_prefix.len()));
            Ok(match match_longest_prefix(&sorted, normalized_code) {
                PatternMatch::Matched(pattern) => Some(pattern),
                PatternMatch::NotMatched => None,
            })
        }

        async fn create_pattern(&self, pattern: SponsorPattern) -> Result<(), RepositoryError> {
            self.patterns.lock().expect("stub poisoned").push(pattern);
            Ok(())
        }

        async fn decommission_pattern(&self, sponsor_id: &str) -> Result<(), RepositoryError> {
            let mut patterns = self.patterns.lock().expect("stub poisoned");
            for pattern in patterns.iter_mut().filter(|p| p.sponsor_id == sponsor_id) {
                pattern.active = false;
                pattern.decommissioned_at = Some(Utc::now());
            }
            Ok(())
        }
    }

    #[test]
    fn normalize_strips_separators_and_uppercases() {
        assert_eq!(normalize_code("call-1234"), "CALL1234");
        assert_eq!(normalize_code(" ca 99_12.34 "), "CA991234");
        assert_eq!(normalize_code("---"), "");
    }

    #[tokio::test]
    async fn longer_prefix_wins() -> Result<(), RepositoryError> {
        let repo = StubPatternRepository::with(vec![
            pattern("CA", "sponsor-a", true),
            pattern("CALL", "sponsor-b", true),
        ]);
        let matcher = SponsorPatternMatcher::new(repo, DEFAULT_CACHE_TTL);

        let result = matcher.find_sponsor_by_linking_code("CALL1234").await?;
        let PatternMatch::Matched(matched) = result else {
            panic!("expected a match");
        };
        assert_eq!(matched.sponsor_id, "sponsor-b");

        let result = matcher.find_sponsor_by_linking_code("CA991234").await?;
        let PatternMatch::Matched(matched) = result else {
            panic!("expected a match");
        };
        assert_eq!(matched.sponsor_id, "sponsor-a");
        Ok(())
    }

    #[tokio::test]
    async fn dashed_codes_match_dashed_prefixes() -> Result<(), RepositoryError> {
        let repo = StubPatternRepository::with(vec![pattern("CALL-", "sponsor-b", true)]);
        let matcher = SponsorPatternMatcher::new(repo, DEFAULT_CACHE_TTL);

        let result = matcher.find_sponsor_by_linking_code("call-5678").await?;
        assert!(matches!(result, PatternMatch::Matched(_)));
        Ok(())
    }

    #[tokio::test]
    async fn decommissioned_pattern_is_excluded() -> Result<(), RepositoryError> {
        let repo = StubPatternRepository::with(vec![
            pattern("CA", "sponsor-a", false),
            pattern("ZZ", "sponsor-z", true),
        ]);
        let matcher = SponsorPatternMatcher::new(repo, DEFAULT_CACHE_TTL);

        let result = matcher.find_sponsor_by_linking_code("CA991234").await?;
        assert_eq!(result, PatternMatch::NotMatched);
        Ok(())
    }

    #[tokio::test]
    async fn unknown_prefix_is_not_matched_and_not_an_error() -> Result<(), RepositoryError> {
        let repo = StubPatternRepository::with(vec![pattern("CA", "sponsor-a", true)]);
        let matcher = SponsorPatternMatcher::new(repo, DEFAULT_CACHE_TTL);

        assert_eq!(
            matcher.find_sponsor_by_linking_code("XX000000").await?,
            PatternMatch::NotMatched
        );
        assert_eq!(
            matcher.find_sponsor_by_linking_code("").await?,
            PatternMatch::NotMatched
        );
        Ok(())
    }

    #[tokio::test]
    async fn cache_serves_repeat_lookups_without_reloading() -> Result<(), RepositoryError> {
        let repo = StubPatternRepository::with(vec![pattern("CA", "sponsor-a", true)]);
        let matcher = SponsorPatternMatcher::new(repo.clone(), DEFAULT_CACHE_TTL);

        for _ in 0..10 {
            matcher.find_sponsor_by_linking_code("CA123").await?;
        }
        assert_eq!(repo.loads.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test]
    async fn refresh_patterns_picks_up_new_rows() -> Result<(), RepositoryError> {
        let repo = StubPatternRepository::with(vec![pattern("CA", "sponsor-a", true)]);
        let matcher = SponsorPatternMatcher::new(repo.clone(), DEFAULT_CACHE_TTL);

        assert_eq!(
            matcher.find_sponsor_by_linking_code("NEW123").await?,
            PatternMatch::NotMatched
        );

        repo.create_pattern(pattern("NEW", "sponsor-n", true)).await?;
        // Within the TTL the stale cache still answers.
        assert_eq!(
            matcher.find_sponsor_by_linking_code("NEW123").await?,
            PatternMatch::NotMatched
        );

        matcher.refresh_patterns().await?;
        assert!(matches!(
            matcher.find_sponsor_by_linking_code("NEW123").await?,
            PatternMatch::Matched(_)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn stale_cache_is_served_during_an_outage() -> Result<(), RepositoryError> {
        let repo = StubPatternRepository::with(vec![pattern("CA", "sponsor-a", true)]);
        let matcher = SponsorPatternMatcher::new(repo.clone(), Duration::from_millis(0));

        // Warm the cache, then fail the store. TTL of zero forces a reload
        // attempt on every lookup.
        matcher.refresh_patterns().await?;
        repo.fail.store(true, Ordering::SeqCst);

        assert!(matches!(
            matcher.find_sponsor_by_linking_code("CA123").await?,
            PatternMatch::Matched(_)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn stale_cache_past_the_cap_fails_closed() -> Result<(), RepositoryError> {
        let repo = StubPatternRepository::with(vec![pattern("CA", "sponsor-a", true)]);
        let matcher = SponsorPatternMatcher::new(repo.clone(), Duration::from_millis(0))
            .with_max_stale(Duration::ZERO);

        matcher.refresh_patterns().await?;
        repo.fail.store(true, Ordering::SeqCst);

        // With a zero cap the warm cache is already past its stale budget.
        let result = matcher.find_sponsor_by_linking_code("CA123").await;
        assert!(matches!(result, Err(RepositoryError::Unavailable(_))));
        Ok(())
    }

    #[tokio::test]
    async fn cold_cache_outage_fails_closed() {
        let repo = StubPatternRepository::with(vec![pattern("CA", "sponsor-a", true)]);
        repo.fail.store(true, Ordering::SeqCst);
        let matcher = SponsorPatternMatcher::new(repo, DEFAULT_CACHE_TTL);

        let result = matcher.find_sponsor_by_linking_code("CA123").await;
        assert!(matches!(result, Err(RepositoryError::Unavailable(_))));
    }
}
