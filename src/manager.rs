// Top-level dispatch façade.
//
// A request flows Pending -> Segmenting -> CacheLookup -> ProviderCall* ->
// Merging -> Done, failing over to the next strategy in the chain on
// provider trouble. Segments of one request translate concurrently on a
// bounded pool; merge waits for all of them and preserves input order.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::cache::{CacheManager, CachedTranslation};
use crate::config::{Config, EngineConfig, StrategyConfig};
use crate::error::{OtoyakuError, ProviderFailure, Result, StrategyFailure};
use crate::request::{
    CancelToken, SegmentOutcome, TranslationRequest, TranslationResult,
};
use crate::segment::{ContextProcessor, Segment, has_translatable_content};
use crate::strategy::{
    CallContext, ProbeStatus, ProviderFactory, StrategyDescriptor, StrategyRegistry,
};

/// Provenance label for segments that carried nothing translatable and were
/// passed through without a provider call.
const VERBATIM: &str = "verbatim";

#[derive(Debug, Clone, Copy)]
struct RetryPolicy {
    max_retries: u32,
    backoff_base_ms: u64,
}

impl RetryPolicy {
    fn delay_for_attempt(&self, attempt: u32, hint_ms: Option<u64>) -> Duration {
        match hint_ms {
            Some(ms) => Duration::from_millis(ms),
            None => Duration::from_millis(self.backoff_base_ms << attempt),
        }
    }
}

/// Orchestrates segmentation, cache lookup, provider dispatch with fallback,
/// and reassembly. Constructed with explicit references to its
/// collaborators; it discovers nothing through ambient state.
pub struct TranslationManager {
    engine: EngineConfig,
    registry: Arc<StrategyRegistry>,
    cache: Arc<CacheManager>,
    processor: Arc<ContextProcessor>,
    permits: Arc<Semaphore>,
}

impl TranslationManager {
    pub fn new(
        config: &Config,
        registry: Arc<StrategyRegistry>,
        cache: Arc<CacheManager>,
        processor: Arc<ContextProcessor>,
    ) -> Self {
        Self {
            engine: config.engine.clone(),
            registry,
            cache,
            processor,
            permits: Arc::new(Semaphore::new(config.engine.max_concurrency.max(1))),
        }
    }

    /// Translate one request under the configured overall timeout.
    pub async fn translate(self: &Arc<Self>, request: TranslationRequest) -> Result<TranslationResult> {
        self.translate_with_cancel(request, CancelToken::new()).await
    }

    /// Translate with a caller-held cancellation token. Cancellation
    /// propagates to every in-flight segment call, and canceled work never
    /// writes to the cache.
    pub async fn translate_with_cancel(
        self: &Arc<Self>,
        request: TranslationRequest,
        cancel: CancelToken,
    ) -> Result<TranslationResult> {
        let timeout = self.engine.request_timeout();
        match tokio::time::timeout(timeout, self.execute(request, cancel.clone())).await {
            Ok(result) => result,
            Err(_) => {
                cancel.cancel();
                Err(OtoyakuError::Timeout(format!(
                    "request exceeded {} s including retries",
                    timeout.as_secs()
                )))
            }
        }
    }

    /// Translate many independent requests over the same worker pool.
    /// Output order matches input order; each request fails or succeeds on
    /// its own.
    pub async fn translate_batch(
        self: &Arc<Self>,
        requests: Vec<TranslationRequest>,
    ) -> Vec<Result<TranslationResult>> {
        let mut join_set = JoinSet::new();
        let count = requests.len();
        for (index, request) in requests.into_iter().enumerate() {
            let manager = self.clone();
            join_set.spawn(async move { (index, manager.translate(request).await) });
        }

        let mut results: Vec<Option<Result<TranslationResult>>> = Vec::new();
        results.resize_with(count, || None);
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((index, result)) => results[index] = Some(result),
                Err(e) => warn!("Batch task failed to join: {}", e),
            }
        }
        results
            .into_iter()
            .map(|slot| {
                slot.unwrap_or_else(|| {
                    Err(OtoyakuError::Internal("batch task vanished".to_string()))
                })
            })
            .collect()
    }

    /// Build an adapter from config and register it. False means the name
    /// was taken or construction failed.
    pub fn register_strategy(&self, config: &StrategyConfig) -> bool {
        match ProviderFactory::build(config) {
            Ok(provider) => self.registry.register(&config.name, provider),
            Err(e) => {
                warn!("Cannot build strategy '{}': {}", config.name, e);
                false
            }
        }
    }

    pub fn list_strategies(&self) -> Vec<StrategyDescriptor> {
        self.registry.descriptors()
    }

    pub async fn invalidate_cache(&self, pattern: &str) -> Result<u64> {
        self.cache.invalidate(pattern).await
    }

    pub async fn test_strategy(&self, name: &str) -> Result<ProbeStatus> {
        let provider = self
            .registry
            .get(name)
            .ok_or_else(|| OtoyakuError::StrategyNotFound(name.to_string()))?;
        Ok(provider.test_connection().await)
    }

    async fn execute(
        self: &Arc<Self>,
        request: TranslationRequest,
        cancel: CancelToken,
    ) -> Result<TranslationResult> {
        validate(&request)?;

        // A pinned strategy with no fallbacks is an explicit choice; tell
        // the caller right away when the name does not exist.
        if let Some(pinned) = &request.strategy {
            if request.fallbacks.is_empty() && !self.registry.contains(pinned) {
                return Err(OtoyakuError::StrategyNotFound(pinned.clone()));
            }
        }

        let plan = self.processor.plan(&request.context)?;
        let masked = self.processor.mask(&request.text, &plan);
        if !masked.is_translatable() {
            debug!("Nothing translatable in request {}, passing through", request.id);
            return Ok(TranslationResult {
                request_id: request.id,
                text: request.text.clone(),
                segments: Vec::new(),
                cache_hit_ratio: 0.0,
            });
        }

        let segments = self.processor.split(&masked.text, &plan);
        let total = segments.len();
        let chain = self.resolve_chain(&request);
        if chain.is_empty() {
            return Err(OtoyakuError::InvalidRequest(
                "no translation strategy configured".to_string(),
            ));
        }
        info!(
            "Request {}: {} segment(s), chain [{}]",
            request.id,
            total,
            chain.join(", ")
        );

        let call = CallContext {
            source_lang: request.source_lang.clone(),
            target_lang: request.target_lang.clone(),
            domain: request.context.domain.clone(),
        };
        let context_fields: Vec<String> = request
            .context
            .fingerprint_fields()
            .into_iter()
            .map(str::to_string)
            .collect();
        let pinned = request.strategy.clone();
        let retry = RetryPolicy {
            max_retries: self.engine.max_retries,
            backoff_base_ms: self.engine.backoff_base_ms.max(1),
        };

        let mut join_set = JoinSet::new();
        for segment in segments {
            let manager = self.clone();
            let call = call.clone();
            let chain = chain.clone();
            let cancel = cancel.clone();
            let fields = context_fields.clone();
            let pinned = pinned.clone();
            join_set.spawn(async move {
                manager
                    .translate_segment(segment, call, chain, fields, pinned, retry, cancel)
                    .await
            });
        }

        let mut slots: Vec<Option<(String, SegmentOutcome)>> = Vec::new();
        slots.resize_with(total, || None);
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(Ok((ordinal, text, outcome))) => slots[ordinal] = Some((text, outcome)),
                Ok(Err(e)) => {
                    // One failed segment fails the whole request; partial
                    // results must never leak into a merged filename.
                    cancel.cancel();
                    join_set.abort_all();
                    return Err(e);
                }
                Err(e) => {
                    cancel.cancel();
                    join_set.abort_all();
                    return Err(OtoyakuError::Internal(format!("segment task failed: {}", e)));
                }
            }
        }

        let mut translated = Vec::with_capacity(total);
        let mut outcomes = Vec::with_capacity(total);
        for (ordinal, slot) in slots.into_iter().enumerate() {
            let (text, outcome) = slot.ok_or_else(|| {
                OtoyakuError::Internal(format!("segment {} produced no result", ordinal))
            })?;
            translated.push(Segment { ordinal, text });
            outcomes.push(outcome);
        }
        outcomes.sort_by_key(|o| o.ordinal);

        let merged = self.processor.merge(translated);
        let text = self.processor.restore(&merged, &masked.spans);
        let hits = outcomes.iter().filter(|o| o.cache_hit).count();
        let cache_hit_ratio = hits as f64 / total as f64;
        info!(
            "Request {} done: {}/{} segments from cache",
            request.id, hits, total
        );

        Ok(TranslationResult {
            request_id: request.id,
            text,
            segments: outcomes,
            cache_hit_ratio,
        })
    }

    /// One segment: fingerprint, coalesced cache fetch, fallback chain on
    /// miss. Returns the translated text plus provenance.
    #[allow(clippy::too_many_arguments)]
    async fn translate_segment(
        self: Arc<Self>,
        segment: Segment,
        call: CallContext,
        chain: Vec<String>,
        context_fields: Vec<String>,
        pinned: Option<String>,
        retry: RetryPolicy,
        cancel: CancelToken,
    ) -> Result<(usize, String, SegmentOutcome)> {
        let started = Instant::now();
        let ordinal = segment.ordinal;

        if !has_translatable_content(&segment.text) {
            return Ok((
                ordinal,
                segment.text,
                SegmentOutcome {
                    ordinal,
                    strategy: VERBATIM.to_string(),
                    cache_hit: false,
                    elapsed_ms: started.elapsed().as_millis() as u64,
                },
            ));
        }

        let field_refs: Vec<&str> = context_fields.iter().map(String::as_str).collect();
        let key = CacheManager::fingerprint(
            &segment.text,
            &call.source_lang,
            &call.target_lang,
            &field_refs,
            pinned.as_deref(),
        );

        let registry = self.registry.clone();
        let permits = self.permits.clone();
        let text = segment.text.clone();
        let (value, cache_hit) = self
            .cache
            .fetch_or_fill(&key, &segment.text, move || async move {
                let _permit = permits
                    .acquire_owned()
                    .await
                    .map_err(|_| OtoyakuError::Canceled)?;
                run_chain(&registry, &chain, &text, &call, retry, &cancel).await
            })
            .await?;

        Ok((
            ordinal,
            value.text,
            SegmentOutcome {
                ordinal,
                strategy: value.strategy,
                cache_hit,
                elapsed_ms: started.elapsed().as_millis() as u64,
            },
        ))
    }

    /// Preferred strategy, then the request's fallbacks, then the engine's
    /// configured chain; duplicates keep their first position.
    fn resolve_chain(&self, request: &TranslationRequest) -> Vec<String> {
        let mut chain: Vec<String> = Vec::new();
        let mut push = |name: &str, chain: &mut Vec<String>| {
            if !name.is_empty() && !chain.iter().any(|existing| existing == name) {
                chain.push(name.to_string());
            }
        };

        match &request.strategy {
            Some(preferred) => push(preferred, &mut chain),
            None => push(&self.engine.default_strategy, &mut chain),
        }
        let fallbacks = if request.fallbacks.is_empty() {
            &self.engine.fallback_order
        } else {
            &request.fallbacks
        };
        for name in fallbacks {
            push(name, &mut chain);
        }
        chain
    }
}

/// Walk the fallback chain for one segment. Rate limits retry in place with
/// exponential backoff up to the cap; unavailability and rejection advance
/// to the next strategy; exhaustion surfaces every per-strategy reason.
async fn run_chain(
    registry: &StrategyRegistry,
    chain: &[String],
    text: &str,
    call: &CallContext,
    retry: RetryPolicy,
    cancel: &CancelToken,
) -> Result<CachedTranslation> {
    let mut failures: Vec<StrategyFailure> = Vec::new();

    for name in chain {
        if cancel.is_canceled() {
            return Err(OtoyakuError::Canceled);
        }
        let Some(provider) = registry.get(name) else {
            debug!("Strategy '{}' not registered, advancing", name);
            failures.push(StrategyFailure {
                strategy: name.clone(),
                failure: ProviderFailure::Unavailable(
                    "not registered in strategy registry".to_string(),
                ),
            });
            continue;
        };

        let mut attempt: u32 = 0;
        loop {
            let outcome = tokio::select! {
                _ = cancel.cancelled() => return Err(OtoyakuError::Canceled),
                outcome = provider.translate(text, call) => outcome,
            };

            match outcome {
                Ok(translated) => {
                    return Ok(CachedTranslation {
                        text: translated,
                        strategy: name.clone(),
                    });
                }
                Err(ProviderFailure::RateLimited {
                    message,
                    retry_after_ms,
                }) if attempt < retry.max_retries => {
                    let delay = retry.delay_for_attempt(attempt, retry_after_ms);
                    attempt += 1;
                    warn!(
                        "Strategy '{}' rate limited ({}), retry {}/{} in {:?}",
                        name, message, attempt, retry.max_retries, delay
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(OtoyakuError::Canceled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(failure) => {
                    warn!("Strategy '{}' failed: {}", name, failure);
                    failures.push(StrategyFailure {
                        strategy: name.clone(),
                        failure,
                    });
                    break;
                }
            }
        }
    }

    Err(OtoyakuError::AllStrategiesExhausted(failures))
}

fn validate(request: &TranslationRequest) -> Result<()> {
    if request.text.trim().is_empty() {
        return Err(OtoyakuError::InvalidRequest("text is empty".to_string()));
    }
    validate_language_tag(&request.source_lang, "source language")?;
    validate_language_tag(&request.target_lang, "target language")?;
    Ok(())
}

fn validate_language_tag(tag: &str, which: &str) -> Result<()> {
    let well_formed = (2..=16).contains(&tag.len())
        && tag.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        && tag.chars().next().is_some_and(|c| c.is_ascii_alphabetic());
    if well_formed {
        Ok(())
    } else {
        Err(OtoyakuError::InvalidRequest(format!(
            "{} tag is malformed: {:?}",
            which, tag
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use crate::cache::store::MemoryStore;
    use crate::error::ProviderResult;
    use crate::request::TranslationContext;
    use crate::strategy::{Capabilities, Provider, ProviderMetrics};

    /// Test double that replays a script of failures before succeeding with
    /// a transform of the input, counting every attempt.
    struct ScriptedProvider {
        name: String,
        script: Mutex<VecDeque<ProviderFailure>>,
        transform: fn(&str) -> String,
        delay: Duration,
        calls: AtomicUsize,
    }

    impl ScriptedProvider {
        fn new(name: &str, script: Vec<ProviderFailure>) -> Arc<Self> {
            Self::with_transform(name, script, |text| format!("{}*", text))
        }

        fn with_transform(
            name: &str,
            script: Vec<ProviderFailure>,
            transform: fn(&str) -> String,
        ) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                script: Mutex::new(script.into()),
                transform,
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
            })
        }

        fn slow(name: &str, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                script: Mutex::new(VecDeque::new()),
                transform: |text| format!("{}*", text),
                delay,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Provider for ScriptedProvider {
        fn name(&self) -> &str {
            &self.name
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities {
                supports_batch: false,
                max_batch_size: 1,
                supported_languages: Vec::new(),
                requires_credential: false,
            }
        }

        fn metrics(&self) -> ProviderMetrics {
            ProviderMetrics::default()
        }

        async fn translate(&self, text: &str, _call: &CallContext) -> ProviderResult<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let scripted = self.script.lock().expect("script lock").pop_front();
            match scripted {
                Some(failure) => Err(failure),
                None => Ok((self.transform)(text)),
            }
        }

        async fn test_connection(&self) -> ProbeStatus {
            ProbeStatus::Reachable { latency_ms: 1 }
        }

        fn update_config(&self, _config: StrategyConfig) -> bool {
            true
        }
    }

    fn test_config() -> Config {
        let mut config = Config::default();
        config.engine.default_strategy = "a".to_string();
        config.engine.fallback_order = vec!["b".to_string(), "c".to_string()];
        config.engine.max_retries = 2;
        config.engine.backoff_base_ms = 1;
        config.engine.request_timeout_secs = 10;
        config.strategies.clear();
        config
    }

    fn build_manager(config: &Config, providers: &[Arc<ScriptedProvider>]) -> Arc<TranslationManager> {
        let registry = Arc::new(StrategyRegistry::new());
        for provider in providers {
            let name = provider.name().to_string();
            registry.register(&name, provider.clone());
        }
        let cache = Arc::new(CacheManager::new(
            Box::new(MemoryStore::new(Duration::from_secs(60), 256, 1 << 20)),
            true,
        ));
        let processor =
            Arc::new(ContextProcessor::new(&config.segment).expect("processor"));
        Arc::new(TranslationManager::new(config, registry, cache, processor))
    }

    fn unavailable() -> ProviderFailure {
        ProviderFailure::Unavailable("down".to_string())
    }

    fn rate_limited() -> ProviderFailure {
        ProviderFailure::RateLimited {
            message: "slow down".to_string(),
            retry_after_ms: None,
        }
    }

    #[tokio::test]
    async fn fallback_chain_reports_the_strategy_that_served() {
        let a = ScriptedProvider::new("a", vec![unavailable()]);
        let b = ScriptedProvider::new("b", vec![ProviderFailure::Rejected("policy".to_string())]);
        let c = ScriptedProvider::new("c", vec![]);
        let config = test_config();
        let manager = build_manager(&config, &[a.clone(), b.clone(), c.clone()]);

        let result = manager
            .translate(TranslationRequest::new("Wind_Gust", "en", "zh"))
            .await
            .expect("translate");
        assert!(result.segments.iter().all(|s| s.strategy == "c"));
        assert_eq!(a.calls(), 1);
        assert_eq!(b.calls(), 1);
        assert_eq!(c.calls(), 1);
    }

    #[tokio::test]
    async fn rate_limits_retry_up_to_the_cap_then_advance() {
        // Three rate limits exceed the cap of 2 retries; no fourth attempt.
        let a = ScriptedProvider::new("a", vec![rate_limited(), rate_limited(), rate_limited()]);
        let b = ScriptedProvider::new("b", vec![]);
        let config = test_config();
        let manager = build_manager(&config, &[a.clone(), b.clone()]);

        let result = manager
            .translate(TranslationRequest::new("Wind_Gust", "en", "zh"))
            .await
            .expect("translate");
        assert_eq!(a.calls(), 3);
        assert!(result.segments.iter().all(|s| s.strategy == "b"));
    }

    #[tokio::test]
    async fn rejection_is_never_retried_on_the_same_strategy() {
        let a = ScriptedProvider::new(
            "a",
            vec![ProviderFailure::Rejected("policy".to_string())],
        );
        let b = ScriptedProvider::new("b", vec![]);
        let config = test_config();
        let manager = build_manager(&config, &[a.clone(), b.clone()]);

        let result = manager
            .translate(TranslationRequest::new("Wind_Gust", "en", "zh"))
            .await
            .expect("translate");
        assert_eq!(a.calls(), 1);
        assert!(result.segments.iter().all(|s| s.strategy == "b"));
    }

    #[tokio::test]
    async fn exhausted_chain_carries_per_strategy_reasons() {
        let a = ScriptedProvider::new("a", vec![unavailable()]);
        let b = ScriptedProvider::new("b", vec![unavailable()]);
        let mut config = test_config();
        config.engine.fallback_order = vec!["b".to_string()];
        let manager = build_manager(&config, &[a, b]);

        let err = manager
            .translate(TranslationRequest::new("Wind_Gust", "en", "zh"))
            .await
            .expect_err("should exhaust");
        match err {
            OtoyakuError::AllStrategiesExhausted(failures) => {
                let names: Vec<&str> =
                    failures.iter().map(|f| f.strategy.as_str()).collect();
                assert_eq!(names, vec!["a", "b"]);
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn second_identical_request_is_served_from_cache() {
        let a = ScriptedProvider::new("a", vec![]);
        let config = test_config();
        let manager = build_manager(&config, &[a.clone()]);

        let first = manager
            .translate(TranslationRequest::new("Wind_Gust", "en", "zh"))
            .await
            .expect("first");
        let second = manager
            .translate(TranslationRequest::new("Wind_Gust", "en", "zh"))
            .await
            .expect("second");

        assert_eq!(first.text, second.text);
        assert_eq!(a.calls(), 1);
        assert!((second.cache_hit_ratio - 1.0).abs() < f64::EPSILON);
        assert!(second.segments.iter().all(|s| s.cache_hit));
    }

    #[tokio::test]
    async fn preserved_spans_survive_translation_verbatim() {
        let a = ScriptedProvider::with_transform("a", vec![], |text| {
            text.replace("Wind_Gust", "大风")
        });
        let config = test_config();
        let manager = build_manager(&config, &[a]);

        let result = manager
            .translate(TranslationRequest::new("Wind_Gust_{version}", "en", "zh"))
            .await
            .expect("translate");
        assert_eq!(result.text, "大风_{version}");
    }

    #[tokio::test]
    async fn empty_text_is_an_invalid_request() {
        let config = test_config();
        let manager = build_manager(&config, &[ScriptedProvider::new("a", vec![])]);
        let err = manager
            .translate(TranslationRequest::new("   ", "en", "zh"))
            .await
            .expect_err("empty");
        assert!(matches!(err, OtoyakuError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn malformed_target_language_is_an_invalid_request() {
        let config = test_config();
        let manager = build_manager(&config, &[ScriptedProvider::new("a", vec![])]);
        let err = manager
            .translate(TranslationRequest::new("Wind", "en", "7!"))
            .await
            .expect_err("bad tag");
        assert!(matches!(err, OtoyakuError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn all_preserved_input_short_circuits_without_any_call() {
        let a = ScriptedProvider::new("a", vec![]);
        let config = test_config();
        let manager = build_manager(&config, &[a.clone()]);

        let result = manager
            .translate(TranslationRequest::new("{file_id}{take}", "en", "zh"))
            .await
            .expect("translate");
        assert_eq!(result.text, "{file_id}{take}");
        assert!(result.segments.is_empty());
        assert_eq!(a.calls(), 0);
    }

    #[tokio::test]
    async fn canceled_request_fails_fast_and_writes_nothing() {
        let a = ScriptedProvider::slow("a", Duration::from_millis(200));
        let config = test_config();
        let manager = build_manager(&config, &[a]);

        let cancel = CancelToken::new();
        let task = {
            let manager = manager.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                manager
                    .translate_with_cancel(
                        TranslationRequest::new("Wind_Gust", "en", "zh"),
                        cancel,
                    )
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let err = task.await.expect("join").expect_err("canceled");
        assert!(matches!(err, OtoyakuError::Canceled));

        // The interrupted fill must not have polluted the cache.
        let stats = manager.cache.stats().await;
        assert_eq!(stats.entries, 0);
    }

    #[tokio::test]
    async fn unregister_during_flight_completes_call_then_rejects_new_ones() {
        let a = ScriptedProvider::slow("a", Duration::from_millis(100));
        let config = test_config();
        let manager = build_manager(&config, &[a]);

        let task = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .translate(
                        TranslationRequest::new("Wind_Gust", "en", "zh").with_strategy("a"),
                    )
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(manager.registry.unregister("a"));

        // The in-flight call captured its adapter and completes normally.
        let result = task.await.expect("join").expect("in-flight completes");
        assert_eq!(result.text, "Wind_Gust*");

        // A fresh request pinning "a" now fails with not-found.
        let err = manager
            .translate(TranslationRequest::new("Other_Name", "en", "zh").with_strategy("a"))
            .await
            .expect_err("gone");
        assert!(matches!(err, OtoyakuError::StrategyNotFound(name) if name == "a"));
    }

    #[tokio::test]
    async fn concurrent_identical_segments_coalesce_into_one_call() {
        let a = ScriptedProvider::slow("a", Duration::from_millis(50));
        let config = test_config();
        let manager = build_manager(&config, &[a.clone()]);

        let mut handles = Vec::new();
        for _ in 0..6 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move {
                manager
                    .translate(TranslationRequest::new("Wind_Gust", "en", "zh"))
                    .await
            }));
        }
        for handle in handles {
            let result = handle.await.expect("join").expect("translate");
            assert_eq!(result.text, "Wind_Gust*");
        }
        assert_eq!(a.calls(), 1);
    }

    #[tokio::test]
    async fn batch_preserves_request_order() {
        let a = ScriptedProvider::new("a", vec![]);
        let config = test_config();
        let manager = build_manager(&config, &[a]);

        let requests = vec![
            TranslationRequest::new("First_Name", "en", "zh"),
            TranslationRequest::new("Second_Name", "en", "zh"),
            TranslationRequest::new("Third_Name", "en", "zh"),
        ];
        let results = manager.translate_batch(requests).await;
        let texts: Vec<String> = results
            .into_iter()
            .map(|r| r.expect("translate").text)
            .collect();
        assert_eq!(texts, vec!["First_Name*", "Second_Name*", "Third_Name*"]);
    }

    #[tokio::test]
    async fn long_input_merges_in_original_order() {
        let a = ScriptedProvider::with_transform("a", vec![], |text| text.to_uppercase());
        let mut config = test_config();
        config.segment.max_segment_length = 10;
        config.segment.min_segment_length = 3;
        let manager = build_manager(&config, &[a]);

        let input = "alpha_beta_gamma_delta_epsilon_zeta";
        let result = manager
            .translate(TranslationRequest::new(input, "en", "zh"))
            .await
            .expect("translate");
        assert_eq!(result.text, input.to_uppercase());
        assert!(result.segments.len() > 1);
        let ordinals: Vec<usize> = result.segments.iter().map(|s| s.ordinal).collect();
        let mut sorted = ordinals.clone();
        sorted.sort_unstable();
        assert_eq!(ordinals, sorted);
    }

    #[tokio::test]
    async fn context_fields_separate_cache_entries() {
        let a = ScriptedProvider::new("a", vec![]);
        let config = test_config();
        let manager = build_manager(&config, &[a.clone()]);

        let plain = TranslationRequest::new("Wind_Gust", "en", "zh");
        let hinted = TranslationRequest::new("Wind_Gust", "en", "zh").with_context(
            TranslationContext {
                domain: Some("weather".to_string()),
                ..Default::default()
            },
        );
        manager.translate(plain).await.expect("plain");
        manager.translate(hinted).await.expect("hinted");
        assert_eq!(a.calls(), 2);
    }

    #[tokio::test]
    async fn test_strategy_reports_not_found_for_unknown_names() {
        let config = test_config();
        let manager = build_manager(&config, &[ScriptedProvider::new("a", vec![])]);
        assert!(matches!(
            manager.test_strategy("ghost").await,
            Err(OtoyakuError::StrategyNotFound(_))
        ));
        assert!(matches!(
            manager.test_strategy("a").await,
            Ok(ProbeStatus::Reachable { .. })
        ));
    }
}
