use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use uuid::Uuid;

/// One translation call. Built by the caller, never mutated by the engine.
#[derive(Debug, Clone)]
pub struct TranslationRequest {
    pub id: Uuid,
    /// Filename fragment or free text to translate
    pub text: String,
    /// BCP-47-ish source language tag
    pub source_lang: String,
    /// Target language tag; validated before dispatch
    pub target_lang: String,
    pub context: TranslationContext,
    /// Strategy tried first; engine default when `None`
    pub strategy: Option<String>,
    /// Strategies tried after the preferred one, in order
    pub fallbacks: Vec<String>,
}

impl TranslationRequest {
    pub fn new(
        text: impl Into<String>,
        source_lang: impl Into<String>,
        target_lang: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            text: text.into(),
            source_lang: source_lang.into(),
            target_lang: target_lang.into(),
            context: TranslationContext::default(),
            strategy: None,
            fallbacks: Vec::new(),
        }
    }

    pub fn with_context(mut self, context: TranslationContext) -> Self {
        self.context = context;
        self
    }

    pub fn with_strategy(mut self, strategy: impl Into<String>) -> Self {
        self.strategy = Some(strategy.into());
        self
    }

    pub fn with_fallbacks(mut self, fallbacks: Vec<String>) -> Self {
        self.fallbacks = fallbacks;
        self
    }
}

/// Auxiliary fields supplied by the caller. Opaque to the engine: they feed
/// the cache fingerprint and the segmentation plan, nothing else.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TranslationContext {
    /// Domain hint, e.g. "sound-effects"
    pub domain: Option<String>,
    /// Category hints from the naming collaborator
    pub category_hints: Vec<String>,
    /// Naming-template hint, fingerprint input only
    pub template_hint: Option<String>,
    /// Per-request override of the configured preservation patterns
    pub preserve_patterns: Option<Vec<String>>,
    /// Per-request override of the segment length bounds
    pub max_segment_length: Option<usize>,
    pub min_segment_length: Option<usize>,
}

impl TranslationContext {
    /// Context fields that participate in the cache fingerprint, in a fixed
    /// order. Segmentation overrides are excluded: they change how text is
    /// cut, and each cut is fingerprinted on its own content.
    pub fn fingerprint_fields(&self) -> Vec<&str> {
        let mut fields: Vec<&str> = Vec::new();
        if let Some(domain) = &self.domain {
            fields.push(domain.as_str());
        }
        for hint in &self.category_hints {
            fields.push(hint.as_str());
        }
        if let Some(template) = &self.template_hint {
            fields.push(template.as_str());
        }
        fields
    }
}

/// Provenance for one segment of a completed request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentOutcome {
    pub ordinal: usize,
    /// Registry name of the strategy that served this segment
    pub strategy: String,
    pub cache_hit: bool,
    pub elapsed_ms: u64,
}

/// Output of a completed request. Created once, returned to the caller,
/// not retained by the engine.
#[derive(Debug, Clone)]
pub struct TranslationResult {
    pub request_id: Uuid,
    pub text: String,
    pub segments: Vec<SegmentOutcome>,
    pub cache_hit_ratio: f64,
}

/// Request-level cancellation handle. Cloned into every in-flight segment
/// task; a canceled request fails fast and writes nothing to the cache.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Debug, Default)]
struct CancelInner {
    canceled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.canceled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.canceled.load(Ordering::SeqCst)
    }

    /// Resolves when `cancel` is called. Safe against the set-then-notify
    /// race: interest is registered before the flag is checked.
    pub async fn cancelled(&self) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_canceled() {
            return;
        }
        notified.await;
    }
}
