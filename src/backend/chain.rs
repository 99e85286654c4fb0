//! Fallback chain executor.
//!
//! Tries registered backends in ascending priority order against one item
//! and stops at the first result that clears the confidence threshold
//! within budget. Backend errors and timeouts are absorbed as failed
//! attempts; an exhausted chain yields the best result obtained, tagged
//! low confidence. An item is never silently dropped.

use crate::backend::{BackendRegistry, CostLedger};
use crate::models::{EnrichedItem, ExtractionConfig, ExtractionResult, Item};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Tunables for the chain executor.
#[derive(Debug, Clone)]
pub struct ChainConfig {
    /// Minimum confidence for acceptance
    pub min_confidence: f64,
    /// Max spend per item across attempted backends, in USD
    pub per_item_budget_usd: f64,
    /// Per-backend invocation timeout
    pub backend_timeout: Duration,
}

impl From<&ExtractionConfig> for ChainConfig {
    fn from(config: &ExtractionConfig) -> Self {
        Self {
            min_confidence: config.min_confidence,
            per_item_budget_usd: config.per_item_budget_usd,
            backend_timeout: Duration::from_secs(config.backend_timeout_secs),
        }
    }
}

/// Terminal outcome of running the chain for one item.
///
/// Exactly one result is retained; `attempts` holds every result produced
/// along the way and lives only until the outcome is folded into the
/// session output.
#[derive(Debug, Clone)]
pub struct ChainOutcome {
    pub item_id: String,
    pub source: String,
    /// The accepted result, or the best-confidence result obtained
    pub result: ExtractionResult,
    /// True when no backend met the acceptance threshold within budget
    pub low_confidence: bool,
    /// All results produced for this item, in attempt order
    pub attempts: Vec<ExtractionResult>,
}

impl ChainOutcome {
    /// Total cost spent on this item, in USD.
    pub fn item_cost_usd(&self) -> f64 {
        self.attempts.iter().map(|a| a.cost_usd).sum()
    }

    /// Fold into the per-item record persisted downstream.
    pub fn into_enriched(self) -> EnrichedItem {
        let item_cost_usd = self.item_cost_usd();
        EnrichedItem {
            item_id: self.item_id,
            source: self.source,
            low_confidence: self.low_confidence,
            attempts: self.attempts.len() as u32,
            item_cost_usd,
            result: self.result,
        }
    }
}

/// Priority-ordered fallback executor over a backend registry.
///
/// Shares no mutable state across items except the run-level cost ledger.
pub struct FallbackChain {
    registry: BackendRegistry,
    config: ChainConfig,
    ledger: Arc<CostLedger>,
}

impl FallbackChain {
    pub fn new(registry: BackendRegistry, config: ChainConfig, ledger: Arc<CostLedger>) -> Self {
        Self {
            registry,
            config,
            ledger,
        }
    }

    /// The run-level cost ledger.
    pub fn ledger(&self) -> &Arc<CostLedger> {
        &self.ledger
    }

    /// Run the chain for one item. Infallible: every item gets exactly
    /// one retained result.
    pub async fn process(&self, item: &Item) -> ChainOutcome {
        let mut attempts: Vec<ExtractionResult> = Vec::new();
        let mut item_spent = 0.0_f64;

        for entry in self.registry.iter() {
            let declared_cost = entry.backend.cost_per_item();

            if declared_cost > 0.0 {
                // Per-item ceiling first, then the run-level ledger, so a
                // skipped backend never consumes run budget.
                if item_spent + declared_cost > self.config.per_item_budget_usd {
                    debug!(
                        item = %item.id,
                        backend = %entry.name,
                        cost = declared_cost,
                        "Skipping backend: per-item budget exceeded"
                    );
                    continue;
                }
                if !self.ledger.try_charge(declared_cost) {
                    debug!(
                        item = %item.id,
                        backend = %entry.name,
                        cost = declared_cost,
                        remaining = self.ledger.remaining_usd(),
                        "Skipping backend: run budget exhausted"
                    );
                    continue;
                }
                item_spent += declared_cost;
            }

            let start = Instant::now();
            let attempt = tokio::time::timeout(
                self.config.backend_timeout,
                entry.backend.attempt(item),
            )
            .await;
            let elapsed_ms = start.elapsed().as_millis() as u64;

            let result = match attempt {
                Ok(Ok(mut result)) => {
                    // The ledger charged the declared cost; the retained
                    // result must agree with it.
                    result.cost_usd = declared_cost;
                    result.elapsed_ms = elapsed_ms;
                    result
                }
                Ok(Err(e)) => {
                    warn!(item = %item.id, backend = %entry.name, error = %e, "Backend failed");
                    ExtractionResult::failed(&entry.name, e.to_string(), declared_cost, elapsed_ms)
                }
                Err(_) => {
                    warn!(
                        item = %item.id,
                        backend = %entry.name,
                        timeout_secs = self.config.backend_timeout.as_secs(),
                        "Backend timed out"
                    );
                    ExtractionResult::failed(
                        &entry.name,
                        format!(
                            "timed out after {}s",
                            self.config.backend_timeout.as_secs()
                        ),
                        declared_cost,
                        elapsed_ms,
                    )
                }
            };

            let accepted = result.success && result.confidence >= self.config.min_confidence;
            attempts.push(result.clone());

            if accepted {
                return ChainOutcome {
                    item_id: item.id.clone(),
                    source: item.source.clone(),
                    result,
                    low_confidence: false,
                    attempts,
                };
            }
        }

        // Chain exhausted: keep the best-confidence result obtained.
        // Failed attempts carry confidence 0.0, so any usable output wins.
        let best = attempts
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| {
                a.confidence
                    .partial_cmp(&b.confidence)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|(idx, _)| idx);

        let result = match best {
            Some(idx) => attempts[idx].clone(),
            None => ExtractionResult::failed(
                "none",
                "no backend available within budget",
                0.0,
                0,
            ),
        };

        debug!(
            item = %item.id,
            backend = %result.backend,
            confidence = result.confidence,
            "Chain exhausted, keeping low-confidence result"
        );

        ChainOutcome {
            item_id: item.id.clone(),
            source: item.source.clone(),
            result,
            low_confidence: true,
            attempts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ExtractionBackend;
    use crate::models::{BackendKind, PipelineError, Result};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted backend for chain tests: fixed confidence, cost, and
    /// behavior, plus an invocation counter.
    struct Scripted {
        name: &'static str,
        kind: BackendKind,
        cost: f64,
        confidence: f64,
        behavior: Behavior,
        calls: AtomicUsize,
    }

    enum Behavior {
        Succeed,
        Fail,
        Hang,
    }

    impl Scripted {
        fn new(name: &'static str, confidence: f64) -> Arc<Self> {
            Arc::new(Self {
                name,
                kind: BackendKind::Free,
                cost: 0.0,
                confidence,
                behavior: Behavior::Succeed,
                calls: AtomicUsize::new(0),
            })
        }

        fn paid(name: &'static str, confidence: f64, cost: f64) -> Arc<Self> {
            Arc::new(Self {
                name,
                kind: BackendKind::Paid,
                cost,
                confidence,
                behavior: Behavior::Succeed,
                calls: AtomicUsize::new(0),
            })
        }

        fn failing(name: &'static str) -> Arc<Self> {
            Arc::new(Self {
                name,
                kind: BackendKind::Free,
                cost: 0.0,
                confidence: 0.0,
                behavior: Behavior::Fail,
                calls: AtomicUsize::new(0),
            })
        }

        fn hanging(name: &'static str) -> Arc<Self> {
            Arc::new(Self {
                name,
                kind: BackendKind::Free,
                cost: 0.0,
                confidence: 0.0,
                behavior: Behavior::Hang,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ExtractionBackend for Scripted {
        fn name(&self) -> &str {
            self.name
        }

        fn kind(&self) -> BackendKind {
            self.kind
        }

        fn cost_per_item(&self) -> f64 {
            self.cost
        }

        async fn attempt(&self, _item: &Item) -> Result<ExtractionResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.behavior {
                Behavior::Succeed => Ok(ExtractionResult::ok(
                    self.name,
                    serde_json::json!({"text": "extracted"}),
                    self.confidence,
                    self.cost,
                    1,
                )),
                Behavior::Fail => Err(PipelineError::Internal("scripted failure".to_string())),
                Behavior::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    unreachable!()
                }
            }
        }
    }

    fn chain_with(
        backends: Vec<(Arc<Scripted>, u8)>,
        budget_usd: f64,
        per_item_usd: f64,
    ) -> FallbackChain {
        let mut registry = BackendRegistry::new();
        for (backend, priority) in backends {
            registry.register(backend.name, backend, priority);
        }
        let config = ChainConfig {
            min_confidence: 0.7,
            per_item_budget_usd: per_item_usd,
            backend_timeout: Duration::from_millis(50),
        };
        FallbackChain::new(registry, config, Arc::new(CostLedger::new(budget_usd)))
    }

    fn item() -> Item {
        Item {
            id: "paper-1".to_string(),
            source: "arxiv".to_string(),
            payload: serde_json::json!({"title": "On Compute"}),
        }
    }

    #[tokio::test]
    async fn accepts_first_backend_over_threshold() {
        let first = Scripted::new("metadata", 0.9);
        let second = Scripted::new("ocr", 0.95);
        let chain = chain_with(vec![(Arc::clone(&first), 0), (Arc::clone(&second), 1)], 1.0, 1.0);

        let outcome = chain.process(&item()).await;
        assert!(!outcome.low_confidence);
        assert_eq!(outcome.result.backend, "metadata");
        assert_eq!(outcome.attempts.len(), 1);
        assert_eq!(second.calls(), 0);
    }

    #[tokio::test]
    async fn falls_through_on_low_confidence() {
        let weak = Scripted::new("metadata", 0.3);
        let strong = Scripted::new("ocr", 0.85);
        let chain = chain_with(vec![(Arc::clone(&weak), 0), (Arc::clone(&strong), 1)], 1.0, 1.0);

        let outcome = chain.process(&item()).await;
        assert!(!outcome.low_confidence);
        assert_eq!(outcome.result.backend, "ocr");
        assert_eq!(outcome.attempts.len(), 2);
    }

    #[tokio::test]
    async fn backend_errors_are_absorbed() {
        let broken = Scripted::failing("broken");
        let good = Scripted::new("ocr", 0.8);
        let chain = chain_with(vec![(broken, 0), (good, 1)], 1.0, 1.0);

        let outcome = chain.process(&item()).await;
        assert!(!outcome.low_confidence);
        assert_eq!(outcome.result.backend, "ocr");
        assert!(!outcome.attempts[0].success);
        assert!(outcome.attempts[0].error.is_some());
    }

    #[tokio::test]
    async fn timeout_is_treated_as_failure() {
        let slow = Scripted::hanging("slow");
        let good = Scripted::new("ocr", 0.8);
        let chain = chain_with(vec![(slow, 0), (good, 1)], 1.0, 1.0);

        let outcome = chain.process(&item()).await;
        assert_eq!(outcome.result.backend, "ocr");
        assert!(outcome.attempts[0].error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn exhausted_chain_keeps_best_confidence() {
        let weak = Scripted::new("metadata", 0.4);
        let weaker = Scripted::new("ocr", 0.2);
        let chain = chain_with(vec![(weak, 0), (weaker, 1)], 1.0, 1.0);

        let outcome = chain.process(&item()).await;
        assert!(outcome.low_confidence);
        assert_eq!(outcome.result.backend, "metadata");
        assert_eq!(outcome.attempts.len(), 2);
    }

    #[tokio::test]
    async fn unaffordable_backend_is_never_invoked() {
        // Run budget $0.10, the only high-confidence option costs $0.15:
        // expect a low-confidence outcome, the paid backend never invoked,
        // and the cost counter unchanged.
        let weak = Scripted::new("metadata", 0.4);
        let paid = Scripted::paid("cloud-a", 0.95, 0.15);
        let chain = chain_with(vec![(weak, 0), (Arc::clone(&paid), 1)], 0.10, 1.0);

        let outcome = chain.process(&item()).await;
        assert!(outcome.low_confidence);
        assert_eq!(outcome.result.backend, "metadata");
        assert_eq!(paid.calls(), 0);
        assert_eq!(chain.ledger().spent_usd(), 0.0);
    }

    #[tokio::test]
    async fn budget_skip_falls_through_to_cheaper_backend() {
        let pricey = Scripted::paid("cloud-a", 0.95, 0.50);
        let cheap = Scripted::paid("cloud-b", 0.9, 0.02);
        let chain = chain_with(vec![(Arc::clone(&pricey), 0), (Arc::clone(&cheap), 1)], 0.10, 1.0);

        let outcome = chain.process(&item()).await;
        assert!(!outcome.low_confidence);
        assert_eq!(outcome.result.backend, "cloud-b");
        assert_eq!(pricey.calls(), 0);
        assert!((chain.ledger().spent_usd() - 0.02).abs() < 1e-9);
    }

    #[tokio::test]
    async fn per_item_budget_limits_attempts() {
        let a = Scripted::paid("cloud-a", 0.1, 0.04);
        let b = Scripted::paid("cloud-b", 0.1, 0.04);
        let c = Scripted::paid("cloud-c", 0.99, 0.04);
        // Per-item ceiling of $0.08 admits only the first two paid calls.
        let chain = chain_with(
            vec![(a, 0), (b, 1), (Arc::clone(&c), 2)],
            10.0,
            0.08,
        );

        let outcome = chain.process(&item()).await;
        assert!(outcome.low_confidence);
        assert_eq!(c.calls(), 0);
        assert!((outcome.item_cost_usd() - 0.08).abs() < 1e-9);
    }

    #[tokio::test]
    async fn empty_registry_yields_synthetic_failure() {
        let chain = chain_with(vec![], 1.0, 1.0);
        let outcome = chain.process(&item()).await;
        assert!(outcome.low_confidence);
        assert!(!outcome.result.success);
        assert_eq!(outcome.result.backend, "none");
        assert!(outcome.attempts.is_empty());
    }
}
