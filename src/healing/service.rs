//! Healing policy on top of the analyzer and the record store.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::store::{fingerprint, HealingStore};
use super::{
    analyzer, FailureReport, HealingError, HealingOutcome, HealingRecord, HealingStats, RecordContext,
    RecordFilter,
};
use crate::config::HealingConfig;

/// Result of analyzing one failure.
#[derive(Debug, Clone, Serialize)]
pub struct AnalyzeResult {
    pub record: HealingRecord,
    /// An identical pending failure was already recorded; no new record.
    pub deduplicated: bool,
    pub auto_applied: bool,
    /// Set when auto-heal declined because the best candidate was below
    /// the confidence floor.
    pub low_confidence: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealingHealth {
    pub status: &'static str,
    pub auto_heal: bool,
    pub confidence_floor: f64,
    pub max_candidates: usize,
    pub queue_depth: usize,
    pub queue_capacity: usize,
    pub pending_records: u64,
}

#[derive(Clone)]
pub struct HealingService {
    store: HealingStore,
    config: HealingConfig,
    queued: Arc<AtomicUsize>,
}

impl HealingService {
    pub fn new(store: HealingStore, config: HealingConfig) -> Self {
        Self {
            store,
            config,
            queued: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Analyze a failure and record it. Repeated identical failures return the
    /// pending record instead of creating a new one.
    pub fn analyze(&self, report: &FailureReport, now: DateTime<Utc>) -> Result<AnalyzeResult, HealingError> {
        let ctx = &report.context;
        if ctx.selector.trim().is_empty() {
            return Err(HealingError::InvalidRequest("context.selector must not be empty".to_string()));
        }

        let fp = fingerprint(ctx.selector.trim(), ctx.url.as_deref(), &report.error);
        if let Some(existing) = self.store.find_pending(&fp)? {
            return Ok(AnalyzeResult {
                record: existing,
                deduplicated: true,
                auto_applied: false,
                low_confidence: None,
            });
        }

        let dom = ctx.dom.as_deref().unwrap_or_default();
        let analysis = analyzer::analyze(
            &ctx.selector,
            dom,
            ctx.action_type.as_deref(),
            self.config.max_candidates,
        );

        let dom_snapshot_ref = ctx.dom_snapshot_ref.clone().or_else(|| {
            (!dom.is_empty()).then(|| format!("dom-{}", Uuid::new_v5(&Uuid::NAMESPACE_OID, dom.as_bytes())))
        });

        let mut record = HealingRecord {
            id: Uuid::new_v4().to_string(),
            fingerprint: fp,
            original_selector: ctx.selector.trim().to_string(),
            context: RecordContext {
                url: ctx.url.clone(),
                action_type: ctx.action_type.clone(),
                dom_snapshot_ref,
            },
            error_message: Some(report.error.clone()).filter(|e| !e.is_empty()),
            candidates: analysis.candidates,
            applied_selector: None,
            outcome: HealingOutcome::Pending,
            superseded_by: None,
            created_at: now,
            decided_at: None,
        };

        let mut auto_applied = false;
        let mut low_confidence = None;
        if self.config.auto_heal {
            let best = record.top().map(|c| c.confidence).unwrap_or(0.0);
            if best >= self.config.confidence_floor {
                record.applied_selector = record.top().map(|c| c.selector.clone());
                record.outcome = HealingOutcome::Accepted;
                record.decided_at = Some(now);
                auto_applied = true;
            } else {
                let err = HealingError::LowConfidence {
                    best,
                    floor: self.config.confidence_floor,
                };
                warn!(selector = %record.original_selector, error = %err, "auto-heal skipped");
                low_confidence = Some(err.to_string());
            }
        }

        self.store.insert(&record)?;
        info!(
            record_id = %record.id,
            selector = %record.original_selector,
            candidates = record.candidates.len(),
            auto_applied,
            "failure analyzed"
        );

        Ok(AnalyzeResult {
            record,
            deduplicated: false,
            auto_applied,
            low_confidence,
        })
    }

    /// Accept a candidate. Defaults to the top one.
    pub fn accept(&self, id: &str, selector: Option<&str>, now: DateTime<Utc>) -> Result<HealingRecord, HealingError> {
        let record = self.store.get(id)?;
        if record.outcome != HealingOutcome::Pending {
            return Err(HealingError::AlreadyDecided {
                id: id.to_string(),
                outcome: record.outcome,
            });
        }
        let chosen = match selector {
            Some(s) => s.to_string(),
            None => record
                .top()
                .map(|c| c.selector.clone())
                .ok_or_else(|| HealingError::InvalidRequest(format!("record {id} has no candidates")))?,
        };
        if !record.candidates.iter().any(|c| c.selector == chosen) {
            return Err(HealingError::NotACandidate {
                id: id.to_string(),
                selector: chosen,
            });
        }
        self.store.decide(id, HealingOutcome::Accepted, Some(&chosen), now)
    }

    pub fn reject(&self, id: &str, now: DateTime<Utc>) -> Result<HealingRecord, HealingError> {
        self.store.decide(id, HealingOutcome::Rejected, None, now)
    }

    pub fn get(&self, id: &str) -> Result<HealingRecord, HealingError> {
        self.store.get(id)
    }

    pub fn list(&self, filter: &RecordFilter) -> Result<Vec<HealingRecord>, HealingError> {
        self.store.list(filter)
    }

    pub fn stats(&self) -> Result<HealingStats, HealingError> {
        self.store.stats()
    }

    pub fn health(&self) -> HealingHealth {
        let (status, pending_records) = match self.store.stats() {
            Ok(stats) => ("ok", stats.pending),
            Err(e) => {
                error!(error = %e, "healing store unavailable");
                ("degraded", 0)
            }
        };
        HealingHealth {
            status,
            auto_heal: self.config.auto_heal,
            confidence_floor: self.config.confidence_floor,
            max_candidates: self.config.max_candidates,
            queue_depth: self.queued.load(Ordering::Relaxed),
            queue_capacity: self.config.queue_capacity,
            pending_records,
        }
    }

    /// Start the out-of-band analysis task. Failures submitted to the returned
    /// queue are analyzed on the blocking pool, one at a time.
    pub fn start_worker(&self) -> (HealingQueue, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(self.config.queue_capacity.max(1));
        let queue = HealingQueue {
            tx,
            depth: self.queued.clone(),
        };
        let handle = tokio::spawn(run_worker(self.clone(), rx));
        (queue, handle)
    }
}

async fn run_worker(service: HealingService, mut rx: mpsc::Receiver<FailureReport>) {
    while let Some(report) = rx.recv().await {
        let svc = service.clone();
        let result = tokio::task::spawn_blocking(move || svc.analyze(&report, Utc::now())).await;
        service.queued.fetch_sub(1, Ordering::Relaxed);
        match result {
            Ok(Ok(res)) if res.deduplicated => {
                info!(record_id = %res.record.id, "repeated failure matched pending record")
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => error!(error = %e, "healing analysis failed"),
            Err(e) => error!(error = %e, "healing analysis panicked"),
        }
    }
    info!("healing worker stopped");
}

/// Sending half of the analysis queue. Never blocks the caller.
#[derive(Clone)]
pub struct HealingQueue {
    tx: mpsc::Sender<FailureReport>,
    depth: Arc<AtomicUsize>,
}

impl HealingQueue {
    pub fn submit(&self, report: FailureReport) -> Result<(), HealingError> {
        self.depth.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = self.tx.try_send(report) {
            self.depth.fetch_sub(1, Ordering::Relaxed);
            warn!(error = %e, "dropping failure report");
            return Err(HealingError::QueueFull);
        }
        Ok(())
    }

    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::healing::FailureContext;
    use crate::storage::open_pool;
    use chrono::TimeZone;
    use std::time::Duration;
    use tempfile::TempDir;

    const DOM: &str = r#"<form id="search"><input name="q" aria-label="Search" data-testid="search-box"><button>Go</button></form>"#;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 12, 14, 0, 0).unwrap()
    }

    fn setup(config: HealingConfig) -> (TempDir, HealingService) {
        let dir = TempDir::new().unwrap();
        let pool = open_pool(dir.path().join("svc.db").to_str().unwrap()).unwrap();
        (dir, HealingService::new(HealingStore::new(pool), config))
    }

    fn report(selector: &str) -> FailureReport {
        FailureReport {
            error: "locator.fill: Timeout 5000ms exceeded".to_string(),
            context: FailureContext {
                selector: selector.to_string(),
                url: Some("https://app.test/search".to_string()),
                action_type: Some("fill".to_string()),
                dom: Some(DOM.to_string()),
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_manual_mode_never_applies() {
        let (_dir, svc) = setup(HealingConfig::default());
        let res = svc.analyze(&report("#search-input"), now()).unwrap();
        assert_eq!(res.record.outcome, HealingOutcome::Pending);
        assert!(res.record.applied_selector.is_none());
        assert!(!res.auto_applied);
        assert!(!res.record.candidates.is_empty());
        assert!(res.record.context.dom_snapshot_ref.as_deref().unwrap().starts_with("dom-"));
    }

    #[test]
    fn test_auto_heal_applies_above_floor() {
        let config = HealingConfig {
            auto_heal: true,
            ..Default::default()
        };
        let (_dir, svc) = setup(config);
        let res = svc.analyze(&report("#search-input"), now()).unwrap();
        assert!(res.auto_applied);
        assert_eq!(res.record.outcome, HealingOutcome::Accepted);
        assert_eq!(
            res.record.applied_selector.as_deref(),
            Some(res.record.candidates[0].selector.as_str())
        );
    }

    #[test]
    fn test_auto_heal_below_floor_stays_pending() {
        let config = HealingConfig {
            auto_heal: true,
            confidence_floor: 0.95,
            ..Default::default()
        };
        let (_dir, svc) = setup(config);
        let res = svc.analyze(&report("#search-input"), now()).unwrap();
        assert!(!res.auto_applied);
        assert_eq!(res.record.outcome, HealingOutcome::Pending);
        assert!(res.low_confidence.unwrap().contains("below the floor"));
    }

    #[test]
    fn test_repeated_failure_is_deduplicated() {
        let (_dir, svc) = setup(HealingConfig::default());
        let first = svc.analyze(&report("#search-input"), now()).unwrap();
        let second = svc.analyze(&report("#search-input"), now()).unwrap();
        assert!(second.deduplicated);
        assert_eq!(first.record.id, second.record.id);
        assert_eq!(svc.stats().unwrap().total, 1);
    }

    #[test]
    fn test_accept_defaults_to_top_and_validates() {
        let (_dir, svc) = setup(HealingConfig::default());
        let rec = svc.analyze(&report("#search-input"), now()).unwrap().record;

        let err = svc.accept(&rec.id, Some("#made-up"), now()).unwrap_err();
        assert!(matches!(err, HealingError::NotACandidate { .. }));

        let accepted = svc.accept(&rec.id, None, now()).unwrap();
        assert_eq!(accepted.applied_selector.as_deref(), Some(rec.candidates[0].selector.as_str()));
        assert!(matches!(
            svc.reject(&rec.id, now()),
            Err(HealingError::AlreadyDecided { .. })
        ));

        let stats = svc.stats().unwrap();
        assert_eq!(stats.accepted, 1);
        assert_eq!(stats.success_rate, 1.0);
    }

    #[test]
    fn test_empty_selector_rejected() {
        let (_dir, svc) = setup(HealingConfig::default());
        assert!(matches!(
            svc.analyze(&report("  "), now()),
            Err(HealingError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_worker_drains_queue() {
        let (_dir, svc) = setup(HealingConfig::default());
        let (queue, _handle) = svc.start_worker();
        queue.submit(report("#search-input")).unwrap();

        for _ in 0..100 {
            if svc.stats().unwrap().total == 1 && queue.depth() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(svc.stats().unwrap().total, 1);
        assert_eq!(svc.health().queue_depth, 0);
    }
}
