//! Client-side reconciliation of provisioning events into per-tool status.
//!
//! [`ToolStateStore`] owns the table a UI renders: one [`ToolProgress`] per
//! tracked tool. It is mutated only through `&mut self`, by direct calls
//! from its owner and by applying events drained from the orchestrator's
//! channel, so it needs no locking.
//!
//! Events may arrive for tools the store has never seen, or out of order;
//! every handler creates the entry first and never panics.

use anyhow::Result;
use std::collections::{BTreeMap, HashMap};
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::events::{BinaryEvent, EventReceiver};
use crate::orchestrator::Orchestrator;

// =============================================================================
// Tool Progress
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum ToolPhase {
    Idle,
    Downloading {
        /// Bytes per second, derived from consecutive progress samples.
        speed: Option<f64>,
    },
    Complete,
    Errored {
        /// `"[stage] message"`.
        message: String,
    },
}

/// Renderable status of one tool.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolProgress {
    pub received: u64,
    pub total: u64,
    /// Always within `0..=100`.
    pub percent: u8,
    pub version: Option<String>,
    pub phase: ToolPhase,
}

impl ToolProgress {
    fn zeroed() -> Self {
        Self {
            received: 0,
            total: 0,
            percent: 0,
            version: None,
            phase: ToolPhase::Idle,
        }
    }

    fn installed() -> Self {
        Self {
            received: 1,
            total: 1,
            percent: 100,
            version: None,
            phase: ToolPhase::Complete,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match &self.phase {
            ToolPhase::Errored { message } => Some(message),
            _ => None,
        }
    }

    pub fn speed(&self) -> Option<f64> {
        match self.phase {
            ToolPhase::Downloading { speed } => speed,
            _ => None,
        }
    }

    /// Whether the tool still needs an `ensure`.
    pub fn needs_download(&self) -> bool {
        self.percent != 100 || self.error().is_some()
    }
}

/// Rounded share of `received` in `total`, 0 when the total is unknown.
pub fn percent_of(received: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    let pct = (received as f64 / total as f64 * 100.0).round();
    pct.clamp(0.0, 100.0) as u8
}

#[derive(Debug, Clone, Copy)]
struct ProgressSample {
    received: u64,
    at: Instant,
}

// =============================================================================
// Tool State Store
// =============================================================================

pub struct ToolStateStore<O> {
    orchestrator: O,
    tools: BTreeMap<String, ToolProgress>,
    samples: HashMap<String, ProgressSample>,
}

impl<O: Orchestrator> ToolStateStore<O> {
    pub fn new(orchestrator: O) -> Self {
        Self {
            orchestrator,
            tools: BTreeMap::new(),
            samples: HashMap::new(),
        }
    }

    pub fn orchestrator(&self) -> &O {
        &self.orchestrator
    }

    // -------------------------------------------------------------------------
    // Read access
    // -------------------------------------------------------------------------

    pub fn get(&self, name: &str) -> Option<&ToolProgress> {
        self.tools.get(name)
    }

    /// Tracked tools ordered by name.
    pub fn tools(&self) -> impl Iterator<Item = (&str, &ToolProgress)> {
        self.tools.iter().map(|(name, p)| (name.as_str(), p))
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    /// True when every tracked tool is installed (vacuously true when empty).
    pub fn is_all_complete(&self) -> bool {
        self.tools.values().all(|p| !p.needs_download())
    }

    // -------------------------------------------------------------------------
    // Orchestrator calls
    // -------------------------------------------------------------------------

    /// Asks the orchestrator what needs downloading and seeds entries to match.
    ///
    /// Tools already installed are marked complete immediately. Returns the
    /// names that need a download.
    pub async fn check(&mut self) -> Result<Vec<String>> {
        let result = self.orchestrator.check().await?;

        for name in &result.all_tools {
            self.samples.remove(name);
            let progress = if result.tools.contains(name) {
                ToolProgress::zeroed()
            } else {
                ToolProgress::installed()
            };
            self.tools.insert(name.clone(), progress);
        }

        debug!(
            needed = result.tools.len(),
            total = result.all_tools.len(),
            "Checked helper tools"
        );
        Ok(result.tools)
    }

    /// Dispatches an install for every named tool that is not yet complete.
    ///
    /// `names` defaults to every tracked tool. When nothing needs a download
    /// the orchestrator is not called. Returns the dispatched names.
    pub async fn ensure(&mut self, names: Option<Vec<String>>, use_proxy: bool) -> Result<Vec<String>> {
        let names = names.unwrap_or_else(|| self.names());
        let need: Vec<String> = names
            .into_iter()
            .filter(|name| self.tools.get(name).map_or(true, ToolProgress::needs_download))
            .collect();

        if need.is_empty() {
            debug!("All requested tools are complete; nothing to ensure");
            return Ok(need);
        }

        for name in &need {
            self.samples.remove(name);
            let entry = self.entry(name);
            entry.received = 0;
            entry.total = 0;
            entry.percent = 0;
            entry.phase = ToolPhase::Downloading { speed: None };
        }

        info!("Dispatching install for {:?}", need);
        if let Err(e) = self.orchestrator.ensure(need.clone(), use_proxy).await {
            warn!("Failed to dispatch install: {:#}", e);
            self.set_tools_error(&need, &format!("[dispatch] {e:#}"));
            return Err(e);
        }
        Ok(need)
    }

    /// Fetches the orchestrator's tool list and merges it in.
    pub async fn fetch_and_merge_tool_list(&mut self) -> Result<()> {
        let names = self.orchestrator.list().await?;
        self.merge_tool_list(&names);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Table management
    // -------------------------------------------------------------------------

    /// Replaces the whole table with zeroed entries.
    pub fn seed(&mut self, names: &[String]) {
        self.samples.clear();
        self.tools = names
            .iter()
            .map(|name| (name.clone(), ToolProgress::zeroed()))
            .collect();
    }

    /// Adds zeroed entries for untracked names only.
    pub fn merge_tool_list(&mut self, names: &[String]) {
        for name in names {
            self.tools
                .entry(name.clone())
                .or_insert_with(ToolProgress::zeroed);
        }
    }

    /// Marks tools as failed without going through the event stream.
    pub fn set_tools_error(&mut self, names: &[String], message: &str) {
        for name in names {
            self.samples.remove(name);
            self.entry(name).phase = ToolPhase::Errored {
                message: message.to_string(),
            };
        }
    }

    fn entry(&mut self, name: &str) -> &mut ToolProgress {
        self.tools
            .entry(name.to_string())
            .or_insert_with(ToolProgress::zeroed)
    }

    // -------------------------------------------------------------------------
    // Events
    // -------------------------------------------------------------------------

    pub fn apply(&mut self, event: BinaryEvent) {
        self.apply_at(event, Instant::now());
    }

    /// Applies one event as if it was observed at `at`.
    pub fn apply_at(&mut self, event: BinaryEvent, at: Instant) {
        match event {
            BinaryEvent::Start(start) => {
                self.entry(&start.tool).version = Some(start.version);
            }
            BinaryEvent::Progress(update) => {
                let previous = self.samples.insert(
                    update.tool.clone(),
                    ProgressSample {
                        received: update.received,
                        at,
                    },
                );
                let speed = previous.and_then(|prev| {
                    let elapsed = at.checked_duration_since(prev.at)?.as_secs_f64();
                    (elapsed > 0.0)
                        .then(|| update.received.saturating_sub(prev.received) as f64 / elapsed)
                });

                let entry = self.entry(&update.tool);
                entry.total = update.total;
                entry.received = update.received;
                entry.percent = percent_of(update.received, update.total);
                entry.phase = ToolPhase::Downloading { speed };
            }
            BinaryEvent::Complete(complete) => {
                self.samples.remove(&complete.tool);
                let entry = self.entry(&complete.tool);
                entry.received = entry.total;
                entry.percent = 100;
                entry.phase = ToolPhase::Complete;
            }
            BinaryEvent::Error(error) => {
                self.samples.remove(&error.tool);
                self.entry(&error.tool).phase = ToolPhase::Errored {
                    message: error.display_message(),
                };
            }
            BinaryEvent::UpdateComplete(summary) => {
                info!(
                    successes = summary.successes.len(),
                    failures = summary.failures.len(),
                    error = summary.error.as_deref().unwrap_or(""),
                    "Provisioning update complete"
                );
            }
        }
    }

    /// Applies every queued event without waiting. Returns how many were applied.
    pub fn drain(&mut self, rx: &mut EventReceiver) -> usize {
        let mut applied = 0;
        while let Ok(event) = rx.try_recv() {
            self.apply(event);
            applied += 1;
        }
        applied
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::event_channel;
    use crate::orchestrator::CheckResult;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Default, Clone)]
    struct MockOrchestrator {
        check: CheckResult,
        list: Vec<String>,
        fail_ensure: bool,
        calls: Arc<Mutex<Vec<(Vec<String>, bool)>>>,
    }

    impl MockOrchestrator {
        fn calls(&self) -> Vec<(Vec<String>, bool)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Orchestrator for MockOrchestrator {
        async fn check(&self) -> Result<CheckResult> {
            Ok(self.check.clone())
        }

        async fn ensure(&self, tools: Vec<String>, use_proxy: bool) -> Result<()> {
            self.calls.lock().unwrap().push((tools, use_proxy));
            if self.fail_ensure {
                return Err(anyhow!("backend unreachable"));
            }
            Ok(())
        }

        async fn list(&self) -> Result<Vec<String>> {
            Ok(self.list.clone())
        }
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn scenario() -> MockOrchestrator {
        MockOrchestrator {
            check: CheckResult {
                tools: names(&["ytdlp"]),
                all_tools: names(&["ytdlp", "ffmpeg"]),
            },
            list: names(&["ytdlp", "ffmpeg", "ffprobe"]),
            ..Default::default()
        }
    }

    #[test]
    fn test_percent_of() {
        assert_eq!(percent_of(0, 0), 0);
        assert_eq!(percent_of(50, 0), 0);
        assert_eq!(percent_of(1, 3), 33);
        assert_eq!(percent_of(2, 3), 67);
        assert_eq!(percent_of(3, 3), 100);
        assert_eq!(percent_of(5, 3), 100);
    }

    #[tokio::test]
    async fn test_check_then_ensure_dispatches_once() {
        let mock = scenario();
        let mut store = ToolStateStore::new(mock.clone());

        let needed = store.check().await.unwrap();
        assert_eq!(needed, names(&["ytdlp"]));

        let ffmpeg = store.get("ffmpeg").unwrap();
        assert_eq!((ffmpeg.received, ffmpeg.total, ffmpeg.percent), (1, 1, 100));
        assert_eq!(ffmpeg.phase, ToolPhase::Complete);

        let ytdlp = store.get("ytdlp").unwrap();
        assert_eq!(ytdlp.percent, 0);
        assert_eq!(ytdlp.phase, ToolPhase::Idle);

        let dispatched = store.ensure(Some(names(&["ytdlp"])), false).await.unwrap();
        assert_eq!(dispatched, names(&["ytdlp"]));
        assert_eq!(mock.calls(), vec![(names(&["ytdlp"]), false)]);
    }

    #[tokio::test]
    async fn test_ensure_defaults_to_incomplete_tracked_tools() {
        let mock = scenario();
        let mut store = ToolStateStore::new(mock.clone());
        store.check().await.unwrap();

        store.ensure(None, true).await.unwrap();
        assert_eq!(mock.calls(), vec![(names(&["ytdlp"]), true)]);
        assert_eq!(
            store.get("ytdlp").unwrap().phase,
            ToolPhase::Downloading { speed: None }
        );
    }

    #[tokio::test]
    async fn test_ensure_is_noop_when_everything_complete() {
        let mock = MockOrchestrator {
            check: CheckResult {
                tools: vec![],
                all_tools: names(&["ytdlp", "ffmpeg"]),
            },
            ..Default::default()
        };
        let mut store = ToolStateStore::new(mock.clone());
        store.check().await.unwrap();

        let dispatched = store.ensure(None, false).await.unwrap();
        assert!(dispatched.is_empty());
        assert!(mock.calls().is_empty());
        assert!(store.is_all_complete());
    }

    #[tokio::test]
    async fn test_ensure_redispatches_errored_tool_at_full_percent() {
        let mock = scenario();
        let mut store = ToolStateStore::new(mock.clone());
        store.check().await.unwrap();
        store.apply(BinaryEvent::progress("ffmpeg", 10, 10));
        store.apply(BinaryEvent::error("ffmpeg", "7.1", "extract", "bad zip"));
        assert_eq!(store.get("ffmpeg").unwrap().percent, 100);

        store.ensure(Some(names(&["ffmpeg"])), false).await.unwrap();

        assert_eq!(mock.calls(), vec![(names(&["ffmpeg"]), false)]);
        let ffmpeg = store.get("ffmpeg").unwrap();
        assert_eq!((ffmpeg.received, ffmpeg.total, ffmpeg.percent), (0, 0, 0));
        assert_eq!(ffmpeg.error(), None);
    }

    #[tokio::test]
    async fn test_dispatch_failure_marks_tools() {
        let mock = MockOrchestrator {
            fail_ensure: true,
            ..scenario()
        };
        let mut store = ToolStateStore::new(mock);
        store.check().await.unwrap();

        let err = store.ensure(None, false).await.unwrap_err();
        assert!(err.to_string().contains("backend unreachable"));

        let message = store.get("ytdlp").unwrap().error().unwrap();
        assert!(message.starts_with("[dispatch] "));
        assert!(store.get("ffmpeg").unwrap().error().is_none());
    }

    #[tokio::test]
    async fn test_fetch_and_merge_keeps_existing_state() {
        let mut store = ToolStateStore::new(scenario());
        store.check().await.unwrap();
        store.apply(BinaryEvent::error("ytdlp", "1", "download", "HTTP 404"));

        store.fetch_and_merge_tool_list().await.unwrap();

        assert_eq!(store.names(), names(&["ffmpeg", "ffprobe", "ytdlp"]));
        assert_eq!(store.get("ffmpeg").unwrap().phase, ToolPhase::Complete);
        assert_eq!(
            store.get("ytdlp").unwrap().error(),
            Some("[download] HTTP 404")
        );
        assert_eq!(store.get("ffprobe").unwrap().phase, ToolPhase::Idle);
    }

    #[test]
    fn test_seed_replaces_table() {
        let mut store = ToolStateStore::new(MockOrchestrator::default());
        store.apply(BinaryEvent::complete("old"));
        store.seed(&names(&["a", "b"]));

        assert!(store.get("old").is_none());
        assert_eq!(store.names(), names(&["a", "b"]));
        assert!(!store.is_all_complete());
    }

    #[test]
    fn test_speed_from_samples() {
        let mut store = ToolStateStore::new(MockOrchestrator::default());
        let t0 = Instant::now();

        store.apply_at(BinaryEvent::progress("ytdlp", 1000, 10_000), t0);
        assert_eq!(store.get("ytdlp").unwrap().speed(), None);

        store.apply_at(
            BinaryEvent::progress("ytdlp", 3000, 10_000),
            t0 + Duration::from_secs(2),
        );
        let entry = store.get("ytdlp").unwrap();
        assert_eq!(entry.speed(), Some(1000.0));
        assert_eq!(entry.percent, 30);

        // Same timestamp: speed left unset, sample still overwritten.
        store.apply_at(
            BinaryEvent::progress("ytdlp", 4000, 10_000),
            t0 + Duration::from_secs(2),
        );
        assert_eq!(store.get("ytdlp").unwrap().speed(), None);

        store.apply_at(
            BinaryEvent::progress("ytdlp", 6000, 10_000),
            t0 + Duration::from_secs(4),
        );
        assert_eq!(store.get("ytdlp").unwrap().speed(), Some(1000.0));
    }

    #[test]
    fn test_backwards_progress_saturates_speed() {
        let mut store = ToolStateStore::new(MockOrchestrator::default());
        let t0 = Instant::now();
        store.apply_at(BinaryEvent::progress("ffmpeg", 5000, 0), t0);
        store.apply_at(
            BinaryEvent::progress("ffmpeg", 100, 0),
            t0 + Duration::from_secs(1),
        );

        let entry = store.get("ffmpeg").unwrap();
        assert_eq!(entry.speed(), Some(0.0));
        assert_eq!(entry.percent, 0);
    }

    #[test]
    fn test_progress_for_untracked_tool_creates_entry() {
        let mut store = ToolStateStore::new(MockOrchestrator::default());
        store.apply(BinaryEvent::progress("AtomicParsley", 25, 100));

        let entry = store.get("AtomicParsley").unwrap();
        assert_eq!((entry.received, entry.total, entry.percent), (25, 100, 25));
        assert_eq!(entry.version, None);
    }

    #[test]
    fn test_complete_and_error_clear_speed() {
        let mut store = ToolStateStore::new(MockOrchestrator::default());
        let t0 = Instant::now();
        store.apply(BinaryEvent::start("ytdlp", "2025.01.01"));
        store.apply_at(BinaryEvent::progress("ytdlp", 10, 40), t0);
        store.apply_at(
            BinaryEvent::progress("ytdlp", 20, 40),
            t0 + Duration::from_secs(1),
        );
        assert!(store.get("ytdlp").unwrap().speed().is_some());

        store.apply(BinaryEvent::complete("ytdlp"));
        let entry = store.get("ytdlp").unwrap();
        assert_eq!((entry.received, entry.percent), (40, 100));
        assert_eq!(entry.speed(), None);
        assert_eq!(entry.version.as_deref(), Some("2025.01.01"));

        store.apply_at(BinaryEvent::progress("ffmpeg", 10, 40), t0);
        store.apply_at(
            BinaryEvent::progress("ffmpeg", 20, 40),
            t0 + Duration::from_secs(1),
        );
        store.apply(BinaryEvent::error("ffmpeg", "7.1", "verify", "mismatch"));
        let entry = store.get("ffmpeg").unwrap();
        assert_eq!(entry.speed(), None);
        assert_eq!(entry.error(), Some("[verify] mismatch"));
        assert_eq!((entry.received, entry.percent), (20, 50));

        // A fresh sample history: the next progress reports no speed.
        store.apply_at(
            BinaryEvent::progress("ffmpeg", 30, 40),
            t0 + Duration::from_secs(2),
        );
        assert_eq!(store.get("ffmpeg").unwrap().speed(), None);
    }

    #[test]
    fn test_drain_applies_queued_events() {
        let (tx, mut rx) = event_channel();
        let mut store = ToolStateStore::new(MockOrchestrator::default());

        tx.send(BinaryEvent::start("ffprobe", "7.1")).unwrap();
        tx.send(BinaryEvent::progress("ffprobe", 5, 10)).unwrap();
        tx.send(BinaryEvent::complete("ffprobe")).unwrap();

        assert_eq!(store.drain(&mut rx), 3);
        assert_eq!(store.drain(&mut rx), 0);
        assert!(store.is_all_complete());
    }

    #[test]
    fn test_set_tools_error_creates_entries() {
        let mut store = ToolStateStore::new(MockOrchestrator::default());
        store.set_tools_error(&names(&["x", "y"]), "[dispatch] offline");
        assert_eq!(store.get("x").unwrap().error(), Some("[dispatch] offline"));
        assert_eq!(store.get("y").unwrap().percent, 0);
    }
}
