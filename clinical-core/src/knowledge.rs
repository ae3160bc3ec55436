use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::error::{CoreError, Result};

/// One entry of the terminology table: short form plus its expansion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Abbreviation {
    pub abbreviation: String,
    pub expansion: String,
}

/// A known complication with its canonical description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Complication {
    pub name: String,
    pub description: String,
}

/// CKD staging entry. Stages are listed from preserved to end-stage function,
/// so the first entry whose lower bound is at or below a GFR value wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CkdStage {
    pub stage: String,
    pub min_gfr: f64,
    pub gfr_range: String,
    pub description: String,
}

/// Thresholds driving the fallback decision cascade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppealCriteria {
    pub approve_below_gfr: f64,
    pub reject_at_or_above_gfr: f64,
    pub nephrotic_proteinuria: f64,
    pub low_proteinuria: f64,
}

impl Default for AppealCriteria {
    fn default() -> Self {
        Self {
            approve_below_gfr: 15.0,
            reject_at_or_above_gfr: 60.0,
            nephrotic_proteinuria: 3.5,
            low_proteinuria: 1.0,
        }
    }
}

/// Read-only reference data consulted by extraction and decisioning.
/// Loaded from a JSON file and replaced wholesale on reload, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeBase {
    pub abbreviations: Vec<Abbreviation>,
    pub complications: Vec<Complication>,
    pub stages: Vec<CkdStage>,
    #[serde(default)]
    pub guidelines: Vec<String>,
    #[serde(default)]
    pub appeal_criteria: AppealCriteria,
}

impl KnowledgeBase {
    pub fn stage_for_gfr(&self, gfr: f64) -> Option<&CkdStage> {
        self.stages.iter().find(|s| gfr >= s.min_gfr)
    }
}

pub async fn load_knowledge_base(path: &Path) -> Result<KnowledgeBase> {
    let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
        CoreError::KnowledgeBase(format!("failed to read {}: {}", path.display(), e))
    })?;
    let base: KnowledgeBase = serde_json::from_str(&raw).map_err(|e| {
        CoreError::KnowledgeBase(format!("failed to parse {}: {}", path.display(), e))
    })?;
    Ok(base)
}

/// Time source for the staleness check, injectable so the cache is testable
/// without real timers.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

struct Snapshot {
    base: Arc<KnowledgeBase>,
    loaded_at: Instant,
}

/// Memoized knowledge-base snapshot with a time-to-live staleness check.
///
/// `get` serves the cached snapshot until the TTL elapses, then reloads from
/// the backing file. Concurrent readers during a reload may observe either the
/// old or the new snapshot; the table is only ever replaced wholesale. If a
/// reload fails after a successful initial load, the previous snapshot keeps
/// being served.
pub struct KnowledgeCache {
    path: PathBuf,
    ttl: Duration,
    clock: Arc<dyn Clock>,
    snapshot: RwLock<Option<Snapshot>>,
}

impl KnowledgeCache {
    pub fn new(path: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self::with_clock(path, ttl, Arc::new(SystemClock))
    }

    pub fn with_clock(path: impl Into<PathBuf>, ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            path: path.into(),
            ttl,
            clock,
            snapshot: RwLock::new(None),
        }
    }

    /// Current snapshot, reloading from disk if the TTL has elapsed.
    pub async fn get(&self) -> Result<Arc<KnowledgeBase>> {
        {
            let guard = self.snapshot.read().await;
            if let Some(snap) = guard.as_ref() {
                if self.clock.now().duration_since(snap.loaded_at) < self.ttl {
                    return Ok(snap.base.clone());
                }
            }
        }
        self.reload().await
    }

    /// Reload from disk regardless of snapshot age.
    pub async fn force_reload(&self) -> Result<Arc<KnowledgeBase>> {
        self.reload().await
    }

    async fn reload(&self) -> Result<Arc<KnowledgeBase>> {
        let mut guard = self.snapshot.write().await;
        match load_knowledge_base(&self.path).await {
            Ok(base) => {
                let base = Arc::new(base);
                *guard = Some(Snapshot {
                    base: base.clone(),
                    loaded_at: self.clock.now(),
                });
                info!(
                    "Knowledge base loaded from {}: {} abbreviations, {} complications, {} stages",
                    self.path.display(),
                    base.abbreviations.len(),
                    base.complications.len(),
                    base.stages.len()
                );
                Ok(base)
            }
            Err(e) => match guard.as_ref() {
                Some(snap) => {
                    warn!("Knowledge base reload failed, serving previous snapshot: {}", e);
                    Ok(snap.base.clone())
                }
                None => Err(e),
            },
        }
    }
}
