use crate::db::CircuitEvent;
use crate::repo::lock::{LockRecord, LockRepo};
use crate::repo::RepoError;
use chrono::Utc;
use cineforge_common::config::LockConfig;
use cineforge_common::model::{ProjectId, WorkerId};
use cineforge_common::SafeDisplay;
use lazy_static::lazy_static;
use prometheus::{register_int_counter_vec, IntCounterVec};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

lazy_static! {
    static ref LOCK_EVENTS: IntCounterVec = register_int_counter_vec!(
        "project_lock_events_total",
        "Project lock lifecycle events",
        &["event"]
    )
    .unwrap();
}

/// In-process serialization per project.
///
/// The lease is deliberately re-entrant for one worker id (a restarted
/// holder must be able to take its own lock back), so two tasks inside the
/// same process would both "acquire" it. Anything that must serialize
/// in-process takes the project's gate first, then the lease.
#[derive(Default)]
pub struct ProjectGates {
    gates: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ProjectGates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn gate(&self, project_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut gates = match self.gates.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        gates
            .entry(project_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error(
        "heartbeat interval ({heartbeat_interval:?}) must be well below the lock TTL ({lock_ttl:?})"
    )]
    InvalidLease {
        lock_ttl: Duration,
        heartbeat_interval: Duration,
    },
    #[error(transparent)]
    InternalRepoError(#[from] RepoError),
}

impl SafeDisplay for LockError {
    fn to_safe_string(&self) -> String {
        match self {
            Self::InvalidLease { .. } => self.to_string(),
            Self::InternalRepoError(inner) => inner.to_safe_string(),
        }
    }
}

/// Lease-based project-scoped mutual exclusion.
///
/// A held lock is renewed by a background heartbeat task. Losing the row
/// (another worker stole an expired lease, or the breaker opened) stops the
/// heartbeat and drops local ownership; callers notice through `has_lock`
/// at their critical junctions.
pub struct LockManager {
    lock_repo: Arc<dyn LockRepo>,
    worker_id: WorkerId,
    heartbeats: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
}

impl LockManager {
    pub fn new(lock_repo: Arc<dyn LockRepo>, worker_id: WorkerId) -> Arc<Self> {
        Arc::new(Self {
            lock_repo,
            worker_id,
            heartbeats: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Without a database there is no way to keep leases alive; other
    /// workers will see them expire, so local ownership must go too.
    pub fn spawn_circuit_watch(
        self: &Arc<Self>,
        mut events: broadcast::Receiver<CircuitEvent>,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(CircuitEvent::Opened) => {
                        warn!("database circuit opened, dropping all local project locks");
                        manager.drop_all_local();
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    pub async fn acquire_lock(
        self: &Arc<Self>,
        project_id: &ProjectId,
        config: &LockConfig,
    ) -> Result<bool, LockError> {
        if config.heartbeat_interval >= config.lock_ttl {
            return Err(LockError::InvalidLease {
                lock_ttl: config.lock_ttl,
                heartbeat_interval: config.heartbeat_interval,
            });
        }

        let now = Utc::now();
        let swept = self.lock_repo.sweep_expired(now).await?;
        for stale in &swept {
            debug!(
                project_id = %stale.project_id,
                worker_id = %stale.worker_id,
                "swept expired project lock"
            );
        }

        let acquired = self
            .lock_repo
            .try_acquire(
                project_id.as_str(),
                self.worker_id.as_str(),
                now,
                config.lock_ttl,
                json!({ "acquired_by": self.worker_id.as_str() }),
            )
            .await?;
        if !acquired {
            LOCK_EVENTS.with_label_values(&["contended"]).inc();
            return Ok(false);
        }

        LOCK_EVENTS.with_label_values(&["acquired"]).inc();
        info!(project_id = %project_id, "acquired project lock");
        self.stop_heartbeat(project_id.as_str());
        self.start_heartbeat(project_id.clone(), config.clone());
        Ok(true)
    }

    /// Stopping the heartbeat is unconditional; a database failure must not
    /// keep a dead heartbeat running.
    pub async fn release_lock(&self, project_id: &ProjectId) -> Result<(), LockError> {
        self.stop_heartbeat(project_id.as_str());
        let released = self
            .lock_repo
            .release(project_id.as_str(), self.worker_id.as_str())
            .await?;
        if released {
            LOCK_EVENTS.with_label_values(&["released"]).inc();
            info!(project_id = %project_id, "released project lock");
        }
        Ok(())
    }

    /// Locally held and still backed by an unexpired row owned by us.
    pub async fn has_lock(&self, project_id: &ProjectId) -> Result<bool, LockError> {
        if !self.holds_locally(project_id.as_str()) {
            return Ok(false);
        }
        let record = self.lock_repo.get(project_id.as_str()).await?;
        Ok(record
            .map(|record| {
                record.worker_id == self.worker_id.as_str() && record.expires_at > Utc::now()
            })
            .unwrap_or(false))
    }

    pub async fn get_lock_info(
        &self,
        project_id: &ProjectId,
    ) -> Result<Option<LockRecord>, LockError> {
        Ok(self.lock_repo.get(project_id.as_str()).await?)
    }

    pub async fn force_release(&self, project_id: &ProjectId) -> Result<bool, LockError> {
        self.stop_heartbeat(project_id.as_str());
        let released = self.lock_repo.force_release(project_id.as_str()).await?;
        if released {
            LOCK_EVENTS.with_label_values(&["force_released"]).inc();
            warn!(project_id = %project_id, "force released project lock");
        }
        Ok(released)
    }

    pub async fn get_my_locks(&self) -> Result<Vec<LockRecord>, LockError> {
        Ok(self
            .lock_repo
            .get_for_worker(self.worker_id.as_str())
            .await?)
    }

    pub async fn release_all_locks(&self) -> Result<(), LockError> {
        let held: Vec<String> = {
            let mut heartbeats = self.locked_heartbeats();
            let held = heartbeats.keys().cloned().collect();
            for (_, handle) in heartbeats.drain() {
                handle.abort();
            }
            held
        };
        for project_id in held {
            let _ = self
                .lock_repo
                .release(&project_id, self.worker_id.as_str())
                .await?;
        }
        Ok(())
    }

    /// Synchronous: stops every heartbeat and forgets local ownership
    /// without touching the database.
    pub fn drop_all_local(&self) {
        let mut heartbeats = self.locked_heartbeats();
        for (project_id, handle) in heartbeats.drain() {
            LOCK_EVENTS.with_label_values(&["dropped"]).inc();
            warn!(project_id = %project_id, "dropped local lock state");
            handle.abort();
        }
    }

    fn holds_locally(&self, project_id: &str) -> bool {
        self.locked_heartbeats().contains_key(project_id)
    }

    fn stop_heartbeat(&self, project_id: &str) {
        if let Some(handle) = self.locked_heartbeats().remove(project_id) {
            handle.abort();
        }
    }

    fn start_heartbeat(&self, project_id: ProjectId, config: LockConfig) {
        let lock_repo = Arc::clone(&self.lock_repo);
        let worker_id = self.worker_id.clone();
        let heartbeats = Arc::clone(&self.heartbeats);

        let key = project_id.as_str().to_string();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.heartbeat_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick of a tokio interval fires immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let renewal = lock_repo
                    .renew(
                        project_id.as_str(),
                        worker_id.as_str(),
                        Utc::now(),
                        config.lock_ttl,
                    )
                    .await;
                match renewal {
                    Ok(true) => {
                        debug!(project_id = %project_id, "renewed project lock");
                    }
                    Ok(false) => {
                        LOCK_EVENTS.with_label_values(&["lost"]).inc();
                        warn!(project_id = %project_id, "lost project lock, stopping heartbeat");
                        remove_heartbeat(&heartbeats, project_id.as_str());
                        break;
                    }
                    Err(RepoError::CircuitOpen) => {
                        warn!(
                            project_id = %project_id,
                            "circuit open during heartbeat, dropping lock"
                        );
                        remove_heartbeat(&heartbeats, project_id.as_str());
                        break;
                    }
                    Err(error) => {
                        warn!(
                            project_id = %project_id,
                            error = %error.to_safe_string(),
                            "heartbeat renewal failed, will retry"
                        );
                    }
                }
            }
        });

        self.locked_heartbeats().insert(key, handle);
    }

    fn locked_heartbeats(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<String, JoinHandle<()>>> {
        match self.heartbeats.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn remove_heartbeat(
    heartbeats: &Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
    project_id: &str,
) {
    let mut heartbeats = match heartbeats.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    heartbeats.remove(project_id);
}
