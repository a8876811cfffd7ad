//! Worker registry: identity, capabilities, health, heartbeat discipline,
//! and deterministic worker selection.

use cyxmake_protocol::{
    Capabilities, HeartbeatPayload, HelloPayload, StatusUpdatePayload, SystemInfo, ToolInfo,
    WorkerState,
};
use cyxmake_transport::ConnectionId;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Weight of each health component; they sum to 1.
const HEALTH_WEIGHT_SUCCESS: f64 = 0.4;
const HEALTH_WEIGHT_LATENCY: f64 = 0.2;
const HEALTH_WEIGHT_LOAD: f64 = 0.2;
const HEALTH_WEIGHT_FRESHNESS: f64 = 0.2;

/// EMA smoothing for the per-worker success rate.
const SUCCESS_EMA_ALPHA: f64 = 0.2;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("worker name '{0}' is already registered")]
    DuplicateName(String),

    #[error("worker {0} not found")]
    WorkerNotFound(Uuid),
}

/// A connected (or recently connected) worker record.
///
/// The `connection` back-reference is owned by the transport; the registry
/// only invalidates it on disconnect and never dereferences a stale one.
#[derive(Debug, Clone)]
pub struct RemoteWorker {
    pub id: Uuid,
    pub name: String,
    pub hostname: String,
    pub port: u16,
    pub state: WorkerState,
    pub connected_at: u64,
    pub last_heartbeat: u64,
    pub missed_heartbeats: u32,
    pub capabilities: Capabilities,
    pub system_info: SystemInfo,
    pub tools: BTreeMap<String, ToolInfo>,
    pub active_jobs: u32,
    pub max_jobs: u32,
    pub completed_jobs: u64,
    pub failed_jobs: u64,
    pub avg_job_duration_secs: f64,
    pub health_score: f64,
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub network_latency_ms: f64,
    pub connection: Option<ConnectionId>,
    success_ema: f64,
    offline_since: Option<u64>,
}

impl RemoteWorker {
    fn from_hello(hello: &HelloPayload, connection: ConnectionId) -> Self {
        let now = now_ms();
        Self {
            id: Uuid::new_v4(),
            name: hello.name.clone(),
            hostname: hello.hostname.clone(),
            port: hello.port,
            state: WorkerState::Authenticating,
            connected_at: now,
            last_heartbeat: now,
            missed_heartbeats: 0,
            capabilities: hello.capabilities,
            system_info: hello.system_info.clone(),
            tools: hello.tools.clone(),
            active_jobs: 0,
            max_jobs: hello.max_jobs.max(1),
            completed_jobs: 0,
            failed_jobs: 0,
            avg_job_duration_secs: 0.0,
            health_score: 1.0,
            cpu_usage: 0.0,
            memory_usage: 0.0,
            network_latency_ms: 0.0,
            connection: Some(connection),
            success_ema: 1.0,
            offline_since: None,
        }
    }

    pub fn available_slots(&self) -> u32 {
        self.max_jobs.saturating_sub(self.active_jobs)
    }

    fn recompute_health(&mut self, now: u64, heartbeat_timeout_ms: u64) {
        let latency = 1.0 / (1.0 + self.network_latency_ms / 100.0);
        let load = 1.0 - (self.active_jobs as f64 / self.max_jobs.max(1) as f64);
        let age = now.saturating_sub(self.last_heartbeat) as f64;
        let freshness = (1.0 - age / heartbeat_timeout_ms.max(1) as f64).clamp(0.0, 1.0);

        self.health_score = (HEALTH_WEIGHT_SUCCESS * self.success_ema
            + HEALTH_WEIGHT_LATENCY * latency
            + HEALTH_WEIGHT_LOAD * load
            + HEALTH_WEIGHT_FRESHNESS * freshness)
            .clamp(0.0, 1.0);
    }

    fn go_offline(&mut self, now: u64) {
        self.state = WorkerState::Offline;
        self.connection = None;
        self.offline_since = Some(now);
    }
}

/// Constraints and preferences for picking a worker.
#[derive(Debug, Clone, Default)]
pub struct SelectionCriteria {
    pub required_caps: Capabilities,
    pub preferred_caps: Capabilities,
    pub target_arch: Option<String>,
    pub target_os: Option<String>,
    pub min_available_slots: u32,
    pub prefer_local: bool,
    pub prefer_idle: bool,
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub heartbeat_timeout_secs: u64,
    pub max_missed_heartbeats: u32,
    pub auto_remove_offline: bool,
    pub offline_removal_delay_secs: u64,
    /// Hostname of the coordinator itself, used by `prefer_local`.
    pub local_hostname: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        use cyxmake_protocol::defaults::*;
        Self {
            heartbeat_timeout_secs: DEFAULT_HEARTBEAT_TIMEOUT_SECS,
            max_missed_heartbeats: DEFAULT_MAX_MISSED_HEARTBEATS,
            auto_remove_offline: true,
            offline_removal_delay_secs: DEFAULT_OFFLINE_REMOVAL_DELAY_SECS,
            local_hostname: String::new(),
        }
    }
}

/// What a sweep or state change produced; delivered to the caller so it
/// can act outside the registry lock.
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    Registered {
        worker_id: Uuid,
        name: String,
    },
    Unregistered {
        worker_id: Uuid,
        name: String,
        reason: String,
    },
}

struct RegistryState {
    workers: HashMap<Uuid, RemoteWorker>,
    by_name: HashMap<String, Uuid>,
    by_connection: HashMap<ConnectionId, Uuid>,
}

pub struct WorkerRegistry {
    config: RegistryConfig,
    inner: Mutex<RegistryState>,
}

impl WorkerRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(RegistryState {
                workers: HashMap::new(),
                by_name: HashMap::new(),
                by_connection: HashMap::new(),
            }),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.inner.lock().unwrap().workers.len()
    }

    /// Insert a worker from its HELLO. The record starts AUTHENTICATING;
    /// `mark_online` completes registration.
    pub fn register(
        &self,
        hello: &HelloPayload,
        connection: ConnectionId,
    ) -> Result<Uuid, RegistryError> {
        let mut state = self.inner.lock().unwrap();

        if let Some(existing) = state.by_name.get(&hello.name) {
            // A live record under this name blocks re-registration;
            // an OFFLINE leftover is replaced.
            let live = state
                .workers
                .get(existing)
                .map(|w| w.state.is_connected())
                .unwrap_or(false);
            if live {
                return Err(RegistryError::DuplicateName(hello.name.clone()));
            }
            let stale = *existing;
            state.workers.remove(&stale);
            state.by_name.remove(&hello.name);
            state.by_connection.retain(|_, v| *v != stale);
        }

        let worker = RemoteWorker::from_hello(hello, connection);
        let id = worker.id;
        state.by_name.insert(worker.name.clone(), id);
        state.by_connection.insert(connection, id);
        state.workers.insert(id, worker);
        debug!("worker '{}' registered as {}", hello.name, id);
        Ok(id)
    }

    /// Transition AUTHENTICATING -> ONLINE after successful auth.
    pub fn mark_online(&self, id: Uuid) -> Result<RegistryEvent, RegistryError> {
        let mut state = self.inner.lock().unwrap();
        let worker = state
            .workers
            .get_mut(&id)
            .ok_or(RegistryError::WorkerNotFound(id))?;
        worker.state = WorkerState::Online;
        worker.last_heartbeat = now_ms();
        info!("worker '{}' online ({})", worker.name, id);
        Ok(RegistryEvent::Registered {
            worker_id: id,
            name: worker.name.clone(),
        })
    }

    pub fn get(&self, id: Uuid) -> Option<RemoteWorker> {
        self.inner.lock().unwrap().workers.get(&id).cloned()
    }

    pub fn find_by_name(&self, name: &str) -> Option<Uuid> {
        self.inner.lock().unwrap().by_name.get(name).copied()
    }

    pub fn find_by_connection(&self, connection: ConnectionId) -> Option<Uuid> {
        self.inner
            .lock()
            .unwrap()
            .by_connection
            .get(&connection)
            .copied()
    }

    /// Any message from the worker proves liveness: reset the heartbeat
    /// clock and the missed counter.
    pub fn record_message(&self, id: Uuid) {
        let mut state = self.inner.lock().unwrap();
        if let Some(worker) = state.workers.get_mut(&id) {
            worker.last_heartbeat = now_ms();
            worker.missed_heartbeats = 0;
        }
    }

    pub fn record_heartbeat(&self, id: Uuid, payload: &HeartbeatPayload, latency_ms: f64) {
        let mut state = self.inner.lock().unwrap();
        if let Some(worker) = state.workers.get_mut(&id) {
            let now = now_ms();
            worker.last_heartbeat = now;
            worker.missed_heartbeats = 0;
            worker.cpu_usage = payload.cpu_usage;
            worker.memory_usage = payload.memory_usage;
            worker.network_latency_ms = latency_ms.max(0.0);
            worker.recompute_health(now, self.config.heartbeat_timeout_secs * 1000);
        }
    }

    pub fn record_status(&self, id: Uuid, payload: &StatusUpdatePayload) {
        let mut state = self.inner.lock().unwrap();
        if let Some(worker) = state.workers.get_mut(&id) {
            worker.last_heartbeat = now_ms();
            worker.missed_heartbeats = 0;
            worker.state = payload.state;
            worker.cpu_usage = payload.cpu_usage;
            worker.memory_usage = payload.memory_usage;
        }
    }

    /// Reserve a job slot. Fails when the worker cannot take more work.
    pub fn record_job_start(&self, id: Uuid) -> Result<(), RegistryError> {
        let mut state = self.inner.lock().unwrap();
        let worker = state
            .workers
            .get_mut(&id)
            .ok_or(RegistryError::WorkerNotFound(id))?;
        worker.active_jobs = (worker.active_jobs + 1).min(worker.max_jobs);
        if worker.active_jobs >= worker.max_jobs {
            worker.state = WorkerState::Busy;
        }
        Ok(())
    }

    /// Give a slot back without touching the outcome counters; used when
    /// an assignment never ran (rejection, cancellation before start).
    pub fn release_job_slot(&self, id: Uuid) {
        let mut state = self.inner.lock().unwrap();
        if let Some(worker) = state.workers.get_mut(&id) {
            worker.active_jobs = worker.active_jobs.saturating_sub(1);
            if worker.state == WorkerState::Busy && worker.active_jobs < worker.max_jobs {
                worker.state = WorkerState::Online;
            }
        }
    }

    /// Release a job slot and fold the outcome into the worker's stats.
    pub fn record_job_finished(&self, id: Uuid, success: bool, duration_secs: f64) {
        let mut state = self.inner.lock().unwrap();
        if let Some(worker) = state.workers.get_mut(&id) {
            worker.active_jobs = worker.active_jobs.saturating_sub(1);
            if worker.state == WorkerState::Busy && worker.active_jobs < worker.max_jobs {
                worker.state = WorkerState::Online;
            }

            if success {
                worker.completed_jobs += 1;
            } else {
                worker.failed_jobs += 1;
            }
            let total = worker.completed_jobs + worker.failed_jobs;
            worker.avg_job_duration_secs +=
                (duration_secs - worker.avg_job_duration_secs) / total.max(1) as f64;
            worker.success_ema = (1.0 - SUCCESS_EMA_ALPHA) * worker.success_ema
                + SUCCESS_EMA_ALPHA * if success { 1.0 } else { 0.0 };
            worker.recompute_health(now_ms(), self.config.heartbeat_timeout_secs * 1000);
        }
    }

    /// GOODBYE received: the worker finishes what it has but takes no new
    /// assignments.
    pub fn mark_draining(&self, id: Uuid) {
        let mut state = self.inner.lock().unwrap();
        if let Some(worker) = state.workers.get_mut(&id) {
            info!("worker '{}' draining", worker.name);
            worker.state = WorkerState::Draining;
        }
    }

    /// Transport-level disconnect: demote the worker and invalidate the
    /// connection back-reference.
    pub fn handle_disconnect(&self, connection: ConnectionId) -> Option<RegistryEvent> {
        let mut state = self.inner.lock().unwrap();
        let id = state.by_connection.remove(&connection)?;
        let worker = state.workers.get_mut(&id)?;
        warn!("worker '{}' disconnected", worker.name);
        worker.go_offline(now_ms());
        Some(RegistryEvent::Unregistered {
            worker_id: id,
            name: worker.name.clone(),
            reason: "disconnected".to_string(),
        })
    }

    /// Heartbeat sweep: increment `missed_heartbeats` on stale workers,
    /// demote those over the limit, drop OFFLINE records past the removal
    /// delay. Health is recomputed for every live worker.
    pub fn sweep(&self) -> Vec<RegistryEvent> {
        let mut events = Vec::new();
        let now = now_ms();
        let timeout_ms = self.config.heartbeat_timeout_secs * 1000;
        let mut state = self.inner.lock().unwrap();

        let mut to_remove = Vec::new();
        for worker in state.workers.values_mut() {
            match worker.state {
                WorkerState::Offline | WorkerState::Error => {
                    if self.config.auto_remove_offline {
                        let gone_for = now.saturating_sub(worker.offline_since.unwrap_or(now));
                        if gone_for >= self.config.offline_removal_delay_secs * 1000 {
                            to_remove.push(worker.id);
                        }
                    }
                }
                _ => {
                    if now.saturating_sub(worker.last_heartbeat) > timeout_ms {
                        worker.missed_heartbeats += 1;
                        worker.last_heartbeat = now;
                        debug!(
                            "worker '{}' missed heartbeat {}/{}",
                            worker.name, worker.missed_heartbeats, self.config.max_missed_heartbeats
                        );
                        if worker.missed_heartbeats >= self.config.max_missed_heartbeats {
                            warn!("worker '{}' timed out, marking offline", worker.name);
                            worker.go_offline(now);
                            events.push(RegistryEvent::Unregistered {
                                worker_id: worker.id,
                                name: worker.name.clone(),
                                reason: "heartbeat-timeout".to_string(),
                            });
                        }
                    }
                    worker.recompute_health(now, timeout_ms);
                }
            }
        }

        for id in to_remove {
            if let Some(worker) = state.workers.remove(&id) {
                info!("removed offline worker '{}'", worker.name);
                state.by_name.remove(&worker.name);
                state.by_connection.retain(|_, v| *v != id);
            }
        }

        events
    }

    pub fn remove(&self, id: Uuid) -> Option<RemoteWorker> {
        let mut state = self.inner.lock().unwrap();
        let worker = state.workers.remove(&id)?;
        state.by_name.remove(&worker.name);
        state.by_connection.retain(|_, v| *v != id);
        Some(worker)
    }

    /// Snapshot of every record; safe to iterate without the lock.
    pub fn snapshot(&self) -> Vec<RemoteWorker> {
        self.inner.lock().unwrap().workers.values().cloned().collect()
    }

    /// Iterate live records under the lock. The callback must not call
    /// back into registry methods.
    pub fn for_each<F: FnMut(&RemoteWorker)>(&self, mut f: F) {
        let state = self.inner.lock().unwrap();
        for worker in state.workers.values() {
            f(worker);
        }
    }

    fn eligible(&self, worker: &RemoteWorker, criteria: &SelectionCriteria) -> bool {
        if !worker.state.accepts_jobs() {
            return false;
        }
        if !worker.capabilities.contains(criteria.required_caps) {
            return false;
        }
        if worker.available_slots() < criteria.min_available_slots.max(1) {
            return false;
        }
        if let Some(arch) = &criteria.target_arch {
            if !worker.system_info.arch.eq_ignore_ascii_case(arch) {
                return false;
            }
        }
        if let Some(os) = &criteria.target_os {
            if !worker.system_info.os.eq_ignore_ascii_case(os) {
                return false;
            }
        }
        true
    }

    fn score(&self, worker: &RemoteWorker, criteria: &SelectionCriteria, weighted: bool) -> f64 {
        let preferred_match = if criteria.preferred_caps.is_empty() {
            0.0
        } else {
            worker.capabilities.overlap(criteria.preferred_caps) as f64
                / criteria.preferred_caps.bits().count_ones() as f64
        };
        let slots = worker.available_slots() as f64 / worker.max_jobs.max(1) as f64;
        let mut score = worker.health_score * (1.0 + preferred_match) * slots;

        if criteria.prefer_idle && worker.active_jobs == 0 {
            score *= 1.5;
        }
        if criteria.prefer_local
            && !self.config.local_hostname.is_empty()
            && worker.hostname == self.config.local_hostname
        {
            score *= 1.25;
        }
        if weighted {
            // Bigger machines win ties between equally healthy workers.
            score *= 1.0
                + (worker.max_jobs as f64 + worker.system_info.cpu_cores as f64) / 100.0;
        }
        score
    }

    /// Pick the best eligible worker. Deterministic: score, then lower
    /// latency, then lexicographic id.
    pub fn select(&self, criteria: &SelectionCriteria) -> Option<Uuid> {
        self.select_scored(criteria, false)
    }

    /// Like `select`, with machine size folded into the score.
    pub fn select_weighted(&self, criteria: &SelectionCriteria) -> Option<Uuid> {
        self.select_scored(criteria, true)
    }

    fn select_scored(&self, criteria: &SelectionCriteria, weighted: bool) -> Option<Uuid> {
        let state = self.inner.lock().unwrap();
        let mut best: Option<(f64, f64, String, Uuid)> = None;
        for worker in state.workers.values() {
            if !self.eligible(worker, criteria) {
                continue;
            }
            let score = self.score(worker, criteria, weighted);
            let candidate = (
                score,
                worker.network_latency_ms,
                worker.id.to_string(),
                worker.id,
            );
            let better = match &best {
                None => true,
                Some((best_score, best_latency, best_id, _)) => {
                    score > *best_score
                        || (score == *best_score
                            && (candidate.1 < *best_latency
                                || (candidate.1 == *best_latency && candidate.2 < *best_id)))
                }
            };
            if better {
                best = Some(candidate);
            }
        }
        best.map(|(_, _, _, id)| id)
    }

    /// Eligible workers sorted by id; used by round-robin balancing.
    pub fn eligible_workers(&self, criteria: &SelectionCriteria) -> Vec<Uuid> {
        let state = self.inner.lock().unwrap();
        let mut ids: Vec<Uuid> = state
            .workers
            .values()
            .filter(|w| self.eligible(w, criteria))
            .map(|w| w.id)
            .collect();
        ids.sort();
        ids
    }
}
