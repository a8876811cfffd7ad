//! Work scheduler: build sessions, stable priority queue, assignment,
//! retries, timeouts, and disconnect recovery.
//!
//! All mutable state lives behind one mutex that is held only around
//! enqueue/dequeue/state transitions. Events are collected under the lock
//! and dispatched to subscribers after it is released, so callbacks may
//! call back into the scheduler.

use crate::registry::{SelectionCriteria, WorkerRegistry};
use cyxmake_protocol::defaults::JOB_TIMED_OUT_MESSAGE;
use cyxmake_protocol::{
    BuildState, DistributionStrategy, JobKind, JobResult, JobSpec, JobState, LoadBalancing,
};
use rand::seq::SliceRandom;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
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

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("build {0} not found")]
    BuildNotFound(Uuid),

    #[error("job {0} not found")]
    JobNotFound(Uuid),

    #[error("build {0} was cancelled")]
    BuildCancelled(Uuid),

    #[error("queue is full ({0} jobs)")]
    QueueFull(usize),

    #[error("no eligible worker for job {0}")]
    NoEligibleWorker(Uuid),
}

/// One job with its scheduling state attached.
#[derive(Debug, Clone)]
pub struct ScheduledJob {
    pub spec: JobSpec,
    pub build_id: Uuid,
    /// Monotone submission index; FIFO tie-break within a priority.
    pub sequence: u64,
    pub state: JobState,
    pub assigned_worker_id: Option<Uuid>,
    pub queued_at: u64,
    pub assigned_at: Option<u64>,
    pub started_at: Option<u64>,
    pub completed_at: Option<u64>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub last_error: Option<String>,
    pub deadline: Option<u64>,
    pub depends_on: Vec<Uuid>,
}

impl ScheduledJob {
    pub fn job_id(&self) -> Uuid {
        self.spec.job_id
    }
}

/// A client-submitted build decomposed into jobs.
#[derive(Debug, Clone)]
pub struct BuildSession {
    pub build_id: Uuid,
    pub project_name: String,
    pub strategy: DistributionStrategy,
    pub state: BuildState,
    pub total_jobs: usize,
    pub pending_jobs: usize,
    pub running_jobs: usize,
    pub completed_jobs: usize,
    pub failed_jobs: usize,
    pub progress_percent: f64,
    pub started_at: Option<u64>,
    pub completed_at: Option<u64>,
    pub success: bool,
    pub error_summary: Option<String>,
    pub output_artifacts: Vec<String>,
    job_ids: Vec<Uuid>,
}

impl BuildSession {
    fn new(project_name: String, strategy: DistributionStrategy) -> Self {
        Self {
            build_id: Uuid::new_v4(),
            project_name,
            strategy,
            state: BuildState::Created,
            total_jobs: 0,
            pending_jobs: 0,
            running_jobs: 0,
            completed_jobs: 0,
            failed_jobs: 0,
            progress_percent: 0.0,
            started_at: None,
            completed_at: None,
            success: false,
            error_summary: None,
            output_artifacts: Vec::new(),
            job_ids: Vec::new(),
        }
    }

    pub fn job_ids(&self) -> &[Uuid] {
        &self.job_ids
    }

    fn refresh_progress(&mut self) {
        let done = self.completed_jobs + self.failed_jobs;
        self.progress_percent = if self.total_jobs == 0 {
            0.0
        } else {
            done as f64 * 100.0 / self.total_jobs as f64
        };
    }
}

/// Everything subscribers need to act on a scheduling transition.
#[derive(Debug, Clone)]
pub enum SchedulerEvent {
    JobAssigned {
        job_id: Uuid,
        build_id: Uuid,
        worker_id: Uuid,
        spec: JobSpec,
    },
    JobCompleted {
        job_id: Uuid,
        build_id: Uuid,
        worker_id: Uuid,
        result: JobResult,
    },
    JobFailed {
        job_id: Uuid,
        build_id: Uuid,
        error: String,
        retry_count: u32,
    },
    /// The coordinator should send JOB_CANCEL to this worker.
    CancelRequested {
        job_id: Uuid,
        worker_id: Uuid,
        reason: String,
    },
    BuildCompleted {
        build_id: Uuid,
        success: bool,
    },
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub load_balancing: LoadBalancing,
    pub default_max_retries: u32,
    pub max_queue_length: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            load_balancing: LoadBalancing::LeastLoaded,
            default_max_retries: cyxmake_protocol::defaults::DEFAULT_MAX_RETRIES,
            max_queue_length: 10_000,
        }
    }
}

/// Heap entry; `Ord` pops highest priority first, FIFO within a priority.
#[derive(Debug, Clone, PartialEq, Eq)]
struct QueueEntry {
    priority: u32,
    queued_at: u64,
    sequence: u64,
    job_id: Uuid,
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.queued_at.cmp(&self.queued_at))
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct SchedulerState {
    queue: BinaryHeap<QueueEntry>,
    jobs: HashMap<Uuid, ScheduledJob>,
    running: HashSet<Uuid>,
    builds: HashMap<Uuid, BuildSession>,
    next_sequence: u64,
    round_robin_cursor: usize,
}

type EventListener = Box<dyn Fn(&SchedulerEvent) + Send + Sync>;

pub struct WorkScheduler {
    config: SchedulerConfig,
    registry: Arc<WorkerRegistry>,
    inner: Mutex<SchedulerState>,
    listeners: RwLock<Vec<EventListener>>,
}

impl WorkScheduler {
    pub fn new(config: SchedulerConfig, registry: Arc<WorkerRegistry>) -> Self {
        Self {
            config,
            registry,
            inner: Mutex::new(SchedulerState {
                queue: BinaryHeap::new(),
                jobs: HashMap::new(),
                running: HashSet::new(),
                builds: HashMap::new(),
                next_sequence: 0,
                round_robin_cursor: 0,
            }),
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Register an event callback. Callbacks fire outside the state lock,
    /// in transition order.
    pub fn subscribe<F: Fn(&SchedulerEvent) + Send + Sync + 'static>(&self, listener: F) {
        self.listeners.write().unwrap().push(Box::new(listener));
    }

    fn emit(&self, events: Vec<SchedulerEvent>) {
        if events.is_empty() {
            return;
        }
        let listeners = self.listeners.read().unwrap();
        for event in &events {
            for listener in listeners.iter() {
                listener(event);
            }
        }
    }

    // ========================================================================
    // Builds
    // ========================================================================

    pub fn create_build(&self, name: &str, strategy: DistributionStrategy) -> BuildSession {
        let session = BuildSession::new(name.to_string(), strategy);
        let mut state = self.inner.lock().unwrap();
        state.builds.insert(session.build_id, session.clone());
        info!("created build '{}' ({})", name, session.build_id);
        session
    }

    pub fn get_build(&self, build_id: Uuid) -> Option<BuildSession> {
        self.inner.lock().unwrap().builds.get(&build_id).cloned()
    }

    pub fn get_job(&self, job_id: Uuid) -> Option<ScheduledJob> {
        self.inner.lock().unwrap().jobs.get(&job_id).cloned()
    }

    pub fn start_build(&self, build_id: Uuid) -> Result<(), SchedulerError> {
        let mut state = self.inner.lock().unwrap();
        let build = state
            .builds
            .get_mut(&build_id)
            .ok_or(SchedulerError::BuildNotFound(build_id))?;
        if build.state == BuildState::Cancelled {
            return Err(SchedulerError::BuildCancelled(build_id));
        }
        if build.state == BuildState::Created {
            build.state = BuildState::Running;
            build.started_at = Some(now_ms());
        }
        Ok(())
    }

    /// Queue a job under a build. The spec's own priority orders the queue.
    pub fn submit_job(
        &self,
        build_id: Uuid,
        spec: JobSpec,
    ) -> Result<ScheduledJob, SchedulerError> {
        self.submit_job_with_dependencies(build_id, spec, Vec::new())
    }

    pub fn submit_job_with_dependencies(
        &self,
        build_id: Uuid,
        spec: JobSpec,
        depends_on: Vec<Uuid>,
    ) -> Result<ScheduledJob, SchedulerError> {
        let mut state = self.inner.lock().unwrap();

        if state.queue.len() >= self.config.max_queue_length {
            return Err(SchedulerError::QueueFull(state.queue.len()));
        }
        let build = state
            .builds
            .get_mut(&build_id)
            .ok_or(SchedulerError::BuildNotFound(build_id))?;
        if build.state == BuildState::Cancelled {
            return Err(SchedulerError::BuildCancelled(build_id));
        }

        let now = now_ms();
        build.total_jobs += 1;
        build.pending_jobs += 1;
        build.job_ids.push(spec.job_id);
        build.refresh_progress();

        let sequence = state.next_sequence;
        state.next_sequence += 1;

        let job = ScheduledJob {
            build_id,
            sequence,
            state: JobState::Pending,
            assigned_worker_id: None,
            queued_at: now,
            assigned_at: None,
            started_at: None,
            completed_at: None,
            retry_count: 0,
            max_retries: self.config.default_max_retries,
            last_error: None,
            deadline: None,
            depends_on,
            spec,
        };

        state.queue.push(QueueEntry {
            priority: job.spec.priority,
            queued_at: now,
            sequence,
            job_id: job.job_id(),
        });
        state.jobs.insert(job.job_id(), job.clone());
        debug!(
            "queued job {} (priority {}) for build {}",
            job.job_id(),
            job.spec.priority,
            build_id
        );
        Ok(job)
    }

    // ========================================================================
    // Assignment
    // ========================================================================

    /// Selection constraints derived from the job spec.
    fn criteria_for(job: &ScheduledJob) -> SelectionCriteria {
        SelectionCriteria {
            required_caps: job
                .spec
                .required_capabilities
                .union(job.spec.kind.base_capabilities()),
            min_available_slots: 1,
            ..SelectionCriteria::default()
        }
    }

    fn pick_worker(&self, state: &mut SchedulerState, job: &ScheduledJob) -> Option<Uuid> {
        let criteria = Self::criteria_for(job);
        match self.config.load_balancing {
            LoadBalancing::LeastLoaded => self.registry.select(&criteria),
            LoadBalancing::Weighted => self.registry.select_weighted(&criteria),
            LoadBalancing::RoundRobin => {
                let eligible = self.registry.eligible_workers(&criteria);
                if eligible.is_empty() {
                    return None;
                }
                let picked = eligible[state.round_robin_cursor % eligible.len()];
                state.round_robin_cursor = state.round_robin_cursor.wrapping_add(1);
                Some(picked)
            }
            LoadBalancing::LeastLatency => {
                let eligible = self.registry.eligible_workers(&criteria);
                eligible.into_iter().min_by(|a, b| {
                    let la = self
                        .registry
                        .get(*a)
                        .map(|w| w.network_latency_ms)
                        .unwrap_or(f64::MAX);
                    let lb = self
                        .registry
                        .get(*b)
                        .map(|w| w.network_latency_ms)
                        .unwrap_or(f64::MAX);
                    la.partial_cmp(&lb).unwrap_or(Ordering::Equal)
                })
            }
            LoadBalancing::Random => {
                let eligible = self.registry.eligible_workers(&criteria);
                eligible.choose(&mut rand::thread_rng()).copied()
            }
        }
    }

    /// Drain the queue head while jobs are assignable.
    ///
    /// Stops at the first job whose dependencies are incomplete (queued
    /// work stays queued behind a waiting dependent) or when no eligible
    /// worker remains. Returns how many jobs were assigned.
    pub fn process_queue(&self) -> usize {
        let mut assigned = 0;
        let mut events = Vec::new();

        {
            let mut state = self.inner.lock().unwrap();
            loop {
                // Lazily discard entries whose job has moved on (cancelled,
                // retried under a new entry, ..).
                let job_id = match state.queue.peek() {
                    Some(entry) => entry.job_id,
                    None => break,
                };
                let job = match state.jobs.get(&job_id) {
                    Some(job) if job.state == JobState::Pending => job.clone(),
                    _ => {
                        state.queue.pop();
                        continue;
                    }
                };

                match self.dependency_gate(&state, &job) {
                    DependencyGate::Ready => {}
                    DependencyGate::Blocked => break,
                    DependencyGate::Broken(dep) => {
                        state.queue.pop();
                        let error = format!("dependency {} did not complete", dep);
                        events.extend(self.fail_job_locked(&mut state, job_id, &error, false));
                        continue;
                    }
                }

                let Some(worker_id) = self.pick_worker(&mut state, &job) else {
                    break;
                };
                if self.registry.record_job_start(worker_id).is_err() {
                    break;
                }

                state.queue.pop();
                let now = now_ms();
                let job = state.jobs.get_mut(&job_id).expect("job exists");
                job.state = JobState::Assigned;
                job.assigned_worker_id = Some(worker_id);
                job.assigned_at = Some(now);
                job.deadline = Some(now + job.spec.timeout_secs * 1000);
                let build_id = job.build_id;
                let spec = job.spec.clone();

                state.running.insert(job_id);
                if let Some(build) = state.builds.get_mut(&build_id) {
                    build.pending_jobs = build.pending_jobs.saturating_sub(1);
                    build.running_jobs += 1;
                }

                events.push(SchedulerEvent::JobAssigned {
                    job_id,
                    build_id,
                    worker_id,
                    spec,
                });
                assigned += 1;
            }
        }

        self.emit(events);
        assigned
    }

    fn dependency_gate(&self, state: &SchedulerState, job: &ScheduledJob) -> DependencyGate {
        for dep in &job.depends_on {
            match state.jobs.get(dep).map(|d| d.state) {
                Some(JobState::Completed) => {}
                Some(JobState::Failed) | Some(JobState::Cancelled) | Some(JobState::Timeout) => {
                    return DependencyGate::Broken(*dep);
                }
                Some(_) => return DependencyGate::Blocked,
                None => return DependencyGate::Broken(*dep),
            }
        }
        DependencyGate::Ready
    }

    // ========================================================================
    // Results
    // ========================================================================

    /// Worker accepted the assignment; the job is now running.
    pub fn report_job_accepted(&self, job_id: Uuid) -> Result<(), SchedulerError> {
        let mut state = self.inner.lock().unwrap();
        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or(SchedulerError::JobNotFound(job_id))?;
        if job.state == JobState::Assigned {
            job.state = JobState::Running;
            job.started_at = Some(now_ms());
        }
        Ok(())
    }

    /// Worker turned the assignment down (typically at capacity). The job
    /// goes back to the queue without consuming a retry slot.
    pub fn report_job_rejected(&self, job_id: Uuid, reason: &str) -> Result<(), SchedulerError> {
        let mut state = self.inner.lock().unwrap();
        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or(SchedulerError::JobNotFound(job_id))?;
        warn!("job {} rejected: {}", job_id, reason);
        let worker = job.assigned_worker_id.take();
        self.requeue_locked(&mut state, job_id);
        if let Some(worker_id) = worker {
            self.registry.release_job_slot(worker_id);
        }
        Ok(())
    }

    pub fn report_job_progress(&self, job_id: Uuid, _percent: f64) {
        // Progress feeds the owning session's aggregate only.
        let mut state = self.inner.lock().unwrap();
        if let Some(job) = state.jobs.get(&job_id) {
            let build_id = job.build_id;
            if let Some(build) = state.builds.get_mut(&build_id) {
                build.refresh_progress();
            }
        }
    }

    pub fn report_job_result(
        &self,
        job_id: Uuid,
        result: JobResult,
    ) -> Result<(), SchedulerError> {
        if !result.success {
            let error = if result.stderr.is_empty() {
                format!("exited with code {}", result.exit_code)
            } else {
                result.stderr.clone()
            };
            return self.report_job_failure(job_id, &error);
        }

        let mut events = Vec::new();
        {
            let mut state = self.inner.lock().unwrap();
            let job = state
                .jobs
                .get_mut(&job_id)
                .ok_or(SchedulerError::JobNotFound(job_id))?;
            if job.state.is_terminal() {
                return Ok(());
            }

            let now = now_ms();
            // A worker may report completion for a job we already requeued
            // after its disconnect; accept the result either way, but keep
            // the session counters honest.
            let was_running = matches!(job.state, JobState::Assigned | JobState::Running);
            job.state = JobState::Completed;
            job.completed_at = Some(now);
            let worker_id = job.assigned_worker_id;
            let build_id = job.build_id;

            state.running.remove(&job_id);
            if let Some(worker_id) = worker_id {
                self.registry
                    .record_job_finished(worker_id, true, result.duration_secs);
            }

            if let Some(build) = state.builds.get_mut(&build_id) {
                if was_running {
                    build.running_jobs = build.running_jobs.saturating_sub(1);
                } else {
                    build.pending_jobs = build.pending_jobs.saturating_sub(1);
                }
                build.completed_jobs += 1;
                if let Some(path) = &result.output_file {
                    build.output_artifacts.push(path.display().to_string());
                }
                build.refresh_progress();
                events.push(SchedulerEvent::JobCompleted {
                    job_id,
                    build_id,
                    worker_id: worker_id.unwrap_or_default(),
                    result,
                });
                events.extend(Self::finalize_if_done(build));
            }
        }
        self.emit(events);
        Ok(())
    }

    pub fn report_job_failure(&self, job_id: Uuid, error: &str) -> Result<(), SchedulerError> {
        let events = {
            let mut state = self.inner.lock().unwrap();
            if !state.jobs.contains_key(&job_id) {
                return Err(SchedulerError::JobNotFound(job_id));
            }
            self.fail_job_locked(&mut state, job_id, error, false)
        };
        self.emit(events);
        Ok(())
    }

    /// Worker confirmed a JOB_CANCEL.
    pub fn report_job_cancelled(&self, job_id: Uuid) {
        let events = {
            let mut state = self.inner.lock().unwrap();
            self.cancel_job_locked(&mut state, job_id, "cancelled by worker")
        };
        self.emit(events);
    }

    /// Shared failure path for execution errors and timeouts.
    ///
    /// `timed_out` only changes the terminal state label (TIMEOUT instead
    /// of FAILED); budget accounting is identical.
    fn fail_job_locked(
        &self,
        state: &mut SchedulerState,
        job_id: Uuid,
        error: &str,
        timed_out: bool,
    ) -> Vec<SchedulerEvent> {
        let mut events = Vec::new();
        let Some(job) = state.jobs.get_mut(&job_id) else {
            return events;
        };
        if job.state.is_terminal() {
            return events;
        }

        job.last_error = Some(error.to_string());
        let worker_id = job.assigned_worker_id;
        let build_id = job.build_id;
        // Only execution failures retry; a job that never reached a worker
        // (broken dependency) fails outright.
        let can_retry = worker_id.is_some() && job.retry_count < job.max_retries;

        state.running.remove(&job_id);
        if let Some(worker_id) = worker_id {
            self.registry.record_job_finished(worker_id, false, 0.0);
        }

        if can_retry {
            let job = state.jobs.get_mut(&job_id).expect("job exists");
            job.retry_count += 1;
            job.state = JobState::Retry;
            debug!(
                "job {} failed ({}), retry {}/{}",
                job_id, error, job.retry_count, job.max_retries
            );
            let was_running = job.assigned_worker_id.is_some();
            job.assigned_worker_id = None;
            job.assigned_at = None;
            job.started_at = None;
            job.deadline = None;
            self.push_pending(state, job_id);
            if let Some(build) = state.builds.get_mut(&build_id) {
                if was_running {
                    build.running_jobs = build.running_jobs.saturating_sub(1);
                }
                build.pending_jobs += 1;
                build.refresh_progress();
            }
        } else {
            let job = state.jobs.get_mut(&job_id).expect("job exists");
            let was_running = job.assigned_worker_id.is_some();
            job.state = if timed_out {
                JobState::Timeout
            } else {
                JobState::Failed
            };
            job.completed_at = Some(now_ms());
            job.assigned_worker_id = None;
            let retry_count = job.retry_count;
            warn!("job {} failed permanently: {}", job_id, error);

            if let Some(build) = state.builds.get_mut(&build_id) {
                if was_running {
                    build.running_jobs = build.running_jobs.saturating_sub(1);
                } else {
                    build.pending_jobs = build.pending_jobs.saturating_sub(1);
                }
                build.failed_jobs += 1;
                build.error_summary = Some(match build.error_summary.take() {
                    Some(prior) => format!("{}; {}", prior, error),
                    None => error.to_string(),
                });
                build.refresh_progress();
                events.push(SchedulerEvent::JobFailed {
                    job_id,
                    build_id,
                    error: error.to_string(),
                    retry_count,
                });
                events.extend(Self::finalize_if_done(build));
            }
        }
        events
    }

    /// Re-enqueue an assignment that never ran (rejection, disconnect).
    /// The retry budget is left untouched; the retry ladder lives in
    /// `fail_job_locked`.
    fn requeue_locked(&self, state: &mut SchedulerState, job_id: Uuid) {
        if !state.jobs.contains_key(&job_id) {
            return;
        }
        let was_counted_running = state.running.remove(&job_id);
        let job = state.jobs.get_mut(&job_id).expect("job exists");
        job.state = JobState::Pending;
        job.assigned_worker_id = None;
        job.assigned_at = None;
        job.started_at = None;
        job.deadline = None;
        let build_id = job.build_id;
        self.push_pending(state, job_id);
        if let Some(build) = state.builds.get_mut(&build_id) {
            if was_counted_running {
                build.running_jobs = build.running_jobs.saturating_sub(1);
            }
            build.pending_jobs += 1;
        }
    }

    /// Push a job back onto the heap with a fresh queue position.
    fn push_pending(&self, state: &mut SchedulerState, job_id: Uuid) {
        let sequence = state.next_sequence;
        state.next_sequence += 1;
        let Some(job) = state.jobs.get_mut(&job_id) else {
            return;
        };
        job.state = JobState::Pending;
        job.queued_at = now_ms();
        let entry = QueueEntry {
            priority: job.spec.priority,
            queued_at: job.queued_at,
            sequence,
            job_id,
        };
        state.queue.push(entry);
    }

    fn finalize_if_done(build: &mut BuildSession) -> Vec<SchedulerEvent> {
        if build.state.is_terminal() {
            return Vec::new();
        }
        if build.completed_jobs + build.failed_jobs < build.total_jobs {
            return Vec::new();
        }
        build.success = build.failed_jobs == 0 && build.completed_jobs == build.total_jobs;
        build.state = if build.success {
            BuildState::Completed
        } else {
            BuildState::Failed
        };
        build.completed_at = Some(now_ms());
        info!(
            "build {} finished: {} completed, {} failed",
            build.build_id, build.completed_jobs, build.failed_jobs
        );
        vec![SchedulerEvent::BuildCompleted {
            build_id: build.build_id,
            success: build.success,
        }]
    }

    // ========================================================================
    // Cancellation
    // ========================================================================

    /// Cancel a whole build: still-pending jobs leave the queue at once,
    /// running jobs get a JOB_CANCEL request and die via confirmation or
    /// timeout.
    pub fn cancel_build(&self, build_id: Uuid, reason: &str) -> Result<(), SchedulerError> {
        let mut events = Vec::new();
        {
            let mut state = self.inner.lock().unwrap();
            let build = state
                .builds
                .get_mut(&build_id)
                .ok_or(SchedulerError::BuildNotFound(build_id))?;
            if build.state.is_terminal() {
                return Ok(());
            }
            build.state = BuildState::Cancelled;
            build.completed_at = Some(now_ms());
            build.error_summary = Some(reason.to_string());
            let job_ids = build.job_ids.clone();

            for job_id in job_ids {
                let Some(job) = state.jobs.get_mut(&job_id) else {
                    continue;
                };
                match job.state {
                    JobState::Pending | JobState::Retry => {
                        job.state = JobState::Cancelled;
                        job.last_error = Some(reason.to_string());
                        let build = state.builds.get_mut(&build_id).expect("build exists");
                        build.pending_jobs = build.pending_jobs.saturating_sub(1);
                        build.failed_jobs += 1;
                    }
                    JobState::Assigned | JobState::Running => {
                        if let Some(worker_id) = job.assigned_worker_id {
                            events.push(SchedulerEvent::CancelRequested {
                                job_id,
                                worker_id,
                                reason: reason.to_string(),
                            });
                        }
                    }
                    _ => {}
                }
            }
        }
        self.emit(events);
        Ok(())
    }

    /// Cancel one job, wherever it currently is.
    pub fn cancel_job(&self, job_id: Uuid, reason: &str) -> Result<(), SchedulerError> {
        let events = {
            let mut state = self.inner.lock().unwrap();
            if !state.jobs.contains_key(&job_id) {
                return Err(SchedulerError::JobNotFound(job_id));
            }
            let job = state.jobs.get(&job_id).expect("job exists");
            match job.state {
                JobState::Assigned | JobState::Running => {
                    let worker_id = job.assigned_worker_id;
                    let mut events = Vec::new();
                    if let Some(worker_id) = worker_id {
                        events.push(SchedulerEvent::CancelRequested {
                            job_id,
                            worker_id,
                            reason: reason.to_string(),
                        });
                    }
                    events
                }
                JobState::Pending | JobState::Retry => {
                    self.cancel_job_locked(&mut state, job_id, reason)
                }
                _ => Vec::new(),
            }
        };
        self.emit(events);
        Ok(())
    }

    fn cancel_job_locked(
        &self,
        state: &mut SchedulerState,
        job_id: Uuid,
        reason: &str,
    ) -> Vec<SchedulerEvent> {
        let mut events = Vec::new();
        let Some(job) = state.jobs.get_mut(&job_id) else {
            return events;
        };
        if job.state.is_terminal() {
            return events;
        }
        let was_running = matches!(job.state, JobState::Assigned | JobState::Running);
        let worker_id = job.assigned_worker_id.take();
        job.state = JobState::Cancelled;
        job.last_error = Some(reason.to_string());
        job.completed_at = Some(now_ms());
        let build_id = job.build_id;

        state.running.remove(&job_id);
        if let Some(worker_id) = worker_id {
            self.registry.release_job_slot(worker_id);
        }
        if let Some(build) = state.builds.get_mut(&build_id) {
            if was_running {
                build.running_jobs = build.running_jobs.saturating_sub(1);
            } else {
                build.pending_jobs = build.pending_jobs.saturating_sub(1);
            }
            build.failed_jobs += 1;
            build.refresh_progress();
            events.extend(Self::finalize_if_done(build));
        }
        events
    }

    // ========================================================================
    // Failure recovery
    // ========================================================================

    /// A worker vanished: every job it held goes back to the queue. The
    /// retry budget is not consumed; the job did not itself fail.
    pub fn handle_worker_disconnect(&self, worker_id: Uuid) -> usize {
        let mut recovered = 0;
        {
            let mut state = self.inner.lock().unwrap();
            let held: Vec<Uuid> = state
                .jobs
                .values()
                .filter(|j| {
                    j.assigned_worker_id == Some(worker_id)
                        && matches!(j.state, JobState::Assigned | JobState::Running)
                })
                .map(|j| j.job_id())
                .collect();

            for job_id in held {
                info!(
                    "requeueing job {} after worker {} disconnect",
                    job_id, worker_id
                );
                self.requeue_locked(&mut state, job_id);
                recovered += 1;
            }
        }
        recovered
    }

    /// Fail every running job whose deadline has passed. Returns the count.
    pub fn check_timeouts(&self) -> usize {
        let now = now_ms();
        let mut timed_out = 0;
        let mut events = Vec::new();
        {
            let mut state = self.inner.lock().unwrap();
            let expired: Vec<Uuid> = state
                .jobs
                .values()
                .filter(|j| {
                    matches!(j.state, JobState::Assigned | JobState::Running)
                        && j.deadline.map(|d| d < now).unwrap_or(false)
                })
                .map(|j| j.job_id())
                .collect();

            for job_id in expired {
                events.extend(self.fail_job_locked(
                    &mut state,
                    job_id,
                    JOB_TIMED_OUT_MESSAGE,
                    true,
                ));
                timed_out += 1;
            }
        }
        self.emit(events);
        timed_out
    }

    pub fn queue_len(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }

    pub fn running_len(&self) -> usize {
        self.inner.lock().unwrap().running.len()
    }
}

enum DependencyGate {
    Ready,
    Blocked,
    Broken(Uuid),
}

// ============================================================================
// Pure decomposition helpers
// ============================================================================

/// One compile job per source file, sharing compiler and flags.
pub fn decompose_compile(
    sources: &[std::path::PathBuf],
    compiler: &str,
    flags: &[String],
) -> Vec<JobSpec> {
    sources
        .iter()
        .map(|source| {
            let mut spec = JobSpec::compile(source.clone(), compiler);
            spec.compiler_args = flags.to_vec();
            spec.output_file = Some(source.with_extension("o"));
            spec.kind = JobKind::Compile;
            spec
        })
        .collect()
}

/// Strategy heuristic: tiny projects build whole, large flat projects
/// split per translation unit, target-aware projects split per target.
pub fn suggest_strategy(
    source_count: usize,
    has_cmake: bool,
    target_count: usize,
) -> DistributionStrategy {
    if source_count < 5 {
        DistributionStrategy::WholeProject
    } else if source_count > 50 && !has_cmake {
        DistributionStrategy::CompileUnits
    } else if has_cmake && target_count > 0 {
        DistributionStrategy::Targets
    } else {
        DistributionStrategy::Hybrid
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{RegistryConfig, WorkerRegistry};
    use cyxmake_protocol::{Capabilities, HelloPayload, SystemInfo};
    use cyxmake_transport::ConnectionId;
    use std::path::PathBuf;
    use std::sync::Mutex as StdMutex;

    fn registry_with_worker(name: &str, max_jobs: u32) -> (Arc<WorkerRegistry>, Uuid) {
        let registry = Arc::new(WorkerRegistry::new(RegistryConfig::default()));
        let id = add_worker(&registry, name, max_jobs);
        (registry, id)
    }

    fn add_worker(registry: &Arc<WorkerRegistry>, name: &str, max_jobs: u32) -> Uuid {
        let hello = HelloPayload {
            name: name.to_string(),
            hostname: format!("{}-host", name),
            port: 0,
            system_info: SystemInfo::default(),
            capabilities: Capabilities::COMPILE_C | Capabilities::LINK,
            tools: Default::default(),
            max_jobs,
            auth_token: None,
        };
        let id = registry.register(&hello, ConnectionId::new()).unwrap();
        registry.mark_online(id).unwrap();
        id
    }

    fn scheduler(registry: Arc<WorkerRegistry>) -> WorkScheduler {
        WorkScheduler::new(SchedulerConfig::default(), registry)
    }

    fn compile_spec(priority: u32, timeout_secs: u64) -> JobSpec {
        let mut spec = JobSpec::compile("a.c", "cc");
        spec.priority = priority;
        spec.timeout_secs = timeout_secs;
        spec
    }

    fn ok_result(job_id: Uuid) -> JobResult {
        JobResult {
            job_id,
            success: true,
            exit_code: 0,
            duration_secs: 0.12,
            stdout: String::new(),
            stderr: String::new(),
            output_file: None,
            output_hash: None,
            output_size: None,
        }
    }

    /// Collects events for assertions.
    fn record_events(scheduler: &WorkScheduler) -> Arc<StdMutex<Vec<SchedulerEvent>>> {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        scheduler.subscribe(move |event| sink.lock().unwrap().push(event.clone()));
        log
    }

    #[test]
    fn test_single_job_happy_path() {
        let (registry, worker_id) = registry_with_worker("w1", 2);
        let scheduler = scheduler(Arc::clone(&registry));
        let events = record_events(&scheduler);

        let build = scheduler.create_build("demo", DistributionStrategy::CompileUnits);
        let mut spec = compile_spec(50, 30);
        spec.source_file = Some(PathBuf::from("a.c"));
        let job = scheduler.submit_job(build.build_id, spec).unwrap();
        scheduler.start_build(build.build_id).unwrap();

        assert_eq!(scheduler.process_queue(), 1);
        let assigned = scheduler.get_job(job.job_id()).unwrap();
        assert_eq!(assigned.state, JobState::Assigned);
        assert_eq!(assigned.assigned_worker_id, Some(worker_id));
        assert_eq!(registry.get(worker_id).unwrap().active_jobs, 1);

        scheduler.report_job_accepted(job.job_id()).unwrap();
        scheduler
            .report_job_result(job.job_id(), ok_result(job.job_id()))
            .unwrap();

        let session = scheduler.get_build(build.build_id).unwrap();
        assert_eq!(session.state, BuildState::Completed);
        assert_eq!(session.completed_jobs, 1);
        assert_eq!(session.failed_jobs, 0);
        assert!(session.success);
        assert_eq!(registry.get(worker_id).unwrap().active_jobs, 0);

        let log = events.lock().unwrap();
        let kinds: Vec<&str> = log
            .iter()
            .map(|e| match e {
                SchedulerEvent::JobAssigned { .. } => "assigned",
                SchedulerEvent::JobCompleted { .. } => "completed",
                SchedulerEvent::BuildCompleted { .. } => "build",
                _ => "other",
            })
            .collect();
        assert_eq!(kinds, vec!["assigned", "completed", "build"]);
    }

    #[test]
    fn test_priority_preemption() {
        let (registry, _worker) = registry_with_worker("w1", 1);
        let scheduler = scheduler(registry);
        let events = record_events(&scheduler);

        let build = scheduler.create_build("prio", DistributionStrategy::CompileUnits);
        let low = scheduler
            .submit_job(build.build_id, compile_spec(50, 30))
            .unwrap();
        let high = scheduler
            .submit_job(build.build_id, compile_spec(200, 30))
            .unwrap();
        scheduler.start_build(build.build_id).unwrap();

        // One slot: only the higher priority job may be assigned.
        assert_eq!(scheduler.process_queue(), 1);
        assert_eq!(
            scheduler.get_job(high.job_id()).unwrap().state,
            JobState::Assigned
        );
        assert_eq!(
            scheduler.get_job(low.job_id()).unwrap().state,
            JobState::Pending
        );

        let log = events.lock().unwrap();
        match &log[0] {
            SchedulerEvent::JobAssigned { job_id, .. } => assert_eq!(*job_id, high.job_id()),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_fifo_within_priority() {
        let (registry, _worker) = registry_with_worker("w1", 1);
        let scheduler = scheduler(registry);

        let build = scheduler.create_build("fifo", DistributionStrategy::CompileUnits);
        let first = scheduler
            .submit_job(build.build_id, compile_spec(100, 30))
            .unwrap();
        let _second = scheduler
            .submit_job(build.build_id, compile_spec(100, 30))
            .unwrap();
        scheduler.start_build(build.build_id).unwrap();

        scheduler.process_queue();
        assert_eq!(
            scheduler.get_job(first.job_id()).unwrap().state,
            JobState::Assigned
        );
    }

    #[test]
    fn test_retry_ladder_to_permanent_failure() {
        let registry = Arc::new(WorkerRegistry::new(RegistryConfig::default()));
        add_worker(&registry, "w1", 4);
        let config = SchedulerConfig {
            default_max_retries: 2,
            ..SchedulerConfig::default()
        };
        let scheduler = WorkScheduler::new(config, registry);
        let events = record_events(&scheduler);

        let build = scheduler.create_build("retry", DistributionStrategy::CompileUnits);
        let job = scheduler
            .submit_job(build.build_id, compile_spec(50, 30))
            .unwrap();
        assert_eq!(job.max_retries, 2);
        scheduler.start_build(build.build_id).unwrap();

        // max_retries = 2: two failures re-enqueue, the third is final.
        for expected_retry in 1..=2u32 {
            assert_eq!(scheduler.process_queue(), 1);
            scheduler
                .report_job_failure(job.job_id(), "compiler crashed")
                .unwrap();
            let j = scheduler.get_job(job.job_id()).unwrap();
            assert_eq!(j.retry_count, expected_retry);
            assert_eq!(j.state, JobState::Pending);
            assert_eq!(j.assigned_worker_id, None);
        }

        assert_eq!(scheduler.process_queue(), 1);
        scheduler
            .report_job_failure(job.job_id(), "compiler crashed")
            .unwrap();
        let j = scheduler.get_job(job.job_id()).unwrap();
        assert_eq!(j.state, JobState::Failed);
        assert_eq!(j.retry_count, 2);

        let session = scheduler.get_build(build.build_id).unwrap();
        assert_eq!(session.state, BuildState::Failed);
        assert_eq!(session.failed_jobs, 1);
        assert!(!session.success);
        assert!(session.error_summary.is_some());

        // Retry budget invariant: JobFailed only fired at full retry count.
        let log = events.lock().unwrap();
        for event in log.iter() {
            if let SchedulerEvent::JobFailed { retry_count, .. } = event {
                assert_eq!(*retry_count, 2);
            }
        }
    }

    #[test]
    fn test_timeout_after_deadline_passes() {
        let (registry, _worker) = registry_with_worker("w1", 1);
        let scheduler = scheduler(registry);

        let build = scheduler.create_build("timeout", DistributionStrategy::CompileUnits);
        let job = scheduler
            .submit_job(build.build_id, compile_spec(50, 1))
            .unwrap();
        scheduler.start_build(build.build_id).unwrap();
        scheduler.process_queue();

        // Before the deadline nothing times out.
        assert_eq!(scheduler.check_timeouts(), 0);

        std::thread::sleep(std::time::Duration::from_millis(1100));
        assert_eq!(scheduler.check_timeouts(), 1);
        let j = scheduler.get_job(job.job_id()).unwrap();
        // Retry path identical to an execution failure.
        assert_eq!(j.state, JobState::Pending);
        assert_eq!(j.retry_count, 1);
        assert_eq!(j.last_error.as_deref(), Some(JOB_TIMED_OUT_MESSAGE));
    }

    #[test]
    fn test_timeout_budget_exhaustion_ends_in_timeout_state() {
        let registry = Arc::new(WorkerRegistry::new(RegistryConfig::default()));
        add_worker(&registry, "w1", 1);
        let config = SchedulerConfig {
            default_max_retries: 1,
            ..SchedulerConfig::default()
        };
        let scheduler = WorkScheduler::new(config, registry);

        let build = scheduler.create_build("timeout2", DistributionStrategy::CompileUnits);
        // timeout_secs = 0 puts the deadline in the past on assignment.
        let job = scheduler
            .submit_job(build.build_id, compile_spec(50, 0))
            .unwrap();
        scheduler.start_build(build.build_id).unwrap();

        for _ in 0..2 {
            scheduler.process_queue();
            std::thread::sleep(std::time::Duration::from_millis(5));
            scheduler.check_timeouts();
        }
        let j = scheduler.get_job(job.job_id()).unwrap();
        assert_eq!(j.state, JobState::Timeout);
        assert!(scheduler.get_build(build.build_id).unwrap().state.is_terminal());
    }

    #[test]
    fn test_worker_disconnect_requeues_without_retry_cost() {
        let registry = Arc::new(WorkerRegistry::new(RegistryConfig::default()));
        let worker_a = add_worker(&registry, "a", 1);
        let worker_b = add_worker(&registry, "b", 1);
        let scheduler = scheduler(Arc::clone(&registry));

        let build = scheduler.create_build("disc", DistributionStrategy::CompileUnits);
        let j1 = scheduler
            .submit_job(build.build_id, compile_spec(50, 30))
            .unwrap();
        let j2 = scheduler
            .submit_job(build.build_id, compile_spec(50, 30))
            .unwrap();
        scheduler.start_build(build.build_id).unwrap();
        assert_eq!(scheduler.process_queue(), 2);

        let assigned_to_a = [j1.job_id(), j2.job_id()]
            .into_iter()
            .find(|id| {
                scheduler.get_job(*id).unwrap().assigned_worker_id == Some(worker_a)
            })
            .expect("one job on worker a");

        assert_eq!(scheduler.handle_worker_disconnect(worker_a), 1);
        let recovered = scheduler.get_job(assigned_to_a).unwrap();
        assert_eq!(recovered.state, JobState::Pending);
        assert_eq!(recovered.retry_count, 0);
        assert_eq!(recovered.assigned_worker_id, None);

        // Disconnect recovery invariant: nothing still points at worker a.
        for id in [j1.job_id(), j2.job_id()] {
            assert_ne!(
                scheduler.get_job(id).unwrap().assigned_worker_id,
                Some(worker_a)
            );
        }

        // Free a slot on worker b and the job is reassigned there.
        // (worker b still runs its own job; finish it first.)
        let on_b = [j1.job_id(), j2.job_id()]
            .into_iter()
            .find(|id| scheduler.get_job(*id).unwrap().assigned_worker_id == Some(worker_b))
            .unwrap();
        scheduler.report_job_accepted(on_b).unwrap();
        scheduler.report_job_result(on_b, ok_result(on_b)).unwrap();

        assert_eq!(scheduler.process_queue(), 1);
        assert_eq!(
            scheduler.get_job(assigned_to_a).unwrap().assigned_worker_id,
            Some(worker_b)
        );
    }

    #[test]
    fn test_dependency_head_of_line_blocking() {
        let (registry, _worker) = registry_with_worker("w1", 4);
        let scheduler = scheduler(registry);

        let build = scheduler.create_build("deps", DistributionStrategy::CompileUnits);
        let dep = scheduler
            .submit_job(build.build_id, compile_spec(100, 30))
            .unwrap();
        // Higher priority but depends on `dep`; a lower-priority job waits
        // behind it even though a worker is free.
        let dependent_spec = compile_spec(200, 30);
        let dependent = scheduler
            .submit_job_with_dependencies(build.build_id, dependent_spec, vec![dep.job_id()])
            .unwrap();
        let bystander = scheduler
            .submit_job(build.build_id, compile_spec(50, 30))
            .unwrap();
        scheduler.start_build(build.build_id).unwrap();

        // Dependent sits at the head: only `dep` itself may start (it has
        // lower priority than the dependent, so first pass assigns just
        // the dependent's dependency after the head blocks).
        let assigned = scheduler.process_queue();
        assert_eq!(assigned, 0, "head-of-line dependency must block the queue");
        assert_eq!(
            scheduler.get_job(bystander.job_id()).unwrap().state,
            JobState::Pending
        );

        // Cancelling the dependent unblocks the head of the queue.
        scheduler.cancel_job(dependent.job_id(), "superseded").unwrap();
        let assigned = scheduler.process_queue();
        assert_eq!(assigned, 2);
        assert_eq!(
            scheduler.get_job(dep.job_id()).unwrap().state,
            JobState::Assigned
        );
        assert_eq!(
            scheduler.get_job(bystander.job_id()).unwrap().state,
            JobState::Assigned
        );
    }

    #[test]
    fn test_cancel_build_clears_pending_and_requests_running_cancel() {
        let (registry, worker_id) = registry_with_worker("w1", 1);
        let scheduler = scheduler(registry);
        let events = record_events(&scheduler);

        let build = scheduler.create_build("cancel", DistributionStrategy::CompileUnits);
        let running = scheduler
            .submit_job(build.build_id, compile_spec(100, 30))
            .unwrap();
        let pending = scheduler
            .submit_job(build.build_id, compile_spec(50, 30))
            .unwrap();
        scheduler.start_build(build.build_id).unwrap();
        scheduler.process_queue();
        scheduler.report_job_accepted(running.job_id()).unwrap();

        scheduler.cancel_build(build.build_id, "user abort").unwrap();

        let session = scheduler.get_build(build.build_id).unwrap();
        assert_eq!(session.state, BuildState::Cancelled);
        assert_eq!(
            scheduler.get_job(pending.job_id()).unwrap().state,
            JobState::Cancelled
        );

        // The running job is cancelled via the worker round-trip.
        let log = events.lock().unwrap();
        let cancel_req = log.iter().find_map(|e| match e {
            SchedulerEvent::CancelRequested { job_id, worker_id, .. } => {
                Some((*job_id, *worker_id))
            }
            _ => None,
        });
        assert_eq!(cancel_req, Some((running.job_id(), worker_id)));
        drop(log);

        scheduler.report_job_cancelled(running.job_id());
        assert_eq!(
            scheduler.get_job(running.job_id()).unwrap().state,
            JobState::Cancelled
        );

        // Submitting into a cancelled build is refused.
        assert!(matches!(
            scheduler.submit_job(build.build_id, compile_spec(10, 30)),
            Err(SchedulerError::BuildCancelled(_))
        ));
    }

    #[test]
    fn test_counter_consistency_invariant() {
        let registry = Arc::new(WorkerRegistry::new(RegistryConfig::default()));
        add_worker(&registry, "w1", 2);
        let scheduler = scheduler(Arc::clone(&registry));

        let build = scheduler.create_build("counters", DistributionStrategy::CompileUnits);
        let mut ids = Vec::new();
        for _ in 0..4 {
            ids.push(
                scheduler
                    .submit_job(build.build_id, compile_spec(50, 30))
                    .unwrap()
                    .job_id(),
            );
        }
        scheduler.start_build(build.build_id).unwrap();

        let check = |s: &WorkScheduler| {
            let b = s.get_build(build.build_id).unwrap();
            assert_eq!(
                b.pending_jobs + b.running_jobs + b.completed_jobs + b.failed_jobs,
                b.total_jobs
            );
        };

        check(&scheduler);
        scheduler.process_queue();
        check(&scheduler);
        scheduler.report_job_result(ids[0], ok_result(ids[0])).unwrap();
        check(&scheduler);
        scheduler.report_job_failure(ids[1], "boom").unwrap();
        check(&scheduler);
        scheduler.process_queue();
        check(&scheduler);
    }

    #[test]
    fn test_worker_slot_balance_invariant() {
        let registry = Arc::new(WorkerRegistry::new(RegistryConfig::default()));
        let w1 = add_worker(&registry, "w1", 2);
        let w2 = add_worker(&registry, "w2", 2);
        let scheduler = scheduler(Arc::clone(&registry));

        let build = scheduler.create_build("slots", DistributionStrategy::CompileUnits);
        for _ in 0..4 {
            scheduler
                .submit_job(build.build_id, compile_spec(50, 30))
                .unwrap();
        }
        scheduler.start_build(build.build_id).unwrap();
        scheduler.process_queue();

        for worker_id in [w1, w2] {
            let session = scheduler.get_build(build.build_id).unwrap();
            let assigned = session
                .job_ids()
                .iter()
                .filter(|id| {
                    scheduler
                        .get_job(**id)
                        .map(|j| {
                            j.assigned_worker_id == Some(worker_id) && j.state.holds_worker()
                        })
                        .unwrap_or(false)
                })
                .count() as u32;
            assert_eq!(registry.get(worker_id).unwrap().active_jobs, assigned);
        }
    }

    #[test]
    fn test_queue_full() {
        let registry = Arc::new(WorkerRegistry::new(RegistryConfig::default()));
        let config = SchedulerConfig {
            max_queue_length: 1,
            ..SchedulerConfig::default()
        };
        let scheduler = WorkScheduler::new(config, registry);
        let build = scheduler.create_build("full", DistributionStrategy::CompileUnits);
        scheduler
            .submit_job(build.build_id, compile_spec(50, 30))
            .unwrap();
        assert!(matches!(
            scheduler.submit_job(build.build_id, compile_spec(50, 30)),
            Err(SchedulerError::QueueFull(_))
        ));
    }

    #[test]
    fn test_decompose_compile() {
        let sources = vec![PathBuf::from("a.c"), PathBuf::from("b.c")];
        let flags = vec!["-O2".to_string()];
        let jobs = decompose_compile(&sources, "cc", &flags);
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].source_file.as_deref(), Some(std::path::Path::new("a.c")));
        assert_eq!(jobs[0].output_file.as_deref(), Some(std::path::Path::new("a.o")));
        assert_eq!(jobs[0].compiler_args, flags);
        assert_eq!(jobs[1].kind, JobKind::Compile);
        // Pure: same inputs produce the same shape (job ids are fresh).
        let again = decompose_compile(&sources, "cc", &flags);
        assert_eq!(again.len(), 2);
    }

    #[test]
    fn test_suggest_strategy() {
        assert_eq!(suggest_strategy(3, false, 0), DistributionStrategy::WholeProject);
        assert_eq!(suggest_strategy(3, true, 2), DistributionStrategy::WholeProject);
        assert_eq!(suggest_strategy(80, false, 0), DistributionStrategy::CompileUnits);
        assert_eq!(suggest_strategy(20, true, 3), DistributionStrategy::Targets);
        assert_eq!(suggest_strategy(20, false, 0), DistributionStrategy::Hybrid);
        assert_eq!(suggest_strategy(80, true, 3), DistributionStrategy::Targets);
    }
}
