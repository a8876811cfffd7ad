//! Coordinator façade: wires transport events into the registry and
//! scheduler, runs the handshake, and exposes the client build API.

use crate::auth::{AuthConfig, Authenticator};
use crate::config::CoordinatorConfig;
use crate::registry::{RegistryConfig, RegistryEvent, WorkerRegistry};
use crate::scheduler::{
    decompose_compile, suggest_strategy, BuildSession, SchedulerConfig, SchedulerEvent,
    WorkScheduler,
};
use anyhow::{Context, Result};
use cyxmake_cache::{ArtifactCache, ArtifactType, CacheConfig, CacheLookup, RemoteConfig, StoreOrigin};
use cyxmake_protocol::{
    ArtifactAckPayload, ArtifactPushPayload, ArtifactRequestPayload, ArtifactResponsePayload,
    AuthChallengePayload, AuthFailedPayload, AuthMethod, AuthResponsePayload, AuthSuccessPayload,
    DistributionStrategy, ErrorPayload, HeartbeatPayload, HelloPayload, JobAcceptPayload,
    JobCancelPayload, JobCancelledPayload, JobFailedPayload, JobProgressPayload, JobRejectPayload,
    JobResult, Message, MessageType, ShutdownPayload, StatusUpdatePayload, WelcomePayload,
};
use cyxmake_transport::{
    Connection, ConnectionHandler, ConnectionId, SendOutcome, ServerConfig, ServerHandle,
    TlsConfig, WsServer,
};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Client-facing knobs for `submit_build`.
#[derive(Debug, Clone)]
pub struct BuildOptions {
    pub strategy: Option<DistributionStrategy>,
    pub priority: u32,
    pub compiler: String,
    pub compiler_flags: Vec<String>,
    pub target_triple: String,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            strategy: None,
            priority: 100,
            compiler: "cc".to_string(),
            compiler_flags: Vec::new(),
            target_triple: format!("{}-{}", std::env::consts::ARCH, std::env::consts::OS),
        }
    }
}

struct PendingAuth {
    hello: HelloPayload,
    hello_id: Uuid,
    nonce: String,
}

struct Inner {
    server_id: Uuid,
    config: CoordinatorConfig,
    registry: Arc<WorkerRegistry>,
    scheduler: Arc<WorkScheduler>,
    cache: Arc<ArtifactCache>,
    auth: Authenticator,
    server: Mutex<Option<ServerHandle>>,
    pending_auth: Mutex<HashMap<ConnectionId, PendingAuth>>,
    finished_builds: Mutex<HashSet<Uuid>>,
    build_signal: Condvar,
    stopping: AtomicBool,
    shutdown: tokio::sync::Notify,
}

pub struct Coordinator {
    inner: Arc<Inner>,
}

impl Clone for Coordinator {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig) -> Result<Self> {
        let registry = Arc::new(WorkerRegistry::new(RegistryConfig {
            heartbeat_timeout_secs: config.registry.heartbeat_timeout_secs,
            max_missed_heartbeats: config.registry.max_missed_heartbeats,
            auto_remove_offline: config.registry.auto_remove_offline,
            offline_removal_delay_secs: config.registry.offline_removal_delay_secs,
            local_hostname: String::new(),
        }));

        let scheduler = Arc::new(WorkScheduler::new(
            SchedulerConfig {
                load_balancing: config.scheduler.load_balancing,
                default_max_retries: config.scheduler.max_retries,
                max_queue_length: config.scheduler.max_queue_length,
            },
            Arc::clone(&registry),
        ));

        let mut cache_config = CacheConfig::new(config.cache.resolved_dir());
        cache_config.max_size_bytes = config.cache.max_size_mb * 1024 * 1024;
        cache_config.max_entries = config.cache.max_entries;
        cache_config.max_age_days = config.cache.max_age_days;
        cache_config.compression_algo = config.cache.compression;
        cache_config.compression_threshold = config.cache.compression_threshold;
        cache_config.eviction_policy = config.cache.eviction_policy;
        cache_config.remote = config.cache.remote_url.clone().map(|url| RemoteConfig {
            url,
            read_only: config.cache.remote_read_only,
            ..RemoteConfig::default()
        });
        let cache = Arc::new(ArtifactCache::open(cache_config).context("open artifact cache")?);

        let auth = Authenticator::new(AuthConfig {
            method: config.auth.method,
            secret: config.auth.token.clone(),
            token_ttl_secs: config.auth.token_ttl_secs,
        });

        let inner = Arc::new(Inner {
            server_id: Uuid::new_v4(),
            config,
            registry,
            scheduler,
            cache,
            auth,
            server: Mutex::new(None),
            pending_auth: Mutex::new(HashMap::new()),
            finished_builds: Mutex::new(HashSet::new()),
            build_signal: Condvar::new(),
            stopping: AtomicBool::new(false),
            shutdown: tokio::sync::Notify::new(),
        });

        // Scheduler events drive the outgoing JOB_REQUEST / JOB_CANCEL
        // traffic. Weak reference: the scheduler lives inside Inner.
        let weak: Weak<Inner> = Arc::downgrade(&inner);
        inner.scheduler.subscribe(move |event| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_scheduler_event(event);
            }
        });

        Ok(Self { inner })
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.inner.registry
    }

    pub fn scheduler(&self) -> &Arc<WorkScheduler> {
        &self.inner.scheduler
    }

    pub fn cache(&self) -> &Arc<ArtifactCache> {
        &self.inner.cache
    }

    pub fn server_id(&self) -> Uuid {
        self.inner.server_id
    }

    /// Bind the listen socket, spawn the accept loop and the periodic
    /// maintenance tick. Returns the bound address.
    pub async fn start(&self) -> Result<SocketAddr> {
        let transport = &self.inner.config.transport;
        let server_config = ServerConfig {
            bind_addr: transport.bind_addr.clone(),
            port: transport.port,
            tls: match (&transport.tls_cert, &transport.tls_key) {
                (Some(cert), Some(key)) => Some(TlsConfig {
                    cert_path: cert.clone(),
                    key_path: key.clone(),
                }),
                _ => None,
            },
            max_connections: transport.max_connections,
            max_frame_bytes: transport.max_frame_bytes,
            send_queue_depth: transport.send_queue_depth,
        };

        let handler = Arc::new(CoordinatorHandler {
            inner: Arc::clone(&self.inner),
        });
        let server = WsServer::bind(server_config, handler).await?;
        let addr = server.local_addr()?;
        *self.inner.server.lock().unwrap() = Some(server.handle());

        tokio::spawn(server.run());

        let tick_inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            loop {
                interval.tick().await;
                if tick_inner.stopping.load(Ordering::Acquire) {
                    break;
                }
                tick_inner.tick();
            }
        });

        info!("coordinator {} listening on {}", self.inner.server_id, addr);
        Ok(addr)
    }

    /// Start and serve until `shutdown` is called.
    pub async fn run(&self) -> Result<()> {
        self.start().await?;
        self.inner.shutdown.notified().await;
        Ok(())
    }

    /// Broadcast SHUTDOWN, close connections, stop the service tasks.
    pub fn shutdown(&self) {
        if self.inner.stopping.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("coordinator shutting down");
        if let Some(handle) = self.inner.server.lock().unwrap().as_ref() {
            let shutdown = Message::with_payload(
                MessageType::Shutdown,
                &ShutdownPayload {
                    grace_period_secs: Some(5),
                },
            )
            .expect("shutdown payload serializes");
            handle.broadcast(&shutdown);
            handle.close_all();
        }
        self.inner.shutdown.notify_waiters();
    }

    /// Decompose the project under `project_path` into jobs and enqueue
    /// them. Compile jobs already satisfied by the artifact cache are
    /// materialized directly instead of being queued.
    pub fn submit_build(&self, project_path: &Path, options: BuildOptions) -> Result<BuildSession> {
        let sources = collect_sources(project_path)?;
        let has_cmake = project_path.join("CMakeLists.txt").exists();
        let strategy = options.strategy.unwrap_or_else(|| {
            suggest_strategy(sources.len(), has_cmake, usize::from(has_cmake))
        });

        let project_name = project_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "project".to_string());
        let session = self.inner.scheduler.create_build(&project_name, strategy);
        info!(
            "build '{}': {} sources, strategy {}",
            project_name,
            sources.len(),
            strategy
        );

        match strategy {
            DistributionStrategy::WholeProject
            | DistributionStrategy::Targets => {
                let mut spec = cyxmake_protocol::JobSpec::compile(project_path, &options.compiler);
                spec.kind = if has_cmake {
                    cyxmake_protocol::JobKind::CmakeBuild
                } else {
                    cyxmake_protocol::JobKind::FullBuild
                };
                spec.source_file = None;
                spec.priority = options.priority;
                spec.working_dir = Some(project_path.to_path_buf());
                spec.build_command = Some(if has_cmake {
                    "cmake -S . -B build && cmake --build build".to_string()
                } else {
                    "make".to_string()
                });
                spec.required_capabilities = spec.kind.base_capabilities();
                self.inner.scheduler.submit_job(session.build_id, spec)?;
            }
            DistributionStrategy::CompileUnits | DistributionStrategy::Hybrid => {
                let mut specs =
                    decompose_compile(&sources, &options.compiler, &options.compiler_flags);
                for spec in &mut specs {
                    spec.priority = options.priority;
                    spec.working_dir = Some(project_path.to_path_buf());
                }
                for spec in specs {
                    if self.satisfy_from_cache(&spec, &options) {
                        continue;
                    }
                    self.inner.scheduler.submit_job(session.build_id, spec)?;
                }
            }
        }

        self.inner.scheduler.start_build(session.build_id)?;
        self.inner.scheduler.process_queue();
        Ok(self
            .inner
            .scheduler
            .get_build(session.build_id)
            .expect("session just created"))
    }

    /// Try to materialize the compile output from the cache. Returns true
    /// when the job does not need to run.
    fn satisfy_from_cache(&self, spec: &cyxmake_protocol::JobSpec, options: &BuildOptions) -> bool {
        let Some(source) = &spec.source_file else {
            return false;
        };
        let Some(output) = &spec.output_file else {
            return false;
        };
        let Ok(contents) = std::fs::read(source) else {
            return false;
        };
        let key = cyxmake_cache::generate_key(&cyxmake_cache::KeyInputs {
            source_contents: &contents,
            compiler: spec.compiler.as_deref().unwrap_or(""),
            compiler_args: &spec.compiler_args,
            include_paths: &spec.include_paths,
            target_triple: &options.target_triple,
        });
        if self.inner.cache.lookup(&key) != CacheLookup::HitLocal {
            return false;
        }
        match self.inner.cache.retrieve(&key, output) {
            Ok(_) => {
                debug!("cache satisfied {} -> {}", source.display(), output.display());
                true
            }
            Err(e) => {
                warn!("cache hit for {} unusable: {}", source.display(), e);
                false
            }
        }
    }

    /// Block until the build reaches a terminal state or the timeout
    /// passes. The only blocking call in the API; always bounded.
    pub fn wait_build(&self, build_id: Uuid, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut finished = self.inner.finished_builds.lock().unwrap();
        loop {
            if finished.contains(&build_id) {
                return true;
            }
            // Terminal before we started waiting (or cancelled).
            if let Some(session) = self.inner.scheduler.get_build(build_id) {
                if session.state.is_terminal() {
                    return true;
                }
            } else {
                return false;
            }

            let remaining = match deadline.checked_duration_since(Instant::now()) {
                Some(rem) if !rem.is_zero() => rem,
                _ => return false,
            };
            let (guard, result) = self
                .inner
                .build_signal
                .wait_timeout(finished, remaining)
                .unwrap();
            finished = guard;
            if result.timed_out() {
                // One last check to close the race with the notifier.
                return finished.contains(&build_id)
                    || self
                        .inner
                        .scheduler
                        .get_build(build_id)
                        .map(|s| s.state.is_terminal())
                        .unwrap_or(false);
            }
        }
    }
}

impl Inner {
    /// Periodic maintenance: heartbeat sweep, job timeouts, queue drain.
    fn tick(&self) {
        for event in self.registry.sweep() {
            if let RegistryEvent::Unregistered { worker_id, name, reason } = event {
                warn!("worker '{}' unregistered: {}", name, reason);
                self.auth.revoke_worker(worker_id);
                let recovered = self.scheduler.handle_worker_disconnect(worker_id);
                if recovered > 0 {
                    info!("requeued {} jobs from '{}'", recovered, name);
                }
            }
        }
        self.scheduler.check_timeouts();
        self.scheduler.process_queue();
    }

    fn connection_for_worker(&self, worker_id: Uuid) -> Option<Connection> {
        let conn_id = self.registry.get(worker_id)?.connection?;
        self.server.lock().unwrap().as_ref()?.connection(conn_id)
    }

    fn handle_scheduler_event(&self, event: &SchedulerEvent) {
        match event {
            SchedulerEvent::JobAssigned {
                job_id,
                worker_id,
                spec,
                ..
            } => {
                let Some(conn) = self.connection_for_worker(*worker_id) else {
                    warn!("assigned worker {} has no connection", worker_id);
                    let _ = self
                        .scheduler
                        .report_job_rejected(*job_id, "worker connection lost");
                    return;
                };
                let msg = Message::with_payload(MessageType::JobRequest, spec)
                    .expect("job spec serializes")
                    .with_sender(self.server_id.to_string());
                match conn.send(msg) {
                    SendOutcome::Queued => {
                        debug!("job {} dispatched to {}", job_id, worker_id);
                    }
                    outcome => {
                        warn!("job {} dispatch failed: {:?}", job_id, outcome);
                        let _ = self
                            .scheduler
                            .report_job_rejected(*job_id, "transport backpressure");
                    }
                }
            }
            SchedulerEvent::CancelRequested {
                job_id,
                worker_id,
                reason,
            } => {
                if let Some(conn) = self.connection_for_worker(*worker_id) {
                    let payload = JobCancelPayload {
                        job_id: *job_id,
                        reason: Some(reason.clone()),
                    };
                    let msg = Message::with_payload(MessageType::JobCancel, &payload)
                        .expect("cancel payload serializes")
                        .with_sender(self.server_id.to_string());
                    conn.send(msg);
                }
                // Unresponsive workers lose the job via the timeout path.
            }
            SchedulerEvent::BuildCompleted { build_id, success } => {
                info!("build {} completed (success={})", build_id, success);
                self.finished_builds.lock().unwrap().insert(*build_id);
                self.build_signal.notify_all();
            }
            SchedulerEvent::JobCompleted { job_id, .. } => {
                debug!("job {} completed", job_id);
            }
            SchedulerEvent::JobFailed { job_id, error, .. } => {
                warn!("job {} failed: {}", job_id, error);
            }
        }
    }

    // ========================================================================
    // Handshake
    // ========================================================================

    fn handle_hello(&self, conn: &Connection, msg: &Message) {
        let hello: HelloPayload = match msg.parse_payload() {
            Ok(hello) => hello,
            Err(e) => {
                self.reply_error(conn, msg, "ProtocolParse", &e.to_string());
                return;
            }
        };

        match self.auth.method() {
            AuthMethod::Token => {
                if self.auth.verify_preshared(hello.auth_token.as_deref()) {
                    if let Some(worker_id) = self.register_worker(conn, msg.id, &hello) {
                        self.send_welcome(conn, msg.id, worker_id);
                    }
                } else {
                    self.reject_auth(conn, msg, "invalid token");
                }
            }
            AuthMethod::Challenge => {
                let nonce = self.auth.new_challenge();
                let challenge = AuthChallengePayload {
                    nonce: nonce.clone(),
                    method: AuthMethod::Challenge,
                };
                self.pending_auth.lock().unwrap().insert(
                    conn.id(),
                    PendingAuth {
                        hello,
                        hello_id: msg.id,
                        nonce,
                    },
                );
                self.reply(conn, msg, MessageType::AuthChallenge, &challenge);
            }
        }
    }

    fn handle_auth_response(&self, conn: &Connection, msg: &Message) {
        let response: AuthResponsePayload = match msg.parse_payload() {
            Ok(response) => response,
            Err(e) => {
                self.reply_error(conn, msg, "ProtocolParse", &e.to_string());
                return;
            }
        };

        let Some(pending) = self.pending_auth.lock().unwrap().remove(&conn.id()) else {
            self.reject_auth(conn, msg, "no challenge outstanding");
            return;
        };

        let valid = self
            .auth
            .verify_challenge(&pending.nonce, response.hmac.as_deref())
            || response
                .token
                .as_deref()
                .map(|t| self.auth.validate_issued(t))
                .unwrap_or(false);

        if !valid {
            self.reject_auth(conn, msg, "challenge verification failed");
            return;
        }

        let Some(worker_id) = self.register_worker(conn, pending.hello_id, &pending.hello) else {
            return;
        };
        let (token, expires_at_ms) = self.auth.issue_token(worker_id);
        self.reply(
            conn,
            msg,
            MessageType::AuthSuccess,
            &AuthSuccessPayload {
                worker_token: token,
                expires_at_ms,
            },
        );
        self.send_welcome(conn, pending.hello_id, worker_id);
    }

    /// Insert the worker and bring it ONLINE. Answers with ERROR and
    /// closes on a registration conflict.
    fn register_worker(
        &self,
        conn: &Connection,
        hello_id: Uuid,
        hello: &HelloPayload,
    ) -> Option<Uuid> {
        let worker_id = match self.registry.register(hello, conn.id()) {
            Ok(id) => id,
            Err(e) => {
                warn!("registration rejected: {}", e);
                let mut reply = Message::new(MessageType::Error);
                reply.correlation_id = Some(hello_id);
                reply.payload = serde_json::to_value(ErrorPayload::new(
                    "AuthRejected",
                    e.to_string(),
                ))
                .unwrap_or_default();
                conn.send(reply);
                conn.close();
                return None;
            }
        };

        if let Err(e) = self.registry.mark_online(worker_id) {
            error!("worker {} vanished during registration: {}", worker_id, e);
            return None;
        }
        Some(worker_id)
    }

    /// WELCOME correlates with the worker's original HELLO.
    fn send_welcome(&self, conn: &Connection, hello_id: Uuid, worker_id: Uuid) {
        let welcome = WelcomePayload {
            worker_id,
            server_id: self.server_id,
            heartbeat_interval_secs: self.config.transport.heartbeat_interval_secs,
        };
        let mut reply = Message::new(MessageType::Welcome);
        reply.correlation_id = Some(hello_id);
        reply.payload = serde_json::to_value(&welcome).expect("welcome serializes");
        reply.sender = Some(self.server_id.to_string());
        conn.send(reply);

        // New capacity may unblock the queue right away.
        self.scheduler.process_queue();
    }

    fn reject_auth(&self, conn: &Connection, msg: &Message, reason: &str) {
        warn!("auth rejected for {}: {}", conn.peer(), reason);
        self.reply(
            conn,
            msg,
            MessageType::AuthFailed,
            &AuthFailedPayload {
                reason: reason.to_string(),
            },
        );
        conn.close();
    }

    // ========================================================================
    // Steady state
    // ========================================================================

    fn handle_worker_message(&self, conn: &Connection, msg: Message) {
        // Any frame from a registered worker proves liveness.
        let worker_id = self.registry.find_by_connection(conn.id());
        if let Some(id) = worker_id {
            self.registry.record_message(id);
        }

        match msg.kind {
            MessageType::Hello => self.handle_hello(conn, &msg),
            MessageType::AuthResponse => self.handle_auth_response(conn, &msg),

            MessageType::Heartbeat => {
                if let Some(id) = worker_id {
                    if let Ok(payload) = msg.parse_payload::<HeartbeatPayload>() {
                        let latency = now_ms().saturating_sub(msg.timestamp) as f64;
                        self.registry.record_heartbeat(id, &payload, latency);
                    }
                    self.reply(conn, &msg, MessageType::HeartbeatAck, &serde_json::json!({}));
                }
            }

            MessageType::StatusUpdate => {
                if let (Some(id), Ok(payload)) =
                    (worker_id, msg.parse_payload::<StatusUpdatePayload>())
                {
                    self.registry.record_status(id, &payload);
                }
            }

            MessageType::JobAccept => {
                if let Ok(payload) = msg.parse_payload::<JobAcceptPayload>() {
                    let _ = self.scheduler.report_job_accepted(payload.job_id);
                }
            }

            MessageType::JobReject => {
                if let Ok(payload) = msg.parse_payload::<JobRejectPayload>() {
                    let _ = self
                        .scheduler
                        .report_job_rejected(payload.job_id, &payload.reason);
                }
            }

            MessageType::JobProgress => {
                if let Ok(payload) = msg.parse_payload::<JobProgressPayload>() {
                    self.scheduler
                        .report_job_progress(payload.job_id, payload.percent);
                }
            }

            MessageType::JobComplete => {
                if let Ok(result) = msg.parse_payload::<JobResult>() {
                    let _ = self.scheduler.report_job_result(result.job_id, result);
                    self.scheduler.process_queue();
                }
            }

            MessageType::JobFailed => {
                if let Ok(payload) = msg.parse_payload::<JobFailedPayload>() {
                    let error = if payload.stderr.is_empty() {
                        payload.error.clone()
                    } else {
                        format!("{}: {}", payload.error, payload.stderr)
                    };
                    let _ = self.scheduler.report_job_failure(payload.job_id, &error);
                    self.scheduler.process_queue();
                }
            }

            MessageType::JobCancelled => {
                if let Ok(payload) = msg.parse_payload::<JobCancelledPayload>() {
                    self.scheduler.report_job_cancelled(payload.job_id);
                }
            }

            MessageType::ArtifactPush => self.handle_artifact_push(conn, &msg),
            MessageType::ArtifactRequest => self.handle_artifact_request(conn, &msg),

            MessageType::Goodbye => {
                if let Some(id) = worker_id {
                    self.registry.mark_draining(id);
                }
            }

            MessageType::Error => {
                if let Ok(payload) = msg.parse_payload::<ErrorPayload>() {
                    warn!("worker error [{}]: {}", payload.kind, payload.message);
                }
            }

            MessageType::Other(ref name) => {
                debug!("unknown message type '{}' from {}", name, conn.peer());
                let reply = msg.error_response(&ErrorPayload::new(
                    "ProtocolParse",
                    format!("unknown message type '{}'", name),
                ));
                conn.send(reply);
            }

            ref other => {
                debug!("unhandled message type {} from {}", other, conn.peer());
            }
        }
    }

    fn handle_artifact_push(&self, conn: &Connection, msg: &Message) {
        let Ok(payload) = msg.parse_payload::<ArtifactPushPayload>() else {
            self.reply_error(conn, msg, "ProtocolParse", "bad ARTIFACT_PUSH payload");
            return;
        };
        let Some(bytes) = msg.binary.as_deref() else {
            self.reply_error(conn, msg, "ProtocolParse", "ARTIFACT_PUSH without binary body");
            return;
        };

        let artifact_type = match payload.artifact_type.as_str() {
            "object" => ArtifactType::Object,
            "static_lib" => ArtifactType::StaticLib,
            "shared_lib" => ArtifactType::SharedLib,
            "executable" => ArtifactType::Executable,
            _ => ArtifactType::Other,
        };
        let producer = self
            .registry
            .find_by_connection(conn.id())
            .and_then(|id| self.registry.get(id))
            .map(|w| w.hostname);

        // A write failure must not fail the producing job: ack stored=false.
        let stored = match self.cache.store_from(
            &payload.cache_key,
            bytes,
            artifact_type,
            StoreOrigin {
                source_hash: String::new(),
                compiler_hash: String::new(),
                producer_host: producer,
                build_id: payload.build_id,
            },
        ) {
            Ok(entry) => {
                debug!(
                    "stored artifact {} ({} bytes)",
                    payload.cache_key, entry.size_bytes
                );
                true
            }
            Err(e) => {
                error!("artifact store failed for {}: {}", payload.cache_key, e);
                false
            }
        };

        self.reply(
            conn,
            msg,
            MessageType::ArtifactAck,
            &ArtifactAckPayload {
                cache_key: payload.cache_key,
                stored,
            },
        );
    }

    fn handle_artifact_request(&self, conn: &Connection, msg: &Message) {
        let Ok(payload) = msg.parse_payload::<ArtifactRequestPayload>() else {
            self.reply_error(conn, msg, "ProtocolParse", "bad ARTIFACT_REQUEST payload");
            return;
        };

        match self.cache.load(&payload.cache_key) {
            Ok(bytes) => {
                let entry = self.cache.entry(&payload.cache_key);
                let response = ArtifactResponsePayload {
                    cache_key: payload.cache_key,
                    found: true,
                    size: bytes.len() as u64,
                    content_hash: entry.map(|e| e.content_hash),
                };
                match msg.response_with_payload(MessageType::ArtifactResponse, &response) {
                    Ok(reply) => {
                        conn.send(reply.with_binary(bytes));
                    }
                    Err(e) => error!("artifact response encode failed: {}", e),
                }
            }
            Err(e) => {
                debug!("artifact request miss for {}: {}", payload.cache_key, e);
                let response = ArtifactResponsePayload {
                    cache_key: payload.cache_key,
                    found: false,
                    size: 0,
                    content_hash: None,
                };
                self.reply(conn, msg, MessageType::ArtifactResponse, &response);
            }
        }
    }

    fn reply<T: serde::Serialize>(
        &self,
        conn: &Connection,
        request: &Message,
        kind: MessageType,
        payload: &T,
    ) {
        match request.response_with_payload(kind, payload) {
            Ok(reply) => {
                let reply = reply.with_sender(self.server_id.to_string());
                if !conn.send(reply).is_queued() {
                    debug!("reply to {} dropped (queue full or closed)", conn.peer());
                }
            }
            Err(e) => error!("reply encode failed: {}", e),
        }
    }

    fn reply_error(&self, conn: &Connection, request: &Message, kind: &str, message: &str) {
        let reply = request.error_response(&ErrorPayload::new(kind, message));
        conn.send(reply.with_sender(self.server_id.to_string()));
    }
}

struct CoordinatorHandler {
    inner: Arc<Inner>,
}

impl ConnectionHandler for CoordinatorHandler {
    fn on_connect(&self, conn: &Connection) {
        debug!("connection {} from {}", conn.id(), conn.peer());
    }

    fn on_message(&self, conn: &Connection, msg: Message) {
        self.inner.handle_worker_message(conn, msg);
    }

    fn on_disconnect(&self, conn: &Connection, reason: &str) {
        self.inner.pending_auth.lock().unwrap().remove(&conn.id());
        if let Some(RegistryEvent::Unregistered { worker_id, name, .. }) =
            self.inner.registry.handle_disconnect(conn.id())
        {
            warn!("worker '{}' lost ({}), recovering jobs", name, reason);
            self.inner.auth.revoke_worker(worker_id);
            let recovered = self.inner.scheduler.handle_worker_disconnect(worker_id);
            if recovered > 0 {
                info!("requeued {} jobs from '{}'", recovered, name);
                self.inner.scheduler.process_queue();
            }
        }
    }

    fn on_error(&self, conn: &Connection, message: &str) {
        warn!("transport error on {}: {}", conn.peer(), message);
    }
}

/// Recursively collect compilable sources, deterministic order.
fn collect_sources(project_path: &Path) -> Result<Vec<PathBuf>> {
    let mut sources = Vec::new();
    for entry in walkdir::WalkDir::new(project_path)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        match path.extension().and_then(|e| e.to_str()) {
            Some("c") | Some("cc") | Some("cpp") | Some("cxx") => {
                sources.push(path.to_path_buf());
            }
            _ => {}
        }
    }
    sources.sort();
    Ok(sources)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_collect_sources_sorted_and_filtered() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("b.c"), "int b;").unwrap();
        std::fs::write(dir.path().join("a.cpp"), "int a;").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "nope").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/c.cc"), "int c;").unwrap();

        let sources = collect_sources(dir.path()).unwrap();
        let names: Vec<String> = sources
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.cpp", "b.c", "c.cc"]);
    }

    #[test]
    fn test_build_options_default_triple() {
        let options = BuildOptions::default();
        assert!(options.target_triple.contains('-'));
        assert_eq!(options.compiler, "cc");
    }
}
