//! Worker agent: connects to the coordinator, authenticates, heartbeats,
//! and executes assigned jobs.

use crate::executor::{self, ExecOutcome};
use crate::probe::{self, LoadProbe};
use cyxmake_protocol::auth::compute_hmac;
use cyxmake_protocol::{
    ArtifactPushPayload, AuthFailedPayload, AuthResponsePayload, ErrorPayload, GoodbyePayload,
    HeartbeatPayload, HelloPayload, JobAcceptPayload, JobCancelPayload, JobCancelledPayload,
    JobRejectPayload, JobSpec, Message, MessageType, WelcomePayload,
};
use cyxmake_transport::{ClientConfig, Connection, ConnectionHandler, WsClient};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub coordinator_url: String,
    pub name: String,
    /// Pre-shared token or HMAC key, depending on the coordinator's mode.
    pub secret: String,
    pub max_jobs: u32,
    /// Root for jobs that do not carry their own working directory.
    pub work_dir: PathBuf,
}

struct AgentInner {
    config: AgentConfig,
    hello: HelloPayload,
    /// Live connection, present between on_connect and on_disconnect.
    connection: Mutex<Option<Connection>>,
    worker_id: Mutex<Option<Uuid>>,
    /// job_id -> cancel signal for everything currently executing.
    active: Mutex<HashMap<Uuid, watch::Sender<bool>>>,
    heartbeat_interval_secs: AtomicU64,
    heartbeat_epoch: AtomicU64,
    draining: AtomicBool,
    load: Mutex<LoadProbe>,
}

impl AgentInner {
    fn active_count(&self) -> u32 {
        self.active.lock().unwrap().len() as u32
    }

    fn send(&self, msg: Message) {
        let conn = self.connection.lock().unwrap().clone();
        match conn {
            Some(conn) => {
                if !conn.send(msg).is_queued() {
                    warn!("send dropped: outbound queue unavailable");
                }
            }
            None => debug!("send skipped: not connected"),
        }
    }

    fn send_hello(&self) {
        let msg = Message::with_payload(MessageType::Hello, &self.hello)
            .expect("hello serializes")
            .with_sender(self.config.name.clone());
        self.send(msg);
    }

    fn handle_welcome(this: &Arc<Self>, msg: &Message) {
        let Ok(welcome) = msg.parse_payload::<WelcomePayload>() else {
            warn!("undecodable WELCOME");
            return;
        };
        info!(
            "registered as {} with coordinator {}",
            welcome.worker_id, welcome.server_id
        );
        *this.worker_id.lock().unwrap() = Some(welcome.worker_id);
        this.heartbeat_interval_secs
            .store(welcome.heartbeat_interval_secs.max(1), Ordering::Release);

        // Restart the heartbeat loop for this connection epoch; a stale
        // loop from a previous connection sees the bumped epoch and exits.
        let epoch = this.heartbeat_epoch.fetch_add(1, Ordering::AcqRel) + 1;
        let inner = Arc::clone(this);
        tokio::spawn(async move {
            inner.heartbeat_loop(epoch).await;
        });
    }

    async fn heartbeat_loop(self: Arc<Self>, epoch: u64) {
        loop {
            let interval = self.heartbeat_interval_secs.load(Ordering::Acquire);
            tokio::time::sleep(Duration::from_secs(interval)).await;
            if self.heartbeat_epoch.load(Ordering::Acquire) != epoch {
                return;
            }
            if self.connection.lock().unwrap().is_none() {
                return;
            }
            let (cpu_usage, memory_usage) = self.load.lock().unwrap().sample();
            let payload = HeartbeatPayload {
                cpu_usage,
                memory_usage,
                active_jobs: self.active_count(),
            };
            match Message::with_payload(MessageType::Heartbeat, &payload) {
                Ok(msg) => self.send(msg.with_sender(self.config.name.clone())),
                Err(e) => error!("heartbeat encode failed: {}", e),
            }
        }
    }

    fn handle_job_request(this: &Arc<Self>, msg: &Message) {
        let spec: JobSpec = match msg.parse_payload() {
            Ok(spec) => spec,
            Err(e) => {
                warn!("undecodable JOB_REQUEST: {}", e);
                this.send(msg.error_response(&ErrorPayload::new("ProtocolParse", e.to_string())));
                return;
            }
        };
        let job_id = spec.job_id;

        if this.draining.load(Ordering::Acquire) {
            this.send_reject(msg, job_id, "worker is draining");
            return;
        }
        {
            let mut active = this.active.lock().unwrap();
            if active.len() as u32 >= this.config.max_jobs {
                drop(active);
                this.send_reject(msg, job_id, "worker at capacity");
                return;
            }
            let (cancel_tx, _) = watch::channel(false);
            active.insert(job_id, cancel_tx);
        }

        info!("accepted job {} ({})", job_id, spec.kind);
        let accept = msg
            .response_with_payload(MessageType::JobAccept, &JobAcceptPayload { job_id })
            .expect("accept serializes");
        this.send(accept);

        let inner = Arc::clone(this);
        tokio::spawn(async move {
            inner.execute(spec).await;
        });
    }

    fn send_reject(&self, msg: &Message, job_id: Uuid, reason: &str) {
        info!("rejecting job {}: {}", job_id, reason);
        let reject = msg
            .response_with_payload(
                MessageType::JobReject,
                &JobRejectPayload {
                    job_id,
                    reason: reason.to_string(),
                },
            )
            .expect("reject serializes");
        self.send(reject);
    }

    async fn execute(self: Arc<Self>, spec: JobSpec) {
        let job_id = spec.job_id;
        let cancel_rx = {
            let active = self.active.lock().unwrap();
            match active.get(&job_id) {
                Some(tx) => tx.subscribe(),
                None => return,
            }
        };

        let outcome = executor::run_job(&spec, &self.config.work_dir, cancel_rx).await;
        self.active.lock().unwrap().remove(&job_id);

        match outcome {
            ExecOutcome::Cancelled => {
                let msg = Message::with_payload(
                    MessageType::JobCancelled,
                    &JobCancelledPayload { job_id },
                )
                .expect("cancelled serializes");
                self.send(msg);
            }
            ExecOutcome::Finished(result) if result.success => {
                info!(
                    "job {} succeeded in {:.2}s",
                    job_id, result.duration_secs
                );
                self.push_artifact(&spec, &result);
                let msg = Message::with_payload(MessageType::JobComplete, &result)
                    .expect("result serializes");
                self.send(msg);
            }
            ExecOutcome::Finished(result) => {
                warn!("job {} failed: {}", job_id, result.stderr);
                let payload = cyxmake_protocol::JobFailedPayload {
                    job_id,
                    error: if result.stderr.is_empty() {
                        format!("exited with code {}", result.exit_code)
                    } else {
                        result.stderr.clone()
                    },
                    stderr: result.stderr,
                };
                let msg = Message::with_payload(MessageType::JobFailed, &payload)
                    .expect("failure serializes");
                self.send(msg);
            }
        }
    }

    /// Offer the produced object to the coordinator's cache.
    fn push_artifact(&self, spec: &JobSpec, result: &cyxmake_protocol::JobResult) {
        let (Some(source), Some(output), Some(content_hash)) = (
            spec.source_file.as_ref(),
            result.output_file.as_ref(),
            result.output_hash.as_deref(),
        ) else {
            return;
        };
        let Ok(source_contents) = std::fs::read(resolve_in_workdir(spec, &self.config.work_dir, source))
        else {
            return;
        };
        let Ok(bytes) = std::fs::read(output) else {
            return;
        };

        let cache_key = cyxmake_cache::generate_key(&cyxmake_cache::KeyInputs {
            source_contents: &source_contents,
            compiler: spec.compiler.as_deref().unwrap_or(""),
            compiler_args: &spec.compiler_args,
            include_paths: &spec.include_paths,
            target_triple: &format!("{}-{}", std::env::consts::ARCH, std::env::consts::OS),
        });
        let payload = ArtifactPushPayload {
            cache_key,
            content_hash: content_hash.to_string(),
            artifact_type: "object".to_string(),
            build_id: None,
        };
        match Message::with_payload(MessageType::ArtifactPush, &payload) {
            Ok(msg) => self.send(msg.with_binary(bytes)),
            Err(e) => error!("artifact push encode failed: {}", e),
        }
    }

    fn handle_cancel(&self, msg: &Message) {
        let Ok(payload) = msg.parse_payload::<JobCancelPayload>() else {
            return;
        };
        let active = self.active.lock().unwrap();
        match active.get(&payload.job_id) {
            Some(cancel) => {
                info!(
                    "cancelling job {} ({})",
                    payload.job_id,
                    payload.reason.as_deref().unwrap_or("no reason")
                );
                let _ = cancel.send(true);
            }
            None => {
                debug!("cancel for unknown job {}", payload.job_id);
            }
        }
    }

    fn handle_shutdown(&self) {
        info!("coordinator is shutting down, draining");
        self.draining.store(true, Ordering::Release);
        let goodbye = Message::with_payload(
            MessageType::Goodbye,
            &GoodbyePayload {
                reason: Some("coordinator shutdown".to_string()),
            },
        )
        .expect("goodbye serializes");
        self.send(goodbye);
    }
}

fn resolve_in_workdir(spec: &JobSpec, default_work_dir: &std::path::Path, path: &std::path::Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    spec.working_dir
        .clone()
        .unwrap_or_else(|| default_work_dir.to_path_buf())
        .join(path)
}

pub struct WorkerAgent {
    inner: Arc<AgentInner>,
}

impl WorkerAgent {
    pub fn new(config: AgentConfig) -> Self {
        let system_info = probe::probe_system();
        let tools = probe::discover_tools();
        let capabilities = probe::derive_capabilities(&tools);
        info!(
            "probed host: {} {} / {} cores, capabilities {:#x}",
            system_info.os,
            system_info.arch,
            system_info.cpu_cores,
            capabilities.bits()
        );

        let hello = HelloPayload {
            name: config.name.clone(),
            hostname: sysinfo::System::host_name().unwrap_or_else(|| "unknown".to_string()),
            port: 0,
            system_info,
            capabilities,
            tools,
            max_jobs: config.max_jobs.max(1),
            auth_token: (!config.secret.is_empty()).then(|| config.secret.clone()),
        };

        Self {
            inner: Arc::new(AgentInner {
                config,
                hello,
                connection: Mutex::new(None),
                worker_id: Mutex::new(None),
                active: Mutex::new(HashMap::new()),
                heartbeat_interval_secs: AtomicU64::new(
                    cyxmake_protocol::defaults::DEFAULT_HEARTBEAT_INTERVAL_SECS,
                ),
                heartbeat_epoch: AtomicU64::new(0),
                draining: AtomicBool::new(false),
                load: Mutex::new(LoadProbe::new()),
            }),
        }
    }

    /// Connect and serve until the client gives up or is stopped.
    pub async fn run(&self) -> anyhow::Result<()> {
        let client_config = ClientConfig {
            url: self.inner.config.coordinator_url.clone(),
            ..ClientConfig::default()
        };
        let handler = Arc::new(AgentHandler {
            inner: Arc::clone(&self.inner),
        });
        let client = WsClient::new(client_config, handler);
        client.run().await?;
        Ok(())
    }
}

struct AgentHandler {
    inner: Arc<AgentInner>,
}

impl ConnectionHandler for AgentHandler {
    fn on_connect(&self, conn: &Connection) {
        info!("connected to coordinator via {}", conn.peer());
        *self.inner.connection.lock().unwrap() = Some(conn.clone());
        self.inner.send_hello();
    }

    fn on_message(&self, _conn: &Connection, msg: Message) {
        match msg.kind {
            MessageType::AuthChallenge => {
                let Ok(challenge) =
                    msg.parse_payload::<cyxmake_protocol::AuthChallengePayload>()
                else {
                    warn!("undecodable AUTH_CHALLENGE");
                    return;
                };
                let response = AuthResponsePayload {
                    token: None,
                    hmac: Some(compute_hmac(&self.inner.config.secret, &challenge.nonce)),
                };
                let reply = msg
                    .response_with_payload(MessageType::AuthResponse, &response)
                    .expect("auth response serializes");
                self.inner.send(reply);
            }
            MessageType::AuthSuccess => {
                debug!("authentication succeeded");
            }
            MessageType::AuthFailed => {
                let reason = msg
                    .parse_payload::<AuthFailedPayload>()
                    .map(|p| p.reason)
                    .unwrap_or_else(|_| "unknown".to_string());
                error!("authentication failed: {}", reason);
            }
            MessageType::Welcome => AgentInner::handle_welcome(&self.inner, &msg),
            MessageType::JobRequest => AgentInner::handle_job_request(&self.inner, &msg),
            MessageType::JobCancel => self.inner.handle_cancel(&msg),
            MessageType::HeartbeatAck => {}
            MessageType::ArtifactAck => {
                debug!("artifact acknowledged");
            }
            MessageType::Shutdown => self.inner.handle_shutdown(),
            MessageType::Error => {
                if let Ok(payload) = msg.parse_payload::<ErrorPayload>() {
                    warn!("coordinator error [{}]: {}", payload.kind, payload.message);
                }
            }
            ref other => {
                debug!("unhandled message type {}", other);
            }
        }
    }

    fn on_disconnect(&self, _conn: &Connection, reason: &str) {
        warn!("disconnected from coordinator: {}", reason);
        *self.inner.connection.lock().unwrap() = None;
        *self.inner.worker_id.lock().unwrap() = None;
        // Invalidate the running heartbeat loop.
        self.inner.heartbeat_epoch.fetch_add(1, Ordering::AcqRel);
    }

    fn on_error(&self, _conn: &Connection, message: &str) {
        warn!("transport error: {}", message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_hello_reflects_config() {
        let agent = WorkerAgent::new(AgentConfig {
            coordinator_url: "ws://127.0.0.1:9876".to_string(),
            name: "builder-7".to_string(),
            secret: "tok".to_string(),
            max_jobs: 3,
            work_dir: std::env::temp_dir(),
        });
        let hello = &agent.inner.hello;
        assert_eq!(hello.name, "builder-7");
        assert_eq!(hello.max_jobs, 3);
        assert_eq!(hello.auth_token.as_deref(), Some("tok"));
        assert!(!hello.system_info.arch.is_empty());
    }

    #[test]
    fn test_resolve_in_workdir() {
        let spec = JobSpec::compile("src/a.c", "cc");
        let resolved = resolve_in_workdir(
            &spec,
            std::path::Path::new("/work"),
            std::path::Path::new("src/a.c"),
        );
        assert_eq!(resolved, PathBuf::from("/work/src/a.c"));

        let absolute = resolve_in_workdir(
            &spec,
            std::path::Path::new("/work"),
            std::path::Path::new("/abs/a.c"),
        );
        assert_eq!(absolute, PathBuf::from("/abs/a.c"));
    }
}
