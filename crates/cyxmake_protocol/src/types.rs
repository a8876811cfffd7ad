//! Protocol payload types shared by coordinator and workers.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

// ============================================================================
// Capabilities
// ============================================================================

/// Compact bitset of worker-provided features.
///
/// Stored and transmitted as a plain u64 so new bits can be added without a
/// wire change; unknown bits are carried through untouched.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default, PartialOrd, Ord,
)]
#[serde(transparent)]
pub struct Capabilities(u64);

impl Capabilities {
    pub const NONE: Capabilities = Capabilities(0);
    pub const COMPILE_C: Capabilities = Capabilities(1 << 0);
    pub const COMPILE_CPP: Capabilities = Capabilities(1 << 1);
    pub const COMPILE_RUST: Capabilities = Capabilities(1 << 2);
    pub const LINK: Capabilities = Capabilities(1 << 3);
    pub const CMAKE: Capabilities = Capabilities(1 << 4);
    pub const NINJA: Capabilities = Capabilities(1 << 5);
    pub const MAKE: Capabilities = Capabilities(1 << 6);
    pub const CROSS_ARM64: Capabilities = Capabilities(1 << 7);
    pub const CROSS_X86_64: Capabilities = Capabilities(1 << 8);
    pub const CROSS_RISCV: Capabilities = Capabilities(1 << 9);
    pub const GPU_CUDA: Capabilities = Capabilities(1 << 10);
    pub const GPU_OPENCL: Capabilities = Capabilities(1 << 11);
    pub const HIGH_MEMORY: Capabilities = Capabilities(1 << 12);
    pub const FAST_DISK: Capabilities = Capabilities(1 << 13);

    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, other: Capabilities) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn union(self, other: Capabilities) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn intersection(self, other: Capabilities) -> Self {
        Self(self.0 & other.0)
    }

    /// Number of set bits shared with `other`; used for preference scoring.
    pub const fn overlap(self, other: Capabilities) -> u32 {
        (self.0 & other.0).count_ones()
    }

    pub fn insert(&mut self, other: Capabilities) {
        self.0 |= other.0;
    }
}

impl std::ops::BitOr for Capabilities {
    type Output = Capabilities;

    fn bitor(self, rhs: Capabilities) -> Capabilities {
        self.union(rhs)
    }
}

// ============================================================================
// Worker identity & state
// ============================================================================

/// Worker lifecycle state.
///
/// Transitions are monotone (OFFLINE -> CONNECTING -> AUTHENTICATING ->
/// ONLINE -> DRAINING -> OFFLINE|ERROR) except the ONLINE <-> BUSY pair,
/// which flips with job load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerState {
    #[default]
    Offline,
    Connecting,
    Authenticating,
    Online,
    Busy,
    Draining,
    Error,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Offline => "OFFLINE",
            WorkerState::Connecting => "CONNECTING",
            WorkerState::Authenticating => "AUTHENTICATING",
            WorkerState::Online => "ONLINE",
            WorkerState::Busy => "BUSY",
            WorkerState::Draining => "DRAINING",
            WorkerState::Error => "ERROR",
        }
    }

    /// Whether the worker may receive new job assignments.
    pub fn accepts_jobs(&self) -> bool {
        matches!(self, WorkerState::Online | WorkerState::Busy)
    }

    pub fn is_connected(&self) -> bool {
        !matches!(self, WorkerState::Offline | WorkerState::Error)
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for WorkerState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "OFFLINE" => Ok(WorkerState::Offline),
            "CONNECTING" => Ok(WorkerState::Connecting),
            "AUTHENTICATING" => Ok(WorkerState::Authenticating),
            "ONLINE" => Ok(WorkerState::Online),
            "BUSY" => Ok(WorkerState::Busy),
            "DRAINING" => Ok(WorkerState::Draining),
            "ERROR" => Ok(WorkerState::Error),
            _ => Err(format!("Invalid worker state: '{}'", s)),
        }
    }
}

/// Static host description sent once in HELLO.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct SystemInfo {
    pub arch: String,
    pub os: String,
    pub os_version: String,
    pub cpu_cores: u32,
    pub cpu_threads: u32,
    pub memory_mb: u64,
    pub disk_free_mb: u64,
}

/// A discovered toolchain binary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolInfo {
    pub path: PathBuf,
    pub version: String,
}

// ============================================================================
// Jobs
// ============================================================================

/// What kind of work a job carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    #[default]
    Compile,
    Link,
    CmakeConfig,
    CmakeBuild,
    FullBuild,
    Custom,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Compile => "compile",
            JobKind::Link => "link",
            JobKind::CmakeConfig => "cmake_config",
            JobKind::CmakeBuild => "cmake_build",
            JobKind::FullBuild => "full_build",
            JobKind::Custom => "custom",
        }
    }

    /// Baseline capabilities a worker must advertise to run this kind.
    pub fn base_capabilities(&self) -> Capabilities {
        match self {
            JobKind::Compile => Capabilities::COMPILE_C,
            JobKind::Link => Capabilities::LINK,
            JobKind::CmakeConfig | JobKind::CmakeBuild => Capabilities::CMAKE,
            JobKind::FullBuild | JobKind::Custom => Capabilities::NONE,
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "compile" => Ok(JobKind::Compile),
            "link" => Ok(JobKind::Link),
            "cmake_config" => Ok(JobKind::CmakeConfig),
            "cmake_build" => Ok(JobKind::CmakeBuild),
            "full_build" => Ok(JobKind::FullBuild),
            "custom" => Ok(JobKind::Custom),
            _ => Err(format!("Invalid job kind: '{}'", s)),
        }
    }
}

/// A unit of distributable work, as carried by JOB_REQUEST.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub job_id: Uuid,
    pub kind: JobKind,
    pub priority: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compiler: Option<String>,
    #[serde(default)]
    pub compiler_args: Vec<String>,
    #[serde(default)]
    pub include_paths: Vec<PathBuf>,
    /// Content hash of the project archive the worker must have unpacked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_archive_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub env_vars: Vec<(String, String)>,
    pub timeout_secs: u64,
    #[serde(default)]
    pub required_capabilities: Capabilities,
}

impl JobSpec {
    /// Minimal compile-job constructor; everything else through struct update.
    pub fn compile(source_file: impl Into<PathBuf>, compiler: impl Into<String>) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            kind: JobKind::Compile,
            priority: 100,
            source_file: Some(source_file.into()),
            output_file: None,
            compiler: Some(compiler.into()),
            compiler_args: Vec::new(),
            include_paths: Vec::new(),
            project_archive_hash: None,
            build_command: None,
            working_dir: None,
            env_vars: Vec::new(),
            timeout_secs: crate::defaults::DEFAULT_JOB_TIMEOUT_SECS,
            required_capabilities: Capabilities::COMPILE_C,
        }
    }
}

/// Scheduler-side job lifecycle. This is the CANONICAL definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    #[default]
    Pending,
    Assigned,
    Running,
    Completed,
    Failed,
    Cancelled,
    Timeout,
    Retry,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "PENDING",
            JobState::Assigned => "ASSIGNED",
            JobState::Running => "RUNNING",
            JobState::Completed => "COMPLETED",
            JobState::Failed => "FAILED",
            JobState::Cancelled => "CANCELLED",
            JobState::Timeout => "TIMEOUT",
            JobState::Retry => "RETRY",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled | JobState::Timeout
        )
    }

    /// States in which the job occupies a worker slot.
    pub fn holds_worker(&self) -> bool {
        matches!(self, JobState::Assigned | JobState::Running)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Builds
// ============================================================================

/// How a build is split into jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DistributionStrategy {
    #[default]
    CompileUnits,
    Targets,
    WholeProject,
    Hybrid,
}

impl DistributionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            DistributionStrategy::CompileUnits => "COMPILE_UNITS",
            DistributionStrategy::Targets => "TARGETS",
            DistributionStrategy::WholeProject => "WHOLE_PROJECT",
            DistributionStrategy::Hybrid => "HYBRID",
        }
    }
}

impl fmt::Display for DistributionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for DistributionStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "COMPILE_UNITS" => Ok(DistributionStrategy::CompileUnits),
            "TARGETS" => Ok(DistributionStrategy::Targets),
            "WHOLE_PROJECT" => Ok(DistributionStrategy::WholeProject),
            "HYBRID" => Ok(DistributionStrategy::Hybrid),
            _ => Err(format!("Invalid distribution strategy: '{}'", s)),
        }
    }
}

/// Policy for picking among eligible workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoadBalancing {
    RoundRobin,
    #[default]
    LeastLoaded,
    LeastLatency,
    Weighted,
    Random,
}

impl FromStr for LoadBalancing {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "ROUND_ROBIN" => Ok(LoadBalancing::RoundRobin),
            "LEAST_LOADED" => Ok(LoadBalancing::LeastLoaded),
            "LEAST_LATENCY" => Ok(LoadBalancing::LeastLatency),
            "WEIGHTED" => Ok(LoadBalancing::Weighted),
            "RANDOM" => Ok(LoadBalancing::Random),
            _ => Err(format!("Invalid load balancing algorithm: '{}'", s)),
        }
    }
}

/// Build session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuildState {
    #[default]
    Created,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl BuildState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildState::Created => "CREATED",
            BuildState::Running => "RUNNING",
            BuildState::Completed => "COMPLETED",
            BuildState::Failed => "FAILED",
            BuildState::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BuildState::Completed | BuildState::Failed | BuildState::Cancelled
        )
    }
}

impl fmt::Display for BuildState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Handshake payloads
// ============================================================================

/// Worker -> Coordinator: first message on a fresh connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloPayload {
    pub name: String,
    pub hostname: String,
    #[serde(default)]
    pub port: u16,
    pub system_info: SystemInfo,
    pub capabilities: Capabilities,
    #[serde(default)]
    pub tools: BTreeMap<String, ToolInfo>,
    #[serde(default)]
    pub max_jobs: u32,
    /// Present only with pre-shared token auth; challenge auth leaves it out.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
}

/// Coordinator -> Worker: registration accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WelcomePayload {
    pub worker_id: Uuid,
    pub server_id: Uuid,
    pub heartbeat_interval_secs: u64,
}

/// Authentication method the coordinator requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    #[default]
    Token,
    Challenge,
}

impl FromStr for AuthMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "token" => Ok(AuthMethod::Token),
            "challenge" => Ok(AuthMethod::Challenge),
            _ => Err(format!("Invalid auth method: '{}'", s)),
        }
    }
}

/// Coordinator -> Worker: prove you hold the shared secret.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthChallengePayload {
    pub nonce: String,
    pub method: AuthMethod,
}

/// Worker -> Coordinator: answer to AUTH_CHALLENGE.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthResponsePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Hex HMAC-SHA256 of the nonce under the shared secret.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hmac: Option<String>,
}

/// Coordinator -> Worker: issued credential for later reconnects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthSuccessPayload {
    pub worker_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthFailedPayload {
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GoodbyePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

// ============================================================================
// Steady-state payloads
// ============================================================================

/// Worker -> Coordinator, every heartbeat interval.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HeartbeatPayload {
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub active_jobs: u32,
}

/// Worker -> Coordinator: state change outside the heartbeat cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusUpdatePayload {
    pub state: WorkerState,
    #[serde(default)]
    pub cpu_usage: f64,
    #[serde(default)]
    pub memory_usage: f64,
    #[serde(default)]
    pub active_jobs: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobAcceptPayload {
    pub job_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRejectPayload {
    pub job_id: Uuid,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobProgressPayload {
    pub job_id: Uuid,
    pub percent: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Outcome of a finished job, carried by JOB_COMPLETE.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: Uuid,
    pub success: bool,
    pub exit_code: i32,
    pub duration_secs: f64,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    /// Path of the produced artifact on the worker, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_file: Option<PathBuf>,
    /// SHA-256 of the produced artifact; keys the cache entry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_size: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobFailedPayload {
    pub job_id: Uuid,
    pub error: String,
    #[serde(default)]
    pub stderr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobCancelPayload {
    pub job_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobCancelledPayload {
    pub job_id: Uuid,
}

// ============================================================================
// Artifact & file transfer payloads
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactRequestPayload {
    pub cache_key: String,
}

/// Response to ARTIFACT_REQUEST; bytes follow in the binary frame when found.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactResponsePayload {
    pub cache_key: String,
    pub found: bool,
    #[serde(default)]
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
}

/// Push of a produced artifact; bytes travel in the binary frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactPushPayload {
    pub cache_key: String,
    pub content_hash: String,
    pub artifact_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactAckPayload {
    pub cache_key: String,
    pub stored: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileTransferStartPayload {
    pub transfer_id: Uuid,
    pub file_name: String,
    pub total_size: u64,
    pub chunk_size: u64,
}

/// Chunk metadata; chunk bytes travel in the binary frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileTransferChunkPayload {
    pub transfer_id: Uuid,
    pub seq: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileTransferEndPayload {
    pub transfer_id: Uuid,
    pub total_chunks: u64,
    pub content_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileTransferAckPayload {
    pub transfer_id: Uuid,
    pub seq: u64,
    pub ok: bool,
}

// ============================================================================
// Control payloads
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ShutdownPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grace_period_secs: Option<u64>,
}

/// Bidirectional error notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_id: Option<Uuid>,
}

impl ErrorPayload {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            job_id: None,
            worker_id: None,
            build_id: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capabilities_ops() {
        let mut caps = Capabilities::COMPILE_C | Capabilities::CMAKE;
        assert!(caps.contains(Capabilities::COMPILE_C));
        assert!(!caps.contains(Capabilities::LINK));
        assert!(caps.contains(Capabilities::COMPILE_C | Capabilities::CMAKE));

        caps.insert(Capabilities::LINK);
        assert!(caps.contains(Capabilities::LINK));

        assert_eq!(
            caps.overlap(Capabilities::LINK | Capabilities::GPU_CUDA),
            1
        );
        assert!(Capabilities::NONE.is_empty());
    }

    #[test]
    fn test_capabilities_serde_transparent() {
        let caps = Capabilities::COMPILE_C | Capabilities::COMPILE_CPP;
        let json = serde_json::to_string(&caps).unwrap();
        assert_eq!(json, "3");
        let back: Capabilities = serde_json::from_str(&json).unwrap();
        assert_eq!(back, caps);
    }

    #[test]
    fn test_worker_state_roundtrip() {
        for state in [
            WorkerState::Offline,
            WorkerState::Connecting,
            WorkerState::Authenticating,
            WorkerState::Online,
            WorkerState::Busy,
            WorkerState::Draining,
            WorkerState::Error,
        ] {
            let parsed: WorkerState = state.as_str().parse().unwrap();
            assert_eq!(parsed, state);
        }
        assert!(WorkerState::Online.accepts_jobs());
        assert!(WorkerState::Busy.accepts_jobs());
        assert!(!WorkerState::Draining.accepts_jobs());
    }

    #[test]
    fn test_job_kind_capabilities() {
        assert_eq!(
            JobKind::Compile.base_capabilities(),
            Capabilities::COMPILE_C
        );
        assert_eq!(JobKind::CmakeBuild.base_capabilities(), Capabilities::CMAKE);
        assert!(JobKind::Custom.base_capabilities().is_empty());
    }

    #[test]
    fn test_job_spec_serde_skips_empty() {
        let spec = JobSpec::compile("a.c", "cc");
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["kind"], "compile");
        assert!(json.get("build_command").is_none());
        assert!(json.get("output_file").is_none());

        let back: JobSpec = serde_json::from_value(json).unwrap();
        assert_eq!(back.source_file.as_deref(), Some(std::path::Path::new("a.c")));
        assert_eq!(back.timeout_secs, spec.timeout_secs);
    }

    #[test]
    fn test_job_state_predicates() {
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Timeout.is_terminal());
        assert!(!JobState::Retry.is_terminal());
        assert!(JobState::Running.holds_worker());
        assert!(!JobState::Pending.holds_worker());
    }

    #[test]
    fn test_strategy_parse() {
        assert_eq!(
            "WHOLE_PROJECT".parse::<DistributionStrategy>().unwrap(),
            DistributionStrategy::WholeProject
        );
        assert_eq!(
            "round_robin".parse::<LoadBalancing>().unwrap(),
            LoadBalancing::RoundRobin
        );
        assert!("quantum".parse::<DistributionStrategy>().is_err());
    }
}
