//! The spawn boundary: how a master obtains a channel to a worker.
//!
//! Two paths:
//! - [`ProcessSpawner`]: a real `tokio::process` child with framed
//!   stdin/stdout and the startup options forwarded through the environment
//! - in-process stub ([`spawn_in_process`]): a `tokio::io::duplex` pair whose
//!   far end is handed to a caller-supplied [`WorkerFactory`], used when
//!   `spawnChildProcess` is false (stub workers for testing)

use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::process::Command;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::JsonCodec;
use crate::bridge::protocol::Envelope;
use crate::constants;
use crate::error::Error;

pub type BoxedRead = Box<dyn AsyncRead + Send + Sync + Unpin>;
pub type BoxedWrite = Box<dyn AsyncWrite + Send + Sync + Unpin>;
pub type EnvelopeReader = FramedRead<BoxedRead, JsonCodec<Envelope>>;
pub type EnvelopeWriter = FramedWrite<BoxedWrite, JsonCodec<Envelope>>;

/// Startup configuration block accepted by `start`/`q_start`.
///
/// Serialized with the wire keys existing consumers expect
/// (`startupInfo`, `DEBUG_MODE`, `spawnChildProcess`, `cwd`, `execPath`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartOptions {
    /// Opaque payload forwarded to the worker.
    #[serde(rename = "startupInfo", default, skip_serializing_if = "Option::is_none")]
    pub startup_info: Option<Value>,

    /// Verbosity flag forwarded to the worker.
    #[serde(rename = "DEBUG_MODE", default)]
    pub debug_mode: bool,

    /// Whether to actually spawn a subprocess (false wires an in-process
    /// stub worker via the configured factory).
    #[serde(rename = "spawnChildProcess", default = "default_spawn")]
    pub spawn_child_process: bool,

    /// Working directory override; defaults to the caller's current dir.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,

    /// Executable override; defaults to the caller's own executable.
    #[serde(rename = "execPath", default, skip_serializing_if = "Option::is_none")]
    pub exec_path: Option<PathBuf>,
}

fn default_spawn() -> bool {
    true
}

impl Default for StartOptions {
    fn default() -> Self {
        Self {
            startup_info: None,
            debug_mode: false,
            spawn_child_process: true,
            cwd: None,
            exec_path: None,
        }
    }
}

impl StartOptions {
    /// Resolve defaults against the calling process's own environment.
    pub fn resolve(&self) -> io::Result<AppliedOptions> {
        Ok(AppliedOptions {
            startup_info: self.startup_info.clone(),
            debug_mode: self.debug_mode,
            spawn_child_process: self.spawn_child_process,
            cwd: match &self.cwd {
                Some(cwd) => cwd.clone(),
                None => std::env::current_dir()?,
            },
            exec_path: match &self.exec_path {
                Some(path) => path.clone(),
                None => std::env::current_exe()?,
            },
        })
    }
}

/// The options that were effectively applied: [`StartOptions`] with
/// `cwd`/`exec_path` resolved. Echoed back by `start`/`q_start` and forwarded
/// to the worker as its startup info.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedOptions {
    #[serde(rename = "startupInfo", default, skip_serializing_if = "Option::is_none")]
    pub startup_info: Option<Value>,
    #[serde(rename = "DEBUG_MODE", default)]
    pub debug_mode: bool,
    #[serde(rename = "spawnChildProcess", default = "default_spawn")]
    pub spawn_child_process: bool,
    pub cwd: PathBuf,
    #[serde(rename = "execPath")]
    pub exec_path: PathBuf,
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn worker process: {0}")]
    Io(#[from] io::Error),
    #[error("failed to encode startup info: {0}")]
    StartupInfo(#[from] serde_json::Error),
    #[error("spawnChildProcess is false but no in-process worker factory is configured")]
    NoWorkerFactory,
}

/// Handle supporting forcible termination and exit reaping.
pub enum ChildControl {
    Process(tokio::process::Child),
    /// Stub worker: nothing to kill, the duplex channel closing ends it.
    InProcess,
}

impl ChildControl {
    /// Forcibly terminate and reap the child. Safe to call after a normal
    /// exit (kill on an exited child is ignored).
    pub async fn terminate(self) {
        if let ChildControl::Process(mut child) = self {
            let _ = child.start_kill();
            if let Err(e) = child.wait().await {
                tracing::warn!(error = %e, "failed to reap worker process");
            }
        }
    }
}

/// The channel end a master holds after a spawn.
pub struct SpawnedChild {
    pub writer: EnvelopeWriter,
    pub reader: EnvelopeReader,
    pub pid: Option<u32>,
    pub control: ChildControl,
}

pub struct SpawnRequest<'a> {
    /// Child entry point, passed to the executable as its first argument.
    pub entry: &'a str,
    pub options: &'a AppliedOptions,
}

/// Extension point for different worker spawn strategies.
pub trait Spawner: Send + Sync {
    fn spawn(&self, request: &SpawnRequest<'_>) -> Result<SpawnedChild, SpawnError>;
}

/// Default spawner: fork/exec the resolved executable with piped stdio.
pub struct ProcessSpawner;

impl Spawner for ProcessSpawner {
    fn spawn(&self, request: &SpawnRequest<'_>) -> Result<SpawnedChild, SpawnError> {
        let startup = serde_json::to_string(request.options)?;

        tracing::debug!(
            entry = request.entry,
            exec_path = %request.options.exec_path.display(),
            cwd = %request.options.cwd.display(),
            "spawning worker process"
        );

        let mut child = Command::new(&request.options.exec_path)
            .arg(request.entry)
            .current_dir(&request.options.cwd)
            .env(constants::STARTUP_INFO_ENV, startup)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::other("worker stdin not captured"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("worker stdout not captured"))?;

        Ok(SpawnedChild {
            pid: child.id(),
            writer: FramedWrite::new(Box::new(stdin) as BoxedWrite, JsonCodec::new()),
            reader: FramedRead::new(Box::new(stdout) as BoxedRead, JsonCodec::new()),
            control: ChildControl::Process(child),
        })
    }
}

/// Builds the worker end of a stubbed (non-spawned) master/worker pair.
///
/// Called with the worker side of the duplex channel and the applied startup
/// options; expected to wire up a worker runtime (typically by spawning a
/// task around [`crate::slave::SlaveProcess::attach`]).
pub type WorkerFactory = Arc<dyn Fn(DuplexStream, AppliedOptions) + Send + Sync>;

/// Wire an in-process stub worker instead of spawning a subprocess.
pub fn spawn_in_process(
    factory: &WorkerFactory,
    options: &AppliedOptions,
) -> Result<SpawnedChild, SpawnError> {
    let (master_io, worker_io) = tokio::io::duplex(64 * 1024);
    factory(worker_io, options.clone());

    let (read_half, write_half) = tokio::io::split(master_io);
    Ok(SpawnedChild {
        pid: None,
        writer: FramedWrite::new(Box::new(write_half) as BoxedWrite, JsonCodec::new()),
        reader: FramedRead::new(Box::new(read_half) as BoxedRead, JsonCodec::new()),
        control: ChildControl::InProcess,
    })
}

/// Read the startup options block forwarded by the master, synchronously
/// available on worker startup.
pub fn startup_info_from_env() -> Result<AppliedOptions, Error> {
    let raw =
        std::env::var(constants::STARTUP_INFO_ENV).map_err(|_| Error::MissingStartupInfo)?;
    Ok(serde_json::from_str(&raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn framed_channel_ends_are_spawn_safe() {
        // Worker mains hold these across awaits inside spawned tasks; both
        // ends must stay Send + Sync.
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<EnvelopeReader>();
        assert_send_sync::<EnvelopeWriter>();
    }

    #[test]
    fn resolve_defaults_to_caller_environment() {
        let applied = StartOptions::default().resolve().unwrap();
        assert_eq!(applied.cwd, std::env::current_dir().unwrap());
        assert_eq!(applied.exec_path, std::env::current_exe().unwrap());
        assert!(applied.spawn_child_process);
    }

    #[test]
    fn resolve_keeps_explicit_overrides() {
        let options = StartOptions {
            startup_info: Some(json!("aa")),
            debug_mode: true,
            spawn_child_process: false,
            cwd: Some(PathBuf::from("/tmp")),
            exec_path: Some(PathBuf::from("/usr/bin/true")),
        };
        let applied = options.resolve().unwrap();
        assert_eq!(applied.cwd, PathBuf::from("/tmp"));
        assert_eq!(applied.exec_path, PathBuf::from("/usr/bin/true"));
        assert_eq!(applied.startup_info, Some(json!("aa")));
        assert!(applied.debug_mode);
    }

    #[test]
    fn applied_options_wire_keys() {
        let applied = AppliedOptions {
            startup_info: Some(json!("aa")),
            debug_mode: false,
            spawn_child_process: true,
            cwd: PathBuf::from("/work"),
            exec_path: PathBuf::from("/usr/bin/worker"),
        };
        assert_eq!(
            serde_json::to_value(&applied).unwrap(),
            json!({
                "startupInfo": "aa",
                "DEBUG_MODE": false,
                "spawnChildProcess": true,
                "cwd": "/work",
                "execPath": "/usr/bin/worker",
            })
        );
    }

    #[test]
    fn startup_info_round_trips_through_env_encoding() {
        let applied = StartOptions {
            startup_info: Some(json!({"nested": [1, 2, 3]})),
            ..StartOptions::default()
        }
        .resolve()
        .unwrap();
        let encoded = serde_json::to_string(&applied).unwrap();
        let decoded: AppliedOptions = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, applied);
    }
}
