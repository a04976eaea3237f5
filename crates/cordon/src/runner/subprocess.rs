//! Runner backed by an opaque hypervisor binary.
//!
//! Each VM is one hypervisor process. The binary is located via the
//! `CORDON_HYPERVISOR` environment variable or `PATH`, launched with its
//! resources, mounts, and network policy as flags, and exposes two Unix
//! sockets in a per-VM directory: a line-oriented control socket
//! (snapshot, shutdown) and the host↔guest stream socket. Boot completes
//! once both sockets accept connections and the guest's handshake byte
//! arrives on the stream.

use async_trait::async_trait;
use cordon_core::{
    Endpoint, Error, GuestStream, MountMode, NetPolicy, Result, RunnerVm, Snapshot, VmConfig,
    VmRunner,
};
use cordon_protocol::HANDSHAKE_BYTE;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::process::{Child, Command};
use tokio::time::{Instant, sleep, timeout};
use uuid::Uuid;

const HYPERVISOR_ENV: &str = "CORDON_HYPERVISOR";
const HYPERVISOR_BINARY: &str = "cordon-hypervisor";

const BOOT_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(100);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);
const KILL_WAIT: Duration = Duration::from_secs(5);
const CONTROL_REPLY_LIMIT: usize = 4096;

type VmTable = Arc<Mutex<HashMap<Uuid, Arc<VmShared>>>>;

/// [`VmRunner`] that drives an external hypervisor process per VM.
pub struct SubprocessRunner {
    binary: Option<PathBuf>,
    state_dir: PathBuf,
    vms: VmTable,
}

impl SubprocessRunner {
    pub fn new() -> Self {
        Self {
            binary: Self::find_hypervisor_binary(),
            state_dir: std::env::temp_dir().join("cordon"),
            vms: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Directory for per-VM sockets and snapshot artifacts.
    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = dir.into();
        self
    }

    fn find_hypervisor_binary() -> Option<PathBuf> {
        if let Ok(path) = std::env::var(HYPERVISOR_ENV) {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        which::which(HYPERVISOR_BINARY).ok()
    }

    fn boot_args(config: &VmConfig) -> Result<Vec<String>> {
        let image = config.image.as_ref().ok_or_else(|| {
            Error::InvalidConfig("subprocess runner requires a kernel/rootfs image".into())
        })?;

        let mut args = vec![
            "--cpus".to_string(),
            config.cpus.to_string(),
            "--memory-mb".to_string(),
            config.memory_mb.to_string(),
            "--kernel".to_string(),
            image.kernel.display().to_string(),
            "--rootfs".to_string(),
            image.rootfs.display().to_string(),
            "--net".to_string(),
            match config.net {
                NetPolicy::None => "none",
                NetPolicy::HttpsOnly => "https-only",
                NetPolicy::All => "all",
            }
            .to_string(),
        ];

        for mount in &config.mounts {
            let mode = match mount.mode {
                MountMode::Read => "ro",
                MountMode::ReadWrite => "rw",
            };
            args.push("--mount".to_string());
            args.push(format!("{}:{}", mount.path.display(), mode));
        }

        Ok(args)
    }

    async fn spawn_vm(&self, args: Vec<String>) -> Result<Box<dyn RunnerVm>> {
        let binary = self.binary.clone().ok_or(Error::NoRunnerAvailable)?;

        std::fs::create_dir_all(&self.state_dir)?;
        let dir = tempfile::Builder::new()
            .prefix("vm-")
            .tempdir_in(&self.state_dir)?;
        let control_path = dir.path().join("control.sock");
        let stream_path = dir.path().join("stream.sock");

        let mut cmd = Command::new(&binary);
        cmd.args(&args)
            .arg("--control-socket")
            .arg(&control_path)
            .arg("--stream-socket")
            .arg(&stream_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::BootFailure(format!("failed to spawn hypervisor: {e}")))?;

        let deadline = Instant::now() + BOOT_TIMEOUT;
        let control = Self::connect_socket(&control_path, deadline, &mut child).await?;
        let mut stream = Self::connect_socket(&stream_path, deadline, &mut child).await?;

        let handshake = timeout(deadline - Instant::now(), stream.read_u8())
            .await
            .map_err(|_| Error::BootFailure("guest handshake timed out".into()))?
            .map_err(|e| Error::BootFailure(format!("guest handshake failed: {e}")))?;
        if handshake != HANDSHAKE_BYTE {
            let _ = child.start_kill();
            return Err(Error::BootFailure(format!(
                "unexpected handshake byte {handshake:#04x}"
            )));
        }

        let id = Uuid::new_v4();
        let shared = Arc::new(VmShared {
            control: tokio::sync::Mutex::new(control),
            child: tokio::sync::Mutex::new(child),
        });
        self.vms.lock().unwrap().insert(id, Arc::clone(&shared));

        Ok(Box::new(SubprocessVm {
            id,
            _dir: dir,
            control_path,
            stream_path,
            shared,
            stream: Mutex::new(Some(Box::new(stream) as GuestStream)),
            killed: AtomicBool::new(false),
            vms: Arc::clone(&self.vms),
        }))
    }

    async fn connect_socket(
        path: &Path,
        deadline: Instant,
        child: &mut Child,
    ) -> Result<UnixStream> {
        loop {
            if let Some(status) = child
                .try_wait()
                .map_err(|e| Error::BootFailure(e.to_string()))?
            {
                return Err(Error::BootFailure(format!(
                    "hypervisor exited during boot with {status}"
                )));
            }

            match UnixStream::connect(path).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    if Instant::now() >= deadline {
                        return Err(Error::BootFailure(format!(
                            "socket {} never became ready: {e}",
                            path.display()
                        )));
                    }
                    tracing::debug!("socket {} not ready: {e}, retrying", path.display());
                }
            }
            sleep(CONNECT_RETRY_INTERVAL).await;
        }
    }

    fn vm_shared(&self, id: Uuid) -> Result<Arc<VmShared>> {
        self.vms
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::ControlUnreachable(format!("unknown VM {id}")))
    }
}

impl Default for SubprocessRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VmRunner for SubprocessRunner {
    fn name(&self) -> &'static str {
        "subprocess"
    }

    fn is_available(&self) -> bool {
        self.binary.is_some()
    }

    fn supports_snapshots(&self) -> bool {
        true
    }

    async fn boot(&self, config: &VmConfig) -> Result<Box<dyn RunnerVm>> {
        self.spawn_vm(Self::boot_args(config)?).await
    }

    async fn snapshot(&self, vm: &dyn RunnerVm) -> Result<Snapshot> {
        let shared = self.vm_shared(vm.id())?;

        let snapshots = self.state_dir.join("snapshots");
        std::fs::create_dir_all(&snapshots)?;
        let id = Uuid::new_v4();
        let artifact = snapshots.join(format!("{id}.img"));

        let reply = shared
            .control_command(&format!("snapshot {}", artifact.display()))
            .await?;
        match reply.as_str() {
            "ok" => Ok(Snapshot { id, artifact }),
            "err unsupported" => Err(Error::SnapshotUnsupported),
            other => Err(Error::ProvisioningError(format!(
                "hypervisor snapshot failed: {other}"
            ))),
        }
    }

    async fn restore(&self, snapshot: &Snapshot) -> Result<Box<dyn RunnerVm>> {
        if !snapshot.artifact.exists() {
            return Err(Error::RestoreFailure(format!(
                "snapshot artifact missing: {}",
                snapshot.artifact.display()
            )));
        }
        let args = vec![
            "--restore".to_string(),
            snapshot.artifact.display().to_string(),
        ];
        self.spawn_vm(args)
            .await
            .map_err(|e| Error::RestoreFailure(e.to_string()))
    }
}

struct VmShared {
    control: tokio::sync::Mutex<UnixStream>,
    child: tokio::sync::Mutex<Child>,
}

impl VmShared {
    /// Sends one control line and reads one reply line.
    async fn control_command(&self, command: &str) -> Result<String> {
        let mut control = self.control.lock().await;
        control
            .write_all(command.as_bytes())
            .await
            .map_err(|e| Error::ControlUnreachable(e.to_string()))?;
        control
            .write_all(b"\n")
            .await
            .map_err(|e| Error::ControlUnreachable(e.to_string()))?;

        let mut reply = Vec::new();
        loop {
            let byte = control
                .read_u8()
                .await
                .map_err(|e| Error::ControlUnreachable(e.to_string()))?;
            if byte == b'\n' {
                break;
            }
            reply.push(byte);
            if reply.len() > CONTROL_REPLY_LIMIT {
                return Err(Error::ControlUnreachable("oversized control reply".into()));
            }
        }
        String::from_utf8(reply)
            .map(|s| s.trim().to_string())
            .map_err(|_| Error::ControlUnreachable("non-utf8 control reply".into()))
    }
}

struct SubprocessVm {
    id: Uuid,
    // Keeps the per-VM socket directory alive for the VM's lifetime.
    _dir: tempfile::TempDir,
    control_path: PathBuf,
    stream_path: PathBuf,
    shared: Arc<VmShared>,
    stream: Mutex<Option<GuestStream>>,
    killed: AtomicBool,
    vms: VmTable,
}

#[async_trait]
impl RunnerVm for SubprocessVm {
    fn id(&self) -> Uuid {
        self.id
    }

    fn control_endpoint(&self) -> Endpoint {
        Endpoint::UnixSocket(self.control_path.clone())
    }

    fn stream_endpoint(&self) -> Endpoint {
        Endpoint::UnixSocket(self.stream_path.clone())
    }

    async fn stream(&self) -> Result<GuestStream> {
        self.stream
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| Error::ProtocolError("guest stream already taken".into()))
    }

    async fn shutdown(&self) -> Result<()> {
        self.vms.lock().unwrap().remove(&self.id);
        self.shared.control_command("shutdown").await?;

        let mut child = self.shared.child.lock().await;
        match timeout(SHUTDOWN_GRACE, child.wait()).await {
            Ok(Ok(_status)) => Ok(()),
            Ok(Err(e)) => Err(Error::Io(e)),
            Err(_) => {
                // Guest ignored the request; fall back to a hard stop.
                let _ = child.start_kill();
                let _ = timeout(KILL_WAIT, child.wait()).await;
                Ok(())
            }
        }
    }

    async fn hard_kill(&self) -> Result<()> {
        if self.killed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.vms.lock().unwrap().remove(&self.id);

        let mut child = self.shared.child.lock().await;
        let _ = child.start_kill();
        let _ = timeout(KILL_WAIT, child.wait()).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cordon_core::{CapabilityProfile, ImageRef};

    #[test]
    fn boot_args_cover_resources_mounts_and_net() {
        let profile = CapabilityProfile::new(200, 256)
            .mount("/data", MountMode::Read)
            .mount("/scratch", MountMode::ReadWrite)
            .net(NetPolicy::HttpsOnly);
        let config = cordon_core::VmConfig::from_profile(
            &profile,
            2,
            Some(ImageRef::new("/img/kernel", "/img/rootfs")),
        );

        let args = SubprocessRunner::boot_args(&config).unwrap();
        let joined = args.join(" ");
        assert!(joined.contains("--cpus 2"));
        assert!(joined.contains("--memory-mb 256"));
        assert!(joined.contains("--kernel /img/kernel"));
        assert!(joined.contains("--rootfs /img/rootfs"));
        assert!(joined.contains("--net https-only"));
        assert!(joined.contains("--mount /data:ro"));
        assert!(joined.contains("--mount /scratch:rw"));
    }

    #[test]
    fn boot_args_require_an_image() {
        let profile = CapabilityProfile::new(200, 256);
        let config = cordon_core::VmConfig::from_profile(&profile, 1, None);
        assert!(matches!(
            SubprocessRunner::boot_args(&config),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn snapshot_of_unknown_vm_is_control_unreachable() {
        let runner = SubprocessRunner::new();
        let mock = crate::runner::MockRunner::new();
        mock.set_boot_delay(Duration::ZERO);
        let vm = mock
            .boot(&cordon_core::VmConfig::from_profile(
                &CapabilityProfile::new(100, 128),
                1,
                None,
            ))
            .await
            .unwrap();

        assert!(matches!(
            runner.snapshot(vm.as_ref()).await,
            Err(Error::ControlUnreachable(_))
        ));
    }

    #[tokio::test]
    async fn restore_requires_existing_artifact() {
        let runner = SubprocessRunner::new();
        let snapshot = Snapshot {
            id: Uuid::new_v4(),
            artifact: std::env::temp_dir().join("cordon-missing.img"),
        };
        assert!(matches!(
            runner.restore(&snapshot).await,
            Err(Error::RestoreFailure(_))
        ));
    }
}
