//! Deterministic in-memory runner for tests and development.
//!
//! Each "VM" is a tokio task running the reference guest executor over
//! an in-memory duplex stream. Boots take a configurable simulated
//! delay, installs are recorded rather than performed, and snapshots
//! capture the installed package set so restores reproduce it. Every
//! runner operation is counted, which is what the lifecycle tests
//! assert against.

use async_trait::async_trait;
use cordon_core::{
    Endpoint, Error, GuestStream, Result, RunnerVm, Snapshot, VmConfig, VmRunner,
};
use cordon_protocol::{
    Executor, FunctionRegistry, FunctionResult, GuestFunction, HANDSHAKE_BYTE, PackageInstaller,
    StaticRegistry, Value,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::task::JoinHandle;
use uuid::Uuid;

struct SharedRegistry(Arc<RwLock<StaticRegistry>>);

impl FunctionRegistry for SharedRegistry {
    fn resolve(&self, function_ref: &str) -> Option<GuestFunction> {
        self.0.read().unwrap().resolve(function_ref)
    }
}

struct MockInstaller {
    vm_installed: Arc<Mutex<Vec<String>>>,
    last_install: Arc<Mutex<Vec<String>>>,
    fail_with: Option<String>,
}

#[async_trait]
impl PackageInstaller for MockInstaller {
    async fn install(&self, packages: &[String]) -> std::result::Result<(), String> {
        *self.last_install.lock().unwrap() = packages.to_vec();
        if let Some(reason) = &self.fail_with {
            return Err(reason.clone());
        }
        self.vm_installed
            .lock()
            .unwrap()
            .extend(packages.iter().cloned());
        Ok(())
    }
}

struct MockInner {
    registry: Arc<RwLock<StaticRegistry>>,
    boot_delay: Mutex<Duration>,
    fail_install: Mutex<Option<String>>,
    fail_next_boots: AtomicUsize,
    boot_count: AtomicUsize,
    snapshot_count: AtomicUsize,
    restore_count: AtomicUsize,
    kill_count: AtomicUsize,
    shutdown_count: AtomicUsize,
    vm_installed: Mutex<HashMap<Uuid, Arc<Mutex<Vec<String>>>>>,
    snapshot_store: Mutex<HashMap<Uuid, Vec<String>>>,
    last_install: Arc<Mutex<Vec<String>>>,
}

/// In-memory [`VmRunner`] with a shared guest function table.
#[derive(Clone)]
pub struct MockRunner {
    inner: Arc<MockInner>,
}

impl MockRunner {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MockInner {
                registry: Arc::new(RwLock::new(StaticRegistry::new())),
                boot_delay: Mutex::new(Duration::from_millis(10)),
                fail_install: Mutex::new(None),
                fail_next_boots: AtomicUsize::new(0),
                boot_count: AtomicUsize::new(0),
                snapshot_count: AtomicUsize::new(0),
                restore_count: AtomicUsize::new(0),
                kill_count: AtomicUsize::new(0),
                shutdown_count: AtomicUsize::new(0),
                vm_installed: Mutex::new(HashMap::new()),
                snapshot_store: Mutex::new(HashMap::new()),
                last_install: Arc::new(Mutex::new(Vec::new())),
            }),
        }
    }

    /// Simulated boot (and restore) latency.
    pub fn set_boot_delay(&self, delay: Duration) {
        *self.inner.boot_delay.lock().unwrap() = delay;
    }

    /// Makes every subsequent install fail with `reason`.
    pub fn fail_installs(&self, reason: &str) {
        *self.inner.fail_install.lock().unwrap() = Some(reason.to_string());
    }

    /// Injects one boot failure.
    pub fn fail_next_boot(&self) {
        self.inner.fail_next_boots.fetch_add(1, Ordering::SeqCst);
    }

    /// Registers a synchronous guest function.
    pub fn register_fn<F>(&self, function_ref: &str, f: F)
    where
        F: Fn(Vec<Value>, Vec<(String, Value)>) -> FunctionResult + Send + Sync + 'static,
    {
        self.inner
            .registry
            .write()
            .unwrap()
            .register_fn(function_ref, f);
    }

    /// Registers an async guest function.
    pub fn register<F, Fut>(&self, function_ref: &str, f: F)
    where
        F: Fn(Vec<Value>, Vec<(String, Value)>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = FunctionResult> + Send + 'static,
    {
        self.inner
            .registry
            .write()
            .unwrap()
            .register(function_ref, f);
    }

    /// Registers a function whose invocation kills the guest daemon,
    /// so the host observes a crash.
    pub fn register_crash(&self, function_ref: &str) {
        self.register_fn(function_ref, |_args, _kwargs| {
            panic!("simulated guest crash")
        });
    }

    pub fn boot_count(&self) -> usize {
        self.inner.boot_count.load(Ordering::SeqCst)
    }

    pub fn snapshot_count(&self) -> usize {
        self.inner.snapshot_count.load(Ordering::SeqCst)
    }

    pub fn restore_count(&self) -> usize {
        self.inner.restore_count.load(Ordering::SeqCst)
    }

    pub fn kill_count(&self) -> usize {
        self.inner.kill_count.load(Ordering::SeqCst)
    }

    pub fn shutdown_count(&self) -> usize {
        self.inner.shutdown_count.load(Ordering::SeqCst)
    }

    /// Packages named by the most recent install command.
    pub fn last_install(&self) -> Vec<String> {
        self.inner.last_install.lock().unwrap().clone()
    }

    async fn launch(&self, installed: Vec<String>) -> Result<Box<dyn RunnerVm>> {
        if self
            .inner
            .fail_next_boots
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::BootFailure("injected boot failure".into()));
        }

        let delay = *self.inner.boot_delay.lock().unwrap();
        tokio::time::sleep(delay).await;

        let id = Uuid::new_v4();
        let (mut host, guest) = tokio::io::duplex(256 * 1024);

        let vm_installed = Arc::new(Mutex::new(installed));
        self.inner
            .vm_installed
            .lock()
            .unwrap()
            .insert(id, Arc::clone(&vm_installed));

        let installer = MockInstaller {
            vm_installed,
            last_install: Arc::clone(&self.inner.last_install),
            fail_with: self.inner.fail_install.lock().unwrap().clone(),
        };
        let executor = Executor::new(SharedRegistry(Arc::clone(&self.inner.registry)), installer);
        let task = tokio::spawn(async move {
            let _ = executor.serve(guest).await;
        });

        let byte = host
            .read_u8()
            .await
            .map_err(|e| Error::BootFailure(format!("no handshake from guest: {e}")))?;
        if byte != HANDSHAKE_BYTE {
            task.abort();
            return Err(Error::BootFailure(format!(
                "unexpected handshake byte {byte:#04x}"
            )));
        }

        Ok(Box::new(MockVm {
            id,
            stream: Mutex::new(Some(Box::new(host) as GuestStream)),
            task: Mutex::new(Some(task)),
            killed: AtomicBool::new(false),
            inner: Arc::clone(&self.inner),
        }))
    }
}

impl Default for MockRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VmRunner for MockRunner {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn is_available(&self) -> bool {
        true
    }

    fn supports_snapshots(&self) -> bool {
        true
    }

    async fn boot(&self, _config: &VmConfig) -> Result<Box<dyn RunnerVm>> {
        let vm = self.launch(Vec::new()).await?;
        self.inner.boot_count.fetch_add(1, Ordering::SeqCst);
        Ok(vm)
    }

    async fn snapshot(&self, vm: &dyn RunnerVm) -> Result<Snapshot> {
        let installed = self
            .inner
            .vm_installed
            .lock()
            .unwrap()
            .get(&vm.id())
            .cloned()
            .ok_or_else(|| Error::ControlUnreachable(format!("unknown VM {}", vm.id())))?;
        let installed = installed.lock().unwrap().clone();

        let id = Uuid::new_v4();
        let artifact = std::env::temp_dir().join(format!("cordon-mock-{id}.snap"));
        tokio::fs::write(&artifact, installed.join("\n")).await?;

        self.inner
            .snapshot_store
            .lock()
            .unwrap()
            .insert(id, installed);
        self.inner.snapshot_count.fetch_add(1, Ordering::SeqCst);
        Ok(Snapshot { id, artifact })
    }

    async fn restore(&self, snapshot: &Snapshot) -> Result<Box<dyn RunnerVm>> {
        let installed = self
            .inner
            .snapshot_store
            .lock()
            .unwrap()
            .get(&snapshot.id)
            .cloned()
            .ok_or_else(|| Error::RestoreFailure(format!("unknown snapshot {}", snapshot.id)))?;
        let vm = self.launch(installed).await?;
        self.inner.restore_count.fetch_add(1, Ordering::SeqCst);
        Ok(vm)
    }
}

struct MockVm {
    id: Uuid,
    stream: Mutex<Option<GuestStream>>,
    task: Mutex<Option<JoinHandle<()>>>,
    killed: AtomicBool,
    inner: Arc<MockInner>,
}

impl MockVm {
    fn stop_executor(&self) {
        if let Some(task) = self.task.lock().unwrap().take() {
            task.abort();
        }
    }
}

#[async_trait]
impl RunnerVm for MockVm {
    fn id(&self) -> Uuid {
        self.id
    }

    fn control_endpoint(&self) -> Endpoint {
        Endpoint::InMemory(self.id)
    }

    fn stream_endpoint(&self) -> Endpoint {
        Endpoint::InMemory(self.id)
    }

    async fn stream(&self) -> Result<GuestStream> {
        self.stream
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| Error::ProtocolError("guest stream already taken".into()))
    }

    async fn shutdown(&self) -> Result<()> {
        self.inner.shutdown_count.fetch_add(1, Ordering::SeqCst);
        self.inner.vm_installed.lock().unwrap().remove(&self.id);
        self.stop_executor();
        Ok(())
    }

    async fn hard_kill(&self) -> Result<()> {
        if !self.killed.swap(true, Ordering::SeqCst) {
            self.inner.kill_count.fetch_add(1, Ordering::SeqCst);
            self.inner.vm_installed.lock().unwrap().remove(&self.id);
            self.stop_executor();
        }
        Ok(())
    }
}
