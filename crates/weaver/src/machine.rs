//! Machine lifecycle.
//!
//! A [`Machine`] owns one hypervisor process together with its control
//! channel, its serial consoles and the host ports of its adapters. All
//! lifecycle and snapshot operations take the same lock, so they run one at
//! a time and in the order they were called. Consoles are handed out as
//! shared handles and can be used while another operation is in progress.
//!
//! Before every operation the process is checked; if it exited on its own
//! the machine releases everything it owned, moves to
//! [`MachineState::Stopped`], records the crash and fails the operation with
//! [`Error::ProcessExited`].

use crate::backend::{
    DriveAttachment, HypervisorBackend, LaunchSpec, NicAttachment, QemuBackend, VmmExit,
    VmmProcess,
};
use crate::console::ConsoleChannel;
use crate::control::{ControlChannel, RunStatus};
use crate::snapshot::{self, SnapshotInfo};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UnixStream;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;
use weaver_core::{
    ChannelStream, Drive, DriveMedia, Error, HostConfig, ResourceConfig, Result, SnapshotFailure,
};
use weaver_net::{Adapter, HostNetworking, IpCommand, PortLease};

const STATE_STOPPED: u8 = 0;
const STATE_STARTING: u8 = 1;
const STATE_RUNNING: u8 = 2;
const STATE_PAUSED: u8 = 3;

const MAX_CONNECT_BACKOFF: Duration = Duration::from_millis(500);
const KILL_TIMEOUT: Duration = Duration::from_secs(5);
const LOG_TAIL_LINES: usize = 5;

/// Lifecycle state of a [`Machine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineState {
    Stopped,
    Starting,
    Running,
    Paused,
}

impl MachineState {
    fn from_atomic(value: u8) -> Self {
        match value {
            STATE_STARTING => MachineState::Starting,
            STATE_RUNNING => MachineState::Running,
            STATE_PAUSED => MachineState::Paused,
            _ => MachineState::Stopped,
        }
    }

    fn as_atomic(self) -> u8 {
        match self {
            MachineState::Stopped => STATE_STOPPED,
            MachineState::Starting => STATE_STARTING,
            MachineState::Running => STATE_RUNNING,
            MachineState::Paused => STATE_PAUSED,
        }
    }
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MachineState::Stopped => "stopped",
            MachineState::Starting => "starting",
            MachineState::Running => "running",
            MachineState::Paused => "paused",
        })
    }
}

#[derive(Clone)]
struct MachineSpec {
    resources: ResourceConfig,
    drives: Vec<Drive>,
    adapters: Vec<Adapter>,
    extra_serials: usize,
    ephemeral: bool,
    kernel: Option<PathBuf>,
    kernel_append: Option<String>,
    boot_order: Option<String>,
    extra_args: Vec<String>,
    runtime_dir: Option<PathBuf>,
}

/// Builder for [`Machine`].
///
/// ```rust,no_run
/// # use weaver::{Drive, DriveInterface, HostConfig, Machine};
/// # use std::time::Duration;
/// # async fn example() -> weaver::Result<()> {
/// let config = HostConfig::from_env();
/// let machine = Machine::builder(&config)
///     .cpus(2)
///     .memory_mib(4096)
///     .drive(Drive::new("disk.qcow2")?.with_interface(DriveInterface::Virtio))
///     .build()?;
///
/// machine
///     .run(async |m| {
///         m.console()?.expect("login:", Duration::from_secs(30)).await?;
///         m.take_snapshot("boot").await?;
///         Ok(())
///     })
///     .await
/// # }
/// ```
pub struct MachineBuilder {
    config: HostConfig,
    spec: MachineSpec,
    backend: Option<Arc<dyn HypervisorBackend>>,
    host_networking: Option<Arc<dyn HostNetworking>>,
}

impl MachineBuilder {
    fn new(config: &HostConfig) -> Self {
        Self {
            config: config.clone(),
            spec: MachineSpec {
                resources: ResourceConfig::default(),
                drives: Vec::new(),
                adapters: Vec::new(),
                extra_serials: 0,
                ephemeral: true,
                kernel: None,
                kernel_append: None,
                boot_order: None,
                extra_args: Vec::new(),
                runtime_dir: None,
            },
            backend: None,
            host_networking: None,
        }
    }

    pub fn cpus(mut self, cpus: u32) -> Self {
        self.spec.resources.cpus = cpus;
        self
    }

    pub fn memory_mib(mut self, memory_mib: u32) -> Self {
        self.spec.resources.memory_mib = memory_mib;
        self
    }

    pub fn resources(mut self, resources: ResourceConfig) -> Self {
        self.spec.resources = resources;
        self
    }

    /// Appends a drive; the guest sees drives in the order they were added.
    pub fn drive(mut self, drive: Drive) -> Self {
        self.spec.drives.push(drive);
        self
    }

    pub fn drives(mut self, drives: impl IntoIterator<Item = Drive>) -> Self {
        self.spec.drives.extend(drives);
        self
    }

    /// Appends a guest NIC.
    pub fn adapter(mut self, adapter: Adapter) -> Self {
        self.spec.adapters.push(adapter);
        self
    }

    pub fn adapters(mut self, adapters: impl IntoIterator<Item = Adapter>) -> Self {
        self.spec.adapters.extend(adapters);
        self
    }

    /// Adds serial ports beyond the first one.
    pub fn extra_serials(mut self, count: usize) -> Self {
        self.spec.extra_serials = count;
        self
    }

    /// With `true` (the default) writable disks get a throwaway overlay per
    /// start; with `false` the guest writes to the drive files directly.
    pub fn ephemeral(mut self, ephemeral: bool) -> Self {
        self.spec.ephemeral = ephemeral;
        self
    }

    pub fn kernel(mut self, kernel: impl Into<PathBuf>) -> Self {
        self.spec.kernel = Some(kernel.into());
        self
    }

    pub fn kernel_append(mut self, append: impl Into<String>) -> Self {
        self.spec.kernel_append = Some(append.into());
        self
    }

    /// Boot device order, e.g. `"dc"` for CD-ROM first.
    pub fn boot_order(mut self, order: impl Into<String>) -> Self {
        self.spec.boot_order = Some(order.into());
        self
    }

    /// Passes an argument to the hypervisor verbatim.
    pub fn extra_arg(mut self, arg: impl Into<String>) -> Self {
        self.spec.extra_args.push(arg.into());
        self
    }

    /// Keeps sockets, overlays and logs in `dir` instead of a temporary
    /// directory removed on stop.
    pub fn runtime_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.spec.runtime_dir = Some(dir.into());
        self
    }

    pub fn backend(mut self, backend: Arc<dyn HypervisorBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn host_networking(mut self, host: Arc<dyn HostNetworking>) -> Self {
        self.host_networking = Some(host);
        self
    }

    /// Validates the configuration. Nothing is started or created.
    pub fn build(self) -> Result<Machine> {
        self.config.validate()?;
        self.spec.resources.validate()?;

        for (i, adapter) in self.spec.adapters.iter().enumerate() {
            if self.spec.adapters[..i].iter().any(|a| a.same_as(adapter)) {
                return Err(Error::InvalidConfig(format!(
                    "adapter {} added twice",
                    adapter.mac()
                )));
            }
        }
        if let Some(kernel) = &self.spec.kernel {
            if !kernel.is_file() {
                return Err(Error::InvalidConfig(format!(
                    "kernel '{}' does not exist",
                    kernel.display()
                )));
            }
        } else if self.spec.kernel_append.is_some() {
            return Err(Error::InvalidConfig(
                "kernel_append requires a kernel".to_string(),
            ));
        }
        if let Some(order) = &self.spec.boot_order {
            if order.is_empty() || !order.chars().all(|c| c.is_ascii_lowercase()) {
                return Err(Error::InvalidConfig(format!("invalid boot order '{order}'")));
            }
        }

        let id = Uuid::new_v4();
        let name = format!("weaver-{}", &id.simple().to_string()[..8]);
        let backend = self
            .backend
            .unwrap_or_else(|| Arc::new(QemuBackend::from_config(&self.config)));
        let host_networking = self
            .host_networking
            .unwrap_or_else(|| Arc::new(IpCommand::from_config(&self.config)));

        Ok(Machine {
            id,
            name,
            config: self.config,
            spec: self.spec,
            backend,
            host_networking,
            state: AtomicU8::new(STATE_STOPPED),
            crashed: AtomicBool::new(false),
            last_exit: Mutex::new(None),
            consoles: Mutex::new(Vec::new()),
            session: tokio::sync::Mutex::new(None),
        })
    }
}

enum RuntimeDir {
    Temporary(tempfile::TempDir),
    Kept(PathBuf),
}

impl RuntimeDir {
    fn create(config: &HostConfig, fixed: Option<&Path>) -> Result<Self> {
        match fixed {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                Ok(RuntimeDir::Kept(dir.to_path_buf()))
            }
            None => {
                let root = config.runtime_root();
                std::fs::create_dir_all(&root)?;
                let dir = tempfile::Builder::new()
                    .prefix("weaver-")
                    .tempdir_in(root)?;
                Ok(RuntimeDir::Temporary(dir))
            }
        }
    }

    fn path(&self) -> &Path {
        match self {
            RuntimeDir::Temporary(dir) => dir.path(),
            RuntimeDir::Kept(dir) => dir,
        }
    }

    fn cleanup(self, sockets: &[PathBuf]) -> std::io::Result<()> {
        match self {
            RuntimeDir::Temporary(dir) => dir.close(),
            RuntimeDir::Kept(_) => {
                for socket in sockets {
                    match std::fs::remove_file(socket) {
                        Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e),
                        _ => {}
                    }
                }
                Ok(())
            }
        }
    }
}

/// Everything that exists only while the machine is running or paused.
struct Session {
    process: Box<dyn VmmProcess>,
    control: ControlChannel,
    consoles: Vec<Arc<ConsoleChannel>>,
    ports: Vec<PortLease>,
    runtime: RuntimeDir,
    sockets: Vec<PathBuf>,
    snapshots: BTreeMap<String, SnapshotInfo>,
    snapshots_stale: bool,
}

/// A virtual machine driven through its hypervisor's control socket.
pub struct Machine {
    id: Uuid,
    name: String,
    config: HostConfig,
    spec: MachineSpec,
    backend: Arc<dyn HypervisorBackend>,
    host_networking: Arc<dyn HostNetworking>,
    state: AtomicU8,
    crashed: AtomicBool,
    last_exit: Mutex<Option<VmmExit>>,
    consoles: Mutex<Vec<Arc<ConsoleChannel>>>,
    session: tokio::sync::Mutex<Option<Session>>,
}

impl Machine {
    pub fn builder(config: &HostConfig) -> MachineBuilder {
        MachineBuilder::new(config)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Short name used for the hypervisor process and in logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> MachineState {
        MachineState::from_atomic(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: MachineState) {
        self.state.store(state.as_atomic(), Ordering::SeqCst);
    }

    /// True when the last run ended because the hypervisor exited on its own.
    pub fn is_crashed(&self) -> bool {
        self.crashed.load(Ordering::SeqCst)
    }

    /// How the hypervisor process of the last run exited, once it has.
    pub fn last_exit(&self) -> Option<VmmExit> {
        *self.last_exit.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn resources(&self) -> &ResourceConfig {
        &self.spec.resources
    }

    pub fn drives(&self) -> &[Drive] {
        &self.spec.drives
    }

    pub fn adapters(&self) -> &[Adapter] {
        &self.spec.adapters
    }

    fn invalid(&self, operation: &'static str) -> Error {
        Error::InvalidState {
            operation,
            state: self.state().to_string(),
        }
    }

    /// Launches the hypervisor and connects to its control and serial sockets.
    pub async fn start(&self) -> Result<()> {
        let mut slot = self.session.lock().await;
        if slot.is_some() {
            return Err(self.invalid("start"));
        }

        self.crashed.store(false, Ordering::SeqCst);
        *self.last_exit.lock().unwrap_or_else(|e| e.into_inner()) = None;
        self.set_state(MachineState::Starting);
        info!(machine = %self.name, backend = self.backend.name(), "starting machine");

        match self.launch().await {
            Ok(session) => {
                *self.consoles.lock().unwrap_or_else(|e| e.into_inner()) =
                    session.consoles.clone();
                *slot = Some(session);
                self.set_state(MachineState::Running);
                info!(machine = %self.name, "machine running");
                Ok(())
            }
            Err(e) => {
                self.set_state(MachineState::Stopped);
                warn!(machine = %self.name, error = %e, "machine failed to start");
                Err(e)
            }
        }
    }

    async fn launch(&self) -> Result<Session> {
        let runtime = RuntimeDir::create(&self.config, self.spec.runtime_dir.as_deref())?;
        let host = self.host_networking.as_ref();

        let mut ports = Vec::with_capacity(self.spec.adapters.len());
        for adapter in &self.spec.adapters {
            match adapter.acquire_port(host).await {
                Ok(lease) => ports.push(lease),
                Err(e) => {
                    release_ports(host, ports).await;
                    return Err(e.into());
                }
            }
        }

        let spec = match self.launch_spec(runtime.path()).await {
            Ok(spec) => spec,
            Err(e) => {
                release_ports(host, ports).await;
                return Err(e);
            }
        };

        let process = match self.backend.spawn(&spec).await {
            Ok(process) => process,
            Err(e) => {
                release_ports(host, ports).await;
                return Err(e);
            }
        };

        match self.connect(process.as_ref(), &spec).await {
            Ok((control, consoles)) => {
                let mut sockets = spec.serial_sockets.clone();
                sockets.push(spec.control_socket.clone());
                let mut session = Session {
                    process,
                    control,
                    consoles,
                    ports,
                    runtime,
                    sockets,
                    snapshots: BTreeMap::new(),
                    snapshots_stale: true,
                };
                match load_snapshots(&session.control, self.config.command_timeout).await {
                    Ok(known) => {
                        session.snapshots = known;
                        session.snapshots_stale = false;
                    }
                    Err(e) => debug!(machine = %self.name, error = %e, "snapshot listing deferred"),
                }
                Ok(session)
            }
            Err(e) => {
                if let Err(kill) = process.kill().await {
                    debug!(machine = %self.name, error = %kill, "kill after failed start");
                }
                let _ = tokio::time::timeout(KILL_TIMEOUT, process.wait()).await;
                release_ports(host, ports).await;
                Err(e)
            }
        }
    }

    async fn launch_spec(&self, dir: &Path) -> Result<LaunchSpec> {
        let mut drives = Vec::with_capacity(self.spec.drives.len());
        for (i, drive) in self.spec.drives.iter().enumerate() {
            let writable_disk = !drive.is_read_only() && drive.media() == DriveMedia::Disk;
            if self.spec.ephemeral && writable_disk {
                let overlay = dir.join(format!("drive{i}.qcow2"));
                self.backend.create_overlay(drive, &overlay).await?;
                drives.push(DriveAttachment::overlay(drive, &overlay));
            } else {
                drives.push(DriveAttachment::direct(drive));
            }
        }

        let nics = self
            .spec
            .adapters
            .iter()
            .map(|a| NicAttachment {
                tap: a.tap_name(),
                mac: a.mac(),
                model: a.model().to_string(),
            })
            .collect();

        Ok(LaunchSpec {
            name: self.name.clone(),
            resources: self.spec.resources.clone(),
            drives,
            nics,
            control_socket: dir.join("qmp.sock"),
            serial_sockets: (0..=self.spec.extra_serials)
                .map(|i| dir.join(format!("serial{i}.sock")))
                .collect(),
            log_file: dir.join("vmm.log"),
            accel: self.config.accel.clone(),
            kernel: self.spec.kernel.clone(),
            kernel_append: self.spec.kernel_append.clone(),
            boot_order: self.spec.boot_order.clone(),
            extra_args: self.spec.extra_args.clone(),
        })
    }

    async fn connect(
        &self,
        process: &dyn VmmProcess,
        spec: &LaunchSpec,
    ) -> Result<(ControlChannel, Vec<Arc<ConsoleChannel>>)> {
        let deadline = Instant::now() + self.config.connect_timeout;

        let stream = connect_socket(process, &spec.control_socket, deadline, &spec.log_file).await?;
        let remaining = deadline.saturating_duration_since(Instant::now());
        let control = match ControlChannel::connect(stream, remaining).await {
            Ok(control) => control,
            Err(e) => {
                let exit = process.try_wait().await.ok().flatten();
                return Err(startup_failure(&format!("control handshake: {e}"), exit, &spec.log_file));
            }
        };

        let mut consoles = Vec::with_capacity(spec.serial_sockets.len());
        for (i, socket) in spec.serial_sockets.iter().enumerate() {
            let stream = connect_socket(process, socket, deadline, &spec.log_file).await?;
            let log = socket.with_file_name(format!("serial_{i}.log"));
            let console =
                ConsoleChannel::open(i, stream, self.config.console_buffer_limit, Some(&log))
                    .await?;
            consoles.push(Arc::new(console));
        }

        Ok((control, consoles))
    }

    /// Checks that a session exists, that its process is still alive and
    /// that the machine is in one of `allowed`.
    async fn live<'a>(
        &self,
        slot: &'a mut Option<Session>,
        operation: &'static str,
        allowed: &[MachineState],
    ) -> Result<&'a mut Session> {
        let exited = match slot.as_mut() {
            None => return Err(self.invalid(operation)),
            Some(session) => session.process.try_wait().await?,
        };
        if let Some(exit) = exited {
            return Err(self.crashed(slot, exit).await);
        }
        if !allowed.contains(&self.state()) {
            return Err(self.invalid(operation));
        }
        slot.as_mut().ok_or_else(|| self.invalid(operation))
    }

    /// Records an unexpected exit and releases everything the session held.
    async fn crashed(&self, slot: &mut Option<Session>, exit: VmmExit) -> Error {
        warn!(machine = %self.name, code = ?exit.code, "hypervisor exited unexpectedly");
        self.crashed.store(true, Ordering::SeqCst);
        if let Some(session) = slot.take() {
            let (errors, _) = self.shutdown_session(session, false).await;
            for e in errors {
                warn!(machine = %self.name, error = %e, "cleanup after crash");
            }
        }
        *self.last_exit.lock().unwrap_or_else(|e| e.into_inner()) = Some(exit);
        self.set_state(MachineState::Stopped);
        Error::ProcessExited {
            exit_code: exit.code,
        }
    }

    /// The control channel dropped: the command's outcome is unknown, so
    /// the machine is forced down rather than guessed about.
    async fn lost_control(&self, slot: &mut Option<Session>) -> Error {
        let exit = match slot.as_ref() {
            Some(session) => {
                if let Err(e) = session.process.kill().await {
                    debug!(machine = %self.name, error = %e, "kill after control loss");
                }
                match tokio::time::timeout(KILL_TIMEOUT, session.process.wait()).await {
                    Ok(Ok(exit)) => exit,
                    _ => VmmExit { code: None },
                }
            }
            None => VmmExit { code: None },
        };
        self.crashed(slot, exit).await
    }

    async fn command(
        &self,
        slot: &mut Option<Session>,
        command: &str,
    ) -> Result<serde_json::Value> {
        let Some(session) = slot.as_ref() else {
            return Err(Error::ProcessExited { exit_code: None });
        };
        match session
            .control
            .execute(command, None, self.config.command_timeout)
            .await
        {
            Err(e) if e.is_process_exit() => Err(self.lost_control(slot).await),
            other => other,
        }
    }

    async fn monitor(&self, slot: &mut Option<Session>, command_line: &str) -> Result<String> {
        let Some(session) = slot.as_ref() else {
            return Err(Error::ProcessExited { exit_code: None });
        };
        match session
            .control
            .human_monitor(command_line, self.config.command_timeout)
            .await
        {
            Err(e) if e.is_process_exit() => Err(self.lost_control(slot).await),
            other => other,
        }
    }

    /// Runs a snapshot command, mapping failures onto [`SnapshotFailure`].
    async fn snapshot_command(
        &self,
        slot: &mut Option<Session>,
        name: &str,
        command_line: String,
    ) -> Result<()> {
        match self.monitor(slot, &command_line).await {
            Ok(output) => match snapshot::monitor_error(&output) {
                Some(reason) => Err(Error::snapshot(name, SnapshotFailure::Rejected(reason))),
                None => Ok(()),
            },
            Err(Error::Timeout(_)) => {
                if let Some(session) = slot.as_mut() {
                    session.snapshots_stale = true;
                }
                Err(Error::snapshot(name, SnapshotFailure::TimedOut))
            }
            Err(Error::Control(reason)) => {
                Err(Error::snapshot(name, SnapshotFailure::Rejected(reason)))
            }
            Err(e) => Err(e),
        }
    }

    async fn refresh_snapshots(&self, slot: &mut Option<Session>) -> Result<()> {
        let output = self.monitor(slot, "info snapshots").await?;
        if let Some(session) = slot.as_mut() {
            session.snapshots = snapshot::parse_snapshot_table(&output)
                .into_iter()
                .map(|s| (s.name.clone(), s))
                .collect();
            session.snapshots_stale = false;
        }
        Ok(())
    }

    async fn refresh_if_stale(&self, slot: &mut Option<Session>) -> Result<()> {
        if slot.as_ref().is_some_and(|s| s.snapshots_stale) {
            self.refresh_snapshots(slot).await?;
        }
        Ok(())
    }

    fn is_known(slot: &Option<Session>, name: &str) -> bool {
        slot.as_ref()
            .is_some_and(|s| s.snapshots.contains_key(name))
    }

    /// Saves memory and drive state under `name`.
    ///
    /// Valid while running. Fails with [`SnapshotFailure::AlreadyExists`]
    /// when the name is taken; the machine is unchanged on failure.
    pub async fn take_snapshot(&self, name: &str) -> Result<SnapshotInfo> {
        validate_snapshot_name(name)?;
        let mut slot = self.session.lock().await;
        self.live(&mut slot, "take snapshot", &[MachineState::Running])
            .await?;
        self.refresh_if_stale(&mut slot).await?;
        if Self::is_known(&slot, name) {
            return Err(Error::snapshot(name, SnapshotFailure::AlreadyExists));
        }

        debug!(machine = %self.name, snapshot = name, "taking snapshot");
        self.snapshot_command(&mut slot, name, format!("savevm {name}"))
            .await?;

        if let Err(e) = self.refresh_snapshots(&mut slot).await {
            if e.is_process_exit() {
                return Err(e);
            }
            debug!(machine = %self.name, error = %e, "snapshot listing after save failed");
        }
        let info = match slot.as_mut() {
            Some(session) => session
                .snapshots
                .entry(name.to_string())
                .or_insert_with(|| SnapshotInfo::named(name))
                .clone(),
            None => return Err(Error::ProcessExited { exit_code: None }),
        };
        info!(machine = %self.name, snapshot = name, "took snapshot");
        Ok(info)
    }

    /// Restores memory and drive state saved under `name`.
    ///
    /// Valid while running or paused. Adapters and their network bindings
    /// are host state and are left as they are.
    pub async fn revert_snapshot(&self, name: &str) -> Result<()> {
        validate_snapshot_name(name)?;
        let mut slot = self.session.lock().await;
        self.live(
            &mut slot,
            "revert snapshot",
            &[MachineState::Running, MachineState::Paused],
        )
        .await?;
        self.refresh_if_stale(&mut slot).await?;
        if !Self::is_known(&slot, name) {
            return Err(Error::snapshot(name, SnapshotFailure::NotFound));
        }

        self.snapshot_command(&mut slot, name, format!("loadvm {name}"))
            .await?;
        info!(machine = %self.name, snapshot = name, "reverted to snapshot");
        Ok(())
    }

    pub async fn delete_snapshot(&self, name: &str) -> Result<()> {
        validate_snapshot_name(name)?;
        let mut slot = self.session.lock().await;
        self.live(
            &mut slot,
            "delete snapshot",
            &[MachineState::Running, MachineState::Paused],
        )
        .await?;
        self.refresh_if_stale(&mut slot).await?;
        if !Self::is_known(&slot, name) {
            return Err(Error::snapshot(name, SnapshotFailure::NotFound));
        }

        self.snapshot_command(&mut slot, name, format!("delvm {name}"))
            .await?;
        if let Some(session) = slot.as_mut() {
            session.snapshots.remove(name);
        }
        info!(machine = %self.name, snapshot = name, "deleted snapshot");
        Ok(())
    }

    /// Lists the snapshots the hypervisor reports.
    pub async fn snapshots(&self) -> Result<Vec<SnapshotInfo>> {
        let mut slot = self.session.lock().await;
        self.live(
            &mut slot,
            "list snapshots",
            &[MachineState::Running, MachineState::Paused],
        )
        .await?;
        self.refresh_snapshots(&mut slot).await?;
        Ok(slot
            .as_ref()
            .map(|s| s.snapshots.values().cloned().collect())
            .unwrap_or_default())
    }

    pub async fn has_snapshot(&self, name: &str) -> Result<bool> {
        let mut slot = self.session.lock().await;
        self.live(
            &mut slot,
            "list snapshots",
            &[MachineState::Running, MachineState::Paused],
        )
        .await?;
        self.refresh_if_stale(&mut slot).await?;
        Ok(Self::is_known(&slot, name))
    }

    pub async fn pause(&self) -> Result<()> {
        let mut slot = self.session.lock().await;
        self.live(&mut slot, "pause", &[MachineState::Running])
            .await?;
        self.command(&mut slot, "stop").await?;
        self.set_state(MachineState::Paused);
        info!(machine = %self.name, "machine paused");
        Ok(())
    }

    pub async fn resume(&self) -> Result<()> {
        let mut slot = self.session.lock().await;
        self.live(&mut slot, "resume", &[MachineState::Paused])
            .await?;
        self.command(&mut slot, "cont").await?;
        self.set_state(MachineState::Running);
        info!(machine = %self.name, "machine resumed");
        Ok(())
    }

    /// Asks the hypervisor for the guest's run state.
    pub async fn query_status(&self) -> Result<RunStatus> {
        let mut slot = self.session.lock().await;
        self.live(
            &mut slot,
            "query status",
            &[MachineState::Running, MachineState::Paused],
        )
        .await?;
        let value = self.command(&mut slot, "query-status").await?;
        serde_json::from_value(value).map_err(|e| Error::Control(format!("query-status: {e}")))
    }

    /// The first serial port.
    pub fn console(&self) -> Result<Arc<ConsoleChannel>> {
        self.serial(0)
    }

    /// Serial port `index`; 0 is the console, extra ports follow.
    pub fn serial(&self, index: usize) -> Result<Arc<ConsoleChannel>> {
        let consoles = self.consoles.lock().unwrap_or_else(|e| e.into_inner());
        if consoles.is_empty() {
            return Err(self.invalid("open console"));
        }
        consoles.get(index).cloned().ok_or_else(|| {
            Error::InvalidConfig(format!(
                "serial {index} does not exist ({} configured)",
                consoles.len()
            ))
        })
    }

    /// Shuts the guest down through the control channel, killing the
    /// hypervisor if it has not exited within the shutdown timeout.
    /// Does nothing when already stopped.
    pub async fn stop(&self) -> Result<()> {
        let mut slot = self.session.lock().await;
        let Some(session) = slot.as_ref() else {
            return Ok(());
        };
        if let Some(exit) = session.process.try_wait().await? {
            return Err(self.crashed(&mut slot, exit).await);
        }

        let request = match self.state() {
            MachineState::Paused => "quit",
            _ => "system_powerdown",
        };
        info!(machine = %self.name, request, "stopping machine");
        if let Err(e) = session
            .control
            .execute(request, None, self.config.shutdown_timeout)
            .await
        {
            debug!(machine = %self.name, error = %e, "shutdown request failed");
        }

        let grace = self.config.shutdown_timeout;
        if tokio::time::timeout(grace, session.process.wait())
            .await
            .is_err()
        {
            warn!(machine = %self.name, ?grace, "guest did not shut down, terminating");
            session.process.terminate().await?;
            if tokio::time::timeout(KILL_TIMEOUT, session.process.wait())
                .await
                .is_err()
            {
                session.process.kill().await?;
            }
        }

        self.finish(&mut slot).await
    }

    /// Kills the hypervisor immediately and releases everything the machine
    /// holds. Does nothing when already stopped.
    pub async fn terminate(&self) -> Result<()> {
        let mut slot = self.session.lock().await;
        if slot.is_none() {
            return Ok(());
        }
        info!(machine = %self.name, "terminating machine");
        self.finish(&mut slot).await
    }

    async fn finish(&self, slot: &mut Option<Session>) -> Result<()> {
        let Some(session) = slot.take() else {
            return Ok(());
        };
        let (errors, exit) = self.shutdown_session(session, true).await;
        *self.last_exit.lock().unwrap_or_else(|e| e.into_inner()) = exit;
        self.set_state(MachineState::Stopped);
        info!(machine = %self.name, "machine stopped");

        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Teardown(errors))
        }
    }

    async fn shutdown_session(&self, session: Session, kill: bool) -> (Vec<String>, Option<VmmExit>) {
        self.consoles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        shutdown_session(session, self.host_networking.as_ref(), kill).await
    }

    /// Starts the machine, runs `body` and terminates the machine whatever
    /// the outcome. An error from `body` takes precedence over cleanup
    /// errors, which are then only logged.
    pub async fn run<F, T>(self, body: F) -> Result<T>
    where
        F: AsyncFnOnce(&Machine) -> Result<T>,
    {
        self.start().await?;
        let outcome = body(&self).await;
        let cleanup = self.terminate().await;
        match (outcome, cleanup) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(cleanup)) => {
                warn!(machine = %self.name, error = %cleanup, "cleanup after failure");
                Err(e)
            }
        }
    }
}

impl fmt::Debug for Machine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Machine")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("resources", &self.spec.resources)
            .field("drives", &self.spec.drives.len())
            .field("adapters", &self.spec.adapters)
            .finish_non_exhaustive()
    }
}

impl Drop for Machine {
    fn drop(&mut self) {
        let Some(session) = self.session.get_mut().take() else {
            return;
        };
        warn!(machine = %self.name, "machine dropped while running, terminating");
        let host = self.host_networking.clone();
        let name = self.name.clone();

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(machine = %name, "no runtime available, hypervisor left to kill_on_drop");
            return;
        };

        let cleanup = async move {
            let (errors, _) = shutdown_session(session, host.as_ref(), true).await;
            for e in errors {
                warn!(machine = %name, error = %e, "cleanup on drop");
            }
        };
        match runtime.runtime_flavor() {
            tokio::runtime::RuntimeFlavor::CurrentThread => {
                runtime.spawn(cleanup);
            }
            _ => {
                // block_on cannot be called from within an async context.
                std::thread::scope(|s| {
                    s.spawn(move || runtime.block_on(cleanup));
                });
            }
        }
    }
}

async fn shutdown_session(
    session: Session,
    host: &dyn HostNetworking,
    kill: bool,
) -> (Vec<String>, Option<VmmExit>) {
    let mut errors = Vec::new();

    for console in &session.consoles {
        console.close();
    }
    drop(session.control);

    let running = matches!(session.process.try_wait().await, Ok(None));
    if kill && running {
        if let Err(e) = session.process.kill().await {
            errors.push(format!("kill hypervisor: {e}"));
        }
    }
    let exit = match tokio::time::timeout(KILL_TIMEOUT, session.process.wait()).await {
        Ok(Ok(exit)) => Some(exit),
        Ok(Err(e)) => {
            errors.push(format!("wait for hypervisor: {e}"));
            None
        }
        Err(_) => {
            errors.push("hypervisor did not exit after kill".to_string());
            None
        }
    };

    for lease in session.ports {
        let mac = lease.adapter().mac();
        if let Err(e) = lease.release(host).await {
            errors.push(format!("release port of {mac}: {e}"));
        }
    }

    if let Err(e) = session.runtime.cleanup(&session.sockets) {
        errors.push(format!("remove runtime directory: {e}"));
    }
    (errors, exit)
}

async fn release_ports(host: &dyn HostNetworking, ports: Vec<PortLease>) {
    for lease in ports {
        let mac = lease.adapter().mac();
        if let Err(e) = lease.release(host).await {
            warn!(%mac, error = %e, "port rollback failed");
        }
    }
}

async fn load_snapshots(
    control: &ControlChannel,
    timeout: Duration,
) -> Result<BTreeMap<String, SnapshotInfo>> {
    let output = control.human_monitor("info snapshots", timeout).await?;
    Ok(snapshot::parse_snapshot_table(&output)
        .into_iter()
        .map(|s| (s.name.clone(), s))
        .collect())
}

fn validate_snapshot_name(name: &str) -> Result<()> {
    if snapshot::is_valid_name(name) {
        Ok(())
    } else {
        Err(Error::InvalidConfig(format!("invalid snapshot name '{name}'")))
    }
}

async fn connect_socket(
    process: &dyn VmmProcess,
    path: &Path,
    deadline: Instant,
    log: &Path,
) -> Result<ChannelStream> {
    let mut backoff = Duration::from_millis(10);
    loop {
        if let Some(exit) = process.try_wait().await? {
            return Err(startup_failure(
                &format!("hypervisor exited before {} was ready", path.display()),
                Some(exit),
                log,
            ));
        }

        match UnixStream::connect(path).await {
            Ok(stream) => return Ok(Box::new(stream)),
            Err(e) => {
                let now = Instant::now();
                if now >= deadline {
                    return Err(startup_failure(
                        &format!("{} not reachable: {e}", path.display()),
                        None,
                        log,
                    ));
                }
                tokio::time::sleep(backoff.min(deadline - now)).await;
                backoff = (backoff * 2).min(MAX_CONNECT_BACKOFF);
            }
        }
    }
}

fn startup_failure(reason: &str, exit: Option<VmmExit>, log: &Path) -> Error {
    let mut message = reason.to_string();
    if let Some(exit) = exit {
        message.push_str(&format!(" (exit code {:?})", exit.code));
    }
    let tail = log_tail(log);
    if !tail.is_empty() {
        message.push_str(": ");
        message.push_str(&tail);
    }
    Error::StartupFailed(message)
}

fn log_tail(path: &Path) -> String {
    let Ok(contents) = std::fs::read_to_string(path) else {
        return String::new();
    };
    let lines: Vec<&str> = contents.lines().filter(|l| !l.trim().is_empty()).collect();
    lines[lines.len().saturating_sub(LOG_TAIL_LINES)..].join(" | ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> HostConfig {
        HostConfig::default()
    }

    #[test]
    fn state_round_trips_through_atomic() {
        for state in [
            MachineState::Stopped,
            MachineState::Starting,
            MachineState::Running,
            MachineState::Paused,
        ] {
            assert_eq!(MachineState::from_atomic(state.as_atomic()), state);
        }
        assert_eq!(MachineState::Paused.to_string(), "paused");
    }

    #[test]
    fn builder_rejects_bad_resources() {
        let err = Machine::builder(&config()).cpus(0).build().unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
        let err = Machine::builder(&config()).memory_mib(0).build().unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn builder_rejects_duplicate_adapter() {
        let adapter = Adapter::parse("52:54:00:00:30:01").unwrap();
        let err = Machine::builder(&config())
            .adapter(adapter.clone())
            .adapter(adapter)
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn builder_checks_boot_options() {
        let err = Machine::builder(&config())
            .kernel_append("console=ttyS0")
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("requires a kernel"));

        let err = Machine::builder(&config())
            .kernel("/nonexistent/vmlinuz")
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));

        let err = Machine::builder(&config())
            .boot_order("d c")
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn new_machine_is_stopped() {
        let machine = Machine::builder(&config()).cpus(2).build().unwrap();
        assert_eq!(machine.state(), MachineState::Stopped);
        assert!(!machine.is_crashed());
        assert!(machine.name().starts_with("weaver-"));
        assert!(matches!(
            machine.console(),
            Err(Error::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn operations_require_a_running_machine() {
        let machine = Machine::builder(&config()).build().unwrap();
        let err = machine.take_snapshot("boot").await.unwrap_err();
        assert_eq!(err.to_string(), "cannot take snapshot while machine is stopped");
        assert!(machine.pause().await.is_err());
        assert!(machine.stop().await.is_ok());
        assert!(machine.terminate().await.is_ok());
    }

    #[tokio::test]
    async fn snapshot_names_are_validated_first() {
        let machine = Machine::builder(&config()).build().unwrap();
        let err = machine.take_snapshot("two words").await.unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn log_tail_keeps_last_lines() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("vmm.log");
        std::fs::write(&log, "a\nb\n\nc\nd\ne\nf\n").unwrap();
        assert_eq!(log_tail(&log), "b | c | d | e | f");
        assert_eq!(log_tail(&dir.path().join("missing.log")), "");
    }
}
