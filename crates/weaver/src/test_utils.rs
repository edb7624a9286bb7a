//! An in-process hypervisor for tests.
//!
//! [`FakeBackend`] implements [`HypervisorBackend`] without QEMU: `spawn`
//! binds the control and serial sockets of the launch spec itself and
//! serves them from tasks on the current runtime. The control socket
//! speaks enough QMP for [`Machine`](crate::Machine) (greeting, capability
//! negotiation, run state, power-down and the snapshot monitor commands),
//! backed by a small key/value "guest memory" that snapshots capture and
//! restore. Serial ports echo their input and replay queued output.

use crate::backend::{HypervisorBackend, LaunchSpec, VmmExit, VmmProcess};
use async_trait::async_trait;
use futures::prelude::*;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixListener;
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LinesCodec};
use weaver_core::{Drive, Error, Result};

const POWERDOWN_DELAY: Duration = Duration::from_millis(20);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// How spawned fake machines behave.
#[derive(Debug, Clone, Default)]
struct Behavior {
    exit_on_start: Option<i32>,
    never_listen: bool,
    ignore_powerdown: bool,
    fail_overlay: Option<String>,
    snapshot_error: Option<String>,
    control_delay: Duration,
    snapshot_delay: Duration,
    boot_output: Vec<u8>,
}

#[derive(Default)]
struct BackendState {
    behavior: Behavior,
    vms: Vec<FakeVm>,
    overlays: Vec<(PathBuf, PathBuf)>,
}

/// A [`HypervisorBackend`] whose machines live inside the test process.
///
/// Clones share state, so a test can keep one handle and inspect the
/// machines that a [`Machine`](crate::Machine) spawned through another.
#[derive(Clone, Default)]
pub struct FakeBackend {
    state: Arc<Mutex<BackendState>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn configure(self, f: impl FnOnce(&mut Behavior)) -> Self {
        f(&mut lock(&self.state).behavior);
        self
    }

    /// The process exits with `code` right after spawning, before any socket
    /// is bound.
    pub fn exit_on_start(self, code: i32) -> Self {
        self.configure(|b| b.exit_on_start = Some(code))
    }

    /// The process keeps running but never binds its sockets.
    pub fn never_listen(self) -> Self {
        self.configure(|b| b.never_listen = true)
    }

    /// `system_powerdown` is acknowledged but the guest keeps running.
    pub fn ignore_powerdown(self) -> Self {
        self.configure(|b| b.ignore_powerdown = true)
    }

    pub fn fail_overlay(self, message: impl Into<String>) -> Self {
        let message = message.into();
        self.configure(|b| b.fail_overlay = Some(message))
    }

    /// `savevm` prints `message` instead of saving.
    pub fn snapshot_error(self, message: impl Into<String>) -> Self {
        let message = message.into();
        self.configure(|b| b.snapshot_error = Some(message))
    }

    /// Delays every control reply.
    pub fn control_delay(self, delay: Duration) -> Self {
        self.configure(|b| b.control_delay = delay)
    }

    /// Delays `savevm`, `loadvm` and `delvm` on top of the control delay.
    pub fn snapshot_delay(self, delay: Duration) -> Self {
        self.configure(|b| b.snapshot_delay = delay)
    }

    /// Output written to the first serial port as soon as a client connects.
    pub fn boot_output(self, output: impl AsRef<[u8]>) -> Self {
        let output = output.as_ref().to_vec();
        self.configure(|b| b.boot_output = output)
    }

    /// Every machine spawned so far, oldest first.
    pub fn vms(&self) -> Vec<FakeVm> {
        lock(&self.state).vms.clone()
    }

    pub fn last_vm(&self) -> Option<FakeVm> {
        lock(&self.state).vms.last().cloned()
    }

    /// `(backing file, overlay)` pairs created so far.
    pub fn overlays(&self) -> Vec<(PathBuf, PathBuf)> {
        lock(&self.state).overlays.clone()
    }
}

#[async_trait]
impl HypervisorBackend for FakeBackend {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn is_available(&self) -> bool {
        true
    }

    async fn create_overlay(&self, drive: &Drive, overlay: &Path) -> Result<()> {
        if let Some(message) = lock(&self.state).behavior.fail_overlay.clone() {
            return Err(Error::StartupFailed(message));
        }
        std::fs::File::create(overlay)?;
        lock(&self.state)
            .overlays
            .push((drive.path().to_path_buf(), overlay.to_path_buf()));
        Ok(())
    }

    async fn spawn(&self, spec: &LaunchSpec) -> Result<Box<dyn VmmProcess>> {
        let behavior = lock(&self.state).behavior.clone();
        let (vm, outputs) = FakeVm::new(spec.clone(), behavior.clone());
        lock(&self.state).vms.push(vm.clone());

        if let Some(code) = behavior.exit_on_start {
            std::fs::write(
                &spec.log_file,
                "fake: could not open disk image: Permission denied\n",
            )?;
            vm.exit(Some(code));
        } else if !behavior.never_listen {
            std::fs::write(&spec.log_file, "")?;
            let control = UnixListener::bind(&spec.control_socket)?;
            let mut tasks = vec![tokio::spawn(serve_control(vm.clone(), control))];
            for ((index, path), output) in spec.serial_sockets.iter().enumerate().zip(outputs) {
                let listener = UnixListener::bind(path)?;
                tasks.push(tokio::spawn(serve_serial(
                    vm.clone(),
                    index,
                    listener,
                    output,
                )));
            }
            lock(&vm.shared.tasks).extend(tasks);
        }

        Ok(Box::new(FakeProcess { vm }))
    }
}

struct Trigger {
    pattern: Vec<u8>,
    reply: Vec<u8>,
}

#[derive(Default)]
struct Serial {
    input: Vec<u8>,
    unmatched: Vec<u8>,
    triggers: Vec<Trigger>,
}

#[derive(Default)]
struct Guest {
    running: bool,
    memory: BTreeMap<String, String>,
    snapshots: BTreeMap<String, BTreeMap<String, String>>,
}

struct Shared {
    spec: LaunchSpec,
    behavior: Behavior,
    exit: watch::Sender<Option<VmmExit>>,
    guest: Mutex<Guest>,
    commands: Mutex<Vec<String>>,
    monitor: Mutex<Vec<String>>,
    signals: Mutex<Vec<&'static str>>,
    serials: Mutex<Vec<Serial>>,
    outputs: Vec<mpsc::UnboundedSender<Vec<u8>>>,
    drop_control: Notify,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// One machine spawned by a [`FakeBackend`].
#[derive(Clone)]
pub struct FakeVm {
    shared: Arc<Shared>,
}

impl FakeVm {
    fn new(spec: LaunchSpec, behavior: Behavior) -> (Self, Vec<mpsc::UnboundedReceiver<Vec<u8>>>) {
        let (senders, receivers): (Vec<_>, Vec<_>) = spec
            .serial_sockets
            .iter()
            .map(|_| mpsc::unbounded_channel())
            .unzip();
        if let Some(console) = senders.first() {
            if !behavior.boot_output.is_empty() {
                let _ = console.send(behavior.boot_output.clone());
            }
        }
        let serials = spec.serial_sockets.iter().map(|_| Serial::default()).collect();
        let (exit, _) = watch::channel(None);

        let vm = Self {
            shared: Arc::new(Shared {
                spec,
                behavior,
                exit,
                guest: Mutex::new(Guest {
                    running: true,
                    ..Guest::default()
                }),
                commands: Mutex::new(Vec::new()),
                monitor: Mutex::new(Vec::new()),
                signals: Mutex::new(Vec::new()),
                serials: Mutex::new(serials),
                outputs: senders,
                drop_control: Notify::new(),
                tasks: Mutex::new(Vec::new()),
            }),
        };
        (vm, receivers)
    }

    /// The launch spec the machine was spawned with.
    pub fn spec(&self) -> &LaunchSpec {
        &self.shared.spec
    }

    /// QMP commands received, in order.
    pub fn commands(&self) -> Vec<String> {
        lock(&self.shared.commands).clone()
    }

    /// Human monitor command lines received, in order.
    pub fn monitor_commands(&self) -> Vec<String> {
        lock(&self.shared.monitor).clone()
    }

    /// Signals delivered through [`VmmProcess::terminate`] and
    /// [`VmmProcess::kill`].
    pub fn signals(&self) -> Vec<&'static str> {
        lock(&self.shared.signals).clone()
    }

    /// Queues output on serial port `index`.
    pub fn emit(&self, index: usize, output: impl AsRef<[u8]>) {
        if let Some(sender) = self.shared.outputs.get(index) {
            let _ = sender.send(output.as_ref().to_vec());
        }
    }

    /// Writes `reply` to serial port `index` each time the input received
    /// since the last trigger contains `pattern`.
    pub fn on_input(&self, index: usize, pattern: impl AsRef<[u8]>, reply: impl AsRef<[u8]>) {
        if let Some(serial) = lock(&self.shared.serials).get_mut(index) {
            serial.triggers.push(Trigger {
                pattern: pattern.as_ref().to_vec(),
                reply: reply.as_ref().to_vec(),
            });
        }
    }

    /// Everything written to serial port `index`.
    pub fn input(&self, index: usize) -> Vec<u8> {
        lock(&self.shared.serials)
            .get(index)
            .map(|s| s.input.clone())
            .unwrap_or_default()
    }

    pub fn set_guest_value(&self, key: &str, value: &str) {
        lock(&self.shared.guest)
            .memory
            .insert(key.to_string(), value.to_string());
    }

    pub fn guest_value(&self, key: &str) -> Option<String> {
        lock(&self.shared.guest).memory.get(key).cloned()
    }

    pub fn is_guest_running(&self) -> bool {
        lock(&self.shared.guest).running
    }

    pub fn snapshot_names(&self) -> Vec<String> {
        lock(&self.shared.guest).snapshots.keys().cloned().collect()
    }

    /// Exits the process as if it had crashed.
    pub fn crash(&self, code: i32) {
        self.exit(Some(code));
    }

    /// Closes the control connection while the process keeps running.
    pub fn drop_control(&self) {
        self.shared.drop_control.notify_one();
    }

    pub fn exit_status(&self) -> Option<VmmExit> {
        *self.shared.exit.borrow()
    }

    pub fn has_exited(&self) -> bool {
        self.exit_status().is_some()
    }

    fn exit(&self, code: Option<i32>) {
        let exited = self.shared.exit.send_if_modified(|exit| {
            if exit.is_some() {
                return false;
            }
            *exit = Some(VmmExit { code });
            true
        });
        if exited {
            for task in lock(&self.shared.tasks).drain(..) {
                task.abort();
            }
        }
    }

    fn record_input(&self, index: usize, data: &[u8]) -> Vec<Vec<u8>> {
        let mut serials = lock(&self.shared.serials);
        let Some(serial) = serials.get_mut(index) else {
            return Vec::new();
        };
        serial.input.extend_from_slice(data);
        serial.unmatched.extend_from_slice(data);

        let mut replies = Vec::new();
        for trigger in &serial.triggers {
            if contains(&serial.unmatched, &trigger.pattern) {
                replies.push(trigger.reply.clone());
            }
        }
        if !replies.is_empty() {
            serial.unmatched.clear();
        }
        replies
    }

    fn delay_for(&self, command: &str, arguments: &Value) -> Duration {
        let mut delay = self.shared.behavior.control_delay;
        let line = arguments["command-line"].as_str().unwrap_or_default();
        if command == "human-monitor-command"
            && ["savevm", "loadvm", "delvm"]
                .iter()
                .any(|c| line.starts_with(c))
        {
            delay += self.shared.behavior.snapshot_delay;
        }
        delay
    }

    fn handle(&self, command: &str, arguments: &Value) -> Handled {
        let mut handled = Handled::reply(json!({}));
        match command {
            "qmp_capabilities" => {}
            "query-status" => {
                let running = self.is_guest_running();
                handled = Handled::reply(json!({
                    "status": if running { "running" } else { "paused" },
                    "running": running,
                    "singlestep": false,
                }));
            }
            "stop" => {
                lock(&self.shared.guest).running = false;
                handled.events.push("STOP");
            }
            "cont" => {
                lock(&self.shared.guest).running = true;
                handled.events.push("RESUME");
            }
            "system_powerdown" => {
                handled.events.push("POWERDOWN");
                if !self.shared.behavior.ignore_powerdown {
                    handled.exit = Some((Some(0), POWERDOWN_DELAY));
                }
            }
            "quit" => handled.exit = Some((Some(0), Duration::ZERO)),
            "human-monitor-command" => {
                let line = arguments["command-line"].as_str().unwrap_or_default();
                lock(&self.shared.monitor).push(line.to_string());
                handled = Handled::reply(Value::String(self.monitor(line)));
            }
            other => {
                handled.reply = Err((
                    "CommandNotFound",
                    format!("The command {other} has not been found"),
                ));
            }
        }
        handled
    }

    fn monitor(&self, line: &str) -> String {
        let mut guest = lock(&self.shared.guest);
        let mut words = line.split_whitespace();
        match (words.next(), words.next()) {
            (Some("savevm"), Some(name)) => {
                if let Some(message) = &self.shared.behavior.snapshot_error {
                    return format!("{message}\r\n");
                }
                let memory = guest.memory.clone();
                guest.snapshots.insert(name.to_string(), memory);
                String::new()
            }
            (Some("loadvm"), Some(name)) => match guest.snapshots.get(name).cloned() {
                Some(memory) => {
                    guest.memory = memory;
                    String::new()
                }
                None => missing_snapshot(name),
            },
            (Some("delvm"), Some(name)) => match guest.snapshots.remove(name) {
                Some(_) => String::new(),
                None => missing_snapshot(name),
            },
            (Some("info"), Some("snapshots")) => snapshot_table(guest.snapshots.keys()),
            _ => format!("unknown command: '{line}'\r\n"),
        }
    }
}

fn missing_snapshot(name: &str) -> String {
    format!("Error: Snapshot '{name}' does not exist in one or more devices\r\n")
}

fn snapshot_table<'a>(names: impl ExactSizeIterator<Item = &'a String>) -> String {
    if names.len() == 0 {
        return "There is no snapshot available.\r\n".to_string();
    }
    let mut table = String::from(
        "List of snapshots present on all disks:\r\n\
ID        TAG               VM SIZE                DATE     VM CLOCK     ICOUNT\r\n",
    );
    for name in names {
        table.push_str(&format!(
            "--        {name:<17} 264 MiB 2024-05-01 10:12:44 00:00:15.123\r\n"
        ));
    }
    table
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    !needle.is_empty() && haystack.windows(needle.len()).any(|w| w == needle)
}

struct Handled {
    reply: std::result::Result<Value, (&'static str, String)>,
    events: Vec<&'static str>,
    exit: Option<(Option<i32>, Duration)>,
}

impl Handled {
    fn reply(value: Value) -> Self {
        Self {
            reply: Ok(value),
            events: Vec::new(),
            exit: None,
        }
    }
}

async fn serve_control(vm: FakeVm, listener: UnixListener) {
    let Ok((stream, _)) = listener.accept().await else {
        return;
    };
    let mut framed = Framed::new(stream, LinesCodec::new());
    let greeting = json!({
        "QMP": {
            "version": {
                "qemu": { "major": 8, "minor": 2, "micro": 0 },
                "package": "weaver-fake",
            },
            "capabilities": ["oob"],
        }
    });
    if framed.send(greeting.to_string()).await.is_err() {
        return;
    }

    loop {
        let line = tokio::select! {
            biased;
            _ = vm.shared.drop_control.notified() => return,
            line = framed.next() => line,
        };
        let Some(Ok(line)) = line else {
            return;
        };
        let Ok(request) = serde_json::from_str::<Value>(&line) else {
            continue;
        };
        let command = request["execute"].as_str().unwrap_or_default().to_string();
        let arguments = request.get("arguments").cloned().unwrap_or(Value::Null);
        lock(&vm.shared.commands).push(command.clone());

        let delay = vm.delay_for(&command, &arguments);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let handled = vm.handle(&command, &arguments);
        for event in handled.events {
            let message = json!({
                "event": event,
                "timestamp": { "seconds": 0, "microseconds": 0 },
            });
            if framed.send(message.to_string()).await.is_err() {
                return;
            }
        }
        let mut reply = match handled.reply {
            Ok(value) => json!({ "return": value }),
            Err((class, desc)) => json!({ "error": { "class": class, "desc": desc } }),
        };
        if let Some(id) = request.get("id") {
            reply["id"] = id.clone();
        }
        if framed.send(reply.to_string()).await.is_err() {
            return;
        }

        if let Some((code, delay)) = handled.exit {
            let vm = vm.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                vm.exit(code);
            });
        }
    }
}

async fn serve_serial(
    vm: FakeVm,
    index: usize,
    listener: UnixListener,
    mut output: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    let Ok((stream, _)) = listener.accept().await else {
        return;
    };
    let (mut reader, mut writer) = stream.into_split();
    let mut buf = [0u8; 1024];

    loop {
        tokio::select! {
            data = output.recv() => {
                let Some(data) = data else { return };
                if writer.write_all(&data).await.is_err() {
                    return;
                }
            }
            read = reader.read(&mut buf) => {
                let n = match read {
                    Ok(0) | Err(_) => return,
                    Ok(n) => n,
                };
                let replies = vm.record_input(index, &buf[..n]);
                if writer.write_all(&buf[..n]).await.is_err() {
                    return;
                }
                for reply in replies {
                    if writer.write_all(&reply).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

struct FakeProcess {
    vm: FakeVm,
}

#[async_trait]
impl VmmProcess for FakeProcess {
    fn id(&self) -> Option<u32> {
        None
    }

    async fn try_wait(&self) -> Result<Option<VmmExit>> {
        Ok(self.vm.exit_status())
    }

    async fn wait(&self) -> Result<VmmExit> {
        let mut exit = self.vm.shared.exit.subscribe();
        let status = exit
            .wait_for(Option::is_some)
            .await
            .map_err(|_| Error::Control("fake process state dropped".to_string()))?;
        Ok((*status).unwrap_or(VmmExit { code: None }))
    }

    async fn terminate(&self) -> Result<()> {
        lock(&self.vm.shared.signals).push("SIGTERM");
        self.vm.exit(None);
        Ok(())
    }

    async fn kill(&self) -> Result<()> {
        lock(&self.vm.shared.signals).push("SIGKILL");
        self.vm.exit(None);
        Ok(())
    }
}
