use super::{HypervisorBackend, LaunchSpec, VmmExit, VmmProcess};
use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info};
use weaver_core::{Drive, Error, HostConfig, Result};

pub struct QemuBackend {
    qemu: PathBuf,
    qemu_img: PathBuf,
}

impl QemuBackend {
    pub fn new(qemu: impl Into<PathBuf>, qemu_img: impl Into<PathBuf>) -> Self {
        Self {
            qemu: qemu.into(),
            qemu_img: qemu_img.into(),
        }
    }

    pub fn from_config(config: &HostConfig) -> Self {
        Self::new(&config.qemu, &config.qemu_img)
    }

    pub fn build_args(&self, spec: &LaunchSpec) -> Vec<String> {
        let mut args = vec![
            "-name".to_string(),
            spec.name.clone(),
            "-nodefaults".to_string(),
            "-display".to_string(),
            "none".to_string(),
            "-smp".to_string(),
            spec.resources.cpus.to_string(),
            "-m".to_string(),
            format!("{}M", spec.resources.memory_mib),
        ];

        if let Some(accel) = &spec.accel {
            args.push("-accel".to_string());
            args.push(accel.clone());
        }

        for drive in &spec.drives {
            let mut opts = format!(
                "file={},format={},if={},media={}",
                escape_opt(&drive.file),
                drive.format.as_str(),
                drive.interface.as_str(),
                drive.media.as_str(),
            );
            if let Some(index) = drive.index {
                opts.push_str(&format!(",index={index}"));
            }
            if drive.read_only {
                opts.push_str(",readonly=on");
            }
            args.push("-drive".to_string());
            args.push(opts);
        }

        for (i, nic) in spec.nics.iter().enumerate() {
            args.push("-netdev".to_string());
            args.push(format!(
                "tap,id=net{i},ifname={},script=no,downscript=no",
                nic.tap
            ));
            args.push("-device".to_string());
            args.push(format!("{},netdev=net{i},mac={}", nic.model, nic.mac));
        }

        args.push("-qmp".to_string());
        args.push(format!(
            "unix:{},server=on,wait=off",
            escape_opt(&spec.control_socket)
        ));
        for socket in &spec.serial_sockets {
            args.push("-serial".to_string());
            args.push(format!("unix:{},server=on,wait=off", escape_opt(socket)));
        }

        if let Some(kernel) = &spec.kernel {
            args.push("-kernel".to_string());
            args.push(kernel.display().to_string());
        }
        if let Some(append) = &spec.kernel_append {
            args.push("-append".to_string());
            args.push(append.clone());
        }
        if let Some(order) = &spec.boot_order {
            args.push("-boot".to_string());
            args.push(format!("order={order}"));
        }

        args.extend(spec.extra_args.iter().cloned());
        args
    }
}

/// Option values are comma separated; a literal comma is written twice.
fn escape_opt(path: &Path) -> String {
    path.display().to_string().replace(',', ",,")
}

#[async_trait]
impl HypervisorBackend for QemuBackend {
    fn name(&self) -> &'static str {
        "qemu"
    }

    fn is_available(&self) -> bool {
        which::which(&self.qemu).is_ok()
    }

    async fn create_overlay(&self, drive: &Drive, overlay: &Path) -> Result<()> {
        let backing = std::fs::canonicalize(drive.path())?;
        let output = Command::new(&self.qemu_img)
            .arg("create")
            .args(["-f", "qcow2", "-F", drive.format().as_str(), "-b"])
            .arg(&backing)
            .arg(overlay)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| {
                Error::StartupFailed(format!(
                    "failed to run {}: {e}",
                    self.qemu_img.display()
                ))
            })?;

        if !output.status.success() {
            return Err(Error::StartupFailed(format!(
                "creating overlay for {} failed: {}",
                drive.path().display(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        debug!(backing = %backing.display(), overlay = %overlay.display(), "created overlay");
        Ok(())
    }

    async fn spawn(&self, spec: &LaunchSpec) -> Result<Box<dyn VmmProcess>> {
        let args = self.build_args(spec);
        debug!(qemu = %self.qemu.display(), ?args, "starting hypervisor");

        let log = std::fs::File::create(&spec.log_file)?;
        let child = Command::new(&self.qemu)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(log))
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::StartupFailed(format!("failed to spawn {}: {e}", self.qemu.display()))
            })?;

        let pid = child.id();
        info!(pid, name = %spec.name, "hypervisor started");
        Ok(Box::new(QemuProcess {
            child: Mutex::new(child),
            pid,
        }))
    }
}

struct QemuProcess {
    child: Mutex<Child>,
    pid: Option<u32>,
}

fn exit_of(status: std::process::ExitStatus) -> VmmExit {
    VmmExit {
        code: status.code(),
    }
}

#[async_trait]
impl VmmProcess for QemuProcess {
    fn id(&self) -> Option<u32> {
        self.pid
    }

    async fn try_wait(&self) -> Result<Option<VmmExit>> {
        let mut child = self.child.lock().await;
        Ok(child.try_wait()?.map(exit_of))
    }

    async fn wait(&self) -> Result<VmmExit> {
        let mut child = self.child.lock().await;
        Ok(exit_of(child.wait().await?))
    }

    async fn terminate(&self) -> Result<()> {
        let Some(pid) = self.pid else {
            return Ok(());
        };
        let pid = i32::try_from(pid)
            .map_err(|_| Error::Control(format!("pid {pid} out of range")))?;
        match kill(Pid::from_raw(pid), Signal::SIGTERM) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(std::io::Error::from(e).into()),
        }
    }

    async fn kill(&self) -> Result<()> {
        let mut child = self.child.lock().await;
        match child.start_kill() {
            Ok(()) => Ok(()),
            // Already reaped.
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DriveAttachment, NicAttachment};
    use weaver_core::{DriveInterface, DriveMedia, ImageFormat, ResourceConfig};

    fn spec() -> LaunchSpec {
        LaunchSpec {
            name: "weaver-test".to_string(),
            resources: ResourceConfig {
                cpus: 2,
                memory_mib: 4096,
            },
            drives: Vec::new(),
            nics: Vec::new(),
            control_socket: PathBuf::from("/run/w/qmp.sock"),
            serial_sockets: vec![PathBuf::from("/run/w/serial0.sock")],
            log_file: PathBuf::from("/run/w/vmm.log"),
            accel: Some("kvm".to_string()),
            kernel: None,
            kernel_append: None,
            boot_order: None,
            extra_args: Vec::new(),
        }
    }

    fn backend() -> QemuBackend {
        QemuBackend::new("qemu-system-x86_64", "qemu-img")
    }

    fn value_after<'a>(args: &'a [String], flag: &str) -> Vec<&'a str> {
        args.windows(2)
            .filter(|w| w[0] == flag)
            .map(|w| w[1].as_str())
            .collect()
    }

    #[test]
    fn encodes_resources_and_channels() {
        let args = backend().build_args(&spec());
        assert_eq!(value_after(&args, "-smp"), ["2"]);
        assert_eq!(value_after(&args, "-m"), ["4096M"]);
        assert_eq!(value_after(&args, "-accel"), ["kvm"]);
        assert_eq!(
            value_after(&args, "-qmp"),
            ["unix:/run/w/qmp.sock,server=on,wait=off"]
        );
        assert_eq!(
            value_after(&args, "-serial"),
            ["unix:/run/w/serial0.sock,server=on,wait=off"]
        );
        assert!(args.contains(&"-nodefaults".to_string()));
    }

    #[test]
    fn encodes_drives() {
        let mut spec = spec();
        spec.drives = vec![
            DriveAttachment {
                file: PathBuf::from("/images/root,1.qcow2"),
                format: ImageFormat::Qcow2,
                interface: DriveInterface::Virtio,
                media: DriveMedia::Disk,
                index: None,
                read_only: false,
            },
            DriveAttachment {
                file: PathBuf::from("/images/seed.img"),
                format: ImageFormat::Raw,
                interface: DriveInterface::Ide,
                media: DriveMedia::Cdrom,
                index: Some(2),
                read_only: true,
            },
        ];
        let args = backend().build_args(&spec);
        assert_eq!(
            value_after(&args, "-drive"),
            [
                "file=/images/root,,1.qcow2,format=qcow2,if=virtio,media=disk",
                "file=/images/seed.img,format=raw,if=ide,media=cdrom,index=2,readonly=on",
            ]
        );
    }

    #[test]
    fn encodes_nics_as_taps() {
        let mut spec = spec();
        spec.nics = vec![NicAttachment {
            tap: "wvt-123456".to_string(),
            mac: "52:54:00:12:34:56".parse().unwrap(),
            model: "virtio-net-pci".to_string(),
        }];
        let args = backend().build_args(&spec);
        assert_eq!(
            value_after(&args, "-netdev"),
            ["tap,id=net0,ifname=wvt-123456,script=no,downscript=no"]
        );
        assert_eq!(
            value_after(&args, "-device"),
            ["virtio-net-pci,netdev=net0,mac=52:54:00:12:34:56"]
        );
    }

    #[test]
    fn encodes_boot_options_and_passthrough() {
        let mut spec = spec();
        spec.accel = None;
        spec.kernel = Some(PathBuf::from("/boot/vmlinuz"));
        spec.kernel_append = Some("console=ttyS0".to_string());
        spec.boot_order = Some("dc".to_string());
        spec.extra_args = vec!["-cpu".to_string(), "host".to_string()];

        let args = backend().build_args(&spec);
        assert!(value_after(&args, "-accel").is_empty());
        assert_eq!(value_after(&args, "-kernel"), ["/boot/vmlinuz"]);
        assert_eq!(value_after(&args, "-append"), ["console=ttyS0"]);
        assert_eq!(value_after(&args, "-boot"), ["order=dc"]);
        assert_eq!(&args[args.len() - 2..], ["-cpu", "host"]);
    }

    #[test]
    fn unavailable_binary() {
        let backend = QemuBackend::new("/nonexistent/qemu-system-x86_64", "qemu-img");
        assert!(!backend.is_available());
        assert_eq!(backend.name(), "qemu");
    }
}
