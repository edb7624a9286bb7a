//! The `run` command - boots a machine from flags and/or a machine file.

use crate::config::{DriveEntry, MachineFile};
use crate::console;
use anyhow::Context;
use clap::Args;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use weaver::{Adapter, HostConfig, IpCommand, Machine, Network};

const MAX_CPUS: u32 = 256;
const MAX_MEMORY_MIB: u32 = 1024 * 1024; // 1 TiB

#[derive(Args)]
pub struct RunArgs {
    /// Machine description file (TOML)
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Disk image to attach; repeat for more drives
    #[arg(long, value_parser = parse_existing_file)]
    disk: Vec<PathBuf>,

    /// Number of CPUs (1-256)
    #[arg(long, value_parser = parse_cpus)]
    cpus: Option<u32>,

    /// Memory in MiB (1-1048576)
    #[arg(long, value_parser = parse_memory)]
    memory: Option<u32>,

    /// Guest NIC MAC address; repeat for more adapters
    #[arg(long)]
    mac: Vec<String>,

    /// Existing host bridge to link the adapters to
    #[arg(long)]
    bridge: Option<String>,

    /// Write to the disk images instead of throwaway overlays
    #[arg(long)]
    persistent: bool,

    /// Restore this snapshot right after boot (needs --persistent)
    #[arg(long)]
    restore: Option<String>,

    /// Wait for this console pattern (regular expression) after boot
    #[arg(long)]
    expect: Option<String>,

    /// Seconds to wait for --expect
    #[arg(long, default_value = "60")]
    expect_timeout: u64,

    /// Take a snapshot with this name once booted
    #[arg(long)]
    snapshot: Option<String>,

    /// Don't attach to the console; stop once the steps above are done
    #[arg(long)]
    no_console: bool,
}

/// Flags layered over the machine file.
#[derive(Debug)]
struct Settings {
    file: MachineFile,
    adapters: Vec<Adapter>,
}

impl Settings {
    fn resolve(args: &RunArgs) -> anyhow::Result<Self> {
        let mut file = match &args.config {
            Some(path) => MachineFile::load(path)?,
            None => MachineFile::default(),
        };

        file.cpus = args.cpus.or(file.cpus);
        file.memory_mib = args.memory.or(file.memory_mib);
        if args.persistent {
            file.ephemeral = Some(false);
        }
        if args.bridge.is_some() {
            file.bridge = args.bridge.clone();
        }
        file.drives
            .extend(args.disk.iter().cloned().map(DriveEntry::plain));
        file.adapters.extend(args.mac.iter().cloned());

        if file.drives.is_empty() && file.kernel.is_none() {
            anyhow::bail!("nothing to boot: pass --disk or a machine file with drives or a kernel");
        }
        if args.restore.is_some() && file.ephemeral != Some(false) {
            anyhow::bail!("--restore needs --persistent; overlays start without snapshots");
        }

        let adapters = file
            .adapters
            .iter()
            .map(|mac| Adapter::parse(mac).with_context(|| format!("adapter {mac}")))
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Self { file, adapters })
    }

    fn build(&self, config: &HostConfig, host: Arc<IpCommand>) -> anyhow::Result<Machine> {
        let file = &self.file;
        let mut builder = Machine::builder(config)
            .ephemeral(file.ephemeral.unwrap_or(true))
            .extra_serials(file.extra_serials)
            .adapters(self.adapters.iter().cloned())
            .host_networking(host);
        if let Some(cpus) = file.cpus {
            builder = builder.cpus(cpus);
        }
        if let Some(memory) = file.memory_mib {
            builder = builder.memory_mib(memory);
        }
        for entry in &file.drives {
            builder = builder.drive(entry.to_drive()?);
        }
        if let Some(kernel) = &file.kernel {
            builder = builder.kernel(kernel);
        }
        if let Some(append) = &file.append {
            builder = builder.kernel_append(append);
        }
        if let Some(order) = &file.boot_order {
            builder = builder.boot_order(order);
        }
        for arg in &file.extra_args {
            builder = builder.extra_arg(arg);
        }
        Ok(builder.build()?)
    }
}

pub async fn run(args: RunArgs) -> anyhow::Result<()> {
    let settings = Settings::resolve(&args)?;
    let config = settings.file.host_config();
    config.validate()?;
    let host = Arc::new(IpCommand::from_config(&config));
    let machine = settings.build(&config, host.clone())?;

    let network = match &settings.file.bridge {
        Some(bridge) if !settings.adapters.is_empty() => {
            Some(Network::host(bridge, host.clone(), &config).await?)
        }
        _ => None,
    };

    let outcome = machine
        .run(async |m| {
            eprintln!("Started {} ({})", m.name(), m.id());

            if let Some(network) = &network {
                for adapter in &settings.adapters {
                    network.add_adapter(adapter).await?;
                }
            }
            if let Some(name) = &args.restore {
                m.revert_snapshot(name).await?;
                eprintln!("Restored snapshot '{name}'");
            }
            if let Some(pattern) = &args.expect {
                let timeout = Duration::from_secs(args.expect_timeout);
                m.console()?.expect(pattern, timeout).await?;
                eprintln!("Console matched '{pattern}'");
            }
            if let Some(name) = &args.snapshot {
                m.take_snapshot(name).await?;
                eprintln!("Took snapshot '{name}'");
            }

            if !args.no_console {
                let console = m.console()?;
                console::attach(&console)
                    .await
                    .map_err(|e| weaver::Error::Control(format!("console: {e}")))?;
            }
            Ok(())
        })
        .await;

    if let Some(network) = network {
        if let Err(e) = network.teardown().await {
            tracing::warn!(error = %e, "network teardown failed");
        }
    }
    outcome?;
    Ok(())
}

fn parse_cpus(s: &str) -> Result<u32, String> {
    let cpus: u32 = s
        .parse()
        .map_err(|_| format!("'{s}' is not a valid number"))?;
    if cpus == 0 {
        return Err("cpus must be at least 1".to_string());
    }
    if cpus > MAX_CPUS {
        return Err(format!("cpus cannot exceed {MAX_CPUS}"));
    }
    Ok(cpus)
}

fn parse_memory(s: &str) -> Result<u32, String> {
    let memory: u32 = s
        .parse()
        .map_err(|_| format!("'{s}' is not a valid number"))?;
    if memory == 0 {
        return Err("memory must be at least 1 MiB".to_string());
    }
    if memory > MAX_MEMORY_MIB {
        return Err(format!("memory cannot exceed {MAX_MEMORY_MIB} MiB"));
    }
    Ok(memory)
}

fn parse_existing_file(s: &str) -> Result<PathBuf, String> {
    let path = PathBuf::from(s);
    if !path.exists() {
        return Err(format!("file not found: {s}"));
    }
    if !path.is_file() {
        return Err(format!("not a file: {s}"));
    }
    Ok(path)
}
