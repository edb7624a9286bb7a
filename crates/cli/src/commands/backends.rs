//! The `backends` command - shows which host tools weaver resolved.

use clap::Args;
use serde_json::json;
use std::path::Path;
use weaver::{HostConfig, HypervisorBackend, QemuBackend};

#[derive(Args)]
pub struct BackendsArgs {
    /// Output in JSON format
    #[arg(long)]
    json: bool,
}

struct Tool<'a> {
    role: &'static str,
    path: &'a Path,
    available: bool,
}

pub fn run(args: BackendsArgs) {
    let config = HostConfig::from_env();
    let backend = QemuBackend::from_config(&config);
    let tools = [
        Tool {
            role: "hypervisor",
            path: &config.qemu,
            available: backend.is_available(),
        },
        Tool {
            role: "image tool",
            path: &config.qemu_img,
            available: which::which(&config.qemu_img).is_ok(),
        },
        Tool {
            role: "network tool",
            path: &config.ip,
            available: which::which(&config.ip).is_ok(),
        },
    ];

    if args.json {
        print_json(backend.name(), &tools, &config);
    } else {
        print_text(backend.name(), &tools, &config);
    }
}

fn print_json(backend: &str, tools: &[Tool<'_>], config: &HostConfig) {
    let tools: Vec<_> = tools
        .iter()
        .map(|t| {
            json!({
                "role": t.role,
                "path": t.path.display().to_string(),
                "available": t.available,
            })
        })
        .collect();
    let report = json!({
        "backend": backend,
        "accel": config.accel,
        "runtime_dir": config.runtime_root().display().to_string(),
        "tools": tools,
    });
    println!("{report:#}");
}

fn print_text(backend: &str, tools: &[Tool<'_>], config: &HostConfig) {
    println!("Backend: {backend}");
    println!(
        "  Acceleration: {}",
        config.accel.as_deref().unwrap_or("none (emulation)")
    );
    println!("  Runtime dir: {}", config.runtime_root().display());
    println!();
    for tool in tools {
        let status = if tool.available {
            "Available"
        } else {
            "Not found"
        };
        println!("  {:<13} {} ({status})", tool.role, tool.path.display());
    }
}
