//! The `links` and `cleanup` commands - inspect and remove weaver's host
//! interfaces.

use clap::Args;
use serde_json::json;
use weaver::{HostConfig, IpCommand};
use weaver_net::names::is_weaver_name;
use weaver_net::{HostNetworking, LinkInfo, NetError};

#[derive(Args)]
pub struct LinksArgs {
    /// Output in JSON format
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
pub struct CleanupArgs {
    /// Delete the interfaces instead of only listing them
    #[arg(long)]
    yes: bool,
}

pub async fn list(args: LinksArgs) -> anyhow::Result<()> {
    let host = IpCommand::from_config(&HostConfig::from_env());
    let links = weaver_links(&host).await?;

    if args.json {
        let links: Vec<_> = links
            .iter()
            .map(|l| {
                json!({
                    "name": l.name,
                    "kind": l.kind,
                    "master": l.master,
                    "up": l.up,
                })
            })
            .collect();
        println!("{:#}", json!({ "links": links }));
        return Ok(());
    }

    if links.is_empty() {
        println!("No weaver interfaces found.");
        return Ok(());
    }
    for link in &links {
        println!(
            "  {:<16} {:<7} master={:<16} {}",
            link.name,
            link.kind.as_deref().unwrap_or("-"),
            link.master.as_deref().unwrap_or("-"),
            if link.up { "UP" } else { "DOWN" }
        );
    }
    Ok(())
}

pub async fn cleanup(args: CleanupArgs) -> anyhow::Result<()> {
    let host = IpCommand::from_config(&HostConfig::from_env());
    if !args.yes {
        let order = deletion_order(&weaver_links(&host).await?);
        if order.is_empty() {
            println!("Nothing to clean up.");
        } else {
            println!("Would delete (pass --yes to delete):");
            for name in order {
                println!("  {name}");
            }
        }
        return Ok(());
    }

    let deleted = remove_weaver_links(&host).await?;
    println!("Deleted {} interface(s).", deleted.len());
    Ok(())
}

async fn weaver_links(host: &dyn HostNetworking) -> Result<Vec<LinkInfo>, NetError> {
    let mut links: Vec<_> = host
        .links()
        .await?
        .into_iter()
        .filter(|l| is_weaver_name(&l.name))
        .collect();
    links.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(links)
}

/// Links first, then taps, then the bridges they were enslaved to. Only
/// one end of a veth pair is listed; deleting it removes its peer.
fn deletion_order(links: &[LinkInfo]) -> Vec<String> {
    let names: Vec<&str> = links.iter().map(|l| l.name.as_str()).collect();
    let rank = |name: &str| {
        if name.starts_with("wvl") {
            0
        } else if name.starts_with("wvt-") {
            1
        } else {
            2
        }
    };

    let mut order: Vec<String> = names
        .iter()
        .filter(|name| match name.strip_suffix('b') {
            Some(stem) if name.starts_with("wvl") => !names.contains(&format!("{stem}a").as_str()),
            _ => true,
        })
        .map(|name| name.to_string())
        .collect();
    order.sort_by(|a, b| rank(a).cmp(&rank(b)).then_with(|| a.cmp(b)));
    order
}

/// Deletes every weaver interface on the host and returns the names that
/// were removed.
async fn remove_weaver_links(host: &dyn HostNetworking) -> anyhow::Result<Vec<String>> {
    let mut deleted = Vec::new();
    let mut failed = Vec::new();

    for name in deletion_order(&weaver_links(host).await?) {
        match host.delete_link(&name).await {
            Ok(()) => {
                tracing::info!(link = %name, "deleted");
                deleted.push(name);
            }
            // Gone with a peer or removed by its owner in the meantime.
            Err(_) if !host.link_exists(&name).await.unwrap_or(true) => {}
            Err(e) => {
                tracing::warn!(link = %name, error = %e, "delete failed");
                failed.push(format!("{name}: {e}"));
            }
        }
    }

    if failed.is_empty() {
        Ok(deleted)
    } else {
        anyhow::bail!("could not delete {}", failed.join("; "))
    }
}
