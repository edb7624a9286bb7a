//! [`HostNetworking`] backed by the `ip(8)` tool.

use crate::host::{HostNetworking, LinkInfo, Neighbor};
use crate::NetError;
use async_trait::async_trait;
use serde::Deserialize;
use std::net::IpAddr;
use std::path::PathBuf;
use tokio::process::Command;
use tracing::debug;
use weaver_core::HostConfig;

pub struct IpCommand {
    ip_path: PathBuf,
}

impl IpCommand {
    pub fn new(ip_path: impl Into<PathBuf>) -> Self {
        Self {
            ip_path: ip_path.into(),
        }
    }

    pub fn from_config(config: &HostConfig) -> Self {
        Self::new(&config.ip)
    }

    async fn run(&self, args: &[&str]) -> Result<String, NetError> {
        let command = format!("{} {}", self.ip_path.display(), args.join(" "));
        debug!(%command, "running host network command");

        let output = Command::new(&self.ip_path).args(args).output().await?;
        if !output.status.success() {
            return Err(NetError::Command {
                command,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl HostNetworking for IpCommand {
    async fn links(&self) -> Result<Vec<LinkInfo>, NetError> {
        let json = self.run(&["-j", "-d", "link", "show"]).await?;
        parse_links(&json)
    }

    async fn link_exists(&self, name: &str) -> Result<bool, NetError> {
        // `ip link show dev X` fails for unknown names; that is the cheap path.
        match self.run(&["-j", "link", "show", "dev", name]).await {
            Ok(_) => Ok(true),
            Err(NetError::Command { stderr, .. }) if stderr.contains("does not exist") => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn add_bridge(&self, name: &str) -> Result<(), NetError> {
        self.run(&["link", "add", "name", name, "type", "bridge"])
            .await
            .map(drop)
    }

    async fn add_tap(&self, name: &str) -> Result<(), NetError> {
        self.run(&["tuntap", "add", "dev", name, "mode", "tap"])
            .await
            .map(drop)
    }

    async fn add_veth(&self, name: &str, peer: &str) -> Result<(), NetError> {
        self.run(&["link", "add", name, "type", "veth", "peer", "name", peer])
            .await
            .map(drop)
    }

    async fn set_master(&self, link: &str, bridge: &str) -> Result<(), NetError> {
        self.run(&["link", "set", "dev", link, "master", bridge])
            .await
            .map(drop)
    }

    async fn set_up(&self, link: &str) -> Result<(), NetError> {
        self.run(&["link", "set", "dev", link, "up"]).await.map(drop)
    }

    async fn set_down(&self, link: &str) -> Result<(), NetError> {
        self.run(&["link", "set", "dev", link, "down"]).await.map(drop)
    }

    async fn delete_link(&self, name: &str) -> Result<(), NetError> {
        self.run(&["link", "delete", "dev", name]).await.map(drop)
    }

    async fn neighbors(&self) -> Result<Vec<Neighbor>, NetError> {
        let json = self.run(&["-j", "neigh", "show"]).await?;
        parse_neighbors(&json)
    }
}

#[derive(Deserialize)]
struct RawLink {
    ifname: String,
    #[serde(default)]
    flags: Vec<String>,
    #[serde(default)]
    master: Option<String>,
    #[serde(default)]
    linkinfo: Option<RawLinkInfo>,
}

#[derive(Deserialize)]
struct RawLinkInfo {
    #[serde(default)]
    info_kind: Option<String>,
}

#[derive(Deserialize)]
struct RawNeighbor {
    dst: String,
    #[serde(default)]
    dev: Option<String>,
    #[serde(default)]
    lladdr: Option<String>,
    #[serde(default)]
    state: Vec<String>,
}

fn parse_links(json: &str) -> Result<Vec<LinkInfo>, NetError> {
    if json.trim().is_empty() {
        return Ok(Vec::new());
    }
    let raw: Vec<RawLink> =
        serde_json::from_str(json).map_err(|e| NetError::Parse(format!("ip link: {e}")))?;
    Ok(raw
        .into_iter()
        .map(|l| LinkInfo {
            up: l.flags.iter().any(|f| f == "UP"),
            kind: l.linkinfo.and_then(|i| i.info_kind),
            master: l.master,
            name: l.ifname,
        })
        .collect())
}

fn parse_neighbors(json: &str) -> Result<Vec<Neighbor>, NetError> {
    if json.trim().is_empty() {
        return Ok(Vec::new());
    }
    let raw: Vec<RawNeighbor> =
        serde_json::from_str(json).map_err(|e| NetError::Parse(format!("ip neigh: {e}")))?;

    let mut neighbors = Vec::with_capacity(raw.len());
    for n in raw {
        let Ok(address) = n.dst.parse::<IpAddr>() else {
            debug!(dst = %n.dst, "skipping neighbour with unparseable address");
            continue;
        };
        neighbors.push(Neighbor {
            address,
            mac: n.lladdr.and_then(|m| m.parse().ok()),
            device: n.dev,
            states: n.state,
        });
    }
    Ok(neighbors)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_link_listing() {
        let json = r#"[
            {"ifindex":1,"ifname":"lo","flags":["LOOPBACK","UP","LOWER_UP"],"mtu":65536},
            {"ifindex":7,"ifname":"wvp-abcdef","flags":["BROADCAST","MULTICAST","UP"],
             "linkinfo":{"info_kind":"bridge","info_data":{"stp_state":0}}},
            {"ifindex":8,"ifname":"wvt-abcdef","flags":["BROADCAST","MULTICAST"],
             "master":"wvp-abcdef","linkinfo":{"info_kind":"tun"}}
        ]"#;
        let links = parse_links(json).unwrap();
        assert_eq!(links.len(), 3);
        assert_eq!(links[0].name, "lo");
        assert!(links[0].up);
        assert_eq!(links[0].kind, None);
        assert_eq!(links[1].kind.as_deref(), Some("bridge"));
        assert_eq!(links[2].master.as_deref(), Some("wvp-abcdef"));
        assert!(!links[2].up);
    }

    #[test]
    fn parses_empty_output() {
        assert!(parse_links("").unwrap().is_empty());
        assert!(parse_neighbors("  \n").unwrap().is_empty());
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(parse_links("not json"), Err(NetError::Parse(_))));
    }

    #[test]
    fn parses_neighbor_table() {
        let json = r#"[
            {"dst":"192.168.122.50","dev":"br0","lladdr":"52:54:00:ab:cd:ef","state":["REACHABLE"]},
            {"dst":"192.168.122.51","dev":"br0","state":["FAILED"]},
            {"dst":"fe80::1","dev":"br0","lladdr":"52:54:00:00:00:01","state":["STALE"]}
        ]"#;
        let neighbors = parse_neighbors(json).unwrap();
        assert_eq!(neighbors.len(), 3);
        assert_eq!(
            neighbors[0].address,
            "192.168.122.50".parse::<IpAddr>().unwrap()
        );
        assert_eq!(
            neighbors[0].mac,
            Some("52:54:00:AB:CD:EF".parse().unwrap())
        );
        assert!(neighbors[0].is_confirmed());
        assert_eq!(neighbors[1].mac, None);
        assert!(!neighbors[1].is_confirmed());
        assert!(neighbors[2].address.is_ipv6());
        assert!(!neighbors[2].is_confirmed());
    }
}
