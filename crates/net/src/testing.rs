//! In-memory host networking for tests.

use crate::host::{HostNetworking, LinkInfo, Neighbor};
use crate::NetError;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::net::IpAddr;
use std::sync::Mutex;
use weaver_core::MacAddress;

/// Host operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostOp {
    AddBridge,
    AddTap,
    AddVeth,
    SetMaster,
    SetUp,
    SetDown,
    Delete,
}

#[derive(Debug, Clone)]
struct MemoryLink {
    kind: &'static str,
    master: Option<String>,
    up: bool,
    peer: Option<String>,
}

#[derive(Default)]
struct MemoryState {
    links: BTreeMap<String, MemoryLink>,
    neighbors: Vec<Neighbor>,
    failures: HashSet<(HostOp, String)>,
    log: Vec<String>,
}

/// Records links in memory and mimics the kernel's behaviour for the
/// operations weaver uses: duplicate names fail, deleting one end of a veth
/// pair deletes the peer, and deleting a bridge releases its ports.
#[derive(Default)]
pub struct MemoryHost {
    state: Mutex<MemoryState>,
}

impl MemoryHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a pre-existing bridge, as if created by the host administrator.
    pub fn with_bridge(self, name: &str) -> Self {
        self.lock().links.insert(
            name.to_string(),
            MemoryLink {
                kind: "bridge",
                master: None,
                up: true,
                peer: None,
            },
        );
        self
    }

    pub fn add_neighbor(&self, address: IpAddr, mac: MacAddress, device: &str) {
        self.add_neighbor_in_state(address, mac, device, "REACHABLE");
    }

    /// Adds a neighbour entry in a kernel state such as `STALE`.
    pub fn add_neighbor_in_state(&self, address: IpAddr, mac: MacAddress, device: &str, state: &str) {
        self.lock().neighbors.push(Neighbor {
            address,
            mac: Some(mac),
            device: Some(device.to_string()),
            states: vec![state.to_string()],
        });
    }

    /// Makes every future `op` on `name` fail.
    pub fn fail(&self, op: HostOp, name: &str) {
        self.lock().failures.insert((op, name.to_string()));
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    pub fn has_link(&self, name: &str) -> bool {
        self.lock().links.contains_key(name)
    }

    pub fn link(&self, name: &str) -> Option<LinkInfo> {
        self.lock().links.get(name).map(|l| to_info(name, l))
    }

    pub fn link_names(&self) -> Vec<String> {
        self.lock().links.keys().cloned().collect()
    }

    /// Commands executed so far, in order, formatted like `add-veth a b`.
    pub fn commands(&self) -> Vec<String> {
        self.lock().log.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn apply<F>(&self, op: HostOp, name: &str, command: String, f: F) -> Result<(), NetError>
    where
        F: FnOnce(&mut MemoryState) -> Result<(), NetError>,
    {
        let mut state = self.lock();
        state.log.push(command.clone());
        if state.failures.contains(&(op, name.to_string())) {
            return Err(NetError::Command {
                command,
                status: "exit status: 2".to_string(),
                stderr: "injected failure".to_string(),
            });
        }
        f(&mut state)
    }
}

fn to_info(name: &str, link: &MemoryLink) -> LinkInfo {
    LinkInfo {
        name: name.to_string(),
        kind: Some(link.kind.to_string()),
        master: link.master.clone(),
        up: link.up,
    }
}

fn insert_new(state: &mut MemoryState, name: &str, link: MemoryLink) -> Result<(), NetError> {
    if state.links.contains_key(name) {
        return Err(NetError::NameCollision(name.to_string()));
    }
    state.links.insert(name.to_string(), link);
    Ok(())
}

fn existing<'a>(state: &'a mut MemoryState, name: &str) -> Result<&'a mut MemoryLink, NetError> {
    state
        .links
        .get_mut(name)
        .ok_or_else(|| NetError::MissingLink(name.to_string()))
}

#[async_trait]
impl HostNetworking for MemoryHost {
    async fn links(&self) -> Result<Vec<LinkInfo>, NetError> {
        Ok(self
            .lock()
            .links
            .iter()
            .map(|(name, l)| to_info(name, l))
            .collect())
    }

    async fn add_bridge(&self, name: &str) -> Result<(), NetError> {
        self.apply(HostOp::AddBridge, name, format!("add-bridge {name}"), |s| {
            insert_new(
                s,
                name,
                MemoryLink {
                    kind: "bridge",
                    master: None,
                    up: false,
                    peer: None,
                },
            )
        })
    }

    async fn add_tap(&self, name: &str) -> Result<(), NetError> {
        self.apply(HostOp::AddTap, name, format!("add-tap {name}"), |s| {
            insert_new(
                s,
                name,
                MemoryLink {
                    kind: "tun",
                    master: None,
                    up: false,
                    peer: None,
                },
            )
        })
    }

    async fn add_veth(&self, name: &str, peer: &str) -> Result<(), NetError> {
        self.apply(HostOp::AddVeth, name, format!("add-veth {name} {peer}"), |s| {
            if s.links.contains_key(peer) {
                return Err(NetError::NameCollision(peer.to_string()));
            }
            let end = |other: &str| MemoryLink {
                kind: "veth",
                master: None,
                up: false,
                peer: Some(other.to_string()),
            };
            insert_new(s, name, end(peer))?;
            s.links.insert(peer.to_string(), end(name));
            Ok(())
        })
    }

    async fn set_master(&self, link: &str, bridge: &str) -> Result<(), NetError> {
        self.apply(
            HostOp::SetMaster,
            link,
            format!("set-master {link} {bridge}"),
            |s| {
                match s.links.get(bridge) {
                    Some(b) if b.kind == "bridge" => {}
                    Some(_) => return Err(NetError::Topology(format!("{bridge} is not a bridge"))),
                    None => return Err(NetError::MissingLink(bridge.to_string())),
                }
                existing(s, link)?.master = Some(bridge.to_string());
                Ok(())
            },
        )
    }

    async fn set_up(&self, link: &str) -> Result<(), NetError> {
        self.apply(HostOp::SetUp, link, format!("up {link}"), |s| {
            existing(s, link)?.up = true;
            Ok(())
        })
    }

    async fn set_down(&self, link: &str) -> Result<(), NetError> {
        self.apply(HostOp::SetDown, link, format!("down {link}"), |s| {
            existing(s, link)?.up = false;
            Ok(())
        })
    }

    async fn delete_link(&self, name: &str) -> Result<(), NetError> {
        self.apply(HostOp::Delete, name, format!("delete {name}"), |s| {
            let removed = s
                .links
                .remove(name)
                .ok_or_else(|| NetError::MissingLink(name.to_string()))?;
            if let Some(peer) = removed.peer {
                s.links.remove(&peer);
            }
            for link in s.links.values_mut() {
                if link.master.as_deref() == Some(name) {
                    link.master = None;
                }
            }
            Ok(())
        })
    }

    async fn neighbors(&self) -> Result<Vec<Neighbor>, NetError> {
        Ok(self.lock().neighbors.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn deleting_veth_end_removes_peer() {
        let host = MemoryHost::new();
        host.add_veth("x0", "x1").await.unwrap();
        assert!(host.has_link("x1"));
        host.delete_link("x1").await.unwrap();
        assert!(host.link_names().is_empty());
    }

    #[tokio::test]
    async fn deleting_bridge_releases_ports() {
        let host = MemoryHost::new().with_bridge("br0");
        host.add_tap("t0").await.unwrap();
        host.set_master("t0", "br0").await.unwrap();
        host.delete_link("br0").await.unwrap();
        assert_eq!(host.link("t0").unwrap().master, None);
    }

    #[tokio::test]
    async fn duplicate_names_fail() {
        let host = MemoryHost::new();
        host.add_tap("t0").await.unwrap();
        assert!(host.add_bridge("t0").await.is_err());
    }

    #[tokio::test]
    async fn injected_failures_are_logged() {
        let host = MemoryHost::new();
        host.fail(HostOp::AddBridge, "br9");
        assert!(host.add_bridge("br9").await.is_err());
        assert_eq!(host.commands(), vec!["add-bridge br9".to_string()]);
        assert!(!host.link_exists("br9").await.unwrap());
    }
}
