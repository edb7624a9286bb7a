//! Host interface names owned by this process.
//!
//! Every bridge, tap and veth weaver creates is reserved here first, so two
//! live networks in one process can never hand out the same name. Names
//! that already exist on the host are rejected separately by the caller.

use crate::NetError;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, OnceLock};

/// Kernel limit on interface names (IFNAMSIZ minus the terminator).
pub const MAX_IFNAME_LEN: usize = 15;

const COUNTER_MODULUS: u32 = 100_000;

static RESERVED: OnceLock<Mutex<HashSet<String>>> = OnceLock::new();
static NEXT_LINK: AtomicU32 = AtomicU32::new(0);
static NEXT_SWITCH: AtomicU32 = AtomicU32::new(0);

fn reserved() -> &'static Mutex<HashSet<String>> {
    RESERVED.get_or_init(|| Mutex::new(HashSet::new()))
}

pub fn validate_ifname(name: &str) -> Result<(), NetError> {
    let valid = !name.is_empty()
        && name.len() <= MAX_IFNAME_LEN
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(NetError::InvalidName(name.to_string()))
    }
}

/// Exclusive claim on a host interface name, released on drop.
#[derive(Debug)]
pub struct NameGuard {
    name: String,
}

impl NameGuard {
    pub fn reserve(name: impl Into<String>) -> Result<Self, NetError> {
        let name = name.into();
        validate_ifname(&name)?;

        let mut set = reserved().lock().unwrap_or_else(|e| e.into_inner());
        if !set.insert(name.clone()) {
            return Err(NetError::NameCollision(name));
        }
        Ok(Self { name })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for NameGuard {
    fn drop(&mut self) {
        let mut set = reserved().lock().unwrap_or_else(|e| e.into_inner());
        set.remove(&self.name);
    }
}

pub fn is_reserved(name: &str) -> bool {
    reserved()
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .contains(name)
}

/// Names for the two ends of the next link.
pub fn next_link_pair() -> (String, String) {
    let n = NEXT_LINK.fetch_add(1, Ordering::Relaxed) % COUNTER_MODULUS;
    (format!("wvl{n:05}a"), format!("wvl{n:05}b"))
}

pub fn next_switch_name() -> String {
    let n = NEXT_SWITCH.fetch_add(1, Ordering::Relaxed) % COUNTER_MODULUS;
    format!("wvs{n:05}")
}

pub fn port_bridge_name(uid: &str) -> String {
    format!("wvp-{uid}")
}

pub fn tap_name(uid: &str) -> String {
    format!("wvt-{uid}")
}

/// True for names in one of the namespaces weaver allocates from.
pub fn is_weaver_name(name: &str) -> bool {
    name.starts_with("wvl") || name.starts_with("wvs") || name.starts_with("wvp-") || name.starts_with("wvt-")
}
