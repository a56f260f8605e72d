//! Node bridge, veth pool and IP allocation.
//!
//! One bridge per node carries every container. Each container gets one
//! end of a veth pair moved into its network namespace; the other end
//! stays on the bridge. Veths are never destroyed on teardown: they go back
//! to a pool together with their IP address and are reused by the next
//! container, which amortizes IP allocation across warm/cool cycles.

pub mod link;

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use funclet_common::config::NetworkSettings;
use funclet_common::error::{FuncletError, Result};
use ipnetwork::Ipv4Network;

pub use link::{IpRoute, LinkOps};

/// A veth pair owned by the allocator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Veth {
    /// Bridge-side interface name.
    pub host_name: String,
    /// Container-side interface name before it is renamed to `eth0`.
    pub peer_name: String,
    /// Address assigned inside the container.
    pub ip: Ipv4Addr,
    /// Pid whose namespace holds the peer; zero while pooled.
    pub container_pid: i32,
}

#[derive(Debug)]
struct NetState {
    last_ip: Ipv4Addr,
    pool: Vec<Veth>,
    attached: Vec<Veth>,
    next_index: u32,
}

/// Allocates bridge-attached veths and addresses to containers.
pub struct NetworkAllocator {
    links: Arc<dyn LinkOps>,
    bridge: String,
    gateway: Ipv4Network,
    ping_timeout: Duration,
    state: Mutex<NetState>,
}

impl std::fmt::Debug for NetworkAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkAllocator")
            .field("bridge", &self.bridge)
            .field("gateway", &self.gateway)
            .finish_non_exhaustive()
    }
}

impl NetworkAllocator {
    /// Creates an allocator for the configured bridge.
    ///
    /// # Errors
    ///
    /// Returns `FuncletError::Config` if the CIDR is malformed.
    pub fn new(settings: &NetworkSettings, links: Arc<dyn LinkOps>) -> Result<Self> {
        let gateway = settings.subnet()?;
        Ok(Self {
            links,
            bridge: settings.bridge.clone(),
            gateway,
            ping_timeout: Duration::from_millis(settings.ping_timeout_ms),
            state: Mutex::new(NetState {
                last_ip: gateway.ip(),
                pool: Vec::new(),
                attached: Vec::new(),
                next_index: 0,
            }),
        })
    }

    /// Bridge interface name.
    #[must_use]
    pub fn bridge(&self) -> &str {
        &self.bridge
    }

    /// Gateway address containers route through.
    #[must_use]
    pub fn gateway(&self) -> Ipv4Addr {
        self.gateway.ip()
    }

    /// Ensures the bridge exists, is addressed, is up, and is firewalled.
    ///
    /// An existing bridge is reused as-is.
    ///
    /// # Errors
    ///
    /// Returns an error if any creation step fails or the address does not
    /// show up on the bridge afterwards.
    pub fn init_network(&self) -> Result<()> {
        if self.links.link_exists(&self.bridge)? {
            tracing::info!(bridge = %self.bridge, "reusing existing bridge");
            return Ok(());
        }
        self.links.create_bridge(&self.bridge)?;
        self.links.add_address(&self.bridge, self.gateway)?;
        if !self.links.addresses(&self.bridge)?.contains(&self.gateway.ip()) {
            return Err(FuncletError::Network {
                message: format!("{} missing address {} after assignment", self.bridge, self.gateway),
            });
        }
        let subnet = Ipv4Network::new(self.gateway.network(), self.gateway.prefix()).map_err(|e| {
            FuncletError::Network {
                message: format!("invalid subnet {}: {e}", self.gateway),
            }
        })?;
        self.links.ensure_masquerade(subnet, &self.bridge)?;
        self.links.set_up(&self.bridge)?;
        self.links.ensure_icc_drop(&self.bridge)?;
        tracing::info!(bridge = %self.bridge, cidr = %self.gateway, "bridge created");
        Ok(())
    }

    /// Wires a container's network namespace to the bridge.
    ///
    /// Reuses a pooled veth when one is available, otherwise allocates a
    /// fresh address and creates a new pair. On failure the veth goes back
    /// to the pool.
    ///
    /// # Errors
    ///
    /// Returns an error if no address is free or any link step fails.
    pub fn set_container_net(&self, pid: i32) -> Result<Veth> {
        let mut state = self.lock_state();
        let mut veth = match state.pool.pop() {
            Some(veth) => {
                self.revalidate(&veth)?;
                veth
            }
            None => {
                let ip = self.allocate_ip_locked(&mut state)?;
                let index = state.next_index;
                state.next_index += 1;
                let veth = Veth {
                    host_name: format!("flv{index}"),
                    peer_name: format!("flp{index}"),
                    ip,
                    container_pid: 0,
                };
                self.links.create_veth(&veth.host_name, &veth.peer_name)?;
                veth
            }
        };

        if let Err(e) = self.plug(&veth, pid) {
            tracing::warn!(pid, veth = %veth.host_name, error = %e, "container network setup failed");
            state.pool.push(veth);
            return Err(e);
        }
        veth.container_pid = pid;
        state.attached.push(veth.clone());
        tracing::info!(pid, ip = %veth.ip, veth = %veth.host_name, "container network set");
        Ok(veth)
    }

    /// Returns the veth of `pid` to the pool. Returns `false` if no veth is
    /// attached to that pid.
    pub fn unset_container_net(&self, pid: i32) -> bool {
        let mut state = self.lock_state();
        let Some(pos) = state.attached.iter().position(|v| v.container_pid == pid) else {
            tracing::debug!(pid, "no veth attached to pid");
            return false;
        };
        let mut veth = state.attached.swap_remove(pos);
        veth.container_pid = 0;
        tracing::info!(pid, veth = %veth.host_name, ip = %veth.ip, "veth returned to pool");
        state.pool.push(veth);
        true
    }

    /// Allocates an address that is not on the bridge, not in the
    /// neighbour table, not held by a veth, and does not answer a ping.
    ///
    /// # Errors
    ///
    /// Returns `FuncletError::NoSuitableIp` once the scan wraps around to
    /// its starting point.
    pub fn allocate_ip(&self) -> Result<Ipv4Addr> {
        let mut state = self.lock_state();
        self.allocate_ip_locked(&mut state)
    }

    /// Number of pooled veths.
    #[must_use]
    pub fn pool_size(&self) -> usize {
        self.lock_state().pool.len()
    }

    /// Veth currently attached to `pid`, if any.
    #[must_use]
    pub fn attached(&self, pid: i32) -> Option<Veth> {
        self.lock_state()
            .attached
            .iter()
            .find(|v| v.container_pid == pid)
            .cloned()
    }

    fn lock_state(&self) -> MutexGuard<'_, NetState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// A pooled pair disappears with the namespace its peer lived in;
    /// recreate it under the same names so the address is kept.
    fn revalidate(&self, veth: &Veth) -> Result<()> {
        if self.links.link_exists(&veth.peer_name)? {
            return Ok(());
        }
        if self.links.link_exists(&veth.host_name)? {
            self.links.delete_link(&veth.host_name)?;
        }
        self.links.create_veth(&veth.host_name, &veth.peer_name)?;
        tracing::debug!(veth = %veth.host_name, "pooled veth recreated");
        Ok(())
    }

    fn plug(&self, veth: &Veth, pid: i32) -> Result<()> {
        let addr = Ipv4Network::new(veth.ip, self.gateway.prefix()).map_err(|e| FuncletError::Network {
            message: format!("invalid address {}: {e}", veth.ip),
        })?;
        self.links.attach_to_bridge(&veth.host_name, &self.bridge)?;
        self.links.move_to_netns(&veth.peer_name, pid)?;
        self.links
            .configure_container_iface(pid, &veth.peer_name, addr, self.gateway.ip())
    }

    fn allocate_ip_locked(&self, state: &mut NetState) -> Result<Ipv4Addr> {
        let network = u32::from(self.gateway.network());
        let broadcast = u32::from(self.gateway.broadcast());
        let bridge_addrs: HashSet<Ipv4Addr> = self.links.addresses(&self.bridge)?.into_iter().collect();
        let neighbors = self.links.neighbors()?;
        let owned: HashSet<Ipv4Addr> = state
            .pool
            .iter()
            .chain(state.attached.iter())
            .map(|v| v.ip)
            .collect();

        let start = state.last_ip;
        let mut candidate = start;
        loop {
            candidate = next_in_subnet(candidate, network, broadcast);
            if candidate == start {
                break;
            }
            let raw = u32::from(candidate);
            if raw == network
                || raw == broadcast
                || !is_unicast(candidate)
                || candidate == self.gateway.ip()
                || bridge_addrs.contains(&candidate)
                || neighbors.contains(&candidate)
                || owned.contains(&candidate)
            {
                continue;
            }
            if self.links.is_alive(candidate, self.ping_timeout) {
                tracing::debug!(ip = %candidate, "candidate answered ping, skipping");
                continue;
            }
            state.last_ip = candidate;
            tracing::debug!(ip = %candidate, "address allocated");
            return Ok(candidate);
        }
        Err(FuncletError::NoSuitableIp {
            subnet: self.gateway.to_string(),
        })
    }
}

/// Next address after `ip`, wrapping from the broadcast address back to the
/// network address.
fn next_in_subnet(ip: Ipv4Addr, network: u32, broadcast: u32) -> Ipv4Addr {
    let next = u32::from(ip).wrapping_add(1);
    if next > broadcast || next < network {
        Ipv4Addr::from(network)
    } else {
        Ipv4Addr::from(next)
    }
}

fn is_unicast(ip: Ipv4Addr) -> bool {
    !(ip.is_multicast() || ip.is_broadcast() || ip.is_unspecified() || ip.is_loopback())
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::HashMap;

    /// In-memory [`LinkOps`] recording every call.
    #[derive(Default)]
    pub struct FakeLinks {
        pub links: Mutex<HashSet<String>>,
        pub addrs: Mutex<HashMap<String, Vec<Ipv4Addr>>>,
        pub neighbors: Mutex<HashSet<Ipv4Addr>>,
        pub alive: Mutex<HashSet<Ipv4Addr>>,
        pub calls: Mutex<Vec<String>>,
    }

    impl FakeLinks {
        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }

        pub fn count(&self, prefix: &str) -> usize {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|c| c.starts_with(prefix))
                .count()
        }
    }

    impl LinkOps for FakeLinks {
        fn link_exists(&self, name: &str) -> Result<bool> {
            Ok(self.links.lock().unwrap().contains(name))
        }

        fn create_bridge(&self, name: &str) -> Result<()> {
            self.record(format!("create_bridge {name}"));
            let _ = self.links.lock().unwrap().insert(name.into());
            Ok(())
        }

        fn add_address(&self, dev: &str, addr: Ipv4Network) -> Result<()> {
            self.record(format!("add_address {dev} {addr}"));
            self.addrs
                .lock()
                .unwrap()
                .entry(dev.into())
                .or_default()
                .push(addr.ip());
            Ok(())
        }

        fn addresses(&self, dev: &str) -> Result<Vec<Ipv4Addr>> {
            Ok(self.addrs.lock().unwrap().get(dev).cloned().unwrap_or_default())
        }

        fn set_up(&self, dev: &str) -> Result<()> {
            self.record(format!("set_up {dev}"));
            Ok(())
        }

        fn ensure_masquerade(&self, subnet: Ipv4Network, bridge: &str) -> Result<()> {
            self.record(format!("masquerade {subnet} {bridge}"));
            Ok(())
        }

        fn ensure_icc_drop(&self, bridge: &str) -> Result<()> {
            self.record(format!("icc_drop {bridge}"));
            Ok(())
        }

        fn neighbors(&self) -> Result<HashSet<Ipv4Addr>> {
            Ok(self.neighbors.lock().unwrap().clone())
        }

        fn is_alive(&self, ip: Ipv4Addr, _timeout: Duration) -> bool {
            self.alive.lock().unwrap().contains(&ip)
        }

        fn create_veth(&self, host: &str, peer: &str) -> Result<()> {
            self.record(format!("create_veth {host} {peer}"));
            let mut links = self.links.lock().unwrap();
            let _ = links.insert(host.into());
            let _ = links.insert(peer.into());
            Ok(())
        }

        fn delete_link(&self, name: &str) -> Result<()> {
            self.record(format!("delete_link {name}"));
            let _ = self.links.lock().unwrap().remove(name);
            Ok(())
        }

        fn attach_to_bridge(&self, dev: &str, bridge: &str) -> Result<()> {
            self.record(format!("attach {dev} {bridge}"));
            Ok(())
        }

        fn move_to_netns(&self, dev: &str, pid: i32) -> Result<()> {
            self.record(format!("move {dev} {pid}"));
            Ok(())
        }

        fn configure_container_iface(
            &self,
            pid: i32,
            dev: &str,
            addr: Ipv4Network,
            gateway: Ipv4Addr,
        ) -> Result<()> {
            self.record(format!("configure {pid} {dev} {addr} via {gateway}"));
            Ok(())
        }
    }
}
