//! Link, address and firewall operations.
//!
//! [`IpRoute`] drives `ip(8)`, `iptables(8)` and `ping(8)`; tests substitute
//! an in-memory fake.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::process::Command;
use std::time::Duration;

use funclet_common::constants::CONTAINER_IFACE;
use funclet_common::error::{FuncletError, Result};
use ipnetwork::Ipv4Network;

use crate::namespace::network::with_netns;

/// Operations the network allocator needs from the host.
pub trait LinkOps: Send + Sync {
    /// Returns `true` if a link with this name exists in the host namespace.
    ///
    /// # Errors
    ///
    /// Returns an error if the link table cannot be queried.
    fn link_exists(&self, name: &str) -> Result<bool>;

    /// Creates a bridge interface.
    ///
    /// # Errors
    ///
    /// Returns an error if the bridge cannot be created.
    fn create_bridge(&self, name: &str) -> Result<()>;

    /// Assigns an address with prefix to a link.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be added.
    fn add_address(&self, dev: &str, addr: Ipv4Network) -> Result<()>;

    /// Lists the IPv4 addresses assigned to a link.
    ///
    /// # Errors
    ///
    /// Returns an error if the addresses cannot be listed.
    fn addresses(&self, dev: &str) -> Result<Vec<Ipv4Addr>>;

    /// Brings a link up.
    ///
    /// # Errors
    ///
    /// Returns an error if the link state cannot be changed.
    fn set_up(&self, dev: &str) -> Result<()>;

    /// Installs the masquerade rule for traffic leaving the subnet.
    ///
    /// # Errors
    ///
    /// Returns an error if the rule cannot be installed.
    fn ensure_masquerade(&self, subnet: Ipv4Network, bridge: &str) -> Result<()>;

    /// Drops forwarded traffic from the bridge back into the bridge.
    ///
    /// # Errors
    ///
    /// Returns an error if the rule cannot be installed.
    fn ensure_icc_drop(&self, bridge: &str) -> Result<()>;

    /// Returns every IPv4 address present in the neighbour (ARP) table.
    ///
    /// # Errors
    ///
    /// Returns an error if the table cannot be read.
    fn neighbors(&self) -> Result<HashSet<Ipv4Addr>>;

    /// Returns `true` if `ip` answers an ICMP echo within `timeout`.
    fn is_alive(&self, ip: Ipv4Addr, timeout: Duration) -> bool;

    /// Creates a veth pair in the host namespace.
    ///
    /// # Errors
    ///
    /// Returns an error if the pair cannot be created.
    fn create_veth(&self, host: &str, peer: &str) -> Result<()>;

    /// Deletes a link; deleting one end of a veth removes both.
    ///
    /// # Errors
    ///
    /// Returns an error if the link cannot be deleted.
    fn delete_link(&self, name: &str) -> Result<()>;

    /// Enslaves a link to the bridge and brings it up.
    ///
    /// # Errors
    ///
    /// Returns an error if the link cannot be attached.
    fn attach_to_bridge(&self, dev: &str, bridge: &str) -> Result<()>;

    /// Moves a link into the network namespace of `pid`.
    ///
    /// # Errors
    ///
    /// Returns an error if the link cannot be moved.
    fn move_to_netns(&self, dev: &str, pid: i32) -> Result<()>;

    /// Inside the namespace of `pid`: renames `dev` to `eth0`, assigns
    /// `addr`, brings `lo` and `eth0` up, and routes by default via `gateway`.
    ///
    /// # Errors
    ///
    /// Returns an error if any step fails; the caller's namespace is
    /// restored either way.
    fn configure_container_iface(
        &self,
        pid: i32,
        dev: &str,
        addr: Ipv4Network,
        gateway: Ipv4Addr,
    ) -> Result<()>;
}

/// [`LinkOps`] implemented with the iproute2, iptables and ping tools.
#[derive(Debug, Clone, Copy, Default)]
pub struct IpRoute;

impl IpRoute {
    fn ip(args: &[&str]) -> Result<String> {
        run("ip", args)
    }

    fn iptables_rule(table: &str, action: &str, rule: &[&str]) -> Result<()> {
        let check = [&["-t", table, "-C"][..], rule].concat();
        if run("iptables", &check).is_ok() {
            return Ok(());
        }
        let add = [&["-t", table, action][..], rule].concat();
        let _ = run("iptables", &add)?;
        tracing::info!(table, rule = %rule.join(" "), "iptables rule installed");
        Ok(())
    }
}

impl LinkOps for IpRoute {
    fn link_exists(&self, name: &str) -> Result<bool> {
        let status = Command::new("ip")
            .args(["link", "show", name])
            .output()
            .map_err(|e| FuncletError::io("ip", e))?;
        Ok(status.status.success())
    }

    fn create_bridge(&self, name: &str) -> Result<()> {
        Self::ip(&["link", "add", "name", name, "type", "bridge"]).map(drop)
    }

    fn add_address(&self, dev: &str, addr: Ipv4Network) -> Result<()> {
        Self::ip(&["addr", "add", &addr.to_string(), "dev", dev]).map(drop)
    }

    fn addresses(&self, dev: &str) -> Result<Vec<Ipv4Addr>> {
        let out = Self::ip(&["-4", "-o", "addr", "show", "dev", dev])?;
        Ok(parse_addr_show(&out))
    }

    fn set_up(&self, dev: &str) -> Result<()> {
        Self::ip(&["link", "set", dev, "up"]).map(drop)
    }

    fn ensure_masquerade(&self, subnet: Ipv4Network, bridge: &str) -> Result<()> {
        let source = subnet.to_string();
        Self::iptables_rule(
            "nat",
            "-A",
            &["POSTROUTING", "-s", &source, "!", "-o", bridge, "-j", "MASQUERADE"],
        )
    }

    fn ensure_icc_drop(&self, bridge: &str) -> Result<()> {
        Self::iptables_rule("filter", "-I", &["FORWARD", "-i", bridge, "-o", bridge, "-j", "DROP"])
    }

    fn neighbors(&self) -> Result<HashSet<Ipv4Addr>> {
        let out = Self::ip(&["-4", "neigh", "show"])?;
        Ok(parse_neigh_show(&out))
    }

    fn is_alive(&self, ip: Ipv4Addr, timeout: Duration) -> bool {
        let wait = format!("{:.1}", timeout.as_secs_f64().max(0.1));
        Command::new("ping")
            .args(["-c", "1", "-W", &wait, &ip.to_string()])
            .output()
            .is_ok_and(|out| out.status.success())
    }

    fn create_veth(&self, host: &str, peer: &str) -> Result<()> {
        Self::ip(&["link", "add", host, "type", "veth", "peer", "name", peer]).map(drop)
    }

    fn delete_link(&self, name: &str) -> Result<()> {
        Self::ip(&["link", "del", name]).map(drop)
    }

    fn attach_to_bridge(&self, dev: &str, bridge: &str) -> Result<()> {
        let _ = Self::ip(&["link", "set", dev, "master", bridge])?;
        self.set_up(dev)
    }

    fn move_to_netns(&self, dev: &str, pid: i32) -> Result<()> {
        Self::ip(&["link", "set", dev, "netns", &pid.to_string()]).map(drop)
    }

    fn configure_container_iface(
        &self,
        pid: i32,
        dev: &str,
        addr: Ipv4Network,
        gateway: Ipv4Addr,
    ) -> Result<()> {
        with_netns(pid, || {
            let _ = Self::ip(&["link", "set", dev, "name", CONTAINER_IFACE])?;
            let _ = Self::ip(&["addr", "add", &addr.to_string(), "dev", CONTAINER_IFACE])?;
            let _ = Self::ip(&["link", "set", "lo", "up"])?;
            let _ = Self::ip(&["link", "set", CONTAINER_IFACE, "up"])?;
            let _ = Self::ip(&["route", "add", "default", "via", &gateway.to_string()])?;
            Ok(())
        })
    }
}

/// Runs a command and returns its standard output.
///
/// # Errors
///
/// Returns `FuncletError::Io` if the program cannot be spawned and
/// `FuncletError::Command` if it exits unsuccessfully.
pub fn run(program: &str, args: &[&str]) -> Result<String> {
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|e| FuncletError::io(program, e))?;
    if !output.status.success() {
        return Err(FuncletError::Command {
            program: program.into(),
            args: args.join(" "),
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Parses `ip -4 -o addr show` output.
fn parse_addr_show(out: &str) -> Vec<Ipv4Addr> {
    out.lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let _ = fields.position(|f| f == "inet")?;
            fields.next()?.split('/').next()?.parse().ok()
        })
        .collect()
}

/// Parses `ip -4 neigh show` output.
fn parse_neigh_show(out: &str) -> HashSet<Ipv4Addr> {
    out.lines()
        .filter_map(|line| line.split_whitespace().next()?.parse().ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bridge_addresses() {
        let out = "5: funclet0    inet 172.30.0.1/16 brd 172.30.255.255 scope global funclet0\\       valid_lft forever\n\
                   5: funclet0    inet 172.30.5.9/16 scope global secondary funclet0\n";
        assert_eq!(
            parse_addr_show(out),
            vec![Ipv4Addr::new(172, 30, 0, 1), Ipv4Addr::new(172, 30, 5, 9)]
        );
    }

    #[test]
    fn parses_neighbor_table() {
        let out = "172.30.0.2 dev funclet0 lladdr 02:42:ac:1e:00:02 REACHABLE\n\
                   10.0.0.1 dev eth0 lladdr 52:54:00:12:34:56 STALE\n\
                   fe80::1 dev eth0 FAILED\n";
        let neighbors = parse_neigh_show(out);
        assert_eq!(neighbors.len(), 2);
        assert!(neighbors.contains(&Ipv4Addr::new(172, 30, 0, 2)));
    }

    #[test]
    fn run_reports_failing_command() {
        let err = run("false", &[]).unwrap_err();
        assert!(matches!(err, FuncletError::Command { code: Some(1), .. }));
    }
}
