//! Client address helpers and IP admission lists.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use http::StatusCode;
use parking_lot::RwLock;
use tracing::warn;

use crate::context::Context;
use crate::error::Error;
use crate::handler::{from_fn, Middleware};
use crate::request::Request;

/// Whether `ip` is loopback or in a private/link-local range
/// (`10/8`, `172.16/12`, `192.168/16`, `169.254/16`, `fc00::/7`, `fe80::/10`).
pub fn is_local_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_private() || v4.is_link_local(),
        IpAddr::V6(v6) => {
            if let Some(v4) = v6.to_ipv4_mapped() {
                return is_local_ip(IpAddr::V4(v4));
            }
            let first = v6.segments()[0];
            v6.is_loopback() || (first & 0xfe00) == 0xfc00 || (first & 0xffc0) == 0xfe80
        }
    }
}

/// Best-effort client address for requests behind a reverse proxy.
///
/// Tries the first `X-Forwarded-For` entry, then `X-Real-Ip`, then the
/// socket peer. Returns an empty string when none is known.
pub fn client_ip(req: &Request) -> String {
    let forwarded = req
        .header("x-forwarded-for")
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    if let Some(ip) = forwarded {
        return ip.to_owned();
    }
    if let Some(ip) = req.header("x-real-ip").map(str::trim).filter(|v| !v.is_empty()) {
        return ip.to_owned();
    }
    req.remote_addr().map(|a| a.ip().to_string()).unwrap_or_default()
}

/// Like [`client_ip`], but skips private and loopback addresses. Returns an
/// empty string when only local addresses are known.
pub fn client_public_ip(req: &Request) -> String {
    let public = |s: &str| s.parse::<IpAddr>().is_ok_and(|ip| !is_local_ip(ip));

    let forwarded = req.header("x-forwarded-for").unwrap_or_default();
    if let Some(ip) = forwarded.split(',').map(str::trim).find(|ip| public(ip)) {
        return ip.to_owned();
    }
    if let Some(ip) = req.header("x-real-ip").map(str::trim).filter(|ip| public(ip)) {
        return ip.to_owned();
    }
    match req.remote_addr() {
        Some(addr) if !is_local_ip(addr.ip()) => addr.ip().to_string(),
        _ => String::new(),
    }
}

#[derive(Default)]
struct Rules {
    hosts: HashSet<IpAddr>,
    nets: Vec<(IpAddr, u8)>,
}

enum Node {
    Host(IpAddr),
    Net(IpAddr, u8),
}

impl Node {
    fn parse(line: &str) -> Result<Self, Error> {
        let line = line.trim();
        let bad = || Error::InvalidAddr(line.to_owned());
        let Some((addr, prefix)) = line.split_once('/') else {
            return line.parse().map(Node::Host).map_err(|_| bad());
        };
        let addr: IpAddr = addr.parse().map_err(|_| bad())?;
        let prefix: u8 = prefix.parse().map_err(|_| bad())?;
        let max = if addr.is_ipv4() { 32 } else { 128 };
        if prefix > max {
            return Err(bad());
        }
        Ok(Node::Net(network(addr, prefix), prefix))
    }
}

fn mask_v4(prefix: u8) -> u32 {
    u32::MAX.checked_shl(32 - u32::from(prefix)).unwrap_or(0)
}

fn mask_v6(prefix: u8) -> u128 {
    u128::MAX.checked_shl(128 - u32::from(prefix)).unwrap_or(0)
}

/// Zeroes the host bits of `addr`.
fn network(addr: IpAddr, prefix: u8) -> IpAddr {
    match addr {
        IpAddr::V4(v4) => IpAddr::V4(Ipv4Addr::from(u32::from(v4) & mask_v4(prefix))),
        IpAddr::V6(v6) => IpAddr::V6(Ipv6Addr::from(u128::from(v6) & mask_v6(prefix))),
    }
}

fn contains(net: IpAddr, prefix: u8, ip: IpAddr) -> bool {
    match (net, ip) {
        (IpAddr::V4(_), IpAddr::V4(_)) | (IpAddr::V6(_), IpAddr::V6(_)) => network(ip, prefix) == net,
        _ => false,
    }
}

/// A mutable set of addresses and CIDR ranges.
///
/// Build one, share it behind an `Arc`, and attach either
/// [`whitelist`](IpAdmission::whitelist) or
/// [`blacklist`](IpAdmission::blacklist). Rules can change while the server
/// runs.
#[derive(Default)]
pub struct IpAdmission {
    rules: RwLock<Rules>,
}

impl IpAdmission {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a single address (`10.0.0.1`, `::1`) or a CIDR range
    /// (`192.168.0.0/24`).
    pub fn add(&self, line: &str) -> Result<(), Error> {
        let node = Node::parse(line)?;
        let mut rules = self.rules.write();
        match node {
            Node::Host(ip) => {
                rules.hosts.insert(ip);
            }
            Node::Net(net, prefix) => {
                if !rules.nets.contains(&(net, prefix)) {
                    rules.nets.push((net, prefix));
                }
            }
        }
        Ok(())
    }

    /// Removes a rule previously added with the same address or range.
    pub fn remove(&self, line: &str) -> Result<(), Error> {
        let node = Node::parse(line)?;
        let mut rules = self.rules.write();
        match node {
            Node::Host(ip) => {
                rules.hosts.remove(&ip);
            }
            Node::Net(net, prefix) => rules.nets.retain(|n| *n != (net, prefix)),
        }
        Ok(())
    }

    /// Whether `ip` matches any rule. Unparseable input never matches.
    pub fn check(&self, ip: &str) -> bool {
        let Ok(ip) = ip.trim().parse::<IpAddr>() else {
            return false;
        };
        let rules = self.rules.read();
        rules.hosts.contains(&ip) || rules.nets.iter().any(|&(net, prefix)| contains(net, prefix, ip))
    }

    /// Admits only clients whose [`client_ip`] matches; others get `403`.
    pub fn whitelist(self: &Arc<Self>) -> Middleware {
        self.admission(true)
    }

    /// Rejects clients whose [`client_ip`] matches with `403`.
    pub fn blacklist(self: &Arc<Self>) -> Middleware {
        self.admission(false)
    }

    fn admission(self: &Arc<Self>, admit_on_match: bool) -> Middleware {
        let rules = Arc::clone(self);
        from_fn(move |c: &mut Context| {
            let ip = client_ip(c.request());
            if rules.check(&ip) == admit_on_match {
                c.next();
            } else {
                warn!(ip = %ip, "IP blocked");
                c.string(StatusCode::FORBIDDEN, "No access");
            }
        })
    }
}
