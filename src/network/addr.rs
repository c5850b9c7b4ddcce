//! Address helpers: listener parsing, default ports, outbound grouping and
//! whitelist matching.

use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

use crate::chain::NetAddress;
use crate::error::NodeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerFamily {
    Tcp4,
    Tcp6,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenAddr {
    pub family: ListenerFamily,
    pub addr: String,
}

fn split_host_port(addr: &str) -> Option<(&str, &str)> {
    if let Some(rest) = addr.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        let port = tail.strip_prefix(':')?;
        return Some((host, port));
    }
    let (host, port) = addr.rsplit_once(':')?;
    if host.contains(':') {
        return None;
    }
    Some((host, port))
}

/// Host part of a `host:port` string.
pub fn host_of(addr: &str) -> Option<&str> {
    split_host_port(addr).map(|(host, _)| host)
}

/// Appends `default_port` when the address has no port.
pub fn normalize_address(addr: &str, default_port: u16) -> String {
    if split_host_port(addr).is_some() {
        return addr.to_string();
    }
    if addr.parse::<Ipv6Addr>().is_ok() {
        return format!("[{}]:{}", addr, default_port);
    }
    format!("{}:{}", addr, default_port)
}

/// Splits listen addresses by IP family. An empty host listens on both.
pub fn parse_listeners(addrs: &[String]) -> Result<Vec<ListenAddr>, NodeError> {
    let mut out = Vec::with_capacity(addrs.len() * 2);
    for addr in addrs {
        let (host, _) = split_host_port(addr)
            .ok_or_else(|| NodeError::InvalidAddress(format!("missing port in address {}", addr)))?;
        if host.is_empty() {
            out.push(ListenAddr {
                family: ListenerFamily::Tcp4,
                addr: addr.clone(),
            });
            out.push(ListenAddr {
                family: ListenerFamily::Tcp6,
                addr: addr.clone(),
            });
            continue;
        }
        let host = host.split('%').next().unwrap_or(host);
        let ip: IpAddr = host
            .parse()
            .map_err(|_| NodeError::InvalidAddress(format!("'{}' is not a valid IP address", host)))?;
        let family = if ip.is_ipv4() {
            ListenerFamily::Tcp4
        } else {
            ListenerFamily::Tcp6
        };
        out.push(ListenAddr {
            family,
            addr: addr.clone(),
        });
    }
    Ok(out)
}

/// Resolve `host:port` to a socket address, looking the host up when it is
/// not already an IP.
pub async fn addr_string_to_net_addr(addr: &str, onion_enabled: bool) -> Result<SocketAddr, NodeError> {
    let (host, port) = split_host_port(addr)
        .ok_or_else(|| NodeError::InvalidAddress(format!("missing port in address {}", addr)))?;
    let port: u16 = port
        .parse()
        .map_err(|_| NodeError::InvalidAddress(format!("invalid port in address {}", addr)))?;
    if let Ok(ip) = IpAddr::from_str(host) {
        return Ok(SocketAddr::new(ip, port));
    }
    if host.ends_with(".onion") {
        return Err(NodeError::InvalidAddress(if onion_enabled {
            "onion addresses require a proxy".to_string()
        } else {
            "tor has been disabled".to_string()
        }));
    }
    let mut resolved = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| NodeError::InvalidAddress(e.to_string()))?;
    resolved
        .next()
        .ok_or_else(|| NodeError::InvalidAddress(format!("no addresses found for {}", host)))
}

fn is_local(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_private() || v4.is_link_local(),
        IpAddr::V6(v6) => v6.is_loopback() || (v6.segments()[0] & 0xfe00) == 0xfc00,
    }
}

pub fn is_routable(na: &NetAddress) -> bool {
    !na.ip.is_unspecified() && !is_local(&na.ip)
}

/// Network group used to spread outbound connections: /16 for IPv4,
/// /32 for IPv6.
pub fn group_key(na: Option<&NetAddress>) -> String {
    let Some(na) = na else {
        return "unroutable".to_string();
    };
    let ip = match na.ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        },
        v4 => v4,
    };
    if is_local(&ip) {
        return "local".to_string();
    }
    if ip.is_unspecified() {
        return "unroutable".to_string();
    }
    match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            format!("{}.{}.0.0", o[0], o[1])
        }
        IpAddr::V6(v6) => {
            let s = v6.segments();
            Ipv6Addr::new(s[0], s[1], 0, 0, 0, 0, 0, 0).to_string()
        }
    }
}

/// An IP network written as `addr/prefix`, or a bare IP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpNet {
    addr: IpAddr,
    prefix: u8,
}

impl FromStr for IpNet {
    type Err = NodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || NodeError::InvalidAddress(format!("invalid whitelist entry '{}'", s));
        let (ip, prefix) = match s.split_once('/') {
            Some((ip, bits)) => (ip, Some(bits.parse::<u8>().map_err(|_| invalid())?)),
            None => (s, None),
        };
        let addr: IpAddr = ip.parse().map_err(|_| invalid())?;
        let max = if addr.is_ipv4() { 32 } else { 128 };
        let prefix = prefix.unwrap_or(max);
        if prefix > max {
            return Err(invalid());
        }
        Ok(Self { addr, prefix })
    }
}

impl IpNet {
    pub fn contains(&self, ip: &IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = u32::MAX.checked_shl(32 - self.prefix as u32).unwrap_or(0);
                u32::from(net) & mask == u32::from(*ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = u128::MAX.checked_shl(128 - self.prefix as u32).unwrap_or(0);
                u128::from(net) & mask == u128::from(*ip) & mask
            }
            _ => false,
        }
    }
}

pub fn is_whitelisted(whitelists: &[IpNet], addr: &str) -> bool {
    if whitelists.is_empty() {
        return false;
    }
    let Some(host) = host_of(addr) else {
        tracing::error!("unable to split host/port on '{}'", addr);
        return false;
    };
    let Ok(ip) = host.parse::<IpAddr>() else {
        tracing::warn!("unable to parse IP '{}'", addr);
        return false;
    };
    whitelists.iter().any(|net| net.contains(&ip))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_normalize_address() {
        assert_eq!(normalize_address("1.2.3.4", 11047), "1.2.3.4:11047");
        assert_eq!(normalize_address("1.2.3.4:99", 11047), "1.2.3.4:99");
        assert_eq!(normalize_address("::1", 11047), "[::1]:11047");
        assert_eq!(normalize_address("[::1]:5", 11047), "[::1]:5");
        assert_eq!(normalize_address("seed.example", 1), "seed.example:1");
    }

    #[test]
    fn test_parse_listeners_wildcard_yields_both_families() {
        let listeners = parse_listeners(&[":11047".to_string(), "[::1]:2".to_string()]).unwrap();
        assert_eq!(listeners.len(), 3);
        assert_eq!(listeners[0].family, ListenerFamily::Tcp4);
        assert_eq!(listeners[1].family, ListenerFamily::Tcp6);
        assert_eq!(listeners[2].family, ListenerFamily::Tcp6);
        assert!(parse_listeners(&["nohost:1".to_string()]).is_err());
    }

    #[test]
    fn test_group_key() {
        let na = NetAddress::new(IpAddr::V4(Ipv4Addr::new(8, 8, 4, 4)), 1, 0);
        assert_eq!(group_key(Some(&na)), "8.8.0.0");
        let local = NetAddress::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 1, 0);
        assert_eq!(group_key(Some(&local)), "local");
        assert_eq!(group_key(None), "unroutable");
    }

    #[test]
    fn test_whitelist_cidr_and_ip() {
        let nets: Vec<IpNet> = ["10.0.0.0/8", "192.168.1.5"]
            .iter()
            .map(|s| s.parse().unwrap())
            .collect();
        assert!(is_whitelisted(&nets, "10.20.30.40:1"));
        assert!(is_whitelisted(&nets, "192.168.1.5:8"));
        assert!(!is_whitelisted(&nets, "192.168.1.6:8"));
        assert!(!is_whitelisted(&[], "10.0.0.1:1"));
        assert!("10.0.0.0/33".parse::<IpNet>().is_err());
    }

    #[tokio::test]
    async fn test_addr_string_to_net_addr_ip_literal() {
        let addr = addr_string_to_net_addr("127.0.0.1:8333", false).await.unwrap();
        assert_eq!(addr.port(), 8333);
        assert!(addr_string_to_net_addr("abc.onion:1", false).await.is_err());
        assert!(addr_string_to_net_addr("127.0.0.1", false).await.is_err());
    }
}
