//! Nameserver discovery from the container's resolver configuration.

use crate::error::NetError;
use std::net::Ipv4Addr;
use std::path::Path;

pub const RESOLV_CONF: &str = "/etc/resolv.conf";

/// Upstream resolvers when the container points at a local systemd-resolved stub.
pub const SYSTEMD_RESOLV_CONF: &str = "/run/systemd/resolve/resolv.conf";

/// Read the IPv4 nameservers configured in `path`.
///
/// If every nameserver is a loopback address, the systemd-resolved
/// upstream file is consulted instead when it has anything better.
pub fn nameservers(path: &Path) -> Result<Vec<Ipv4Addr>, NetError> {
    let content = std::fs::read_to_string(path).map_err(|source| NetError::Resolver {
        path: path.display().to_string(),
        source,
    })?;
    let servers = parse_nameservers(&content);

    if servers.iter().all(|s| s.is_loopback()) {
        if let Ok(real) = std::fs::read_to_string(SYSTEMD_RESOLV_CONF) {
            let upstream: Vec<Ipv4Addr> = parse_nameservers(&real)
                .into_iter()
                .filter(|s| !s.is_loopback())
                .collect();
            if !upstream.is_empty() {
                return Ok(upstream);
            }
        }
    }

    Ok(servers)
}

/// Extract `nameserver` entries; IPv6 and malformed entries are skipped.
pub fn parse_nameservers(content: &str) -> Vec<Ipv4Addr> {
    content
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            match (fields.next(), fields.next()) {
                (Some("nameserver"), Some(addr)) => addr.parse().ok(),
                _ => None,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_nameservers() {
        let content = "\
# Generated by the container runtime
search default.svc.cluster.local svc.cluster.local
nameserver 10.96.0.10
nameserver  8.8.8.8
nameserver 2001:4860:4860::8888
options ndots:5
";
        assert_eq!(
            parse_nameservers(content),
            vec![Ipv4Addr::new(10, 96, 0, 10), Ipv4Addr::new(8, 8, 8, 8)]
        );
    }

    #[test]
    fn test_nameservers_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("resolv.conf");
        std::fs::write(&path, "nameserver 1.1.1.1\n").unwrap();

        assert_eq!(nameservers(&path).unwrap(), vec![Ipv4Addr::new(1, 1, 1, 1)]);
    }

    #[test]
    fn test_missing_file_is_error() {
        let dir = TempDir::new().unwrap();
        let result = nameservers(&dir.path().join("missing"));
        assert!(matches!(result, Err(NetError::Resolver { .. })));
    }
}
