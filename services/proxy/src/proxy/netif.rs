//! Local interface addresses.

use std::net::Ipv4Addr;

use nix::ifaddrs::getifaddrs;

/// Non-loopback IPv4 addresses of this host, in interface enumeration order.
pub fn local_ipv4_addrs() -> nix::Result<Vec<Ipv4Addr>> {
    let mut addrs: Vec<Ipv4Addr> = Vec::new();

    for ifaddr in getifaddrs()? {
        let Some(ip) = ifaddr
            .address
            .as_ref()
            .and_then(|a| a.as_sockaddr_in())
            .map(|sin| sin.ip())
        else {
            continue;
        };

        if ip.is_loopback() || addrs.contains(&ip) {
            continue;
        }
        addrs.push(ip);
    }

    Ok(addrs)
}
