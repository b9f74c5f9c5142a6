//! Data connection addresses as exchanged in `PASV`, `EPSV`, `PORT` and
//! `EPRT`.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use once_cell::sync::Lazy;
use regex::Regex;

#[allow(clippy::unwrap_used, reason = "constant pattern")]
static PASV_REPLY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d+),(\d+),(\d+),(\d+),(\d+),(\d+)").unwrap());

/// Host and port of a `227` reply.
pub fn parse_pasv(text: &str) -> Option<(Ipv4Addr, u16)> {
    let captures = PASV_REPLY.captures(text)?;
    let mut numbers = [0u8; 6];
    for (i, n) in numbers.iter_mut().enumerate() {
        *n = captures.get(i + 1)?.as_str().parse().ok()?;
    }
    let [a, b, c, d, p1, p2] = numbers;
    Some((Ipv4Addr::new(a, b, c, d), u16::from(p1) << 8 | u16::from(p2)))
}

/// Port of a `229` reply, e.g. `(|||6446|)`.
pub fn parse_epsv(text: &str) -> Option<u16> {
    let start = text.find('(')?;
    let end = start + text[start..].find(')')?;
    let inner = &text[start + 1..end];
    let delimiter = inner.chars().next()?;
    let fields: Vec<&str> = inner.split(delimiter).collect();
    // "", net-prt, net-addr, port, ""
    if fields.len() != 5 {
        return None;
    }
    fields[3].parse().ok().filter(|p| *p != 0)
}

/// Argument of `PORT` or `EPRT` announcing `addr`.
pub fn format_port_command(addr: SocketAddr) -> String {
    match addr.ip() {
        IpAddr::V4(ip) => {
            let [a, b, c, d] = ip.octets();
            format!(
                "PORT {a},{b},{c},{d},{},{}",
                addr.port() >> 8,
                addr.port() & 0xff
            )
        }
        IpAddr::V6(ip) => format!("EPRT |2|{ip}|{}|", addr.port()),
    }
}

/// Whether a server-announced passive address should be replaced by the
/// control connection's peer: it is not routable from here while the
/// control connection goes to a routable host.
pub fn should_use_control_host(announced: Ipv4Addr, peer: IpAddr) -> bool {
    if announced.is_unspecified() {
        return true;
    }
    let peer_is_local = match peer {
        IpAddr::V4(ip) => ip.is_private() || ip.is_loopback() || ip.is_link_local(),
        IpAddr::V6(ip) => ip.is_loopback(),
    };
    let announced_is_local =
        announced.is_private() || announced.is_loopback() || announced.is_link_local();
    announced_is_local && !peer_is_local
}
