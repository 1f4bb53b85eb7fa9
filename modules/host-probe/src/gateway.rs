//! Default gateway discovery.

use crate::command::run_until;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};
use tracing::debug;

/// Longest a route command may run before it is killed.
const ROUTE_COMMAND_TIMEOUT: Duration = Duration::from_secs(2);

const RTF_UP: u32 = 0x0001;
const RTF_GATEWAY: u32 = 0x0002;

/// First IPv4 gateway reachable through an active, non-loopback interface.
///
/// Not cached: every call reads the current routing state.
pub fn default_gateway_ipv4() -> Option<String> {
    let gateway = if cfg!(target_os = "linux") {
        std::fs::read_to_string("/proc/net/route")
            .ok()
            .and_then(|table| parse_proc_net_route(&table))
            .or_else(|| command_stdout("ip", &["-4", "route", "show", "default"]).and_then(|out| parse_ip_route(&out)))
    } else if cfg!(target_os = "macos") {
        command_stdout("route", &["-n", "get", "default"]).and_then(|out| parse_macos_route(&out))
    } else if cfg!(target_os = "windows") {
        command_stdout("route", &["print", "0.0.0.0"]).and_then(|out| parse_windows_route(&out))
    } else {
        None
    };
    debug!(gateway = ?gateway, "default gateway lookup");
    gateway.map(|ip| ip.to_string())
}

fn command_stdout(program: &str, args: &[&str]) -> Option<String> {
    let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
    let (status, out) = run_until(program, &args, Instant::now() + ROUTE_COMMAND_TIMEOUT)?;
    status.success().then_some(out)
}

/// Parse the kernel routing table. Columns: Iface, Destination, Gateway,
/// Flags, ... with addresses in native-endian hex.
fn parse_proc_net_route(table: &str) -> Option<Ipv4Addr> {
    let mut fallback = None;
    for line in table.lines().skip(1) {
        let cols: Vec<&str> = line.split_whitespace().collect();
        if cols.len() < 4 || cols[0] == "lo" {
            continue;
        }
        let Ok(flags) = u32::from_str_radix(cols[3], 16) else { continue };
        if flags & (RTF_UP | RTF_GATEWAY) != RTF_UP | RTF_GATEWAY {
            continue;
        }
        let Ok(raw) = u32::from_str_radix(cols[2], 16) else { continue };
        if raw == 0 {
            continue;
        }
        let gateway = Ipv4Addr::from(raw.to_ne_bytes());
        if cols[1] == "00000000" {
            return Some(gateway);
        }
        fallback.get_or_insert(gateway);
    }
    fallback
}

/// `default via 192.168.1.1 dev eth0 proto dhcp metric 100`
fn parse_ip_route(output: &str) -> Option<Ipv4Addr> {
    output.lines().find_map(|line| {
        let mut tokens = line.split_whitespace();
        tokens.find(|t| *t == "via")?;
        tokens.next()?.parse().ok()
    })
}

/// `    gateway: 10.0.0.1`
fn parse_macos_route(output: &str) -> Option<Ipv4Addr> {
    output.lines().find_map(|line| {
        let rest = line.trim().strip_prefix("gateway:")?;
        rest.trim().parse().ok()
    })
}

/// `          0.0.0.0          0.0.0.0      192.168.1.1    192.168.1.50     25`
fn parse_windows_route(output: &str) -> Option<Ipv4Addr> {
    output.lines().find_map(|line| {
        let parts: Vec<&str> = line.split_whitespace().collect();
        match parts.as_slice() {
            ["0.0.0.0", "0.0.0.0", gw, ..] => gw.parse().ok(),
            _ => None,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(target_endian = "little")]
    #[test]
    fn proc_route_prefers_default_route() {
        let table = "\
Iface\tDestination\tGateway \tFlags\tRefCnt\tUse\tMetric\tMask\t\tMTU\tWindow\tIRTT
lo\t00000000\t0100007F\t0003\t0\t0\t0\t00000000\t0\t0\t0
eth0\t0010A8C0\t0000A8C0\t0003\t0\t0\t0\t00FFFFFF\t0\t0\t0
eth0\t00000000\t0102A8C0\t0003\t0\t0\t100\t00000000\t0\t0\t0
eth0\t0002A8C0\t00000000\t0001\t0\t0\t100\t00FFFFFF\t0\t0\t0
";
        assert_eq!(parse_proc_net_route(table), Some(Ipv4Addr::new(192, 168, 2, 1)));
    }

    #[cfg(target_endian = "little")]
    #[test]
    fn proc_route_skips_down_and_loopback() {
        let table = "\
Iface\tDestination\tGateway \tFlags\tRefCnt\tUse\tMetric\tMask
lo\t00000000\t0100007F\t0003\t0\t0\t0\t00000000
wlan0\t00000000\t0101A8C0\t0002\t0\t0\t0\t00000000
";
        assert_eq!(parse_proc_net_route(table), None);
        assert_eq!(parse_proc_net_route(""), None);
    }

    #[test]
    fn ip_route_output() {
        let out = "default via 192.168.1.1 dev eth0 proto dhcp src 192.168.1.20 metric 100\n";
        assert_eq!(parse_ip_route(out), Some(Ipv4Addr::new(192, 168, 1, 1)));
        assert_eq!(parse_ip_route("default dev tun0 scope link\n"), None);
    }

    #[test]
    fn macos_route_output() {
        let out = "   route to: default\ndestination: default\n       mask: default\n    gateway: 10.0.0.1\n  interface: en0\n";
        assert_eq!(parse_macos_route(out), Some(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(parse_macos_route("route: writing to routing socket: not in table"), None);
    }

    #[test]
    fn windows_route_output() {
        let out = "\
IPv4 Route Table
===========================================================================
Active Routes:
Network Destination        Netmask          Gateway       Interface  Metric
          0.0.0.0          0.0.0.0      192.168.1.1    192.168.1.50     25
";
        assert_eq!(parse_windows_route(out), Some(Ipv4Addr::new(192, 168, 1, 1)));
        assert_eq!(parse_windows_route("          0.0.0.0          0.0.0.0         On-link"), None);
    }

    #[test]
    fn live_gateway_is_v4_when_present() {
        if let Some(gw) = default_gateway_ipv4() {
            let ip: Ipv4Addr = gw.parse().unwrap();
            assert!(!ip.is_unspecified());
        }
    }
}
