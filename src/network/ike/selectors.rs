//! Traffic-Selector narrowing (RFC 7296 §2.9, this crate's §4.4 contract).

use crate::network::ike::message::TrafficSelector;
use ipnet::Ipv4Net;
use std::net::Ipv4Addr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TsUnacceptable;

/// Narrows the peer-offered selectors down to the subset also covered by the
/// local protected subnet and port/protocol. Returns the narrowed selector for
/// each side, or `TsUnacceptable` if the intersection is empty.
pub fn narrow(
    peer_tsi: &[TrafficSelector],
    peer_tsr: &[TrafficSelector],
    local_subnet: Ipv4Net,
    local_port: u16,
    local_ip_proto: u8,
) -> Result<(TrafficSelector, TrafficSelector), TsUnacceptable> {
    let tsi = narrow_one(peer_tsi, local_subnet, local_port, local_ip_proto).ok_or(TsUnacceptable)?;
    let tsr = narrow_one(peer_tsr, local_subnet, local_port, local_ip_proto).ok_or(TsUnacceptable)?;
    Ok((tsi, tsr))
}

fn narrow_one(
    offered: &[TrafficSelector],
    local_subnet: Ipv4Net,
    local_port: u16,
    local_ip_proto: u8,
) -> Option<TrafficSelector> {
    offered.iter().find_map(|ts| intersect_one(ts, local_subnet, local_port, local_ip_proto))
}

fn intersect_one(
    ts: &TrafficSelector,
    local_subnet: Ipv4Net,
    local_port: u16,
    local_ip_proto: u8,
) -> Option<TrafficSelector> {
    if local_ip_proto != 0 && ts.ip_protocol != 0 && ts.ip_protocol != local_ip_proto {
        return None;
    }
    let addr_start = addr_intersect_start(ts.start_addr, local_subnet)?;
    let addr_end = addr_intersect_end(ts.end_addr, local_subnet)?;
    if addr_start > addr_end {
        return None;
    }
    let port_start = if local_port == 0 { ts.start_port } else { ts.start_port.max(local_port) };
    let port_end = if local_port == 0 { ts.end_port } else { ts.end_port.min(local_port) };
    if port_start > port_end {
        return None;
    }
    Some(TrafficSelector {
        ts_type: ts.ts_type,
        ip_protocol: if ts.ip_protocol != 0 { ts.ip_protocol } else { local_ip_proto },
        start_port: port_start,
        end_port: port_end,
        start_addr: addr_start,
        end_addr: addr_end,
    })
}

fn addr_intersect_start(peer_start: Ipv4Addr, local: Ipv4Net) -> Option<Ipv4Addr> {
    let local_start = local.network();
    Some(if u32::from(peer_start) >= u32::from(local_start) {
        peer_start
    } else {
        local_start
    })
}

fn addr_intersect_end(peer_end: Ipv4Addr, local: Ipv4Net) -> Option<Ipv4Addr> {
    let local_end = local.broadcast();
    Some(if u32::from(peer_end) <= u32::from(local_end) {
        peer_end
    } else {
        local_end
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(start: &str, end: &str, proto: u8, start_port: u16, end_port: u16) -> TrafficSelector {
        TrafficSelector {
            ts_type: crate::network::ike::message::TS_IPV4_ADDR_RANGE,
            ip_protocol: proto,
            start_port,
            end_port,
            start_addr: start.parse().unwrap(),
            end_addr: end.parse().unwrap(),
        }
    }

    #[test]
    fn narrows_to_host_within_subnet() {
        let subnet: Ipv4Net = "192.168.0.2/32".parse().unwrap();
        let tsi = vec![ts("192.168.0.2", "192.168.0.2", 6, 8765, 8765)];
        let tsr = vec![ts("192.168.0.2", "192.168.0.2", 6, 23, 23)];
        let (ni, nr) = narrow(&tsi, &tsr, subnet, 8765, 6).unwrap();
        assert_eq!(ni.start_addr, "192.168.0.2".parse::<Ipv4Addr>().unwrap());
        assert_eq!(nr.start_port, 23);
    }

    #[test]
    fn empty_intersection_is_unacceptable() {
        let subnet: Ipv4Net = "10.0.0.0/24".parse().unwrap();
        let tsi = vec![ts("192.168.0.2", "192.168.0.2", 6, 8765, 8765)];
        let tsr = vec![ts("192.168.0.2", "192.168.0.2", 6, 23, 23)];
        assert_eq!(narrow(&tsi, &tsr, subnet, 8765, 6), Err(TsUnacceptable));
    }
}
