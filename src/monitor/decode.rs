//! Minimal frame classification feeding the aggregator.
//!
//! Only the tuple the statistics need is extracted: a protocol label and the
//! two endpoint addresses. Full protocol dissection is left to other tools.

use etherparse::{InternetSlice, LinkSlice, SlicedPacket, TransportSlice};

/// DLT values this decoder understands.
pub const LINKTYPE_ETHERNET:  i32 = 1;
pub const LINKTYPE_RAW:       i32 = 101;
pub const LINKTYPE_RAW_BSD:   i32 = 12;
pub const LINKTYPE_LINUX_SLL: i32 = 113;

const ETHERTYPE_ARP:  u16 = 0x0806;
const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_IPV6: u16 = 0x86dd;
const SLL_HEADER_LEN: usize = 16;

/// Protocol and endpoints of one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedPacket {
    pub protocol: String,
    pub src:      String,
    pub dst:      String,
}

/// Classifies a frame captured on a handle of the given link type.
/// Returns `None` for frames that cannot be attributed to two endpoints.
pub fn decode(link_type: i32, data: &[u8]) -> Option<DecodedPacket> {
    let sliced = match link_type {
        LINKTYPE_ETHERNET => SlicedPacket::from_ethernet(data).ok()?,
        LINKTYPE_RAW | LINKTYPE_RAW_BSD => SlicedPacket::from_ip(data).ok()?,
        LINKTYPE_LINUX_SLL => {
            if data.len() <= SLL_HEADER_LEN {
                return None;
            }
            let ether_type = u16::from_be_bytes([data[14], data[15]]);
            match ether_type {
                ETHERTYPE_IPV4 | ETHERTYPE_IPV6 => {
                    SlicedPacket::from_ip(&data[SLL_HEADER_LEN..]).ok()?
                }
                _ => return None,
            }
        }
        _ => return None,
    };

    let (src, dst, ip_proto) = match &sliced.ip {
        Some(InternetSlice::Ipv4(h, _)) => (
            h.source_addr().to_string(),
            h.destination_addr().to_string(),
            h.protocol(),
        ),
        Some(InternetSlice::Ipv6(h, _)) => (
            h.source_addr().to_string(),
            h.destination_addr().to_string(),
            h.next_header(),
        ),
        None => return decode_non_ip(&sliced),
    };

    let protocol = match &sliced.transport {
        Some(TransportSlice::Tcp(tcp)) => {
            let ports = [tcp.source_port(), tcp.destination_port()];
            if ports.contains(&53) {
                "DNS".to_string()
            } else if ports.contains(&443) {
                "TLS".to_string()
            } else if ports.contains(&80) {
                "HTTP".to_string()
            } else {
                "TCP".to_string()
            }
        }
        Some(TransportSlice::Udp(udp)) => {
            if udp.source_port() == 53 || udp.destination_port() == 53 {
                "DNS".to_string()
            } else {
                "UDP".to_string()
            }
        }
        Some(TransportSlice::Icmpv4(_)) => "ICMP".to_string(),
        Some(TransportSlice::Icmpv6(_)) => "ICMPv6".to_string(),
        Some(TransportSlice::Unknown(proto)) => ip_protocol_name(*proto),
        None => ip_protocol_name(ip_proto),
    };

    Some(DecodedPacket { protocol, src, dst })
}

/// ARP frames are attributed by their Ethernet addresses.
fn decode_non_ip(sliced: &SlicedPacket<'_>) -> Option<DecodedPacket> {
    match &sliced.link {
        Some(LinkSlice::Ethernet2(eth)) if eth.ether_type() == ETHERTYPE_ARP => Some(DecodedPacket {
            protocol: "ARP".to_string(),
            src:      format_mac(&eth.source()),
            dst:      format_mac(&eth.destination()),
        }),
        _ => None,
    }
}

fn ip_protocol_name(proto: u8) -> String {
    match proto {
        2 => "IGMP".to_string(),
        47 => "GRE".to_string(),
        132 => "SCTP".to_string(),
        136 => "UDPLite".to_string(),
        other => format!("IP/{}", other),
    }
}

fn format_mac(mac: &[u8; 6]) -> String {
    mac.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
mod tests {
    use super::*;
    use etherparse::PacketBuilder;

    fn ethernet_udp(src_port: u16, dst_port: u16) -> Vec<u8> {
        let builder = PacketBuilder::ethernet2([1, 2, 3, 4, 5, 6], [7, 8, 9, 10, 11, 12])
            .ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64)
            .udp(src_port, dst_port);
        let payload = [0u8; 8];
        let mut out = Vec::with_capacity(builder.size(payload.len()));
        builder.write(&mut out, &payload).unwrap();
        out
    }

    #[test]
    fn decodes_ethernet_udp() {
        let frame = ethernet_udp(40000, 9999);
        let decoded = decode(LINKTYPE_ETHERNET, &frame).unwrap();
        assert_eq!(decoded.protocol, "UDP");
        assert_eq!(decoded.src, "10.0.0.1");
        assert_eq!(decoded.dst, "10.0.0.2");
    }

    #[test]
    fn udp_port_53_is_dns() {
        let frame = ethernet_udp(40000, 53);
        assert_eq!(decode(LINKTYPE_ETHERNET, &frame).unwrap().protocol, "DNS");
    }

    #[test]
    fn decodes_raw_ip_tcp() {
        let builder = PacketBuilder::ipv4([192, 0, 2, 1], [198, 51, 100, 2], 64)
            .tcp(5000, 443, 1, 1024);
        let mut out = Vec::new();
        builder.write(&mut out, &[]).unwrap();

        let decoded = decode(LINKTYPE_RAW, &out).unwrap();
        assert_eq!(decoded.protocol, "TLS");
        assert_eq!(decoded.src, "192.0.2.1");
    }

    #[test]
    fn garbage_and_unknown_links_are_rejected() {
        assert!(decode(LINKTYPE_ETHERNET, &[0u8; 4]).is_none());
        assert!(decode(9999, &ethernet_udp(1, 2)).is_none());
    }

    #[test]
    fn mac_formatting() {
        assert_eq!(format_mac(&[0xde, 0xad, 0xbe, 0xef, 0, 1]), "DE:AD:BE:EF:00:01");
    }
}
