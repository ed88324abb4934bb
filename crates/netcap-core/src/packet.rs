//! Outer-layer packet parsing: Ethernet → IPv4 → TCP/UDP.
//!
//! Extracts the L4 port tuple and the application-layer slice position for
//! the protocol filter. Anything else (non-IPv4 EtherType, other IP
//! protocols, truncated headers) yields `valid = false`; such packets
//! bypass protocol filtering and are dropped by the filter stage when a
//! protocol is bound.

const ETHER_HEADER_LEN: usize = 14;
const ETHER_TYPE_IPV4: u16 = 0x0800;
const IPPROTO_TCP: u8 = 6;
const IPPROTO_UDP: u8 = 17;

#[derive(Debug, Clone, Copy, Default)]
pub struct ParsedPacket {
    pub src_port: u16,
    pub dst_port: u16,
    /// Offset of the application payload from the start of the frame.
    pub app_offset: u32,
    pub app_len: u32,
    pub ip_proto: u8,
    pub valid: bool,
}

pub fn parse_packet(packet: &[u8]) -> ParsedPacket {
    let mut result = ParsedPacket::default();

    if packet.len() < ETHER_HEADER_LEN {
        return result;
    }

    let ether_type = u16::from(packet[12]) << 8 | u16::from(packet[13]);
    if ether_type != ETHER_TYPE_IPV4 {
        return result;
    }

    let ip = &packet[ETHER_HEADER_LEN..];
    if ip.len() < 20 {
        return result;
    }

    let version = (ip[0] >> 4) & 0x0F;
    if version != 4 {
        return result;
    }

    let ip_hdr_len = usize::from(ip[0] & 0x0F) * 4;
    if ip_hdr_len < 20 || ip.len() < ip_hdr_len {
        return result;
    }

    let ip_proto = ip[9];
    result.ip_proto = ip_proto;

    let transport = &ip[ip_hdr_len..];
    let transport_offset = ETHER_HEADER_LEN + ip_hdr_len;

    match ip_proto {
        IPPROTO_TCP => {
            if transport.len() < 20 {
                return result;
            }
            result.src_port = u16::from(transport[0]) << 8 | u16::from(transport[1]);
            result.dst_port = u16::from(transport[2]) << 8 | u16::from(transport[3]);

            let tcp_hdr_len = usize::from((transport[12] >> 4) & 0x0F) * 4;
            if tcp_hdr_len < 20 || transport.len() < tcp_hdr_len {
                return result;
            }

            result.app_offset = (transport_offset + tcp_hdr_len) as u32;
            result.app_len = (transport.len() - tcp_hdr_len) as u32;
            result.valid = true;
        }
        IPPROTO_UDP => {
            if transport.len() < 8 {
                return result;
            }
            result.src_port = u16::from(transport[0]) << 8 | u16::from(transport[1]);
            result.dst_port = u16::from(transport[2]) << 8 | u16::from(transport[3]);
            result.app_offset = (transport_offset + 8) as u32;
            result.app_len = (transport.len() - 8) as u32;
            result.valid = true;
        }
        _ => {}
    }

    result
}

#[cfg(test)]
pub fn build_udp_frame(src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
    let udp_len = (8 + payload.len()) as u16;
    let ip_total = (20 + 8 + payload.len()) as u16;

    let mut frame = Vec::with_capacity(ETHER_HEADER_LEN + 28 + payload.len());
    // Ethernet
    frame.extend_from_slice(&[0u8; 12]);
    frame.extend_from_slice(&[0x08, 0x00]);
    // IPv4, no options
    frame.push(0x45);
    frame.push(0x00);
    frame.extend_from_slice(&ip_total.to_be_bytes());
    frame.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]);
    frame.push(64);
    frame.push(IPPROTO_UDP);
    frame.extend_from_slice(&[0x00, 0x00]);
    frame.extend_from_slice(&[127, 0, 0, 1]);
    frame.extend_from_slice(&[127, 0, 0, 1]);
    // UDP
    frame.extend_from_slice(&src_port.to_be_bytes());
    frame.extend_from_slice(&dst_port.to_be_bytes());
    frame.extend_from_slice(&udp_len.to_be_bytes());
    frame.extend_from_slice(&[0x00, 0x00]);
    frame.extend_from_slice(payload);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn udp_frame_parses() {
        let frame = build_udp_frame(1234, 5353, b"hello");
        let p = parse_packet(&frame);
        assert!(p.valid);
        assert_eq!(p.ip_proto, IPPROTO_UDP);
        assert_eq!(p.src_port, 1234);
        assert_eq!(p.dst_port, 5353);
        assert_eq!(p.app_offset as usize, ETHER_HEADER_LEN + 20 + 8);
        assert_eq!(p.app_len, 5);
        assert_eq!(&frame[p.app_offset as usize..][..p.app_len as usize], b"hello");
    }

    #[test]
    fn tcp_frame_parses_with_header_options() {
        // TCP header with data offset 8 (32 bytes).
        let payload = b"GET /";
        let mut frame = Vec::new();
        frame.extend_from_slice(&[0u8; 12]);
        frame.extend_from_slice(&[0x08, 0x00]);
        frame.push(0x45);
        frame.push(0x00);
        let ip_total = (20 + 32 + payload.len()) as u16;
        frame.extend_from_slice(&ip_total.to_be_bytes());
        frame.extend_from_slice(&[0, 0, 0, 0]);
        frame.push(64);
        frame.push(IPPROTO_TCP);
        frame.extend_from_slice(&[0, 0]);
        frame.extend_from_slice(&[10, 0, 0, 1]);
        frame.extend_from_slice(&[10, 0, 0, 2]);
        // TCP: ports, seq, ack, offset/flags, window, checksum, urgent
        frame.extend_from_slice(&4321u16.to_be_bytes());
        frame.extend_from_slice(&80u16.to_be_bytes());
        frame.extend_from_slice(&[0; 8]);
        frame.push(0x80); // data offset 8
        frame.push(0x18);
        frame.extend_from_slice(&[0; 6]);
        frame.extend_from_slice(&[0; 12]); // options
        frame.extend_from_slice(payload);

        let p = parse_packet(&frame);
        assert!(p.valid);
        assert_eq!(p.ip_proto, IPPROTO_TCP);
        assert_eq!(p.src_port, 4321);
        assert_eq!(p.dst_port, 80);
        assert_eq!(p.app_offset as usize, ETHER_HEADER_LEN + 20 + 32);
        assert_eq!(p.app_len as usize, payload.len());
    }

    #[test]
    fn non_ipv4_is_invalid() {
        let mut frame = build_udp_frame(1, 2, b"x");
        frame[12] = 0x86; // IPv6 EtherType
        frame[13] = 0xDD;
        assert!(!parse_packet(&frame).valid);
    }

    #[test]
    fn non_tcp_udp_is_invalid() {
        let mut frame = build_udp_frame(1, 2, b"x");
        frame[ETHER_HEADER_LEN + 9] = 1; // ICMP
        let p = parse_packet(&frame);
        assert!(!p.valid);
        assert_eq!(p.ip_proto, 1);
    }

    #[test]
    fn truncated_frames_are_invalid() {
        assert!(!parse_packet(&[0u8; 10]).valid);
        let frame = build_udp_frame(1, 2, b"payload");
        // Cut into the UDP header.
        assert!(!parse_packet(&frame[..ETHER_HEADER_LEN + 20 + 4]).valid);
    }
}
