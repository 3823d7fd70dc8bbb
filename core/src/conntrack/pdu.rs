use super::conn_id::FourTuple;
use crate::protocols::packet::{network_layer, LinkType, NetworkProtocol, PacketParseError};

use std::net::{IpAddr, SocketAddr};

use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::ipv6::Ipv6Packet;
use pnet::packet::tcp::TcpPacket;
use pnet::packet::Packet;

// TCP flags.
pub const ACK: u8 = 0b0001_0000;
pub const RST: u8 = 0b0000_0100;
pub const SYN: u8 = 0b0000_0010;
pub const FIN: u8 = 0b0000_0001;

/// Transport-layer protocol data unit for stream reassembly.
#[derive(Debug, Clone)]
pub struct L4Pdu {
    /// Transport layer context.
    pub(crate) ctxt: L4Context,
    /// TCP payload.
    pub(crate) payload: Vec<u8>,
}

impl L4Pdu {
    pub fn new(ctxt: L4Context, payload: Vec<u8>) -> Self {
        L4Pdu { ctxt, payload }
    }

    /// Parses a captured frame of link type `link` down to its TCP segment.
    pub fn parse(link: LinkType, frame: &[u8]) -> Result<Self, PacketParseError> {
        let (proto, packet) = network_layer(link, frame)?;
        match proto {
            NetworkProtocol::Ipv4 => {
                let ipv4 = Ipv4Packet::new(packet).ok_or(PacketParseError::Truncated("IPv4"))?;
                if ipv4.get_next_level_protocol() != IpNextHeaderProtocols::Tcp {
                    return Err(PacketParseError::NotTcp);
                }
                Self::from_tcp(
                    IpAddr::V4(ipv4.get_source()),
                    IpAddr::V4(ipv4.get_destination()),
                    ipv4.payload(),
                )
            }
            NetworkProtocol::Ipv6 => {
                let ipv6 = Ipv6Packet::new(packet).ok_or(PacketParseError::Truncated("IPv6"))?;
                // Extension headers are not followed.
                if ipv6.get_next_header() != IpNextHeaderProtocols::Tcp {
                    return Err(PacketParseError::NotTcp);
                }
                Self::from_tcp(
                    IpAddr::V6(ipv6.get_source()),
                    IpAddr::V6(ipv6.get_destination()),
                    ipv6.payload(),
                )
            }
        }
    }

    fn from_tcp(src: IpAddr, dst: IpAddr, segment: &[u8]) -> Result<Self, PacketParseError> {
        let tcp = TcpPacket::new(segment).ok_or(PacketParseError::Truncated("TCP"))?;
        let payload = tcp.payload().to_vec();
        let ctxt = L4Context {
            src: SocketAddr::new(src, tcp.get_source()),
            dst: SocketAddr::new(dst, tcp.get_destination()),
            length: payload.len(),
            seq_no: tcp.get_sequence(),
            flags: (tcp.get_flags() & 0xff) as u8,
        };
        Ok(L4Pdu { ctxt, payload })
    }

    /// Sender and receiver of the segment.
    #[inline]
    pub fn endpoints(&self) -> FourTuple {
        FourTuple::new(self.ctxt.src, self.ctxt.dst)
    }

    #[inline]
    pub fn length(&self) -> usize {
        self.ctxt.length
    }

    #[inline]
    pub fn seq_no(&self) -> u32 {
        self.ctxt.seq_no
    }

    #[inline]
    pub fn flags(&self) -> u8 {
        self.ctxt.flags
    }

    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

/// Parsed transport-layer context from the packet used for connection tracking.
#[derive(Debug, Clone, Copy)]
pub struct L4Context {
    /// Source socket address.
    pub src: SocketAddr,
    /// Destination socket address.
    pub dst: SocketAddr,
    /// Length of the payload in bytes.
    pub length: usize,
    /// Raw sequence number of segment.
    pub seq_no: u32,
    /// TCP flags.
    pub flags: u8,
}

#[cfg(test)]
mod tests {
    use super::*;

    use pnet::packet::ethernet::{EtherTypes, MutableEthernetPacket};
    use pnet::packet::ipv4::MutableIpv4Packet;
    use pnet::packet::tcp::MutableTcpPacket;

    fn ethernet_frame(payload: &[u8], flags: u8) -> Vec<u8> {
        let tcp_len = 20 + payload.len();
        let mut buffer = vec![0u8; 14 + 20 + tcp_len];

        let mut eth = MutableEthernetPacket::new(&mut buffer[..14]).unwrap();
        eth.set_ethertype(EtherTypes::Ipv4);

        let mut ip = MutableIpv4Packet::new(&mut buffer[14..34]).unwrap();
        ip.set_version(4);
        ip.set_header_length(5);
        ip.set_total_length((20 + tcp_len) as u16);
        ip.set_ttl(64);
        ip.set_next_level_protocol(IpNextHeaderProtocols::Tcp);
        ip.set_source("10.0.0.1".parse().unwrap());
        ip.set_destination("10.0.0.2".parse().unwrap());

        let mut tcp = MutableTcpPacket::new(&mut buffer[34..]).unwrap();
        tcp.set_source(40000);
        tcp.set_destination(80);
        tcp.set_sequence(1000);
        tcp.set_data_offset(5);
        tcp.set_flags(u16::from(flags));
        tcp.set_payload(payload);
        buffer
    }

    #[test]
    fn parses_ethernet_ipv4_tcp() {
        let frame = ethernet_frame(b"GET / HTTP/1.1\r\n\r\n", ACK);
        let pdu = L4Pdu::parse(LinkType::Ethernet, &frame).unwrap();
        assert_eq!(pdu.endpoints().src, "10.0.0.1:40000".parse().unwrap());
        assert_eq!(pdu.endpoints().dst, "10.0.0.2:80".parse().unwrap());
        assert_eq!(pdu.seq_no(), 1000);
        assert_eq!(pdu.flags(), ACK);
        assert_eq!(pdu.payload(), b"GET / HTTP/1.1\r\n\r\n");
    }

    #[test]
    fn parses_linux_cooked_capture() {
        let frame = ethernet_frame(b"", SYN);
        let mut sll = vec![0u8; 16];
        sll[14..16].copy_from_slice(&0x0800u16.to_be_bytes());
        sll.extend_from_slice(&frame[14..]);
        let pdu = L4Pdu::parse(LinkType::LinuxSll, &sll).unwrap();
        assert_eq!(pdu.flags(), SYN);
        assert_eq!(pdu.length(), 0);
    }

    #[test]
    fn rejects_non_ip_frames() {
        let mut frame = ethernet_frame(b"", ACK);
        frame[12..14].copy_from_slice(&0x0806u16.to_be_bytes());
        assert_eq!(
            L4Pdu::parse(LinkType::Ethernet, &frame).unwrap_err(),
            PacketParseError::NotIp(0x0806)
        );
        assert!(L4Pdu::parse(LinkType::RawIp, &[]).is_err());
    }
}
