//! Types for parsing packet-level network protocols.
//!
//! Frames read from a capture handle are demultiplexed down to TCP with
//! [pnet::packet](https://docs.rs/pnet/latest/pnet/packet/index.html). Link-layer framing depends
//! on the capture device: Ethernet for physical interfaces, Linux cooked capture for the `any`
//! pseudo-device, and raw IP for tunnels and some loopback captures.

use pnet::packet::ethernet::{EtherType, EtherTypes, EthernetPacket};
use pnet::packet::Packet;
use thiserror::Error;

/// Length of a Linux cooked capture (v1) header.
const SLL_HEADER_LEN: usize = 16;
/// Length of a Linux cooked capture (v2) header.
const SLL2_HEADER_LEN: usize = 20;
/// Length of an 802.1Q tag.
const VLAN_TAG_LEN: usize = 4;

/// Link-layer header type of a capture, as reported by libpcap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    /// `DLT_EN10MB`
    Ethernet,
    /// `DLT_LINUX_SLL`
    LinuxSll,
    /// `DLT_LINUX_SLL2`
    LinuxSll2,
    /// `DLT_RAW` and its platform aliases.
    RawIp,
    /// `DLT_NULL` (BSD loopback).
    Null,
}

impl LinkType {
    /// Maps a libpcap data link type number to a supported link type.
    pub fn from_dlt(dlt: i32) -> Result<Self, PacketParseError> {
        match dlt {
            1 => Ok(LinkType::Ethernet),
            113 => Ok(LinkType::LinuxSll),
            276 => Ok(LinkType::LinuxSll2),
            12 | 14 | 101 => Ok(LinkType::RawIp),
            0 => Ok(LinkType::Null),
            other => Err(PacketParseError::UnsupportedLinkType(other)),
        }
    }
}

/// Network-layer protocol carried in a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NetworkProtocol {
    Ipv4,
    Ipv6,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PacketParseError {
    #[error("Unsupported link type {0}")]
    UnsupportedLinkType(i32),

    #[error("Truncated {0} header")]
    Truncated(&'static str),

    #[error("Not IP (ethertype {0:#06x})")]
    NotIp(u16),

    #[error("Not TCP")]
    NotTcp,
}

/// Strips the link-layer header of `frame`, returning the network protocol and its bytes.
pub(crate) fn network_layer(
    link: LinkType,
    frame: &[u8],
) -> Result<(NetworkProtocol, &[u8]), PacketParseError> {
    match link {
        LinkType::Ethernet => {
            let eth = EthernetPacket::new(frame).ok_or(PacketParseError::Truncated("Ethernet"))?;
            let offset = frame.len() - eth.payload().len();
            let mut ethertype = eth.get_ethertype();
            let mut payload = &frame[offset..];
            while ethertype == EtherTypes::Vlan {
                if payload.len() < VLAN_TAG_LEN {
                    return Err(PacketParseError::Truncated("802.1Q"));
                }
                ethertype = EtherType(u16::from_be_bytes([payload[2], payload[3]]));
                payload = &payload[VLAN_TAG_LEN..];
            }
            Ok((by_ethertype(ethertype)?, payload))
        }
        LinkType::LinuxSll => {
            if frame.len() < SLL_HEADER_LEN {
                return Err(PacketParseError::Truncated("Linux SLL"));
            }
            let ethertype = EtherType(u16::from_be_bytes([frame[14], frame[15]]));
            Ok((by_ethertype(ethertype)?, &frame[SLL_HEADER_LEN..]))
        }
        LinkType::LinuxSll2 => {
            if frame.len() < SLL2_HEADER_LEN {
                return Err(PacketParseError::Truncated("Linux SLL2"));
            }
            let ethertype = EtherType(u16::from_be_bytes([frame[0], frame[1]]));
            Ok((by_ethertype(ethertype)?, &frame[SLL2_HEADER_LEN..]))
        }
        LinkType::RawIp => by_version(frame),
        LinkType::Null => {
            if frame.len() < 4 {
                return Err(PacketParseError::Truncated("loopback"));
            }
            by_version(&frame[4..])
        }
    }
}

fn by_ethertype(ethertype: EtherType) -> Result<NetworkProtocol, PacketParseError> {
    match ethertype {
        EtherTypes::Ipv4 => Ok(NetworkProtocol::Ipv4),
        EtherTypes::Ipv6 => Ok(NetworkProtocol::Ipv6),
        EtherType(other) => Err(PacketParseError::NotIp(other)),
    }
}

/// Detects the IP version from the first nibble of a raw IP packet.
fn by_version(packet: &[u8]) -> Result<(NetworkProtocol, &[u8]), PacketParseError> {
    match packet.first().map(|b| b >> 4) {
        Some(4) => Ok((NetworkProtocol::Ipv4, packet)),
        Some(6) => Ok((NetworkProtocol::Ipv6, packet)),
        Some(_) => Err(PacketParseError::NotIp(0)),
        None => Err(PacketParseError::Truncated("IP")),
    }
}
