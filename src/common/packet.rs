//! Owned IP packet buffer with header accessors
//!
//! Packet channels, the dispatchers and the NAT paths all operate on this
//! type. It keeps the raw bytes and exposes just enough of the IPv4/IPv6,
//! TCP/UDP and ICMP headers to route, rewrite and answer packets. Rewrites
//! recompute the affected checksums; a packet read from the wire is never
//! re-checksummed unless it was mutated.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::error::{Error, Result};

/// IP protocol numbers the dispatchers care about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpProtocol {
    Tcp,
    Udp,
    Icmp,
    IcmpV6,
    Other(u8),
}

impl IpProtocol {
    pub fn from_number(n: u8) -> Self {
        match n {
            1 => IpProtocol::Icmp,
            6 => IpProtocol::Tcp,
            17 => IpProtocol::Udp,
            58 => IpProtocol::IcmpV6,
            other => IpProtocol::Other(other),
        }
    }

    pub fn number(&self) -> u8 {
        match self {
            IpProtocol::Icmp => 1,
            IpProtocol::Tcp => 6,
            IpProtocol::Udp => 17,
            IpProtocol::IcmpV6 => 58,
            IpProtocol::Other(n) => *n,
        }
    }
}

/// IP version of a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpVersion {
    V4,
    V6,
}

/// An owned IP packet
#[derive(Clone)]
pub struct IpPacket {
    data: Vec<u8>,
}

impl IpPacket {
    /// Wrap raw bytes, validating the version nibble and minimum length.
    pub fn new(data: Vec<u8>) -> Result<Self> {
        if data.is_empty() {
            return Err(Error::Protocol("empty packet".into()));
        }
        match data[0] >> 4 {
            4 if data.len() >= 20 => Ok(Self { data }),
            6 if data.len() >= 40 => Ok(Self { data }),
            v => Err(Error::Protocol(format!("bad IP packet (version {})", v))),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn version(&self) -> IpVersion {
        if self.data[0] >> 4 == 4 {
            IpVersion::V4
        } else {
            IpVersion::V6
        }
    }

    pub fn protocol(&self) -> IpProtocol {
        let n = match self.version() {
            IpVersion::V4 => self.data[9],
            IpVersion::V6 => self.data[6],
        };
        IpProtocol::from_number(n)
    }

    pub fn source(&self) -> IpAddr {
        match self.version() {
            IpVersion::V4 => IpAddr::V4(read_v4(&self.data[12..16])),
            IpVersion::V6 => IpAddr::V6(read_v6(&self.data[8..24])),
        }
    }

    pub fn destination(&self) -> IpAddr {
        match self.version() {
            IpVersion::V4 => IpAddr::V4(read_v4(&self.data[16..20])),
            IpVersion::V6 => IpAddr::V6(read_v6(&self.data[24..40])),
        }
    }

    pub fn is_multicast_destination(&self) -> bool {
        match self.destination() {
            IpAddr::V4(ip) => ip.is_multicast() || ip.is_broadcast(),
            IpAddr::V6(ip) => ip.is_multicast(),
        }
    }

    /// Offset of the transport header. IPv6 extension headers are not
    /// walked; packets carrying them report `Other` and take the drop path.
    fn transport_offset(&self) -> usize {
        match self.version() {
            IpVersion::V4 => ((self.data[0] & 0x0f) as usize) * 4,
            IpVersion::V6 => 40,
        }
    }

    fn transport(&self) -> Option<&[u8]> {
        let off = self.transport_offset();
        if off < self.data.len() {
            Some(&self.data[off..])
        } else {
            None
        }
    }

    /// Source port for TCP/UDP packets
    pub fn source_port(&self) -> Option<u16> {
        match self.protocol() {
            IpProtocol::Tcp | IpProtocol::Udp => {
                let t = self.transport()?;
                (t.len() >= 4).then(|| u16::from_be_bytes([t[0], t[1]]))
            }
            _ => None,
        }
    }

    /// Destination port for TCP/UDP packets
    pub fn destination_port(&self) -> Option<u16> {
        match self.protocol() {
            IpProtocol::Tcp | IpProtocol::Udp => {
                let t = self.transport()?;
                (t.len() >= 4).then(|| u16::from_be_bytes([t[2], t[3]]))
            }
            _ => None,
        }
    }

    pub fn source_endpoint(&self) -> Option<SocketAddr> {
        Some(SocketAddr::new(self.source(), self.source_port()?))
    }

    pub fn destination_endpoint(&self) -> Option<SocketAddr> {
        Some(SocketAddr::new(self.destination(), self.destination_port()?))
    }

    /// True for ICMP echo request (v4 type 8, v6 type 128)
    pub fn is_icmp_echo_request(&self) -> bool {
        match (self.protocol(), self.transport()) {
            (IpProtocol::Icmp, Some(t)) => !t.is_empty() && t[0] == 8,
            (IpProtocol::IcmpV6, Some(t)) => !t.is_empty() && t[0] == 128,
            _ => false,
        }
    }

    /// True for ICMP echo reply (v4 type 0, v6 type 129)
    pub fn is_icmp_echo_reply(&self) -> bool {
        match (self.protocol(), self.transport()) {
            (IpProtocol::Icmp, Some(t)) => !t.is_empty() && t[0] == 0,
            (IpProtocol::IcmpV6, Some(t)) => !t.is_empty() && t[0] == 129,
            _ => false,
        }
    }

    /// Echo identifier of an ICMP echo request/reply
    pub fn icmp_echo_id(&self) -> Option<u16> {
        if !self.is_icmp_echo_request() && !self.is_icmp_echo_reply() {
            return None;
        }
        let t = self.transport()?;
        (t.len() >= 8).then(|| u16::from_be_bytes([t[4], t[5]]))
    }

    /// Echo sequence number of an ICMP echo request/reply
    pub fn icmp_echo_seq(&self) -> Option<u16> {
        if !self.is_icmp_echo_request() && !self.is_icmp_echo_reply() {
            return None;
        }
        let t = self.transport()?;
        (t.len() >= 8).then(|| u16::from_be_bytes([t[6], t[7]]))
    }

    /// Payload of an ICMP echo request/reply
    pub fn icmp_echo_payload(&self) -> Option<&[u8]> {
        if !self.is_icmp_echo_request() && !self.is_icmp_echo_reply() {
            return None;
        }
        let t = self.transport()?;
        (t.len() >= 8).then(|| &t[8..])
    }

    /// UDP payload of a UDP packet
    pub fn udp_payload(&self) -> Option<&[u8]> {
        if self.protocol() != IpProtocol::Udp {
            return None;
        }
        let t = self.transport()?;
        (t.len() >= 8).then(|| &t[8..])
    }

    /// Rewrite the IPv4 source address and port, fixing checksums.
    pub fn rewrite_source_v4(&mut self, addr: Ipv4Addr, port: Option<u16>) -> Result<()> {
        self.require_v4()?;
        self.data[12..16].copy_from_slice(&addr.octets());
        if let Some(p) = port {
            let off = self.transport_offset();
            self.set_port(off, p)?;
        }
        self.update_checksums();
        Ok(())
    }

    /// Rewrite the IPv4 destination address and port, fixing checksums.
    pub fn rewrite_destination_v4(&mut self, addr: Ipv4Addr, port: Option<u16>) -> Result<()> {
        self.require_v4()?;
        self.data[16..20].copy_from_slice(&addr.octets());
        if let Some(p) = port {
            let off = self.transport_offset() + 2;
            self.set_port(off, p)?;
        }
        self.update_checksums();
        Ok(())
    }

    fn require_v4(&self) -> Result<()> {
        if self.version() == IpVersion::V4 {
            Ok(())
        } else {
            Err(Error::Protocol("IPv4 rewrite on an IPv6 packet".into()))
        }
    }

    fn set_port(&mut self, offset: usize, port: u16) -> Result<()> {
        if offset + 2 > self.data.len() {
            return Err(Error::Protocol("truncated transport header".into()));
        }
        self.data[offset..offset + 2].copy_from_slice(&port.to_be_bytes());
        Ok(())
    }

    /// Turn an ICMP echo request into the matching reply in place:
    /// addresses swapped, type flipped, checksums recomputed.
    pub fn into_icmp_echo_reply(mut self) -> Result<IpPacket> {
        if !self.is_icmp_echo_request() {
            return Err(Error::Protocol("not an ICMP echo request".into()));
        }
        let off = self.transport_offset();
        match self.version() {
            IpVersion::V4 => {
                let (src, dst) = (self.data[12..16].to_vec(), self.data[16..20].to_vec());
                self.data[12..16].copy_from_slice(&dst);
                self.data[16..20].copy_from_slice(&src);
                self.data[off] = 0; // echo reply
            }
            IpVersion::V6 => {
                let (src, dst) = (self.data[8..24].to_vec(), self.data[24..40].to_vec());
                self.data[8..24].copy_from_slice(&dst);
                self.data[24..40].copy_from_slice(&src);
                self.data[off] = 129;
            }
        }
        self.update_checksums();
        Ok(self)
    }

    /// Recompute the IPv4 header checksum and the transport checksum.
    pub fn update_checksums(&mut self) {
        let off = self.transport_offset();
        if self.version() == IpVersion::V4 {
            self.data[10] = 0;
            self.data[11] = 0;
            let sum = checksum_finish(checksum_add(0, &self.data[..off]));
            self.data[10..12].copy_from_slice(&sum.to_be_bytes());
        }
        let Some(csum_off) = self.transport_checksum_offset(off) else {
            return;
        };
        if csum_off + 2 > self.data.len() {
            return;
        }
        self.data[csum_off] = 0;
        self.data[csum_off + 1] = 0;
        let mut sum = self.pseudo_header_sum(off);
        sum = checksum_add(sum, &self.data[off..]);
        let mut csum = checksum_finish(sum);
        // RFC 768: a computed zero UDP checksum is transmitted as all ones
        if csum == 0 && self.protocol() == IpProtocol::Udp {
            csum = 0xffff;
        }
        self.data[csum_off..csum_off + 2].copy_from_slice(&csum.to_be_bytes());
    }

    fn transport_checksum_offset(&self, transport: usize) -> Option<usize> {
        match self.protocol() {
            IpProtocol::Tcp => Some(transport + 16),
            IpProtocol::Udp => Some(transport + 6),
            IpProtocol::Icmp | IpProtocol::IcmpV6 => Some(transport + 2),
            IpProtocol::Other(_) => None,
        }
    }

    fn pseudo_header_sum(&self, transport: usize) -> u32 {
        let seg_len = (self.data.len() - transport) as u32;
        match self.version() {
            // ICMPv4 checksums exclude the pseudo header
            IpVersion::V4 if self.protocol() == IpProtocol::Icmp => 0,
            IpVersion::V4 => {
                let mut sum = checksum_add(0, &self.data[12..20]);
                sum += self.data[9] as u32;
                sum += seg_len;
                sum
            }
            IpVersion::V6 => {
                let mut sum = checksum_add(0, &self.data[8..40]);
                sum += seg_len;
                sum += self.data[6] as u32;
                sum
            }
        }
    }

    /// Build a UDP/IPv4 packet from scratch (NAT reply path).
    pub fn build_udp_v4(
        src: (Ipv4Addr, u16),
        dst: (Ipv4Addr, u16),
        payload: &[u8],
    ) -> Result<IpPacket> {
        let total = 20 + 8 + payload.len();
        if total > u16::MAX as usize {
            return Err(Error::Protocol("UDP payload too large".into()));
        }
        let mut data = vec![0u8; total];
        data[0] = 0x45;
        data[2..4].copy_from_slice(&(total as u16).to_be_bytes());
        data[8] = 64; // ttl
        data[9] = 17;
        data[12..16].copy_from_slice(&src.0.octets());
        data[16..20].copy_from_slice(&dst.0.octets());
        data[20..22].copy_from_slice(&src.1.to_be_bytes());
        data[22..24].copy_from_slice(&dst.1.to_be_bytes());
        data[24..26].copy_from_slice(&((8 + payload.len()) as u16).to_be_bytes());
        data[28..].copy_from_slice(payload);
        let mut packet = IpPacket { data };
        packet.update_checksums();
        Ok(packet)
    }

    /// Build a UDP/IPv6 packet from scratch (NAT reply path).
    pub fn build_udp_v6(
        src: (Ipv6Addr, u16),
        dst: (Ipv6Addr, u16),
        payload: &[u8],
    ) -> Result<IpPacket> {
        let udp_len = 8 + payload.len();
        if udp_len > u16::MAX as usize {
            return Err(Error::Protocol("UDP payload too large".into()));
        }
        let mut data = vec![0u8; 40 + udp_len];
        data[0] = 0x60;
        data[4..6].copy_from_slice(&(udp_len as u16).to_be_bytes());
        data[6] = 17;
        data[7] = 64; // hop limit
        data[8..24].copy_from_slice(&src.0.octets());
        data[24..40].copy_from_slice(&dst.0.octets());
        data[40..42].copy_from_slice(&src.1.to_be_bytes());
        data[42..44].copy_from_slice(&dst.1.to_be_bytes());
        data[44..46].copy_from_slice(&(udp_len as u16).to_be_bytes());
        data[48..].copy_from_slice(payload);
        let mut packet = IpPacket { data };
        packet.update_checksums();
        Ok(packet)
    }

    /// Build an ICMPv4 echo request (tests and the ping proxy).
    pub fn build_icmp_echo_v4(
        src: Ipv4Addr,
        dst: Ipv4Addr,
        id: u16,
        seq: u16,
        payload: &[u8],
    ) -> Result<IpPacket> {
        Self::build_icmp_echo(IpAddr::V4(src), IpAddr::V4(dst), id, seq, payload, false)
    }

    /// Build an ICMP echo request or reply in either IP family.
    pub fn build_icmp_echo(
        src: IpAddr,
        dst: IpAddr,
        id: u16,
        seq: u16,
        payload: &[u8],
        reply: bool,
    ) -> Result<IpPacket> {
        let icmp_len = 8 + payload.len();
        let mut data = match (src, dst) {
            (IpAddr::V4(src), IpAddr::V4(dst)) => {
                let total = 20 + icmp_len;
                if total > u16::MAX as usize {
                    return Err(Error::Protocol("ICMP payload too large".into()));
                }
                let mut data = vec![0u8; total];
                data[0] = 0x45;
                data[2..4].copy_from_slice(&(total as u16).to_be_bytes());
                data[8] = 64; // ttl
                data[9] = 1;
                data[12..16].copy_from_slice(&src.octets());
                data[16..20].copy_from_slice(&dst.octets());
                data[20] = if reply { 0 } else { 8 };
                data
            }
            (IpAddr::V6(src), IpAddr::V6(dst)) => {
                if icmp_len > u16::MAX as usize {
                    return Err(Error::Protocol("ICMP payload too large".into()));
                }
                let mut data = vec![0u8; 40 + icmp_len];
                data[0] = 0x60;
                data[4..6].copy_from_slice(&(icmp_len as u16).to_be_bytes());
                data[6] = 58;
                data[7] = 64; // hop limit
                data[8..24].copy_from_slice(&src.octets());
                data[24..40].copy_from_slice(&dst.octets());
                data[40] = if reply { 129 } else { 128 };
                data
            }
            _ => return Err(Error::Protocol("mixed address families".into())),
        };
        let icmp_off = data.len() - icmp_len;
        data[icmp_off + 4..icmp_off + 6].copy_from_slice(&id.to_be_bytes());
        data[icmp_off + 6..icmp_off + 8].copy_from_slice(&seq.to_be_bytes());
        data[icmp_off + 8..].copy_from_slice(payload);
        let mut packet = IpPacket { data };
        packet.update_checksums();
        Ok(packet)
    }
}

impl std::fmt::Debug for IpPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "IpPacket({:?} {} -> {}, {} bytes)",
            self.protocol(),
            self.source(),
            self.destination(),
            self.data.len()
        )
    }
}

fn read_v4(bytes: &[u8]) -> Ipv4Addr {
    let mut b = [0u8; 4];
    b.copy_from_slice(bytes);
    Ipv4Addr::from(b)
}

fn read_v6(bytes: &[u8]) -> Ipv6Addr {
    let mut b = [0u8; 16];
    b.copy_from_slice(bytes);
    Ipv6Addr::from(b)
}

/// One's-complement sum of 16-bit big-endian words
fn checksum_add(mut sum: u32, data: &[u8]) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
    }
    if let [last] = chunks.remainder() {
        sum += (*last as u32) << 8;
    }
    sum
}

fn checksum_finish(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verify_transport_checksum(packet: &IpPacket) -> bool {
        let off = packet.transport_offset();
        let sum = checksum_add(packet.pseudo_header_sum(off), &packet.data[off..]);
        checksum_finish(sum) == 0
    }

    #[test]
    fn udp_v4_roundtrip() {
        let packet = IpPacket::build_udp_v4(
            (Ipv4Addr::new(10, 255, 0, 2), 5353),
            (Ipv4Addr::new(1, 1, 1, 1), 53),
            b"query",
        )
        .unwrap();

        assert_eq!(packet.version(), IpVersion::V4);
        assert_eq!(packet.protocol(), IpProtocol::Udp);
        assert_eq!(packet.source_port(), Some(5353));
        assert_eq!(packet.destination_port(), Some(53));
        assert_eq!(packet.udp_payload(), Some(&b"query"[..]));
        assert!(verify_transport_checksum(&packet));
    }

    #[test]
    fn udp_v6_checksum() {
        let packet = IpPacket::build_udp_v6(
            ("fd00:5ef::2".parse().unwrap(), 4000),
            ("2001:4860:4860::8888".parse().unwrap(), 53),
            b"q6",
        )
        .unwrap();
        assert_eq!(packet.version(), IpVersion::V6);
        assert!(verify_transport_checksum(&packet));
    }

    #[test]
    fn echo_reply_swaps_and_flips() {
        let request = IpPacket::build_icmp_echo_v4(
            Ipv4Addr::new(10, 255, 0, 2),
            Ipv4Addr::new(10, 255, 0, 1),
            0x1234,
            1,
            b"ping payload",
        )
        .unwrap();
        assert!(request.is_icmp_echo_request());
        assert_eq!(request.icmp_echo_id(), Some(0x1234));

        let reply = request.into_icmp_echo_reply().unwrap();
        assert!(reply.is_icmp_echo_reply());
        assert_eq!(reply.source(), "10.255.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(reply.destination(), "10.255.0.2".parse::<IpAddr>().unwrap());
        assert!(verify_transport_checksum(&reply));
    }

    #[test]
    fn rewrite_fixes_checksums() {
        let mut packet = IpPacket::build_udp_v4(
            (Ipv4Addr::new(10, 255, 0, 2), 1000),
            (Ipv4Addr::new(93, 184, 216, 34), 443),
            b"data",
        )
        .unwrap();

        packet
            .rewrite_source_v4(Ipv4Addr::new(10, 255, 255, 2), Some(2000))
            .unwrap();
        packet
            .rewrite_destination_v4(Ipv4Addr::new(127, 0, 0, 1), None)
            .unwrap();

        assert_eq!(packet.source_port(), Some(2000));
        assert_eq!(packet.source(), "10.255.255.2".parse::<IpAddr>().unwrap());
        assert_eq!(packet.destination(), "127.0.0.1".parse::<IpAddr>().unwrap());
        assert!(verify_transport_checksum(&packet));

        // IPv4 header checksum must also fold to zero
        let header = &packet.as_bytes()[..20];
        assert_eq!(checksum_finish(checksum_add(0, header)), 0);
    }

    #[test]
    fn multicast_detection() {
        let packet = IpPacket::build_udp_v4(
            (Ipv4Addr::new(10, 255, 0, 2), 5353),
            (Ipv4Addr::new(224, 0, 0, 251), 5353),
            b"mdns",
        )
        .unwrap();
        assert!(packet.is_multicast_destination());
    }

    #[test]
    fn rejects_garbage() {
        assert!(IpPacket::new(vec![]).is_err());
        assert!(IpPacket::new(vec![0x45; 4]).is_err());
        assert!(IpPacket::new(vec![0x00; 40]).is_err());
    }
}
