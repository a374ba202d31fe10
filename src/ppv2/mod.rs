//! PROXY Protocol v2 wire codec.
//!
//! Pure encode/decode over byte slices — no I/O, no async, exhaustively
//! unit-testable. Mirrors the wire layout from the HAProxy PROXY protocol
//! spec: 12-byte signature, version/command byte, family/transport byte,
//! big-endian address-block length, then the address block itself.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// 12-byte PROXY v2 signature.
pub const SIGNATURE: [u8; 12] = [
    0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A,
];

const VERSION_COMMAND_PROXY: u8 = 0x21;
const VERSION_COMMAND_LOCAL: u8 = 0x20;

const FAMILY_UNSPEC: u8 = 0x0;
const FAMILY_INET: u8 = 0x1;
const FAMILY_INET6: u8 = 0x2;
const FAMILY_UNIX: u8 = 0x3;

const TRANSPORT_UNSPEC: u8 = 0x0;
const TRANSPORT_STREAM: u8 = 0x1;
const TRANSPORT_DGRAM: u8 = 0x2;

const INET_ADDR_LEN: u16 = 12;
const INET6_ADDR_LEN: u16 = 36;

/// Header layer cap for [`decode_chain`]; bounds worst-case work on
/// adversarial input that looks like an unbroken run of headers.
pub const MAX_CHAIN_DEPTH: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Local,
    Proxy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Unspec,
    Inet,
    Inet6,
    Unix,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Unspec,
    Stream,
    Dgram,
}

/// A decoded PROXY v2 header. Address fields are empty for UNSPEC/UNIX
/// families — only metadata is meaningful in those cases.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub command: Command,
    pub family: Family,
    pub transport: Transport,
    pub src: Option<(IpAddr, u16)>,
    pub dst: Option<(IpAddr, u16)>,
    /// Total bytes consumed from the input for this header (16 + AL).
    pub len: usize,
}

/// Result of decoding a chain of back-to-back headers from one buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chain<'a> {
    pub headers: Vec<Header>,
    pub payload: &'a [u8],
}

impl<'a> Chain<'a> {
    /// The original client's address/port: the *last* header's source,
    /// reflecting the closest upstream proxy's authoritative view.
    pub fn original_client(&self) -> Option<(IpAddr, u16)> {
        self.headers.last().and_then(|h| h.src)
    }
}

/// Normalize an IPv4-mapped IPv6 address (`::ffff:a.b.c.d`) to its dotted
/// quad. Any other address is returned unchanged.
pub fn normalize_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        },
        other => other,
    }
}

/// Encode a PROXY v2 header for `src -> dst`, selecting DGRAM when
/// `is_udp` and STREAM otherwise. Family is chosen from the normalized
/// source address.
pub fn encode(src: (IpAddr, u16), dst: (IpAddr, u16), is_udp: bool) -> Vec<u8> {
    let src_ip = normalize_ip(src.0);
    let dst_ip = normalize_ip(dst.0);
    let transport = if is_udp {
        TRANSPORT_DGRAM
    } else {
        TRANSPORT_STREAM
    };

    match (src_ip, dst_ip) {
        (IpAddr::V4(s), IpAddr::V4(d)) => encode_v4(s, src.1, d, dst.1, transport),
        (IpAddr::V6(s), IpAddr::V6(d)) => encode_v6(s, src.1, d, dst.1, transport),
        (IpAddr::V4(s), IpAddr::V6(d)) => {
            encode_v6(ipv4_to_mapped_v6(s), src.1, d, dst.1, transport)
        }
        (IpAddr::V6(s), IpAddr::V4(d)) => {
            encode_v6(s, src.1, ipv4_to_mapped_v6(d), dst.1, transport)
        }
    }
}

fn ipv4_to_mapped_v6(v4: Ipv4Addr) -> Ipv6Addr {
    v4.to_ipv6_mapped()
}

fn encode_v4(src: Ipv4Addr, src_port: u16, dst: Ipv4Addr, dst_port: u16, transport: u8) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16 + INET_ADDR_LEN as usize);
    buf.extend_from_slice(&SIGNATURE);
    buf.push(VERSION_COMMAND_PROXY);
    buf.push((FAMILY_INET << 4) | transport);
    buf.extend_from_slice(&INET_ADDR_LEN.to_be_bytes());
    buf.extend_from_slice(&src.octets());
    buf.extend_from_slice(&dst.octets());
    buf.extend_from_slice(&src_port.to_be_bytes());
    buf.extend_from_slice(&dst_port.to_be_bytes());
    buf
}

fn encode_v6(src: Ipv6Addr, src_port: u16, dst: Ipv6Addr, dst_port: u16, transport: u8) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16 + INET6_ADDR_LEN as usize);
    buf.extend_from_slice(&SIGNATURE);
    buf.push(VERSION_COMMAND_PROXY);
    buf.push((FAMILY_INET6 << 4) | transport);
    buf.extend_from_slice(&INET6_ADDR_LEN.to_be_bytes());
    buf.extend_from_slice(&src.octets());
    buf.extend_from_slice(&dst.octets());
    buf.extend_from_slice(&src_port.to_be_bytes());
    buf.extend_from_slice(&dst_port.to_be_bytes());
    buf
}

/// Decode a single header at the start of `data`. Returns `None` on any
/// length shortfall or signature mismatch — both are non-fatal, treated
/// as "no header present."
pub fn decode_one(data: &[u8]) -> Option<Header> {
    if data.len() < 16 || data[..12] != SIGNATURE {
        return None;
    }

    let version_command = data[12];
    let version = version_command >> 4;
    let command = if version_command & 0x0F == 1 {
        Command::Proxy
    } else {
        Command::Local
    };

    let family_byte = data[13];
    let family_nibble = family_byte >> 4;
    let transport_nibble = family_byte & 0x0F;

    let family = match family_nibble {
        x if x == FAMILY_INET => Family::Inet,
        x if x == FAMILY_INET6 => Family::Inet6,
        x if x == FAMILY_UNIX => Family::Unix,
        _ => Family::Unspec,
    };
    let transport = match transport_nibble {
        x if x == TRANSPORT_STREAM => Transport::Stream,
        x if x == TRANSPORT_DGRAM => Transport::Dgram,
        _ => Transport::Unspec,
    };

    let addr_len = u16::from_be_bytes([data[14], data[15]]) as usize;
    if data.len() < 16 + addr_len {
        return None;
    }
    let block = &data[16..16 + addr_len];

    let (src, dst) = match (family, transport) {
        (Family::Inet, Transport::Stream) | (Family::Inet, Transport::Dgram) => {
            if block.len() < INET_ADDR_LEN as usize {
                (None, None)
            } else {
                let src_ip = Ipv4Addr::new(block[0], block[1], block[2], block[3]);
                let dst_ip = Ipv4Addr::new(block[4], block[5], block[6], block[7]);
                let src_port = u16::from_be_bytes([block[8], block[9]]);
                let dst_port = u16::from_be_bytes([block[10], block[11]]);
                (
                    Some((IpAddr::V4(src_ip), src_port)),
                    Some((IpAddr::V4(dst_ip), dst_port)),
                )
            }
        }
        (Family::Inet6, Transport::Stream) | (Family::Inet6, Transport::Dgram) => {
            if block.len() < INET6_ADDR_LEN as usize {
                (None, None)
            } else {
                let src_ip = Ipv6Addr::from(<[u8; 16]>::try_from(&block[0..16]).unwrap());
                let dst_ip = Ipv6Addr::from(<[u8; 16]>::try_from(&block[16..32]).unwrap());
                let src_port = u16::from_be_bytes([block[32], block[33]]);
                let dst_port = u16::from_be_bytes([block[34], block[35]]);
                (
                    Some((IpAddr::V6(src_ip), src_port)),
                    Some((IpAddr::V6(dst_ip), dst_port)),
                )
            }
        }
        _ => (None, None),
    };

    Some(Header {
        version,
        command,
        family,
        transport,
        src,
        dst,
        len: 16 + addr_len,
    })
}

/// Decode a run of back-to-back headers starting at the beginning of
/// `data`. Stops at the first non-matching byte sequence, at
/// [`MAX_CHAIN_DEPTH`] headers, or at end of input. The remaining bytes
/// are the real payload.
pub fn decode_chain(data: &[u8]) -> Chain<'_> {
    let mut headers = Vec::new();
    let mut offset = 0usize;

    while headers.len() < MAX_CHAIN_DEPTH {
        match decode_one(&data[offset..]) {
            Some(header) => {
                offset += header.len;
                headers.push(header);
            }
            None => break,
        }
    }

    Chain {
        headers,
        payload: &data[offset..],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> (IpAddr, u16) {
        let sa: std::net::SocketAddr = s.parse().unwrap();
        (sa.ip(), sa.port())
    }

    #[test]
    fn test_round_trip_ipv4_stream() {
        let src = addr("192.168.1.1:12345");
        let dst = addr("10.0.0.1:443");
        let encoded = encode(src, dst, false);
        assert_eq!(encoded.len(), 28);
        let header = decode_one(&encoded).unwrap();
        assert_eq!(header.command, Command::Proxy);
        assert_eq!(header.family, Family::Inet);
        assert_eq!(header.transport, Transport::Stream);
        assert_eq!(header.src, Some(src));
        assert_eq!(header.dst, Some(dst));
        assert_eq!(header.len, 28);
    }

    #[test]
    fn test_round_trip_ipv6_dgram() {
        let src = addr("[2001:db8::1]:12345");
        let dst = addr("[2001:db8::2]:19132");
        let encoded = encode(src, dst, true);
        assert_eq!(encoded.len(), 52);
        let header = decode_one(&encoded).unwrap();
        assert_eq!(header.family, Family::Inet6);
        assert_eq!(header.transport, Transport::Dgram);
        assert_eq!(header.src, Some(src));
        assert_eq!(header.dst, Some(dst));
    }

    #[test]
    fn test_ipv4_mapped_ipv6_normalizes_to_inet() {
        let mapped: IpAddr = "::ffff:192.168.1.1".parse().unwrap();
        let encoded = encode((mapped, 1), (mapped, 2), false);
        let header = decode_one(&encoded).unwrap();
        assert_eq!(header.family, Family::Inet);
    }

    #[test]
    fn test_decode_rejects_bad_signature() {
        let mut buf = vec![0u8; 28];
        buf[0] = 0xFF;
        assert!(decode_one(&buf).is_none());
    }

    #[test]
    fn test_decode_rejects_length_shortfall() {
        let src = addr("1.2.3.4:1");
        let dst = addr("5.6.7.8:2");
        let mut encoded = encode(src, dst, false);
        encoded.truncate(encoded.len() - 1);
        assert!(decode_one(&encoded).is_none());
    }

    #[test]
    fn test_decode_chain_extracts_payload_after_headers() {
        let h1 = encode(addr("1.1.1.1:10"), addr("2.2.2.2:20"), false);
        let h2 = encode(addr("3.3.3.3:30"), addr("4.4.4.4:40"), false);
        let mut buf = Vec::new();
        buf.extend_from_slice(&h1);
        buf.extend_from_slice(&h2);
        buf.extend_from_slice(b"hello");

        let chain = decode_chain(&buf);
        assert_eq!(chain.headers.len(), 2);
        assert_eq!(chain.payload, b"hello");
        assert_eq!(chain.original_client(), Some(addr("3.3.3.3:30")));
    }

    #[test]
    fn test_decode_chain_empty_when_no_signature() {
        let chain = decode_chain(b"not a header at all");
        assert!(chain.headers.is_empty());
        assert_eq!(chain.payload, b"not a header at all");
    }

    #[test]
    fn test_decode_chain_caps_at_max_depth() {
        let single = encode(addr("1.1.1.1:1"), addr("2.2.2.2:2"), false);
        let mut buf = Vec::new();
        for _ in 0..(MAX_CHAIN_DEPTH + 5) {
            buf.extend_from_slice(&single);
        }
        let chain = decode_chain(&buf);
        assert_eq!(chain.headers.len(), MAX_CHAIN_DEPTH);
        assert_eq!(chain.payload.len(), 5 * single.len());
    }

    #[test]
    fn test_original_client_none_for_empty_chain() {
        let chain = decode_chain(b"payload only");
        assert_eq!(chain.original_client(), None);
    }

    #[test]
    fn test_local_command_decodes() {
        let mut buf = vec![0u8; 16];
        buf[..12].copy_from_slice(&SIGNATURE);
        buf[12] = VERSION_COMMAND_LOCAL;
        buf[13] = 0;
        buf[14..16].copy_from_slice(&0u16.to_be_bytes());
        let header = decode_one(&buf).unwrap();
        assert_eq!(header.command, Command::Local);
        assert_eq!(header.family, Family::Unspec);
        assert_eq!(header.src, None);
    }
}
