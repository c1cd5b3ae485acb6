//! TCP segment encoding and checksum.
//!
//! Probes are a fixed 32-byte TCP header: the 20-byte base header followed by
//! a 12-byte options block (MSS, End-of-Options, zero padding). Every field is
//! written big-endian at a fixed offset; nothing depends on in-memory struct
//! layout.

use std::net::{IpAddr, Ipv4Addr};

/// IP protocol number for TCP.
pub const TCP_PROTOCOL: u8 = 6;

/// Length of the base TCP header without options.
pub const TCP_BASE_HEADER_LEN: usize = 20;

/// Length of the options block carried by every probe.
pub const TCP_OPTIONS_LEN: usize = 12;

/// Total probe length: base header + options.
pub const SEGMENT_LEN: usize = TCP_BASE_HEADER_LEN + TCP_OPTIONS_LEN;

/// Offset of the flags byte within a TCP header.
pub const FLAGS_OFFSET: usize = 13;

/// Offset of the checksum field within a TCP header.
pub const CHECKSUM_OFFSET: usize = 16;

/// SYN control bit.
pub const FLAG_SYN: u8 = 0x02;
/// RST control bit.
pub const FLAG_RST: u8 = 0x04;
/// ACK control bit.
pub const FLAG_ACK: u8 = 0x10;
/// SYN+ACK, the only reply that marks a port open.
pub const FLAGS_SYN_ACK: u8 = FLAG_SYN | FLAG_ACK;

/// Data offset (8 words = 32 bytes) in the top nibble, SYN in the low byte.
pub const SYN_OFFSET_FLAGS: u16 = ((SEGMENT_LEN as u16 / 4) << 12) | FLAG_SYN as u16;

/// Receive window advertised by probes.
pub const DEFAULT_WINDOW: u16 = 1024;

/// Maximum segment size advertised by probes.
pub const DEFAULT_MSS: u16 = 1460;

const PSEUDO_HEADER_LEN: usize = 12;
const OPTION_KIND_EOL: u8 = 0;
const OPTION_KIND_MSS: u8 = 2;
const OPTION_LEN_MSS: u8 = 4;

/// Fixed-size TCP header fields, in wire order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    /// Data offset, reserved bits and control flags as one 16-bit field.
    pub offset_flags: u16,
    pub window: u16,
    pub checksum: u16,
    pub urgent_ptr: u16,
}

impl TcpHeader {
    /// A SYN header with a zeroed checksum, ready for encoding.
    pub fn syn(src_port: u16, dst_port: u16, seq: u32, window: u16) -> Self {
        Self {
            src_port,
            dst_port,
            seq,
            ack: 0,
            offset_flags: SYN_OFFSET_FLAGS,
            window,
            checksum: 0,
            urgent_ptr: 0,
        }
    }

    /// Control-flag byte (low byte of `offset_flags`).
    pub fn flags(&self) -> u8 {
        self.offset_flags as u8
    }

    /// Header length in bytes, from the data-offset nibble.
    pub fn header_len(&self) -> usize {
        ((self.offset_flags >> 12) as usize) * 4
    }

    /// Read the base header fields back from the start of `segment`.
    ///
    /// Returns `None` if fewer than 20 bytes are available.
    pub fn decode(segment: &[u8]) -> Option<Self> {
        if segment.len() < TCP_BASE_HEADER_LEN {
            return None;
        }
        Some(Self {
            src_port: be_u16(segment, 0)?,
            dst_port: be_u16(segment, 2)?,
            seq: be_u32(segment, 4)?,
            ack: be_u32(segment, 8)?,
            offset_flags: be_u16(segment, 12)?,
            window: be_u16(segment, 14)?,
            checksum: be_u16(segment, CHECKSUM_OFFSET)?,
            urgent_ptr: be_u16(segment, 18)?,
        })
    }
}

/// Options block shared by every probe of a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpOptions {
    pub mss: u16,
}

impl TcpOptions {
    /// Options advertising the given MSS.
    pub fn with_mss(mss: u16) -> Self {
        Self { mss }
    }

    /// MSS (kind 2, len 4), End-of-Options, then zero padding to 12 bytes.
    pub fn to_bytes(&self) -> [u8; TCP_OPTIONS_LEN] {
        let mut out = [0u8; TCP_OPTIONS_LEN];
        out[0] = OPTION_KIND_MSS;
        out[1] = OPTION_LEN_MSS;
        out[2..4].copy_from_slice(&self.mss.to_be_bytes());
        out[4] = OPTION_KIND_EOL;
        out
    }
}

impl Default for TcpOptions {
    fn default() -> Self {
        Self::with_mss(DEFAULT_MSS)
    }
}

/// Serialize `header` followed by `options` into a probe segment.
pub fn encode_segment(header: &TcpHeader, options: &TcpOptions) -> [u8; SEGMENT_LEN] {
    let mut seg = [0u8; SEGMENT_LEN];
    seg[0..2].copy_from_slice(&header.src_port.to_be_bytes());
    seg[2..4].copy_from_slice(&header.dst_port.to_be_bytes());
    seg[4..8].copy_from_slice(&header.seq.to_be_bytes());
    seg[8..12].copy_from_slice(&header.ack.to_be_bytes());
    seg[12..14].copy_from_slice(&header.offset_flags.to_be_bytes());
    seg[14..16].copy_from_slice(&header.window.to_be_bytes());
    seg[16..18].copy_from_slice(&header.checksum.to_be_bytes());
    seg[18..20].copy_from_slice(&header.urgent_ptr.to_be_bytes());
    seg[TCP_BASE_HEADER_LEN..].copy_from_slice(&options.to_bytes());
    seg
}

/// TCP checksum of `segment` over the IPv4 pseudo-header.
///
/// The pseudo-header length field only carries the low byte of the segment
/// length, so the result is correct for segments shorter than 256 bytes.
/// Passing a segment whose checksum field already holds the right value
/// returns zero.
pub fn compute_checksum(segment: &[u8], src: Ipv4Addr, dst: Ipv4Addr) -> u16 {
    let mut pseudo = [0u8; PSEUDO_HEADER_LEN];
    pseudo[0..4].copy_from_slice(&src.octets());
    pseudo[4..8].copy_from_slice(&dst.octets());
    pseudo[9] = TCP_PROTOCOL;
    pseudo[11] = segment.len() as u8;

    let mut sum = word_sum(&pseudo) + word_sum(segment);
    sum = (sum >> 16) + (sum & 0xFFFF);
    sum += sum >> 16;
    !(sum as u16)
}

/// True if the checksum embedded in `segment` is valid for the address pair.
pub fn verify_checksum(segment: &[u8], src: Ipv4Addr, dst: Ipv4Addr) -> bool {
    compute_checksum(segment, src, dst) == 0
}

/// Build a complete SYN probe from `src` to `dst`.
///
/// A fresh random sequence number is drawn for every call and returned next to
/// the bytes. The checksum is filled in last for IPv4 pairs; for IPv6 it is
/// left zero for the kernel to fill (see `IPV6_CHECKSUM`).
pub fn build_syn_segment(
    src: IpAddr,
    dst: IpAddr,
    src_port: u16,
    dst_port: u16,
    window: u16,
    options: &TcpOptions,
) -> ([u8; SEGMENT_LEN], u32) {
    let seq: u32 = rand::random();
    let header = TcpHeader::syn(src_port, dst_port, seq, window);
    let mut segment = encode_segment(&header, options);

    if let (IpAddr::V4(s), IpAddr::V4(d)) = (src, dst) {
        let checksum = compute_checksum(&segment, s, d);
        segment[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 2].copy_from_slice(&checksum.to_be_bytes());
    }

    (segment, seq)
}

/// Strip the IPv4 header from a datagram captured on a raw IPv4 socket.
///
/// Linux hands raw IPv4 readers the full datagram; the TCP header starts
/// after IHL words. Returns `None` for anything that is not a well-formed
/// IPv4 header.
pub fn ipv4_payload_offset(datagram: &[u8]) -> Option<usize> {
    let first = *datagram.first()?;
    if first >> 4 != 4 {
        return None;
    }
    let ihl = ((first & 0x0F) as usize) * 4;
    if ihl < 20 || ihl > datagram.len() {
        return None;
    }
    Some(ihl)
}

/// Big-endian u16 at `offset`, if in bounds.
pub fn be_u16(buf: &[u8], offset: usize) -> Option<u16> {
    let bytes = buf.get(offset..offset + 2)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

fn be_u32(buf: &[u8], offset: usize) -> Option<u32> {
    let bytes = buf.get(offset..offset + 4)?;
    Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Sum of big-endian 16-bit words; an odd trailing byte is padded with zero.
fn word_sum(data: &[u8]) -> u32 {
    let mut chunks = data.chunks_exact(2);
    let mut sum: u32 = chunks
        .by_ref()
        .map(|w| u16::from_be_bytes([w[0], w[1]]) as u32)
        .sum();
    if let [last] = chunks.remainder() {
        sum += (*last as u32) << 8;
    }
    sum
}

#[cfg(test)]
mod tests {
    use super::*;

    const SRC: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 100);
    const DST: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);

    #[test]
    fn test_options_block_layout() {
        let opts = TcpOptions::default().to_bytes();
        assert_eq!(opts[0], 2, "first option must be MSS");
        assert_eq!(opts[1], 4, "MSS length must be 4");
        assert_eq!(u16::from_be_bytes([opts[2], opts[3]]), 1460);
        assert_eq!(opts[4], 0, "MSS must be followed by End-of-Options");
        assert!(opts[5..].iter().all(|&b| b == 0), "padding must be zero");
    }

    #[test]
    fn test_syn_header_offset_and_flags() {
        let header = TcpHeader::syn(50000, 80, 1, DEFAULT_WINDOW);
        assert_eq!(header.offset_flags, 0x8002);
        assert_eq!(header.header_len(), SEGMENT_LEN);
        assert_eq!(header.flags(), FLAG_SYN);
        assert_eq!(header.ack, 0);
        assert_eq!(header.urgent_ptr, 0);
    }

    #[test]
    fn test_encode_field_order() {
        let header = TcpHeader {
            src_port: 0x1234,
            dst_port: 0x5678,
            seq: 0xDEADBEEF,
            ack: 0x01020304,
            offset_flags: 0x8002,
            window: 0x0400,
            checksum: 0xABCD,
            urgent_ptr: 0x0009,
        };
        let seg = encode_segment(&header, &TcpOptions::default());
        assert_eq!(seg.len(), 32);
        assert_eq!(
            &seg[..20],
            &[
                0x12, 0x34, 0x56, 0x78, 0xDE, 0xAD, 0xBE, 0xEF, 0x01, 0x02, 0x03, 0x04, 0x80,
                0x02, 0x04, 0x00, 0xAB, 0xCD, 0x00, 0x09
            ]
        );
        assert_eq!(TcpHeader::decode(&seg), Some(header));
    }

    #[test]
    fn test_ports_and_flags_recoverable_for_every_port() {
        let opts = TcpOptions::default();
        for port in 0..=u16::MAX {
            let header = TcpHeader::syn(port, u16::MAX - port, 7, DEFAULT_WINDOW);
            let seg = encode_segment(&header, &opts);
            assert_eq!(be_u16(&seg, 0), Some(port));
            assert_eq!(be_u16(&seg, 2), Some(u16::MAX - port));
            assert_eq!(seg[FLAGS_OFFSET], FLAG_SYN);
        }
    }

    #[test]
    fn test_checksum_deterministic() {
        let seg = encode_segment(&TcpHeader::syn(40000, 22, 99, 1024), &TcpOptions::default());
        let first = compute_checksum(&seg, SRC, DST);
        for _ in 0..10 {
            assert_eq!(compute_checksum(&seg, SRC, DST), first);
        }
    }

    #[test]
    fn test_checksum_validates_to_zero_once_embedded() {
        for dst_port in [0u16, 1, 22, 80, 443, 8080, 65535] {
            let (seg, _) = build_syn_segment(
                IpAddr::V4(SRC),
                IpAddr::V4(DST),
                51000,
                dst_port,
                DEFAULT_WINDOW,
                &TcpOptions::default(),
            );
            assert!(
                verify_checksum(&seg, SRC, DST),
                "embedded checksum must re-sum to zero (port {dst_port})"
            );
        }
    }

    #[test]
    fn test_checksum_depends_on_addresses() {
        let (seg, _) = build_syn_segment(
            IpAddr::V4(SRC),
            IpAddr::V4(DST),
            51000,
            80,
            DEFAULT_WINDOW,
            &TcpOptions::default(),
        );
        assert!(!verify_checksum(&seg, SRC, Ipv4Addr::new(10, 0, 0, 2)));
    }

    #[test]
    fn test_checksum_known_vector() {
        // Pseudo-header words: c0a8 0164 0a00 0001 0006 0004; segment: 0001 0002.
        let seg = [0x00, 0x01, 0x00, 0x02];
        let expected = !(0xc0a8u32 + 0x0164 + 0x0a00 + 0x0001 + 0x0006 + 0x0004 + 0x0001 + 0x0002)
            as u16;
        assert_eq!(compute_checksum(&seg, SRC, DST), expected);
    }

    #[test]
    fn test_checksum_odd_length_padded() {
        let odd = [0x12, 0x34, 0x56];
        let padded = [0x12, 0x34, 0x56, 0x00];
        // Length byte differs, so compare against the padded sum with the odd length.
        let mut sum = word_sum(&padded) + 0xc0a8 + 0x0164 + 0x0a00 + 0x0001 + 0x0006 + 3;
        sum = (sum >> 16) + (sum & 0xFFFF);
        sum += sum >> 16;
        assert_eq!(compute_checksum(&odd, SRC, DST), !(sum as u16));
    }

    #[test]
    fn test_syn_segment_sequence_randomized() {
        let opts = TcpOptions::default();
        let seqs: std::collections::HashSet<u32> = (0..32)
            .map(|_| {
                build_syn_segment(IpAddr::V4(SRC), IpAddr::V4(DST), 51000, 80, 1024, &opts).1
            })
            .collect();
        assert!(seqs.len() > 1, "sequence numbers must vary between probes");
    }

    #[test]
    fn test_syn_segment_sequence_matches_returned_isn() {
        let (seg, isn) = build_syn_segment(
            IpAddr::V4(SRC),
            IpAddr::V4(DST),
            51000,
            80,
            DEFAULT_WINDOW,
            &TcpOptions::default(),
        );
        assert_eq!(TcpHeader::decode(&seg).map(|h| h.seq), Some(isn));
    }

    #[test]
    fn test_ipv6_segment_leaves_checksum_for_kernel() {
        let src: IpAddr = "fe80::1".parse().unwrap();
        let dst: IpAddr = "fe80::2".parse().unwrap();
        let (seg, _) = build_syn_segment(src, dst, 51000, 80, 1024, &TcpOptions::default());
        assert_eq!(be_u16(&seg, CHECKSUM_OFFSET), Some(0));
    }

    #[test]
    fn test_ipv4_payload_offset() {
        let mut datagram = vec![0u8; 20 + SEGMENT_LEN];
        datagram[0] = 0x45;
        assert_eq!(ipv4_payload_offset(&datagram), Some(20));
        datagram[0] = 0x46;
        assert_eq!(ipv4_payload_offset(&datagram), Some(24));
    }

    #[test]
    fn test_ipv4_payload_offset_rejects_malformed() {
        assert_eq!(ipv4_payload_offset(&[]), None);
        assert_eq!(ipv4_payload_offset(&[0x60, 0, 0, 0]), None, "IPv6 version");
        assert_eq!(ipv4_payload_offset(&[0x44; 20]), None, "IHL below minimum");
        assert_eq!(ipv4_payload_offset(&[0x4F; 30]), None, "IHL beyond buffer");
    }

    #[test]
    fn test_decode_short_buffer() {
        assert_eq!(TcpHeader::decode(&[0u8; 19]), None);
    }
}
