use byteorder::{BigEndian, ByteOrder};
use vsoa_support::error::{VsoaError, VsoaErrorKind, VsoaResult, VSOA_MAGIC, VSOA_VERSION};

/// Fixed on-wire header size, in bytes.
pub const HEADER_SIZE: usize = 20;
/// Largest packet (header + url + param + data + pad) the engine will ever build or accept.
pub const MAX_PACKET_LENGTH: usize = 262_144;
/// Largest payload (`url_len + param_len + data_len`) a packet may carry.
pub const MAX_DATA_LENGTH: usize = MAX_PACKET_LENGTH - HEADER_SIZE;
/// Largest packet that may be sent over the UDP quick channel (max UDP datagram minus slack).
pub const MAX_QPACKET_LENGTH: usize = 65_527;
pub const MAX_QDATA_LENGTH: usize = MAX_QPACKET_LENGTH - HEADER_SIZE;

const PAD_MASK: u8 = 0xc0;
const PAD_SHIFT: u8 = 6;
const STATUS_MASK: u8 = 0x3f;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[repr(u8)]
pub enum FrameType {
    ServInfo = 0x00,
    Rpc = 0x01,
    Subscribe = 0x02,
    Unsubscribe = 0x03,
    Publish = 0x04,
    Datagram = 0x05,
    QosSetup = 0x06,
    Noop = 0xfe,
    PingEcho = 0xff,
}

impl FrameType {
    pub fn from_u8(v: u8) -> VsoaResult<FrameType> {
        Ok(match v {
            0x00 => FrameType::ServInfo,
            0x01 => FrameType::Rpc,
            0x02 => FrameType::Subscribe,
            0x03 => FrameType::Unsubscribe,
            0x04 => FrameType::Publish,
            0x05 => FrameType::Datagram,
            0x06 => FrameType::QosSetup,
            0xfe => FrameType::Noop,
            0xff => FrameType::PingEcho,
            _ => return Err(VsoaError::Fatal(VsoaErrorKind::UnknownType)),
        })
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, Eq, PartialEq)]
    pub struct Flags: u8 {
        const REPLY  = 0x1;
        const TUNNEL = 0x2;
        const SET    = 0x4;
    }
}

/// Status codes returned in replies (or, for `QosSetup`, the client's priority 0..=5).
pub mod status {
    pub const SUCCESS: u8 = 0;
    pub const PASSWORD: u8 = 1;
    pub const ARGUMENTS: u8 = 2;
    pub const INVALID_URL: u8 = 3;
    pub const NO_RESPONDING: u8 = 4;
    pub const NO_PERMISSIONS: u8 = 5;
    pub const NO_MEMORY: u8 = 6;
}

/// The 20-byte VSOA frame header, decoded in place from a network-order byte slice.
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    pub frame_type: FrameType,
    pub flags: Flags,
    /// High 2 bits of the wire status byte; number of zero pad bytes appended after the payload.
    pub pad: u8,
    /// Low 6 bits of the wire status byte (or, for `QosSetup`, the full byte as priority).
    pub status: u8,
    /// Sequence number for correlated request/reply frames; client id for quick-channel frames.
    pub seqno: u32,
    pub tunid: u16,
    pub url_len: u16,
    pub param_len: u32,
    pub data_len: u32,
}

impl FrameHeader {
    pub fn new(frame_type: FrameType, flags: Flags, status: u8, seqno: u32) -> FrameHeader {
        FrameHeader {
            frame_type,
            flags,
            pad: 0,
            status,
            seqno,
            tunid: 0,
            url_len: 0,
            param_len: 0,
            data_len: 0,
        }
    }

    /// Total payload length this header describes (url + param + data), not including pad.
    #[inline]
    pub fn payload_len(&self) -> usize {
        self.url_len as usize + self.param_len as usize + self.data_len as usize
    }

    /// Total on-wire frame length including header and pad.
    #[inline]
    pub fn frame_len(&self) -> usize {
        HEADER_SIZE + self.payload_len() + self.pad as usize
    }

    /// Decodes a header from the first `HEADER_SIZE` bytes of `buf`. Does not allocate.
    pub fn decode(buf: &[u8]) -> VsoaResult<FrameHeader> {
        if buf.len() < HEADER_SIZE {
            return Err(VsoaError::Wait);
        }

        let magic_ver = buf[0];
        let magic = magic_ver >> 4;
        let version = magic_ver & 0x0f;
        if magic != VSOA_MAGIC {
            return Err(VsoaError::Fatal(VsoaErrorKind::BadMagic));
        }
        if version != VSOA_VERSION {
            return Err(VsoaError::Fatal(VsoaErrorKind::BadVersion));
        }

        let frame_type = FrameType::from_u8(buf[1])?;
        let flags = Flags::from_bits_truncate(buf[2]);
        let raw_status = buf[3];
        let pad = (raw_status & PAD_MASK) >> PAD_SHIFT;
        let status = raw_status & STATUS_MASK;
        let seqno = BigEndian::read_u32(&buf[4..8]);
        let tunid = BigEndian::read_u16(&buf[8..10]);
        let url_len = BigEndian::read_u16(&buf[10..12]);
        let param_len = BigEndian::read_u32(&buf[12..16]);
        let data_len = BigEndian::read_u32(&buf[16..20]);

        let header = FrameHeader {
            frame_type,
            flags,
            pad,
            status,
            seqno,
            tunid,
            url_len,
            param_len,
            data_len,
        };

        if header.frame_len() > MAX_PACKET_LENGTH {
            return Err(VsoaError::Fatal(VsoaErrorKind::PacketTooLarge));
        }

        Ok(header)
    }

    /// Encodes this header (big-endian) into the first `HEADER_SIZE` bytes of `buf`.
    pub fn encode(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= HEADER_SIZE);

        buf[0] = (VSOA_MAGIC << 4) | VSOA_VERSION;
        buf[1] = self.frame_type as u8;
        buf[2] = self.flags.bits();
        buf[3] = ((self.pad << PAD_SHIFT) & PAD_MASK) | (self.status & STATUS_MASK);
        BigEndian::write_u32(&mut buf[4..8], self.seqno);
        BigEndian::write_u16(&mut buf[8..10], self.tunid);
        BigEndian::write_u16(&mut buf[10..12], self.url_len);
        BigEndian::write_u32(&mut buf[12..16], self.param_len);
        BigEndian::write_u32(&mut buf[16..20], self.data_len);
    }

    /// Sets the raw priority byte for a `QosSetup` frame (full byte, not masked).
    pub fn set_priority(&mut self, priority: u8) {
        self.status = priority;
        self.pad = 0;
    }
}

/// Computes `(url_len + param_len + data_len, pad)` for a packet about to be serialized, and
/// validates it against `max_len` (`MAX_PACKET_LENGTH` for the main channel, `MAX_QPACKET_LENGTH`
/// for the quick channel).
pub fn calc_size(url_len: usize, param_len: usize, data_len: usize, max_len: usize) -> VsoaResult<(usize, u8)> {
    let payload_len = url_len + param_len + data_len;
    let unpadded = HEADER_SIZE + payload_len;
    let pad = ((4 - (unpadded % 4)) % 4) as u8;
    let total = unpadded + pad as usize;
    if total > max_len {
        return Err(VsoaError::Fatal(VsoaErrorKind::PacketTooLarge));
    }
    Ok((total, pad))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let mut hdr = FrameHeader::new(FrameType::Rpc, Flags::SET, status::SUCCESS, 42);
        hdr.tunid = 7;
        hdr.url_len = 5;
        hdr.param_len = 3;
        hdr.data_len = 0;
        let (_, pad) = calc_size(5, 3, 0, MAX_PACKET_LENGTH).unwrap();
        hdr.pad = pad;

        let mut buf = [0u8; HEADER_SIZE];
        hdr.encode(&mut buf);
        let decoded = FrameHeader::decode(&buf).unwrap();

        assert_eq!(decoded.frame_type, FrameType::Rpc);
        assert_eq!(decoded.flags, Flags::SET);
        assert_eq!(decoded.status, status::SUCCESS);
        assert_eq!(decoded.seqno, 42);
        assert_eq!(decoded.tunid, 7);
        assert_eq!(decoded.url_len, 5);
        assert_eq!(decoded.param_len, 3);
        assert_eq!(decoded.data_len, 0);
        assert_eq!(decoded.pad, pad);
    }

    #[test]
    fn padding_invariant() {
        for url in 0..8usize {
            for param in 0..8usize {
                for data in 0..8usize {
                    let (total, pad) = calc_size(url, param, data, MAX_PACKET_LENGTH).unwrap();
                    assert!(pad <= 3);
                    assert_eq!(total % 4, 0);
                    assert_eq!(total, HEADER_SIZE + url + param + data + pad as usize);
                }
            }
        }
    }

    #[test]
    fn rejects_bad_magic() {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0] = 0xff;
        assert_eq!(
            FrameHeader::decode(&buf),
            Err(VsoaError::Fatal(VsoaErrorKind::BadMagic))
        );
    }

    #[test]
    fn rejects_oversized_packet() {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0] = (VSOA_MAGIC << 4) | VSOA_VERSION;
        buf[1] = FrameType::Publish as u8;
        BigEndian::write_u32(&mut buf[16..20], MAX_PACKET_LENGTH as u32);
        assert_eq!(
            FrameHeader::decode(&buf),
            Err(VsoaError::Fatal(VsoaErrorKind::PacketTooLarge))
        );
    }

    #[test]
    fn size_bound_quick_channel() {
        assert!(calc_size(0, 0, MAX_QDATA_LENGTH + 1, MAX_QPACKET_LENGTH).is_err());
        assert!(calc_size(0, 0, MAX_QDATA_LENGTH, MAX_QPACKET_LENGTH).is_ok());
    }
}
