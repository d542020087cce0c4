use crate::header::{FrameHeader, HEADER_SIZE, MAX_PACKET_LENGTH};
use vsoa_support::error::{VsoaError, VsoaResult};

/// A fully decoded frame borrowed from a `Recv` buffer: header plus the three payload spans.
pub struct Frame<'a> {
    pub header: FrameHeader,
    pub url: &'a [u8],
    pub param: &'a [u8],
    pub data: &'a [u8],
}

/// Incremental frame receiver. Owns one fixed `MAX_PACKET_LENGTH` buffer (allocated once, at
/// connection setup) and never allocates again: bytes are appended with `feed`, and complete
/// frames are parsed in place without copying the payload out.
///
/// Mirrors `vsoa_recv_t`: `cur_len` tracks how many bytes are currently buffered, `total_len`
/// (once known) is the length of the frame presently being assembled.
pub struct Recv {
    buffer: Box<[u8; MAX_PACKET_LENGTH]>,
    cur_len: usize,
    total_len: usize,
}

impl Recv {
    pub fn new() -> Recv {
        Recv {
            buffer: Box::new([0u8; MAX_PACKET_LENGTH]),
            cur_len: 0,
            total_len: 0,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.cur_len == 0
    }

    /// Appends `src` to the internal buffer, returning `VsoaError::Fatal(PacketTooLarge)` if it
    /// would overflow the fixed buffer before a full frame could ever be assembled.
    pub fn feed(&mut self, src: &[u8]) -> VsoaResult<()> {
        if self.cur_len + src.len() > self.buffer.len() {
            return Err(VsoaError::Fatal(vsoa_support::error::VsoaErrorKind::PacketTooLarge));
        }
        self.buffer[self.cur_len..self.cur_len + src.len()].copy_from_slice(src);
        self.cur_len += src.len();
        Ok(())
    }

    /// Attempts to parse one complete frame out of the buffered bytes. Returns `Ok(None)` when
    /// more bytes are needed. On `Ok(Some(frame))`, call `consume` once the caller is done
    /// borrowing `frame` to shift the remainder of the buffer down.
    pub fn try_parse(&mut self) -> VsoaResult<Option<Frame<'_>>> {
        if self.cur_len < HEADER_SIZE {
            return Ok(None);
        }

        let header = match FrameHeader::decode(&self.buffer[..HEADER_SIZE]) {
            Ok(h) => h,
            Err(VsoaError::Wait) => return Ok(None),
            Err(e) => return Err(e),
        };

        let total_len = header.frame_len();
        self.total_len = total_len;

        if self.cur_len < total_len {
            return Ok(None);
        }

        let mut offset = HEADER_SIZE;
        let url = &self.buffer[offset..offset + header.url_len as usize];
        offset += header.url_len as usize;
        let param = &self.buffer[offset..offset + header.param_len as usize];
        offset += header.param_len as usize;
        let data = &self.buffer[offset..offset + header.data_len as usize];

        Ok(Some(Frame { header, url, param, data }))
    }

    /// Shifts the buffer down past the most recently parsed frame (`total_len` bytes).
    pub fn consume(&mut self) {
        let total_len = self.total_len;
        if total_len == 0 || total_len > self.cur_len {
            return;
        }
        let remaining = self.cur_len - total_len;
        self.buffer.copy_within(total_len..self.cur_len, 0);
        self.cur_len = remaining;
        self.total_len = 0;
    }
}

impl Default for Recv {
    fn default() -> Recv {
        Recv::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::{status, FrameType, Flags};

    fn encode_simple(url: &[u8], param: &[u8], data: &[u8]) -> Vec<u8> {
        let (total, pad) = crate::header::calc_size(url.len(), param.len(), data.len(), MAX_PACKET_LENGTH).unwrap();
        let mut hdr = FrameHeader::new(FrameType::Publish, Flags::empty(), status::SUCCESS, 1);
        hdr.url_len = url.len() as u16;
        hdr.param_len = param.len() as u32;
        hdr.data_len = data.len() as u32;
        hdr.pad = pad;

        let mut buf = vec![0u8; total];
        hdr.encode(&mut buf[..HEADER_SIZE]);
        let mut off = HEADER_SIZE;
        buf[off..off + url.len()].copy_from_slice(url);
        off += url.len();
        buf[off..off + param.len()].copy_from_slice(param);
        off += param.len();
        buf[off..off + data.len()].copy_from_slice(data);
        buf
    }

    #[test]
    fn feeds_partial_then_completes() {
        let wire = encode_simple(b"/a/b", b"{}", b"");
        let mut recv = Recv::new();

        recv.feed(&wire[..5]).unwrap();
        assert!(recv.try_parse().unwrap().is_none());

        recv.feed(&wire[5..]).unwrap();
        {
            let frame = recv.try_parse().unwrap().expect("frame should be complete");
            assert_eq!(frame.url, b"/a/b");
            assert_eq!(frame.param, b"{}");
            assert_eq!(frame.data, b"");
        }
        recv.consume();
        assert!(recv.is_empty());
    }

    #[test]
    fn handles_back_to_back_frames() {
        let a = encode_simple(b"/x", b"1", b"");
        let b = encode_simple(b"/y", b"22", b"");
        let mut recv = Recv::new();
        recv.feed(&a).unwrap();
        recv.feed(&b).unwrap();

        {
            let frame = recv.try_parse().unwrap().unwrap();
            assert_eq!(frame.url, b"/x");
        }
        recv.consume();

        {
            let frame = recv.try_parse().unwrap().unwrap();
            assert_eq!(frame.url, b"/y");
        }
        recv.consume();
        assert!(recv.is_empty());
    }
}
