pub mod header;
pub mod recv;

pub use header::{status, FrameHeader, FrameType, Flags, HEADER_SIZE, MAX_DATA_LENGTH, MAX_PACKET_LENGTH, MAX_QDATA_LENGTH, MAX_QPACKET_LENGTH};
pub use recv::{Frame, Recv};

use vsoa_support::error::VsoaResult;

/// Serializes `header` (with `url`/`param`/`data` lengths already set via `calc_size`) followed
/// by the three payload spans and zero pad bytes, into `out`. `out` must be at least
/// `header.frame_len()` bytes.
pub fn write_frame(header: &FrameHeader, url: &[u8], param: &[u8], data: &[u8], out: &mut [u8]) -> VsoaResult<usize> {
    let total = header.frame_len();
    debug_assert!(out.len() >= total);

    header.encode(&mut out[..HEADER_SIZE]);
    let mut offset = HEADER_SIZE;
    out[offset..offset + url.len()].copy_from_slice(url);
    offset += url.len();
    out[offset..offset + param.len()].copy_from_slice(param);
    offset += param.len();
    out[offset..offset + data.len()].copy_from_slice(data);
    offset += data.len();
    for b in &mut out[offset..total] {
        *b = 0;
    }
    Ok(total)
}
