use crate::error::WsError;
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use std::io;

//====================================================================================
//            permessage-deflate, no context takeover
//====================================================================================

/// Trailing bytes of a sync-flushed deflate block. Stripped from outbound
/// payloads and re-appended before inflating inbound ones (RFC 7692 §7.2.1).
const DEFLATE_TAIL: [u8; 4] = [0x00, 0x00, 0xFF, 0xFF];

fn codec_err(err: impl std::error::Error + Send + Sync + 'static) -> WsError {
    WsError::Io(io::Error::new(io::ErrorKind::InvalidData, err))
}

/// Deflate one frame payload with a fresh raw-deflate state (no context
/// takeover) and strip the 4-byte sync-flush tail.
pub(crate) fn deflate_no_context_takeover(payload: &[u8]) -> Result<Vec<u8>, WsError> {
    let mut c = Compress::new(Compression::default(), false);
    let mut out = Vec::with_capacity(payload.len() / 2 + 64);

    while (c.total_in() as usize) < payload.len() {
        let consumed = c.total_in() as usize;
        if out.len() == out.capacity() {
            out.reserve(512);
        }
        c.compress_vec(&payload[consumed..], &mut out, FlushCompress::None)
            .map_err(codec_err)?;
    }
    loop {
        if out.len() == out.capacity() {
            out.reserve(512);
        }
        let before = out.len();
        c.compress_vec(&[], &mut out, FlushCompress::Sync)
            .map_err(codec_err)?;
        if out.len() == before {
            break;
        }
    }
    if out.ends_with(&DEFLATE_TAIL) {
        out.truncate(out.len() - DEFLATE_TAIL.len());
    }
    return Ok(out);
}

/// Inflate one frame payload with a fresh state, re-appending the sync-flush
/// tail the sender stripped.
pub(crate) fn inflate_no_context_takeover(payload: &[u8]) -> Result<Vec<u8>, WsError> {
    let mut d = Decompress::new(false);
    let mut out = Vec::with_capacity(payload.len().saturating_mul(2).max(64));

    for chunk in [payload, &DEFLATE_TAIL[..]] {
        let base = d.total_in();
        while ((d.total_in() - base) as usize) < chunk.len() {
            let consumed = (d.total_in() - base) as usize;
            if out.len() == out.capacity() {
                out.reserve(out.capacity().max(256));
            }
            let before_in = d.total_in();
            let before_out = out.len();
            let status = d
                .decompress_vec(&chunk[consumed..], &mut out, FlushDecompress::None)
                .map_err(codec_err)?;
            match status {
                Status::StreamEnd => return Ok(out),
                _ => {
                    if d.total_in() == before_in
                        && out.len() == before_out
                        && out.len() < out.capacity()
                    {
                        // no progress with room to spare: corrupt input
                        return Err(WsError::Io(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "inflate stalled",
                        )));
                    }
                }
            }
        }
    }
    // Drain output the inflater may still hold after the last input byte.
    loop {
        if out.len() == out.capacity() {
            out.reserve(256);
        }
        let before = out.len();
        let status = d
            .decompress_vec(&[], &mut out, FlushDecompress::Sync)
            .map_err(codec_err)?;
        if matches!(status, Status::StreamEnd) || out.len() == before {
            break;
        }
    }
    return Ok(out);
}
