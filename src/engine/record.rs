//! TLS record framing (RFC 8446 §5), header level only.
//!
//! The engine facade preserves one-record-per-`unwrap` semantics on top of
//! rustls by peeking the outer record header before feeding bytes in; the
//! record contents are never interpreted here.

use crate::error::Error;

/// TLS record header size.
pub const RECORD_HEADER_LEN: usize = 5;

/// Maximum plaintext per record (RFC 8446 §5.1).
pub const MAX_PLAINTEXT: usize = 16384;

/// Maximum protected record payload: plaintext + expansion (RFC 8446 §5.2).
pub const MAX_RECORD_PAYLOAD: usize = MAX_PLAINTEXT + 256;

/// Worst-case per-record overhead a wrap can add on top of cleartext:
/// record header + MAC + padding, sized conservatively across supported
/// cipher suites.
pub const MAX_HEADER_SIZE: usize = 5 + 20 + 256;

/// Total wire size of the record starting at `src[0]`.
///
/// Returns `None` while `src` holds less than one complete record.  A
/// record claiming more than [`MAX_RECORD_PAYLOAD`] is corrupt and
/// rejected outright.
pub fn complete_record_len(src: &[u8]) -> Result<Option<usize>, Error> {
    if src.len() < RECORD_HEADER_LEN {
        return Ok(None);
    }
    let length = ((src[3] as usize) << 8) | src[4] as usize;
    if length > MAX_RECORD_PAYLOAD {
        return Err(Error::Tls(rustls::Error::General(
            "oversized TLS record".into(),
        )));
    }
    let total = RECORD_HEADER_LEN + length;
    if src.len() < total {
        return Ok(None);
    }
    Ok(Some(total))
}
