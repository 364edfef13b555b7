//! Decoding of the NUL-terminated UTF-16 strings hosts pass in.

use embedtun_core::tunnel::{TunnelError, TunnelResult};

/// Upper bound on accepted string length, in UTF-16 code units
pub const MAX_UNITS: usize = 1 << 20;

/// Decode a NUL-terminated UTF-16 string.
///
/// # Safety
///
/// `ptr` must be null or point to a NUL-terminated sequence of `u16` that
/// stays valid and unmodified for the duration of the call.
pub unsafe fn decode(ptr: *const u16) -> TunnelResult<String> {
    if ptr.is_null() {
        return Err(TunnelError::Encoding("null string pointer".to_string()));
    }

    let mut len = 0usize;
    while *ptr.add(len) != 0 {
        len += 1;
        if len > MAX_UNITS {
            return Err(TunnelError::Encoding(format!(
                "string longer than {} code units",
                MAX_UNITS
            )));
        }
    }

    let units = std::slice::from_raw_parts(ptr, len);
    String::from_utf16(units).map_err(|e| TunnelError::Encoding(e.to_string()))
}
