/// Fixed-width NUL-padded string fields shared by the header and the
/// namelist. A field of `width` bytes holds at most `width - 1` bytes of
/// UTF-8; the last byte is reserved for the terminator.

/// Clip `s` to at most `max` bytes without splitting a code point.
pub fn clip_str(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Encode `s` into `out`, truncating to `out.len() - 1` bytes and padding
/// with NULs.
pub fn encode_fixed_str(s: &str, out: &mut [u8]) {
    let clipped = clip_str(s, out.len() - 1);
    out.fill(0);
    out[..clipped.len()].copy_from_slice(clipped.as_bytes());
}

/// Decode a NUL-padded field back into a string.
pub fn decode_fixed_str(raw: &[u8]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).to_string()
}
