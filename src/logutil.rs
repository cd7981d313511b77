//! Logging helpers that keep frame dumps and addresses on a single line.

use std::fmt::Write;

/// Hex dump of at most `max` bytes, with an ellipsis and total length when cut.
pub fn hex_snippet(bytes: &[u8], max: usize) -> String {
    let mut out = String::with_capacity(bytes.len().min(max) * 3 + 8);
    for (i, b) in bytes.iter().take(max).enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let _ = write!(&mut out, "{:02X}", b);
    }
    if bytes.len() > max {
        let _ = write!(&mut out, " …({} bytes)", bytes.len());
    }
    out
}

/// 64-bit radio address as 16 hex digits.
pub fn fmt_mac(mac: u64) -> String {
    format!("{:016X}", mac)
}

/// Parse a hex string such as `"02 01 ab cd"` or `"0201ABCD"`.
pub fn parse_hex(text: &str) -> Option<Vec<u8>> {
    let digits: String = text
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':' && *c != ',')
        .collect();
    let digits = digits.strip_prefix("0x").unwrap_or(digits.as_str());
    if digits.len() % 2 != 0 {
        return None;
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(digits.get(i..i + 2)?, 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snippet_truncates_long_frames() {
        assert_eq!(hex_snippet(&[0x02, 0xAB], 8), "02 AB");
        assert_eq!(hex_snippet(&[1, 2, 3, 4], 2), "01 02 …(4 bytes)");
        assert_eq!(hex_snippet(&[], 4), "");
    }

    #[test]
    fn mac_is_zero_padded() {
        assert_eq!(fmt_mac(0x0013_A200_40A1_B2C3), "0013A20040A1B2C3");
        assert_eq!(fmt_mac(0), "0000000000000000");
    }

    #[test]
    fn parse_hex_accepts_common_spellings() {
        assert_eq!(parse_hex("02 01 ab cd"), Some(vec![0x02, 0x01, 0xAB, 0xCD]));
        assert_eq!(parse_hex("0x0201"), Some(vec![0x02, 0x01]));
        assert_eq!(parse_hex("abc"), None);
        assert_eq!(parse_hex("zz"), None);
    }
}
