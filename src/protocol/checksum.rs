//! Message CRC: CRC-16/CCITT (poly 0x1021, init 0xFFFF, MSB first, no final xor)
//! over every byte after the 4-byte header.
use crc::{Crc, CRC_16_IBM_3740};

use super::{CRC_START, HEADER_LEN};

const CRC_CALCULATOR: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

/// Plain CRC-16/CCITT of `data`.
pub fn crc16(data: &[u8]) -> u16 {
    CRC_CALCULATOR.checksum(data)
}

/// CRC of the covered region of `msg` (empty region for a bare header).
pub fn message_crc(msg: &[u8]) -> u16 {
    CRC_CALCULATOR.checksum(msg.get(CRC_START..).unwrap_or(&[]))
}

/// True when the header CRC matches the message body.
pub fn validate(msg: &[u8]) -> bool {
    if msg.len() < HEADER_LEN {
        return false;
    }
    u16::from_be_bytes([msg[2], msg[3]]) == message_crc(msg)
}

/// Write the CRC of `msg` into its header. Slices shorter than a header are left untouched.
pub fn sign(msg: &mut [u8]) {
    if msg.len() < HEADER_LEN {
        return;
    }
    let crc = message_crc(msg);
    msg[2..4].copy_from_slice(&crc.to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_ccitt_check_value() {
        // Standard check input "123456789" behind a dummy header.
        let mut msg = vec![0x02, 0x01, 0x00, 0x00];
        msg.extend_from_slice(b"123456789");
        assert_eq!(message_crc(&msg), 0x29B1);
    }

    #[test]
    fn signed_messages_validate() {
        let mut msg = vec![0x02, 0x01, 0xAA, 0xAA, 7, 0x00, 2, 0x10, 0x20];
        assert!(!validate(&msg));
        sign(&mut msg);
        assert!(validate(&msg));
    }

    #[test]
    fn any_single_bit_flip_after_header_is_detected() {
        let mut msg = vec![0x02, 0x01, 0, 0, 9, 0x05, 4, 1, 2, 3, 4];
        sign(&mut msg);
        for byte in CRC_START..msg.len() {
            for bit in 0..8 {
                let mut corrupted = msg.clone();
                corrupted[byte] ^= 1 << bit;
                assert!(!validate(&corrupted), "flip byte {byte} bit {bit} not detected");
            }
        }
    }

    #[test]
    fn header_corruption_in_crc_field_is_detected() {
        let mut msg = vec![0x02, 0x02, 0, 0, 1, 0x80, 0];
        sign(&mut msg);
        msg[3] ^= 0x01;
        assert!(!validate(&msg));
    }

    #[test]
    fn short_slices_never_validate() {
        assert!(!validate(&[0x02, 0x01, 0xFF]));
        let mut tiny = [0u8; 2];
        sign(&mut tiny);
        assert_eq!(tiny, [0, 0]);
    }
}
