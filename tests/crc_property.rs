//! CRC coverage over randomly generated messages.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use woisradio::protocol::{
    validate, CommandMessage, DecodeError, Message, Resource, TransferMessage, XferOp, CRC_START,
    MAX_COMMAND_DATA, SEGMENT_SIZE,
};

fn random_message(rng: &mut StdRng) -> Message {
    let len = rng.gen_range(0..=MAX_COMMAND_DATA);
    let data: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
    match rng.gen_range(0..3) {
        0 => Message::Command(CommandMessage::new(rng.gen(), rng.gen_range(0..0x20), &data)),
        1 => Message::Ack(CommandMessage::new(rng.gen(), 0x80 | rng.gen_range(0..0x20), &data)),
        _ => {
            let seg_len = len.min(SEGMENT_SIZE);
            Message::Transfer(TransferMessage::new(
                rng.gen(),
                Resource::Config,
                XferOp::PutReq,
                &data[..seg_len],
            ))
        }
    }
}

#[test]
fn encoded_messages_validate_and_decode_back() {
    let mut rng = StdRng::seed_from_u64(0xC0FFEE);
    for _ in 0..500 {
        let msg = random_message(&mut rng);
        let bytes = msg.encode();
        assert!(validate(&bytes));
        assert_eq!(Message::decode(&bytes), Ok(msg));
    }
}

#[test]
fn flipping_any_covered_bit_is_caught() {
    let mut rng = StdRng::seed_from_u64(42);
    for _ in 0..200 {
        let bytes = random_message(&mut rng).encode();
        let byte = rng.gen_range(CRC_START..bytes.len());
        let bit = rng.gen_range(0..8);
        let mut corrupted = bytes.clone();
        corrupted[byte] ^= 1 << bit;
        assert!(!validate(&corrupted), "flip at byte {} bit {} undetected", byte, bit);
        assert!(Message::decode(&corrupted).is_err());
    }
}

#[test]
fn header_crc_mismatch_reports_both_values() {
    let mut bytes = Message::Command(CommandMessage::new(1, 0, &[9, 9])).encode();
    bytes[2] ^= 0xFF;
    match Message::decode(&bytes) {
        Err(DecodeError::Crc { header, computed }) => assert_ne!(header, computed),
        other => panic!("expected crc error, got {:?}", other),
    }
}
