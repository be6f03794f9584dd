//! AArch64 scanning xor decoder.
//!
//! The key follows the last decoder instruction, so a single `adr` of the
//! encoder's payload label finds it. Once the terminator is reached the
//! decoded range is cleaned and invalidated before the `br` into it.

use super::KeyMaterial;
use crate::arm64::encoder::{A64Encoder, RegOp, Width};
use crate::core::error::EncodingError;
use crate::core::register_file::AsmReg;

const KEY_BASE: u8 = 9;
const CURSOR: u8 = 10;
const ENTRY: u8 = 11;
const KEY_CURSOR: u8 = 12;
const BYTE: u8 = 13;
const KEY_BYTE: u8 = 14;
const KEY_TERMINATOR: u8 = 15;
const PAYLOAD_TERMINATOR: u8 = 7;

/// Decoder bytes for `material`. The decoder finds the payload end at run time,
/// so `payload_len` is only checked for emptiness.
pub fn decoder(material: &KeyMaterial, payload_len: usize) -> Result<Vec<u8>, EncodingError> {
    if payload_len == 0 {
        return Err(EncodingError::EmptyPayload { encoder: super::XorDynamicEncoder::NAME });
    }

    let mut e = A64Encoder::new();
    let key = e.payload_label();
    let (find_payload, restart_key, next_byte, enter) = (e.new_label(), e.new_label(), e.new_label(), e.new_label());

    e.adr(AsmReg::new(KEY_BASE), key);
    e.mov_x(CURSOR, KEY_BASE);
    e.movz_w(AsmReg::new(KEY_TERMINATOR), u16::from(material.key_terminator));
    e.bind(find_payload);
    e.ldrb_post_inc(BYTE, CURSOR);
    e.cmp_w(BYTE, KEY_TERMINATOR);
    e.b_ne(find_payload);
    e.mov_x(ENTRY, CURSOR);
    e.movz_w(AsmReg::new(PAYLOAD_TERMINATOR), material.terminator_word());

    e.bind(restart_key);
    e.mov_x(KEY_CURSOR, KEY_BASE);
    e.bind(next_byte);
    e.ldrb_post_inc(KEY_BYTE, KEY_CURSOR);
    e.ldrb(BYTE, CURSOR);
    e.reg_op(Width::W, RegOp::Eor, BYTE, BYTE, KEY_BYTE);
    e.strb(BYTE, CURSOR);
    e.add_imm(CURSOR, CURSOR, 1);
    e.ldrh(BYTE, CURSOR);
    e.cmp_w(BYTE, PAYLOAD_TERMINATOR);
    e.b_eq(enter);
    e.ldrb(KEY_BYTE, KEY_CURSOR);
    e.cmp_w(KEY_BYTE, KEY_TERMINATOR);
    e.b_ne(next_byte);
    e.b(restart_key);

    // offset of the last decoded byte, then cache maintenance over [entry, cursor)
    e.bind(enter);
    e.reg_op(Width::X, RegOp::Sub, BYTE, CURSOR, ENTRY);
    e.sub_imm(BYTE, BYTE, 1);
    e.sync_range(ENTRY, BYTE, KEY_BYTE);
    e.br(ENTRY);
    e.finalize()
}
