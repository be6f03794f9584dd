// This module implements the block transform at the heart of the encoder: a reversible,
// length-preserving additive-feedback cipher over bytes. A pass walks the buffer from its
// last byte to its first, combining each byte with a running 8-bit accumulator through one
// of three operators (XOR, wrapping ADD, wrapping SUB) and then folding the original byte
// into the accumulator. Because the accumulator always absorbs the plaintext byte, the
// inverse pass can rebuild the same accumulator sequence from the bytes it reconstructs, in
// the same direction and with O(1) state. This is exactly what the decoder stubs do in
// machine code, so the functions here double as the software model of every backend.

//! Reversible additive-feedback byte transform.

use std::fmt;

/// Byte operator applied by one pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeedbackOp {
    /// `out = b ^ k`
    Xor,
    /// `out = b + k`
    Add,
    /// `out = b - k`
    Sub,
}

impl FeedbackOp {
    pub const ALL: [FeedbackOp; 3] = [FeedbackOp::Xor, FeedbackOp::Add, FeedbackOp::Sub];

    /// Forward operator.
    #[inline]
    pub fn apply(self, byte: u8, key: u8) -> u8 {
        match self {
            FeedbackOp::Xor => byte ^ key,
            FeedbackOp::Add => byte.wrapping_add(key),
            FeedbackOp::Sub => byte.wrapping_sub(key),
        }
    }

    /// Operator that undoes [`FeedbackOp::apply`].
    #[inline]
    pub fn inverse(self) -> FeedbackOp {
        match self {
            FeedbackOp::Xor => FeedbackOp::Xor,
            FeedbackOp::Add => FeedbackOp::Sub,
            FeedbackOp::Sub => FeedbackOp::Add,
        }
    }
}

impl fmt::Display for FeedbackOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeedbackOp::Xor => write!(f, "XOR"),
            FeedbackOp::Add => write!(f, "ADD"),
            FeedbackOp::Sub => write!(f, "SUB"),
        }
    }
}

/// One transformation pass: operator plus initial accumulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pass {
    pub op: FeedbackOp,
    pub key: u8,
}

impl Pass {
    pub const fn new(op: FeedbackOp, key: u8) -> Self {
        Self { op, key }
    }
}

/// Encode `data` in place with a single pass.
pub fn encode_pass(data: &mut [u8], pass: Pass) {
    let mut acc = pass.key;
    for byte in data.iter_mut().rev() {
        let original = *byte;
        *byte = pass.op.apply(original, acc);
        acc = acc.wrapping_add(original);
    }
}

/// Undo [`encode_pass`] in place.
pub fn decode_pass(data: &mut [u8], pass: Pass) {
    let inverse = pass.op.inverse();
    let mut acc = pass.key;
    for byte in data.iter_mut().rev() {
        let original = inverse.apply(*byte, acc);
        *byte = original;
        acc = acc.wrapping_add(original);
    }
}

/// Apply every pass in order.
pub fn encode_all(data: &mut [u8], passes: &[Pass]) {
    for pass in passes {
        encode_pass(data, *pass);
    }
}

/// Apply the inverse of every pass in reverse order.
pub fn decode_all(data: &mut [u8], passes: &[Pass]) {
    for pass in passes.iter().rev() {
        decode_pass(data, *pass);
    }
}
