// The schema encoder: a call-over decoder that undoes a random per-dword cipher. The output is
// `call over`, the ciphered data region, and the decoder itself: junk, `pop base` (which
// recovers the address of the data region from the return address), one dword memory op per
// four data bytes interleaved with junk, and `jmp base`. The data region is optional junk code
// followed by the payload and zero padding up to a dword boundary, and every dword of it is
// ciphered. Ops are xor/add/sub with a 32-bit key, rol/ror by 1..=31 and not; the encoder
// applies the inverse of each. Base register, junk and ops come from a ChaCha20 stream seeded
// with the stage seed. Plain mode drops all junk and fixes the base register to esi/rsi. Only
// x86 has a schema decoder.

//! Per-dword schema cipher with a call-over x86 decoder.

use log::debug;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;

use crate::core::buffer::OutputBuffer;
use crate::core::config::Architecture;
use crate::core::error::{ConfigurationError, EncodingError, SgnResult};
use crate::core::key_schedule::pick_index;
use crate::core::register_file::{AsmReg, RegBitSet};
use crate::x86::encoder::{DwordOp, X86Encoder};
use crate::x86::junk::X86Junk;
use crate::x86::registers::{RSI, X32_GENERAL, X64_GENERAL};

/// Domain separator mixed into the ChaCha seed.
const SCHEMA_DOMAIN: u64 = 0x5343_4845_4D41_5F31;

/// `call rel32`.
const CALL_LEN: usize = 5;

const MAX_GARBAGE_JUNK: usize = 3;
const MAX_STEP_JUNK: usize = 2;

/// Value the encoder stores so that the decoder's `op` restores `dword`.
pub fn cipher(op: DwordOp, dword: u32) -> u32 {
    match op {
        DwordOp::Xor(k) => dword ^ k,
        DwordOp::Add(k) => dword.wrapping_sub(k),
        DwordOp::Sub(k) => dword.wrapping_add(k),
        DwordOp::Rol(n) => dword.rotate_right(n & 31),
        DwordOp::Ror(n) => dword.rotate_left(n & 31),
        DwordOp::Not => !dword,
    }
}

/// What the decoder's `op` does to `dword`.
pub fn decipher(op: DwordOp, dword: u32) -> u32 {
    match op {
        DwordOp::Xor(k) => dword ^ k,
        DwordOp::Add(k) => dword.wrapping_add(k),
        DwordOp::Sub(k) => dword.wrapping_sub(k),
        DwordOp::Rol(n) => dword.rotate_left(n & 31),
        DwordOp::Ror(n) => dword.rotate_right(n & 31),
        DwordOp::Not => !dword,
    }
}

fn random_op<R: Rng + ?Sized>(rng: &mut R) -> DwordOp {
    match pick_index(rng, 6) {
        0 => DwordOp::Xor(rng.gen()),
        1 => DwordOp::Add(rng.gen()),
        2 => DwordOp::Sub(rng.gen()),
        3 => DwordOp::Rol(1 + pick_index(rng, 31) as u32),
        4 => DwordOp::Ror(1 + pick_index(rng, 31) as u32),
        _ => DwordOp::Not,
    }
}

/// Schema cipher encoder for x64 and x32.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchemaEncoder {
    architecture: Architecture,
    seed: u8,
    plain_decoder: bool,
}

impl SchemaEncoder {
    pub const NAME: &'static str = "schema";

    /// Rejects architectures without a schema decoder.
    pub fn new(architecture: Architecture, seed: u8, plain_decoder: bool) -> Result<Self, ConfigurationError> {
        if architecture == Architecture::AArch64 {
            return Err(ConfigurationError::UnsupportedEncoderArchitecture {
                encoder: Self::NAME,
                architecture,
            });
        }
        Ok(Self {
            architecture,
            seed,
            plain_decoder,
        })
    }

    pub fn architecture(&self) -> Architecture {
        self.architecture
    }

    pub fn seed(&self) -> u8 {
        self.seed
    }

    pub fn plain_decoder(&self) -> bool {
        self.plain_decoder
    }

    fn bitness(&self) -> u32 {
        if self.architecture == Architecture::X64 {
            64
        } else {
            32
        }
    }

    fn general(&self) -> &'static [AsmReg] {
        if self.architecture == Architecture::X64 {
            &X64_GENERAL
        } else {
            &X32_GENERAL
        }
    }

    fn emit_junk<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        encoder: &mut X86Encoder,
        reserved: RegBitSet,
        count: usize,
    ) -> Result<(), EncodingError> {
        if self.plain_decoder {
            return Ok(());
        }
        for _ in 0..count {
            X86Junk::generate(rng, self.general(), reserved, self.bitness()).emit(encoder)?;
        }
        Ok(())
    }

    /// Junk code run after decoding, in front of the payload.
    fn garbage<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<Vec<u8>, EncodingError> {
        if self.plain_decoder {
            return Ok(Vec::new());
        }
        let mut encoder = X86Encoder::new(self.bitness())?;
        let count = 1 + pick_index(rng, MAX_GARBAGE_JUNK);
        self.emit_junk(rng, &mut encoder, RegBitSet::new(), count)?;
        encoder.finalize_code()
    }

    /// Encode `payload` into call-over, ciphered data region and decoder.
    pub fn encode(&self, payload: &[u8]) -> SgnResult<OutputBuffer> {
        let mut rng = ChaCha20Rng::seed_from_u64(SCHEMA_DOMAIN ^ u64::from(self.seed));
        let general = self.general();
        let base = if self.plain_decoder {
            RSI
        } else {
            general[pick_index(&mut rng, general.len())]
        };
        let reserved = RegBitSet::from_regs(&[base]);

        let mut data = self.garbage(&mut rng)?;
        let payload_start = CALL_LEN + data.len();
        data.extend_from_slice(payload);
        data.resize(data.len().next_multiple_of(4), 0);

        let schema: Vec<DwordOp> = (0..data.len() / 4).map(|_| random_op(&mut rng)).collect();
        for (chunk, op) in data.chunks_exact_mut(4).zip(&schema) {
            let dword = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            chunk.copy_from_slice(&cipher(*op, dword).to_le_bytes());
        }

        let mut encoder = X86Encoder::new(self.bitness())?;
        let mut over = encoder.create_label();
        encoder.call(over)?;
        if !data.is_empty() {
            encoder.db(&data)?;
        }
        encoder.bind(&mut over)?;
        let count = pick_index(&mut rng, MAX_STEP_JUNK + 1);
        self.emit_junk(&mut rng, &mut encoder, reserved, count)?;
        encoder.pop_native(base)?;
        for (index, op) in schema.iter().enumerate() {
            let count = pick_index(&mut rng, MAX_STEP_JUNK + 1);
            self.emit_junk(&mut rng, &mut encoder, reserved, count)?;
            let disp = i32::try_from(4 * index).map_err(|_| EncodingError::PayloadTooLarge {
                len: payload.len(),
                limit: i32::MAX as usize,
            })?;
            encoder.dword_op(*op, base, disp)?;
        }
        encoder.jmp_native(base)?;
        let code = encoder.finalize_code()?;

        let payload_end = payload_start + payload.len();
        if code.len() < payload_end {
            return Err(EncodingError::UnsupportedOperand { operation: "call-over layout" }.into());
        }
        let buffer = OutputBuffer::assemble_parts(
            &code[..payload_start],
            &code[payload_start..payload_end],
            &code[payload_end..],
        )?;

        debug!(
            "schema encoded {} payload bytes for {} (seed={:#04x}, plain={}): {} dword ops, payload at {}..{}, total {}",
            payload.len(),
            self.architecture,
            self.seed,
            self.plain_decoder,
            schema.len(),
            payload_start,
            payload_end,
            buffer.len()
        );
        Ok(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::SgnError;

    #[test]
    fn test_aarch64_has_no_schema_decoder() {
        assert_eq!(
            SchemaEncoder::new(Architecture::AArch64, 1, false).unwrap_err(),
            ConfigurationError::UnsupportedEncoderArchitecture {
                encoder: "schema",
                architecture: Architecture::AArch64,
            }
        );
    }

    #[test]
    fn test_decipher_undoes_cipher() {
        let ops = [
            DwordOp::Xor(0xDEAD_BEEF),
            DwordOp::Add(0xFFFF_FFFF),
            DwordOp::Sub(7),
            DwordOp::Rol(31),
            DwordOp::Ror(1),
            DwordOp::Not,
        ];
        for op in ops {
            assert_eq!(decipher(op, cipher(op, 0x0102_0304)), 0x0102_0304, "{op:?}");
        }
    }

    #[test]
    fn test_plain_layout() {
        let encoder = SchemaEncoder::new(Architecture::X64, 9, true).unwrap();
        let buffer = encoder.encode(&[0xC3]).unwrap();
        assert_eq!(buffer.stub(), &[0xE8, 0x04, 0x00, 0x00, 0x00]);
        assert_eq!(buffer.encoded_payload().len(), 1);
        // pop rsi
        assert_eq!(buffer.trailer()[3], 0x5E);
        // jmp rsi
        assert_eq!(&buffer.trailer()[buffer.trailer().len() - 2..], &[0xFF, 0xE6]);
    }

    #[test]
    fn test_seed_determines_output() {
        let payload = b"\x90\x90\x90\xC3";
        let first = SchemaEncoder::new(Architecture::X32, 3, false).unwrap();
        assert_eq!(first.encode(payload).unwrap(), first.encode(payload).unwrap());
        let other = SchemaEncoder::new(Architecture::X32, 4, false).unwrap();
        assert_ne!(first.encode(payload).unwrap(), other.encode(payload).unwrap());
    }

    #[test]
    fn test_empty_payload_jumps_straight_back() {
        let buffer = SchemaEncoder::new(Architecture::X32, 0, true).unwrap().encode(&[]).unwrap();
        // call $+5 ; pop esi ; jmp esi
        assert_eq!(buffer.as_bytes(), &[0xE8, 0x00, 0x00, 0x00, 0x00, 0x5E, 0xFF, 0xE6]);
        assert!(matches!(
            SchemaEncoder::new(Architecture::AArch64, 0, true).map_err(SgnError::from),
            Err(SgnError::Configuration(_))
        ));
    }
}
