// The xor_dynamic encoder: a repeating-key xor whose decoder finds its own data by scanning
// rather than by carrying lengths. The output is decoder code, the key, a one-byte key
// terminator, the encoded payload and a two-byte payload terminator. At run time the decoder
// locates the key through a get-PC sequence, scans past the key terminator to find the
// payload, xors it with the key (restarting the key when the terminator comes round) and
// stops when the next two bytes equal the payload terminator, then jumps into the payload.
// Key length, key bytes and both terminators come from a ChaCha20 stream seeded with the
// stage seed. The key terminator never occurs in the key; the payload terminator is chosen
// so that no earlier two-byte window of the encoded payload matches it. AArch64 keys are
// sized so the payload starts on an instruction boundary.

//! Self-delimiting repeating-key xor encoder.

pub mod arm64;
pub mod x86;

use log::debug;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;

use crate::core::buffer::OutputBuffer;
use crate::core::config::Architecture;
use crate::core::error::{EncodingError, SgnResult};
use crate::core::key_schedule::pick_index;

/// Domain separator mixed into the ChaCha seed.
const XOR_DYNAMIC_DOMAIN: u64 = 0x584F_525F_4459_4E41;

pub const MIN_KEY_LEN: usize = 4;
pub const MAX_KEY_LEN: usize = 16;

/// Key lengths that keep `key ++ key terminator` a multiple of four bytes.
const ALIGNED_KEY_LENS: [usize; 3] = [7, 11, 15];

/// Random terminator candidates tried before falling back to an ordered search.
const TERMINATOR_DRAWS: usize = 32;

/// Key and terminators for one encode call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyMaterial {
    pub key: Vec<u8>,
    pub key_terminator: u8,
    pub payload_terminator: [u8; 2],
}

impl KeyMaterial {
    /// Payload terminator as the little-endian halfword the decoder compares against.
    pub fn terminator_word(&self) -> u16 {
        u16::from_le_bytes(self.payload_terminator)
    }
}

/// Whether no window `encoded[j..j + 2]` for `j` in `1..len` (reading into the
/// terminator at the end) equals `terminator`.
fn terminator_clear(encoded: &[u8], terminator: [u8; 2]) -> bool {
    (1..encoded.len()).all(|j| {
        let next = encoded.get(j + 1).copied().unwrap_or(terminator[0]);
        [encoded[j], next] != terminator
    })
}

fn choose_terminator<R: Rng + ?Sized>(rng: &mut R, encoded: &[u8]) -> Result<[u8; 2], EncodingError> {
    (0..TERMINATOR_DRAWS)
        .map(|_| rng.gen::<u16>())
        .chain(0..=u16::MAX)
        .map(u16::to_le_bytes)
        .find(|candidate| terminator_clear(encoded, *candidate))
        .ok_or(EncodingError::TerminatorUnavailable { len: encoded.len() })
}

/// Repeating-key xor encoder with a scanning decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XorDynamicEncoder {
    architecture: Architecture,
    seed: u8,
}

impl XorDynamicEncoder {
    pub const NAME: &'static str = "xor_dynamic";

    pub fn new(architecture: Architecture, seed: u8) -> Self {
        Self { architecture, seed }
    }

    pub fn architecture(&self) -> Architecture {
        self.architecture
    }

    pub fn seed(&self) -> u8 {
        self.seed
    }

    /// Derive the key material for `payload` and return it with the encoded payload.
    pub fn encode_parts(&self, payload: &[u8]) -> Result<(KeyMaterial, Vec<u8>), EncodingError> {
        if payload.is_empty() {
            return Err(EncodingError::EmptyPayload { encoder: Self::NAME });
        }

        let mut rng = ChaCha20Rng::seed_from_u64(XOR_DYNAMIC_DOMAIN ^ u64::from(self.seed));
        let key_len = match self.architecture {
            Architecture::AArch64 => ALIGNED_KEY_LENS[pick_index(&mut rng, ALIGNED_KEY_LENS.len())],
            _ => MIN_KEY_LEN + pick_index(&mut rng, MAX_KEY_LEN - MIN_KEY_LEN + 1),
        };
        let key_terminator: u8 = rng.gen();
        let key: Vec<u8> = std::iter::repeat_with(|| rng.gen::<u8>())
            .filter(|byte| *byte != key_terminator)
            .take(key_len)
            .collect();

        let encoded: Vec<u8> = payload
            .iter()
            .zip(key.iter().cycle())
            .map(|(byte, k)| byte ^ k)
            .collect();
        let payload_terminator = choose_terminator(&mut rng, &encoded)?;

        Ok((
            KeyMaterial {
                key,
                key_terminator,
                payload_terminator,
            },
            encoded,
        ))
    }

    /// Encode `payload` into decoder, key data, encoded payload and terminator.
    pub fn encode(&self, payload: &[u8]) -> SgnResult<OutputBuffer> {
        let (material, encoded) = self.encode_parts(payload)?;
        let mut prefix = match self.architecture {
            Architecture::X64 => x86::decoder(64, &material)?,
            Architecture::X32 => x86::decoder(32, &material)?,
            Architecture::AArch64 => arm64::decoder(&material, encoded.len())?,
        };
        let decoder_len = prefix.len();
        prefix.extend_from_slice(&material.key);
        prefix.push(material.key_terminator);

        let buffer = OutputBuffer::assemble_parts(&prefix, &encoded, &material.payload_terminator)?;
        debug!(
            "xor_dynamic encoded {} payload bytes for {} (seed={:#04x}): decoder {} bytes, key {} bytes, total {}",
            payload.len(),
            self.architecture,
            self.seed,
            decoder_len,
            material.key.len(),
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
    fn test_key_never_contains_terminator() {
        for seed in 0..=255u8 {
            for architecture in Architecture::ALL {
                let (material, encoded) = XorDynamicEncoder::new(architecture, seed)
                    .encode_parts(b"payload bytes")
                    .unwrap();
                assert!(!material.key.contains(&material.key_terminator));
                assert!((MIN_KEY_LEN..=MAX_KEY_LEN).contains(&material.key.len()));
                assert!(terminator_clear(&encoded, material.payload_terminator));
                if architecture == Architecture::AArch64 {
                    assert_eq!((material.key.len() + 1) % 4, 0);
                }
            }
        }
    }

    #[test]
    fn test_terminator_windows() {
        // the window at index 1 would stop the decoder one byte early
        assert!(!terminator_clear(&[0x00, 0x41, 0x42, 0x43], [0x41, 0x42]));
        // index 0 is never compared
        assert!(terminator_clear(&[0x41, 0x42, 0x43], [0x41, 0x42]));
        // the final window reads the first terminator byte
        assert!(!terminator_clear(&[0x00, 0x41], [0x41, 0x41]));
        assert!(terminator_clear(&[0x00], [0x00, 0x00]));
    }

    #[test]
    fn test_terminator_search_falls_back_to_scan() {
        struct Constant;
        impl rand::RngCore for Constant {
            fn next_u32(&mut self) -> u32 {
                0x4141_4141
            }
            fn next_u64(&mut self) -> u64 {
                0x4141_4141_4141_4141
            }
            fn fill_bytes(&mut self, dest: &mut [u8]) {
                dest.fill(0x41);
            }
            fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
                dest.fill(0x41);
                Ok(())
            }
        }
        let encoded = [0x41; 8];
        assert_eq!(choose_terminator(&mut Constant, &encoded).unwrap(), [0x00, 0x00]);
    }

    #[test]
    fn test_empty_payload_rejected() {
        let err = XorDynamicEncoder::new(Architecture::X64, 1).encode(&[]).unwrap_err();
        assert_eq!(
            err,
            SgnError::Encoding(EncodingError::EmptyPayload { encoder: "xor_dynamic" })
        );
    }

    #[test]
    fn test_output_layout() {
        let encoder = XorDynamicEncoder::new(Architecture::X32, 0x33);
        let payload = [0x90, 0x90, 0xC3];
        let (material, encoded) = encoder.encode_parts(&payload).unwrap();
        let buffer = encoder.encode(&payload).unwrap();
        assert_eq!(buffer.encoded_payload(), &encoded[..]);
        assert_eq!(buffer.trailer(), &material.payload_terminator);
        let key_start = buffer.stub_len() - material.key.len() - 1;
        assert_eq!(&buffer.stub()[key_start..key_start + material.key.len()], &material.key[..]);
        assert_eq!(buffer.stub()[buffer.stub_len() - 1], material.key_terminator);
    }
}
