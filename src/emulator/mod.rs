// A small software CPU for checking decoder stubs without executing them natively. The image
// (decoder, encoded payload and any trailer) is mapped at a fixed base next to a private
// stack, the register file is filled with a recognisable pattern, and the decoder is stepped
// instruction by instruction until control reaches the first payload byte. Only the
// instruction subset the encoders emit is modelled; anything else is reported as Unsupported
// rather than guessed at. Every memory access is checked against the two mapped regions, so a
// decoder that strays outside its own image or the stack fails with OutOfBounds. The outcome
// carries the decoded payload, whether the register file (and flags) came back exactly as
// they started, and whether every rewritten byte was made visible to instruction fetch.
// verify_layers peels a pipeline outermost first, running each layer on the image the
// previous layer decoded.

//! Stub emulator for round-trip and register-preservation checks.

pub mod arm64;
pub mod x86;

use std::ops::Range;

use thiserror::Error;

use crate::core::buffer::OutputBuffer;
use crate::core::config::Architecture;
use crate::pipeline::StageOutput;

/// Address the image (stub + payload) is mapped at.
pub const IMAGE_BASE: u64 = 0x0040_0000;
/// Lowest stack address.
pub const STACK_BASE: u64 = 0x0080_0000;
pub const STACK_SIZE: usize = 0x1_0000;
/// Initial stack pointer, 16-byte aligned with headroom above it.
pub const STACK_TOP: u64 = STACK_BASE + STACK_SIZE as u64 - 0x100;

pub const DEFAULT_STEP_LIMIT: usize = 50_000_000;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EmulationError {
    #[error("fault at {pc:#x}: {reason}")]
    Fault { pc: u64, reason: &'static str },

    #[error("step limit of {limit} instructions exceeded")]
    StepLimit { limit: usize },

    #[error("unsupported instruction at {pc:#x}: {instruction}")]
    Unsupported { pc: u64, instruction: String },

    #[error("{size}-byte access at {address:#x} outside the image and stack")]
    OutOfBounds { address: u64, size: usize },

    #[error("decoded payload differs from the original at offset {offset}")]
    Mismatch { offset: usize },
}

/// Result of running a stub to the payload entry point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmulationOutcome {
    /// Payload bytes at the moment control reached them.
    pub payload: Vec<u8>,
    /// Register file (and flags, where modelled) identical to the entry state.
    pub registers_preserved: bool,
    /// No rewritten image byte is left stale in the instruction stream. Always
    /// true on x86, whose fetch is coherent with stores.
    pub icache_coherent: bool,
    pub steps: usize,
}

#[derive(Debug, Clone)]
struct Region {
    base: u64,
    bytes: Vec<u8>,
}

impl Region {
    fn range(&self, address: u64, size: usize) -> Option<std::ops::Range<usize>> {
        let start = address.checked_sub(self.base)? as usize;
        let end = start.checked_add(size)?;
        (end <= self.bytes.len()).then_some(start..end)
    }
}

/// Image plus stack, little-endian.
#[derive(Debug, Clone)]
pub(crate) struct Memory {
    image: Region,
    stack: Region,
}

impl Memory {
    pub(crate) fn new(image: &[u8]) -> Self {
        Self {
            image: Region {
                base: IMAGE_BASE,
                bytes: image.to_vec(),
            },
            stack: Region {
                base: STACK_BASE,
                bytes: vec![0; STACK_SIZE],
            },
        }
    }

    fn locate(&mut self, address: u64, size: usize) -> Result<&mut [u8], EmulationError> {
        if let Some(range) = self.image.range(address, size) {
            return Ok(&mut self.image.bytes[range]);
        }
        if let Some(range) = self.stack.range(address, size) {
            return Ok(&mut self.stack.bytes[range]);
        }
        Err(EmulationError::OutOfBounds { address, size })
    }

    pub(crate) fn read(&mut self, address: u64, size: usize) -> Result<u64, EmulationError> {
        let bytes = self.locate(address, size)?;
        let mut raw = [0u8; 8];
        raw[..size].copy_from_slice(bytes);
        Ok(u64::from_le_bytes(raw))
    }

    pub(crate) fn write(&mut self, address: u64, size: usize, value: u64) -> Result<(), EmulationError> {
        let bytes = self.locate(address, size)?;
        bytes.copy_from_slice(&value.to_le_bytes()[..size]);
        Ok(())
    }

    /// Image bytes from `address` to the end, for instruction fetch.
    pub(crate) fn fetch(&self, address: u64) -> Option<&[u8]> {
        let start = address.checked_sub(self.image.base)? as usize;
        self.image.bytes.get(start..).filter(|rest| !rest.is_empty())
    }

    pub(crate) fn image(&self) -> &[u8] {
        &self.image.bytes
    }

    pub(crate) fn in_image(&self, address: u64) -> bool {
        self.image.range(address, 1).is_some()
    }
}

/// Reject a payload range that does not lie inside `image`.
pub(crate) fn check_payload(image: &[u8], payload: &Range<usize>) -> Result<(), EmulationError> {
    if payload.start > payload.end || payload.end > image.len() {
        return Err(EmulationError::Fault {
            pc: IMAGE_BASE,
            reason: "payload outside the image",
        });
    }
    Ok(())
}

/// Recognisable entry value for register `index`.
pub(crate) fn entry_pattern(index: usize) -> u64 {
    0x0101_0101_0101_0101u64.wrapping_mul(index as u64 + 1) ^ 0x8000_0000_0000_0000
}

/// Run the decoder in `image` until control reaches `payload.start`.
pub fn execute_range(
    architecture: Architecture,
    image: &[u8],
    payload: Range<usize>,
    step_limit: usize,
) -> Result<EmulationOutcome, EmulationError> {
    check_payload(image, &payload)?;
    match architecture {
        Architecture::X64 => x86::run(64, image, payload, step_limit),
        Architecture::X32 => x86::run(32, image, payload, step_limit),
        Architecture::AArch64 => arm64::run(image, payload, step_limit),
    }
}

/// Run the stub in `image[..stub_len]`; the rest of the image is the payload.
pub fn execute_raw(
    architecture: Architecture,
    image: &[u8],
    stub_len: usize,
    step_limit: usize,
) -> Result<EmulationOutcome, EmulationError> {
    execute_range(architecture, image, stub_len..image.len(), step_limit)
}

/// Run the decoder of `buffer`.
pub fn execute(architecture: Architecture, buffer: &OutputBuffer) -> Result<EmulationOutcome, EmulationError> {
    execute_range(architecture, buffer.as_bytes(), buffer.payload_range(), DEFAULT_STEP_LIMIT)
}

fn check_decoded(decoded: &[u8], original: &[u8]) -> Result<(), EmulationError> {
    if let Some(offset) = decoded
        .iter()
        .zip(original)
        .position(|(decoded, expected)| decoded != expected)
    {
        return Err(EmulationError::Mismatch { offset });
    }
    if decoded.len() != original.len() {
        return Err(EmulationError::Mismatch {
            offset: decoded.len().min(original.len()),
        });
    }
    Ok(())
}

/// Run the stub of `buffer` and require the decoded payload to equal `original`.
pub fn verify(
    architecture: Architecture,
    buffer: &OutputBuffer,
    original: &[u8],
) -> Result<EmulationOutcome, EmulationError> {
    let outcome = execute(architecture, buffer)?;
    check_decoded(&outcome.payload, original)?;
    Ok(outcome)
}

/// Peel a traced pipeline run from the outermost layer inward. Each decoder runs on the
/// bytes the layer above it decoded, each must reproduce its stage's input, and the innermost
/// must give back `original`. Outcomes are returned outermost first.
pub fn verify_layers(layers: &[StageOutput], original: &[u8]) -> Result<Vec<EmulationOutcome>, EmulationError> {
    let mut outcomes = Vec::with_capacity(layers.len());
    let Some(outermost) = layers.last() else {
        return Ok(outcomes);
    };

    let mut image = outermost.buffer.as_bytes().to_vec();
    for (depth, layer) in layers.iter().enumerate().rev() {
        let outcome = execute_range(layer.architecture, &image, layer.buffer.payload_range(), DEFAULT_STEP_LIMIT)?;
        let expected = match depth.checked_sub(1) {
            Some(inner) => layers[inner].buffer.as_bytes(),
            None => original,
        };
        check_decoded(&outcome.payload, expected)?;
        image = outcome.payload.clone();
        outcomes.push(outcome);
    }
    Ok(outcomes)
}
