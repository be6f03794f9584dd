// The Encoder façade: an immutable, validated configuration plus the encode entry point.
// encode derives the key schedule from the seed, synthesizes the decoder stub through the
// backend for the configured architecture (inside a fresh per-call bumpalo arena), applies
// the forward passes to a copy of the payload and concatenates both into one OutputBuffer.
// Nothing is cached between calls, so an Encoder is Send + Sync and identical inputs always
// give identical bytes.

//! Encoder façade.

use bumpalo::Bump;
use log::debug;

use crate::arm64::Arm64Backend;
use crate::core::buffer::OutputBuffer;
use crate::core::config::{Architecture, EncoderConfig};
use crate::core::error::{AllocationFailure, ConfigurationError, SgnError};
use crate::core::key_schedule::KeySchedule;
use crate::core::session::{SessionStats, SynthesisSession};
use crate::core::transform::encode_all;
use crate::stub::{StubBackend, StubSynthesizer};
use crate::x86::X86Backend;

/// Polymorphic payload encoder bound to one configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Encoder {
    config: EncoderConfig,
}

impl Encoder {
    pub const NAME: &'static str = "sgn";

    /// Create an encoder, rejecting `encoding_count == 0`.
    pub fn new(
        architecture: Architecture,
        seed: u8,
        plain_decoder: bool,
        encoding_count: u32,
        save_registers: bool,
    ) -> Result<Self, ConfigurationError> {
        let config = EncoderConfig::new(architecture, seed, plain_decoder, encoding_count, save_registers)?;
        Ok(Self { config })
    }

    pub fn from_config(config: EncoderConfig) -> Result<Self, ConfigurationError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn x64(seed: u8, plain_decoder: bool, encoding_count: u32, save_registers: bool) -> Result<Self, ConfigurationError> {
        Self::new(Architecture::X64, seed, plain_decoder, encoding_count, save_registers)
    }

    pub fn x32(seed: u8, plain_decoder: bool, encoding_count: u32, save_registers: bool) -> Result<Self, ConfigurationError> {
        Self::new(Architecture::X32, seed, plain_decoder, encoding_count, save_registers)
    }

    pub fn aarch64(
        seed: u8,
        plain_decoder: bool,
        encoding_count: u32,
        save_registers: bool,
    ) -> Result<Self, ConfigurationError> {
        Self::new(Architecture::AArch64, seed, plain_decoder, encoding_count, save_registers)
    }

    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }

    /// Key schedule every encode call of this encoder uses.
    pub fn key_schedule(&self) -> KeySchedule {
        KeySchedule::derive(&self.config)
    }

    /// Encode `payload` into a fresh stub + encoded payload buffer.
    pub fn encode(&self, payload: &[u8]) -> Result<OutputBuffer, SgnError> {
        self.encode_with_stats(payload).map(|(buffer, _)| buffer)
    }

    /// Like [`Encoder::encode`], also returning the synthesis statistics.
    pub fn encode_with_stats(&self, payload: &[u8]) -> Result<(OutputBuffer, SessionStats), SgnError> {
        self.config.validate()?;
        let schedule = KeySchedule::derive(&self.config);

        let arena = Bump::new();
        let session = SynthesisSession::new(&arena);
        let stub = match self.config.architecture {
            Architecture::X64 => self.synthesize(&X86Backend::x64(), &schedule, payload.len(), &session)?,
            Architecture::X32 => self.synthesize(&X86Backend::x32(), &schedule, payload.len(), &session)?,
            Architecture::AArch64 => self.synthesize(&Arm64Backend::new(), &schedule, payload.len(), &session)?,
        };

        let mut encoded = Vec::new();
        encoded
            .try_reserve_exact(payload.len())
            .map_err(|_| AllocationFailure { requested: payload.len() })?;
        encoded.extend_from_slice(payload);
        encode_all(&mut encoded, &schedule.passes());

        let buffer = OutputBuffer::assemble(&stub, &encoded)?;
        let stats = session.stats();
        debug!(
            "encoded {} payload bytes for {} (seed={:#04x}, passes={}, plain={}, save={}): stub {} bytes, total {}",
            payload.len(),
            self.config.architecture,
            self.config.seed,
            self.config.encoding_count,
            self.config.plain_decoder,
            self.config.save_registers,
            buffer.stub_len(),
            buffer.len()
        );
        Ok((buffer, stats))
    }

    fn synthesize<B: StubBackend>(
        &self,
        backend: &B,
        schedule: &KeySchedule,
        payload_len: usize,
        session: &SynthesisSession<'_>,
    ) -> Result<Vec<u8>, SgnError> {
        let stub = StubSynthesizer::new(backend, &self.config).synthesize(schedule, payload_len, session)?;
        Ok(stub)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn test_encoder_is_send_sync() {
        assert_send_sync::<Encoder>();
    }

    #[test]
    fn test_zero_passes_rejected() {
        assert_eq!(
            Encoder::x64(1, false, 0, false).unwrap_err(),
            ConfigurationError::ZeroEncodingCount
        );
    }

    #[test]
    fn test_output_layout() {
        let encoder = Encoder::x64(0x42, true, 1, false).unwrap();
        let payload = [0x90, 0x90, 0xC3];
        let buffer = encoder.encode(&payload).unwrap();
        assert_eq!(buffer.len(), buffer.stub_len() + payload.len());

        let passes = encoder.key_schedule().passes();
        assert_eq!(passes[0].key, 0x42);
        let mut expected = payload.to_vec();
        encode_all(&mut expected, &passes);
        assert_eq!(buffer.encoded_payload(), &expected[..]);
    }

    #[test]
    fn test_plain_stub_has_no_junk() {
        for arch in Architecture::ALL {
            let encoder = Encoder::new(arch, 9, true, 3, true).unwrap();
            let (_, stats) = encoder.encode_with_stats(b"payload").unwrap();
            assert_eq!(stats.junk_items, 0);
            assert_eq!(stats.passes_planned, 3);
        }
    }
}
