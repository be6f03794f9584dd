// This module derives everything random about one encode call from the 8-bit seed. The
// generator is rand_chacha's ChaCha20Rng: portable, seedable, and passed around explicitly so
// there is no ambient RNG state and concurrent encode calls never interfere. Each pass gets
// its own ChaCha stream (stream id = pass index) from which its operator and key are drawn
// first, followed by whatever the stub synthesizer consumes for that pass's block (register
// choices, junk variants, setup order). Independent streams mean that a schedule for n+1
// passes starts with exactly the n blocks of the n-pass schedule, which keeps stub size
// monotone in the pass count. A separate stream feeds the prologue/epilogue. Range sampling
// goes through u32 bounds only, so a seed yields identical output on 32- and 64-bit hosts.

//! Seeded key schedule.

use rand::{Rng, RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;

use super::config::EncoderConfig;
use super::transform::{FeedbackOp, Pass};

/// Domain separator mixed into the ChaCha seed.
const SCHEDULE_DOMAIN: u64 = 0x5347_4E5F_4B45_5953;

/// Stream id reserved for stub-wide choices (prologue, epilogue).
const LAYOUT_STREAM: u64 = u64::MAX;

/// Uniform index in `0..len`, identical on every platform.
pub fn pick_index<R: Rng + ?Sized>(rng: &mut R, len: usize) -> usize {
    debug_assert!(len > 0 && len <= u32::MAX as usize);
    rng.gen_range(0..len as u32) as usize
}

/// Fair coin.
pub fn coin_flip<R: RngCore + ?Sized>(rng: &mut R) -> bool {
    rng.next_u32() & 1 == 1
}

/// Per-pass schedule entry.
#[derive(Debug, Clone)]
pub struct PassSchedule {
    pub pass: Pass,
    /// Stream positioned right after the pass parameters were drawn.
    choices: ChaCha20Rng,
}

impl PassSchedule {
    /// Fresh copy of this pass's choice stream.
    pub fn choices(&self) -> ChaCha20Rng {
        self.choices.clone()
    }
}

/// Keys and choice streams for one encode call.
#[derive(Debug, Clone)]
pub struct KeySchedule {
    seed: u8,
    entries: Vec<PassSchedule>,
}

impl KeySchedule {
    /// Derive the schedule for `config`.
    pub fn derive(config: &EncoderConfig) -> Self {
        let entries = (0..config.encoding_count)
            .map(|index| {
                let mut rng = Self::stream(config.seed, u64::from(index));
                let op = FeedbackOp::ALL[pick_index(&mut rng, FeedbackOp::ALL.len())];
                let drawn: u8 = rng.gen();
                let key = if index == 0 { config.seed } else { drawn };
                PassSchedule {
                    pass: Pass::new(op, key),
                    choices: rng,
                }
            })
            .collect();

        Self {
            seed: config.seed,
            entries,
        }
    }

    fn stream(seed: u8, stream: u64) -> ChaCha20Rng {
        let mut rng = ChaCha20Rng::seed_from_u64(SCHEDULE_DOMAIN ^ u64::from(seed));
        rng.set_stream(stream);
        rng
    }

    pub fn seed(&self) -> u8 {
        self.seed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The passes in encoding order.
    pub fn passes(&self) -> Vec<Pass> {
        self.entries.iter().map(|entry| entry.pass).collect()
    }

    pub fn entries(&self) -> &[PassSchedule] {
        &self.entries
    }

    /// Fresh copy of the choice stream for pass `index`.
    pub fn pass_choices(&self, index: usize) -> Option<ChaCha20Rng> {
        self.entries.get(index).map(|entry| entry.choices.clone())
    }

    /// Choice stream for stub-wide decisions.
    pub fn layout_choices(&self) -> ChaCha20Rng {
        Self::stream(self.seed, LAYOUT_STREAM)
    }
}
