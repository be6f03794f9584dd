// This module turns a key schedule into decoder stub bytes for any StubBackend. Planning
// walks the passes from last to first (the stub has to undo them in reverse), claims the
// block registers from the pass's own choice stream, orders the three setup steps, and
// sprinkles junk runs between functional items when the decoder is not plain. The finished
// plan lives in the session arena. Lowering then iterates: the payload offset and the
// address anchors are unknown until the stub has been emitted once, so the plan is relowered
// with the measured layout until nothing moves. Instruction sizes only ever grow from one
// iteration to the next, which bounds the loop; hitting the bound anyway is reported as
// UnresolvedFixup instead of emitting a stub with a stale displacement.

//! Stub planning and layout resolution.

use bumpalo::collections::Vec as BumpVec;
use log::{debug, trace};
use rand::Rng;

use super::{SetupStep, StubBackend, StubItem, StubLayout};
use crate::core::config::EncoderConfig;
use crate::core::error::EncodingError;
use crate::core::key_schedule::{pick_index, KeySchedule};
use crate::core::register_file::{RegBitSet, RegisterFile};
use crate::core::session::SynthesisSession;

/// Upper bound on relowerings before the layout is declared unresolved.
pub const MAX_LAYOUT_ITERATIONS: usize = 8;

/// Longest run of consecutive junk items.
const MAX_JUNK_RUN: usize = 2;

/// Builds and lowers stub plans for one backend.
pub struct StubSynthesizer<'a, B: StubBackend> {
    backend: &'a B,
    config: &'a EncoderConfig,
}

impl<'a, B: StubBackend> StubSynthesizer<'a, B> {
    pub fn new(backend: &'a B, config: &'a EncoderConfig) -> Self {
        Self { backend, config }
    }

    /// Produce the decoder stub for a payload of `payload_len` bytes.
    pub fn synthesize<'arena>(
        &self,
        schedule: &KeySchedule,
        payload_len: usize,
        session: &SynthesisSession<'arena>,
    ) -> Result<Vec<u8>, EncodingError> {
        let limit = self.backend.max_payload_len();
        let len = u32::try_from(payload_len)
            .ok()
            .filter(|_| payload_len <= limit)
            .ok_or(EncodingError::PayloadTooLarge { len: payload_len, limit })?;

        let plan = self.plan(schedule, len, session)?;
        let stub = self.resolve_layout(&plan, session)?;
        session.record_stub_len(stub.len());

        debug!(
            "{} stub synthesized: {} items, {}",
            self.backend.architecture(),
            plan.len(),
            session.stats()
        );
        Ok(stub)
    }

    /// Build the stub plan in the session arena.
    pub fn plan<'arena>(
        &self,
        schedule: &KeySchedule,
        len: u32,
        session: &SynthesisSession<'arena>,
    ) -> Result<BumpVec<'arena, StubItem<B::Junk>>, EncodingError> {
        let plain = self.config.plain_decoder;
        let arena = session.arena();
        let mut body: BumpVec<'arena, StubItem<B::Junk>> = BumpVec::new_in(arena);
        let mut file = RegisterFile::new();
        let mut fixups = 0usize;

        if !plain {
            let mut layout_rng = schedule.layout_choices();
            self.junk_run(&mut layout_rng, RegBitSet::new(), &mut body, session);
        }

        for entry in schedule.entries().iter().rev() {
            let mut rng = entry.choices();
            file.release_all();
            let regs = self.backend.assign_registers(plain, &mut rng, &mut file)?;
            let reserved = regs.as_set();
            session.record_pass_planned();

            let order = if plain {
                SetupStep::CANONICAL
            } else {
                self.junk_run(&mut rng, reserved, &mut body, session);
                shuffled_setup(&mut rng)
            };

            for step in order {
                let item = match step {
                    SetupStep::Counter => StubItem::LoadCounter {
                        reg: regs.counter,
                        len,
                    },
                    SetupStep::Key => StubItem::LoadKey {
                        reg: regs.key,
                        key: entry.pass.key,
                    },
                    SetupStep::PayloadAddress => {
                        fixups += 1;
                        StubItem::LoadPayloadAddress {
                            reg: regs.pointer,
                            fixup: fixups - 1,
                        }
                    }
                };
                trace!("plan: {item:?}");
                body.push(item);
                if !plain {
                    self.junk_run(&mut rng, reserved, &mut body, session);
                }
            }

            body.push(StubItem::DecodeLoop {
                op: entry.pass.op,
                regs,
            });
        }

        if self.backend.synchronizes_instruction_cache() {
            let last = body.iter().rev().find_map(|item| match item {
                StubItem::DecodeLoop { regs, .. } => Some(*regs),
                _ => None,
            });
            if let Some(regs) = last {
                body.push(StubItem::SyncInstructionCache { regs, len });
            }
        }

        let mut plan = BumpVec::with_capacity_in(body.len() + 2, arena);
        if self.config.save_registers {
            let saved = file.clobbered();
            session.record_saved_registers(saved.count());
            plan.push(StubItem::SaveRegisters(saved));
            plan.extend(body.into_iter());
            plan.push(StubItem::RestoreRegisters(saved));
        } else {
            plan.extend(body.into_iter());
        }
        Ok(plan)
    }

    fn junk_run<'arena, R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        reserved: RegBitSet,
        out: &mut BumpVec<'arena, StubItem<B::Junk>>,
        session: &SynthesisSession<'arena>,
    ) {
        let count = pick_index(rng, MAX_JUNK_RUN + 1);
        for _ in 0..count {
            let junk = self.backend.generate_junk(rng, reserved);
            trace!("plan: junk {junk:?}");
            out.push(StubItem::Junk(junk));
            session.record_junk();
        }
    }

    /// Lower `plan` until its layout is a fixed point.
    pub fn resolve_layout(
        &self,
        plan: &[StubItem<B::Junk>],
        session: &SynthesisSession<'_>,
    ) -> Result<Vec<u8>, EncodingError> {
        let fixups = plan
            .iter()
            .filter(|item| matches!(item, StubItem::LoadPayloadAddress { .. }))
            .count();
        let mut layout = StubLayout {
            payload_offset: 0,
            anchors: vec![0; fixups],
        };

        for iteration in 1..=MAX_LAYOUT_ITERATIONS {
            session.record_layout_iteration();
            let lowered = self.backend.lower(plan, &layout)?;
            if lowered.bytes.len() == layout.payload_offset && lowered.anchors == layout.anchors {
                trace!("layout stable after {iteration} iterations");
                return Ok(lowered.bytes);
            }
            layout = StubLayout {
                payload_offset: lowered.bytes.len(),
                anchors: lowered.anchors,
            };
        }

        Err(EncodingError::UnresolvedFixup {
            iterations: MAX_LAYOUT_ITERATIONS,
        })
    }
}

fn shuffled_setup<R: Rng + ?Sized>(rng: &mut R) -> [SetupStep; 3] {
    let mut order = SetupStep::CANONICAL;
    for i in (1..order.len()).rev() {
        let j = pick_index(rng, i + 1);
        order.swap(i, j);
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::Architecture;
    use crate::core::register_file::AsmReg;
    use crate::stub::{LoweredStub, PassRegisters};
    use bumpalo::Bump;

    /// One byte per item, except address loads which grow from one to four
    /// bytes once the payload is 16 or more bytes away.
    struct ToyBackend;

    impl StubBackend for ToyBackend {
        type Junk = u8;

        fn architecture(&self) -> Architecture {
            Architecture::X64
        }

        fn max_payload_len(&self) -> usize {
            1000
        }

        fn canonical_registers(&self) -> PassRegisters {
            PassRegisters {
                pointer: AsmReg::new(6),
                counter: AsmReg::new(1),
                key: AsmReg::new(0),
                scratch: None,
            }
        }

        fn choose_registers<R: Rng + ?Sized>(
            &self,
            rng: &mut R,
            file: &mut RegisterFile,
        ) -> Result<PassRegisters, EncodingError> {
            let pool: Vec<AsmReg> = (0..8).map(AsmReg::new).collect();
            Ok(PassRegisters {
                key: file.allocate_random(rng, &pool, "key")?,
                pointer: file.allocate_random(rng, &pool, "pointer")?,
                counter: file.allocate_random(rng, &pool, "counter")?,
                scratch: None,
            })
        }

        fn generate_junk<R: Rng + ?Sized>(&self, rng: &mut R, _reserved: RegBitSet) -> u8 {
            rng.gen()
        }

        fn lower(&self, items: &[StubItem<u8>], layout: &StubLayout) -> Result<LoweredStub, EncodingError> {
            let mut bytes = Vec::new();
            let mut anchors = vec![0; layout.anchors.len()];
            for item in items {
                match item {
                    StubItem::LoadPayloadAddress { fixup, .. } => {
                        anchors[*fixup] = bytes.len();
                        let distance = layout.payload_offset.saturating_sub(layout.anchors[*fixup]);
                        let size = if distance < 16 { 1 } else { 4 };
                        bytes.extend(std::iter::repeat(0xAA).take(size));
                    }
                    _ => bytes.push(0x90),
                }
            }
            Ok(LoweredStub { bytes, anchors })
        }
    }

    /// Toy lowering whose length always outruns the payload offset it was given.
    struct GrowingBackend {
        sync: bool,
    }

    impl StubBackend for GrowingBackend {
        type Junk = u8;

        fn architecture(&self) -> Architecture {
            Architecture::AArch64
        }

        fn synchronizes_instruction_cache(&self) -> bool {
            self.sync
        }

        fn canonical_registers(&self) -> PassRegisters {
            ToyBackend.canonical_registers()
        }

        fn choose_registers<R: Rng + ?Sized>(
            &self,
            rng: &mut R,
            file: &mut RegisterFile,
        ) -> Result<PassRegisters, EncodingError> {
            ToyBackend.choose_registers(rng, file)
        }

        fn generate_junk<R: Rng + ?Sized>(&self, rng: &mut R, reserved: RegBitSet) -> u8 {
            ToyBackend.generate_junk(rng, reserved)
        }

        fn lower(&self, items: &[StubItem<u8>], layout: &StubLayout) -> Result<LoweredStub, EncodingError> {
            Ok(LoweredStub {
                bytes: vec![0x90; items.len() + layout.payload_offset + 1],
                anchors: layout.anchors.clone(),
            })
        }
    }

    fn config(plain: bool, passes: u32, save: bool) -> EncoderConfig {
        EncoderConfig::new(Architecture::X64, 0x42, plain, passes, save).unwrap()
    }

    #[test]
    fn test_plain_plan_shape() {
        let arena = Bump::new();
        let session = SynthesisSession::new(&arena);
        let config = config(true, 2, false);
        let schedule = KeySchedule::derive(&config);
        let backend = ToyBackend;
        let synthesizer = StubSynthesizer::new(&backend, &config);

        let plan = synthesizer.plan(&schedule, 3, &session).unwrap();
        assert_eq!(plan.len(), 8);
        assert!(!plan.iter().any(|item| matches!(item, StubItem::Junk(_))));

        // last pass is undone first
        let passes = schedule.passes();
        match &plan[3] {
            StubItem::DecodeLoop { op, .. } => assert_eq!(*op, passes[1].op),
            other => panic!("unexpected item {other:?}"),
        }
        match &plan[5] {
            StubItem::LoadKey { key, .. } => assert_eq!(*key, 0x42),
            other => panic!("unexpected item {other:?}"),
        }
        assert_eq!(session.stats().junk_items, 0);
    }

    #[test]
    fn test_junk_never_last() {
        for seed in 0..=255u8 {
            let arena = Bump::new();
            let session = SynthesisSession::new(&arena);
            let config = EncoderConfig::new(Architecture::X64, seed, false, 3, false).unwrap();
            let schedule = KeySchedule::derive(&config);
            let backend = ToyBackend;
            let plan = StubSynthesizer::new(&backend, &config)
                .plan(&schedule, 10, &session)
                .unwrap();
            assert!(matches!(plan.last(), Some(StubItem::DecodeLoop { .. })));
        }
    }

    #[test]
    fn test_save_wraps_plan() {
        let arena = Bump::new();
        let session = SynthesisSession::new(&arena);
        let config = config(true, 1, true);
        let schedule = KeySchedule::derive(&config);
        let backend = ToyBackend;
        let plan = StubSynthesizer::new(&backend, &config)
            .plan(&schedule, 1, &session)
            .unwrap();

        let expected = RegBitSet::from_regs(&[AsmReg::new(0), AsmReg::new(1), AsmReg::new(6)]);
        assert_eq!(plan.first(), Some(&StubItem::SaveRegisters(expected)));
        assert_eq!(plan.last(), Some(&StubItem::RestoreRegisters(expected)));
    }

    #[test]
    fn test_layout_fixed_point() {
        let arena = Bump::new();
        let session = SynthesisSession::new(&arena);
        let config = config(false, 4, true);
        let schedule = KeySchedule::derive(&config);
        let backend = ToyBackend;
        let synthesizer = StubSynthesizer::new(&backend, &config);

        let stub = synthesizer.synthesize(&schedule, 100, &session).unwrap();
        let stats = session.stats();
        assert_eq!(stats.stub_len, stub.len());
        assert!(stats.layout_iterations >= 2);
        assert!(stats.layout_iterations <= MAX_LAYOUT_ITERATIONS);
    }

    #[test]
    fn test_payload_limit() {
        let arena = Bump::new();
        let session = SynthesisSession::new(&arena);
        let config = config(true, 1, false);
        let schedule = KeySchedule::derive(&config);
        let backend = ToyBackend;
        let err = StubSynthesizer::new(&backend, &config)
            .synthesize(&schedule, 1001, &session)
            .unwrap_err();
        assert_eq!(err, EncodingError::PayloadTooLarge { len: 1001, limit: 1000 });
    }

    #[test]
    fn test_layout_that_never_settles_is_rejected() {
        let arena = Bump::new();
        let session = SynthesisSession::new(&arena);
        let config = config(true, 1, false);
        let schedule = KeySchedule::derive(&config);
        let backend = GrowingBackend { sync: false };
        let err = StubSynthesizer::new(&backend, &config)
            .synthesize(&schedule, 8, &session)
            .unwrap_err();
        assert_eq!(
            err,
            EncodingError::UnresolvedFixup {
                iterations: MAX_LAYOUT_ITERATIONS
            }
        );
        assert_eq!(session.stats().layout_iterations, MAX_LAYOUT_ITERATIONS);
    }

    #[test]
    fn test_cache_sync_follows_final_loop() {
        let arena = Bump::new();
        let session = SynthesisSession::new(&arena);
        let config = config(false, 3, true);
        let schedule = KeySchedule::derive(&config);
        let backend = GrowingBackend { sync: true };
        let plan = StubSynthesizer::new(&backend, &config)
            .plan(&schedule, 40, &session)
            .unwrap();

        let syncs: Vec<usize> = plan
            .iter()
            .enumerate()
            .filter(|(_, item)| matches!(item, StubItem::SyncInstructionCache { .. }))
            .map(|(i, _)| i)
            .collect();
        assert_eq!(syncs, vec![plan.len() - 2]);
        assert!(matches!(plan[plan.len() - 3], StubItem::DecodeLoop { .. }));
        match (&plan[plan.len() - 3], &plan[plan.len() - 2]) {
            (StubItem::DecodeLoop { regs, .. }, StubItem::SyncInstructionCache { regs: synced, len }) => {
                assert_eq!(regs, synced);
                assert_eq!(*len, 40);
            }
            other => panic!("unexpected tail {other:?}"),
        }
    }
}
