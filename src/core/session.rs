// This module provides the arena-based synthesis session used by one encode call. The session
// owns a reference to a bumpalo arena in which the stub plan (the arch-neutral item list the
// synthesizer builds before lowering) is allocated, so a plan and everything hanging off it
// share one lifetime and are freed in one go when the caller drops the arena. Alongside the
// arena the session keeps SessionStats behind a RefCell: how many passes were planned, how
// many junk items were inserted, how many layout iterations the fixup loop needed, the final
// stub length and the number of registers saved. Stats are purely diagnostic; the encoder
// logs them at debug level and tests use them to check that plain stubs carry no junk.

//! Arena-based synthesis session.

use bumpalo::Bump;
use std::cell::RefCell;
use std::fmt;

/// Per-call synthesis session.
pub struct SynthesisSession<'arena> {
    arena: &'arena Bump,
    stats: RefCell<SessionStats>,
}

impl<'arena> SynthesisSession<'arena> {
    pub fn new(arena: &'arena Bump) -> Self {
        Self {
            arena,
            stats: RefCell::new(SessionStats::default()),
        }
    }

    /// Get access to the arena allocator.
    pub fn arena(&self) -> &'arena Bump {
        self.arena
    }

    /// Allocate an object in the session arena.
    pub fn alloc<T>(&self, value: T) -> &'arena mut T {
        self.arena.alloc(value)
    }

    pub fn record_pass_planned(&self) {
        self.stats.borrow_mut().passes_planned += 1;
    }

    pub fn record_junk(&self) {
        self.stats.borrow_mut().junk_items += 1;
    }

    pub fn record_layout_iteration(&self) {
        self.stats.borrow_mut().layout_iterations += 1;
    }

    pub fn record_saved_registers(&self, count: u32) {
        self.stats.borrow_mut().saved_registers = count;
    }

    pub fn record_stub_len(&self, len: usize) {
        self.stats.borrow_mut().stub_len = len;
    }

    /// Snapshot of the statistics gathered so far.
    pub fn stats(&self) -> SessionStats {
        self.stats.borrow().clone()
    }
}

/// Diagnostic counters for one synthesis run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub passes_planned: usize,
    pub junk_items: usize,
    /// Lowerings performed until the payload offset was stable.
    pub layout_iterations: usize,
    pub saved_registers: u32,
    pub stub_len: usize,
}

impl fmt::Display for SessionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "passes={} junk={} layout_iterations={} saved_registers={} stub_len={}",
            self.passes_planned,
            self.junk_items,
            self.layout_iterations,
            self.saved_registers,
            self.stub_len
        )
    }
}
