//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use lockstep_rollback::{IfdId, InputFrame, JoinIndex, RdfId, TickSimulator};

/// An order-sensitive accumulator standing in for a real game: folding the
/// same inputs in a different order, or different inputs at any tick, yields
/// a different state, so any divergence between two replays is visible in a
/// single `u64`.
pub struct FoldSim;

impl TickSimulator for FoldSim {
    type State = u64;

    fn step_one_tick(&mut self, from_rdf_id: RdfId, state: &u64, input: &InputFrame) -> u64 {
        let mut acc = state
            .wrapping_mul(0x100_0000_01b3)
            .wrapping_add(from_rdf_id.as_i32() as u64);
        for &value in &input.input_list {
            acc = acc.wrapping_mul(0x100_0000_01b3).wrapping_add(value);
        }
        acc
    }
}

/// The scripted input each player produces for each input frame. Frame 0 is
/// zero for everyone: inputs inside the initial delay window are consumed
/// before any exchange can reveal them, so scripting them non-zero would make
/// client/server convergence impossible by construction.
pub fn scripted_cmd(join_index: JoinIndex, ifd_id: IfdId) -> u64 {
    if ifd_id.as_i32() == 0 {
        0
    } else {
        ifd_id.as_i32() as u64 * 10 + u64::from(join_index.get())
    }
}

/// Best-effort tracing init so failing tests show engine decisions; repeated
/// calls are fine.
pub fn init_tracing() {
    let _ = tracing_log::LogTracer::init();
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .try_init();
}
