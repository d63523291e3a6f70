//! Collective algorithms over an operation context.
//!
//! Every routine here assumes all ranks of the group call it in the same
//! order with the same arguments; frames are matched purely by position.

mod allreduce;
mod barrier;
mod helpers;

pub(crate) use allreduce::ring_allreduce;
pub(crate) use barrier::dissemination_barrier;
