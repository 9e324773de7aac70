use serde::{Deserialize, Serialize};
use std::fmt::Display;

/// Index of a context within an [crate::taskdef::FftsPlusTaskDef].
pub type CtxId = u32;
pub type OpModelId = u64;

/// Number of thread-window slots the hardware round-robins over for operators whose thread
/// count is only known at run time.
pub const DYNAMIC_WINDOW_SIZE: usize = 4;

/// Prefetch source slots available on a single compute context.
pub const MAX_PREFETCH_SLOTS: usize = 4;

#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize,
)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub struct NodeId(pub u32);

/// Opaque handle of a device stream an executor is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub struct StreamId(pub u64);

impl Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "n{}", self.0)
    }
}

impl Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "stream#{}", self.0)
    }
}

pub(crate) fn to_ctx_id(idx: usize) -> CtxId {
    CtxId::try_from(idx).expect("context count exceeds u32::MAX")
}
