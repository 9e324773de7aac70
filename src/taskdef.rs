use crate::common::{to_ctx_id, CtxId, NodeId, MAX_PREFETCH_SLOTS};

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::collections::VecDeque;

/// Hardware context kinds understood by the FFTS+ dispatcher.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum ContextType {
    #[default]
    AiCore,
    /// Used by prefetch contexts.
    FlushData,
    InvalidateData,
    WritebackData,
}

/// One slice extent of an auto-threaded data context.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SliceExtent {
    pub num_outter: u32,
    pub num_inner: u32,
    pub len_inner: u32,
    pub stride_outter: u32,
    pub stride_inner: u32,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputeCtxDef {
    pub node: NodeId,
    pub ctx_type: ContextType,
    pub thread_id: u16,
    pub thread_dim: u16,
    pub pred_cnt: u32,
    pub pred_cnt_init: u32,
    pub successors: Vec<CtxId>,
    /// Prefetch data contexts feeding this context. Slot `i` is live iff bit `i` of
    /// `prefetch_enable_bitmap` is set.
    pub src_slot: SmallVec<[CtxId; MAX_PREFETCH_SLOTS]>,
    pub prefetch_enable_bitmap: u8,
}

/// A cache-maintenance context (write-back, invalidate or prefetch).
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataCtxDef {
    pub ctx_type: ContextType,
    pub aten: bool,
    pub atm: bool,
    pub cnt: u32,
    pub cnt_init: u32,
    pub orig_consumer_counter: u32,
    pub run_consumer_counter: u32,
    pub thread_id: u16,
    pub thread_dim: u16,
    pub addr_base: u64,
    pub addr_offset: u64,
    pub non_tail: SliceExtent,
    pub tail: SliceExtent,
    pub successors: Vec<CtxId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FftsPlusCtxDef {
    Compute(ComputeCtxDef),
    Data(DataCtxDef),
}

/// The ordered context list handed to the FFTS+ dispatcher.
///
/// A context's position is its id for the lifetime of the task. The only way to add a context
/// is [FftsPlusTaskDef::push_context], and nothing is ever removed.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FftsPlusTaskDef {
    contexts: Vec<FftsPlusCtxDef>,
}

#[derive(thiserror::Error, Debug)]
pub enum TaskDefError {
    #[error("Context {0} does not exist")]
    UnknownContext(CtxId),
    #[error("Context {0} is not a data context")]
    NotDataContext(CtxId),
    #[error("Context {0} is not a compute context")]
    NotComputeContext(CtxId),
    #[error("Successor graph has a cycle through context {0}")]
    Cycle(CtxId),
    #[error("Failed to encode or decode task: {0}")]
    Codec(#[from] bincode::Error),
}

impl DataCtxDef {
    pub fn new(ctx_type: ContextType) -> Self {
        DataCtxDef {
            ctx_type,
            ..Default::default()
        }
    }

    /// Sets `cnt`, `cnt_init` and both consumer counters to `count`.
    pub fn set_counters(&mut self, count: u32) {
        self.cnt = count;
        self.cnt_init = count;
        self.orig_consumer_counter = count;
        self.run_consumer_counter = count;
    }
}

impl FftsPlusCtxDef {
    pub fn ctx_type(&self) -> ContextType {
        match self {
            FftsPlusCtxDef::Compute(c) => c.ctx_type,
            FftsPlusCtxDef::Data(d) => d.ctx_type,
        }
    }

    pub fn successors(&self) -> &[CtxId] {
        match self {
            FftsPlusCtxDef::Compute(c) => &c.successors,
            FftsPlusCtxDef::Data(d) => &d.successors,
        }
    }

    pub fn successors_mut(&mut self) -> &mut Vec<CtxId> {
        match self {
            FftsPlusCtxDef::Compute(c) => &mut c.successors,
            FftsPlusCtxDef::Data(d) => &mut d.successors,
        }
    }

    pub fn thread_id(&self) -> u16 {
        match self {
            FftsPlusCtxDef::Compute(c) => c.thread_id,
            FftsPlusCtxDef::Data(d) => d.thread_id,
        }
    }

    pub fn thread_dim(&self) -> u16 {
        match self {
            FftsPlusCtxDef::Compute(c) => c.thread_dim,
            FftsPlusCtxDef::Data(d) => d.thread_dim,
        }
    }

    pub fn as_data(&self) -> Option<&DataCtxDef> {
        match self {
            FftsPlusCtxDef::Data(d) => Some(d),
            FftsPlusCtxDef::Compute(_) => None,
        }
    }

    pub fn as_compute(&self) -> Option<&ComputeCtxDef> {
        match self {
            FftsPlusCtxDef::Compute(c) => Some(c),
            FftsPlusCtxDef::Data(_) => None,
        }
    }
}

impl FftsPlusTaskDef {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `ctx` and returns its permanent id.
    pub fn push_context(&mut self, ctx: FftsPlusCtxDef) -> CtxId {
        self.contexts.push(ctx);
        to_ctx_id(self.contexts.len() - 1)
    }

    pub fn ctx_size(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    pub fn get(&self, id: CtxId) -> Option<&FftsPlusCtxDef> {
        self.contexts.get(id as usize)
    }

    pub fn ctx_mut(&mut self, id: CtxId) -> Result<&mut FftsPlusCtxDef, TaskDefError> {
        self.contexts
            .get_mut(id as usize)
            .ok_or(TaskDefError::UnknownContext(id))
    }

    pub fn data_ctx(&self, id: CtxId) -> Result<&DataCtxDef, TaskDefError> {
        self.get(id)
            .ok_or(TaskDefError::UnknownContext(id))?
            .as_data()
            .ok_or(TaskDefError::NotDataContext(id))
    }

    pub fn data_ctx_mut(&mut self, id: CtxId) -> Result<&mut DataCtxDef, TaskDefError> {
        match self.ctx_mut(id)? {
            FftsPlusCtxDef::Data(d) => Ok(d),
            FftsPlusCtxDef::Compute(_) => Err(TaskDefError::NotDataContext(id)),
        }
    }

    pub fn compute_ctx_mut(&mut self, id: CtxId) -> Result<&mut ComputeCtxDef, TaskDefError> {
        match self.ctx_mut(id)? {
            FftsPlusCtxDef::Compute(c) => Ok(c),
            FftsPlusCtxDef::Data(_) => Err(TaskDefError::NotComputeContext(id)),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (CtxId, &FftsPlusCtxDef)> + '_ {
        self.contexts
            .iter()
            .enumerate()
            .map(|(i, c)| (to_ctx_id(i), c))
    }

    /// Returns the ids of all contexts listing `id` as a successor.
    pub fn predecessors(&self, id: CtxId) -> Vec<CtxId> {
        self.iter()
            .flat_map(|(src, ctx)| {
                ctx.successors()
                    .iter()
                    .filter(move |&&dst| dst == id)
                    .map(move |_| src)
            })
            .collect()
    }

    /// Checks that the successor graph is a DAG over existing contexts.
    pub fn check_acyclic(&self) -> Result<(), TaskDefError> {
        let n = self.contexts.len();
        let mut in_degree = vec![0usize; n];
        for ctx in &self.contexts {
            for &dst in ctx.successors() {
                *in_degree
                    .get_mut(dst as usize)
                    .ok_or(TaskDefError::UnknownContext(dst))? += 1;
            }
        }

        let mut ready = (0..n)
            .filter(|&i| in_degree[i] == 0)
            .collect::<VecDeque<_>>();
        let mut visited = 0;
        while let Some(i) = ready.pop_front() {
            visited += 1;
            for &dst in self.contexts[i].successors() {
                let d = &mut in_degree[dst as usize];
                *d -= 1;
                if *d == 0 {
                    ready.push_back(dst as usize);
                }
            }
        }

        if visited == n {
            return Ok(());
        }
        let stuck = in_degree.iter().position(|&d| d > 0).unwrap_or_default();
        Err(TaskDefError::Cycle(to_ctx_id(stuck)))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, TaskDefError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TaskDefError> {
        Ok(bincode::deserialize(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn data(ctx_type: ContextType) -> FftsPlusCtxDef {
        FftsPlusCtxDef::Data(DataCtxDef::new(ctx_type))
    }

    fn compute() -> FftsPlusCtxDef {
        FftsPlusCtxDef::Compute(ComputeCtxDef::default())
    }

    proptest! {
        #[test]
        fn test_push_context_returns_append_position(
            kinds in prop::collection::vec(prop::option::of(any::<ContextType>()), 0..64)
        ) {
            let mut task = FftsPlusTaskDef::new();
            for (k, kind) in kinds.iter().enumerate() {
                let ctx = match kind {
                    Some(t) => data(*t),
                    None => compute(),
                };
                prop_assert_eq!(task.push_context(ctx), k as CtxId);
            }
            prop_assert_eq!(task.ctx_size(), kinds.len());
        }
    }

    #[test]
    fn test_check_acyclic_accepts_chain() {
        let mut task = FftsPlusTaskDef::new();
        let a = task.push_context(compute());
        let b = task.push_context(data(ContextType::WritebackData));
        let c = task.push_context(compute());
        task.ctx_mut(a).unwrap().successors_mut().push(b);
        task.ctx_mut(b).unwrap().successors_mut().push(c);
        task.ctx_mut(a).unwrap().successors_mut().push(c);
        assert!(task.check_acyclic().is_ok());
        assert_eq!(task.predecessors(c), vec![a, b]);
    }

    #[test]
    fn test_check_acyclic_rejects_cycle() {
        let mut task = FftsPlusTaskDef::new();
        let a = task.push_context(compute());
        let b = task.push_context(data(ContextType::InvalidateData));
        task.ctx_mut(a).unwrap().successors_mut().push(b);
        task.ctx_mut(b).unwrap().successors_mut().push(a);
        assert!(matches!(task.check_acyclic(), Err(TaskDefError::Cycle(_))));
    }

    #[test]
    fn test_check_acyclic_rejects_dangling_successor() {
        let mut task = FftsPlusTaskDef::new();
        let a = task.push_context(compute());
        task.ctx_mut(a).unwrap().successors_mut().push(9);
        assert!(matches!(
            task.check_acyclic(),
            Err(TaskDefError::UnknownContext(9))
        ));
    }

    #[test]
    fn test_bytes_preserve_context_order() {
        let mut task = FftsPlusTaskDef::new();
        task.push_context(compute());
        let mut wb = DataCtxDef::new(ContextType::WritebackData);
        wb.set_counters(1);
        wb.addr_base = 0x1000;
        task.push_context(FftsPlusCtxDef::Data(wb));
        let decoded = FftsPlusTaskDef::from_bytes(&task.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, task);
        assert_eq!(
            decoded.data_ctx(1).unwrap().ctx_type,
            ContextType::WritebackData
        );
    }

    #[test]
    fn test_data_ctx_mut_rejects_compute_context() {
        let mut task = FftsPlusTaskDef::new();
        let a = task.push_context(compute());
        assert!(matches!(
            task.data_ctx_mut(a),
            Err(TaskDefError::NotDataContext(0))
        ));
    }
}
