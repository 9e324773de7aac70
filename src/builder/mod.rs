//! Builders for FFTS+ data contexts: the write-back, invalidate and prefetch contexts the
//! hardware scheduler runs around compute contexts to manage caches without a software
//! scheduler in the loop.
//!
//! Each builder appends contexts to a shared [FftsPlusTaskDef] and wires them into the
//! successor graph so that hardware counter decrements fire them in dependency order.

use crate::common::{CtxId, NodeId, DYNAMIC_WINDOW_SIZE};
use crate::graph::{Graph, Node};
use crate::taskdef::{ContextType, DataCtxDef, FftsPlusTaskDef, SliceExtent, TaskDefError};

use enum_dispatch::enum_dispatch;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub mod linker;
pub mod out_auto;
pub mod out_dynamic;
pub mod prefetch_auto;

pub use out_auto::OutAutoTaskBuilder;
pub use out_dynamic::OutDynamicTaskBuilder;
pub use prefetch_auto::PrefetchAutoTaskBuilder;

pub(crate) const AUTO_CTX_ID_LIST: &str = "auto_ctx_id_list";
pub(crate) const OUTPUT_ADDRS: &str = "output_addrs";
pub(crate) const SLICE_INFO: &str = "slice_info";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum CacheOperation {
    WriteBack,
    Invalidate,
    Prefetch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum ThreadingMode {
    /// Thread count known at compile time; one context per window.
    Static,
    /// Thread count known only at run time; contexts for all dynamic window slots at once.
    Dynamic,
}

/// Addressing parameters of one thread slice.
///
/// The first entry describes non-tail slices and the last entry the tail slice.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataContextParam {
    pub num_outter: u32,
    pub num_inner: u32,
    pub len_inner: u32,
    pub stride_outter: u32,
    pub stride_inner: u32,
    pub base_addr_offset: u64,
}

#[derive(thiserror::Error, Debug)]
pub enum BuildError {
    #[error("Node {node} has no `{attr}` attribute")]
    MissingAttr { node: String, attr: &'static str },
    #[error("Anchor {anchor} of {node} is out of range ({len} available)")]
    AnchorOutOfRange {
        node: String,
        anchor: u32,
        len: usize,
    },
    #[error("Input {anchor} of {node} has no producer")]
    MissingProducer { node: String, anchor: u32 },
    #[error("Window {window} of {node} is out of range ({len} available)")]
    WindowOutOfRange {
        node: String,
        window: u32,
        len: usize,
    },
    #[error("{node} needs {} context ids, got {len}", DYNAMIC_WINDOW_SIZE)]
    CtxIdListSize { node: String, len: usize },
    #[error("Prefetch for {node} needs addressing parameters")]
    EmptyParams { node: String },
    #[error("Context {0} cannot be its own successor")]
    SelfLoop(CtxId),
    #[error("All prefetch slots of context {0} are in use")]
    PrefetchSlotsExhausted(CtxId),
    #[error("{operation} contexts cannot be built in {mode} threading mode")]
    UnsupportedMode {
        operation: CacheOperation,
        mode: ThreadingMode,
    },
    #[error(transparent)]
    TaskDef(#[from] TaskDefError),
}

/// Per-window chains of dynamic data contexts created for each node, accumulated across every
/// call that touches the node.
#[derive(Debug, Default, Clone)]
pub struct CompileContext {
    write_back_ctx_ids: HashMap<NodeId, Vec<Vec<CtxId>>>,
    invalid_ctx_ids: HashMap<NodeId, Vec<Vec<CtxId>>>,
}

#[enum_dispatch]
pub trait DataTaskBuilder {
    fn operation(&self) -> CacheOperation;

    /// Appends and fills one data context for window `window_id` of a statically-threaded node,
    /// returning its id.
    ///
    /// On error, contexts already appended stay in `task_def`; the caller must abandon the
    /// node's cache contexts.
    fn fill_auto_data_ctx(
        &self,
        _anchor_index: u32,
        _node: NodeId,
        _graph: &Graph,
        _params: &[DataContextParam],
        _task_def: &mut FftsPlusTaskDef,
        _window_id: u32,
    ) -> Result<CtxId, BuildError> {
        Err(BuildError::UnsupportedMode {
            operation: self.operation(),
            mode: ThreadingMode::Static,
        })
    }

    /// Appends [DYNAMIC_WINDOW_SIZE] data contexts, one per dynamic window slot, and records them
    /// in `cx`.
    fn fill_dynamic_data_ctx(
        &self,
        _anchor_index: u32,
        _node: NodeId,
        _graph: &Graph,
        _task_def: &mut FftsPlusTaskDef,
        _cx: &mut CompileContext,
        _context_id_list: &[CtxId],
    ) -> Result<[CtxId; DYNAMIC_WINDOW_SIZE], BuildError> {
        Err(BuildError::UnsupportedMode {
            operation: self.operation(),
            mode: ThreadingMode::Dynamic,
        })
    }

    /// If output `anchor_index` of `node` is reused by another node, makes that node's context
    /// at `window_id` wait for the invalidate context `data_ctx_id`.
    fn update_invalid_ctx_with_mem_reuse(
        &self,
        anchor_index: u32,
        node: NodeId,
        graph: &Graph,
        data_ctx_id: CtxId,
        window_id: u32,
        task_def: &mut FftsPlusTaskDef,
    ) -> Result<(), BuildError> {
        linker::gen_invalid_succ_list_with_mem_reuse(
            anchor_index,
            node,
            graph,
            data_ctx_id,
            window_id,
            task_def,
        )
    }
}

#[derive(Debug, Clone)]
#[enum_dispatch(DataTaskBuilder)]
pub enum DataTask {
    OutAuto(OutAutoTaskBuilder),
    OutDynamic(OutDynamicTaskBuilder),
    PrefetchAuto(PrefetchAutoTaskBuilder),
}

impl CacheOperation {
    pub fn data_ctx_type(&self) -> ContextType {
        match self {
            CacheOperation::WriteBack => ContextType::WritebackData,
            CacheOperation::Invalidate => ContextType::InvalidateData,
            CacheOperation::Prefetch => ContextType::FlushData,
        }
    }
}

impl DataContextParam {
    pub fn extent(&self) -> SliceExtent {
        SliceExtent {
            num_outter: self.num_outter,
            num_inner: self.num_inner,
            len_inner: self.len_inner,
            stride_outter: self.stride_outter,
            stride_inner: self.stride_inner,
        }
    }
}

impl DataTask {
    pub fn new(operation: CacheOperation, mode: ThreadingMode) -> Result<Self, BuildError> {
        match (operation, mode) {
            (CacheOperation::WriteBack | CacheOperation::Invalidate, ThreadingMode::Static) => {
                Ok(OutAutoTaskBuilder::new(operation).into())
            }
            (CacheOperation::WriteBack | CacheOperation::Invalidate, ThreadingMode::Dynamic) => {
                Ok(OutDynamicTaskBuilder::new(operation).into())
            }
            (CacheOperation::Prefetch, ThreadingMode::Static) => {
                Ok(PrefetchAutoTaskBuilder::new().into())
            }
            (CacheOperation::Prefetch, ThreadingMode::Dynamic) => {
                Err(BuildError::UnsupportedMode { operation, mode })
            }
        }
    }
}

impl CompileContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write-back context chains of `node`, indexed by dynamic window.
    pub fn write_back_ctx_id_list(&self, node: NodeId) -> &[Vec<CtxId>] {
        self.write_back_ctx_ids
            .get(&node)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Invalidate context chains of `node`, indexed by dynamic window.
    pub fn invalid_ctx_id_list(&self, node: NodeId) -> &[Vec<CtxId>] {
        self.invalid_ctx_ids
            .get(&node)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub(crate) fn chains_mut(
        &mut self,
        node: NodeId,
        operation: CacheOperation,
    ) -> &mut Vec<Vec<CtxId>> {
        let table = match operation {
            CacheOperation::Invalidate => &mut self.invalid_ctx_ids,
            CacheOperation::WriteBack => &mut self.write_back_ctx_ids,
            CacheOperation::Prefetch => {
                unreachable!("prefetch contexts are never built in dynamic mode")
            }
        };
        let chains = table.entry(node).or_default();
        if chains.len() < DYNAMIC_WINDOW_SIZE {
            chains.resize(DYNAMIC_WINDOW_SIZE, Vec::new());
        }
        chains
    }
}

impl BuildError {
    pub(crate) fn missing(node: &Node, attr: &'static str) -> Self {
        BuildError::MissingAttr {
            node: node.label().to_string(),
            attr,
        }
    }
}

/// Resolves `(thread_id, thread_dim)` of window `window_id` from the node's slice structure.
pub(crate) fn slice_thread(node: &Node, window_id: u32) -> Result<(u16, u16), BuildError> {
    let slice_info = node
        .slice_info
        .ok_or_else(|| BuildError::missing(node, SLICE_INFO))?;
    let thread_dim = slice_info.slice_instance_num;
    if window_id >= u32::from(thread_dim) {
        return Err(BuildError::WindowOutOfRange {
            node: node.label().to_string(),
            window: window_id,
            len: usize::from(thread_dim),
        });
    }
    Ok((window_id as u16, thread_dim))
}

/// Copies non-tail and tail slice extents into an auto-threaded data context.
pub fn fill_auto_threading_param(
    params: &[DataContextParam],
    data_ctx: &mut DataCtxDef,
    thread_dim: u16,
) {
    let (Some(first), Some(last)) = (params.first(), params.last()) else {
        return;
    };
    data_ctx.thread_dim = thread_dim;
    data_ctx.addr_offset = first.base_addr_offset;
    data_ctx.non_tail = first.extent();
    data_ctx.tail = last.extent();
}


#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn test_data_task_new_matches_operation(
            operation in any::<CacheOperation>(),
            mode in any::<ThreadingMode>(),
        ) {
            match DataTask::new(operation, mode) {
                Ok(task) => {
                    prop_assert_eq!(task.operation(), operation);
                    let expect_dynamic = matches!(task, DataTask::OutDynamic(_));
                    prop_assert_eq!(expect_dynamic, mode == ThreadingMode::Dynamic);
                }
                Err(BuildError::UnsupportedMode { .. }) => {
                    prop_assert_eq!(operation, CacheOperation::Prefetch);
                    prop_assert_eq!(mode, ThreadingMode::Dynamic);
                }
                Err(e) => prop_assert!(false, "unexpected error: {e}"),
            }
        }
    }

    #[test]
    fn test_fill_auto_threading_param_uses_last_as_tail() {
        let mut ctx = DataCtxDef::new(ContextType::WritebackData);
        let mut tail = test_graphs::param(0x40);
        tail.num_outter = 1;
        fill_auto_threading_param(&[test_graphs::param(0x20), tail], &mut ctx, 3);
        assert_eq!(ctx.thread_dim, 3);
        assert_eq!(ctx.addr_offset, 0x20);
        assert_eq!(ctx.non_tail.num_outter, 2);
        assert_eq!(ctx.tail.num_outter, 1);
    }

    #[test]
    fn test_fill_auto_threading_param_ignores_empty_params() {
        let mut ctx = DataCtxDef::new(ContextType::InvalidateData);
        fill_auto_threading_param(&[], &mut ctx, 8);
        assert_eq!(ctx, DataCtxDef::new(ContextType::InvalidateData));
    }

    #[test]
    fn test_chains_mut_starts_with_one_chain_per_window() {
        let mut cx = CompileContext::new();
        assert!(cx.write_back_ctx_id_list(NodeId(0)).is_empty());
        cx.chains_mut(NodeId(0), CacheOperation::WriteBack)[2].push(11);
        let expected: [Vec<CtxId>; 4] = [vec![], vec![], vec![11], vec![]];
        assert_eq!(cx.write_back_ctx_id_list(NodeId(0)), &expected);
        assert!(cx.invalid_ctx_id_list(NodeId(0)).is_empty());
    }

    #[test]
    #[should_panic(expected = "never built in dynamic mode")]
    fn test_chains_mut_has_no_prefetch_table() {
        CompileContext::new().chains_mut(NodeId(0), CacheOperation::Prefetch);
    }

    #[test]
    fn test_slice_thread_rejects_window_past_thread_dim() {
        let node = Node::new("n", "Relu").with_slice_info(2, false);
        assert_eq!(slice_thread(&node, 1).unwrap(), (1, 2));
        assert!(matches!(
            slice_thread(&node, 2),
            Err(BuildError::WindowOutOfRange { len: 2, .. })
        ));
        assert!(matches!(
            slice_thread(&Node::new("m", "Relu"), 0),
            Err(BuildError::MissingAttr { attr: SLICE_INFO, .. })
        ));
    }
}
