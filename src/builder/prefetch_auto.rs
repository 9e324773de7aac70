use super::linker::update_src_slot_and_pf_bm;
use super::{
    fill_auto_threading_param, slice_thread, BuildError, CacheOperation, DataContextParam,
    DataTaskBuilder, AUTO_CTX_ID_LIST, OUTPUT_ADDRS,
};
use crate::common::{CtxId, NodeId};
use crate::graph::Graph;
use crate::taskdef::{DataCtxDef, FftsPlusCtxDef, FftsPlusTaskDef};

use log::debug;

/// Builds prefetch contexts, which pull a producer's output into cache ahead of a
/// statically-threaded consumer.
///
/// Prefetch contexts are run by DMA from the consumer context's source slots rather than by the
/// dependency counters, so their counters are only a non-zero placeholder.
#[derive(Debug, Clone, Default)]
pub struct PrefetchAutoTaskBuilder;

impl PrefetchAutoTaskBuilder {
    pub fn new() -> Self {
        PrefetchAutoTaskBuilder
    }
}

impl DataTaskBuilder for PrefetchAutoTaskBuilder {
    fn operation(&self) -> CacheOperation {
        CacheOperation::Prefetch
    }

    fn fill_auto_data_ctx(
        &self,
        anchor_index: u32,
        node: NodeId,
        graph: &Graph,
        params: &[DataContextParam],
        task_def: &mut FftsPlusTaskDef,
        window_id: u32,
    ) -> Result<CtxId, BuildError> {
        let op_node = graph.node(node);
        let data_ctx_id = task_def.push_context(FftsPlusCtxDef::Data(DataCtxDef::new(
            CacheOperation::Prefetch.data_ctx_type(),
        )));

        let context_id_list = op_node
            .auto_ctx_id_list
            .as_deref()
            .ok_or_else(|| BuildError::missing(op_node, AUTO_CTX_ID_LIST))?;
        task_def.data_ctx_mut(data_ctx_id)?.set_counters(1);

        if anchor_index as usize >= op_node.input_count() {
            return Err(BuildError::AnchorOutOfRange {
                node: op_node.label().to_string(),
                anchor: anchor_index,
                len: op_node.input_count(),
            });
        }
        let (peer, peer_out) =
            graph
                .producer(node, anchor_index)
                .ok_or_else(|| BuildError::MissingProducer {
                    node: op_node.label().to_string(),
                    anchor: anchor_index,
                })?;
        let peer_node = graph.node(peer);
        let peer_addrs = peer_node
            .output_addrs
            .as_deref()
            .ok_or_else(|| BuildError::missing(peer_node, OUTPUT_ADDRS))?;
        let &addr_base =
            peer_addrs
                .get(peer_out as usize)
                .ok_or_else(|| BuildError::AnchorOutOfRange {
                    node: peer_node.label().to_string(),
                    anchor: peer_out,
                    len: peer_addrs.len(),
                })?;

        if params.is_empty() {
            return Err(BuildError::EmptyParams {
                node: op_node.label().to_string(),
            });
        }

        let (thread_id, thread_dim) = slice_thread(op_node, window_id)?;
        {
            let data_ctx = task_def.data_ctx_mut(data_ctx_id)?;
            data_ctx.aten = true;
            data_ctx.addr_base = addr_base;
            data_ctx.thread_id = thread_id;
            data_ctx.thread_dim = thread_dim;
        }

        let &owner_ctx =
            context_id_list
                .get(window_id as usize)
                .ok_or_else(|| BuildError::WindowOutOfRange {
                    node: op_node.label().to_string(),
                    window: window_id,
                    len: context_id_list.len(),
                })?;
        let slot = update_src_slot_and_pf_bm(owner_ctx, data_ctx_id, task_def)?;

        fill_auto_threading_param(params, task_def.data_ctx_mut(data_ctx_id)?, thread_dim);
        debug!(
            "Prefetch context {data_ctx_id} for input {anchor_index} of {} in slot {slot} of \
             context {owner_ctx}",
            op_node.label()
        );
        Ok(data_ctx_id)
    }
}
