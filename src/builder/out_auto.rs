use super::linker::{get_successor_context_id, update_succ_list, update_succ_list_of_related_nodes};
use super::{
    fill_auto_threading_param, slice_thread, BuildError, CacheOperation, DataContextParam,
    DataTaskBuilder, ThreadingMode, AUTO_CTX_ID_LIST, OUTPUT_ADDRS,
};
use crate::common::{CtxId, NodeId};
use crate::graph::Graph;
use crate::taskdef::{DataCtxDef, FftsPlusCtxDef, FftsPlusTaskDef};

use log::debug;

/// Builds write-back and invalidate contexts for statically-threaded nodes, one per output
/// anchor and window.
#[derive(Debug, Clone)]
pub struct OutAutoTaskBuilder {
    operation: CacheOperation,
}

impl OutAutoTaskBuilder {
    pub(crate) fn new(operation: CacheOperation) -> Self {
        OutAutoTaskBuilder { operation }
    }
}

impl DataTaskBuilder for OutAutoTaskBuilder {
    fn operation(&self) -> CacheOperation {
        self.operation
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
        if self.operation == CacheOperation::Prefetch {
            return Err(BuildError::UnsupportedMode {
                operation: self.operation,
                mode: ThreadingMode::Static,
            });
        }
        let op_node = graph.node(node);
        let data_ctx_id = task_def.push_context(FftsPlusCtxDef::Data(DataCtxDef::new(
            self.operation.data_ctx_type(),
        )));

        let context_id_list = op_node
            .auto_ctx_id_list
            .as_deref()
            .ok_or_else(|| BuildError::missing(op_node, AUTO_CTX_ID_LIST))?;

        match self.operation {
            CacheOperation::WriteBack => {
                let data_ctx = task_def.data_ctx_mut(data_ctx_id)?;
                data_ctx.cnt = 1;
                data_ctx.cnt_init = 1;
                match context_id_list.get(window_id as usize) {
                    Some(&producer_ctx) => update_succ_list(producer_ctx, data_ctx_id, task_def)?,
                    None => debug!(
                        "{} has no context for window {window_id}; write-back {data_ctx_id} left \
                         without a producer",
                        op_node.label()
                    ),
                }
            }
            CacheOperation::Invalidate => {
                let (succ_list, cons_cnt) = get_successor_context_id(anchor_index, node, graph)?;
                task_def.data_ctx_mut(data_ctx_id)?.set_counters(cons_cnt);
                update_succ_list_of_related_nodes(
                    &succ_list,
                    window_id,
                    data_ctx_id,
                    graph,
                    task_def,
                )?;
            }
            CacheOperation::Prefetch => unreachable!("prefetch is rejected before appending"),
        }

        let output_addrs = op_node
            .output_addrs
            .as_deref()
            .ok_or_else(|| BuildError::missing(op_node, OUTPUT_ADDRS))?;
        let &addr_base =
            output_addrs
                .get(anchor_index as usize)
                .ok_or_else(|| BuildError::AnchorOutOfRange {
                    node: op_node.label().to_string(),
                    anchor: anchor_index,
                    len: output_addrs.len(),
                })?;

        let (thread_id, thread_dim) = slice_thread(op_node, window_id)?;
        {
            let data_ctx = task_def.data_ctx_mut(data_ctx_id)?;
            data_ctx.aten = true;
            data_ctx.addr_base = addr_base;
            data_ctx.thread_id = thread_id;
            data_ctx.thread_dim = thread_dim;
        }

        if self.operation == CacheOperation::Invalidate {
            self.update_invalid_ctx_with_mem_reuse(
                anchor_index,
                node,
                graph,
                data_ctx_id,
                window_id,
                task_def,
            )?;
        }

        fill_auto_threading_param(params, task_def.data_ctx_mut(data_ctx_id)?, thread_dim);
        debug!(
            "{} context {data_ctx_id} for output {anchor_index} of {} (window {window_id}/{thread_dim})",
            self.operation,
            op_node.label()
        );
        Ok(data_ctx_id)
    }
}
