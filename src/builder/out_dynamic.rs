use super::linker::{
    get_successor_context_id, record_new_ctx_id_list, update_succ_list,
    update_succ_list_of_related_nodes,
};
use super::{BuildError, CacheOperation, CompileContext, DataTaskBuilder, ThreadingMode};
use crate::common::{CtxId, NodeId, DYNAMIC_WINDOW_SIZE};
use crate::graph::Graph;
use crate::taskdef::FftsPlusTaskDef;

use log::debug;

/// Builds write-back and invalidate contexts for nodes whose thread count is only known at run
/// time. Every call creates one context for each of the [DYNAMIC_WINDOW_SIZE] window slots.
#[derive(Debug, Clone)]
pub struct OutDynamicTaskBuilder {
    operation: CacheOperation,
}

impl OutDynamicTaskBuilder {
    pub(crate) fn new(operation: CacheOperation) -> Self {
        OutDynamicTaskBuilder { operation }
    }
}

impl DataTaskBuilder for OutDynamicTaskBuilder {
    fn operation(&self) -> CacheOperation {
        self.operation
    }

    fn fill_dynamic_data_ctx(
        &self,
        anchor_index: u32,
        node: NodeId,
        graph: &Graph,
        task_def: &mut FftsPlusTaskDef,
        cx: &mut CompileContext,
        context_id_list: &[CtxId],
    ) -> Result<[CtxId; DYNAMIC_WINDOW_SIZE], BuildError> {
        let context_type = self.operation.data_ctx_type();
        let data_ctx_id_list = match self.operation {
            CacheOperation::WriteBack => {
                if context_id_list.len() != DYNAMIC_WINDOW_SIZE {
                    return Err(BuildError::CtxIdListSize {
                        node: graph.node(node).label().to_string(),
                        len: context_id_list.len(),
                    });
                }
                let chains = cx.chains_mut(node, self.operation);
                let ids = record_new_ctx_id_list(context_type, 1, task_def, chains);
                for (&producer_ctx, &data_ctx_id) in context_id_list.iter().zip(&ids) {
                    update_succ_list(producer_ctx, data_ctx_id, task_def)?;
                }
                ids
            }
            CacheOperation::Invalidate => {
                let (succ_list, const_cnt) = get_successor_context_id(anchor_index, node, graph)?;
                let chains = cx.chains_mut(node, self.operation);
                let ids = record_new_ctx_id_list(context_type, const_cnt, task_def, chains);
                for (window, &data_ctx_id) in ids.iter().enumerate() {
                    update_succ_list_of_related_nodes(
                        &succ_list,
                        window as u32,
                        data_ctx_id,
                        graph,
                        task_def,
                    )?;
                }
                ids
            }
            CacheOperation::Prefetch => {
                return Err(BuildError::UnsupportedMode {
                    operation: self.operation,
                    mode: ThreadingMode::Dynamic,
                })
            }
        };
        debug!(
            "{} contexts {data_ctx_id_list:?} for output {anchor_index} of {}",
            self.operation,
            graph.node(node).label()
        );
        Ok(data_ctx_id_list)
    }
}
