//! Compile pass materializing compute and data contexts for a whole graph.

use crate::builder::linker::{update_pre_cnt, update_succ_list};
use crate::builder::{
    BuildError, CacheOperation, CompileContext, DataTask, DataTaskBuilder, ThreadingMode,
    AUTO_CTX_ID_LIST,
};
use crate::common::{NodeId, DYNAMIC_WINDOW_SIZE};
use crate::graph::{CacheRequest, Graph, SliceInfo};
use crate::taskdef::{ComputeCtxDef, ContextType, FftsPlusCtxDef, FftsPlusTaskDef};

use itertools::Itertools;
use log::{debug, error, info};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassSummary {
    pub compute: usize,
    pub write_back: usize,
    pub invalidate: usize,
    pub prefetch: usize,
}

/// Runs the whole pass: compute contexts, their data dependencies, then every data context the
/// nodes' cache plans ask for.
pub fn compile(
    graph: &mut Graph,
) -> Result<(FftsPlusTaskDef, CompileContext, PassSummary), BuildError> {
    let mut task_def = FftsPlusTaskDef::new();
    let mut cx = CompileContext::new();
    let compute = assign_compute_contexts(graph, &mut task_def);
    link_compute_dependencies(graph, &mut task_def)?;
    let mut summary = generate_data_contexts(graph, &mut task_def, &mut cx)?;
    summary.compute = compute;
    info!(
        "Built {} contexts: {} compute, {} write-back, {} invalidate, {} prefetch",
        task_def.ctx_size(),
        summary.compute,
        summary.write_back,
        summary.invalidate,
        summary.prefetch
    );
    Ok((task_def, cx, summary))
}

/// Appends one compute context per window of every sliced node which has none yet, and records
/// them as the node's context id list. Returns the number of contexts appended.
pub fn assign_compute_contexts(graph: &mut Graph, task_def: &mut FftsPlusTaskDef) -> usize {
    let mut appended = 0;
    for id in graph.node_ids().collect_vec() {
        let node = graph.node_mut(id);
        let Some(slice_info) = node.slice_info else {
            continue;
        };
        if node.auto_ctx_id_list.is_some() {
            continue;
        }
        let thread_dim = window_count(slice_info);
        let ids = (0..thread_dim)
            .map(|thread_id| {
                task_def.push_context(FftsPlusCtxDef::Compute(ComputeCtxDef {
                    node: id,
                    ctx_type: ContextType::AiCore,
                    thread_id,
                    thread_dim,
                    ..Default::default()
                }))
            })
            .collect_vec();
        debug!("{} runs in contexts {ids:?}", node.label());
        appended += ids.len();
        node.auto_ctx_id_list = Some(ids);
    }
    appended
}

/// Makes each window of a consumer wait for the same window of each of its producers.
pub fn link_compute_dependencies(
    graph: &Graph,
    task_def: &mut FftsPlusTaskDef,
) -> Result<(), BuildError> {
    for src in graph.node_ids() {
        let src_node = graph.node(src);
        let Some(src_ctx) = src_node.auto_ctx_id_list.as_deref() else {
            continue;
        };
        let consumers = (0..src_node.output_count() as u32)
            .filter_map(|out| graph.consumers(src, out))
            .flatten()
            .map(|&(dst, _)| dst)
            .unique()
            .collect_vec();
        for dst in consumers {
            let Some(dst_ctx) = graph.node(dst).auto_ctx_id_list.as_deref() else {
                continue;
            };
            for (&from, &to) in src_ctx.iter().zip(dst_ctx) {
                update_succ_list(from, to, task_def)?;
                update_pre_cnt(to, task_def)?;
            }
        }
    }
    Ok(())
}

/// Builds the write-back, invalidate and prefetch contexts requested by each node's cache plan,
/// then checks the successor graph is acyclic.
pub fn generate_data_contexts(
    graph: &Graph,
    task_def: &mut FftsPlusTaskDef,
    cx: &mut CompileContext,
) -> Result<PassSummary, BuildError> {
    let mut summary = PassSummary::default();
    for id in graph.node_ids() {
        let node = graph.node(id);
        build_node(id, graph, task_def, cx, &mut summary).map_err(|e| {
            error!("Failed to build cache contexts for {}: {e}", node.label());
            e
        })?;
    }
    task_def.check_acyclic().map_err(|e| {
        error!("Invalid task: {e}");
        BuildError::from(e)
    })?;
    Ok(summary)
}

fn build_node(
    id: NodeId,
    graph: &Graph,
    task_def: &mut FftsPlusTaskDef,
    cx: &mut CompileContext,
    summary: &mut PassSummary,
) -> Result<(), BuildError> {
    let node = graph.node(id);
    let plan = &node.cache_plan;
    let Some(slice_info) = node.slice_info else {
        if plan != &Default::default() {
            debug!("{} is not sliced; cache plan ignored", node.label());
        }
        return Ok(());
    };

    if node.is_dynamic() {
        if !plan.prefetch.is_empty() {
            DataTask::new(CacheOperation::Prefetch, ThreadingMode::Dynamic)?;
        }
        let context_id_list = node
            .auto_ctx_id_list
            .as_deref()
            .ok_or_else(|| BuildError::missing(node, AUTO_CTX_ID_LIST))?;
        for (operation, requests) in [
            (CacheOperation::WriteBack, &plan.write_back),
            (CacheOperation::Invalidate, &plan.invalidate),
        ] {
            let builder = DataTask::new(operation, ThreadingMode::Dynamic)?;
            for request in requests {
                builder.fill_dynamic_data_ctx(
                    request.anchor,
                    id,
                    graph,
                    task_def,
                    cx,
                    context_id_list,
                )?;
                *summary.count_mut(operation) += DYNAMIC_WINDOW_SIZE;
            }
        }
        return Ok(());
    }

    for (operation, requests) in [
        (CacheOperation::Prefetch, &plan.prefetch),
        (CacheOperation::WriteBack, &plan.write_back),
        (CacheOperation::Invalidate, &plan.invalidate),
    ] {
        let builder = DataTask::new(operation, ThreadingMode::Static)?;
        for CacheRequest { anchor, params } in requests {
            for window_id in 0..u32::from(slice_info.slice_instance_num) {
                builder.fill_auto_data_ctx(*anchor, id, graph, params, task_def, window_id)?;
                *summary.count_mut(operation) += 1;
            }
        }
    }
    Ok(())
}

fn window_count(slice_info: SliceInfo) -> u16 {
    if slice_info.dynamic {
        DYNAMIC_WINDOW_SIZE as u16
    } else {
        slice_info.slice_instance_num
    }
}

impl PassSummary {
    fn count_mut(&mut self, operation: CacheOperation) -> &mut usize {
        match operation {
            CacheOperation::WriteBack => &mut self.write_back,
            CacheOperation::Invalidate => &mut self.invalidate,
            CacheOperation::Prefetch => &mut self.prefetch,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::DataContextParam;
    use crate::graph::{CachePlan, Node};
    use crate::taskdef::TaskDefError;

    fn request(anchor: u32) -> CacheRequest {
        CacheRequest {
            anchor,
            params: vec![DataContextParam {
                num_outter: 1,
                num_inner: 8,
                len_inner: 32,
                stride_outter: 256,
                stride_inner: 32,
                base_addr_offset: 0,
            }],
        }
    }

    /// `a -> b -> c`, all sliced `dim` ways. `a`'s output is written back and invalidated,
    /// `b` prefetches its input.
    fn chain(dim: u16, dynamic: bool) -> (Graph, [NodeId; 3]) {
        let mut graph = Graph::new();
        let a = graph.add_node(
            Node::new("a", "Conv2D")
                .with_output_addrs(vec![0x1000])
                .with_slice_info(dim, dynamic)
                .with_cache_plan(CachePlan {
                    write_back: vec![request(0)],
                    invalidate: vec![request(0)],
                    ..Default::default()
                }),
        );
        let b = graph.add_node(
            Node::new("b", "Relu")
                .with_output_addrs(vec![0x2000])
                .with_slice_info(dim, dynamic)
                .with_cache_plan(CachePlan {
                    prefetch: if dynamic { vec![] } else { vec![request(0)] },
                    ..Default::default()
                }),
        );
        let c = graph.add_node(
            Node::new("c", "Add")
                .with_output_addrs(vec![0x3000])
                .with_slice_info(dim, dynamic),
        );
        graph.connect(a, 0, b, 0);
        graph.connect(b, 0, c, 0);
        (graph, [a, b, c])
    }

    #[test]
    fn test_compile_static_chain() {
        let (mut graph, [a, b, _]) = chain(3, false);
        let (task, _, summary) = compile(&mut graph).unwrap();
        assert_eq!(
            summary,
            PassSummary {
                compute: 9,
                write_back: 3,
                invalidate: 3,
                prefetch: 3,
            }
        );
        assert_eq!(task.ctx_size(), 18);
        assert!(task.check_acyclic().is_ok());

        let b_ctx = graph.node(b).auto_ctx_id_list.clone().unwrap();
        for &ctx in &b_ctx {
            let compute = task.get(ctx).unwrap().as_compute().unwrap();
            // Waits on the producer's matching window, prefetches once.
            assert_eq!(compute.pred_cnt, 1);
            assert_eq!(compute.src_slot.len(), 1);
        }
        for (id, ctx) in task.iter() {
            let Some(data) = ctx.as_data() else { continue };
            assert!(data.thread_id < data.thread_dim, "context {id}");
            match data.ctx_type {
                ContextType::WritebackData => assert_eq!(data.cnt_init, 1),
                ContextType::InvalidateData => {
                    assert_eq!(data.cnt_init, 1);
                    assert_eq!(task.predecessors(id).len(), 1);
                }
                ContextType::FlushData => assert_eq!(data.addr_base, 0x1000),
                _ => unreachable!(),
            }
        }
        assert!(graph.node(a).auto_ctx_id_list.is_some());
    }

    #[test]
    fn test_compile_dynamic_chain() {
        let (mut graph, [a, _, _]) = chain(7, true);
        let (task, cx, summary) = compile(&mut graph).unwrap();
        assert_eq!(summary.compute, 3 * DYNAMIC_WINDOW_SIZE);
        assert_eq!(summary.write_back, DYNAMIC_WINDOW_SIZE);
        assert_eq!(summary.invalidate, DYNAMIC_WINDOW_SIZE);
        assert_eq!(task.ctx_size(), 5 * DYNAMIC_WINDOW_SIZE);
        assert!(cx
            .write_back_ctx_id_list(a)
            .iter()
            .all(|chain| chain.len() == 1));
        assert!(cx.invalid_ctx_id_list(a).iter().all(|chain| chain.len() == 1));
    }

    #[test]
    fn test_compile_rejects_dynamic_prefetch() {
        let (mut graph, [_, b, _]) = chain(2, true);
        graph.node_mut(b).cache_plan.prefetch = vec![request(0)];
        assert!(matches!(
            compile(&mut graph),
            Err(BuildError::UnsupportedMode {
                operation: CacheOperation::Prefetch,
                mode: ThreadingMode::Dynamic,
            })
        ));
    }

    #[test]
    fn test_compile_reports_missing_addresses() {
        let (mut graph, [a, _, _]) = chain(2, false);
        graph.node_mut(a).output_addrs = None;
        let err = compile(&mut graph).unwrap_err();
        assert!(err.to_string().contains("a(Conv2D)"), "{err}");
    }

    #[test]
    fn test_compile_rejects_consumer_with_fewer_slices() {
        let mut graph = Graph::new();
        let p = graph.add_node(
            Node::new("p", "Conv2D")
                .with_output_addrs(vec![0x1000])
                .with_slice_info(2, false)
                .with_cache_plan(CachePlan {
                    invalidate: vec![request(0)],
                    ..Default::default()
                }),
        );
        let c = graph.add_node(Node::new("c", "Relu").with_slice_info(1, false));
        graph.connect(p, 0, c, 0);
        let err = compile(&mut graph).unwrap_err();
        assert!(
            matches!(err, BuildError::WindowOutOfRange { window: 1, len: 1, .. }),
            "{err}"
        );
    }

    #[test]
    fn test_generate_rejects_cycle() {
        let (mut graph, [a, _, c]) = chain(1, false);
        let mut task = FftsPlusTaskDef::new();
        assign_compute_contexts(&mut graph, &mut task);
        link_compute_dependencies(&graph, &mut task).unwrap();
        // c feeding back into a closes a loop in the compute contexts.
        let a_ctx = graph.node(a).auto_ctx_id_list.clone().unwrap()[0];
        let c_ctx = graph.node(c).auto_ctx_id_list.clone().unwrap()[0];
        update_succ_list(c_ctx, a_ctx, &mut task).unwrap();
        let err = generate_data_contexts(&graph, &mut task, &mut CompileContext::new()).unwrap_err();
        assert!(matches!(err, BuildError::TaskDef(TaskDefError::Cycle(_))));
    }

    #[test]
    fn test_assign_compute_contexts_is_idempotent() {
        let (mut graph, _) = chain(2, false);
        let mut task = FftsPlusTaskDef::new();
        assert_eq!(assign_compute_contexts(&mut graph, &mut task), 6);
        assert_eq!(assign_compute_contexts(&mut graph, &mut task), 0);
        assert_eq!(task.ctx_size(), 6);
    }
}
