//! Successor-list wiring shared by all data-context builders.
//!
//! An edge `src -> dst` means the hardware decrements `dst`'s counter when `src` completes.
//! Edges are never deduplicated here; builders must not issue the same edge twice. The order of
//! a successor list carries no meaning to the hardware.

use super::BuildError;
use crate::common::{CtxId, NodeId, DYNAMIC_WINDOW_SIZE, MAX_PREFETCH_SLOTS};
use crate::graph::Graph;
use crate::taskdef::{ContextType, DataCtxDef, FftsPlusCtxDef, FftsPlusTaskDef, TaskDefError};

use log::debug;

pub fn update_succ_list(
    src: CtxId,
    dst: CtxId,
    task_def: &mut FftsPlusTaskDef,
) -> Result<(), BuildError> {
    if src == dst {
        return Err(BuildError::SelfLoop(src));
    }
    if task_def.get(dst).is_none() {
        return Err(TaskDefError::UnknownContext(dst).into());
    }
    task_def.ctx_mut(src)?.successors_mut().push(dst);
    Ok(())
}

/// Adds one pending predecessor to `ctx`.
pub fn update_pre_cnt(ctx: CtxId, task_def: &mut FftsPlusTaskDef) -> Result<(), BuildError> {
    match task_def.ctx_mut(ctx)? {
        FftsPlusCtxDef::Compute(c) => {
            c.pred_cnt += 1;
            c.pred_cnt_init += 1;
        }
        FftsPlusCtxDef::Data(d) => {
            d.cnt += 1;
            d.cnt_init += 1;
        }
    }
    Ok(())
}

/// Makes `data_ctx_id` a successor of the window `window_id` context of every node in
/// `related`.
pub fn update_succ_list_of_related_nodes(
    related: &[NodeId],
    window_id: u32,
    data_ctx_id: CtxId,
    graph: &Graph,
    task_def: &mut FftsPlusTaskDef,
) -> Result<(), BuildError> {
    for &consumer in related {
        let consumer_node = graph.node(consumer);
        let ctx = consumer_node.window_ctx_id(window_id).ok_or_else(|| {
            BuildError::WindowOutOfRange {
                node: consumer_node.label().to_string(),
                window: window_id,
                len: consumer_node.auto_ctx_id_list.as_ref().map_or(0, Vec::len),
            }
        })?;
        update_succ_list(ctx, data_ctx_id, task_def)?;
    }
    Ok(())
}

/// Collects every consumer of output `anchor_index` that runs in at least one context, once
/// per consuming input anchor.
///
/// Returns the consumers and their count. Consumers without any context are skipped and not
/// counted.
pub fn get_successor_context_id(
    anchor_index: u32,
    node: NodeId,
    graph: &Graph,
) -> Result<(Vec<NodeId>, u32), BuildError> {
    let consumers =
        graph
            .consumers(node, anchor_index)
            .ok_or_else(|| BuildError::AnchorOutOfRange {
                node: graph.node(node).label().to_string(),
                anchor: anchor_index,
                len: graph.node(node).output_count(),
            })?;

    let mut succ_list = Vec::with_capacity(consumers.len());
    for &(consumer, in_idx) in consumers {
        let consumer_node = graph.node(consumer);
        match consumer_node.base_ctx_id() {
            Some(_) => succ_list.push(consumer),
            None => debug!(
                "Consumer {} (input {in_idx}) has no context; not counted",
                consumer_node.label()
            ),
        }
    }
    let cons_cnt = u32::try_from(succ_list.len()).expect("consumer count exceeds u32::MAX");
    Ok((succ_list, cons_cnt))
}

/// Appends one data context per dynamic window slot with all counters set to `const_cnt`.
///
/// The new ids are returned in window order and also appended to `chains[i]`.
pub fn record_new_ctx_id_list(
    context_type: ContextType,
    const_cnt: u32,
    task_def: &mut FftsPlusTaskDef,
    chains: &mut Vec<Vec<CtxId>>,
) -> [CtxId; DYNAMIC_WINDOW_SIZE] {
    if chains.len() < DYNAMIC_WINDOW_SIZE {
        chains.resize(DYNAMIC_WINDOW_SIZE, Vec::new());
    }
    let mut data_ctx_id_list = [0; DYNAMIC_WINDOW_SIZE];
    for (i, slot) in data_ctx_id_list.iter_mut().enumerate() {
        let mut ctx = DataCtxDef::new(context_type);
        ctx.set_counters(const_cnt);
        ctx.thread_id = i as u16;
        ctx.thread_dim = DYNAMIC_WINDOW_SIZE as u16;
        ctx.atm = true;
        *slot = task_def.push_context(FftsPlusCtxDef::Data(ctx));
        chains[i].push(*slot);
    }
    data_ctx_id_list
}

/// Puts prefetch context `data_ctx_id` into the first free source slot of compute context
/// `owner` and enables it in the owner's prefetch bitmap. Returns the slot index.
pub fn update_src_slot_and_pf_bm(
    owner: CtxId,
    data_ctx_id: CtxId,
    task_def: &mut FftsPlusTaskDef,
) -> Result<usize, BuildError> {
    let compute = task_def.compute_ctx_mut(owner)?;
    let slot = compute.src_slot.len();
    if slot >= MAX_PREFETCH_SLOTS {
        return Err(BuildError::PrefetchSlotsExhausted(owner));
    }
    compute.src_slot.push(data_ctx_id);
    compute.prefetch_enable_bitmap |= 1 << slot;
    Ok(slot)
}

/// Orders the node reusing output `anchor_index`'s buffer after the invalidate context.
///
/// Nothing happens when the output isn't reused, or when the reusing node has no context for
/// `window_id`.
pub fn gen_invalid_succ_list_with_mem_reuse(
    anchor_index: u32,
    node: NodeId,
    graph: &Graph,
    data_ctx_id: CtxId,
    window_id: u32,
    task_def: &mut FftsPlusTaskDef,
) -> Result<(), BuildError> {
    let Some(&reused_by) = graph.node(node).mem_reuse.get(&anchor_index) else {
        return Ok(());
    };
    let target = graph.node(reused_by);
    let Some(target_ctx) = target.window_ctx_id(window_id) else {
        debug!(
            "{} reuses output {anchor_index} of {} but has no context for window {window_id}",
            target.label(),
            graph.node(node).label()
        );
        return Ok(());
    };
    update_succ_list(data_ctx_id, target_ctx, task_def)?;
    update_pre_cnt(target_ctx, task_def)?;
    debug!(
        "Invalidate context {data_ctx_id} now precedes context {target_ctx} of {}",
        target.label()
    );
    Ok(())
}
