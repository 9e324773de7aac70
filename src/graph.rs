//! A minimal typed operator graph.
//!
//! Nodes carry the attributes the data-context builders read: the per-window context id list,
//! resolved output addresses, slice-threading structure and memory-reuse targets. Edges connect
//! an output anchor of one node to an input anchor of another.

use crate::builder::DataContextParam;
use crate::common::{CtxId, NodeId};

use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceInfo {
    pub slice_instance_num: u16,
    /// Thread count unknown until run time; contexts use the fixed dynamic window.
    pub dynamic: bool,
}

/// One anchor that needs a cache-maintenance context, with its addressing parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheRequest {
    pub anchor: u32,
    pub params: Vec<DataContextParam>,
}

/// Which anchors of a node need prefetch (inputs), write-back or invalidate (outputs).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CachePlan {
    pub prefetch: Vec<CacheRequest>,
    pub write_back: Vec<CacheRequest>,
    pub invalidate: Vec<CacheRequest>,
}

#[derive(Debug, Clone, Default)]
pub struct Node {
    pub name: String,
    pub op_type: String,
    pub auto_ctx_id_list: Option<Vec<CtxId>>,
    /// Context of a node which is not thread-sliced.
    pub context_id: Option<CtxId>,
    pub output_addrs: Option<Vec<u64>>,
    pub slice_info: Option<SliceInfo>,
    /// Output anchor -> node which reuses that output's buffer.
    pub mem_reuse: BTreeMap<u32, NodeId>,
    pub cache_plan: CachePlan,
    inputs: Vec<Option<(NodeId, u32)>>,
    outputs: Vec<Vec<(NodeId, u32)>>,
}

#[derive(Debug, Clone, Default)]
pub struct Graph {
    nodes: Vec<Node>,
}

pub struct NodeLabel<'a>(&'a Node);

impl Node {
    pub fn new(name: impl Into<String>, op_type: impl Into<String>) -> Self {
        Node {
            name: name.into(),
            op_type: op_type.into(),
            ..Default::default()
        }
    }

    pub fn with_output_addrs(mut self, addrs: Vec<u64>) -> Self {
        self.outputs.resize(self.outputs.len().max(addrs.len()), Vec::new());
        self.output_addrs = Some(addrs);
        self
    }

    pub fn with_slice_info(mut self, slice_instance_num: u16, dynamic: bool) -> Self {
        self.slice_info = Some(SliceInfo {
            slice_instance_num,
            dynamic,
        });
        self
    }

    pub fn with_auto_ctx_id_list(mut self, ids: Vec<CtxId>) -> Self {
        self.auto_ctx_id_list = Some(ids);
        self
    }

    pub fn with_context_id(mut self, id: CtxId) -> Self {
        self.context_id = Some(id);
        self
    }

    pub fn with_cache_plan(mut self, plan: CachePlan) -> Self {
        self.cache_plan = plan;
        self
    }

    pub fn label(&self) -> NodeLabel<'_> {
        NodeLabel(self)
    }

    pub fn is_dynamic(&self) -> bool {
        self.slice_info.map(|s| s.dynamic).unwrap_or(false)
    }

    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }

    pub fn output_count(&self) -> usize {
        self.outputs.len()
    }

    /// The context consumers offset by a window index to address a thread replica.
    pub fn base_ctx_id(&self) -> Option<CtxId> {
        match &self.auto_ctx_id_list {
            Some(ids) => ids.first().copied(),
            None => self.context_id,
        }
    }

    /// The context running window `window_id` of this node, if there is one.
    pub fn window_ctx_id(&self, window_id: u32) -> Option<CtxId> {
        match &self.auto_ctx_id_list {
            Some(ids) => ids.get(window_id as usize).copied(),
            None => self.context_id,
        }
    }
}

impl fmt::Display for NodeLabel<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.0.name, self.0.op_type)
    }
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, node: Node) -> NodeId {
        self.nodes.push(node);
        NodeId(u32::try_from(self.nodes.len() - 1).expect("too many nodes"))
    }

    /// Connects output `out_idx` of `src` to input `in_idx` of `dst`, replacing any previous
    /// producer of that input.
    pub fn connect(&mut self, src: NodeId, out_idx: u32, dst: NodeId, in_idx: u32) {
        let inputs = &mut self.nodes[dst.0 as usize].inputs;
        if inputs.len() <= in_idx as usize {
            inputs.resize(in_idx as usize + 1, None);
        }
        let previous = inputs[in_idx as usize].replace((src, out_idx));
        if let Some((old_src, old_out)) = previous {
            self.nodes[old_src.0 as usize].outputs[old_out as usize]
                .retain(|&(n, i)| !(n == dst && i == in_idx));
        }

        let outputs = &mut self.nodes[src.0 as usize].outputs;
        if outputs.len() <= out_idx as usize {
            outputs.resize(out_idx as usize + 1, Vec::new());
        }
        outputs[out_idx as usize].push((dst, in_idx));
    }

    pub fn set_mem_reuse(&mut self, node: NodeId, out_idx: u32, reused_by: NodeId) {
        self.nodes[node.0 as usize].mem_reuse.insert(out_idx, reused_by);
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0 as usize]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Node ids in insertion order.
    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> {
        (0..self.nodes.len()).map(|i| NodeId(i as u32))
    }

    /// Consumer anchors of output `out_idx` of `node`, or `None` if the anchor doesn't exist.
    pub fn consumers(&self, node: NodeId, out_idx: u32) -> Option<&[(NodeId, u32)]> {
        self.node(node)
            .outputs
            .get(out_idx as usize)
            .map(|v| v.as_slice())
    }

    pub fn producer(&self, node: NodeId, in_idx: u32) -> Option<(NodeId, u32)> {
        self.node(node).inputs.get(in_idx as usize).copied().flatten()
    }
}
