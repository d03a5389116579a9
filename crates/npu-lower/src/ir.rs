//! Arena-backed operator graph consumed by canonicalization and lowering.
//!
//! Variable and operator nodes live in one arena and are addressed by stable
//! integer ids, so rewrites never invalidate handles held elsewhere. Edges are
//! kept twice: positionally on the op (`inputs`/`outputs`) and as
//! producer/consumer lists on the variable.

use std::collections::{BTreeMap, HashMap, VecDeque};

use thiserror::Error;

use crate::attr::AttrMap;
use crate::dtype::DType;
use crate::names::GENERATED_PREFIX;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("graph contains a cycle")]
    Cycle,
    #[error("node {0} does not exist")]
    UnknownNode(u32),
    #[error("node {0} is not a variable")]
    NotAVar(u32),
    #[error("node {0} is not an operator")]
    NotAnOp(u32),
    #[error("variable `{0}` already exists")]
    DuplicateVar(String),
    #[error("variable `{0}` does not exist")]
    UnknownVar(String),
    #[error("operator has no entry in slot `{0}`")]
    MissingSlot(String),
    #[error("operator `{op}` has no output at position {index}")]
    MissingOutput { op: String, index: usize },
    #[error("operator `{op}` has no input at position {index}")]
    MissingInput { op: String, index: usize },
}

/// Stable handle into the graph arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone)]
pub struct VarNode {
    pub name: String,
    pub shape: Vec<i64>,
    pub dtype: DType,
    pub persistable: bool,
    /// Op ids writing this variable.
    pub producers: Vec<NodeId>,
    /// Op ids reading this variable, one entry per use.
    pub consumers: Vec<NodeId>,
}

#[derive(Debug, Clone)]
pub struct OpNode {
    pub ty: String,
    pub attrs: AttrMap,
    /// Positional input variable ids.
    pub inputs: Vec<NodeId>,
    /// Positional output variable ids.
    pub outputs: Vec<NodeId>,
    /// Front-end slot name to variable names, for ops addressed by slot.
    pub slot_inputs: BTreeMap<String, Vec<String>>,
    pub slot_outputs: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone)]
enum Node {
    Var(VarNode),
    Op(OpNode),
}

/// The operator graph. Node ids are never reused within one graph.
#[derive(Debug, Default)]
pub struct Graph {
    nodes: Vec<Option<Node>>,
    vars_by_name: HashMap<String, NodeId>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, node: Node) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Some(node));
        id
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.get(id.index()).is_some_and(|n| n.is_some())
    }

    pub fn add_var(
        &mut self,
        name: impl Into<String>,
        shape: Vec<i64>,
        dtype: DType,
        persistable: bool,
    ) -> Result<NodeId, GraphError> {
        let name = name.into();
        if self.vars_by_name.contains_key(&name) {
            return Err(GraphError::DuplicateVar(name));
        }
        let id = self.push(Node::Var(VarNode {
            name: name.clone(),
            shape,
            dtype,
            persistable,
            producers: Vec::new(),
            consumers: Vec::new(),
        }));
        self.vars_by_name.insert(name, id);
        Ok(id)
    }

    pub fn add_op(&mut self, ty: impl Into<String>, attrs: AttrMap) -> NodeId {
        self.push(Node::Op(OpNode {
            ty: ty.into(),
            attrs,
            inputs: Vec::new(),
            outputs: Vec::new(),
            slot_inputs: BTreeMap::new(),
            slot_outputs: BTreeMap::new(),
        }))
    }

    pub fn var(&self, id: NodeId) -> Result<&VarNode, GraphError> {
        match self.nodes.get(id.index()) {
            Some(Some(Node::Var(v))) => Ok(v),
            Some(Some(Node::Op(_))) => Err(GraphError::NotAVar(id.0)),
            _ => Err(GraphError::UnknownNode(id.0)),
        }
    }

    pub fn var_mut(&mut self, id: NodeId) -> Result<&mut VarNode, GraphError> {
        match self.nodes.get_mut(id.index()) {
            Some(Some(Node::Var(v))) => Ok(v),
            Some(Some(Node::Op(_))) => Err(GraphError::NotAVar(id.0)),
            _ => Err(GraphError::UnknownNode(id.0)),
        }
    }

    pub fn op(&self, id: NodeId) -> Result<&OpNode, GraphError> {
        match self.nodes.get(id.index()) {
            Some(Some(Node::Op(o))) => Ok(o),
            Some(Some(Node::Var(_))) => Err(GraphError::NotAnOp(id.0)),
            _ => Err(GraphError::UnknownNode(id.0)),
        }
    }

    pub fn op_mut(&mut self, id: NodeId) -> Result<&mut OpNode, GraphError> {
        match self.nodes.get_mut(id.index()) {
            Some(Some(Node::Op(o))) => Ok(o),
            Some(Some(Node::Var(_))) => Err(GraphError::NotAnOp(id.0)),
            _ => Err(GraphError::UnknownNode(id.0)),
        }
    }

    pub fn var_id(&self, name: &str) -> Option<NodeId> {
        self.vars_by_name.get(name).copied()
    }

    /// Live op ids in arena order, which keeps traversal deterministic.
    pub fn op_ids(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .enumerate()
            .filter_map(|(i, n)| match n {
                Some(Node::Op(_)) => Some(NodeId(i as u32)),
                _ => None,
            })
            .collect()
    }

    pub fn var_ids(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .enumerate()
            .filter_map(|(i, n)| match n {
                Some(Node::Var(_)) => Some(NodeId(i as u32)),
                _ => None,
            })
            .collect()
    }

    pub fn connect_input(&mut self, op: NodeId, var: NodeId) -> Result<(), GraphError> {
        self.var(var)?;
        self.op_mut(op)?.inputs.push(var);
        self.var_mut(var)?.consumers.push(op);
        Ok(())
    }

    pub fn connect_output(&mut self, op: NodeId, var: NodeId) -> Result<(), GraphError> {
        self.var(var)?;
        self.op_mut(op)?.outputs.push(var);
        self.var_mut(var)?.producers.push(op);
        Ok(())
    }

    pub fn op_input(&self, op: NodeId, index: usize) -> Result<NodeId, GraphError> {
        let node = self.op(op)?;
        node.inputs
            .get(index)
            .copied()
            .ok_or_else(|| GraphError::MissingInput {
                op: node.ty.clone(),
                index,
            })
    }

    pub fn op_output(&self, op: NodeId, index: usize) -> Result<NodeId, GraphError> {
        let node = self.op(op)?;
        node.outputs
            .get(index)
            .copied()
            .ok_or_else(|| GraphError::MissingOutput {
                op: node.ty.clone(),
                index,
            })
    }

    /// Binds a named input slot and wires the positional edge.
    pub fn bind_slot_input(
        &mut self,
        op: NodeId,
        slot: &str,
        var: NodeId,
    ) -> Result<(), GraphError> {
        let name = self.var(var)?.name.clone();
        self.connect_input(op, var)?;
        self.op_mut(op)?
            .slot_inputs
            .entry(slot.to_string())
            .or_default()
            .push(name);
        Ok(())
    }

    pub fn bind_slot_output(
        &mut self,
        op: NodeId,
        slot: &str,
        var: NodeId,
    ) -> Result<(), GraphError> {
        let name = self.var(var)?.name.clone();
        self.connect_output(op, var)?;
        self.op_mut(op)?
            .slot_outputs
            .entry(slot.to_string())
            .or_default()
            .push(name);
        Ok(())
    }

    pub fn has_slot_input(&self, op: NodeId, slot: &str) -> bool {
        self.op(op)
            .map(|o| o.slot_inputs.get(slot).is_some_and(|v| !v.is_empty()))
            .unwrap_or(false)
    }

    /// First variable bound to a named input slot.
    pub fn slot_input(&self, op: NodeId, slot: &str) -> Result<NodeId, GraphError> {
        let name = self
            .op(op)?
            .slot_inputs
            .get(slot)
            .and_then(|v| v.first())
            .cloned()
            .ok_or_else(|| GraphError::MissingSlot(slot.to_string()))?;
        self.var_id(&name)
            .ok_or(GraphError::UnknownVar(name))
    }

    pub fn slot_output(&self, op: NodeId, slot: &str) -> Result<NodeId, GraphError> {
        let name = self
            .op(op)?
            .slot_outputs
            .get(slot)
            .and_then(|v| v.first())
            .cloned()
            .ok_or_else(|| GraphError::MissingSlot(slot.to_string()))?;
        self.var_id(&name)
            .ok_or(GraphError::UnknownVar(name))
    }

    /// Creates a front-end op and wires the given slots in order.
    pub fn add_frontend_op(
        &mut self,
        ty: impl Into<String>,
        attrs: AttrMap,
        inputs: &[(&str, &[&str])],
        outputs: &[(&str, &[&str])],
    ) -> Result<NodeId, GraphError> {
        let op = self.add_op(ty, attrs);
        for (slot, names) in inputs {
            for name in *names {
                let var = self
                    .var_id(name)
                    .ok_or_else(|| GraphError::UnknownVar(name.to_string()))?;
                self.bind_slot_input(op, slot, var)?;
            }
        }
        for (slot, names) in outputs {
            for name in *names {
                let var = self
                    .var_id(name)
                    .ok_or_else(|| GraphError::UnknownVar(name.to_string()))?;
                self.bind_slot_output(op, slot, var)?;
            }
        }
        Ok(op)
    }

    /// Removes an op, unlinking it from every connected variable. Generated
    /// variables that end up fully disconnected are dropped with it.
    pub fn erase_op(&mut self, id: NodeId) -> Result<(), GraphError> {
        let op = self.op(id)?.clone();
        for var in op.inputs.iter().chain(op.outputs.iter()) {
            if let Ok(v) = self.var_mut(*var) {
                v.producers.retain(|p| *p != id);
                v.consumers.retain(|c| *c != id);
            }
        }
        self.nodes[id.index()] = None;
        for var in op.inputs.iter().chain(op.outputs.iter()) {
            let orphan = match self.var(*var) {
                Ok(v) => {
                    v.producers.is_empty()
                        && v.consumers.is_empty()
                        && v.name.starts_with(GENERATED_PREFIX)
                }
                Err(_) => false,
            };
            if orphan {
                let name = self.var(*var)?.name.clone();
                self.vars_by_name.remove(&name);
                self.nodes[var.index()] = None;
            }
        }
        Ok(())
    }

    /// Kahn topological order over ops. Fails on cyclic graphs.
    pub fn topo_order(&self) -> Result<Vec<NodeId>, GraphError> {
        let ops = self.op_ids();
        let mut indegree: HashMap<NodeId, usize> = HashMap::new();
        for &op in &ops {
            let node = self.op(op)?;
            let mut degree = 0;
            for &input in &node.inputs {
                degree += self.var(input)?.producers.len();
            }
            indegree.insert(op, degree);
        }

        let mut queue: VecDeque<NodeId> = ops
            .iter()
            .copied()
            .filter(|op| indegree[op] == 0)
            .collect();
        let mut order = Vec::with_capacity(ops.len());
        while let Some(op) = queue.pop_front() {
            order.push(op);
            for &output in &self.op(op)?.outputs {
                for &consumer in &self.var(output)?.consumers {
                    let entry = indegree
                        .get_mut(&consumer)
                        .ok_or(GraphError::UnknownNode(consumer.0))?;
                    *entry -= 1;
                    if *entry == 0 {
                        queue.push_back(consumer);
                    }
                }
            }
        }

        if order.len() != ops.len() {
            return Err(GraphError::Cycle);
        }
        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add_chain(graph: &mut Graph) -> (NodeId, NodeId) {
        let a = graph.add_var("a", vec![2], DType::F32, false).unwrap();
        let b = graph.add_var("b", vec![2], DType::F32, false).unwrap();
        let c = graph.add_var("c", vec![2], DType::F32, false).unwrap();
        let op1 = graph.add_op("npu_relu", AttrMap::new());
        graph.connect_input(op1, a).unwrap();
        graph.connect_output(op1, b).unwrap();
        let op2 = graph.add_op("npu_sqrt", AttrMap::new());
        graph.connect_input(op2, b).unwrap();
        graph.connect_output(op2, c).unwrap();
        (op1, op2)
    }

    #[test]
    fn topo_orders_chain() {
        let mut graph = Graph::new();
        let (op1, op2) = add_chain(&mut graph);
        assert_eq!(graph.topo_order().unwrap(), vec![op1, op2]);
    }

    #[test]
    fn topo_rejects_cycle() {
        let mut graph = Graph::new();
        let (op1, op2) = add_chain(&mut graph);
        // feed op2's output back into op1
        let c = graph.op_output(op2, 0).unwrap();
        graph.connect_input(op1, c).unwrap();
        assert_eq!(graph.topo_order(), Err(GraphError::Cycle));
    }

    #[test]
    fn erase_op_unlinks_edges() {
        let mut graph = Graph::new();
        let (op1, op2) = add_chain(&mut graph);
        let b = graph.op_output(op1, 0).unwrap();
        graph.erase_op(op1).unwrap();
        assert!(!graph.contains(op1));
        assert!(graph.var(b).unwrap().producers.is_empty());
        assert_eq!(graph.topo_order().unwrap(), vec![op2]);
    }

    #[test]
    fn duplicate_var_rejected() {
        let mut graph = Graph::new();
        graph.add_var("x", vec![1], DType::F32, false).unwrap();
        assert_eq!(
            graph.add_var("x", vec![1], DType::F32, false),
            Err(GraphError::DuplicateVar("x".to_string()))
        );
    }
}
