//! Immutable description of a job: parallel vertices, the edges connecting
//! them, and slot-sharing membership. Built once, validated, then read-only.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{DataflowError, Result};
use crate::worker::Invokable;

pub type VertexId = Uuid;
pub type GroupId = Uuid;

/// How producer subtasks connect to consumer subtasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DistributionPattern {
    /// Subtask i of the producer connects only to its paired consumer
    /// subtask(s); block-partitioned when parallelisms differ.
    Pointwise,
    /// Every producer subtask connects to every consumer subtask.
    AllToAll,
}

/// How records travel across an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExchangeMode {
    /// Streamed live; in-flight data cannot be replayed, so both sides must
    /// restart together.
    Pipelined,
    /// Output is persisted; either side can restart alone and re-consume.
    Blocking,
}

/// One parallel instance of a vertex, identified by (vertex, subtask index).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId {
    pub vertex: VertexId,
    pub index: u32,
}

impl TaskId {
    pub fn new(vertex: VertexId, index: u32) -> Self {
        Self { vertex, index }
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.vertex, self.index)
    }
}

/// A parallelizable operator in the job graph.
#[derive(Clone)]
pub struct JobVertex {
    id: VertexId,
    name: String,
    parallelism: u32,
    invokable: Arc<dyn Invokable>,
}

impl JobVertex {
    pub fn new(name: impl Into<String>, parallelism: u32, invokable: Arc<dyn Invokable>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            parallelism,
            invokable,
        }
    }

    pub fn id(&self) -> VertexId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parallelism(&self) -> u32 {
        self.parallelism
    }

    pub fn invokable(&self) -> Arc<dyn Invokable> {
        self.invokable.clone()
    }
}

impl fmt::Debug for JobVertex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobVertex")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("parallelism", &self.parallelism)
            .finish()
    }
}

/// Directed producer→consumer connection between two vertices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobEdge {
    pub source: VertexId,
    pub target: VertexId,
    pub pattern: DistributionPattern,
    pub exchange: ExchangeMode,
}

/// Builder for [`JobGraph`]. Vertices and edges are collected freely;
/// all validation happens in [`JobGraphBuilder::build`].
pub struct JobGraphBuilder {
    name: String,
    vertices: Vec<JobVertex>,
    edges: Vec<JobEdge>,
    sharing_groups: Vec<Vec<VertexId>>,
}

impl JobGraphBuilder {
    pub fn add_vertex(&mut self, vertex: JobVertex) -> VertexId {
        let id = vertex.id;
        self.vertices.push(vertex);
        id
    }

    pub fn connect(
        &mut self,
        source: VertexId,
        target: VertexId,
        pattern: DistributionPattern,
        exchange: ExchangeMode,
    ) -> &mut Self {
        self.edges.push(JobEdge {
            source,
            target,
            pattern,
            exchange,
        });
        self
    }

    /// Declare that one task of each listed vertex may co-locate in a single
    /// slot. A vertex may belong to at most one group.
    pub fn slot_sharing_group(&mut self, members: impl IntoIterator<Item = VertexId>) -> &mut Self {
        self.sharing_groups.push(members.into_iter().collect());
        self
    }

    /// Validate and freeze the graph. Fails if an edge or group references an
    /// unknown vertex, if the vertex/edge structure contains a cycle, or if a
    /// vertex appears in more than one slot-sharing group.
    pub fn build(self) -> Result<JobGraph> {
        let mut by_id: HashMap<VertexId, usize> = HashMap::new();
        for (idx, vertex) in self.vertices.iter().enumerate() {
            if by_id.insert(vertex.id, idx).is_some() {
                return Err(DataflowError::InvalidGraph(format!(
                    "vertex '{}' added twice",
                    vertex.name
                )));
            }
            if vertex.parallelism == 0 {
                return Err(DataflowError::InvalidGraph(format!(
                    "vertex '{}' has parallelism 0",
                    vertex.name
                )));
            }
        }

        for edge in &self.edges {
            for endpoint in [edge.source, edge.target] {
                if !by_id.contains_key(&endpoint) {
                    return Err(DataflowError::InvalidGraph(format!(
                        "edge references unknown vertex {endpoint}"
                    )));
                }
            }
        }

        let mut group_of: HashMap<VertexId, GroupId> = HashMap::new();
        let mut groups: Vec<SlotSharingGroup> = Vec::new();
        for members in &self.sharing_groups {
            let group_id = Uuid::new_v4();
            for member in members {
                let Some(&idx) = by_id.get(member) else {
                    return Err(DataflowError::InvalidGraph(format!(
                        "slot-sharing group references unknown vertex {member}"
                    )));
                };
                if group_of.insert(*member, group_id).is_some() {
                    return Err(DataflowError::InvalidGraph(format!(
                        "vertex '{}' appears in more than one slot-sharing group",
                        self.vertices[idx].name
                    )));
                }
            }
            groups.push(SlotSharingGroup {
                id: group_id,
                members: members.clone(),
            });
        }

        let topological_order = topological_sort(&self.vertices, &self.edges, &by_id)?;

        Ok(JobGraph {
            name: self.name,
            vertices: self.vertices,
            by_id,
            edges: self.edges,
            groups,
            group_of,
            topological_order,
        })
    }
}

/// Kahn's algorithm; detects cycles and yields producers before consumers.
fn topological_sort(
    vertices: &[JobVertex],
    edges: &[JobEdge],
    by_id: &HashMap<VertexId, usize>,
) -> Result<Vec<VertexId>> {
    let mut in_degree = vec![0usize; vertices.len()];
    for edge in edges {
        in_degree[by_id[&edge.target]] += 1;
    }

    let mut ready: VecDeque<usize> = (0..vertices.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(vertices.len());

    while let Some(idx) = ready.pop_front() {
        let id = vertices[idx].id;
        order.push(id);
        for edge in edges.iter().filter(|e| e.source == id) {
            let target = by_id[&edge.target];
            in_degree[target] -= 1;
            if in_degree[target] == 0 {
                ready.push_back(target);
            }
        }
    }

    if order.len() != vertices.len() {
        return Err(DataflowError::InvalidGraph(
            "vertex/edge structure contains a cycle".to_string(),
        ));
    }
    Ok(order)
}

/// A set of vertices whose same-index tasks may share a slot.
#[derive(Debug, Clone)]
pub struct SlotSharingGroup {
    pub id: GroupId,
    pub members: Vec<VertexId>,
}

/// Validated, immutable job description.
pub struct JobGraph {
    name: String,
    vertices: Vec<JobVertex>,
    by_id: HashMap<VertexId, usize>,
    edges: Vec<JobEdge>,
    groups: Vec<SlotSharingGroup>,
    group_of: HashMap<VertexId, GroupId>,
    topological_order: Vec<VertexId>,
}

impl JobGraph {
    pub fn builder(name: impl Into<String>) -> JobGraphBuilder {
        JobGraphBuilder {
            name: name.into(),
            vertices: Vec::new(),
            edges: Vec::new(),
            sharing_groups: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn vertex(&self, id: VertexId) -> Option<&JobVertex> {
        self.by_id.get(&id).map(|&idx| &self.vertices[idx])
    }

    pub fn vertices(&self) -> impl Iterator<Item = &JobVertex> {
        self.vertices.iter()
    }

    pub fn edges(&self) -> &[JobEdge] {
        &self.edges
    }

    pub fn sharing_groups(&self) -> &[SlotSharingGroup] {
        &self.groups
    }

    pub fn sharing_group_of(&self, vertex: VertexId) -> Option<GroupId> {
        self.group_of.get(&vertex).copied()
    }

    /// Vertex ids with producers before consumers.
    pub fn topological_order(&self) -> &[VertexId] {
        &self.topological_order
    }

    /// Every task of the job, in topological vertex order.
    pub fn tasks(&self) -> Vec<TaskId> {
        let mut tasks = Vec::new();
        for &vertex_id in &self.topological_order {
            let vertex = &self.vertices[self.by_id[&vertex_id]];
            for index in 0..vertex.parallelism {
                tasks.push(TaskId::new(vertex_id, index));
            }
        }
        tasks
    }

    pub fn task_count(&self) -> usize {
        self.vertices.iter().map(|v| v.parallelism as usize).sum()
    }

    /// Consumer subtask indices fed by producer subtask `index` across `edge`.
    pub fn downstream_subtasks(&self, edge: &JobEdge, index: u32) -> Range<u32> {
        let source = self.vertex(edge.source).expect("edge endpoints validated");
        let target = self.vertex(edge.target).expect("edge endpoints validated");
        match edge.pattern {
            DistributionPattern::AllToAll => 0..target.parallelism,
            DistributionPattern::Pointwise => {
                pointwise_block(source.parallelism, target.parallelism, index)
            }
        }
    }

    /// Producer subtask indices feeding consumer subtask `index` across `edge`.
    pub fn upstream_subtasks(&self, edge: &JobEdge, index: u32) -> Range<u32> {
        let source = self.vertex(edge.source).expect("edge endpoints validated");
        let target = self.vertex(edge.target).expect("edge endpoints validated");
        match edge.pattern {
            DistributionPattern::AllToAll => 0..source.parallelism,
            DistributionPattern::Pointwise => {
                pointwise_block(target.parallelism, source.parallelism, index)
            }
        }
    }
}

impl fmt::Debug for JobGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobGraph")
            .field("name", &self.name)
            .field("vertices", &self.vertices.len())
            .field("edges", &self.edges.len())
            .finish()
    }
}

/// Block-partition pairing for pointwise edges with unequal parallelism:
/// going from a side with `from` subtasks to a side with `to` subtasks,
/// subtask `index` fans out to the contiguous block
/// `[index*to/from, (index+1)*to/from)` when `to >= from`, and collapses
/// onto the single owning subtask otherwise. The two directions are exact
/// inverses of each other.
fn pointwise_block(from: u32, to: u32, index: u32) -> Range<u32> {
    debug_assert!(index < from);
    if to >= from {
        (index * to / from)..((index + 1) * to / from)
    } else {
        let owner = ((index + 1) * to - 1) / from;
        owner..owner + 1
    }
}
