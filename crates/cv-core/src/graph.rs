//! Story dependency DAG: cycle detection, critical path, readiness cascade.
//!
//! Edges point from prerequisite to dependent (`source` must land before
//! `target`). Only hard edges participate in cycle detection, the critical
//! path and readiness; soft edges only reorder stories inside a batch that is
//! already ready.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::types::{DependencyEdge, DependencyType, Story, StoryId, StoryStatus};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("duplicate story id: {0}")]
    DuplicateStory(StoryId),
    #[error("story {story_id} depends on unknown story {dependency}")]
    UnknownDependency { story_id: StoryId, dependency: StoryId },
    #[error("unknown story: {0}")]
    UnknownStory(StoryId),
}

pub type Result<T> = std::result::Result<T, GraphError>;

// ---------------------------------------------------------------------------
// TriggerResult
// ---------------------------------------------------------------------------

/// Outcome of re-evaluating the direct dependents of a completed story.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerResult {
    /// Dependents whose hard dependencies are now all merged/done, in
    /// scheduling order.
    pub ready_stories: Vec<StoryId>,
    /// Dependents still waiting on at least one other hard dependency.
    pub blocked_stories: Vec<StoryId>,
    /// Dependents that sit on a hard-dependency cycle and can never start.
    pub circular_dependencies: Vec<StoryId>,
}

// ---------------------------------------------------------------------------
// DependencyGraph
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct DependencyGraph {
    nodes: BTreeMap<StoryId, Story>,
    edges: Vec<DependencyEdge>,
    /// prerequisite -> dependents, hard and soft.
    dependents: HashMap<StoryId, BTreeSet<StoryId>>,
    cycles: BTreeSet<StoryId>,
    critical_path: Vec<StoryId>,
}

impl DependencyGraph {
    /// Build the graph from declared dependencies. Cycles are detected and
    /// the critical path computed eagerly.
    pub fn build(stories: Vec<Story>) -> Result<Self> {
        let mut nodes = BTreeMap::new();
        for story in stories {
            if nodes.contains_key(&story.id) {
                return Err(GraphError::DuplicateStory(story.id));
            }
            nodes.insert(story.id.clone(), story);
        }

        let mut edges = Vec::new();
        let mut dependents: HashMap<StoryId, BTreeSet<StoryId>> = HashMap::new();
        for story in nodes.values() {
            let declared = story
                .hard_dependencies
                .iter()
                .map(|d| (d, DependencyType::Hard))
                .chain(story.soft_dependencies.iter().map(|d| (d, DependencyType::Soft)));
            for (dep, kind) in declared {
                if !nodes.contains_key(dep) {
                    return Err(GraphError::UnknownDependency {
                        story_id: story.id.clone(),
                        dependency: dep.clone(),
                    });
                }
                edges.push(DependencyEdge::new(dep.clone(), story.id.clone(), kind));
                dependents
                    .entry(dep.clone())
                    .or_default()
                    .insert(story.id.clone());
            }
        }

        let mut graph = Self {
            nodes,
            edges,
            dependents,
            cycles: BTreeSet::new(),
            critical_path: Vec::new(),
        };
        graph.cycles = graph.detect_cycles();
        if !graph.cycles.is_empty() {
            warn!(stories = ?graph.cycles, "circular hard dependencies detected");
        }
        graph.critical_path = graph.compute_critical_path();
        Ok(graph)
    }

    pub fn stories(&self) -> impl Iterator<Item = &Story> {
        self.nodes.values()
    }

    pub fn story(&self, id: &str) -> Option<&Story> {
        self.nodes.get(id)
    }

    pub fn edges(&self) -> &[DependencyEdge] {
        &self.edges
    }

    pub fn critical_path(&self) -> &[StoryId] {
        &self.critical_path
    }

    pub fn circular(&self) -> &BTreeSet<StoryId> {
        &self.cycles
    }

    pub fn status(&self, id: &str) -> Option<StoryStatus> {
        self.nodes.get(id).map(|s| s.status)
    }

    pub fn set_status(&mut self, id: &str, status: StoryStatus) -> Result<()> {
        let story = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| GraphError::UnknownStory(id.to_string()))?;
        story.status = status;
        Ok(())
    }

    /// Overwrite node statuses from a persisted sprint-status snapshot.
    /// Unknown ids are ignored.
    pub fn apply_statuses<'a>(
        &mut self,
        statuses: impl IntoIterator<Item = (&'a StoryId, &'a StoryStatus)>,
    ) {
        for (id, status) in statuses {
            if let Some(story) = self.nodes.get_mut(id) {
                story.status = *status;
            }
        }
    }

    /// Stories on a hard-dependency cycle (including self-dependencies).
    ///
    /// Uses Tarjan's strongly-connected-components DFS so every member of
    /// every cycle is reported, not just the first back edge found.
    pub fn detect_cycles(&self) -> BTreeSet<StoryId> {
        let mut tarjan = Tarjan::default();
        for id in self.nodes.keys() {
            if !tarjan.index.contains_key(id.as_str()) {
                tarjan.visit(self, id);
            }
        }

        let mut cyclic = BTreeSet::new();
        for component in tarjan.components {
            let self_loop = component.len() == 1
                && self
                    .hard_dependencies(&component[0])
                    .any(|d| d == component[0]);
            if component.len() > 1 || self_loop {
                cyclic.extend(component.into_iter().map(str::to_string));
            }
        }
        cyclic
    }

    /// Longest path through the hard edges of the remaining (not yet
    /// merged/done, not cyclic) stories, weighted by complexity.
    ///
    /// Equal-weight alternatives resolve to the smaller story id at each
    /// step, which keeps the result deterministic.
    pub fn compute_critical_path(&self) -> Vec<StoryId> {
        let remaining: BTreeSet<&str> = self
            .nodes
            .values()
            .filter(|s| !s.status.is_complete() && !self.cycles.contains(&s.id))
            .map(|s| s.id.as_str())
            .collect();

        let order = self.topological_order(&remaining);
        let mut best: HashMap<&str, (u64, Option<&str>)> = HashMap::new();
        for id in order.iter().copied() {
            let weight = u64::from(self.nodes[id].complexity);
            let mut prev: Option<(u64, &str)> = None;
            for dep in self.hard_dependencies(id) {
                let Some((dep_total, _)) = best.get(dep) else {
                    continue;
                };
                prev = match prev {
                    Some((total, pid)) if total > *dep_total || (total == *dep_total && pid < dep) => {
                        Some((total, pid))
                    }
                    _ => Some((*dep_total, dep)),
                };
            }
            let total = weight + prev.map(|(t, _)| t).unwrap_or(0);
            best.insert(id, (total, prev.map(|(_, p)| p)));
        }

        let Some(end) = remaining
            .iter()
            .filter_map(|id| best.get(id).map(|(total, _)| (*total, *id)))
            .max_by(|(ta, ia), (tb, ib)| ta.cmp(tb).then_with(|| ib.cmp(ia)))
            .map(|(_, id)| id)
        else {
            return Vec::new();
        };

        let mut path = vec![end.to_string()];
        let mut cursor = end;
        while let Some((_, Some(prev))) = best.get(cursor) {
            path.push(prev.to_string());
            cursor = *prev;
        }
        path.reverse();
        path
    }

    /// `true` when every hard dependency of `id` is merged or done.
    pub fn hard_dependencies_satisfied(&self, id: &str) -> bool {
        self.hard_dependencies(id).all(|dep| {
            self.nodes
                .get(dep)
                .map(|s| s.status.is_complete())
                .unwrap_or(false)
        })
    }

    /// `true` when `id` may start now: known, not cyclic, waiting or ready,
    /// and all of its hard dependencies are complete.
    pub fn can_start(&self, id: &str) -> bool {
        let Some(story) = self.nodes.get(id) else {
            return false;
        };
        matches!(story.status, StoryStatus::Backlog | StoryStatus::Ready)
            && !self.cycles.contains(id)
            && self.hard_dependencies_satisfied(id)
    }

    /// Every story that could start right now, in scheduling order.
    pub fn ready_stories(&self) -> Vec<StoryId> {
        let ids: Vec<StoryId> = self
            .nodes
            .keys()
            .filter(|id| self.can_start(id))
            .cloned()
            .collect();
        self.order_batch(&ids)
    }

    /// Re-evaluate the direct dependents of `completed`.
    ///
    /// `completed` is marked done if it is not already merged/done, the
    /// critical path is recomputed, and every dependent that becomes
    /// startable is moved to `Ready`. Cyclic dependents are never promoted.
    pub fn trigger_dependent_stories(&mut self, completed: &str) -> Result<TriggerResult> {
        let story = self
            .nodes
            .get_mut(completed)
            .ok_or_else(|| GraphError::UnknownStory(completed.to_string()))?;
        if !story.status.is_complete() {
            story.status = StoryStatus::Done;
        }
        self.critical_path = self.compute_critical_path();

        let mut result = TriggerResult::default();
        let dependents: Vec<StoryId> = self
            .dependents
            .get(completed)
            .map(|d| d.iter().cloned().collect())
            .unwrap_or_default();

        let mut ready = Vec::new();
        for id in dependents {
            if self.cycles.contains(&id) {
                result.circular_dependencies.push(id);
                continue;
            }
            let status = self.nodes[&id].status;
            if !matches!(status, StoryStatus::Backlog | StoryStatus::Ready) {
                // Already running or finished; nothing to cascade.
                continue;
            }
            if self.hard_dependencies_satisfied(&id) {
                ready.push(id);
            } else {
                result.blocked_stories.push(id);
            }
        }

        for id in &ready {
            if let Some(story) = self.nodes.get_mut(id) {
                story.status = StoryStatus::Ready;
            }
        }
        result.ready_stories = self.order_batch(&ready);

        debug!(
            completed,
            ready = ?result.ready_stories,
            blocked = ?result.blocked_stories,
            circular = ?result.circular_dependencies,
            "triggered dependent stories"
        );
        Ok(result)
    }

    /// Order a readiness batch: critical-path stories first (in path order),
    /// then ascending id; soft dependencies inside the batch additionally
    /// pull their prerequisite ahead of the dependent.
    pub fn order_batch(&self, batch: &[StoryId]) -> Vec<StoryId> {
        let cp_position: HashMap<&str, usize> = self
            .critical_path
            .iter()
            .enumerate()
            .map(|(i, id)| (id.as_str(), i))
            .collect();

        let mut base: Vec<&str> = batch.iter().map(String::as_str).collect();
        base.sort_by_key(|id| (cp_position.get(id).copied().unwrap_or(usize::MAX), *id));
        base.dedup();
        let rank: HashMap<&str, usize> = base.iter().enumerate().map(|(i, id)| (*id, i)).collect();

        // Kahn over soft edges restricted to the batch, picking by base rank.
        let mut indegree: HashMap<&str, usize> = base.iter().map(|id| (*id, 0)).collect();
        let mut soft_out: HashMap<&str, Vec<&str>> = HashMap::new();
        for edge in &self.edges {
            if edge.dependency_type != DependencyType::Soft {
                continue;
            }
            let (src, dst) = (edge.source.as_str(), edge.target.as_str());
            if rank.contains_key(src) && rank.contains_key(dst) {
                soft_out.entry(src).or_default().push(dst);
                if let Some(d) = indegree.get_mut(dst) {
                    *d += 1;
                }
            }
        }

        // A prerequisite inherits the best rank of anything soft-depending on
        // it, so it is pulled forward instead of its dependent being pushed back.
        let mut effective = rank.clone();
        let mut changed = true;
        while changed {
            changed = false;
            for (src, targets) in &soft_out {
                for dst in targets {
                    if effective[dst] < effective[src] {
                        let better = effective[dst];
                        effective.insert(*src, better);
                        changed = true;
                    }
                }
            }
        }

        let mut heap: BinaryHeap<Reverse<(usize, usize, &str)>> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| Reverse((effective[id], rank[id], *id)))
            .collect();
        let mut ordered = Vec::with_capacity(base.len());
        while let Some(Reverse((_, _, id))) = heap.pop() {
            ordered.push(id.to_string());
            for next in soft_out.get(id).into_iter().flatten() {
                if let Some(d) = indegree.get_mut(next) {
                    *d -= 1;
                    if *d == 0 {
                        heap.push(Reverse((effective[next], rank[next], *next)));
                    }
                }
            }
        }

        // A soft cycle leaves some stories unplaced; append them in base order.
        if ordered.len() < base.len() {
            let placed: BTreeSet<String> = ordered.iter().cloned().collect();
            ordered.extend(
                base.iter()
                    .filter(|id| !placed.contains(**id))
                    .map(|id| id.to_string()),
            );
        }
        ordered
    }

    fn hard_dependencies<'a>(&'a self, id: &str) -> impl Iterator<Item = &'a str> + 'a {
        self.nodes
            .get(id)
            .into_iter()
            .flat_map(|s| s.hard_dependencies.iter().map(String::as_str))
    }

    /// Kahn's algorithm over hard edges restricted to `subset`; ties by id.
    fn topological_order<'a>(&'a self, subset: &BTreeSet<&'a str>) -> Vec<&'a str> {
        let mut indegree: BTreeMap<&str, usize> = subset.iter().map(|id| (*id, 0)).collect();
        for id in subset {
            for dep in self.hard_dependencies(id) {
                if subset.contains(dep) {
                    if let Some(d) = indegree.get_mut(id) {
                        *d += 1;
                    }
                }
            }
        }

        let mut queue: BTreeSet<&str> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut order = Vec::with_capacity(subset.len());
        while let Some(id) = queue.pop_first() {
            order.push(id);
            let Some(next) = self.dependents.get(id) else {
                continue;
            };
            for dependent in next {
                let dependent = dependent.as_str();
                if !subset.contains(dependent)
                    || !self.hard_dependencies(dependent).any(|d| d == id)
                {
                    continue;
                }
                if let Some(d) = indegree.get_mut(dependent) {
                    *d -= 1;
                    if *d == 0 {
                        queue.insert(dependent);
                    }
                }
            }
        }
        order
    }
}

// ---------------------------------------------------------------------------
// Tarjan SCC
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Tarjan<'a> {
    next_index: usize,
    index: HashMap<&'a str, usize>,
    lowlink: HashMap<&'a str, usize>,
    stack: Vec<&'a str>,
    on_stack: BTreeSet<&'a str>,
    components: Vec<Vec<&'a str>>,
}

impl<'a> Tarjan<'a> {
    /// Depth-first from `root` with an explicit frame stack, so long
    /// dependency chains cannot overflow the thread stack. Each frame holds a
    /// story and the hard dependencies it has yet to explore.
    fn visit(&mut self, graph: &'a DependencyGraph, root: &'a str) {
        let mut frames: Vec<(&'a str, Vec<&'a str>)> = Vec::new();
        self.open(graph, root, &mut frames);

        while let Some((id, unexplored)) = frames.last_mut() {
            let id = *id;
            if let Some(dep) = unexplored.pop() {
                if !self.index.contains_key(dep) {
                    self.open(graph, dep, &mut frames);
                } else if self.on_stack.contains(dep) {
                    let low = self.lowlink[id].min(self.index[dep]);
                    self.lowlink.insert(id, low);
                }
                continue;
            }

            frames.pop();
            if self.lowlink[id] == self.index[id] {
                let mut component = Vec::new();
                while let Some(member) = self.stack.pop() {
                    self.on_stack.remove(member);
                    component.push(member);
                    if member == id {
                        break;
                    }
                }
                self.components.push(component);
            }
            if let Some((parent, _)) = frames.last() {
                let low = self.lowlink[*parent].min(self.lowlink[id]);
                self.lowlink.insert(*parent, low);
            }
        }
    }

    fn open(
        &mut self,
        graph: &'a DependencyGraph,
        id: &'a str,
        frames: &mut Vec<(&'a str, Vec<&'a str>)>,
    ) {
        self.index.insert(id, self.next_index);
        self.lowlink.insert(id, self.next_index);
        self.next_index += 1;
        self.stack.push(id);
        self.on_stack.insert(id);

        let mut deps: Vec<&'a str> = graph.hard_dependencies(id).collect();
        deps.reverse();
        frames.push((id, deps));
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
