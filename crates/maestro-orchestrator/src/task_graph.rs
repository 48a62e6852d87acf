use maestro_core::{MaestroError, MaestroResult, TaskDefinition, Workflow};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeState {
    Pending,
    Queued,
    Running,
    Succeeded,
    Failed,
}

/// Dependency bookkeeping for one workflow run.
///
/// Tasks are held in launch order: a stable sort by priority of the
/// declaration order, computed once at construction.
pub struct TaskGraph<'a> {
    order: Vec<&'a TaskDefinition>,
    rank: HashMap<&'a str, usize>,
    state: HashMap<&'a str, NodeState>,
}

impl<'a> TaskGraph<'a> {
    /// Validate `workflow` and build its graph. Duplicate ids, unknown
    /// dependencies and cycles are rejected here, before anything runs.
    pub fn new(workflow: &'a Workflow) -> MaestroResult<Self> {
        workflow.validate()?;

        let mut order: Vec<&TaskDefinition> = workflow.tasks.iter().collect();
        order.sort_by_key(|t| t.priority);

        let rank = order
            .iter()
            .copied()
            .enumerate()
            .map(|(i, t)| (t.id.as_str(), i))
            .collect();
        let state = order
            .iter()
            .copied()
            .map(|t| (t.id.as_str(), NodeState::Pending))
            .collect();

        let graph = Self { order, rank, state };
        if let Some(cycle) = graph.find_cycle() {
            return Err(MaestroError::CyclicDependency { cycle });
        }
        Ok(graph)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Position of a task in launch order.
    pub fn rank(&self, task_id: &str) -> usize {
        self.rank.get(task_id).copied().unwrap_or(usize::MAX)
    }

    /// Task ids in launch order.
    pub fn launch_order(&self) -> Vec<&'a str> {
        self.order.iter().copied().map(|t| t.id.as_str()).collect()
    }

    fn get_state(&self, task_id: &str) -> NodeState {
        self.state.get(task_id).copied().unwrap_or(NodeState::Pending)
    }

    fn set(&mut self, task_id: &str, to: NodeState) -> bool {
        match self.state.get_mut(task_id) {
            Some(state) => {
                *state = to;
                true
            }
            None => false,
        }
    }

    /// Pending tasks whose every dependency succeeded, in launch order.
    /// They are marked queued and will not be returned again.
    pub fn take_ready(&mut self) -> Vec<&'a TaskDefinition> {
        let ready: Vec<&'a TaskDefinition> = self
            .order
            .iter()
            .copied()
            .filter(|t| self.get_state(&t.id) == NodeState::Pending)
            .filter(|t| t.is_ready(|dep| self.get_state(dep) == NodeState::Succeeded))
            .collect();
        for task in &ready {
            self.set(&task.id, NodeState::Queued);
        }
        ready
    }

    /// Fail every pending task with a failed dependency, transitively.
    /// Returns each such task with the dependency that blocked it.
    pub fn take_blocked(&mut self) -> Vec<(&'a TaskDefinition, String)> {
        let mut blocked = Vec::new();
        loop {
            let round: Vec<(&'a TaskDefinition, String)> = self
                .order
                .iter()
                .copied()
                .filter(|t| self.get_state(&t.id) == NodeState::Pending)
                .filter_map(|t| {
                    t.dependencies
                        .iter()
                        .find(|dep| self.get_state(dep) == NodeState::Failed)
                        .map(|dep| (t, dep.clone()))
                })
                .collect();
            if round.is_empty() {
                return blocked;
            }
            for (task, _) in &round {
                self.set(&task.id, NodeState::Failed);
            }
            blocked.extend(round);
        }
    }

    pub fn mark_running(&mut self, task_id: &str) -> bool {
        self.set(task_id, NodeState::Running)
    }

    pub fn mark_succeeded(&mut self, task_id: &str) -> bool {
        self.set(task_id, NodeState::Succeeded)
    }

    pub fn mark_failed(&mut self, task_id: &str) -> bool {
        self.set(task_id, NodeState::Failed)
    }

    /// Every task succeeded or failed.
    pub fn is_done(&self) -> bool {
        self.state
            .values()
            .all(|s| matches!(s, NodeState::Succeeded | NodeState::Failed))
    }

    /// Ids of tasks not yet started, in launch order.
    pub fn pending_ids(&self) -> Vec<String> {
        self.order
            .iter()
            .filter(|t| matches!(self.get_state(&t.id), NodeState::Pending | NodeState::Queued))
            .map(|t| t.id.clone())
            .collect()
    }

    /// A dependency cycle as a path whose first id is repeated at the end.
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        let by_id: HashMap<&str, &TaskDefinition> =
            self.order.iter().copied().map(|t| (t.id.as_str(), t)).collect();
        // 1 = on the current path, 2 = fully explored.
        let mut visited: HashMap<&str, u8> = HashMap::new();
        let mut path: Vec<&str> = Vec::new();
        for task in &self.order {
            if let Some(cycle) = dfs_cycle(&task.id, &by_id, &mut visited, &mut path) {
                return Some(cycle);
            }
        }
        None
    }
}

fn dfs_cycle<'t>(
    id: &'t str,
    by_id: &HashMap<&'t str, &'t TaskDefinition>,
    visited: &mut HashMap<&'t str, u8>,
    path: &mut Vec<&'t str>,
) -> Option<Vec<String>> {
    match visited.get(id) {
        Some(1) => {
            let start = path.iter().position(|p| *p == id).unwrap_or(0);
            let mut cycle: Vec<String> = path[start..].iter().map(|s| s.to_string()).collect();
            cycle.push(id.to_string());
            return Some(cycle);
        }
        Some(2) => return None,
        _ => {}
    }
    visited.insert(id, 1);
    path.push(id);
    if let Some(&task) = by_id.get(id) {
        for dep in &task.dependencies {
            if let Some(cycle) = dfs_cycle(dep.as_str(), by_id, visited, path) {
                return Some(cycle);
            }
        }
    }
    path.pop();
    visited.insert(id, 2);
    None
}
