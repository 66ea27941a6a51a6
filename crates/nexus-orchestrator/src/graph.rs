use nexus_core::{NexusError, NexusResult, Task, TaskStatus};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, HashSet};

/// Per-session dependency graph of tasks.
///
/// Nodes keep their insertion order; edges are read off each task's
/// dependency list, so the edge set is always exactly the declared
/// dependencies. The graph is owned by one control loop and never shared.
#[derive(Debug, Clone, Default)]
pub struct TaskGraph {
    order: Vec<String>,
    nodes: HashMap<String, Task>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    InProgress,
    Done,
}

impl TaskGraph {
    /// Empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a graph from a batch of tasks and reject it if it has a cycle.
    pub fn from_tasks(tasks: impl IntoIterator<Item = Task>) -> NexusResult<Self> {
        let mut graph = Self::new();
        graph.insert_batch(tasks)?;
        if let Some(cycle) = graph.find_cycle() {
            return Err(NexusError::CyclicDependency(cycle.join(" -> ")));
        }
        Ok(graph)
    }

    /// Add one task. Every dependency must already be in the graph.
    pub fn add_task(&mut self, task: Task) -> NexusResult<()> {
        if self.nodes.contains_key(&task.id) {
            return Err(NexusError::DuplicateTask(task.id));
        }
        if let Some(dep) = task
            .dependencies
            .iter()
            .find(|d| !self.nodes.contains_key(*d))
        {
            return Err(NexusError::DanglingDependency {
                task: task.id.clone(),
                dependency: dep.clone(),
            });
        }
        self.order.push(task.id.clone());
        self.nodes.insert(task.id.clone(), task);
        Ok(())
    }

    /// Add several tasks at once. Dependencies may point anywhere in the
    /// existing graph or the batch. Cycles are not checked here.
    pub fn insert_batch(&mut self, tasks: impl IntoIterator<Item = Task>) -> NexusResult<()> {
        let batch: Vec<Task> = tasks.into_iter().collect();
        let mut batch_ids = HashSet::new();
        for task in &batch {
            if self.nodes.contains_key(&task.id) || !batch_ids.insert(task.id.as_str()) {
                return Err(NexusError::DuplicateTask(task.id.clone()));
            }
        }
        for task in &batch {
            if let Some(dep) = task
                .dependencies
                .iter()
                .find(|d| !self.nodes.contains_key(*d) && !batch_ids.contains(d.as_str()))
            {
                return Err(NexusError::DanglingDependency {
                    task: task.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }
        for task in batch {
            self.order.push(task.id.clone());
            self.nodes.insert(task.id.clone(), task);
        }
        Ok(())
    }

    /// Look up a task.
    pub fn get(&self, id: &str) -> Option<&Task> {
        self.nodes.get(id)
    }

    /// All tasks in insertion order.
    pub fn tasks(&self) -> Vec<&Task> {
        self.order.iter().filter_map(|id| self.nodes.get(id)).collect()
    }

    /// Task ids in insertion order.
    pub fn ids(&self) -> &[String] {
        &self.order
    }

    /// Number of tasks.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// True when the graph has no tasks.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// `(from, to)` pairs meaning "`to` depends on `from`", grouped by the
    /// dependent task in insertion order.
    pub fn edges(&self) -> Vec<(String, String)> {
        let mut seen = HashSet::new();
        self.tasks()
            .into_iter()
            .flat_map(|t| t.dependencies.iter().map(move |d| (d.clone(), t.id.clone())))
            .filter(|edge| seen.insert(edge.clone()))
            .collect()
    }

    /// Pending or Ready tasks whose dependencies are all Completed, in
    /// insertion order.
    pub fn get_ready_tasks(&self) -> Vec<&Task> {
        self.tasks()
            .into_iter()
            .filter(|t| t.status.is_claimable() && self.dependencies_met(t))
            .collect()
    }

    fn dependencies_met(&self, task: &Task) -> bool {
        task.dependencies.iter().all(|d| {
            self.nodes
                .get(d)
                .is_some_and(|dep| dep.status == TaskStatus::Completed)
        })
    }

    /// Number of tasks in the given status.
    pub fn count(&self, status: TaskStatus) -> usize {
        self.nodes.values().filter(|t| t.status == status).count()
    }

    /// True iff every task is Completed. An empty graph is complete.
    pub fn is_complete(&self) -> bool {
        self.nodes
            .values()
            .all(|t| t.status == TaskStatus::Completed)
    }

    // ------------------------------------------------------------------
    // Transitions
    // ------------------------------------------------------------------

    fn task_mut(&mut self, id: &str) -> NexusResult<&mut Task> {
        self.nodes
            .get_mut(id)
            .ok_or_else(|| NexusError::UnknownTask(id.to_string()))
    }

    fn transition(&mut self, id: &str, status: TaskStatus) -> NexusResult<&mut Task> {
        let task = self.task_mut(id)?;
        if task.status.is_terminal() && task.status != status {
            return Err(NexusError::InvalidTransition(format!(
                "task {id} is {} and cannot become {status}",
                task.status
            )));
        }
        task.set_status(status);
        Ok(task)
    }

    /// Mark a task as dispatched.
    pub fn mark_task_running(&mut self, id: &str) -> NexusResult<()> {
        self.transition(id, TaskStatus::Running).map(|_| ())
    }

    /// Mark a task Completed and attach its result.
    pub fn mark_task_complete(&mut self, id: &str, result: Option<Value>) -> NexusResult<()> {
        let task = self.transition(id, TaskStatus::Completed)?;
        task.result = result;
        task.error_message = None;
        Ok(())
    }

    /// Mark a task Failed with a message.
    pub fn mark_task_failed(&mut self, id: &str, message: impl Into<String>) -> NexusResult<()> {
        let task = self.transition(id, TaskStatus::Failed)?;
        task.error_message = Some(message.into());
        Ok(())
    }

    /// Mark a task Cancelled.
    pub fn mark_task_cancelled(&mut self, id: &str) -> NexusResult<()> {
        self.transition(id, TaskStatus::Cancelled).map(|_| ())
    }

    /// Roll a task back to Pending so it can be claimed again. The attempt
    /// counter and last error are left as they are.
    pub fn reset_to_pending(&mut self, id: &str) -> NexusResult<()> {
        self.transition(id, TaskStatus::Pending).map(|_| ())
    }

    /// Count one more failed attempt. Returns the new count.
    pub fn record_attempt(&mut self, id: &str) -> NexusResult<u32> {
        let task = self.task_mut(id)?;
        task.attempt += 1;
        Ok(task.attempt)
    }

    /// Record the last error without changing status.
    pub fn set_error(&mut self, id: &str, message: impl Into<String>) -> NexusResult<()> {
        self.task_mut(id)?.error_message = Some(message.into());
        Ok(())
    }

    // ------------------------------------------------------------------
    // Structure
    // ------------------------------------------------------------------

    /// True iff the dependency relation contains a directed cycle.
    pub fn has_cycle(&self) -> bool {
        self.find_cycle().is_some()
    }

    /// One cycle as a path of ids whose last element repeats the first.
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        let mut marks: HashMap<&str, Mark> = HashMap::new();
        let mut path: Vec<&str> = Vec::new();
        for id in &self.order {
            if let Some(cycle) = self.dfs_cycle(id, &mut marks, &mut path) {
                return Some(cycle);
            }
        }
        None
    }

    fn dfs_cycle<'a>(
        &'a self,
        id: &'a str,
        marks: &mut HashMap<&'a str, Mark>,
        path: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        match marks.get(id) {
            Some(Mark::InProgress) => {
                // Back edge: the cycle is the path suffix starting at `id`.
                let start = path.iter().position(|p| *p == id).unwrap_or(0);
                let mut cycle: Vec<String> = path[start..].iter().map(|s| s.to_string()).collect();
                cycle.push(id.to_string());
                return Some(cycle);
            }
            Some(Mark::Done) => return None,
            None => {}
        }
        marks.insert(id, Mark::InProgress);
        path.push(id);
        if let Some(task) = self.nodes.get(id) {
            for dep in &task.dependencies {
                if let Some(cycle) = self.dfs_cycle(dep, marks, path) {
                    return Some(cycle);
                }
            }
        }
        path.pop();
        marks.insert(id, Mark::Done);
        None
    }

    /// Every task after all of its dependencies. Among tasks that become
    /// available together, insertion order wins.
    pub fn topological_sort(&self) -> NexusResult<Vec<String>> {
        self.kahn_order()
    }

    /// Groups of tasks that could run concurrently if every earlier group
    /// had completed.
    pub fn ready_waves(&self) -> NexusResult<Vec<Vec<String>>> {
        Ok(self
            .waves()?
            .into_iter()
            .map(|wave| wave.into_iter().map(|i| self.order[i].clone()).collect())
            .collect())
    }

    fn indexed(&self) -> (Vec<usize>, Vec<Vec<usize>>) {
        let index: HashMap<&str, usize> = self
            .order
            .iter()
            .enumerate()
            .map(|(i, id)| (id.as_str(), i))
            .collect();
        let mut indegree = vec![0usize; self.order.len()];
        let mut dependents = vec![Vec::new(); self.order.len()];
        for (i, id) in self.order.iter().enumerate() {
            let Some(task) = self.nodes.get(id) else {
                continue;
            };
            let deps: BTreeSet<usize> = task
                .dependencies
                .iter()
                .filter_map(|d| index.get(d.as_str()).copied())
                .collect();
            indegree[i] = deps.len();
            for d in deps {
                dependents[d].push(i);
            }
        }
        (indegree, dependents)
    }

    fn cycle_error(&self) -> NexusError {
        let detail = self
            .find_cycle()
            .map(|c| c.join(" -> "))
            .unwrap_or_else(|| "dependency cycle".to_string());
        NexusError::CyclicDependency(detail)
    }

    fn kahn_order(&self) -> NexusResult<Vec<String>> {
        let (mut indegree, dependents) = self.indexed();
        let mut ready: BTreeSet<usize> = (0..indegree.len()).filter(|i| indegree[*i] == 0).collect();
        let mut sorted = Vec::with_capacity(self.order.len());
        while let Some(i) = ready.pop_first() {
            sorted.push(self.order[i].clone());
            for &next in &dependents[i] {
                indegree[next] -= 1;
                if indegree[next] == 0 {
                    ready.insert(next);
                }
            }
        }
        if sorted.len() != self.order.len() {
            return Err(self.cycle_error());
        }
        Ok(sorted)
    }

    fn waves(&self) -> NexusResult<Vec<Vec<usize>>> {
        let (mut indegree, dependents) = self.indexed();
        let mut current: Vec<usize> = (0..indegree.len()).filter(|i| indegree[*i] == 0).collect();
        let mut waves = Vec::new();
        let mut placed = 0;
        while !current.is_empty() {
            placed += current.len();
            let mut next = BTreeSet::new();
            for &i in &current {
                for &d in &dependents[i] {
                    indegree[d] -= 1;
                    if indegree[d] == 0 {
                        next.insert(d);
                    }
                }
            }
            waves.push(std::mem::take(&mut current));
            current = next.into_iter().collect();
        }
        if placed != self.order.len() {
            return Err(self.cycle_error());
        }
        Ok(waves)
    }
}
