//! Task dependency graph.
//!
//! Owns the loaded tasks plus a derived reverse index (id -> dependents).
//! Construction validates the graph: every referenced dependency must
//! exist and the graph must be acyclic. Readiness queries and completion
//! propagation operate on direct edges only.

use std::collections::HashMap;

use thiserror::Error;

use super::{Task, TaskFilter, TaskStatus};

/// Errors raised while building or validating the DAG.
#[derive(Debug, Error)]
pub enum DagError {
    /// The dependency graph contains a cycle. The path lists each task on
    /// the cycle and closes on its first element.
    #[error("dependency cycle detected: {}", cycle.join(" -> "))]
    CycleDetected { cycle: Vec<String> },

    /// A task references a dependency id that does not exist.
    #[error("task '{task}' depends on unknown task '{dependency}'")]
    MissingDependency { task: String, dependency: String },

    /// Two tasks share the same id.
    #[error("duplicate task id '{0}'")]
    DuplicateId(String),
}

/// Dependency graph over the loaded tasks.
#[derive(Debug, Default)]
pub struct TaskDag {
    /// Tasks in input order (the scheduling tie-break).
    tasks: Vec<Task>,
    /// id -> index into `tasks`.
    index: HashMap<String, usize>,
    /// Derived reverse index: id -> ids of tasks that depend on it.
    dependents: HashMap<String, Vec<String>>,
}

impl TaskDag {
    /// Build and validate a DAG from tasks in input order.
    ///
    /// With `lenient` set, a missing dependency is logged and the
    /// referencing task is marked `blocked` instead of failing the build.
    /// Cycles are always an error.
    pub fn build(mut tasks: Vec<Task>, lenient: bool) -> Result<Self, DagError> {
        let mut index = HashMap::with_capacity(tasks.len());
        for (i, task) in tasks.iter().enumerate() {
            if index.insert(task.id.clone(), i).is_some() {
                return Err(DagError::DuplicateId(task.id.clone()));
            }
        }

        // Missing-dependency validation (before cycle detection so the
        // DFS below can assume every edge resolves).
        let mut blocked: Vec<usize> = Vec::new();
        for (i, task) in tasks.iter().enumerate() {
            for dep in &task.dependencies {
                if !index.contains_key(dep) {
                    if lenient {
                        tracing::warn!(
                            task = %task.id,
                            dependency = %dep,
                            "unknown dependency; task will stay blocked"
                        );
                        blocked.push(i);
                    } else {
                        return Err(DagError::MissingDependency {
                            task: task.id.clone(),
                            dependency: dep.clone(),
                        });
                    }
                }
            }
        }
        for i in blocked {
            tasks[i].status = TaskStatus::Blocked;
        }

        let dag = Self {
            dependents: build_dependents(&tasks, &index),
            tasks,
            index,
        };

        if let Some(cycle) = dag.find_cycle() {
            return Err(DagError::CycleDetected { cycle });
        }

        Ok(dag)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.index.get(id).map(|&i| &self.tasks[i])
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Task> {
        match self.index.get(id).copied() {
            Some(i) => self.tasks.get_mut(i),
            None => None,
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Iterate tasks in input order.
    pub fn iter(&self) -> impl Iterator<Item = &Task> {
        self.tasks.iter()
    }

    /// Ids of tasks that directly depend on `id`.
    pub fn dependents_of(&self, id: &str) -> &[String] {
        self.dependents.get(id).map_or(&[], |v| v.as_slice())
    }

    /// A task is ready iff it is pending and every dependency completed.
    pub fn is_ready(&self, id: &str) -> bool {
        let Some(task) = self.get(id) else {
            return false;
        };
        task.status == TaskStatus::Pending
            && task.dependencies.iter().all(|dep| {
                self.get(dep)
                    .is_some_and(|d| d.status == TaskStatus::Completed)
            })
    }

    /// All ready tasks matching the filter, sorted by priority (high
    /// first), ties broken by input order.
    pub fn ready_tasks(&self, filter: &TaskFilter) -> Vec<&Task> {
        let mut ready: Vec<&Task> = self
            .tasks
            .iter()
            .filter(|t| filter.matches(t) && self.is_ready(&t.id))
            .collect();
        ready.sort_by_key(|t| (t.priority, t.ordinal));
        ready
    }

    /// Append a task that was not part of the original input (planner
    /// output). Rejects duplicates and unknown dependencies.
    pub fn push(&mut self, mut task: Task) -> Result<(), DagError> {
        if self.index.contains_key(&task.id) {
            return Err(DagError::DuplicateId(task.id.clone()));
        }
        for dep in &task.dependencies {
            if !self.index.contains_key(dep) {
                return Err(DagError::MissingDependency {
                    task: task.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }
        task.ordinal = self.tasks.len();
        for dep in &task.dependencies {
            self.dependents
                .entry(dep.clone())
                .or_default()
                .push(task.id.clone());
        }
        self.index.insert(task.id.clone(), self.tasks.len());
        self.tasks.push(task);
        Ok(())
    }

    /// Topological order (dependencies before dependents) by iterative
    /// DFS. The graph is known acyclic after `build`.
    pub fn topological_order(&self) -> Vec<String> {
        let mut visited = vec![false; self.tasks.len()];
        let mut order = Vec::with_capacity(self.tasks.len());

        for start in 0..self.tasks.len() {
            if visited[start] {
                continue;
            }
            // (node, next dependency index to visit)
            let mut stack: Vec<(usize, usize)> = vec![(start, 0)];
            visited[start] = true;
            while let Some(&mut (node, ref mut next)) = stack.last_mut() {
                let deps = &self.tasks[node].dependencies;
                if *next < deps.len() {
                    let dep = *next;
                    *next += 1;
                    let dep_idx = self.index[&deps[dep]];
                    if !visited[dep_idx] {
                        visited[dep_idx] = true;
                        stack.push((dep_idx, 0));
                    }
                } else {
                    order.push(self.tasks[node].id.clone());
                    stack.pop();
                }
            }
        }

        order
    }

    /// The longest dependency chain by task count, root first.
    pub fn critical_path(&self) -> Vec<String> {
        // Memoized longest chain ending at each node, following its
        // dependency edges. Computed over the topological order so every
        // dependency is resolved before its dependents.
        let mut depth: HashMap<String, usize> = HashMap::new();
        let mut best_dep: HashMap<String, Option<String>> = HashMap::new();

        for id in self.topological_order() {
            let task = &self.tasks[self.index[&id]];
            let mut longest = 0;
            let mut chosen = None;
            for dep in &task.dependencies {
                let d = depth.get(dep).copied().unwrap_or(0);
                if d > longest {
                    longest = d;
                    chosen = Some(dep.clone());
                }
            }
            depth.insert(id.clone(), longest + 1);
            best_dep.insert(id, chosen);
        }

        let Some(tail) = self
            .tasks
            .iter()
            .map(|t| t.id.clone())
            .max_by_key(|id| depth.get(id).copied().unwrap_or(0))
        else {
            return Vec::new();
        };

        let mut path = vec![tail];
        while let Some(Some(prev)) = best_dep.get(path.last().expect("non-empty")) {
            path.push(prev.clone());
        }
        path.reverse();
        path
    }

    /// Iterative white/grey/black DFS over dependency edges. Returns the
    /// cycle path (closing on its first element) when one exists.
    fn find_cycle(&self) -> Option<Vec<String>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White,
            Grey,
            Black,
        }

        let mut color = vec![Color::White; self.tasks.len()];

        for start in 0..self.tasks.len() {
            if color[start] != Color::White {
                continue;
            }
            let mut stack: Vec<(usize, usize)> = vec![(start, 0)];
            color[start] = Color::Grey;

            while let Some(&mut (node, ref mut next)) = stack.last_mut() {
                let deps = &self.tasks[node].dependencies;
                if *next < deps.len() {
                    let dep_id = &deps[*next];
                    *next += 1;
                    let dep_idx = self.index[dep_id];
                    match color[dep_idx] {
                        Color::White => {
                            color[dep_idx] = Color::Grey;
                            stack.push((dep_idx, 0));
                        }
                        Color::Grey => {
                            // Found a back edge: the cycle runs from the
                            // first occurrence of dep_idx on the stack to
                            // the top, then closes on dep_idx again.
                            let pos = stack
                                .iter()
                                .position(|&(n, _)| n == dep_idx)
                                .expect("grey node must be on stack");
                            let mut cycle: Vec<String> = stack[pos..]
                                .iter()
                                .map(|&(n, _)| self.tasks[n].id.clone())
                                .collect();
                            cycle.push(self.tasks[dep_idx].id.clone());
                            return Some(cycle);
                        }
                        Color::Black => {}
                    }
                } else {
                    color[node] = Color::Black;
                    stack.pop();
                }
            }
        }

        None
    }
}

fn build_dependents(tasks: &[Task], index: &HashMap<String, usize>) -> HashMap<String, Vec<String>> {
    let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
    for task in tasks {
        for dep in &task.dependencies {
            if index.contains_key(dep) {
                dependents
                    .entry(dep.clone())
                    .or_default()
                    .push(task.id.clone());
            }
        }
    }
    dependents
}
