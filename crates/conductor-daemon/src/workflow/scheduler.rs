//! DAG-based step scheduler for workflow runs.
//!
//! [`validate_graph`] rejects dangling edges, self-loops and cycles (via
//! Kahn's algorithm). The [`DagScheduler`] then tracks in-degrees, yields
//! steps whose dependencies have all completed, and cascades `Skipped`
//! downstream of a failure. It is event-driven: completing or failing a step
//! only touches that step's dependents.

use std::collections::{HashMap, HashSet, VecDeque};

/// Structural problems found before a workflow may run.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("Workflow has no steps")]
    Empty,

    #[error("Edge {from} -> {to} references unknown step '{missing}'")]
    DanglingEdge {
        from: String,
        to: String,
        missing: String,
    },

    #[error("Step '{0}' depends on itself")]
    SelfLoop(String),

    #[error("Dependency graph contains a cycle through: {}", .0.join(", "))]
    Cycle(Vec<String>),
}

/// State of a step in the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepState {
    /// Waiting for dependencies.
    Pending,
    /// All dependencies completed, ready to dispatch.
    Ready,
    Running,
    Completed,
    Failed,
    /// Never dispatched: an upstream step failed, or the run was cancelled.
    Skipped,
}

impl StepState {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

/// Validate that `edges` (`(source, target)` pairs) only reference `steps`
/// and form a DAG.
pub fn validate_graph(steps: &[String], edges: &[(String, String)]) -> Result<(), GraphError> {
    if steps.is_empty() {
        return Err(GraphError::Empty);
    }
    let step_set: HashSet<&str> = steps.iter().map(String::as_str).collect();

    for (from, to) in edges {
        for endpoint in [from, to] {
            if !step_set.contains(endpoint.as_str()) {
                return Err(GraphError::DanglingEdge {
                    from: from.clone(),
                    to: to.clone(),
                    missing: endpoint.clone(),
                });
            }
        }
        if from == to {
            return Err(GraphError::SelfLoop(from.clone()));
        }
    }

    // Kahn's algorithm: repeatedly remove zero in-degree nodes
    let mut in_degree: HashMap<&str, usize> = steps.iter().map(|s| (s.as_str(), 0)).collect();
    let mut adj: HashMap<&str, Vec<&str>> = HashMap::new();
    let mut seen: HashSet<(&str, &str)> = HashSet::new();

    for (from, to) in edges {
        if !seen.insert((from.as_str(), to.as_str())) {
            continue;
        }
        adj.entry(from.as_str()).or_default().push(to.as_str());
        *in_degree.entry(to.as_str()).or_insert(0) += 1;
    }

    let mut queue: VecDeque<&str> = in_degree
        .iter()
        .filter(|&(_, &deg)| deg == 0)
        .map(|(&step, _)| step)
        .collect();

    let mut processed = 0usize;
    while let Some(step) = queue.pop_front() {
        processed += 1;
        if let Some(neighbors) = adj.get(step) {
            for &neighbor in neighbors {
                if let Some(deg) = in_degree.get_mut(neighbor) {
                    *deg = deg.saturating_sub(1);
                    if *deg == 0 {
                        queue.push_back(neighbor);
                    }
                }
            }
        }
    }

    if processed != in_degree.len() {
        let mut remaining: Vec<String> = in_degree
            .into_iter()
            .filter(|&(_, deg)| deg > 0)
            .map(|(step, _)| step.to_string())
            .collect();
        remaining.sort();
        return Err(GraphError::Cycle(remaining));
    }

    Ok(())
}

/// Execution state of one workflow run.
#[derive(Debug)]
pub struct DagScheduler {
    /// All step IDs, in definition order.
    steps: Vec<String>,
    /// `step_id` -> upstream step IDs, in edge order.
    dependencies: HashMap<String, Vec<String>>,
    /// `step_id` -> downstream step IDs.
    dependents: HashMap<String, Vec<String>>,
    states: HashMap<String, StepState>,
    /// Upstream steps not yet completed.
    in_degrees: HashMap<String, usize>,
}

impl DagScheduler {
    /// Validate the graph and compute the initial ready set.
    pub fn new(steps: Vec<String>, edges: &[(String, String)]) -> Result<Self, GraphError> {
        validate_graph(&steps, edges)?;

        let mut dependencies: HashMap<String, Vec<String>> = HashMap::new();
        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
        for step in &steps {
            dependencies.entry(step.clone()).or_default();
            dependents.entry(step.clone()).or_default();
        }
        for (from, to) in edges {
            let upstream = dependencies.entry(to.clone()).or_default();
            if upstream.contains(from) {
                continue;
            }
            upstream.push(from.clone());
            dependents.entry(from.clone()).or_default().push(to.clone());
        }

        let in_degrees: HashMap<String, usize> = dependencies
            .iter()
            .map(|(step, deps)| (step.clone(), deps.len()))
            .collect();

        let states = steps
            .iter()
            .map(|step| {
                let state = if in_degrees.get(step).copied().unwrap_or(0) == 0 {
                    StepState::Ready
                } else {
                    StepState::Pending
                };
                (step.clone(), state)
            })
            .collect();

        Ok(Self {
            steps,
            dependencies,
            dependents,
            states,
            in_degrees,
        })
    }

    /// Steps that are ready to dispatch, in definition order.
    pub fn next_ready(&self) -> Vec<String> {
        self.steps
            .iter()
            .filter(|s| self.states.get(*s) == Some(&StepState::Ready))
            .cloned()
            .collect()
    }

    /// Direct upstream steps of `step_id`, in edge order.
    pub fn dependencies(&self, step_id: &str) -> &[String] {
        self.dependencies.get(step_id).map_or(&[], Vec::as_slice)
    }

    pub fn mark_running(&mut self, step_id: &str) {
        if let Some(state) = self.states.get_mut(step_id) {
            *state = StepState::Running;
        }
    }

    /// Mark a step completed and return the dependents that just became
    /// ready.
    pub fn mark_completed(&mut self, step_id: &str) -> Vec<String> {
        if let Some(state) = self.states.get_mut(step_id) {
            *state = StepState::Completed;
        }

        let mut newly_ready = Vec::new();

        if let Some(downstream) = self.dependents.get(step_id).cloned() {
            for ds in &downstream {
                if let Some(deg) = self.in_degrees.get_mut(ds) {
                    *deg = deg.saturating_sub(1);
                    if *deg == 0
                        && let Some(state) = self.states.get_mut(ds)
                        && *state == StepState::Pending
                    {
                        *state = StepState::Ready;
                        newly_ready.push(ds.clone());
                    }
                }
            }
        }

        newly_ready
    }

    /// Mark a step failed and transitively skip everything downstream of it
    /// that has not started. Returns the newly skipped steps.
    pub fn mark_failed(&mut self, step_id: &str) -> Vec<String> {
        if let Some(state) = self.states.get_mut(step_id) {
            *state = StepState::Failed;
        }

        // Cascade: BFS through dependents
        let mut skipped = Vec::new();
        let mut queue: VecDeque<String> = VecDeque::new();

        if let Some(downstream) = self.dependents.get(step_id) {
            queue.extend(downstream.iter().cloned());
        }

        let mut visited: HashSet<String> = HashSet::new();
        while let Some(ds) = queue.pop_front() {
            if !visited.insert(ds.clone()) {
                continue;
            }

            if let Some(state) = self.states.get_mut(&ds)
                && matches!(*state, StepState::Pending | StepState::Ready)
            {
                *state = StepState::Skipped;
                skipped.push(ds.clone());
            }

            if let Some(further_downstream) = self.dependents.get(&ds) {
                queue.extend(further_downstream.iter().cloned());
            }
        }

        skipped
    }

    /// Skip every step that has not been dispatched. Used on cancellation.
    pub fn skip_remaining(&mut self) -> Vec<String> {
        let mut skipped = Vec::new();
        for step in &self.steps {
            if let Some(state) = self.states.get_mut(step)
                && matches!(*state, StepState::Pending | StepState::Ready)
            {
                *state = StepState::Skipped;
                skipped.push(step.clone());
            }
        }
        skipped
    }

    /// Whether every step has reached a terminal state.
    pub fn is_complete(&self) -> bool {
        self.states.values().all(|s| s.is_terminal())
    }

    pub fn has_failures(&self) -> bool {
        self.states.values().any(|s| *s == StepState::Failed)
    }

    pub fn step_state(&self, step_id: &str) -> Option<StepState> {
        self.states.get(step_id).copied()
    }

    pub const fn total_steps(&self) -> usize {
        self.steps.len()
    }

    /// Count steps in each state.
    pub fn counts(&self) -> HashMap<StepState, usize> {
        let mut counts: HashMap<StepState, usize> = HashMap::new();
        for state in self.states.values() {
            *counts.entry(*state).or_insert(0) += 1;
        }
        counts
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn steps(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| (*s).to_string()).collect()
    }

    fn edges(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(a, b)| ((*a).to_string(), (*b).to_string()))
            .collect()
    }

    // =========================================================================
    // Graph validation
    // =========================================================================

    #[test]
    fn rejects_cycle() {
        let result = DagScheduler::new(
            steps(&["a", "b", "c"]),
            &edges(&[("a", "b"), ("b", "c"), ("c", "a")]),
        );
        let err = result.unwrap_err();
        assert_eq!(
            err,
            GraphError::Cycle(steps(&["a", "b", "c"]))
        );
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn cycle_report_excludes_acyclic_prefix() {
        let err = validate_graph(
            &steps(&["root", "x", "y"]),
            &edges(&[("root", "x"), ("x", "y"), ("y", "x")]),
        )
        .unwrap_err();
        assert_eq!(err, GraphError::Cycle(steps(&["x", "y"])));
    }

    #[test]
    fn rejects_self_dependency() {
        let err = validate_graph(&steps(&["a"]), &edges(&[("a", "a")])).unwrap_err();
        assert_eq!(err, GraphError::SelfLoop("a".to_string()));
    }

    #[test]
    fn rejects_dangling_edge() {
        let err =
            validate_graph(&steps(&["a", "b"]), &edges(&[("a", "nonexistent")])).unwrap_err();
        assert!(
            matches!(err, GraphError::DanglingEdge { ref missing, .. } if missing == "nonexistent"),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn rejects_empty_graph() {
        assert_eq!(validate_graph(&[], &[]), Err(GraphError::Empty));
    }

    #[test]
    fn accepts_valid_dag() {
        assert!(DagScheduler::new(steps(&["a", "b", "c"]), &edges(&[("a", "b"), ("b", "c")])).is_ok());
    }

    #[test]
    fn duplicate_edges_count_once() {
        let mut sched =
            DagScheduler::new(steps(&["a", "b"]), &edges(&[("a", "b"), ("a", "b")])).unwrap();
        assert_eq!(sched.dependencies("b"), ["a".to_string()]);
        sched.mark_running("a");
        assert_eq!(sched.mark_completed("a"), vec!["b"]);
    }

    // =========================================================================
    // Dispatch order
    // =========================================================================

    #[test]
    fn independent_steps_ready_initially() {
        let sched = DagScheduler::new(steps(&["a", "b", "c"]), &[]).unwrap();
        assert_eq!(sched.next_ready(), vec!["a", "b", "c"]);
        assert_eq!(sched.total_steps(), 3);
    }

    #[test]
    fn chain_runs_one_at_a_time() {
        let mut sched =
            DagScheduler::new(steps(&["a", "b", "c"]), &edges(&[("a", "b"), ("b", "c")])).unwrap();

        assert_eq!(sched.next_ready(), vec!["a"]);
        sched.mark_running("a");
        assert!(sched.next_ready().is_empty());

        assert_eq!(sched.mark_completed("a"), vec!["b"]);
        sched.mark_running("b");
        assert_eq!(sched.mark_completed("b"), vec!["c"]);
        sched.mark_running("c");
        sched.mark_completed("c");
        assert!(sched.is_complete());
        assert!(!sched.has_failures());
    }

    #[test]
    fn diamond_waits_for_both_branches() {
        let mut sched = DagScheduler::new(
            steps(&["a", "b", "c", "d"]),
            &edges(&[("a", "b"), ("a", "c"), ("b", "d"), ("c", "d")]),
        )
        .unwrap();

        sched.mark_running("a");
        assert_eq!(sched.mark_completed("a"), vec!["b", "c"]);
        sched.mark_running("b");
        sched.mark_running("c");

        assert!(sched.mark_completed("b").is_empty());
        assert_eq!(sched.step_state("d"), Some(StepState::Pending));
        assert_eq!(sched.mark_completed("c"), vec!["d"]);
        assert_eq!(sched.dependencies("d"), steps(&["b", "c"]).as_slice());
    }

    // =========================================================================
    // Failure cascading
    // =========================================================================

    #[test]
    fn failure_skips_transitive_dependents() {
        let mut sched = DagScheduler::new(
            steps(&["a", "b", "c", "d"]),
            &edges(&[("a", "b"), ("b", "c"), ("c", "d")]),
        )
        .unwrap();

        sched.mark_running("a");
        let skipped = sched.mark_failed("a");
        assert_eq!(skipped, vec!["b", "c", "d"]);
        assert_eq!(sched.step_state("a"), Some(StepState::Failed));
        assert!(sched.is_complete());
        assert!(sched.has_failures());
    }

    #[test]
    fn failure_does_not_touch_independent_branch() {
        // a -> c <- b, d independent
        let mut sched = DagScheduler::new(
            steps(&["a", "b", "c", "d"]),
            &edges(&[("a", "c"), ("b", "c")]),
        )
        .unwrap();
        for id in ["a", "b", "d"] {
            sched.mark_running(id);
        }

        assert_eq!(sched.mark_failed("a"), vec!["c"]);
        assert!(!sched.is_complete());
        assert!(sched.mark_completed("b").is_empty());
        sched.mark_completed("d");

        assert!(sched.is_complete());
        assert_eq!(sched.step_state("b"), Some(StepState::Completed));
        assert_eq!(sched.step_state("c"), Some(StepState::Skipped));
    }

    #[test]
    fn skip_remaining_leaves_running_steps() {
        let mut sched =
            DagScheduler::new(steps(&["a", "b", "c"]), &edges(&[("a", "c")])).unwrap();
        sched.mark_running("a");
        let mut skipped = sched.skip_remaining();
        skipped.sort();
        assert_eq!(skipped, vec!["b", "c"]);
        assert_eq!(sched.step_state("a"), Some(StepState::Running));
        let counts = sched.counts();
        assert_eq!(counts.get(&StepState::Skipped), Some(&2));
        assert_eq!(counts.get(&StepState::Running), Some(&1));
    }

    #[test]
    fn step_state_returns_none_for_unknown() {
        let sched = DagScheduler::new(steps(&["a"]), &[]).unwrap();
        assert!(sched.step_state("nonexistent").is_none());
        assert!(sched.dependencies("nonexistent").is_empty());
    }
}
