use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::action::{Action, ActionId, TargetId};
use crate::error::{CastleError, Result};

/// Directed dependency graph over every action of a scheduling run.
///
/// An edge `p -> a` means `p` must finish before `a` may start. Edges come
/// from each action's targets (any scope) and its same-node `comes_after`
/// types. Construction rejects duplicate ids and cycles, so a built graph is
/// always a DAG.
pub struct ActionDependencyGraph {
    actions: BTreeMap<ActionId, Arc<dyn Action>>,
    by_type: BTreeMap<String, BTreeSet<ActionId>>,
    predecessors: BTreeMap<ActionId, BTreeSet<ActionId>>,
    successors: BTreeMap<ActionId, BTreeSet<ActionId>>,
}

impl ActionDependencyGraph {
    pub fn new(actions: impl IntoIterator<Item = Arc<dyn Action>>) -> Result<Self> {
        let mut indexed: BTreeMap<ActionId, Arc<dyn Action>> = BTreeMap::new();
        let mut by_type: BTreeMap<String, BTreeSet<ActionId>> = BTreeMap::new();
        for action in actions {
            let id = action.id().clone();
            if indexed.contains_key(&id) {
                return Err(CastleError::DuplicateAction(id.to_string()));
            }
            by_type
                .entry(id.action_type().to_string())
                .or_default()
                .insert(id.clone());
            indexed.insert(id, action);
        }

        let mut graph = Self {
            predecessors: indexed.keys().map(|id| (id.clone(), BTreeSet::new())).collect(),
            successors: indexed.keys().map(|id| (id.clone(), BTreeSet::new())).collect(),
            actions: indexed,
            by_type,
        };

        let mut edges = Vec::new();
        for (id, action) in &graph.actions {
            for target in action.targets() {
                // Targets which match nothing are legal: the role may be absent.
                for pred in graph.matching(target) {
                    edges.push((pred, id.clone()));
                }
            }
            for action_type in action.comes_after() {
                let pred = ActionId::new(action_type.as_str(), id.scope());
                if graph.actions.contains_key(&pred) {
                    edges.push((pred, id.clone()));
                }
            }
        }
        for (pred, succ) in edges {
            graph
                .predecessors
                .entry(succ.clone())
                .or_default()
                .insert(pred.clone());
            graph.successors.entry(pred).or_default().insert(succ);
        }

        graph.check_acyclic()?;
        Ok(graph)
    }

    /// Every action id matched by `target`.
    pub fn matching(&self, target: &TargetId) -> BTreeSet<ActionId> {
        self.by_type
            .get(target.action_type())
            .map(|ids| ids.iter().filter(|id| target.matches(id)).cloned().collect())
            .unwrap_or_default()
    }

    pub fn predecessors_of(&self, id: &ActionId) -> &BTreeSet<ActionId> {
        static EMPTY: BTreeSet<ActionId> = BTreeSet::new();
        self.predecessors.get(id).unwrap_or(&EMPTY)
    }

    pub fn successors_of(&self, id: &ActionId) -> &BTreeSet<ActionId> {
        static EMPTY: BTreeSet<ActionId> = BTreeSet::new();
        self.successors.get(id).unwrap_or(&EMPTY)
    }

    pub fn all_ids(&self) -> impl Iterator<Item = &ActionId> {
        self.actions.keys()
    }

    pub fn action(&self, id: &ActionId) -> Option<&Arc<dyn Action>> {
        self.actions.get(id)
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// The actions matched by `target` plus everything they transitively
    /// depend on.
    pub fn resolve(&self, target: &TargetId) -> BTreeSet<ActionId> {
        self.closure(self.matching(target))
    }

    /// Resolve a CLI target name (`type` or `type:scope`). A name which
    /// matches no action is an error.
    pub fn resolve_name(&self, name: &str) -> Result<BTreeSet<ActionId>> {
        let resolved = self.resolve(&TargetId::parse(name));
        if resolved.is_empty() {
            return Err(CastleError::UnknownTarget(name.to_string()));
        }
        Ok(resolved)
    }

    /// Transitive predecessor closure of `roots`, roots included.
    pub fn closure(&self, roots: impl IntoIterator<Item = ActionId>) -> BTreeSet<ActionId> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<ActionId> = roots.into_iter().collect();
        while let Some(id) = stack.pop() {
            if !seen.insert(id.clone()) {
                continue;
            }
            stack.extend(self.predecessors_of(&id).iter().cloned());
        }
        seen
    }

    fn check_acyclic(&self) -> Result<()> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }

        let mut marks: BTreeMap<&ActionId, Mark> = BTreeMap::new();
        for start in self.actions.keys() {
            if marks.contains_key(start) {
                continue;
            }
            // Iterative DFS over predecessor edges; `path` mirrors the
            // recursion stack so a back edge can be reported as a cycle.
            let mut path: Vec<&ActionId> = vec![start];
            let mut iters = vec![self.predecessors_of(start).iter()];
            marks.insert(start, Mark::Visiting);
            while let Some(iter) = iters.last_mut() {
                match iter.next() {
                    Some(next) => match marks.get(next) {
                        Some(Mark::Done) => {}
                        Some(Mark::Visiting) => {
                            let pos = path.iter().position(|id| *id == next).unwrap_or(0);
                            let mut cycle: Vec<String> =
                                path[pos..].iter().map(|id| id.to_string()).collect();
                            cycle.push(next.to_string());
                            return Err(CastleError::DependencyCycle(cycle.join(" <- ")));
                        }
                        None => {
                            marks.insert(next, Mark::Visiting);
                            path.push(next);
                            iters.push(self.predecessors_of(next).iter());
                        }
                    },
                    None => {
                        iters.pop();
                        if let Some(done) = path.pop() {
                            marks.insert(done, Mark::Done);
                        }
                    }
                }
            }
        }
        Ok(())
    }
}
