//! Bookkeeping of "states of the same kind".
//!
//! Two states are of the same kind with respect to an integer variable if
//! they agree on every other variable. Seeing several same-kind states
//! with different values is the signal that a frame bound might extend
//! over a whole interval of that variable, so the generalizer consults
//! this cache before spending solver time.

use std::collections::HashMap;

use crate::{
    model::{state_graph::StateGraph, Value},
    probability::StateId,
};

#[derive(Debug, Default)]
struct Entry {
    all: Vec<StateId>,
}

#[derive(Debug, Default)]
pub struct SameKindCache {
    /// Per integer variable index, keyed by the valuation with that
    /// variable masked out.
    per_var: HashMap<usize, HashMap<Vec<Value>, Entry>>,
}

fn masked_key(graph: &StateGraph, state: StateId, var_index: usize) -> Vec<Value> {
    let valuation = graph.valuation(state);
    valuation
        .iter()
        .enumerate()
        .filter(|(idx, _)| *idx != var_index)
        .map(|(_, value)| *value)
        .collect()
}

impl SameKindCache {
    pub fn consider(&mut self, graph: &StateGraph, state: StateId, int_vars: &[usize]) {
        for &var_index in int_vars {
            let key = masked_key(graph, state, var_index);
            let entry = self
                .per_var
                .entry(var_index)
                .or_default()
                .entry(key)
                .or_default();
            if !entry.all.contains(&state) {
                entry.all.push(state);
            }
        }
    }

    pub fn clear(&mut self) {
        self.per_var.clear();
    }

    fn entry(&self, graph: &StateGraph, state: StateId, var_index: usize) -> Option<&Entry> {
        let key = masked_key(graph, state, var_index);
        self.per_var.get(&var_index)?.get(&key)
    }

    /// The earliest recorded same-kind state other than `state` itself.
    pub fn first(&self, graph: &StateGraph, state: StateId, var_index: usize) -> Option<StateId> {
        self.entry(graph, state, var_index)?
            .all
            .iter()
            .copied()
            .find(|&other| other != state)
    }

    /// The most recently recorded same-kind state other than `state`.
    pub fn last(&self, graph: &StateGraph, state: StateId, var_index: usize) -> Option<StateId> {
        self.entry(graph, state, var_index)?
            .all
            .iter()
            .rev()
            .copied()
            .find(|&other| other != state)
    }

    /// Whether some recorded same-kind state takes a different value in
    /// the masked variable.
    pub fn has_other_value(&self, graph: &StateGraph, state: StateId, var_index: usize) -> bool {
        let own = graph.var_value(state, var_index);
        match self.entry(graph, state, var_index) {
            None => false,
            Some(entry) => entry
                .all
                .iter()
                .any(|&other| graph.var_value(other, var_index) != own),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        Assignment, Command, Expr, ModelType, Program, UpdateBranch, VarKind, Variable,
    };
    use crate::probability::Probability;

    // Two counters; c0 steps freely, c1 stays put, so states sharing c1
    // but differing in c0 are of the same kind for c0.
    fn two_counter_program() -> Program {
        Program {
            name: "two-counters".into(),
            model_type: ModelType::Dtmc,
            variables: vec![
                Variable {
                    name: "c0".into(),
                    kind: VarKind::Int { lower: 0, upper: 5 },
                    initial: Value::Int(0),
                },
                Variable {
                    name: "c1".into(),
                    kind: VarKind::Int { lower: 0, upper: 5 },
                    initial: Value::Int(0),
                },
            ],
            commands: vec![Command {
                name: None,
                guard: Expr::Lt(Box::new(Expr::var("c0")), Box::new(Expr::Int(5))),
                updates: vec![UpdateBranch {
                    probability: Probability::one(),
                    assignments: vec![Assignment {
                        variable: "c0".into(),
                        value: Expr::Add(Box::new(Expr::var("c0")), Box::new(Expr::Int(1))),
                    }],
                }],
            }],
            goal: Expr::Eq(Box::new(Expr::var("c0")), Box::new(Expr::Int(5))),
        }
    }

    #[test]
    fn tracks_first_and_last_and_reports_none_when_alone() {
        let graph = StateGraph::new(two_counter_program());
        let states = graph.explore(None).unwrap();
        assert!(states.len() >= 3);

        let mut cache = SameKindCache::default();
        let int_vars = [0usize];
        cache.consider(&graph, states[0], &int_vars);
        assert_eq!(cache.first(&graph, states[0], 0), None);
        assert!(!cache.has_other_value(&graph, states[0], 0));

        cache.consider(&graph, states[1], &int_vars);
        cache.consider(&graph, states[2], &int_vars);
        assert_eq!(cache.first(&graph, states[2], 0), Some(states[0]));
        assert_eq!(cache.last(&graph, states[0], 0), Some(states[2]));
        assert!(cache.has_other_value(&graph, states[0], 0));
    }

    #[test]
    fn clear_forgets_every_recorded_state() {
        let graph = StateGraph::new(two_counter_program());
        let states = graph.explore(None).unwrap();
        let mut cache = SameKindCache::default();
        cache.consider(&graph, states[0], &[0]);
        cache.consider(&graph, states[1], &[0]);
        assert!(cache.has_other_value(&graph, states[0], 0));

        cache.clear();
        assert_eq!(cache.first(&graph, states[0], 0), None);
        assert!(!cache.has_other_value(&graph, states[0], 0));
    }

    #[test]
    fn repeated_consider_is_idempotent() {
        let graph = StateGraph::new(two_counter_program());
        let init = graph.initial_state();
        let mut cache = SameKindCache::default();
        cache.consider(&graph, init, &[0]);
        cache.consider(&graph, init, &[0]);
        assert_eq!(cache.first(&graph, init, 0), None);
        assert_eq!(cache.last(&graph, init, 0), None);
    }
}
