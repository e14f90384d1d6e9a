//! Lazy explicit-state exploration over a guarded-command program.
//!
//! Valuations are interned the first time they are seen, so state ids only
//! depend on exploration order and runs are reproducible. Successor
//! distributions are *filtered*: targets satisfying the goal collapse into
//! a single goal marker and deadlocking non-goal targets are dropped
//! entirely, since their reachability value is pinned to 1 and 0
//! respectively and the search never needs to visit them.

use std::{
    cell::RefCell,
    collections::{HashMap, VecDeque},
    rc::Rc,
};

use itertools::Itertools;
use log::trace;

use crate::{
    error::{Pric3Error, Result},
    model::{Program, Value},
    probability::{Probability, StateId, Successor},
};

/// One resolved command of a state, with its filtered distribution.
#[derive(Clone, Debug)]
pub struct Choice {
    pub command_index: usize,
    pub successors: Vec<(Successor, Probability)>,
}

impl Choice {
    pub fn goal_probability(&self) -> Probability {
        self.successors
            .iter()
            .filter(|(succ, _)| matches!(succ, Successor::Goal))
            .fold(Probability::zero(), |acc, (_, p)| acc + p.clone())
    }

    pub fn non_goal_successors(&self) -> Vec<(StateId, Probability)> {
        self.successors
            .iter()
            .filter_map(|(succ, p)| match succ {
                Successor::State(id) => Some((*id, p.clone())),
                Successor::Goal => None,
            })
            .collect()
    }
}

#[derive(Clone, Debug)]
pub struct Behavior {
    pub choices: Vec<Choice>,
}

pub struct StateGraph {
    program: Program,
    states: RefCell<Vec<Rc<Vec<Value>>>>,
    index: RefCell<HashMap<Vec<Value>, StateId>>,
    behaviors: RefCell<HashMap<StateId, Rc<Behavior>>>,
}

impl StateGraph {
    pub fn new(program: Program) -> Rc<Self> {
        let graph = Rc::new(StateGraph {
            program,
            states: RefCell::new(vec![]),
            index: RefCell::new(HashMap::new()),
            behaviors: RefCell::new(HashMap::new()),
        });
        let initial = graph.program.initial_valuation();
        graph.intern(initial);
        graph
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn initial_state(&self) -> StateId {
        StateId(0)
    }

    pub fn num_states(&self) -> usize {
        self.states.borrow().len()
    }

    pub fn valuation(&self, state: StateId) -> Rc<Vec<Value>> {
        Rc::clone(&self.states.borrow()[state.0])
    }

    pub fn var_value(&self, state: StateId, var_index: usize) -> Value {
        self.states.borrow()[state.0][var_index]
    }

    /// Stable textual key used by the file oracle and in log lines.
    pub fn valuation_key(&self, state: StateId) -> String {
        let valuation = self.valuation(state);
        self.program
            .variables
            .iter()
            .zip(valuation.iter())
            .map(|(var, value)| format!("{}={}", var.name, value))
            .join(",")
    }

    pub fn lookup(&self, valuation: &[Value]) -> Option<StateId> {
        self.index.borrow().get(valuation).copied()
    }

    fn intern(&self, valuation: Vec<Value>) -> StateId {
        if let Some(id) = self.index.borrow().get(&valuation) {
            return *id;
        }
        let id = StateId(self.states.borrow().len());
        trace!("interned {id} = {valuation:?}");
        self.index.borrow_mut().insert(valuation.clone(), id);
        self.states.borrow_mut().push(Rc::new(valuation));
        id
    }

    pub fn is_goal(&self, state: StateId) -> Result<bool> {
        let valuation = self.valuation(state);
        self.program.is_goal_valuation(&valuation)
    }

    /// A state with no enabled command. Non-goal terminal states can never
    /// reach the goal, so they carry probability 0.
    pub fn is_terminal(&self, state: StateId) -> Result<bool> {
        let valuation = self.valuation(state);
        Ok(self.program.enabled_commands(&valuation)?.is_empty())
    }

    /// More than one command is enabled, so a scheduler has to resolve the
    /// choice.
    pub fn is_nondeterministic(&self, state: StateId) -> Result<bool> {
        let valuation = self.valuation(state);
        Ok(self.program.enabled_commands(&valuation)?.len() > 1)
    }

    /// The filtered behavior of a state, cached after the first expansion.
    pub fn choices(&self, state: StateId) -> Result<Rc<Behavior>> {
        if let Some(behavior) = self.behaviors.borrow().get(&state) {
            return Ok(Rc::clone(behavior));
        }
        let behavior = Rc::new(self.expand(state)?);
        self.behaviors
            .borrow_mut()
            .insert(state, Rc::clone(&behavior));
        Ok(behavior)
    }

    fn expand(&self, state: StateId) -> Result<Behavior> {
        let valuation = self.valuation(state);
        let mut choices = vec![];
        for command_index in self.program.enabled_commands(&valuation)? {
            let command = &self.program.commands[command_index];
            let mut successors: Vec<(Successor, Probability)> = vec![];
            let mut goal_mass = Probability::zero();
            for update in &command.updates {
                let target = self.program.apply_update(&valuation, update)?;
                if self.program.is_goal_valuation(&target)? {
                    goal_mass = goal_mass + update.probability.clone();
                    continue;
                }
                if self.program.enabled_commands(&target)?.is_empty() {
                    // Dropped: a deadlocking non-goal target contributes 0.
                    continue;
                }
                let id = self.intern(target);
                match successors
                    .iter_mut()
                    .find(|(succ, _)| *succ == Successor::State(id))
                {
                    Some((_, p)) => *p = p.clone() + update.probability.clone(),
                    None => successors.push((Successor::State(id), update.probability.clone())),
                }
            }
            if !goal_mass.is_zero() {
                successors.push((Successor::Goal, goal_mass));
            }
            choices.push(Choice {
                command_index,
                successors,
            });
        }
        Ok(Behavior { choices })
    }

    /// Breadth-first exploration from the initial state, up to `depth`
    /// steps (`None` explores the whole reachable fragment; variable
    /// bounds keep it finite).
    pub fn explore(&self, depth: Option<usize>) -> Result<Vec<StateId>> {
        let initial = self.initial_state();
        let mut seen = vec![initial];
        let mut frontier = VecDeque::from([(initial, 0usize)]);
        while let Some((state, dist)) = frontier.pop_front() {
            if depth.is_some_and(|limit| dist >= limit) {
                continue;
            }
            if self.is_goal(state)? {
                continue;
            }
            for choice in &self.choices(state)?.choices {
                for (successor, _) in &choice.successors {
                    if let Successor::State(id) = successor {
                        if !seen.contains(id) {
                            seen.push(*id);
                            frontier.push_back((*id, dist + 1));
                        }
                    }
                }
            }
        }
        Ok(seen)
    }

    /// The single choice of a deterministic state, or the indexed one of a
    /// nondeterministic state.
    pub fn choice(&self, state: StateId, command_index: usize) -> Result<Choice> {
        let behavior = self.choices(state)?;
        behavior
            .choices
            .iter()
            .find(|c| c.command_index == command_index)
            .cloned()
            .ok_or_else(|| {
                Pric3Error::Model(format!(
                    "command {command_index} is not enabled in state {state}"
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Assignment, Command, Expr, ModelType, UpdateBranch, VarKind, Variable};

    fn program(commands: Vec<Command>) -> Program {
        Program {
            name: "test".into(),
            model_type: ModelType::Mdp,
            variables: vec![Variable {
                name: "c".into(),
                kind: VarKind::Int { lower: 0, upper: 4 },
                initial: Value::Int(0),
            }],
            commands,
            goal: Expr::Eq(Box::new(Expr::var("c")), Box::new(Expr::Int(4))),
        }
    }

    fn step_command(guard_below: i64, step: i64) -> Command {
        Command {
            name: None,
            guard: Expr::Lt(Box::new(Expr::var("c")), Box::new(Expr::Int(guard_below))),
            updates: vec![UpdateBranch {
                probability: Probability::one(),
                assignments: vec![Assignment {
                    variable: "c".into(),
                    value: Expr::Add(Box::new(Expr::var("c")), Box::new(Expr::Int(step))),
                }],
            }],
        }
    }

    #[test]
    fn single_enabled_command_is_deterministic() {
        let graph = StateGraph::new(program(vec![step_command(4, 1)]));
        let init = graph.initial_state();
        assert!(!graph.is_nondeterministic(init).unwrap());
        assert_eq!(graph.choices(init).unwrap().choices.len(), 1);
    }

    #[test]
    fn two_enabled_commands_are_nondeterministic() {
        let graph = StateGraph::new(program(vec![step_command(4, 1), step_command(3, 2)]));
        let init = graph.initial_state();
        assert!(graph.is_nondeterministic(init).unwrap());
        assert_eq!(graph.choices(init).unwrap().choices.len(), 2);
    }

    #[test]
    fn goal_targets_collapse_into_the_marker() {
        // From c = 3 the only update reaches c = 4, which is the goal.
        let graph = StateGraph::new(program(vec![step_command(4, 1)]));
        let mut state = graph.initial_state();
        for _ in 0..3 {
            let behavior = graph.choices(state).unwrap();
            match behavior.choices[0].successors[0].0 {
                Successor::State(next) => state = next,
                Successor::Goal => break,
            }
        }
        let behavior = graph.choices(state).unwrap();
        assert_eq!(behavior.choices[0].successors.len(), 1);
        assert!(matches!(behavior.choices[0].successors[0].0, Successor::Goal));
        assert!(behavior.choices[0].goal_probability().is_one());
    }

    #[test]
    fn deadlocking_targets_are_dropped() {
        // c = 0 steps to c = 1 where no guard holds and the goal is not
        // reached, so the distribution of the initial state is empty.
        let graph = StateGraph::new(program(vec![step_command(1, 1)]));
        let init = graph.initial_state();
        let behavior = graph.choices(init).unwrap();
        assert!(behavior.choices[0].successors.is_empty());
    }

    #[test]
    fn interning_is_deterministic() {
        let graph = StateGraph::new(program(vec![step_command(4, 1)]));
        let reachable = graph.explore(None).unwrap();
        assert_eq!(reachable, vec![StateId(0), StateId(1), StateId(2), StateId(3)]);
        assert_eq!(graph.lookup(&[Value::Int(2)]), Some(StateId(2)));
    }
}
