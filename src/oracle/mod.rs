//! Reachability oracles.
//!
//! The oracle hands the search an estimate of each state's probability of
//! reaching the goal. Estimates may be arbitrarily wrong: whenever the
//! search hits a dead end it calls [`Oracle::refine`], which recomputes
//! exact values over the states visited so far. Refinement always makes
//! progress, so even the trivial all-zero oracle eventually becomes good
//! enough on the reachable fragment.

pub mod simulate;

use std::{
    collections::{BTreeSet, HashMap},
    fs,
    path::{Path, PathBuf},
    rc::Rc,
};

use log::{debug, info};
use serde::{Deserialize, Serialize};
use z3::{
    ast::{Ast, Int, Real},
    Context, Optimize, SatResult, Solver,
};

use crate::{
    error::{Pric3Error, Result},
    model::{state_graph::StateGraph, ModelType},
    probability::{Probability, StateId, Successor},
};

/// How the oracle obtains its initial estimates.
#[derive(Clone, Debug)]
pub enum OracleStrategy {
    /// Solve the reachability equation system over the whole reachable
    /// fragment. Exact, but explores everything up front.
    Exact,
    /// Exact values for all states within `depth` steps of the initial
    /// state; everything else gets the default value.
    BoundedExact { depth: usize },
    /// Like [`OracleStrategy::BoundedExact`] but solved numerically in
    /// floating point, then rounded to rationals.
    BoundedNumeric { depth: usize },
    /// Monte-Carlo estimates from seeded random walks.
    Simulation {
        runs: usize,
        max_steps: usize,
        seed: u64,
    },
    /// Bounded fixpoint iteration over the reachable fragment.
    ValueIteration { iterations: usize },
    /// Estimates loaded from a JSON snapshot of an earlier run.
    File { path: PathBuf },
}

#[derive(Serialize, Deserialize)]
struct OracleSnapshot {
    default: Probability,
    values: HashMap<String, Probability>,
}

pub struct Oracle {
    graph: Rc<StateGraph>,
    values: HashMap<StateId, Probability>,
    file_values: HashMap<String, Probability>,
    /// States whose values already went through an exact solve. Refinement
    /// must strictly grow this set whenever it gets stuck.
    covered: BTreeSet<StateId>,
    default_value: Probability,
    pub refinements: usize,
}

impl Oracle {
    pub fn new(
        context: &Context,
        graph: Rc<StateGraph>,
        strategy: &OracleStrategy,
        default_value: Probability,
    ) -> Result<Self> {
        let mut oracle = Oracle {
            graph,
            values: HashMap::new(),
            file_values: HashMap::new(),
            covered: BTreeSet::new(),
            default_value,
            refinements: 0,
        };
        oracle.initialize(context, strategy)?;
        Ok(oracle)
    }

    fn initialize(&mut self, context: &Context, strategy: &OracleStrategy) -> Result<()> {
        match strategy {
            OracleStrategy::Exact => {
                let states: BTreeSet<StateId> = self.graph.explore(None)?.into_iter().collect();
                info!("exact oracle over {} reachable states", states.len());
                self.solve_exact(context, &states)?;
            }
            OracleStrategy::BoundedExact { depth } => {
                let states: BTreeSet<StateId> =
                    self.graph.explore(Some(*depth))?.into_iter().collect();
                self.solve_exact(context, &states)?;
            }
            OracleStrategy::BoundedNumeric { depth } => {
                let states = self.graph.explore(Some(*depth))?;
                let numeric = self.solve_numeric(&states, 10 * states.len().max(100))?;
                for (state, value) in numeric {
                    self.values.insert(state, Probability::approximate(value)?);
                }
            }
            OracleStrategy::Simulation {
                runs,
                max_steps,
                seed,
            } => {
                self.values = simulate::estimate(&self.graph, *runs, *max_steps, *seed)?;
            }
            OracleStrategy::ValueIteration { iterations } => {
                let states = self.graph.explore(None)?;
                let numeric = self.solve_numeric(&states, *iterations)?;
                for (state, value) in numeric {
                    self.values.insert(state, Probability::approximate(value)?);
                }
            }
            OracleStrategy::File { path } => {
                let snapshot: OracleSnapshot = serde_json::from_str(&fs::read_to_string(path)?)?;
                self.default_value = snapshot.default;
                self.file_values = snapshot.values;
            }
        }
        Ok(())
    }

    /// The current estimate for a state.
    pub fn value(&self, state: StateId) -> Probability {
        if let Some(value) = self.values.get(&state) {
            return value.clone();
        }
        if !self.file_values.is_empty() {
            if let Some(value) = self.file_values.get(&self.graph.valuation_key(state)) {
                return value.clone();
            }
        }
        self.default_value.clone()
    }

    /// Recomputes exact values over the visited states. When the search
    /// got stuck without visiting anything new, coverage is pushed one
    /// successor layer outwards instead, so refinement can never loop
    /// without making progress.
    pub fn refine(&mut self, context: &Context, visited: &BTreeSet<StateId>) -> Result<()> {
        self.refinements += 1;
        let mut targets: BTreeSet<StateId> = visited.union(&self.covered).copied().collect();
        if visited.is_subset(&self.covered) {
            debug!("no new states visited, expanding coverage by one layer");
            for state in self.covered.clone() {
                if self.graph.is_goal(state)? {
                    continue;
                }
                for choice in &self.graph.choices(state)?.choices {
                    for (successor, _) in &choice.successors {
                        if let Successor::State(id) = successor {
                            targets.insert(*id);
                        }
                    }
                }
            }
        }
        info!(
            "oracle refinement #{} over {} states",
            self.refinements,
            targets.len()
        );
        self.solve_exact(context, &targets)
    }

    /// Solves the reachability system over `states` exactly. Markov chains
    /// get the linear equation system first; if that system is infeasible,
    /// or the model is a decision process, the minimizing linear program
    /// is used instead. States outside the set keep their current
    /// estimates and enter the system as constants.
    fn solve_exact(&mut self, context: &Context, states: &BTreeSet<StateId>) -> Result<()> {
        if states.is_empty() {
            return Ok(());
        }
        let solved = if self.graph.program().model_type == ModelType::Dtmc {
            match self.solve_equation_system(context, states)? {
                Some(solution) => Some(solution),
                None => {
                    debug!("equation system infeasible, falling back to the linear program");
                    None
                }
            }
        } else {
            None
        };
        let solution = match solved {
            Some(solution) => solution,
            None => self
                .solve_linear_program(context, states)?
                .ok_or(Pric3Error::OracleInconsistent {
                    states: states.len(),
                })?,
        };
        for (state, value) in solution {
            self.values.insert(state, value);
        }
        self.covered.extend(states.iter().copied());
        Ok(())
    }

    fn successor_term<'ctx>(
        &self,
        context: &'ctx Context,
        vars: &HashMap<StateId, Real<'ctx>>,
        state: StateId,
    ) -> Result<Real<'ctx>> {
        match vars.get(&state) {
            Some(var) => Ok(var.clone()),
            None => self.value(state).to_z3(context),
        }
    }

    fn choice_expectation<'ctx>(
        &self,
        context: &'ctx Context,
        vars: &HashMap<StateId, Real<'ctx>>,
        choice: &crate::model::state_graph::Choice,
    ) -> Result<Real<'ctx>> {
        let mut terms = vec![choice.goal_probability().to_z3(context)?];
        for (successor, probability) in choice.non_goal_successors() {
            let term = self.successor_term(context, vars, successor)?;
            terms.push(Real::mul(context, &[&probability.to_z3(context)?, &term]));
        }
        let refs: Vec<&Real> = terms.iter().collect();
        Ok(Real::add(context, &refs))
    }

    fn solve_equation_system(
        &self,
        context: &Context,
        states: &BTreeSet<StateId>,
    ) -> Result<Option<HashMap<StateId, Probability>>> {
        let solver = Solver::new(context);
        let vars = self.make_vars(context, states);
        for (&state, var) in &vars {
            solver.assert(&var.ge(&Int::from_i64(context, 0).to_real()));
            if self.graph.is_goal(state)? {
                solver.assert(&var._eq(&Int::from_i64(context, 1).to_real()));
                continue;
            }
            let behavior = self.graph.choices(state)?;
            match behavior.choices.first() {
                None => solver.assert(&var._eq(&Int::from_i64(context, 0).to_real())),
                Some(choice) => {
                    let expectation = self.choice_expectation(context, &vars, choice)?;
                    solver.assert(&var._eq(&expectation));
                }
            }
        }
        match solver.check() {
            SatResult::Unsat => Ok(None),
            SatResult::Unknown => Err(Pric3Error::OracleUnknown),
            SatResult::Sat => {
                let model = solver
                    .get_model()
                    .ok_or_else(|| Pric3Error::MissingModelValue("oracle system".into()))?;
                Ok(Some(self.read_solution(&model, &vars)?))
            }
        }
    }

    fn solve_linear_program(
        &self,
        context: &Context,
        states: &BTreeSet<StateId>,
    ) -> Result<Option<HashMap<StateId, Probability>>> {
        let optimize = Optimize::new(context);
        let vars = self.make_vars(context, states);
        let mut objective = vec![];
        for (&state, var) in &vars {
            optimize.assert(&var.ge(&Int::from_i64(context, 0).to_real()));
            optimize.assert(&var.le(&Int::from_i64(context, 1).to_real()));
            objective.push(var.clone());
            if self.graph.is_goal(state)? {
                optimize.assert(&var._eq(&Int::from_i64(context, 1).to_real()));
                continue;
            }
            // Max-reachability: the value dominates every enabled choice,
            // and minimization pins it at the least fixed point.
            for choice in &self.graph.choices(state)?.choices {
                let expectation = self.choice_expectation(context, &vars, choice)?;
                optimize.assert(&var.ge(&expectation));
            }
        }
        let refs: Vec<&Real> = objective.iter().collect();
        optimize.minimize(&Real::add(context, &refs));
        match optimize.check(&[]) {
            SatResult::Unsat => Ok(None),
            SatResult::Unknown => Err(Pric3Error::OracleUnknown),
            SatResult::Sat => {
                let model = optimize
                    .get_model()
                    .ok_or_else(|| Pric3Error::MissingModelValue("oracle program".into()))?;
                Ok(Some(self.read_solution(&model, &vars)?))
            }
        }
    }

    fn make_vars<'ctx>(
        &self,
        context: &'ctx Context,
        states: &BTreeSet<StateId>,
    ) -> HashMap<StateId, Real<'ctx>> {
        states
            .iter()
            .map(|&state| (state, Real::new_const(context, format!("x_{}", state.0))))
            .collect()
    }

    fn read_solution<'ctx>(
        &self,
        model: &z3::Model<'ctx>,
        vars: &HashMap<StateId, Real<'ctx>>,
    ) -> Result<HashMap<StateId, Probability>> {
        let mut solution = HashMap::new();
        for (&state, var) in vars {
            let (numer, denom) = model
                .eval(var, true)
                .and_then(|v| v.as_real())
                .ok_or_else(|| Pric3Error::MissingModelValue(format!("x_{}", state.0)))?;
            solution.insert(state, Probability::from_model_real(numer, denom)?);
        }
        Ok(solution)
    }

    /// Fixpoint iteration in floating point, used by the numeric
    /// strategies. States outside `states` contribute their current
    /// estimates as constants.
    fn solve_numeric(&self, states: &[StateId], iterations: usize) -> Result<HashMap<StateId, f64>> {
        let mut current: HashMap<StateId, f64> =
            states.iter().map(|&s| (s, 0.0)).collect();
        for _ in 0..iterations {
            let mut next = HashMap::new();
            for &state in states {
                let value = if self.graph.is_goal(state)? {
                    1.0
                } else {
                    let mut best = 0.0f64;
                    for choice in &self.graph.choices(state)?.choices {
                        let mut acc = choice.goal_probability().to_f64();
                        for (successor, probability) in choice.non_goal_successors() {
                            let succ_value = current
                                .get(&successor)
                                .copied()
                                .unwrap_or_else(|| self.value(successor).to_f64());
                            acc += probability.to_f64() * succ_value;
                        }
                        best = best.max(acc);
                    }
                    best
                };
                next.insert(state, value);
            }
            if states
                .iter()
                .all(|s| (next[s] - current[s]).abs() < 1e-12)
            {
                current = next;
                break;
            }
            current = next;
        }
        Ok(current)
    }

    /// Writes the current estimates to a JSON snapshot loadable by the
    /// file strategy.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut values = self.file_values.clone();
        for (&state, value) in &self.values {
            values.insert(self.graph.valuation_key(state), value.clone());
        }
        let snapshot = OracleSnapshot {
            default: self.default_value.clone(),
            values,
        };
        fs::write(path, serde_json::to_string_pretty(&snapshot)?)?;
        Ok(())
    }
}
