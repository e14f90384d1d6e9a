//! Splitting an obligation's bound over the successors of a state.
//!
//! When `(i, s, delta)` is not relatively inductive under command `c`, the
//! bound has to be distributed: each non-goal successor `t_j` gets its own
//! bound `delta_j` such that the expectation meets `delta` again. The split
//! follows the oracle's estimates proportionally where possible and falls
//! back to a deviation-minimizing optimization otherwise. Results are
//! cached per `(state, command, delta)` because the same obligation tends
//! to resurface across frames.

use std::{collections::HashMap, rc::Rc};

use log::trace;
use z3::{
    ast::{Ast, Bool, Int, Real},
    Context, Optimize, SatResult, Solver,
};

use crate::{
    error::{Pric3Error, Result},
    model::state_graph::StateGraph,
    obligations::{Obligation, SearchEpoch},
    oracle::Oracle,
    probability::{Probability, StateId},
};

#[derive(Clone, Debug)]
pub enum SplitOutcome {
    /// No distribution over the successors can justify the bound; the
    /// obligation is a hard dead end.
    Infeasible,
    /// Bounds for the non-goal successors.
    Split(Vec<(StateId, Probability)>),
}

pub struct StateProbabilityGenerator<'ctx> {
    context: &'ctx Context,
    graph: Rc<StateGraph>,
    cache: HashMap<(StateId, usize, Probability), SplitOutcome>,
    pub queries: usize,
    pub cache_hits: usize,
    pub proportional_hits: usize,
}

impl<'ctx> StateProbabilityGenerator<'ctx> {
    pub fn new(context: &'ctx Context, graph: Rc<StateGraph>) -> Self {
        StateProbabilityGenerator {
            context,
            graph,
            cache: HashMap::new(),
            queries: 0,
            cache_hits: 0,
            proportional_hits: 0,
        }
    }

    pub fn clear_cache(&mut self) {
        self.cache.clear();
    }

    pub fn split(
        &mut self,
        obligation: &Obligation,
        command_index: usize,
        epoch: &SearchEpoch,
        oracle: &Oracle,
    ) -> Result<SplitOutcome> {
        self.queries += 1;
        let key = (obligation.state, command_index, obligation.bound.clone());
        if let Some(outcome) = self.cache.get(&key) {
            self.cache_hits += 1;
            return Ok(outcome.clone());
        }
        let outcome = self.split_uncached(obligation, command_index, epoch, oracle)?;
        self.cache.insert(key, outcome.clone());
        Ok(outcome)
    }

    fn split_uncached(
        &mut self,
        obligation: &Obligation,
        command_index: usize,
        epoch: &SearchEpoch,
        oracle: &Oracle,
    ) -> Result<SplitOutcome> {
        let choice = self.graph.choice(obligation.state, command_index)?;
        let goal_mass = choice.goal_probability();
        let successors = choice.non_goal_successors();

        // The goal's contribution is fixed at 1, so it alone may already
        // exceed the bound.
        if obligation.bound < goal_mass {
            trace!("infeasible split: goal mass {goal_mass} exceeds {}", obligation.bound);
            return Ok(SplitOutcome::Infeasible);
        }
        if successors.is_empty() {
            // The expectation equals the goal mass, yet the bound was
            // violated. Nothing to distribute.
            return Ok(SplitOutcome::Infeasible);
        }

        let residual = &obligation.bound - &goal_mass;
        let total_mass = successors
            .iter()
            .fold(Probability::zero(), |acc, (_, p)| acc + p.clone());
        if residual >= total_mass {
            // Even the trivial bound 1 per successor satisfies the split.
            return Ok(SplitOutcome::Split(
                successors
                    .into_iter()
                    .map(|(state, _)| (state, Probability::one()))
                    .collect(),
            ));
        }

        let fixed: Vec<Option<Probability>> = successors
            .iter()
            .map(|(state, _)| {
                if obligation.history.contains(state) {
                    epoch.smallest_bound(*state).cloned()
                } else {
                    None
                }
            })
            .collect();

        if let [(state, probability)] = successors.as_slice() {
            let share = match &fixed[0] {
                // A successor on the current path keeps its recorded bound.
                Some(bound) => {
                    if &(bound.clone() * probability.clone()) > &residual {
                        return Ok(SplitOutcome::Infeasible);
                    }
                    bound.clone()
                }
                None => (residual / probability.clone()).min(Probability::one()),
            };
            return Ok(SplitOutcome::Split(vec![(*state, share)]));
        }

        let estimates: Vec<Probability> = successors
            .iter()
            .map(|(state, _)| oracle.value(*state))
            .collect();
        if estimates.iter().all(|e| e.is_zero()) && fixed.iter().all(|f| f.is_none()) {
            // The oracle is silent, spread the residual evenly by mass.
            self.proportional_hits += 1;
            let share = residual / total_mass;
            return Ok(SplitOutcome::Split(
                successors.into_iter().map(|(state, _)| (state, share.clone())).collect(),
            ));
        }

        self.solve_split(&successors, &estimates, &fixed, &residual)
    }

    /// Constraints shared by the exact and the minimizing formulation.
    fn assert_split_shape(
        &self,
        sink: &dyn Fn(&Bool<'ctx>),
        vars: &[Real<'ctx>],
        successors: &[(StateId, Probability)],
        fixed: &[Option<Probability>],
        residual: &Probability,
    ) -> Result<()> {
        let ctx = self.context;
        let zero = Int::from_i64(ctx, 0).to_real();
        let one = Int::from_i64(ctx, 1).to_real();
        for (idx, var) in vars.iter().enumerate() {
            sink(&var.ge(&zero));
            sink(&var.le(&one));
            if let Some(bound) = &fixed[idx] {
                sink(&var._eq(&bound.to_z3(ctx)?));
            }
        }
        let weighted: Vec<Real> = successors
            .iter()
            .zip(vars)
            .map(|((_, p), var)| Ok(Real::mul(ctx, &[&p.to_z3(ctx)?, var])))
            .collect::<Result<_>>()?;
        let refs: Vec<&Real> = weighted.iter().collect();
        sink(&Real::add(ctx, &refs)._eq(&residual.to_z3(ctx)?));
        Ok(())
    }

    fn solve_split(
        &mut self,
        successors: &[(StateId, Probability)],
        estimates: &[Probability],
        fixed: &[Option<Probability>],
        residual: &Probability,
    ) -> Result<SplitOutcome> {
        let ctx = self.context;
        let vars: Vec<Real> = (0..successors.len())
            .map(|idx| Real::new_const(ctx, format!("delta_{idx}")))
            .collect();
        let estimate_total = estimates
            .iter()
            .fold(Probability::zero(), |acc, e| acc + e.clone());

        // Deviation of each bound from the oracle's proportions:
        // delta_i * sum(estimates) - estimate_i * sum(deltas).
        let var_refs: Vec<&Real> = vars.iter().collect();
        let var_total = Real::add(ctx, &var_refs);
        let deviations: Vec<Real> = estimates
            .iter()
            .zip(&vars)
            .map(|(estimate, var)| {
                Ok(Real::sub(
                    ctx,
                    &[
                        &Real::mul(ctx, &[var, &estimate_total.to_z3(ctx)?]),
                        &Real::mul(ctx, &[&estimate.to_z3(ctx)?, &var_total]),
                    ],
                ))
            })
            .collect::<Result<_>>()?;

        // Exact proportional system first.
        let solver = Solver::new(ctx);
        self.assert_split_shape(
            &|formula| solver.assert(formula),
            &vars,
            successors,
            fixed,
            residual,
        )?;
        let zero = Int::from_i64(ctx, 0).to_real();
        for deviation in &deviations {
            solver.assert(&deviation._eq(&zero));
        }
        match solver.check() {
            SatResult::Sat => {
                self.proportional_hits += 1;
                let model = solver
                    .get_model()
                    .ok_or_else(|| Pric3Error::MissingModelValue("split system".into()))?;
                return self.read_split(&model, successors, &vars);
            }
            SatResult::Unknown => return Err(Pric3Error::SplitUnknown),
            SatResult::Unsat => {}
        }

        // The proportions cannot be met exactly (bounds clip at 1, or a
        // path state is pinned); minimize the total deviation instead.
        let optimize = Optimize::new(ctx);
        self.assert_split_shape(
            &|formula| optimize.assert(formula),
            &vars,
            successors,
            fixed,
            residual,
        )?;
        let magnitudes: Vec<Real> = deviations
            .iter()
            .map(|deviation| {
                let negated = Real::sub(ctx, &[&zero, deviation]);
                deviation.ge(&zero).ite(deviation, &negated)
            })
            .collect();
        let magnitude_refs: Vec<&Real> = magnitudes.iter().collect();
        optimize.minimize(&Real::add(ctx, &magnitude_refs));
        match optimize.check(&[]) {
            SatResult::Unsat => Ok(SplitOutcome::Infeasible),
            SatResult::Unknown => Err(Pric3Error::SplitUnknown),
            SatResult::Sat => {
                let model = optimize
                    .get_model()
                    .ok_or_else(|| Pric3Error::MissingModelValue("split optimization".into()))?;
                self.read_split(&model, successors, &vars)
            }
        }
    }

    fn read_split(
        &self,
        model: &z3::Model<'ctx>,
        successors: &[(StateId, Probability)],
        vars: &[Real<'ctx>],
    ) -> Result<SplitOutcome> {
        let mut split = vec![];
        for ((state, _), var) in successors.iter().zip(vars) {
            let (numer, denom) = model
                .eval(var, true)
                .and_then(|v| v.as_real())
                .ok_or_else(|| Pric3Error::MissingModelValue(format!("bound for {state}")))?;
            split.push((*state, Probability::from_model_real(numer, denom)?));
        }
        Ok(SplitOutcome::Split(split))
    }
}
