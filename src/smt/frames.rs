//! One incremental solver per frame, plus the bookkeeping the search
//! needs: the learned facts of each frame (for propagation and the
//! fixed-point test) and an optimization query for the largest expectation
//! a frame still admits on a region.

use log::{debug, trace};
use z3::{
    ast::{Bool, Real},
    Optimize, SatResult, Solver,
};

use crate::{
    error::{Pric3Error, Result},
    model::{Value, VarKind},
    probability::Probability,
    smt::env::{IntWitness, SmtEnv},
};

// Hard stop for the integer-witness refinement loop.
const MAX_WITNESS_ROUNDS: usize = 1000;

/// A learned upper bound on the frame values of a region of states.
/// `wrapped` is the assertion actually sitting in the solvers.
#[derive(Clone)]
pub struct FrameFact<'ctx> {
    pub region: Bool<'ctx>,
    pub bound: Real<'ctx>,
    wrapped: Bool<'ctx>,
}

impl PartialEq for FrameFact<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.wrapped == other.wrapped
    }
}

/// Outcome of a relative-inductiveness check.
pub enum RelInd {
    Inductive,
    Counterexample(Counterexample),
}

/// A state of the queried region whose expectation exceeds the candidate
/// bound, together with the command achieving it.
pub struct Counterexample {
    pub command_index: usize,
    pub valuation: Vec<Value>,
}

pub struct FrameSolvers<'ctx> {
    env: SmtEnv<'ctx>,
    solvers: Vec<Solver<'ctx>>,
    facts: Vec<Vec<FrameFact<'ctx>>>,
    base: Vec<Bool<'ctx>>,
    frame_zero: Bool<'ctx>,
}

impl<'ctx> FrameSolvers<'ctx> {
    pub fn new(env: SmtEnv<'ctx>) -> Result<Self> {
        let base = env.base_formulas()?;
        let frame_zero = env.frame_zero_formula();
        let mut frames = FrameSolvers {
            env,
            solvers: vec![],
            facts: vec![],
            base,
            frame_zero,
        };
        frames.push_solver();
        frames.push_solver();
        Ok(frames)
    }

    fn push_solver(&mut self) {
        let solver = Solver::new(self.env.context());
        for formula in &self.base {
            solver.assert(formula);
        }
        if self.solvers.is_empty() {
            solver.assert(&self.frame_zero);
        }
        self.solvers.push(solver);
        self.facts.push(vec![]);
    }

    pub fn env(&self) -> &SmtEnv<'ctx> {
        &self.env
    }

    /// Index of the outermost frame.
    pub fn k(&self) -> usize {
        self.solvers.len() - 1
    }

    pub fn add_frame(&mut self) {
        debug!("adding frame {}", self.solvers.len());
        self.push_solver();
    }

    /// Drops every frame except the fixed innermost one and starts over
    /// with an unconstrained outer frame.
    pub fn reset(&mut self) {
        self.solvers.truncate(1);
        self.facts.truncate(1);
        self.push_solver();
    }

    pub fn facts(&self, frame: usize) -> &[FrameFact<'ctx>] {
        &self.facts[frame]
    }

    /// Two adjacent frames holding the same facts witness the fixed point.
    pub fn frames_equal(&self, frame: usize) -> bool {
        let (lo, hi) = (&self.facts[frame], &self.facts[frame + 1]);
        lo.len() == hi.len() && lo.iter().all(|fact| hi.contains(fact))
    }

    /// Makes a point fact: a single state bounded by a constant.
    pub fn state_fact(
        &self,
        valuation: &[Value],
        bound: &Probability,
    ) -> Result<(Bool<'ctx>, Real<'ctx>)> {
        Ok((
            self.env.state_args(valuation)?,
            bound.to_z3(self.env.context())?,
        ))
    }

    /// Adds `region -> Frame <= bound` to one frame. Region facts (more
    /// than a single state) are quantified per command so the bound only
    /// constrains successors actually reached under an enabled guard.
    pub fn insert(&mut self, frame: usize, region: &Bool<'ctx>, bound: &Real<'ctx>, point: bool) {
        let core = region.implies(&self.env.frame().le(bound));
        let wrapped = if point {
            self.env.forall(&core)
        } else {
            self.env.command_specific_forall(&core)
        };
        let fact = FrameFact {
            region: region.clone(),
            bound: bound.clone(),
            wrapped,
        };
        if self.facts[frame].contains(&fact) {
            return;
        }
        trace!("frame {frame} learns a new fact");
        self.solvers[frame].assert(&fact.wrapped);
        self.facts[frame].push(fact);
    }

    pub fn insert_fact(&mut self, frame: usize, fact: &FrameFact<'ctx>) {
        if self.facts[frame].contains(fact) {
            return;
        }
        self.solvers[frame].assert(&fact.wrapped);
        self.facts[frame].push(fact.clone());
    }

    /// Decides whether bounding `region` by `bound` is inductive relative
    /// to `frame`: unsatisfiable iff no state of the region can exceed the
    /// bound in one step, given the frame's facts about successors.
    ///
    /// Under the int-to-real relaxation a satisfying model may place an
    /// integer variable strictly between two integers; such models are cut
    /// away until an integer witness remains or the query turns
    /// unsatisfiable.
    pub fn is_relative_inductive(
        &self,
        frame: usize,
        region: &Bool<'ctx>,
        bound: &Real<'ctx>,
    ) -> Result<RelInd> {
        let solver = &self.solvers[frame];
        solver.push();
        solver.assert(region);
        solver.assert(&bound.lt(self.env.phi()));

        let mut rounds = 0;
        let outcome = loop {
            rounds += 1;
            if rounds > MAX_WITNESS_ROUNDS {
                solver.pop(1);
                return Err(Pric3Error::SolverUnknown { frame });
            }
            match solver.check() {
                SatResult::Unsat => break RelInd::Inductive,
                SatResult::Unknown => {
                    solver.pop(1);
                    return Err(Pric3Error::SolverUnknown { frame });
                }
                SatResult::Sat => {
                    let model = match solver.get_model() {
                        Some(model) => model,
                        None => {
                            solver.pop(1);
                            return Err(Pric3Error::MissingModelValue("frame query".into()));
                        }
                    };
                    if self.env.int_to_real() {
                        if let Some(cut) = self.fractional_cut(&model) {
                            match cut {
                                Ok(cut) => {
                                    solver.assert(&cut);
                                    continue;
                                }
                                Err(err) => {
                                    solver.pop(1);
                                    return Err(err);
                                }
                            }
                        }
                    }
                    let extracted = self
                        .env
                        .eval_chosen_command(&model)
                        .and_then(|command_index| {
                            Ok(Counterexample {
                                command_index,
                                valuation: self.env.valuation_from_model(&model)?,
                            })
                        });
                    match extracted {
                        Ok(cex) => break RelInd::Counterexample(cex),
                        Err(err) => {
                            solver.pop(1);
                            return Err(err);
                        }
                    }
                }
            }
        };
        solver.pop(1);
        Ok(outcome)
    }

    /// A clause excluding the first fractional integer value of the model,
    /// or `None` when the model is already integral.
    fn fractional_cut(&self, model: &z3::Model<'ctx>) -> Option<Result<Bool<'ctx>>> {
        let program = self.env.program();
        for (idx, var) in program.variables.iter().enumerate() {
            if !matches!(var.kind, VarKind::Int { .. }) {
                continue;
            }
            match self.env.eval_int_witness(model, idx) {
                Ok(IntWitness::Integral(_)) => {}
                Ok(IntWitness::Fractional { floor, ceil }) => {
                    let below = self.env.int_var_le(idx, floor);
                    let above = self.env.int_var_ge(idx, ceil);
                    return Some(Ok(Bool::or(self.env.context(), &[&below, &above])));
                }
                Err(err) => return Some(Err(err)),
            }
        }
        None
    }

    /// The largest expectation the frame still admits on a region, by an
    /// optimization query over the frame's assertions. `None` when the
    /// region itself is unsatisfiable.
    pub fn highest_phi(&self, frame: usize, region: &Bool<'ctx>) -> Result<Option<Probability>> {
        let optimize = Optimize::new(self.env.context());
        for formula in &self.base {
            optimize.assert(formula);
        }
        if frame == 0 {
            optimize.assert(&self.frame_zero);
        }
        for fact in &self.facts[frame] {
            optimize.assert(&fact.wrapped);
        }
        optimize.assert(region);
        optimize.maximize(self.env.phi());
        match optimize.check(&[]) {
            SatResult::Unsat => Ok(None),
            SatResult::Unknown => Err(Pric3Error::SolverUnknown { frame }),
            SatResult::Sat => {
                let model = optimize
                    .get_model()
                    .ok_or_else(|| Pric3Error::MissingModelValue("optimization query".into()))?;
                Ok(Some(self.env.eval_probability(&model, self.env.phi())?))
            }
        }
    }
}
