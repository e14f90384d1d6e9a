//! Generalizing a single discharged obligation into an interval fact.
//!
//! After `(s, delta)` proves relatively inductive, each integer variable
//! is tried in turn: keep every other variable pinned to its value in `s`
//! and look for a bound that holds on the whole interval from the
//! variable's current value up to its upper bound. The cheapest win is the
//! constant `delta` itself; failing that, a polynomial through probe
//! points is fitted, repaired with counterexamples to generalization, and
//! as a last resort the interval is bisected into linear spline pieces.
//! Every returned fact has passed its own relative-inductiveness check, so
//! callers can install them directly.

pub mod interpolate;
pub mod same_kind;

use std::rc::Rc;

use log::{debug, trace};
use num_bigint::BigInt;
use num_rational::BigRational;
use z3::{
    ast::{Bool, Real},
    Context, SatResult, Solver,
};

use crate::{
    error::{Pric3Error, Result},
    generalize::{interpolate::Interpolator, same_kind::SameKindCache},
    model::{state_graph::StateGraph, Value, VarKind},
    probability::{Probability, StateId},
    smt::frames::{FrameSolvers, RelInd},
    GeneralizationMethod,
};

/// An interval fact verified relatively inductive against its frame.
pub struct GeneralizedFact<'ctx> {
    pub region: Bool<'ctx>,
    pub bound: Real<'ctx>,
}

pub struct Generalizer<'ctx> {
    context: &'ctx Context,
    graph: Rc<StateGraph>,
    cache: SameKindCache,
    interpolator: Interpolator,
    method: GeneralizationMethod,
    max_ctgs: usize,
    split_limit: usize,
    use_same_kind: bool,
    int_vars: Vec<usize>,
    pub attempts: usize,
    pub generalized_facts: usize,
}

impl<'ctx> Generalizer<'ctx> {
    pub fn new(
        context: &'ctx Context,
        graph: Rc<StateGraph>,
        method: GeneralizationMethod,
        max_ctgs: usize,
        split_limit: usize,
        use_same_kind: bool,
    ) -> Self {
        let int_vars = graph
            .program()
            .variables
            .iter()
            .enumerate()
            .filter(|(_, var)| matches!(var.kind, VarKind::Int { .. }))
            .map(|(idx, _)| idx)
            .collect();
        Generalizer {
            context,
            graph,
            cache: SameKindCache::default(),
            interpolator: Interpolator,
            method,
            max_ctgs,
            split_limit,
            use_same_kind,
            int_vars,
            attempts: 0,
            generalized_facts: 0,
        }
    }

    /// Every state the search touches feeds the similarity cache.
    pub fn consider_state(&mut self, state: StateId) {
        self.cache.consider(&self.graph, state, &self.int_vars);
    }

    /// Forgets the similarity cache when the search starts over; entries
    /// from the previous run would bias which variables get attempted.
    pub fn reset(&mut self) {
        self.cache.clear();
    }

    pub fn generalize(
        &mut self,
        frames: &FrameSolvers<'ctx>,
        frame: usize,
        state: StateId,
        delta: &Probability,
    ) -> Result<Vec<GeneralizedFact<'ctx>>> {
        // A bound of 1 is trivially true everywhere, nothing to gain.
        if delta.is_one() {
            return Ok(vec![]);
        }
        let valuation = self.graph.valuation(state);
        let mut facts = vec![];
        for var_index in self.int_vars.clone() {
            if self.use_same_kind && !self.cache.has_other_value(&self.graph, state, var_index) {
                continue;
            }
            let VarKind::Int { upper, .. } = self.graph.program().variables[var_index].kind else {
                continue;
            };
            let Some(start) = valuation[var_index].as_int() else {
                continue;
            };
            if start >= upper {
                continue;
            }
            self.attempts += 1;
            if let Some(fact) =
                self.generalize_variable(frames, frame, &valuation, var_index, start, upper, delta)?
            {
                self.generalized_facts += fact.len();
                facts.extend(fact);
            }
        }
        Ok(facts)
    }

    #[allow(clippy::too_many_arguments)]
    fn generalize_variable(
        &self,
        frames: &FrameSolvers<'ctx>,
        frame: usize,
        valuation: &[Value],
        var_index: usize,
        start: i64,
        upper: i64,
        delta: &Probability,
    ) -> Result<Option<Vec<GeneralizedFact<'ctx>>>> {
        let region = self.interval_region(frames, valuation, var_index, start, upper)?;

        // The constant bound over the whole interval is the cheapest
        // candidate, and fairly often enough.
        let constant = delta.to_z3(self.context)?;
        if let RelInd::Inductive = frames.is_relative_inductive(frame, &region, &constant)? {
            debug!(
                "constant generalization over {} in [{start}, {upper}]",
                self.var_name(var_index)
            );
            return Ok(Some(vec![GeneralizedFact {
                region,
                bound: constant,
            }]));
        }

        let Some(end_delta) = self.probe(frames, frame, valuation, var_index, upper)? else {
            return Ok(None);
        };
        let mut points = vec![
            (big(start), delta.as_rational().clone()),
            (big(upper), end_delta.into_rational()),
        ];

        match self.method {
            GeneralizationMethod::Linear => {
                self.fit_linear(frames, frame, valuation, var_index, start, upper, points)
            }
            GeneralizationMethod::Polynomial | GeneralizationMethod::Hybrid => {
                // An interior same-kind state contributes a probe point.
                if let Some(extra) = self.interior_probe(frames, frame, valuation, var_index, start, upper)? {
                    points.push(extra);
                }
                let fitted = self.fit_polynomial(
                    frames, frame, valuation, var_index, start, upper, points,
                )?;
                if fitted.is_some() || self.method == GeneralizationMethod::Polynomial {
                    return Ok(fitted);
                }
                self.fit_splines(
                    frames,
                    frame,
                    valuation,
                    var_index,
                    start,
                    upper,
                    self.split_limit,
                )
            }
        }
    }

    /// Largest expectation the frame admits at one point of the interval.
    fn probe(
        &self,
        frames: &FrameSolvers<'ctx>,
        frame: usize,
        valuation: &[Value],
        var_index: usize,
        at: i64,
    ) -> Result<Option<Probability>> {
        let point = self.interval_region(frames, valuation, var_index, at, at)?;
        frames.highest_phi(frame, &point)
    }

    fn interior_probe(
        &self,
        frames: &FrameSolvers<'ctx>,
        frame: usize,
        valuation: &[Value],
        var_index: usize,
        start: i64,
        upper: i64,
    ) -> Result<Option<(BigRational, BigRational)>> {
        if !self.use_same_kind {
            return Ok(None);
        }
        let state = match self.graph.lookup(valuation) {
            Some(state) => state,
            None => return Ok(None),
        };
        let Some(other) = self.cache.last(&self.graph, state, var_index) else {
            return Ok(None);
        };
        let Some(value) = self.graph.var_value(other, var_index).as_int() else {
            return Ok(None);
        };
        // Only values strictly inside the interval add information.
        if value <= start || value >= upper {
            return Ok(None);
        }
        match self.probe(frames, frame, valuation, var_index, value)? {
            Some(bound) => Ok(Some((big(value), bound.into_rational()))),
            None => Ok(None),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn fit_linear(
        &self,
        frames: &FrameSolvers<'ctx>,
        frame: usize,
        valuation: &[Value],
        var_index: usize,
        start: i64,
        mut upper: i64,
        mut points: Vec<(BigRational, BigRational)>,
    ) -> Result<Option<Vec<GeneralizedFact<'ctx>>>> {
        // Shrink the interval towards the obligation on every
        // counterexample, giving up after the round budget.
        for _ in 0..=self.max_ctgs {
            let line = self.interpolator.interpolate(&points)?;
            if !self.in_unit_range(&line, frame, start, upper)? {
                return Ok(None);
            }
            let region = self.interval_region(frames, valuation, var_index, start, upper)?;
            let bound = line.to_z3(self.context, &frames.env().int_var_as_real(var_index)?)?;
            match frames.is_relative_inductive(frame, &region, &bound)? {
                RelInd::Inductive => {
                    debug!(
                        "linear generalization over {} in [{start}, {upper}]",
                        self.var_name(var_index)
                    );
                    return Ok(Some(vec![GeneralizedFact { region, bound }]));
                }
                RelInd::Counterexample(cex) => {
                    let Some(at) = cex.valuation[var_index].as_int() else {
                        return Ok(None);
                    };
                    if at <= start || at >= upper {
                        return Ok(None);
                    }
                    let Some(end_delta) = self.probe(frames, frame, valuation, var_index, at)?
                    else {
                        return Ok(None);
                    };
                    trace!("narrowing linear generalization to [{start}, {at}]");
                    upper = at;
                    points = vec![
                        (big(start), points[0].1.clone()),
                        (big(at), end_delta.into_rational()),
                    ];
                }
            }
        }
        Ok(None)
    }

    #[allow(clippy::too_many_arguments)]
    fn fit_polynomial(
        &self,
        frames: &FrameSolvers<'ctx>,
        frame: usize,
        valuation: &[Value],
        var_index: usize,
        start: i64,
        upper: i64,
        mut points: Vec<(BigRational, BigRational)>,
    ) -> Result<Option<Vec<GeneralizedFact<'ctx>>>> {
        let region = self.interval_region(frames, valuation, var_index, start, upper)?;
        for _ in 0..=self.max_ctgs {
            let poly = self.interpolator.interpolate(&points)?;
            if !self.in_unit_range(&poly, frame, start, upper)? {
                return Ok(None);
            }
            let bound = poly.to_z3(self.context, &frames.env().int_var_as_real(var_index)?)?;
            match frames.is_relative_inductive(frame, &region, &bound)? {
                RelInd::Inductive => {
                    debug!(
                        "degree-{} generalization over {} in [{start}, {upper}]",
                        poly.degree(),
                        self.var_name(var_index)
                    );
                    return Ok(Some(vec![GeneralizedFact { region, bound }]));
                }
                RelInd::Counterexample(cex) => {
                    let Some(at) = cex.valuation[var_index].as_int() else {
                        return Ok(None);
                    };
                    if points.iter().any(|(x, _)| *x == big(at)) {
                        // The frame's ceiling at this point is what the
                        // polynomial already says; a refit cannot help.
                        return Ok(None);
                    }
                    let Some(ceiling) = self.probe(frames, frame, valuation, var_index, at)?
                    else {
                        return Ok(None);
                    };
                    trace!("counterexample to generalization at {} = {at}", self.var_name(var_index));
                    points.push((big(at), ceiling.into_rational()));
                }
            }
        }
        Ok(None)
    }

    /// Piecewise-linear fallback: bisect the interval and fit each half,
    /// recursing while the split budget lasts. Pieces that fail are
    /// dropped; whatever verified survives.
    #[allow(clippy::too_many_arguments)]
    fn fit_splines(
        &self,
        frames: &FrameSolvers<'ctx>,
        frame: usize,
        valuation: &[Value],
        var_index: usize,
        lo: i64,
        hi: i64,
        budget: usize,
    ) -> Result<Option<Vec<GeneralizedFact<'ctx>>>> {
        if budget == 0 || hi - lo < 2 {
            return Ok(None);
        }
        let mid = lo + (hi - lo) / 2;
        let mut pieces = vec![];
        for (piece_lo, piece_hi) in [(lo, mid), (mid, hi)] {
            let Some(lo_delta) = self.probe(frames, frame, valuation, var_index, piece_lo)? else {
                continue;
            };
            let Some(hi_delta) = self.probe(frames, frame, valuation, var_index, piece_hi)? else {
                continue;
            };
            let points = vec![
                (big(piece_lo), lo_delta.into_rational()),
                (big(piece_hi), hi_delta.into_rational()),
            ];
            let line = self.interpolator.interpolate(&points)?;
            if !self.in_unit_range(&line, frame, piece_lo, piece_hi)? {
                continue;
            }
            let region =
                self.interval_region(frames, valuation, var_index, piece_lo, piece_hi)?;
            let bound = line.to_z3(self.context, &frames.env().int_var_as_real(var_index)?)?;
            match frames.is_relative_inductive(frame, &region, &bound)? {
                RelInd::Inductive => {
                    debug!(
                        "spline piece over {} in [{piece_lo}, {piece_hi}]",
                        self.var_name(var_index)
                    );
                    pieces.push(GeneralizedFact { region, bound });
                }
                RelInd::Counterexample(_) => {
                    if let Some(sub) = self.fit_splines(
                        frames,
                        frame,
                        valuation,
                        var_index,
                        piece_lo,
                        piece_hi,
                        budget - 1,
                    )? {
                        pieces.extend(sub);
                    }
                }
            }
        }
        if pieces.is_empty() {
            Ok(None)
        } else {
            Ok(Some(pieces))
        }
    }

    /// Candidate bounds must stay within [0, 1] over the interval to be
    /// probabilities at all.
    fn in_unit_range(
        &self,
        poly: &interpolate::Polynomial,
        frame: usize,
        lo: i64,
        hi: i64,
    ) -> Result<bool> {
        let ctx = self.context;
        let var = Real::new_const(ctx, "range_check_x");
        let term = poly.to_z3(ctx, &var)?;
        let zero = z3::ast::Int::from_i64(ctx, 0).to_real();
        let one = z3::ast::Int::from_i64(ctx, 1).to_real();
        let solver = Solver::new(ctx);
        solver.assert(&var.ge(&z3::ast::Int::from_i64(ctx, lo).to_real()));
        solver.assert(&var.le(&z3::ast::Int::from_i64(ctx, hi).to_real()));
        solver.assert(&Bool::or(ctx, &[&term.lt(&zero), &term.gt(&one)]));
        match solver.check() {
            SatResult::Unsat => Ok(true),
            SatResult::Sat => Ok(false),
            SatResult::Unknown => Err(Pric3Error::SolverUnknown { frame }),
        }
    }

    /// Region formula: every other variable pinned to the obligation's
    /// valuation, the chosen variable ranging over [lo, hi].
    fn interval_region(
        &self,
        frames: &FrameSolvers<'ctx>,
        valuation: &[Value],
        var_index: usize,
        lo: i64,
        hi: i64,
    ) -> Result<Bool<'ctx>> {
        let env = frames.env();
        let mut parts = vec![];
        for (idx, value) in valuation.iter().enumerate() {
            if idx == var_index {
                continue;
            }
            parts.push(env.var_eq(idx, *value)?);
        }
        parts.push(env.int_var_ge(var_index, lo));
        parts.push(env.int_var_le(var_index, hi));
        let refs: Vec<&Bool> = parts.iter().collect();
        Ok(Bool::and(self.context, &refs))
    }

    fn var_name(&self, var_index: usize) -> &str {
        &self.graph.program().variables[var_index].name
    }
}

fn big(value: i64) -> BigRational {
    BigRational::from_integer(BigInt::from(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Assignment, Command, Expr, ModelType, Program, UpdateBranch, Variable};
    use crate::smt::env::SmtEnv;
    use z3::Config;

    // A counter walking 0 -> 1 -> 2 -> 3 -> 4 and stopping there; the
    // variable ranges one past the last reachable value.
    fn counter_program(goal_at: i64) -> Program {
        Program {
            name: "counter".into(),
            model_type: ModelType::Dtmc,
            variables: vec![Variable {
                name: "c".into(),
                kind: VarKind::Int { lower: 0, upper: 5 },
                initial: Value::Int(0),
            }],
            commands: vec![Command {
                name: None,
                guard: Expr::Lt(Box::new(Expr::var("c")), Box::new(Expr::Int(4))),
                updates: vec![UpdateBranch {
                    probability: Probability::one(),
                    assignments: vec![Assignment {
                        variable: "c".into(),
                        value: Expr::Add(Box::new(Expr::var("c")), Box::new(Expr::Int(1))),
                    }],
                }],
            }],
            goal: Expr::Eq(Box::new(Expr::var("c")), Box::new(Expr::Int(goal_at))),
        }
    }

    // Frame 1 caps the expectation at 1/2 from c = 0, 3/4 from c = 1,
    // 1/4 from c = 2 and 0 from c = 3.
    fn frames_with_ceilings(context: &Context, program: Program) -> FrameSolvers<'_> {
        let env = SmtEnv::new(context, program, false).unwrap();
        let mut frames = FrameSolvers::new(env).unwrap();
        for (value, num, den) in [(1, 1, 2), (2, 3, 4), (3, 1, 4), (4, 0, 1)] {
            let (region, bound) = frames
                .state_fact(&[Value::Int(value)], &Probability::from_ratio(num, den))
                .unwrap();
            frames.insert(1, &region, &bound, true);
        }
        frames
    }

    fn covers(context: &Context, frames: &FrameSolvers, region: &Bool, value: i64) -> bool {
        let solver = Solver::new(context);
        solver.assert(region);
        solver.assert(&frames.env().var_eq(0, Value::Int(value)).unwrap());
        solver.check() == SatResult::Sat
    }

    fn inductive(frames: &FrameSolvers, frame: usize, fact: &GeneralizedFact) -> bool {
        matches!(
            frames
                .is_relative_inductive(frame, &fact.region, &fact.bound)
                .unwrap(),
            RelInd::Inductive
        )
    }

    #[test]
    fn constant_bound_covers_the_whole_interval() {
        let config = Config::new();
        let context = Context::new(&config);
        // The goal is never reached, so frame 0 is zero everywhere.
        let program = counter_program(9);
        let graph = StateGraph::new(program.clone());
        let env = SmtEnv::new(&context, program, false).unwrap();
        let frames = FrameSolvers::new(env).unwrap();
        let mut generalizer = Generalizer::new(
            &context,
            Rc::clone(&graph),
            GeneralizationMethod::Linear,
            0,
            1,
            false,
        );

        let facts = generalizer
            .generalize(
                &frames,
                0,
                graph.initial_state(),
                &Probability::from_ratio(1, 4),
            )
            .unwrap();
        assert_eq!(facts.len(), 1);
        assert!(covers(&context, &frames, &facts[0].region, 0));
        assert!(covers(&context, &frames, &facts[0].region, 5));
        assert!(inductive(&frames, 0, &facts[0]));
    }

    #[test]
    fn linear_fit_narrows_to_a_covering_interval() {
        let config = Config::new();
        let context = Context::new(&config);
        let program = counter_program(5);
        let graph = StateGraph::new(program.clone());
        let frames = frames_with_ceilings(&context, program);
        let mut generalizer = Generalizer::new(
            &context,
            Rc::clone(&graph),
            GeneralizationMethod::Linear,
            1,
            1,
            false,
        );

        let facts = generalizer
            .generalize(
                &frames,
                1,
                graph.initial_state(),
                &Probability::from_ratio(1, 2),
            )
            .unwrap();
        assert_eq!(facts.len(), 1);
        assert!(covers(&context, &frames, &facts[0].region, 0));
        assert!(covers(&context, &frames, &facts[0].region, 1));
        assert!(!covers(&context, &frames, &facts[0].region, 2));
        assert!(inductive(&frames, 1, &facts[0]));
    }

    #[test]
    fn polynomial_fit_rejects_bounds_leaving_the_unit_interval() {
        let config = Config::new();
        let context = Context::new(&config);
        let program = counter_program(5);
        let graph = StateGraph::new(program.clone());
        let frames = frames_with_ceilings(&context, program);
        let mut generalizer = Generalizer::new(
            &context,
            Rc::clone(&graph),
            GeneralizationMethod::Polynomial,
            1,
            1,
            false,
        );

        // The parabola through the sampled ceilings exceeds 1 inside the
        // interval, so no fact comes back.
        let facts = generalizer
            .generalize(
                &frames,
                1,
                graph.initial_state(),
                &Probability::from_ratio(1, 2),
            )
            .unwrap();
        assert!(facts.is_empty());
    }

    #[test]
    fn spline_pieces_can_exclude_the_generalized_state() {
        let config = Config::new();
        let context = Context::new(&config);
        let program = counter_program(5);
        let graph = StateGraph::new(program.clone());
        let frames = frames_with_ceilings(&context, program);
        let mut generalizer = Generalizer::new(
            &context,
            Rc::clone(&graph),
            GeneralizationMethod::Hybrid,
            0,
            1,
            false,
        );

        // Only the piece over [2, 5] verifies; the half containing the
        // obligation's own state is dropped. Callers must keep the point
        // fact for c = 0 themselves.
        let facts = generalizer
            .generalize(
                &frames,
                1,
                graph.initial_state(),
                &Probability::from_ratio(1, 2),
            )
            .unwrap();
        assert_eq!(facts.len(), 1);
        assert!(!covers(&context, &frames, &facts[0].region, 0));
        assert!(covers(&context, &frames, &facts[0].region, 2));
        assert!(covers(&context, &frames, &facts[0].region, 5));
        assert!(inductive(&frames, 1, &facts[0]));
    }
}
