//! The main proof loop.
//!
//! Frames `F_0 .. F_k` over-approximate the probability of reaching the
//! goal within `0 .. k` steps. Strengthening discharges obligations
//! against the frames until the outermost one bounds the initial state by
//! the threshold; propagation pushes learned facts outwards and detects
//! the fixed point that proves the property. When strengthening hits a
//! dead end, either an exact finite sub-system already refutes the
//! property, or the oracle gets refined and the search starts over with
//! better estimates.

use std::{
    collections::BTreeSet,
    fmt,
    rc::Rc,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use log::{debug, info, warn};
use z3::{
    ast::{Ast, Real},
    Context, SatResult, Solver,
};

use crate::{
    error::{Pric3Error, Result},
    generalize::Generalizer,
    model::{state_graph::StateGraph, ModelType, Program},
    obligations::{Obligation, ObligationQueue, SearchEpoch},
    oracle::Oracle,
    probability::{Probability, StateId},
    probability_solver::{SplitOutcome, StateProbabilityGenerator},
    smt::{
        env::SmtEnv,
        frames::{FrameSolvers, RelInd},
    },
    statistics::{Statistics, Stopwatch},
    Pric3Options,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pric3Outcome {
    /// The reachability probability is bounded by the threshold;
    /// `inductive_frame` holds the inductive invariant.
    Proved { inductive_frame: usize },
    /// The probability provably exceeds the threshold.
    Refuted,
    Cancelled,
}

impl fmt::Display for Pric3Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pric3Outcome::Proved { inductive_frame } => {
                write!(f, "proved (inductive frame {inductive_frame})")
            }
            Pric3Outcome::Refuted => write!(f, "refuted"),
            Pric3Outcome::Cancelled => write!(f, "cancelled"),
        }
    }
}

enum Strengthened {
    Done,
    DeadEnd,
    Cancelled,
}

pub struct Pric3<'ctx> {
    context: &'ctx Context,
    graph: Rc<StateGraph>,
    frames: FrameSolvers<'ctx>,
    queue: Box<dyn ObligationQueue>,
    epoch: SearchEpoch,
    oracle: Oracle,
    splitter: StateProbabilityGenerator<'ctx>,
    generalizer: Option<Generalizer<'ctx>>,
    lambda: Probability,
    /// Everything the search ever visited; refutation checks and oracle
    /// refinement both work on this set.
    touched: BTreeSet<StateId>,
    check_inductiveness: bool,
    propagation_enabled: bool,
    cancel: Arc<AtomicBool>,
    stats: Statistics,
}

impl<'ctx> Pric3<'ctx> {
    pub fn new(context: &'ctx Context, program: Program, options: &Pric3Options) -> Result<Self> {
        let lambda = options.lambda.clone();
        if lambda.is_negative() || lambda > Probability::one() {
            return Err(Pric3Error::InvalidThreshold(lambda.to_string()));
        }
        program.validate()?;
        let graph = StateGraph::new(program.clone());
        let env = SmtEnv::new(context, program, options.int_to_real)?;
        let frames = FrameSolvers::new(env)?;
        let oracle = Oracle::new(
            context,
            Rc::clone(&graph),
            &options.oracle_strategy()?,
            options.default_oracle_value.clone(),
        )?;
        let splitter = StateProbabilityGenerator::new(context, Rc::clone(&graph));
        let generalizer = options.generalize.map(|method| {
            Generalizer::new(
                context,
                Rc::clone(&graph),
                method,
                options.max_ctgs,
                options.split_limit,
                !options.ignore_same_kind,
            )
        });
        Ok(Pric3 {
            context,
            queue: options.build_queue(),
            epoch: SearchEpoch::default(),
            oracle,
            splitter,
            generalizer,
            lambda,
            touched: BTreeSet::new(),
            check_inductiveness: options.check_inductiveness,
            propagation_enabled: !options.no_propagate,
            cancel: Arc::new(AtomicBool::new(false)),
            stats: Statistics::default(),
            graph,
            frames,
        })
    }

    /// Flag to request cancellation from another thread; the search stops
    /// at the next obligation boundary.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn statistics(&self) -> &Statistics {
        &self.stats
    }

    pub fn oracle(&self) -> &Oracle {
        &self.oracle
    }

    /// Decides whether the probability of reaching the goal from the
    /// initial state is at most the threshold.
    pub fn run(&mut self) -> Result<Pric3Outcome> {
        let watch = Stopwatch::start();
        let outcome = self.run_inner()?;
        Statistics::record(&mut self.stats.total_time, watch);
        self.stats.outcome = Some(outcome.to_string());
        self.stats.frames = self.frames.k() + 1;
        self.stats.visited_states = self.touched.len();
        self.stats.oracle_refinements = self.oracle.refinements;
        self.stats.probability_queries = self.splitter.queries;
        self.stats.probability_cache_hits = self.splitter.cache_hits;
        self.stats.proportional_splits = self.splitter.proportional_hits;
        if let Some(generalizer) = &self.generalizer {
            self.stats.generalization_attempts = generalizer.attempts;
            self.stats.generalized_facts = generalizer.generalized_facts;
        }
        Ok(outcome)
    }

    fn run_inner(&mut self) -> Result<Pric3Outcome> {
        if self.lambda.is_one() {
            info!("threshold 1 holds for every model");
            return Ok(Pric3Outcome::Proved { inductive_frame: 0 });
        }
        let initial = self.graph.initial_state();
        if self.graph.is_goal(initial)? {
            info!("initial state satisfies the goal, probability is 1");
            return Ok(Pric3Outcome::Refuted);
        }

        loop {
            let watch = Stopwatch::start();
            let strengthened = self.strengthen()?;
            Statistics::record(&mut self.stats.strengthen_time, watch);
            match strengthened {
                Strengthened::Cancelled => return Ok(Pric3Outcome::Cancelled),
                Strengthened::Done => {
                    self.frames.add_frame();
                    if !self.propagation_enabled {
                        // Without propagation no fixed point can be
                        // detected; only refutations terminate the loop.
                        continue;
                    }
                    let watch = Stopwatch::start();
                    let fixed_point = self.propagate()?;
                    Statistics::record(&mut self.stats.propagation_time, watch);
                    if let Some(inductive_frame) = fixed_point {
                        info!("frames {inductive_frame} and {} agree", inductive_frame + 1);
                        if self.check_inductiveness {
                            self.stats.inductiveness_verified =
                                self.verify_inductive_frame(inductive_frame)?;
                            if !self.stats.inductiveness_verified {
                                warn!("inductive frame failed its self-check");
                            }
                        }
                        self.stats.inductive_frame = Some(inductive_frame);
                        return Ok(Pric3Outcome::Proved { inductive_frame });
                    }
                }
                Strengthened::DeadEnd => {
                    // The refutation system uses only exact transition
                    // probabilities over the visited states, so its answer
                    // does not depend on the oracle; checking it before
                    // refining saves the refinement on refuted instances.
                    let watch = Stopwatch::start();
                    let refuted = self.check_refutation()?;
                    Statistics::record(&mut self.stats.refutation_time, watch);
                    if refuted {
                        return Ok(Pric3Outcome::Refuted);
                    }
                    let watch = Stopwatch::start();
                    self.oracle.refine(self.context, &self.touched)?;
                    Statistics::record(&mut self.stats.oracle_time, watch);
                    self.reset();
                }
            }
        }
    }

    /// Tries to make the outermost frame bound the initial state by the
    /// threshold.
    fn strengthen(&mut self) -> Result<Strengthened> {
        let k = self.frames.k();
        debug!("strengthening up to frame {k}");
        let initial = self.graph.initial_state();
        self.touched.insert(initial);
        self.queue.clear();
        self.queue.push(
            &mut self.epoch,
            Obligation::new(k, initial, self.lambda.clone(), BTreeSet::new()),
        );

        while let Some(obligation) = self.queue.pop(&mut self.epoch) {
            if self.cancel.load(Ordering::Relaxed) {
                info!("cancellation requested, stopping after {} frames", k + 1);
                return Ok(Strengthened::Cancelled);
            }
            self.stats.obligations_popped += 1;
            // Only states whose obligations actually get processed feed
            // the similarity cache.
            if let Some(generalizer) = self.generalizer.as_mut() {
                generalizer.consider_state(obligation.state);
            }
            if obligation.frame == 0 {
                // Frame 0 is exact and cannot be strengthened.
                debug!("obligation for {} reached frame 0", obligation.state);
                return Ok(Strengthened::DeadEnd);
            }

            let valuation = self.graph.valuation(obligation.state);
            let (region, bound) = self.frames.state_fact(&valuation, &obligation.bound)?;
            self.stats.inductiveness_checks += 1;
            match self
                .frames
                .is_relative_inductive(obligation.frame - 1, &region, &bound)?
            {
                RelInd::Inductive => {
                    self.learn(&obligation, &region, &bound)?;
                    self.queue.repush(&mut self.epoch, obligation);
                }
                RelInd::Counterexample(cex) => {
                    self.stats.failed_inductiveness_checks += 1;
                    if self.graph.program().model_type == ModelType::Dtmc
                        && self.graph.is_nondeterministic(obligation.state)?
                    {
                        return Err(Pric3Error::UnsupportedModel(format!(
                            "state {} has several enabled commands in a Markov chain",
                            obligation.state
                        )));
                    }
                    match self
                        .splitter
                        .split(&obligation, cex.command_index, &self.epoch, &self.oracle)?
                    {
                        SplitOutcome::Infeasible => {
                            debug!("split for {} is infeasible", obligation.state);
                            return Ok(Strengthened::DeadEnd);
                        }
                        SplitOutcome::Split(shares) => {
                            let mut history = obligation.history.clone();
                            history.insert(obligation.state);
                            for (successor, share) in shares {
                                self.touched.insert(successor);
                                self.queue.push(
                                    &mut self.epoch,
                                    Obligation::new(
                                        obligation.frame - 1,
                                        successor,
                                        share,
                                        history.clone(),
                                    ),
                                );
                            }
                            // The original obligation stays open until its
                            // successors are bounded.
                            self.queue.push(&mut self.epoch, obligation);
                        }
                    }
                }
            }
        }
        Ok(Strengthened::Done)
    }

    /// Installs a discharged obligation in all frames up to its own,
    /// generalized to an interval fact where possible.
    fn learn(
        &mut self,
        obligation: &Obligation,
        region: &z3::ast::Bool<'ctx>,
        bound: &Real<'ctx>,
    ) -> Result<()> {
        let facts = match self.generalizer.as_mut() {
            Some(generalizer) => generalizer.generalize(
                &self.frames,
                obligation.frame - 1,
                obligation.state,
                &obligation.bound,
            )?,
            None => vec![],
        };
        // The point fact is installed unconditionally: spline pieces may
        // cover only part of the interval and leave the discharged state
        // itself unbounded.
        for frame in 1..=obligation.frame {
            self.frames.insert(frame, region, bound, true);
        }
        self.stats.learned_facts += 1;
        for fact in &facts {
            for frame in 1..=obligation.frame {
                self.frames.insert(frame, &fact.region, &fact.bound, false);
            }
            self.stats.learned_facts += 1;
        }
        Ok(())
    }

    /// Copies facts that stay inductive one frame further out; answers
    /// with the frame index of the first fixed point.
    fn propagate(&mut self) -> Result<Option<usize>> {
        for frame in 1..self.frames.k() {
            let facts = self.frames.facts(frame).to_vec();
            for fact in facts {
                if self.frames.facts(frame + 1).contains(&fact) {
                    continue;
                }
                if let RelInd::Inductive =
                    self.frames
                        .is_relative_inductive(frame, &fact.region, &fact.bound)?
                {
                    self.frames.insert_fact(frame + 1, &fact);
                    self.stats.propagated_facts += 1;
                }
            }
            if self.frames.frames_equal(frame) {
                return Ok(Some(frame));
            }
        }
        Ok(None)
    }

    /// Exact lower-bound system over the visited states: values of states
    /// outside the set are dropped to 0, so unsatisfiability of
    /// `value(initial) <= lambda` refutes the property outright.
    fn check_refutation(&mut self) -> Result<bool> {
        self.stats.refutation_checks += 1;
        let ctx = self.context;
        let solver = Solver::new(ctx);
        let zero = z3::ast::Int::from_i64(ctx, 0).to_real();
        let one = z3::ast::Int::from_i64(ctx, 1).to_real();

        let vars: std::collections::HashMap<StateId, Real> = self
            .touched
            .iter()
            .map(|&state| (state, Real::new_const(ctx, format!("r_{}", state.0))))
            .collect();
        for (&state, var) in &vars {
            solver.assert(&var.ge(&zero));
            solver.assert(&var.le(&one));
            if self.graph.is_goal(state)? {
                solver.assert(&var._eq(&one));
                continue;
            }
            for choice in &self.graph.choices(state)?.choices {
                let mut terms = vec![choice.goal_probability().to_z3(ctx)?];
                for (successor, probability) in choice.non_goal_successors() {
                    if let Some(successor_var) = vars.get(&successor) {
                        terms.push(Real::mul(ctx, &[&probability.to_z3(ctx)?, successor_var]));
                    }
                }
                let refs: Vec<&Real> = terms.iter().collect();
                solver.assert(&var.ge(&Real::add(ctx, &refs)));
            }
        }
        let initial_var = &vars[&self.graph.initial_state()];
        solver.assert(&initial_var.le(&self.lambda.to_z3(ctx)?));

        match solver.check() {
            SatResult::Unsat => {
                info!(
                    "refutation: {} visited states already force the bound above {}",
                    self.touched.len(),
                    self.lambda
                );
                Ok(true)
            }
            SatResult::Sat => Ok(false),
            SatResult::Unknown => Err(Pric3Error::SolverUnknown { frame: 0 }),
        }
    }

    /// Starts the search over after an oracle refinement. The innermost
    /// frame is exact and survives; everything else is rebuilt.
    fn reset(&mut self) {
        debug!("resetting frames after oracle refinement");
        self.frames.reset();
        self.queue.clear();
        self.epoch.clear();
        self.splitter.clear_cache();
        if let Some(generalizer) = self.generalizer.as_mut() {
            generalizer.reset();
        }
    }

    /// Replays every fact of the inductive frame against itself, plus the
    /// threshold bound on the initial state.
    pub fn verify_inductive_frame(&self, frame: usize) -> Result<bool> {
        for fact in self.frames.facts(frame) {
            if !matches!(
                self.frames
                    .is_relative_inductive(frame, &fact.region, &fact.bound)?,
                RelInd::Inductive
            ) {
                return Ok(false);
            }
        }
        let valuation = self.graph.valuation(self.graph.initial_state());
        let (region, bound) = self.frames.state_fact(&valuation, &self.lambda)?;
        Ok(matches!(
            self.frames.is_relative_inductive(frame, &region, &bound)?,
            RelInd::Inductive
        ))
    }
}
