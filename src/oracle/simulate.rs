//! Monte-Carlo estimation of reachability probabilities.
//!
//! Runs seeded random walks from the initial state; nondeterministic
//! choices are resolved uniformly. A state's estimate is the fraction of
//! walks through it that went on to hit the goal.

use std::collections::{BTreeSet, HashMap};

use log::debug;
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::{
    error::Result,
    model::state_graph::StateGraph,
    probability::{Probability, StateId, Successor},
};

pub fn estimate(
    graph: &StateGraph,
    runs: usize,
    max_steps: usize,
    seed: u64,
) -> Result<HashMap<StateId, Probability>> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut visits: HashMap<StateId, usize> = HashMap::new();
    let mut hits: HashMap<StateId, usize> = HashMap::new();

    for _ in 0..runs {
        let mut path = BTreeSet::new();
        let mut state = graph.initial_state();
        let mut hit_goal = false;
        path.insert(state);

        'walk: for _ in 0..max_steps {
            if graph.is_goal(state)? {
                hit_goal = true;
                break;
            }
            let behavior = graph.choices(state)?;
            if behavior.choices.is_empty() {
                break;
            }
            let pick = rng.gen_range(0..behavior.choices.len());
            let choice = &behavior.choices[pick];
            if choice.successors.is_empty() {
                // All mass went to dropped sinks.
                break;
            }
            let mut roll = rng.gen::<f64>();
            let mut chosen = None;
            for (successor, probability) in &choice.successors {
                roll -= probability.to_f64();
                if roll <= 0.0 {
                    chosen = Some(*successor);
                    break;
                }
            }
            match chosen {
                // Residual mass belongs to dropped sinks, the walk is dead.
                None => break 'walk,
                Some(Successor::Goal) => {
                    hit_goal = true;
                    break 'walk;
                }
                Some(Successor::State(next)) => {
                    state = next;
                    path.insert(state);
                }
            }
        }

        for visited in path {
            *visits.entry(visited).or_default() += 1;
            if hit_goal {
                *hits.entry(visited).or_default() += 1;
            }
        }
    }

    let mut estimates = HashMap::new();
    for (state, visit_count) in visits {
        let hit_count = hits.get(&state).copied().unwrap_or(0);
        estimates.insert(
            state,
            Probability::from_ratio(hit_count as i64, visit_count as i64),
        );
    }
    debug!("simulation covered {} states", estimates.len());
    Ok(estimates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        Assignment, Command, Expr, ModelType, Program, UpdateBranch, Value, VarKind, Variable,
    };

    // c counts up to 2 with probability 1/2 per step, otherwise deadlocks
    // at c = 3. True reachability from c = 0 is 1/4.
    fn coin_program() -> Program {
        Program {
            name: "coin".into(),
            model_type: ModelType::Dtmc,
            variables: vec![Variable {
                name: "c".into(),
                kind: VarKind::Int { lower: 0, upper: 3 },
                initial: Value::Int(0),
            }],
            commands: vec![Command {
                name: None,
                guard: Expr::Lt(Box::new(Expr::var("c")), Box::new(Expr::Int(2))),
                updates: vec![
                    UpdateBranch {
                        probability: Probability::from_ratio(1, 2),
                        assignments: vec![Assignment {
                            variable: "c".into(),
                            value: Expr::Add(Box::new(Expr::var("c")), Box::new(Expr::Int(1))),
                        }],
                    },
                    UpdateBranch {
                        probability: Probability::from_ratio(1, 2),
                        assignments: vec![Assignment {
                            variable: "c".into(),
                            value: Expr::Int(3),
                        }],
                    },
                ],
            }],
            goal: Expr::Eq(Box::new(Expr::var("c")), Box::new(Expr::Int(2))),
        }
    }

    #[test]
    fn estimates_are_probabilities_and_roughly_right() {
        let graph = StateGraph::new(coin_program());
        let estimates = estimate(&graph, 2000, 50, 17).unwrap();
        let init = estimates[&graph.initial_state()].to_f64();
        assert!((0.0..=1.0).contains(&init));
        assert!((init - 0.25).abs() < 0.1, "estimate {init} too far from 1/4");
    }

    #[test]
    fn same_seed_gives_identical_estimates() {
        let graph_a = StateGraph::new(coin_program());
        let graph_b = StateGraph::new(coin_program());
        let a = estimate(&graph_a, 500, 50, 3).unwrap();
        let b = estimate(&graph_b, 500, 50, 3).unwrap();
        assert_eq!(a.len(), b.len());
        for (state, value) in &a {
            assert_eq!(b.get(state), Some(value));
        }
    }
}
