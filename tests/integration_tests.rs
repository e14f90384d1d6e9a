use std::{collections::BTreeSet, rc::Rc};

use pric3::{
    model::{state_graph::StateGraph, Program, Value},
    oracle::{Oracle, OracleStrategy},
    GeneralizationMethod, OracleKind, Pric3, Pric3Options, Pric3Outcome, Probability, QueueKind,
};

fn run_options(options: &Pric3Options) -> Pric3Outcome {
    let program = Program::from_path(&options.model).unwrap();
    let config = z3::Config::new();
    let context = z3::Context::new(&config);
    let mut driver = Pric3::new(&context, program, options).unwrap();
    driver.run().unwrap()
}

macro_rules! create_integration_test {
    ($test_name:ident, $model:literal, $lambda:literal, $expected:pat) => {
        create_integration_test!($test_name, $model, $lambda, $expected, |_| {});
    };
    ($test_name:ident, $model:literal, $lambda:literal, $expected:pat, $configure:expr) => {
        #[test]
        fn $test_name() {
            let mut options = Pric3Options::new($model, $lambda.parse().unwrap());
            let configure: fn(&mut Pric3Options) = $configure;
            configure(&mut options);
            let outcome = run_options(&options);
            assert!(matches!(outcome, $expected), "got {outcome}");
        }
    };
}

create_integration_test!(
    test_branch_holds,
    "models/branch.json",
    "1/2",
    Pric3Outcome::Proved { inductive_frame: 1 }
);
create_integration_test!(
    test_branch_violated,
    "models/branch.json",
    "1/10",
    Pric3Outcome::Refuted
);
create_integration_test!(
    test_loop_violated,
    "models/loop.json",
    "1/2",
    Pric3Outcome::Refuted
);
create_integration_test!(
    test_trivial_threshold,
    "models/loop.json",
    "1",
    Pric3Outcome::Proved { inductive_frame: 0 }
);
create_integration_test!(
    test_chain_holds,
    "models/chain.json",
    "1/100",
    Pric3Outcome::Proved { .. }
);
create_integration_test!(
    test_chain_violated,
    "models/chain.json",
    "1/2048",
    Pric3Outcome::Refuted
);
create_integration_test!(
    test_mdp_holds,
    "models/mdp.json",
    "3/4",
    Pric3Outcome::Proved { inductive_frame: 1 }
);
create_integration_test!(
    test_mdp_violated,
    "models/mdp.json",
    "1/2",
    Pric3Outcome::Refuted
);
create_integration_test!(
    test_chain_plain_queue,
    "models/chain.json",
    "1/100",
    Pric3Outcome::Proved { .. },
    |options| options.queue = QueueKind::Plain
);
create_integration_test!(
    test_chain_naive_queue,
    "models/chain.json",
    "1/100",
    Pric3Outcome::Proved { .. },
    |options| options.queue = QueueKind::NaiveRepushing
);
create_integration_test!(
    test_chain_linear_generalization,
    "models/chain.json",
    "1/2",
    Pric3Outcome::Proved { .. },
    |options| options.generalize = Some(GeneralizationMethod::Linear)
);
create_integration_test!(
    test_chain_polynomial_generalization,
    "models/chain.json",
    "1/2",
    Pric3Outcome::Proved { .. },
    |options| options.generalize = Some(GeneralizationMethod::Polynomial)
);
create_integration_test!(
    test_loop_refuted_without_propagation,
    "models/loop.json",
    "1/2",
    Pric3Outcome::Refuted,
    |options| options.no_propagate = true
);

/// Spline generalization may keep only interval pieces away from the
/// discharged state, so the proof must still record the state's own bound;
/// the self-check fails if any frame fact stopped being inductive.
#[test]
fn test_chain_hybrid_generalization_stays_inductive() {
    let mut options = Pric3Options::new("models/chain.json", "1/2".parse().unwrap());
    options.generalize = Some(GeneralizationMethod::Hybrid);
    options.ignore_same_kind = true;
    options.max_ctgs = 0;
    options.split_limit = 1;
    options.check_inductiveness = true;
    let program = Program::from_path(&options.model).unwrap();
    let config = z3::Config::new();
    let context = z3::Context::new(&config);
    let mut driver = Pric3::new(&context, program, &options).unwrap();
    let outcome = driver.run().unwrap();
    assert!(matches!(outcome, Pric3Outcome::Proved { .. }), "got {outcome}");
    assert!(driver.statistics().inductiveness_verified);
}

#[test]
fn test_branch_learns_a_single_fact() {
    let options = Pric3Options::new("models/branch.json", "1/2".parse().unwrap());
    let program = Program::from_path(&options.model).unwrap();
    let config = z3::Config::new();
    let context = z3::Context::new(&config);
    let mut driver = Pric3::new(&context, program, &options).unwrap();
    let outcome = driver.run().unwrap();
    assert!(matches!(
        outcome,
        Pric3Outcome::Proved { inductive_frame: 1 }
    ));
    let stats = driver.statistics();
    assert_eq!(stats.learned_facts, 1);
    assert_eq!(stats.propagated_facts, 1);
    assert_eq!(stats.oracle_refinements, 0);
}

#[test]
fn test_inductive_frame_self_check() {
    let mut options = Pric3Options::new("models/branch.json", "1/2".parse().unwrap());
    options.check_inductiveness = true;
    let program = Program::from_path(&options.model).unwrap();
    let config = z3::Config::new();
    let context = z3::Context::new(&config);
    let mut driver = Pric3::new(&context, program, &options).unwrap();
    let outcome = driver.run().unwrap();
    assert!(matches!(outcome, Pric3Outcome::Proved { .. }));
    assert!(driver.statistics().inductiveness_verified);
}

#[test]
fn test_file_oracle_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let snapshot = dir.path().join("oracle.json");

    let mut options = Pric3Options::new("models/branch.json", "1/2".parse().unwrap());
    options.save_oracle = Some(snapshot.clone());
    let program = Program::from_path(&options.model).unwrap();
    let config = z3::Config::new();
    let context = z3::Context::new(&config);
    let mut driver = Pric3::new(&context, program, &options).unwrap();
    driver.run().unwrap();
    driver.oracle().save(&snapshot).unwrap();

    let mut reloaded = Pric3Options::new("models/branch.json", "1/2".parse().unwrap());
    reloaded.oracle = OracleKind::File;
    reloaded.oracle_file = Some(snapshot);
    let outcome = run_options(&reloaded);
    assert!(matches!(
        outcome,
        Pric3Outcome::Proved { inductive_frame: 1 }
    ));
}

/// A refinement that visits only already-covered states must still widen
/// the oracle's coverage, otherwise refinement could stall forever.
#[test]
fn test_oracle_refinement_expands_coverage() {
    let program = Program::from_path("models/chain.json").unwrap();
    let config = z3::Config::new();
    let context = z3::Context::new(&config);
    let graph = StateGraph::new(program);
    let mut oracle = Oracle::new(
        &context,
        Rc::clone(&graph),
        &OracleStrategy::BoundedExact { depth: 2 },
        Probability::one(),
    )
    .unwrap();
    let initial = graph.initial_state();
    // Depth 2 covers c in {0, 1, 2}; c = 3 enters as the constant 1.
    assert_eq!(oracle.value(initial), Probability::from_ratio(1, 8));

    let visited: BTreeSet<_> = [initial, graph.lookup(&[Value::Int(1)]).unwrap()]
        .into_iter()
        .collect();
    oracle.refine(&context, &visited).unwrap();
    assert_eq!(oracle.refinements, 1);
    // One layer further out, so the pessimistic constant moved to c = 4.
    assert_eq!(oracle.value(initial), Probability::from_ratio(1, 16));
}
