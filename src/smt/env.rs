//! Symbolic encoding of a guarded-command program.
//!
//! One zero-arity real constant `Frame` stands for the frame value of the
//! current state and `Phi` for its one-step expectation. Every update
//! branch `u` of every command `c` gets a private real constant `F_c_u`
//! and a substitution that maps the program variables to the branch's
//! right-hand sides and `Frame` to `F_c_u`. Universally quantified frame
//! facts are expressed by applying all substitutions, never by z3
//! quantifiers, so all queries stay in quantifier-free linear arithmetic.

use std::collections::HashMap;

use z3::{
    ast::{Ast, Bool, Dynamic, Int, Real},
    Context, Model,
};

use crate::{
    error::{Pric3Error, Result},
    model::{Expr, Program, Value, VarKind},
    probability::Probability,
};

#[derive(Clone, Debug)]
pub enum Term<'ctx> {
    Bool(Bool<'ctx>),
    Int(Int<'ctx>),
    Real(Real<'ctx>),
}

impl<'ctx> Term<'ctx> {
    fn as_dynamic(&self) -> Dynamic<'ctx> {
        match self {
            Term::Bool(t) => Dynamic::from_ast(t),
            Term::Int(t) => Dynamic::from_ast(t),
            Term::Real(t) => Dynamic::from_ast(t),
        }
    }

    fn expect_bool(self, what: &str) -> Result<Bool<'ctx>> {
        match self {
            Term::Bool(t) => Ok(t),
            _ => Err(Pric3Error::Model(format!("{what} is not boolean"))),
        }
    }
}

/// The value an integer variable takes in a solver model when the
/// int-to-real relaxation is active.
pub enum IntWitness {
    Integral(i64),
    Fractional { floor: i64, ceil: i64 },
}

struct UpdateEnc<'ctx> {
    frame_var: Real<'ctx>,
    probability: Probability,
    substitution: Vec<(Dynamic<'ctx>, Dynamic<'ctx>)>,
}

struct CommandEnc<'ctx> {
    guard: Bool<'ctx>,
    updates: Vec<UpdateEnc<'ctx>>,
}

pub struct SmtEnv<'ctx> {
    context: &'ctx Context,
    program: Program,
    int_to_real: bool,
    vars: Vec<Term<'ctx>>,
    var_index: HashMap<String, usize>,
    frame: Real<'ctx>,
    phi: Real<'ctx>,
    chosen_command: Int<'ctx>,
    goal: Bool<'ctx>,
    commands: Vec<CommandEnc<'ctx>>,
}

impl<'ctx> SmtEnv<'ctx> {
    pub fn new(context: &'ctx Context, program: Program, int_to_real: bool) -> Result<Self> {
        let mut vars = vec![];
        let mut var_index = HashMap::new();
        for (idx, var) in program.variables.iter().enumerate() {
            let term = match var.kind {
                VarKind::Bool => Term::Bool(Bool::new_const(context, var.name.as_str())),
                VarKind::Int { .. } if int_to_real => {
                    Term::Real(Real::new_const(context, var.name.as_str()))
                }
                VarKind::Int { .. } => Term::Int(Int::new_const(context, var.name.as_str())),
            };
            var_index.insert(var.name.clone(), idx);
            vars.push(term);
        }

        let mut env = SmtEnv {
            context,
            int_to_real,
            frame: Real::new_const(context, "Frame"),
            phi: Real::new_const(context, "Phi"),
            chosen_command: Int::new_const(context, "ChosenCommand"),
            goal: Bool::from_bool(context, false),
            commands: vec![],
            vars,
            var_index,
            program,
        };
        env.goal = env.translate(&env.program.goal.clone())?.expect_bool("goal")?;

        let frame_dynamic = Dynamic::from_ast(&env.frame);
        for (c, command) in env.program.commands.clone().iter().enumerate() {
            let guard = env
                .translate(&command.guard)?
                .expect_bool("command guard")?;
            let mut updates = vec![];
            for (u, update) in command.updates.iter().enumerate() {
                let frame_var = Real::new_const(context, format!("F_{c}_{u}"));
                let mut substitution = vec![];
                for assignment in &update.assignments {
                    let idx = env.var_index[&assignment.variable];
                    let from = env.vars[idx].as_dynamic();
                    let to = env.translate(&assignment.value)?.as_dynamic();
                    substitution.push((from, to));
                }
                substitution.push((frame_dynamic.clone(), Dynamic::from_ast(&frame_var)));
                updates.push(UpdateEnc {
                    frame_var,
                    probability: update.probability.clone(),
                    substitution,
                });
            }
            env.commands.push(CommandEnc { guard, updates });
        }
        Ok(env)
    }

    pub fn context(&self) -> &'ctx Context {
        self.context
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn int_to_real(&self) -> bool {
        self.int_to_real
    }

    pub fn phi(&self) -> &Real<'ctx> {
        &self.phi
    }

    pub fn frame(&self) -> &Real<'ctx> {
        &self.frame
    }

    pub fn goal(&self) -> &Bool<'ctx> {
        &self.goal
    }

    fn int_literal(&self, value: i64) -> Term<'ctx> {
        if self.int_to_real {
            Term::Real(Int::from_i64(self.context, value).to_real())
        } else {
            Term::Int(Int::from_i64(self.context, value))
        }
    }

    fn translate(&self, expr: &Expr) -> Result<Term<'ctx>> {
        let bad = |what: &str| Pric3Error::Model(format!("{what} in expression {expr:?}"));
        let bool_args = |exprs: &[Expr]| -> Result<Vec<Bool<'ctx>>> {
            exprs
                .iter()
                .map(|e| self.translate(e)?.expect_bool("operand"))
                .collect()
        };
        let arith = |a: &Expr, b: &Expr| -> Result<(Term<'ctx>, Term<'ctx>)> {
            Ok((self.translate(a)?, self.translate(b)?))
        };
        Ok(match expr {
            Expr::Int(v) => self.int_literal(*v),
            Expr::Bool(v) => Term::Bool(Bool::from_bool(self.context, *v)),
            Expr::Var(name) => {
                let idx = *self.var_index.get(name).ok_or_else(|| bad("unknown variable"))?;
                self.vars[idx].clone()
            }
            Expr::Not(e) => Term::Bool(self.translate(e)?.expect_bool("operand")?.not()),
            Expr::And(es) => {
                let args = bool_args(es)?;
                let refs: Vec<&Bool> = args.iter().collect();
                Term::Bool(Bool::and(self.context, &refs))
            }
            Expr::Or(es) => {
                let args = bool_args(es)?;
                let refs: Vec<&Bool> = args.iter().collect();
                Term::Bool(Bool::or(self.context, &refs))
            }
            Expr::Add(a, b) => match arith(a, b)? {
                (Term::Int(a), Term::Int(b)) => Term::Int(Int::add(self.context, &[&a, &b])),
                (Term::Real(a), Term::Real(b)) => Term::Real(Real::add(self.context, &[&a, &b])),
                _ => return Err(bad("mismatched operand sorts")),
            },
            Expr::Sub(a, b) => match arith(a, b)? {
                (Term::Int(a), Term::Int(b)) => Term::Int(Int::sub(self.context, &[&a, &b])),
                (Term::Real(a), Term::Real(b)) => Term::Real(Real::sub(self.context, &[&a, &b])),
                _ => return Err(bad("mismatched operand sorts")),
            },
            Expr::Mul(a, b) => match arith(a, b)? {
                (Term::Int(a), Term::Int(b)) => Term::Int(Int::mul(self.context, &[&a, &b])),
                (Term::Real(a), Term::Real(b)) => Term::Real(Real::mul(self.context, &[&a, &b])),
                _ => return Err(bad("mismatched operand sorts")),
            },
            Expr::Eq(a, b) => match arith(a, b)? {
                (Term::Int(a), Term::Int(b)) => Term::Bool(a._eq(&b)),
                (Term::Real(a), Term::Real(b)) => Term::Bool(a._eq(&b)),
                (Term::Bool(a), Term::Bool(b)) => Term::Bool(a._eq(&b)),
                _ => return Err(bad("mismatched operand sorts")),
            },
            Expr::Lt(a, b) => match arith(a, b)? {
                (Term::Int(a), Term::Int(b)) => Term::Bool(a.lt(&b)),
                (Term::Real(a), Term::Real(b)) => Term::Bool(a.lt(&b)),
                _ => return Err(bad("mismatched operand sorts")),
            },
            Expr::Le(a, b) => match arith(a, b)? {
                (Term::Int(a), Term::Int(b)) => Term::Bool(a.le(&b)),
                (Term::Real(a), Term::Real(b)) => Term::Bool(a.le(&b)),
                _ => return Err(bad("mismatched operand sorts")),
            },
            Expr::Gt(a, b) => match arith(a, b)? {
                (Term::Int(a), Term::Int(b)) => Term::Bool(a.gt(&b)),
                (Term::Real(a), Term::Real(b)) => Term::Bool(a.gt(&b)),
                _ => return Err(bad("mismatched operand sorts")),
            },
            Expr::Ge(a, b) => match arith(a, b)? {
                (Term::Int(a), Term::Int(b)) => Term::Bool(a.ge(&b)),
                (Term::Real(a), Term::Real(b)) => Term::Bool(a.ge(&b)),
                _ => return Err(bad("mismatched operand sorts")),
            },
        })
    }

    fn apply_update(&self, update: &UpdateEnc<'ctx>, formula: &Bool<'ctx>) -> Bool<'ctx> {
        let pairs: Vec<(&Dynamic, &Dynamic)> = update
            .substitution
            .iter()
            .map(|(from, to)| (from, to))
            .collect();
        formula.substitute(&pairs)
    }

    /// Conjunction of the formula instantiated for every update branch of
    /// every command. This is how frame facts quantify over successors.
    pub fn forall(&self, formula: &Bool<'ctx>) -> Bool<'ctx> {
        let mut parts = vec![];
        for command in &self.commands {
            for update in &command.updates {
                parts.push(self.apply_update(update, formula));
            }
        }
        let refs: Vec<&Bool> = parts.iter().collect();
        Bool::and(self.context, &refs)
    }

    /// Like [`forall`], but each command's instances only apply where that
    /// command is enabled in a non-goal state.
    pub fn command_specific_forall(&self, formula: &Bool<'ctx>) -> Bool<'ctx> {
        let mut parts = vec![];
        for command in &self.commands {
            let instances: Vec<Bool> = command
                .updates
                .iter()
                .map(|u| self.apply_update(u, formula))
                .collect();
            let refs: Vec<&Bool> = instances.iter().collect();
            let body = Bool::and(self.context, &refs);
            let premise = Bool::and(self.context, &[&self.goal.not(), &command.guard]);
            parts.push(premise.implies(&body));
        }
        let refs: Vec<&Bool> = parts.iter().collect();
        Bool::and(self.context, &refs)
    }

    fn deadlock(&self) -> Bool<'ctx> {
        let guards: Vec<&Bool> = self.commands.iter().map(|c| &c.guard).collect();
        Bool::or(self.context, &guards).not()
    }

    fn variable_bounds(&self) -> Bool<'ctx> {
        let mut parts = vec![];
        for (idx, var) in self.program.variables.iter().enumerate() {
            if let VarKind::Int { lower, upper } = var.kind {
                parts.push(self.int_var_ge(idx, lower));
                parts.push(self.int_var_le(idx, upper));
            }
        }
        let refs: Vec<&Bool> = parts.iter().collect();
        Bool::and(self.context, &refs)
    }

    /// The formulas every frame solver starts from.
    pub fn base_formulas(&self) -> Result<Vec<Bool<'ctx>>> {
        let ctx = self.context;
        let zero = Int::from_i64(ctx, 0).to_real();
        let one = Int::from_i64(ctx, 1).to_real();
        let not_goal = self.goal.not();
        let deadlock = self.deadlock();

        let mut formulas = vec![self.variable_bounds()];

        // 0 <= ChosenCommand < |commands|.
        formulas.push(Int::from_i64(ctx, 0).le(&self.chosen_command));
        formulas.push(
            self.chosen_command
                .lt(&Int::from_i64(ctx, self.commands.len() as i64)),
        );

        // Frame values are probabilities, for the state and its successors.
        formulas.push(zero.le(&self.frame));
        formulas.push(self.frame.le(&one));
        for command in &self.commands {
            for update in &command.updates {
                formulas.push(zero.le(&update.frame_var));
                formulas.push(update.frame_var.le(&one));
            }
        }
        formulas.push(zero.le(&self.phi));

        // Deadlocked non-goal states can never reach the goal. Quantified
        // over successors so that filtered sink targets stay pinned at 0.
        let frame_zero = Bool::and(ctx, &[&deadlock, &not_goal]).implies(&self.frame._eq(&zero));
        formulas.push(frame_zero.clone());
        formulas.push(self.forall(&frame_zero));

        // Goal states have expectation 1, deadlocked non-goal states 0.
        formulas.push(self.goal.implies(&self.phi._eq(&one)));
        formulas.push(Bool::and(ctx, &[&deadlock, &not_goal]).implies(&self.phi._eq(&zero)));

        // A non-goal, non-deadlocked state commits to exactly one enabled
        // command.
        let mut picks = vec![];
        for (c, command) in self.commands.iter().enumerate() {
            let is_chosen = self.chosen_command._eq(&Int::from_i64(ctx, c as i64));
            picks.push(Bool::and(ctx, &[&is_chosen, &command.guard]));
        }
        let pick_refs: Vec<&Bool> = picks.iter().collect();
        let some_pick = Bool::or(ctx, &pick_refs);
        formulas
            .push(Bool::and(ctx, &[&not_goal, &deadlock.not()]).implies(&some_pick));

        // Phi is the expected successor frame value of the chosen command.
        for (c, command) in self.commands.iter().enumerate() {
            let is_chosen = self.chosen_command._eq(&Int::from_i64(ctx, c as i64));
            let mut weighted = vec![];
            for update in &command.updates {
                let p = update.probability.to_z3(ctx)?;
                weighted.push(Real::mul(ctx, &[&p, &update.frame_var]));
            }
            let weighted_refs: Vec<&Real> = weighted.iter().collect();
            let expectation = Real::add(ctx, &weighted_refs);
            let premise = Bool::and(ctx, &[&not_goal, &is_chosen, &command.guard]);
            formulas.push(premise.implies(&self.phi._eq(&expectation)));
        }

        Ok(formulas)
    }

    /// The exact semantics of the innermost frame: a state's value is 1
    /// exactly on in-bounds goal states, here quantified over successors.
    pub fn frame_zero_formula(&self) -> Bool<'ctx> {
        let ctx = self.context;
        let zero = Int::from_i64(ctx, 0).to_real();
        let one = Int::from_i64(ctx, 1).to_real();
        let in_bounds = self.variable_bounds();
        let is_one = Bool::and(ctx, &[&self.goal, &in_bounds]);
        let exact = self.frame._eq(&is_one.ite(&one, &zero));
        Bool::and(ctx, &[&exact, &self.forall(&exact)])
    }

    /// Equality constraint pinning the program variables to a valuation.
    pub fn state_args(&self, valuation: &[Value]) -> Result<Bool<'ctx>> {
        let mut parts = vec![];
        for (idx, value) in valuation.iter().enumerate() {
            parts.push(self.var_eq(idx, *value)?);
        }
        let refs: Vec<&Bool> = parts.iter().collect();
        Ok(Bool::and(self.context, &refs))
    }

    pub fn var_eq(&self, idx: usize, value: Value) -> Result<Bool<'ctx>> {
        match (&self.vars[idx], value) {
            (Term::Bool(t), Value::Bool(v)) => Ok(t._eq(&Bool::from_bool(self.context, v))),
            (Term::Int(t), Value::Int(v)) => Ok(t._eq(&Int::from_i64(self.context, v))),
            (Term::Real(t), Value::Int(v)) => {
                Ok(t._eq(&Int::from_i64(self.context, v).to_real()))
            }
            _ => Err(Pric3Error::Model(format!(
                "value {value} does not match the sort of variable {}",
                self.program.variables[idx].name
            ))),
        }
    }

    pub fn int_var_ge(&self, idx: usize, bound: i64) -> Bool<'ctx> {
        match &self.vars[idx] {
            Term::Int(t) => t.ge(&Int::from_i64(self.context, bound)),
            Term::Real(t) => t.ge(&Int::from_i64(self.context, bound).to_real()),
            Term::Bool(_) => Bool::from_bool(self.context, true),
        }
    }

    pub fn int_var_le(&self, idx: usize, bound: i64) -> Bool<'ctx> {
        match &self.vars[idx] {
            Term::Int(t) => t.le(&Int::from_i64(self.context, bound)),
            Term::Real(t) => t.le(&Int::from_i64(self.context, bound).to_real()),
            Term::Bool(_) => Bool::from_bool(self.context, true),
        }
    }

    /// The variable as a real term, for polynomial frame bounds.
    pub fn int_var_as_real(&self, idx: usize) -> Result<Real<'ctx>> {
        match &self.vars[idx] {
            Term::Int(t) => Ok(t.to_real()),
            Term::Real(t) => Ok(t.clone()),
            Term::Bool(_) => Err(Pric3Error::Model(format!(
                "variable {} is boolean, not integer",
                self.program.variables[idx].name
            ))),
        }
    }

    pub fn eval_chosen_command(&self, model: &Model<'ctx>) -> Result<usize> {
        let value = model
            .eval(&self.chosen_command, true)
            .and_then(|v| v.as_i64())
            .ok_or_else(|| Pric3Error::MissingModelValue("ChosenCommand".into()))?;
        Ok(value as usize)
    }

    /// Reads one relaxed integer variable out of a model. Fractional values
    /// feed the integer-witness refinement loop.
    pub fn eval_int_witness(&self, model: &Model<'ctx>, idx: usize) -> Result<IntWitness> {
        let name = &self.program.variables[idx].name;
        match &self.vars[idx] {
            Term::Int(t) => {
                let v = model
                    .eval(t, true)
                    .and_then(|v| v.as_i64())
                    .ok_or_else(|| Pric3Error::MissingModelValue(name.clone()))?;
                Ok(IntWitness::Integral(v))
            }
            Term::Real(t) => {
                let (numer, denom) = model
                    .eval(t, true)
                    .and_then(|v| v.as_real())
                    .ok_or_else(|| Pric3Error::MissingModelValue(name.clone()))?;
                if denom == 0 {
                    return Err(Pric3Error::Numeral(format!("{numer}/{denom}")));
                }
                let (numer, denom) = if denom < 0 { (-numer, -denom) } else { (numer, denom) };
                if numer % denom == 0 {
                    Ok(IntWitness::Integral(numer / denom))
                } else {
                    let floor = numer.div_euclid(denom);
                    Ok(IntWitness::Fractional {
                        floor,
                        ceil: floor + 1,
                    })
                }
            }
            Term::Bool(_) => Err(Pric3Error::Model(format!("{name} is not an integer"))),
        }
    }

    /// Full valuation of a model, after any relaxed integers have been
    /// forced integral.
    pub fn valuation_from_model(&self, model: &Model<'ctx>) -> Result<Vec<Value>> {
        let mut valuation = vec![];
        for (idx, var) in self.program.variables.iter().enumerate() {
            let value = match &self.vars[idx] {
                Term::Bool(t) => Value::Bool(
                    model
                        .eval(t, true)
                        .and_then(|v| v.as_bool())
                        .ok_or_else(|| Pric3Error::MissingModelValue(var.name.clone()))?,
                ),
                _ => match self.eval_int_witness(model, idx)? {
                    IntWitness::Integral(v) => Value::Int(v),
                    IntWitness::Fractional { floor, ceil } => {
                        return Err(Pric3Error::Numeral(format!(
                            "{} is strictly between {floor} and {ceil}",
                            var.name
                        )));
                    }
                },
            };
            valuation.push(value);
        }
        Ok(valuation)
    }

    pub fn eval_probability(&self, model: &Model<'ctx>, term: &Real<'ctx>) -> Result<Probability> {
        let (numer, denom) = model
            .eval(term, true)
            .and_then(|v| v.as_real())
            .ok_or_else(|| Pric3Error::MissingModelValue(format!("{term:?}")))?;
        Probability::from_model_real(numer, denom)
    }
}
