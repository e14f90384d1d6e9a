//! Guarded-command probabilistic programs.
//!
//! A program is a finite set of bounded integer and boolean variables, a
//! single initial valuation, a goal predicate, and guarded commands whose
//! updates fire with rational probabilities. Markov chains have at most one
//! enabled command per state; decision processes may have several and are
//! resolved by a maximizing scheduler. Programs are plain data and are read
//! from JSON files; there is no textual front end.

pub mod state_graph;

use std::{collections::HashMap, fmt, fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::{
    error::{Pric3Error, Result},
    probability::Probability,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelType {
    Dtmc,
    Mdp,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Int(i64),
    Bool(bool),
}

impl Value {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::Bool(_) => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            Value::Int(_) => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{v}"),
            Value::Bool(v) => write!(f, "{v}"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VarKind {
    Int { lower: i64, upper: i64 },
    Bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,
    #[serde(flatten)]
    pub kind: VarKind,
    pub initial: Value,
}

/// Boolean/arithmetic expressions over the program variables.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expr {
    Int(i64),
    Bool(bool),
    Var(String),
    Not(Box<Expr>),
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Add(Box<Expr>, Box<Expr>),
    Sub(Box<Expr>, Box<Expr>),
    Mul(Box<Expr>, Box<Expr>),
    Eq(Box<Expr>, Box<Expr>),
    Lt(Box<Expr>, Box<Expr>),
    Le(Box<Expr>, Box<Expr>),
    Gt(Box<Expr>, Box<Expr>),
    Ge(Box<Expr>, Box<Expr>),
}

impl Expr {
    pub fn var(name: &str) -> Expr {
        Expr::Var(name.into())
    }

    pub fn eval(&self, program: &Program, valuation: &[Value]) -> Result<Value> {
        let bad = |what: &str| Pric3Error::Model(format!("{what} in expression {self:?}"));
        let int = |e: &Expr| -> Result<i64> {
            e.eval(program, valuation)?
                .as_int()
                .ok_or_else(|| bad("expected an integer"))
        };
        let boolean = |e: &Expr| -> Result<bool> {
            e.eval(program, valuation)?
                .as_bool()
                .ok_or_else(|| bad("expected a boolean"))
        };
        Ok(match self {
            Expr::Int(v) => Value::Int(*v),
            Expr::Bool(v) => Value::Bool(*v),
            Expr::Var(name) => {
                let idx = program
                    .variable_index(name)
                    .ok_or_else(|| bad("unknown variable"))?;
                valuation[idx]
            }
            Expr::Not(e) => Value::Bool(!boolean(e)?),
            Expr::And(es) => {
                let mut acc = true;
                for e in es {
                    acc = acc && boolean(e)?;
                }
                Value::Bool(acc)
            }
            Expr::Or(es) => {
                let mut acc = false;
                for e in es {
                    acc = acc || boolean(e)?;
                }
                Value::Bool(acc)
            }
            Expr::Add(a, b) => Value::Int(int(a)? + int(b)?),
            Expr::Sub(a, b) => Value::Int(int(a)? - int(b)?),
            Expr::Mul(a, b) => Value::Int(int(a)? * int(b)?),
            Expr::Eq(a, b) => Value::Bool(a.eval(program, valuation)? == b.eval(program, valuation)?),
            Expr::Lt(a, b) => Value::Bool(int(a)? < int(b)?),
            Expr::Le(a, b) => Value::Bool(int(a)? <= int(b)?),
            Expr::Gt(a, b) => Value::Bool(int(a)? > int(b)?),
            Expr::Ge(a, b) => Value::Bool(int(a)? >= int(b)?),
        })
    }
}

/// One probabilistic branch of a command: fires with `probability` and
/// applies all assignments simultaneously.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UpdateBranch {
    pub probability: Probability,
    #[serde(default)]
    pub assignments: Vec<Assignment>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Assignment {
    pub variable: String,
    pub value: Expr,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Command {
    #[serde(default)]
    pub name: Option<String>,
    pub guard: Expr,
    pub updates: Vec<UpdateBranch>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Program {
    pub name: String,
    pub model_type: ModelType,
    pub variables: Vec<Variable>,
    pub commands: Vec<Command>,
    pub goal: Expr,
}

impl Program {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        let program: Program = serde_json::from_str(&raw)?;
        program.validate()?;
        Ok(program)
    }

    pub fn variable_index(&self, name: &str) -> Option<usize> {
        self.variables.iter().position(|v| v.name == name)
    }

    pub fn initial_valuation(&self) -> Vec<Value> {
        self.variables.iter().map(|v| v.initial).collect()
    }

    pub fn is_nondeterministic(&self) -> bool {
        matches!(self.model_type, ModelType::Mdp)
    }

    /// Structural checks done once at load time so the search never has to
    /// deal with a malformed program.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashMap::new();
        for (idx, var) in self.variables.iter().enumerate() {
            if seen.insert(var.name.clone(), idx).is_some() {
                return Err(Pric3Error::Model(format!("duplicate variable {}", var.name)));
            }
            match (&var.kind, &var.initial) {
                (VarKind::Int { lower, upper }, Value::Int(v)) => {
                    if lower > upper {
                        return Err(Pric3Error::Model(format!(
                            "variable {} has empty range [{lower}, {upper}]",
                            var.name
                        )));
                    }
                    if v < lower || v > upper {
                        return Err(Pric3Error::Model(format!(
                            "initial value {v} of {} is outside [{lower}, {upper}]",
                            var.name
                        )));
                    }
                }
                (VarKind::Bool, Value::Bool(_)) => {}
                _ => {
                    return Err(Pric3Error::Model(format!(
                        "initial value of {} does not match its type",
                        var.name
                    )));
                }
            }
        }
        for (idx, command) in self.commands.iter().enumerate() {
            if command.updates.is_empty() {
                return Err(Pric3Error::Model(format!("command {idx} has no updates")));
            }
            let total = command
                .updates
                .iter()
                .fold(Probability::zero(), |acc, u| acc + u.probability.clone());
            if !total.is_one() {
                return Err(Pric3Error::Model(format!(
                    "update probabilities of command {idx} sum to {total}, not 1"
                )));
            }
            for update in &command.updates {
                if update.probability.is_negative() || update.probability.is_zero() {
                    return Err(Pric3Error::Model(format!(
                        "command {idx} has a non-positive branch probability"
                    )));
                }
                for assignment in &update.assignments {
                    if self.variable_index(&assignment.variable).is_none() {
                        return Err(Pric3Error::Model(format!(
                            "command {idx} assigns unknown variable {}",
                            assignment.variable
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Applies one update branch to a valuation, checking variable bounds.
    pub fn apply_update(&self, valuation: &[Value], update: &UpdateBranch) -> Result<Vec<Value>> {
        let mut next = valuation.to_vec();
        for assignment in &update.assignments {
            let idx = self
                .variable_index(&assignment.variable)
                .ok_or_else(|| Pric3Error::Model(format!("unknown variable {}", assignment.variable)))?;
            let value = assignment.value.eval(self, valuation)?;
            match (&self.variables[idx].kind, &value) {
                (VarKind::Int { lower, upper }, Value::Int(v)) => {
                    if v < lower || v > upper {
                        return Err(Pric3Error::Model(format!(
                            "update drives {} to {v}, outside [{lower}, {upper}]",
                            assignment.variable
                        )));
                    }
                }
                (VarKind::Bool, Value::Bool(_)) => {}
                _ => {
                    return Err(Pric3Error::Model(format!(
                        "update assigns a value of the wrong type to {}",
                        assignment.variable
                    )));
                }
            }
            next[idx] = value;
        }
        Ok(next)
    }

    pub fn enabled_commands(&self, valuation: &[Value]) -> Result<Vec<usize>> {
        let mut enabled = vec![];
        for (idx, command) in self.commands.iter().enumerate() {
            let holds = command
                .guard
                .eval(self, valuation)?
                .as_bool()
                .ok_or_else(|| Pric3Error::Model(format!("guard of command {idx} is not boolean")))?;
            if holds {
                enabled.push(idx);
            }
        }
        Ok(enabled)
    }

    pub fn is_goal_valuation(&self, valuation: &[Value]) -> Result<bool> {
        self.goal
            .eval(self, valuation)?
            .as_bool()
            .ok_or_else(|| Pric3Error::Model("goal expression is not boolean".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_program() -> Program {
        Program {
            name: "tiny".into(),
            model_type: ModelType::Dtmc,
            variables: vec![Variable {
                name: "c".into(),
                kind: VarKind::Int { lower: 0, upper: 3 },
                initial: Value::Int(0),
            }],
            commands: vec![Command {
                name: None,
                guard: Expr::Lt(Box::new(Expr::var("c")), Box::new(Expr::Int(3))),
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
                        assignments: vec![],
                    },
                ],
            }],
            goal: Expr::Eq(Box::new(Expr::var("c")), Box::new(Expr::Int(3))),
        }
    }

    #[test]
    fn evaluates_guards_and_updates() {
        let program = tiny_program();
        program.validate().unwrap();
        let valuation = program.initial_valuation();
        assert_eq!(program.enabled_commands(&valuation).unwrap(), vec![0]);
        let next = program
            .apply_update(&valuation, &program.commands[0].updates[0])
            .unwrap();
        assert_eq!(next, vec![Value::Int(1)]);
        assert!(!program.is_goal_valuation(&next).unwrap());
        assert!(program
            .is_goal_valuation(&[Value::Int(3)])
            .unwrap());
    }

    #[test]
    fn rejects_bad_probability_sums() {
        let mut program = tiny_program();
        program.commands[0].updates[0].probability = Probability::from_ratio(1, 3);
        assert!(matches!(program.validate(), Err(Pric3Error::Model(_))));
    }

    #[test]
    fn round_trips_through_json() {
        let program = tiny_program();
        let raw = serde_json::to_string(&program).unwrap();
        let back: Program = serde_json::from_str(&raw).unwrap();
        back.validate().unwrap();
        assert_eq!(back.commands.len(), program.commands.len());
        assert_eq!(back.goal, program.goal);
    }
}
