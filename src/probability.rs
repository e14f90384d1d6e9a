use std::{
    fmt,
    ops::{Add, Div, Mul, Sub},
    str::FromStr,
};

use num_bigint::BigInt;
use num_rational::BigRational;
use num_traits::{One, Signed, ToPrimitive, Zero};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use z3::{ast::Real, Context};

use crate::error::{Pric3Error, Result};

/// Identifier of an interned state in the explicit state graph.
/// Ids are assigned in encounter order, so runs are deterministic.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StateId(pub usize);

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// A filtered successor of a state: either some non-goal state, or the
/// collapsed goal marker that absorbs every goal-satisfying target.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Successor {
    Goal,
    State(StateId),
}

/// Exact probability, kept as an arbitrary-precision rational so that
/// frame bounds never drift. Parses both `"3/10"` and `"0.3"`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Probability(BigRational);

impl Probability {
    pub fn zero() -> Self {
        Probability(BigRational::zero())
    }

    pub fn one() -> Self {
        Probability(BigRational::one())
    }

    pub fn from_ratio(numer: i64, denom: i64) -> Self {
        Probability(BigRational::new(BigInt::from(numer), BigInt::from(denom)))
    }

    pub fn from_rational(value: BigRational) -> Self {
        Probability(value)
    }

    /// Closest rational to an `f64`, used by the numeric oracles.
    pub fn approximate(value: f64) -> Result<Self> {
        BigRational::from_float(value)
            .map(Probability)
            .ok_or_else(|| Pric3Error::Numeral(format!("{value}")))
    }

    pub fn as_rational(&self) -> &BigRational {
        &self.0
    }

    pub fn into_rational(self) -> BigRational {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn is_one(&self) -> bool {
        self.0.is_one()
    }

    pub fn is_negative(&self) -> bool {
        self.0.is_negative()
    }

    pub fn to_f64(&self) -> f64 {
        self.0.to_f64().unwrap_or(f64::NAN)
    }

    pub fn min(self, other: Self) -> Self {
        if self <= other {
            self
        } else {
            other
        }
    }

    /// Translates the rational into a z3 real numeral.
    pub fn to_z3<'ctx>(&self, ctx: &'ctx Context) -> Result<Real<'ctx>> {
        let numer = self.0.numer().to_string();
        let denom = self.0.denom().to_string();
        Real::from_real_str(ctx, &numer, &denom)
            .ok_or_else(|| Pric3Error::Numeral(format!("{self}")))
    }

    /// Reads a rational back out of a solver model value.
    pub fn from_model_real(numer: i64, denom: i64) -> Result<Self> {
        if denom == 0 {
            return Err(Pric3Error::Numeral(format!("{numer}/{denom}")));
        }
        Ok(Probability(BigRational::new(
            BigInt::from(numer),
            BigInt::from(denom),
        )))
    }
}

impl fmt::Display for Probability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.denom().is_one() {
            write!(f, "{}", self.0.numer())
        } else {
            write!(f, "{}/{}", self.0.numer(), self.0.denom())
        }
    }
}

impl FromStr for Probability {
    type Err = Pric3Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let parse_int =
            |digits: &str| BigInt::from_str(digits).map_err(|_| Pric3Error::ParseProbability(s.into()));
        if let Some((numer, denom)) = s.split_once('/') {
            let denom = parse_int(denom.trim())?;
            if denom.is_zero() {
                return Err(Pric3Error::ParseProbability(s.into()));
            }
            return Ok(Probability(BigRational::new(parse_int(numer.trim())?, denom)));
        }
        if let Some((int_part, frac_part)) = s.split_once('.') {
            let int_part = if int_part.is_empty() { "0" } else { int_part };
            let scale = BigInt::from(10u32).pow(frac_part.len() as u32);
            let frac = parse_int(frac_part)?;
            let whole = parse_int(int_part)?;
            let signed_frac = if whole.is_negative() || int_part.starts_with('-') {
                -frac
            } else {
                frac
            };
            return Ok(Probability(BigRational::new(whole * &scale + signed_frac, scale)));
        }
        Ok(Probability(BigRational::from(parse_int(s)?)))
    }
}

impl Add for Probability {
    type Output = Probability;
    fn add(self, rhs: Probability) -> Probability {
        Probability(self.0 + rhs.0)
    }
}

impl<'a> Add<&'a Probability> for &'a Probability {
    type Output = Probability;
    fn add(self, rhs: &'a Probability) -> Probability {
        Probability(&self.0 + &rhs.0)
    }
}

impl Sub for Probability {
    type Output = Probability;
    fn sub(self, rhs: Probability) -> Probability {
        Probability(self.0 - rhs.0)
    }
}

impl<'a> Sub<&'a Probability> for &'a Probability {
    type Output = Probability;
    fn sub(self, rhs: &'a Probability) -> Probability {
        Probability(&self.0 - &rhs.0)
    }
}

impl Mul for Probability {
    type Output = Probability;
    fn mul(self, rhs: Probability) -> Probability {
        Probability(self.0 * rhs.0)
    }
}

impl<'a> Mul<&'a Probability> for &'a Probability {
    type Output = Probability;
    fn mul(self, rhs: &'a Probability) -> Probability {
        Probability(&self.0 * &rhs.0)
    }
}

impl Div for Probability {
    type Output = Probability;
    fn div(self, rhs: Probability) -> Probability {
        Probability(self.0 / rhs.0)
    }
}

impl Serialize for Probability {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Probability {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fractions_and_decimals() {
        assert_eq!("3/10".parse::<Probability>().unwrap(), Probability::from_ratio(3, 10));
        assert_eq!("0.3".parse::<Probability>().unwrap(), Probability::from_ratio(3, 10));
        assert_eq!(".5".parse::<Probability>().unwrap(), Probability::from_ratio(1, 2));
        assert_eq!("1".parse::<Probability>().unwrap(), Probability::one());
        assert!("1/0".parse::<Probability>().is_err());
        assert!("x".parse::<Probability>().is_err());
    }

    #[test]
    fn arithmetic_stays_exact() {
        let third = Probability::from_ratio(1, 3);
        let sum = &third + &(&third + &third);
        assert!(sum.is_one());
        assert_eq!(
            Probability::from_ratio(1, 2) * Probability::from_ratio(2, 5),
            Probability::from_ratio(1, 5)
        );
    }

    #[test]
    fn display_round_trips_through_parse() {
        for p in [
            Probability::from_ratio(7, 13),
            Probability::zero(),
            Probability::one(),
        ] {
            assert_eq!(p.to_string().parse::<Probability>().unwrap(), p);
        }
    }
}
