//! Exact univariate interpolation over rationals.
//!
//! Candidate frame bounds over an interval of one variable are polynomials
//! through a handful of data points. The interpolation happens in exact
//! rational arithmetic and is only translated into a solver term once a
//! candidate exists.

use num_rational::BigRational;
use num_traits::{One, Zero};
use z3::{ast::Real, Context};

use crate::error::{Pric3Error, Result};

/// A polynomial with ascending rational coefficients.
#[derive(Clone, Debug, PartialEq)]
pub struct Polynomial {
    coeffs: Vec<BigRational>,
}

impl Polynomial {
    pub fn new(mut coeffs: Vec<BigRational>) -> Self {
        while coeffs.len() > 1 && coeffs.last().is_some_and(|c| c.is_zero()) {
            coeffs.pop();
        }
        if coeffs.is_empty() {
            coeffs.push(BigRational::zero());
        }
        Polynomial { coeffs }
    }

    pub fn constant(value: BigRational) -> Self {
        Polynomial::new(vec![value])
    }

    pub fn degree(&self) -> usize {
        self.coeffs.len() - 1
    }

    pub fn coefficients(&self) -> &[BigRational] {
        &self.coeffs
    }

    pub fn eval(&self, x: &BigRational) -> BigRational {
        let mut acc = BigRational::zero();
        for coeff in self.coeffs.iter().rev() {
            acc = acc * x + coeff;
        }
        acc
    }

    /// Horner form of the polynomial over `var`.
    pub fn to_z3<'ctx>(&self, ctx: &'ctx Context, var: &Real<'ctx>) -> Result<Real<'ctx>> {
        let lit = |c: &BigRational| -> Result<Real<'ctx>> {
            Real::from_real_str(ctx, &c.numer().to_string(), &c.denom().to_string())
                .ok_or_else(|| Pric3Error::Numeral(c.to_string()))
        };
        let mut acc = lit(self.coeffs.last().unwrap_or(&BigRational::zero()))?;
        for coeff in self.coeffs.iter().rev().skip(1) {
            acc = Real::add(ctx, &[&lit(coeff)?, &Real::mul(ctx, &[var, &acc])]);
        }
        Ok(acc)
    }
}

/// Lagrange interpolation through points with pairwise distinct abscissas.
#[derive(Debug, Default)]
pub struct Interpolator;

impl Interpolator {
    pub fn interpolate(&self, points: &[(BigRational, BigRational)]) -> Result<Polynomial> {
        if points.is_empty() {
            return Ok(Polynomial::constant(BigRational::zero()));
        }
        let n = points.len();
        let mut total = vec![BigRational::zero(); n];
        for (i, (xi, yi)) in points.iter().enumerate() {
            // Basis polynomial prod_{j != i} (x - x_j) / (x_i - x_j).
            let mut basis = vec![BigRational::one()];
            let mut denom = BigRational::one();
            for (j, (xj, _)) in points.iter().enumerate() {
                if i == j {
                    continue;
                }
                let diff = xi - xj;
                if diff.is_zero() {
                    return Err(Pric3Error::Numeral(format!(
                        "duplicate interpolation abscissa {xi}"
                    )));
                }
                denom *= diff;
                let mut next = vec![BigRational::zero(); basis.len() + 1];
                for (k, coeff) in basis.iter().enumerate() {
                    next[k + 1] += coeff;
                    next[k] -= coeff * xj;
                }
                basis = next;
            }
            let scale = yi / &denom;
            for (k, coeff) in basis.into_iter().enumerate() {
                total[k] += coeff * &scale;
            }
        }
        Ok(Polynomial::new(total))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_bigint::BigInt;

    fn r(n: i64, d: i64) -> BigRational {
        BigRational::new(BigInt::from(n), BigInt::from(d))
    }

    #[test]
    fn line_through_two_points() {
        let poly = Interpolator
            .interpolate(&[(r(0, 1), r(1, 2)), (r(4, 1), r(1, 1))])
            .unwrap();
        assert_eq!(poly.degree(), 1);
        assert_eq!(poly.eval(&r(0, 1)), r(1, 2));
        assert_eq!(poly.eval(&r(2, 1)), r(3, 4));
        assert_eq!(poly.eval(&r(4, 1)), r(1, 1));
    }

    #[test]
    fn parabola_through_three_points() {
        // y = x^2 on {0, 1, 3}.
        let poly = Interpolator
            .interpolate(&[(r(0, 1), r(0, 1)), (r(1, 1), r(1, 1)), (r(3, 1), r(9, 1))])
            .unwrap();
        assert_eq!(poly.degree(), 2);
        assert_eq!(poly.coefficients(), &[r(0, 1), r(0, 1), r(1, 1)]);
        assert_eq!(poly.eval(&r(5, 1)), r(25, 1));
    }

    #[test]
    fn collinear_points_collapse_the_degree() {
        let poly = Interpolator
            .interpolate(&[(r(0, 1), r(0, 1)), (r(1, 1), r(1, 4)), (r(2, 1), r(1, 2))])
            .unwrap();
        assert_eq!(poly.degree(), 1);
        assert_eq!(poly.eval(&r(2, 1)), r(1, 2));
    }

    #[test]
    fn duplicate_abscissas_are_rejected() {
        let result = Interpolator.interpolate(&[(r(1, 1), r(0, 1)), (r(1, 1), r(1, 1))]);
        assert!(result.is_err());
    }

    #[test]
    fn single_point_gives_a_constant() {
        let poly = Interpolator.interpolate(&[(r(7, 1), r(2, 3))]).unwrap();
        assert_eq!(poly.degree(), 0);
        assert_eq!(poly.eval(&r(100, 1)), r(2, 3));
    }
}
