//! Forward-mode automatic differentiation on top of `hyperdual`.
//!
//! Every differentiable quantity in the fitter is written once, generic
//! over a [`Real`] scalar, and evaluated either with `f64` or with nested
//! dual numbers:
//!
//! - `D1 = Dual<f64>`: one directional first derivative.
//! - `D2 = Dual<D1>`: value, two first derivatives and the mixed second
//!   derivative along two seed directions.
//! - `D3 = Dual<D2>`: adds a third seed and the mixed third derivative.
//!
//! The functions differentiated here are small (an observation's
//! log-density in at most four linear-predictor coordinates, one
//! covariance block, a prior), so directional seeding per coordinate pair
//! is cheaper than a reverse-mode tape.

use std::fmt::Debug;
use std::ops::{AddAssign, MulAssign, SubAssign};

use hyperdual::{Float, Hyperdual};

/// First-order dual number in one direction.
pub type Dual<T> = Hyperdual<T, 2>;
pub type D1 = Dual<f64>;
pub type D2 = Dual<D1>;
pub type D3 = Dual<D2>;

/// Scalar type accepted by differentiable code: `f64` or any nesting of
/// hyperdual numbers over it.
pub trait Real: Float + AddAssign + SubAssign + MulAssign + Debug + 'static {
    /// Lift a constant.
    fn cst(x: f64) -> Self {
        Self::from(x).unwrap_or_else(Self::nan)
    }

    /// Real part.
    fn re(&self) -> f64 {
        self.to_f64().unwrap_or(f64::NAN)
    }
}

impl<T> Real for T where T: Float + AddAssign + SubAssign + MulAssign + Debug + 'static {}

/// A scalar function of a real vector, differentiable through [`Real`].
pub trait ScalarFn {
    fn eval<T: Real>(&self, x: &[T]) -> T;
}

pub fn d1(x: f64, dx: f64) -> D1 {
    D1::from_slice(&[x, dx])
}

pub fn d2(x: f64, dx1: f64, dx2: f64) -> D2 {
    D2::from_slice(&[d1(x, dx1), d1(dx2, 0.0)])
}

pub fn d3(x: f64, dx1: f64, dx2: f64, dx3: f64) -> D3 {
    D3::from_slice(&[d2(x, dx1, dx2), d2(dx3, 0.0, 0.0)])
}

fn unit(i: usize, j: usize) -> f64 {
    if i == j {
        1.0
    } else {
        0.0
    }
}

/// Value of `f` at `x`.
pub fn value<F: ScalarFn>(f: &F, x: &[f64]) -> f64 {
    f.eval(x)
}

/// Value and gradient, one dual pass per coordinate.
pub fn gradient<F: ScalarFn>(f: &F, x: &[f64]) -> (f64, Vec<f64>) {
    let n = x.len();
    if n == 0 {
        return (f.eval(x), Vec::new());
    }
    let mut grad = vec![0.0; n];
    let mut val = 0.0;
    for i in 0..n {
        let xd: Vec<D1> = (0..n).map(|k| d1(x[k], unit(k, i))).collect();
        let out = f.eval(&xd);
        val = out[0];
        grad[i] = out[1];
    }
    (val, grad)
}

/// Directional derivative of `f` at `x` along `v`.
pub fn directional<F: ScalarFn>(f: &F, x: &[f64], v: &[f64]) -> (f64, f64) {
    let xd: Vec<D1> = x.iter().zip(v).map(|(&xi, &vi)| d1(xi, vi)).collect();
    let out = f.eval(&xd);
    (out[0], out[1])
}

/// Value, gradient and dense Hessian (row-major `n x n`), one
/// second-order pass per coordinate pair `i <= j`.
pub fn hessian<F: ScalarFn>(f: &F, x: &[f64]) -> (f64, Vec<f64>, Vec<f64>) {
    let n = x.len();
    let mut grad = vec![0.0; n];
    let mut hess = vec![0.0; n * n];
    let mut val = f.eval(x);
    for i in 0..n {
        for j in i..n {
            let xd: Vec<D2> = (0..n).map(|k| d2(x[k], unit(k, i), unit(k, j))).collect();
            let out = f.eval(&xd);
            let (lo, hi) = (out[0], out[1]);
            if i == j {
                val = lo[0];
                grad[i] = lo[1];
            }
            hess[i * n + j] = hi[1];
            hess[j * n + i] = hi[1];
        }
    }
    (val, grad, hess)
}

/// Contract the third-derivative tensor of `f` with a symmetric weight
/// matrix `w` (row-major `n x n`):
///
/// `t[c] = sum_{a,b} w[a,b] * d^3 f / (dx_a dx_b dx_c)`.
///
/// Zero rows of `w` are skipped, so only the coordinates that carry
/// weight cost third-order passes.
pub fn third_contraction<F: ScalarFn>(f: &F, x: &[f64], w: &[f64]) -> Vec<f64> {
    let n = x.len();
    assert_eq!(w.len(), n * n);
    let mut t = vec![0.0; n];
    for a in 0..n {
        for b in a..n {
            let wab = w[a * n + b];
            if wab == 0.0 {
                continue;
            }
            let mult = if a == b { wab } else { 2.0 * wab };
            for (c, tc) in t.iter_mut().enumerate() {
                let xd: Vec<D3> = (0..n)
                    .map(|k| d3(x[k], unit(k, a), unit(k, b), unit(k, c)))
                    .collect();
                let out = f.eval(&xd);
                *tc += mult * out[1][1][1];
            }
        }
    }
    t
}

#[cfg(test)]
mod tests {
    use super::*;

    /// f(x, y) = x^2 y + exp(x y)
    struct Poly;

    impl ScalarFn for Poly {
        fn eval<T: Real>(&self, x: &[T]) -> T {
            x[0] * x[0] * x[1] + (x[0] * x[1]).exp()
        }
    }

    #[test]
    fn test_gradient_matches_closed_form() {
        let (x, y) = (0.7, -0.4);
        let (v, g) = gradient(&Poly, &[x, y]);
        let e = (x * y).exp();
        assert!((v - (x * x * y + e)).abs() < 1e-12);
        assert!((g[0] - (2.0 * x * y + y * e)).abs() < 1e-12);
        assert!((g[1] - (x * x + x * e)).abs() < 1e-12);
    }

    #[test]
    fn test_hessian_matches_closed_form() {
        let (x, y) = (0.3, 1.1);
        let (_, _, h) = hessian(&Poly, &[x, y]);
        let e = (x * y).exp();
        assert!((h[0] - (2.0 * y + y * y * e)).abs() < 1e-12);
        assert!((h[1] - (2.0 * x + e + x * y * e)).abs() < 1e-12);
        assert!((h[1] - h[2]).abs() < 1e-15);
        assert!((h[3] - x * x * e).abs() < 1e-12);
    }

    #[test]
    fn test_third_contraction_single_entry() {
        // With w = e_0 e_0', t[c] = d^3 f / dx0 dx0 dxc.
        let (x, y) = (0.2, 0.5);
        let t = third_contraction(&Poly, &[x, y], &[1.0, 0.0, 0.0, 0.0]);
        let e = (x * y).exp();
        assert!((t[0] - y * y * y * e).abs() < 1e-12);
        assert!((t[1] - (2.0 + 2.0 * y * e + x * y * y * e)).abs() < 1e-12);
    }

    #[test]
    fn test_directional_is_gradient_dot() {
        let x = [0.4, 0.9];
        let v = [2.0, -1.0];
        let (_, g) = gradient(&Poly, &x);
        let (_, dv) = directional(&Poly, &x, &v);
        assert!((dv - (2.0 * g[0] - g[1])).abs() < 1e-12);
    }
}
