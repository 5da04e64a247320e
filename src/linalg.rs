//! Small dense linear-algebra helpers used by curve fitting ([`crate::perf_model`])
//! and by multivariate-normal sampling. Every matrix handled here is at most
//! a handful of rows (stage phases have 4-6 fit coefficients, cold-start
//! covariance blocks are per-stage), so plain `ndarray` with hand-rolled
//! Gaussian elimination and Cholesky is preferable to pulling in a LAPACK
//! binding for matrices this small.

use ndarray::{Array1, Array2};

/// Solve `a * x = b` for a square, well-conditioned `a` via Gaussian
/// elimination with partial pivoting. Returns `None` if `a` is singular to
/// working precision.
pub fn solve(a: &Array2<f64>, b: &Array1<f64>) -> Option<Array1<f64>> {
    let n = a.nrows();
    assert_eq!(a.ncols(), n, "solve: matrix must be square");
    assert_eq!(b.len(), n, "solve: rhs length mismatch");

    let mut m = a.clone();
    let mut rhs = b.clone();

    for col in 0..n {
        let pivot_row = (col..n)
            .max_by(|&r1, &r2| m[[r1, col]].abs().partial_cmp(&m[[r2, col]].abs()).unwrap())
            .unwrap();
        if m[[pivot_row, col]].abs() < 1e-12 {
            return None;
        }
        if pivot_row != col {
            for k in 0..n {
                m.swap((col, k), (pivot_row, k));
            }
            rhs.swap(col, pivot_row);
        }
        let pivot = m[[col, col]];
        for row in (col + 1)..n {
            let factor = m[[row, col]] / pivot;
            if factor == 0.0 {
                continue;
            }
            for k in col..n {
                m[[row, k]] -= factor * m[[col, k]];
            }
            rhs[row] -= factor * rhs[col];
        }
    }

    let mut x = Array1::zeros(n);
    for row in (0..n).rev() {
        let mut sum = rhs[row];
        for k in (row + 1)..n {
            sum -= m[[row, k]] * x[k];
        }
        x[row] = sum / m[[row, row]];
    }
    Some(x)
}

/// Lower-triangular Cholesky factor `l` such that `l * l^T = a`, for a
/// symmetric positive-definite `a`. Returns `None` if a non-positive pivot
/// is encountered (covariance estimate is degenerate).
pub fn cholesky(a: &Array2<f64>) -> Option<Array2<f64>> {
    let n = a.nrows();
    assert_eq!(a.ncols(), n, "cholesky: matrix must be square");
    let mut l = Array2::<f64>::zeros((n, n));

    for i in 0..n {
        for j in 0..=i {
            let mut sum = a[[i, j]];
            for k in 0..j {
                sum -= l[[i, k]] * l[[j, k]];
            }
            if i == j {
                if sum <= 0.0 {
                    return None;
                }
                l[[i, j]] = sum.sqrt();
            } else {
                l[[i, j]] = sum / l[[j, j]];
            }
        }
    }
    Some(l)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn solve_recovers_known_solution() {
        let a = array![[4.0, 1.0], [1.0, 3.0]];
        let x_true = array![1.5, -0.5];
        let b = a.dot(&x_true);
        let x = solve(&a, &b).expect("solvable");
        for i in 0..2 {
            assert!((x[i] - x_true[i]).abs() < 1e-9);
        }
    }

    #[test]
    fn solve_detects_singular_matrix() {
        let a = array![[1.0, 2.0], [2.0, 4.0]];
        let b = array![1.0, 2.0];
        assert!(solve(&a, &b).is_none());
    }

    #[test]
    fn cholesky_reconstructs_matrix() {
        let a = array![[4.0, 2.0], [2.0, 3.0]];
        let l = cholesky(&a).expect("spd");
        let reconstructed = l.dot(&l.t());
        for i in 0..2 {
            for j in 0..2 {
                assert!((reconstructed[[i, j]] - a[[i, j]]).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn cholesky_rejects_indefinite_matrix() {
        let a = array![[1.0, 2.0], [2.0, 1.0]];
        assert!(cholesky(&a).is_none());
    }
}
