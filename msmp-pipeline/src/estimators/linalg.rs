//! Small dense linear algebra helpers

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};

const MAX_SWEEPS: usize = 100;

/// Eigen-decomposition of a symmetric matrix by cyclic Jacobi rotations
///
/// Returns eigenvalues in descending order and the matching unit
/// eigenvectors as the columns of the second element.
pub fn symmetric_eigen(matrix: ArrayView2<f64>) -> Result<(Vec<f64>, Array2<f64>), String> {
    let n = matrix.nrows();
    if n != matrix.ncols() {
        return Err(format!("matrix is {}x{}, not square", n, matrix.ncols()));
    }
    if matrix.iter().any(|v| !v.is_finite()) {
        return Err("matrix contains non-finite values".to_string());
    }

    let mut a = matrix.to_owned();
    let mut v = Array2::<f64>::eye(n);
    let total: f64 = a.iter().map(|x| x * x).sum();
    let mut converged = total == 0.0;

    for _ in 0..MAX_SWEEPS {
        if converged {
            break;
        }
        let off = off_diagonal_norm(&a);
        if off <= f64::EPSILON * f64::EPSILON * total {
            converged = true;
            break;
        }

        for p in 0..n {
            for q in (p + 1)..n {
                let apq = a[[p, q]];
                if apq == 0.0 {
                    continue;
                }
                let theta = (a[[q, q]] - a[[p, p]]) / (2.0 * apq);
                let t = theta.signum() / (theta.abs() + (theta * theta + 1.0).sqrt());
                let c = 1.0 / (t * t + 1.0).sqrt();
                let s = t * c;

                for k in 0..n {
                    let akp = a[[k, p]];
                    let akq = a[[k, q]];
                    a[[k, p]] = c * akp - s * akq;
                    a[[k, q]] = s * akp + c * akq;
                }
                for k in 0..n {
                    let apk = a[[p, k]];
                    let aqk = a[[q, k]];
                    a[[p, k]] = c * apk - s * aqk;
                    a[[q, k]] = s * apk + c * aqk;
                }
                for k in 0..n {
                    let vkp = v[[k, p]];
                    let vkq = v[[k, q]];
                    v[[k, p]] = c * vkp - s * vkq;
                    v[[k, q]] = s * vkp + c * vkq;
                }
            }
        }
    }

    if !converged && off_diagonal_norm(&a) > f64::EPSILON * f64::EPSILON * total {
        return Err(format!("Jacobi iteration did not converge in {} sweeps", MAX_SWEEPS));
    }

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&i, &j| a[[j, j]].total_cmp(&a[[i, i]]));

    let values = order.iter().map(|&i| a[[i, i]]).collect();
    let vectors = v.select(Axis(1), &order);
    Ok((values, vectors))
}

fn off_diagonal_norm(a: &Array2<f64>) -> f64 {
    let n = a.nrows();
    let mut off = 0.0;
    for p in 0..n {
        for q in 0..n {
            if p != q {
                off += a[[p, q]] * a[[p, q]];
            }
        }
    }
    off
}

/// `M^{-1/2}` of a symmetric positive semi-definite matrix, ignoring
/// eigenvalues at or below `epsilon`
pub fn inverse_sqrt(matrix: ArrayView2<f64>, epsilon: f64) -> Result<Array2<f64>, String> {
    let (values, vectors) = symmetric_eigen(matrix)?;
    let scale: Array1<f64> = values
        .iter()
        .map(|&s| if s > epsilon { 1.0 / s.sqrt() } else { 0.0 })
        .collect();
    let scaled = &vectors * &scale.insert_axis(Axis(0));
    Ok(scaled.dot(&vectors.t()))
}

/// Flip each column so that its largest-magnitude component is positive
pub fn canonical_signs(vectors: &mut Array2<f64>) {
    for mut column in vectors.columns_mut() {
        if leading_component(column.view()) < 0.0 {
            column.mapv_inplace(|x| -x);
        }
    }
}

fn leading_component(column: ArrayView1<f64>) -> f64 {
    column
        .iter()
        .copied()
        .fold(0.0, |best: f64, x| if x.abs() > best.abs() { x } else { best })
}

/// Squared Euclidean distance
pub fn squared_distance(a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
}
