//! Local linear surrogate shared by the image and text explainers.
//!
//! Perturbation rows are binary (feature kept = 1, removed = 0). Each row is
//! weighted by an exponential kernel over its cosine distance to the
//! unperturbed row, and a weighted ridge regression is fitted to the model's
//! score for the explained class.

/// Ridge penalty of the surrogate.
pub const RIDGE_ALPHA: f64 = 1.0;

#[derive(Debug, Clone, PartialEq)]
pub struct RidgeFit {
    pub coef: Vec<f64>,
    pub intercept: f64,
    /// Weighted R² on the training rows.
    pub score: f64,
}

/// Surrogate result: selected features ranked by |weight|, strongest first.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalExplanation {
    pub features: Vec<(usize, f64)>,
    pub intercept: f64,
    pub score: f64,
}

/// Cosine distance between a binary row and the all-ones row.
pub fn cosine_distance_to_original(row: &[f64]) -> f64 {
    let kept: f64 = row.iter().sum();
    if kept <= 0.0 || row.is_empty() {
        return 1.0;
    }
    let dot = kept;
    let norm_row = row.iter().map(|v| v * v).sum::<f64>().sqrt();
    let norm_ones = (row.len() as f64).sqrt();
    (1.0 - dot / (norm_row * norm_ones)).max(0.0)
}

/// `sqrt(exp(-d² / width²))`
pub fn exponential_kernel(distance: f64, width: f64) -> f64 {
    (-(distance * distance) / (width * width)).exp().sqrt()
}

/// Weighted ridge regression with an unpenalized intercept.
///
/// On weight-centred data, with `Z = W^½ Xc` and `t = W^½ yc`, solves
/// `(ZᵀZ + αI) β = Zᵀt` when there are no more features than rows, and the
/// equivalent kernel form `β = Zᵀ (ZZᵀ + αI)⁻¹ t` otherwise, so the linear
/// system is never larger than `min(n, p)`.
pub fn weighted_ridge(
    rows: &[Vec<f64>],
    targets: &[f64],
    weights: &[f64],
    alpha: f64,
) -> Result<RidgeFit, String> {
    let n = rows.len();
    if n == 0 || targets.len() != n || weights.len() != n {
        return Err(format!(
            "surrogate needs matching rows/targets/weights, got {n}/{}/{}",
            targets.len(),
            weights.len()
        ));
    }
    let p = rows[0].len();
    if rows.iter().any(|r| r.len() != p) {
        return Err("perturbation rows differ in length".into());
    }
    let total_weight: f64 = weights.iter().sum();
    if !(total_weight > 0.0) {
        return Err("all sample weights are zero".into());
    }

    let mut x_mean = vec![0.0; p];
    let mut y_mean = 0.0;
    for ((row, &y), &w) in rows.iter().zip(targets).zip(weights) {
        for (m, &x) in x_mean.iter_mut().zip(row) {
            *m += w * x;
        }
        y_mean += w * y;
    }
    x_mean.iter_mut().for_each(|m| *m /= total_weight);
    y_mean /= total_weight;

    let mut z = Vec::with_capacity(n);
    let mut t = Vec::with_capacity(n);
    for ((row, &y), &w) in rows.iter().zip(targets).zip(weights) {
        let sw = w.max(0.0).sqrt();
        z.push(
            row.iter()
                .zip(&x_mean)
                .map(|(&x, &m)| sw * (x - m))
                .collect::<Vec<f64>>(),
        );
        t.push(sw * (y - y_mean));
    }

    let coef = if p <= n {
        ridge_primal(&z, &t, p, alpha)?
    } else {
        ridge_dual(&z, &t, p, alpha)?
    };
    let intercept = y_mean - coef.iter().zip(&x_mean).map(|(b, m)| b * m).sum::<f64>();

    let mut ss_res = 0.0;
    let mut ss_tot = 0.0;
    for ((row, &y), &w) in rows.iter().zip(targets).zip(weights) {
        let fitted = intercept + coef.iter().zip(row).map(|(b, x)| b * x).sum::<f64>();
        ss_res += w * (y - fitted).powi(2);
        ss_tot += w * (y - y_mean).powi(2);
    }
    let score = if ss_tot > 0.0 {
        1.0 - ss_res / ss_tot
    } else if ss_res == 0.0 {
        1.0
    } else {
        0.0
    };

    Ok(RidgeFit {
        coef,
        intercept,
        score,
    })
}

/// Fit on all features, keep the `num_features` largest |coef|, refit on those.
pub fn explain_instance(
    rows: &[Vec<f64>],
    targets: &[f64],
    weights: &[f64],
    num_features: usize,
) -> Result<LocalExplanation, String> {
    let full = weighted_ridge(rows, targets, weights, RIDGE_ALPHA)?;
    let selected = top_by_magnitude(&full.coef, num_features);

    let reduced: Vec<Vec<f64>> = rows
        .iter()
        .map(|r| selected.iter().map(|&i| r[i]).collect())
        .collect();
    let fit = weighted_ridge(&reduced, targets, weights, RIDGE_ALPHA)?;

    let mut features: Vec<(usize, f64)> = selected.into_iter().zip(fit.coef).collect();
    features.sort_by(|a, b| b.1.abs().total_cmp(&a.1.abs()).then(a.0.cmp(&b.0)));

    Ok(LocalExplanation {
        features,
        intercept: fit.intercept,
        score: fit.score,
    })
}

/// `(ZᵀZ + αI) β = Zᵀt`, a p×p system.
fn ridge_primal(z: &[Vec<f64>], t: &[f64], p: usize, alpha: f64) -> Result<Vec<f64>, String> {
    let mut gram = vec![vec![0.0; p]; p];
    let mut rhs = vec![0.0; p];
    for (zr, &tr) in z.iter().zip(t) {
        for i in 0..p {
            let zi = zr[i];
            if zi == 0.0 {
                continue;
            }
            rhs[i] += zi * tr;
            for j in i..p {
                gram[i][j] += zi * zr[j];
            }
        }
    }
    for i in 0..p {
        gram[i][i] += alpha;
        for j in 0..i {
            gram[i][j] = gram[j][i];
        }
    }
    solve_spd(gram, rhs)
}

/// `β = Zᵀ (ZZᵀ + αI)⁻¹ t`, an n×n system.
fn ridge_dual(z: &[Vec<f64>], t: &[f64], p: usize, alpha: f64) -> Result<Vec<f64>, String> {
    let n = z.len();
    let mut kernel = vec![vec![0.0; n]; n];
    for i in 0..n {
        for j in i..n {
            let dot: f64 = z[i].iter().zip(&z[j]).map(|(a, b)| a * b).sum();
            kernel[i][j] = dot;
            kernel[j][i] = dot;
        }
        kernel[i][i] += alpha;
    }
    let dual = solve_spd(kernel, t.to_vec())?;

    let mut coef = vec![0.0; p];
    for (zr, &a) in z.iter().zip(&dual) {
        for (c, &zv) in coef.iter_mut().zip(zr) {
            *c += a * zv;
        }
    }
    Ok(coef)
}

fn top_by_magnitude(coef: &[f64], k: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..coef.len()).collect();
    order.sort_by(|&a, &b| coef[b].abs().total_cmp(&coef[a].abs()).then(a.cmp(&b)));
    order.truncate(k.min(coef.len()));
    order
}

/// Cholesky solve of a symmetric positive definite system.
fn solve_spd(mut a: Vec<Vec<f64>>, b: Vec<f64>) -> Result<Vec<f64>, String> {
    let n = b.len();
    for j in 0..n {
        let mut d = a[j][j];
        for k in 0..j {
            d -= a[j][k] * a[j][k];
        }
        if !(d > 0.0) {
            return Err("surrogate system is not positive definite".into());
        }
        let d = d.sqrt();
        a[j][j] = d;
        for i in (j + 1)..n {
            let mut s = a[i][j];
            for k in 0..j {
                s -= a[i][k] * a[j][k];
            }
            a[i][j] = s / d;
        }
    }

    // L y = b
    let mut y = b;
    for i in 0..n {
        for k in 0..i {
            y[i] -= a[i][k] * y[k];
        }
        y[i] /= a[i][i];
    }
    // Lᵀ x = y
    for i in (0..n).rev() {
        for k in (i + 1)..n {
            y[i] -= a[k][i] * y[k];
        }
        y[i] /= a[i][i];
    }
    Ok(y)
}
