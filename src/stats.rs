//! Correlation statistics with two-sided p-values
//!
//! Conventions follow scipy: constant input gives NaN, Pearson's p-value
//! uses Student's t with `n - 2` degrees of freedom. Kendall's tau-b p-value
//! is exact for untied samples of at most 33 (or with at most one discordant
//! pair), and the tie-corrected normal approximation otherwise.

use anyhow::Result;
use statrs::distribution::{ContinuousCDF, Normal, StudentsT};

/// Coefficient and two-sided p-value
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Correlation {
    pub r: f64,
    pub p: f64,
}

impl Correlation {
    fn nan() -> Self {
        Self {
            r: f64::NAN,
            p: f64::NAN,
        }
    }
}

fn check_pair(x: &[f64], y: &[f64]) -> Result<()> {
    anyhow::ensure!(
        x.len() == y.len(),
        "Length mismatch: {} vs {}",
        x.len(),
        y.len()
    );
    anyhow::ensure!(x.len() >= 2, "Need at least two observations, got {}", x.len());
    Ok(())
}

pub fn mean(x: &[f64]) -> f64 {
    x.iter().sum::<f64>() / x.len() as f64
}

/// Pearson product-moment correlation
pub fn pearson(x: &[f64], y: &[f64]) -> Result<Correlation> {
    check_pair(x, y)?;
    let n = x.len();
    let (mx, my) = (mean(x), mean(y));
    let mut sxy = 0.0;
    let mut sxx = 0.0;
    let mut syy = 0.0;
    for (a, b) in x.iter().zip(y) {
        let (dx, dy) = (a - mx, b - my);
        sxy += dx * dy;
        sxx += dx * dx;
        syy += dy * dy;
    }
    if sxx == 0.0 || syy == 0.0 {
        return Ok(Correlation::nan());
    }
    let r = (sxy / (sxx.sqrt() * syy.sqrt())).clamp(-1.0, 1.0);

    if n == 2 {
        return Ok(Correlation { r, p: 1.0 });
    }
    let dof = (n - 2) as f64;
    let p = if (1.0 - r.abs()) < f64::EPSILON {
        0.0
    } else {
        let t = r * (dof / (1.0 - r * r)).sqrt();
        let dist = StudentsT::new(0.0, 1.0, dof)?;
        2.0 * (1.0 - dist.cdf(t.abs()))
    };
    Ok(Correlation { r, p })
}

/// Sizes of the groups of equal values
fn tie_groups(x: &[f64]) -> Vec<usize> {
    let mut sorted: Vec<f64> = x.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mut groups = Vec::new();
    let mut run = 1;
    for w in sorted.windows(2) {
        if w[0] == w[1] {
            run += 1;
        } else {
            groups.push(run);
            run = 1;
        }
    }
    groups.push(run);
    groups
}

/// Two-sided p-value of Kendall's tau for `n` untied pairs with `c`
/// discordant (or concordant, whichever is fewer) pairs: the share of
/// permutations of `n` with at most `c` inversions, doubled
fn kendall_p_exact(n: usize, c: usize) -> f64 {
    let factorial = |m: usize| (2..=m).map(|i| i as f64).product::<f64>();
    let p = if n <= 2 {
        1.0
    } else if c == 0 {
        2.0 / factorial(n)
    } else if c == 1 {
        2.0 / factorial(n - 1)
    } else if 4 * c == n * (n - 1) {
        1.0
    } else {
        // counts[k]: permutations of j items with k inversions, k <= c
        let mut counts = vec![0u128; c + 1];
        counts[0] = 1;
        counts[1] = 1;
        for j in 3..=n {
            let prev = counts.clone();
            let mut window = 0u128;
            for k in 0..=c {
                window += prev[k];
                if k >= j {
                    window -= prev[k - j];
                }
                counts[k] = window;
            }
        }
        2.0 * counts.iter().sum::<u128>() as f64 / factorial(n)
    };
    p.clamp(0.0, 1.0)
}

/// Kendall's tau-b
pub fn kendall_tau(x: &[f64], y: &[f64]) -> Result<Correlation> {
    check_pair(x, y)?;
    let n = x.len();

    let mut concordant: i64 = 0;
    let mut discordant: i64 = 0;
    for i in 0..n {
        for j in (i + 1)..n {
            let dx = x[i] - x[j];
            let dy = y[i] - y[j];
            let s = dx * dy;
            if s > 0.0 {
                concordant += 1;
            } else if s < 0.0 {
                discordant += 1;
            }
        }
    }

    let nf = n as f64;
    let n0 = nf * (nf - 1.0) / 2.0;
    let tx = tie_groups(x);
    let ty = tie_groups(y);
    let pairs = |g: &[usize]| g.iter().map(|&t| (t * (t - 1)) as f64 / 2.0).sum::<f64>();
    let (n1, n2) = (pairs(&tx), pairs(&ty));
    if n1 == n0 || n2 == n0 {
        return Ok(Correlation::nan());
    }

    let s = (concordant - discordant) as f64;
    let tau = (s / ((n0 - n1) * (n0 - n2)).sqrt()).clamp(-1.0, 1.0);

    let total = (n * (n - 1) / 2) as i64;
    let fewer = discordant.min(total - discordant) as usize;
    let untied = tx.len() == n && ty.len() == n;
    if untied && (n <= 33 || fewer <= 1) {
        return Ok(Correlation {
            r: tau,
            p: kendall_p_exact(n, fewer),
        });
    }

    let v = |g: &[usize], f: fn(f64) -> f64| g.iter().map(|&t| f(t as f64)).sum::<f64>();
    let v0 = nf * (nf - 1.0) * (2.0 * nf + 5.0);
    let vt = v(&tx, |t| t * (t - 1.0) * (2.0 * t + 5.0));
    let vu = v(&ty, |u| u * (u - 1.0) * (2.0 * u + 5.0));
    let v1 = v(&tx, |t| t * (t - 1.0)) * v(&ty, |u| u * (u - 1.0));
    let v2 = v(&tx, |t| t * (t - 1.0) * (t - 2.0)) * v(&ty, |u| u * (u - 1.0) * (u - 2.0));
    let mut var = (v0 - vt - vu) / 18.0 + v1 / (2.0 * nf * (nf - 1.0));
    if n > 2 {
        var += v2 / (9.0 * nf * (nf - 1.0) * (nf - 2.0));
    }

    let p = if var <= 0.0 {
        f64::NAN
    } else {
        let z = s / var.sqrt();
        let normal = Normal::new(0.0, 1.0)?;
        (2.0 * (1.0 - normal.cdf(z.abs()))).min(1.0)
    };
    Ok(Correlation { r: tau, p })
}

/// All-pairs correlation of the rows of `rows`
pub fn correlation_matrix(
    rows: &[Vec<f64>],
    func: fn(&[f64], &[f64]) -> Result<Correlation>,
) -> Result<(Vec<Vec<f64>>, Vec<Vec<f64>>)> {
    let mut r = Vec::with_capacity(rows.len());
    let mut p = Vec::with_capacity(rows.len());
    for a in rows {
        let mut r_row = Vec::with_capacity(rows.len());
        let mut p_row = Vec::with_capacity(rows.len());
        for b in rows {
            let c = func(a, b)?;
            r_row.push(c.r);
            p_row.push(c.p);
        }
        r.push(r_row);
        p.push(p_row);
    }
    Ok((r, p))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pearson_known_value() {
        let x = [1.0, 2.0, 3.0, 4.0, 5.0];
        let y = [2.0, 4.0, 5.0, 4.0, 5.0];
        let c = pearson(&x, &y).unwrap();
        assert!((c.r - 0.774_596_669).abs() < 1e-6);
        // scipy.stats.pearsonr -> pvalue 0.1240...
        assert!((c.p - 0.124_030_1).abs() < 1e-4);
    }

    #[test]
    fn test_pearson_perfect_and_constant() {
        let x = [1.0, 2.0, 3.0];
        let c = pearson(&x, &[3.0, 2.0, 1.0]).unwrap();
        assert!((c.r + 1.0).abs() < 1e-12);
        assert_eq!(c.p, 0.0);

        let c = pearson(&x, &[1.0, 1.0, 1.0]).unwrap();
        assert!(c.r.is_nan() && c.p.is_nan());
    }

    #[test]
    fn test_kendall_no_ties() {
        let x = [1.0, 2.0, 3.0, 4.0, 5.0];
        let y = [3.0, 1.0, 2.0, 5.0, 4.0];
        let c = kendall_tau(&x, &y).unwrap();
        // C = 7, D = 3
        assert!((c.r - 0.4).abs() < 1e-12);
        // 29 of 120 permutations have at most 3 inversions
        assert!((c.p - 58.0 / 120.0).abs() < 1e-12);
    }

    #[test]
    fn test_kendall_exact_small_samples() {
        // scipy.stats.kendalltau -> pvalue 0.0833 (2 / 4!)
        let c = kendall_tau(&[1.0, 2.0, 3.0, 4.0], &[1.0, 2.0, 3.0, 4.0]).unwrap();
        assert!((c.r - 1.0).abs() < 1e-12);
        assert!((c.p - 2.0 / 24.0).abs() < 1e-12);

        // scipy.stats.kendalltau -> pvalue 0.2333
        let x = [1.0, 2.0, 3.0, 4.0, 5.0];
        let c = kendall_tau(&x, &[2.0, 1.0, 4.0, 3.0, 5.0]).unwrap();
        assert!((c.r - 0.6).abs() < 1e-12);
        assert!((c.p - 28.0 / 120.0).abs() < 1e-12);

        // reversed order mirrors the p-value
        let c = kendall_tau(&x, &[5.0, 4.0, 3.0, 2.0, 1.0]).unwrap();
        assert!((c.p - 2.0 / 120.0).abs() < 1e-12);

        // half the pairs discordant
        let c = kendall_tau(&[1.0, 2.0], &[2.0, 1.0]).unwrap();
        assert_eq!(c.p, 1.0);
    }

    #[test]
    fn test_kendall_ties_use_normal_approximation() {
        let x = [1.0, 1.0, 2.0, 3.0, 4.0];
        let y = [1.0, 2.0, 3.0, 4.0, 5.0];
        let c = kendall_tau(&x, &y).unwrap();
        assert!(c.p > 0.0 && c.p < 0.1);
    }

    #[test]
    fn test_kendall_with_ties() {
        let x = [1.0, 1.0, 2.0, 3.0];
        let y = [1.0, 2.0, 2.0, 3.0];
        let c = kendall_tau(&x, &y).unwrap();
        // C = 4, D = 0, n0 = 6, n1 = n2 = 1
        assert!((c.r - 0.8).abs() < 1e-12);
    }

    #[test]
    fn test_coefficients_bounded() {
        let x = [0.3, -1.2, 5.5, 2.2, 0.0, 9.1];
        let y = [1.0, 0.5, 4.4, -3.0, 2.0, 8.0];
        let funcs: [fn(&[f64], &[f64]) -> Result<Correlation>; 2] = [pearson, kendall_tau];
        for f in funcs {
            let c = f(&x, &y).unwrap();
            assert!((-1.0..=1.0).contains(&c.r));
            assert!((0.0..=1.0).contains(&c.p));
        }
    }

    #[test]
    fn test_length_mismatch_is_error() {
        assert!(pearson(&[1.0, 2.0], &[1.0]).is_err());
        assert!(kendall_tau(&[1.0], &[1.0]).is_err());
    }

    #[test]
    fn test_correlation_matrix_diagonal() {
        let rows = vec![vec![1.0, 2.0, 3.0], vec![3.0, 1.0, 2.0]];
        let (r, p) = correlation_matrix(&rows, pearson).unwrap();
        assert!((r[0][0] - 1.0).abs() < 1e-12);
        assert!((r[0][1] - r[1][0]).abs() < 1e-12);
        assert_eq!(p.len(), 2);
    }
}
