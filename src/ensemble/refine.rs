//! Non-structural refinement: grid Gibbs over concentrations and column
//! hyperparameters. Views, row clusters and column placement stay fixed.

use rand::Rng;

use super::state::{crp_log_alpha, ColumnHypers, EnsembleState};

const GRID_POINTS: usize = 24;

fn log_grid(lo: f64, hi: f64, points: usize) -> Vec<f64> {
    let (lo, hi) = (lo.ln(), hi.ln());
    let step = (hi - lo) / (points - 1) as f64;
    (0..points).map(|i| (lo + step * i as f64).exp()).collect()
}

/// Draw a grid point with probability proportional to `exp(log_weight)`.
fn sample_grid<R: Rng>(grid: &[f64], log_weight: impl Fn(f64) -> f64, rng: &mut R) -> f64 {
    let weights: Vec<f64> = grid.iter().map(|x| log_weight(*x)).collect();
    let max = weights.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return grid[grid.len() / 2];
    }
    let weights: Vec<f64> = weights.iter().map(|w| (w - max).exp()).collect();
    let mut u = rng.gen::<f64>() * weights.iter().sum::<f64>();
    for (x, w) in grid.iter().zip(&weights) {
        if u < *w {
            return *x;
        }
        u -= w;
    }
    grid[grid.len() - 1]
}

impl EnsembleState {
    /// Run `passes` sweeps over column hyperparameters, view concentrations
    /// and the outer concentration.
    pub fn refine<R: Rng>(&mut self, passes: usize, rng: &mut R) {
        for _ in 0..passes {
            self.resample_column_hypers(rng);
            self.resample_view_alphas(rng);
            self.resample_alpha(rng);
        }
    }

    fn resample_column_hypers<R: Rng>(&mut self, rng: &mut R) {
        let beta_grid = log_grid(0.05, 20.0, GRID_POINTS);
        for rank in 0..self.hypers.len() {
            let clusters = &self.stats[rank];
            let next = match &self.hypers[rank] {
                ColumnHypers::Categorical { .. } => {
                    let beta = sample_grid(
                        &beta_grid,
                        |beta| {
                            let hypers = ColumnHypers::Categorical { beta };
                            clusters.values().map(|s| s.log_marginal(&hypers)).sum()
                        },
                        rng,
                    );
                    ColumnHypers::Categorical { beta }
                }
                ColumnHypers::Numeric {
                    mean,
                    prior_variance,
                    ..
                } => {
                    let (mean, prior_variance) = (*mean, *prior_variance);
                    let s_grid = log_grid(prior_variance * 1e-2, prior_variance * 1e2, GRID_POINTS);
                    let s = sample_grid(
                        &s_grid,
                        |s| {
                            let hypers = ColumnHypers::Numeric {
                                mean,
                                prior_variance,
                                s,
                            };
                            clusters.values().map(|st| st.log_marginal(&hypers)).sum()
                        },
                        rng,
                    );
                    ColumnHypers::Numeric {
                        mean,
                        prior_variance,
                        s,
                    }
                }
            };
            self.hypers[rank] = next;
        }
    }

    fn resample_view_alphas<R: Rng>(&mut self, rng: &mut R) {
        for view in self.views.values_mut() {
            let rows = view.assignments.len();
            let tables = view.num_clusters();
            let grid = log_grid(1.0 / (rows.max(1) as f64), rows.max(2) as f64, GRID_POINTS);
            view.alpha = sample_grid(&grid, |alpha| crp_log_alpha(alpha, tables, rows), rng);
        }
    }

    fn resample_alpha<R: Rng>(&mut self, rng: &mut R) {
        let columns = self.column_views.len();
        let tables = self.views.len();
        let grid = log_grid(1.0 / (columns.max(1) as f64), columns.max(2) as f64, GRID_POINTS);
        self.alpha = sample_grid(&grid, |alpha| crp_log_alpha(alpha, tables, columns), rng);
    }
}
