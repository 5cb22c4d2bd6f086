//! Per-state average power decomposition.
//!
//! Every trace sample says which firmware states were active during an
//! interval and how much power the node drew over it. Treating the node's
//! power as the sum of the power of its active states plus a constant
//! baseline gives an overdetermined linear system, one row per sample:
//!
//! ```text
//! power_i = sum_s active_is * P_s + P_const
//! ```
//!
//! Samples are weighted by `sqrt(power * elapsed)` so that long,
//! energy-heavy intervals dominate short noisy ones.
//!
//! States that are never active carry no information and make the system
//! singular, as do states that are always active (they are
//! indistinguishable from the constant term). Both kinds are folded out of
//! the design matrix before solving and reported separately.

use std::collections::BTreeMap;

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::energy::EnergyModel;
use crate::error::{MotebedError, Result};
use crate::trace::{CONST_STATE, TraceSample, TraceSampleFilter};

/// How the weighted least squares problem is solved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Solver {
    /// Closed form `(XᵗWX)⁻¹·XᵗW·y`. Fails on rank-deficient designs.
    #[default]
    NormalEquations,
    /// Minimise `‖W·X·β − W·y‖₂` subject to `β ≥ 0`. Requires the `nnls`
    /// feature; otherwise falls back to normal equations.
    NonNegative,
}

impl std::fmt::Display for Solver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NormalEquations => write!(f, "normal_equations"),
            Self::NonNegative => write!(f, "non_negative"),
        }
    }
}

/// Whether the constrained solver was compiled in.
pub fn non_negative_available() -> bool {
    cfg!(feature = "nnls")
}

/// Estimated power model of one node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PowerProfile {
    /// Average power per state, including `const`.
    pub state_power: BTreeMap<String, f64>,
    /// States never active in the trace.
    pub always_off: Vec<String>,
    /// States active in every sample, folded into `const`.
    pub always_on: Vec<String>,
    /// Total energy over total time across all admitted samples.
    pub average_power: f64,
}

/// Outcome of estimating one node.
#[derive(Debug, Clone, PartialEq)]
pub enum Estimate {
    Solved(PowerProfile),
    /// Not enough independent information to separate the states. The
    /// node's state power map should be cleared.
    Singular { reason: String },
}

// ---------------------------------------------------------------------------
// Regression problem
// ---------------------------------------------------------------------------

/// Weighted regression inputs built from the samples of one trace.
#[derive(Debug, Clone)]
pub struct RegressionProblem {
    /// One row per sample, one column per surviving state (last is `const`).
    pub design: DMatrix<f64>,
    /// Average power per sample.
    pub response: DVector<f64>,
    /// Diagonal of the weight matrix.
    pub weights: DVector<f64>,
    /// Column names, parallel to the design columns.
    pub states: Vec<String>,
    pub always_off: Vec<String>,
    pub always_on: Vec<String>,
    total_time: f64,
    total_energy: f64,
}

impl RegressionProblem {
    /// Convert samples to regression rows.
    ///
    /// Every sample is priced with `model`; a sample that cannot be priced
    /// (uncalibrated model) or prices negative aborts the node. Running
    /// totals include every sample, but only samples whose bitmap is `width`
    /// wide become rows.
    pub fn assemble<M: EnergyModel + ?Sized>(
        node: u32,
        samples: &[TraceSample],
        states: &[String],
        width: usize,
        model: &M,
    ) -> Result<Self> {
        let mut rows: Vec<&TraceSample> = Vec::with_capacity(samples.len());
        let mut response = Vec::with_capacity(samples.len());
        let mut weights = Vec::with_capacity(samples.len());
        let mut total_time = 0.0;
        let mut total_energy = 0.0;

        for sample in samples {
            let power = model.power(sample.icount, sample.elapsed).ok_or_else(|| {
                MotebedError::calibration(
                    node,
                    "node is not calibrated; load a calibration file first",
                )
            })?;
            if !(power >= 0.0 && power.is_finite()) {
                return Err(MotebedError::calibration(
                    node,
                    format!(
                        "invalid power {power} for icount {}, time {}",
                        sample.icount, sample.elapsed
                    ),
                ));
            }
            total_time += sample.elapsed;
            total_energy += power * sample.elapsed;
            if sample.width() == width {
                rows.push(sample);
                response.push(power);
                weights.push((power * sample.elapsed).sqrt());
            }
        }

        let design = DMatrix::from_fn(rows.len(), width, |r, c| f64::from(rows[r].active[c]));
        let mut names: Vec<String> = states.to_vec();
        names.push(CONST_STATE.to_string());

        Ok(Self {
            design,
            response: DVector::from_vec(response),
            weights: DVector::from_vec(weights),
            states: names,
            always_off: Vec::new(),
            always_on: Vec::new(),
            total_time,
            total_energy,
        })
    }

    pub fn rows(&self) -> usize {
        self.design.nrows()
    }

    /// Total energy over total time of every priced sample.
    pub fn average_power(&self) -> f64 {
        if self.total_time > 0.0 {
            self.total_energy / self.total_time
        } else {
            0.0
        }
    }

    /// Drop never-active and always-active state columns.
    ///
    /// Each original state is visited exactly once; removing a column shifts
    /// the later ones down, so the current column is the original index
    /// minus the number of columns removed so far. `const` is never folded.
    pub fn fold_degenerate(&mut self) {
        let rows = self.rows() as f64;
        let original = self.states.len().saturating_sub(1);
        let mut removed = 0usize;

        for i in 0..original {
            let col = i - removed;
            let sum = self.design.column(col).sum();
            let fold_into = if sum == 0.0 {
                &mut self.always_off
            } else if sum == rows {
                &mut self.always_on
            } else {
                continue;
            };
            fold_into.push(self.states.remove(col));
            let design = std::mem::replace(&mut self.design, DMatrix::zeros(0, 0));
            self.design = design.remove_column(col);
            removed += 1;
        }

        if removed > 0 {
            log::debug!(
                "folded {} degenerate state(s): off={:?} on={:?}",
                removed,
                self.always_off,
                self.always_on
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Estimator
// ---------------------------------------------------------------------------

/// Builds and solves the per-state power regression.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatePowerEstimator {
    solver: Solver,
}

impl StatePowerEstimator {
    pub fn new(solver: Solver) -> Self {
        Self { solver }
    }

    pub fn solver(&self) -> Solver {
        self.solver
    }

    /// Estimate from a trace, consuming the filter.
    ///
    /// Samples are compared against the widest bitmap the filter observed,
    /// so narrower samples from before a re-declared header are dropped.
    pub fn estimate_trace<I, M>(
        &self,
        node: u32,
        mut trace: TraceSampleFilter<I>,
        model: &M,
    ) -> Result<Estimate>
    where
        I: Iterator<Item = String>,
        M: EnergyModel + ?Sized,
    {
        let samples: Vec<TraceSample> = trace.by_ref().collect();
        let stats = trace.stats();
        log::debug!(
            "node {node}: {} samples accepted, {} malformed, {} zero-length",
            stats.accepted,
            stats.rejected_shape,
            stats.rejected_values
        );
        self.estimate_with_width(node, &samples, trace.states(), trace.max_width(), model)
    }

    /// Estimate from already parsed samples.
    pub fn estimate<M: EnergyModel + ?Sized>(
        &self,
        node: u32,
        samples: &[TraceSample],
        states: &[String],
        model: &M,
    ) -> Result<Estimate> {
        let width = samples.iter().map(TraceSample::width).max().unwrap_or(0);
        self.estimate_with_width(node, samples, states, width, model)
    }

    fn estimate_with_width<M: EnergyModel + ?Sized>(
        &self,
        node: u32,
        samples: &[TraceSample],
        states: &[String],
        width: usize,
        model: &M,
    ) -> Result<Estimate> {
        let mut problem = RegressionProblem::assemble(node, samples, states, width, model)?;

        if problem.rows() == 0 {
            return Ok(singular(node, "trace holds no usable samples".to_string()));
        }
        if width != states.len() + 1 {
            return Ok(singular(
                node,
                format!(
                    "{} declared states do not match sample width {width}",
                    states.len()
                ),
            ));
        }

        problem.fold_degenerate();

        let coefficients = match self.effective_solver() {
            #[cfg(feature = "nnls")]
            Solver::NonNegative => solve_non_negative(&problem),
            _ => match solve_normal_equations(&problem) {
                Some(beta) => beta,
                None => {
                    return Ok(singular(
                        node,
                        "state matrix is singular; not enough energy and state information was \
                         collected, run the application for longer"
                            .to_string(),
                    ));
                }
            },
        };

        let state_power = problem
            .states
            .iter()
            .cloned()
            .zip(coefficients.iter().copied())
            .collect();

        Ok(Estimate::Solved(PowerProfile {
            state_power,
            average_power: problem.average_power(),
            always_off: problem.always_off,
            always_on: problem.always_on,
        }))
    }

    fn effective_solver(&self) -> Solver {
        if self.solver == Solver::NonNegative && !non_negative_available() {
            log::warn!("non-negative solver not compiled in, using normal equations");
            return Solver::NormalEquations;
        }
        self.solver
    }
}

fn singular(node: u32, reason: String) -> Estimate {
    log::warn!("node {node}: {reason}");
    Estimate::Singular { reason }
}

/// `β = (XᵗWX)⁻¹·XᵗW·y`, or `None` if `XᵗWX` is (numerically) singular.
fn solve_normal_equations(problem: &RegressionProblem) -> Option<DVector<f64>> {
    let xtw = problem.design.transpose() * DMatrix::from_diagonal(&problem.weights);
    let normal = &xtw * &problem.design;

    let n = normal.nrows();
    let lu = normal.lu();
    let u = lu.u();
    let scale = u.diagonal().amax();
    let tolerance = scale * f64::EPSILON * n as f64;
    if scale == 0.0 || u.diagonal().iter().any(|d| d.abs() <= tolerance) {
        return None;
    }
    let inverse = lu.try_inverse()?;
    Some(inverse * xtw * &problem.response)
}

#[cfg(feature = "nnls")]
fn solve_non_negative(problem: &RegressionProblem) -> DVector<f64> {
    let w = DMatrix::from_diagonal(&problem.weights);
    let a = &w * &problem.design;
    let b = &w * &problem.response;
    nnls::solve(&a, &b)
}

#[cfg(feature = "nnls")]
mod nnls {
    //! Lawson–Hanson active set method for `min ‖A·x − b‖₂, x ≥ 0`.

    use nalgebra::{DMatrix, DVector};

    const TOLERANCE: f64 = 1e-10;

    pub fn solve(a: &DMatrix<f64>, b: &DVector<f64>) -> DVector<f64> {
        let n = a.ncols();
        let mut x = DVector::zeros(n);
        let mut passive = vec![false; n];
        let max_outer = 3 * n.max(1);

        for _ in 0..max_outer {
            let gradient = a.transpose() * (b - a * &x);
            let candidate = (0..n)
                .filter(|&j| !passive[j] && gradient[j] > TOLERANCE)
                .max_by(|&i, &j| gradient[i].total_cmp(&gradient[j]));
            let Some(j) = candidate else {
                break;
            };
            passive[j] = true;

            loop {
                let z = passive_least_squares(a, b, &passive);
                let infeasible: Vec<usize> =
                    (0..n).filter(|&i| passive[i] && z[i] <= 0.0).collect();
                if infeasible.is_empty() {
                    x = z;
                    break;
                }
                let alpha = infeasible
                    .iter()
                    .map(|&i| x[i] / (x[i] - z[i]))
                    .fold(f64::INFINITY, f64::min);
                x += (z - &x) * alpha;
                for i in 0..n {
                    if passive[i] && x[i] <= TOLERANCE {
                        passive[i] = false;
                        x[i] = 0.0;
                    }
                }
                if !passive.iter().any(|&p| p) {
                    break;
                }
            }
        }
        x
    }

    /// Unconstrained least squares over the passive columns, zero elsewhere.
    fn passive_least_squares(
        a: &DMatrix<f64>,
        b: &DVector<f64>,
        passive: &[bool],
    ) -> DVector<f64> {
        let columns: Vec<usize> = (0..passive.len()).filter(|&i| passive[i]).collect();
        let sub = a.select_columns(columns.iter());
        let mut z = DVector::zeros(passive.len());
        if let Ok(solution) = sub.svd(true, true).solve(b, TOLERANCE) {
            for (k, &col) in columns.iter().enumerate() {
                z[col] = solution[k];
            }
        }
        z
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_matches_unconstrained_when_positive() {
            let a = DMatrix::from_row_slice(3, 2, &[1.0, 0.0, 0.0, 1.0, 1.0, 1.0]);
            let b = DVector::from_vec(vec![2.0, 3.0, 5.0]);
            let x = solve(&a, &b);
            assert!((x[0] - 2.0).abs() < 1e-8);
            assert!((x[1] - 3.0).abs() < 1e-8);
        }

        #[test]
        fn test_clamps_negative_component() {
            // unconstrained optimum is x = (3, -1)
            let a = DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 0.0, 1.0]);
            let b = DVector::from_vec(vec![2.0, -1.0]);
            let x = solve(&a, &b);
            assert!(x.iter().all(|&v| v >= 0.0));
            assert!((x[0] - 2.0).abs() < 1e-8);
            assert!(x[1].abs() < 1e-8);
        }

        #[test]
        fn test_rank_deficient_does_not_fail() {
            let a = DMatrix::from_row_slice(3, 2, &[1.0, 1.0, 1.0, 1.0, 0.0, 0.0]);
            let b = DVector::from_vec(vec![4.0, 4.0, 0.0]);
            let x = solve(&a, &b);
            assert!(x.iter().all(|&v| v >= 0.0));
            assert!(((x[0] + x[1]) - 4.0).abs() < 1e-6);
        }
    }
}
