use argmin::core::observers::{ObserverMode, SlogLogger};
use argmin::core::{CostFunction, Executor, State, TerminationReason, TerminationStatus};
use argmin::solver::neldermead::NelderMead;
use ndarray::Array1;

use crate::errors::{CalibrationError, Result};
use crate::math::Bounds;

/// Cost reported for points at which the model cannot be evaluated. Far above any pooled RMSE in
/// percent, so the simplex contracts away from such points.
pub(crate) const INFEASIBLE_COST: f64 = 1e6;

/// Step of the initial simplex along a bounded coordinate, in logit units
const BOUNDED_STEP: f64 = 1.0;

/// Relative step of the initial simplex along an unbounded coordinate
const UNBOUNDED_STEP: f64 = 0.05;

/// Iterations between two lines of the terminal observer
const REPORT_EVERY: u64 = 500;

/// A scalar function of the full (external) value vector, to be minimised.
pub(crate) trait Objective {
    /// # Errors
    /// [`CalibrationError::InfeasibleParameters`] marks points outside the model domain, any
    /// other error aborts the minimisation.
    fn value(&self, values: &Array1<f64>) -> Result<f64>;
}

pub(crate) struct SolverOptions {
    pub(crate) max_iterations: u64,
    /// Standard deviation of the simplex costs below which the run terminates
    pub(crate) tolerance: f64,
    pub(crate) verbose: bool,
}

#[derive(Clone, Debug)]
pub(crate) struct Solution {
    pub(crate) values: Array1<f64>,
    pub(crate) cost: f64,
    pub(crate) iterations: u64,
    pub(crate) converged: bool,
}

/// A box-constrained minimisation problem.
///
/// `argmin`'s Nelder-Mead is unconstrained, so the problem exposes an internal coordinate per
/// variable (see [`Bounds`]) and maps back to the external values before every evaluation of
/// the objective.
pub(crate) struct Problem<O> {
    objective: O,
    bounds: Vec<Bounds>,
}

impl<O: Objective> Problem<O> {
    pub(crate) fn new(objective: O, bounds: Vec<Bounds>) -> Self {
        Self { objective, bounds }
    }

    fn to_external(&self, internal: &Array1<f64>) -> Array1<f64> {
        to_external(&self.bounds, internal)
    }

    /// The starting vertex plus one vertex displaced along each coordinate. Displacements along
    /// bounded coordinates point towards the middle of the interval.
    fn initial_simplex(&self, initial: &Array1<f64>) -> Vec<Array1<f64>> {
        let origin: Array1<f64> = self
            .bounds
            .iter()
            .zip(initial)
            .map(|(bounds, &x)| bounds.to_internal(x))
            .collect();

        let mut simplex = Vec::with_capacity(origin.len() + 1);
        simplex.push(origin.clone());
        for (ii, bounds) in self.bounds.iter().enumerate() {
            let mut vertex = origin.clone();
            vertex[ii] += match bounds {
                Bounds::Interval { .. } => {
                    if origin[ii] > 0.0 {
                        -BOUNDED_STEP
                    } else {
                        BOUNDED_STEP
                    }
                }
                Bounds::Unbounded if origin[ii] == 0.0 => UNBOUNDED_STEP,
                Bounds::Unbounded => origin[ii] * UNBOUNDED_STEP,
            };
            simplex.push(vertex);
        }
        simplex
    }
}

impl<O: Objective> Problem<O> {
    /// Run Nelder-Mead from `initial` (external values).
    ///
    /// Exhausting `max_iterations` is not an error, the best point found is returned with
    /// `converged` unset. Only a stop on the simplex tolerance counts as converged.
    ///
    /// # Errors
    /// - [`CalibrationError::LengthMismatch`] if `initial` does not have one value per variable
    /// - Any non-domain error raised by the objective
    pub(crate) fn solve(self, initial: &Array1<f64>, options: &SolverOptions) -> Result<Solution> {
        if initial.len() != self.bounds.len() {
            return Err(CalibrationError::LengthMismatch {
                expected: self.bounds.len(),
                found: initial.len(),
            });
        }
        let bounds = self.bounds.clone();
        let simplex = self.initial_simplex(initial);

        let solver = NelderMead::new(simplex).with_sd_tolerance(options.tolerance)?;

        let mut executor = Executor::new(self, solver)
            .configure(|state| state.max_iters(options.max_iterations));
        if options.verbose {
            executor = executor.add_observer(SlogLogger::term(), ObserverMode::Every(REPORT_EVERY));
        }
        let res = executor.run()?;

        let state = res.state();
        let best = state
            .get_best_param()
            .ok_or_else(|| CalibrationError::Optimiser {
                text: "the minimiser finished without a best point".to_owned(),
            })?;
        let converged = matches!(
            state.get_termination_status(),
            TerminationStatus::Terminated(
                TerminationReason::SolverConverged | TerminationReason::TargetCostReached
            )
        );

        Ok(Solution {
            values: to_external(&bounds, best),
            cost: state.get_best_cost(),
            iterations: state.get_iter(),
            converged,
        })
    }
}

fn to_external(bounds: &[Bounds], internal: &Array1<f64>) -> Array1<f64> {
    bounds
        .iter()
        .zip(internal)
        .map(|(bounds, &z)| bounds.to_external(z))
        .collect()
}

impl<O: Objective> CostFunction for Problem<O> {
    type Param = Array1<f64>;
    type Output = f64;

    fn cost(&self, p: &Self::Param) -> ::std::result::Result<Self::Output, argmin::core::Error> {
        match self.objective.value(&self.to_external(p)) {
            Ok(cost) if cost.is_finite() => Ok(cost),
            Ok(_) | Err(CalibrationError::InfeasibleParameters { .. }) => Ok(INFEASIBLE_COST),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use ndarray::{array, Array1};

    use super::{Objective, Problem, SolverOptions, INFEASIBLE_COST};
    use crate::errors::{CalibrationError, Result};
    use crate::math::Bounds;

    /// 100 * ((x0 - 3)^2 + (x1 + 1)^2), infeasible for x1 > 5
    struct Bowl;

    impl Objective for Bowl {
        fn value(&self, values: &Array1<f64>) -> Result<f64> {
            if values[1] > 5.0 {
                return Err(CalibrationError::infeasible("x1 too large"));
            }
            Ok(100.0 * ((values[0] - 3.0).powi(2) + (values[1] + 1.0).powi(2)))
        }
    }

    struct Broken;

    impl Objective for Broken {
        fn value(&self, values: &Array1<f64>) -> Result<f64> {
            Err(CalibrationError::LengthMismatch {
                expected: 3,
                found: values.len(),
            })
        }
    }

    fn options() -> SolverOptions {
        SolverOptions {
            max_iterations: 2_000,
            tolerance: 1e-12,
            verbose: false,
        }
    }

    #[test]
    fn bounded_minimum_sits_on_the_edge_of_the_box() {
        let problem = Problem::new(Bowl, vec![Bounds::band(2.0, Some(0.1)), Bounds::Unbounded]);
        let solution = problem.solve(&array![2.0, 2.0], &options()).unwrap();

        assert!(solution.values[0] <= 2.2);
        approx::assert_relative_eq!(solution.values[0], 2.2, epsilon = 1e-3);
        approx::assert_relative_eq!(solution.values[1], -1.0, epsilon = 1e-3);
        approx::assert_relative_eq!(solution.cost, 64.0, epsilon = 0.5);
    }

    #[test]
    fn infeasible_points_are_penalised_not_fatal() {
        let problem = Problem::new(Bowl, vec![Bounds::Unbounded, Bounds::Unbounded]);
        let cost = argmin::core::CostFunction::cost(&problem, &array![0.0, 6.0]).unwrap();
        approx::assert_relative_eq!(cost, INFEASIBLE_COST);
    }

    #[test]
    fn iteration_cap_returns_the_best_point_unconverged() {
        let problem = Problem::new(Bowl, vec![Bounds::Unbounded, Bounds::Unbounded]);
        let options = SolverOptions {
            max_iterations: 3,
            tolerance: 1e-12,
            verbose: false,
        };
        let solution = problem.solve(&array![10.0, 4.0], &options).unwrap();
        assert!(!solution.converged);
        assert!(solution.cost <= 100.0 * (49.0 + 25.0));
    }

    #[test]
    fn tolerance_stop_is_reported_as_converged() {
        let problem = Problem::new(Bowl, vec![Bounds::Unbounded, Bounds::Unbounded]);
        let options = SolverOptions {
            max_iterations: 2_000,
            tolerance: 1e-6,
            verbose: false,
        };
        let solution = problem.solve(&array![10.0, 4.0], &options).unwrap();
        assert!(solution.converged);
        assert!(solution.iterations < options.max_iterations);
        approx::assert_relative_eq!(solution.values[0], 3.0, epsilon = 1e-2);
    }

    #[test]
    fn objective_errors_abort_the_run() {
        let problem = Problem::new(Broken, vec![Bounds::Unbounded, Bounds::Unbounded]);
        let err = problem.solve(&array![1.0, 1.0], &options()).unwrap_err();
        assert!(matches!(err, CalibrationError::LengthMismatch { expected: 3, found: 2 }));
    }

    #[test]
    fn initial_vector_must_match_the_bounds() {
        let problem = Problem::new(Bowl, vec![Bounds::Unbounded, Bounds::Unbounded]);
        let err = problem.solve(&array![1.0], &options()).unwrap_err();
        assert!(matches!(err, CalibrationError::LengthMismatch { expected: 2, found: 1 }));
    }
}
