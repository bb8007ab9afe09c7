use statrs::distribution::{ContinuousCDF, Gamma};
use statrs::function::gamma::ln_gamma;

use crate::composition::SampleId;
use crate::errors::{CalibrationError, Result};
use crate::preparation::RegressionTable;

/// Cumulative probabilities which decrease by less than this are rounding noise in the
/// incomplete gamma function, not bins out of order
const ROUNDING_TOLERANCE: f64 = 1e-12;

/// Concrete values for every unknown entering one sample's evaluation
///
/// The three parameter gamma distribution over molecular weight is characterised by shape
/// $\alpha$, location $\eta$ and scale $\beta$. The scale is not an unknown of the fit, it follows
/// from the sample's mean heavy-end molecular weight $M_+$
///
/// $$
///     \beta = \frac{M_+ - \eta}{\alpha}
/// $$
#[derive(Clone, Debug, PartialEq)]
pub struct DistributionParameters {
    pub shape: f64,
    pub location: f64,
    pub mean_heavy_mw: f64,
    /// One upper molecular weight bound per row of the regression table, boundary row included
    pub upper_bounds: Vec<f64>,
}

impl DistributionParameters {
    #[must_use]
    pub fn scale(&self) -> f64 {
        (self.mean_heavy_mw - self.location) / self.shape
    }

    fn validate(&self, rows: usize) -> Result<()> {
        if self.upper_bounds.len() != rows {
            return Err(CalibrationError::LengthMismatch {
                expected: rows,
                found: self.upper_bounds.len(),
            });
        }
        if !(self.shape.is_finite() && self.shape > 0.0) {
            return Err(CalibrationError::infeasible(format!(
                "shape must be finite and positive, found {}",
                self.shape
            )));
        }
        let scale = self.scale();
        if !(scale.is_finite() && scale > 0.0) {
            return Err(CalibrationError::infeasible(format!(
                "scale must be finite and positive, found {scale}"
            )));
        }
        if let Some(bound) = self.upper_bounds.iter().find(|bound| !bound.is_finite()) {
            return Err(CalibrationError::infeasible(format!(
                "upper bounds must be finite, found {bound}"
            )));
        }
        Ok(())
    }
}

/// The model's view of one bin.
#[derive(Clone, Debug, PartialEq)]
pub struct BinPrediction {
    pub scn: String,
    pub upper_bound: f64,
    /// Reduced upper bound $(M - \eta) / \beta$
    pub y: f64,
    pub q: f64,
    /// Cumulative weight probability up to and including this bin
    pub p0: f64,
    /// Cumulative mole weighted probability up to and including this bin
    pub p1: f64,
    /// Conditional mean molecular weight of the bin, `None` on the boundary row and for bins
    /// carrying no probability mass
    pub molecular_weight: Option<f64>,
    pub mass: Option<f64>,
    /// Normalised predicted weight fraction `Wni`
    pub weight_fraction: Option<f64>,
    /// Mole-basis fraction `Zni`
    pub mole_fraction: Option<f64>,
    /// The lab target `wni_lab`, carried along for reporting
    pub lab_weight_fraction: Option<f64>,
}

/// Model prediction for every row of one sample's regression table.
#[derive(Clone, Debug, PartialEq)]
pub struct SamplePrediction {
    sample: SampleId,
    rows: Vec<BinPrediction>,
    total_mass: f64,
}

impl SamplePrediction {
    pub const fn sample(&self) -> &SampleId {
        &self.sample
    }

    /// Every row, boundary row first
    pub fn rows(&self) -> &[BinPrediction] {
        &self.rows
    }

    /// The heavy-end bins, without the boundary row
    pub fn bins(&self) -> &[BinPrediction] {
        &self.rows[1..]
    }

    /// Sum of the unnormalised bin masses `Wi`
    pub const fn total_mass(&self) -> f64 {
        self.total_mass
    }
}

/// Evaluate the discretised gamma distribution for one sample.
///
/// For each upper bound $M$ the cumulative probabilities are
///
/// $$
///     P_0(M) = \Gamma_{CDF}(M - \eta; \alpha, \beta), \quad
///     P_1(M) = P_0(M) - \frac{Q}{\alpha}, \quad
///     Q = \frac{e^{-y} y^\alpha}{\Gamma(\alpha)}
/// $$
///
/// and the conditional mean molecular weight of a bin is
/// $M_i = \eta + \alpha \beta \, \Delta P_1 / \Delta P_0$, its mass $W_i = M_i \Delta P_0$.
///
/// # Errors
/// - [`CalibrationError::LengthMismatch`] if `parameters` does not carry one bound per row
/// - [`CalibrationError::InfeasibleParameters`] if the parameters are outside the domain of the
///   model, or the bins are out of order
pub fn evaluate(
    table: &RegressionTable,
    parameters: &DistributionParameters,
) -> Result<SamplePrediction> {
    parameters.validate(table.rows().len())?;

    let alpha = parameters.shape;
    let eta = parameters.location;
    let beta = parameters.scale();
    let distribution = Gamma::new(alpha, 1.0 / beta)
        .map_err(|e| CalibrationError::infeasible(e.to_string()))?;
    let ln_gamma_alpha = ln_gamma(alpha);

    let mut rows: Vec<BinPrediction> = table
        .rows()
        .iter()
        .zip(&parameters.upper_bounds)
        .map(|(row, &upper_bound)| {
            let x = upper_bound - eta;
            let y = if x > 0.0 { x / beta } else { 0.0 };
            // exp(-y) y^alpha / Gamma(alpha), in log space so large `y` cannot overflow
            let q = if y > 0.0 {
                alpha.mul_add(y.ln(), -y - ln_gamma_alpha).exp()
            } else {
                0.0
            };
            let p0 = distribution.cdf(x);
            BinPrediction {
                scn: row.scn.clone(),
                upper_bound,
                y,
                q,
                p0,
                p1: p0 - q / alpha,
                molecular_weight: None,
                mass: None,
                weight_fraction: None,
                mole_fraction: None,
                lab_weight_fraction: row.normalised_weight_fraction,
            }
        })
        .collect();

    for ii in 1..rows.len() {
        let delta_p0 = rows[ii].p0 - rows[ii - 1].p0;
        let delta_p1 = rows[ii].p1 - rows[ii - 1].p1;
        if delta_p0 < -ROUNDING_TOLERANCE {
            return Err(CalibrationError::infeasible(format!(
                "upper bound of {} lies below that of {}",
                rows[ii].scn,
                rows[ii - 1].scn
            )));
        }
        // A bin with no probability mass has no conditional mean
        if delta_p0 > 0.0 {
            let molecular_weight = (alpha * beta).mul_add(delta_p1 / delta_p0, eta);
            rows[ii].molecular_weight = Some(molecular_weight);
            rows[ii].mass = Some(molecular_weight * delta_p0);
        } else {
            rows[ii].mass = Some(0.0);
        }
    }

    let total_mass: f64 = rows.iter().filter_map(|row| row.mass).sum();
    if !(total_mass.is_finite() && total_mass > 0.0) {
        return Err(CalibrationError::infeasible(format!(
            "total heavy-end mass must be finite and positive, found {total_mass}"
        )));
    }

    for row in rows.iter_mut().skip(1) {
        let weight_fraction = row.mass.map(|mass| mass / total_mass);
        row.weight_fraction = weight_fraction;
        row.mole_fraction = match (weight_fraction, row.molecular_weight) {
            (Some(wni), Some(mi)) => Some(wni / mi * total_mass),
            (Some(_), None) => Some(0.0),
            _ => None,
        };
    }

    Ok(SamplePrediction {
        sample: table.sample().clone(),
        rows,
        total_mass,
    })
}
