use itertools::Itertools;

use crate::composition::{Sample, SampleId};
use crate::errors::{CalibrationError, Result};

/// Upper molecular weight bound of the open-ended top bin. Fixed, never regressed.
pub const UPPER_BOUND_SENTINEL: f64 = 100_000.0;

/// Empirical gap between the first retained bin's upper bound and the initial location guess,
/// roughly one CH2 group.
pub const LOCATION_OFFSET: f64 = 14.0;

/// Name of the global shape unknown
pub const SHAPE: &str = "alpha";

/// Name of the global location unknown, the lower molecular weight edge of the heavy end
pub const LOCATION: &str = "eta";

/// Name of the regression unknown for the upper bound of the bin labelled `scn`
#[must_use]
pub fn bound_variable(scn: &str) -> String {
    format!("m{scn}")
}

/// Upper molecular weight bound of a bin: either a regression unknown, or a fixed number.
#[derive(Clone, Debug, PartialEq)]
pub enum UpperBound {
    Variable(String),
    Fixed(f64),
}

/// A single row of a regression table
#[derive(Clone, Debug, PartialEq)]
pub struct RegressionRow {
    pub scn: String,
    pub carbon_number: u32,
    /// Lab mole fraction, absent on the boundary row
    pub mole_fraction: Option<f64>,
    /// Lab weight fraction, absent on the boundary row
    pub weight_fraction: Option<f64>,
    /// Lab or back-calculated molecular weight, absent on the boundary row
    pub molecular_weight: Option<f64>,
    pub initial_upper_bound: f64,
    pub upper_bound: UpperBound,
    /// Lab weight fraction renormalised over the heavy end (`wni_lab`), absent on the boundary row
    pub normalised_weight_fraction: Option<f64>,
}

/// The regression-ready view of one sample's heavy end.
///
/// Row 0 is the synthetic boundary row, whose upper bound is the location unknown. The
/// following rows are the heavy-end bins in increasing carbon number, the last of which is the
/// open-ended bin with a fixed upper bound.
#[derive(Clone, Debug, PartialEq)]
pub struct RegressionTable {
    sample: SampleId,
    heavy_mw_variable: String,
    rows: Vec<RegressionRow>,
}

impl RegressionTable {
    pub const fn sample(&self) -> &SampleId {
        &self.sample
    }

    pub fn heavy_mw_variable(&self) -> &str {
        &self.heavy_mw_variable
    }

    pub fn rows(&self) -> &[RegressionRow] {
        &self.rows
    }

    /// The synthetic lower boundary row
    pub fn boundary(&self) -> &RegressionRow {
        &self.rows[0]
    }

    /// The heavy-end bins, without the boundary row
    pub fn bins(&self) -> &[RegressionRow] {
        &self.rows[1..]
    }

    /// Regressed upper bound names and their initial values, in bin order. Excludes the location
    /// unknown of the boundary row and the fixed top bin.
    pub fn interior_bounds(&self) -> impl Iterator<Item = (&str, f64)> {
        self.bins().iter().filter_map(|row| match &row.upper_bound {
            UpperBound::Variable(name) => Some((name.as_str(), row.initial_upper_bound)),
            UpperBound::Fixed(_) => None,
        })
    }
}

/// Turn a sample's composition into a regression table for a heavy end starting at `cutoff`.
///
/// # Errors
/// - Propagates the data shape errors of [`Sample::heavy_end`]
/// - [`CalibrationError::TooFewBins`] if fewer than two heavy-end bins remain
pub fn prepare(sample: &Sample, cutoff: u32) -> Result<RegressionTable> {
    let heavy = sample.heavy_end(cutoff)?;
    if heavy.len() < 2 {
        return Err(CalibrationError::TooFewBins {
            sample: sample.id().0.clone(),
            found: heavy.len(),
        });
    }

    let total_weight: f64 = heavy.iter().map(|bin| bin.weight_fraction).sum();

    // Bounds sit midway between neighbouring molecular weights
    let initial_bounds = heavy
        .iter()
        .tuple_windows()
        .map(|(this, next)| this.molecular_weight + (next.molecular_weight - this.molecular_weight) / 2.0)
        .chain(std::iter::once(UPPER_BOUND_SENTINEL));

    let last = heavy.len() - 1;
    let bins = heavy
        .iter()
        .zip(initial_bounds)
        .enumerate()
        .map(|(ii, (bin, initial_upper_bound))| RegressionRow {
            scn: bin.scn.clone(),
            carbon_number: bin.carbon_number,
            mole_fraction: Some(bin.mole_fraction),
            weight_fraction: Some(bin.weight_fraction),
            molecular_weight: Some(bin.molecular_weight),
            initial_upper_bound,
            upper_bound: if ii == last {
                UpperBound::Fixed(initial_upper_bound)
            } else {
                UpperBound::Variable(bound_variable(&bin.scn))
            },
            normalised_weight_fraction: Some(bin.weight_fraction / total_weight),
        });

    let first = &heavy[0];
    let first_bound = first.molecular_weight + (heavy[1].molecular_weight - first.molecular_weight) / 2.0;
    let boundary = RegressionRow {
        scn: format!("C{}", cutoff.saturating_sub(1)),
        carbon_number: cutoff.saturating_sub(1),
        mole_fraction: None,
        weight_fraction: None,
        molecular_weight: None,
        initial_upper_bound: first_bound - LOCATION_OFFSET,
        upper_bound: UpperBound::Variable(LOCATION.to_owned()),
        normalised_weight_fraction: None,
    };

    Ok(RegressionTable {
        sample: sample.id().clone(),
        heavy_mw_variable: sample.id().heavy_mw_variable(),
        rows: std::iter::once(boundary).chain(bins).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::{prepare, UpperBound, LOCATION, UPPER_BOUND_SENTINEL};
    use crate::composition::{CompositionRow, Sample, SampleId};
    use crate::errors::CalibrationError;

    fn sample() -> Sample {
        Sample::new(
            SampleId("C.4".to_owned()),
            vec![
                CompositionRow::new("C8", 10.0, 6.0).with_molecular_weight(107.0),
                CompositionRow::new("C9", 8.0, 6.0).with_molecular_weight(121.0),
                CompositionRow::new("C10", 40.0, 40.0).with_molecular_weight(134.0),
                CompositionRow::new("C11", 25.0, 25.0).with_molecular_weight(147.0),
                CompositionRow::new("C12", 15.0, 15.0).with_molecular_weight(161.0),
                CompositionRow::new("C13+", 8.0, 20.0).with_molecular_weight(260.0),
            ],
            150.0,
        )
    }

    #[test]
    fn normalised_lab_weight_fractions_sum_to_one() {
        let table = prepare(&sample(), 10).unwrap();
        let total: f64 = table
            .bins()
            .iter()
            .map(|row| row.normalised_weight_fraction.unwrap())
            .sum();
        approx::assert_relative_eq!(total, 1.0, max_relative = 1e-12);
        assert!(table.boundary().normalised_weight_fraction.is_none());
    }

    #[test]
    fn initial_bounds_are_midpoints_and_the_top_bin_is_fixed() {
        let table = prepare(&sample(), 10).unwrap();
        let bounds: Vec<f64> = table.bins().iter().map(|row| row.initial_upper_bound).collect();
        approx::assert_relative_eq!(bounds[0], 140.5);
        approx::assert_relative_eq!(bounds[1], 154.0);
        approx::assert_relative_eq!(bounds[2], 210.5);
        approx::assert_relative_eq!(bounds[3], UPPER_BOUND_SENTINEL);

        let top = table.bins().last().unwrap();
        assert_eq!(top.upper_bound, UpperBound::Fixed(UPPER_BOUND_SENTINEL));
    }

    #[test]
    fn boundary_row_carries_the_location_unknown() {
        let table = prepare(&sample(), 10).unwrap();
        let boundary = table.boundary();
        assert_eq!(boundary.scn, "C9");
        assert_eq!(boundary.upper_bound, UpperBound::Variable(LOCATION.to_owned()));
        approx::assert_relative_eq!(boundary.initial_upper_bound, 140.5 - 14.0);
    }

    #[test]
    fn interior_bins_get_unique_variable_names() {
        let table = prepare(&sample(), 10).unwrap();
        let names: Vec<&str> = table.interior_bounds().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["mC10", "mC11", "mC12"]);
        assert_eq!(table.heavy_mw_variable(), "C_4_heavy_mw");
    }

    #[test]
    fn a_single_heavy_bin_is_rejected() {
        let err = prepare(&sample(), 13).unwrap_err();
        assert!(matches!(err, CalibrationError::TooFewBins { found: 1, .. }));
    }
}
