use serde::{Deserialize, Serialize};

use crate::errors::{CalibrationError, Result};

/// Identifier of a fluid sample, usually the worksheet or directory it was loaded from.
#[derive(Clone, Hash, PartialEq, Eq, Debug)]
pub struct SampleId(pub String);

impl SampleId {
    /// The identifier with every non-alphanumeric character replaced by `_`, usable as a
    /// fragment of a regression variable name.
    #[must_use]
    pub fn variable_fragment(&self) -> String {
        self.0
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect()
    }

    /// Name of the regression unknown holding this sample's mean heavy-end molecular weight.
    #[must_use]
    pub fn heavy_mw_variable(&self) -> String {
        format!("{}_heavy_mw", self.variable_fragment())
    }
}

impl std::fmt::Display for SampleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One line of a laboratory composition table.
///
/// Fractions may be given on any consistent basis (fractions or percent), only ratios are used.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct CompositionRow {
    #[serde(alias = "SCN")]
    pub scn: String,
    #[serde(alias = "mfi_lab")]
    pub mole_fraction: f64,
    #[serde(alias = "wfi_lab")]
    pub weight_fraction: f64,
    #[serde(alias = "mw_lab", default)]
    pub molecular_weight: Option<f64>,
}

impl CompositionRow {
    #[must_use]
    pub fn new(scn: impl Into<String>, mole_fraction: f64, weight_fraction: f64) -> Self {
        Self {
            scn: scn.into(),
            mole_fraction,
            weight_fraction,
            molecular_weight: None,
        }
    }

    #[must_use]
    pub fn with_molecular_weight(mut self, molecular_weight: f64) -> Self {
        self.molecular_weight = Some(molecular_weight);
        self
    }

    /// Carbon number of a single carbon number label such as `C10` or `C36+`.
    ///
    /// Returns `None` for labels which are not carbon number groups (`N2`, `CO2`, ...).
    #[must_use]
    pub fn carbon_number(&self) -> Option<u32> {
        parse_carbon_number(&self.scn)
    }

    /// Lab molecular weight, or `weight_fraction * average_mw / mole_fraction` when the lab did
    /// not report one.
    fn resolved_molecular_weight(&self, sample: &SampleId, average_mw: f64) -> Result<f64> {
        if let Some(mw) = self.molecular_weight {
            return Ok(mw);
        }
        if self.mole_fraction == 0.0 {
            return Err(CalibrationError::ZeroMoleFraction {
                sample: sample.0.clone(),
                label: self.scn.clone(),
            });
        }
        Ok(self.weight_fraction * average_mw / self.mole_fraction)
    }

    fn is_empty(&self) -> bool {
        self.mole_fraction == 0.0 && self.weight_fraction == 0.0
    }
}

pub(crate) fn parse_carbon_number(label: &str) -> Option<u32> {
    let label = label.trim();
    let digits = label
        .strip_prefix('C')
        .or_else(|| label.strip_prefix('c'))?
        .trim_end_matches('+');
    digits.parse().ok()
}

/// A heavy-end row with its molecular weight already resolved.
#[derive(Clone, Debug, PartialEq)]
pub struct HeavyEndBin {
    pub scn: String,
    pub carbon_number: u32,
    pub mole_fraction: f64,
    pub weight_fraction: f64,
    pub molecular_weight: f64,
}

/// One fluid sample: its composition, the average liquid molecular weight, and once a fit has
/// run, its own regression table and prediction.
#[derive(Clone, Debug)]
pub struct Sample {
    id: SampleId,
    rows: Vec<CompositionRow>,
    average_molecular_weight: f64,
    heavy_end_molecular_weight: Option<f64>,
    pub(crate) regression: Option<crate::preparation::RegressionTable>,
    pub(crate) prediction: Option<crate::distributions::SamplePrediction>,
}

impl Sample {
    #[must_use]
    pub fn new(id: SampleId, rows: Vec<CompositionRow>, average_molecular_weight: f64) -> Self {
        Self {
            id,
            rows,
            average_molecular_weight,
            heavy_end_molecular_weight: None,
            regression: None,
            prediction: None,
        }
    }

    /// Supply the heavy-end mean molecular weight (lab reported or estimated elsewhere), used as
    /// the initial guess instead of the built-in estimator.
    #[must_use]
    pub fn with_heavy_end_molecular_weight(mut self, molecular_weight: f64) -> Self {
        self.heavy_end_molecular_weight = Some(molecular_weight);
        self
    }

    pub const fn id(&self) -> &SampleId {
        &self.id
    }

    pub fn rows(&self) -> &[CompositionRow] {
        &self.rows
    }

    pub const fn average_molecular_weight(&self) -> f64 {
        self.average_molecular_weight
    }

    pub const fn heavy_end_molecular_weight(&self) -> Option<f64> {
        self.heavy_end_molecular_weight
    }

    /// Regression table from the last fit
    pub const fn regression(&self) -> Option<&crate::preparation::RegressionTable> {
        self.regression.as_ref()
    }

    /// Model prediction from the last fit
    pub const fn prediction(&self) -> Option<&crate::distributions::SamplePrediction> {
        self.prediction.as_ref()
    }

    /// Index of the cutoff row. Empty rows count, a cutoff row reported as zero still marks
    /// where the heavy end begins.
    fn cutoff_index(&self, cutoff: u32) -> Result<usize> {
        self.rows
            .iter()
            .position(|row| row.carbon_number() == Some(cutoff))
            .ok_or_else(|| CalibrationError::MissingCutoff {
                sample: self.id.0.clone(),
                label: format!("C{cutoff}"),
            })
    }

    /// The heavy end: every non-empty row from the cutoff row onward, with molecular weights
    /// resolved.
    ///
    /// # Errors
    /// - [`CalibrationError::MissingCutoff`] if no row has the cutoff carbon number
    /// - [`CalibrationError::UnorderedBins`] if a heavy row is not a carbon number group or the
    ///   carbon numbers do not strictly increase
    /// - [`CalibrationError::ZeroMoleFraction`] if a molecular weight cannot be back-calculated
    pub fn heavy_end(&self, cutoff: u32) -> Result<Vec<HeavyEndBin>> {
        let start = self.cutoff_index(cutoff)?;

        let mut bins: Vec<HeavyEndBin> = Vec::with_capacity(self.rows.len() - start);
        for row in self.rows[start..].iter().filter(|row| !row.is_empty()) {
            let carbon_number = row
                .carbon_number()
                .filter(|&n| bins.last().map_or(true, |previous| n > previous.carbon_number))
                .ok_or_else(|| CalibrationError::UnorderedBins {
                    sample: self.id.0.clone(),
                    label: row.scn.clone(),
                })?;
            bins.push(HeavyEndBin {
                scn: row.scn.clone(),
                carbon_number,
                mole_fraction: row.mole_fraction,
                weight_fraction: row.weight_fraction,
                molecular_weight: row
                    .resolved_molecular_weight(&self.id, self.average_molecular_weight)?,
            });
        }
        Ok(bins)
    }

    /// Estimate the mean molecular weight of the heavy end.
    ///
    /// When every non-empty row lighter than the cutoff carries a lab molecular weight the
    /// light-end balance is used:
    ///
    /// $$
    ///     M_+ = \frac{W_+}{1 / M_{avg} - \sum_{light} w_i / M_i}
    /// $$
    ///
    /// with weight fractions normalised over the whole composition. Otherwise, or when the balance
    /// is not finite and positive, the heavy end is averaged on its own,
    /// $M_+ = \sum w_i / \sum (w_i / M_i)$.
    ///
    /// # Errors
    /// Propagates the errors of [`Sample::heavy_end`].
    pub fn estimate_heavy_end_molecular_weight(&self, cutoff: u32) -> Result<f64> {
        let heavy = self.heavy_end(cutoff)?;

        let start = self.cutoff_index(cutoff)?;
        let light: Vec<&CompositionRow> =
            self.rows[..start].iter().filter(|row| !row.is_empty()).collect();
        let light_mws: Option<Vec<f64>> = light.iter().map(|row| row.molecular_weight).collect();

        let balance = match light_mws {
            Some(light_mws) if !light.is_empty() => {
                let total_weight: f64 = self.rows.iter().map(|row| row.weight_fraction).sum();
                let heavy_weight: f64 =
                    heavy.iter().map(|bin| bin.weight_fraction).sum::<f64>() / total_weight;
                let light_moles: f64 = light
                    .iter()
                    .zip(light_mws)
                    .map(|(row, mw)| row.weight_fraction / total_weight / mw)
                    .sum();
                Some(heavy_weight / (1.0 / self.average_molecular_weight - light_moles))
            }
            _ => None,
        };

        // Light-end data inconsistent with the average leaves no positive heavy-end share
        match balance {
            Some(estimate) if estimate.is_finite() && estimate > 0.0 => Ok(estimate),
            _ => {
                let weight: f64 = heavy.iter().map(|bin| bin.weight_fraction).sum();
                let moles: f64 = heavy
                    .iter()
                    .map(|bin| bin.weight_fraction / bin.molecular_weight)
                    .sum();
                Ok(weight / moles)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{parse_carbon_number, CompositionRow, Sample, SampleId};
    use crate::errors::CalibrationError;

    fn heavy_only() -> Sample {
        Sample::new(
            SampleId("C.1".to_owned()),
            vec![
                CompositionRow::new("C10", 4.0, 5.0),
                CompositionRow::new("C11", 3.0, 4.2),
                CompositionRow::new("C12", 0.0, 0.0),
                CompositionRow::new("C13", 2.0, 3.3),
                CompositionRow::new("C14+", 1.0, 3.0),
            ],
            160.0,
        )
    }

    #[test]
    fn carbon_numbers_are_parsed_from_scn_labels() {
        assert_eq!(parse_carbon_number("C10"), Some(10));
        assert_eq!(parse_carbon_number(" C36+"), Some(36));
        assert_eq!(parse_carbon_number("c7"), Some(7));
        assert_eq!(parse_carbon_number("CO2"), None);
        assert_eq!(parse_carbon_number("N2"), None);
    }

    #[test]
    fn sample_ids_are_normalised_into_variable_names() {
        let id = SampleId("C.1 top-sep".to_owned());
        assert_eq!(id.variable_fragment(), "C_1_top_sep");
        assert_eq!(id.heavy_mw_variable(), "C_1_top_sep_heavy_mw");
    }

    #[test]
    fn heavy_end_skips_empty_rows_and_back_calculates_molecular_weights() {
        let sample = heavy_only();
        let heavy = sample.heavy_end(10).unwrap();

        assert_eq!(heavy.len(), 4);
        assert_eq!(
            heavy.iter().map(|bin| bin.carbon_number).collect::<Vec<_>>(),
            vec![10, 11, 13, 14]
        );
        approx::assert_relative_eq!(heavy[0].molecular_weight, 5.0 * 160.0 / 4.0);
        approx::assert_relative_eq!(heavy[3].molecular_weight, 3.0 * 160.0);
    }

    #[test]
    fn lab_molecular_weights_take_precedence() {
        let sample = Sample::new(
            SampleId("s".to_owned()),
            vec![
                CompositionRow::new("C10", 4.0, 5.0).with_molecular_weight(134.0),
                CompositionRow::new("C11+", 3.0, 4.2),
            ],
            160.0,
        );
        let heavy = sample.heavy_end(10).unwrap();
        approx::assert_relative_eq!(heavy[0].molecular_weight, 134.0);
    }

    #[test]
    fn missing_cutoff_row_is_a_data_shape_error() {
        let sample = heavy_only();
        let err = sample.heavy_end(9).unwrap_err();
        assert!(matches!(err, CalibrationError::MissingCutoff { label, .. } if label == "C9"));
    }

    #[test]
    fn a_zero_cutoff_row_still_marks_the_start_of_the_heavy_end() {
        let sample = Sample::new(
            SampleId("s".to_owned()),
            vec![
                CompositionRow::new("C9", 6.0, 5.0),
                CompositionRow::new("C10", 0.0, 0.0),
                CompositionRow::new("C11", 4.0, 5.0),
                CompositionRow::new("C12", 3.0, 4.2),
                CompositionRow::new("C13+", 2.0, 4.0),
            ],
            160.0,
        );
        let heavy = sample.heavy_end(10).unwrap();
        assert_eq!(
            heavy.iter().map(|bin| bin.scn.as_str()).collect::<Vec<_>>(),
            vec!["C11", "C12", "C13+"]
        );
    }

    #[test]
    fn zero_mole_fraction_without_lab_weight_cannot_be_back_calculated() {
        let sample = Sample::new(
            SampleId("s".to_owned()),
            vec![
                CompositionRow::new("C10", 4.0, 5.0),
                CompositionRow::new("C11", 0.0, 4.2),
                CompositionRow::new("C12+", 3.0, 4.2),
            ],
            160.0,
        );
        assert!(matches!(
            sample.heavy_end(10),
            Err(CalibrationError::ZeroMoleFraction { label, .. }) if label == "C11"
        ));
    }

    #[test]
    fn out_of_order_bins_are_rejected() {
        let sample = Sample::new(
            SampleId("s".to_owned()),
            vec![
                CompositionRow::new("C10", 4.0, 5.0),
                CompositionRow::new("C12", 3.0, 4.2),
                CompositionRow::new("C11", 3.0, 4.2),
            ],
            160.0,
        );
        assert!(matches!(
            sample.heavy_end(10),
            Err(CalibrationError::UnorderedBins { label, .. }) if label == "C11"
        ));
    }

    #[test]
    fn heavy_only_estimate_is_the_weight_over_mole_average() {
        let sample = heavy_only();
        let estimate = sample.estimate_heavy_end_molecular_weight(10).unwrap();
        // With back-calculated weights the harmonic average reduces to M_avg * sum(w) / sum(z)
        approx::assert_relative_eq!(estimate, 160.0 * 15.5 / 10.0, max_relative = 1e-12);
    }

    #[test]
    fn inconsistent_light_end_falls_back_to_the_heavy_average() {
        // C7 alone carries more moles than the average molecular weight allows
        let sample = Sample::new(
            SampleId("s".to_owned()),
            vec![
                CompositionRow::new("C7", 40.0, 50.0).with_molecular_weight(40.0),
                CompositionRow::new("C10", 30.0, 25.0).with_molecular_weight(134.0),
                CompositionRow::new("C11", 20.0, 15.0).with_molecular_weight(147.0),
                CompositionRow::new("C12+", 10.0, 10.0).with_molecular_weight(200.0),
            ],
            150.0,
        );
        let estimate = sample.estimate_heavy_end_molecular_weight(10).unwrap();
        let heavy_average = 50.0 / (25.0 / 134.0 + 15.0 / 147.0 + 10.0 / 200.0);
        approx::assert_relative_eq!(estimate, heavy_average, max_relative = 1e-12);
    }

    #[test]
    fn light_end_balance_is_used_when_light_molecular_weights_are_known() {
        // Two light components and a heavy end, built so that the mixture is consistent:
        // 1 / M_avg = sum(w_i / M_i)
        let light = [(0.2, 16.0), (0.3, 100.0)];
        let heavy_weight = 0.5;
        let heavy_mw = 250.0;
        let inverse_average: f64 =
            light.iter().map(|(w, m)| w / m).sum::<f64>() + heavy_weight / heavy_mw;
        let average = 1.0 / inverse_average;

        let mut rows: Vec<CompositionRow> = light
            .iter()
            .enumerate()
            .map(|(ii, (w, m))| {
                CompositionRow::new(format!("L{ii}"), w / m * average, *w).with_molecular_weight(*m)
            })
            .collect();
        rows.push(CompositionRow::new("C10", 0.1, 0.3));
        rows.push(CompositionRow::new("C11+", 0.05, 0.2));

        let sample = Sample::new(SampleId("s".to_owned()), rows, average);
        let estimate = sample.estimate_heavy_end_molecular_weight(10).unwrap();
        approx::assert_relative_eq!(estimate, heavy_mw, max_relative = 1e-10);
    }
}
