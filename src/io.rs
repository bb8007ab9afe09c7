use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::calibration::{FitResult, SampleCollection};
use crate::composition::{CompositionRow, Sample, SampleId};
use crate::errors::Result;

/// Per-sample scalars, stored as `sample.toml` next to the composition table
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct SampleData {
    /// Average molecular weight of the whole liquid
    pub average_molecular_weight: f64,
    /// Lab reported heavy-end molecular weight, if any
    #[serde(default)]
    pub heavy_end_molecular_weight: Option<f64>,
}

/// Load every sample below `working_directory`.
///
/// Each sub-directory is one sample, named after the directory, holding a `sample.toml` and a
/// `composition.csv`. Samples are loaded in directory name order, files directly in
/// `working_directory` are ignored.
///
/// # Errors
/// Returns an error if the file system has an incorrect structure, a file cannot be parsed, or
/// two directories map to the same sample.
pub fn load_samples(working_directory: &Path) -> Result<SampleCollection> {
    let mut subdirs = fs::read_dir(working_directory)?
        .map(|entry| entry.map(|entry| entry.path()))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    subdirs.retain(|path| path.is_dir());
    subdirs.sort();

    let mut samples = SampleCollection::new();
    for path in subdirs {
        samples.insert(read_sample(&path)?)?;
    }
    Ok(samples)
}

fn read_sample(path: &Path) -> Result<Sample> {
    let id = SampleId(
        path.file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default(),
    );

    let sample_data = fs::read_to_string(path.join("sample.toml"))?;
    let sample_data: SampleData = toml::from_str(&sample_data)?;

    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_path(path.join("composition.csv"))?;
    let rows = rdr
        .deserialize()
        .collect::<std::result::Result<Vec<CompositionRow>, _>>()?;

    let sample = Sample::new(id, rows, sample_data.average_molecular_weight);
    Ok(match sample_data.heavy_end_molecular_weight {
        Some(heavy_mw) => sample.with_heavy_end_molecular_weight(heavy_mw),
        None => sample,
    })
}

/// Write the fitted unknowns as `variable,value` rows, closed by the pooled `RMSE`.
///
/// # Errors
/// Returns an error if the file cannot be written.
pub fn write_summary(path: &Path, result: &FitResult) -> Result<()> {
    let mut wtr = csv::Writer::from_path(path)?;
    wtr.write_record(["variable", "value"])?;
    for (name, value) in result.variables() {
        wtr.write_record([name.as_str(), value.to_string().as_str()])?;
    }
    wtr.write_record(["RMSE", result.rmse().to_string().as_str()])?;
    wtr.flush()?;
    Ok(())
}

#[derive(Serialize)]
struct DetailRow<'a> {
    sample: &'a str,
    scn: &'a str,
    molecular_weight: Option<f64>,
    weight_fraction: Option<f64>,
    mole_fraction: Option<f64>,
    lab_weight_fraction: Option<f64>,
}

/// Write every sample's predicted table, boundary rows included with empty fields.
///
/// # Errors
/// Returns an error if the file cannot be written.
pub fn write_detail(path: &Path, result: &FitResult) -> Result<()> {
    let mut wtr = csv::Writer::from_path(path)?;
    for prediction in result.predictions() {
        for row in prediction.rows() {
            wtr.serialize(DetailRow {
                sample: &prediction.sample().0,
                scn: &row.scn,
                molecular_weight: row.molecular_weight,
                weight_fraction: row.weight_fraction,
                mole_fraction: row.mole_fraction,
                lab_weight_fraction: row.lab_weight_fraction,
            })?;
        }
    }
    wtr.flush()?;
    Ok(())
}
