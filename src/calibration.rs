use std::collections::HashMap;
use std::fs;
use std::path::Path;

use ndarray::Array1;
use serde::{Deserialize, Serialize};

use crate::composition::{Sample, SampleId};
use crate::distributions::{evaluate, DistributionParameters, SamplePrediction};
use crate::errors::{CalibrationError, Result};
use crate::math::{pooled_rmse, Bounds};
use crate::minimisation::{Objective, Problem, SolverOptions};
use crate::preparation::{prepare, RegressionTable, UpperBound, LOCATION, SHAPE};

/// Whether the open-ended top bin contributes to the pooled error.
///
/// The top bin lumps everything above the last carbon number group, so its lab fraction is not
/// a measurement of a single slice of the distribution.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TopBinPolicy {
    Include,
    #[default]
    Exclude,
}

/// Configuration of a joint fit
///
/// Every field has a default, so a TOML file only needs to name the values it changes.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct FitConfig {
    /// First carbon number of the heavy end
    pub cutoff_carbon_number: u32,
    /// Initial guess of the shape parameter
    pub initial_shape: f64,
    /// Relative half width of the box around the shared bin bounds
    pub shared_band: f64,
    /// Relative half width of the box around the shape parameter, `None` leaves it unbounded
    pub shape_band: Option<f64>,
    /// Relative half width of the box around the location parameter, `None` leaves it unbounded
    pub location_band: Option<f64>,
    /// Relative half width of the box around each sample's mean heavy-end molecular weight
    pub sample_band: f64,
    pub max_iterations: u64,
    /// Simplex cost standard deviation at which the minimiser stops
    pub tolerance: f64,
    pub top_bin: TopBinPolicy,
    /// Log minimiser progress to the terminal
    pub verbose: bool,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            cutoff_carbon_number: 10,
            initial_shape: 1.0,
            shared_band: 0.02,
            shape_band: Some(0.02),
            location_band: None,
            sample_band: 0.05,
            max_iterations: 10_000,
            tolerance: 1e-8,
            top_bin: TopBinPolicy::Exclude,
            verbose: false,
        }
    }
}

impl FitConfig {
    /// Read a configuration from a TOML file
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or does not deserialise.
    pub fn from_file(path: &Path) -> Result<Self> {
        let config = fs::read_to_string(path)?;
        Ok(toml::from_str(&config)?)
    }

    fn validate(&self) -> Result<()> {
        if self.cutoff_carbon_number <= 7 {
            return Err(CalibrationError::NotImplemented {
                text: format!(
                    "gamma distribution fit from C{} is not implemented",
                    self.cutoff_carbon_number
                ),
            });
        }
        if !(self.initial_shape.is_finite() && self.initial_shape > 0.0) {
            return Err(CalibrationError::InvalidConfig {
                field: "initial_shape",
                reason: format!("must be finite and positive, found {}", self.initial_shape),
            });
        }
        let bands = [
            ("shared_band", Some(self.shared_band)),
            ("shape_band", self.shape_band),
            ("location_band", self.location_band),
            ("sample_band", Some(self.sample_band)),
        ];
        for (field, band) in bands {
            if let Some(band) = band.filter(|band| !(band.is_finite() && *band >= 0.0)) {
                return Err(CalibrationError::InvalidConfig {
                    field,
                    reason: format!("must be finite and non-negative, found {band}"),
                });
            }
        }
        if self.max_iterations == 0 {
            return Err(CalibrationError::InvalidConfig {
                field: "max_iterations",
                reason: "must be at least 1".to_owned(),
            });
        }
        Ok(())
    }

    fn bounds(&self, kind: VariableKind, centre: f64) -> Bounds {
        let band = match kind {
            VariableKind::Shape => self.shape_band,
            VariableKind::Location => self.location_band,
            VariableKind::SharedBound => Some(self.shared_band),
            VariableKind::HeavyMolecularWeight => Some(self.sample_band),
        };
        Bounds::band(centre, band)
    }
}

/// The role a regression unknown plays in the model
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VariableKind {
    Shape,
    Location,
    /// Upper bound of a carbon number bin, shared by every sample using that bin
    SharedBound,
    /// Mean heavy-end molecular weight of one sample
    HeavyMolecularWeight,
}

/// The ordered list of unknowns of a joint fit
///
/// Shape and location come first, then the shared bin bounds in carbon number order, then one
/// mean heavy-end molecular weight per sample in collection order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegressionVariableSet {
    variables: Vec<(String, VariableKind)>,
    index: HashMap<String, usize>,
}

impl RegressionVariableSet {
    fn push(&mut self, name: &str, kind: VariableKind) -> Result<()> {
        if self.index.contains_key(name) {
            return Err(CalibrationError::DuplicateVariable {
                name: name.to_owned(),
            });
        }
        self.index.insert(name.to_owned(), self.variables.len());
        self.variables.push((name.to_owned(), kind));
        Ok(())
    }

    fn build(tables: &[RegressionTable]) -> Result<Self> {
        let mut set = Self {
            variables: Vec::new(),
            index: HashMap::new(),
        };
        set.push(SHAPE, VariableKind::Shape)?;
        set.push(LOCATION, VariableKind::Location)?;

        let mut shared: Vec<(u32, &str)> = Vec::new();
        for table in tables {
            for row in table.bins() {
                if let UpperBound::Variable(name) = &row.upper_bound {
                    if !shared.iter().any(|(_, seen)| *seen == name.as_str()) {
                        shared.push((row.carbon_number, name));
                    }
                }
            }
        }
        shared.sort_by_key(|(carbon_number, _)| *carbon_number);
        for (_, name) in shared {
            set.push(name, VariableKind::SharedBound)?;
        }

        for table in tables {
            set.push(table.heavy_mw_variable(), VariableKind::HeavyMolecularWeight)?;
        }
        Ok(set)
    }

    pub fn len(&self) -> usize {
        self.variables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.variables.iter().map(|(name, _)| name.as_str())
    }

    pub fn kinds(&self) -> impl Iterator<Item = VariableKind> + '_ {
        self.variables.iter().map(|(_, kind)| *kind)
    }

    /// # Errors
    /// [`CalibrationError::UnknownVariable`] if `name` is not part of the set
    pub fn index_of(&self, name: &str) -> Result<usize> {
        self.index
            .get(name)
            .copied()
            .ok_or_else(|| CalibrationError::UnknownVariable {
                name: name.to_owned(),
            })
    }
}

/// Where a row's upper bound comes from
#[derive(Clone, Copy, Debug)]
enum BoundSource {
    Parameter(usize),
    Fixed(f64),
}

/// A sample's regression table with every unknown resolved to a position in the value vector
#[derive(Clone, Debug)]
struct SampleBinding {
    table: RegressionTable,
    shape: usize,
    location: usize,
    heavy_mw: usize,
    bounds: Vec<BoundSource>,
}

impl SampleBinding {
    fn new(table: RegressionTable, variables: &RegressionVariableSet) -> Result<Self> {
        let bounds = table
            .rows()
            .iter()
            .map(|row| match &row.upper_bound {
                UpperBound::Variable(name) => variables.index_of(name).map(BoundSource::Parameter),
                UpperBound::Fixed(value) => Ok(BoundSource::Fixed(*value)),
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            shape: variables.index_of(SHAPE)?,
            location: variables.index_of(LOCATION)?,
            heavy_mw: variables.index_of(table.heavy_mw_variable())?,
            bounds,
            table,
        })
    }

    fn resolve(&self, values: &Array1<f64>) -> DistributionParameters {
        DistributionParameters {
            shape: values[self.shape],
            location: values[self.location],
            mean_heavy_mw: values[self.heavy_mw],
            upper_bounds: self
                .bounds
                .iter()
                .map(|source| match *source {
                    BoundSource::Parameter(index) => values[index],
                    BoundSource::Fixed(value) => value,
                })
                .collect(),
        }
    }
}

/// Pooled RMSE of every sample's predicted against lab normalised weight fractions
#[derive(Clone, Debug)]
struct JointObjective {
    bindings: Vec<SampleBinding>,
    variables: usize,
    top_bin: TopBinPolicy,
}

impl JointObjective {
    fn check_length(&self, values: &Array1<f64>) -> Result<()> {
        if values.len() == self.variables {
            Ok(())
        } else {
            Err(CalibrationError::LengthMismatch {
                expected: self.variables,
                found: values.len(),
            })
        }
    }

    fn predict(&self, values: &Array1<f64>) -> Result<Vec<SamplePrediction>> {
        self.check_length(values)?;
        self.bindings
            .iter()
            .map(|binding| evaluate(&binding.table, &binding.resolve(values)))
            .collect()
    }

    fn squared_errors(&self, predictions: &[SamplePrediction]) -> Vec<f64> {
        predictions
            .iter()
            .flat_map(|prediction| {
                let bins = prediction.bins();
                let scored = match self.top_bin {
                    TopBinPolicy::Include => bins,
                    TopBinPolicy::Exclude => &bins[..bins.len() - 1],
                };
                scored.iter().filter_map(|row| {
                    row.weight_fraction
                        .zip(row.lab_weight_fraction)
                        .map(|(predicted, lab)| (predicted - lab).powi(2))
                })
            })
            .collect()
    }
}

impl Objective for JointObjective {
    fn value(&self, values: &Array1<f64>) -> Result<f64> {
        let predictions = self.predict(values)?;
        Ok(pooled_rmse(self.squared_errors(&predictions)))
    }
}

/// Outcome of a joint fit.
#[derive(Clone, Debug)]
pub struct FitResult {
    variables: Vec<(String, f64)>,
    rmse: f64,
    iterations: u64,
    converged: bool,
    predictions: Vec<SamplePrediction>,
}

impl FitResult {
    /// Fitted value of every regression unknown, in regression order
    pub fn variables(&self) -> &[(String, f64)] {
        &self.variables
    }

    pub fn value(&self, name: &str) -> Option<f64> {
        self.variables
            .iter()
            .find(|(variable, _)| variable == name)
            .map(|(_, value)| *value)
    }

    /// Fitted values keyed by name, suitable as the initial guess of a further fit
    pub fn values_by_name(&self) -> HashMap<String, f64> {
        self.variables.iter().cloned().collect()
    }

    pub fn shape(&self) -> f64 {
        self.variables[0].1
    }

    pub fn location(&self) -> f64 {
        self.variables[1].1
    }

    /// Pooled RMSE in percent at the fitted point
    pub const fn rmse(&self) -> f64 {
        self.rmse
    }

    pub const fn iterations(&self) -> u64 {
        self.iterations
    }

    /// `false` when the minimiser stopped at the iteration cap
    pub const fn converged(&self) -> bool {
        self.converged
    }

    /// Per-sample predictions, in collection order
    pub fn predictions(&self) -> &[SamplePrediction] {
        &self.predictions
    }

    pub fn prediction(&self, sample: &SampleId) -> Option<&SamplePrediction> {
        self.predictions
            .iter()
            .find(|prediction| prediction.sample() == sample)
    }
}

/// The samples of one fluid system, fitted jointly. Iteration order is insertion order.
#[derive(Clone, Debug, Default)]
pub struct SampleCollection {
    samples: Vec<Sample>,
}

impl SampleCollection {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            samples: Vec::new(),
        }
    }

    /// # Errors
    /// [`CalibrationError::DuplicateSample`] if a sample with the same id is already present
    pub fn insert(&mut self, sample: Sample) -> Result<()> {
        if self.get(sample.id()).is_some() {
            return Err(CalibrationError::DuplicateSample {
                sample: sample.id().0.clone(),
            });
        }
        self.samples.push(sample);
        Ok(())
    }

    pub fn get(&self, id: &SampleId) -> Option<&Sample> {
        self.samples.iter().find(|sample| sample.id() == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Sample> {
        self.samples.iter()
    }

    pub fn sample_ids(&self) -> impl Iterator<Item = &SampleId> {
        self.samples.iter().map(Sample::id)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    fn prepare(&self, config: &FitConfig) -> Result<Vec<RegressionTable>> {
        config.validate()?;
        if self.samples.is_empty() {
            return Err(CalibrationError::EmptyCollection);
        }
        self.samples
            .iter()
            .map(|sample| prepare(sample, config.cutoff_carbon_number))
            .collect()
    }

    fn objective(
        tables: Vec<RegressionTable>,
        variables: &RegressionVariableSet,
        config: &FitConfig,
    ) -> Result<JointObjective> {
        Ok(JointObjective {
            bindings: tables
                .into_iter()
                .map(|table| SampleBinding::new(table, variables))
                .collect::<Result<Vec<_>>>()?,
            variables: variables.len(),
            top_bin: config.top_bin,
        })
    }

    /// The unknowns a fit with `config` would regress
    ///
    /// # Errors
    /// Returns the configuration and data shape errors of [`SampleCollection::fit`].
    pub fn regression_variables(&self, config: &FitConfig) -> Result<RegressionVariableSet> {
        RegressionVariableSet::build(&self.prepare(config)?)
    }

    /// Pooled RMSE at an arbitrary point, `values` ordered as
    /// [`SampleCollection::regression_variables`].
    ///
    /// # Errors
    /// - [`CalibrationError::LengthMismatch`] if `values` does not match the variable set
    /// - [`CalibrationError::InfeasibleParameters`] if the model cannot be evaluated at `values`
    /// - The configuration and data shape errors of [`SampleCollection::fit`]
    pub fn pooled_error(&self, config: &FitConfig, values: &Array1<f64>) -> Result<f64> {
        let tables = self.prepare(config)?;
        let variables = RegressionVariableSet::build(&tables)?;
        Self::objective(tables, &variables, config)?.value(values)
    }

    /// The default initial guess for every unknown
    fn initial_guess(
        &self,
        tables: &[RegressionTable],
        variables: &RegressionVariableSet,
        config: &FitConfig,
    ) -> Result<Array1<f64>> {
        let mut initial: Vec<Option<f64>> = vec![None; variables.len()];
        initial[variables.index_of(SHAPE)?] = Some(config.initial_shape);
        initial[variables.index_of(LOCATION)?] = Some(tables[0].boundary().initial_upper_bound);

        for table in tables {
            for (name, value) in table.interior_bounds() {
                initial[variables.index_of(name)?].get_or_insert(value);
            }
        }

        for (sample, table) in self.samples.iter().zip(tables) {
            let heavy_mw = match sample.heavy_end_molecular_weight() {
                Some(heavy_mw) => heavy_mw,
                None => sample.estimate_heavy_end_molecular_weight(config.cutoff_carbon_number)?,
            };
            initial[variables.index_of(table.heavy_mw_variable())?] = Some(heavy_mw);
        }

        // Every unknown is seeded by one of the loops above
        Ok(initial.into_iter().map(|value| value.unwrap_or(f64::NAN)).collect())
    }

    /// Jointly fit the gamma distribution to every sample in the collection.
    ///
    /// On success each sample carries its regression table and prediction.
    ///
    /// # Errors
    /// - [`CalibrationError::NotImplemented`] for a cutoff of C7 or lighter, before any work
    /// - [`CalibrationError::EmptyCollection`] if there is nothing to fit
    /// - The data shape errors of the bin preparation
    /// - [`CalibrationError::InfeasibleParameters`] if the model cannot be evaluated at the best
    ///   point found
    pub fn fit(&mut self, config: &FitConfig) -> Result<FitResult> {
        self.fit_with_initial(config, &HashMap::new())
    }

    /// As [`SampleCollection::fit`], starting every unknown named in `initial` from the given
    /// value.
    ///
    /// The boxes stay centred on the guesses derived from the data, `initial` only moves the
    /// starting point and is clamped into the box. Refitting from a previous [`FitResult`]
    /// therefore searches the same box again and lands on the same point.
    ///
    /// # Errors
    /// As [`SampleCollection::fit`], plus [`CalibrationError::UnknownVariable`] for names in
    /// `initial` which are not regression unknowns.
    pub fn fit_with_initial(
        &mut self,
        config: &FitConfig,
        initial: &HashMap<String, f64>,
    ) -> Result<FitResult> {
        let tables = self.prepare(config)?;
        let variables = RegressionVariableSet::build(&tables)?;

        let mut start = self.initial_guess(&tables, &variables, config)?;
        let bounds: Vec<Bounds> = variables
            .kinds()
            .zip(&start)
            .map(|(kind, &centre)| config.bounds(kind, centre))
            .collect();
        for (name, value) in initial {
            let index = variables.index_of(name)?;
            if config.verbose && !bounds[index].contains(*value) {
                println!("initial value {value} of {name} lies outside its bounds, clamped");
            }
            start[index] = bounds[index].clamp(*value);
        }

        let objective = Self::objective(tables, &variables, config)?;
        if config.verbose {
            println!(
                "fitting {} samples with {} unknowns, initial pooled RMSE {:.6}",
                self.samples.len(),
                variables.len(),
                objective.value(&start).unwrap_or(f64::NAN)
            );
        }

        let options = SolverOptions {
            max_iterations: config.max_iterations,
            tolerance: config.tolerance,
            verbose: config.verbose,
        };
        let solution = Problem::new(objective.clone(), bounds).solve(&start, &options)?;

        let predictions = objective.predict(&solution.values)?;
        let rmse = pooled_rmse(objective.squared_errors(&predictions));
        if config.verbose {
            println!(
                "pooled RMSE {rmse:.6} (minimiser cost {:.6}) after {} iterations{}",
                solution.cost,
                solution.iterations,
                if solution.converged { "" } else { " (iteration cap reached)" }
            );
        }

        for ((sample, binding), prediction) in self
            .samples
            .iter_mut()
            .zip(objective.bindings)
            .zip(&predictions)
        {
            sample.regression = Some(binding.table);
            sample.prediction = Some(prediction.clone());
        }

        Ok(FitResult {
            variables: variables
                .names()
                .map(str::to_owned)
                .zip(solution.values.iter().copied())
                .collect(),
            rmse,
            iterations: solution.iterations,
            converged: solution.converged,
            predictions,
        })
    }
}
