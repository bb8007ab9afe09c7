//! Crate-wide error type.
//!
//! Errors fall in four groups: malformed input data (fatal, no partial output), unsupported
//! configuration, parameters outside the domain of the gamma model, and failures bubbled up from
//! the collaborators (file system, CSV, TOML, argmin).

/// Crate-wide result alias.
pub type Result<T> = ::std::result::Result<T, CalibrationError>;

#[derive(Debug)]
pub enum CalibrationError {
    // ---- Data shape ----
    /// The cutoff carbon number row is absent from a sample's composition.
    MissingCutoff { sample: String, label: String },
    /// A heavy end needs at least two bins for the per-bin differences to exist.
    TooFewBins { sample: String, found: usize },
    /// Heavy-end rows must carry a carbon number and be strictly increasing.
    UnorderedBins { sample: String, label: String },
    /// A bin has no lab molecular weight and cannot be back-calculated.
    ZeroMoleFraction { sample: String, label: String },
    /// The value vector does not match the regression variable list.
    LengthMismatch { expected: usize, found: usize },
    /// A name was requested that is not part of the regression variable set.
    UnknownVariable { name: String },
    /// Sample identifiers must be unique within a collection.
    DuplicateSample { sample: String },
    /// Two regression unknowns resolve to the same name.
    DuplicateVariable { name: String },
    /// There is nothing to fit.
    EmptyCollection,

    // ---- Configuration ----
    /// The requested feature exists in principle but is not implemented.
    NotImplemented { text: String },
    /// A configuration value is out of range.
    InvalidConfig { field: &'static str, reason: String },

    // ---- Model domain ----
    /// The gamma model cannot be evaluated at these parameters.
    InfeasibleParameters { reason: String },

    // ---- Collaborators ----
    Io(std::io::Error),
    Csv(csv::Error),
    Toml(toml::de::Error),
    /// Wrapper for errors raised inside argmin
    Optimiser { text: String },
}

impl CalibrationError {
    pub(crate) fn infeasible(reason: impl Into<String>) -> Self {
        Self::InfeasibleParameters {
            reason: reason.into(),
        }
    }
}

impl std::error::Error for CalibrationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Csv(e) => Some(e),
            Self::Toml(e) => Some(e),
            _ => None,
        }
    }
}

impl std::fmt::Display for CalibrationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            // ---- Data shape ----
            Self::MissingCutoff { sample, label } => {
                write!(f, "sample {sample}: cutoff row {label} not found in composition")
            }
            Self::TooFewBins { sample, found } => {
                write!(f, "sample {sample}: heavy end has {found} bins, at least 2 are required")
            }
            Self::UnorderedBins { sample, label } => {
                write!(
                    f,
                    "sample {sample}: bin {label} is not a carbon number group in increasing order"
                )
            }
            Self::ZeroMoleFraction { sample, label } => {
                write!(
                    f,
                    "sample {sample}: bin {label} has zero mole fraction and no lab molecular weight"
                )
            }
            Self::LengthMismatch { expected, found } => {
                write!(f, "value vector length mismatch: expected {expected}, found {found}")
            }
            Self::UnknownVariable { name } => write!(f, "unknown regression variable {name}"),
            Self::DuplicateSample { sample } => {
                write!(f, "sample {sample} is already present in the collection")
            }
            Self::DuplicateVariable { name } => {
                write!(f, "regression variable {name} is defined more than once")
            }
            Self::EmptyCollection => write!(f, "the sample collection is empty"),

            // ---- Configuration ----
            Self::NotImplemented { text } => write!(f, "Not implemented: {text}"),
            Self::InvalidConfig { field, reason } => {
                write!(f, "invalid configuration value for {field}: {reason}")
            }

            // ---- Model domain ----
            Self::InfeasibleParameters { reason } => {
                write!(f, "parameters outside the gamma model domain: {reason}")
            }

            // ---- Collaborators ----
            Self::Io(e) => write!(f, "io error: {e}"),
            Self::Csv(e) => write!(f, "csv error: {e}"),
            Self::Toml(e) => write!(f, "toml error: {e}"),
            Self::Optimiser { text } => write!(f, "optimiser error: {text}"),
        }
    }
}

impl From<std::io::Error> for CalibrationError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<csv::Error> for CalibrationError {
    fn from(e: csv::Error) -> Self {
        Self::Csv(e)
    }
}

impl From<toml::de::Error> for CalibrationError {
    fn from(e: toml::de::Error) -> Self {
        Self::Toml(e)
    }
}

impl From<argmin::core::Error> for CalibrationError {
    /// Errors raised by our own cost function travel through argmin as `anyhow` errors, recover
    /// them so the caller sees the original kind.
    fn from(e: argmin::core::Error) -> Self {
        match e.downcast::<Self>() {
            Ok(inner) => inner,
            Err(other) => Self::Optimiser {
                text: other.to_string(),
            },
        }
    }
}
