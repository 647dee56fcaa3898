use crate::{AminoAcid, Condition, Environment};

/// Main error type
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// Measurements or observations are inconsistent.
    #[error(transparent)]
    DataQuality(#[from] DataQualityError),
    /// The numerical integration of the kinetic model failed.
    #[error(transparent)]
    Integration(#[from] IntegrationError),
    /// Options or parameters are invalid.
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    /// The integration succeeded but the trajectory is physically implausible.
    #[error("implausible trajectory of {amino_acid} at {environment}: {reason}")]
    Implausible {
        /// Affected amino acid.
        amino_acid: AminoAcid,
        /// Environment of the simulation.
        environment: Environment,
        /// Violated physical constraint.
        reason: Implausibility,
    },
    /// A measurement table could not be read.
    #[error("measurement table error at line {line:?}: {message}")]
    Table {
        /// Line of the table, if known.
        line: Option<u64>,
        /// Reader message.
        message: String,
    },
}

impl Error {
    /// Returns true for errors a caller may recover from by changing the parameters, i.e.
    /// integration failures and implausible trajectories.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::Integration(_) | Error::Implausible { .. })
    }
}

/// Inconsistent measurements or observations.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum DataQualityError {
    /// Total concentration is lower than the free concentration.
    #[error(
        "negative bound concentration of {amino_acid} at {condition}: total {total} < free {free}"
    )]
    NegativeBound {
        /// Affected amino acid.
        amino_acid: AminoAcid,
        /// Affected condition.
        condition: Condition,
        /// Mean free concentration.
        free: f64,
        /// Mean total concentration.
        total: f64,
    },
    /// A statistic without any replicate.
    #[error("statistic {statistic} requires at least one replicate")]
    NoReplicates {
        /// Name of the statistic.
        statistic: &'static str,
    },
    /// Condition value is out of range.
    #[error("invalid condition {field}: {value}")]
    InvalidCondition {
        /// Condition field.
        field: &'static str,
        /// Found value.
        value: f64,
    },
    /// Reading value is out of range.
    #[error("invalid {field} of {amino_acid}: {value}")]
    InvalidReading {
        /// Affected amino acid.
        amino_acid: AminoAcid,
        /// Reading field.
        field: &'static str,
        /// Found value.
        value: f64,
    },
    /// There is nothing to fit against.
    #[error("no observed values to compare against")]
    NoObservations,
    /// The simulation origin of an amino acid can not be seeded.
    #[error("earliest observation of {amino_acid} at {environment} lacks the total fraction")]
    MissingInitialState {
        /// Affected amino acid.
        amino_acid: AminoAcid,
        /// Affected environment.
        environment: Environment,
    },
}

/// Failures of the numerical integration.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum IntegrationError {
    /// The state contains NaN or infinite values.
    #[error("non-finite state of {amino_acid} at t = {time} h")]
    NonFinite {
        /// Affected amino acid.
        amino_acid: AminoAcid,
        /// Time of the rejected state.
        time: f64,
    },
    /// A pool concentration became negative.
    #[error("negative concentration {value} of {amino_acid} at t = {time} h")]
    NegativeConcentration {
        /// Affected amino acid.
        amino_acid: AminoAcid,
        /// Time of the rejected state.
        time: f64,
        /// Lowest pool concentration.
        value: f64,
    },
    /// The error control requested a step below the minimal step size.
    #[error("step size {step} below minimum for {amino_acid} at t = {time} h")]
    StepSizeUnderflow {
        /// Affected amino acid.
        amino_acid: AminoAcid,
        /// Time the integration got stuck.
        time: f64,
        /// Rejected step size.
        step: f64,
    },
    /// The step budget was exhausted before reaching a requested time.
    #[error("exceeded {max_steps} steps for {amino_acid} at t = {time} h")]
    StepLimit {
        /// Affected amino acid.
        amino_acid: AminoAcid,
        /// Time reached.
        time: f64,
        /// Step budget.
        max_steps: usize,
    },
}

/// Invalid options or parameters.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ConfigurationError {
    /// An option value violates its requirement.
    #[error("option {option} = {value} but must be {requirement}")]
    InvalidOption {
        /// Option name.
        option: &'static str,
        /// Found value.
        value: f64,
        /// Requirement on the value.
        requirement: &'static str,
    },
    /// No amino acid was configured.
    #[error("amino acid list is empty")]
    EmptyAminoAcids,
    /// An amino acid was configured twice.
    #[error("amino acid {0} is listed more than once")]
    DuplicateAminoAcid(AminoAcid),
    /// An amino acid symbol is not known.
    #[error("unknown amino acid {0}")]
    UnknownAminoAcid(String),
    /// A parameter vector does not match the model layout.
    #[error("expected {expected} parameters, found {found}")]
    ParameterLength {
        /// Length of the model layout.
        expected: usize,
        /// Length of the given vector.
        found: usize,
    },
    /// A parameter is not part of the model layout.
    #[error("parameter {0} is not part of the model")]
    UnknownParameter(String),
    /// A parameter value is out of its physical range.
    #[error("parameter {parameter} = {value} is out of range")]
    InvalidParameter {
        /// Parameter name.
        parameter: String,
        /// Found value.
        value: f64,
    },
    /// A rate constant can not be mapped onto log coordinates.
    #[error("rate constant {parameter} = {value} must be positive to be optimized")]
    NonPositiveRate {
        /// Parameter name.
        parameter: String,
        /// Found value.
        value: f64,
    },
    /// Requested output times are invalid.
    #[error("invalid output times: {reason}")]
    InvalidTimes {
        /// Violated requirement.
        reason: &'static str,
    },
    /// A configuration document could not be parsed.
    #[error("failed to parse configuration: {message}")]
    Parse {
        /// Parser message.
        message: String,
    },
}

/// Physical constraints a trajectory may violate.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum Implausibility {
    /// The sum of all pools drifted although the model conserves it.
    #[error("mass balance drifted from {initial} to {found}")]
    MassBalance {
        /// Initial total concentration.
        initial: f64,
        /// Total concentration found.
        found: f64,
    },
    /// A D/L ratio passed the equilibrium ratio it approaches.
    #[error("D/L ratio {found} exceeds equilibrium ratio {equilibrium}")]
    RatioOvershoot {
        /// Equilibrium D/L ratio of the model.
        equilibrium: f64,
        /// D/L ratio found.
        found: f64,
    },
}

/// Main result type
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recoverable_errors() -> Result<()> {
        let integration: Error = IntegrationError::NonFinite {
            amino_acid: AminoAcid::Ala,
            time: 1.,
        }
        .into();
        let implausible = Error::Implausible {
            amino_acid: AminoAcid::Ala,
            environment: Environment::new(50., 7.)?,
            reason: Implausibility::MassBalance {
                initial: 1.,
                found: 2.,
            },
        };
        let config: Error = ConfigurationError::EmptyAminoAcids.into();
        assert!(integration.is_recoverable());
        assert!(implausible.is_recoverable());
        assert!(!config.is_recoverable());
        Ok(())
    }

    #[test]
    fn error_display() {
        let err: Error = ConfigurationError::InvalidOption {
            option: "learning_rate",
            value: 0.,
            requirement: "> 0",
        }
        .into();
        assert_eq!(
            err.to_string(),
            "option learning_rate = 0 but must be > 0".to_string()
        );
    }
}
