use crate::{
    AminoAcid, BoundVariance, ConfigurationError, DistributionCalculator, IntegratorOptions,
    LossConfig, MeasurementTable, ModelConfig, ObservationTable, OptimizerConfig, Result,
    amino_acid::validate_amino_acids,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// One document configuring distribution, model, integrator, loss and optimizer of a
/// [crate::KineticFit].
///
/// ```toml
/// amino_acids = ["Asx", "Ala"]
/// bound_variance = "propagated"
///
/// [model]
/// reference_temperature = 60.0
/// racemization = { kind = "reversible", equilibrium_ratio = 1.0 }
///
/// [integrator]
/// rtol = 1e-8
///
/// [loss]
/// fractions = ["free", "total"]
/// weighting = { kind = "inverse_variance", concentration_std_floor = 0.05, dl_std_floor = 0.002 }
///
/// [optimizer]
/// learning_rate = 0.05
/// learning_rate_decay = { kind = "exponential", rate = 0.01 }
/// ```
///
/// Every key is optional, unknown keys are rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FitConfig {
    /// Modelled amino acids, all seven by default.
    pub amino_acids: Vec<AminoAcid>,
    /// Variance of the derived bound fraction.
    pub bound_variance: BoundVariance,
    /// Kinetic model.
    pub model: ModelConfig,
    /// Adaptive integrator.
    pub integrator: IntegratorOptions,
    /// Loss function.
    pub loss: LossConfig,
    /// Optimizer.
    pub optimizer: OptimizerConfig,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            amino_acids: AminoAcid::ALL.to_vec(),
            bound_variance: BoundVariance::default(),
            model: ModelConfig::default(),
            integrator: IntegratorOptions::default(),
            loss: LossConfig::default(),
            optimizer: OptimizerConfig::default(),
        }
    }
}

impl FitConfig {
    /// Parses and validates a TOML document.
    pub fn from_toml_str(document: &str) -> Result<Self> {
        let config: Self = toml::from_str(document).map_err(|e| ConfigurationError::Parse {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a TOML file.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let document =
            std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigurationError::Parse {
                message: format!("{}: {e}", path.as_ref().display()),
            })?;
        Self::from_toml_str(&document)
    }

    /// Renders the configuration as TOML document.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string(self).map_err(|e| {
            ConfigurationError::Parse {
                message: e.to_string(),
            }
            .into()
        })
    }

    /// Validates all sections.
    pub fn validate(&self) -> Result<()> {
        validate_amino_acids(&self.amino_acids)?;
        self.model.validate()?;
        self.integrator.validate()?;
        self.loss.validate()?;
        self.optimizer.validate()
    }

    /// Distribution calculator of the configured amino acids.
    pub fn distribution_calculator(&self) -> Result<DistributionCalculator> {
        Ok(DistributionCalculator::new()
            .with_amino_acids(self.amino_acids.clone())?
            .with_bound_variance(self.bound_variance))
    }

    /// Aggregates a measurement table into observations of the configured amino acids.
    pub fn observations(&self, table: &MeasurementTable) -> Result<ObservationTable> {
        self.distribution_calculator()?.compute(table)
    }
}
