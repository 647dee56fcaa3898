#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![doc = include_str!("../README.md")]
mod amino_acid;
mod condition;
mod config;
mod distribution;
mod error;
mod fit;
mod kinetics;
mod loss;
mod optimizer;
mod simulator;
mod table;

pub use amino_acid::{AminoAcid, Fraction, SampleType};
pub use condition::{Condition, Environment, KELVIN_OFFSET};
pub use config::FitConfig;
pub use distribution::{
    AminoAcidObservation, BoundVariance, DistributionCalculator, FractionStats, ObservationTable,
    Statistic,
};
pub use error::{
    ConfigurationError, DataQualityError, Error, Implausibility, IntegrationError, Result,
};
pub use fit::{FitResult, KineticFit};
pub use kinetics::{
    GAS_CONSTANT, InitialState, KineticModel, ModelConfig, ParameterKind, ParameterVector,
    PoolState, Racemization, RateConstants, arrhenius,
};
pub use loss::{Channel, LossConfig, LossFunction, Objective, Residual, Weighting};
pub use optimizer::{
    ConvergenceCriterion, LearningRateDecay, Optimizer, OptimizerConfig, OptimizerPhase, Optimum,
    Termination,
};
pub use simulator::{IntegratorOptions, Simulator, Trajectory, TrajectoryPoint, TrajectorySample};
pub use table::{MeasurementTable, Reading, SampleRow};
