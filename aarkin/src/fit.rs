use crate::{
    AminoAcid, FitConfig, InitialState, IntegratorOptions, KineticModel, LossConfig, LossFunction,
    ObservationTable, Optimizer, OptimizerConfig, ParameterVector, Residual, Result, Simulator,
    Termination, Trajectory,
};
use std::{collections::BTreeMap, fmt::Display, sync::Arc};
use tracing::{info, instrument};

const TABLE_WIDTH: usize = 44;

/// Fits the parameters of a [KineticModel] to an [ObservationTable].
///
/// ```
/// use aarkin::{AminoAcid, KineticFit, KineticModel, ObservationTable, OptimizerConfig, Result};
///
/// fn fit(observations: ObservationTable) -> Result<()> {
///     let model = KineticModel::new(vec![AminoAcid::Asx, AminoAcid::Ala])?;
///     let result = KineticFit::new(model, observations)
///         .with_optimizer_config(OptimizerConfig {
///             max_iterations: 100,
///             ..OptimizerConfig::default()
///         })?
///         .solve()?;
///     println!("{result}");
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct KineticFit {
    model: KineticModel,
    observations: ObservationTable,
    integrator: IntegratorOptions,
    loss: LossConfig,
    optimizer: OptimizerConfig,
    initial_states: BTreeMap<AminoAcid, InitialState>,
}

impl KineticFit {
    /// Creates a fit with default integrator, loss and optimizer configurations.
    pub fn new(model: KineticModel, observations: ObservationTable) -> Self {
        Self {
            model,
            observations,
            integrator: IntegratorOptions::default(),
            loss: LossConfig::default(),
            optimizer: OptimizerConfig::default(),
            initial_states: BTreeMap::new(),
        }
    }

    /// Creates a fit from a validated configuration document.
    pub fn from_config(config: &FitConfig, observations: ObservationTable) -> Result<Self> {
        config.validate()?;
        let model = KineticModel::new(config.amino_acids.clone())?.with_config(config.model)?;
        Self::new(model, observations)
            .with_integrator(config.integrator)?
            .with_loss_config(config.loss.clone())?
            .with_optimizer_config(config.optimizer.clone())
    }

    /// Returns the fit with the given integrator options.
    pub fn with_integrator(mut self, options: IntegratorOptions) -> Result<Self> {
        options.validate()?;
        self.integrator = options;
        Ok(self)
    }

    /// Returns the fit with the given loss configuration.
    pub fn with_loss_config(mut self, config: LossConfig) -> Result<Self> {
        config.validate()?;
        self.loss = config;
        Ok(self)
    }

    /// Returns the fit with the given optimizer configuration.
    pub fn with_optimizer_config(mut self, config: OptimizerConfig) -> Result<Self> {
        config.validate()?;
        self.optimizer = config;
        Ok(self)
    }

    /// Returns the fit with the state of an amino acid at the start of heating, e.g.
    /// [InitialState::pristine]. The amino acid is then simulated from `t = 0` in every
    /// environment instead of from its earliest observation.
    pub fn with_initial_state(mut self, amino_acid: AminoAcid, state: InitialState) -> Self {
        self.initial_states.insert(amino_acid, state);
        self
    }

    /// Fitted model.
    pub fn model(&self) -> &KineticModel {
        &self.model
    }

    /// Observations fitted against.
    pub fn observations(&self) -> &ObservationTable {
        &self.observations
    }

    /// Loss function of the fit.
    pub fn loss_function(&self) -> Result<LossFunction> {
        let simulator = Simulator::new(self.model.clone()).with_options(self.integrator)?;
        LossFunction::new(
            simulator,
            &self.observations,
            self.loss.clone(),
            &self.initial_states,
        )
    }

    /// Minimizes the loss starting from the configured or the default parameters.
    #[instrument(skip_all)]
    pub fn solve(&self) -> Result<FitResult> {
        let loss = self.loss_function()?;
        let seed = match &self.optimizer.initial_parameters {
            Some(values) => self.model.parameters(values.clone())?,
            None => self.model.default_parameters(),
        };
        let x0 = self.model.to_coordinates(&seed)?;
        info!(
            amino_acids = self.model.amino_acids().len(),
            environments = loss.environments().len(),
            terms = loss.term_count(),
            "Starting kinetic fit."
        );
        let optimizer = Optimizer::new(Arc::new(loss), self.optimizer.clone())?;
        let optimum = optimizer.minimize(&x0)?;
        let parameters = self.model.from_coordinates(&optimum.x)?;
        info!(
            termination = %optimum.termination,
            loss = optimum.loss,
            iterations = optimum.iterations,
            "Finished kinetic fit."
        );
        Ok(FitResult {
            parameters,
            loss: optimum.loss,
            iterations: optimum.iterations,
            termination: optimum.termination,
            loss_history: optimum.loss_history,
        })
    }

    /// Simulated trajectories of every observed environment and amino acid at the given heating
    /// times, for plotting fitted curves.
    pub fn trajectories(
        &self,
        parameters: &ParameterVector,
        times: &[f64],
    ) -> Result<Vec<Trajectory>> {
        self.loss_function()?.trajectories(parameters, times)
    }

    /// Residuals of every observation.
    pub fn residuals(&self, parameters: &ParameterVector) -> Result<Vec<Residual>> {
        self.loss_function()?.residuals(parameters)
    }
}

/// Outcome of [KineticFit::solve].
#[derive(Debug, Clone, PartialEq)]
pub struct FitResult {
    /// Parameters of the lowest loss.
    pub parameters: ParameterVector,
    /// Lowest loss, infinite if the seed could not be evaluated.
    pub loss: f64,
    /// Completed iterations.
    pub iterations: usize,
    /// Reason the optimizer stopped.
    pub termination: Termination,
    /// Loss of every iteration.
    pub loss_history: Vec<f64>,
}

impl Display for FitResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let param_title = format!("{:-^1$}", " Parameters ", TABLE_WIDTH);
        let stats_title = format!("{:-^1$}", " Statistics ", TABLE_WIDTH);
        let footer = format!("{:-^1$}", String::new(), TABLE_WIDTH);
        write!(
            f,
            "{param_title}\n{}\n{stats_title}\nLoss: {:.6e}\nIterations: {}\nTermination: {}\n{footer}",
            self.parameters, self.loss, self.iterations, self.termination
        )
    }
}
