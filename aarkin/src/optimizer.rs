use crate::{ConfigurationError, Error, Objective, Result};
use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use std::{fmt::Display, sync::Arc, time::Instant};
use tracing::{debug, warn};

/// Schedule of the learning rate over the iterations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LearningRateDecay {
    /// Keeps the initial learning rate.
    #[default]
    Constant,
    /// `lr · exp(−rate · i)`
    Exponential {
        /// Decay rate per iteration.
        rate: f64,
    },
    /// `lr · factor^⌊i / every⌋`
    Step {
        /// Iterations between two decays.
        every: usize,
        /// Multiplicative decay.
        factor: f64,
    },
    /// `lr / (1 + rate · i)`
    InverseTime {
        /// Decay rate per iteration.
        rate: f64,
    },
}

impl LearningRateDecay {
    /// Learning rate of the zero based iteration `i`.
    pub fn learning_rate(&self, initial: f64, iteration: usize) -> f64 {
        let i = iteration as f64;
        match self {
            LearningRateDecay::Constant => initial,
            LearningRateDecay::Exponential { rate } => initial * (-rate * i).exp(),
            LearningRateDecay::Step { every, factor } => {
                initial * factor.powi((iteration / (*every).max(1)) as i32)
            }
            LearningRateDecay::InverseTime { rate } => initial / (1. + rate * i),
        }
    }

    fn validate(&self) -> Result<()> {
        let (option, value, valid, requirement) = match *self {
            LearningRateDecay::Constant => return Ok(()),
            LearningRateDecay::Exponential { rate } => ("decay rate", rate, rate >= 0., ">= 0"),
            LearningRateDecay::InverseTime { rate } => ("decay rate", rate, rate >= 0., ">= 0"),
            LearningRateDecay::Step { every, factor } => {
                if every == 0 {
                    return Err(ConfigurationError::InvalidOption {
                        option: "decay every",
                        value: 0.,
                        requirement: "> 0",
                    }
                    .into());
                }
                ("decay factor", factor, factor > 0. && factor <= 1., "within (0, 1]")
            }
        };
        if !value.is_finite() || !valid {
            return Err(ConfigurationError::InvalidOption {
                option,
                value,
                requirement,
            }
            .into());
        }
        Ok(())
    }
}

/// Configuration of [Optimizer].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OptimizerConfig {
    /// Physical seed values in layout order, the model default if none.
    pub initial_parameters: Option<Vec<f64>>,
    /// Initial learning rate.
    pub learning_rate: f64,
    /// Learning rate schedule.
    pub learning_rate_decay: LearningRateDecay,
    /// Hard ceiling of iterations.
    pub max_iterations: usize,
    /// Tolerance of the gradient norm and of loss changes.
    pub convergence_tolerance: f64,
    /// Consecutive iterations of loss changes below tolerance that count as converged.
    pub plateau_iterations: usize,
    /// Iterations without improvement of the best loss before stopping early.
    pub patience: usize,
    /// Minimal decrease of the best loss that counts as improvement.
    pub improvement_threshold: f64,
    /// Rejects steps that do not decrease the loss.
    pub line_search: bool,
    /// Retries of a rejected step.
    pub max_step_retries: usize,
    /// Factor applied to a rejected step.
    pub step_shrink: f64,
    /// Largest euclidean norm of a step in coordinates.
    pub max_step_norm: f64,
    /// Wall clock budget in seconds.
    pub timeout_seconds: Option<f64>,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            initial_parameters: None,
            learning_rate: 0.05,
            learning_rate_decay: LearningRateDecay::default(),
            max_iterations: 500,
            convergence_tolerance: 1e-8,
            plateau_iterations: 10,
            patience: 25,
            improvement_threshold: 0.,
            line_search: true,
            max_step_retries: 10,
            step_shrink: 0.5,
            max_step_norm: 1.,
            timeout_seconds: None,
        }
    }
}

impl OptimizerConfig {
    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        let checks = [
            (
                "learning_rate",
                self.learning_rate,
                self.learning_rate > 0.,
                "> 0",
            ),
            (
                "max_iterations",
                self.max_iterations as f64,
                self.max_iterations > 0,
                "> 0",
            ),
            (
                "convergence_tolerance",
                self.convergence_tolerance,
                self.convergence_tolerance > 0.,
                "> 0",
            ),
            (
                "plateau_iterations",
                self.plateau_iterations as f64,
                self.plateau_iterations > 0,
                "> 0",
            ),
            (
                "improvement_threshold",
                self.improvement_threshold,
                self.improvement_threshold >= 0.,
                ">= 0",
            ),
            (
                "step_shrink",
                self.step_shrink,
                self.step_shrink > 0. && self.step_shrink < 1.,
                "within (0, 1)",
            ),
            (
                "max_step_norm",
                self.max_step_norm,
                self.max_step_norm > 0.,
                "> 0",
            ),
            (
                "timeout_seconds",
                self.timeout_seconds.unwrap_or(0.),
                self.timeout_seconds.is_none_or(|t| t >= 0.),
                ">= 0",
            ),
        ];
        for (option, value, valid, requirement) in checks {
            if !value.is_finite() || !valid {
                return Err(ConfigurationError::InvalidOption {
                    option,
                    value,
                    requirement,
                }
                .into());
            }
        }
        self.learning_rate_decay.validate()
    }
}

/// Phases of an [Optimizer] run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizerPhase {
    /// Configuration is validated and the seed evaluated.
    Initializing,
    /// Gradient steps are taken.
    Iterating,
    /// A convergence criterion was met.
    Converged,
    /// Stopped before convergence by patience, iteration cap or timeout.
    EarlyStopped,
    /// An evaluation failed without recovery.
    Failed,
}

/// Convergence criteria.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergenceCriterion {
    /// The projected gradient norm fell below tolerance.
    GradientNorm,
    /// Loss changes stayed below tolerance for the configured number of iterations.
    LossPlateau,
}

/// Reason an [Optimizer] run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Termination {
    /// A convergence criterion was met.
    Converged(ConvergenceCriterion),
    /// The best loss did not improve within the patience.
    EarlyStopped,
    /// The iteration cap was reached.
    MaxIterations,
    /// The wall clock budget was exhausted.
    Timeout,
    /// An evaluation failed without recovery.
    Failed(Error),
}

impl Termination {
    /// Terminal phase of the run.
    pub fn phase(&self) -> OptimizerPhase {
        match self {
            Termination::Converged(_) => OptimizerPhase::Converged,
            Termination::EarlyStopped | Termination::MaxIterations | Termination::Timeout => {
                OptimizerPhase::EarlyStopped
            }
            Termination::Failed(_) => OptimizerPhase::Failed,
        }
    }
}

impl Display for Termination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Termination::Converged(ConvergenceCriterion::GradientNorm) => {
                write!(f, "converged (gradient norm)")
            }
            Termination::Converged(ConvergenceCriterion::LossPlateau) => {
                write!(f, "converged (loss plateau)")
            }
            Termination::EarlyStopped => write!(f, "early stopped"),
            Termination::MaxIterations => write!(f, "max iterations"),
            Termination::Timeout => write!(f, "timeout"),
            Termination::Failed(err) => write!(f, "failed: {err}"),
        }
    }
}

// mutable state of a run, updated once per iteration
#[derive(Debug, Clone, PartialEq)]
struct OptimizationState {
    x: DVector<f64>,
    loss: f64,
    gradient: DVector<f64>,
    best_x: DVector<f64>,
    best_loss: f64,
    iteration: usize,
    // iterations since the last improvement
    patience: usize,
    // consecutive iterations with loss changes below tolerance
    plateau: usize,
}

/// Result of an [Optimizer] run.
#[derive(Debug, Clone, PartialEq)]
pub struct Optimum {
    /// Coordinates of the lowest loss.
    pub x: DVector<f64>,
    /// Lowest loss, infinite if the seed could not be evaluated.
    pub loss: f64,
    /// Completed iterations.
    pub iterations: usize,
    /// Reason the run ended.
    pub termination: Termination,
    /// Loss of every iteration.
    pub loss_history: Vec<f64>,
}

enum StepOutcome {
    Accepted(DVector<f64>, f64, DVector<f64>),
    Stalled,
    Failed(Error),
}

#[cfg_attr(doc, aquamarine::aquamarine)]
/// Projected gradient descent on an [Objective] within its coordinate bounds.
///
/// ```mermaid
/// stateDiagram-v2
///     [*] --> Initializing
///     Initializing --> Iterating: seed evaluated
///     Initializing --> Failed: seed evaluation failed
///     Iterating --> Iterating: step
///     Iterating --> Converged: gradient norm or plateau
///     Iterating --> EarlyStopped: patience, iteration cap or timeout
///     Iterating --> Failed: last retry failed
/// ```
///
/// A candidate step that fails to evaluate with a recoverable error, or that does not decrease
/// the loss while line search is enabled, is shrunk and retried. Every run returns the lowest
/// loss seen, even if it failed.
pub struct Optimizer {
    objective: Arc<dyn Objective + Send + Sync>,
    config: OptimizerConfig,
}

impl Optimizer {
    /// Creates an optimizer with a validated configuration.
    pub fn new(
        objective: Arc<dyn Objective + Send + Sync>,
        config: OptimizerConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self { objective, config })
    }

    /// Optimizer configuration.
    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    /// Minimizes the objective from the seed coordinates, which are projected onto the bounds
    /// first.
    pub fn minimize(&self, x0: &DVector<f64>) -> Result<Optimum> {
        let start = Instant::now();
        let dimension = self.objective.dimension();
        if x0.len() != dimension {
            return Err(ConfigurationError::ParameterLength {
                expected: dimension,
                found: x0.len(),
            }
            .into());
        }
        let (lower, upper) = self.objective.bounds();
        let x = project(x0.clone(), &lower, &upper);
        let (loss, gradient) = match self.objective.val_grad(&x) {
            Ok(val_grad) => val_grad,
            Err(err) => {
                warn!(%err, "Seed evaluation failed.");
                return Ok(Optimum {
                    x,
                    loss: f64::INFINITY,
                    iterations: 0,
                    termination: Termination::Failed(err),
                    loss_history: vec![],
                });
            }
        };
        let mut state = OptimizationState {
            best_x: x.clone(),
            x,
            loss,
            gradient,
            best_loss: f64::INFINITY,
            iteration: 0,
            patience: 0,
            plateau: 0,
        };
        let mut history: Vec<f64> = vec![];

        let termination = loop {
            self.record(&mut state, &mut history);
            let gradient_norm = projected_gradient_norm(&state, &lower, &upper);
            debug!(
                iteration = state.iteration,
                loss = state.loss,
                best_loss = state.best_loss,
                gradient_norm,
                "Optimizer iteration."
            );
            if let Some(termination) = self.termination(&state, gradient_norm, start) {
                break termination;
            }
            match self.step(&state, &lower, &upper) {
                StepOutcome::Accepted(x, loss, gradient) => {
                    state.x = x;
                    state.loss = loss;
                    state.gradient = gradient;
                }
                StepOutcome::Stalled => {}
                StepOutcome::Failed(err) => break Termination::Failed(err),
            }
        };
        Ok(Optimum {
            x: state.best_x,
            loss: state.best_loss,
            iterations: state.iteration,
            termination,
            loss_history: history,
        })
    }

    fn record(&self, state: &mut OptimizationState, history: &mut Vec<f64>) {
        state.iteration += 1;
        if let Some(previous) = history.last() {
            if (state.loss - previous).abs() < self.config.convergence_tolerance {
                state.plateau += 1;
            } else {
                state.plateau = 0;
            }
        }
        history.push(state.loss);
        let improved = state.loss < state.best_loss - self.config.improvement_threshold;
        if state.loss < state.best_loss {
            state.best_loss = state.loss;
            state.best_x = state.x.clone();
        }
        if improved {
            state.patience = 0;
        } else {
            state.patience += 1;
        }
    }

    fn termination(
        &self,
        state: &OptimizationState,
        gradient_norm: f64,
        start: Instant,
    ) -> Option<Termination> {
        let config = &self.config;
        if state.iteration >= config.max_iterations {
            return Some(Termination::MaxIterations);
        }
        if gradient_norm < config.convergence_tolerance {
            return Some(Termination::Converged(ConvergenceCriterion::GradientNorm));
        }
        if state.plateau >= config.plateau_iterations {
            return Some(Termination::Converged(ConvergenceCriterion::LossPlateau));
        }
        if state.patience > config.patience {
            return Some(Termination::EarlyStopped);
        }
        if config
            .timeout_seconds
            .is_some_and(|t| start.elapsed().as_secs_f64() >= t)
        {
            return Some(Termination::Timeout);
        }
        None
    }

    fn step(
        &self,
        state: &OptimizationState,
        lower: &DVector<f64>,
        upper: &DVector<f64>,
    ) -> StepOutcome {
        let config = &self.config;
        let learning_rate = config
            .learning_rate_decay
            .learning_rate(config.learning_rate, state.iteration - 1);
        let mut dx = -&state.gradient * learning_rate;
        let norm = dx.norm();
        if norm > config.max_step_norm {
            dx *= config.max_step_norm / norm;
        }
        for attempt in 0..=config.max_step_retries {
            let last = attempt == config.max_step_retries;
            let candidate = project(&state.x + &dx, lower, upper);
            match self.objective.val_grad(&candidate) {
                Ok((loss, gradient)) if !config.line_search || loss < state.loss => {
                    return StepOutcome::Accepted(candidate, loss, gradient);
                }
                Ok((loss, _)) => {
                    if last {
                        warn!(
                            iteration = state.iteration,
                            loss,
                            "No decreasing step found, keeping the iterate."
                        );
                        return StepOutcome::Stalled;
                    }
                }
                Err(err) if err.is_recoverable() => {
                    warn!(iteration = state.iteration, attempt, %err, "Rejected step.");
                    if last {
                        return StepOutcome::Failed(err);
                    }
                }
                Err(err) => return StepOutcome::Failed(err),
            }
            dx *= config.step_shrink;
        }
        StepOutcome::Stalled
    }
}

fn project(mut x: DVector<f64>, lower: &DVector<f64>, upper: &DVector<f64>) -> DVector<f64> {
    x.iter_mut()
        .zip(lower.iter().zip(upper.iter()))
        .for_each(|(v, (l, u))| *v = v.clamp(*l, *u));
    x
}

// gradient components pushing out of an active bound do not count
fn projected_gradient_norm(
    state: &OptimizationState,
    lower: &DVector<f64>,
    upper: &DVector<f64>,
) -> f64 {
    state
        .gradient
        .iter()
        .enumerate()
        .map(|(i, g)| {
            let blocked =
                (state.x[i] <= lower[i] && *g > 0.) || (state.x[i] >= upper[i] && *g < 0.);
            if blocked { 0. } else { g * g }
        })
        .sum::<f64>()
        .sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AminoAcid, Environment, Implausibility};

    // (x - c)² summed, failing with a recoverable error beyond a radius
    struct Paraboloid {
        center: DVector<f64>,
        fail_beyond: f64,
    }

    impl Objective for Paraboloid {
        fn dimension(&self) -> usize {
            self.center.len()
        }

        fn bounds(&self) -> (DVector<f64>, DVector<f64>) {
            let n = self.center.len();
            (
                DVector::from_element(n, -10.),
                DVector::from_element(n, 10.),
            )
        }

        fn val(&self, x: &DVector<f64>) -> Result<f64> {
            if x.norm() > self.fail_beyond {
                return Err(Error::Implausible {
                    amino_acid: AminoAcid::Ala,
                    environment: Environment::new(50., 7.)?,
                    reason: Implausibility::MassBalance {
                        initial: 1.,
                        found: 2.,
                    },
                });
            }
            Ok((x - &self.center).norm_squared())
        }

        fn val_grad(&self, x: &DVector<f64>) -> Result<(f64, DVector<f64>)> {
            let val = self.val(x)?;
            Ok((val, (x - &self.center) * 2.))
        }
    }

    fn paraboloid(fail_beyond: f64) -> Arc<dyn Objective + Send + Sync> {
        Arc::new(Paraboloid {
            center: DVector::from_vec(vec![1., -2.]),
            fail_beyond,
        })
    }

    #[test]
    fn converges_on_paraboloid() -> Result<()> {
        let config = OptimizerConfig {
            learning_rate: 0.25,
            convergence_tolerance: 1e-10,
            ..OptimizerConfig::default()
        };
        let optimizer = Optimizer::new(paraboloid(f64::INFINITY), config)?;
        let optimum = optimizer.minimize(&DVector::zeros(2))?;
        assert!(matches!(optimum.termination, Termination::Converged(_)));
        assert!((optimum.x[0] - 1.).abs() < 1e-4);
        assert!((optimum.x[1] + 2.).abs() < 1e-4);
        assert_eq!(optimum.loss_history.len(), optimum.iterations);
        Ok(())
    }

    #[test]
    fn non_increasing_history_with_line_search() -> Result<()> {
        let config = OptimizerConfig {
            learning_rate: 2.,
            max_iterations: 50,
            ..OptimizerConfig::default()
        };
        let optimizer = Optimizer::new(paraboloid(f64::INFINITY), config)?;
        let optimum = optimizer.minimize(&DVector::zeros(2))?;
        assert!(optimum.loss_history.windows(2).all(|w| w[1] <= w[0]));
        Ok(())
    }

    #[test]
    fn single_iteration() -> Result<()> {
        let config = OptimizerConfig {
            max_iterations: 1,
            ..OptimizerConfig::default()
        };
        let optimizer = Optimizer::new(paraboloid(f64::INFINITY), config)?;
        let optimum = optimizer.minimize(&DVector::zeros(2))?;
        assert_eq!(optimum.termination, Termination::MaxIterations);
        assert_eq!(optimum.loss_history, vec![5.]);
        assert_eq!(optimum.loss, 5.);
        assert_eq!(optimum.termination.phase(), OptimizerPhase::EarlyStopped);
        Ok(())
    }

    #[test]
    fn invalid_learning_rate() {
        let config = OptimizerConfig {
            learning_rate: 0.,
            ..OptimizerConfig::default()
        };
        assert!(matches!(
            Optimizer::new(paraboloid(f64::INFINITY), config),
            Err(Error::Configuration(ConfigurationError::InvalidOption {
                option: "learning_rate",
                ..
            }))
        ));
    }

    #[test]
    fn failed_seed() -> Result<()> {
        let optimizer = Optimizer::new(paraboloid(0.5), OptimizerConfig::default())?;
        let optimum = optimizer.minimize(&DVector::from_vec(vec![3., 3.]))?;
        assert!(matches!(optimum.termination, Termination::Failed(_)));
        assert_eq!(optimum.termination.phase(), OptimizerPhase::Failed);
        assert_eq!(optimum.iterations, 0);
        assert!(optimum.loss_history.is_empty());
        Ok(())
    }

    #[test]
    fn failing_steps_are_retried() -> Result<()> {
        // every full step leaves the region, shrunk steps stay inside
        let config = OptimizerConfig {
            learning_rate: 1.,
            max_step_norm: 10.,
            max_iterations: 3,
            ..OptimizerConfig::default()
        };
        let optimizer = Optimizer::new(paraboloid(2.), config)?;
        let optimum = optimizer.minimize(&DVector::zeros(2))?;
        assert_eq!(optimum.termination, Termination::MaxIterations);
        assert!((optimum.loss - 0.3125).abs() < 1e-12);
        assert_eq!(optimum.loss_history.len(), 3);
        Ok(())
    }

    #[test]
    fn failing_last_retry() -> Result<()> {
        let config = OptimizerConfig {
            learning_rate: 1.,
            max_step_norm: 10.,
            max_step_retries: 0,
            ..OptimizerConfig::default()
        };
        let optimizer = Optimizer::new(paraboloid(2.), config)?;
        let optimum = optimizer.minimize(&DVector::zeros(2))?;
        assert!(matches!(optimum.termination, Termination::Failed(_)));
        assert_eq!(optimum.loss, 5.);
        assert_eq!(optimum.x, DVector::zeros(2));
        Ok(())
    }

    // constant loss, no step ever decreases it
    struct Flat;

    impl Objective for Flat {
        fn dimension(&self) -> usize {
            2
        }

        fn bounds(&self) -> (DVector<f64>, DVector<f64>) {
            (DVector::from_element(2, -1.), DVector::from_element(2, 1.))
        }

        fn val(&self, _x: &DVector<f64>) -> Result<f64> {
            Ok(1.)
        }

        fn val_grad(&self, _x: &DVector<f64>) -> Result<(f64, DVector<f64>)> {
            Ok((1., DVector::from_vec(vec![1., 0.])))
        }
    }

    #[test]
    fn patience_stops_early() -> Result<()> {
        let config = OptimizerConfig {
            patience: 2,
            plateau_iterations: 100,
            ..OptimizerConfig::default()
        };
        let optimizer = Optimizer::new(Arc::new(Flat), config)?;
        let optimum = optimizer.minimize(&DVector::zeros(2))?;
        assert_eq!(optimum.termination, Termination::EarlyStopped);
        assert_eq!(optimum.iterations, 4);
        assert_eq!(optimum.loss_history, vec![1.; 4]);
        Ok(())
    }

    #[test]
    fn plateau_converges() -> Result<()> {
        let config = OptimizerConfig {
            plateau_iterations: 3,
            ..OptimizerConfig::default()
        };
        let optimizer = Optimizer::new(Arc::new(Flat), config)?;
        let optimum = optimizer.minimize(&DVector::zeros(2))?;
        assert_eq!(
            optimum.termination,
            Termination::Converged(ConvergenceCriterion::LossPlateau)
        );
        assert_eq!(optimum.iterations, 4);
        Ok(())
    }

    #[test]
    fn timeout() -> Result<()> {
        let config = OptimizerConfig {
            timeout_seconds: Some(0.),
            ..OptimizerConfig::default()
        };
        let optimizer = Optimizer::new(paraboloid(f64::INFINITY), config)?;
        let optimum = optimizer.minimize(&DVector::zeros(2))?;
        assert_eq!(optimum.termination, Termination::Timeout);
        assert_eq!(optimum.iterations, 1);
        Ok(())
    }

    #[test]
    fn learning_rate_schedules() {
        let exp = LearningRateDecay::Exponential { rate: 0.5 };
        assert!((exp.learning_rate(1., 2) - (-1f64).exp()).abs() < 1e-12);
        let step = LearningRateDecay::Step {
            every: 3,
            factor: 0.5,
        };
        assert_eq!(step.learning_rate(1., 2), 1.);
        assert_eq!(step.learning_rate(1., 7), 0.25);
        let inv = LearningRateDecay::InverseTime { rate: 1. };
        assert_eq!(inv.learning_rate(1., 3), 0.25);
    }

    #[test]
    fn dimension_mismatch() -> Result<()> {
        let optimizer = Optimizer::new(paraboloid(f64::INFINITY), OptimizerConfig::default())?;
        assert_eq!(
            optimizer.minimize(&DVector::zeros(3)),
            Err(Error::Configuration(ConfigurationError::ParameterLength {
                expected: 2,
                found: 3
            }))
        );
        Ok(())
    }
}
