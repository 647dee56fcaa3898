use crate::{
    AminoAcid, AminoAcidObservation, Condition, ConfigurationError, DataQualityError, Environment,
    Fraction, InitialState, ObservationTable, ParameterVector, PoolState, Result, Simulator,
    Statistic, Trajectory,
};
use nalgebra::DVector;
use num_dual::{Dual64, DualNum};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Interface for functions minimized by the [crate::Optimizer], providing value and gradient at
/// optimizer coordinates.
pub trait Objective {
    /// Number of coordinates.
    fn dimension(&self) -> usize;
    /// Lower and upper coordinate bounds.
    fn bounds(&self) -> (DVector<f64>, DVector<f64>);
    /// Returns the value at x.
    fn val(&self, x: &DVector<f64>) -> Result<f64>;
    /// Returns the value and gradient at x.
    fn val_grad(&self, x: &DVector<f64>) -> Result<(f64, DVector<f64>)>;
}

/// Ensures the consistency of [Objective] value and gradient methods.
#[macro_export]
macro_rules! assert_objective_consistency {
    ($objective:ident, $x:expr) => {
        let val = $objective.val($x);
        let val_grad = $objective.val_grad($x);
        assert_eq!(val, val_grad.map(|v| v.0));
    };
}

/// Measured quantity of a fraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    /// Concentration.
    Concentration,
    /// D/L ratio.
    DlRatio,
}

impl Channel {
    /// Both channels.
    pub const ALL: [Channel; 2] = [Channel::Concentration, Channel::DlRatio];
}

/// Weighting of squared residuals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Weighting {
    /// Every residual is weighted by its channel weight.
    #[default]
    Uniform,
    /// The channel weight is divided by the variance of the observed mean, `std² / n`. Undefined
    /// or tiny standard deviations are floored per channel.
    InverseVariance {
        /// Smallest standard deviation of concentrations.
        concentration_std_floor: f64,
        /// Smallest standard deviation of D/L ratios.
        dl_std_floor: f64,
    },
}

/// Configuration of [LossFunction].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LossConfig {
    /// Residual weighting.
    pub weighting: Weighting,
    /// Fractions compared against the simulation.
    pub fractions: Vec<Fraction>,
    /// Weight of concentration residuals.
    pub concentration_weight: f64,
    /// Weight of D/L residuals.
    pub dl_weight: f64,
}

impl Default for LossConfig {
    fn default() -> Self {
        Self {
            weighting: Weighting::default(),
            fractions: vec![Fraction::Free, Fraction::Total],
            concentration_weight: 1.,
            dl_weight: 1.,
        }
    }
}

impl LossConfig {
    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        let mut weights = vec![
            ("concentration_weight", self.concentration_weight),
            ("dl_weight", self.dl_weight),
        ];
        if let Weighting::InverseVariance {
            concentration_std_floor,
            dl_std_floor,
        } = self.weighting
        {
            weights.push(("concentration_std_floor", concentration_std_floor));
            weights.push(("dl_std_floor", dl_std_floor));
        }
        for (option, value) in weights {
            if !value.is_finite() || value < 0. {
                return Err(ConfigurationError::InvalidOption {
                    option,
                    value,
                    requirement: ">= 0",
                }
                .into());
            }
        }
        if let Weighting::InverseVariance {
            concentration_std_floor,
            dl_std_floor,
        } = self.weighting
        {
            if concentration_std_floor == 0. || dl_std_floor == 0. {
                return Err(ConfigurationError::InvalidOption {
                    option: "std_floor",
                    value: 0.,
                    requirement: "> 0",
                }
                .into());
            }
        }
        if self.fractions.is_empty() {
            return Err(ConfigurationError::InvalidOption {
                option: "fractions",
                value: 0.,
                requirement: "non-empty",
            }
            .into());
        }
        Ok(())
    }

    fn weight(&self, channel: Channel, statistic: &Statistic) -> f64 {
        let channel_weight = match channel {
            Channel::Concentration => self.concentration_weight,
            Channel::DlRatio => self.dl_weight,
        };
        match self.weighting {
            Weighting::Uniform => channel_weight,
            Weighting::InverseVariance {
                concentration_std_floor,
                dl_std_floor,
            } => {
                let floor = match channel {
                    Channel::Concentration => concentration_std_floor,
                    Channel::DlRatio => dl_std_floor,
                };
                let variance = statistic
                    .variance_of_mean()
                    .map_or(floor * floor, |v| v.max(floor * floor));
                channel_weight / variance
            }
        }
    }
}

/// Weighted difference between a simulated and an observed value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Residual {
    /// Condition of the observation.
    pub condition: Condition,
    /// Observed amino acid.
    pub amino_acid: AminoAcid,
    /// Observed fraction.
    pub fraction: Fraction,
    /// Observed quantity.
    pub channel: Channel,
    /// Observed mean.
    pub observed: f64,
    /// Simulated value.
    pub simulated: f64,
    /// Weight of the squared residual.
    pub weight: f64,
}

impl Residual {
    /// Simulated minus observed value.
    pub fn value(&self) -> f64 {
        self.simulated - self.observed
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Term {
    condition: Condition,
    time_index: usize,
    fraction: Fraction,
    channel: Channel,
    observed: f64,
    weight: f64,
}

#[derive(Debug, Clone, PartialEq)]
struct Series {
    amino_acid: AminoAcid,
    indices: [usize; 5],
    origin: f64,
    initial: InitialState,
    times: Vec<f64>,
    terms: Vec<Term>,
}

#[derive(Debug, Clone, PartialEq)]
struct EnvironmentGroup {
    environment: Environment,
    series: Vec<Series>,
}

/// Mean of weighted squared residuals between simulated trajectories and an [ObservationTable].
///
/// Observations are grouped by [Environment]. Within an environment each amino acid is simulated
/// from the earliest time it was observed at, seeded from that observation. An initial state
/// override moves the origin to the start of heating, `t = 0`.
#[derive(Debug, Clone, PartialEq)]
pub struct LossFunction {
    simulator: Simulator,
    config: LossConfig,
    groups: Vec<EnvironmentGroup>,
    term_count: usize,
}

impl LossFunction {
    /// Builds the residual terms of all observations of the modelled amino acids.
    pub fn new(
        simulator: Simulator,
        observations: &ObservationTable,
        config: LossConfig,
        initial_states: &BTreeMap<AminoAcid, InitialState>,
    ) -> Result<Self> {
        config.validate()?;
        let mut groups = vec![];
        for environment in observations.environments() {
            let mut series = vec![];
            for &aa in simulator.model().amino_acids() {
                let observed: Vec<&AminoAcidObservation> = observations
                    .iter()
                    .filter(|o| o.amino_acid == aa && o.condition.environment() == environment)
                    .collect();
                if let Some(first) = observed.first() {
                    let (origin, initial) = match initial_states.get(&aa) {
                        Some(state) => (0., *state),
                        None => (first.condition.time(), InitialState::from_observation(first)?),
                    };
                    series.push(build_series(
                        &simulator, &config, aa, origin, initial, &observed,
                    )?);
                }
            }
            if !series.is_empty() {
                groups.push(EnvironmentGroup {
                    environment,
                    series,
                });
            }
        }
        let term_count = groups
            .iter()
            .flat_map(|g| &g.series)
            .map(|s| s.terms.len())
            .sum();
        if term_count == 0 {
            return Err(DataQualityError::NoObservations.into());
        }
        debug!(
            environments = groups.len(),
            terms = term_count,
            "Built loss function."
        );
        Ok(Self {
            simulator,
            config,
            groups,
            term_count,
        })
    }

    /// Underlying simulator.
    pub fn simulator(&self) -> &Simulator {
        &self.simulator
    }

    /// Loss configuration.
    pub fn config(&self) -> &LossConfig {
        &self.config
    }

    /// Number of residual terms.
    pub fn term_count(&self) -> usize {
        self.term_count
    }

    /// Observed environments in order.
    pub fn environments(&self) -> Vec<Environment> {
        self.groups.iter().map(|g| g.environment).collect()
    }

    /// Simulation origin in hours and initial state of an amino acid within an environment.
    pub fn initial_state(
        &self,
        environment: &Environment,
        amino_acid: AminoAcid,
    ) -> Option<(f64, InitialState)> {
        self.series()
            .find(|(g, s)| g.environment == *environment && s.amino_acid == amino_acid)
            .map(|(_, s)| (s.origin, s.initial))
    }

    /// Loss at physical parameter values.
    pub fn evaluate(&self, parameters: &ParameterVector) -> Result<f64> {
        let values = self.simulator.model().physical_values(parameters)?;
        let partial = self
            .groups
            .par_iter()
            .map(|g| {
                g.series
                    .iter()
                    .map(|s| self.series_loss(g, s, &s.indices.map(|i| values[i])))
                    .sum::<Result<f64>>()
            })
            .collect::<Result<Vec<f64>>>()?;
        Ok(partial.iter().sum::<f64>() / self.term_count as f64)
    }

    /// Residuals at physical parameter values, ordered by environment, amino acid and time.
    pub fn residuals(&self, parameters: &ParameterVector) -> Result<Vec<Residual>> {
        let values = self.simulator.model().physical_values(parameters)?;
        let nested = self
            .series()
            .collect::<Vec<_>>()
            .par_iter()
            .map(|(g, s)| {
                let states = self.simulator.integrate(
                    &s.indices.map(|i| values[i]),
                    s.amino_acid,
                    &g.environment,
                    &s.initial,
                    &s.times,
                )?;
                Ok(s.terms
                    .iter()
                    .map(|term| Residual {
                        condition: term.condition,
                        amino_acid: s.amino_acid,
                        fraction: term.fraction,
                        channel: term.channel,
                        observed: term.observed,
                        simulated: simulated(&states[term.time_index], term.fraction, term.channel),
                        weight: term.weight,
                    })
                    .collect::<Vec<Residual>>())
            })
            .collect::<Result<Vec<Vec<Residual>>>>()?;
        Ok(nested.into_iter().flatten().collect())
    }

    /// Simulated trajectories at the observed times of every environment and amino acid.
    pub fn observed_trajectories(&self, parameters: &ParameterVector) -> Result<Vec<Trajectory>> {
        self.series()
            .collect::<Vec<_>>()
            .par_iter()
            .map(|(g, s)| {
                self.simulator
                    .simulate(parameters, s.amino_acid, &g.environment, &s.initial, &s.times)
                    .map(|t| t.shifted(s.origin))
            })
            .collect()
    }

    /// Simulated trajectories of every environment and amino acid at the given heating times.
    /// Times before the simulation origin of a trajectory are left out.
    pub fn trajectories(
        &self,
        parameters: &ParameterVector,
        times: &[f64],
    ) -> Result<Vec<Trajectory>> {
        self.series()
            .collect::<Vec<_>>()
            .par_iter()
            .map(|(g, s)| {
                let relative: Vec<f64> = times
                    .iter()
                    .filter(|t| **t >= s.origin)
                    .map(|t| t - s.origin)
                    .collect();
                self.simulator
                    .simulate(parameters, s.amino_acid, &g.environment, &s.initial, &relative)
                    .map(|t| t.shifted(s.origin))
            })
            .collect()
    }

    fn series(&self) -> impl Iterator<Item = (&EnvironmentGroup, &Series)> {
        self.groups
            .iter()
            .flat_map(|g| g.series.iter().map(move |s| (g, s)))
    }

    fn series_loss<D: DualNum<f64> + Copy>(
        &self,
        group: &EnvironmentGroup,
        series: &Series,
        values: &[D; 5],
    ) -> Result<D> {
        let states = self.simulator.integrate(
            values,
            series.amino_acid,
            &group.environment,
            &series.initial,
            &series.times,
        )?;
        let mut sum = D::from(0.);
        for term in &series.terms {
            let r = simulated(&states[term.time_index], term.fraction, term.channel)
                - D::from(term.observed);
            sum = sum + r * r * term.weight;
        }
        Ok(sum)
    }

    /// Exact gradient at optimizer coordinates, one dual direction per coordinate. A direction
    /// only integrates the amino acids depending on its coordinate.
    fn gradient(&self, x: &DVector<f64>) -> Result<DVector<f64>> {
        let layout = self.simulator.model().layout();
        let grad = (0..x.len())
            .into_par_iter()
            .map(|j| {
                let mut sum = 0.;
                for (g, s) in self.series() {
                    if !s.indices.contains(&j) {
                        continue;
                    }
                    let values = s.indices.map(|i| {
                        let eps = if i == j { 1. } else { 0. };
                        layout[i].from_coordinate(Dual64::new(x[i], eps))
                    });
                    sum += self.series_loss(g, s, &values)?.eps;
                }
                Ok(sum / self.term_count as f64)
            })
            .collect::<Result<Vec<f64>>>()?;
        Ok(DVector::from_vec(grad))
    }
}

impl Objective for LossFunction {
    fn dimension(&self) -> usize {
        self.simulator.model().layout().len()
    }

    fn bounds(&self) -> (DVector<f64>, DVector<f64>) {
        self.simulator.model().coordinate_bounds()
    }

    fn val(&self, x: &DVector<f64>) -> Result<f64> {
        let parameters = self.simulator.model().from_coordinates(x)?;
        self.evaluate(&parameters)
    }

    fn val_grad(&self, x: &DVector<f64>) -> Result<(f64, DVector<f64>)> {
        let val = self.val(x)?;
        let grad = self.gradient(x)?;
        Ok((val, grad))
    }
}

fn build_series(
    simulator: &Simulator,
    config: &LossConfig,
    amino_acid: AminoAcid,
    origin: f64,
    initial: InitialState,
    observed: &[&AminoAcidObservation],
) -> Result<Series> {
    let indices = simulator
        .model()
        .parameter_indices(amino_acid)
        .ok_or_else(|| ConfigurationError::UnknownAminoAcid(amino_acid.to_string()))?;
    let mut times: Vec<f64> = vec![];
    let mut terms = vec![];
    for observation in observed {
        let time = observation.condition.time() - origin;
        if times.last() != Some(&time) {
            times.push(time);
        }
        let time_index = times.len() - 1;
        for &fraction in &config.fractions {
            for channel in Channel::ALL {
                let statistic = match channel {
                    Channel::Concentration => observation.concentration(fraction),
                    Channel::DlRatio => observation.dl_ratio(fraction),
                };
                if let Some(statistic) = statistic {
                    terms.push(Term {
                        condition: observation.condition,
                        time_index,
                        fraction,
                        channel,
                        observed: statistic.mean,
                        weight: config.weight(channel, statistic),
                    });
                }
            }
        }
    }
    Ok(Series {
        amino_acid,
        indices,
        origin,
        initial,
        times,
        terms,
    })
}

// the D/L ratio of an empty pool counts as zero
fn simulated<D: DualNum<f64> + Copy>(
    state: &PoolState<D>,
    fraction: Fraction,
    channel: Channel,
) -> D {
    match channel {
        Channel::Concentration => state.concentration(fraction),
        Channel::DlRatio => state.dl_ratio(fraction).unwrap_or(D::from(0.)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Error, FractionStats, IntegratorOptions, KineticModel};

    fn stats(value: f64) -> Statistic {
        Statistic {
            mean: value,
            std: None,
            count: 1,
        }
    }

    fn observation(
        condition: Condition,
        amino_acid: AminoAcid,
        state: &PoolState<f64>,
    ) -> AminoAcidObservation {
        let fraction = |f| {
            Some(FractionStats {
                concentration: stats(state.concentration(f)),
                dl_ratio: state.dl_ratio(f).map(stats),
            })
        };
        AminoAcidObservation {
            condition,
            amino_acid,
            free: fraction(Fraction::Free),
            total: fraction(Fraction::Total),
            bound: fraction(Fraction::Bound),
        }
    }

    fn simulator() -> Result<Simulator> {
        let model = KineticModel::new(vec![AminoAcid::Asx, AminoAcid::Ala])?;
        Simulator::new(model).with_options(IntegratorOptions {
            rtol: 1e-12,
            atol: 1e-14,
            ..IntegratorOptions::default()
        })
    }

    fn truth(sim: &Simulator) -> Result<ParameterVector> {
        sim.model()
            .parameters(vec![2e-2, 90., 8e-3, 2e-3, 110., 3e-3, 6e-4, 125.])
    }

    // pristine samples heated at two temperatures
    fn synthetic(sim: &Simulator, parameters: &ParameterVector) -> Result<ObservationTable> {
        let mut table = ObservationTable::new();
        let times = [0., 24., 72., 168.];
        for temperature in [60., 80.] {
            let env = Environment::new(temperature, 7.)?;
            for aa in sim.model().amino_acids() {
                let traj =
                    sim.simulate(parameters, *aa, &env, &InitialState::pristine(10.), &times)?;
                for sample in traj.samples() {
                    let condition = Condition::from_environment(env, sample.time)?;
                    table.insert(observation(condition, *aa, &sample.state));
                }
            }
        }
        Ok(table)
    }

    fn pristine() -> BTreeMap<AminoAcid, InitialState> {
        [AminoAcid::Asx, AminoAcid::Ala]
            .into_iter()
            .map(|aa| (aa, InitialState::pristine(10.)))
            .collect()
    }

    #[test]
    fn zero_loss_at_truth() -> Result<()> {
        let sim = simulator()?;
        let truth = truth(&sim)?;
        let observations = synthetic(&sim, &truth)?;
        let loss = LossFunction::new(sim, &observations, LossConfig::default(), &pristine())?;
        // no free D/L at the origin: 2 environments x 2 amino acids x (3 + 3 x 4) terms
        assert_eq!(loss.term_count(), 2 * 2 * (3 + 3 * 4));
        assert!(loss.evaluate(&truth)? < 1e-20);
        Ok(())
    }

    #[test]
    fn loss_increases_off_truth() -> Result<()> {
        let sim = simulator()?;
        let truth = truth(&sim)?;
        let observations = synthetic(&sim, &truth)?;
        let loss = LossFunction::new(sim, &observations, LossConfig::default(), &pristine())?;
        let off = truth
            .clone()
            .with_value(crate::ParameterKind::HydrolysisRate, 3e-2)?;
        assert!(loss.evaluate(&off)? > 1e-4);
        Ok(())
    }

    #[test]
    fn gradient_matches_finite_differences() -> Result<()> {
        let sim = simulator()?;
        let truth = truth(&sim)?;
        let observations = synthetic(&sim, &truth)?;
        let model = sim.model().clone();
        let loss = LossFunction::new(sim, &observations, LossConfig::default(), &pristine())?;
        let x = model.to_coordinates(&model.default_parameters())?;
        let (_, grad) = loss.val_grad(&x)?;
        let h = 1e-4;
        for j in 0..x.len() {
            let mut plus = x.clone();
            let mut minus = x.clone();
            plus[j] += h;
            minus[j] -= h;
            let fd = (loss.val(&plus)? - loss.val(&minus)?) / (2. * h);
            assert!(
                (grad[j] - fd).abs() <= 1e-5 + 1e-4 * fd.abs(),
                "coordinate {j}: {} vs {fd}",
                grad[j]
            );
        }
        Ok(())
    }

    #[test]
    fn objective_consistency() -> Result<()> {
        let sim = simulator()?;
        let truth = truth(&sim)?;
        let observations = synthetic(&sim, &truth)?;
        let model = sim.model().clone();
        let loss = LossFunction::new(sim, &observations, LossConfig::default(), &pristine())?;
        let x = model.to_coordinates(&model.default_parameters())?;
        assert_objective_consistency!(loss, &x);
        assert_eq!(loss.dimension(), 8);
        Ok(())
    }

    #[test]
    fn origin_seeded_from_earliest_observation() -> Result<()> {
        let sim = simulator()?;
        let truth = truth(&sim)?;
        let observations = synthetic(&sim, &truth)?;
        let loss = LossFunction::new(sim, &observations, LossConfig::default(), &BTreeMap::new())?;
        let env = Environment::new(60., 7.)?;
        let (origin, initial) = loss
            .initial_state(&env, AminoAcid::Ala)
            .ok_or(DataQualityError::NoObservations)?;
        assert_eq!(origin, 0.);
        assert_eq!(initial, InitialState::new(10., 0., 0., 0.)?);
        Ok(())
    }

    #[test]
    fn missing_initial_total() -> Result<()> {
        let sim = simulator()?;
        let condition = Condition::new(60., 7., 24.)?;
        let mut table = ObservationTable::new();
        table.insert(AminoAcidObservation {
            condition,
            amino_acid: AminoAcid::Ala,
            free: Some(FractionStats {
                concentration: stats(1.),
                dl_ratio: Some(stats(0.1)),
            }),
            total: None,
            bound: None,
        });
        assert_eq!(
            LossFunction::new(sim, &table, LossConfig::default(), &BTreeMap::new()),
            Err(Error::DataQuality(DataQualityError::MissingInitialState {
                amino_acid: AminoAcid::Ala,
                environment: condition.environment(),
            }))
        );
        Ok(())
    }

    #[test]
    fn empty_observations() -> Result<()> {
        let sim = simulator()?;
        assert_eq!(
            LossFunction::new(
                sim,
                &ObservationTable::new(),
                LossConfig::default(),
                &BTreeMap::new()
            ),
            Err(Error::DataQuality(DataQualityError::NoObservations))
        );
        Ok(())
    }

    #[test]
    fn inverse_variance_weights() -> Result<()> {
        let config = LossConfig {
            weighting: Weighting::InverseVariance {
                concentration_std_floor: 0.1,
                dl_std_floor: 0.01,
            },
            fractions: vec![Fraction::Total],
            ..LossConfig::default()
        };
        let precise = Statistic {
            mean: 10.,
            std: Some(0.4),
            count: 4,
        };
        assert!((config.weight(Channel::Concentration, &precise) - 25.).abs() < 1e-9);
        assert!((config.weight(Channel::Concentration, &stats(10.)) - 100.).abs() < 1e-9);
        assert!((config.weight(Channel::DlRatio, &stats(0.1)) - 1e4).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn residuals_and_trajectories() -> Result<()> {
        let sim = simulator()?;
        let truth = truth(&sim)?;
        let observations = synthetic(&sim, &truth)?;
        let config = LossConfig {
            fractions: vec![Fraction::Bound],
            ..LossConfig::default()
        };
        let loss = LossFunction::new(sim, &observations, config, &pristine())?;
        let residuals = loss.residuals(&truth)?;
        assert_eq!(residuals.len(), loss.term_count());
        assert!(residuals.iter().all(|r| r.value().abs() < 1e-12));
        assert!(residuals.iter().all(|r| r.fraction == Fraction::Bound));

        let observed = loss.observed_trajectories(&truth)?;
        assert_eq!(observed.len(), 4);
        assert_eq!(observed[0].times(), vec![0., 24., 72., 168.]);

        let dense = loss.trajectories(&truth, &[0., 12., 400.])?;
        assert_eq!(dense[3].times(), vec![0., 12., 400.]);
        assert_eq!(dense[3].environment(), Environment::new(80., 7.)?);
        assert_eq!(dense[3].amino_acid(), AminoAcid::Ala);
        Ok(())
    }

    #[test]
    fn invalid_loss_config() -> Result<()> {
        let config = LossConfig {
            dl_weight: -1.,
            ..LossConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(Error::Configuration(ConfigurationError::InvalidOption {
                option: "dl_weight",
                value: -1.,
                requirement: ">= 0"
            }))
        );
        Ok(())
    }
}
