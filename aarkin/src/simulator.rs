use crate::{
    AminoAcid, ConfigurationError, Environment, Error, Fraction, Implausibility, InitialState,
    IntegrationError, KineticModel, ParameterVector, PoolState, Result,
};
use num_dual::DualNum;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::trace;

// Dormand-Prince 5(4) tableau
const A21: f64 = 1. / 5.;
const A31: f64 = 3. / 40.;
const A32: f64 = 9. / 40.;
const A41: f64 = 44. / 45.;
const A42: f64 = -56. / 15.;
const A43: f64 = 32. / 9.;
const A51: f64 = 19372. / 6561.;
const A52: f64 = -25360. / 2187.;
const A53: f64 = 64448. / 6561.;
const A54: f64 = -212. / 729.;
const A61: f64 = 9017. / 3168.;
const A62: f64 = -355. / 33.;
const A63: f64 = 46732. / 5247.;
const A64: f64 = 49. / 176.;
const A65: f64 = -5103. / 18656.;
const B1: f64 = 35. / 384.;
const B3: f64 = 500. / 1113.;
const B4: f64 = 125. / 192.;
const B5: f64 = -2187. / 6784.;
const B6: f64 = 11. / 84.;
const E1: f64 = B1 - 5179. / 57600.;
const E3: f64 = B3 - 7571. / 16695.;
const E4: f64 = B4 - 393. / 640.;
const E5: f64 = B5 - -92097. / 339200.;
const E6: f64 = B6 - 187. / 2100.;
const E7: f64 = -1. / 40.;

const SAFETY: f64 = 0.9;
const MIN_FACTOR: f64 = 0.2;
const MAX_FACTOR: f64 = 5.;

/// Configuration of the adaptive integrator of [Simulator].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IntegratorOptions {
    /// Relative tolerance of the local error.
    pub rtol: f64,
    /// Absolute tolerance of the local error, also the slack of the non-negativity check.
    pub atol: f64,
    /// First trial step in hours.
    pub initial_step: f64,
    /// Smallest step the error control may request.
    pub min_step: f64,
    /// Largest step in hours.
    pub max_step: f64,
    /// Budget of step attempts per simulation.
    pub max_steps: usize,
    /// Relative tolerance of the mass balance and equilibrium ratio checks.
    pub mass_balance_tolerance: f64,
}

impl Default for IntegratorOptions {
    fn default() -> Self {
        Self {
            rtol: 1e-8,
            atol: 1e-10,
            initial_step: 0.1,
            min_step: 1e-12,
            max_step: 1e3,
            max_steps: 100_000,
            mass_balance_tolerance: 1e-6,
        }
    }
}

impl IntegratorOptions {
    /// Validates the options.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("rtol", self.rtol),
            ("atol", self.atol),
            ("initial_step", self.initial_step),
            ("min_step", self.min_step),
            ("max_step", self.max_step),
            ("mass_balance_tolerance", self.mass_balance_tolerance),
        ];
        for (option, value) in positive {
            if !value.is_finite() || value <= 0. {
                return Err(ConfigurationError::InvalidOption {
                    option,
                    value,
                    requirement: "> 0",
                }
                .into());
            }
        }
        if self.min_step > self.max_step {
            return Err(ConfigurationError::InvalidOption {
                option: "min_step",
                value: self.min_step,
                requirement: "<= max_step",
            }
            .into());
        }
        if self.max_steps == 0 {
            return Err(ConfigurationError::InvalidOption {
                option: "max_steps",
                value: 0.,
                requirement: "> 0",
            }
            .into());
        }
        Ok(())
    }
}

/// Pool state of an amino acid at one output time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrajectorySample {
    /// Hours since the simulation origin.
    pub time: f64,
    /// Enantiomer pools.
    pub state: PoolState<f64>,
}

/// Concentration and D/L ratio of a fraction at one output time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrajectoryPoint {
    /// Hours since the simulation origin.
    pub time: f64,
    /// Concentration of the fraction.
    pub concentration: f64,
    /// D/L ratio, none while the fraction holds no L enantiomer.
    pub dl_ratio: Option<f64>,
}

/// Simulated pools of one amino acid in one environment.
#[derive(Debug, Clone, PartialEq)]
pub struct Trajectory {
    amino_acid: AminoAcid,
    environment: Environment,
    samples: Vec<TrajectorySample>,
}

impl Trajectory {
    /// Simulated amino acid.
    pub fn amino_acid(&self) -> AminoAcid {
        self.amino_acid
    }

    /// Environment of the simulation.
    pub fn environment(&self) -> Environment {
        self.environment
    }

    /// Samples in order of the requested times.
    pub fn samples(&self) -> &[TrajectorySample] {
        &self.samples
    }

    /// Number of samples.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Returns true if no time was requested.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Output times.
    pub fn times(&self) -> Vec<f64> {
        self.samples.iter().map(|s| s.time).collect()
    }

    pub(crate) fn shifted(mut self, origin: f64) -> Self {
        self.samples.iter_mut().for_each(|s| s.time += origin);
        self
    }

    /// Concentration and D/L series of a fraction.
    pub fn series(&self, fraction: Fraction) -> Vec<TrajectoryPoint> {
        self.samples
            .iter()
            .map(|s| TrajectoryPoint {
                time: s.time,
                concentration: s.state.concentration(fraction),
                dl_ratio: s.state.dl_ratio(fraction),
            })
            .collect()
    }
}

/// Integrates the [KineticModel] with an adaptive Dormand-Prince 5(4) scheme.
///
/// Every run starts at the origin `t = 0` and steps exactly onto each requested time. The step
/// size control only looks at real parts, thus dual valued runs take the same steps as their
/// real valued counterpart.
#[derive(Debug, Clone, PartialEq)]
pub struct Simulator {
    model: KineticModel,
    options: IntegratorOptions,
}

impl Simulator {
    /// Creates a simulator with default [IntegratorOptions].
    pub fn new(model: KineticModel) -> Self {
        Self {
            model,
            options: IntegratorOptions::default(),
        }
    }

    /// Returns the simulator with the given integrator options.
    pub fn with_options(mut self, options: IntegratorOptions) -> Result<Self> {
        options.validate()?;
        self.options = options;
        Ok(self)
    }

    /// Simulated model.
    pub fn model(&self) -> &KineticModel {
        &self.model
    }

    /// Integrator options.
    pub fn options(&self) -> &IntegratorOptions {
        &self.options
    }

    /// Simulates one amino acid at the requested times, which have to be finite, non-negative
    /// and non-decreasing.
    pub fn simulate(
        &self,
        parameters: &ParameterVector,
        amino_acid: AminoAcid,
        environment: &Environment,
        initial: &InitialState,
        times: &[f64],
    ) -> Result<Trajectory> {
        let values = self.model.physical_values(parameters)?;
        let indices = self
            .model
            .parameter_indices(amino_acid)
            .ok_or_else(|| {
                ConfigurationError::UnknownParameter(format!("k_rac_bound[{amino_acid}]"))
            })?;
        let local = indices.map(|i| values[i]);
        let states = self.integrate(&local, amino_acid, environment, initial, times)?;
        Ok(Trajectory {
            amino_acid,
            environment: *environment,
            samples: times
                .iter()
                .zip(states)
                .map(|(&time, state)| TrajectorySample { time, state })
                .collect(),
        })
    }

    /// Simulates several decoupled amino acids in parallel, results keep the input order.
    pub fn simulate_all(
        &self,
        parameters: &ParameterVector,
        environment: &Environment,
        initial: &[(AminoAcid, InitialState)],
        times: &[f64],
    ) -> Result<Vec<Trajectory>> {
        initial
            .par_iter()
            .map(|(aa, state)| self.simulate(parameters, *aa, environment, state, times))
            .collect()
    }

    /// Integrates the pools of an amino acid from the five parameters it depends on, see
    /// [KineticModel::parameter_indices].
    pub(crate) fn integrate<D: DualNum<f64> + Copy>(
        &self,
        values: &[D; 5],
        amino_acid: AminoAcid,
        environment: &Environment,
        initial: &InitialState,
        times: &[f64],
    ) -> Result<Vec<PoolState<D>>> {
        validate_times(times)?;
        let rates = self.model.rate_constants(values, environment);
        let f = |y: &[D; 4]| rates.derivative(&PoolState::from_array(*y)).to_array();
        let opts = &self.options;

        let y0: PoolState<D> = initial.state();
        let mass = y0.total().re();
        let ratio_limit = self.ratio_limit(initial);

        let mut y = y0.to_array();
        let mut t = 0.;
        let mut h = opts.initial_step.min(opts.max_step);
        let mut k1 = f(&y);
        let mut attempts = 0;
        let mut accepted = 0;
        let mut out = Vec::with_capacity(times.len());

        for &target in times {
            while t < target {
                if attempts >= opts.max_steps {
                    return Err(IntegrationError::StepLimit {
                        amino_acid,
                        time: t,
                        max_steps: opts.max_steps,
                    }
                    .into());
                }
                attempts += 1;
                let remaining = target - t;
                let step = h.min(remaining);

                let k2 = f(&stage(&y, step, &[(A21, &k1)]));
                let k3 = f(&stage(&y, step, &[(A31, &k1), (A32, &k2)]));
                let k4 = f(&stage(&y, step, &[(A41, &k1), (A42, &k2), (A43, &k3)]));
                let k5 = f(&stage(
                    &y,
                    step,
                    &[(A51, &k1), (A52, &k2), (A53, &k3), (A54, &k4)],
                ));
                let k6 = f(&stage(
                    &y,
                    step,
                    &[(A61, &k1), (A62, &k2), (A63, &k3), (A64, &k4), (A65, &k5)],
                ));
                let y_new = stage(
                    &y,
                    step,
                    &[(B1, &k1), (B3, &k3), (B4, &k4), (B5, &k5), (B6, &k6)],
                );
                if y_new.iter().any(|v| !v.re().is_finite()) {
                    return Err(IntegrationError::NonFinite {
                        amino_acid,
                        time: t + step,
                    }
                    .into());
                }
                let k7 = f(&y_new);

                let mut err = 0.;
                for i in 0..4 {
                    let e = step
                        * (E1 * k1[i].re()
                            + E3 * k3[i].re()
                            + E4 * k4[i].re()
                            + E5 * k5[i].re()
                            + E6 * k6[i].re()
                            + E7 * k7[i].re());
                    let scale = opts.atol + opts.rtol * y[i].re().abs().max(y_new[i].re().abs());
                    err += (e / scale).powi(2);
                }
                let err = (err / 4.).sqrt();
                let factor = if err > 0. {
                    (SAFETY * err.powf(-0.2)).clamp(MIN_FACTOR, MAX_FACTOR)
                } else {
                    MAX_FACTOR
                };

                if err <= 1. {
                    accepted += 1;
                    t = if step == remaining { target } else { t + step };
                    y = y_new;
                    k1 = k7;
                    self.check_state(&y, amino_acid, environment, t, mass, ratio_limit)?;
                    // a step clipped onto an output time does not shrink the next one
                    if step == h || factor < 1. {
                        h = (step * factor).min(opts.max_step);
                    }
                } else {
                    h = step * factor;
                    if h < opts.min_step {
                        return Err(IntegrationError::StepSizeUnderflow {
                            amino_acid,
                            time: t,
                            step: h,
                        }
                        .into());
                    }
                }
            }
            out.push(PoolState::from_array(y));
        }
        trace!(%amino_acid, %environment, attempts, accepted, "Integrated pools.");
        Ok(out)
    }

    fn ratio_limit(&self, initial: &InitialState) -> f64 {
        self.model
            .config()
            .racemization
            .ratio_limit()
            .max(initial.bound_dl)
            .max(initial.free_dl)
    }

    fn check_state<D: DualNum<f64> + Copy>(
        &self,
        y: &[D; 4],
        amino_acid: AminoAcid,
        environment: &Environment,
        time: f64,
        mass: f64,
        ratio_limit: f64,
    ) -> Result<()> {
        let opts = &self.options;
        let lowest = y.iter().map(|v| v.re()).fold(f64::INFINITY, f64::min);
        if lowest < -opts.atol {
            return Err(IntegrationError::NegativeConcentration {
                amino_acid,
                time,
                value: lowest,
            }
            .into());
        }
        let state = PoolState::from_array(*y);
        let found = state.total().re();
        if (found - mass).abs() > opts.mass_balance_tolerance * mass.max(opts.atol) {
            return Err(Error::Implausible {
                amino_acid,
                environment: *environment,
                reason: Implausibility::MassBalance {
                    initial: mass,
                    found,
                },
            });
        }
        for fraction in [Fraction::Bound, Fraction::Free] {
            let (d, l) = state.enantiomers(fraction);
            let (d, l) = (d.re(), l.re());
            // ratios of nearly empty pools are dominated by the local error
            if l <= opts.atol * 1e3 {
                continue;
            }
            let ratio = d / l;
            if ratio > ratio_limit * (1. + opts.mass_balance_tolerance) + opts.rtol {
                return Err(Error::Implausible {
                    amino_acid,
                    environment: *environment,
                    reason: Implausibility::RatioOvershoot {
                        equilibrium: ratio_limit,
                        found: ratio,
                    },
                });
            }
        }
        Ok(())
    }
}

fn stage<D: DualNum<f64> + Copy>(y: &[D; 4], h: f64, terms: &[(f64, &[D; 4])]) -> [D; 4] {
    let mut out = *y;
    for (c, k) in terms {
        for i in 0..4 {
            out[i] = out[i] + k[i] * (h * c);
        }
    }
    out
}

fn validate_times(times: &[f64]) -> Result<()> {
    if times.iter().any(|t| !t.is_finite() || *t < 0.) {
        return Err(ConfigurationError::InvalidTimes {
            reason: "times must be finite and non-negative",
        }
        .into());
    }
    if times.windows(2).any(|w| w[1] < w[0]) {
        return Err(ConfigurationError::InvalidTimes {
            reason: "times must be non-decreasing",
        }
        .into());
    }
    Ok(())
}
