use aarkin::{
    AminoAcid, Condition, ConvergenceCriterion, Environment, Error, FitConfig, Fraction,
    InitialState, IntegratorOptions, KineticFit, KineticModel, MeasurementTable, OptimizerConfig,
    ParameterVector, Result, SampleRow, SampleType, Simulator, Termination,
};
use rand::{Rng, SeedableRng, rngs::StdRng};

const TIMES: [f64; 4] = [0., 12., 36., 72.];
const TEMPERATURES: [f64; 2] = [50., 70.];
const REPLICATES: usize = 3;
const EQ_EPS: f64 = 1e-9;

fn model() -> Result<KineticModel> {
    KineticModel::new(vec![AminoAcid::Asx, AminoAcid::Ala])
}

fn truth(model: &KineticModel) -> Result<ParameterVector> {
    model.parameters(vec![2e-2, 90., 8e-3, 2e-3, 110., 3e-3, 6e-4, 125.])
}

// replicate FAA and THAA rows of pristine samples, relative noise of `noise` on every cell
fn measurements(parameters: &ParameterVector, noise: f64, seed: u64) -> Result<MeasurementTable> {
    let mut rng = StdRng::seed_from_u64(seed);
    let simulator = Simulator::new(model()?).with_options(IntegratorOptions {
        rtol: 1e-10,
        atol: 1e-12,
        ..IntegratorOptions::default()
    })?;
    let mut table = MeasurementTable::new();
    for temperature in TEMPERATURES {
        let env = Environment::new(temperature, 7.)?;
        let trajectories = simulator.simulate_all(
            parameters,
            &env,
            &[
                (AminoAcid::Asx, InitialState::pristine(10.)),
                (AminoAcid::Ala, InitialState::pristine(10.)),
            ],
            &TIMES,
        )?;
        for (i, &time) in TIMES.iter().enumerate() {
            let condition = Condition::from_environment(env, time)?;
            for sample_type in [SampleType::Faa, SampleType::Thaa] {
                for _ in 0..REPLICATES {
                    let mut row = SampleRow::new(sample_type, condition);
                    for trajectory in &trajectories {
                        let state = trajectory.samples()[i].state;
                        let fraction = sample_type.fraction();
                        // the free pool of unheated samples is empty
                        let Some(dl) = state.dl_ratio(fraction) else {
                            continue;
                        };
                        let mut perturb = |v: f64| v * (1. + noise * rng.random_range(-1.0..1.0));
                        let conc = perturb(state.concentration(fraction));
                        let dl = perturb(dl).clamp(0., 1.);
                        row = row.with_reading(trajectory.amino_acid(), conc, dl)?;
                    }
                    table.push(row);
                }
            }
        }
    }
    Ok(table)
}

fn perturbed(parameters: &ParameterVector, factor: f64) -> Result<ParameterVector> {
    parameters.iter().try_fold(parameters.clone(), |p, (kind, value)| {
        let value = if kind.is_rate() { value * factor } else { value };
        p.with_value(kind, value)
    })
}

fn fit(
    table: &MeasurementTable,
    seed: &ParameterVector,
    max_iterations: usize,
) -> Result<KineticFit> {
    let config = FitConfig {
        amino_acids: vec![AminoAcid::Asx, AminoAcid::Ala],
        ..FitConfig::default()
    };
    let observations = config.observations(table)?;
    Ok(KineticFit::from_config(&config, observations)?
        .with_initial_state(AminoAcid::Asx, InitialState::pristine(10.))
        .with_initial_state(AminoAcid::Ala, InitialState::pristine(10.))
        .with_optimizer_config(OptimizerConfig {
            initial_parameters: Some(seed.values().iter().copied().collect()),
            max_iterations,
            ..OptimizerConfig::default()
        })?)
}

#[test]
fn test_fit_decreases_loss() -> Result<()> {
    let truth = truth(&model()?)?;
    let table = measurements(&truth, 0., 0)?;
    let seed = perturbed(&truth, 1.5)?;
    let result = fit(&table, &seed, 30)?.solve()?;

    assert!(!matches!(result.termination, Termination::Failed(_)));
    assert_eq!(result.loss_history.len(), result.iterations);
    assert!(result.loss < result.loss_history[0]);
    assert!(result.loss_history.windows(2).all(|w| w[1] <= w[0]));
    assert_eq!(
        result.loss,
        result
            .loss_history
            .iter()
            .copied()
            .fold(f64::INFINITY, f64::min)
    );
    Ok(())
}

#[test]
fn test_fit_at_truth_converges() -> Result<()> {
    let truth = truth(&model()?)?;
    let table = measurements(&truth, 0., 0)?;
    let result = fit(&table, &truth, 100)?.solve()?;

    assert!(result.loss < 1e-8);
    assert!(matches!(
        result.termination,
        Termination::Converged(ConvergenceCriterion::GradientNorm)
            | Termination::Converged(ConvergenceCriterion::LossPlateau)
    ));
    Ok(())
}

#[test]
fn test_fit_is_deterministic() -> Result<()> {
    let truth = truth(&model()?)?;
    let table = measurements(&truth, 0.02, 7)?;
    let seed = perturbed(&truth, 0.8)?;
    let fit = fit(&table, &seed, 5)?;
    assert_eq!(fit.solve()?, fit.solve()?);
    Ok(())
}

#[test]
fn test_fit_single_iteration() -> Result<()> {
    let truth = truth(&model()?)?;
    let table = measurements(&truth, 0.02, 11)?;
    let seed = perturbed(&truth, 2.)?;
    let result = fit(&table, &seed, 1)?.solve()?;

    assert_eq!(result.termination, Termination::MaxIterations);
    assert_eq!(result.iterations, 1);
    assert_eq!(result.loss_history.len(), 1);
    for ((_, fitted), (_, seeded)) in result.parameters.iter().zip(seed.iter()) {
        assert!((fitted - seeded).abs() <= EQ_EPS * seeded);
    }
    Ok(())
}

#[test]
fn test_fit_trajectories_and_residuals() -> Result<()> {
    let truth = truth(&model()?)?;
    let table = measurements(&truth, 0., 0)?;
    let fit = fit(&table, &truth, 1)?;

    let trajectories = fit.trajectories(&truth, &[0., 24., 48., 96.])?;
    assert_eq!(trajectories.len(), TEMPERATURES.len() * 2);
    for trajectory in &trajectories {
        assert_eq!(trajectory.times(), vec![0., 24., 48., 96.]);
        let dl: Vec<f64> = trajectory
            .series(Fraction::Total)
            .iter()
            .map(|p| p.dl_ratio.unwrap_or(0.))
            .collect();
        assert!(dl.windows(2).all(|w| w[1] > w[0]));
    }

    let residuals = fit.residuals(&truth)?;
    assert!(!residuals.is_empty());
    assert!(residuals.iter().all(|r| r.value().abs() < 1e-6));
    Ok(())
}

#[test]
fn test_fit_rejects_unknown_seed_length() -> Result<()> {
    let truth = truth(&model()?)?;
    let table = measurements(&truth, 0., 0)?;
    let fit = fit(&table, &truth, 10)?.with_optimizer_config(OptimizerConfig {
        initial_parameters: Some(vec![1e-2; 3]),
        ..OptimizerConfig::default()
    })?;
    assert!(matches!(fit.solve(), Err(Error::Configuration(_))));
    Ok(())
}
