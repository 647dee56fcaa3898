use aarkin::{
    AminoAcid, Condition, DistributionCalculator, Environment, InitialState, KineticFit,
    KineticModel, MeasurementTable, OptimizerConfig, ParameterVector, Result, SampleRow,
    SampleType, Simulator,
};
use tracing_subscriber::{EnvFilter, fmt};

const TIMES: [f64; 5] = [0., 24., 72., 168., 336.];
const TEMPERATURES: [f64; 3] = [50., 65., 80.];

// noise free heating series of pristine samples
fn synthetic(model: &KineticModel, truth: &ParameterVector) -> Result<MeasurementTable> {
    let simulator = Simulator::new(model.clone());
    let initial: Vec<(AminoAcid, InitialState)> = model
        .amino_acids()
        .iter()
        .map(|aa| (*aa, InitialState::pristine(10.)))
        .collect();
    let mut table = MeasurementTable::new();
    for temperature in TEMPERATURES {
        let env = Environment::new(temperature, 7.)?;
        let trajectories = simulator.simulate_all(truth, &env, &initial, &TIMES)?;
        for (i, &time) in TIMES.iter().enumerate() {
            let condition = Condition::from_environment(env, time)?;
            for sample_type in [SampleType::Faa, SampleType::Thaa] {
                let mut row = SampleRow::new(sample_type, condition);
                for trajectory in &trajectories {
                    let state = trajectory.samples()[i].state;
                    let fraction = sample_type.fraction();
                    if let Some(dl) = state.dl_ratio(fraction) {
                        row = row.with_reading(
                            trajectory.amino_acid(),
                            state.concentration(fraction),
                            dl.min(1.),
                        )?;
                    }
                }
                table.push(row);
            }
        }
    }
    Ok(table)
}

fn main() -> Result<()> {
    fmt().with_env_filter(EnvFilter::new("info")).init();

    let model = KineticModel::new(vec![AminoAcid::Asx, AminoAcid::Ala])?;
    let truth = model.parameters(vec![2e-3, 95., 6e-3, 1.5e-3, 112., 2.5e-3, 5e-4, 120.])?;
    let table = synthetic(&model, &truth)?;
    let observations = DistributionCalculator::new()
        .with_amino_acids(model.amino_acids().to_vec())?
        .compute(&table)?;

    // start from the heuristic defaults
    let fit = KineticFit::new(model, observations)
        .with_initial_state(AminoAcid::Asx, InitialState::pristine(10.))
        .with_initial_state(AminoAcid::Ala, InitialState::pristine(10.))
        .with_optimizer_config(OptimizerConfig {
            learning_rate: 0.2,
            max_iterations: 300,
            ..OptimizerConfig::default()
        })?;
    let result = fit.solve()?;
    println!("{result}\n");

    println!("{:<16}{:>12}{:>12}", "parameter", "true", "fitted");
    for ((kind, t), (_, v)) in truth.iter().zip(result.parameters.iter()) {
        println!("{kind:<16}{t:>12.4e}{v:>12.4e}");
    }

    Ok(())
}
