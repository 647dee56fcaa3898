use aarkin::{
    AminoAcid, Environment, Error, Fraction, InitialState, KineticModel, ModelConfig,
    Racemization, Result, Simulator,
};

// pristine protein heated at several temperatures, reversible and irreversible racemization.
// Irreversible runs stop once a D/L ratio passes 1.
fn main() -> Result<()> {
    let times: Vec<f64> = (0..=10).map(|i| 24. * i as f64).collect();

    for racemization in [
        Racemization::default(),
        Racemization::Irreversible,
    ] {
        let model = KineticModel::new(vec![AminoAcid::Asx, AminoAcid::Val])?.with_config(
            ModelConfig {
                racemization,
                ..ModelConfig::default()
            },
        )?;
        let parameters = model.default_parameters();
        let simulator = Simulator::new(model);
        println!("{racemization:?}\n{parameters}");

        for temperature in [60., 80., 100.] {
            let env = Environment::new(temperature, 7.)?;
            let trajectories = match simulator.simulate_all(
                &parameters,
                &env,
                &[
                    (AminoAcid::Asx, InitialState::pristine(10.)),
                    (AminoAcid::Val, InitialState::pristine(10.)),
                ],
                &times,
            ) {
                Ok(trajectories) => trajectories,
                Err(err @ Error::Implausible { .. }) => {
                    println!("{env}: {err}\n");
                    continue;
                }
                Err(err) => return Err(err),
            };
            for trajectory in trajectories {
                println!("{} {}", trajectory.amino_acid(), trajectory.environment());
                println!("{:>8} {:>10} {:>10} {:>10}", "time", "free", "D/L free", "D/L total");
                let free = trajectory.series(Fraction::Free);
                let total = trajectory.series(Fraction::Total);
                for (f, t) in free.iter().zip(&total) {
                    println!(
                        "{:>8.1} {:>10.4} {:>10.4} {:>10.4}",
                        f.time,
                        f.concentration,
                        f.dl_ratio.unwrap_or(0.),
                        t.dl_ratio.unwrap_or(0.)
                    );
                }
                println!();
            }
        }
    }

    Ok(())
}
