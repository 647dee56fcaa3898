use aarkin::{
    AminoAcid, BoundVariance, DistributionCalculator, Fraction, MeasurementTable, Result,
};

const DATA: &str = include_str!("../../data/heating_series.csv");

// FAA and THAA replicates aggregated per condition, bound fraction by difference
fn main() -> Result<()> {
    let table = MeasurementTable::from_csv_reader(DATA.as_bytes())?;
    println!("Replicate rows: {}\n", table.len());

    let observations = DistributionCalculator::new()
        .with_amino_acids(vec![AminoAcid::Asx, AminoAcid::Ala])?
        .with_bound_variance(BoundVariance::Propagated)
        .compute(&table)?;
    println!("{observations}\n");

    // D/L ratio of every fraction, undefined for the empty free pool of unheated samples
    for observation in observations.iter() {
        let ratios: Vec<String> = [Fraction::Free, Fraction::Bound, Fraction::Total]
            .iter()
            .map(|f| match observation.dl_ratio(*f) {
                Some(dl) => format!("{f} {dl}"),
                None => format!("{f} n.a."),
            })
            .collect();
        println!(
            "{} {}: {}",
            observation.condition,
            observation.amino_acid,
            ratios.join(", ")
        );
    }

    Ok(())
}
