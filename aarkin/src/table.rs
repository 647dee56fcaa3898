use crate::{AminoAcid, Condition, DataQualityError, Error, Result, SampleType};
use serde::Deserialize;
use std::{collections::BTreeMap, io::Read, path::Path};
use tracing::debug;

/// Concentration and D/L ratio of one amino acid in one replicate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    /// Concentration, non-negative.
    pub concentration: f64,
    /// D/L ratio within [0, 1].
    pub dl_ratio: f64,
}

impl Reading {
    /// Creates a validated reading of the given amino acid.
    pub fn new(amino_acid: AminoAcid, concentration: f64, dl_ratio: f64) -> Result<Self> {
        if !concentration.is_finite() || concentration < 0. {
            return Err(DataQualityError::InvalidReading {
                amino_acid,
                field: "concentration",
                value: concentration,
            }
            .into());
        }
        if !dl_ratio.is_finite() || !(0. ..=1.).contains(&dl_ratio) {
            return Err(DataQualityError::InvalidReading {
                amino_acid,
                field: "dl_ratio",
                value: dl_ratio,
            }
            .into());
        }
        Ok(Self {
            concentration,
            dl_ratio,
        })
    }
}

/// One replicate measurement of a hydrolysate under a condition.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleRow {
    /// Measured hydrolysate.
    pub sample_type: SampleType,
    /// Experimental condition.
    pub condition: Condition,
    /// Readings of the amino acids present in the replicate.
    pub readings: BTreeMap<AminoAcid, Reading>,
}

impl SampleRow {
    /// Creates a replicate without readings.
    pub fn new(sample_type: SampleType, condition: Condition) -> Self {
        Self {
            sample_type,
            condition,
            readings: BTreeMap::new(),
        }
    }

    /// Returns the replicate with an additional validated reading.
    pub fn with_reading(
        mut self,
        amino_acid: AminoAcid,
        concentration: f64,
        dl_ratio: f64,
    ) -> Result<Self> {
        let reading = Reading::new(amino_acid, concentration, dl_ratio)?;
        self.readings.insert(amino_acid, reading);
        Ok(self)
    }

    /// Returns the reading of an amino acid, if measured.
    pub fn reading(&self, amino_acid: AminoAcid) -> Option<&Reading> {
        self.readings.get(&amino_acid)
    }
}

/// Cleaned table of replicate measurements.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MeasurementTable {
    rows: Vec<SampleRow>,
}

/// Wide csv record with a concentration and a D/L column per amino acid.
#[derive(Debug, Deserialize)]
struct CsvRecord {
    sample_type: SampleType,
    temperature: f64,
    time: f64,
    ph: f64,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    asx: Option<f64>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    asx_dl: Option<f64>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    glx: Option<f64>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    glx_dl: Option<f64>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    ser: Option<f64>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    ser_dl: Option<f64>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    ala: Option<f64>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    ala_dl: Option<f64>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    val: Option<f64>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    val_dl: Option<f64>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    phe: Option<f64>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    phe_dl: Option<f64>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    ile: Option<f64>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    ile_dl: Option<f64>,
}

impl CsvRecord {
    fn cells(&self, amino_acid: AminoAcid) -> (Option<f64>, Option<f64>) {
        match amino_acid {
            AminoAcid::Asx => (self.asx, self.asx_dl),
            AminoAcid::Glx => (self.glx, self.glx_dl),
            AminoAcid::Ser => (self.ser, self.ser_dl),
            AminoAcid::Ala => (self.ala, self.ala_dl),
            AminoAcid::Val => (self.val, self.val_dl),
            AminoAcid::Phe => (self.phe, self.phe_dl),
            AminoAcid::Ile => (self.ile, self.ile_dl),
        }
    }

    fn into_row(self) -> Result<SampleRow> {
        let condition = Condition::new(self.temperature, self.ph, self.time)?;
        let mut row = SampleRow::new(self.sample_type, condition);
        for aa in AminoAcid::ALL {
            // an amino acid is only usable with both of its cells
            if let (Some(concentration), Some(dl_ratio)) = self.cells(aa) {
                row = row.with_reading(aa, concentration, dl_ratio)?;
            }
        }
        Ok(row)
    }
}

impl MeasurementTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a table from replicate rows.
    pub fn from_rows(rows: Vec<SampleRow>) -> Self {
        Self { rows }
    }

    /// Adds a replicate row.
    pub fn push(&mut self, row: SampleRow) {
        self.rows.push(row)
    }

    /// Replicate rows in insertion order.
    pub fn rows(&self) -> &[SampleRow] {
        &self.rows
    }

    /// Number of replicate rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns true if the table holds no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Reads a wide csv table.
    ///
    /// Expected header columns are `sample_type` (`FAA`/`THAA`), `temperature` (°C), `time`
    /// (hours), `ph` and per amino acid `<aa>` and `<aa>_dl` in lower case, e.g. `ala` and
    /// `ala_dl`. Amino acid columns may be absent; empty or non-numeric cells count as missing.
    /// Rows with an invalid condition or reading fail with the line they start on.
    pub fn from_csv_reader<R: Read>(reader: R) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(reader);
        let headers = reader.headers().map_err(csv_error)?.clone();
        let mut record = csv::StringRecord::new();
        let mut rows = vec![];
        while reader.read_record(&mut record).map_err(csv_error)? {
            let line = record.position().map(|p| p.line());
            let row = record
                .deserialize::<CsvRecord>(Some(&headers))
                .map_err(csv_error)
                .and_then(CsvRecord::into_row)
                .map_err(|e| match e {
                    Error::Table { message, .. } => Error::Table { line, message },
                    e => Error::Table {
                        line,
                        message: e.to_string(),
                    },
                })?;
            rows.push(row);
        }
        debug!(rows = rows.len(), "Read measurement table.");
        Ok(Self { rows })
    }

    /// Reads a wide csv table from a file, see [MeasurementTable::from_csv_reader].
    pub fn from_csv_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = std::fs::File::open(path.as_ref()).map_err(|e| Error::Table {
            line: None,
            message: format!("{}: {e}", path.as_ref().display()),
        })?;
        Self::from_csv_reader(file)
    }
}

fn csv_error(e: csv::Error) -> Error {
    Error::Table {
        line: e.position().map(|p| p.line()),
        message: e.to_string(),
    }
}

impl FromIterator<SampleRow> for MeasurementTable {
    fn from_iter<T: IntoIterator<Item = SampleRow>>(iter: T) -> Self {
        Self {
            rows: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const CSV: &str = "\
sample_type,temperature,time,ph,ala,ala_dl,val,val_dl
FAA,50,24,8,10.0,0.05,3.0,0.02
THAA,50,24,8,15.0,0.03,,0.01
THAA, 50 , 48 , 8 ,14.8,0.04,n.a.,n.a.
";

    #[test]
    fn read_csv() -> Result<()> {
        let table = MeasurementTable::from_csv_reader(CSV.as_bytes())?;
        assert_eq!(table.len(), 3);
        let first = &table.rows()[0];
        assert_eq!(first.sample_type, SampleType::Faa);
        assert_eq!(first.condition, Condition::new(50., 8., 24.)?);
        assert_eq!(
            first.reading(AminoAcid::Ala),
            Some(&Reading {
                concentration: 10.,
                dl_ratio: 0.05
            })
        );
        assert!(first.reading(AminoAcid::Val).is_some());
        // missing concentration cell drops valine from the replicate
        assert!(table.rows()[1].reading(AminoAcid::Val).is_none());
        assert!(table.rows()[2].reading(AminoAcid::Val).is_none());
        assert_eq!(table.rows()[2].condition.time(), 48.);
        Ok(())
    }

    #[test]
    fn read_csv_path() -> Result<()> {
        let mut file = tempfile::NamedTempFile::new().map_err(|e| Error::Table {
            line: None,
            message: e.to_string(),
        })?;
        file.write_all(CSV.as_bytes()).map_err(|e| Error::Table {
            line: None,
            message: e.to_string(),
        })?;
        let table = MeasurementTable::from_csv_path(file.path())?;
        assert_eq!(table.len(), 3);
        Ok(())
    }

    #[test]
    fn read_csv_invalid_sample_type() {
        let csv = "sample_type,temperature,time,ph,ala,ala_dl\nXAA,50,24,8,1.0,0.1\n";
        let table = MeasurementTable::from_csv_reader(csv.as_bytes());
        assert!(matches!(table, Err(Error::Table { .. })));
    }

    #[test]
    fn read_csv_invalid_reading() {
        let csv = "sample_type,temperature,time,ph,ala,ala_dl\nFAA,50,24,8,1.0,0.1\nFAA,50,24,8,-1.0,0.1\n";
        let table = MeasurementTable::from_csv_reader(csv.as_bytes());
        let reading = Error::from(DataQualityError::InvalidReading {
            amino_acid: AminoAcid::Ala,
            field: "concentration",
            value: -1.,
        });
        assert_eq!(
            table,
            Err(Error::Table {
                line: Some(3),
                message: reading.to_string(),
            })
        );
    }

    #[test]
    fn read_csv_invalid_condition_line() {
        let csv = "sample_type,temperature,time,ph,ala,ala_dl\nFAA,50,24,8,1.0,0.1\nTHAA,50,24,8,2.0,0.1\nTHAA,50,-3,8,2.0,0.1\n";
        let table = MeasurementTable::from_csv_reader(csv.as_bytes());
        assert!(matches!(table, Err(Error::Table { line: Some(4), .. })));

        let csv = "sample_type,temperature,time,ph,ala,ala_dl\nFAA,50,24,15,1.0,0.1\n";
        let table = MeasurementTable::from_csv_reader(csv.as_bytes());
        assert!(matches!(table, Err(Error::Table { line: Some(2), .. })));
    }

    #[test]
    fn reading_dl_range() {
        assert_eq!(
            Reading::new(AminoAcid::Asx, 1., 1.2),
            Err(DataQualityError::InvalidReading {
                amino_acid: AminoAcid::Asx,
                field: "dl_ratio",
                value: 1.2,
            }
            .into())
        );
    }
}
