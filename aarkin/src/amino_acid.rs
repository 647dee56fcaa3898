use crate::{ConfigurationError, Error, Result};
use serde::{Deserialize, Serialize};
use std::{fmt::Display, str::FromStr};

/// Amino acids resolved by the chiral chromatography of a sample.
///
/// Asx and Glx are the combined signals of Asp/Asn and Glu/Gln, since acid hydrolysis converts the
/// amides into their acids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AminoAcid {
    /// Aspartic acid and asparagine.
    Asx,
    /// Glutamic acid and glutamine.
    Glx,
    /// Serine.
    Ser,
    /// Alanine.
    Ala,
    /// Valine.
    Val,
    /// Phenylalanine.
    Phe,
    /// Isoleucine (measured as A/I, D-alloisoleucine over L-isoleucine).
    Ile,
}

impl AminoAcid {
    /// All amino acids in their reporting order.
    pub const ALL: [AminoAcid; 7] = [
        AminoAcid::Asx,
        AminoAcid::Glx,
        AminoAcid::Ser,
        AminoAcid::Ala,
        AminoAcid::Val,
        AminoAcid::Phe,
        AminoAcid::Ile,
    ];

    /// Returns the three letter symbol.
    pub fn symbol(&self) -> &'static str {
        match self {
            AminoAcid::Asx => "Asx",
            AminoAcid::Glx => "Glx",
            AminoAcid::Ser => "Ser",
            AminoAcid::Ala => "Ala",
            AminoAcid::Val => "Val",
            AminoAcid::Phe => "Phe",
            AminoAcid::Ile => "Ile",
        }
    }
}

impl Display for AminoAcid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.symbol())
    }
}

impl FromStr for AminoAcid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        AminoAcid::ALL
            .into_iter()
            .find(|aa| aa.symbol().eq_ignore_ascii_case(s))
            .ok_or_else(|| ConfigurationError::UnknownAminoAcid(s.to_string()).into())
    }
}

/// Checks that a list of amino acids is non-empty and free of duplicates.
pub(crate) fn validate_amino_acids(amino_acids: &[AminoAcid]) -> Result<()> {
    if amino_acids.is_empty() {
        return Err(ConfigurationError::EmptyAminoAcids.into());
    }
    for (idx, aa) in amino_acids.iter().enumerate() {
        if amino_acids[..idx].contains(aa) {
            return Err(ConfigurationError::DuplicateAminoAcid(*aa).into());
        }
    }
    Ok(())
}

/// Hydrolysate a replicate was measured in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SampleType {
    /// Free amino acids, measured without hydrolysis.
    #[serde(rename = "FAA", alias = "faa")]
    Faa,
    /// Total hydrolysable amino acids, measured after acid hydrolysis.
    #[serde(rename = "THAA", alias = "thaa")]
    Thaa,
}

impl SampleType {
    /// Returns the amino acid fraction the sample type measures.
    pub fn fraction(&self) -> Fraction {
        match self {
            SampleType::Faa => Fraction::Free,
            SampleType::Thaa => Fraction::Total,
        }
    }
}

impl Display for SampleType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SampleType::Faa => f.pad("FAA"),
            SampleType::Thaa => f.pad("THAA"),
        }
    }
}

/// Pool of an amino acid within a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Fraction {
    /// Free amino acids (FAA).
    Free,
    /// Free and peptide-bound amino acids (THAA).
    Total,
    /// Peptide-bound amino acids, THAA - FAA.
    Bound,
}

impl Display for Fraction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Fraction::Free => f.pad("free"),
            Fraction::Total => f.pad("total"),
            Fraction::Bound => f.pad("bound"),
        }
    }
}
