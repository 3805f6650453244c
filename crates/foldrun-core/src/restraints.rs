//! Restraint input and key-file compilation
//!
//! A `RestraintSpec` carries restraints already expressed in engine atom
//! numbers. Mapping contacts or angles to atoms is the caller's business; the
//! pipeline only hands the restraint set to a `RestraintCompiler`, which writes the
//! engine key file.

use std::fmt::Write as _;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_DISTANCE_FORCE: f64 = 100.0;
pub const DEFAULT_TORSION_FORCE: f64 = 1.0;

/// One-letter codes accepted in a sequence.
const RESIDUE_CODES: &str = "ACDEFGHIKLMNPQRSTVWY";

#[derive(Error, Debug)]
pub enum RestraintError {
    #[error("empty sequence")]
    EmptySequence,

    #[error("unknown residue '{residue}' at position {position}")]
    UnknownResidue { residue: char, position: usize },

    #[error("restraint {index}: {reason}")]
    InvalidRestraint { index: usize, reason: String },

    #[error("{0} not supported by this compiler")]
    Unsupported(&'static str),

    #[error("could not write key file: {0}")]
    Io(#[from] std::io::Error),
}

/// Distance restraint between two atoms (Angstrom).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistanceRestraint {
    pub atom_i: usize,
    pub atom_j: usize,
    pub lower: f64,
    pub upper: f64,
    /// Overrides the restraint set's distance force constant.
    #[serde(default)]
    pub force: Option<f64>,
}

/// Torsion restraint over four atoms (degrees).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TorsionRestraint {
    pub atoms: [usize; 4],
    pub lower: f64,
    pub upper: f64,
    #[serde(default)]
    pub force: Option<f64>,
}

fn default_distance_force() -> f64 {
    DEFAULT_DISTANCE_FORCE
}

fn default_torsion_force() -> f64 {
    DEFAULT_TORSION_FORCE
}

/// Input of one reconstruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestraintSpec {
    /// One-letter residue sequence.
    pub sequence: String,

    #[serde(default)]
    pub distances: Vec<DistanceRestraint>,

    #[serde(default)]
    pub torsions: Vec<TorsionRestraint>,

    #[serde(default = "default_distance_force")]
    pub distance_force: f64,

    #[serde(default = "default_torsion_force")]
    pub torsion_force: f64,

    /// Force peptide bonds to trans.
    #[serde(default)]
    pub trans_omega: bool,

    /// Phi/psi consensus data, interpreted only by custom compilers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phi_psi_consensus: Option<serde_json::Value>,
}

impl RestraintSpec {
    pub fn new(sequence: impl Into<String>) -> Self {
        Self {
            sequence: sequence.into(),
            distances: Vec::new(),
            torsions: Vec::new(),
            distance_force: DEFAULT_DISTANCE_FORCE,
            torsion_force: DEFAULT_TORSION_FORCE,
            trans_omega: false,
            phi_psi_consensus: None,
        }
    }

    pub fn with_distance(mut self, atom_i: usize, atom_j: usize, lower: f64, upper: f64) -> Self {
        self.distances.push(DistanceRestraint {
            atom_i,
            atom_j,
            lower,
            upper,
            force: None,
        });
        self
    }

    pub fn with_torsion(mut self, atoms: [usize; 4], lower: f64, upper: f64) -> Self {
        self.torsions.push(TorsionRestraint {
            atoms,
            lower,
            upper,
            force: None,
        });
        self
    }

    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    pub fn validate(&self) -> Result<(), RestraintError> {
        if self.sequence.is_empty() {
            return Err(RestraintError::EmptySequence);
        }
        for (position, residue) in self.sequence.chars().enumerate() {
            if !RESIDUE_CODES.contains(residue) {
                return Err(RestraintError::UnknownResidue {
                    residue,
                    position: position + 1,
                });
            }
        }
        for (index, r) in self.distances.iter().enumerate() {
            if r.atom_i == 0 || r.atom_j == 0 || r.atom_i == r.atom_j {
                return Err(RestraintError::InvalidRestraint {
                    index,
                    reason: format!("bad atom pair {}-{}", r.atom_i, r.atom_j),
                });
            }
            if r.lower > r.upper {
                return Err(RestraintError::InvalidRestraint {
                    index,
                    reason: format!("lower bound {} above upper bound {}", r.lower, r.upper),
                });
            }
        }
        Ok(())
    }

    /// Residue names fed to the chain builder: three-letter for cysteine,
    /// one-letter otherwise.
    pub fn chain_residues(&self) -> Vec<String> {
        self.sequence
            .chars()
            .map(|c| match c {
                'C' => "CYS".to_string(),
                other => other.to_string(),
            })
            .collect()
    }
}

/// Writes the engine key file for a restraint set.
pub trait RestraintCompiler: Send + Sync {
    fn compile(
        &self,
        spec: &RestraintSpec,
        forcefield: &Path,
        key_file: &Path,
    ) -> Result<(), RestraintError>;
}

/// Default compiler: one `RESTRAIN-DISTANCE` / `RESTRAIN-TORSION` line per
/// restraint after the `PARAMETERS` directive.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyFileCompiler;

impl KeyFileCompiler {
    pub fn render(&self, spec: &RestraintSpec, forcefield: &Path) -> Result<String, RestraintError> {
        spec.validate()?;
        if spec.trans_omega {
            return Err(RestraintError::Unsupported("trans omega restraints"));
        }
        if spec.phi_psi_consensus.is_some() {
            return Err(RestraintError::Unsupported("phi/psi consensus restraints"));
        }

        let mut out = String::new();
        // writes into a String cannot fail
        let _ = writeln!(out, "PARAMETERS {}", forcefield.display());
        for r in &spec.distances {
            let _ = writeln!(
                out,
                "RESTRAIN-DISTANCE {} {} {:5.1} {:2.1} {:2.1}",
                r.atom_i,
                r.atom_j,
                r.force.unwrap_or(spec.distance_force),
                r.lower,
                r.upper
            );
        }
        for r in &spec.torsions {
            let [a, b, c, d] = r.atoms;
            let _ = writeln!(
                out,
                "RESTRAIN-TORSION {} {} {} {} {:5.1} {:.1} {:.1}",
                a,
                b,
                c,
                d,
                r.force.unwrap_or(spec.torsion_force),
                r.lower,
                r.upper
            );
        }
        Ok(out)
    }
}

impl RestraintCompiler for KeyFileCompiler {
    fn compile(
        &self,
        spec: &RestraintSpec,
        forcefield: &Path,
        key_file: &Path,
    ) -> Result<(), RestraintError> {
        let text = self.render(spec, forcefield)?;
        std::fs::write(key_file, text)?;
        Ok(())
    }
}
