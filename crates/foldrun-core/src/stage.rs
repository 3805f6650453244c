//! Pipeline stages and engine programs.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Stages of one reconstruction, in execution order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Build the unfolded chain from the sequence.
    Protein,

    /// Compile the restraints into the key file.
    Constraints,

    /// Embed and refine the requested number of models.
    Structures,

    /// Convert models and pick the best one.
    Selection,
}

impl Stage {
    pub const ALL: [Stage; 4] = [
        Stage::Protein,
        Stage::Constraints,
        Stage::Structures,
        Stage::Selection,
    ];

    /// Get the stage name as a string.
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Protein => "protein",
            Stage::Constraints => "constraints",
            Stage::Structures => "structures",
            Stage::Selection => "selection",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Programs of the embedding engine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EngineProgram {
    /// Unfolded-chain builder, reads its input on stdin.
    Protein,

    /// Distance-geometry embedding.
    Distgeom,

    /// Coordinates to PDB.
    Xyzpdb,

    /// PDB to coordinates.
    Pdbxyz,

    /// Energy minimization.
    Minimize,

    /// Energy analysis.
    Analyze,
}

impl EngineProgram {
    /// Executable name inside the engine binary directory.
    pub fn binary_name(&self) -> &'static str {
        match self {
            EngineProgram::Protein => "protein",
            EngineProgram::Distgeom => "distgeom",
            EngineProgram::Xyzpdb => "xyzpdb",
            EngineProgram::Pdbxyz => "pdbxyz",
            EngineProgram::Minimize => "minimize",
            EngineProgram::Analyze => "analyze",
        }
    }

    pub fn path_in(&self, bin_dir: &Path) -> PathBuf {
        bin_dir.join(self.binary_name())
    }
}

impl fmt::Display for EngineProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.binary_name())
    }
}
