use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use toml::Value;

use crate::forest::MergeForest;
use crate::gamma::Gamma;
use crate::matrix::data::MatrixData;

/// The simulated accelerator, selected by the config's `arch` key.
pub enum Arch {
    Gamma(Gamma),
    Forest(MergeForest),
}

pub struct Simulator {
    arch: Arch,
    out_path: Option<PathBuf>,
}

impl Simulator {
    pub fn new(config: &Value, mat: &MatrixData, out_path: Option<PathBuf>) -> Result<Self> {
        let arch_str = config
            .get("arch")
            .and_then(Value::as_str)
            .context("config is missing the \"arch\" key")?;
        let arch = match arch_str {
            "gamma" => Arch::Gamma(Gamma::new(config, mat)?),
            "my_arch" => Arch::Forest(MergeForest::new(config, mat)?),
            other => bail!("architecture \"{other}\" not implemented"),
        };
        Ok(Simulator { arch, out_path })
    }

    pub fn from_file(config_file: &Path, mat: &MatrixData, out_path: Option<PathBuf>) -> Result<Self> {
        let text = std::fs::read_to_string(config_file)
            .with_context(|| format!("unable to read config file {}", config_file.display()))?;
        let config: Value = text
            .parse()
            .with_context(|| format!("malformed config file {}", config_file.display()))?;
        Simulator::new(&config, mat, out_path)
    }

    /// Run the cycle loop to completion. Returns whether the result check
    /// passed (always true when values are not computed).
    pub fn run_simulation(&mut self, mat: &mut MatrixData) -> Result<bool> {
        let mut out: Box<dyn Write> = match &self.out_path {
            Some(path) => Box::new(BufWriter::new(File::create(path).with_context(|| {
                format!("unable to open file \"{}\" for writing", path.display())
            })?)),
            None => Box::new(std::io::stdout()),
        };
        match &mut self.arch {
            Arch::Gamma(gamma) => gamma.run_simulation(mat, &mut out),
            Arch::Forest(forest) => forest.run_simulation(mat, &mut out),
        }
    }

    pub fn arch(&self) -> &Arch {
        &self.arch
    }
}
