use std::path::PathBuf;

use clap::Parser;
use powerbev::config::ConfigArgs;

#[derive(Parser, Debug)]
#[command(about = "Train a PowerBEV model")]
pub struct Cli {
    /// YAML config layered over the built-in defaults.
    #[arg(long, value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    /// `KEY VALUE` overrides applied last, e.g. `EPOCHS 5 OPTIMIZER.LR 1e-3`.
    #[arg(num_args = 0.., trailing_var_arg = true, allow_hyphen_values = true)]
    pub opts: Vec<String>,
}

impl Cli {
    pub fn config_args(&self) -> ConfigArgs {
        ConfigArgs {
            config_file: self.config_file.clone(),
            opts: self.opts.clone(),
        }
    }
}
