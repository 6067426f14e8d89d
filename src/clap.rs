//! Integration with `clap`

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::debug;

/// Returns the current version of the crate with extra info if supplied
///
/// Set the environment variable `MATRIXON_VERSION_EXTRA` to any UTF-8 string to
/// include it in parenthesis after the SemVer version. A common value are git
/// commit hashes.
pub fn version() -> String {
    let cargo_pkg_version = env!("CARGO_PKG_VERSION");

    match option_env!("MATRIXON_VERSION_EXTRA") {
        Some(x) => format!("{} ({})", cargo_pkg_version, x),
        None => cargo_pkg_version.to_owned(),
    }
}

/// Matrixon Timeline - replay and inspect room timelines
#[derive(Parser, Debug, Clone, PartialEq, Eq)]
#[clap(about, version, name = "matrixon-timeline")]
pub struct Args {
    /// Path to configuration file
    #[clap(short, long, env = "MATRIXON_TIMELINE_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Log filter override, e.g. `debug` or `matrixon_timeline=trace`
    #[clap(short, long, global = true)]
    pub log_level: Option<String>,

    /// Print every diff as it is produced
    #[clap(short, long, global = true)]
    pub verbose: bool,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Replay a JSON script of server responses and print the resulting timelines
    Replay {
        /// Script with `syncs`, `pages` and `contexts`
        script: PathBuf,

        /// Backward pages to request per room after the syncs
        #[clap(long, default_value_t = 0)]
        paginate: u32,
    },

    /// Load and validate the configuration, then print it
    CheckConfig,
}

/// Parse command line arguments into structured data
pub fn parse() -> Args {
    let args = Args::parse();
    debug!(command = ?args.command, "Parsed command line arguments");
    args
}
