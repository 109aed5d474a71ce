//! vmtest - drive one automated test run inside a virtual machine
//!
//! Starts the backend, the command server and the test runner, mediates
//! between them until the tests are done and exits with the run's status.

use std::path::PathBuf;

use clap::Parser;
use vmtest::common::{logging, parse_override};
use vmtest::Options;

#[derive(Parser)]
#[command(name = "vmtest", about = "Run automated tests inside a virtual machine")]
#[command(version, long_about = None)]
struct Cli {
    /// Configuration file (default: platform config dir)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Working directory holding vars.json and the pid file
    #[arg(long, value_name = "DIR", default_value = ".")]
    workdir: PathBuf,

    /// Also write logs to this file
    #[arg(long, value_name = "FILE")]
    log_file: Option<PathBuf>,

    /// Test variables as KEY=VALUE
    #[arg(value_name = "KEY=VALUE", value_parser = parse_var)]
    vars: Vec<(String, String)>,
}

fn parse_var(arg: &str) -> Result<(String, String), String> {
    parse_override(arg).ok_or_else(|| format!("expected KEY=VALUE, got '{arg}'"))
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();
    logging::init(cli.log_file.as_deref());

    let code = vmtest::execute(Options {
        config: cli.config,
        workdir: cli.workdir,
        overrides: cli.vars,
    })
    .await;

    std::process::exit(code);
}
