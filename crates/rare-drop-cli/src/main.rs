use std::process::ExitCode;

use clap::Parser;

fn main() -> ExitCode {
    rare_drop_cli::init_tracing();
    let cli = rare_drop_cli::Cli::parse();
    match rare_drop_cli::run_cli(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{}", rare_drop_cli::error_envelope(&err));
            ExitCode::FAILURE
        }
    }
}
