use clap::Parser;
use csvquery::cli::{run, Cli};

fn main() -> std::process::ExitCode {
    run(Cli::parse())
}
