mod cli;
mod runner;
mod synthetic;

use clap::Parser;

fn main() {
    if let Err(err) = run() {
        eprintln!("{err:?}");
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();
    match cli.command {
        cli::Command::Run(args) => runner::run(args),
        cli::Command::Guide => {
            cli::print_guide();
            Ok(())
        }
    }
}
