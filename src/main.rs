use clap::Parser;
use regresql::cmd::{self, Cli};

fn main() {
    let cli = Cli::parse();

    if let Err(e) = cmd::run(cli) {
        eprintln!("error: {e:#}");
        // Operational failure: connection, tooling, or I/O. Assertion
        // failures exit 1 from inside the command; clap owns exit 2.
        std::process::exit(3);
    }
}
