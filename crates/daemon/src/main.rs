mod cli;

use clap::{Parser, Subcommand};
use cli::args::Args;
use cli::op::{Op, OpContext};
use cli::{Init, Run, Scan, Status, Version};

command_enum! {
    (Init, Init),
    (Run, Run),
    (Scan, Scan),
    (Status, Status),
    (Version, Version),
}

#[tokio::main]
async fn main() {
    let Args {
        config_path,
        command,
    } = Args::parse();
    let ctx = OpContext::new(config_path);
    let name = command.name().to_lowercase();

    let code = match command.execute(&ctx).await {
        Ok(output) => {
            println!("{}", output);
            0
        }
        Err(e) => {
            eprintln!("Error: {} failed: {}", name, e);
            1
        }
    };
    std::process::exit(code);
}
