use clap::Parser;
use sita_cli::Cli;
use sita_terminal::{init_tracing, run_cli};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(error) = init_tracing(&cli.data_dir, cli.log_stderr) {
        eprintln!("warning: {error:#}");
    }
    let code = match run_cli(cli).await {
        Ok(code) => code,
        Err(error) => {
            tracing::error!(error = %format!("{error:#}"), "sita exited with an error");
            eprintln!("error: {error:#}");
            1
        }
    };
    std::process::exit(code);
}
