use clap::Parser;
use ptysup_cli::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    setup_tracing();
    let cli = Cli::parse();
    let exit_code = ptysup_cli::run(cli).await?;
    std::process::exit(exit_code);
}

fn setup_tracing() {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    // Stdout carries the child's terminal output.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .try_init();
}
