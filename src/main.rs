use std::process::ExitCode;

use anyhow::Context as _;
use clap::Parser as _;

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(err) = try_main().await {
        eprintln!("{err:#}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

async fn try_main() -> anyhow::Result<()> {
    lecturegen::logging::init().context("init logging")?;

    let cli = lecturegen::cli::Cli::parse();
    tracing::debug!(?cli, "parsed cli");

    match cli.command {
        lecturegen::cli::Command::Parse(args) => {
            lecturegen::commands::parse(args).context("parse")?;
        }
        lecturegen::cli::Command::Section(args) => {
            lecturegen::commands::section(args)
                .await
                .context("section")?;
        }
        lecturegen::cli::Command::Course(args) => {
            lecturegen::commands::course(args).await.context("course")?;
        }
    }

    Ok(())
}
