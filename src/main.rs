use anyhow::{Context, Result};
use clap::Parser;
use tracing::subscriber::set_global_default as set_global_subscriber;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::time::SystemTime;
use tracing_subscriber::FmtSubscriber;

use scanhive::{cli::Commands, config, engine, metrics::Metrics, render, Cli};

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = match cli.verbosity {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_timer(SystemTime)
        .finish();
    set_global_subscriber(subscriber).context("failed to set tracing subscriber")?;

    match cli.command {
        Commands::Init(args) => {
            config::write_starter_config(&args.output, args.force)
                .await
                .with_context(|| format!("failed to write {}", args.output.display()))?;
            println!("wrote starter config to {}", args.output.display());
        }
        Commands::Run(args) => {
            let mut run_config = config::load_config(&args.config)
                .await
                .with_context(|| format!("failed to load {}", args.config.display()))?;
            if let Some(format) = args.format {
                run_config.report_config.format = format.into();
            }

            let report = engine::run(
                &run_config.checktype_urls,
                &run_config.targets,
                run_config.agent_config,
            )
            .await
            .context("scan run failed")?;

            let mut metrics = Metrics::new();
            metrics.record_planned(report.len() as u64);
            metrics.record_report(&report);
            if let Some(path) = &run_config.metrics_file {
                metrics
                    .write_file(path)
                    .await
                    .with_context(|| format!("failed to write metrics to {}", path.display()))?;
            }

            let (text, exit_code) = render::render(&report, &run_config.report_config);
            match &run_config.report_config.output {
                Some(path) => tokio::fs::write(path, &text)
                    .await
                    .with_context(|| format!("failed to write report to {}", path.display()))?,
                None => println!("{text}"),
            }
            std::process::exit(exit_code.0);
        }
    }

    Ok(())
}
