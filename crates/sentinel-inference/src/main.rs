#[cfg(feature = "cli")]
use clap::{Parser, Subcommand};
#[cfg(feature = "cli")]
use sentinel_inference::{config::Config, metrics, telemetry, DiagnosisPipeline};
#[cfg(feature = "cli")]
use std::path::PathBuf;

#[cfg(feature = "cli")]
#[derive(Parser)]
#[command(name = "sentinel-inference")]
#[command(version)]
#[command(about = "Diagnose plant leaf images with a two-model ensemble", long_about = None)]
struct Cli {
    /// Print Prometheus metrics after the command finishes
    #[arg(long, global = true)]
    metrics: bool,

    #[command(subcommand)]
    command: Commands,
}

#[cfg(feature = "cli")]
#[derive(Subcommand)]
enum Commands {
    /// Diagnose one or more image files and print the JSON result for each
    Diagnose {
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
    /// Load every configured model and print its state
    Status,
}

#[cfg(feature = "cli")]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init_tracing();
    metrics::init_metrics();

    let cli = Cli::parse();
    let cfg = Config::from_env()?;
    cfg.print_config();

    let pipeline = DiagnosisPipeline::from_config(&cfg)?;
    let mut failed = 0usize;

    match cli.command {
        Commands::Diagnose { images } => {
            for path in images {
                let filename = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let contents = tokio::fs::read(&path).await?;

                match pipeline.diagnose_upload(&filename, contents.into()).await {
                    Ok(result) => {
                        let mut json = serde_json::to_value(&result)?;
                        json["image"] = serde_json::Value::String(path.display().to_string());
                        println!("{}", serde_json::to_string_pretty(&json)?);
                    }
                    Err(e) => {
                        failed += 1;
                        let json = serde_json::json!({
                            "image": path.display().to_string(),
                            "error": e.kind(),
                            "message": e.to_string(),
                            "retryable": e.is_retryable(),
                        });
                        println!("{}", serde_json::to_string_pretty(&json)?);
                    }
                }
            }
        }
        Commands::Status => {
            pipeline.registry().preload().await;
            let states = pipeline.registry().states();
            println!("{}", serde_json::to_string_pretty(&states)?);
        }
    }

    pipeline.shutdown().await;

    if cli.metrics {
        println!("{}", metrics::render());
    }

    if failed > 0 {
        anyhow::bail!("{} image(s) could not be diagnosed", failed);
    }
    Ok(())
}

#[cfg(not(feature = "cli"))]
fn main() {
    println!("CLI feature not enabled. Enable with --features cli");
}
