use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use radextract::config;
use radextract::pipeline::batch::DEFAULT_MODEL;
use radextract::pipeline::evaluation::DEFAULT_TOLERANCE_MM;
use radextract::{
    builtin_models, evaluate, run_batch, BackendRegistry, ExtractOptions, GenerationOptions,
};

#[derive(Parser)]
#[command(name = "radextract")]
#[command(version, about = "Schema-constrained lesion extraction from radiology reports", long_about = None)]
#[command(arg_required_else_help = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Extract a directory of reports into JSON files")]
    Extract {
        #[arg(long, help = "Folder of report text files")]
        in_dir: PathBuf,

        #[arg(long, help = "Output folder for .json results")]
        out_dir: PathBuf,

        #[arg(long, default_value = DEFAULT_MODEL, help = "Model name (see list-models)")]
        model: String,

        #[arg(long, default_value_t = 1, help = "Parallel workers sharing one backend")]
        workers: usize,

        #[arg(long, help = "Override the model's sampling temperature")]
        temperature: Option<f32>,

        #[arg(long, help = "Override the model's max new tokens")]
        max_tokens: Option<u32>,

        #[arg(long, help = "Override the model's top-p")]
        top_p: Option<f32>,

        #[arg(long, default_value = "txt", help = "Input file extension")]
        extension: String,
    },

    #[command(about = "Score predicted JSON files against references")]
    Eval {
        #[arg(long, help = "Folder of predicted .json")]
        pred_dir: PathBuf,

        #[arg(long, help = "Folder of reference .json")]
        ref_dir: PathBuf,

        #[arg(long, default_value_t = DEFAULT_TOLERANCE_MM, help = "Size tolerance in mm")]
        tolerance_mm: f64,
    },

    #[command(about = "List the configured models")]
    ListModels,
}

fn run(cli: Cli) -> Result<ExitCode> {
    match cli.command {
        Commands::Extract {
            in_dir,
            out_dir,
            model,
            workers,
            temperature,
            max_tokens,
            top_p,
            extension,
        } => {
            let options = ExtractOptions {
                model,
                generation: GenerationOptions {
                    temperature,
                    max_tokens,
                    top_p,
                },
                workers,
                extension,
                ..Default::default()
            };
            let registry = BackendRegistry::from_env();
            let summary = run_batch(&registry, &in_dir, &out_dir, &options)
                .with_context(|| format!("extraction from {} failed", in_dir.display()))?;
            registry.shutdown_all();

            println!(
                "Processed {} report(s), {} failed",
                summary.written.len(),
                summary.failed.len()
            );
            for failure in &summary.failed {
                eprintln!("  {}: {}", failure.file.display(), failure.error);
            }
            Ok(if summary.is_success() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Commands::Eval {
            pred_dir,
            ref_dir,
            tolerance_mm,
        } => {
            let report = evaluate(&pred_dir, &ref_dir, tolerance_mm).context("evaluation failed")?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::ListModels => {
            println!("{}", serde_json::to_string_pretty(builtin_models())?);
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn main() -> ExitCode {
    config::init_tracing();
    tracing::debug!("{} v{}", config::APP_NAME, config::APP_VERSION);

    match run(Cli::parse()) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
