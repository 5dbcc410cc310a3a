//! Offline maintenance for the reference corpus.
//!
//! ```bash
//! critiq-index import ./corpus/adams
//! critiq-index coverage adams
//! critiq-index register-adapter adams adams-lora-v2
//! ```

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use critiq::config::Config;
use critiq::db::Database;
use critiq::indexing::Importer;
use critiq::inference::{create_provider, VisionProvider};
use critiq::logging;
use critiq::retrieval::ImageFeatureEmbedder;

enum Command {
    Import { dir: PathBuf, text_embeddings: bool },
    Coverage { advisor: String },
    Reset { advisor: String, confirmed: bool },
    RegisterAdapter { advisor: String, model: String },
    Stalled,
}

struct Args {
    config_path: Option<PathBuf>,
    command: Command,
}

fn parse_args() -> Result<Args> {
    let mut config_path = None;
    let mut flags = Vec::new();
    let mut positional = Vec::new();

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("critiq-index {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--config" | "-c" => {
                let path = args
                    .next()
                    .ok_or_else(|| anyhow!("--config requires a path argument"))?;
                config_path = Some(PathBuf::from(path));
            }
            "--text-embeddings" | "--yes" | "-y" => flags.push(arg),
            other if other.starts_with('-') => bail!("Unknown argument: {}", other),
            _ => positional.push(arg),
        }
    }

    let has_flag = |names: &[&str]| flags.iter().any(|f| names.contains(&f.as_str()));
    let mut positional = positional.into_iter();
    let mut next = |what: &str| {
        positional
            .next()
            .ok_or_else(|| anyhow!("missing {} argument", what))
    };

    let command = match next("command")?.as_str() {
        "import" => Command::Import {
            dir: PathBuf::from(next("directory")?),
            text_embeddings: has_flag(&["--text-embeddings"]),
        },
        "coverage" => Command::Coverage {
            advisor: next("advisor")?,
        },
        "reset" => Command::Reset {
            advisor: next("advisor")?,
            confirmed: has_flag(&["--yes", "-y"]),
        },
        "register-adapter" => Command::RegisterAdapter {
            advisor: next("advisor")?,
            model: next("model")?,
        },
        "stalled" => Command::Stalled,
        other => bail!("Unknown command: {}", other),
    };

    Ok(Args {
        config_path,
        command,
    })
}

fn print_help() {
    println!(
        r#"critiq-index - reference corpus maintenance for critiq

USAGE:
    critiq-index [OPTIONS] <COMMAND>

COMMANDS:
    import <DIR>                      Merge-upsert profile, passage and technique
                                      JSON documents found under DIR
    coverage <ADVISOR>                Show embedding coverage for an advisor
    reset <ADVISOR> --yes             Delete an advisor's profiles and passages
    register-adapter <ADVISOR> <MODEL>
                                      Record the fine-tuned model serving ADVISOR
    stalled                           List jobs idle past the stall threshold

OPTIONS:
    --config, -c PATH   Path to config file
    --text-embeddings   During import, compute missing text embeddings with
                        the configured embedding model
    --version, -V       Show version
    --help, -h          Show this help message

ENVIRONMENT:
    CRITIQ_CONFIG       Path to config file (overrides default location)
    CRITIQ_LOG          Log filter (trace, debug, info, warn, error)"#
    );
}

fn main() -> Result<()> {
    let args = match parse_args() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("Error: {}", e);
            print_help();
            std::process::exit(2);
        }
    };

    logging::init(None, true)?;

    let config = match &args.config_path {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    let db = Database::open(&config.storage.db_path)
        .with_context(|| format!("Failed to open {}", config.storage.db_path.display()))?;
    db.initialize()?;

    match args.command {
        Command::Import {
            dir,
            text_embeddings,
        } => {
            let embedder = ImageFeatureEmbedder;
            let mut importer = Importer::new(&db, &embedder);
            if text_embeddings {
                let provider: Arc<dyn VisionProvider> =
                    Arc::from(create_provider(&config.inference));
                if !provider.supports_embeddings() {
                    bail!("inference.embedding_model is not configured");
                }
                importer = importer.with_text_embeddings(provider);
            }

            let report = importer.import_dir(&dir)?;
            println!(
                "Imported {} profiles, {} passages, {} techniques ({} annotations) from {} files",
                report.profiles, report.passages, report.techniques, report.annotations, report.files
            );
            println!(
                "Computed {} visual and {} text embeddings",
                report.visual_embeddings_computed, report.text_embeddings_computed
            );
            for (path, reason) in &report.skipped {
                println!("  skipped {}: {}", path.display(), reason);
            }
            if !report.skipped.is_empty() {
                std::process::exit(1);
            }
        }
        Command::Coverage { advisor } => {
            if config.advisor(&advisor).is_none() {
                eprintln!("Warning: advisor '{}' is not in the config", advisor);
            }
            let coverage = db.verify_coverage(&advisor)?;
            println!("Advisor:            {}", advisor);
            println!("Profiles:           {}", coverage.total);
            println!("Visual embeddings:  {}", coverage.with_visual_embedding);
            println!("Text embeddings:    {}", coverage.with_text_embedding);
            println!("Both:               {}", coverage.with_both);
            println!("Passages:           {}", db.count_passages(&advisor)?);
            match db.adapter_model(&advisor)? {
                Some(model) => println!("Adapter:            {}", model),
                None => println!("Adapter:            none"),
            }
            if !coverage.is_complete() {
                println!("Coverage incomplete: some profiles lack an embedding");
            }
        }
        Command::Reset { advisor, confirmed } => {
            if !confirmed {
                bail!("reset deletes every profile and passage for '{}'; pass --yes", advisor);
            }
            let removed = db.reset_advisor(&advisor)?;
            info!(advisor = %advisor, removed, "Advisor corpus reset");
            println!("Removed {} profiles for {}", removed, advisor);
        }
        Command::RegisterAdapter { advisor, model } => {
            db.register_adapter(&advisor, &model)?;
            println!("Adapter for {} is now {}", advisor, model);
        }
        Command::Stalled => {
            let threshold = config.jobs.stall_threshold();
            let now = Utc::now();
            let stalled = db.stalled_jobs(now - threshold)?;
            if stalled.is_empty() {
                println!("No stuck jobs");
            }
            for job in stalled {
                println!(
                    "{}  {:<10}  {:<24}  idle {}s  retries {}",
                    job.id,
                    job.status.as_str(),
                    job.current_step,
                    (now - job.last_activity).num_seconds(),
                    job.retry_count
                );
            }
        }
    }

    Ok(())
}
