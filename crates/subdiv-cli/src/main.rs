mod candidate_cmds;
mod config;
mod generate_cmd;
mod review_cmds;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, CommandFactory, Parser, Subcommand};
use uuid::Uuid;

use subdiv_core::progress::ProgressSink;
use subdiv_core::{LifecycleManager, Pipeline};
use subdiv_db::models::{GenerationRequest, LayoutKind, Strategy};
use subdiv_db::store::JsonFileStore;

use config::{ClientKind, SubdivConfig};

#[derive(Parser)]
#[command(
    name = "subdiv",
    about = "AI-assisted land subdivision layout generation and approval"
)]
struct Cli {
    /// Candidate store file (overrides SUBDIV_STORE_PATH env var)
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    /// Generation backend: auto, gemini or demo (overrides SUBDIV_CLIENT)
    #[arg(long, global = true)]
    client: Option<ClientKind>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write a subdiv config file
    Init {
        /// Candidate store path to record in the config file
        #[arg(long)]
        store_path: Option<PathBuf>,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Print the prompt a generation would send, without calling anything
    Prompt {
        #[command(flatten)]
        land: LandArgs,
    },
    /// Generate one candidate layout, or a batch of variants
    Generate {
        /// Project the candidates belong to
        project: String,
        #[command(flatten)]
        land: LandArgs,
        /// Number of variants; more than 1 runs a ranked batch
        #[arg(long, default_value_t = 1)]
        variants: u32,
    },
    /// List a project's candidates
    List {
        project: String,
    },
    /// Show one candidate
    Show {
        candidate_id: String,
        /// Print the stored candidate as JSON
        #[arg(long)]
        json: bool,
    },
    /// Rank a project's completed candidates
    Rank {
        project: String,
        /// Sale price per sqm of viable lot area, for revenue estimates
        #[arg(long)]
        price_per_area: Option<f64>,
        /// Print rankings as JSON
        #[arg(long)]
        json: bool,
    },
    /// Approve a completed candidate
    Approve {
        candidate_id: String,
    },
    /// Reject a completed candidate
    Reject {
        candidate_id: String,
        /// Why the layout was rejected (at most 500 characters)
        #[arg(long)]
        reason: Option<String>,
    },
    /// Make an approved candidate the project's active plan
    Activate {
        candidate_id: String,
    },
    /// Approve and activate a candidate, archiving its batch siblings
    Select {
        candidate_id: String,
    },
    /// Take a candidate out of service
    Archive {
        candidate_id: String,
    },
    /// Generate again from an existing candidate's parameters
    Regenerate {
        candidate_id: String,
    },
    /// Print shell completions
    Completions {
        shell: clap_complete::Shell,
    },
}

/// Land and layout parameters shared by `prompt` and `generate`.
#[derive(Args, Debug, Clone)]
pub struct LandArgs {
    /// Land width in metres
    #[arg(long)]
    width: f64,
    /// Land length in metres
    #[arg(long)]
    length: f64,
    /// Land area in sqm (defaults to width * length)
    #[arg(long)]
    area: Option<f64>,
    /// Share of the land reserved for amenities, in percent
    #[arg(long, default_value_t = 10.0)]
    amenity_percent: f64,
    /// Desired number of lots
    #[arg(long)]
    target_lots: Option<u32>,
    /// Regional context for the model (e.g. "Guatemala")
    #[arg(long)]
    locale: Option<String>,
    /// maximize-lots, larger-lots or balanced
    #[arg(long)]
    strategy: Option<Strategy>,
    /// grid, perimeter, central-spine or loop
    #[arg(long)]
    layout: Option<LayoutKind>,
    /// Lot width / length ratio
    #[arg(long)]
    aspect_ratio: Option<f64>,
    /// File whose contents replace the generated prompt
    #[arg(long)]
    prompt_file: Option<PathBuf>,
}

impl LandArgs {
    pub fn to_request(&self) -> anyhow::Result<GenerationRequest> {
        let prompt_override = match &self.prompt_file {
            Some(path) => Some(
                std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read prompt file {}", path.display()))?,
            ),
            None => None,
        };
        let base = GenerationRequest::new(self.width, self.length, self.amenity_percent);
        Ok(GenerationRequest {
            land_area: self.area.unwrap_or(base.land_area),
            target_lots: self.target_lots,
            locale: self.locale.clone(),
            strategy: self.strategy,
            prompt_override,
            road_layout: self.layout,
            lot_aspect_ratio: self.aspect_ratio,
            ..base
        })
    }
}

pub fn parse_candidate_id(input: &str) -> anyhow::Result<Uuid> {
    Uuid::parse_str(input).with_context(|| format!("invalid candidate ID: {input}"))
}

/// Open the store and wire the pipeline for `resolved`.
async fn build_pipeline(resolved: &SubdivConfig, progress: ProgressSink) -> anyhow::Result<Pipeline> {
    let store = JsonFileStore::open(&resolved.store_path)
        .await
        .with_context(|| {
            format!(
                "failed to open candidate store at {}",
                resolved.store_path.display()
            )
        })?;
    let lifecycle = Arc::new(LifecycleManager::new(Arc::new(store)));
    let client = resolved.build_client();
    tracing::debug!(
        client = client.name(),
        store = %resolved.store_path.display(),
        "pipeline ready"
    );
    Ok(Pipeline::new(client, lifecycle, resolved.pipeline.clone()).with_progress(progress))
}

/// Execute the `subdiv init` command: write config file.
fn cmd_init(store_path: Option<PathBuf>, force: bool) -> anyhow::Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let store_path = store_path.unwrap_or_else(config::default_store_path);
    let cfg = config::ConfigFile {
        store: config::StoreSection {
            path: Some(store_path.clone()),
        },
        ..config::ConfigFile::default()
    };
    config::save_config_to(&cfg, &path)?;

    println!("Config written to {}", path.display());
    println!("  store.path = {}", store_path.display());
    println!("  client.kind = {}", cfg.client.kind);
    println!();
    println!(
        "Set {} (or client.api_key) to use Gemini; without it the offline demo backend is used.",
        config::ENV_API_KEY
    );

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { store_path, force } => {
            cmd_init(store_path, force)?;
        }
        Commands::Prompt { land } => {
            generate_cmd::run_prompt(&land)?;
        }
        Commands::Completions { shell } => {
            clap_complete::generate(
                shell,
                &mut Cli::command(),
                "subdiv",
                &mut std::io::stdout(),
            );
        }
        Commands::Generate {
            project,
            land,
            variants,
        } => {
            let resolved = SubdivConfig::resolve(cli.store.as_deref(), cli.client)?;
            generate_cmd::run_generate(&resolved, &project, &land, variants).await?;
        }
        Commands::Regenerate { candidate_id } => {
            let resolved = SubdivConfig::resolve(cli.store.as_deref(), cli.client)?;
            let id = parse_candidate_id(&candidate_id)?;
            generate_cmd::run_regenerate(&resolved, id).await?;
        }
        command => {
            let resolved = SubdivConfig::resolve(cli.store.as_deref(), cli.client)?;
            let pipeline = build_pipeline(&resolved, ProgressSink::disabled()).await?;
            run_store_command(command, &pipeline).await?;
        }
    }

    Ok(())
}

/// Commands that only read or transition stored candidates.
async fn run_store_command(command: Commands, pipeline: &Pipeline) -> anyhow::Result<()> {
    match command {
        Commands::List { project } => candidate_cmds::run_list(pipeline, &project).await,
        Commands::Show { candidate_id, json } => {
            candidate_cmds::run_show(pipeline, parse_candidate_id(&candidate_id)?, json).await
        }
        Commands::Rank {
            project,
            price_per_area,
            json,
        } => candidate_cmds::run_rank(pipeline, &project, price_per_area, json).await,
        Commands::Approve { candidate_id } => {
            review_cmds::run_approve(pipeline, parse_candidate_id(&candidate_id)?).await
        }
        Commands::Reject {
            candidate_id,
            reason,
        } => review_cmds::run_reject(pipeline, parse_candidate_id(&candidate_id)?, reason).await,
        Commands::Activate { candidate_id } => {
            review_cmds::run_activate(pipeline, parse_candidate_id(&candidate_id)?).await
        }
        Commands::Select { candidate_id } => {
            review_cmds::run_select(pipeline, parse_candidate_id(&candidate_id)?).await
        }
        Commands::Archive { candidate_id } => {
            review_cmds::run_archive(pipeline, parse_candidate_id(&candidate_id)?).await
        }
        Commands::Init { .. }
        | Commands::Prompt { .. }
        | Commands::Generate { .. }
        | Commands::Regenerate { .. }
        | Commands::Completions { .. } => {
            anyhow::bail!("command does not operate on stored candidates")
        }
    }
}
