use anyhow::anyhow;
use clap::{Parser, Subcommand};
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use dpo_from_scratch_rs::{
    config::RunConfig,
    examples,
    logging::{init_tracing, DEFAULT_LOG_FILTER},
    pipeline::run_training,
    Example,
};
use itertools::Itertools;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::LazyLock;

static EXAMPLE_REGISTRY: LazyLock<HashMap<&'static str, Box<dyn Example>>> = LazyLock::new(|| {
    let mut m: HashMap<&'static str, Box<dyn Example + 'static>> = HashMap::new();
    m.insert("01", Box::new(examples::dpo::EG01));
    m.insert("02", Box::new(examples::dpo::EG02));
    m.insert("03", Box::new(examples::dpo::EG03));
    m.insert("04", Box::new(examples::dpo::EG04));
    m.insert("05", Box::new(examples::dpo::EG05));
    m.insert("06", Box::new(examples::dpo::EG06));
    m
});

/// CLI
#[derive(Debug, Parser)]
#[command(name = "dpo-from-scratch-rs")]
#[command(about = "A CLI for DPO fine-tuning and its examples.", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fine-tune a model with DPO
    Train {
        /// Path to a JSON run config
        #[arg(long)]
        config: PathBuf,
        /// Overrides `output_dir` of the run config
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },
    /// Run examples
    Example {
        /// The example to run
        id: String,
    },
    /// List the available examples
    List,
}

fn main() -> anyhow::Result<()> {
    init_tracing(DEFAULT_LOG_FILTER)?;
    let example_registry = &*EXAMPLE_REGISTRY;
    let cli = Cli::parse();

    match cli.command {
        Commands::Train { config, output_dir } => {
            let mut cfg = RunConfig::from_json_file(config)?;
            if let Some(output_dir) = output_dir {
                cfg.output_dir = output_dir;
            }
            run_training(&cfg)?;
            Ok(())
        }
        Commands::Example { id } => {
            let eg = example_registry
                .get(&id[..])
                .ok_or_else(|| anyhow!("unknown example id `{id}`, see `list`"))?;
            eg.main()
        }
        Commands::List => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["Id", "Description"]);
            for (id, eg) in example_registry.iter().sorted_by_key(|(id, _)| **id) {
                table.add_row(vec![id.to_string(), eg.description()]);
            }
            println!("{table}");
            Ok(())
        }
    }
}
