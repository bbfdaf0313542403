use std::path::{Path, PathBuf};

use chrono::Utc;
use clap::{Parser, Subcommand};
use rillpatch::{
    Document, Documents, PatchConfig, PatchInstruction, WithContext, compile_patch,
    testing::MemoryStore,
};
use tokio::io::AsyncReadExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "rillpatch", version, about = "Rillpatch CLI")]
struct Cli {
    /// Field stamped with the modification time on every patch
    #[arg(long, default_value = "updatedAt")]
    timestamp_field: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the ordered update operations for a patch instruction
    Compile {
        /// Base filter selecting the target document, as JSON
        #[arg(long)]
        filter: String,

        /// Patch instruction file. Reads stdin when omitted.
        #[arg(long)]
        instruction: Option<PathBuf>,
    },

    /// Apply a patch instruction to a document held in memory and print the result
    Apply {
        /// JSON file holding the document to patch
        #[arg(long)]
        document: PathBuf,

        /// Base filter selecting the target document, as JSON
        #[arg(long)]
        filter: String,

        /// Patch instruction file. Reads stdin when omitted.
        #[arg(long)]
        instruction: Option<PathBuf>,

        /// Projection applied when reading the document back, as JSON
        #[arg(long)]
        projection: Option<String>,
    },
}

#[tokio::main]
async fn main() -> rillpatch::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = PatchConfig::default().timestamp_field(cli.timestamp_field);

    match cli.command {
        Commands::Compile {
            filter,
            instruction,
        } => {
            let filter = parse_object(&filter).context("parsing --filter")?;
            let instruction = read_instruction(instruction.as_deref()).await?;
            let ops = compile_patch(&filter, &instruction, &config.timestamp_field, Utc::now())?;
            println!("{}", serde_json::to_string_pretty(&ops)?);
        }
        Commands::Apply {
            document,
            filter,
            instruction,
            projection,
        } => {
            let filter = parse_object(&filter).context("parsing --filter")?;
            let projection = projection
                .as_deref()
                .map(parse_object)
                .transpose()
                .context("parsing --projection")?;
            let raw = tokio::fs::read_to_string(&document).await?;
            let doc: serde_json::Value = serde_json::from_str(&raw)
                .map_err(rillpatch::Error::from)
                .context(format!("parsing {}", document.display()))?;
            let instruction = read_instruction(instruction.as_deref()).await?;

            let docs = Documents::with_config(MemoryStore::with_documents([doc]), config);
            let patched = docs
                .patch(&filter, &instruction, projection.as_ref())
                .await?;
            println!("{}", serde_json::to_string_pretty(&patched)?);
        }
    }

    Ok(())
}

fn parse_object(raw: &str) -> rillpatch::Result<Document> {
    Ok(serde_json::from_str(raw)?)
}

async fn read_instruction(path: Option<&Path>) -> rillpatch::Result<PatchInstruction> {
    let raw = match path {
        Some(path) => tokio::fs::read_to_string(path).await?,
        None => {
            let mut buf = String::new();
            tokio::io::stdin().read_to_string(&mut buf).await?;
            buf
        }
    };
    serde_json::from_str(&raw)
        .map_err(rillpatch::Error::from)
        .context("parsing patch instruction")
}
