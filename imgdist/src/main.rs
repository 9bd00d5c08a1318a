use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use imgdist::archive::ArchiveFormat;
use imgdist::config::AppConfig;
use imgdist::{Client, ExportOptions, ImportOptions};

/// Pull, push and archive container images
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch an image into the local store
    Pull {
        reference: String,

        /// Convert legacy schema 1 images instead of rejecting them
        #[arg(long)]
        convert_schema1: bool,
    },

    /// Upload a local image
    Push {
        reference: String,

        /// Local image to push, defaults to the reference itself
        #[arg(long)]
        image: Option<String>,
    },

    /// List local images
    Images,

    /// Write a local image to an OCI archive
    Export {
        image: String,
        file: PathBuf,

        #[arg(long, default_value = "oci")]
        format: String,
    },

    /// Load an OCI archive and record it under a reference
    Import {
        reference: String,
        file: PathBuf,

        #[arg(long, default_value = "oci")]
        format: String,

        /// Index entry to import, by ref name; defaults to the reference's tag
        #[arg(long)]
        ref_object: Option<String>,
    },

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_target(true))
        .init();

    let cli = Cli::parse();

    let config = AppConfig::load().context("Failed to load configuration")?;
    debug!("Loaded configuration: {:?}", config);
    let client = Client::from_config(&config).context("Failed to open storage")?;

    match cli.command {
        Commands::Pull { reference, convert_schema1 } => {
            let mut options = client.remote_options();
            if convert_schema1 {
                options = options.with_schema1_conversion(true);
            }
            let image = client.pull(&reference, options).await?;
            println!("{} {}", image.name, image.target.digest);
        }
        Commands::Push { reference, image } => {
            let name = image.unwrap_or_else(|| reference.clone());
            let image = client
                .get_image(&name)
                .await
                .with_context(|| format!("No local image named {}", name))?;
            client
                .push(&reference, &image.target, client.remote_options())
                .await?;
            println!("{} {}", reference, image.target.digest);
        }
        Commands::Images => {
            for image in client.list_images().await? {
                println!(
                    "{}\t{}\t{}\t{}",
                    image.name,
                    image.target.media_type,
                    image.target.digest,
                    image.updated_at.to_rfc3339()
                );
            }
        }
        Commands::Export { image, file, format } => {
            let format: ArchiveFormat = format.parse()?;
            let out = File::create(&file)
                .with_context(|| format!("Failed to create {}", file.display()))?;
            let options = ExportOptions {
                format,
                ..Default::default()
            };
            let mut out = client.export(&image, BufWriter::new(out), options).await?;
            out.flush()?;
            info!("Exported {} to {}", image, file.display());
        }
        Commands::Import { reference, file, format, ref_object } => {
            let format: ArchiveFormat = format.parse()?;
            let input = File::open(&file)
                .with_context(|| format!("Failed to open {}", file.display()))?;
            let options = ImportOptions { format, ref_object };
            let image = client.import(&reference, BufReader::new(input), options).await?;
            println!("{} {}", image.name, image.target.digest);
        }
        Commands::Version => {
            println!("imgdist {}", client.version());
        }
    }

    Ok(())
}
