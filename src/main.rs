mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Commands};
use mq_av::tools::FFPROBE;
use mq_av::ToolRegistry;
use mq_core::config::Config;
use std::path::Path;

async fn start_server(host: Option<String>, port: Option<u16>, config_path: Option<&Path>) -> Result<()> {
    let mut config = Config::load_or_default(config_path);

    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }

    tracing::info!("Starting marquee");
    tracing::info!(
        "Work directory: {}, segment length {}s, idle timeout {}s",
        config.transcode.work_dir.display(),
        config.transcode.segment_duration_secs,
        config.transcode.idle_timeout_secs
    );

    mq_server::start(config).await?;
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Respect RUST_LOG if set, otherwise pick defaults from the verbose flag.
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cli.verbose {
            "marquee=trace,mq_server=trace,mq_transcode=trace,mq_av=debug,mq_media=debug,tower_http=debug".to_string()
        } else {
            "marquee=info,mq_server=info,mq_transcode=info,mq_av=info,tower_http=info".to_string()
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(&env_filter)
        .init();

    match cli.command {
        Commands::Start { host, port } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(start_server(host, port, cli.config.as_deref()))
        }
        Commands::Probe { file, json } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(probe_file(&file, json, cli.config.as_deref()))
        }
        Commands::CheckTools => check_tools(cli.config.as_deref()),
        Commands::Validate {
            config: config_path,
        } => {
            let path = config_path.or(cli.config);
            validate_config(path.as_deref())
        }
        Commands::Version => {
            println!("marquee {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

async fn probe_file(file: &Path, json: bool, config_path: Option<&Path>) -> Result<()> {
    if !file.exists() {
        anyhow::bail!("File does not exist: {:?}", file);
    }

    let config = Config::load_or_default(config_path);
    let tools = ToolRegistry::discover(&config.tools);
    let ffprobe = tools.require(FFPROBE)?;

    let duration = mq_av::probe::probe_duration(ffprobe, file).await?;
    let manifest = mq_media::Manifest::synthesize(duration, config.transcode.segment_secs())
        .context("cannot build a segment manifest for this file")?;

    if json {
        let value = serde_json::json!({
            "file": file,
            "duration_secs": duration,
            "segment_duration_secs": manifest.segment_duration_secs(),
            "segments": manifest.len(),
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        let secs = duration as u64;
        println!("File: {}", file.display());
        println!(
            "Duration: {:02}:{:02}:{:02} ({duration:.3}s)",
            secs / 3600,
            (secs / 60) % 60,
            secs % 60
        );
        println!(
            "Segments: {} x {}s",
            manifest.len(),
            manifest.segment_duration_secs()
        );
        if let Some(last) = manifest.entries().last() {
            println!("Final segment: {:.3}s", last.duration_secs);
        }
    }

    Ok(())
}

fn check_tools(config_path: Option<&Path>) -> Result<()> {
    println!("Checking external tools...\n");

    let config = Config::load_or_default(config_path);
    let tools = ToolRegistry::discover(&config.tools);
    let mut all_ok = true;

    for tool in tools.check_all() {
        let status = if tool.available {
            "✓"
        } else {
            all_ok = false;
            "✗"
        };

        print!("{} {}", status, tool.name);

        if let Some(ref version) = tool.version {
            print!(" ({})", version);
        }

        if let Some(ref path) = tool.path {
            print!(" - {}", path.display());
        }

        println!();
    }

    println!();
    if all_ok {
        println!("All required tools are available!");
    } else {
        println!("Some tools are missing. Sessions cannot start without ffmpeg and ffprobe.");
    }

    Ok(())
}

fn validate_config(path: Option<&Path>) -> Result<()> {
    let config = match path {
        Some(p) => {
            println!("Validating config: {:?}", p);
            let contents = std::fs::read_to_string(p)
                .with_context(|| format!("failed to read {}", p.display()))?;
            let config = Config::from_json(&contents)?;
            println!("✓ Configuration is valid");
            config
        }
        None => {
            println!("No config file specified, using defaults");
            Config::default()
        }
    };

    println!("  Server: {}:{}", config.server.host, config.server.port);
    println!("  Media root: {}", config.library.media_root.display());
    println!("  Work dir: {}", config.transcode.work_dir.display());
    println!(
        "  Segments: {}s, idle timeout {}s",
        config.transcode.segment_duration_secs, config.transcode.idle_timeout_secs
    );
    println!(
        "  Qualities: {}",
        config
            .qualities
            .iter()
            .map(|q| q.id.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    );

    for warning in config.validate() {
        println!("  warning: {warning}");
    }

    Ok(())
}
