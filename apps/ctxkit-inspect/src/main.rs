use anyhow::{anyhow, Context as _, Result};
use clap::{Parser, Subcommand};
use ctxkit::{Binding, BindingFilter, Context, ResolutionOptions, TagFilter};
use runtime::{AppConfig, CliArgs};
use serde_json::Value;
use std::path::PathBuf;

/// ctxkit-inspect - seed a context from configuration and look inside it
#[derive(Parser)]
#[command(name = "ctxkit-inspect")]
#[command(about = "Seed a ctxkit context from configuration and inspect or resolve its bindings")]
#[command(version = "0.1.0")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Log verbosity level (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Check the configuration and report how many bindings it seeds
    Check,
    /// Print matching bindings as JSON
    Inspect {
        /// Only bindings carrying this tag (glob patterns allowed)
        #[arg(long)]
        tag: Option<String>,
        /// Only bindings whose key matches this glob pattern
        #[arg(long)]
        pattern: Option<String>,
        /// Include the injection points of class bindings
        #[arg(long)]
        injections: bool,
    },
    /// Resolve a key (deep paths as `key#a.b`) and print its value
    Get {
        key: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let args = CliArgs {
        config: cli.config.as_ref().map(|p| p.to_string_lossy().to_string()),
        print_config: cli.print_config,
        verbose: cli.verbose,
    };

    let mut config = AppConfig::load_or_default(cli.config.as_deref())?;
    config.apply_cli_overrides(&args);

    let logging_config = config.logging.clone().unwrap_or_default();
    runtime::init_logging(&logging_config, &config.base_dir());
    tracing::debug!(config = ?args.config, "ctxkit-inspect starting");

    if args.print_config {
        print!("{}", config.to_yaml()?);
        return Ok(());
    }

    let ctx = runtime::build_context(&config)?;
    match cli.command.unwrap_or(Commands::Check) {
        Commands::Check => check(&ctx),
        Commands::Inspect {
            tag,
            pattern,
            injections,
        } => inspect(&ctx, tag, pattern, injections),
        Commands::Get { key } => get(&ctx, &key).await,
    }
}

fn check(ctx: &Context) -> Result<()> {
    let count = ctx.find(BindingFilter::All).len();
    tracing::info!(context = ctx.name(), bindings = count, "Configuration is valid");
    println!("Configuration OK: {count} binding(s) in context '{}'", ctx.name());
    Ok(())
}

fn inspect(
    ctx: &Context,
    tag: Option<String>,
    pattern: Option<String>,
    injections: bool,
) -> Result<()> {
    let mut bindings: Vec<Binding> = match pattern {
        Some(pattern) => ctx.find(pattern),
        None => ctx.find(BindingFilter::All),
    };
    if let Some(tag) = tag {
        let filter = TagFilter::name(tag);
        bindings.retain(|b| filter.matches(b));
    }
    let json: Vec<Value> = bindings.iter().map(|b| b.inspect(injections)).collect();
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}

async fn get(ctx: &Context, key: &str) -> Result<()> {
    let value = ctx
        .get_value(key, ResolutionOptions::default())
        .await
        .with_context(|| format!("Failed to resolve '{key}'"))?
        .ok_or_else(|| anyhow!("'{key}' resolved to no value"))?;
    match value.downcast_ref::<Value>() {
        Some(json) => println!("{}", serde_json::to_string_pretty(json)?),
        None => println!("<{}>", value.type_name()),
    }
    Ok(())
}
