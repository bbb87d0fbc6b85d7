use std::io::{IsTerminal, Read, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use clap::{ArgAction, Args, Parser, Subcommand};
use refaudit_core::config_file::{
    self, CacheConfig, ConcurrencyConfig, ConfigFile, CredentialsConfig, MatchingConfig,
    ModelSection, RegistriesConfig,
};
use refaudit_core::normalize::normalize;
use refaudit_core::{AuditCache, Config, ModelConfig, RawReference};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

mod output;

use output::{ColorMode, ProgressSink};

/// Reference Auditor - verify, deduplicate and diagnose academic reference lists
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// More log output on stderr (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Audit a reference list, one reference per line
    Check {
        /// File to read, or `-` for stdin
        input: String,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,

        /// Write the report to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Disable colored output
        #[arg(long)]
        no_color: bool,

        /// Dry run: show how each line is segmented without querying registries
        #[arg(long)]
        dry_run: bool,

        #[command(flatten)]
        settings: SettingsArgs,
    },

    /// Empty the persistent lookup cache
    ClearCache {
        /// Cache database to clear
        #[arg(long)]
        cache_path: Option<PathBuf>,
    },

    /// Print the effective configuration (secrets masked)
    ShowConfig {
        #[command(flatten)]
        settings: SettingsArgs,
    },

    /// Store the given flags in the platform config file
    SaveConfig {
        #[command(flatten)]
        settings: SettingsArgs,
    },
}

/// Flags that override environment variables and config files.
#[derive(Args, Debug, Default)]
struct SettingsArgs {
    /// Contact address sent to CrossRef (required for live lookups)
    #[arg(long)]
    crossref_mailto: Option<String>,

    /// NCBI E-utilities API key
    #[arg(long)]
    ncbi_api_key: Option<String>,

    /// API key for the classification model
    #[arg(long)]
    model_api_key: Option<String>,

    /// OpenAI-compatible endpoint for the classification model
    #[arg(long)]
    model_endpoint: Option<String>,

    /// Classification model name
    #[arg(long)]
    model_name: Option<String>,

    /// Diagnose with heuristics only
    #[arg(long)]
    no_model: bool,

    /// Minimum title similarity for a fuzzy match (0-1]
    #[arg(long)]
    fuzzy_threshold: Option<f64>,

    /// Minimum text similarity for near-duplicate grouping (0-1]
    #[arg(long)]
    duplicate_threshold: Option<f64>,

    /// References processed concurrently
    #[arg(long)]
    max_concurrency: Option<usize>,

    /// Retries after the first attempt of each registry call
    #[arg(long)]
    max_retries: Option<u32>,

    /// Path to the persistent lookup cache
    #[arg(long, conflicts_with = "no_cache")]
    cache_path: Option<PathBuf>,

    /// Keep the cache in memory only
    #[arg(long)]
    no_cache: bool,

    /// Comma-separated list of registries to disable (e.g. PubMed)
    #[arg(long, value_delimiter = ',')]
    disable_registries: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    match cli.command {
        Command::Check {
            input,
            json,
            output,
            no_color,
            dry_run,
            settings,
        } => {
            if dry_run {
                dry_run_check(&input, json, no_color, output)
            } else {
                check(&input, json, no_color, output, &settings).await
            }
        }
        Command::ClearCache { cache_path } => clear_cache(cache_path),
        Command::ShowConfig { settings } => show_config(&settings),
        Command::SaveConfig { settings } => save_config(&settings),
    }
}

/// Logs go to stderr. `RUST_LOG` wins over the verbosity flags.
fn init_tracing(verbose: u8, quiet: bool) {
    let level = match (quiet, verbose) {
        (true, _) => "error",
        (false, 0) => "warn",
        (false, 1) => "info",
        (false, 2) => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("refaudit_core={level},refaudit={level}")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn default_cache_path() -> Option<PathBuf> {
    dirs::cache_dir().map(|d| d.join("refaudit").join("cache.db"))
}

/// Cache location: flag > `REFAUDIT_CACHE_PATH` > config file > platform default.
fn resolve_cache_path(flag: Option<PathBuf>, file: &ConfigFile) -> Option<PathBuf> {
    flag.or_else(|| env_var("REFAUDIT_CACHE_PATH").map(PathBuf::from))
        .or_else(|| {
            file.cache
                .as_ref()
                .and_then(|c| c.path.as_ref())
                .map(PathBuf::from)
        })
        .or_else(default_cache_path)
}

/// Build the run configuration: CLI flag > env var > config file > default.
fn resolve_config(settings: &SettingsArgs, file: &ConfigFile) -> Config {
    let mut config = Config::default();
    file.apply_to(&mut config);

    if let Some(mailto) = settings
        .crossref_mailto
        .clone()
        .or_else(|| env_var("CROSSREF_MAILTO"))
    {
        config.crossref_mailto = Some(mailto);
    }
    if let Some(key) = settings.ncbi_api_key.clone().or_else(|| env_var("NCBI_API_KEY")) {
        config.ncbi_api_key = Some(key);
    }

    let model_key = settings
        .model_api_key
        .clone()
        .or_else(|| env_var("DASHSCOPE_API_KEY"));
    if settings.no_model {
        config.model = None;
    } else if model_key.is_some()
        || settings.model_endpoint.is_some()
        || settings.model_name.is_some()
    {
        let mut model = config.model.take().unwrap_or_else(ModelConfig::default);
        if let Some(key) = model_key {
            model.api_key = Some(key);
        }
        if let Some(ref endpoint) = settings.model_endpoint {
            model.endpoint = endpoint.clone();
        }
        if let Some(ref name) = settings.model_name {
            model.model = name.clone();
        }
        config.model = Some(model);
    }

    if let Some(v) = settings.fuzzy_threshold {
        config.similarity_threshold_fuzzy_match = v;
    }
    if let Some(v) = settings.duplicate_threshold {
        config.similarity_threshold_duplicate = v;
    }
    if let Some(v) = settings.max_concurrency {
        config.max_concurrency = v;
    }
    if let Some(v) = settings.max_retries {
        config.max_retries = v;
    }
    if !settings.disable_registries.is_empty() {
        config.disabled_registries = settings.disable_registries.clone();
    }

    config.cache_path = if settings.no_cache {
        None
    } else {
        resolve_cache_path(settings.cache_path.clone(), file)
    };

    config.pace_for_credentials();
    config
}

/// Non-blank lines of the input file, or of stdin for `-`.
fn read_lines(input: &str) -> anyhow::Result<Vec<String>> {
    let text = if input == "-" {
        let mut text = String::new();
        std::io::stdin()
            .read_to_string(&mut text)
            .context("failed to read stdin")?;
        text
    } else {
        let path = PathBuf::from(input);
        if !path.exists() {
            anyhow::bail!("File not found: {}", path.display());
        }
        std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?
    };
    Ok(text
        .lines()
        .map(str::trim_end)
        .filter(|l| !l.trim().is_empty())
        .map(String::from)
        .collect())
}

fn source_name(input: &str) -> String {
    if input == "-" {
        return "<stdin>".to_string();
    }
    let path = PathBuf::from(input);
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| input.to_string())
}

fn open_writer(output: &Option<PathBuf>) -> anyhow::Result<Box<dyn Write>> {
    Ok(match output {
        Some(path) => Box::new(
            std::fs::File::create(path)
                .with_context(|| format!("failed to create {}", path.display()))?,
        ),
        None => Box::new(std::io::stdout()),
    })
}

async fn check(
    input: &str,
    json: bool,
    no_color: bool,
    output: Option<PathBuf>,
    settings: &SettingsArgs,
) -> anyhow::Result<()> {
    let file_config = config_file::load_config();
    let config = resolve_config(settings, &file_config);
    tracing::debug!(?config, "resolved configuration");
    config.validate()?;

    let lines = read_lines(input)?;
    let use_color = !no_color && !json && output.is_none();
    let color = ColorMode(use_color);
    let mut writer = open_writer(&output)?;

    if lines.is_empty() {
        writeln!(writer, "No references to check.")?;
        return Ok(());
    }

    // Progress goes to stderr when stdout carries the report or JSON.
    let sink = if json || output.is_some() {
        ProgressSink::Lines(Mutex::new(Box::new(std::io::stderr())))
    } else if std::io::stdout().is_terminal() {
        ProgressSink::bar()
    } else {
        ProgressSink::Lines(Mutex::new(Box::new(std::io::stdout())))
    };
    let sink = Arc::new(sink);
    let progress_cb = {
        let sink = Arc::clone(&sink);
        move |event: refaudit_core::ProgressEvent| sink.handle(&event, color)
    };

    let cancel = CancellationToken::new();

    // Set up Ctrl+C handler
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, cancelling audit");
            cancel_clone.cancel();
        }
    });

    let report = refaudit_core::audit_references(lines, config, progress_cb, cancel)
        .await
        .context("cannot start the audit")?;

    if json {
        serde_json::to_writer_pretty(&mut writer, &report)?;
        writeln!(writer)?;
        return Ok(());
    }

    output::print_unresolved_report(&mut *writer, &report.records, color)?;
    output::print_doi_mismatches(&mut *writer, &report.records, color)?;
    output::print_retraction_warnings(&mut *writer, &report.records, color)?;
    output::print_duplicates(&mut *writer, &report, color)?;
    output::print_summary(&mut *writer, &report.stats, report.cancelled, color)?;

    Ok(())
}

fn dry_run_check(
    input: &str,
    json: bool,
    no_color: bool,
    output: Option<PathBuf>,
) -> anyhow::Result<()> {
    let lines = read_lines(input)?;
    let mut writer = open_writer(&output)?;

    let parsed: Vec<_> = lines
        .into_iter()
        .enumerate()
        .map(|(i, text)| normalize(&RawReference::new(i, text)))
        .collect();

    if json {
        let references: Vec<_> = parsed.iter().filter_map(|p| p.as_ref().ok()).collect();
        serde_json::to_writer_pretty(&mut writer, &references)?;
        writeln!(writer)?;
        return Ok(());
    }

    let color = ColorMode(!no_color && output.is_none());
    output::print_dry_run(&mut *writer, &source_name(input), &parsed, color)?;
    Ok(())
}

fn clear_cache(cache_path: Option<PathBuf>) -> anyhow::Result<()> {
    let file_config = config_file::load_config();
    let Some(path) = resolve_cache_path(cache_path, &file_config) else {
        anyhow::bail!("Could not determine a cache location; pass --cache-path");
    };
    if !path.exists() {
        println!("No cache at {}", path.display());
        return Ok(());
    }

    let cache = AuditCache::open(&path, refaudit_core::DEFAULT_TTL)
        .with_context(|| format!("failed to open cache at {}", path.display()))?;
    let entries = cache.disk_len();
    cache.clear();
    println!("Cleared {} cached entries from {}", entries, path.display());
    Ok(())
}

fn show_config(settings: &SettingsArgs) -> anyhow::Result<()> {
    let file_config = config_file::load_config();
    let config = resolve_config(settings, &file_config);

    match config_file::config_path() {
        Some(path) if path.exists() => println!("Config file: {}", path.display()),
        Some(path) => println!("Config file: {} (not present)", path.display()),
        None => println!("Config file: (no platform config directory)"),
    }
    if PathBuf::from(".refaudit.toml").exists() {
        println!("Local overrides: .refaudit.toml");
    }
    println!();
    println!("{:#?}", config);

    if let Err(e) = config.validate() {
        println!();
        println!("Warning: {}", e);
    }
    if config.crossref_mailto.is_none() {
        println!();
        println!("Warning: set CROSSREF_MAILTO or --crossref-mailto before running `check`");
    }
    Ok(())
}

/// The part of a config file the flags set; environment variables are not saved.
fn settings_overlay(settings: &SettingsArgs) -> ConfigFile {
    let model = if settings.no_model {
        Some(ModelSection {
            enabled: Some(false),
            ..Default::default()
        })
    } else if settings.model_endpoint.is_some() || settings.model_name.is_some() {
        Some(ModelSection {
            enabled: None,
            endpoint: settings.model_endpoint.clone(),
            name: settings.model_name.clone(),
        })
    } else {
        None
    };

    ConfigFile {
        credentials: Some(CredentialsConfig {
            crossref_mailto: settings.crossref_mailto.clone(),
            ncbi_api_key: settings.ncbi_api_key.clone(),
            model_api_key: settings.model_api_key.clone(),
        }),
        matching: Some(MatchingConfig {
            similarity_threshold_fuzzy_match: settings.fuzzy_threshold,
            similarity_threshold_duplicate: settings.duplicate_threshold,
            doi_mismatch_threshold: None,
        }),
        cache: settings.cache_path.as_ref().map(|p| CacheConfig {
            path: Some(p.display().to_string()),
            ttl_secs: None,
        }),
        concurrency: Some(ConcurrencyConfig {
            max_concurrency: settings.max_concurrency,
            max_retries: settings.max_retries,
            ..Default::default()
        }),
        registries: (!settings.disable_registries.is_empty()).then(|| RegistriesConfig {
            disabled: Some(settings.disable_registries.clone()),
        }),
        model,
    }
}

fn save_config(settings: &SettingsArgs) -> anyhow::Result<()> {
    let existing = config_file::config_path()
        .and_then(|p| config_file::load_from_path(&p))
        .unwrap_or_default();
    let merged = config_file::merge(existing, settings_overlay(settings));
    let path = config_file::save_config(&merged).map_err(anyhow::Error::msg)?;
    println!("Saved settings to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_config_file() {
        let file = ConfigFile {
            matching: Some(MatchingConfig {
                similarity_threshold_fuzzy_match: Some(0.7),
                similarity_threshold_duplicate: Some(0.8),
                ..Default::default()
            }),
            ..Default::default()
        };
        let settings = SettingsArgs {
            fuzzy_threshold: Some(0.9),
            no_cache: true,
            ..Default::default()
        };
        let config = resolve_config(&settings, &file);
        assert_eq!(config.similarity_threshold_fuzzy_match, 0.9);
        assert_eq!(config.similarity_threshold_duplicate, 0.8);
        assert!(config.cache_path.is_none());
    }

    #[test]
    fn credentials_pace_registries_faster() {
        let anonymous = Config::default();
        let settings = SettingsArgs {
            crossref_mailto: Some("me@example.org".into()),
            ncbi_api_key: Some("key".into()),
            no_cache: true,
            ..Default::default()
        };
        let config = resolve_config(&settings, &ConfigFile::default());

        for service in ["CrossRef", "PubMed"] {
            let period = |c: &Config| c.rate_limiters.get(service).unwrap().base_period();
            assert!(period(&config) < period(&anonymous), "{service} not sped up");
        }
    }

    #[test]
    fn saved_flags_keep_other_file_values() {
        let existing = ConfigFile {
            matching: Some(MatchingConfig {
                similarity_threshold_duplicate: Some(0.8),
                ..Default::default()
            }),
            ..Default::default()
        };
        let settings = SettingsArgs {
            crossref_mailto: Some("me@example.org".into()),
            fuzzy_threshold: Some(0.9),
            cache_path: Some(PathBuf::from("/tmp/refaudit.db")),
            no_model: true,
            ..Default::default()
        };
        let merged = config_file::merge(existing, settings_overlay(&settings));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("refaudit").join("config.toml");
        config_file::save_to_path(&merged, &path).unwrap();
        let saved = config_file::load_from_path(&path).unwrap();

        let mut config = Config::default();
        saved.apply_to(&mut config);
        assert_eq!(config.crossref_mailto.as_deref(), Some("me@example.org"));
        assert_eq!(config.similarity_threshold_fuzzy_match, 0.9);
        assert_eq!(config.similarity_threshold_duplicate, 0.8);
        assert_eq!(config.cache_path, Some(PathBuf::from("/tmp/refaudit.db")));
        assert_eq!(saved.model.and_then(|m| m.enabled), Some(false));
    }

    #[test]
    fn explicit_cache_path_wins() {
        let file = ConfigFile {
            cache: Some(CacheConfig {
                path: Some("/from/file.db".into()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let path = resolve_cache_path(Some(PathBuf::from("/from/flag.db")), &file);
        assert_eq!(path, Some(PathBuf::from("/from/flag.db")));
    }

    #[test]
    fn no_model_flag_disables_configured_model() {
        let file = ConfigFile {
            model: Some(ModelSection {
                name: Some("qwen-plus".into()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let settings = SettingsArgs {
            no_model: true,
            no_cache: true,
            ..Default::default()
        };
        assert!(resolve_config(&settings, &file).model.is_none());
    }

    #[test]
    fn cli_parses_check_flags() {
        let cli = Cli::try_parse_from([
            "refaudit",
            "-vv",
            "check",
            "refs.txt",
            "--json",
            "--disable-registries",
            "PubMed,Other",
            "--fuzzy-threshold",
            "0.8",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        let Command::Check {
            input,
            json,
            settings,
            ..
        } = cli.command
        else {
            panic!("expected check");
        };
        assert_eq!(input, "refs.txt");
        assert!(json);
        assert_eq!(settings.disable_registries, vec!["PubMed", "Other"]);
        assert_eq!(settings.fuzzy_threshold, Some(0.8));
    }

    #[test]
    fn read_lines_skips_blank_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("refs.txt");
        std::fs::write(&path, "first ref\n\n   \nsecond ref  \n").unwrap();
        let lines = read_lines(path.to_str().unwrap()).unwrap();
        assert_eq!(lines, vec!["first ref", "second ref"]);
    }
}
