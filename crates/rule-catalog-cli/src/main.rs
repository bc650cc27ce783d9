use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use rule_catalog_core::{DeclarationContext, RepositoryDeclaration, RuleKey, RuleProvider};
use rule_catalog_engine::Registrar;
use rule_catalog_index_sqlite::{IndexQuery, RuleIndex};
use rule_catalog_store_sqlite::SqliteCatalog;
use serde::{Deserialize, Serialize};

#[derive(Debug, Parser)]
#[command(name = "rule-catalog")]
#[command(about = "Reconcile declared analyzer rules against a persistent catalog and search index")]
struct Cli {
    #[arg(long, default_value = "./rule_catalog.sqlite3")]
    catalog: PathBuf,

    #[arg(long, default_value = "./rule_index.sqlite3")]
    index: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run one reconciliation pass from declaration files.
    Sync(SyncArgs),
    /// Query the search index.
    Search(SearchArgs),
    /// Show one catalog rule with its parameters.
    Show(ShowArgs),
    /// List persisted repository records.
    Repos,
    /// Catalog and index counts.
    Stats,
}

#[derive(Debug, Args)]
struct SyncArgs {
    /// One JSON declaration file per provider, in provider order.
    #[arg(long = "declarations", required = true)]
    declarations: Vec<PathBuf>,

    #[arg(long, default_value_t = false)]
    organizations_enabled: bool,

    #[arg(long)]
    organization: Option<String>,
}

#[derive(Debug, Args)]
struct SearchArgs {
    #[arg(long)]
    query: Option<String>,

    /// Exact key filter, formatted as repository:rule.
    #[arg(long)]
    key: Option<String>,

    #[arg(long, default_value_t = false)]
    include_removed: bool,
}

#[derive(Debug, Args)]
struct ShowArgs {
    /// Key of the rule, formatted as repository:rule.
    #[arg(long)]
    key: String,
}

/// On-disk provider: one file, one plugin, any number of repositories.
#[derive(Debug, Serialize, Deserialize)]
struct DeclarationFile {
    plugin_key: String,
    #[serde(default)]
    repositories: Vec<RepositoryDeclaration>,
}

struct FileProvider {
    plugin_key: String,
    repositories: Vec<RepositoryDeclaration>,
}

impl RuleProvider for FileProvider {
    fn plugin_key(&self) -> &str {
        &self.plugin_key
    }

    fn define(&self, context: &mut DeclarationContext) {
        for repository in &self.repositories {
            context.declare(repository.clone());
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Sync(args) => run_sync(&cli.catalog, &cli.index, &args),
        Command::Search(args) => run_search(&cli.index, &args),
        Command::Show(args) => run_show(&cli.catalog, &args),
        Command::Repos => run_repos(&cli.catalog),
        Command::Stats => run_stats(&cli.catalog, &cli.index),
    }
}

fn load_provider(path: &Path) -> Result<Box<dyn RuleProvider>> {
    let body = fs::read_to_string(path)
        .with_context(|| format!("failed to read declaration file {}", path.display()))?;
    let file: DeclarationFile = serde_json::from_str(&body)
        .with_context(|| format!("failed to parse declaration file {}", path.display()))?;
    Ok(Box::new(FileProvider { plugin_key: file.plugin_key, repositories: file.repositories }))
}

fn run_sync(catalog_path: &Path, index_path: &Path, args: &SyncArgs) -> Result<()> {
    let mut providers: Vec<Box<dyn RuleProvider>> = Vec::with_capacity(args.declarations.len());
    for path in &args.declarations {
        providers.push(load_provider(path)?);
    }

    let mut catalog = SqliteCatalog::open(catalog_path)?;
    catalog.migrate()?;
    let mut index = RuleIndex::open(index_path)?;

    let mut registrar = Registrar::new(providers).organizations_enabled(args.organizations_enabled);
    if let Some(organization) = &args.organization {
        registrar = registrar.organization(organization.clone());
    }
    let summary = registrar.run(&mut catalog, &mut index).context("reconciliation run failed")?;

    emit_json(&serde_json::json!({
        "inserted": summary.inserted,
        "updated": summary.updated,
        "removed": summary.removed,
        "unchanged": summary.unchanged,
        "skipped_templates": summary.skipped_templates,
        "repositories_deleted": summary.repositories_deleted,
        "warnings": summary.warnings,
        "index_error": summary.index_error,
    }))
}

fn run_search(index_path: &Path, args: &SearchArgs) -> Result<()> {
    let index = RuleIndex::open(index_path)?;

    let mut query = IndexQuery::all();
    if let Some(text) = &args.query {
        query = query.text(text.clone());
    }
    if let Some(raw) = &args.key {
        query = query.key(RuleKey::parse(raw).map_err(anyhow::Error::from)?);
    }
    if args.include_removed {
        query = query.include_removed();
    }

    let result = index.query(&query)?;
    emit_json(&serde_json::json!({
        "ids": result.ids.iter().map(ToString::to_string).collect::<Vec<_>>(),
        "total": result.total,
    }))
}

fn run_show(catalog_path: &Path, args: &ShowArgs) -> Result<()> {
    let catalog = SqliteCatalog::open(catalog_path)?;
    let key = RuleKey::parse(&args.key).map_err(anyhow::Error::from)?;

    match catalog.select_rule(&key)? {
        Some(rule) => {
            let params = catalog.params_of(rule.id)?;
            emit_json(&serde_json::json!({ "rule": rule, "params": params }))
        }
        None => emit_json(&serde_json::json!({ "rule": null })),
    }
}

fn run_repos(catalog_path: &Path) -> Result<()> {
    let catalog = SqliteCatalog::open(catalog_path)?;
    let repositories = catalog.repositories()?;
    emit_json(&serde_json::json!({ "repositories": repositories }))
}

fn run_stats(catalog_path: &Path, index_path: &Path) -> Result<()> {
    let catalog = SqliteCatalog::open(catalog_path)?;
    let index = RuleIndex::open(index_path)?;
    emit_json(&serde_json::json!({
        "schema_version": catalog.schema_version()?,
        "rules": catalog.count_rules()?,
        "params": catalog.count_params()?,
        "documents": index.count_documents()?,
    }))
}

fn emit_json(value: &serde_json::Value) -> Result<()> {
    let body = serde_json::to_string_pretty(value).context("failed to serialize output")?;
    println!("{body}");
    Ok(())
}
