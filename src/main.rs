use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dialoguer::{Input, Select};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

use hoard::config::{StoreConfig, SyncSettings};
use hoard::core::fields::{Assignment, FieldKind, FieldSchema, FieldSpec};
use hoard::services::{
    deduplicate, AdmissionGate, AdmissionHook, AdmissionOutcome, AdmissionPolicy, FixedPolicy,
    LocalMirror, RejectReason, Resolution, SyncEngine, SyncOptions, SyncReport, Triage,
};
use hoard::store::{list_stores, ConsistencyReport, Store, StoreLayout, StoreLock, CONFIG_FILE};
use hoard::{Item, ItemId};

#[derive(Parser, Debug)]
#[command(
    name = "hoard",
    version,
    about = "Keep a media hoard indexed, deduplicated and in sync with its remote"
)]
struct Cli {
    /// Directory holding the stores (default: <data dir>/hoard/stores)
    #[arg(long, global = true, env = "HOARD_ROOT", value_name = "DIR")]
    root: Option<PathBuf>,

    /// Log debug output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List the stores under the root
    List,

    /// Create a new, empty store
    Init {
        store: String,
        /// Remote replica to sync with
        #[arg(long, value_name = "DIR")]
        remote: Option<PathBuf>,
        /// Share config.json with the remote as well
        #[arg(long, requires = "remote")]
        sync_config: bool,
        /// Typed field, e.g. `rating:int:r,stars` or `fav:bool`
        #[arg(long = "field", value_name = "KEY:TYPE[:ALIAS,...]")]
        fields: Vec<String>,
    },

    /// Show item, tweak and staging counts
    Status { store: String },

    /// Reconcile with the remote and admit staged files
    Sync {
        store: String,
        /// Do not pull from the remote
        #[arg(long)]
        no_pull: bool,
        /// Do not push to the remote
        #[arg(long)]
        no_push: bool,
        /// Leave staged files alone
        #[arg(long)]
        no_stage: bool,
        /// Stop staging after this many admissions
        #[arg(long, value_name = "N")]
        limit: Option<usize>,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Compare the index with the contents directory without changing anything
    Check {
        store: String,
        #[arg(long)]
        json: bool,
    },

    /// Find clusters of near-duplicate items
    Dedup {
        store: String,
        /// Maximum Hamming distance within a cluster
        #[arg(long)]
        threshold: Option<u32>,
        #[arg(long)]
        json: bool,
    },

    /// Admit a single file through staging
    Admit {
        store: String,
        file: PathBuf,
        /// Admit even if it collides with existing items
        #[arg(long)]
        force: bool,
        #[arg(long)]
        json: bool,
    },

    /// Flag an item for manual review
    Tweak {
        store: String,
        id: ItemId,
        /// Clear the flag instead
        #[arg(long)]
        clear: bool,
    },

    /// Set field values, e.g. `rating=4`, `fav`, `not fav`
    Set {
        store: String,
        id: ItemId,
        #[arg(required = true)]
        assignments: Vec<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let root = data_root(cli.root)?;

    match cli.command {
        Commands::List => {
            let stores = list_stores(&root)?;
            if stores.is_empty() {
                println!("No stores under {}.", root.display());
            } else {
                println!("🗂️  Stores under {}:", root.display());
                for name in stores {
                    println!("   ▶ {}", name);
                }
            }
        }

        Commands::Init {
            store,
            remote,
            sync_config,
            fields,
        } => {
            let fields = fields
                .iter()
                .map(|raw| parse_field_spec(raw))
                .collect::<Result<Vec<_>>>()?;
            let config = StoreConfig {
                fields,
                sync: remote.map(|remote| SyncSettings {
                    remote,
                    sync_config,
                }),
                ..Default::default()
            };
            let path = root.join(&store);
            Store::create(&path, config)
                .with_context(|| format!("Failed to create store at {}", path.display()))?;
            println!("✅ Created store '{}' at {}", store, path.display());
        }

        Commands::Status { store } => {
            let mut store = open_store(&root, &store)?;
            let status = store.status()?;
            println!("🗂️  {} ({})", status.name, status.root.display());
            println!("   items:   {}", status.items);
            println!("   tweaked: {}", status.tweaked);
            println!("   staged:  {}", status.staged);
            match status.remote {
                Some(remote) => println!("   remote:  {}", remote.display()),
                None => println!("   remote:  (none)"),
            }
        }

        Commands::Sync {
            store,
            no_pull,
            no_push,
            no_stage,
            limit,
            json,
        } => {
            let (_lock, mut store) = open_locked(&root, &store)?;

            let engine = SyncEngine::new(LocalMirror);
            let bar = if json {
                ProgressBar::hidden()
            } else {
                let bar = ProgressBar::new(0);
                bar.set_style(ProgressStyle::with_template(
                    "{spinner:.green} [{bar:30}] {pos}/{len} {msg}",
                )?);
                bar.enable_steady_tick(Duration::from_millis(100));
                bar
            };
            let mut policy = InteractivePolicy::new(engine.cancel_token(), bar.clone());
            let mut hooks = ConsoleHooks::new(engine.cancel_token(), limit, bar.clone());
            let options = SyncOptions {
                pull: !no_pull,
                push: !no_push,
                stage: !no_stage,
            };

            let mut progress = bar.clone();
            match engine.sync(&mut store, options, &mut policy, &mut hooks, &mut progress) {
                Ok(report) => {
                    bar.finish_and_clear();
                    if json {
                        println!("{}", serde_json::to_string_pretty(&report)?);
                    } else {
                        print_sync_report(&report);
                    }
                }
                Err(abort) => {
                    bar.abandon();
                    if json {
                        println!("{}", serde_json::to_string_pretty(&abort.report)?);
                    } else {
                        print_sync_report(&abort.report);
                    }
                    return Err(abort.into());
                }
            }
        }

        Commands::Check { store, json } => {
            let mut store = open_store(&root, &store)?;
            let report = store.scan()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_consistency_report(&report);
            }
        }

        Commands::Dedup {
            store,
            threshold,
            json,
        } => {
            let mut store = open_store(&root, &store)?;
            let report = benchmark("clustering", json, || deduplicate(&mut store, threshold))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else if report.clusters.is_empty() {
                println!(
                    "No duplicates among {} items (threshold {}).",
                    report.scanned, report.threshold
                );
            } else {
                println!(
                    "Found {} duplicate group(s) among {} items (threshold {}):",
                    report.clusters.len(),
                    report.scanned,
                    report.threshold
                );
                for (i, group) in report.clusters.iter().enumerate() {
                    println!("\n✨ Group {}:", i + 1);
                    for item in group {
                        println!("   ▶ {}", describe_item(item));
                    }
                }
            }
        }

        Commands::Admit {
            store,
            file,
            force,
            json,
        } => {
            let (_lock, mut store) = open_locked(&root, &store)?;

            let staged = store
                .copy_to_staging(&file)
                .with_context(|| format!("Failed to stage {}", file.display()))?;
            let resolution = if force {
                Resolution::Force
            } else {
                Resolution::Skip
            };
            let gate = AdmissionGate::new();
            let outcome = gate.admit(&mut store, &staged, &mut FixedPolicy(resolution), &mut ())?;

            if json {
                println!("{}", serde_json::to_string_pretty(&outcome)?);
            } else {
                match &outcome {
                    AdmissionOutcome::Admitted { item, replaced } => {
                        println!("✅ Admitted {} as {}", file.display(), item.file_name());
                        if !replaced.is_empty() {
                            println!("   🗑️  Replaced {:?}", replaced);
                        }
                    }
                    AdmissionOutcome::Failed {
                        reason, detail, ..
                    } => {
                        println!(
                            "⚠️  Not admitted ({}){}; it stays in staging as {}",
                            reason,
                            detail.as_deref().map(|d| format!(": {}", d)).unwrap_or_default(),
                            staged.display()
                        );
                    }
                    AdmissionOutcome::Left { path } => {
                        println!("📦 Left in staging: {}", path.display());
                    }
                }
            }
        }

        Commands::Tweak { store, id, clear } => {
            let (_lock, mut store) = open_locked(&root, &store)?;
            let item = store.mark_tweak(id, !clear)?;
            println!("✅ {}", describe_item(&item));
        }

        Commands::Set {
            store,
            id,
            assignments,
        } => {
            let (_lock, mut store) = open_locked(&root, &store)?;
            let item = store.set_fields(id, assignments.as_slice())?;
            println!("✅ {}", describe_item(&item));
        }
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn data_root(root: Option<PathBuf>) -> Result<PathBuf> {
    match root {
        Some(root) => Ok(root),
        None => Ok(dirs::data_dir()
            .context("Could not determine the data directory; pass --root")?
            .join("hoard")
            .join("stores")),
    }
}

fn open_store(root: &Path, name: &str) -> Result<Store> {
    let path = root.join(name);
    if !path.join(CONFIG_FILE).is_file() {
        anyhow::bail!("No store named '{}' under {}", name, root.display());
    }
    Store::open(&path).with_context(|| format!("Failed to open store {}", path.display()))
}

/// Lock a store, then open it. Opening migrates the index, so it must not
/// happen while another process holds the store.
fn open_locked(root: &Path, name: &str) -> Result<(StoreLock, Store)> {
    let path = root.join(name);
    if !path.join(CONFIG_FILE).is_file() {
        anyhow::bail!("No store named '{}' under {}", name, root.display());
    }
    let lock = StoreLock::acquire(&StoreLayout::new(&path))
        .with_context(|| format!("Could not lock store '{}'", name))?;
    let store = Store::open(&path)
        .with_context(|| format!("Failed to open store {}", path.display()))?;
    Ok((lock, store))
}

/// Parse `key:type[:alias,...]` as given to `init --field`.
fn parse_field_spec(raw: &str) -> Result<FieldSpec> {
    let mut parts = raw.splitn(3, ':');
    let key = parts.next().unwrap_or_default().trim();
    let kind = match parts.next().map(|t| t.trim().to_lowercase()).as_deref() {
        Some("bool") => FieldKind::Bool,
        Some("int") => FieldKind::Int,
        Some(other) => anyhow::bail!("Unknown field type '{}' in '{}'", other, raw),
        None => anyhow::bail!("Field '{}' needs a type (bool or int)", raw),
    };
    let aliases: Vec<String> = parts
        .next()
        .map(|list| {
            list.split(',')
                .map(str::trim)
                .filter(|a| !a.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default();
    Ok(FieldSpec::new(key, kind).with_aliases(aliases))
}

/// Run `f()`, print how long it took (with `label`), and return its result.
fn benchmark<T, F: FnOnce() -> T>(label: &str, quiet: bool, f: F) -> T {
    let start = Instant::now();
    let result = f();
    if !quiet {
        println!("⏱ {} took {:.2?}", label, start.elapsed());
    }
    result
}

fn describe_item(item: &Item) -> String {
    let mut line = item.file_name();
    if item.tweak {
        line.push_str("  [tweak]");
    }
    for (key, value) in &item.fields {
        line.push_str(&format!("  {}={}", key, value));
    }
    line
}

fn print_sync_report(report: &SyncReport) {
    let completed: Vec<String> = report.completed.iter().map(|p| p.to_string()).collect();
    println!("🔄 Phases completed: {}", completed.join(" → "));
    if let Some(pulled) = &report.pulled {
        println!(
            "   ⬇️  Pulled: {} created, {} updated, {} deleted",
            pulled.created, pulled.updated, pulled.deleted
        );
    }
    println!("   🗑️  Deleted (missing on disk): {}", report.deleted);
    println!("   📦 Re-staged (unindexed):     {}", report.restaged);
    if report.rescued > 0 {
        println!("   🛟 Rescued (never pushed):    {}", report.rescued);
    }
    if report.tweaks_restored > 0 {
        println!("   🔧 Local tweaks kept:         {}", report.tweaks_restored);
    }
    println!("   ✅ Staged:                    {}", report.staged);
    if report.replaced > 0 {
        println!("   ♻️  Replaced:                  {}", report.replaced);
    }
    if report.left > 0 {
        println!("   ⏸  Left in staging:           {}", report.left);
    }
    for failure in &report.failed {
        println!(
            "   ⚠️  {} failed ({}){}",
            failure.path.display(),
            failure.reason,
            failure
                .detail
                .as_deref()
                .map(|d| format!(": {}", d))
                .unwrap_or_default()
        );
    }
    for error in &report.decode_errors {
        println!("   ⚠️  {}", error);
    }
    for conflict in &report.conflicts {
        println!("   ❗ {}", conflict);
    }
    if let Some(pushed) = &report.pushed {
        println!(
            "   ⬆️  Pushed: {} created, {} updated, {} deleted",
            pushed.created, pushed.updated, pushed.deleted
        );
    }
    if report.cancelled {
        println!("   ⏹  Staging stopped early.");
    }
}

fn print_consistency_report(report: &ConsistencyReport) {
    if report.is_consistent() {
        println!("✅ Index and contents agree.");
        return;
    }
    for id in &report.missing_on_disk {
        println!("   🗑️  Item {} has no content file", id);
    }
    for path in &report.unindexed {
        println!("   📦 {} is not in the index", path.display());
    }
    for path in &report.partial {
        println!("   🧩 {} is left over from an interrupted transfer", path.display());
    }
    for conflict in &report.conflicts {
        println!("   ❗ {}", conflict);
    }
}

/// Asks on the terminal how to resolve collisions and which fields to set.
struct InteractivePolicy {
    cancel: Arc<AtomicBool>,
    bar: ProgressBar,
}

impl InteractivePolicy {
    fn new(cancel: Arc<AtomicBool>, bar: ProgressBar) -> Self {
        Self { cancel, bar }
    }

    fn print_schema(schema: &FieldSchema) {
        if schema.is_empty() {
            println!("   (this store declares no fields)");
        }
        for field in schema.fields() {
            println!(
                "   {} ({}) aliases: {}",
                field.key,
                field.kind,
                field.aliases.join(", ")
            );
        }
        println!("   commands: done, skip, quit, ?");
    }
}

impl AdmissionPolicy for InteractivePolicy {
    fn resolve(&mut self, candidate: &Path, existing: &[Item]) -> Resolution {
        self.bar.suspend(|| {
            println!("\n⚠️  {} looks like:", candidate.display());
            for item in existing {
                println!("   ▶ {}", describe_item(item));
            }
            let choices = [
                "Replace existing",
                "Skip (keep in staging)",
                "Discard candidate",
                "Admit anyway",
            ];
            let answer = Select::new()
                .with_prompt("Resolve collision")
                .items(&choices)
                .default(1)
                .interact();
            match answer {
                Ok(0) => Resolution::Replace,
                Ok(2) => Resolution::Discard,
                Ok(3) => Resolution::Force,
                Ok(_) => Resolution::Skip,
                Err(e) => {
                    log::warn!("No answer ({}), skipping {}", e, candidate.display());
                    Resolution::Skip
                }
            }
        })
    }

    fn triage(&mut self, candidate: &Path, schema: &FieldSchema) -> Triage {
        let cancel = Arc::clone(&self.cancel);
        self.bar.suspend(|| {
            println!("\n🖼  {}", candidate.display());
            let mut assignments: Vec<Assignment> = Vec::new();
            loop {
                let line = match Input::<String>::new()
                    .with_prompt("fields (empty or 'done' to admit)")
                    .allow_empty(true)
                    .interact_text()
                {
                    Ok(line) => line,
                    Err(e) => {
                        log::warn!("No answer ({}), leaving {} staged", e, candidate.display());
                        cancel.store(true, Ordering::Relaxed);
                        return Triage::Leave;
                    }
                };

                match line.trim() {
                    "" | "done" => return Triage::Admit(assignments),
                    "skip" => return Triage::Leave,
                    "quit" => {
                        cancel.store(true, Ordering::Relaxed);
                        return Triage::Leave;
                    }
                    "?" => Self::print_schema(schema),
                    input => {
                        for part in input.split(',') {
                            match schema.parse_assignment(part) {
                                Ok(assignment) => {
                                    println!("   ✔ {}={}", assignment.key, assignment.value);
                                    assignments.push(assignment);
                                }
                                Err(e) => println!("   ✘ {}", e),
                            }
                        }
                    }
                }
            }
        })
    }
}

/// Reports admissions on the terminal and enforces `--limit`.
struct ConsoleHooks {
    cancel: Arc<AtomicBool>,
    limit: Option<usize>,
    admitted: usize,
    bar: ProgressBar,
}

impl ConsoleHooks {
    fn new(cancel: Arc<AtomicBool>, limit: Option<usize>, bar: ProgressBar) -> Self {
        Self {
            cancel,
            limit,
            admitted: 0,
            bar,
        }
    }
}

impl AdmissionHook for ConsoleHooks {
    fn admitted(&mut self, item: &Item, path: &Path) {
        self.admitted += 1;
        self.bar
            .println(format!("✅ Admitted {} ({})", describe_item(item), path.display()));
        if self.limit.is_some_and(|limit| self.admitted >= limit) {
            self.cancel.store(true, Ordering::Relaxed);
        }
    }

    fn rejected(&mut self, candidate: &Path, reason: &RejectReason) {
        self.bar
            .println(format!("⚠️  Rejected {}: {}", candidate.display(), reason));
    }
}
