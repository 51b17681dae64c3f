mod hardening;
mod tty;
mod watch;

use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use keyshare_core::config::{self, Config, StoreBackend};
use keyshare_core::{CredentialEntry, CredentialId, CredentialStore};
use keyshare_import::{
    BundleSource, ImportOptions, ImportOutcome, ImportPipeline, ImportReport, LocalFiles,
};
use keyshare_vfs::{NodeId, VirtualFs, VirtualNode};
use tracing_subscriber::EnvFilter;

use crate::tty::TtyPrompt;

/// Global flags accepted anywhere on the command line.
struct GlobalArgs {
    config_path: PathBuf,
    verbose: bool,
    /// Everything that is not a global flag, command first.
    rest: Vec<String>,
}

fn parse_global_args(args: Vec<String>) -> Result<GlobalArgs> {
    let mut config_path = None;
    let mut verbose = false;
    let mut rest = Vec::with_capacity(args.len());
    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-c" | "--config" => {
                let value = iter.next().context("--config needs a path")?;
                config_path = Some(PathBuf::from(value));
            }
            "-v" | "--verbose" => verbose = true,
            _ => match arg.strip_prefix("--config=") {
                Some(value) => config_path = Some(PathBuf::from(value)),
                None => rest.push(arg),
            },
        }
    }
    Ok(GlobalArgs {
        config_path: config_path.unwrap_or_else(config::default_config_path),
        verbose,
        rest,
    })
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    // Piping output to `head` should exit quietly, not panic on EPIPE.
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
    }

    let globals = parse_global_args(std::env::args().skip(1).collect())?;
    init_logging(globals.verbose);

    let cmd = globals.rest.first().map(String::as_str).unwrap_or("help");
    let args = globals.rest.get(1..).unwrap_or_default();

    if matches!(cmd, "help" | "--help" | "-h") {
        print_help();
        return Ok(());
    }

    let config = config::load(&globals.config_path)?;
    tracing::debug!(path = %globals.config_path.display(), "config loaded");

    match cmd {
        "import" => cmd_import(&config, args).await,
        "list" => cmd_list(&config),
        "show" => cmd_show(&config, args),
        "remove" | "rm" => cmd_remove(&config, args),
        "clear" => cmd_clear(&config),
        "ls" => cmd_ls(&config),
        "cat" => cmd_cat(&config, args),
        "export" => cmd_export(&config, args),
        "mount" => cmd_mount(&config, args).await,
        other => {
            eprintln!("unknown command: {other}");
            print_help();
            std::process::exit(1);
        }
    }
}

fn print_help() {
    println!(
        "\
keyshare - import PKCS#12 bundles and browse them as files

USAGE:
    keyshare [-c <config>] [-v] <command> [args...]

COMMANDS:
    import <file>... [--delete] [--no-skip] [--no-discard] [--json]
                                Import bundles, prompting for each password
    list                        List installed credentials
    show <id>                   Show one credential (full id or unique prefix)
    remove <id>                 Remove a credential (alias: rm)
    clear                       Remove every credential
    ls                          List the virtual folder
    cat <node>                  Write a virtual file to stdout
    export <node> [dir]         Write a virtual file to disk (mode 0600)
    mount [dir]                 Mount the virtual folder read-only via FUSE
    help                        Show this help

FLAGS:
    -c, --config <path>         Config file (default: ~/.config/keyshare/config.toml)
    -v, --verbose               Debug logging (RUST_LOG overrides)
    --delete                    Delete each bundle file after a successful import
    --no-skip                   Do not offer 'skip' at the prompt
    --no-discard                Do not offer 'delete without importing' at the prompt
    --json                      Print import reports as JSON

NODES:
    <node> is a node id from 'keyshare ls' or a filename such as 'Alice.zip'.

EXAMPLES:
    keyshare import ~/Downloads/alice.p12 --delete
    keyshare ls
    keyshare cat 'Alice Example.json'
    keyshare export 'Alice Example.zip' /tmp/out
    keyshare mount"
    );
}

fn open_store(config: &Config) -> Result<Arc<dyn CredentialStore>> {
    keyshare_store::open_configured(&config.store).context("open credential store")
}

// ---------------------------------------------------------------------------
// import
// ---------------------------------------------------------------------------

struct ImportArgs {
    options: ImportOptions,
    json: bool,
    sources: Vec<BundleSource>,
}

fn parse_import_args(mut options: ImportOptions, args: &[String]) -> Result<ImportArgs> {
    let mut json = false;
    let mut sources = Vec::new();
    for arg in args {
        match arg.as_str() {
            "--delete" => options.delete_after_import = true,
            "--no-skip" => options.allow_skip = false,
            "--no-discard" => options.allow_discard = false,
            "--json" => json = true,
            flag if flag.starts_with("--") => bail!("unknown import flag: {flag}"),
            path => sources.push(BundleSource::new(path)),
        }
    }
    if sources.is_empty() {
        bail!("usage: keyshare import <file>... [--delete] [--no-skip] [--no-discard] [--json]");
    }
    Ok(ImportArgs {
        options,
        json,
        sources,
    })
}

async fn cmd_import(config: &Config, args: &[String]) -> Result<()> {
    let ImportArgs {
        options,
        json,
        sources,
    } = parse_import_args(ImportOptions::from_config(config), args)?;

    hardening::harden_process();

    let store = open_store(config)?;
    let prompt = Arc::new(TtyPrompt::new(config.prompt.reveal_password));
    let pipeline = ImportPipeline::new(store, prompt, Arc::new(LocalFiles), options);
    let reports = pipeline.import_all(sources).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    } else {
        for report in &reports {
            print_report(report);
        }
    }

    let failed = reports
        .iter()
        .filter(|r| matches!(r.outcome, ImportOutcome::Failed { .. }))
        .count();
    if failed > 0 {
        bail!("{failed} of {} import(s) failed", reports.len());
    }
    Ok(())
}

fn print_report(report: &ImportReport) {
    let name = report.source.display();
    match &report.outcome {
        ImportOutcome::Installed => {
            let ids: Vec<&str> = report.installed.iter().map(CredentialId::short).collect();
            let deleted = if report.source_deleted {
                ", source deleted"
            } else {
                ""
            };
            println!(
                "{name}: installed {} credential(s) [{}]{deleted}",
                ids.len(),
                ids.join(", ")
            );
            if let Some(err) = &report.cleanup_error {
                println!("{name}: warning: could not delete source: {err}");
            }
        }
        ImportOutcome::Canceled => println!("{name}: canceled"),
        ImportOutcome::Skipped => println!("{name}: skipped"),
        ImportOutcome::Discarded => println!("{name}: deleted without importing"),
        ImportOutcome::Failed { kind, message } => {
            println!("{name}: failed ({}): {message}", kind.as_str());
        }
    }
}

// ---------------------------------------------------------------------------
// Store commands
// ---------------------------------------------------------------------------

fn trunc(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let mut out: String = s.chars().take(max.saturating_sub(1)).collect();
        out.push('…');
        out
    }
}

fn cmd_list(config: &Config) -> Result<()> {
    const MAX_NAME: usize = 32;
    const MAX_ISSUER: usize = 40;

    let entries = open_store(config)?.list();
    if entries.is_empty() {
        println!("no credentials installed");
        return Ok(());
    }

    let w_name = entries
        .iter()
        .map(|e| e.friendly_name.chars().count().min(MAX_NAME))
        .max()
        .unwrap_or(0)
        .max("NAME".len());
    let w_issuer = entries
        .iter()
        .map(|e| e.issuer.chars().count().min(MAX_ISSUER))
        .max()
        .unwrap_or(0)
        .max("ISSUER".len());

    println!(
        "{:<8}  {:<w_name$}  {:<w_issuer$}  {:<3}  NOT AFTER",
        "ID", "NAME", "ISSUER", "KEY"
    );
    println!("{}", "-".repeat(8 + 2 + w_name + 2 + w_issuer + 2 + 3 + 2 + 9));
    for e in &entries {
        println!(
            "{:<8}  {:<w_name$}  {:<w_issuer$}  {:<3}  {}",
            e.id.short(),
            trunc(&e.friendly_name, MAX_NAME),
            trunc(&e.issuer, MAX_ISSUER),
            if e.has_private_key { "yes" } else { "no" },
            e.not_after,
        );
    }
    Ok(())
}

/// Resolve a full id or a unique prefix of one.
fn find_entry(store: &dyn CredentialStore, query: &str) -> Result<CredentialEntry> {
    let entries = store.list();
    if let Some(id) = CredentialId::parse(query) {
        return entries
            .into_iter()
            .find(|e| e.id == id)
            .with_context(|| format!("no credential with id {id}"));
    }

    let prefix = query.trim().to_ascii_lowercase();
    if prefix.is_empty() {
        bail!("empty credential id");
    }
    let mut matches = entries
        .into_iter()
        .filter(|e| e.id.as_str().starts_with(&prefix));
    match (matches.next(), matches.next()) {
        (Some(entry), None) => Ok(entry),
        (None, _) => bail!("no credential matches '{query}'"),
        (Some(_), Some(_)) => bail!("'{query}' is ambiguous, use more characters"),
    }
}

fn one_arg<'a>(args: &'a [String], usage: &str) -> Result<&'a str> {
    match args {
        [arg] => Ok(arg.as_str()),
        _ => bail!("usage: keyshare {usage}"),
    }
}

fn cmd_show(config: &Config, args: &[String]) -> Result<()> {
    let query = one_arg(args, "show <id>")?;
    let store = open_store(config)?;
    let entry = find_entry(store.as_ref(), query)?;
    println!("{}", serde_json::to_string_pretty(&entry)?);
    Ok(())
}

fn cmd_remove(config: &Config, args: &[String]) -> Result<()> {
    let query = one_arg(args, "remove <id>")?;
    let store = open_store(config)?;
    let entry = find_entry(store.as_ref(), query)?;
    store
        .delete(&entry.id)
        .with_context(|| format!("remove {}", entry.id))?;
    println!("removed {} ({})", entry.friendly_name, entry.id.short());
    Ok(())
}

fn cmd_clear(config: &Config) -> Result<()> {
    let removed = open_store(config)?.clear().context("clear store")?;
    println!("removed {removed} credential(s)");
    Ok(())
}

// ---------------------------------------------------------------------------
// Virtual filesystem commands
// ---------------------------------------------------------------------------

fn open_vfs(config: &Config) -> Result<VirtualFs> {
    Ok(VirtualFs::new(open_store(config)?))
}

/// Accept a node id or a root filename.
fn resolve_node(vfs: &VirtualFs, query: &str) -> Result<VirtualNode> {
    let node = match NodeId::parse(query) {
        Some(id) => vfs.metadata(&id),
        None => vfs.lookup(query),
    };
    node.with_context(|| format!("no such node: {query}"))
}

fn cmd_ls(config: &Config) -> Result<()> {
    let vfs = open_vfs(config)?;
    let snapshot = vfs.enumerate(&NodeId::root())?;
    for node in &snapshot.nodes {
        println!("{:>8}  {}  {}", node.size, node.id, node.filename);
    }
    tracing::debug!(
        generation = snapshot.generation,
        nodes = snapshot.len(),
        "enumerated root"
    );
    Ok(())
}

fn cmd_cat(config: &Config, args: &[String]) -> Result<()> {
    let query = one_arg(args, "cat <node>")?;
    hardening::harden_process();
    let vfs = open_vfs(config)?;
    let node = resolve_node(&vfs, query)?;
    let bytes = vfs.materialize(&node.id)?;
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(&bytes)?;
    stdout.flush()?;
    Ok(())
}

fn cmd_export(config: &Config, args: &[String]) -> Result<()> {
    let (query, dir) = match args {
        [query] => (query.as_str(), config.export.resolved_transient_dir()),
        [query, dir] => (query.as_str(), PathBuf::from(dir)),
        _ => bail!("usage: keyshare export <node> [dir]"),
    };
    hardening::harden_process();
    let vfs = open_vfs(config)?;
    let node = resolve_node(&vfs, query)?;
    let path = vfs.materialize_to(&node.id, &dir)?;
    println!("{}", path.display());
    Ok(())
}

async fn cmd_mount(config: &Config, args: &[String]) -> Result<()> {
    let mountpoint = match args {
        [] => config
            .mount
            .resolved_mountpoint()
            .context("no mountpoint given and XDG_RUNTIME_DIR is not set")?,
        [dir] => PathBuf::from(dir),
        _ => bail!("usage: keyshare mount [dir]"),
    };

    hardening::harden_process();
    let store = open_store(config)?;
    if config.store.backend == StoreBackend::File {
        if let Some(path) = config.store.resolved_path() {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                if let Err(e) = watch::store_watcher(store, path).await {
                    tracing::warn!("store watcher stopped, external changes will not show: {e}");
                }
            });
        }
    }
    let vfs = Arc::new(VirtualFs::new(store));
    let mut watcher = vfs.watch();
    let handle = keyshare_fuse::mount(Arc::clone(&vfs), &mountpoint, &config.mount.fs_name)?;
    tracing::info!(mountpoint = %handle.mountpoint().display(), "mounted, ctrl-c to unmount");

    tokio::select! {
        _ = shutdown_signal() => {}
        _ = log_changes(&mut watcher) => {}
    }

    drop(handle);
    tracing::info!(mountpoint = %mountpoint.display(), "unmounted");
    Ok(())
}

/// Runs until the store goes away.
async fn log_changes(watcher: &mut keyshare_vfs::ChangeWatcher) {
    while let Some(generation) = watcher.changed().await {
        tracing::info!(generation, "credential store changed");
    }
}

/// Wait for ctrl-c (SIGINT) or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!("failed to register SIGTERM handler: {e}, falling back to SIGINT only");
            ctrl_c.await.ok();
        }
    }
}
