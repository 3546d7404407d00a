//! LogTap command line: run the capture receiver, tap and untap
//! workloads, and inspect or archive captures.
//!
//! This binary stays thin: flag parsing and output formatting live here,
//! everything else is library code.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use kube::Client;

use logtap::advisor::ResourceAdvisor;
use logtap::archive;
use logtap::config::{ForwarderFlavor, ReceiverConfig, SidecarResources, TapConfig};
use logtap::discovery::Discovery;
use logtap::manager::SessionManager;
use logtap::orphan::OrphanReconciler;
use logtap::rbac::{RbacAdvisor, RbacCheck};
use logtap::receiver;
use logtap::session::{is_session_id, new_session_id};
use logtap::workload::WorkloadKind;

#[derive(Parser, Debug)]
#[command(name = "logtap")]
#[command(about = "On-demand log tapping for Kubernetes workloads")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the capture receiver.
    Serve(ServeArgs),
    /// Attach a forwarder sidecar to a workload.
    Tap(TapArgs),
    /// Detach one session from a workload.
    Untap(UntapArgs),
    /// Strip every LogTap artifact from a workload.
    UntapAll(TargetArgs),
    /// List tapped workloads in a namespace.
    Status(NamespaceArgs),
    /// Scan for orphaned sidecars, stale annotations, and receivers.
    Reconcile(NamespaceArgs),
    /// Follow the active data file of a capture directory.
    Tail(TailArgs),
    /// Pack a capture directory into a compressed archive.
    Archive(ArchiveArgs),
    /// Unpack a capture archive.
    Restore(RestoreArgs),
    /// Mine a capture for cross-service error cascades.
    Correlate(CorrelateArgs),
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Ingest listen address.
    #[arg(long, default_value = "0.0.0.0:3100")]
    listen: SocketAddr,

    /// Capture directory.
    #[arg(short, long, default_value = "./capture")]
    dir: PathBuf,

    /// Rotate when the active file would exceed this many bytes.
    #[arg(long, default_value = "67108864")]
    max_file: u64,

    /// Disk cap for the capture directory in bytes (0 disables).
    #[arg(long, default_value = "1073741824")]
    max_disk: u64,

    /// Disable compression of rotated files.
    #[arg(long)]
    no_compress: bool,

    /// Writer queue capacity in entries.
    #[arg(long, default_value = "8192")]
    queue: usize,

    /// Disable redaction.
    #[arg(long)]
    no_redact: bool,

    /// Builtin redaction patterns to enable (default: all).
    #[arg(long = "pattern")]
    patterns: Vec<String>,

    /// Extra redaction patterns from a YAML file.
    #[arg(long)]
    custom_patterns: Option<PathBuf>,

    /// Alert rules YAML file.
    #[arg(long)]
    alert_rules: Option<PathBuf>,

    /// Webhook URLs to notify.
    #[arg(long = "webhook")]
    webhooks: Vec<String>,

    /// Webhook auth: "", "bearer:<token>", or "hmac-sha256:<secret>".
    #[arg(long, default_value = "", env = "LOGTAP_WEBHOOK_AUTH")]
    webhook_auth: String,

    /// Only deliver these webhook events (default: all).
    #[arg(long = "webhook-event")]
    webhook_events: Vec<String>,
}

#[derive(Args, Debug)]
struct TargetArgs {
    /// Workload reference, `kind/name` (e.g. `deployment/api-gw`).
    workload: String,

    /// Namespace of the workload.
    #[arg(short, long, default_value = "default", env = "LOGTAP_NAMESPACE")]
    namespace: String,

    /// Compute the change without writing it.
    #[arg(long)]
    dry_run: bool,
}

#[derive(Args, Debug)]
struct TapArgs {
    #[command(flatten)]
    target_args: TargetArgs,

    /// Receiver address written into the forwarder config, `host:port`.
    #[arg(short, long)]
    target: String,

    /// Session identifier; minted when omitted.
    #[arg(long)]
    session: Option<String>,

    /// Forwarder flavor: `logtap` or `fluent-bit`.
    #[arg(long, default_value = "logtap")]
    flavor: String,

    /// Forwarder image (required for fluent-bit).
    #[arg(long)]
    image: Option<String>,

    /// Skip pre-flight resource and RBAC checks.
    #[arg(long)]
    no_preflight: bool,

    /// Ensure the forwarder log-reader RBAC for this service account.
    #[arg(long)]
    service_account: Option<String>,
}

#[derive(Args, Debug)]
struct UntapArgs {
    #[command(flatten)]
    target_args: TargetArgs,

    /// Session to detach.
    #[arg(long)]
    session: String,
}

#[derive(Args, Debug)]
struct NamespaceArgs {
    /// Namespace to inspect.
    #[arg(short, long, default_value = "default", env = "LOGTAP_NAMESPACE")]
    namespace: String,
}

#[derive(Args, Debug)]
struct TailArgs {
    /// Capture directory to follow.
    dir: PathBuf,

    /// Read the current file from the beginning first.
    #[arg(long)]
    from_start: bool,

    /// Print the last N entries and exit.
    #[arg(long)]
    last: Option<usize>,

    /// Poll interval in milliseconds.
    #[arg(long, default_value = "500")]
    interval_ms: u64,
}

#[derive(Args, Debug)]
struct ArchiveArgs {
    /// Capture directory to pack.
    dir: PathBuf,

    /// Output archive path.
    #[arg(short, long)]
    output: PathBuf,
}

#[derive(Args, Debug)]
struct RestoreArgs {
    /// Archive to unpack.
    archive: PathBuf,

    /// Destination directory.
    #[arg(short, long)]
    output: PathBuf,
}

#[derive(Args, Debug)]
struct CorrelateArgs {
    /// Capture directory to analyze.
    dir: PathBuf,

    /// Correlation window in seconds.
    #[arg(long, default_value = "30")]
    window_secs: u64,
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
        Command::Serve(args) => serve(args).await,
        Command::Tap(args) => tap(args).await,
        Command::Untap(args) => untap(args).await,
        Command::UntapAll(args) => untap_all(args).await,
        Command::Status(args) => status(args).await,
        Command::Reconcile(args) => reconcile(args).await,
        Command::Tail(args) => tail(args).await,
        Command::Archive(args) => {
            archive::pack(&args.dir, &args.output)?;
            println!("packed {} -> {}", args.dir.display(), args.output.display());
            Ok(())
        }
        Command::Restore(args) => {
            archive::unpack(&args.archive, &args.output)?;
            println!(
                "restored {} -> {}",
                args.archive.display(),
                args.output.display()
            );
            Ok(())
        }
        Command::Correlate(args) => correlate(args),
    }
}

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    let cfg = ReceiverConfig {
        listen: args.listen,
        dir: args.dir,
        max_file: args.max_file,
        max_disk: args.max_disk,
        compress: !args.no_compress,
        queue: args.queue,
        redact: !args.no_redact,
        redact_patterns: args.patterns,
        custom_pattern_file: args.custom_patterns,
        alert_rules_file: args.alert_rules,
        webhook_urls: args.webhooks,
        webhook_auth: args.webhook_auth,
        webhook_events: args.webhook_events,
        ..Default::default()
    };
    receiver::run_server(cfg).await
}

async fn tap(args: TapArgs) -> anyhow::Result<()> {
    let (kind, name) = parse_workload_ref(&args.target_args.workload)?;
    let flavor = ForwarderFlavor::parse(&args.flavor)
        .with_context(|| format!("unknown forwarder flavor: {}", args.flavor))?;
    let session = match args.session {
        Some(session) => {
            anyhow::ensure!(is_session_id(&session), "malformed session id: {session}");
            session
        }
        None => new_session_id(),
    };
    let cfg = TapConfig {
        session: session.clone(),
        target: args.target,
        flavor,
        image: args.image,
        resources: SidecarResources::default(),
    };

    let client = Client::try_default()
        .await
        .context("Failed to build Kubernetes client")?;
    let namespace = &args.target_args.namespace;
    let workload = Discovery::new(client.clone())
        .find(kind, &name, namespace)
        .await?;

    if !args.no_preflight {
        let advisor = ResourceAdvisor::new(client.clone());
        match advisor.is_prod_namespace(namespace).await {
            Ok(true) => println!("warning: {namespace} looks like a production namespace"),
            Ok(false) => {}
            Err(e) => tracing::debug!(error = %e, "Production-namespace check failed"),
        }
        for warning in advisor
            .check_resources(
                namespace,
                workload.replicas,
                &cfg.resources.mem_request,
                &cfg.resources.cpu_request,
            )
            .await
        {
            println!("warning: {warning}");
        }

        let rbac = RbacAdvisor::new(client.clone());
        let checks = vec![
            RbacCheck::new("deployments", "update", "apps"),
            RbacCheck::new("statefulsets", "update", "apps"),
            RbacCheck::new("daemonsets", "update", "apps"),
            RbacCheck::new("configmaps", "create", ""),
        ];
        match rbac.check_rbac(namespace, &checks).await {
            Ok(results) => {
                for result in results.iter().filter(|r| !r.allowed) {
                    println!(
                        "warning: missing permission: {} {} ({})",
                        result.check.verb,
                        result.check.resource,
                        if result.check.group.is_empty() {
                            "core"
                        } else {
                            result.check.group.as_str()
                        }
                    );
                }
            }
            Err(e) => tracing::debug!(error = %e, "RBAC preflight failed"),
        }
    }

    if let Some(account) = &args.service_account {
        RbacAdvisor::new(client.clone())
            .ensure_forwarder_rbac(namespace, std::slice::from_ref(account))
            .await
            .context("Failed to ensure forwarder RBAC")?;
    }

    let diff = SessionManager::new(client)
        .inject(&workload, &cfg, args.target_args.dry_run)
        .await?;
    println!("session: {session}");
    if !diff.is_empty() {
        println!("{diff}");
    }
    Ok(())
}

async fn untap(args: UntapArgs) -> anyhow::Result<()> {
    let (kind, name) = parse_workload_ref(&args.target_args.workload)?;
    let client = Client::try_default()
        .await
        .context("Failed to build Kubernetes client")?;
    let workload = Discovery::new(client.clone())
        .find(kind, &name, &args.target_args.namespace)
        .await?;
    let diff = SessionManager::new(client)
        .remove(&workload, &args.session, args.target_args.dry_run)
        .await?;
    if !diff.is_empty() {
        println!("{diff}");
    }
    Ok(())
}

async fn untap_all(args: TargetArgs) -> anyhow::Result<()> {
    let (kind, name) = parse_workload_ref(&args.workload)?;
    let client = Client::try_default()
        .await
        .context("Failed to build Kubernetes client")?;
    let workload = Discovery::new(client.clone())
        .find(kind, &name, &args.namespace)
        .await?;
    let diff = SessionManager::new(client)
        .remove_all(&workload, args.dry_run)
        .await?;
    if !diff.is_empty() {
        println!("{diff}");
    }
    Ok(())
}

async fn status(args: NamespaceArgs) -> anyhow::Result<()> {
    let client = Client::try_default()
        .await
        .context("Failed to build Kubernetes client")?;
    let tapped = Discovery::new(client)
        .list_tapped(&args.namespace)
        .await?;
    if tapped.is_empty() {
        println!("no tapped workloads in {}", args.namespace);
        return Ok(());
    }
    for workload in tapped {
        println!(
            "{} {}/{}: sessions=[{}] target={}",
            workload.kind,
            workload.namespace,
            workload.name,
            workload.tapped_sessions().join(","),
            workload.target().unwrap_or("-"),
        );
    }
    Ok(())
}

async fn reconcile(args: NamespaceArgs) -> anyhow::Result<()> {
    let client = Client::try_default()
        .await
        .context("Failed to build Kubernetes client")?;
    let scan = OrphanReconciler::new(client)
        .scan(&args.namespace, None)
        .await?;
    if scan.is_empty() {
        println!("no orphans in {}", args.namespace);
        return Ok(());
    }
    for orphan in &scan.sidecars {
        println!(
            "orphaned sidecar: {} {}/{} sessions=[{}] target={} reachable={}",
            orphan.kind,
            orphan.namespace,
            orphan.name,
            orphan.sessions.join(","),
            orphan.target,
            orphan.target_reachable,
        );
    }
    for stale in &scan.stale {
        println!(
            "stale annotation: {} {}/{} sessions=[{}]",
            stale.kind,
            stale.namespace,
            stale.name,
            stale.sessions.join(","),
        );
    }
    for receiver in &scan.receivers {
        println!(
            "orphaned receiver: {}/{} age={}s",
            receiver.namespace, receiver.pod, receiver.age_seconds,
        );
    }
    Ok(())
}

async fn tail(args: TailArgs) -> anyhow::Result<()> {
    let mut tailer = if args.from_start {
        logtap::tailer::Tailer::new_from_start(&args.dir)?
    } else {
        logtap::tailer::Tailer::new(&args.dir)?
    };

    if let Some(n) = args.last {
        for entry in tailer.read_last(n)? {
            print_entry(&entry);
        }
        return Ok(());
    }

    let mut interval =
        tokio::time::interval(Duration::from_millis(args.interval_ms.max(10)));
    loop {
        interval.tick().await;
        for entry in tailer.tail()? {
            print_entry(&entry);
        }
    }
}

fn print_entry(entry: &logtap::entry::LogEntry) {
    let talker = logtap::entry::talker_name(&entry.labels).unwrap_or("-");
    println!("{} [{}] {}", entry.ts.to_rfc3339(), talker, entry.msg);
}

fn correlate(args: CorrelateArgs) -> anyhow::Result<()> {
    let correlations =
        archive::correlate(&args.dir, Duration::from_secs(args.window_secs.max(1)))?;
    if correlations.is_empty() {
        println!("no correlated error cascades found");
        return Ok(());
    }
    for c in correlations {
        println!(
            "{} -> {} lag={:.1}s confidence={:.2} pattern={}",
            c.source, c.target, c.lag_seconds, c.confidence, c.pattern,
        );
        println!("  source: {}", c.source_error);
        println!("  target: {}", c.target_error);
    }
    Ok(())
}

/// Parse a `kind/name` workload reference.
fn parse_workload_ref(reference: &str) -> anyhow::Result<(WorkloadKind, String)> {
    let (kind, name) = reference
        .split_once('/')
        .with_context(|| format!("workload reference {reference:?} is not kind/name"))?;
    anyhow::ensure!(!name.is_empty(), "workload reference has an empty name");
    Ok((kind.parse()?, name.to_string()))
}
