use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tokio::signal;
use tracing::{info, warn};
use uuid::Uuid;

use keel_api::{IngressRequest, Keel, KeelConfig, RequestCtx, TlsMaterial};
use keel_core::{AccessLevel, Actor, DeploymentSpec, ErrorKind, KeelError, ResourceKind, SemVer};

#[derive(Parser, Debug)]
#[command(name = "keelctl", version, about = "Keel operator CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Acting user id
    #[arg(long = "as", env = "KEEL_ACTOR", global = true)]
    actor: Option<Uuid>,

    /// Act as an administrator
    #[arg(long = "admin", action = ArgAction::SetTrue, global = true)]
    admin: bool,

    /// Overall request deadline in seconds
    #[arg(long = "timeout", global = true)]
    timeout: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Runtime configuration and collaborators
    Stats,
    /// Live resources owned by the acting user
    Counts,
    /// Namespaces
    #[command(subcommand)]
    Ns(NsCmd),
    /// Deployments and their versions
    #[command(subcommand)]
    Deploy(DeployCmd),
    /// Volumes
    #[command(subcommand)]
    Volume(VolumeCmd),
    /// Ingresses
    #[command(subcommand)]
    Ingress(IngressCmd),
    /// Domain pool (administrators)
    #[command(subcommand)]
    Domain(DomainCmd),
    /// Sharing and restriction
    #[command(subcommand)]
    Access(AccessCmd),
}

#[derive(Subcommand, Debug)]
enum NsCmd {
    Create { label: String, #[arg(long = "tariff")] tariff: String },
    /// Move the namespace to another tariff
    Resize { label: String, #[arg(long = "tariff")] tariff: String },
    Rename { label: String, new_label: String },
    Delete { label: String },
    Get { label: String },
    Ls,
    /// Current usage against the namespace limits
    Usage { label: String },
}

#[derive(Subcommand, Debug)]
enum DeployCmd {
    Create { ns: String, name: String, #[arg(short = 'f', long = "file")] file: String },
    Update { ns: String, name: String, #[arg(short = 'f', long = "file")] file: String },
    Scale { ns: String, name: String, replicas: u32 },
    SetImage { ns: String, name: String, container: String, image: String },
    /// Make an existing version the active one
    Activate { ns: String, name: String, version: SemVer },
    Delete { ns: String, name: String },
    Get { ns: String, name: String },
    Ls { ns: String },
    Versions { ns: String, name: String },
    DeleteVersion { ns: String, name: String, version: SemVer },
    RenameVersion { ns: String, name: String, from: SemVer, to: SemVer },
    /// Diff two versions, or a version against its predecessor
    Diff { ns: String, name: String, version: SemVer, against: Option<SemVer> },
}

#[derive(Subcommand, Debug)]
enum VolumeCmd {
    Create {
        label: String,
        /// Capacity in GiB
        #[arg(long = "capacity")]
        capacity: u64,
        #[arg(long = "replicas", default_value_t = 1)]
        replicas: u32,
        #[arg(long = "persistent", action = ArgAction::SetTrue)]
        persistent: bool,
    },
    Rename { label: String, new_label: String },
    Resize {
        label: String,
        #[arg(long = "capacity")]
        capacity: u64,
        /// Defaults to the current replica count
        #[arg(long = "replicas")]
        replicas: Option<u32>,
    },
    Delete { label: String },
    Attach { ns: String, label: String },
    Detach { ns: String, label: String },
    Get { label: String },
    /// Volumes you can reach, or those attached to `--ns`
    Ls { #[arg(long = "ns")] ns: Option<String> },
}

#[derive(Subcommand, Debug)]
enum IngressCmd {
    Create {
        ns: String,
        name: String,
        #[arg(long = "domain")]
        domain: String,
        #[arg(long = "path", default_value = "/")]
        path: String,
        #[arg(long = "service")]
        service: String,
        #[arg(long = "port")]
        port: u16,
        /// PEM certificate; requires --key
        #[arg(long = "cert", requires = "key")]
        cert: Option<String>,
        #[arg(long = "key", requires = "cert")]
        key: Option<String>,
    },
    Delete { ns: String, name: String },
    Get { ns: String, name: String },
    Ls { ns: String },
}

#[derive(Subcommand, Debug)]
enum DomainCmd {
    Add {
        domain: String,
        #[arg(long = "group", default_value = "default")]
        group: String,
        #[arg(long = "ip")]
        ips: Vec<String>,
    },
    Get { domain: String },
    Ls,
    Delete { domain: String },
}

#[derive(Subcommand, Debug)]
enum AccessCmd {
    Grant { kind: ResourceKind, label: String, subject: Uuid, level: AccessLevel },
    Revoke { kind: ResourceKind, label: String, subject: Uuid },
    /// Cap every record on resources `owner` owns
    Restrict {
        owner: Uuid,
        ceiling: AccessLevel,
        #[arg(long = "kind")]
        kind: Option<ResourceKind>,
    },
    /// Records on one resource (owner only)
    Ls { kind: ResourceKind, label: String },
    /// Records the acting user holds
    Mine,
    /// Whether the acting user reaches `level`
    Check { kind: ResourceKind, label: String, level: AccessLevel },
}

fn init_tracing() {
    let env = std::env::var("KEEL_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics(addr: Option<&str>) {
    let Some(addr) = addr else { return };
    if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
        let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
        match builder.with_http_listener(sock).install() {
            Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
            Err(e) => warn!(error = %e, "failed to install metrics exporter"),
        }
    } else {
        warn!(addr = %addr, "invalid KEEL_METRICS_ADDR; expected host:port");
    }
}

/// Process exit status for a failed operation.
fn exit_code(kind: ErrorKind) -> i32 {
    match kind {
        ErrorKind::Validation => 2,
        ErrorKind::NotFound => 3,
        ErrorKind::AlreadyExists => 4,
        ErrorKind::PermissionDenied => 5,
        ErrorKind::QuotaExceeded => 6,
        ErrorKind::Orchestrator => 7,
        ErrorKind::InconsistentState => 8,
        ErrorKind::Storage => 9,
    }
}

fn command_name(cmd: &Commands) -> &'static str {
    match cmd {
        Commands::Stats => "stats",
        Commands::Counts => "counts",
        Commands::Ns(_) => "ns",
        Commands::Deploy(_) => "deploy",
        Commands::Volume(_) => "volume",
        Commands::Ingress(_) => "ingress",
        Commands::Domain(_) => "domain",
        Commands::Access(_) => "access",
    }
}

fn read_spec(path: &str) -> Result<DeploymentSpec> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path))?;
    // YAML is a superset of JSON, so one parser covers both.
    serde_yaml::from_str(&text).with_context(|| format!("parsing deployment spec {}", path))
}

fn emit<T: Serialize>(out: Output, value: &T, human: impl FnOnce(&T)) -> Result<()> {
    match out {
        Output::Human => human(value),
        Output::Json => println!("{}", serde_json::to_string_pretty(value)?),
    }
    Ok(())
}

fn short(id: &Uuid) -> String {
    id.to_string()[..8].to_string()
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("error: {:#}", e);
            e.downcast_ref::<KeelError>().map(|k| exit_code(k.kind())).unwrap_or(1)
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<()> {
    let config = KeelConfig::from_env()?;
    init_metrics(config.metrics_addr.as_deref());
    let keel = Keel::start(config).await?;
    let coord = keel.coordinator();

    let id = cli.actor.unwrap_or_else(|| {
        warn!("no --as / KEEL_ACTOR given; acting as the nil user");
        Uuid::nil()
    });
    let actor = if cli.admin { Actor::admin(id) } else { Actor::user(id) };
    let mut ctx = RequestCtx::new(actor);
    if let Some(secs) = cli.timeout {
        ctx = ctx.with_timeout(Duration::from_secs(secs));
    }
    let cancel = ctx.cancel.clone();
    let interrupt = tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received; cancelling request");
            cancel.cancel();
        }
    });

    let out = cli.output;
    metrics::counter!("keelctl_commands_total", 1, "command" => command_name(&cli.command));
    let result = match cli.command {
        Commands::Stats => {
            let stats = keel.stats();
            emit(out, &stats, |s| {
                println!("mode: {}  store: {}  orchestrator: {}", s.mode, s.store, s.orchestrator);
                println!("remote timeout: {}s", s.remote_timeout_secs);
                for (name, d) in &s.collaborators {
                    println!("{:<13} {}", name, d);
                }
            })
        }
        Commands::Counts => {
            let c = coord.resource_counts(&ctx)?;
            emit(out, &c, |c| {
                println!("namespaces: {}  volumes: {}  deployments: {}  ingresses: {}", c.namespaces, c.volumes, c.deployments, c.ingresses)
            })
        }
        Commands::Ns(cmd) => ns(&keel, &ctx, out, cmd).await,
        Commands::Deploy(cmd) => deploy(&keel, &ctx, out, cmd).await,
        Commands::Volume(cmd) => volume(&keel, &ctx, out, cmd),
        Commands::Ingress(cmd) => ingress(&keel, &ctx, out, cmd).await,
        Commands::Domain(cmd) => domain(&keel, &ctx, out, cmd),
        Commands::Access(cmd) => access(&keel, &ctx, out, cmd),
    };
    interrupt.abort();
    result
}

async fn ns(keel: &Keel, ctx: &RequestCtx, out: Output, cmd: NsCmd) -> Result<()> {
    let coord = keel.coordinator();
    match cmd {
        NsCmd::Create { label, tariff } => {
            let v = coord.create_namespace(ctx, &label, &tariff).await?;
            emit(out, &v, |v| println!("created namespace {} ({})", v.label, v.namespace.id))
        }
        NsCmd::Resize { label, tariff } => {
            let n = coord.resize_namespace(ctx, &label, &tariff).await?;
            emit(out, &n, |n| println!("namespace {} now cpu={} ram={}", label, n.limits.cpu, n.limits.ram))
        }
        NsCmd::Rename { label, new_label } => {
            let v = coord.rename_namespace(ctx, &label, &new_label)?;
            emit(out, &v, |v| println!("renamed {} -> {}", label, v.label))
        }
        NsCmd::Delete { label } => {
            coord.delete_namespace(ctx, &label).await?;
            emit(out, &label, |l| println!("deleted namespace {}", l))
        }
        NsCmd::Get { label } => {
            let v = coord.get_namespace(ctx, &label)?;
            emit(out, &v, |v| {
                let l = &v.namespace.limits;
                println!("{} ({}) access={:?} tariff={}", v.label, v.namespace.id, v.access, v.namespace.tariff_id.as_deref().unwrap_or("-"));
                println!("limits: cpu={} ram={} ext={} int={} traffic={}", l.cpu, l.ram, l.max_ext_services, l.max_int_services, l.max_traffic);
            })
        }
        NsCmd::Ls => {
            let list = coord.list_namespaces(ctx)?;
            emit(out, &list, |list| {
                println!("LABEL                ACCESS      ID");
                for v in list {
                    println!("{:<20} {:<11} {}", v.label, format!("{:?}", v.access), short(&v.namespace.id));
                }
            })
        }
        NsCmd::Usage { label } => {
            let u = coord.namespace_usage(ctx, &label)?;
            emit(out, &u, |u| {
                println!("cpu={} ram={} ext={} int={}", u.cpu, u.ram, u.ext_services, u.int_services);
                println!("deployments={} ingresses={} volumes={}", u.deployments, u.ingresses, u.volumes);
            })
        }
    }
}

async fn deploy(keel: &Keel, ctx: &RequestCtx, out: Output, cmd: DeployCmd) -> Result<()> {
    let coord = keel.coordinator();
    let show = |v: &keel_core::DeploymentView| match &v.active {
        Some(a) => println!("{} active={} replicas={}", v.deployment.name, a.version, a.spec.replicas),
        None => println!("{} (no active version)", v.deployment.name),
    };
    match cmd {
        DeployCmd::Create { ns, name, file } => {
            let spec = read_spec(&file)?;
            let v = coord.create_deployment(ctx, &ns, &name, spec).await?;
            emit(out, &v, show)
        }
        DeployCmd::Update { ns, name, file } => {
            let spec = read_spec(&file)?;
            let v = coord.update_deployment(ctx, &ns, &name, spec).await?;
            emit(out, &v, show)
        }
        DeployCmd::Scale { ns, name, replicas } => {
            let v = coord.set_replicas(ctx, &ns, &name, replicas).await?;
            emit(out, &v, show)
        }
        DeployCmd::SetImage { ns, name, container, image } => {
            let v = coord.set_container_image(ctx, &ns, &name, &container, &image).await?;
            emit(out, &v, show)
        }
        DeployCmd::Activate { ns, name, version } => {
            let v = coord.change_active_version(ctx, &ns, &name, version).await?;
            emit(out, &v, show)
        }
        DeployCmd::Delete { ns, name } => {
            coord.delete_deployment(ctx, &ns, &name).await?;
            emit(out, &name, |n| println!("deleted deployment {}", n))
        }
        DeployCmd::Get { ns, name } => {
            let v = coord.get_deployment(ctx, &ns, &name)?;
            emit(out, &v, show)
        }
        DeployCmd::Ls { ns } => {
            let list = coord.list_deployments(ctx, &ns)?;
            emit(out, &list, |list| {
                println!("NAME                 ACTIVE    REPLICAS");
                for v in list {
                    let (ver, reps) = match &v.active {
                        Some(a) => (a.version.to_string(), a.spec.replicas.to_string()),
                        None => ("-".into(), "-".into()),
                    };
                    println!("{:<20} {:<9} {}", v.deployment.name, ver, reps);
                }
            })
        }
        DeployCmd::Versions { ns, name } => {
            let list = coord.list_versions(ctx, &ns, &name)?;
            emit(out, &list, |list| {
                for v in list {
                    let mark = if v.active { "*" } else { " " };
                    let images: Vec<_> = v.spec.containers.iter().map(|c| c.image.as_str()).collect();
                    println!("{} {:<9} replicas={} {}", mark, v.version, v.spec.replicas, images.join(","));
                }
            })
        }
        DeployCmd::DeleteVersion { ns, name, version } => {
            coord.delete_version(ctx, &ns, &name, version)?;
            emit(out, &version, |v| println!("deleted version {}", v))
        }
        DeployCmd::RenameVersion { ns, name, from, to } => {
            let v = coord.rename_version(ctx, &ns, &name, from, to)?;
            emit(out, &v, |v| println!("renamed {} -> {}", from, v.version))
        }
        DeployCmd::Diff { ns, name, version, against } => {
            let d = match against {
                Some(b) => coord.diff_versions(ctx, &ns, &name, version, b)?,
                None => coord.diff_previous(ctx, &ns, &name, version)?,
            };
            emit(out, &d, |d| {
                println!("{} -> {}: +{} ~{} -{}", d.from, d.to, d.summary.adds, d.summary.updates, d.summary.removes);
                for line in &d.lines {
                    println!("  {}", line);
                }
            })
        }
    }
}

fn volume(keel: &Keel, ctx: &RequestCtx, out: Output, cmd: VolumeCmd) -> Result<()> {
    let coord = keel.coordinator();
    let show = |v: &keel_api::VolumeView| {
        println!("{} capacity={}GiB replicas={} persistent={} access={:?}", v.label, v.volume.capacity, v.volume.replicas, v.volume.persistent, v.access)
    };
    match cmd {
        VolumeCmd::Create { label, capacity, replicas, persistent } => {
            let v = coord.create_volume(ctx, &label, capacity, replicas, persistent)?;
            emit(out, &v, show)
        }
        VolumeCmd::Rename { label, new_label } => emit(out, &coord.rename_volume(ctx, &label, &new_label)?, show),
        VolumeCmd::Resize { label, capacity, replicas } => {
            let replicas = match replicas {
                Some(r) => r,
                None => coord.get_volume(ctx, &label)?.volume.replicas,
            };
            emit(out, &coord.resize_volume(ctx, &label, capacity, replicas)?, show)
        }
        VolumeCmd::Delete { label } => {
            coord.delete_volume(ctx, &label)?;
            emit(out, &label, |l| println!("deleted volume {}", l))
        }
        VolumeCmd::Attach { ns, label } => {
            coord.attach_volume(ctx, &ns, &label)?;
            emit(out, &label, |l| println!("attached {} to {}", l, ns))
        }
        VolumeCmd::Detach { ns, label } => {
            coord.detach_volume(ctx, &ns, &label)?;
            emit(out, &label, |l| println!("detached {} from {}", l, ns))
        }
        VolumeCmd::Get { label } => emit(out, &coord.get_volume(ctx, &label)?, show),
        VolumeCmd::Ls { ns: Some(ns) } => {
            let list = coord.namespace_volumes(ctx, &ns)?;
            emit(out, &list, |list| {
                for v in list {
                    println!("{:<20} {}GiB x{}", v.label, v.capacity, v.replicas);
                }
            })
        }
        VolumeCmd::Ls { ns: None } => {
            let list = coord.list_volumes(ctx)?;
            emit(out, &list, |list| list.iter().for_each(show))
        }
    }
}

async fn ingress(keel: &Keel, ctx: &RequestCtx, out: Output, cmd: IngressCmd) -> Result<()> {
    let coord = keel.coordinator();
    let show = |i: &keel_core::Ingress| {
        println!("{} {}{} -> {}:{} tls={}", i.name, i.domain, i.path, i.service_name, i.service_port, i.tls)
    };
    match cmd {
        IngressCmd::Create { ns, name, domain, path, service, port, cert, key } => {
            let tls = match (cert, key) {
                (Some(cert), Some(key)) => Some(TlsMaterial {
                    cert: std::fs::read_to_string(&cert).with_context(|| format!("reading {}", cert))?,
                    key: std::fs::read_to_string(&key).with_context(|| format!("reading {}", key))?,
                }),
                _ => None,
            };
            let req = IngressRequest { name, domain, path, service_name: service, service_port: port, tls };
            emit(out, &coord.create_ingress(ctx, &ns, req).await?, show)
        }
        IngressCmd::Delete { ns, name } => {
            coord.delete_ingress(ctx, &ns, &name).await?;
            emit(out, &name, |n| println!("deleted ingress {}", n))
        }
        IngressCmd::Get { ns, name } => emit(out, &coord.get_ingress(ctx, &ns, &name)?, show),
        IngressCmd::Ls { ns } => {
            let list = coord.list_ingresses(ctx, &ns)?;
            emit(out, &list, |list| list.iter().for_each(show))
        }
    }
}

fn domain(keel: &Keel, ctx: &RequestCtx, out: Output, cmd: DomainCmd) -> Result<()> {
    let coord = keel.coordinator();
    let show = |d: &keel_core::Domain| println!("{:<30} group={} ips={}", d.domain, d.group, d.ips.join(","));
    match cmd {
        DomainCmd::Add { domain, group, ips } => emit(out, &coord.add_domain(ctx, &domain, &group, ips)?, show),
        DomainCmd::Get { domain } => emit(out, &coord.get_domain(&domain)?, show),
        DomainCmd::Ls => {
            let list = coord.list_domains()?;
            emit(out, &list, |list| list.iter().for_each(show))
        }
        DomainCmd::Delete { domain } => {
            coord.delete_domain(ctx, &domain)?;
            emit(out, &domain, |d| println!("deleted domain {}", d))
        }
    }
}

fn access(keel: &Keel, ctx: &RequestCtx, out: Output, cmd: AccessCmd) -> Result<()> {
    let coord = keel.coordinator();
    let show = |r: &keel_core::AccessRecord| {
        let limited = if r.limited { " (limited)" } else { "" };
        println!(
            "{:<9} {:<20} subject={} granted={:?} effective={:?}{}",
            r.kind.as_str(), r.resource_label, short(&r.subject), r.access_level, r.new_access_level, limited
        )
    };
    match cmd {
        AccessCmd::Grant { kind, label, subject, level } => {
            emit(out, &coord.grant_access(ctx, kind, &label, subject, level)?, show)
        }
        AccessCmd::Revoke { kind, label, subject } => {
            coord.revoke_access(ctx, kind, &label, subject)?;
            emit(out, &subject, |s| println!("revoked {} on {} {}", s, kind, label))
        }
        AccessCmd::Restrict { owner, ceiling, kind } => {
            let n = coord.restrict_all_access(ctx, owner, kind, ceiling)?;
            emit(out, &n, |n| println!("{} record(s) now capped at {:?}", n, ceiling))
        }
        AccessCmd::Ls { kind, label } => {
            let list = coord.resource_accesses(ctx, kind, &label)?;
            emit(out, &list, |list| list.iter().for_each(show))
        }
        AccessCmd::Mine => {
            let list = coord.my_accesses(ctx)?;
            emit(out, &list, |list| list.iter().for_each(show))
        }
        AccessCmd::Check { kind, label, level } => {
            let ok = coord.authorize(ctx, kind, &label, level)?;
            emit(out, &ok, |ok| println!("{}", if *ok { "allowed" } else { "denied" }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_nested_commands() {
        let cli = Cli::try_parse_from(["keelctl", "--as", "00000000-0000-0000-0000-000000000001", "deploy", "activate", "ns1", "web", "1.2.0"])
            .unwrap();
        match cli.command {
            Commands::Deploy(DeployCmd::Activate { ns, name, version }) => {
                assert_eq!((ns.as_str(), name.as_str()), ("ns1", "web"));
                assert_eq!(version, SemVer::new(1, 2, 0));
            }
            other => panic!("unexpected command {:?}", other),
        }
        assert!(Cli::try_parse_from(["keelctl", "deploy", "activate", "ns1", "web", "1.2"]).is_err());
        assert!(Cli::try_parse_from(["keelctl", "access", "grant", "ns", "ns1", "00000000-0000-0000-0000-000000000002", "readwrite"]).is_ok());
    }

    #[test]
    fn every_error_kind_has_a_distinct_exit_code() {
        let kinds = [
            ErrorKind::Validation,
            ErrorKind::NotFound,
            ErrorKind::AlreadyExists,
            ErrorKind::PermissionDenied,
            ErrorKind::QuotaExceeded,
            ErrorKind::Orchestrator,
            ErrorKind::InconsistentState,
            ErrorKind::Storage,
        ];
        let mut codes: Vec<i32> = kinds.iter().map(|k| exit_code(*k)).collect();
        assert!(codes.iter().all(|c| *c > 1));
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), kinds.len());
    }
}
