//! Operations Center
//!
//! gRPC control plane that provisions, reconciles and clusters a fleet of
//! machines.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use reqwest::Url;
use tokio::net::{TcpListener, UnixListener};
use tokio_util::sync::CancellationToken;
use tonic::service::Routes;
use tonic::transport::Server;
use tracing::{info, warn};

use opscenter_proto::v1::cluster_service_server::ClusterServiceServer;
use opscenter_proto::v1::inventory_service_server::InventoryServiceServer;
use opscenter_proto::v1::provisioning_service_server::ProvisioningServiceServer;
use opscenter_proto::v1::server_service_server::ServerServiceServer;
use opscenter_proto::v1::token_service_server::TokenServiceServer;

use opscenter_core::config::state_dir;
use opscenter_core::tracing_init::init_tracing;
use opscenter_server::auth::{AccessControl, JwtManager, Role};
use opscenter_server::config_store::ConfigStore;
use opscenter_server::ports::{
    HttpClusterTransport, HttpServerTransport, HttpUpdateSource, TerraformProvisioner,
    UpdateSource,
};
use opscenter_server::provisioning::{Fleet, Ports};
use opscenter_server::scheduler::Scheduler;
use opscenter_server::server::{
    ClusterServiceImpl, InventoryServiceImpl, ProvisioningServiceImpl, ServerServiceImpl,
    TokenServiceImpl, access_interceptor,
};
use opscenter_server::storage::FleetDatabase;
use opscenter_server::tls::{
    CertificateStore, IdentitySource, server_config, tls_incoming, unix_incoming,
};

const TERRAFORM_PROVIDER: &str = "lxc/incus";

#[derive(Parser, Debug)]
#[command(name = "opscenter")]
#[command(version, about = "Operations center - fleet provisioning control plane")]
struct Cli {
    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the control plane.
    Serve(ServeArgs),
    /// Mint an operator bearer token.
    IssueToken(IssueTokenArgs),
}

#[derive(clap::Args, Debug)]
struct ServeArgs {
    /// Path to the JSON config file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address for the TLS listener.
    #[arg(long, default_value = "0.0.0.0:7443")]
    addr: SocketAddr,

    /// Path of the local admin socket.
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Path to SQLite database file.
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// JWT secret key.
    #[arg(long, env = "OPSCENTER_JWT_SECRET", default_value = "dev-secret-change-me")]
    jwt_secret: String,

    /// Access token TTL in seconds.
    #[arg(long, default_value_t = 3600)]
    access_ttl: i64,

    /// Path to TLS certificate file (PEM). Generated when omitted.
    #[arg(long, requires = "tls_key")]
    tls_cert: Option<PathBuf>,

    /// Path to TLS private key file (PEM).
    #[arg(long, requires = "tls_cert")]
    tls_key: Option<PathBuf>,
}

#[derive(clap::Args, Debug)]
struct IssueTokenArgs {
    /// Operator the token is issued to.
    #[arg(long)]
    subject: String,

    /// `admin` or `viewer`.
    #[arg(long, default_value = "viewer")]
    role: String,

    /// JWT secret key.
    #[arg(long, env = "OPSCENTER_JWT_SECRET", default_value = "dev-secret-change-me")]
    jwt_secret: String,

    /// Token TTL in seconds.
    #[arg(long, default_value_t = 3600)]
    ttl: i64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing("opscenter_server=info", cli.log_json);

    match cli.command {
        Command::Serve(args) => serve(args).await,
        Command::IssueToken(args) => issue_token(&args),
    }
}

#[allow(clippy::print_stdout)]
fn issue_token(args: &IssueTokenArgs) -> anyhow::Result<()> {
    let role = Role::parse(&args.role)
        .ok_or_else(|| anyhow::anyhow!("Unknown role {:?} (expected admin or viewer)", args.role))?;
    let jwt = JwtManager::new(args.jwt_secret.as_bytes(), args.ttl);
    let (token, exp) = jwt.issue_access_token(&args.subject, role)?;
    info!(subject = %args.subject, ?role, exp, "Issued bearer token");
    println!("{token}");
    Ok(())
}

#[allow(clippy::too_many_lines)]
async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %args.addr,
        "Starting opscenter"
    );

    let state = state_dir().ok_or_else(|| anyhow::anyhow!("Cannot determine home directory"))?;
    let config = ConfigStore::load(args.config.clone())?;
    let snapshot = config.snapshot();

    let db_path = args.db_path.clone().unwrap_or_else(|| state.join("fleet.db"));
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    info!(path = %db_path.display(), "Opening fleet database");
    let db = FleetDatabase::open(&db_path).await?;

    let source = match (&args.tls_cert, &args.tls_key) {
        (Some(cert), Some(key)) => IdentitySource::Files {
            cert_path: cert.clone(),
            key_path: key.clone(),
        },
        _ => IdentitySource::Generated {
            dir: state.join("certs"),
            subject_alt_names: subject_alt_names(&snapshot.public_url),
        },
    };
    let identity = CertificateStore::new(source.load()?);

    let transport_timeout = Duration::from_secs(snapshot.transport_timeout_secs);
    let update_source = match &snapshot.update_source_url {
        Some(url) => {
            Some(Arc::new(HttpUpdateSource::new(url, transport_timeout)?) as Arc<dyn UpdateSource>)
        }
        None => {
            info!("No update source configured, update refresh disabled");
            None
        }
    };
    let ports = Ports {
        server_transport: Arc::new(HttpServerTransport::new(
            identity.clone(),
            transport_timeout,
            snapshot.public_url.clone(),
        )),
        cluster_transport: Arc::new(HttpClusterTransport::new(
            identity.clone(),
            transport_timeout,
        )),
        provisioner: Arc::new(TerraformProvisioner::new(TERRAFORM_PROVIDER)),
        update_source,
    };
    let fleet = Fleet::new(db, config.clone(), identity.clone(), ports);

    let jwt = Arc::new(JwtManager::new(args.jwt_secret.as_bytes(), args.access_ttl));
    let access = access_interceptor(AccessControl::new(config.clone(), jwt));

    let (health_reporter, health_service) = tonic_health::server::health_reporter();
    health_reporter
        .set_serving::<ProvisioningServiceServer<ProvisioningServiceImpl>>()
        .await;
    health_reporter
        .set_serving::<TokenServiceServer<TokenServiceImpl>>()
        .await;
    health_reporter
        .set_serving::<ServerServiceServer<ServerServiceImpl>>()
        .await;
    health_reporter
        .set_serving::<ClusterServiceServer<ClusterServiceImpl>>()
        .await;
    health_reporter
        .set_serving::<InventoryServiceServer<InventoryServiceImpl>>()
        .await;

    // Registration and self-update authenticate through the token and the
    // captured certificate, not the interceptor.
    let routes = Routes::new(health_service)
        .add_service(ProvisioningServiceServer::new(ProvisioningServiceImpl::new(
            fleet.servers.clone(),
        )))
        .add_service(TokenServiceServer::with_interceptor(
            TokenServiceImpl::new(fleet.tokens.clone()),
            access.clone(),
        ))
        .add_service(ServerServiceServer::with_interceptor(
            ServerServiceImpl::new(fleet.servers.clone()),
            access.clone(),
        ))
        .add_service(ClusterServiceServer::with_interceptor(
            ClusterServiceImpl::new(fleet.clusters.clone()),
            access.clone(),
        ))
        .add_service(InventoryServiceServer::with_interceptor(
            InventoryServiceImpl::new(fleet.inventory.clone()),
            access,
        ));

    let shutdown = CancellationToken::new();

    let tcp = TcpListener::bind(args.addr).await?;
    let tls = server_config(&identity)?;
    let tls_server = Server::builder()
        .http2_keepalive_interval(Some(Duration::from_secs(30)))
        .http2_keepalive_timeout(Some(Duration::from_secs(10)))
        .add_routes(routes.clone())
        .serve_with_incoming_shutdown(
            tls_incoming(tcp, tls, shutdown.clone()),
            shutdown.clone().cancelled_owned(),
        );
    info!(addr = %args.addr, "TLS listener ready");

    let socket_path = args.socket.clone().unwrap_or_else(|| state.join("opscenter.sock"));
    let unix = bind_socket(&socket_path)?;
    let local_server = Server::builder()
        .add_routes(routes)
        .serve_with_incoming_shutdown(unix_incoming(unix), shutdown.clone().cancelled_owned());
    info!(path = %socket_path.display(), "Local socket ready");

    let scheduler = Scheduler::start_fleet(&fleet, &snapshot.tasks)?;
    info!(tasks = ?scheduler.task_names(), "Reconciliation scheduler started");

    tokio::spawn(reload_on_sighup(config.clone(), shutdown.clone()));

    let tls_task = tokio::spawn(tls_server);
    let local_task = tokio::spawn(local_server);

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");
    shutdown.cancel();

    let grace = Duration::from_secs(config.snapshot().shutdown_grace_secs);
    for (task, outcome) in scheduler.shutdown(grace).await {
        info!(task, ?outcome, "Task stopped");
    }

    for (listener, handle) in [("tls", tls_task), ("local", local_task)] {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(listener, error = %e, "Listener exited with error"),
            Err(e) => warn!(listener, error = %e, "Listener task panicked"),
        }
    }
    if let Err(e) = std::fs::remove_file(&socket_path) {
        warn!(path = %socket_path.display(), error = %e, "Failed to remove local socket");
    }

    info!("Operations center stopped");
    Ok(())
}

/// Host part of the public URL plus `localhost`.
fn subject_alt_names(public_url: &str) -> Vec<String> {
    let mut names = vec!["localhost".to_string()];
    match Url::parse(public_url) {
        Ok(url) => {
            if let Some(host) = url
                .host_str()
                .map(|h| h.trim_start_matches('[').trim_end_matches(']'))
                .filter(|h| *h != "localhost")
            {
                names.push(host.to_string());
            }
        }
        Err(e) => warn!(
            public_url,
            error = %e,
            "Public URL does not parse, certificate covers localhost only"
        ),
    }
    names
}

/// Bind the admin socket, replacing a stale one from a previous run.
fn bind_socket(path: &Path) -> anyhow::Result<UnixListener> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    Ok(UnixListener::bind(path)?)
}

/// Re-read the config file on every SIGHUP until shutdown.
async fn reload_on_sighup(config: ConfigStore, shutdown: CancellationToken) {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "Cannot install SIGHUP handler, config reload disabled");
            return;
        }
    };
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            received = hangup.recv() => {
                if received.is_none() {
                    break;
                }
                info!("SIGHUP received, reloading configuration");
                // Errors are logged by the store; the previous snapshot stays.
                let _ = config.reload();
            }
        }
    }
}
