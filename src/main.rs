//! kubicd - kubeadm control-plane daemon

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use kubic_control::cluster::KubeadmManager;
use kubic_control::config::{DaemonConfig, DaemonOverrides, DEFAULT_SERVER_NAME, PKI_DIR};
use kubic_control::deploy::tools::CommandTools;
use kubic_control::deploy::{Deployer, Stores};
use kubic_control::gate::audit::TracingAuditSink;
use kubic_control::gate::rbac::RbacPolicy;
use kubic_control::gate::CallGate;
use kubic_control::mtls::ServerMtlsConfig;
use kubic_control::pki::{CertificateAuthority, ADMIN_IDENTITY, CA_FILE_STEM, DAEMON_FILE_STEM};
use kubic_control::reconcile::{Mode, Reconciler};
use kubic_control::service::ControlPlane;
use kubic_control::store::Mechanism;

/// kubicd - control-plane daemon for kubeadm clusters
#[derive(Parser, Debug)]
#[command(name = "kubicd", version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    overrides: OverrideArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

/// Flags that take precedence over the configuration files
#[derive(Args, Debug, Default)]
struct OverrideArgs {
    /// Address to listen on
    #[arg(long, global = true)]
    server: Option<String>,

    /// Port to listen on
    #[arg(long, global = true)]
    port: Option<u16>,

    /// Daemon certificate
    #[arg(long, global = true)]
    cert: Option<PathBuf>,

    /// Daemon private key
    #[arg(long, global = true)]
    key: Option<PathBuf>,

    /// CA that client certificates must chain to
    #[arg(long, global = true)]
    ca: Option<PathBuf>,
}

impl From<OverrideArgs> for DaemonOverrides {
    fn from(args: OverrideArgs) -> Self {
        Self {
            server: args.server,
            port: args.port,
            cert_file: args.cert,
            key_file: args.key,
            ca_file: args.ca,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve the Kubeadm and Deployment services (default mode)
    Serve,

    /// Manage the control-plane PKI
    #[command(subcommand)]
    Pki(PkiCommand),

    /// Run one update pass over all tracked deployments and exit
    ///
    /// Must not run while a daemon is reconciling the same state directory.
    Update {
        /// Re-apply every tracked resource regardless of fingerprints
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand, Debug)]
enum PkiCommand {
    /// Create the CA, the daemon certificate and the admin certificate
    Init {
        /// Directory to write into
        #[arg(long, default_value = PKI_DIR)]
        dir: PathBuf,

        /// Extra subject alternative names for the daemon certificate
        #[arg(long = "san")]
        sans: Vec<String>,
    },

    /// Issue a client certificate for a user
    Issue {
        /// User name; becomes the certificate common name
        user: String,

        /// Directory holding the CA
        #[arg(long, default_value = PKI_DIR)]
        dir: PathBuf,

        /// Directory to write `<user>.crt` and `<user>.key` into
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: failed to install the aws-lc-rs crypto provider: {:?}", e);
        std::process::exit(1);
    }

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let overrides = DaemonOverrides::from(cli.overrides);

    match cli.command {
        Some(Commands::Pki(PkiCommand::Init { dir, sans })) => {
            let config = DaemonConfig::load(overrides)?;
            run_pki_init(&dir, &config.server, sans)
        }
        Some(Commands::Pki(PkiCommand::Issue { user, dir, out })) => {
            run_pki_issue(&user, &dir, out.as_deref().unwrap_or(&dir))
        }
        Some(Commands::Update { force }) => {
            let config = DaemonConfig::load(overrides)?;
            run_update(&config, Mode::from_forced(force)).await
        }
        Some(Commands::Serve) | None => {
            let config = DaemonConfig::load(overrides)?;
            run_serve(config).await
        }
    }
}

fn build_deployer(config: &DaemonConfig) -> Arc<Deployer> {
    let paths = &config.deployment;
    Arc::new(Deployer::new(
        Arc::new(CommandTools::new(&paths.kubeconfig)),
        Stores::on_disk(&paths.state_dir),
        &paths.state_dir,
        &paths.base_dir,
    ))
}

async fn run_serve(config: DaemonConfig) -> anyhow::Result<()> {
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "kubicd starting");

    let addr = config.listen_addr()?;
    let mtls = ServerMtlsConfig::load(&config.tls)?;
    let trust_anchor = mtls.trust_anchor()?;
    let policy = RbacPolicy::load(&config.rbac_file)?;
    let gate = CallGate::new(trust_anchor, Arc::new(policy), Arc::new(TracingAuditSink::new()));

    let deployer = build_deployer(&config);
    // A corrupted store is fatal at startup rather than on the first update.
    for mechanism in Mechanism::ALL {
        let table = deployer.stores().get(mechanism).load().await?;
        tracing::info!(mechanism = mechanism.as_str(), tracked = table.len(), "store loaded");
    }

    let reconciler = Arc::new(Reconciler::new(deployer.tracked_mechanisms()));
    let cluster = Arc::new(KubeadmManager::new(
        &config.deployment.kubeconfig,
        &config.deployment.base_dir,
        deployer.clone(),
    ));

    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_signal(shutdown.clone()));

    if let Some(interval) = config.update_interval {
        tokio::spawn(reconciler.clone().run_every(interval, shutdown.clone()));
    }

    ControlPlane::new(gate, cluster, deployer, reconciler)
        .serve_with_mtls(addr, &mtls, shutdown)
        .await?;

    tracing::info!("kubicd stopped");
    Ok(())
}

async fn cancel_on_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "cannot watch SIGTERM, only Ctrl-C stops the daemon");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    tracing::info!("shutdown requested");
    shutdown.cancel();
}

async fn run_update(config: &DaemonConfig, mode: Mode) -> anyhow::Result<()> {
    let deployer = build_deployer(config);
    let reconciler = Reconciler::new(deployer.tracked_mechanisms());
    let report = reconciler.run(mode).await?;
    println!("{}", report.summary());
    Ok(())
}

fn run_pki_init(dir: &Path, listen_host: &str, extra_sans: Vec<String>) -> anyhow::Result<()> {
    let ca_file = dir.join(format!("{CA_FILE_STEM}.crt"));
    if ca_file.exists() {
        anyhow::bail!(
            "{} already exists; remove it to create a new CA",
            ca_file.display()
        );
    }

    let ca = CertificateAuthority::new("Kubic Control CA")?;
    ca.write_to(dir)
        .with_context(|| format!("writing CA to {}", dir.display()))?;

    let mut sans = vec![DEFAULT_SERVER_NAME.to_string(), "localhost".to_string()];
    if !listen_host.is_empty() && !sans.iter().any(|s| s == listen_host) {
        sans.push(listen_host.to_string());
    }
    for san in extra_sans {
        if !sans.contains(&san) {
            sans.push(san);
        }
    }
    ca.issue_server_cert(&sans)?.write_to(dir, DAEMON_FILE_STEM)?;
    ca.issue_client_cert(ADMIN_IDENTITY)?.write_to(dir, ADMIN_IDENTITY)?;

    tracing::info!(dir = %dir.display(), sans = ?sans, "PKI initialized");
    println!("PKI written to {}", dir.display());
    Ok(())
}

fn run_pki_issue(user: &str, ca_dir: &Path, out: &Path) -> anyhow::Result<()> {
    if user.is_empty() {
        anyhow::bail!("user name must not be empty");
    }

    let ca = CertificateAuthority::load(ca_dir)
        .with_context(|| format!("loading CA from {}", ca_dir.display()))?;
    ca.issue_client_cert(user)?.write_to(out, user)?;

    tracing::info!(%user, out = %out.display(), "client certificate issued");
    println!(
        "wrote {} and {}",
        out.join(format!("{user}.crt")).display(),
        out.join(format!("{user}.key")).display()
    );
    Ok(())
}
