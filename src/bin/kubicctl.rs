//! kubicctl - operator client for kubicd

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use kubic_control::client::{into_result, write_private_file, ControlClient};
use kubic_control::cluster::DEFAULT_POD_NETWORK;
use kubic_control::config::{ClientConfig, ClientOverrides};
use kubic_control::proto::{
    AddNodeRequest, DeployFileRequest, DeployHelmRequest, DeployKustomizeRequest, Empty,
    InitRequest, RebootNodeRequest, RemoveNodeRequest, StatusReply, UpdateRequest, Version,
};

/// kubicctl - manage a kubeadm cluster through kubicd
#[derive(Parser, Debug)]
#[command(name = "kubicctl", version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    connection: ConnectionArgs,

    #[command(subcommand)]
    command: Command,
}

/// Connection flags; each overrides `~/.config/kubicctl/kubicctl.conf`
#[derive(Args, Debug)]
struct ConnectionArgs {
    /// kubicd host
    #[arg(long, global = true)]
    server: Option<String>,

    /// kubicd port
    #[arg(long, global = true)]
    port: Option<u16>,

    /// User certificate
    #[arg(long, global = true)]
    cert: Option<PathBuf>,

    /// User private key
    #[arg(long, global = true)]
    key: Option<PathBuf>,

    /// CA the daemon certificate must chain to
    #[arg(long, global = true)]
    ca: Option<PathBuf>,
}

impl From<ConnectionArgs> for ClientOverrides {
    fn from(args: ConnectionArgs) -> Self {
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
enum Command {
    /// Bootstrap the first control-plane node
    Init {
        /// Pod network add-on
        #[arg(long, default_value = DEFAULT_POD_NETWORK)]
        pod_network: String,

        /// Kubernetes version to install
        #[arg(long)]
        kubernetes_version: Option<String>,

        /// API server advertise address
        #[arg(long)]
        advertise_address: Option<String>,

        /// Shared endpoint for multi-master clusters
        #[arg(long)]
        control_plane_endpoint: Option<String>,
    },

    /// Add, remove or reboot nodes
    #[command(subcommand)]
    Node(NodeCommand),

    /// Upgrade the cluster to a Kubernetes version
    Upgrade {
        /// Target version, e.g. 1.31.2
        version: String,
    },

    /// Download the admin kubeconfig
    Kubeconfig {
        /// File to write; stdout when omitted
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Deploy a tracked resource
    #[command(subcommand)]
    Deploy(DeployCommand),

    /// Re-apply tracked resources whose sources changed
    Update {
        /// Re-apply everything regardless of fingerprints
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand, Debug)]
enum NodeCommand {
    /// Join nodes to the cluster
    Add {
        /// Node names
        #[arg(required = true)]
        nodes: Vec<String>,
    },
    /// Drain and remove nodes
    Remove {
        /// Node names
        #[arg(required = true)]
        nodes: Vec<String>,
    },
    /// Drain, reboot and uncordon nodes
    Reboot {
        /// Node names
        #[arg(required = true)]
        nodes: Vec<String>,
    },
}

#[derive(Subcommand, Debug)]
enum DeployCommand {
    /// Apply a manifest file
    File {
        /// Manifest path on the daemon host
        path: String,
    },
    /// Build and apply a kustomize overlay for a known service
    Kustomize {
        /// Service name, e.g. metallb or hello-kubic
        service: String,
        /// Service-specific argument, e.g. the metallb address range
        #[arg(default_value = "")]
        argument: String,
    },
    /// Install a helm chart
    Helm {
        /// Chart reference or path
        chart: String,
        /// Release name; defaults to the chart name
        #[arg(long, default_value = "")]
        release: String,
        /// Values file on the daemon host
        #[arg(long, default_value = "")]
        values: String,
        /// Target namespace
        #[arg(long, default_value = "")]
        namespace: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: failed to install the aws-lc-rs crypto provider: {:?}", e);
        return ExitCode::FAILURE;
    }

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn or_empty(value: Option<String>) -> String {
    value.unwrap_or_default()
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = ClientConfig::load(cli.connection.into())?;
    let mut client = ControlClient::connect(&config).await?;

    match cli.command {
        Command::Init {
            pod_network,
            kubernetes_version,
            advertise_address,
            control_plane_endpoint,
        } => {
            let request = InitRequest {
                pod_network,
                kubernetes_version: or_empty(kubernetes_version),
                advertise_address: or_empty(advertise_address),
                control_plane_endpoint: or_empty(control_plane_endpoint),
            };
            let mut progress = client.kubeadm().init_master(request).await?.into_inner();
            // Progress lines are printed as they arrive; the last reply is the result.
            let mut last: Option<StatusReply> = None;
            while let Some(reply) = progress.message().await? {
                if let Some(previous) = last.replace(reply) {
                    println!("{}", previous.message);
                }
            }
            match last {
                Some(reply) => print_result(reply),
                None => anyhow::bail!("kubicd closed the stream without a result"),
            }
        }
        Command::Node(node) => {
            let reply = match node {
                NodeCommand::Add { nodes } => {
                    client
                        .kubeadm()
                        .add_node(AddNodeRequest { node_names: nodes })
                        .await?
                }
                NodeCommand::Remove { nodes } => {
                    client
                        .kubeadm()
                        .remove_node(RemoveNodeRequest { node_names: nodes })
                        .await?
                }
                NodeCommand::Reboot { nodes } => {
                    client
                        .kubeadm()
                        .reboot_node(RebootNodeRequest { node_names: nodes })
                        .await?
                }
            };
            print_result(reply.into_inner())
        }
        Command::Upgrade { version } => {
            let reply = client
                .kubeadm()
                .upgrade_kubernetes(Version { version })
                .await?;
            print_result(reply.into_inner())
        }
        Command::Kubeconfig { output } => {
            let reply = client.kubeadm().fetch_kubeconfig(Empty {}).await?;
            let kubeconfig = into_result(reply.into_inner())?;
            match output {
                Some(path) => {
                    write_private_file(&path, &kubeconfig)?;
                    eprintln!("kubeconfig written to {}", path.display());
                }
                None => print!("{kubeconfig}"),
            }
            Ok(())
        }
        Command::Deploy(deploy) => {
            let reply = match deploy {
                DeployCommand::File { path } => {
                    client
                        .deployment()
                        .deploy_file(DeployFileRequest { path })
                        .await?
                }
                DeployCommand::Kustomize { service, argument } => {
                    client
                        .deployment()
                        .deploy_kustomize(DeployKustomizeRequest { service, argument })
                        .await?
                }
                DeployCommand::Helm {
                    chart,
                    release,
                    values,
                    namespace,
                } => {
                    client
                        .deployment()
                        .deploy_helm(DeployHelmRequest {
                            chart,
                            release_name: release,
                            values_path: values,
                            namespace,
                        })
                        .await?
                }
            };
            print_result(reply.into_inner())
        }
        Command::Update { force } => {
            let reply = client
                .deployment()
                .update_all(UpdateRequest { forced: force })
                .await?;
            print_result(reply.into_inner())
        }
    }
}

fn print_result(reply: StatusReply) -> anyhow::Result<()> {
    let message = into_result(reply)?;
    println!("{message}");
    Ok(())
}
