//! Kestrel operator entry point

use anyhow::{Context as _, Result};
use clap::Parser;
use kestrel_jolokia::JolokiaConfig;
use kestrel_operator::{resync_period_or_default, Broker, BrokerSecurity, OperatorBuilder, OperatorConfig};
use tracing::info;
use kube::CustomResourceExt;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "kestrel-operator", version, about = "Operator for clustered ActiveMQ Artemis brokers")]
struct Args {
    /// Periodic health re-check interval (500ms, 30s, 2m, 1h or bare seconds).
    /// Defaults to RECONCILE_RESYNC_PERIOD, then 30s
    #[arg(long)]
    resync_period: Option<String>,

    /// Namespace to watch; empty watches all namespaces. Defaults to WATCH_NAMESPACE
    #[arg(long)]
    watch_namespace: Option<String>,

    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    #[arg(long, env = "JOLOKIA_PORT", default_value_t = 8161)]
    jolokia_port: u16,

    #[arg(long, env = "JOLOKIA_SCHEME", default_value = "http")]
    jolokia_scheme: String,

    #[arg(long, env = "JOLOKIA_TIMEOUT_SECONDS", default_value_t = 10)]
    jolokia_timeout: u64,

    #[arg(long, env = "JOLOKIA_USER")]
    jolokia_user: Option<String>,

    #[arg(long, env = "JOLOKIA_PASSWORD", hide_env_values = true)]
    jolokia_password: Option<String>,

    /// Create missing CRDs on start
    #[arg(long, env = "INSTALL_CRDS")]
    install_crds: bool,

    /// Print both CRDs as YAML and exit
    #[arg(long)]
    print_crds: bool,

    /// Emit logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn jolokia(&self) -> JolokiaConfig {
        let config = JolokiaConfig::new()
            .with_port(self.jolokia_port)
            .with_scheme(&self.jolokia_scheme)
            .with_timeout(self.jolokia_timeout);
        match (&self.jolokia_user, &self.jolokia_password) {
            (Some(user), Some(password)) => config.with_credentials(user, password),
            _ => config,
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn print_crds() -> Result<()> {
    let broker = serde_yaml::to_string(&Broker::crd()).context("serializing Broker CRD")?;
    let security = serde_yaml::to_string(&BrokerSecurity::crd()).context("serializing BrokerSecurity CRD")?;
    print!("{broker}---\n{security}");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_crds {
        return print_crds();
    }

    init_tracing(args.log_json);

    let mut builder = OperatorBuilder::from_config(OperatorConfig::from_env());
    if let Some(raw) = &args.resync_period {
        builder = builder.resync_period(resync_period_or_default(raw));
    }
    if let Some(namespace) = &args.watch_namespace {
        builder = builder.watch_namespace(Some(namespace.trim().to_string()));
    }
    let config = builder.config();
    info!(
        resync_secs = config.resync_period.as_secs(),
        namespace = config.watch_namespace.as_deref().unwrap_or("all"),
        "operator configured"
    );

    let manager = builder
        .health_addr(args.health_addr.clone())
        .jolokia(args.jolokia())
        .install_crds(args.install_crds)
        .build()
        .await
        .context("connecting to the cluster")?;

    manager.run().await.context("operator failed")?;
    Ok(())
}
