use std::{collections::BTreeMap, env::args, path::Path};

use anyhow::{Context as _, anyhow};
use noderun::{
    Config, MapResolver, NodeError, NodeExecutor, NodeSpec, ResolverChain, ReqwestHost,
    ValidationError, Value,
};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::Level;

const CONFIG_ENV: &str = "NODERUN_CONFIG";

/// A node together with the data needed to run it once.
#[derive(Debug, Deserialize)]
struct NodeFile {
    #[serde(flatten)]
    node: NodeSpec,
    #[serde(default)]
    inputs: serde_json::Value,
    /// Served to `#/Variables/<id>/...` references.
    #[serde(default)]
    variables: BTreeMap<String, serde_json::Value>,
    /// Upstream node outputs, served to `#/Nodes/<id>/...` references.
    #[serde(default)]
    outputs: BTreeMap<String, serde_json::Value>,
}

impl NodeFile {
    fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let file = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            _ => serde_yaml::from_str(&contents)?,
        };
        Ok(file)
    }

    fn resolvers(&self) -> ResolverChain {
        let table = |ty: &str, entries: &BTreeMap<String, serde_json::Value>| {
            entries
                .iter()
                .fold(MapResolver::new(ty), |resolver, (id, value)| {
                    resolver.with(id.as_str(), Value::from(value))
                })
        };
        ResolverChain::new()
            .with(table("Variables", &self.variables))
            .with(table("Nodes", &self.outputs))
    }
}

fn init_tracing() -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env()
        .context("failed to read env filter")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

fn load_config() -> anyhow::Result<Config> {
    match std::env::var_os(CONFIG_ENV) {
        Some(path) => Config::load(&path)
            .with_context(|| format!("failed to load config from {}", Path::new(&path).display())),
        None => Ok(Config::default()),
    }
}

fn report(error: &ValidationError) -> anyhow::Error {
    if let Ok(json) = serde_json::to_string_pretty(error) {
        eprintln!("{json}");
    }
    anyhow!("{error}")
}

async fn check(file: &NodeFile) -> anyhow::Result<()> {
    let resolved = noderun::resolve(
        &noderun::Path::root(),
        Some(Value::from(&file.inputs)),
        &file.node.input_schema,
        &file.resolvers(),
    )
    .await
    .map_err(|e| report(&e))?;
    println!(
        "{}",
        serde_json::to_string_pretty(&resolved.unwrap_or_default())?
    );
    Ok(())
}

async fn run(file: &NodeFile, config: &Config) -> anyhow::Result<()> {
    let host = ReqwestHost::with_options(
        config.network.proxy.as_deref(),
        config.network.user_agent.as_deref(),
    )
    .context("failed to build HTTP client")?;
    let executor = NodeExecutor::new(config.sandbox_builder().host(host));

    let cancel = CancellationToken::new();
    let watcher = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, cancelling node");
            watcher.cancel();
        }
    });

    let output = executor
        .invoke(
            &file.node,
            Value::from(&file.inputs),
            &file.resolvers(),
            &cancel,
        )
        .await;
    match output {
        Ok(value) => {
            println!("{}", serde_json::to_string_pretty(&value)?);
            Ok(())
        }
        Err(NodeError::Input(e) | NodeError::Output(e)) => Err(report(&e)),
        Err(e) => Err(e).with_context(|| format!("node {} failed", file.node.id)),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing()?;

    let mut args = args().skip(1);
    let task = args.next();
    let path = args
        .next()
        .ok_or_else(|| anyhow!("usage: noderun <run|check> <node-file>"))?;
    let file = NodeFile::load(Path::new(&path))?;

    match task.as_deref() {
        Some("run") => run(&file, &load_config()?).await,
        Some("check") => check(&file).await,
        _ => Err(anyhow!("unknown task")),
    }
}
