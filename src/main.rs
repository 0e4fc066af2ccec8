use anyhow::Result;
use serde_json::Map;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing_subscriber::EnvFilter;

use nexus::agents::{AgentService, CapabilityLanguageModel};
use nexus::capability::providers::ProviderFactoryRegistry;
use nexus::capability::{CapabilityService, CapabilityType};
use nexus::intelligence::AssistantRole;
use nexus::plugins::watcher::PluginWatcher;
use nexus::plugins::{PluginFactoryRegistry, PluginLoader};
use nexus::{NexusConfig, Orchestrator, RequestOptions};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_level(true)
        .init();

    let config = NexusConfig::load()?;

    let mut capabilities =
        CapabilityService::from_config(&config.capability, &ProviderFactoryRegistry::with_builtins());
    capabilities.initialize().await;
    let capabilities = Arc::new(capabilities);

    let llm = Arc::new(CapabilityLanguageModel::new(capabilities.clone()));
    let agents = Arc::new(AgentService::with_defaults(
        config.agents.clone(),
        llm,
        capabilities.clone(),
    ));

    // Plugin classes are compiled in and registered here
    let plugins = Arc::new(PluginLoader::new(
        &config.plugins.directory,
        PluginFactoryRegistry::new(),
    ));
    if let Err(e) = plugins.initialize().await {
        tracing::error!("Plugin loading aborted: {}", e);
    }
    let watcher = config.plugins.hot_reload.then(|| {
        PluginWatcher::new(
            plugins.clone(),
            Duration::from_millis(config.plugins.poll_interval_ms),
        )
        .spawn()
    });

    let orchestrator = Orchestrator::new(capabilities.clone(), agents, plugins.clone(), &config.assistant);

    let args: Vec<String> = std::env::args().skip(1).collect();
    let result = if args.is_empty() {
        repl(&orchestrator).await
    } else {
        let (request, options) = parse_args(&args);
        println!("{}", handle(&orchestrator, &request, &options).await);
        Ok(())
    };

    if let Some(watcher) = watcher {
        watcher.stop().await;
    }
    plugins.shutdown().await;
    capabilities.shutdown().await;
    result
}

/// `--agent <name>` and `--agentic` set options; the rest is the request
fn parse_args(args: &[String]) -> (String, RequestOptions) {
    let mut options = RequestOptions::default();
    let mut words = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--agentic" => options.agentic = true,
            "--agent" => options.agent = iter.next().cloned(),
            "--provider" => options.provider = iter.next().cloned(),
            _ => words.push(arg.as_str()),
        }
    }
    (words.join(" "), options)
}

async fn handle(orchestrator: &Orchestrator, line: &str, options: &RequestOptions) -> String {
    let line = line.trim();
    let (command, rest) = line.split_once(' ').unwrap_or((line, ""));

    match command {
        "/providers" => CapabilityType::ALL
            .iter()
            .map(|capability| {
                format!(
                    "{}: {} (default: {})",
                    capability,
                    orchestrator.capabilities().available_providers(*capability).join(", "),
                    orchestrator
                        .capabilities()
                        .default_provider(*capability)
                        .unwrap_or("none")
                )
            })
            .collect::<Vec<_>>()
            .join("\n"),
        "/agents" => to_pretty(&orchestrator.agents().list_agents()),
        "/tools" => to_pretty(&orchestrator.agents().list_tools()),
        "/plugins" => to_pretty(&orchestrator.plugins().list_plugins().await),
        "/role" => {
            let (role, _) = rest.split_once(' ').unwrap_or((rest, ""));
            match AssistantRole::parse(role) {
                Some(role) => to_pretty(&orchestrator.process_role_request(role, &Map::new()).await),
                None => format!(
                    "Unknown role {:?}; expected one of: {}",
                    role,
                    AssistantRole::ALL.map(|r| r.as_str()).join(", ")
                ),
            }
        }
        "/agent" => {
            let (name, request) = rest.split_once(' ').unwrap_or((rest, ""));
            let options = RequestOptions {
                agent: Some(name.to_string()),
                ..options.clone()
            };
            orchestrator.process_request(request, &options).await.text
        }
        _ => orchestrator.process_request(line, options).await.text,
    }
}

fn to_pretty<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|e| format!("Cannot render output: {}", e))
}

async fn repl(orchestrator: &Orchestrator) -> Result<()> {
    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let options = RequestOptions::default();

    println!("Nexus ready. Commands: /providers /agents /tools /plugins /role <role> /agent <name> <request>, quit to exit");
    loop {
        stdout.write_all(b"nexus> ").await?;
        stdout.flush().await?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "quit" || line == "exit" {
            break;
        }
        println!("{}", handle(orchestrator, line, &options).await);
    }
    Ok(())
}
