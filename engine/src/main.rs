use std::collections::HashMap;
use std::fs;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use conduit_core::{
    deep_merge, parse_cli_overrides, AuthorizationGate, ChannelDispatcher, ConfigStore,
    ExecutionBackend, ExecutionContext, MessageRun, RuntimeState,
};
use conduit_observability::{
    canonical_logs_dir_from_root, emit_event, init_process_logging, ObservabilityEvent, ProcessKind,
};
use conduit_providers::OPENAI_COMPATIBLE_PROVIDERS;
use conduit_tools::web::{fetch_schema, search_schema};
use conduit_types::{
    ConversationId, EngineEvent, MessageAction, MessageId, MessageStatus, ToolCallRequest,
    ToolCallResult, WEB_SEARCH_SERVER,
};

const LOG_RETENTION_DAYS: u64 = 14;

#[derive(Parser, Debug)]
#[command(name = "conduit-engine")]
#[command(about = "Model orchestration with plain-text tool calls")]
struct Cli {
    #[arg(long, global = true)]
    state_dir: Option<String>,
    #[arg(long, global = true)]
    provider: Option<String>,
    #[arg(long, global = true)]
    model: Option<String>,
    /// Configuration override as `key.path=value`; repeatable.
    #[arg(long = "config", global = true, value_name = "KEY=VALUE")]
    config: Vec<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Answer a prompt, running tool calls the model makes.
    Run {
        /// Read from stdin when omitted.
        prompt: Option<String>,
        #[arg(long, default_value_t = false)]
        auto_approve: bool,
    },
    Servers {
        #[command(subcommand)]
        action: ServersCommand,
    },
    /// Print the tool catalog of a server.
    Tools {
        server: String,
        #[arg(long, default_value_t = false)]
        refresh: bool,
    },
    /// Execute one tool call through the backends.
    Call {
        server: String,
        tool: String,
        /// JSON object, `@file` or `-` for stdin.
        #[arg(long, default_value = "{}")]
        args: String,
        #[arg(long, default_value_t = false)]
        auto_approve: bool,
    },
    Cache {
        #[command(subcommand)]
        action: CacheCommand,
    },
}

#[derive(Subcommand, Debug)]
enum ServersCommand {
    List,
    Add {
        name: String,
        /// `stdio:<command>` or an `http(s)://` endpoint.
        transport: String,
        #[arg(long = "header", value_name = "NAME=VALUE")]
        headers: Vec<String>,
        #[arg(long, default_value_t = false)]
        disabled: bool,
    },
    Enable {
        name: String,
    },
    Disable {
        name: String,
    },
    Connect {
        name: String,
    },
    Remove {
        name: String,
    },
}

#[derive(Subcommand, Debug)]
enum CacheCommand {
    Stats,
    Clear,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let provider = normalize_and_validate_provider(cli.provider)?;
    let overrides = build_cli_overrides(&cli.config, provider.clone(), cli.model.clone())?;
    let state_dir = resolve_state_dir(cli.state_dir);
    let process = match cli.command {
        Command::Run { .. } => ProcessKind::Engine,
        _ => ProcessKind::Cli,
    };
    let logs_dir = canonical_logs_dir_from_root(&state_dir);
    let (_log_guard, log_info) = init_process_logging(process, &logs_dir, LOG_RETENTION_DAYS)?;
    emit_event(
        tracing::Level::INFO,
        process,
        ObservabilityEvent::new("logging.initialized", "engine.main")
            .status("ok")
            .detail("jsonl logging initialized"),
    );
    info!("logging initialized: {:?}", log_info);

    let config = ConfigStore::new(project_config_path(), overrides).await?;
    let (dispatcher, actions) = ChannelDispatcher::new();
    let state = RuntimeState::build(&state_dir, config, Arc::new(dispatcher)).await?;

    match cli.command {
        Command::Run {
            prompt,
            auto_approve,
        } => {
            let prompt = match prompt {
                Some(text) => text,
                None => read_stdin()?,
            };
            if prompt.trim().is_empty() {
                anyhow::bail!("prompt is empty");
            }
            let status = run_prompt(&state, prompt, provider, cli.model, auto_approve, actions).await;
            if status == MessageStatus::Error {
                anyhow::bail!("model stream failed; see logs in {}", logs_dir.display());
            }
        }
        Command::Servers { action } => servers_command(&state, action).await?,
        Command::Tools { server, refresh } => {
            let tools = if server == WEB_SEARCH_SERVER {
                vec![search_schema(), fetch_schema()]
            } else if refresh {
                state.catalog.refresh(&server).await?
            } else {
                state.catalog.get_tools(&server).await
            };
            if tools.is_empty() {
                anyhow::bail!("no tools available for `{server}`");
            }
            for tool in tools {
                println!("{}: {}", tool.name, tool.description);
            }
        }
        Command::Call {
            server,
            tool,
            args,
            auto_approve,
        } => {
            let args = match read_tool_json(&args)? {
                Value::Object(map) => map,
                other => anyhow::bail!("tool arguments must be a JSON object, got {other}"),
            };
            let approver = tokio::spawn(answer_authorizations(
                state.gate.clone(),
                state.event_bus.subscribe(),
                auto_approve,
            ));
            let ctx = ExecutionContext::new(
                ConversationId(Uuid::new_v4().to_string()),
                MessageId(Uuid::new_v4().to_string()),
                CancellationToken::new(),
            );
            let request = ToolCallRequest::new(server, tool, args);
            let result = state.backends.execute(&request, &ctx).await;
            approver.abort();
            println!("{}", serde_json::to_string_pretty(&result)?);
            if !result.ok {
                std::process::exit(1);
            }
        }
        Command::Cache { action } => match action {
            CacheCommand::Stats => {
                let stats = json!({
                    "catalog": state.catalog.stats().await,
                    "callHistory": state.history.stats().await,
                });
                println!("{}", serde_json::to_string_pretty(&stats)?);
            }
            CacheCommand::Clear => {
                state.catalog.invalidate(None).await;
                state.history.clear().await;
                println!("cleared tool catalog and call history");
            }
        },
    }

    Ok(())
}

async fn run_prompt(
    state: &RuntimeState,
    prompt: String,
    provider: Option<String>,
    model: Option<String>,
    auto_approve: bool,
    actions: mpsc::UnboundedReceiver<(MessageId, MessageAction)>,
) -> MessageStatus {
    let connected = state.reconnect_all().await;
    tracing::debug!(connected, "startup reconnect finished");
    state.warmer.warm_now(&conduit_runtime::preheat::mentions(&prompt)).await;

    let run = MessageRun::new(
        ConversationId(Uuid::new_v4().to_string()),
        MessageId(Uuid::new_v4().to_string()),
        prompt,
    )
    .with_model(provider, model);

    let printer = tokio::spawn(render_actions(actions));
    let approver = tokio::spawn(answer_authorizations(
        state.gate.clone(),
        state.event_bus.subscribe(),
        auto_approve,
    ));
    let interrupt = {
        let cancel = run.cancel.clone();
        let statuses = state.statuses.clone();
        let message_id = run.message_id.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                statuses.set(&message_id, MessageStatus::Stopped).await;
                cancel.cancel();
            }
        })
    };

    let status = state.orchestrator.run_message(run).await;
    interrupt.abort();
    approver.abort();
    if status == MessageStatus::Stopped {
        printer.abort();
    } else {
        let _ = printer.await;
    }
    status
}

/// Prints answer text on stdout and tool progress on stderr until the message ends.
async fn render_actions(mut actions: mpsc::UnboundedReceiver<(MessageId, MessageAction)>) {
    let mut stdout = std::io::stdout();
    while let Some((_, action)) = actions.recv().await {
        match action {
            MessageAction::TokenAppend { content } => {
                print!("{content}");
                let _ = stdout.flush();
            }
            MessageAction::ThinkStart { mode } => eprintln!("[thinking: {}]", mode.as_str()),
            MessageAction::ThinkAppend { .. } => {}
            MessageAction::ThinkEnd => eprintln!("[thinking done]"),
            MessageAction::ToolHit { server, tool, .. } => eprintln!("\n[tool] {server}.{tool} running"),
            MessageAction::ToolResult {
                server,
                tool,
                result,
                ..
            } => eprintln!("[tool] {server}.{tool} {}", describe_result(&result)),
            MessageAction::StreamEnd { status } => {
                println!();
                if status != MessageStatus::Completed {
                    eprintln!("[message {status:?}]");
                }
                break;
            }
        }
    }
}

fn describe_result(result: &ToolCallResult) -> String {
    if result.ok {
        return if result.cached { "ok (cached)".to_string() } else { "ok".to_string() };
    }
    format!(
        "failed: {}",
        result.error_message.as_deref().unwrap_or("unknown error")
    )
}

/// Resolves pending authorizations, either automatically or by asking on stdin.
async fn answer_authorizations(
    gate: AuthorizationGate,
    mut events: broadcast::Receiver<EngineEvent>,
    auto_approve: bool,
) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return,
        };
        if event.event_type != "authorization.asked" {
            continue;
        }
        let Some(id) = event.properties.get("id").and_then(Value::as_str) else {
            continue;
        };
        let approved = auto_approve || {
            let server = event.properties["server"].as_str().unwrap_or_default();
            let tool = event.properties["tool"].as_str().unwrap_or_default();
            eprint!(
                "\nallow {server}.{tool} with {}? [y/N] ",
                event.properties.get("args").cloned().unwrap_or(Value::Null)
            );
            matches!(
                lines.next_line().await,
                Ok(Some(line)) if matches!(line.trim().to_lowercase().as_str(), "y" | "yes")
            )
        };
        if approved {
            gate.approve(id).await;
        } else {
            gate.reject(id).await;
        }
    }
}

async fn servers_command(state: &RuntimeState, action: ServersCommand) -> anyhow::Result<()> {
    match action {
        ServersCommand::List => {
            let mut servers = state.mcp.list().await.into_values().collect::<Vec<_>>();
            servers.sort_by(|a, b| a.name.cmp(&b.name));
            if servers.is_empty() {
                println!("no servers registered");
            }
            for server in servers {
                let status = if server.enabled { "enabled" } else { "disabled" };
                println!(
                    "{}\t{}\t{}\t{} cached tools",
                    server.name,
                    status,
                    server.transport,
                    server.tool_cache.len()
                );
            }
        }
        ServersCommand::Add {
            name,
            transport,
            headers,
            disabled,
        } => {
            if name == WEB_SEARCH_SERVER {
                anyhow::bail!("`{WEB_SEARCH_SERVER}` is a built-in server name");
            }
            let headers = parse_headers(&headers)?;
            state
                .mcp
                .add_or_update(name.clone(), transport, headers, !disabled)
                .await;
            state.catalog.invalidate(Some(&name)).await;
            println!("saved server `{name}`");
        }
        ServersCommand::Enable { name } => {
            set_enabled(state, &name, true).await?;
        }
        ServersCommand::Disable { name } => {
            set_enabled(state, &name, false).await?;
        }
        ServersCommand::Connect { name } => {
            state
                .catalog
                .connections()
                .ensure_connected(&name)
                .await
                .with_context(|| format!("connecting `{name}`"))?;
            let tools = state.catalog.refresh(&name).await?;
            println!("connected `{name}`: {} tools", tools.len());
        }
        ServersCommand::Remove { name } => {
            if !state.mcp.remove(&name).await {
                anyhow::bail!("unknown server `{name}`");
            }
            state.catalog.invalidate(Some(&name)).await;
            println!("removed `{name}`");
        }
    }
    Ok(())
}

async fn set_enabled(state: &RuntimeState, name: &str, enabled: bool) -> anyhow::Result<()> {
    if !state.mcp.set_enabled(name, enabled).await {
        anyhow::bail!("unknown server `{name}`");
    }
    if !enabled {
        state.catalog.invalidate(Some(name)).await;
    }
    let verb = if enabled { "enabled" } else { "disabled" };
    println!("{verb} `{name}`");
    Ok(())
}

fn supported_provider_ids() -> Vec<&'static str> {
    OPENAI_COMPATIBLE_PROVIDERS
        .iter()
        .map(|(id, ..)| *id)
        .chain(std::iter::once("local"))
        .collect()
}

fn build_cli_overrides(
    pairs: &[String],
    provider: Option<String>,
    model: Option<String>,
) -> anyhow::Result<Option<Value>> {
    if pairs.is_empty() && provider.is_none() && model.is_none() {
        return Ok(None);
    }
    let mut root = parse_cli_overrides(pairs)?;
    let mut flags = serde_json::Map::new();
    if let Some(p) = &provider {
        flags.insert("default_provider".to_string(), Value::String(p.clone()));
        // A provider is only built when it has a config entry.
        let mut entry = serde_json::Map::new();
        if let Some(m) = &model {
            entry.insert("default_model".to_string(), Value::String(m.clone()));
        }
        flags.insert("providers".to_string(), json!({ p.as_str(): entry }));
    }
    if let Some(m) = model {
        flags.insert("default_model".to_string(), Value::String(m));
    }
    deep_merge(&mut root, &Value::Object(flags));
    Ok(Some(root))
}

fn normalize_and_validate_provider(provider: Option<String>) -> anyhow::Result<Option<String>> {
    let Some(provider) = provider else {
        return Ok(None);
    };
    let supported = supported_provider_ids();
    let normalized = provider.trim().to_lowercase();
    if normalized.is_empty() {
        anyhow::bail!(
            "provider cannot be empty. supported providers: {}",
            supported.join(", ")
        );
    }
    if supported.contains(&normalized.as_str()) {
        return Ok(Some(normalized));
    }
    anyhow::bail!(
        "unsupported provider `{}`. supported providers: {}",
        provider,
        supported.join(", ")
    );
}

fn resolve_state_dir(flag: Option<String>) -> PathBuf {
    match flag {
        Some(dir) if !dir.trim().is_empty() => PathBuf::from(dir.trim()),
        _ => conduit_runtime::state_dir(),
    }
}

fn project_config_path() -> PathBuf {
    std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(".conduit")
        .join("config.json")
}

fn read_stdin() -> anyhow::Result<String> {
    let mut buf = String::new();
    std::io::stdin().read_to_string(&mut buf)?;
    Ok(buf)
}

fn read_tool_json(input: &str) -> anyhow::Result<Value> {
    if input.trim() == "-" {
        return Ok(serde_json::from_str(&read_stdin()?)?);
    }
    if let Some(path) = input.strip_prefix('@') {
        let raw = fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
        return Ok(serde_json::from_str(&raw)?);
    }
    Ok(serde_json::from_str(input)?)
}

fn parse_headers(pairs: &[String]) -> anyhow::Result<HashMap<String, String>> {
    pairs
        .iter()
        .map(|pair| {
            let Some((name, value)) = pair.split_once('=') else {
                anyhow::bail!("header `{pair}` must look like NAME=VALUE");
            };
            Ok((name.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}
