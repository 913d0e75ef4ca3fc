use std::sync::Arc;

use anyhow::{bail, Context};
use colored::Colorize;
use serde_json::json;
use speckle_codec::{BaseDeserializer, DeserializerOptions, MissingReferencePolicy};
use speckle_hash::ContentHasher;
use speckle_model::TypeRegistry;
use speckle_pipeline::{CancelToken, Operations, Progress, Received, SendResult};
use speckle_remote::ServerTransport;
use speckle_server::SpeckleServer;
use speckle_transport::{MemoryStore, ObjectStore, SqliteStore};
use speckle_types::{wire, ObjectId};
use tracing::{debug, warn};

use crate::cli::*;
use crate::config::CliConfig;

pub async fn run_command(cli: Cli) -> anyhow::Result<()> {
    let mut config = CliConfig::load(cli.config.as_deref())?;
    match cli.command {
        Command::Send(args) => {
            config.apply(&args.endpoint);
            cmd_send(args, config, cli.format).await
        }
        Command::Receive(args) => {
            config.apply(&args.endpoint);
            cmd_receive(args, config, cli.format).await
        }
        Command::Inspect(args) => cmd_inspect(args, config, cli.format).await,
        Command::Serve(args) => cmd_serve(args, config).await,
    }
}

fn parse_id(raw: &str) -> anyhow::Result<ObjectId> {
    ObjectId::from_hex(raw.trim()).with_context(|| format!("{raw:?} is not an object id"))
}

fn remote_store(config: &CliConfig) -> anyhow::Result<Option<Arc<dyn ObjectStore>>> {
    let Some(account) = &config.account else {
        return Ok(None);
    };
    let stream = config
        .stream
        .as_deref()
        .context("a stream id is required when a server is configured")?;
    let transport = ServerTransport::new(account, stream, config.remote.clone())?;
    Ok(Some(Arc::new(transport)))
}

fn cache_store(config: &CliConfig) -> anyhow::Result<Option<Arc<SqliteStore>>> {
    if !config.cache.enabled {
        return Ok(None);
    }
    let path = config.cache.resolved_path()?;
    debug!(path = %path.display(), "opening cache");
    Ok(Some(Arc::new(SqliteStore::open(path, config.cache.sqlite.clone())?)))
}

fn cancel_on_interrupt() -> CancelToken {
    let cancel = CancelToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, canceling");
            token.cancel();
        }
    });
    cancel
}

fn log_progress() -> Progress {
    Progress::new(|e| debug!(stage = %e.stage, count = e.count, total = ?e.total, "progress"))
}

pub async fn send_document(args: &SendArgs, config: &CliConfig) -> anyhow::Result<SendResult> {
    let registry = Arc::new(TypeRegistry::with_builtins());
    let text = std::fs::read_to_string(&args.input).with_context(|| format!("reading {}", args.input.display()))?;
    let root = BaseDeserializer::new(registry.clone(), DeserializerOptions::default())
        .decode_document(&text)
        .with_context(|| format!("decoding {}", args.input.display()))?;

    let mut send_options = config.send.clone();
    send_options.track_detached_children |= args.track;
    let ops = Operations::with_options(registry, send_options, config.receive.clone());

    let cache = cache_store(config)?;
    let mut targets: Vec<Arc<dyn ObjectStore>> = Vec::new();
    if let Some(remote) = remote_store(config)? {
        targets.push(remote);
    }
    if let Some(cache) = &cache {
        targets.push(cache.clone());
    }
    if targets.is_empty() {
        bail!("nowhere to send to: configure a server or enable the cache");
    }

    let result = ops.send(root, &targets, &cancel_on_interrupt(), &log_progress()).await?;
    if let Some(cache) = cache {
        cache.close().await?;
    }
    Ok(result)
}

async fn cmd_send(args: SendArgs, config: CliConfig, format: OutputFormat) -> anyhow::Result<()> {
    let result = send_document(&args, &config).await?;
    match format {
        OutputFormat::Json => {
            let targets: Vec<_> = result
                .targets
                .iter()
                .map(|t| json!({"name": t.name, "uploaded": t.uploaded, "skipped": t.skipped, "blobs": t.blobs_uploaded}))
                .collect();
            let out = json!({
                "root": result.root_id,
                "fragments": result.fragment_count,
                "bytes": result.total_bytes,
                "targets": targets,
                "tracked": result.tracked,
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        OutputFormat::Text => {
            println!("{} Sent {}", "✓".green().bold(), result.root_id.to_hex().yellow());
            println!("  Fragments: {} ({} bytes)", result.fragment_count, result.total_bytes);
            for t in &result.targets {
                println!(
                    "  {}: {} uploaded, {} already present, {} blobs",
                    t.name.bold(),
                    t.uploaded.to_string().green(),
                    t.skipped,
                    t.blobs_uploaded
                );
            }
            for (application_id, reference) in &result.tracked {
                println!("  {} {} -> {}", "tracked".cyan(), application_id, reference.referenced_id.short_hex());
            }
        }
    }
    Ok(())
}

pub async fn receive_object(args: &ReceiveArgs, config: &CliConfig) -> anyhow::Result<(Received, Option<String>)> {
    let id = parse_id(&args.id)?;
    let mut receive_options = config.receive.clone();
    if args.tolerant {
        receive_options.missing_references = MissingReferencePolicy::Tolerant;
    }
    if let Some(dir) = &args.blob_dir {
        receive_options.blob_dir = Some(dir.clone());
    }
    let ops = Operations::with_options(Arc::new(TypeRegistry::with_builtins()), config.send.clone(), receive_options);

    let cache = cache_store(config)?;
    let local: Arc<dyn ObjectStore> = match &cache {
        Some(cache) => cache.clone(),
        None => Arc::new(MemoryStore::named("memory")),
    };
    let remote = remote_store(config)?;
    let received = ops
        .receive(id, &local, remote.as_ref(), &cancel_on_interrupt(), &log_progress())
        .await?;

    let root_json = if args.print { local.get(&id).await? } else { None };
    if let Some(cache) = cache {
        cache.close().await?;
    }
    Ok((received, root_json))
}

async fn cmd_receive(args: ReceiveArgs, config: CliConfig, format: OutputFormat) -> anyhow::Result<()> {
    let (received, root_json) = receive_object(&args, &config).await?;
    match format {
        OutputFormat::Json => {
            let root: serde_json::Value = match &root_json {
                Some(json) => serde_json::from_str(json)?,
                None => serde_json::Value::Null,
            };
            let out = json!({
                "root": received.root.id(),
                "speckle_type": received.root.speckle_type(),
                "fragments": received.fragments,
                "from_cache": received.from_cache,
                "downloaded": received.downloaded,
                "absent": received.absent,
                "blobs": received.blobs_downloaded,
                "object": root,
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        OutputFormat::Text => {
            println!("{} Received {} ({})", "✓".green().bold(), args.id.yellow(), received.root.speckle_type().cyan());
            println!(
                "  Fragments: {} ({} cached, {} downloaded)",
                received.fragments, received.from_cache, received.downloaded
            );
            if received.absent > 0 {
                println!("  {} {} referenced objects were not found", "!".red().bold(), received.absent);
            }
            if received.blobs_downloaded > 0 {
                println!("  Blobs: {}", received.blobs_downloaded);
            }
            if let Some(json) = root_json {
                println!("{json}");
            }
        }
    }
    Ok(())
}

async fn cmd_inspect(args: InspectArgs, config: CliConfig, format: OutputFormat) -> anyhow::Result<()> {
    let id = parse_id(&args.id)?;
    let path = match args.cache {
        Some(path) => path,
        None => config.cache.resolved_path()?,
    };
    let cache = SqliteStore::open(&path, config.cache.sqlite.clone())?;
    let json = cache
        .get(&id)
        .await?
        .with_context(|| format!("{id} is not in the cache at {}", path.display()))?;
    cache.close().await?;

    let map = BaseDeserializer::parse(Some(id), &json)?;
    let closure = BaseDeserializer::closure_of(Some(id), &map)?;
    let references = BaseDeserializer::references(Some(id), &map)?;
    let speckle_type = map.get(wire::SPECKLE_TYPE).and_then(|v| v.as_str()).unwrap_or_default();
    let is_blob = speckle_type.rsplit(wire::TYPE_CHAIN_SEPARATOR).next() == Some(wire::BLOB_TYPE);
    // Blob ids hash file bytes, which the cache does not hold.
    let verified = if is_blob {
        None
    } else {
        Some(ContentHasher::verify_fragment(&json, &id)?)
    };

    match format {
        OutputFormat::Json => {
            let out = json!({
                "id": id,
                "speckle_type": speckle_type,
                "bytes": json.len(),
                "references": references,
                "closure": closure.to_json(),
                "verified": verified,
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        OutputFormat::Text => {
            println!("{} {}", "Object".bold(), id.to_hex().yellow());
            println!("  Type: {}", speckle_type.cyan());
            println!("  Size: {} bytes", json.len());
            println!("  Direct references: {}", references.len());
            println!("  Closure: {} objects, depth {}", closure.len(), closure.max_depth());
            let hash = match verified {
                Some(true) => "verified".green(),
                Some(false) => "MISMATCH".red().bold(),
                None => "not checked (blob)".dimmed(),
            };
            println!("  Hash: {hash}");
            if args.children {
                for child in closure.depth_order() {
                    let depth = closure.get(&child).unwrap_or_default();
                    println!("    {} {}", format!("[{depth}]").dimmed(), child);
                }
            }
        }
    }
    Ok(())
}

async fn cmd_serve(args: ServeArgs, config: CliConfig) -> anyhow::Result<()> {
    let mut server_config = config.server;
    if let Some(bind) = args.bind {
        server_config.bind_addr = bind;
    }
    if args.token.is_some() {
        server_config.required_token = args.token;
    }
    println!(
        "{} Object server on {}{}",
        "✓".green().bold(),
        server_config.bind_addr.to_string().bold(),
        if server_config.required_token.is_some() { " (token required)" } else { "" }
    );
    SpeckleServer::new(server_config).serve().await?;
    Ok(())
}
