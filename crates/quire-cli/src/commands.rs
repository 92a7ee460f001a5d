use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use colored::Colorize;
use futures::{StreamExt, TryStreamExt};
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use quire_drive::{
    Change, DownloadOptions, Drive, DriveConfig, HistoryEntry, HistoryOptions, ReadOptions,
    ReplicateOptions, Stats, WriteOptions,
};
use quire_log::{DirectoryProvider, StorageProvider};
use quire_types::{path, FeedKey, FileRecord};

use crate::cli::*;

const CONFIG_FILE: &str = "quire.toml";
const METADATA_DIR: &str = "metadata";

/// Where the drive lives and how to print results.
struct Session {
    dir: PathBuf,
    config: Option<PathBuf>,
    json: bool,
}

impl Session {
    fn config(&self) -> anyhow::Result<DriveConfig> {
        let path = match &self.config {
            Some(path) => path.clone(),
            None => {
                let path = self.dir.join(CONFIG_FILE);
                if !path.exists() {
                    return Ok(DriveConfig::default());
                }
                path
            }
        };
        debug!(path = %path.display(), "loading config");
        DriveConfig::load(&path).with_context(|| format!("loading {}", path.display()))
    }

    fn root(&self, config: &DriveConfig) -> PathBuf {
        config.storage.clone().unwrap_or_else(|| self.dir.clone())
    }

    fn provider(root: &Path) -> Arc<dyn StorageProvider> {
        Arc::new(DirectoryProvider::new(root))
    }

    /// Open the drive in the session directory, empty replicas included.
    fn open_drive(&self) -> anyhow::Result<Drive> {
        let config = self.config()?;
        let root = self.root(&config);
        if !root.join(METADATA_DIR).exists() {
            bail!("no drive at {}; run `quire init` first", root.display());
        }
        Ok(Drive::new(Self::provider(&root), config)?)
    }

    async fn open(&self) -> anyhow::Result<Drive> {
        let drive = self.open_drive()?;
        if !drive.writable() && !drive.metadata().has(0) {
            bail!(
                "replica {} holds no data yet; run `quire sync --connect <addr>`",
                drive.key().short_id()
            );
        }
        drive.ready().await?;
        Ok(drive)
    }

    async fn open_at(&self, version: Option<u64>) -> anyhow::Result<Drive> {
        let drive = self.open().await?;
        match version {
            Some(version) => Ok(drive.checkout(version)?),
            None => Ok(drive),
        }
    }

    fn print_json(&self, value: &impl serde::Serialize) -> anyhow::Result<()> {
        println!("{}", serde_json::to_string_pretty(value)?);
        Ok(())
    }
}

pub async fn run_command(cli: Cli) -> anyhow::Result<()> {
    let session = Session {
        dir: cli.dir,
        config: cli.config,
        json: matches!(cli.format, OutputFormat::Json),
    };
    match cli.command {
        Command::Init(args) => cmd_init(&session, args).await,
        Command::Key(args) => cmd_key(&session, args).await,
        Command::Put(args) => cmd_put(&session, args).await,
        Command::Cat(args) => cmd_cat(&session, args).await,
        Command::Stat(args) => cmd_stat(&session, args).await,
        Command::Ls(args) => cmd_ls(&session, args).await,
        Command::Rm(args) => cmd_rm(&session, args).await,
        Command::Log(args) => cmd_log(&session, args).await,
        Command::Stats(args) => cmd_stats(&session, args).await,
        Command::Sync(args) => cmd_sync(&session, args).await,
    }
}

async fn cmd_init(session: &Session, args: InitArgs) -> anyhow::Result<()> {
    let mut config = session.config()?;
    if args.sparse {
        config.sparse = true;
    }
    if let Some(block_size) = args.block_size {
        config.block_size = block_size;
    }
    config.validate()?;

    let root = session.root(&config);
    let existed = root.join(METADATA_DIR).exists();
    let provider = Session::provider(&root);
    let drive = match &args.key {
        Some(hex) => Drive::with_key(provider, FeedKey::from_hex(hex)?, config.clone())?,
        None => Drive::new(provider, config.clone())?,
    };
    drive.ready().await?;

    let config_path = root.join(CONFIG_FILE);
    if !config_path.exists() {
        std::fs::write(&config_path, config.to_toml_string()?)
            .with_context(|| format!("writing {}", config_path.display()))?;
    }

    if session.json {
        return session.print_json(&json!({
            "path": root,
            "key": drive.key().to_hex(),
            "discovery_key": drive.discovery_key().to_hex(),
            "writable": drive.writable(),
            "version": drive.version(),
            "created": !existed,
        }));
    }
    let action = if existed { "Opened" } else { "Initialized" };
    let kind = if drive.writable() { "drive" } else { "replica" };
    println!("{} {} {} in {}", "✓".green().bold(), action, kind, root.display().to_string().bold());
    println!("  Key: {}", drive.key().to_hex().cyan());
    println!("  Version: {}", drive.version());
    Ok(())
}

async fn cmd_key(session: &Session, args: KeyArgs) -> anyhow::Result<()> {
    let drive = session.open().await?;
    let key = if args.discovery {
        drive.discovery_key().to_hex()
    } else {
        drive.key().to_hex()
    };
    if session.json {
        return session.print_json(&json!({ "key": key }));
    }
    println!("{key}");
    Ok(())
}

async fn cmd_put(session: &Session, args: PutArgs) -> anyhow::Result<()> {
    let drive = session.open().await?;
    let data = if args.source == "-" {
        let mut buf = Vec::new();
        tokio::io::stdin().read_to_end(&mut buf).await?;
        buf
    } else {
        tokio::fs::read(&args.source)
            .await
            .with_context(|| format!("reading {}", args.source))?
    };
    let options = WriteOptions {
        mode: args.mode.as_deref().map(parse_mode).transpose()?,
        ..WriteOptions::default()
    };
    let record = drive.write_file(&args.path, data, options).await?;

    if session.json {
        return session.print_json(&record);
    }
    println!(
        "{} {} ({} bytes, {} blocks) at version {}",
        "✓".green().bold(),
        path::normalize(&args.path).bold(),
        record.size,
        record.blocks,
        drive.version().to_string().yellow()
    );
    Ok(())
}

async fn cmd_cat(session: &Session, args: CatArgs) -> anyhow::Result<()> {
    let drive = session.open_at(args.version).await?;
    let options = ReadOptions {
        start: args.start,
        end: None,
        length: args.length,
    };
    let mut stream = drive.create_read_stream(&args.path, options);
    let mut out = tokio::io::stdout();
    while let Some(chunk) = stream.try_next().await? {
        out.write_all(&chunk).await?;
    }
    out.flush().await?;
    Ok(())
}

async fn cmd_stat(session: &Session, args: PathArgs) -> anyhow::Result<()> {
    let drive = session.open_at(args.version).await?;
    let record = drive.stat(&args.path).await?;
    if session.json {
        return session.print_json(&record);
    }
    print_record(&path::normalize(&args.path), &record);
    Ok(())
}

async fn cmd_ls(session: &Session, args: LsArgs) -> anyhow::Result<()> {
    let drive = session.open_at(args.version).await?;
    let names = drive.readdir(&args.path).await?;
    let dir = path::normalize(&args.path);

    let mut entries = Vec::with_capacity(names.len());
    for name in names {
        let record = if args.long || session.json {
            Some(drive.stat(&join(&dir, &name)).await?)
        } else {
            None
        };
        entries.push((name, record));
    }

    if session.json {
        let listing: Vec<_> = entries
            .iter()
            .map(|(name, record)| json!({ "name": name, "stat": record }))
            .collect();
        return session.print_json(&listing);
    }
    for (name, record) in entries {
        match record {
            Some(record) if record.is_directory() => {
                println!("{:o} {:>10} {}/", record.mode, "-", name.blue().bold())
            }
            Some(record) => println!("{:o} {:>10} {}", record.mode, record.size, name),
            None => println!("{name}"),
        }
    }
    Ok(())
}

async fn cmd_rm(session: &Session, args: PathArgs) -> anyhow::Result<()> {
    if args.version.is_some() {
        bail!("cannot remove from a past version");
    }
    let drive = session.open().await?;
    drive.unlink(&args.path).await?;
    if session.json {
        return session.print_json(&json!({ "removed": path::normalize(&args.path), "version": drive.version() }));
    }
    println!("{} removed {}", "✓".green().bold(), path::normalize(&args.path).bold());
    Ok(())
}

async fn cmd_log(session: &Session, args: LogArgs) -> anyhow::Result<()> {
    let drive = session.open().await?;
    let options = HistoryOptions {
        reverse: !args.reverse,
        ..HistoryOptions::default()
    };
    let entries: Vec<HistoryEntry> = drive.history(options).take(args.limit).try_collect().await?;
    if session.json {
        return session.print_json(&entries);
    }
    if entries.is_empty() {
        println!("No changes.");
    }
    for entry in entries {
        let version = format!("v{}", entry.version()).yellow();
        match entry.change {
            Change::Put(record) => println!(
                "{} {} {} ({} bytes)",
                version,
                "put".green(),
                entry.path,
                record.size
            ),
            Change::Del => println!("{} {} {}", version, "del".red(), entry.path),
        }
    }
    Ok(())
}

async fn cmd_stats(session: &Session, args: PathArgs) -> anyhow::Result<()> {
    let drive = session.open_at(args.version).await?;
    let stats = drive.stats(&args.path).await?;
    if session.json {
        return session.print_json(&stats);
    }
    let files = match stats {
        Stats::File(file) => vec![(path::normalize(&args.path), file)],
        Stats::Directory(files) => files.into_iter().collect(),
    };
    for (file, stats) in files {
        let counts = format!("{}/{}", stats.downloaded_blocks, stats.blocks);
        let counts = if stats.is_complete() {
            counts.green()
        } else {
            counts.yellow()
        };
        println!("{counts} blocks  {file}");
    }
    Ok(())
}

async fn cmd_sync(session: &Session, args: SyncArgs) -> anyhow::Result<()> {
    let drive = session.open_drive()?;
    drive.ready().await?;

    if let Some(addr) = &args.listen {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding {addr}"))?;
        let local = listener.local_addr()?;
        if !session.json {
            println!(
                "{} Serving {} on {}",
                "→".cyan().bold(),
                drive.key().to_hex().cyan(),
                local.to_string().bold()
            );
        }
        return serve(&drive, listener, args.once).await;
    }

    let Some(addr) = &args.connect else {
        bail!("sync needs --listen or --connect");
    };
    let socket = TcpStream::connect(addr)
        .await
        .with_context(|| format!("connecting to {addr}"))?;
    sync_with(&drive, socket, args.version).await?;

    if session.json {
        return session.print_json(&json!({
            "key": drive.key().to_hex(),
            "peer": addr,
            "version": drive.version(),
        }));
    }
    println!(
        "{} Synced {} at version {}",
        "✓".green().bold(),
        drive.key().short_id(),
        drive.version().to_string().yellow()
    );
    Ok(())
}

/// Accept peers until interrupted, or until the first one leaves.
async fn serve(drive: &Drive, listener: TcpListener, once: bool) -> anyhow::Result<()> {
    loop {
        let (socket, peer) = tokio::select! {
            accepted = listener.accept() => accepted?,
            _ = tokio::signal::ctrl_c() => return Ok(()),
        };
        info!(%peer, "peer connected");
        let stream = drive.replicate(socket, ReplicateOptions::default())?;
        if once {
            stream.finished().await?;
            info!(%peer, "peer disconnected");
            return Ok(());
        }
        tokio::spawn(async move {
            match stream.finished().await {
                Ok(()) => info!(%peer, "peer disconnected"),
                Err(e) => warn!(%peer, error = %e, "replication failed"),
            }
        });
    }
}

/// Replicate over `socket`. With a target version, wait for it and for the
/// content of a non-sparse drive, then disconnect; otherwise run until the
/// peer leaves or the user interrupts.
async fn sync_with(drive: &Drive, socket: TcpStream, version: Option<u64>) -> anyhow::Result<()> {
    let stream = drive.replicate(socket, ReplicateOptions::default())?;
    let Some(version) = version else {
        tokio::select! {
            finished = stream.finished() => finished?,
            _ = tokio::signal::ctrl_c() => stream.close(),
        }
        return Ok(());
    };

    tokio::select! {
        updated = drive.update(version) => updated?,
        finished = stream.finished() => {
            finished?;
            bail!("peer disconnected at version {}, before {version}", drive.version());
        }
    }
    if !drive.config().sparse && !drive.readdir("").await?.is_empty() {
        let handle = drive.download("", DownloadOptions::default()).await?;
        tokio::select! {
            summary = handle.finished() => {
                let summary = summary?;
                debug!(files = summary.files, blocks = summary.blocks, "content downloaded");
            }
            finished = stream.finished() => {
                finished?;
                bail!("peer disconnected before content was downloaded");
            }
        }
    }
    stream.close();
    stream.finished().await?;
    Ok(())
}

fn print_record(path: &str, record: &FileRecord) {
    let kind = if record.is_directory() { "directory" } else { "file" };
    println!("{} ({})", path.bold(), kind.cyan());
    println!("  Mode:   {:o}", record.mode);
    if record.is_file() {
        println!("  Size:   {} bytes in {} blocks", record.size, record.blocks);
        println!("  Blocks: {}..{}", record.block_range().start, record.block_range().end);
        println!("  Owner:  {}:{}", record.uid, record.gid);
        println!("  Mtime:  {}", record.mtime);
    }
}

fn join(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{dir}/{name}")
    }
}

fn parse_mode(mode: &str) -> anyhow::Result<u32> {
    u32::from_str_radix(mode.trim_start_matches("0o"), 8)
        .with_context(|| format!("invalid mode {mode:?}; expected octal"))
}
