//! The `dynamic-peer` command line: one-shot commands and an interactive shell on top of a
//! [`SessionManager`].

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::alert::Alert;
use crate::config::Config;
use crate::manager::{SessionManager, TorrentHandle};
use crate::session::{PieceStore, SessionState, TorrentStatus};
use crate::torrent::{Torrent, generate};

#[derive(Parser, Debug)]
#[command(name = "dynamic-peer")]
#[command(about = "A BitTorrent peer that creates, seeds and downloads torrents")]
pub struct Cli {
    /// Address to accept peer connections on
    #[arg(long, global = true)]
    pub listen: Option<SocketAddr>,
    /// Where generated `.torrent` files are kept
    #[arg(long, global = true)]
    pub torrents_dir: Option<PathBuf>,
    /// Default save path of downloads
    #[arg(long, global = true)]
    pub download_dir: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create a `.torrent` file from files or a directory
    Create {
        /// Files or directories to include
        #[arg(required = true)]
        paths: Vec<PathBuf>,
        /// Where to write the torrent, defaults to `<name>.torrent` in the torrents directory
        #[arg(short, long)]
        output: Option<PathBuf>,
        #[arg(long)]
        piece_length: Option<u32>,
        /// Announce url, may be given several times
        #[arg(short, long = "tracker")]
        trackers: Vec<String>,
    },
    /// Download a torrent and wait until it is complete
    #[command(visible_alias = "add")]
    Download {
        torrent: PathBuf,
        /// Save path, defaults to the download directory
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Peer to connect to besides the ones the trackers return
        #[arg(short, long = "peer")]
        peers: Vec<SocketAddr>,
        /// Keep seeding once the download is complete
        #[arg(long)]
        seed: bool,
    },
    /// Create a torrent for a file and seed it until interrupted
    Seed {
        file: PathBuf,
        /// Announce url, the configured default tracker when none is given
        #[arg(short, long = "tracker")]
        trackers: Vec<String>,
        #[arg(long)]
        piece_length: Option<u32>,
    },
    /// Forget a torrent kept in the torrents directory; downloaded data stays
    Stop { name: String },
    /// List the torrents kept in the torrents directory
    List {
        #[arg(long)]
        json: bool,
    },
    /// Print the metadata of a `.torrent` file
    Info { torrent: PathBuf },
    /// Run an interactive session
    Shell,
}

impl Cli {
    /// The configuration from the environment, with the command line flags on top.
    pub fn config(&self) -> Config {
        let mut config = Config::from_env();
        if let Some(listen) = self.listen {
            config.network.listen_addr = listen;
        }
        if let Some(dir) = &self.torrents_dir {
            config.storage.torrents_dir = dir.clone();
        }
        if let Some(dir) = &self.download_dir {
            config.storage.download_dir = dir.clone();
        }
        config
    }
}

pub async fn handle_command(cli: Cli) -> anyhow::Result<()> {
    let config = cli.config();
    match cli.command {
        Commands::Create {
            paths,
            output,
            piece_length,
            trackers,
        } => {
            let piece_length = piece_length.unwrap_or(config.storage.piece_length);
            let torrent = generate(&paths, piece_length, &trackers)
                .context("failed to create the torrent")?;
            let output = output.unwrap_or_else(|| torrent_path(&config, torrent.name()));
            write_torrent(&torrent, &output)?;
            println!(
                "Created {} ({} pieces, infohash {})",
                output.display(),
                torrent.info.piece_count(),
                torrent.info_hash()
            );
            Ok(())
        }
        Commands::Download {
            torrent,
            output,
            peers,
            seed,
        } => {
            let torrent = read_torrent(&torrent)?;
            let save_path = output.unwrap_or_else(|| config.storage.download_dir.clone());
            keep_torrent(&config, &torrent)?;

            let mut manager = SessionManager::new(config).await?;
            let handle = manager
                .add_torrent(torrent, &save_path)
                .context("failed to add the torrent")?;
            for peer in peers {
                manager.add_peer(handle, peer).await?;
            }
            let name = manager.session(handle)?.torrent().name().to_string();
            println!("Downloading: {name}");

            let finished = wait_until_finished(&mut manager, handle).await?;
            if finished && seed {
                println!("Seeding: {name}, interrupt to stop");
                run_until_interrupted(&mut manager).await?;
            }
            manager.shutdown().await;
            if !finished {
                bail!("`{name}` did not finish");
            }
            Ok(())
        }
        Commands::Seed {
            file,
            trackers,
            piece_length,
        } => {
            let piece_length = piece_length.unwrap_or(config.storage.piece_length);
            let mut manager = SessionManager::new(config).await?;
            let name = seed_file(&mut manager, &file, &trackers, piece_length)?;
            println!("Seeding: {name} on {}, interrupt to stop", manager.local_addr());
            run_until_interrupted(&mut manager).await?;
            manager.shutdown().await;
            Ok(())
        }
        Commands::Stop { name } => {
            let path = torrent_path(&config, &name);
            if !path.is_file() {
                bail!("torrent not found: {name}");
            }
            std::fs::remove_file(&path)
                .with_context(|| format!("failed to remove {}", path.display()))?;
            println!("Stopped torrent: {name}");
            Ok(())
        }
        Commands::List { json } => {
            let entries = kept_torrents(&config)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else if entries.is_empty() {
                println!("No torrents.");
            } else {
                for entry in entries {
                    println!("{entry}");
                }
            }
            Ok(())
        }
        Commands::Info { torrent } => {
            let torrent = read_torrent(&torrent)?;
            print_info(&torrent);
            Ok(())
        }
        Commands::Shell => {
            let manager = SessionManager::new(config).await?;
            shell(manager).await
        }
    }
}

fn read_torrent(path: &Path) -> anyhow::Result<Torrent> {
    Torrent::read_from_file(path)
        .with_context(|| format!("failed to read the torrent {}", path.display()))
}

fn write_torrent(torrent: &Torrent, path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    torrent
        .write_to_file(path)
        .with_context(|| format!("failed to write the torrent {}", path.display()))
}

fn torrent_path(config: &Config, name: &str) -> PathBuf {
    config.storage.torrents_dir.join(format!("{name}.torrent"))
}

/// Copies a torrent into the torrents directory so `list` knows about it.
fn keep_torrent(config: &Config, torrent: &Torrent) -> anyhow::Result<()> {
    let path = torrent_path(config, torrent.name());
    if path.is_file() {
        return Ok(());
    }
    write_torrent(torrent, &path)
}

/// Creates the torrent of `file` in the torrents directory and seeds it from the directory
/// the file is in.
fn seed_file(
    manager: &mut SessionManager,
    file: &Path,
    trackers: &[String],
    piece_length: u32,
) -> anyhow::Result<String> {
    if !file.exists() {
        bail!("file does not exist: {}", file.display());
    }
    let trackers = announce_urls(manager.config(), trackers);
    let torrent = generate(&[file.to_path_buf()], piece_length, &trackers)
        .with_context(|| format!("failed to hash {}", file.display()))?;
    let path = torrent_path(manager.config(), torrent.name());
    write_torrent(&torrent, &path)?;
    println!("Created torrent: {}", path.display());

    let save_path = match file.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let name = torrent.name().to_string();
    manager
        .add_torrent(torrent, &save_path)
        .with_context(|| format!("failed to seed {name}"))?;
    Ok(name)
}

/// The trackers given on the command line, or the configured default tracker.
fn announce_urls(config: &Config, trackers: &[String]) -> Vec<String> {
    if trackers.is_empty() {
        config.network.default_tracker.iter().cloned().collect()
    } else {
        trackers.to_vec()
    }
}

/// Prints alerts and progress until the torrent is complete. `false` when it stopped or
/// failed first, or the user interrupted.
async fn wait_until_finished(
    manager: &mut SessionManager,
    handle: TorrentHandle,
) -> anyhow::Result<bool> {
    let mut session = manager.session(handle)?.clone();
    loop {
        let status = session.status();
        if status.is_finished() && status.state != SessionState::Checking {
            println!("{status}");
            return Ok(true);
        }
        if matches!(status.state, SessionState::Error | SessionState::Stopped) {
            println!("{status}");
            return Ok(false);
        }
        tokio::select! {
            changed = session.changed() => {
                if changed.is_err() {
                    return Ok(false);
                }
            }
            Some(alert) = manager.next_alert() => print_alert(&alert),
            _ = tokio::signal::ctrl_c() => return Ok(false),
        }
    }
}

async fn run_until_interrupted(manager: &mut SessionManager) -> anyhow::Result<()> {
    loop {
        tokio::select! {
            interrupted = tokio::signal::ctrl_c() => {
                interrupted.context("failed to wait for an interrupt")?;
                return Ok(());
            }
            alert = manager.next_alert() => match alert {
                Some(alert) => print_alert(&alert),
                None => return Ok(()),
            },
        }
    }
}

fn print_alert(alert: &Alert) {
    if alert.is_error() {
        eprintln!("Alert: {alert}");
    } else {
        println!("Alert: {alert}");
    }
}

fn print_info(torrent: &Torrent) {
    println!("Name: {}", torrent.name());
    println!("Info Hash: {}", torrent.info_hash());
    println!("Length: {}", torrent.info.total_length());
    println!("Piece Length: {}", torrent.info.piece_length);
    println!("Pieces: {}", torrent.info.piece_count());
    for tracker in torrent.trackers() {
        println!("Tracker: {tracker}");
    }
    for (path, length) in torrent.files() {
        println!("  {} ({length} bytes)", path.display());
    }
}

/// A torrent from the torrents directory, as `list` shows it.
#[derive(Debug, Serialize)]
struct KeptTorrent {
    name: String,
    info_hash: String,
    length: u64,
    /// from the resume file in the download directory, when there is one
    progress: Option<f64>,
}

impl std::fmt::Display for KeptTorrent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.progress {
            Some(progress) if progress >= 1.0 => write!(f, " - {} [Complete]", self.name),
            Some(progress) => write!(
                f,
                " - {} [Incomplete] Progress: {}%",
                self.name,
                (progress * 100.0) as u32
            ),
            None => write!(f, " - {} [Not started]", self.name),
        }
    }
}

fn kept_torrents(config: &Config) -> anyhow::Result<Vec<KeptTorrent>> {
    let dir = &config.storage.torrents_dir;
    let read_dir = match std::fs::read_dir(dir) {
        Ok(read_dir) => read_dir,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(error) => {
            return Err(error).with_context(|| format!("failed to read {}", dir.display()));
        }
    };

    let mut entries = Vec::new();
    for entry in read_dir {
        let path = entry?.path();
        if path.extension().is_none_or(|extension| extension != "torrent") {
            continue;
        }
        let torrent = match Torrent::read_from_file(&path) {
            Ok(torrent) => torrent,
            Err(error) => {
                tracing::warn!("skipping {}: {error}", path.display());
                continue;
            }
        };
        let total = torrent.info.total_length();
        let progress =
            PieceStore::saved_bitmap(&torrent, &config.storage.download_dir).map(|have| {
                let verified: u64 = have
                    .iter()
                    .enumerate()
                    .filter(|(_, have)| **have)
                    .map(|(piece, _)| torrent.info.piece_size(piece as u32) as u64)
                    .sum();
                verified as f64 / total.max(1) as f64
            });
        entries.push(KeptTorrent {
            name: torrent.name().to_string(),
            info_hash: torrent.info_hash().to_hex(),
            length: total,
            progress,
        });
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}

/// A command typed into the shell.
#[derive(Debug, PartialEq, Eq)]
enum ShellCommand {
    Seed(PathBuf),
    Download(PathBuf),
    Stop(String),
    List,
    Stats,
    Peer(String, SocketAddr),
    Help,
    Exit,
}

const SHELL_HELP: &str =
    "Commands: seed <file>, download <.torrent>, stop <name>, list, stats, peer <name> <addr>, exit";

fn parse_shell_line(line: &str) -> Result<Option<ShellCommand>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let (action, arg) = match line.split_once(char::is_whitespace) {
        Some((action, arg)) => (action, arg.trim()),
        None => (line, ""),
    };
    let required = |what: &str| {
        if arg.is_empty() {
            Err(format!("`{action}` needs {what}"))
        } else {
            Ok(arg.to_string())
        }
    };
    let command = match action {
        "seed" => ShellCommand::Seed(required("a file")?.into()),
        "download" | "add" => ShellCommand::Download(required("a torrent file")?.into()),
        "stop" => ShellCommand::Stop(required("a name")?),
        "list" => ShellCommand::List,
        "stats" => ShellCommand::Stats,
        "peer" => {
            let (name, addr) = arg
                .rsplit_once(char::is_whitespace)
                .ok_or_else(|| "`peer` needs a name and an address".to_string())?;
            let addr = addr
                .parse()
                .map_err(|error| format!("invalid address `{addr}`: {error}"))?;
            ShellCommand::Peer(name.trim().to_string(), addr)
        }
        "help" => ShellCommand::Help,
        "exit" | "quit" => ShellCommand::Exit,
        unknown => return Err(format!("Unknown command: {unknown}")),
    };
    Ok(Some(command))
}

async fn shell(mut manager: SessionManager) -> anyhow::Result<()> {
    println!("Listening on {}", manager.local_addr());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    loop {
        stdout
            .write_all(format!("\n{SHELL_HELP}\n> ").as_bytes())
            .await?;
        stdout.flush().await?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        match parse_shell_line(&line) {
            Ok(Some(ShellCommand::Exit)) => break,
            Ok(Some(command)) => {
                if let Err(error) = run_shell_command(&mut manager, command).await {
                    eprintln!("{error:#}");
                }
            }
            Ok(None) => {}
            Err(message) => eprintln!("{message}"),
        }
        for alert in manager.take_alerts() {
            print_alert(&alert);
        }
    }
    manager.shutdown().await;
    Ok(())
}

async fn run_shell_command(
    manager: &mut SessionManager,
    command: ShellCommand,
) -> anyhow::Result<()> {
    match command {
        ShellCommand::Seed(file) => {
            let piece_length = manager.config().storage.piece_length;
            let name = seed_file(manager, &file, &[], piece_length)?;
            println!("Seeding: {name}");
        }
        ShellCommand::Download(path) => {
            let torrent = read_torrent(&path)?;
            let save_path = manager.config().storage.download_dir.clone();
            let name = torrent.name().to_string();
            manager.add_torrent(torrent, &save_path)?;
            println!("Downloading: {name}");
        }
        ShellCommand::Stop(name) => {
            let handle = manager
                .find_by_name(&name)
                .with_context(|| format!("torrent not found: {name}"))?;
            manager.remove_torrent(handle).await?;
            println!("Stopped torrent: {name}");
        }
        ShellCommand::List => {
            let statuses = manager.list();
            if statuses.is_empty() {
                println!("No active torrents.");
            }
            for status in statuses {
                println!(
                    " - {} [{}] Progress: {}%",
                    status.name,
                    seeding_label(&status),
                    (status.progress * 100.0) as u32
                );
            }
        }
        ShellCommand::Stats => {
            println!("Active torrents:");
            for status in manager.list() {
                println!(" - [{}] {status}", seeding_label(&status));
            }
        }
        ShellCommand::Peer(name, addr) => {
            let handle = manager
                .find_by_name(&name)
                .with_context(|| format!("torrent not found: {name}"))?;
            manager.add_peer(handle, addr).await?;
            println!("Connecting {name} to {addr}");
        }
        ShellCommand::Help => println!("{SHELL_HELP}"),
        ShellCommand::Exit => {}
    }
    Ok(())
}

fn seeding_label(status: &TorrentStatus) -> &'static str {
    if status.is_seeding {
        "Seeding"
    } else {
        "Downloading"
    }
}

#[cfg(test)]
mod test_cli {
    use super::*;

    #[test]
    fn shell_lines() {
        assert_eq!(parse_shell_line("   "), Ok(None));
        assert_eq!(
            parse_shell_line("seed my file.bin"),
            Ok(Some(ShellCommand::Seed("my file.bin".into())))
        );
        assert_eq!(
            parse_shell_line("peer movie 127.0.0.1:6881"),
            Ok(Some(ShellCommand::Peer(
                "movie".to_string(),
                "127.0.0.1:6881".parse().unwrap()
            )))
        );
        assert_eq!(parse_shell_line("exit"), Ok(Some(ShellCommand::Exit)));
        assert!(parse_shell_line("stop").is_err());
        assert!(parse_shell_line("peer movie nowhere").is_err());
        assert!(parse_shell_line("dance").is_err());
    }

    #[test]
    fn seeding_falls_back_to_the_default_tracker() {
        let mut config = Config::default();
        assert_eq!(
            announce_urls(&config, &[]),
            vec!["http://localhost:8080/announce".to_string()]
        );
        let explicit = vec!["http://other/announce".to_string()];
        assert_eq!(announce_urls(&config, &explicit), explicit);
        config.network.default_tracker = None;
        assert!(announce_urls(&config, &[]).is_empty());
    }

    #[test]
    fn flags_override_the_config() {
        let cli = Cli::try_parse_from([
            "dynamic-peer",
            "list",
            "--torrents-dir",
            "/tmp/t",
            "--listen",
            "127.0.0.1:7000",
        ])
        .unwrap();
        let config = cli.config();
        assert_eq!(config.storage.torrents_dir, PathBuf::from("/tmp/t"));
        assert_eq!(config.network.listen_addr.port(), 7000);
        assert!(matches!(cli.command, Commands::List { json: false }));
    }

    #[test]
    fn download_has_an_add_alias() {
        let cli = Cli::try_parse_from(["dynamic-peer", "add", "x.torrent", "-p", "10.0.0.1:1"])
            .unwrap();
        let Commands::Download { torrent, peers, .. } = cli.command else {
            panic!("expected a download");
        };
        assert_eq!(torrent, PathBuf::from("x.torrent"));
        assert_eq!(peers.len(), 1);
    }

    #[test]
    fn list_reads_the_torrents_directory() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("song.ogg");
        std::fs::write(&data, vec![3u8; 20_000]).unwrap();
        let mut config = Config::default();
        config.storage.torrents_dir = dir.path().join("torrents");
        config.storage.download_dir = dir.path().join("downloads");

        let torrent = generate(&[data], 1 << 14, &[]).unwrap();
        keep_torrent(&config, &torrent).unwrap();
        std::fs::write(config.storage.torrents_dir.join("notes.txt"), "x").unwrap();

        let entries = kept_torrents(&config).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "song.ogg");
        assert_eq!(entries[0].progress, None);
        assert_eq!(entries[0].to_string(), " - song.ogg [Not started]");
    }
}
