//! krakenctl - command-line client for the kraken admin API
//!
//! The API endpoint is taken from `KRAKEN_URL`, defaulting to
//! `http://localhost:4214`.

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;

use kraken::admin::{CreateServerMountRequest, CreateServerRequest};
use kraken::client::Client;
use kraken::config;
use kraken::events::Event;
use kraken::fileserver::Params;

#[derive(Parser)]
#[command(name = "krakenctl", about = "Control a krakend server fabric")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List the available servers
    Ls,
    /// Add a new server listening on PORT, or a random port if not provided
    Add {
        port: Option<u16>,
        /// Address to bind to; defaults to all interfaces
        #[arg(short, long, default_value = "")]
        bind: String,
    },
    /// Remove a server
    Rm { port: u16 },
    /// Remove all servers
    Clear,
    /// List the mounts of a server
    Lsmount { port: u16 },
    /// Mount the SOURCE directory on the server listening on PORT.
    /// By default, SOURCE is mounted on /$(basename SOURCE)
    Mount {
        port: u16,
        source: PathBuf,
        /// Alternate mount target; it must start with / and not end with /
        #[arg(short, long)]
        target: Option<String>,
        /// File server type to use for this mount point; if empty, the
        /// built-in default is used
        #[arg(short = 'f', long = "fs", default_value = "beachplug")]
        fs_type: String,
        /// File server params, as a JSON object
        #[arg(short = 'p', long = "fsp", default_value = "{}")]
        fs_params: String,
    },
    /// Remove the mount point MOUNT_ID on the server listening on PORT
    Umount { port: u16, id: String },
    /// List the available file server types
    Fileservers,
    /// Listen for events; EVENTs can be server, mount or fileserve.
    /// Without arguments, all events are listened for
    Events { events: Vec<String> },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let url = config::client_url()?;
    let client = Client::new(url)?;
    run(cli.command, client).await
}

async fn run(command: Command, client: Client) -> Result<()> {
    match command {
        Command::Ls => {
            for srv in client.servers().await? {
                print!("{}", join_addr(&srv.bind_address, srv.port));
                if srv.mounts.is_empty() {
                    println!(" (no mounts)");
                    continue;
                }
                println!();
                for mount in &srv.mounts {
                    println!("  * {}: {} -> {}", mount.id, mount.source, mount.target);
                }
                println!();
            }
        }
        Command::Add { port, bind } => {
            let req = CreateServerRequest { bind_address: bind };
            let srv = match port {
                Some(port) => client.add_server_at(port, &req).await?,
                None => client.add_server(&req).await?,
            };
            println!(
                "server available on {}",
                join_addr(&srv.bind_address, srv.port)
            );
        }
        Command::Rm { port } => {
            client.remove_server(port).await?;
        }
        Command::Clear => {
            client.remove_all_servers().await?;
        }
        Command::Lsmount { port } => {
            for mount in client.mounts(port).await? {
                println!("{}: {} -> {}", mount.id, mount.source, mount.target);
            }
        }
        Command::Mount {
            port,
            source,
            target,
            fs_type,
            fs_params,
        } => {
            let source = absolutize(source)?;
            let target = match target {
                Some(target) => target,
                None => {
                    let base = source
                        .file_name()
                        .ok_or_else(|| anyhow!("cannot derive a target from {:?}", source))?;
                    format!("/{}", base.to_string_lossy())
                }
            };
            let fs_params: Params =
                serde_json::from_str(&fs_params).context("invalid fs params")?;
            let mount = client
                .add_mount(
                    port,
                    &CreateServerMountRequest {
                        target,
                        source: source.to_string_lossy().into_owned(),
                        fs_type,
                        fs_params,
                    },
                )
                .await?;
            println!("{}: {} -> {}", mount.id, mount.source, mount.target);
        }
        Command::Umount { port, id } => {
            client.remove_mount(port, &id).await?;
        }
        Command::Fileservers => {
            println!("{}", client.file_servers().await?.join(", "));
        }
        Command::Events { events } => {
            let (events_tx, mut events_rx) = mpsc::channel(16);
            let listener =
                tokio::spawn(async move { client.listen_events(&events, events_tx).await });
            while let Some(event) = events_rx.recv().await {
                print_event(&event);
            }
            listener.await??;
        }
    }
    Ok(())
}

fn print_event(event: &Event) {
    match event {
        Event::ServerAdd(e) => println!(
            "server added on http://{}:{}",
            e.server.bind_address, e.server.port
        ),
        Event::ServerRemove(e) => println!(
            "server removed on http://{}:{}",
            e.server.bind_address, e.server.port
        ),
        Event::MountAdd(e) => println!(
            "mount point {} added: {:?} -> http://{}:{}{}",
            e.mount.id, e.mount.source, e.server.bind_address, e.server.port, e.mount.target
        ),
        Event::MountUpdate(e) => println!(
            "mount point {} updated: {:?} -> http://{}:{}{}",
            e.mount.id, e.mount.source, e.server.bind_address, e.server.port, e.mount.target
        ),
        Event::MountRemove(e) => println!(
            "mount point {} removed: {:?} X http://{}:{}{}",
            e.mount.id, e.mount.source, e.server.bind_address, e.server.port, e.mount.target
        ),
        Event::FileServe(e) => println!(
            "file served on http://{}:{} - {} - {}",
            e.server.bind_address, e.server.port, e.code, e.path
        ),
    }
}

fn join_addr(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

fn absolutize(path: PathBuf) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path);
    }
    Ok(std::env::current_dir()
        .context("cannot resolve the current directory")?
        .join(path))
}
