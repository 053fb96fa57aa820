use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use fabnet_client::security::{AesGcmSecurityManager, NullSecurityManager, SecurityManager};
use fabnet_client::{Client, Config, MockGateway};

#[derive(Parser)]
#[command(name = "fabnet-client", version = "0.1.0", about = "Content-addressed object store client")]
struct Cli {
    /// Local cache root for block files, the catalog, and the journal.
    #[arg(long, default_value = "./fabnet-data")]
    data_dir: PathBuf,

    /// Passphrase blocks are encrypted under. Required unless --no-encryption
    /// is set.
    #[arg(long, env = "FABNET_PASSPHRASE")]
    passphrase: Option<String>,

    /// Store blocks as cleartext instead of encrypting them. Only for local
    /// testing against a gateway that already terminates encryption.
    #[arg(long)]
    no_encryption: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload a local file's contents to a remote path
    Put {
        local_path: PathBuf,
        remote_path: String,
    },
    /// Download a remote path's contents to a local file
    Get {
        remote_path: String,
        local_path: PathBuf,
    },
    /// Remove a file or empty directory
    Rm {
        remote_path: String,
    },
    /// List a directory's contents
    Ls {
        #[arg(default_value = "/")]
        remote_path: String,
    },
    /// Create a directory
    Mkdir {
        remote_path: String,
    },
    /// Show an item's metadata
    Stat {
        remote_path: String,
    },
    /// Reopen the local catalog, forcing a journal replay, and report its state
    Fsck,
}

/// Per-`data_dir` salt so the same passphrase derives a distinct key in
/// every cache root. Generated once and persisted alongside the catalog.
fn load_or_create_salt(data_dir: &std::path::Path) -> std::io::Result<[u8; 16]> {
    let path = data_dir.join(".salt");
    if let Ok(bytes) = std::fs::read(&path) {
        if bytes.len() == 16 {
            let mut salt = [0u8; 16];
            salt.copy_from_slice(&bytes);
            return Ok(salt);
        }
    }
    std::fs::create_dir_all(data_dir)?;
    let salt = *uuid::Uuid::new_v4().as_bytes();
    std::fs::write(&path, salt)?;
    Ok(salt)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut config = Config::default();
    config.data_dir = cli.data_dir;

    let security: Arc<dyn SecurityManager> = if cli.no_encryption {
        Arc::new(NullSecurityManager)
    } else {
        let passphrase = cli.passphrase.ok_or(
            "a passphrase is required to encrypt blocks; pass --passphrase, set FABNET_PASSPHRASE, or use --no-encryption",
        )?;
        let salt = load_or_create_salt(&config.data_dir)?;
        Arc::new(AesGcmSecurityManager::from_password(&passphrase, &salt)?)
    };

    let gateway = Arc::new(MockGateway::new());
    let client = Client::open(config, gateway, security)?;

    match cli.command {
        Commands::Put { local_path, remote_path } => {
            let data = std::fs::read(&local_path)?;
            let mut f = client.create_file(&remote_path);
            f.write(&data)?;
            f.close()?;
            println!("put {} ({} B) -> {}", local_path.display(), data.len(), remote_path);
        }
        Commands::Get { remote_path, local_path } => {
            let mut f = client.open_file(&remote_path);
            let data = f.read(None)?;
            f.close()?;
            std::fs::write(&local_path, &data)?;
            println!("get {} ({} B) -> {}", remote_path, data.len(), local_path.display());
        }
        Commands::Rm { remote_path } => {
            client.remove(&remote_path)?;
            println!("removed {remote_path}");
        }
        Commands::Ls { remote_path } => {
            for item in client.listdir(&remote_path)? {
                let kind = if item.is_dir() { "d" } else { "f" };
                println!("{kind}  {:>10}  {}", item.size(), item.name);
            }
        }
        Commands::Mkdir { remote_path } => {
            client.mkdir(&remote_path)?;
            println!("created {remote_path}");
        }
        Commands::Stat { remote_path } => {
            let item = client.stat(&remote_path)?;
            println!("item_id:    {}", item.item_id);
            println!("parent_id:  {}", item.parent_dir_id);
            println!("name:       {}", item.name);
            println!("kind:       {}", if item.is_dir() { "directory" } else { "file" });
            println!("size:       {}", item.size());
            println!("chunks:     {}", item.chunks().len());
            println!("created:    {}", item.create_datetime);
            println!("modified:   {}", item.modify_datetime);
        }
        Commands::Fsck => {
            let listing = client.listdir("/")?;
            println!("catalog is consistent; {} entries at root", listing.len());
        }
    }

    client.close()?;
    Ok(())
}
