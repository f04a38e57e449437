use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use vaultfs_core::{AtimePolicy, Cipher};
use vaultfs_fs::Filesystem as VaultFilesystem;

/// Standalone FUSE mount for a vaultfs store. For passphrase-based config
/// files, use `vaultfs mount` in `vaultfs_cli` instead; this binary takes
/// the raw key directly and is meant for direct testing.
#[derive(Parser)]
#[command(name = "vaultfs-fuse", about = "Mount a vaultfs store over FUSE")]
struct Args {
    /// Mount point.
    mountpoint: PathBuf,

    /// Directory holding the encrypted block store.
    #[arg(long)]
    store: PathBuf,

    /// Hex-encoded symmetric key.
    #[arg(long)]
    key_hex: String,

    #[arg(long, value_enum, default_value = "aes-256-gcm")]
    cipher: CliCipher,

    #[arg(long, default_value_t = 16 * 1024)]
    block_size: usize,

    #[arg(long, default_value_t = 512)]
    cache_capacity: usize,

    #[arg(long)]
    allow_root: bool,

    #[arg(long)]
    auto_unmount: bool,
}

#[derive(Clone, clap::ValueEnum)]
enum CliCipher {
    Aes256Gcm,
    Aes128Gcm,
    Xchacha20Poly1305,
}

impl From<CliCipher> for Cipher {
    fn from(c: CliCipher) -> Self {
        match c {
            CliCipher::Aes256Gcm => Cipher::Aes256Gcm,
            CliCipher::Aes128Gcm => Cipher::Aes128Gcm,
            CliCipher::Xchacha20Poly1305 => Cipher::XChaCha20Poly1305,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();
    let args = Args::parse();

    let key_bytes = hex::decode(&args.key_hex)?;
    let cipher: Cipher = args.cipher.into();
    let raw = Arc::new(vaultfs_store_local::LocalBlockStore::open(&args.store, args.block_size).await?);
    let known_versions_path = args.store.join("known_versions.db");

    let config = vaultfs_core::CoreConfig {
        cipher,
        encryption_key: vaultfs_core::EncryptionKey::new(key_bytes),
        block_size_bytes: args.block_size as u32,
        root_blob_id: None,
        filesystem_id: [0u8; 16],
        format_version: 1,
    };
    let block_stack = vaultfs_blocks::BlockStack::open(
        raw,
        &config,
        0,
        known_versions_path,
        args.cache_capacity,
        false,
    )
    .await?;

    let payload_store: Arc<dyn vaultfs_blocks::PayloadBlockStore> = block_stack.cache.clone();
    let blob_store = vaultfs_blobs::BlobStore::new(payload_store)?;

    // `CoreConfig::root_blob_id` is the boundary vaultfs_cli's config file
    // persists across mounts; this standalone binary stands in for that
    // with a plain marker file next to the store.
    let root_id_path = args.store.join("root_id");
    let root_id = match tokio::fs::read_to_string(&root_id_path).await {
        Ok(hex_id) => {
            let mut raw = [0u8; vaultfs_core::BLOCK_ID_LEN];
            hex::decode_to_slice(hex_id.trim(), &mut raw)?;
            vaultfs_core::BlockId::from_bytes(raw)
        }
        Err(_) => {
            let id = VaultFilesystem::create_root(&blob_store).await?;
            tokio::fs::write(&root_id_path, id.to_hex()).await?;
            id
        }
    };
    let raw_for_statfs: Arc<dyn vaultfs_core::RawBlockStore> =
        Arc::new(vaultfs_store_local::LocalBlockStore::open(&args.store, args.block_size).await?);

    let fs = Arc::new(VaultFilesystem::new(blob_store, raw_for_statfs, root_id, AtimePolicy::Relatime));

    let uid = unsafe { libc::getuid() };
    let gid = unsafe { libc::getgid() };

    let handle = tokio::runtime::Handle::current();
    let session = vaultfs_fuse::mount(
        &args.mountpoint,
        fs,
        handle,
        uid,
        gid,
        args.allow_root,
        args.auto_unmount,
    )?;
    tokio::signal::ctrl_c().await?;
    drop(session);
    block_stack.shutdown().await?;
    Ok(())
}
