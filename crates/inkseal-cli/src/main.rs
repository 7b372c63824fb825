//! inkseal: end-to-end encryption CLI
//!
//! Commands:
//!   keys init|recover|status   - identity key pair lifecycle
//!   encrypt <files..>          - encrypt and upload through the background scheduler
//!   decrypt <file-id>          - download and decrypt one file
//!   grant <file-id>            - share an uploaded file with another reader
//!   delete <file-id>           - remove an uploaded file (author only)
//!   text seal|open             - encrypt or decrypt a text field
//!   cache clear                - forget every cached password key
//!   config show                - display current configuration

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use inkseal_core::config::{InksealConfig, KeyStoreKind, LoggingConfig, StorageBackend};
use inkseal_core::store::{MetadataStore, ProfileDirectory, SecureKeyStore};
use inkseal_core::{encoding, TaskId, TaskStatus};
use inkseal_crypto::{IdentityKeyService, KeySource, PasswordKeyCache, PrimitiveProvider};
use inkseal_storage::operator::{build_fs_operator, expand_home};
use inkseal_storage::{
    build_from_core_config, FileKeyStore, JsonMetadataStore, JsonProfileDirectory, KeychainStore,
    MemoryKeyStore, OpendalObjectStore,
};
use inkseal_sync::{BackgroundTaskScheduler, EncryptRequest, FileEncryptionPipeline, FileSource};

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "inkseal",
    version,
    about = "inkseal end-to-end encryption client",
    long_about = "inkseal: manage identity keys, encrypt and share files, seal text fields"
)]
struct Cli {
    /// Path to inkseal.toml configuration file
    #[arg(
        long,
        short = 'c',
        env = "INKSEAL_CONFIG",
        default_value = "~/.config/inkseal/inkseal.toml"
    )]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct UserArg {
    /// Signed-in user
    #[arg(long = "as", env = "INKSEAL_USER", value_name = "USER")]
    user: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Identity key management
    Keys {
        #[command(subcommand)]
        action: KeysAction,
    },

    /// Encrypt and upload files for yourself and optional recipients
    ///
    /// Files are processed in the background, a few at a time. Ctrl-C
    /// cancels everything still outstanding.
    Encrypt {
        /// Local files to encrypt
        #[arg(required = true)]
        files: Vec<PathBuf>,
        #[command(flatten)]
        who: UserArg,
        /// Additional readers (repeatable)
        #[arg(long = "to", value_name = "USER")]
        recipients: Vec<String>,
    },

    /// Download and decrypt a file
    Decrypt {
        file_id: String,
        #[command(flatten)]
        who: UserArg,
        /// Where to write the plaintext
        #[arg(long, short = 'o')]
        out: PathBuf,
    },

    /// Give another user read access to a file you uploaded
    Grant {
        file_id: String,
        #[command(flatten)]
        who: UserArg,
        #[arg(long = "to", value_name = "USER")]
        reader: String,
    },

    /// Delete a file you uploaded
    Delete {
        file_id: String,
        #[command(flatten)]
        who: UserArg,
    },

    /// Encrypt or decrypt short text fields
    Text {
        #[command(subcommand)]
        action: TextAction,
    },

    /// Password key cache management
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum KeysAction {
    /// Create an identity, or load/recover the existing one
    Init {
        #[command(flatten)]
        who: UserArg,
        /// Replace any existing identity and backup with a new key pair
        #[arg(long)]
        rotate: bool,
    },
    /// Restore the identity on this device from the password-protected backup
    Recover {
        #[command(flatten)]
        who: UserArg,
    },
    /// Show local and remote key state
    Status {
        #[command(flatten)]
        who: UserArg,
    },
}

#[derive(Subcommand, Debug)]
enum TextAction {
    /// Print the encrypted form of TEXT
    Seal {
        text: String,
        #[command(flatten)]
        who: UserArg,
    },
    /// Print the plaintext of an encrypted field
    Open {
        field: String,
        #[command(flatten)]
        who: UserArg,
    },
}

#[derive(Subcommand, Debug)]
enum CacheAction {
    /// Forget every cached and persisted password key
    Clear,
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the active configuration (merged defaults + config file)
    Show,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = expand_home(&cli.config);
    let (config, found) = load_config(&config_path).await?;
    init_logging(&config.logging);
    if !found {
        warn!(path = %config_path.display(), "config file not found, using defaults");
    }

    match cli.command {
        Commands::Config {
            action: ConfigAction::Show,
        } => cmd_config_show(&config, &config_path, found),
        command => {
            let engine = Engine::build(&config)?;
            run(&engine, &config, command).await
        }
    }
}

async fn run(engine: &Engine, config: &InksealConfig, command: Commands) -> Result<()> {
    match command {
        Commands::Keys { action } => match action {
            KeysAction::Init { who, rotate } => cmd_keys_init(engine, &who.user, rotate).await,
            KeysAction::Recover { who } => cmd_keys_recover(engine, &who.user).await,
            KeysAction::Status { who } => cmd_keys_status(engine, &who.user).await,
        },
        Commands::Encrypt {
            files,
            who,
            recipients,
        } => cmd_encrypt(engine, config, &files, &who.user, &recipients).await,
        Commands::Decrypt { file_id, who, out } => {
            cmd_decrypt(engine, &file_id, &who.user, &out).await
        }
        Commands::Grant {
            file_id,
            who,
            reader,
        } => {
            sign_in(engine, &who.user).await?;
            let meta = engine.pipeline.grant_access(&file_id, &reader).await?;
            println!(
                "{file_id}: readable by {}",
                meta.encrypted_keys
                    .iter()
                    .map(|e| e.user_id.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
            Ok(())
        }
        Commands::Delete { file_id, who } => {
            engine.pipeline.delete_file(&file_id, &who.user).await?;
            println!("deleted {file_id}");
            Ok(())
        }
        Commands::Text { action } => match action {
            TextAction::Seal { text, who } => {
                sign_in(engine, &who.user).await?;
                println!("{}", engine.identity.encrypt_field(&text)?);
                Ok(())
            }
            TextAction::Open { field, who } => {
                sign_in(engine, &who.user).await?;
                println!("{}", engine.identity.decrypt_field(&field)?);
                Ok(())
            }
        },
        Commands::Cache {
            action: CacheAction::Clear,
        } => {
            engine.identity.sign_out().await?;
            println!("password key cache cleared");
            Ok(())
        }
        Commands::Config { .. } => Ok(()),
    }
}

/// Returns the config and whether a file was found.
async fn load_config(path: &Path) -> Result<(InksealConfig, bool)> {
    if path.exists() {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading config: {}", path.display()))?;
        let config = InksealConfig::from_toml_str(&content)
            .with_context(|| format!("parsing config: {}", path.display()))?;
        Ok((config, true))
    } else {
        Ok((InksealConfig::default(), false))
    }
}

/// `INKSEAL_LOG` wins over `RUST_LOG`, which wins over `[logging] level`.
/// Logs go to stderr so command output stays pipeable.
fn init_logging(logging: &LoggingConfig) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_env("INKSEAL_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(&logging.level));

    if logging.format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

// ── Engine wiring ─────────────────────────────────────────────────────────────

struct Engine {
    identity: Arc<IdentityKeyService>,
    pipeline: Arc<FileEncryptionPipeline>,
}

impl Engine {
    fn build(config: &InksealConfig) -> Result<Self> {
        let provider = Arc::new(
            PrimitiveProvider::from_config(&config.crypto).context("initializing crypto")?,
        );

        let local: Arc<dyn SecureKeyStore> = match config.secrets.key_store {
            KeyStoreKind::Keychain => {
                let keychain = KeychainStore::default();
                if !keychain.is_available() {
                    anyhow::bail!(
                        "platform keychain unavailable; set secrets.key_store = \"file\" in config"
                    );
                }
                Arc::new(keychain)
            }
            KeyStoreKind::File => Arc::new(FileKeyStore::new(expand_home(&config.secrets.key_dir))),
            KeyStoreKind::Memory => Arc::new(MemoryKeyStore::new()),
        };

        let records = build_fs_operator(&config.profile.data_dir)
            .context("opening profile and metadata records")?;
        let profiles: Arc<dyn ProfileDirectory> =
            Arc::new(JsonProfileDirectory::new(records.clone()));
        let metadata: Arc<dyn MetadataStore> = Arc::new(JsonMetadataStore::new(records));

        let objects = Arc::new(build_object_store(config)?);

        let cache = Arc::new(PasswordKeyCache::with_store(
            Arc::clone(&provider),
            Arc::clone(&local),
            config.cache.clone(),
        ));
        let identity = Arc::new(IdentityKeyService::new(
            provider,
            cache,
            profiles,
            local,
            config.crypto.kdf_iterations,
        ));
        let pipeline = Arc::new(FileEncryptionPipeline::new(
            Arc::clone(&identity),
            objects,
            metadata,
            config.pipeline.clone(),
        ));

        Ok(Self { identity, pipeline })
    }
}

/// Blob storage from `[storage]`. S3 credentials come from AWS_ACCESS_KEY_ID
/// and AWS_SECRET_ACCESS_KEY.
fn build_object_store(config: &InksealConfig) -> Result<OpendalObjectStore> {
    let (access_key, secret_key) = if config.storage.backend == StorageBackend::S3 {
        let access_key = std::env::var("AWS_ACCESS_KEY_ID")
            .or_else(|_| std::env::var("INKSEAL_ACCESS_KEY_ID"))
            .context(
                "S3 credentials not set\n\
                 Set AWS_ACCESS_KEY_ID and AWS_SECRET_ACCESS_KEY environment variables.",
            )?;
        let secret_key = std::env::var("AWS_SECRET_ACCESS_KEY")
            .or_else(|_| std::env::var("INKSEAL_SECRET_ACCESS_KEY"))
            .context("AWS_SECRET_ACCESS_KEY not set")?;
        (access_key, secret_key)
    } else {
        (String::new(), String::new())
    };
    let op = build_from_core_config(&config.storage, &access_key, &secret_key)
        .context("building storage operator")?;
    Ok(OpendalObjectStore::new(op, config.storage.max_object_bytes))
}

/// `INKSEAL_PASSWORD` if set, otherwise an interactive prompt.
fn read_password(prompt: &str) -> Result<SecretString> {
    if let Ok(password) = std::env::var("INKSEAL_PASSWORD") {
        return Ok(SecretString::from(password));
    }
    let password = rpassword::prompt_password(prompt).context("reading password")?;
    Ok(SecretString::from(password))
}

/// Start a session for `user`: local key first, then the remote backup.
async fn sign_in(engine: &Engine, user: &str) -> Result<()> {
    if engine.identity.load_local(user).await?.is_some() {
        return Ok(());
    }
    let password = read_password(&format!("Password for {user}: "))?;
    match engine.identity.recover_from_backup(user, &password).await {
        Ok(Some(_)) => {
            info!(user, "identity recovered onto this device");
            Ok(())
        }
        Ok(None) => anyhow::bail!("no identity for {user}; run `inkseal keys init --as {user}`"),
        Err(e) if e.is_password_error() => anyhow::bail!("wrong password for {user}"),
        Err(e) => Err(e.into()),
    }
}

// ── `inkseal keys` ────────────────────────────────────────────────────────────

async fn cmd_keys_init(engine: &Engine, user: &str, rotate: bool) -> Result<()> {
    let password = read_password(&format!("Password for {user}: "))?;

    if rotate {
        if std::env::var("INKSEAL_PASSWORD").is_err() {
            let confirm = read_password("Confirm password: ")?;
            if confirm.expose_secret() != password.expose_secret() {
                anyhow::bail!("passwords do not match");
            }
        }
        let keys = engine.identity.generate_and_backup(user, &password).await?;
        println!("rotated identity for {user}");
        println!("public key: {}", encoding::encode(keys.public_key()));
        return Ok(());
    }

    let source = match engine.identity.ensure_keys(user, &password).await {
        Ok(source) => source,
        Err(e) if e.is_password_error() => {
            anyhow::bail!("{user} already has a backup and the password did not unlock it")
        }
        Err(e) => return Err(e.into()),
    };
    let public = engine.identity.public_key()?;
    let what = match source {
        KeySource::Local => "loaded existing identity from this device",
        KeySource::Recovered => "recovered existing identity from backup",
        KeySource::Generated => "created and backed up a new identity",
    };
    println!("{user}: {what}");
    println!("public key: {}", encoding::encode(&public));
    Ok(())
}

async fn cmd_keys_recover(engine: &Engine, user: &str) -> Result<()> {
    let password = read_password(&format!("Password for {user}: "))?;
    match engine.identity.recover_from_backup(user, &password).await {
        Ok(Some(keys)) => {
            println!("recovered identity for {user}");
            println!("public key: {}", encoding::encode(keys.public_key()));
            Ok(())
        }
        Ok(None) => anyhow::bail!("{user} has no key backup"),
        Err(e) if e.is_password_error() => anyhow::bail!("wrong password for {user}"),
        Err(e) => Err(e.into()),
    }
}

async fn cmd_keys_status(engine: &Engine, user: &str) -> Result<()> {
    let local = engine.identity.load_local(user).await?;
    let backup = engine.identity.has_backup(user).await?;
    let published = engine.identity.public_key_of(user).await?;

    println!("user:        {user}");
    println!(
        "this device: {}",
        if local.is_some() { "key present" } else { "no key" }
    );
    println!("backup:      {}", if backup { "yes" } else { "no" });
    match published {
        Some(key) => println!("public key:  {}", encoding::encode(&key)),
        None => println!("public key:  (not published)"),
    }
    if let (Some(local), Some(published)) = (&local, published) {
        if *local.public_key() != published {
            warn!(user, "local key does not match the published public key");
        }
    }
    Ok(())
}

// ── `inkseal encrypt` ─────────────────────────────────────────────────────────

fn make_progress_bar(multi: &MultiProgress, prefix: &str) -> Result<ProgressBar> {
    let pb = multi.add(ProgressBar::new(100));
    pb.set_style(
        ProgressStyle::with_template("{prefix:.bold} [{bar:40.cyan/blue}] {pos:>3}% {msg}")
            .context("progress bar template")?
            .progress_chars("=>-"),
    );
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    Ok(pb)
}

async fn cmd_encrypt(
    engine: &Engine,
    config: &InksealConfig,
    files: &[PathBuf],
    user: &str,
    recipients: &[String],
) -> Result<()> {
    sign_in(engine, user).await?;

    let scheduler = BackgroundTaskScheduler::new(Arc::clone(&engine.pipeline), &config.scheduler);
    let mut events = scheduler.subscribe();
    let multi = MultiProgress::new();

    let mut names: HashMap<TaskId, String> = HashMap::new();
    let mut bars: HashMap<TaskId, ProgressBar> = HashMap::new();
    for path in files {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .with_context(|| format!("not a file: {}", path.display()))?;
        let id = scheduler.submit(EncryptRequest {
            source: FileSource::Path(path.clone()),
            mime_type: guess_mime(path).to_string(),
            file_name: file_name.clone(),
            author_id: user.to_string(),
            recipient_ids: recipients.to_vec(),
        });
        bars.insert(id, make_progress_bar(&multi, &file_name)?);
        names.insert(id, file_name);
    }
    let ids: Vec<TaskId> = names.keys().copied().collect();

    let mut outstanding: HashSet<TaskId> = ids.iter().copied().collect();
    while !outstanding.is_empty() {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    let Some(bar) = bars.get(&event.id) else { continue };
                    bar.set_position(u64::from(event.progress));
                    match event.status {
                        TaskStatus::Completed => bar.finish_with_message("done"),
                        TaskStatus::Failed => bar.abandon_with_message(format!(
                            "failed: {}",
                            event.error.unwrap_or_default()
                        )),
                        TaskStatus::Cancelled => bar.abandon_with_message("cancelled"),
                        status => bar.set_message(status.to_string()),
                    }
                    if event.status.is_terminal() {
                        outstanding.remove(&event.id);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "progress events dropped");
                    outstanding.retain(|id| {
                        scheduler
                            .status(*id)
                            .is_some_and(|t| !t.status.is_terminal())
                    });
                }
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                eprintln!("interrupted, cancelling outstanding files");
                scheduler.shutdown().await;
                break;
            }
        }
    }

    let completed = scheduler.wait_for_tasks(&ids).await;
    println!();
    for task in &completed {
        let name = names.get(&task.id).map(String::as_str).unwrap_or("?");
        println!(
            "{name} -> {} ({}, {} reader(s))",
            task.output.file_id,
            fmt_bytes(task.output.encrypted_size),
            task.output.encrypted_keys.len()
        );
    }

    let failed = ids.len() - completed.len();
    if failed > 0 {
        anyhow::bail!("{failed} of {} file(s) were not uploaded", ids.len());
    }
    Ok(())
}

// ── `inkseal decrypt` ─────────────────────────────────────────────────────────

async fn cmd_decrypt(engine: &Engine, file_id: &str, user: &str, out: &Path) -> Result<()> {
    sign_in(engine, user).await?;
    let plaintext = engine
        .pipeline
        .download_and_decrypt(file_id, user)
        .await
        .with_context(|| format!("decrypting {file_id}"))?;
    tokio::fs::write(out, &plaintext)
        .await
        .with_context(|| format!("writing {}", out.display()))?;
    println!(
        "{file_id} -> {} ({})",
        out.display(),
        fmt_bytes(plaintext.len() as u64)
    );
    Ok(())
}

// ── `inkseal config show` ─────────────────────────────────────────────────────

fn cmd_config_show(config: &InksealConfig, config_path: &Path, found: bool) -> Result<()> {
    if found {
        println!("# Configuration from: {}", config_path.display());
    } else {
        println!(
            "# Configuration: defaults (no file at {})",
            config_path.display()
        );
    }
    println!();
    let rendered = toml::to_string_pretty(config).context("serializing config to TOML")?;
    print!("{rendered}");
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// MIME type from the file extension; only matters for the compression decision.
fn guess_mime(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "txt" | "md" | "log" => "text/plain",
        "json" => "application/json",
        "csv" => "text/csv",
        "html" | "htm" => "text/html",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "heic" => "image/heic",
        "mp4" | "m4v" => "video/mp4",
        "mov" => "video/quicktime",
        "mp3" => "audio/mpeg",
        "m4a" => "audio/mp4",
        "wav" => "audio/wav",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "gz" => "application/gzip",
        _ => "application/octet-stream",
    }
}

fn fmt_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
