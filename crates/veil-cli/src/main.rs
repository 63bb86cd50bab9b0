//! veilctl: work with veilfs-encrypted files under a local directory
//!
//! Files are addressed as `<path>` inside a volume, where a volume is a
//! subdirectory of `--root`:
//!   inspect <path>               - show the header of a file
//!   encrypt <path> --payload ..  - encrypt a plain file in place
//!   decrypt <path>               - decrypt a file in place
//!   rekey <path> --new-key ..    - re-encrypt under another entity key
//!   cat <path>                   - print the decrypted content
//!   keygen                       - print a random entity key (base64)
//!   config show                  - print the active configuration

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use rand::RngCore;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use veil_core::config::{LogConfig, VeilConfig};
use veil_core::{HandleId, NormalizedPath, SessionId};
use veil_crypto::EntityKey;
use veil_engine::header::smallest_block_for;
use veil_engine::{
    Disposition, Engine, EntitySpec, Header, MigrationReport, OpenRequest, CIPHER_CHACHA20,
    DEEPNESS_UNLIMITED,
};
use veil_storage::{check_health, LocalStack, StorageStack};

const SESSION: SessionId = SessionId(1);
const READ_CHUNK: usize = 64 * 1024;

#[derive(Parser, Debug)]
#[command(
    name = "veilctl",
    version,
    about = "Inspect and convert veilfs-encrypted files",
    long_about = "veilctl: inspect, encrypt, decrypt, rekey and read veilfs files stored in a local directory"
)]
struct Cli {
    /// Path to veil.toml configuration file
    #[arg(long, short = 'c', env = "VEIL_CONFIG", default_value = "/etc/veil/veil.toml")]
    config: PathBuf,

    /// Directory holding one subdirectory per volume
    #[arg(long, env = "VEIL_ROOT", default_value = ".")]
    root: PathBuf,

    /// Volume (subdirectory of the root) the paths live in
    #[arg(long, short = 'V', env = "VEIL_VOLUME", default_value = "vol")]
    volume: String,

    /// Sector size reported for the volume
    #[arg(long, default_value_t = 512)]
    sector_size: u32,

    /// Log level (trace, debug, info, warn, error); overrides [log] level
    #[arg(long, env = "VEIL_LOG")]
    log: Option<String>,

    /// Log format; overrides [log] format
    #[arg(long, env = "VEIL_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show the header of a file
    Inspect {
        path: String,
        /// Entity key (base64); also reports the logical length
        #[arg(long, env = "VEIL_KEY")]
        key: Option<String>,
    },

    /// Encrypt a plain file in place
    Encrypt {
        path: String,
        /// Entity key (base64)
        #[arg(long, env = "VEIL_KEY")]
        key: String,
        /// Policy payload stored in the header
        #[arg(long)]
        payload: String,
        /// Header block size (default: config default, grown to fit the payload)
        #[arg(long)]
        header_size: Option<u32>,
        /// Continue past an unreadable padding block
        #[arg(long)]
        recover: bool,
    },

    /// Decrypt a file in place
    Decrypt {
        path: String,
        #[arg(long, env = "VEIL_KEY")]
        key: String,
        #[arg(long)]
        recover: bool,
    },

    /// Re-encrypt a file under another entity key
    Rekey {
        path: String,
        /// Key the file is encrypted under now
        #[arg(long, env = "VEIL_KEY")]
        key: String,
        /// Key to encrypt under from now on
        #[arg(long)]
        new_key: String,
        #[arg(long)]
        recover: bool,
    },

    /// Write the decrypted content to stdout
    Cat {
        path: String,
        #[arg(long, env = "VEIL_KEY")]
        key: String,
    },

    /// Print a random entity key
    Keygen,

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the active configuration (defaults merged with the config file)
    Show,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

impl LogFormat {
    fn name(self) -> &'static str {
        match self {
            LogFormat::Json => "json",
            LogFormat::Text => "text",
        }
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let (mut config, found) = load_config(&cli.config).await?;
    apply_log_overrides(&cli, &mut config.log);
    init_logging(&config.log)?;
    if !found {
        tracing::warn!("config file not found: {}  (using defaults)", cli.config.display());
    }

    match &cli.command {
        Commands::Keygen => return cmd_keygen(),
        Commands::Config { action: ConfigAction::Show } => return cmd_config_show(&config, &cli.config),
        _ => {}
    }

    let recover_default = config.engine.recovery_mode;
    match &cli.command {
        Commands::Inspect { path, key } => {
            let key = key.as_deref().map(parse_key).transpose()?;
            let volume = Volume::open(&cli, config, key.clone())?;
            cmd_inspect(&volume, path, key).await
        }
        Commands::Encrypt { path, key, payload, header_size, recover } => {
            let key = parse_key(key)?;
            let volume = Volume::open(&cli, config, Some(key.clone()))?;
            cmd_encrypt(&volume, path, key, payload, *header_size, *recover || recover_default).await
        }
        Commands::Decrypt { path, key, recover } => {
            let key = parse_key(key)?;
            let volume = Volume::open(&cli, config, Some(key.clone()))?;
            cmd_decrypt(&volume, path, key, *recover || recover_default).await
        }
        Commands::Rekey { path, key, new_key, recover } => {
            let present = parse_key(key)?;
            let future = parse_key(new_key).context("parsing --new-key")?;
            let volume = Volume::open(&cli, config, Some(present.clone()))?;
            cmd_rekey(&volume, path, present, future, *recover || recover_default).await
        }
        Commands::Cat { path, key } => {
            let key = parse_key(key)?;
            let volume = Volume::open(&cli, config, Some(key.clone()))?;
            cmd_cat(&volume, path, key).await
        }
        Commands::Keygen | Commands::Config { .. } => Ok(()),
    }
}

/// `--log` and `--log-format` win over the `[log]` section.
fn apply_log_overrides(cli: &Cli, log: &mut LogConfig) {
    if let Some(level) = &cli.log {
        log.level = level.clone();
    }
    if let Some(format) = cli.log_format {
        log.format = format.name().to_string();
    }
}

/// Install the subscriber described by `[log]`. Output goes to stderr so
/// `cat` keeps stdout for file content; `RUST_LOG` overrides the level.
fn init_logging(log: &LogConfig) -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let format = LogFormat::from_str(&log.format, true)
        .map_err(|e| anyhow::anyhow!("[log] format {:?}: {e}", log.format))?;
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&log.level)
            .with_context(|| format!("[log] level {:?}", log.level))?,
    };

    let layer = fmt::layer().with_writer(std::io::stderr).with_target(false);
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry.with(layer.json()).try_init(),
        LogFormat::Text => registry.with(layer.without_time()).try_init(),
    }
    .context("installing the log subscriber")
}

// ── Config loading ────────────────────────────────────────────────────────────

async fn load_config(path: &Path) -> Result<(VeilConfig, bool)> {
    if !path.exists() {
        return Ok((VeilConfig::default(), false));
    }
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading config: {}", path.display()))?;
    let config = VeilConfig::from_toml(&content)
        .with_context(|| format!("parsing config: {}", path.display()))?;
    Ok((config, true))
}

fn parse_key(text: &str) -> Result<EntityKey> {
    EntityKey::from_base64(text).context("entity key must be 32 bytes, base64 encoded")
}

// ── Engine over a local volume ────────────────────────────────────────────────

struct Volume {
    name: String,
    engine: Arc<Engine>,
    stack: Arc<LocalStack>,
    _agent: tokio::task::JoinHandle<()>,
}

impl Volume {
    /// Start an engine over the volume. AutoConfig key requests raised by
    /// our own opens are answered with `key`, or rejected without one.
    fn open(cli: &Cli, config: VeilConfig, key: Option<EntityKey>) -> Result<Self> {
        let stack = Arc::new(LocalStack::new(&cli.root, cli.sector_size));
        check_health(stack.as_ref(), &cli.volume)
            .with_context(|| format!("volume {} under {}", cli.volume, cli.root.display()))?;
        let storage: Arc<dyn StorageStack> = stack.clone();
        let engine = Arc::new(Engine::new(config, storage).context("starting engine")?);
        let agent = answer_key_requests(&engine, key);
        Ok(Volume {
            name: cli.volume.clone(),
            engine,
            stack,
            _agent: agent,
        })
    }

    fn name_of(&self, path: &str) -> String {
        format!("{}/{}", self.name, path.trim_start_matches(['/', '\\']))
    }

    async fn open_path(&self, path: &str) -> Result<HandleId> {
        let name = self.name_of(path);
        let handle = self
            .engine
            .open(OpenRequest::file(&name, SESSION).with_disposition(Disposition::Open))
            .await
            .with_context(|| format!("opening {name}"))?;
        Ok(handle)
    }

    /// Header currently stored in front of `path`, read without a key.
    async fn stored_header(&self, path: &str) -> Result<(NormalizedPath, Option<Header>)> {
        let handle = self.open_path(path).await?;
        let result = self
            .engine
            .handle_path(handle)
            .and_then(|p| Ok((p, self.engine.get_header(handle)?)));
        self.engine.close(handle)?;
        Ok(result?)
    }

    /// Open an encrypted file with `key`, registering a file entity for it.
    async fn unlock(&self, path: &str, key: &EntityKey) -> Result<HandleId> {
        let (normalized, header) = self.stored_header(path).await?;
        let header = header.with_context(|| format!("{path} is not encrypted"))?;
        self.engine
            .add_entity(EntitySpec::file(normalized, header.payload, key.clone()))
            .context("registering file policy")?;
        let handle = self.open_path(path).await?;
        if !self.engine.is_encrypted(handle)? {
            self.engine.close(handle)?;
            anyhow::bail!("{path} did not open as an encrypted file");
        }
        Ok(handle)
    }

    fn physical_size(&self, path: &NormalizedPath) -> Result<u64> {
        let info = self
            .stack
            .lookup(path)?
            .with_context(|| format!("{path} disappeared"))?;
        Ok(info.size)
    }
}

fn answer_key_requests(engine: &Arc<Engine>, key: Option<EntityKey>) -> tokio::task::JoinHandle<()> {
    let mut agent = engine.connect_key_broker();
    let engine = Arc::clone(engine);
    tokio::spawn(async move {
        while let Some(request) = agent.next().await {
            tracing::debug!(cookie = request.cookie, path = %request.path, "key request");
            let answered = match &key {
                Some(key) => engine.fire_key_response(request.cookie, key.as_bytes()),
                None => engine.reject_key_request(request.cookie, "no --key given"),
            };
            if let Err(e) = answered {
                tracing::warn!(cookie = request.cookie, error = %e, "key response refused");
            }
        }
    })
}

fn print_report(action: &str, path: &str, report: &MigrationReport) {
    println!(
        "{action} {path}: {} bytes of content, header {} -> {}, {} bytes on disk{}",
        report.valid_length,
        report.present_header_size,
        report.future_header_size,
        report.physical_size,
        if report.recovered { " (length recovered)" } else { "" },
    );
}

// ── Commands ──────────────────────────────────────────────────────────────────

async fn cmd_inspect(volume: &Volume, path: &str, key: Option<EntityKey>) -> Result<()> {
    let (normalized, header) = volume.stored_header(path).await?;
    println!("path:          {normalized}");
    println!("physical size: {}", volume.physical_size(&normalized)?);
    let Some(header) = header else {
        println!("encrypted:     no");
        return Ok(());
    };
    println!("encrypted:     yes");
    println!("version:       {}", header.version);
    println!("cipher:        {}", header.cipher_id);
    println!("header size:   {}", header.block_size);
    if header.deepness == DEEPNESS_UNLIMITED {
        println!("deepness:      unlimited");
    } else {
        println!("deepness:      {}", header.deepness);
    }
    println!("payload crc:   {:#010x}", header.payload_crc());
    println!("payload:       {}", String::from_utf8_lossy(&header.payload));

    if let Some(key) = key {
        let handle = volume.unlock(path, &key).await?;
        let sizes = volume.engine.query_size(handle);
        volume.engine.close(handle)?;
        println!("length:        {}", sizes?.end_of_file);
    }
    Ok(())
}

async fn cmd_encrypt(
    volume: &Volume,
    path: &str,
    key: EntityKey,
    payload: &str,
    header_size: Option<u32>,
    recover: bool,
) -> Result<()> {
    let fits = smallest_block_for(payload.len())?;
    let block_size = header_size
        .unwrap_or(volume.engine.config().engine.default_header_size)
        .max(fits);
    let template = Header::new(CIPHER_CHACHA20, block_size, DEEPNESS_UNLIMITED, payload.as_bytes().to_vec())
        .context("building header")?;

    let handle = volume.open_path(path).await?;
    let report = volume.engine.enable_encryption(handle, &template, &key, recover);
    volume.engine.close(handle)?;
    print_report("encrypted", path, &report?);
    Ok(())
}

async fn cmd_decrypt(volume: &Volume, path: &str, key: EntityKey, recover: bool) -> Result<()> {
    let handle = volume.unlock(path, &key).await?;
    let report = volume.engine.disable_encryption(handle, &key, recover);
    volume.engine.close(handle)?;
    print_report("decrypted", path, &report?);
    Ok(())
}

async fn cmd_rekey(
    volume: &Volume,
    path: &str,
    present: EntityKey,
    future: EntityKey,
    recover: bool,
) -> Result<()> {
    let handle = volume.unlock(path, &present).await?;
    let report = volume.engine.rekey(handle, &present, &future, recover);
    volume.engine.close(handle)?;
    print_report("rekeyed", path, &report?);
    Ok(())
}

async fn cmd_cat(volume: &Volume, path: &str, key: EntityKey) -> Result<()> {
    let handle = volume.unlock(path, &key).await?;
    let copied = copy_out(&volume.engine, handle, &mut std::io::stdout().lock());
    volume.engine.close(handle)?;
    copied
}

fn copy_out(engine: &Engine, handle: HandleId, out: &mut impl Write) -> Result<()> {
    let mut offset = 0u64;
    loop {
        let chunk = engine.read(handle, offset, READ_CHUNK)?;
        if chunk.is_empty() {
            break;
        }
        out.write_all(&chunk).context("writing to stdout")?;
        offset += chunk.len() as u64;
    }
    out.flush().context("writing to stdout")
}

fn cmd_keygen() -> Result<()> {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    println!("{}", EntityKey::from_bytes(bytes).to_base64());
    Ok(())
}

fn cmd_config_show(config: &VeilConfig, path: &Path) -> Result<()> {
    println!("# config: {}", path.display());
    print!("{}", toml::to_string_pretty(config).context("serializing config")?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(root: &Path, args: &[&str]) -> Cli {
        let mut argv = vec!["veilctl", "--root", root.to_str().unwrap(), "--config", "/nonexistent/veil.toml"];
        argv.extend_from_slice(args);
        Cli::parse_from(argv)
    }

    fn key_b64(byte: u8) -> String {
        EntityKey::from_bytes([byte; 32]).to_base64()
    }

    fn setup(content: &[u8]) -> (tempfile::TempDir, Volume) {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("vol/docs")).unwrap();
        std::fs::write(tmp.path().join("vol/docs/a.txt"), content).unwrap();
        let volume = Volume::open(&cli(tmp.path(), &["keygen"]), VeilConfig::default(), None).unwrap();
        (tmp, volume)
    }

    #[test]
    fn parses_commands() {
        let parsed = cli(Path::new("/tmp"), &["encrypt", "docs/a.txt", "--key", "k", "--payload", "p"]);
        assert!(matches!(parsed.command, Commands::Encrypt { ref payload, .. } if payload == "p"));
        assert_eq!(parsed.volume, "vol");
    }

    #[test]
    fn log_flags_override_the_config_section() {
        let mut log = LogConfig::default();
        apply_log_overrides(&cli(Path::new("/tmp"), &["keygen"]), &mut log);
        assert_eq!((log.level.as_str(), log.format.as_str()), ("info", "text"));

        let flags = cli(Path::new("/tmp"), &["--log", "debug", "--log-format", "json", "keygen"]);
        apply_log_overrides(&flags, &mut log);
        assert_eq!((log.level.as_str(), log.format.as_str()), ("debug", "json"));
        assert_eq!(LogFormat::from_str("JSON", true), Ok(LogFormat::Json));
        assert!(LogFormat::from_str("xml", true).is_err());
    }

    #[test]
    fn rejects_short_keys() {
        assert!(parse_key("c2hvcnQ=").is_err());
        assert!(parse_key(&key_b64(1)).is_ok());
    }

    #[tokio::test]
    async fn encrypt_cat_rekey_decrypt() {
        let (tmp, volume) = setup(b"plain text on disk");
        let host = tmp.path().join("vol/docs/a.txt");
        let k1 = parse_key(&key_b64(1)).unwrap();
        let k2 = parse_key(&key_b64(2)).unwrap();

        cmd_encrypt(&volume, "docs/a.txt", k1.clone(), "team", None, false)
            .await
            .unwrap();
        let stored = std::fs::read(&host).unwrap();
        assert_eq!(stored.len(), 512 + 512 + 512);
        assert_eq!(&stored[..4], b"VEIL");

        let handle = volume.unlock("docs/a.txt", &k1).await.unwrap();
        let mut out = Vec::new();
        copy_out(&volume.engine, handle, &mut out).unwrap();
        volume.engine.close(handle).unwrap();
        assert_eq!(out, b"plain text on disk");

        cmd_rekey(&volume, "docs/a.txt", k1.clone(), k2.clone(), false)
            .await
            .unwrap();

        // A fresh engine, as a second invocation would have
        let volume = Volume::open(&cli(tmp.path(), &["keygen"]), VeilConfig::default(), None).unwrap();
        assert!(cmd_decrypt(&volume, "docs/a.txt", k1, false).await.is_err());
        let volume = Volume::open(&cli(tmp.path(), &["keygen"]), VeilConfig::default(), None).unwrap();
        cmd_decrypt(&volume, "docs/a.txt", k2, false).await.unwrap();
        assert_eq!(std::fs::read(&host).unwrap(), b"plain text on disk");
    }

    #[tokio::test]
    async fn inspect_reports_plain_files() {
        let (_tmp, volume) = setup(b"x");
        let (path, header) = volume.stored_header("docs/a.txt").await.unwrap();
        assert!(header.is_none());
        assert_eq!(volume.physical_size(&path).unwrap(), 1);
    }
}
