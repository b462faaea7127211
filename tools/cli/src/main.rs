//! Lockbox CLI - Command line interface for the vault key engine.
//!
//! This tool creates account records and encrypts or decrypts single items
//! to envelope files, exercising the engine end to end.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use lockbox_common::{ItemId, Password};
use lockbox_crypto::envelope::now_millis;
use lockbox_crypto::{
    Algorithm, AlgorithmSelector, EncryptionEnvelope, KdfParams, KeyDerivationService,
    RustCryptoProvider, SecurityLevel,
};
use lockbox_vault::{AccountConfig, AccountOptions, VaultKeyHierarchy};

#[derive(Parser)]
#[command(name = "lockbox")]
#[command(about = "Lockbox - Zero-knowledge vault key engine")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new account record.
    Init {
        /// Where to write the account record.
        #[arg(short, long)]
        account: PathBuf,

        /// KDF strength: "interactive", "sensitive", or "paranoid".
        #[arg(short, long, default_value = "interactive")]
        level: String,

        /// Pin a cipher: "aes" or "xchacha". Detected when omitted.
        #[arg(short, long)]
        cipher: Option<String>,

        /// Auto-lock after this many idle seconds.
        #[arg(long)]
        auto_lock: Option<u64>,
    },

    /// Encrypt a file as one vault item.
    Encrypt {
        /// Path to the account record.
        #[arg(short, long)]
        account: PathBuf,

        /// Item identifier, bound to the envelope.
        #[arg(short, long)]
        item: String,

        /// Plaintext file.
        #[arg(short = 'f', long)]
        input: PathBuf,

        /// Envelope output file.
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Decrypt an envelope file.
    Decrypt {
        /// Path to the account record.
        #[arg(short, long)]
        account: PathBuf,

        /// Item identifier the envelope was written for.
        #[arg(short, long)]
        item: String,

        /// Envelope file.
        #[arg(short = 'f', long)]
        input: PathBuf,

        /// Plaintext output file.
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Show envelope metadata without decrypting.
    Inspect {
        /// Envelope file.
        #[arg(short, long)]
        envelope: PathBuf,
    },

    /// Detect hardware acceleration and benchmark both ciphers.
    Bench,

    /// Show KDF presets and estimated derivation times.
    Params,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Init {
            account,
            level,
            cipher,
            auto_lock,
        } => cmd_init(&account, &level, cipher.as_deref(), auto_lock).await,

        Commands::Encrypt {
            account,
            item,
            input,
            output,
        } => cmd_encrypt(&account, &item, &input, &output).await,

        Commands::Decrypt {
            account,
            item,
            input,
            output,
        } => cmd_decrypt(&account, &item, &input, &output).await,

        Commands::Inspect { envelope } => cmd_inspect(&envelope).await,

        Commands::Bench => cmd_bench(),

        Commands::Params => cmd_params(),
    }
}

/// Prompt for password securely.
fn prompt_password(prompt: &str) -> Result<Password> {
    let password = rpassword::prompt_password(prompt).context("Failed to read password")?;
    Ok(Password::from(password))
}

/// Load an account record and unlock it.
async fn open_vault(account: &Path) -> Result<VaultKeyHierarchy> {
    let config = AccountConfig::load(account).context("Failed to load account record")?;
    let vault = VaultKeyHierarchy::new(config).context("Failed to prepare vault")?;

    let password = prompt_password("Enter password: ")?;
    let report = vault
        .unlock(&password)
        .await
        .map_err(|e| anyhow::anyhow!(e.public_message()))
        .context("Failed to unlock")?;

    if report.kdf_upgrade_recommended {
        println!("Note: this account uses weaker KDF settings than recommended.");
    }
    Ok(vault)
}

/// Create a new account record.
async fn cmd_init(
    account: &Path,
    level: &str,
    cipher: Option<&str>,
    auto_lock: Option<u64>,
) -> Result<()> {
    info!("Creating account record: {}", account.display());

    if account.exists() {
        anyhow::bail!("Account record already exists: {}", account.display());
    }

    let level: SecurityLevel = level.parse().context("Invalid KDF level")?;
    let cipher_preference = cipher
        .map(str::parse::<Algorithm>)
        .transpose()
        .context("Invalid cipher")?;

    let password = prompt_password("Enter password: ")?;
    let confirm = prompt_password("Confirm password: ")?;
    if password.as_bytes() != confirm.as_bytes() {
        anyhow::bail!("Passwords do not match");
    }

    let params = KeyDerivationService::recommended_params(level);
    let options = AccountOptions {
        cipher_preference,
        auto_lock_secs: auto_lock,
        salt_length: None,
    };
    let config = tokio::task::spawn_blocking(move || {
        AccountConfig::create(&password, params, options)
    })
    .await?
    .context("Failed to create account")?;

    config.save(account).context("Failed to write account record")?;

    println!("Account created successfully!");
    println!("  KDF: {}", config.kdf_algorithm);
    println!("  Salt: {} bytes", config.salt.len());

    Ok(())
}

/// Encrypt a file as one vault item.
async fn cmd_encrypt(account: &Path, item: &str, input: &Path, output: &Path) -> Result<()> {
    info!("Encrypting {} as item {}", input.display(), item);

    let item_id = ItemId::new(item).context("Invalid item id")?;
    let content = tokio::fs::read(input)
        .await
        .context("Failed to read input file")?;

    let vault = open_vault(account).await?;
    let envelope = vault
        .encrypt_item(&item_id, &content)
        .await
        .context("Failed to encrypt item")?;
    vault.lock().await;

    tokio::fs::write(output, envelope.to_json()?)
        .await
        .context("Failed to write envelope")?;

    println!(
        "Item encrypted successfully: {} ({} bytes, {})",
        item,
        content.len(),
        envelope.algorithm
    );

    Ok(())
}

/// Decrypt an envelope file.
async fn cmd_decrypt(account: &Path, item: &str, input: &Path, output: &Path) -> Result<()> {
    info!("Decrypting item {} from {}", item, input.display());

    let item_id = ItemId::new(item).context("Invalid item id")?;
    let json = tokio::fs::read_to_string(input)
        .await
        .context("Failed to read envelope")?;
    let envelope = EncryptionEnvelope::from_json(&json).context("Invalid envelope")?;

    let vault = open_vault(account).await?;
    let result = vault.decrypt_item(&item_id, &envelope).await;
    vault.lock().await;

    let plaintext = result.map_err(|e| anyhow::anyhow!(e.public_message()))?;
    tokio::fs::write(output, plaintext.as_bytes())
        .await
        .context("Failed to write output file")?;

    println!("Item decrypted successfully: {} ({} bytes)", item, plaintext.len());

    Ok(())
}

/// Show envelope metadata without decrypting.
async fn cmd_inspect(path: &Path) -> Result<()> {
    let json = tokio::fs::read_to_string(path)
        .await
        .context("Failed to read envelope")?;
    let envelope = EncryptionEnvelope::from_json(&json).context("Invalid envelope")?;

    let created = DateTime::<Utc>::from_timestamp_millis(envelope.timestamp)
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| "invalid".to_string());

    println!("Envelope Information:");
    println!("  Algorithm: {}", envelope.algorithm);
    println!("  Nonce: {} bytes", envelope.nonce.len());
    println!("  Ciphertext: {} bytes", envelope.ciphertext.len());
    println!("  Tag: {} bytes", envelope.auth_tag.len());
    println!("  Created: {}", created);
    println!("  Age: {} s", envelope.age_ms(now_millis()) / 1000);

    Ok(())
}

/// Detect hardware acceleration and benchmark both ciphers.
fn cmd_bench() -> Result<()> {
    let selector = AlgorithmSelector::new(Arc::new(RustCryptoProvider::new()));

    println!(
        "Hardware acceleration: {}",
        if selector.detect_hardware_acceleration() {
            "detected"
        } else {
            "not detected"
        }
    );

    for algorithm in Algorithm::ALL {
        let score = selector
            .benchmark_algorithm(algorithm)
            .with_context(|| format!("Failed to benchmark {}", algorithm))?;
        println!("  {:<20} {:>12.0} ops/s", algorithm.name(), score);
    }

    let selection = selector.select_optimal_algorithm()?;
    println!("Selected: {} ({:?})", selection.algorithm, selection.reason);

    Ok(())
}

/// Show KDF presets and estimated derivation times.
fn cmd_params() -> Result<()> {
    let kdf = KeyDerivationService::probe();
    println!("Available KDF: {}", kdf.algorithm());

    let presets: [(&str, KdfParams); 3] = [
        ("interactive", KdfParams::interactive()),
        ("sensitive", KdfParams::sensitive()),
        ("paranoid", KdfParams::paranoid()),
    ];
    for (name, params) in presets {
        println!("  {}:", name);
        println!("    Memory: {} KiB", params.memory_cost);
        println!("    Time: {} iterations", params.time_cost);
        println!("    Parallelism: {}", params.parallelism);
        println!(
            "    Estimated: ~{} ms",
            kdf.estimate_derivation_time(&params).as_millis()
        );
    }

    Ok(())
}
