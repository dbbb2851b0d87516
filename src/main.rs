use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use instpak::error::{Result, SetupError};
use instpak::installer::{self, InstallOptions};
use instpak::keys::ksr::KeySigningRequest;
use instpak::keys::package_sig;
use instpak::keys::pki::TrustStore;
use instpak::keys::signed::{SignedKeyPair, SignedPublicKey};
use instpak::keys::suite::KeySuite;
use instpak::keys::{PKI_DOMAIN, SIGNED_KEY_PURPOSE};
use instpak::password::{self, secret::SecretVec};

#[derive(Parser)]
#[command(name = "instpak")]
#[command(about = "Signed installer packages: create, sign, extract, install")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a private key suite and its key signing request
    #[command(name = "createKey")]
    CreateKey {
        /// Output path for the encrypted suite (e.g. private.key)
        #[arg(long)]
        path: PathBuf,
        /// Owner email recorded in the KSR
        #[arg(long)]
        email: String,
        /// Environment variable holding the password (stdin when omitted)
        #[arg(long)]
        pwd: Option<String>,
        /// Bind the suite to the machine TPM
        #[arg(long)]
        tpm: bool,
    },

    /// Dump and validate a key signing request
    #[command(name = "printKsr")]
    PrintKsr {
        /// KSR file to inspect
        ksr: PathBuf,
    },

    /// Sign a requester's KSR with the vendor suite
    #[command(name = "signKey")]
    SignKey {
        /// KSR file from the requester
        ksr: PathBuf,
        /// Output path for the signed public key pair
        output: PathBuf,
        /// Vendor private key suite
        #[arg(long)]
        key: PathBuf,
        #[arg(long)]
        pwd: Option<String>,
        #[arg(long)]
        tpm: bool,
    },

    /// Merge vendor-signed public keys back into the local suite
    #[command(name = "finalizeKey")]
    FinalizeKey {
        /// Signed public key pair issued by the vendor
        signed: PathBuf,
        /// Local private key suite to finalize
        #[arg(long)]
        key: PathBuf,
        /// PKI trust store the signed keys must chain to
        #[arg(long = "vendorPki")]
        vendor_pki: PathBuf,
        #[arg(long)]
        pwd: Option<String>,
        #[arg(long)]
        tpm: bool,
    },

    /// Write a signed PKI trust store anchored on a vendor suite
    #[command(name = "exportPki")]
    ExportPki {
        /// Output path for the trust store
        output: PathBuf,
        /// Vendor private key suite to anchor and sign the store with
        #[arg(long)]
        key: PathBuf,
        #[arg(long)]
        pwd: Option<String>,
        #[arg(long)]
        tpm: bool,
    },

    /// Build a package from a directory tree
    Create {
        /// Output package file
        #[arg(long)]
        create: PathBuf,
        /// Source directory to pack
        #[arg(long)]
        path: PathBuf,
        /// Sign the package with this finalized suite
        #[arg(long)]
        sign: Option<PathBuf>,
        #[arg(long)]
        pwd: Option<String>,
        #[arg(long)]
        tpm: bool,
    },

    /// Unpack a package without running its setup
    Extract {
        /// Package file to unpack
        #[arg(long)]
        extract: PathBuf,
        /// Target directory
        #[arg(long)]
        path: PathBuf,
    },

    /// Verify, extract, and run a package's setup
    Install {
        /// Package file or HTTPS URL
        #[arg(long)]
        install: String,
        /// Temp root for the extraction directory
        #[arg(long)]
        path: PathBuf,
        /// Application directory handed to the setup child (default: cwd)
        #[arg(long = "appPath")]
        app_path: Option<PathBuf>,
        /// Permit a package without a detached signature
        #[arg(long = "allowUnsigned")]
        allow_unsigned: bool,
        /// Spawn-and-wait even when the descriptor demands exit
        #[arg(long = "skipExit")]
        skip_exit: bool,
        /// PKI trust store for signature verification
        #[arg(long = "vendorPki")]
        vendor_pki: Option<PathBuf>,
        /// Post-setup command to chain
        #[arg(long)]
        cmd: Option<String>,
        /// Arguments for the post-setup command
        #[arg(long)]
        args: Option<String>,
        /// Extra arguments passed through to the setup child
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        rest: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    match run(cli.command, &cancel).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("{e}");
            ExitCode::from(exit_code_for(&e))
        }
    }
}

/// Exit-code mapping: 2 for an invalid KSR, the child's code for a failed
/// setup, 1 for everything else.
fn exit_code_for(error: &SetupError) -> u8 {
    match error {
        SetupError::InvalidKsr(_) => 2,
        SetupError::SetupFailed(code) => clamp_exit(*code),
        _ => 1,
    }
}

fn clamp_exit(code: i32) -> u8 {
    u8::try_from(code).unwrap_or(1)
}

async fn run(command: Commands, cancel: &CancellationToken) -> Result<u8> {
    match command {
        Commands::CreateKey {
            path,
            email,
            pwd,
            tpm,
        } => {
            let finalized = finalized_password(pwd.as_deref(), tpm).await?;
            let suite = KeySuite::generate();
            suite.save(&path, &finalized)?;

            let ksr = KeySigningRequest::new(&suite, &email, "package signing")?;
            let ksr_path = sidecar(&path, "ksr");
            ksr.save(&ksr_path)?;
            info!(
                suite = %path.display(),
                ksr = %ksr_path.display(),
                key = %suite.primary_key_id(),
                "Key suite created"
            );
            Ok(0)
        }

        Commands::PrintKsr { ksr } => {
            let request = KeySigningRequest::load(&ksr)?;
            request.validate()?;
            request.validate_attributes()?;

            println!("purpose: {}", request.purpose);
            println!(
                "primary key id: {}",
                instpak::keys::key_id(&request.primary_public)
            );
            println!(
                "counter key id: {}",
                instpak::keys::key_id(&request.counter_public)
            );
            for (key, value) in &request.attributes {
                println!("{key}: {value}");
            }
            println!("self-signature: valid");
            Ok(0)
        }

        Commands::SignKey {
            ksr,
            output,
            key,
            pwd,
            tpm,
        } => {
            let finalized = finalized_password(pwd.as_deref(), tpm).await?;
            let vendor = KeySuite::load(&key, &finalized)?;

            let request = KeySigningRequest::load(&ksr)?;
            request.validate()?;
            request.validate_attributes()?;

            let signed = SignedKeyPair {
                primary: SignedPublicKey::issue(
                    &request.primary_public,
                    &vendor,
                    SIGNED_KEY_PURPOSE,
                )?,
                counter: SignedPublicKey::issue(
                    &request.counter_public,
                    &vendor,
                    SIGNED_KEY_PURPOSE,
                )?,
            };
            signed.save(&output)?;
            info!(output = %output.display(), "Signed public key pair issued");
            Ok(0)
        }

        Commands::FinalizeKey {
            signed,
            key,
            vendor_pki,
            pwd,
            tpm,
        } => {
            let finalized = finalized_password(pwd.as_deref(), tpm).await?;
            let mut suite = KeySuite::load(&key, &finalized)?;

            let store = TrustStore::load(&vendor_pki)?;
            let pair = SignedKeyPair::load(&signed)?;
            store.validate_chain(&pair.primary, PKI_DOMAIN)?;
            store.validate_chain(&pair.counter, PKI_DOMAIN)?;

            suite.attach_signed_keys(pair.primary, pair.counter)?;
            suite.save(&key, &finalized)?;
            info!(suite = %key.display(), "Key suite finalized");
            Ok(0)
        }

        Commands::ExportPki {
            output,
            key,
            pwd,
            tpm,
        } => {
            let finalized = finalized_password(pwd.as_deref(), tpm).await?;
            let suite = KeySuite::load(&key, &finalized)?;

            let mut store = TrustStore::new();
            store.add_suite(&suite, PKI_DOMAIN);
            store.save(&output, Some(&suite))?;
            info!(output = %output.display(), "Trust store written");
            Ok(0)
        }

        Commands::Create {
            create,
            path,
            sign,
            pwd,
            tpm,
        } => {
            let len = installer::create_package(&path, &create, cancel).await?;

            if let Some(suite_path) = sign {
                let finalized = finalized_password(pwd.as_deref(), tpm).await?;
                let suite = KeySuite::load(&suite_path, &finalized)?;
                let signature = package_sig::sign_package(&suite, &create)?;
                signature.save(&package_sig::sig_path(&create))?;
            }

            // Contract: the uncompressed byte length is the last stdout line.
            println!("{len}");
            Ok(0)
        }

        Commands::Extract { extract, path } => {
            let stats = installer::extract_package(&extract, &path, cancel).await?;
            info!(files = stats.files, bytes = stats.bytes, "Package extracted");
            Ok(0)
        }

        Commands::Install {
            install,
            path,
            app_path,
            allow_unsigned,
            skip_exit,
            vendor_pki,
            cmd,
            args,
            rest,
        } => {
            let trust_store = match vendor_pki {
                Some(pki_path) => Some(TrustStore::load(&pki_path)?),
                None => None,
            };

            let package_path = resolve_source(&install, &path, cancel).await?;
            let options = InstallOptions {
                temp_root: path,
                app_path: match app_path {
                    Some(dir) => dir,
                    None => std::env::current_dir()?,
                },
                allow_unsigned,
                skip_exit,
                trust_store,
                pass_through: rest,
                post_command: cmd,
                post_command_args: args,
            };

            let outcome = installer::install(&package_path, &options, cancel).await?;
            if outcome.require_exit {
                info!("Setup child spawned; exiting so files can be replaced");
                return Ok(0);
            }

            print!("{}", outcome.stdout);
            eprint!("{}", outcome.stderr);
            Ok(clamp_exit(outcome.exit_code))
        }
    }
}

/// Acquire and finalize the password, resolving the TPM when requested.
async fn finalized_password(env_var: Option<&str>, tpm: bool) -> Result<SecretVec> {
    let raw = password::acquire(env_var).await?;
    let binding = if tpm {
        Some(password::tpm::detect().ok_or(SetupError::TpmUnavailable)?)
    } else {
        None
    };
    password::finalize(&raw, binding.as_deref())
}

/// A package source is a local file or an HTTPS URL; URLs are streamed to
/// disk (with their `.sig` sidecar, when present) before installation.
async fn resolve_source(
    source: &str,
    temp_root: &Path,
    cancel: &CancellationToken,
) -> Result<PathBuf> {
    if !(source.starts_with("http://") || source.starts_with("https://")) {
        return Ok(PathBuf::from(source));
    }

    tokio::fs::create_dir_all(temp_root).await?;
    let name = source
        .rsplit('/')
        .next()
        .filter(|n| !n.is_empty())
        .unwrap_or("package.pkg");
    let dest = temp_root.join(name);
    installer::fetch_package(source, &dest, cancel).await?;

    // A missing remote signature falls under the unsigned-package policy.
    let sig_url = format!("{source}.sig");
    let sig_dest = package_sig::sig_path(&dest);
    if let Err(e) = installer::fetch_package(&sig_url, &sig_dest, cancel).await {
        let _ = tokio::fs::remove_file(&sig_dest).await;
        tracing::warn!(error = %e, "No detached signature at package URL");
    }
    Ok(dest)
}

/// `<path>.<ext>` next to the original file.
fn sidecar(path: &Path, ext: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(ext);
    PathBuf::from(name)
}
