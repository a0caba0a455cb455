use std::path::PathBuf;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{WrapErr, eyre};
use crl_rewriter::{
    config::{Config, CrlConfig},
    crl::{CrlFile, CrlSummary, issuer_from_certificate, verify_signature},
    crypto::RsaPrivateKey,
    telemetry,
};
use num_bigint::BigInt;

/// Maintain an X.509 CRL by streaming rewrites
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// CRL file, overriding the configured path
    #[arg(long, value_name = "PATH", global = true)]
    crl: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a new CRL, replacing any existing file
    Init {
        /// Serial to revoke, decimal or 0x prefixed hex
        #[arg(long, value_name = "SERIAL", value_parser = parse_serial)]
        revoke: Vec<BigInt>,
    },
    /// Revoke and unrevoke serials in the existing CRL
    Update {
        #[arg(long, value_name = "SERIAL", value_parser = parse_serial)]
        revoke: Vec<BigInt>,

        #[arg(long, value_name = "SERIAL", value_parser = parse_serial)]
        unrevoke: Vec<BigInt>,
    },
    /// Print the CRL contents and check its signature
    Inspect,
}

fn parse_serial(value: &str) -> Result<BigInt, String> {
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => BigInt::parse_bytes(hex.as_bytes(), 16),
        None => BigInt::parse_bytes(value.as_bytes(), 10),
    };
    parsed.ok_or_else(|| format!("invalid serial number: {value}"))
}

fn open_crl_file(config: &CrlConfig, path: PathBuf) -> color_eyre::Result<CrlFile> {
    let key_pem = std::fs::read(&config.ca_key)
        .wrap_err_with(|| format!("reading CA key {}", config.ca_key))?;
    let key = RsaPrivateKey::from_pem(key_pem)?;

    let issuer = match &config.ca_cert {
        Some(cert_path) => {
            let cert = std::fs::read(cert_path)
                .wrap_err_with(|| format!("reading CA certificate {cert_path}"))?;
            issuer_from_certificate(&cert)?
        }
        None => crl_rewriter::crl::CrlBuilder::common_name_der(&config.issuer),
    };

    Ok(CrlFile::new(path, key, issuer)
        .signing_algorithm(config.signing_algorithm()?)
        .revocation_reason(config.revocation_reason())
        .validity(config.validity())
        .pem(config.pem))
}

fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    telemetry::init_tracing();

    let args = Args::parse();

    // Load configuration
    let config = Config::load()?;
    tracing::debug!("Loaded configuration: {:?}", config);

    let path = args
        .crl
        .clone()
        .unwrap_or_else(|| PathBuf::from(&config.crl.path));

    match args.command {
        Command::Init { revoke } => {
            open_crl_file(&config.crl, path)?.initialize(&revoke)?;
        }
        Command::Update { revoke, unrevoke } => {
            let written = open_crl_file(&config.crl, path)?.update(&revoke, &unrevoke)?;
            if !written {
                tracing::info!("CRL unchanged");
            }
        }
        Command::Inspect => {
            let file = open_crl_file(&config.crl, path)?;
            let der = file.read_der()?;
            let summary = CrlSummary::from_der(&der)?;

            println!("Issuer:      {}", summary.issuer);
            println!("Version:     v{}", summary.version);
            println!("This update: {}", summary.this_update);
            match summary.next_update {
                Some(next_update) => println!("Next update: {next_update}"),
                None => println!("Next update: none"),
            }
            if let Some(number) = &summary.crl_number {
                println!("CRL number:  {number}");
            }
            println!("Entries:     {}", summary.entries.len());
            for entry in &summary.entries {
                println!("  {entry}");
            }

            let key = RsaPrivateKey::from_pem(std::fs::read(&config.crl.ca_key)?)?;
            if !verify_signature(&der, &key.public_key()?)? {
                return Err(eyre!("CRL signature does not verify with the CA key"));
            }
            println!("Signature:   OK");
        }
    }

    Ok(())
}
