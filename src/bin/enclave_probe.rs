//! Host-side probe for a running enclave
//!
//! ```bash
//! enclave_probe                 # configure if ENCRYPTED_TSK and KMS_KEY_ID are set, else ping
//! enclave_probe ping
//! enclave_probe configure       # ENCRYPTED_TSK (base64) and KMS_KEY_ID
//! enclave_probe process "text"  # TSK_HEX, the data owner's copy of the key
//! ```
//!
//! The target is `ENCLAVE_TCP_ADDR` if set, otherwise vsock
//! `ENCLAVE_CID`:`ENCLAVE_PORT` (defaults 16:5000). The raw response is
//! printed to stdout.

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use confidential_enclave::client::{self, EnclaveClient};
use confidential_enclave::envelope::{self, KEY_LEN};
use confidential_enclave::protocol::ProtocolResponse;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let client = EnclaveClient::from_env()?;
    let boot_key = match (std::env::var("ENCRYPTED_TSK"), std::env::var("KMS_KEY_ID")) {
        (Ok(blob), Ok(key_id)) => Some((blob, key_id)),
        _ => None,
    };

    let command = std::env::args().nth(1).unwrap_or_else(|| {
        if boot_key.is_some() { "configure" } else { "ping" }.to_string()
    });
    info!(endpoint = ?client.endpoint(), command = %command, "Probing enclave");

    match command.as_str() {
        "ping" => {
            let raw = client.send(&client::ping_request()).await?;
            print_raw(&raw);
        }
        "configure" => {
            let (blob, key_id) = boot_key.context("ENCRYPTED_TSK and KMS_KEY_ID must be set")?;
            let encrypted_key = STANDARD
                .decode(blob.trim())
                .context("ENCRYPTED_TSK is not valid base64")?;

            let raw = client
                .send(&client::configure_request(&encrypted_key, &key_id))
                .await?;
            print_raw(&raw);
        }
        "process" => {
            let payload = std::env::args().nth(2).context("missing payload argument")?;
            let tsk = hex::decode(std::env::var("TSK_HEX").context("TSK_HEX is not set")?.trim())
                .context("TSK_HEX is not valid hex")?;
            if tsk.len() != KEY_LEN {
                bail!("TSK_HEX must be {} bytes, got {}", KEY_LEN, tsk.len());
            }

            let sealed = envelope::encrypt(&tsk, payload.as_bytes())?;
            let raw = client.send(&client::process_request(&sealed)).await?;
            print_raw(&raw);

            let response: ProtocolResponse = match serde_json::from_slice(&raw) {
                Ok(response) => response,
                Err(_) => return Ok(()),
            };
            if let Some(reply) = response.envelope {
                match envelope::decrypt(&tsk, &reply) {
                    Ok(plaintext) => {
                        info!(result = %String::from_utf8_lossy(&plaintext), "Decrypted reply")
                    }
                    Err(e) => warn!(error = %e, "Reply did not decrypt under TSK_HEX"),
                }
            }
        }
        other => bail!("unknown command `{}` (expected ping, configure or process)", other),
    }

    Ok(())
}

fn print_raw(raw: &[u8]) {
    if raw.is_empty() {
        warn!("Enclave closed the connection without a response");
    }
    println!("{}", String::from_utf8_lossy(raw));
}
