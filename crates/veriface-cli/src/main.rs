use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[zbus::proxy(
    interface = "org.veriface.Verifier1",
    default_service = "org.veriface.Verifier1",
    default_path = "/org/veriface/Verifier1"
)]
trait Verifier {
    fn verify(
        &self,
        image: &[u8],
        identity: &str,
        save: bool,
        basic: bool,
        request_id: &str,
    ) -> zbus::Result<String>;
    fn verify_frames(
        &self,
        frames: &[Vec<u8>],
        identity: &str,
        save: bool,
        request_id: &str,
    ) -> zbus::Result<String>;
    fn enroll(&self, identity: &str, image: &[u8]) -> zbus::Result<String>;
    fn list_records(&self, identity: &str) -> zbus::Result<String>;
    fn remove_record(&self, identity: &str, record_id: &str) -> zbus::Result<bool>;
    fn remove_identity(&self, identity: &str) -> zbus::Result<u32>;
    fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "veriface", about = "veriface face verification CLI")]
struct Cli {
    /// Talk to the daemon on the system bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Verify a face image
    Verify {
        image: PathBuf,
        /// Match only against this identity's records
        #[arg(short, long)]
        identity: Option<String>,
        /// Enroll the face when it does not match
        #[arg(long)]
        save: bool,
        /// Skip the model tiers and use the classical detector only
        #[arg(long)]
        basic: bool,
        #[arg(long)]
        request_id: Option<String>,
    },
    /// Verify a sequence of frame images
    Video {
        #[arg(required = true)]
        frames: Vec<PathBuf>,
        #[arg(short, long)]
        identity: Option<String>,
        /// Enroll the best frame on success
        #[arg(long)]
        save: bool,
        #[arg(long)]
        request_id: Option<String>,
    },
    /// Enroll a face image for an identity
    Enroll { identity: String, image: PathBuf },
    /// List enrolled records (all identities when omitted)
    List { identity: Option<String> },
    /// Remove one record, or every record of the identity when no id is given
    Remove { identity: String, id: Option<String> },
    /// Show daemon status
    Status,
}

fn read_image(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))
}

/// Pretty-print a JSON reply; exit status follows its `success` field.
fn print_result(json: &str) -> Result<ExitCode> {
    let value: serde_json::Value =
        serde_json::from_str(json).context("daemon returned invalid JSON")?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    let success = value.get("success").and_then(|v| v.as_bool()).unwrap_or(true);
    Ok(if success { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let connection = if cli.system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    }
    .context("failed to connect to D-Bus")?;
    let proxy = VerifierProxy::new(&connection)
        .await
        .context("verifaced is not reachable")?;

    match cli.command {
        Commands::Verify {
            image,
            identity,
            save,
            basic,
            request_id,
        } => {
            let bytes = read_image(&image)?;
            tracing::debug!(path = %image.display(), bytes = bytes.len(), "sending image");
            let reply = proxy
                .verify(
                    &bytes,
                    identity.as_deref().unwrap_or_default(),
                    save,
                    basic,
                    request_id.as_deref().unwrap_or_default(),
                )
                .await?;
            print_result(&reply)
        }
        Commands::Video {
            frames,
            identity,
            save,
            request_id,
        } => {
            let frames = frames.iter().map(|p| read_image(p)).collect::<Result<Vec<_>>>()?;
            let reply = proxy
                .verify_frames(
                    &frames,
                    identity.as_deref().unwrap_or_default(),
                    save,
                    request_id.as_deref().unwrap_or_default(),
                )
                .await?;
            print_result(&reply)
        }
        Commands::Enroll { identity, image } => {
            let bytes = read_image(&image)?;
            let reply = proxy.enroll(&identity, &bytes).await?;
            print_result(&reply)
        }
        Commands::List { identity } => {
            let reply = proxy.list_records(identity.as_deref().unwrap_or_default()).await?;
            let records: Vec<serde_json::Value> =
                serde_json::from_str(&reply).context("daemon returned invalid JSON")?;
            if records.is_empty() {
                println!("No records enrolled");
            }
            for record in &records {
                println!(
                    "{}  {}  {}  {}",
                    record["face_id"].as_str().unwrap_or("?"),
                    record["user_id"].as_str().unwrap_or("?"),
                    record["kind"].as_str().unwrap_or("?"),
                    record["timestamp"].as_str().unwrap_or("?"),
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Remove { identity, id: Some(id) } => {
            if proxy.remove_record(&identity, &id).await? {
                println!("Removed record {id}");
                Ok(ExitCode::SUCCESS)
            } else {
                println!("No record {id} for {identity}");
                Ok(ExitCode::FAILURE)
            }
        }
        Commands::Remove { identity, id: None } => {
            let removed = proxy.remove_identity(&identity).await?;
            println!("Removed {removed} record(s) for {identity}");
            Ok(ExitCode::SUCCESS)
        }
        Commands::Status => {
            let reply = proxy.status().await?;
            print_result(&reply)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition_is_valid() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_verify_flags_parse() {
        let cli = Cli::try_parse_from([
            "veriface",
            "--system",
            "verify",
            "face.jpg",
            "-i",
            "alice",
            "--save",
            "--request-id",
            "r1",
        ])
        .unwrap();
        assert!(cli.system);
        match cli.command {
            Commands::Verify {
                image,
                identity,
                save,
                basic,
                request_id,
            } => {
                assert_eq!(image, PathBuf::from("face.jpg"));
                assert_eq!(identity.as_deref(), Some("alice"));
                assert!(save);
                assert!(!basic);
                assert_eq!(request_id.as_deref(), Some("r1"));
            }
            _ => panic!("expected verify"),
        }
    }

    #[test]
    fn test_video_requires_frames() {
        assert!(Cli::try_parse_from(["veriface", "video"]).is_err());
    }
}
