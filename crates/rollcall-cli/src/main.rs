use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "rollcall", about = "Enroll people and recognize their faces")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Recognize the faces in an image
    Recognize {
        /// Image file (jpg, png, ...)
        image: PathBuf,
    },
    /// Add a person from one or more photos
    Enroll {
        /// Person's name
        #[arg(short, long)]
        name: String,
        /// Photos of the person; 3-5 clear, well-lit shots work best
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
    /// List enrolled people
    List,
    /// Remove an enrolled person
    Remove {
        /// Name of the person to remove
        name: String,
    },
    /// Remove everyone from the store
    Clear {
        /// Confirm clearing all data
        #[arg(long)]
        yes: bool,
    },
    /// Show daemon status
    Status,
}

// `#[zbus::proxy]` generates `RollcallProxy` for the daemon's interface.
#[zbus::proxy(
    interface = "org.rollcall.Rollcall1",
    default_service = "org.rollcall.Rollcall1",
    default_path = "/org/rollcall/Rollcall1"
)]
trait Rollcall {
    async fn recognize(&self, path: &str) -> zbus::Result<String>;
    async fn enroll(&self, name: &str, paths: &[String]) -> zbus::Result<String>;
    async fn list_people(&self) -> zbus::Result<String>;
    async fn remove_person(&self, name: &str) -> zbus::Result<bool>;
    async fn clear(&self) -> zbus::Result<bool>;
    async fn status(&self) -> zbus::Result<String>;
}

#[derive(Debug, Deserialize)]
struct RecognitionView {
    face_index: usize,
    name: Option<String>,
    confidence: f32,
}

#[derive(Debug, Deserialize)]
struct EnrollView {
    name: String,
    accepted: usize,
    skipped: usize,
    total_embeddings: usize,
}

#[derive(Debug, Deserialize)]
struct PersonView {
    name: String,
    embeddings: usize,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let conn = zbus::Connection::session()
        .await
        .context("connecting to the session bus")?;
    let proxy = RollcallProxy::new(&conn).await?;

    let ok = match cli.command {
        Commands::Recognize { image } => {
            let path = absolute(&image)?;
            match proxy.recognize(&path).await {
                Ok(json) => print_recognitions(&json)?,
                Err(e) => report_failure("Recognition failed.", e),
            }
        }
        Commands::Enroll { name, images } => {
            let paths = images
                .iter()
                .map(|p| absolute(p))
                .collect::<Result<Vec<_>>>()?;
            match proxy.enroll(&name, &paths).await {
                Ok(json) => {
                    let report: EnrollView = serde_json::from_str(&json)?;
                    println!("{}", format_enroll(&report));
                    true
                }
                Err(e) => report_failure(
                    "Failed to add person. Please ensure faces are clearly visible.",
                    e,
                ),
            }
        }
        Commands::List => {
            let people: Vec<PersonView> = serde_json::from_str(&proxy.list_people().await?)?;
            print!("{}", format_people(&people));
            true
        }
        Commands::Remove { name } => match proxy.remove_person(&name).await {
            Ok(true) => {
                println!("Removed {name}");
                true
            }
            Ok(false) => {
                eprintln!("No person named {name}");
                false
            }
            Err(e) => report_failure("Failed to remove person.", e),
        },
        Commands::Clear { yes } => {
            if !yes {
                eprintln!("This removes every enrolled person. Re-run with --yes to confirm.");
                false
            } else {
                match proxy.clear().await {
                    Ok(_) => {
                        println!("Store cleared");
                        true
                    }
                    Err(e) => report_failure("Failed to clear store.", e),
                }
            }
        }
        Commands::Status => {
            let status: serde_json::Value = serde_json::from_str(&proxy.status().await?)?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            true
        }
    };

    Ok(if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

/// The daemon resolves paths in its own working directory.
fn absolute(path: &Path) -> Result<String> {
    let abs = std::fs::canonicalize(path).with_context(|| format!("{}", path.display()))?;
    Ok(abs.to_string_lossy().into_owned())
}

fn report_failure(message: &str, err: zbus::Error) -> bool {
    tracing::debug!(error = %err, "daemon call failed");
    eprintln!("{message}");
    if let zbus::Error::MethodError(_, Some(detail), _) = &err {
        eprintln!("  {detail}");
    }
    false
}

/// An image with no faces is still a successful recognition.
fn print_recognitions(json: &str) -> Result<bool> {
    let results: Vec<RecognitionView> = serde_json::from_str(json)?;
    print!("{}", format_recognitions(&results));
    Ok(true)
}

fn format_recognitions(results: &[RecognitionView]) -> String {
    if results.is_empty() {
        return "No faces detected in the image.\n".to_string();
    }
    let mut out = format!("Found {} face(s)\n", results.len());
    for r in results {
        match &r.name {
            Some(name) => out.push_str(&format!(
                "Face {}: {name} ({:.2}%)\n",
                r.face_index + 1,
                r.confidence * 100.0
            )),
            None => out.push_str(&format!("Face {}: Unknown\n", r.face_index + 1)),
        }
    }
    out
}

fn format_enroll(report: &EnrollView) -> String {
    let mut line = format!(
        "Added {} from {} photo(s); {} embedding(s) stored",
        report.name, report.accepted, report.total_embeddings
    );
    if report.skipped > 0 {
        line.push_str(&format!(" ({} photo(s) skipped: no usable face)", report.skipped));
    }
    line
}

fn format_people(people: &[PersonView]) -> String {
    if people.is_empty() {
        return "No one enrolled yet. Add someone with `rollcall enroll`.\n".to_string();
    }
    let width = people.iter().map(|p| p.name.len()).max().unwrap_or(0).max(4);
    let mut out = format!("{} person(s) enrolled\n{:<width$}  Embeddings\n", people.len(), "Name");
    for p in people {
        out.push_str(&format!("{:<width$}  {}\n", p.name, p.embeddings));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_recognitions() {
        let results: Vec<RecognitionView> = serde_json::from_str(
            r#"[{"face_index":0,"name":"alice","confidence":0.9321,"distance":0.0679,"box":{}},
                {"face_index":2,"name":null,"confidence":0.0,"distance":null,"box":{}}]"#,
        )
        .unwrap();
        assert_eq!(
            format_recognitions(&results),
            "Found 2 face(s)\nFace 1: alice (93.21%)\nFace 3: Unknown\n"
        );
        assert_eq!(format_recognitions(&[]), "No faces detected in the image.\n");
    }

    #[test]
    fn test_no_faces_is_success() {
        assert!(print_recognitions("[]").unwrap());
        assert!(print_recognitions("not json").is_err());
    }

    #[test]
    fn test_format_enroll() {
        let report = EnrollView {
            name: "bob".into(),
            accepted: 2,
            skipped: 1,
            total_embeddings: 5,
        };
        assert_eq!(
            format_enroll(&report),
            "Added bob from 2 photo(s); 5 embedding(s) stored (1 photo(s) skipped: no usable face)"
        );
    }

    #[test]
    fn test_format_people_aligns_columns() {
        let people = vec![
            PersonView { name: "al".into(), embeddings: 3 },
            PersonView { name: "beatrice".into(), embeddings: 1 },
        ];
        assert_eq!(
            format_people(&people),
            "2 person(s) enrolled\nName      Embeddings\nal        3\nbeatrice  1\n"
        );
    }

    #[test]
    fn test_cli_requires_images_for_enroll() {
        assert!(Cli::try_parse_from(["rollcall", "enroll", "--name", "x"]).is_err());
        assert!(Cli::try_parse_from(["rollcall", "enroll", "-n", "x", "a.jpg", "b.jpg"]).is_ok());
    }
}
