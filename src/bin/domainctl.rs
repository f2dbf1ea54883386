use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use ragdomains::config;
use ragdomains::domains::{DomainService, QueryEvent, SourceChunk, SourceDocument};
use ragdomains::logging;
use serde::Serialize;

#[derive(Parser)]
#[command(
    name = "domainctl",
    about = "Manage document domains and ask them questions"
)]
struct Cli {
    /// Emit service logs (stdout and the log file).
    #[arg(long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create an empty domain.
    Create {
        name: String,
        #[arg(long, default_value = "")]
        description: String,
    },
    /// List every domain.
    List,
    /// Delete a domain and everything stored for it.
    Delete { name: String },
    /// Ingest PDF files into a domain.
    Ingest {
        name: String,
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// List the indexed documents of a domain.
    Documents { name: String },
    /// Remove one document from a domain.
    RemoveDocument { name: String, filename: String },
    /// Ask one or more domains a question.
    Query {
        question: String,
        /// Domain to query; repeat to query several.
        #[arg(long = "domain", short = 'd', required = true)]
        domains: Vec<String>,
        /// Print the answer as it is generated.
        #[arg(long)]
        stream: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    config::init_config();
    if cli.verbose {
        logging::init_tracing();
    }
    let service = DomainService::from_config(config::get_config());

    match cli.command {
        Command::Create { name, description } => {
            print_json(&service.create_domain(&name, &description).await?)
        }
        Command::List => print_json(&service.list_domains().await?),
        Command::Delete { name } => {
            service.delete_domain(&name).await?;
            println!("Deleted domain '{name}'");
            Ok(())
        }
        Command::Ingest { name, files } => {
            let documents = read_documents(&files).await?;
            print_json(&service.ingest(&name, documents).await?)
        }
        Command::Documents { name } => print_json(&service.list_documents(&name).await?),
        Command::RemoveDocument { name, filename } => {
            service.delete_document(&name, &filename).await?;
            println!("Removed '{filename}' from '{name}'");
            Ok(())
        }
        Command::Query {
            question,
            domains,
            stream,
        } => query(&service, &domains, &question, stream).await,
    }
}

async fn read_documents(files: &[PathBuf]) -> Result<Vec<SourceDocument>> {
    let mut documents = Vec::with_capacity(files.len());
    for path in files {
        let filename = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| anyhow!("{} has no usable file name", path.display()))?
            .to_string();
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        documents.push(SourceDocument { filename, bytes });
    }
    Ok(documents)
}

async fn query(
    service: &DomainService,
    domains: &[String],
    question: &str,
    stream: bool,
) -> Result<()> {
    if !stream {
        return match domains {
            [single] => print_json(&service.query(single, question).await?),
            _ => print_json(&service.query_domains(domains, question).await?),
        };
    }

    let mut events = match domains {
        [single] => service.query_stream(single, question).await?,
        _ => service.query_domains_stream(domains, question).await?,
    };
    let mut stdout = std::io::stdout();
    let mut failure = None;
    while let Some(event) = events.next().await {
        match event {
            QueryEvent::Token(text) => {
                write!(stdout, "{text}")?;
                stdout.flush()?;
            }
            QueryEvent::Sources(sources) => print_sources(&sources),
            QueryEvent::Error(message) => failure = Some(message),
            QueryEvent::Done => break,
        }
    }
    match failure {
        Some(message) => Err(anyhow!("Answer generation failed: {message}")),
        None => Ok(()),
    }
}

fn print_sources(sources: &[SourceChunk]) {
    println!();
    if sources.is_empty() {
        return;
    }
    println!("\nSources:");
    for source in sources {
        let page = source.page_label.as_deref().unwrap_or("?");
        let score = source
            .score
            .map(|score| format!("{score:.4}"))
            .unwrap_or_default();
        println!("  {} p.{page} {score}", source.filename);
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
