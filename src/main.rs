use std::io::Read;
use std::path::Path;

use anyhow::{anyhow, bail};
use clap::Parser;
use homedir::my_home;
use tracing_subscriber::EnvFilter;

use mnemos::chunking::normalize_markdown;
use mnemos::cli::{Args, Command};
use mnemos::config::Config;
use mnemos::engine::Engine;
use mnemos::indexer::JobOutcome;
use mnemos::search::decode_highlight;

const ENV_BASE_PATH: &str = "MNEMOS_BASE_PATH";

fn base_path() -> anyhow::Result<String> {
    if let Ok(path) = std::env::var(ENV_BASE_PATH) {
        return Ok(path);
    }

    let home = my_home()
        .map_err(|e| anyhow!("could not determine home directory: {e}"))?
        .ok_or_else(|| anyhow!("home directory path is empty"))?;
    Ok(format!("{}/.local/share/mnemos", home.to_string_lossy()))
}

fn read_content(file: Option<&Path>) -> anyhow::Result<String> {
    let raw = match file {
        Some(path) => std::fs::read_to_string(path)?,
        None => {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf)?;
            buf
        }
    };
    Ok(normalize_markdown(&raw))
}

fn print_outcome(id: &str, outcome: &JobOutcome) {
    match outcome {
        JobOutcome::Failed { message } => eprintln!("{id}: indexing failed: {message}"),
        other => println!("{id}: {}", serde_json::to_string(other).unwrap_or_default()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = Config::load_with(&base_path()?)?;

    if let Command::Config {} = args.command {
        print!("{}", serde_yml::to_string(&config)?);
        return Ok(());
    }

    if let Command::Highlight { payload } = &args.command {
        let Some(payload) = decode_highlight(payload) else {
            bail!("invalid highlight payload");
        };
        println!("{}", payload.render("**", "**"));
        println!("note: {}  chunk: {}", payload.note_id, payload.chunk_id);
        return Ok(());
    }

    let engine = Engine::open(config)?;
    let mut notices = engine.subscribe_notices();

    match args.command {
        Command::Add { title, file } => {
            let content = read_content(file.as_deref())?;
            let note = engine.add_note(title, content)?;
            let outcome = engine.index_now(&note.id).await?;
            println!("{}", note.id);
            print_outcome(&note.id, &outcome);
        }

        Command::Edit {
            id,
            title,
            file,
            stdin,
        } => {
            let content = match (file, stdin) {
                (Some(path), _) => Some(read_content(Some(&path))?),
                (None, true) => Some(read_content(None)?),
                (None, false) => None,
            };
            if title.is_none() && content.is_none() {
                println!("This edit does nothing");
                return Ok(());
            }
            engine.update_note(&id, title, content)?;
            let outcome = engine.index_now(&id).await?;
            print_outcome(&id, &outcome);
        }

        Command::Delete { id, permanent } => {
            engine.delete_note(&id, permanent)?;
            println!("deleted {id}");
        }

        Command::Restore { id } => {
            engine.restore_note(&id)?;
            let outcome = engine.index_now(&id).await?;
            print_outcome(&id, &outcome);
        }

        Command::List { json } => {
            let notes = engine.list_notes()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&notes)?);
            } else {
                for note in notes {
                    println!(
                        "{}  {}  {}",
                        note.id,
                        note.updated_at.format("%Y-%m-%d %H:%M"),
                        note.title.as_deref().unwrap_or("(untitled)")
                    );
                }
            }
        }

        Command::Show { id } => {
            let note = engine.note(&id)?;
            if let Some(title) = &note.title {
                println!("# {title}\n");
            }
            println!("{}", note.content);
        }

        Command::Reindex { id } => match id {
            Some(id) => print_outcome(&id, &engine.index_now(&id).await?),
            None => {
                for (id, outcome) in engine.reindex_all().await? {
                    print_outcome(&id, &outcome);
                }
            }
        },

        Command::Search { query, top_k, json } => {
            let matches = engine.search(&query, top_k).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&matches)?);
            } else if matches.is_empty() {
                println!("no matches");
            } else {
                for m in matches {
                    println!("{:.3}  {}", m.score, m.payload.note_id);
                    println!("    {}", m.payload.render("**", "**").replace('\n', " "));
                }
            }
        }

        Command::Errors { clear } => {
            for error in engine.local_embedding_errors()? {
                println!(
                    "{}  {}  {}",
                    error.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    error.kind,
                    error.message
                );
            }
            if clear {
                let removed = engine.clear_local_embedding_errors()?;
                println!("cleared {removed} errors");
            }
        }

        Command::Config {} | Command::Highlight { .. } => {}
    }

    while let Ok(notice) = notices.try_recv() {
        if notice.fallback_used {
            log::warn!("{} failed locally, used remote fallback: {}", notice.kind, notice.message);
        } else {
            log::error!("{} failed: {}", notice.kind, notice.message);
        }
    }

    Ok(())
}
