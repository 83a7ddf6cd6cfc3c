use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Add a note and index it.
    /// Content is read from --file, or stdin when omitted.
    Add {
        /// Note title
        #[clap(short, long)]
        title: Option<String>,

        /// Read content from this file
        #[clap(short, long)]
        file: Option<PathBuf>,
    },

    /// Edit a note and reindex it
    Edit {
        id: String,

        /// New title; an empty string clears it
        #[clap(short, long)]
        title: Option<String>,

        /// Replace content with this file
        #[clap(short, long)]
        file: Option<PathBuf>,

        /// Replace content with stdin
        #[clap(long, default_value = "false", conflicts_with = "file")]
        stdin: bool,
    },

    /// Delete a note
    Delete {
        id: String,

        /// Remove the note with its chunks and embeddings
        /// instead of moving it to the trash.
        #[clap(long, default_value = "false")]
        permanent: bool,
    },

    /// Restore a deleted note
    Restore { id: String },

    /// List notes, most recently updated first
    List {
        #[clap(long, default_value = "false")]
        json: bool,
    },

    /// Print a note
    Show { id: String },

    /// Reindex one note, or every note when no id is given
    Reindex { id: Option<String> },

    /// Semantic search across notes
    Search {
        query: String,

        /// Number of notes to return
        #[clap(short = 'k', long)]
        top_k: Option<usize>,

        /// Print matches as json
        #[clap(long, default_value = "false")]
        json: bool,
    },

    /// Show recorded local embedding failures
    Errors {
        /// Remove them after printing
        #[clap(long, default_value = "false")]
        clear: bool,
    },

    /// Decode and render a search highlight payload
    Highlight { payload: String },

    /// Print the active configuration
    Config {},
}
