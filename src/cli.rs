// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use std::path::PathBuf;
use tally_config::Config;

#[derive(Parser, Debug)]
#[command(
    name = "tally",
    about = "Ask questions about your spreadsheets from the terminal",
    version,
    long_about = None,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Base URL of the analysis service, e.g. "http://localhost:8000"
    #[arg(long, short = 's', env = "TALLY_SERVER")]
    pub server: Option<String>,

    /// Conversation session id (default from config: "default")
    #[arg(long, short = 'S')]
    pub session: Option<String>,

    /// Model to answer with, e.g. "gpt-4o-mini"
    #[arg(long, short = 'M', env = "TALLY_MODEL")]
    pub model: Option<String>,

    /// Wait for complete answers instead of streaming them
    #[arg(long)]
    pub no_stream: bool,

    /// Restrict questions to files in this group
    #[arg(long, short = 'g')]
    pub group: Option<String>,

    /// Restrict questions to one uploaded file
    #[arg(long, short = 'f')]
    pub file: Option<String>,

    /// Load the session's history before the first prompt
    #[arg(long)]
    pub resume: bool,

    /// Answer locally with the built-in echo service (no network)
    #[arg(long)]
    pub offline: bool,

    /// Path to config file (overrides auto-discovery)
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Increase verbosity (-v = debug, -vv = trace)
    #[arg(long, short = 'v', action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Ask one question and print the answer
    Ask {
        /// The question; several words are joined with spaces
        #[arg(required = true, num_args = 1..)]
        question: Vec<String>,
        /// Print the final message, payload included, as JSON
        #[arg(long)]
        json: bool,
    },
    /// Upload a spreadsheet and wait until it is indexed
    Upload {
        path: PathBuf,
        /// Assign the file to this group once indexed
        #[arg(long, short = 'g')]
        group: Option<String>,
    },
    /// Print the session's history
    History,
    /// Delete the session's history on the server
    Clear,
    /// List uploaded files
    Files {
        /// Delete this file instead of listing
        #[arg(long, value_name = "FILENAME")]
        delete: Option<String>,
    },
    /// List sessions known to the server
    Sessions,
    /// List the models the server can answer with
    Models {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show reference completions for TEXT with the cursor at its end
    Complete { text: String },
    /// Print the effective configuration and exit
    ShowConfig,
    /// Generate shell completion script
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

impl Cli {
    /// Fold command-line overrides into the loaded configuration.
    pub fn apply_overrides(&self, config: &mut Config) {
        if let Some(server) = &self.server {
            config.server.base_url = server.clone();
        }
        if let Some(session) = &self.session {
            config.query.default_session = session.clone();
        }
        if self.model.is_some() {
            config.query.model = self.model.clone();
        }
        if self.group.is_some() {
            config.query.group = self.group.clone();
        }
        if self.file.is_some() {
            config.query.file = self.file.clone();
        }
        if self.no_stream {
            config.query.stream = false;
        }
    }
}

pub fn print_completions(shell: Shell) {
    let mut cmd = Cli::command();
    generate(shell, &mut cmd, "tally", &mut std::io::stdout());
}
