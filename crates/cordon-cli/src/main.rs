//! Cordon CLI - run untrusted code behind a risk gate
//!
//! Usage:
//!   cordon run        - Execute code in a session sandbox
//!   cordon assess     - Show the risk assessment and backend for code
//!   cordon workspace  - Read, write and list session files
//!   cordon config     - Print the effective configuration

use std::io::Write as _;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use cordon_core::{required_backend, Config, ConfirmationInbox, Manager};
use cordon_sandbox::{ExecutionRequest, Language, BACKEND_PREFERENCE_KEY};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "cordon")]
#[command(author = "HeyBattle1")]
#[command(version)]
#[command(about = "Risk-aware sandbox for agent-generated code", long_about = None)]
struct Cli {
    /// Configuration file (TOML). Defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute code and print the result as JSON
    Run {
        #[arg(long)]
        session: String,

        /// python, shell or javascript
        #[arg(long)]
        language: String,

        #[command(flatten)]
        source: Source,

        /// Timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Preferred backend (container or pooled). Can only raise isolation.
        #[arg(long)]
        backend: Option<String>,
    },

    /// Classify code without running it
    Assess {
        #[arg(long)]
        language: String,

        #[command(flatten)]
        source: Source,
    },

    /// Access a session workspace
    Workspace {
        #[command(subcommand)]
        action: WorkspaceAction,
    },

    /// Print the effective configuration, secrets masked
    Config,
}

#[derive(clap::Args)]
#[group(required = true, multiple = false)]
struct Source {
    /// Code to run
    #[arg(long)]
    code: Option<String>,

    /// File containing the code
    #[arg(long)]
    file: Option<PathBuf>,
}

impl Source {
    fn load(self) -> anyhow::Result<String> {
        match (self.code, self.file) {
            (Some(code), _) => Ok(code),
            (None, Some(path)) => {
                std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))
            }
            (None, None) => bail!("either --code or --file is required"),
        }
    }
}

#[derive(Subcommand)]
enum WorkspaceAction {
    /// Print a file
    Read {
        #[arg(long)]
        session: String,
        path: String,
    },

    /// Write a file from --content or stdin
    Write {
        #[arg(long)]
        session: String,
        path: String,
        #[arg(long)]
        content: Option<String>,
    },

    /// List a directory
    List {
        #[arg(long)]
        session: String,
        #[arg(default_value = ".")]
        path: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // stdout carries results, logs go to stderr
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    match cli.command {
        Commands::Run {
            session,
            language,
            source,
            timeout,
            backend,
        } => {
            let language: Language = language.parse()?;
            let code = source.load()?;

            let (manager, inbox) = Manager::from_config(&config)?;
            if let Some(inbox) = inbox {
                tokio::spawn(prompt_loop(inbox));
            }

            let timeout = timeout.map_or(manager.limits().default_timeout, Duration::from_secs);
            let mut request = ExecutionRequest::new(session, language, code).with_timeout(timeout);
            if let Some(backend) = backend {
                request = request.with_metadata(BACKEND_PREFERENCE_KEY, backend);
            }

            let result = manager.execute(&request).await;
            if let Err(e) = manager.shutdown().await {
                tracing::warn!("shutdown: {}", e);
            }
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(if result.success {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }

        Commands::Assess { language, source } => {
            let language: Language = language.parse()?;
            let code = source.load()?;
            let policy = cordon_core::RiskPolicy::with_rules(&config.risk.rules)?;
            let assessment = policy.assess(&code, language);
            let decision = required_backend(&assessment, config.security.mode, None);
            let report = serde_json::json!({
                "level": assessment.level,
                "detected_patterns": assessment.detected_patterns,
                "mode": config.security.mode.to_string(),
                "backend": decision.kind(),
                "fallback": decision.fallback(),
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(ExitCode::SUCCESS)
        }

        Commands::Workspace { action } => {
            config.validate()?;
            let workspaces = cordon_sandbox::Workspaces::new(&config.workspace.root)
                .with_max_file_bytes(config.workspace.max_file_bytes);
            match action {
                WorkspaceAction::Read { session, path } => {
                    let data = workspaces.read(&session, &path)?;
                    std::io::stdout().write_all(&data)?;
                }
                WorkspaceAction::Write { session, path, content } => {
                    let data = match content {
                        Some(content) => content.into_bytes(),
                        None => {
                            let mut buf = Vec::new();
                            tokio::io::stdin().read_to_end(&mut buf).await?;
                            buf
                        }
                    };
                    workspaces.write(&session, &path, &data)?;
                    eprintln!("wrote {} bytes to {}", data.len(), path);
                }
                WorkspaceAction::List { session, path } => {
                    let entries = workspaces.list(&session, &path)?;
                    println!("{}", serde_json::to_string_pretty(&entries)?);
                }
            }
            Ok(ExitCode::SUCCESS)
        }

        Commands::Config => {
            config.validate()?;
            print!("{}", toml::to_string_pretty(&config.redacted())?);
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Answer confirmations from the terminal. EOF or anything but "y" denies.
async fn prompt_loop(mut inbox: ConfirmationInbox) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(pending) = inbox.recv().await {
        eprintln!();
        eprintln!("Confirmation required: {}", pending.action);
        for (key, value) in &pending.details {
            if key == "code" {
                eprintln!("  code:");
                for line in value.lines() {
                    eprintln!("    | {line}");
                }
            } else {
                eprintln!("  {key}: {value}");
            }
        }
        eprint!("Approve? [y/N] ");
        let _ = std::io::stderr().flush();

        let approved = match lines.next_line().await {
            Ok(Some(answer)) => matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"),
            _ => false,
        };
        pending.respond(approved);
    }
}
