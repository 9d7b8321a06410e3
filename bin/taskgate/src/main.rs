mod commands;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "taskgate")]
#[command(about = "Guarded LLM-driven browser tasks", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum Kind {
    Standard,
    Auth,
    Vision,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a browser task and print the result envelope
    Run {
        /// What to do, in plain language
        task: String,

        #[arg(long, value_enum, default_value = "standard")]
        kind: Kind,

        #[arg(long)]
        max_steps: Option<i64>,

        #[arg(long)]
        timeout_ms: Option<i64>,

        /// Allowed domain (repeatable)
        #[arg(long = "allow")]
        allowed_domains: Vec<String>,

        /// Show the browser window
        #[arg(long)]
        headed: bool,

        /// Send screenshots to the planner
        #[arg(long)]
        vision: bool,

        #[arg(long)]
        provider: Option<String>,

        #[arg(long)]
        model: Option<String>,

        /// Stored login to use (auth tasks)
        #[arg(long)]
        credential_ref: Option<String>,

        /// Username for an explicit login; the password is read from stdin
        #[arg(long)]
        username: Option<String>,
    },

    /// Manage stored website logins and provider API keys
    Credentials {
        #[command(subcommand)]
        command: CredentialsCommands,
    },

    /// Check a URL against the destination policy
    CheckUrl {
        url: String,

        /// Allowed domain (repeatable)
        #[arg(long = "allow")]
        allowed_domains: Vec<String>,
    },

    /// Inspect registered tools
    Tools {
        #[command(subcommand)]
        command: ToolsCommands,
    },
}

#[derive(Subcommand)]
enum CredentialsCommands {
    /// Save a website login; the password is read from stdin
    Save {
        credential_ref: String,
        #[arg(long)]
        username: String,
        /// Also read a two-factor secret from the second stdin line
        #[arg(long)]
        two_factor: bool,
    },
    /// List stored login references
    List,
    /// Show metadata for a stored login (never the secret values)
    Info { credential_ref: String },
    /// Delete a stored login
    Delete { credential_ref: String },
    /// Store a provider API key read from stdin
    SetKey { provider: String },
    /// Delete a stored provider API key
    DeleteKey { provider: String },
}

#[derive(Subcommand)]
enum ToolsCommands {
    /// List registered tools
    List,
    /// Show the parameter schema of a tool
    Info { tool_name: String },
    /// Call a tool directly with JSON parameters
    Call { tool_name: String, params: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over -v.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    match cli.command {
        Commands::Run {
            task,
            kind,
            max_steps,
            timeout_ms,
            allowed_domains,
            headed,
            vision,
            provider,
            model,
            credential_ref,
            username,
        } => {
            let args = commands::run_cmd::RunArgs {
                task,
                kind,
                max_steps,
                timeout_ms,
                allowed_domains,
                headed,
                vision,
                provider,
                model,
                credential_ref,
                username,
            };
            commands::run_cmd::run(args).await?;
        }

        Commands::Credentials { command } => match command {
            CredentialsCommands::Save {
                credential_ref,
                username,
                two_factor,
            } => {
                commands::credentials_cmd::save(&credential_ref, &username, two_factor)?;
            }
            CredentialsCommands::List => commands::credentials_cmd::list()?,
            CredentialsCommands::Info { credential_ref } => {
                commands::credentials_cmd::info(&credential_ref)?;
            }
            CredentialsCommands::Delete { credential_ref } => {
                commands::credentials_cmd::delete(&credential_ref)?;
            }
            CredentialsCommands::SetKey { provider } => {
                commands::credentials_cmd::set_key(&provider)?;
            }
            CredentialsCommands::DeleteKey { provider } => {
                commands::credentials_cmd::delete_key(&provider)?;
            }
        },

        Commands::CheckUrl {
            url,
            allowed_domains,
        } => {
            commands::check_url::run(&url, allowed_domains)?;
        }

        Commands::Tools { command } => match command {
            ToolsCommands::List => commands::tools_cmd::list(),
            ToolsCommands::Info { tool_name } => commands::tools_cmd::info(&tool_name)?,
            ToolsCommands::Call { tool_name, params } => {
                commands::tools_cmd::call(&tool_name, &params).await?;
            }
        },
    }

    Ok(())
}
