use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use clap::{Args, Parser, Subcommand};
use gallery::config::{ClientConfig, ConfigError, normalize_base_url};
use gallery::net::{ProgressFn, TransportError};
use gallery::outcome::{Outcome, to_json};
use gallery::services::images::percent;
use gallery::store::StoreError;
use gallery::{Credentials, FileStore, HttpTransport, ImageService, SessionManager, UserService};
use serde_json::{Map, Value};
use tracing_subscriber::EnvFilter;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("session store error: {0}")]
    Store(#[from] StoreError),
    #[error("http client error: {0}")]
    Transport(#[from] TransportError),
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

#[derive(Parser, Debug)]
#[command(name = "gallery-cli", about = "Gallery API client with a persisted login session")]
struct Cli {
    /// Overrides `GALLERY_BASE_URL`.
    #[arg(long)]
    base_url: Option<String>,

    /// Overrides `GALLERY_STATE_DIR`.
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Overrides `GALLERY_REQUEST_TIMEOUT_SECS`.
    #[arg(long)]
    request_timeout_secs: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Login {
        #[arg(long)]
        email: String,
        #[arg(long, env = "GALLERY_PASSWORD", hide_env_values = true)]
        password: String,
    },
    Register {
        #[arg(long)]
        username: String,
        #[arg(long, env = "GALLERY_PASSWORD", hide_env_values = true)]
        password: String,
        #[arg(long)]
        email: String,
    },
    Logout,
    /// Show the locally persisted session.
    Status,
    User(UserCommand),
    Image(ImageCommand),
}

#[derive(Args, Debug)]
struct UserCommand {
    #[command(subcommand)]
    command: UserSubcommand,
}

#[derive(Subcommand, Debug)]
enum UserSubcommand {
    Me,
    List,
    Update {
        user_id: String,
        #[arg(long)]
        username: Option<String>,
        #[arg(long)]
        password: Option<String>,
    },
}

#[derive(Args, Debug)]
struct ImageCommand {
    #[command(subcommand)]
    command: ImageSubcommand,
}

#[derive(Subcommand, Debug)]
enum ImageSubcommand {
    List,
    All,
    Mine,
    Upload {
        path: PathBuf,
    },
    Delete {
        image_id: String,
    },
    Download {
        url: String,
        #[arg(long, default_value = ".")]
        out_dir: PathBuf,
        #[arg(long)]
        filename: Option<String>,
    },
}

struct CliContext {
    session: SessionManager,
    images: ImageService,
    users: UserService,
}

#[tokio::main]
async fn main() -> Result<ExitCode, CliError> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = resolve_config(&cli)?;
    let ctx = build_context(&config)?;

    let rendered = match cli.command {
        Command::Login { email, password } => {
            let outcome = ctx.session.login(&Credentials { email, password }).await;
            render(&outcome.map(|()| ctx.session.user()))
        }
        Command::Register { username, password, email } => {
            let outcome = ctx.session.register(&username, &password, &email).await;
            render(&outcome.map(|()| ctx.session.user()))
        }
        Command::Logout => {
            ctx.session.logout().await;
            render::<()>(&Ok(()))
        }
        Command::Status => {
            let snapshot = ctx.session.snapshot();
            let status = serde_json::json!({
                "authenticated": snapshot.is_authenticated(),
                "user": snapshot.user,
            });
            render(&Ok(status))
        }
        Command::User(user) => run_user(&ctx, user).await,
        Command::Image(image) => run_image(&ctx, image).await,
    };

    println!("{}", serde_json::to_string_pretty(&rendered.json)?);
    Ok(if rendered.success { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

fn resolve_config(cli: &Cli) -> Result<ClientConfig, CliError> {
    let mut config = ClientConfig::from_env()?;
    if let Some(base_url) = &cli.base_url {
        config.base_url = normalize_base_url(base_url);
    }
    if let Some(state_dir) = &cli.state_dir {
        config.state_dir.clone_from(state_dir);
    }
    if let Some(secs) = cli.request_timeout_secs {
        config.timeouts.request_secs = secs;
    }
    Ok(config)
}

fn build_context(config: &ClientConfig) -> Result<CliContext, CliError> {
    let store = Arc::new(FileStore::open(&config.state_dir)?);
    tracing::debug!(path = %store.path().display(), base_url = %config.base_url, "session store opened");
    let transport = Arc::new(HttpTransport::new(config, store.clone())?);
    Ok(CliContext {
        session: SessionManager::new(transport.clone(), store),
        images: ImageService::new(transport.clone()),
        users: UserService::new(transport),
    })
}

async fn run_user(ctx: &CliContext, user: UserCommand) -> Rendered {
    let outcome = match user.command {
        UserSubcommand::Me => ctx.users.get_current_user().await,
        UserSubcommand::List => ctx.users.get_all_users().await,
        UserSubcommand::Update { user_id, username, password } => {
            let mut body = Map::new();
            if let Some(username) = username {
                body.insert("username".to_owned(), Value::String(username));
            }
            if let Some(password) = password {
                body.insert("password".to_owned(), Value::String(password));
            }
            ctx.users.update_user(&user_id, Value::Object(body)).await
        }
    };
    render(&outcome)
}

async fn run_image(ctx: &CliContext, image: ImageCommand) -> Rendered {
    match image.command {
        ImageSubcommand::List => render(&ctx.images.get_images().await),
        ImageSubcommand::All => render(&ctx.images.get_all_users_images().await),
        ImageSubcommand::Mine => render(&ctx.images.get_my_images().await),
        ImageSubcommand::Upload { path } => {
            let outcome = ctx.images.upload_image_file(&path, Some(progress_printer())).await;
            eprintln!();
            render(&outcome)
        }
        ImageSubcommand::Delete { image_id } => render(&ctx.images.delete_image(&image_id).await),
        ImageSubcommand::Download { url, out_dir, filename } => {
            let outcome = ctx
                .images
                .download_image(&url, &out_dir, filename.as_deref())
                .await
                .map(|path| path.display().to_string());
            render(&outcome)
        }
    }
}

/// Print `uploading... NN%` to stderr whenever the rounded percentage moves.
fn progress_printer() -> ProgressFn {
    let last = Arc::new(AtomicU8::new(u8::MAX));
    Arc::new(move |sent, total| {
        let pct = percent(sent, total);
        if last.swap(pct, Ordering::Relaxed) != pct {
            eprint!("\ruploading... {pct}%");
        }
    })
}

struct Rendered {
    success: bool,
    json: Value,
}

fn render<T: serde::Serialize>(outcome: &Outcome<T>) -> Rendered {
    Rendered { success: outcome.is_ok(), json: to_json(outcome) }
}
