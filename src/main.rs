//! Command line client. Signs in with a local key, shows the follow list kept
//! on the configured relays, and follows or unfollows profiles.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Result;
use clap::{Parser, Subcommand};
use followsync::{
    config::Settings,
    event::RelayMap,
    follow_list::followed_identities,
    notify::LogNotifier,
    relay::WsRelayPool,
    session::FileSessionStore,
    signer::{KeySigner, NoSigner, Signer},
    FollowAction, FollowError, FollowHandler, LoginController, LoginState,
};

/// Command line interface entry point.
#[derive(Parser)]
#[command(
    name = "followsync",
    author,
    version,
    about = "Nostr follow-list client"
)]
struct Cli {
    /// Path to the `.env` configuration file.
    #[arg(long, default_value = ".env")]
    env: String,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

/// Supported CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Sign in with the configured key and remember the session.
    Login,
    /// Forget the session.
    Logout,
    /// Show whether a session is active and which relays it uses.
    Status,
    /// Print the followed public keys, one per line.
    Following,
    /// Add a public key to the follow list.
    Follow { identity: String },
    /// Remove a public key from the follow list.
    Unfollow { identity: String },
}

/// Execute the selected CLI subcommand.
async fn run(cli: Cli) -> Result<()> {
    ensure_env_file(&cli.env)?;
    let cfg = Settings::from_env(&cli.env)?;
    let controller = Arc::new(build_controller(&cfg)?);
    match cli.command {
        Commands::Login => {
            controller.login().await?;
            println!("logged in as {}", controller.identity().unwrap_or_default());
        }
        Commands::Logout => {
            // Restore first so the relay connections to close are known.
            controller.check_login();
            controller.logout().await?;
            println!("logged out");
        }
        Commands::Status => match controller.check_login() {
            LoginState::LoggedIn => {
                let session = controller.snapshot();
                println!("logged in as {}", session.identity.unwrap_or_default());
                for url in session.relay_urls {
                    println!("relay {url}");
                }
            }
            _ => println!("logged out"),
        },
        Commands::Following => {
            controller.login().await?;
            let event = controller
                .wait_for_follow_list(cfg.sync_timeout)
                .await
                .ok_or(FollowError::NotReady)?;
            for identity in followed_identities(&event) {
                println!("{identity}");
            }
        }
        Commands::Follow { identity } => {
            act(&controller, &cfg, FollowAction::Follow, &identity).await?;
        }
        Commands::Unfollow { identity } => {
            act(&controller, &cfg, FollowAction::Unfollow, &identity).await?;
        }
    }
    Ok(())
}

async fn act(
    controller: &Arc<LoginController>,
    cfg: &Settings,
    action: FollowAction,
    identity: &str,
) -> Result<()> {
    let handler = FollowHandler::new(Arc::clone(controller), cfg.ack_timeout);
    controller.login().await?;
    // A fresh process has to fetch the baseline list before it can edit it.
    controller.wait_for_follow_list(cfg.sync_timeout).await;
    let outcome = handler.perform(action, identity).await?;
    let verb = if outcome.following { "followed" } else { "unfollowed" };
    println!("{verb} {} (accepted by {})", outcome.target, outcome.acknowledged_by);
    Ok(())
}

fn build_controller(cfg: &Settings) -> Result<LoginController> {
    let store = Arc::new(FileSessionStore::new(cfg.session_dir.clone()));
    let signer: Arc<dyn Signer> = match &cfg.secret_key {
        Some(secret) => Arc::new(KeySigner::from_hex(
            secret,
            RelayMap::from_urls(cfg.relays.iter().cloned()),
        )?),
        None => Arc::new(NoSigner),
    };
    let pool = Arc::new(WsRelayPool::new(cfg.tor_socks.clone()));
    Ok(LoginController::new(
        store,
        signer,
        pool,
        Arc::new(LogNotifier),
    ))
}

/// Create a default `.env` file if one is not already present at `path`.
fn ensure_env_file(path: &str) -> Result<()> {
    let env_path = Path::new(path);
    if env_path.exists() {
        return Ok(());
    }
    if let Some(parent) = env_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let base_dir = match env_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => std::env::current_dir()?,
    };
    let session_dir = base_dir.join("followsync-session");
    let mut content = String::new();
    content.push_str(&format!("SESSION_DIR={}\n", display_path(&session_dir)));
    content.push_str("SECRET_KEY=\n");
    content.push_str("RELAYS=\n");
    content.push_str("TOR_SOCKS=\n");
    content.push_str("ACK_TIMEOUT_SECS=10\n");
    content.push_str("SYNC_TIMEOUT_SECS=5\n");
    fs::write(env_path, content)?;
    Ok(())
}

fn display_path(path: &PathBuf) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(not(test))]
#[tokio::main]
async fn main() -> Result<()> {
    use tracing_subscriber::EnvFilter;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("followsync=info")),
        )
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();
    run(cli).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{fs, sync::Mutex};
    use tempfile::TempDir;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const SECRET: &str = "0101010101010101010101010101010101010101010101010101010101010101";

    fn clear_env() {
        for v in [
            "SESSION_DIR",
            "SECRET_KEY",
            "RELAYS",
            "TOR_SOCKS",
            "ACK_TIMEOUT_SECS",
            "SYNC_TIMEOUT_SECS",
        ] {
            std::env::remove_var(v);
        }
    }

    fn write_env(dir: &TempDir, secret: &str) -> String {
        let env_path = dir.path().join(".env");
        let content = format!(
            "SESSION_DIR={}\nSECRET_KEY={}\nRELAYS=\nSYNC_TIMEOUT_SECS=0\nACK_TIMEOUT_SECS=1\n",
            dir.path().join("session").display(),
            secret
        );
        fs::write(&env_path, content).unwrap();
        env_path.to_str().unwrap().into()
    }

    fn cli(env: &str, command: Commands) -> Cli {
        Cli {
            env: env.to_string(),
            command,
        }
    }

    #[tokio::test]
    async fn login_status_logout() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_env();
        let dir = TempDir::new().unwrap();
        let env_file = write_env(&dir, SECRET);

        run(cli(&env_file, Commands::Login)).await.unwrap();
        assert!(dir.path().join("session/session.json").exists());
        run(cli(&env_file, Commands::Status)).await.unwrap();
        run(cli(&env_file, Commands::Logout)).await.unwrap();
        assert!(!dir.path().join("session/session.json").exists());
        // Logging out twice is harmless.
        run(cli(&env_file, Commands::Logout)).await.unwrap();
    }

    #[tokio::test]
    async fn login_without_key_fails() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_env();
        let dir = TempDir::new().unwrap();
        let env_file = write_env(&dir, "");

        let err = run(cli(&env_file, Commands::Login)).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<FollowError>(),
            Some(FollowError::LoginFailed(_))
        ));
        assert!(!dir.path().join("session/session.json").exists());
    }

    #[tokio::test]
    async fn follow_before_sync_is_not_ready() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_env();
        let dir = TempDir::new().unwrap();
        let env_file = write_env(&dir, SECRET);

        let err = run(cli(
            &env_file,
            Commands::Follow {
                identity: "ab".repeat(32),
            },
        ))
        .await
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<FollowError>(),
            Some(FollowError::NotReady)
        ));
    }

    #[tokio::test]
    async fn creates_default_env() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_env();
        let dir = TempDir::new().unwrap();
        let env_path = dir.path().join("conf/.env");
        run(cli(env_path.to_str().unwrap(), Commands::Status))
            .await
            .unwrap();

        let data = fs::read_to_string(&env_path).unwrap();
        let expected = dir.path().join("conf/followsync-session");
        assert!(data.contains(&format!("SESSION_DIR={}", expected.to_string_lossy())));
        assert!(data.contains("ACK_TIMEOUT_SECS=10"));
    }
}
