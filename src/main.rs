use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use rental_admin::sync::{
    AdminApi, AuthGateway, ChannelManager, CredentialStore, Decision, FileCredentialStore,
    ListQuery, ListSync, PageState, SyncResource, UserRequests, VehicleRequests,
    WebSocketConnector,
};
use rental_admin::AdminConfig;

#[derive(Parser)]
#[command(name = "rental-admin", version, about = "Vehicle rental admin console")]
struct Cli {
    /// Optional TOML config file
    #[arg(long, env = "ADMIN_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum Resource {
    Users,
    Vehicles,
}

#[derive(Subcommand)]
enum Command {
    /// Sign in and store the session tokens
    Login {
        #[arg(long)]
        email: String,
        #[arg(long, env = "ADMIN_PASSWORD")]
        password: String,
    },
    /// Forget the stored session
    Logout,
    /// Print user and vehicle statistics
    Stats,
    /// Follow the pending requests of one resource live
    Watch {
        resource: Resource,
        #[arg(long, default_value_t = 1)]
        page: u32,
    },
    /// Show one pending request in full
    Details { resource: Resource, id: i64 },
    Approve { resource: Resource, id: i64 },
    Reject {
        resource: Resource,
        id: i64,
        #[arg(long)]
        reason: String,
    },
    /// Browse all users or vehicles
    List {
        resource: Resource,
        #[arg(long, default_value_t = 1)]
        page: u32,
        #[arg(long, default_value_t = 10)]
        limit: u32,
        #[arg(long)]
        search: Option<String>,
        #[arg(long)]
        status: Option<String>,
    },
    Suspend { resource: Resource, id: i64 },
    Unsuspend { resource: Resource, id: i64 },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("rental_admin=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = AdminConfig::load(cli.config.as_deref())?;

    let credentials_path = config.credentials_file()?;
    let credentials: Arc<dyn CredentialStore> = Arc::new(FileCredentialStore::new(credentials_path));

    let gateway = Arc::new(AuthGateway::new(
        config.api_base_url.clone(),
        config.request_timeout(),
        credentials.clone(),
    )?);
    let api = AdminApi::new(gateway);

    let result = run(cli.command, &config, &api, credentials).await;
    if let Err(e) = &result {
        error!("{:#}", e);
    }
    result
}

async fn run(
    command: Command,
    config: &AdminConfig,
    api: &AdminApi,
    credentials: Arc<dyn CredentialStore>,
) -> Result<()> {
    match command {
        Command::Login { email, password } => {
            api.login(&email, &password).await.context("Login failed")?;
            println!("Signed in as {}", email);
        }

        Command::Logout => {
            api.logout()?;
            println!("Signed out");
        }

        Command::Stats => {
            require_session(api)?;
            let (users, vehicles) = tokio::try_join!(api.users_statistics(), api.vehicles_statistics())?;
            println!("Users:\n{}", serde_json::to_string_pretty(&users)?);
            println!("Vehicles:\n{}", serde_json::to_string_pretty(&vehicles)?);
        }

        Command::Watch { resource, page } => {
            require_session(api)?;
            let manager = Arc::new(ChannelManager::new(
                config.socket_url.clone(),
                credentials,
                Arc::new(WebSocketConnector::new(config.heartbeat_interval())),
            ));

            match resource {
                Resource::Users => watch::<UserRequests>(manager.clone(), config.page_limit, page).await?,
                Resource::Vehicles => watch::<VehicleRequests>(manager.clone(), config.page_limit, page).await?,
            }
            manager.release().await;
        }

        Command::Details { resource, id } => {
            require_session(api)?;
            let record = match resource {
                Resource::Users => api.level2_user_details(id).await?,
                Resource::Vehicles => api.vehicle_details(id).await?,
            };
            println!("{}", serde_json::to_string_pretty(&record)?);
        }

        Command::Approve { resource, id } => {
            require_session(api)?;
            decide(api, resource, id, Decision::Approve).await?;
            println!("Approved {}", id);
        }

        Command::Reject { resource, id, reason } => {
            require_session(api)?;
            decide(api, resource, id, Decision::reject(reason)).await?;
            println!("Rejected {}", id);
        }

        Command::List { resource, page, limit, search, status } => {
            require_session(api)?;
            let query = ListQuery {
                page,
                limit,
                search,
                status_filter: status,
            };
            let (records, total_pages) = match resource {
                Resource::Users => {
                    let page = api.list_users(&query).await?;
                    (page.users.unwrap_or_default(), page.total_pages)
                }
                Resource::Vehicles => {
                    let page = api.list_vehicles(&query).await?;
                    (page.vehicles.unwrap_or_default(), page.total_pages)
                }
            };
            for record in &records {
                println!("{}", serde_json::to_string(record)?);
            }
            println!("Page {} of {}", query.page, total_pages.unwrap_or(1));
        }

        Command::Suspend { resource, id } => {
            require_session(api)?;
            match resource {
                Resource::Users => api.suspend_user(id).await?,
                Resource::Vehicles => api.suspend_vehicle(id).await?,
            }
            println!("Suspended {}", id);
        }

        Command::Unsuspend { resource, id } => {
            require_session(api)?;
            match resource {
                Resource::Users => api.unsuspend_user(id, "APPROVED").await?,
                Resource::Vehicles => api.unsuspend_vehicle(id).await?,
            }
            println!("Unsuspended {}", id);
        }
    }

    Ok(())
}

fn require_session(api: &AdminApi) -> Result<()> {
    if !api.is_authenticated()? {
        anyhow::bail!("Not signed in. Run `rental-admin login` first.");
    }
    Ok(())
}

async fn decide(api: &AdminApi, resource: Resource, id: i64, decision: Decision) -> Result<()> {
    match resource {
        Resource::Users => api.decide_user_level2(id, &decision).await?,
        Resource::Vehicles => api.decide_vehicle(id, &decision).await?,
    }
    Ok(())
}

/// Print the list every time it changes, until Ctrl-C
async fn watch<R: SyncResource>(manager: Arc<ChannelManager>, limit: u32, page: u32) -> Result<()> {
    let sync = ListSync::<R>::activate(manager, limit, page).await;
    let mut changes = sync.watch();
    render::<R>(&changes.borrow_and_update());

    info!("Watching {}; press Ctrl-C to stop", R::NAME);
    loop {
        tokio::select! {
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
                render::<R>(&changes.borrow_and_update());
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    Ok(())
}

fn render<R: SyncResource>(state: &PageState) {
    if let Some(error) = &state.error {
        println!("[{}] error: {}", R::NAME, error);
        return;
    }
    if state.loading {
        println!("[{}] loading page {}...", R::NAME, state.current_page);
        return;
    }

    println!(
        "[{}] page {}/{} ({} pending)",
        R::NAME, state.current_page, state.total_pages, state.items.len()
    );
    for item in &state.items {
        println!("  #{} {}", item.id, serde_json::Value::Object(item.fields.clone()));
    }
}
