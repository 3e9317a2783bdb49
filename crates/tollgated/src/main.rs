//! tollgated - The tollgate background service
//!
//! This is the main entry point for the tollgated service.
//! It wires together all the components:
//! - Configuration loading and plan seeding
//! - Store initialization
//! - Session engine
//! - IPC server and request workers
//! - Periodic sweep

mod dispatch;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tollgate_api::{
    ClientRole, Command, ErrorCode, ErrorInfo, Event, EventPayload, HealthStatus, Request,
    ResponsePayload,
};
use tollgate_config::{Config, load_config};
use tollgate_core::SessionEngine;
use tollgate_ipc::{IpcServer, ServerMessage};
use tollgate_store::{AuditEvent, AuditEventType, SqliteStore, Store};
use tollgate_util::{ClientId, RateLimiter, default_config_path};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::dispatch::Outcome;

/// tollgated - Session and quota enforcement service for captive-portal gateways
#[derive(Parser, Debug)]
#[command(name = "tollgated")]
#[command(about = "Session and quota enforcement service for captive-portal gateways", long_about = None)]
struct Args {
    /// Configuration file path (or set TOLLGATE_CONFIG env var)
    #[arg(short, long, env = "TOLLGATE_CONFIG", default_value_os_t = default_config_path())]
    config: PathBuf,

    /// Socket path override (or set TOLLGATE_SOCKET env var)
    #[arg(short, long, env = "TOLLGATE_SOCKET")]
    socket: Option<PathBuf>,

    /// Data directory override (or set TOLLGATE_DATA_DIR env var)
    #[arg(short, long, env = "TOLLGATE_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

/// State shared by the request workers and the sweep task
#[derive(Clone)]
struct Shared {
    engine: Arc<SessionEngine>,
    ipc: Arc<IpcServer>,
    rate_limiter: Arc<Mutex<RateLimiter<ClientId>>>,
    last_sweep: Arc<Mutex<Option<DateTime<Utc>>>>,
    request_timeout: Duration,
}

/// Main service state
struct Service {
    shared: Shared,
    store: Arc<dyn Store>,
    sweep_interval: Duration,
}

impl Service {
    async fn new(args: &Args) -> Result<Self> {
        let config = if args.config.exists() {
            load_config(&args.config)
                .with_context(|| format!("Failed to load config from {:?}", args.config))?
        } else {
            warn!(
                config_path = %args.config.display(),
                "Configuration file not found, using defaults"
            );
            Config::default()
        };

        info!(
            config_path = %args.config.display(),
            plan_count = config.plans.len(),
            usage_regression = %config.engine.usage_regression,
            "Configuration loaded"
        );

        // Determine paths
        let socket_path = args
            .socket
            .clone()
            .unwrap_or_else(|| config.service.socket_path.clone());

        let data_dir = args
            .data_dir
            .clone()
            .unwrap_or_else(|| config.service.data_dir.clone());

        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory {:?}", data_dir))?;

        // Initialize store
        let db_path = data_dir.join("tollgated.db");
        let store: Arc<dyn Store> = Arc::new(
            SqliteStore::open(&db_path)
                .with_context(|| format!("Failed to open database {:?}", db_path))?,
        );

        info!(db_path = %db_path.display(), "Store initialized");

        store.append_audit(AuditEvent::new(AuditEventType::ServiceStarted))?;

        let engine = Arc::new(SessionEngine::new(store.clone(), config.engine.clone()));
        let seeded = engine
            .seed_plans(&config.plans)
            .context("Failed to seed plans from configuration")?;
        info!(plan_count = seeded, "Plan catalog seeded");

        let mut ipc = IpcServer::new(&socket_path);
        ipc.start()
            .await
            .with_context(|| format!("Failed to bind socket {:?}", socket_path))?;

        info!(socket_path = %socket_path.display(), "IPC server started");

        let rate_limiter = RateLimiter::new(
            config.service.requests_per_second,
            Duration::from_secs(1),
        );

        Ok(Self {
            shared: Shared {
                engine,
                ipc: Arc::new(ipc),
                rate_limiter: Arc::new(Mutex::new(rate_limiter)),
                last_sweep: Arc::new(Mutex::new(None)),
                request_timeout: config.service.request_timeout,
            },
            store,
            sweep_interval: config.service.sweep_interval,
        })
    }

    async fn run(self) -> Result<()> {
        let shared = self.shared;
        let mut ipc_messages = shared
            .ipc
            .take_message_receiver()
            .await
            .ok_or_else(|| anyhow!("IPC message receiver already taken"))?;

        // Spawn IPC accept task
        let ipc_accept = shared.ipc.clone();
        tokio::spawn(async move {
            if let Err(e) = ipc_accept.run().await {
                error!(error = %e, "IPC server error");
            }
        });

        let sweeper = tokio::spawn(sweep_loop(shared.clone(), self.sweep_interval));

        let mut sigterm =
            signal(SignalKind::terminate()).context("Failed to create SIGTERM handler")?;
        let mut sigint =
            signal(SignalKind::interrupt()).context("Failed to create SIGINT handler")?;

        info!("Service running");

        loop {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down gracefully");
                    break;
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, shutting down gracefully");
                    break;
                }

                Some(msg) = ipc_messages.recv() => {
                    Self::handle_ipc_message(&shared, &self.store, msg).await;
                }
            }
        }

        info!("Shutting down tollgated");

        sweeper.abort();
        shared.ipc.broadcast_event(Event::new(EventPayload::Shutdown));
        // Let connection writers flush the shutdown event
        tokio::time::sleep(Duration::from_millis(50)).await;

        if let Err(e) = self
            .store
            .append_audit(AuditEvent::new(AuditEventType::ServiceStopped))
        {
            warn!(error = %e, "Failed to log service shutdown");
        }

        shared.ipc.shutdown();
        info!("Shutdown complete");
        Ok(())
    }

    async fn handle_ipc_message(shared: &Shared, store: &Arc<dyn Store>, msg: ServerMessage) {
        match msg {
            ServerMessage::Request { client_id, request } => {
                tokio::spawn(handle_request(shared.clone(), client_id, request));
            }

            ServerMessage::ClientConnected { client_id, info } => {
                info!(
                    client_id = %client_id,
                    role = ?info.role,
                    uid = ?info.uid,
                    "Client connected"
                );

                if let Err(e) = store.append_audit(AuditEvent::new(AuditEventType::ClientConnected {
                    client_id: client_id.to_string(),
                    role: format!("{:?}", info.role),
                    uid: info.uid,
                })) {
                    warn!(error = %e, "Failed to audit client connection");
                }
            }

            ServerMessage::ClientDisconnected { client_id } => {
                debug!(client_id = %client_id, "Client disconnected");

                if let Err(e) = store.append_audit(AuditEvent::new(
                    AuditEventType::ClientDisconnected {
                        client_id: client_id.to_string(),
                    },
                )) {
                    warn!(error = %e, "Failed to audit client disconnect");
                }

                shared.rate_limiter.lock().await.remove(&client_id);
            }
        }
    }
}

fn broadcast(ipc: &IpcServer, events: Vec<EventPayload>) {
    for payload in events {
        ipc.broadcast_event(Event::new(payload));
    }
}

async fn handle_request(shared: Shared, client_id: ClientId, request: Request) {
    let request_id = request.request_id;
    let mut outcome = route(&shared, &client_id, request.command).await;
    broadcast(&shared.ipc, std::mem::take(&mut outcome.events));

    if let Err(e) = shared
        .ipc
        .send_response(&client_id, outcome.into_response(request_id))
        .await
    {
        debug!(client_id = %client_id, error = %e, "Response not delivered");
    }
}

async fn route(shared: &Shared, client_id: &ClientId, command: Command) -> Outcome {
    if !shared.rate_limiter.lock().await.check(client_id) {
        return Outcome::failed(ErrorInfo::new(ErrorCode::RateLimited, "Too many requests"));
    }

    let role = shared
        .ipc
        .get_client_info(client_id)
        .await
        .map(|info| info.role)
        .unwrap_or(ClientRole::Observer);

    if !command.permitted_for(role) {
        warn!(client_id = %client_id, role = ?role, command = ?command, "Command refused");
        return Outcome::failed(ErrorInfo::new(
            ErrorCode::PermissionDenied,
            format!("{:?} clients may not issue this command", role),
        ));
    }

    match command {
        Command::Ping => Outcome::ok(ResponsePayload::Pong),
        Command::SubscribeEvents => Outcome::ok(ResponsePayload::Subscribed {
            client_id: client_id.clone(),
        }),
        Command::UnsubscribeEvents => Outcome::ok(ResponsePayload::Unsubscribed),
        Command::GetHealth => Outcome::ok(ResponsePayload::Health(health(shared).await)),
        command => {
            let is_sweep = matches!(command, Command::Sweep);
            let outcome = run_engine(shared, command).await;
            if is_sweep && outcome.result.is_ok() {
                *shared.last_sweep.lock().await = Some(tollgate_util::now());
            }
            outcome
        }
    }
}

/// Run an engine command on the blocking pool, bounded by the request timeout.
///
/// A command that outlives the timeout still commits or rolls back as a
/// whole; its events are broadcast once it finishes.
async fn run_engine(shared: &Shared, command: Command) -> Outcome {
    let engine = shared.engine.clone();
    let mut task = tokio::task::spawn_blocking(move || {
        dispatch::execute(&engine, command, tollgate_util::now())
    });

    match tokio::time::timeout(shared.request_timeout, &mut task).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(e)) => {
            error!(error = %e, "Request worker failed");
            Outcome::failed(ErrorInfo::new(
                ErrorCode::InternalError,
                "Request worker failed",
            ))
        }
        Err(_) => {
            warn!(timeout = ?shared.request_timeout, "Request timed out");
            let ipc = shared.ipc.clone();
            tokio::spawn(async move {
                if let Ok(outcome) = task.await {
                    broadcast(&ipc, outcome.events);
                }
            });
            Outcome::failed(ErrorInfo::new(
                ErrorCode::Timeout,
                "Request timed out; it may still complete",
            ))
        }
    }
}

async fn health(shared: &Shared) -> HealthStatus {
    let engine = shared.engine.clone();
    let store_ok = tokio::task::spawn_blocking(move || engine.is_healthy())
        .await
        .unwrap_or(false);
    let last_sweep = *shared.last_sweep.lock().await;

    HealthStatus {
        live: true,
        ready: store_ok && last_sweep.is_some(),
        store_ok,
        last_sweep,
    }
}

/// Periodic sweep; passes never overlap
async fn sweep_loop(shared: Shared, period: Duration) {
    let mut timer = tokio::time::interval(period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        timer.tick().await;

        let outcome = run_engine(&shared, Command::Sweep).await;
        match outcome.result {
            Ok(_) => {
                *shared.last_sweep.lock().await = Some(tollgate_util::now());
                broadcast(&shared.ipc, outcome.events);
            }
            Err(e) => {
                warn!(code = ?e.code, message = %e.message, "Sweep failed, will retry next period");
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // RUST_LOG wins over --log-level
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "tollgated starting");

    if tollgate_util::is_mock_time_active() {
        warn!(now = %tollgate_util::now(), "Mock time is active");
    }

    let service = Service::new(&args).await?;
    service.run().await
}
