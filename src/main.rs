mod api;
mod config;
mod error;
mod executor;
mod models;
mod paths;
mod repository;
mod services;

use crate::config::{Config, PoolStoreKind};
use crate::executor::{SshExecutor, SshMultiplexer};
use crate::repository::{
    ExecutionRepository, KeyDirectory, MemoryPoolStore, OwnershipRepository, PoolStore,
    SqlitePoolStore, StaticHostDirectory, establish_connection,
};
use crate::services::{ConnectionPool, ExecutionService};
use api::create_router;
use axum::Router;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

/// Serves until `signal` fires. Executions are ended inside the shutdown
/// future, since open streams only close once their executions settle.
async fn serve(
    listener: TcpListener,
    app: Router,
    execution_service: ExecutionService,
    signal: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            signal.await;
            execution_service.shutdown().await;
        })
        .await
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ssh_relay=debug,tower_http=debug,axum=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env()?;
    tracing::info!("Starting ssh_relay with config: {:?}", config);

    if let Some(path) = config.database_url.strip_prefix("sqlite:") {
        let path = std::path::Path::new(path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
    }

    // Establish database connection
    let db_pool = establish_connection(&config.database_url).await?;
    tracing::info!("Database connected: {}", config.database_url);

    // Initialize repositories
    let execution_repo = ExecutionRepository::new(db_pool.clone());
    let owners = OwnershipRepository::new(db_pool.clone(), config.execution.handle_ttl());
    let hosts = StaticHostDirectory::new(config.hosts.clone());
    if config.hosts.is_empty() {
        tracing::warn!("No hosts configured");
    } else {
        tracing::info!("Loaded {} host(s)", config.hosts.len());
    }
    let keys = KeyDirectory::new(paths::keys_dir()?);
    let pool_store: Arc<dyn PoolStore> = match config.ssh.pool_store {
        PoolStoreKind::Memory => Arc::new(MemoryPoolStore::new()),
        PoolStoreKind::Sqlite => Arc::new(SqlitePoolStore::new(db_pool)),
    };

    // Initialize services
    let ssh = &config.ssh;
    paths::ensure_private_dir(&ssh.control_dir)?;
    let multiplexer = SshMultiplexer::new(
        ssh.ssh_path.clone(),
        ssh.connect_timeout(),
        std::time::Duration::from_secs(ssh.control_persist_secs),
    );
    let pool = ConnectionPool::new(
        pool_store,
        Arc::new(multiplexer),
        ssh.control_dir.clone(),
        ssh.pool_max_size,
        ssh.max_connection_age(),
    );
    let executor = SshExecutor::new(
        ssh.ssh_path.clone(),
        ssh.connect_timeout(),
        config.execution.kill_grace(),
    );
    let execution_service = ExecutionService::new(
        execution_repo,
        Arc::new(owners),
        Arc::new(hosts),
        Arc::new(keys),
        pool,
        executor,
        config.execution.clone(),
    );

    // Create router
    let app = create_router(execution_service.clone());
    let app = app.layer(TraceLayer::new_for_http());

    // Start server
    let addr = format!("{}:{}", config.host, config.port);
    let addr = addr.parse::<SocketAddr>()?;
    tracing::info!("Server listening on {}", addr);

    let listener = TcpListener::bind(addr).await?;
    serve(listener, app, execution_service, shutdown_signal()).await?;
    tracing::info!("Stopped");

    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::executor::ShellMode;
    use crate::services::StartExecution;
    use crate::services::test_support::execution_service;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn shutdown_ends_open_streams_and_returns() {
        let dir = tempfile::tempdir().unwrap();
        let service = execution_service(dir.path()).await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (trigger, signal) = tokio::sync::oneshot::channel::<()>();
        let server = tokio::spawn(serve(
            listener,
            create_router(service.clone()),
            service.clone(),
            async move {
                let _ = signal.await;
            },
        ));

        let id = service
            .start_execution(StartExecution {
                command: "sleep 120".to_string(),
                host_id: "web".to_string(),
                owner_id: "alice".to_string(),
                mode: ShellMode::Raw,
                timeout_secs: None,
            })
            .await
            .unwrap();

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!(
            "GET /api/executions/{id}/stream HTTP/1.1\r\nhost: localhost\r\nx-user-id: alice\r\n\r\n"
        );
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut received = vec![0u8; 4096];
        let n = stream.read(&mut received).await.unwrap();
        received.truncate(n);
        assert!(String::from_utf8_lossy(&received).starts_with("HTTP/1.1 200"));

        trigger.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(10), server)
            .await
            .expect("server should stop while a stream is open")
            .unwrap()
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut received))
            .await
            .expect("connection should close")
            .unwrap();
        let wire = String::from_utf8_lossy(&received);
        assert!(wire.contains("\"type\":\"complete\""), "{wire}");
        assert!(wire.contains("\"data\":\"killed\""), "{wire}");
    }
}
