use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use codexec::config::{CliArgs, Config};
use codexec::database::{self as db, SqliteTemplateStore};
use codexec::executor::{ExecutionLimits, Executor};
use codexec::language::LanguageRegistry;
use codexec::sandbox::{DockerRunner, SandboxPolicy};
use codexec::web_server::build_server;
use codexec::workspace::WorkspaceManager;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let cli = CliArgs::parse();
    let Config {
        server: server_config,
        executor: executor_config,
        images,
    } = cli.to_config()?;

    let db_path = match cli.database_path {
        Some(path) => path,
        None => db::get_db_path()?,
    };
    let db_pool = db::init_db(&db_path)
        .await
        .context("Failed to initialize database")?;

    let runner = Arc::new(
        DockerRunner::connect(SandboxPolicy::from(&executor_config))
            .context("Failed to configure the Docker client")?,
    );
    runner
        .ping()
        .await
        .context("Docker daemon is not reachable")?;
    if let Err(e) = runner.reap_orphans().await {
        log::warn!("Failed to look for orphaned sandbox containers: {e}");
    }

    let executor = Arc::new(Executor::new(
        Arc::new(LanguageRegistry::with_images(&images)),
        WorkspaceManager::new(&executor_config.workspace_root),
        runner.clone(),
        Arc::new(SqliteTemplateStore::new(db_pool)),
        ExecutionLimits::from(&executor_config),
    ));
    log::info!(
        "Executor ready: run timeout {:?}, workspaces under {}",
        std::time::Duration::from(executor_config.run_timeout_ms),
        executor_config.workspace_root.display()
    );

    // ======= PREPARATION END, EXECUTION START =======

    let server = build_server(server_config, executor).context("Failed to build server")?;
    let server_handle = server.handle();
    let server_task = actix_web::rt::spawn(server);

    // ===== EXECUTION END, WAITING FOR SHUTDOWN ======

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            log::info!("Ctrl-c received, shutting down...");
        }
        res_server = server_task => {
            log::error!("Server terminated unexpectedly: {:?}", res_server);
        }
    }

    // 1. Stop accepting requests and let in-flight executions finish
    server_handle.stop(true).await;

    // 2. Remove any sandbox still alive
    runner.shutdown().await;

    log::info!("Shutdown complete");
    Ok(())
}
