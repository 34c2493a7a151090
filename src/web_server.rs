use std::sync::Arc;

use actix_web::{App, HttpServer, dev::Server, middleware, web};
use tokio::sync::{Semaphore, SemaphorePermit};

use crate::config::ServerConfig;
use crate::executor::Executor;
use crate::routes;

/// Optional cap on executions running at the same time
///
/// Requests beyond the cap wait for a permit instead of starting more sandboxes.
pub struct ExecutionLimiter {
    permits: Option<Semaphore>,
}

impl ExecutionLimiter {
    pub fn new(max_concurrent: Option<usize>) -> Self {
        Self {
            permits: max_concurrent.filter(|&n| n > 0).map(Semaphore::new),
        }
    }

    pub fn unbounded() -> Self {
        Self { permits: None }
    }

    /// Waits for a permit; `None` when unbounded
    pub async fn acquire(&self) -> Option<SemaphorePermit<'_>> {
        match &self.permits {
            // The semaphore is never closed, so acquisition only fails if it were
            Some(semaphore) => semaphore.acquire().await.ok(),
            None => None,
        }
    }

    pub fn available(&self) -> Option<usize> {
        self.permits.as_ref().map(Semaphore::available_permits)
    }
}

pub fn build_server(server_config: ServerConfig, executor: Arc<Executor>) -> std::io::Result<Server> {
    let executor = web::Data::from(executor);
    let limiter = web::Data::new(ExecutionLimiter::new(
        server_config.max_concurrent_executions,
    ));

    if let Some(n) = server_config.max_concurrent_executions {
        log::info!("Limiting concurrent executions to {n}");
    }

    let server = HttpServer::new(move || {
        App::new()
            .app_data(executor.clone())
            .app_data(limiter.clone())
            .wrap(middleware::Logger::default())
            .configure(routes::configure)
    })
    .bind((
        server_config
            .bind_address
            .unwrap_or("127.0.0.1".to_string()),
        server_config.bind_port.unwrap_or(12345),
    ))?
    .run();

    Ok(server)
}
