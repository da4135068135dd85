use std::{process, sync::Arc};

use h1b_insights::{
    application::error::AppError,
    cache::{CacheConfig, CacheManager},
    config,
    domain::reports::ReportName,
    infra::{
        db::PostgresRepositories,
        error::InfraError,
        http::{self, ReportsState},
        telemetry,
    },
};
use tokio::{signal, task::JoinHandle};
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| AppError::unexpected(format!("failed to load configuration: {err}")))?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Warm(_) => run_warm(settings).await,
        config::Command::Report(args) => run_report(settings, args.report).await,
    }
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let manager = init_manager(&settings).await?;

    let warm_handle = manager.config().warm_on_startup.then(|| {
        let manager = manager.clone();
        tokio::spawn(async move {
            manager.warm_all().await;
        })
    });
    let refresh_handle = spawn_refresh_loop(manager.clone());

    let result = serve_http(&settings, ReportsState {
        manager: manager.clone(),
    })
    .await;

    for handle in [warm_handle, refresh_handle].into_iter().flatten() {
        handle.abort();
        let _ = handle.await;
    }

    if tokio::time::timeout(settings.server.graceful_shutdown, manager.shutdown())
        .await
        .is_err()
    {
        warn!(
            timeout_secs = settings.server.graceful_shutdown.as_secs(),
            "report cache shutdown timed out"
        );
    }

    result
}

async fn run_warm(settings: config::Settings) -> Result<(), AppError> {
    let manager = init_manager(&settings).await?;
    let summary = manager.warm_all().await;
    manager.shutdown().await;

    let rendered = serde_json::to_string_pretty(&summary)
        .map_err(|err| AppError::unexpected(format!("failed to encode warm summary: {err}")))?;
    println!("{rendered}");

    if summary.is_complete() {
        Ok(())
    } else {
        Err(AppError::unexpected(format!(
            "{} of {} reports failed to warm",
            summary.failed.len(),
            ReportName::ALL.len()
        )))
    }
}

async fn run_report(settings: config::Settings, report: ReportName) -> Result<(), AppError> {
    let manager = init_manager(&settings).await?;
    let outcome = manager.fetch(report).await;
    manager.shutdown().await;

    let data = outcome.map_err(|err| AppError::unexpected(err.to_string()))?;
    let rendered = serde_json::to_string_pretty(&data)
        .map_err(|err| AppError::unexpected(format!("failed to encode report: {err}")))?;
    println!("{rendered}");
    Ok(())
}

async fn init_manager(settings: &config::Settings) -> Result<Arc<CacheManager>, AppError> {
    let database_url = settings
        .database
        .url
        .as_ref()
        .ok_or_else(|| InfraError::configuration("database url is not configured"))
        .map_err(AppError::from)?;

    let pool = PostgresRepositories::connect(database_url, &settings.database)
        .await
        .map_err(InfraError::from)?;
    let repositories = Arc::new(PostgresRepositories::new(pool));

    Ok(Arc::new(CacheManager::new(
        CacheConfig::from(&settings.cache),
        repositories,
    )))
}

fn spawn_refresh_loop(manager: Arc<CacheManager>) -> Option<JoinHandle<()>> {
    let period = manager.config().refresh_interval()?;
    if !manager.config().enabled {
        return None;
    }

    Some(tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.tick().await; // Skip the first immediate tick
        loop {
            interval.tick().await;
            manager.warm_all().await;
        }
    }))
}

async fn serve_http(settings: &config::Settings, state: ReportsState) -> Result<(), AppError> {
    let router = http::build_router(state);

    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;
    info!(addr = %settings.server.addr, "report server listening");

    axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| AppError::unexpected(format!("server error: {err}")))?;

    info!("report server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(error = %err, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received");
}
