use std::{process, time::Duration};

use serde::Serialize;
use spry::{
    application::{context::AppContext, error::AppError, jobs, rules::RuleChain},
    cache::{EventKind, PurgeReport, StoreStats},
    config::{self, BundlesCommand, Command, NotifyCommand, PreloadCommand, PurgeCommand},
    infra::{error::InfraError, http, telemetry},
    util::bytes::format_bytes,
};
use time::format_description::well_known::Rfc3339;
use tokio::{sync::oneshot, task::JoinHandle};
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
    let (cli_args, settings) = config::load_with_cli()?;
    let command = cli_args
        .command
        .unwrap_or(Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging)?;
    let app = AppContext::build(settings, RuleChain::new())?;

    match command {
        Command::Serve(_) => run_serve(app).await,
        Command::Purge(args) => run_purge(&app, args.command).await,
        Command::Notify(args) => {
            run_notify(&app, args.command).await;
            Ok(())
        }
        Command::Cleanup => {
            let removed = app.cache.cleanup_expired();
            println!("removed {removed} expired page(s)");
            Ok(())
        }
        Command::Stats(args) => run_stats(&app, args.json),
        Command::Preload(args) => run_preload(&app, args.command).await,
        Command::Bundles(args) => run_bundles(&app, args.command),
    }
}

async fn run_serve(app: AppContext) -> Result<(), AppError> {
    let consume_handle = spawn_purge_consumer(&app);
    let monitor_handle = if app.settings.scheduler.enabled {
        Some(jobs::spawn_scheduler(
            &app.settings.scheduler,
            app.cache.clone(),
            app.preload.clone(),
        )?)
    } else {
        info!("Scheduler disabled");
        None
    };

    let result = serve_admin(&app).await;

    if let Some(handle) = monitor_handle {
        handle.abort();
        let _ = handle.await;
    }
    if let Some(handle) = consume_handle {
        handle.abort();
        let _ = handle.await;
    }
    app.consumer.consume().await;

    result
}

/// Drain the purge queue on a fixed interval while caching is enabled.
fn spawn_purge_consumer(app: &AppContext) -> Option<JoinHandle<()>> {
    if !app.cache.config().is_enabled() {
        return None;
    }
    let consumer = app.consumer.clone();
    let period = app.settings.cache.auto_consume_interval;
    Some(tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.tick().await;
        loop {
            interval.tick().await;
            consumer.consume().await;
        }
    }))
}

async fn serve_admin(app: &AppContext) -> Result<(), AppError> {
    let router = http::build_admin_router(app.admin_state());
    let listener = tokio::net::TcpListener::bind(app.settings.admin.addr)
        .await
        .map_err(InfraError::from)?;
    info!(addr = %app.settings.admin.addr, "Admin API listening");

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let mut server = tokio::spawn(async move {
        axum::serve(listener, router.into_make_service())
            .with_graceful_shutdown(async move {
                let _ = stop_rx.await;
            })
            .await
    });

    tokio::select! {
        joined = &mut server => return server_outcome(joined),
        () = shutdown_signal() => {}
    }

    info!("Shutdown requested");
    let _ = stop_tx.send(());
    let grace: Duration = app.settings.admin.graceful_shutdown;
    match tokio::time::timeout(grace, &mut server).await {
        Ok(joined) => server_outcome(joined),
        Err(_) => {
            warn!(grace_secs = grace.as_secs(), "Graceful shutdown timed out");
            server.abort();
            Ok(())
        }
    }
}

fn server_outcome(
    joined: Result<std::io::Result<()>, tokio::task::JoinError>,
) -> Result<(), AppError> {
    match joined {
        Ok(result) => result.map_err(|err| AppError::from(InfraError::from(err))),
        Err(err) => Err(AppError::unexpected(format!("admin server task failed: {err}"))),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}

async fn run_purge(app: &AppContext, command: PurgeCommand) -> Result<(), AppError> {
    let report = match command {
        PurgeCommand::All { no_cdn } => app.cache.purge_all(!no_cdn).await,
        PurgeCommand::Url { url, no_cdn } => app.cache.purge_url(&url, !no_cdn).await,
        PurgeCommand::Entity { id, no_cdn } => app.cache.purge_entity(id, !no_cdn).await,
    };
    print_purge_report(&report);
    Ok(())
}

/// Publish the change and drain the queue in-process.
async fn run_notify(app: &AppContext, command: NotifyCommand) {
    let kind = match command {
        NotifyCommand::Entity { id } => EventKind::EntityChanged { entity_id: id },
        NotifyCommand::Url { url } => EventKind::UrlChanged { url },
        NotifyCommand::Settings => EventKind::SettingsChanged,
    };
    app.trigger.trigger(kind, true).await;
    println!("processed; {} event(s) still queued", app.trigger.queue().len());
}

fn print_purge_report(report: &PurgeReport) {
    println!("removed {} cached page(s)", report.removed);
    for result in &report.cdn {
        let outcome = if result.success { "ok" } else { "failed" };
        println!("cdn {}: {outcome} ({})", result.provider, result.message);
    }
}

#[derive(Serialize)]
struct StatsOutput {
    pages: StoreStats,
    bundles: StoreStats,
}

fn run_stats(app: &AppContext, json: bool) -> Result<(), AppError> {
    let output = StatsOutput {
        pages: app.cache.stats()?,
        bundles: app.merge.bundles().stats()?,
    };
    if json {
        print_json(&output)?;
    } else {
        print_store_stats("pages", &output.pages);
        print_store_stats("bundles", &output.bundles);
    }
    Ok(())
}

fn print_store_stats(label: &str, stats: &StoreStats) {
    let stamp = |at: Option<time::OffsetDateTime>| {
        at.and_then(|at| at.format(&Rfc3339).ok())
            .unwrap_or_else(|| "-".to_string())
    };
    println!(
        "{label:<8} {} file(s), {} (oldest {}, newest {})",
        stats.files,
        format_bytes(stats.total_bytes),
        stamp(stats.oldest),
        stamp(stats.newest),
    );
}

async fn run_preload(app: &AppContext, command: PreloadCommand) -> Result<(), AppError> {
    match command {
        PreloadCommand::Run => {
            let report = app.preload.run().await?;
            println!(
                "crawled {}/{} page(s), {} recommendation(s)",
                report.crawled, report.candidates, report.recommendations
            );
        }
        PreloadCommand::List { json } => {
            let recommendations = app.preload.recommendations();
            if json {
                print_json(&recommendations)?;
            } else if recommendations.is_empty() {
                println!("no recommendations");
            } else {
                for rec in recommendations {
                    println!(
                        "{}  {:<6} pos {:>3}  pages {:>2}  {}",
                        rec.id,
                        rec.resource_type,
                        rec.position,
                        rec.pages.len(),
                        rec.url
                    );
                }
            }
        }
        PreloadCommand::Accept { id } => {
            let rec = app.preload.accept(&id)?;
            println!("accepted {} ({})", rec.id, rec.url);
        }
        PreloadCommand::Reject { id } => {
            let rec = app.preload.reject(&id)?;
            println!("rejected {} ({})", rec.id, rec.url);
        }
    }
    Ok(())
}

fn run_bundles(app: &AppContext, command: BundlesCommand) -> Result<(), AppError> {
    let bundles = app.merge.bundles();
    match command {
        BundlesCommand::Purge => {
            let removed = bundles.purge_all()?;
            println!("removed {removed} bundle(s)");
        }
        BundlesCommand::Stats => print_store_stats("bundles", &bundles.stats()?),
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<(), AppError> {
    let rendered = serde_json::to_string_pretty(value)
        .map_err(|err| AppError::unexpected(format!("failed to encode output: {err}")))?;
    println!("{rendered}");
    Ok(())
}
