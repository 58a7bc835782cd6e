mod app;
mod args;
mod cli;
mod config;
mod db;
mod embed;
mod tools;
mod util;
mod worker;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{RollingFileAppender, Rotation},
};
use tracing_subscriber::{
    fmt::layer as fmt_layer, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

use crate::app::{hoard_app, state::*};
use crate::args::Command;
use crate::config::HoardConfig;
use crate::db::locks::{LockError, ServerLock, WriteLock};
use crate::db::{migrations, Db, Writer};
use crate::embed::TrigramEmbedder;
use crate::worker::Worker;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Get args
    let options = match args::cli_options() {
        Ok(options) => options,
        Err(usage) => {
            eprintln!("{usage}");
            std::process::exit(2);
        }
    };

    // Get the config
    let config = match &options.config {
        Some(path) => HoardConfig::load(path)?,
        None => HoardConfig::load("hoard.toml")?,
    };

    // Set up tracing

    // A Registry subscriber is a hairball of a type that grows more fuzz
    // with every layer, so you can't do conditional `.with()`s. But
    // Option<Layer> implements Layer, so we can unconditionally add layer
    // values that represent a condition.
    let stdout_layer = if config.log.stdout {
        Some(fmt_layer())
    } else {
        None
    };

    // The non-blocking logfile writer relies on a drop-guard to ensure
    // writes get flushed at the end of main. So we need to make sure we're
    // holding onto it at top scope, instead of dropping it at the end of a
    // conditional.
    let mut _log_writer_guard: Option<WorkerGuard> = None;
    let logrotate_layer = if let Some(logfile) = &config.log.file {
        let file_appender = RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .filename_prefix(&logfile.name)
            .filename_suffix("log")
            .max_log_files(logfile.days)
            .build(&logfile.directory)?;
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        // Hand the guard off to the outer scope
        _log_writer_guard = Some(guard);
        Some(fmt_layer().with_writer(non_blocking).with_ansi(false))
    } else {
        None
    };

    // Ok, there we go. Beyond this point, we can now log with tracing!
    tracing_subscriber::registry()
        .with(EnvFilter::new(&config.log.filter))
        .with(stdout_layer)
        .with(logrotate_layer)
        .init();

    // Admin commands run and exit; serve keeps going.
    match options.command {
        Command::Serve => serve(config).await,
        Command::Migrate => cli::migrate(&config).await,
        Command::Status => cli::status(&config).await,
        Command::Sync => cli::sync(&config).await,
        Command::Doctor => cli::doctor(&config).await,
        Command::MemoryPut {
            slot,
            content,
            ttl_days,
        } => cli::memory_put(&config, &slot, &content, ttl_days).await,
        Command::MemoryGet { slot } => cli::memory_get(&config, &slot).await,
        Command::MemoryPrune => cli::memory_prune(&config).await,
    }
}

async fn serve(config: HoardConfig) -> anyhow::Result<()> {
    // Claim the singleton lock before touching anything else; a second
    // server on the same store is a config mistake, not a peer.
    let _server_lock = match ServerLock::acquire(&config.server_lock_path()) {
        Ok(lock) => lock,
        Err(LockError::Held(_)) => {
            anyhow::bail!("Another hoard server is already running on this database.");
        }
        Err(e) => return Err(e.into()),
    };

    // Set up cancellation and task tracking
    let cancel_token = CancellationToken::new();
    let tracker = TaskTracker::new();

    // Open the one writable connection and get the schema current, under
    // the write lock so a concurrent CLI migrate can't interleave. A
    // failure in here is fatal: we refuse to serve a broken store.
    debug!("using db file at {:?}", &config.db_file);
    let write_lock = WriteLock::new(
        config.write_lock_path(),
        Duration::from_millis(config.database.lock_timeout_ms),
    );
    let mut writer_conn = db::writer_connection(&config.db_file, config.database.busy_timeout_ms)
        .await
        .context("storage unavailable")?;
    {
        let _guard = write_lock.acquire().await?;
        migrations::run(&mut writer_conn)
            .await
            .context("schema migration failed; refusing to serve")?;
    }

    // This is a local single-tenant service, so go easy on parallelism:
    // up to (cores - 2) reader connections, with a minimum of 2.
    let cores = std::thread::available_parallelism()?.get() as u32;
    let max_readers = cores.saturating_sub(2).max(2);
    debug!("{cores} cores available, limiting db readers to {max_readers}");
    let read_pool = db::reader_pool(&config.db_file, config.database.busy_timeout_ms, max_readers)
        .await
        .context("storage unavailable")?;

    // The write coordinator owns the writable connection from here on.
    let writer = Writer::spawn(writer_conn, write_lock, &tracker);
    let db = Db::new(read_pool, writer, tracker.clone());

    if config.validate_migrations {
        info!("validating database migrations");
        db.migrations().validate().await?;
    }

    // Build the app state
    let inner = HoardInner {
        db: db.clone(),
        config: config.clone(),
        task_tracker: tracker.clone(),
        cancel_token: cancel_token.clone(),
    };
    let state: HoardState = Arc::new(inner);

    // ok, ok,...
    let app = hoard_app(state);

    // Spawn the shutdown signal listener, outside the tracker
    tokio::spawn(cancel_on_terminate(cancel_token.clone()));

    // Spawn the background job worker, in the tracker
    if config.worker.enabled {
        let worker = Worker::new(
            db.clone(),
            Arc::new(TrigramEmbedder),
            &config.worker,
            &config.duplicates,
        );
        tracker.spawn(worker.run(cancel_token.clone()));
    }

    // Serve tools til we're done! Local service, loopback only.
    info!("starting tool server on port {}", config.port);
    let listener = TcpListener::bind(("127.0.0.1", config.port)).await?;
    let serve_result = axum::serve(listener, app)
        .with_graceful_shutdown(cancel_token.clone().cancelled_owned())
        .await;

    // Clean up:
    if let Err(e) = serve_result {
        // It's possible there was no cancel signal sent earlier, so send one now.
        error!("server loop exited with an error: {}", e);
        cancel_token.cancel();
    }
    info!("waiting for tasks to finish");
    // The coordinator task lives in the tracker, so stop its queue first
    // or the wait below never ends.
    db.writer.shutdown();
    tracker.close();
    tracker.wait().await;
    db.close().await;
    info!("see ya!");

    Ok(())
}

/// Waits until the program receives an external instruction to terminate
/// via either SIGINT (ctrl-c) or SIGTERM (kill), then cancels the provided
/// CancellationToken. This can be spawned as an independent task, and then
/// the main logic can just await the cancellation token.
#[tracing::instrument(skip_all)]
async fn cancel_on_terminate(cancel_token: CancellationToken) {
    use tokio::signal::{
        ctrl_c,
        unix::{signal, SignalKind},
    };
    let Ok(mut terminate) = signal(SignalKind::terminate()) else {
        // If we can't listen for the signal, bail immediately
        error!("couldn't even establish SIGTERM signal listener; taking my ball and going home");
        cancel_token.cancel();
        return;
    };
    // Wait indefinitely until we hear a shutdown signal.
    // The ctrl_c function listens for SIGINT, the other one listens for
    // SIGTERM (aka `kill`/`killall` with no flags).
    select! {
        _ = ctrl_c() => {
            // don't care if Ok or Err
            info!("received SIGINT, starting shutdown");
        },
        _ = terminate.recv() => {
            // don't care if Some or None
            info!("received SIGTERM, starting shutdown");
        },
    }
    // Ok, spread the news
    cancel_token.cancel();
}
