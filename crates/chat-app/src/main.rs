use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use relay::app::{ChatApp, SubmissionQueue};
use relay::chat::LogEvent;
use relay::console::{
    ConsoleCommand, HELP_TEXT, render_attachments, render_message, render_notification,
    render_status,
};
use relay::settings::SettingsStore;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;

/// Terminal front end.
///
/// Reads one line per turn from stdin and prints log appends, the composing
/// indicator and connectivity changes as they happen. Diagnostics go to
/// stderr, filtered by `RUST_LOG`.
#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let store = SettingsStore::load();
    tracing::info!(path = ?store.path(), "settings loaded");
    match store.write_defaults_if_missing() {
        Ok(true) => tracing::info!(path = ?store.path(), "wrote default settings file"),
        Ok(false) => {}
        Err(error) => tracing::warn!(error = %error, "could not write default settings file"),
    }

    let app = match ChatApp::new(store.settings()) {
        Ok(app) => Arc::new(app),
        Err(error) => {
            tracing::error!(stage = error.stage(), error = %error, "failed to build chat client");
            return ExitCode::FAILURE;
        }
    };

    let printers = spawn_printers(&app);
    app.start();
    println!("{HELP_TEXT}");

    let queue = SubmissionQueue::spawn(Arc::clone(&app));

    let mut quit_requested = false;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(error) => {
                tracing::error!(error = %error, "failed to read from stdin");
                break;
            }
        };

        match ConsoleCommand::parse(&line) {
            ConsoleCommand::Submit(text) => {
                if !queue.submit(text) {
                    break;
                }
            }
            ConsoleCommand::Attach(paths) => {
                if paths.is_empty() {
                    println!("usage: /attach <path>...");
                }
                for notice in app.attach_files(paths) {
                    println!("{}", render_notification(&notice));
                }
                println!("{}", render_attachments(&app.attachments().pending()));
            }
            ConsoleCommand::Remove(name) => {
                if !app.remove_attachment_named(&name) {
                    println!("no pending attachment named {name:?}");
                }
            }
            ConsoleCommand::ListAttachments => {
                println!("{}", render_attachments(&app.attachments().pending()));
            }
            ConsoleCommand::ClearAttachments => {
                println!("dropped {} pending attachment(s)", app.clear_attachments());
            }
            ConsoleCommand::Cancel => {
                if !app.cancel_turn() {
                    println!("nothing to cancel");
                }
            }
            ConsoleCommand::Help => println!("{HELP_TEXT}"),
            ConsoleCommand::Quit => {
                quit_requested = true;
                break;
            }
            ConsoleCommand::Unknown(name) => println!("unknown command /{name}, try /help"),
        }
    }

    if quit_requested {
        queue.abandon().await;
    } else {
        queue.finish().await;
    }
    // Dropping the app closes its channels, so the printers flush and exit.
    drop(app);
    let printers = futures::future::join_all(printers);
    if tokio::time::timeout(Duration::from_secs(2), printers)
        .await
        .is_err()
    {
        tracing::warn!("output printers did not finish");
    }

    ExitCode::SUCCESS
}

fn spawn_printers(app: &ChatApp) -> Vec<JoinHandle<()>> {
    let mut log_rx = app.subscribe_log();
    let mut composing_rx = app.subscribe_composing();
    let mut connectivity_rx = app.subscribe_connectivity();

    let log_printer = tokio::spawn(async move {
        loop {
            match log_rx.recv().await {
                Ok(LogEvent::Appended { message, .. }) => println!("{}", render_message(&message)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "log printer fell behind");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let composing_printer = tokio::spawn(async move {
        while composing_rx.changed().await.is_ok() {
            if *composing_rx.borrow_and_update() {
                println!("assistant is typing...");
            }
        }
    });

    let connectivity_printer = tokio::spawn(async move {
        let mut shown = *connectivity_rx.borrow_and_update();
        println!("{}", render_status(shown));
        while connectivity_rx.changed().await.is_ok() {
            let status = *connectivity_rx.borrow_and_update();
            if status != shown {
                shown = status;
                println!("{}", render_status(status));
            }
        }
    });

    vec![log_printer, composing_printer, connectivity_printer]
}
