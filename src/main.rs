use anyhow::{Context, Result};
use cycle_stories::backend::{Backend, RestBackend};
use cycle_stories::filter::FilterSelection;
use cycle_stories::live::{LiveList, ViewScope};
use cycle_stories::notice::Notices;
use cycle_stories::settings::settings;
use cycle_stories::utils::logs;
use std::sync::Arc;
use std::time::Duration;
use tracing::subscriber::set_global_default;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let subscriber = tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive("cycle_stories=info".parse()?))
        .with(
            fmt::layer()
                .with_target(false)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .compact(),
        );
    set_global_default(subscriber).context("failed to set tracing subscriber")?;

    let scope = match std::env::var("VIEW").as_deref() {
        Ok("posts") => ViewScope::community_posts(),
        _ => ViewScope::stories(),
    };
    let filter = FilterSelection::from_params(
        std::env::var("CATEGORY").ok().as_deref(),
        std::env::var("MOOD").ok().as_deref(),
    );
    let summary_secs: u64 = std::env::var("SUMMARY_SECS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(60);

    logs::log_init(&settings().backend.url, scope.kind, &filter);

    let backend = Arc::new(RestBackend::from_settings()?);
    if let (Ok(email), Ok(password)) = (
        std::env::var("BACKEND_EMAIL"),
        std::env::var("BACKEND_PASSWORD"),
    ) {
        backend
            .sign_in(&email, &password)
            .await
            .context("sign-in failed")?;
    }

    // Notices are already logged when pushed.
    let (notices, mut notice_rx) = Notices::channel();
    tokio::spawn(async move { while notice_rx.recv().await.is_some() {} });

    let list = LiveList::new(backend.clone(), scope, notices);
    list.mount().await?;

    let items = match list.initialize(filter).await {
        Ok(items) => items,
        Err(e) => {
            list.unmount().await;
            return Err(e.into());
        }
    };
    if items.is_empty() {
        logs::print_empty(list.scope().kind);
    }
    for (i, item) in items.iter().enumerate() {
        logs::print_item(i + 1, item);
    }

    let summary = list.clone();
    let ticker = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(summary_secs.max(1)));
        interval.tick().await;
        loop {
            interval.tick().await;
            let visible = summary.visible().await.len();
            let total = summary.items().await.len();
            let phase = summary.phase().await;
            logs::log_view_summary(summary.scope().kind, visible, total, &phase.to_string());
        }
    });

    tokio::signal::ctrl_c().await?;

    ticker.abort();
    list.unmount().await;
    if backend.current_user().is_some() {
        backend.sign_out().await?;
    }

    Ok(())
}
