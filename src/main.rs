use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use chatwatch::channels::TelegramBot;
use chatwatch::config::{AppConfig, load_rules};
use chatwatch::llm::create_analyzer;
use chatwatch::pipeline::dispatcher::{Dispatcher, DispatcherConfig, spawn_source_pump};
use chatwatch::pipeline::scheduler::{SchedulerBridge, spawn_ticker};
use chatwatch::pipeline::traits::Source;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    let config = AppConfig::from_env().context("Failed to load configuration")?;

    // Keep the guard alive so buffered file logs are flushed on exit.
    let _log_guard = init_tracing(&config);

    eprintln!("🛰️  chatwatch v{}", env!("CARGO_PKG_VERSION"));
    eprintln!(
        "   Model: {}/{}",
        config.llm.backend.name(),
        config.llm.model
    );

    // ── Collaborators ───────────────────────────────────────────────────
    let bot = Arc::new(TelegramBot::new(
        config.telegram_token.clone(),
        config.history_buffer,
    ));
    let analyzer = create_analyzer(&config.llm).context("Failed to create LLM analyzer")?;

    let operator = bot
        .get_entity(&config.operator_chat)
        .await
        .with_context(|| format!("Failed to resolve operator chat {}", config.operator_chat))?;
    eprintln!("   Operator chat: {} ({})", operator.title, operator.id);

    // ── Pipeline ────────────────────────────────────────────────────────
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    let scheduler = SchedulerBridge::new(tx.clone(), config.poll_interval);
    let dispatcher = Arc::new(Dispatcher::new(
        bot.clone(),
        bot.clone(),
        analyzer,
        Arc::clone(&scheduler),
        DispatcherConfig {
            operator_chat: operator.id,
            alerts: config.alerts,
            history: config.history,
        },
    ));

    if let Some(ref path) = config.rules_file {
        let specs = load_rules(path)
            .with_context(|| format!("Failed to load rules from {}", path.display()))?;
        let total = specs.len();
        let mut installed = 0;
        for spec in specs {
            let source = spec.source().to_string();
            match dispatcher.install(spec).await {
                Ok(_) => installed += 1,
                Err(e) => {
                    tracing::warn!(source = %source, error = %e, "Skipping rule");
                    eprintln!("   Warning: rule for {} not installed: {}", source, e);
                }
            }
        }
        eprintln!("   Rules: {}/{} installed from {}", installed, total, path.display());
    } else {
        eprintln!("   Rules: none (set CHATWATCH_RULES_FILE)");
    }

    let _ticker = spawn_ticker(scheduler);
    let _pump = spawn_source_pump(bot, tx);

    eprintln!(
        "   Scheduler: polling every {}s",
        config.poll_interval.as_secs()
    );
    if let Some(ref dir) = config.log_dir {
        eprintln!("   Logs: {}", dir.display());
    }
    eprintln!("   Press Ctrl+C to stop.\n");

    dispatcher.run(rx).await;
    Ok(())
}

/// stderr logging, plus a daily-rolling file when a log dir is configured.
fn init_tracing(config: &AppConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    let (file_layer, guard) = match config.log_dir {
        Some(ref dir) => {
            let appender = tracing_appender::rolling::daily(dir, "chatwatch.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();

    guard
}
