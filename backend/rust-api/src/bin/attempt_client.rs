use anyhow::Context;
use proctor_api::attempt::{
    AttemptMonitor, AttemptPhase, AttemptSurface, BroadcastStore, GatewayError,
    HttpSessionGateway, IntegritySignal, ItemView, LocalBroadcastHub, RedisBroadcast, TerminalView,
};
use proctor_api::config::Config;
use proctor_api::models::ParticipantRef;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

/// Exit status of an attempt that ended locked.
const LOCKED_EXIT: u8 = 3;

/// Prints the attempt to the terminal.
struct TerminalSurface;

impl AttemptSurface for TerminalSurface {
    fn show_item(&self, view: &ItemView) {
        println!();
        println!(
            "[{}/{}] {} ({}s)",
            view.index + 1,
            view.total,
            view.text,
            view.remaining_seconds
        );
        for (i, option) in view.options.iter().enumerate() {
            println!("  {}) {}", i + 1, option);
        }
    }

    fn show_terminal(&self, view: &TerminalView) {
        println!();
        println!("{}", view.message());
    }

    fn show_aborted(&self, reason: &str) {
        println!("Could not start the attempt: {}", reason);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "proctor_api=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut args = std::env::args().skip(1);
    let code = args.next().context("usage: attempt_client <access-code> <email>")?;
    let email = args.next().context("usage: attempt_client <access-code> <email>")?;

    let config = Config::load().context("Failed to load configuration")?;
    let settings = config.attempt.clone();

    let gateway = Arc::new(
        HttpSessionGateway::new(&settings.api_base_url, settings.request_timeout())
            .context("Invalid attempt.api_base_url")?,
    );

    let broadcast: Arc<dyn BroadcastStore> = match RedisBroadcast::connect(&config.redis_uri).await {
        Ok(redis) => Arc::new(redis),
        Err(e) => {
            tracing::warn!(
                "Redis unavailable ({}); duplicate sessions are only detected in-process",
                e
            );
            Arc::new(LocalBroadcastHub::new().handle())
        }
    };

    let monitor = AttemptMonitor::new(gateway, broadcast, Arc::new(TerminalSurface), settings);

    if let Err(e) = monitor.start(&code, &ParticipantRef::guest(email)).await {
        return Err(start_failure(e));
    }

    let event_loop = {
        let monitor = monitor.clone();
        tokio::spawn(async move { monitor.run().await })
    };

    println!("Answer with an option number. ':blur' and ':fullscreen-exit' simulate leaving the attempt.");

    let signals = monitor.signal_sender();
    let mut phases = monitor.watch_phase();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while !phases.borrow_and_update().is_terminal() {
        tokio::select! {
            changed = phases.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match line.trim() {
                    ":blur" => {
                        let _ = signals.send(IntegritySignal::VisibilityLost);
                    }
                    ":fullscreen-exit" => {
                        let _ = signals.send(IntegritySignal::FullscreenExited);
                    }
                    choice => {
                        if monitor.phase() != AttemptPhase::Active {
                            continue;
                        }
                        monitor.record_answer(choice_text(monitor.current_view(), choice));
                        monitor.advance().await;
                    }
                }
            }
        }
    }

    // Without stdin the item timers still run the attempt to its end
    monitor.finished().await;
    event_loop.abort();

    Ok(ExitCode::from(exit_status(monitor.terminal_view().as_ref())))
}

fn start_failure(error: GatewayError) -> anyhow::Error {
    if error.is_initialization() {
        anyhow::anyhow!("Attempt not started: {}", error)
    } else {
        anyhow::Error::new(error).context("Attempt start failed")
    }
}

fn exit_status(view: Option<&TerminalView>) -> u8 {
    match view {
        Some(TerminalView::Locked) => LOCKED_EXIT,
        _ => 0,
    }
}

/// Maps an option number to the option text; anything else is taken literally.
fn choice_text(view: Option<ItemView>, input: &str) -> String {
    let picked = input
        .parse::<usize>()
        .ok()
        .and_then(|n| n.checked_sub(1))
        .and_then(|i| view.and_then(|view| view.options.get(i).cloned()));
    picked.unwrap_or_else(|| input.to_string())
}
