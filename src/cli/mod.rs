use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::Result;
use ansi_term::Style;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, level_filters::LevelFilter};

use crate::{
    bot::{
        format,
        transport::{ConsoleTransport, CONSOLE_CHAT, CONSOLE_USER},
        BotConfig, BotHandle, Dispatcher,
    },
    storage::{
        entities::UserId,
        ledger::{TimeLedger, TimeLedgerImpl},
    },
    utils::{
        clock::DefaultClock,
        dir::create_application_default_path,
        logging::{enable_logging, BOT_PREFIX, CLI_PREFIX},
    },
};

#[derive(Parser, Debug)]
#[command(name = "Worktally", version, long_about = None)]
#[command(about = "Conversational work time and earnings tracker", long_about = None)]
struct Args {
    #[command(subcommand)]
    commands: Commands,
    #[arg(long, help = "Enable logging")]
    log: bool,
}

#[derive(Subcommand, Debug)]
#[command(version, about, long_about = None)]
enum Commands {
    #[command(
        about = "Run the bot with a console conversation. Type messages directly, \
                 prefix forwarded timer messages with \"fwd \" and press buttons with \
                 \"press <callback>\""
    )]
    Serve {
        #[arg(
            long,
            help = "Application directory. By default tries to save into $XDG_STATE_HOME or $HOME/.local/state"
        )]
        dir: Option<PathBuf>,
        #[arg(long, help = "Debounce window for forwarded timer messages, milliseconds")]
        debounce_ms: Option<u64>,
    },
    #[command(about = "Show the latest time records of a user")]
    History {
        #[arg(
            long,
            help = "Application directory. By default tries to save into $XDG_STATE_HOME or $HOME/.local/state"
        )]
        dir: Option<PathBuf>,
        #[arg(long, default_value_t = CONSOLE_USER, help = "User to show")]
        user: UserId,
        #[arg(long, default_value_t = 10, help = "Maximum records shown")]
        limit: usize,
    },
    #[command(about = "Show goal progress of a user")]
    Progress {
        #[arg(
            long,
            help = "Application directory. By default tries to save into $XDG_STATE_HOME or $HOME/.local/state"
        )]
        dir: Option<PathBuf>,
        #[arg(long, default_value_t = CONSOLE_USER, help = "User to show")]
        user: UserId,
    },
}

pub async fn run_cli() -> Result<()> {
    let args = Args::parse();

    let logging_level = if args.log {
        Some(LevelFilter::TRACE)
    } else {
        None
    };

    match args.commands {
        Commands::Serve { dir, debounce_ms } => {
            let dir = resolve_dir(dir)?;
            enable_logging(BOT_PREFIX, &dir, logging_level, args.log)?;
            serve(dir, debounce_ms).await
        }
        Commands::History { dir, user, limit } => {
            let dir = resolve_dir(dir)?;
            enable_logging(CLI_PREFIX, &dir, logging_level, args.log)?;
            show_history(dir, user, limit).await
        }
        Commands::Progress { dir, user } => {
            let dir = resolve_dir(dir)?;
            enable_logging(CLI_PREFIX, &dir, logging_level, args.log)?;
            show_progress(dir, user).await
        }
    }
}

fn resolve_dir(dir: Option<PathBuf>) -> Result<PathBuf> {
    match dir {
        Some(v) => {
            std::fs::create_dir_all(&v)?;
            Ok(v)
        }
        None => create_application_default_path(),
    }
}

async fn serve(dir: PathBuf, debounce_ms: Option<u64>) -> Result<()> {
    let ledger = TimeLedgerImpl::new(&dir, Box::new(DefaultClock))?;

    let mut config = BotConfig::default();
    if let Some(ms) = debounce_ms {
        config.debounce_window = Duration::from_millis(ms);
    }

    let shutdown = CancellationToken::new();
    let (handle, mut dispatcher) = Dispatcher::new(
        ledger,
        Arc::new(ConsoleTransport::new()),
        Arc::new(DefaultClock),
        config,
        shutdown.clone(),
    );
    dispatcher.restore_notifications(|_| CONSOLE_CHAT).await?;

    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal_shutdown.cancel();
        }
    });

    println!(
        "{}",
        Style::new()
            .bold()
            .paint("Worktally console. Start with /start, stop with Ctrl-C.")
    );

    let input = tokio::spawn(console_input(handle, shutdown));
    dispatcher.run().await?;
    input.abort();
    Ok(())
}

/// Feeds terminal lines into the bot until shutdown or end of input.
async fn console_input(handle: BotHandle, shutdown: CancellationToken) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => break,
            line = lines.next_line() => line,
        };
        let Ok(Some(line)) = line else {
            shutdown.cancel();
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let result = if let Some(callback) = line.strip_prefix("press ") {
            handle
                .on_button_press(CONSOLE_USER, CONSOLE_CHAT, callback.trim())
                .await
        } else if let Some(text) = line.strip_prefix("fwd ") {
            handle
                .on_incoming_text(CONSOLE_USER, CONSOLE_CHAT, text, true)
                .await
        } else {
            handle
                .on_incoming_text(CONSOLE_USER, CONSOLE_CHAT, line, false)
                .await
        };
        if result.is_err() {
            debug!("The event loop is gone, stopping console input");
            break;
        }
    }
}

async fn show_history(dir: PathBuf, user: UserId, limit: usize) -> Result<()> {
    let ledger = TimeLedgerImpl::new(&dir, Box::new(DefaultClock))?;
    let records = ledger.history(user, limit).await?;

    if records.is_empty() {
        println!("История пуста.");
        return Ok(());
    }
    println!("{}", Style::new().bold().paint("📋 История:"));
    for record in records {
        println!("{}", format::history_line(&record));
    }
    Ok(())
}

async fn show_progress(dir: PathBuf, user: UserId) -> Result<()> {
    let ledger = TimeLedgerImpl::new(&dir, Box::new(DefaultClock))?;

    match ledger.progress(user).await? {
        Some(progress) => println!("{}", format::progress_message(&progress)),
        None => println!("Пользователь не настроен. Запустите serve и отправьте /start."),
    }
    Ok(())
}
