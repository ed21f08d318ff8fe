//! Operator-side reverse shell controller, powered by cURL.

mod cli;
mod terminal;

use std::path::Path;

use crossterm::style::Stylize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use server_core::{Broker, Server, ServerConfig, ServerError};

use crate::{cli::Config, terminal::Terminal};

/// Channel capacity for operator input and output lines.
const CHANNEL_BUFFER: usize = 1024;

fn main() {
    std::process::exit(run());
}

#[tokio::main]
async fn run() -> i32 {
    let cfg = Config::parse();

    // Life's easy when all we do is print the template.
    if cfg.print_default_template {
        print!("{}", server_core::DEFAULT_TEMPLATE);
        return 0;
    }

    init_logging(cfg.log.as_deref());

    // Channels for comms between subsystems.
    let (input_tx, input_rx) = mpsc::channel(CHANNEL_BUFFER);
    let (output_tx, output_rx) = mpsc::channel(CHANNEL_BUFFER);

    let broker = match Broker::new(input_rx, output_tx.clone()) {
        Ok(broker) => broker,
        Err(err) => {
            eprintln!("{}", format!("Error setting up broker: {err}").red());
            return 3;
        }
    };

    let server = match Server::new(
        ServerConfig {
            addr: cfg.listen_address.clone(),
            static_dir: cfg.serve_files_from.clone(),
            template_file: cfg.callback_template.clone(),
            cert_file: cfg.tls_certificate_cache.clone(),
            callback_addrs: cfg.callback_addresses.clone(),
            ipv6_help: cfg.ipv6_one_liners,
            one_shell: cfg.one_shell,
        },
        broker.clone(),
        output_tx.clone(),
    )
    .await
    {
        Ok(server) => server,
        Err(err) => {
            eprintln!(
                "{}",
                format!("Error setting up HTTPS service: {err}").red(),
            );
            return 2;
        }
    };

    let terminal = Terminal::new(
        input_tx,
        output_rx,
        cfg.prompt.clone(),
        cfg.no_timestamps,
        cfg.insert_from.clone(),
    );

    // Start ALL the things.
    let root = CancellationToken::new();
    tokio::spawn({
        let root = root.clone();
        async move {
            let _ = tokio::signal::ctrl_c().await;
            root.cancel();
        }
    });

    let mut broker_task = tokio::spawn({
        let broker = broker.clone();
        let ctx = root.clone();
        async move { broker.run(ctx).await }
    });
    let mut server_task = tokio::spawn({
        let ctx = root.clone();
        async move { server.run(ctx).await }
    });
    let mut terminal_task = tokio::spawn({
        let ctx = root.clone();
        async move { terminal.run(ctx).await }
    });

    // Wait for something to finish, then bring the rest down.
    enum First {
        Terminal,
        Server,
        Broker,
    }
    let mut code = 0;
    let first = tokio::select! {
        res = &mut terminal_task => {
            match res {
                Ok(Ok(())) => println!("{}", "Goodbye.".green()),
                Ok(Err(err)) => {
                    eprintln!("{}", format!("Fatal error: {err}").red());
                    code = 1;
                }
                Err(err) => {
                    eprintln!("{}", format!("Fatal error: {err}").red());
                    code = 1;
                }
            }
            First::Terminal
        }
        res = &mut server_task => {
            match res {
                Ok(res) => code = result_code(res),
                Err(err) => {
                    eprintln!("{}", format!("Fatal error: {err}").red());
                    code = 1;
                }
            }
            First::Server
        }
        res = &mut broker_task => {
            match res {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    eprintln!("{}", format!("Fatal error: {err}").red());
                    code = 1;
                }
                Err(err) => {
                    eprintln!("{}", format!("Fatal error: {err}").red());
                    code = 1;
                }
            }
            First::Broker
        }
    };

    root.cancel();
    if !matches!(first, First::Broker) {
        let _ = broker_task.await;
    }
    if !matches!(first, First::Server) {
        if let Ok(res) = server_task.await {
            if code == 0 {
                code = result_code(res);
            }
        }
    }
    if !matches!(first, First::Terminal) {
        let _ = terminal_task.await;
    }

    code
}

/// One-shell closure is a normal exit; anything else is fatal.
fn result_code(res: Result<(), ServerError>) -> i32 {
    match res {
        Ok(()) => 0,
        Err(ServerError::OneShellClosed) => 0,
        Err(err) => {
            eprintln!("{}", format!("Fatal error: {err}").red());
            1
        }
    }
}

/// Log structured JSON records to `path`, if one was configured.
fn init_logging(path: Option<&Path>) {
    let Some(path) = path else { return };
    let file = match std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
    {
        Ok(file) => file,
        Err(err) => {
            eprintln!("Could not open log file {}: {err}", path.display());
            return;
        }
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .json()
        .with_env_filter(env_filter)
        .with_writer(std::sync::Mutex::new(file))
        .try_init();
}
