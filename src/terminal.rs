//! Thin operator terminal over channels.
//!
//! Lines typed on stdin go to the input channel; [`OutLine`]s from the
//! output channel are printed with color and a timestamp, except `plain`
//! lines which are written raw. This is a log-style line terminal, not a
//! full-screen UI.

use std::{
    io::{BufRead, Write},
    path::PathBuf,
};

use anyhow::{bail, Result};
use crossterm::style::Stylize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crs_types::{Color, OutLine};

/// Command which sends the insertion-source file to the shell.
const INSERT_COMMAND: &str = ":insert";

/// The operator's terminal.
pub struct Terminal {
    input_tx: mpsc::Sender<String>,
    output_rx: mpsc::Receiver<OutLine>,
    prompt: String,
    no_timestamps: bool,
    insert_from: Option<PathBuf>,
}

impl Terminal {
    pub fn new(
        input_tx: mpsc::Sender<String>,
        output_rx: mpsc::Receiver<OutLine>,
        prompt: String,
        no_timestamps: bool,
        insert_from: Option<PathBuf>,
    ) -> Self {
        Self {
            input_tx,
            output_rx,
            prompt,
            no_timestamps,
            insert_from,
        }
    }

    /// Proxies between stdio and the channels until stdin closes or `ctx` is
    /// cancelled. Returns `Ok` on an orderly operator EOF.
    pub async fn run(mut self, ctx: CancellationToken) -> Result<()> {
        let mut lines = spawn_stdin_reader();
        self.show_prompt()?;

        loop {
            tokio::select! {
                _ = ctx.cancelled() => return Ok(()),

                line = lines.recv() => {
                    // stdin is gone; time to say goodbye.
                    let Some(line) = line else { return Ok(()) };
                    if line == INSERT_COMMAND && self.insert_from.is_some() {
                        self.send_insertion().await?;
                        continue;
                    }
                    if self.input_tx.send(line).await.is_err() {
                        return Ok(());
                    }
                }

                out = self.output_rx.recv() => {
                    let Some(out) = out else { bail!("output channel closed") };
                    self.write_line(out)?;
                }
            }
        }
    }

    /// Sends the insertion-source file's contents to the shell as one blob.
    async fn send_insertion(&mut self) -> Result<()> {
        let path = match &self.insert_from {
            Some(p) => p.clone(),
            None => return Ok(()),
        };
        match tokio::fs::read_to_string(&path).await {
            Ok(blob) => {
                let blob = blob.strip_suffix('\n').unwrap_or(&blob).to_string();
                let _ = self.input_tx.send(blob).await;
            }
            Err(err) => {
                self.write_line(OutLine::line(
                    Color::Red,
                    format!("Could not read {}: {err}", path.display()),
                ))?;
            }
        }
        Ok(())
    }

    fn show_prompt(&self) -> Result<()> {
        let mut stdout = std::io::stdout().lock();
        write!(stdout, "{}", self.prompt.clone().cyan())?;
        stdout.flush()?;
        Ok(())
    }

    /// Renders one line: raw if plain, otherwise timestamp + color.
    fn write_line(&mut self, out: OutLine) -> Result<()> {
        if let Some(prompt) = out.prompt {
            self.prompt = prompt;
        }

        let mut stdout = std::io::stdout().lock();
        if out.plain {
            stdout.write_all(out.line.as_bytes())?;
            stdout.flush()?;
            return Ok(());
        }

        let ts = if self.no_timestamps || out.no_timestamp {
            String::new()
        } else {
            chrono::Local::now().format("%H:%M:%S%.3f ").to_string()
        };
        let line = match out.color {
            Color::None => out.line,
            Color::Red => out.line.red().to_string(),
            Color::Green => out.line.green().to_string(),
            Color::Cyan => out.line.cyan().to_string(),
            Color::Blue => out.line.blue().to_string(),
        };
        writeln!(stdout, "{ts}{line}")?;
        stdout.flush()?;
        Ok(())
    }
}

/// Reads stdin lines on a blocking thread, closing the channel on EOF.
fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(line) => {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });
    rx
}
