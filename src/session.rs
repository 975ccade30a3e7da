//! Interactive prompt loop
//!
//! Reads prompts line by line, generates a response for each and prints it.
//! Input, output and the interrupt signal are passed in so the loop runs the
//! same against a terminal or an in-memory buffer.
//!
//! Lines are read on a plain OS thread and handed over a channel. A blocked
//! read on that thread never holds up runtime shutdown, so an interrupted
//! session exits without waiting for one more line.

use crate::error::Result;
use std::future::Future;
use std::io::{self, BufRead, Write};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Lines of input produced by a reader thread; a closed channel is end of input
pub type LineReceiver = mpsc::Receiver<io::Result<String>>;

pub const BANNER: &str = "Policy LLM Interactive Mode (type 'quit' to exit)";
const EXIT_WORDS: &[&str] = &["quit", "exit", "q"];

/// What a line of input asks the session to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Exit,
    /// Blank line, re-prompt without generating
    Skip,
    Prompt(String),
}

/// Interpret one line of user input
pub fn classify(line: &str) -> Command {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        Command::Skip
    } else if EXIT_WORDS.iter().any(|word| trimmed.eq_ignore_ascii_case(word)) {
        Command::Exit
    } else {
        Command::Prompt(trimmed.to_string())
    }
}

/// Why the session stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    Quit,
    EndOfInput,
    Interrupted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSummary {
    pub end: SessionEnd,
    /// Prompts that produced a response
    pub responses: usize,
    pub failures: usize,
}

/// Read lines from `reader` on a dedicated thread
pub fn spawn_line_reader<R>(reader: R) -> LineReceiver
where
    R: BufRead + Send + 'static,
{
    let (tx, rx) = mpsc::channel(1);
    std::thread::spawn(move || forward_lines(reader.lines(), tx));
    rx
}

/// Read lines from the process's standard input on a dedicated thread
pub fn stdin_lines() -> LineReceiver {
    let (tx, rx) = mpsc::channel(1);
    std::thread::spawn(move || forward_lines(io::stdin().lock().lines(), tx));
    rx
}

fn forward_lines<L>(lines: L, tx: mpsc::Sender<io::Result<String>>)
where
    L: Iterator<Item = io::Result<String>>,
{
    for line in lines {
        let failed = line.is_err();
        if tx.blocking_send(line).is_err() {
            // Session already ended
            break;
        }
        if failed {
            break;
        }
    }
    debug!("Input reader finished");
}

/// Run the loop until an exit word, end of input or `interrupt` resolves.
///
/// `interrupt` is only raced against reading input; a generation in progress
/// runs to completion.
pub async fn run<W, G, I>(
    mut lines: LineReceiver,
    output: &mut W,
    mut generate: G,
    interrupt: I,
) -> io::Result<SessionSummary>
where
    W: Write,
    G: FnMut(&str) -> Result<String>,
    I: Future<Output = ()>,
{
    tokio::pin!(interrupt);

    writeln!(output, "{}", BANNER)?;
    writeln!(output, "{}", "-".repeat(50))?;

    let mut responses = 0;
    let mut failures = 0;

    let end = loop {
        write!(output, "\nEnter your prompt: ")?;
        output.flush()?;

        let line = tokio::select! {
            line = lines.recv() => line.transpose()?,
            _ = &mut interrupt => {
                writeln!(output)?;
                break SessionEnd::Interrupted;
            }
        };

        let Some(line) = line else {
            writeln!(output)?;
            break SessionEnd::EndOfInput;
        };

        match classify(&line) {
            Command::Exit => break SessionEnd::Quit,
            Command::Skip => continue,
            Command::Prompt(prompt) => {
                writeln!(output, "Generating response...")?;
                output.flush()?;
                match generate(&prompt) {
                    Ok(response) => {
                        responses += 1;
                        writeln!(output, "\nResponse:\n{}", response)?;
                    }
                    Err(e) => {
                        failures += 1;
                        warn!("Generation failed: {}", e);
                        writeln!(output, "Error: {}", e)?;
                    }
                }
            }
        }
    };

    debug!("Interactive session ended: {:?}", end);
    Ok(SessionSummary {
        end,
        responses,
        failures,
    })
}

/// Resolves when the operator presses Ctrl-C
pub async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Unable to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}
