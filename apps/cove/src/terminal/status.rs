//! User-facing status output: one colored line per phase, a cursor spinner
//! for the long waits, and the ready banner. Diagnostics go through tracing;
//! these lines are the product surface.

use crossterm::style::Stylize;
use std::io::{self, IsTerminal, Write};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::manifest::Forward;

const SPINNER_FRAMES: [&str; 4] = ["-", "\\", "|", "/"];
const SPINNER_INTERVAL: Duration = Duration::from_millis(120);

pub fn success(message: &str) {
    println!(" {}  {message}", "✓".green());
}

pub fn warning(message: &str) {
    println!("{}", message.yellow());
}

pub fn failure(message: &str) {
    eprintln!(" {}  {message}", "✗".red());
}

/// The ready banner: namespace, name and every forward pair.
pub fn display_context(namespace: &str, name: &str, forwards: &[Forward]) {
    success("Your development environment is ready");
    println!("    {} {namespace}", "Namespace:".blue());
    println!("    {}      {name}", "Name:".blue());
    if let Some(first) = forwards.first() {
        println!("    {}   {first}", "Forward:".blue());
        for forward in &forwards[1..] {
            println!("               {forward}");
        }
    }
    println!();
}

/// Blocking y/n prompt. Fails closed when stdin is not interactive so
/// automation never mutates the cluster by accident.
pub fn confirm(prompt: &str) -> io::Result<bool> {
    if !io::stdin().is_terminal() {
        return Ok(false);
    }
    dialoguer::Confirm::new()
        .with_prompt(prompt)
        .default(false)
        .interact()
        .map_err(|err| io::Error::new(io::ErrorKind::Other, err.to_string()))
}

/// Cursor spinner shown while a phase is in flight. Draws nothing when
/// stdout is not a terminal.
pub struct Spinner {
    stop: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl Spinner {
    pub fn start(message: &str) -> Self {
        let (stop, mut stopped) = watch::channel(false);
        let task = if io::stdout().is_terminal() {
            let message = message.to_string();
            Some(tokio::spawn(async move {
                let mut frame = 0usize;
                loop {
                    print!("\r {} {message}", SPINNER_FRAMES[frame % SPINNER_FRAMES.len()]);
                    let _ = io::stdout().flush();
                    frame += 1;
                    tokio::select! {
                        _ = sleep(SPINNER_INTERVAL) => {}
                        _ = stopped.changed() => break,
                    }
                }
                // Clear the spinner line before the next status line lands.
                print!("\r\x1b[2K");
                let _ = io::stdout().flush();
            }))
        } else {
            None
        };
        Self {
            stop,
            task,
        }
    }

    pub async fn stop(mut self) {
        let _ = self.stop.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}
