use anyhow::Result;
use crossterm::{
    execute,
    style::{Color, Print, ResetColor, SetForegroundColor},
};
use serde::Serialize;
use std::io::{self, Write};

/// Color scheme for diagnostics.
struct Colors;

impl Colors {
    const WARNING: Color = Color::Yellow;
    const ERROR: Color = Color::Red;
    const DIM: Color = Color::DarkGrey;
}

/// Results go to stdout as JSON; everything else goes to stderr.
pub struct Terminal;

impl Terminal {
    pub fn new() -> Self {
        Self
    }

    /// Print a value as pretty JSON on stdout.
    pub fn print_json<T: Serialize + ?Sized>(&self, value: &T) -> Result<()> {
        let mut stdout = io::stdout().lock();
        serde_json::to_writer_pretty(&mut stdout, value)?;
        writeln!(stdout)?;
        stdout.flush()?;
        Ok(())
    }

    /// Print a warning message.
    pub fn print_warning(&self, msg: &str) -> Result<()> {
        self.print_colored(Colors::WARNING, &format!("Warning: {msg}\n"))
    }

    /// Print an error message.
    pub fn print_error(&self, msg: &str) -> Result<()> {
        self.print_colored(Colors::ERROR, &format!("Error: {msg}\n"))
    }

    /// Print an info message.
    pub fn print_info(&self, msg: &str) -> Result<()> {
        self.print_colored(Colors::DIM, &format!("{msg}\n"))
    }

    fn print_colored(&self, color: Color, text: &str) -> Result<()> {
        let mut stderr = io::stderr();
        execute!(stderr, SetForegroundColor(color), Print(text), ResetColor)?;
        stderr.flush()?;
        Ok(())
    }
}
