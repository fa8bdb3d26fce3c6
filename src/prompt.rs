use std::io::{self, BufRead, Write};
use std::time::Duration;

use crossterm::ExecutableCommand;
use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use crossterm::terminal::{
    EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode,
};
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;
use ratatui::layout::Alignment;
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Paragraph, Wrap};
use serde::Serialize;

use crate::domain::{AssemblyName, Stage};
use crate::error::SubmitError;

const LISTED_NAMES_MAX: usize = 8;

/// What the operator is asked to acknowledge before an irreversible stage.
#[derive(Debug, Clone, Serialize)]
pub struct ConfirmRequest {
    pub stage: Stage,
    pub assemblies: usize,
    /// Assemblies whose latest attempt of this stage already passed.
    pub already_passed: Vec<AssemblyName>,
    /// Assemblies lacking a passing validate/test_submit attempt.
    pub unverified: Vec<AssemblyName>,
}

/// The human at the terminal: source of the password and of confirmations.
pub trait Operator {
    fn read_secret(&self, prompt: &str) -> Result<String, SubmitError>;
    fn confirm(&self, request: &ConfirmRequest) -> Result<bool, SubmitError>;
}

pub struct TerminalOperator {
    password_stdin: bool,
}

impl TerminalOperator {
    /// With `password_stdin`, the password is one line read from standard
    /// input (for piping from a secret manager); otherwise it is typed at the
    /// terminal with echo off.
    pub fn new(password_stdin: bool) -> Self {
        Self { password_stdin }
    }
}

impl Operator for TerminalOperator {
    fn read_secret(&self, prompt: &str) -> Result<String, SubmitError> {
        if self.password_stdin {
            let mut line = String::new();
            io::stdin()
                .lock()
                .read_line(&mut line)
                .map_err(|err| SubmitError::Credential(format!("read password: {err}")))?;
            return Ok(line.trim_end_matches(['\r', '\n']).to_string());
        }

        let mut stderr = io::stderr();
        stderr
            .write_all(prompt.as_bytes())
            .and_then(|_| stderr.flush())
            .map_err(|err| SubmitError::Credential(err.to_string()))?;
        enable_raw_mode().map_err(|err| SubmitError::Credential(format!("terminal: {err}")))?;
        let result = {
            let _raw = TerminalGuard::new(|| {
                let _ = disable_raw_mode();
            });
            read_hidden_line()
        };
        let _ = writeln!(stderr);
        result
    }

    fn confirm(&self, request: &ConfirmRequest) -> Result<bool, SubmitError> {
        let to_fs = |err: io::Error| SubmitError::Filesystem(format!("terminal: {err}"));
        enable_raw_mode().map_err(to_fs)?;
        let _raw = TerminalGuard::new(|| {
            let _ = disable_raw_mode();
        });
        io::stderr().execute(EnterAlternateScreen).map_err(to_fs)?;
        let _screen = TerminalGuard::new(|| {
            let _ = io::stderr().execute(LeaveAlternateScreen);
        });
        let backend = CrosstermBackend::new(io::stderr());
        let mut terminal = Terminal::new(backend).map_err(to_fs)?;
        let lines = confirm_lines(request);

        loop {
            let drawn = terminal.draw(|frame| {
                let block = Block::default()
                    .borders(Borders::ALL)
                    .title("Confirm production submission");
                let text = Paragraph::new(lines.clone())
                    .alignment(Alignment::Center)
                    .wrap(Wrap { trim: true })
                    .block(block);
                frame.render_widget(text, frame.area());
            });
            if let Err(err) = drawn {
                break Err(to_fs(err));
            }

            match event::poll(Duration::from_millis(100)) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(err) => break Err(to_fs(err)),
            }
            match event::read() {
                Ok(Event::Key(key)) if key.kind == KeyEventKind::Press => match key.code {
                    KeyCode::Char('y') | KeyCode::Char('Y') => break Ok(true),
                    KeyCode::Char('n') | KeyCode::Char('N') | KeyCode::Esc => break Ok(false),
                    KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                        break Ok(false);
                    }
                    _ => {}
                },
                Ok(_) => {}
                Err(err) => break Err(to_fs(err)),
            }
        }
    }
}

/// Runs `restore` when dropped, so the terminal is put back on every exit
/// path, including errors and panics.
struct TerminalGuard<F: FnMut()> {
    restore: F,
}

impl<F: FnMut()> TerminalGuard<F> {
    fn new(restore: F) -> Self {
        Self { restore }
    }
}

impl<F: FnMut()> Drop for TerminalGuard<F> {
    fn drop(&mut self) {
        (self.restore)();
    }
}

fn read_hidden_line() -> Result<String, SubmitError> {
    let mut buffer = String::new();
    loop {
        let event = event::read().map_err(|err| SubmitError::Credential(err.to_string()))?;
        let Event::Key(key) = event else {
            continue;
        };
        if key.kind != KeyEventKind::Press {
            continue;
        }
        match key.code {
            KeyCode::Enter => return Ok(buffer),
            KeyCode::Esc => {
                return Err(SubmitError::Credential("password entry cancelled".to_string()));
            }
            KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                return Err(SubmitError::Credential("password entry cancelled".to_string()));
            }
            KeyCode::Backspace => {
                buffer.pop();
            }
            KeyCode::Char(ch) => buffer.push(ch),
            _ => {}
        }
    }
}

fn confirm_lines(request: &ConfirmRequest) -> Vec<Line<'static>> {
    let warn = Style::default().fg(Color::Yellow);
    let mut lines = vec![
        Line::from(Span::styled(
            format!(
                "Submit {} assemblies to the PRODUCTION archive?",
                request.assemblies
            ),
            Style::default().add_modifier(Modifier::BOLD),
        )),
        Line::from("Accessions created by this run are permanent and cannot be withdrawn."),
        Line::from(""),
    ];
    if !request.already_passed.is_empty() {
        lines.push(Line::from(Span::styled(
            format!(
                "{} already passed {} before and will be submitted AGAIN: {}",
                request.already_passed.len(),
                request.stage,
                list_names(&request.already_passed)
            ),
            Style::default().fg(Color::Red),
        )));
    }
    if !request.unverified.is_empty() {
        lines.push(Line::from(Span::styled(
            format!(
                "{} have no passing validate/test_submit attempt: {}",
                request.unverified.len(),
                list_names(&request.unverified)
            ),
            warn,
        )));
    }
    lines.push(Line::from(""));
    lines.push(Line::from("Press y to confirm, n to cancel."));
    lines
}

fn list_names(names: &[AssemblyName]) -> String {
    let mut shown: Vec<&str> = names
        .iter()
        .take(LISTED_NAMES_MAX)
        .map(AssemblyName::as_str)
        .collect();
    if names.len() > LISTED_NAMES_MAX {
        shown.push("…");
    }
    shown.join(", ")
}
