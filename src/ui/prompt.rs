use crate::error::{KeyFinderError, Result};
use console::{Key, Term};
use std::collections::VecDeque;
use std::io::{self, BufRead};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountdownOutcome {
    Elapsed,
    Interrupted,
}

/// Everything the tool asks the user.
pub trait Prompter: Send + Sync {
    /// One line of input, without the trailing newline.
    fn ask(&self, question: &str) -> Result<String>;

    /// Counts down `seconds`; any key ends it early.
    fn countdown(&self, seconds: u64, label: &str) -> Result<CountdownOutcome>;

    /// Waits for the user to acknowledge.
    fn pause(&self, message: &str) -> Result<()>;

    fn invalid_choice(&self, _message: &str) {}

    /// Single-letter menu choice, case-insensitive. Asks again until valid.
    fn choose(&self, question: &str, choices: &[char]) -> Result<char> {
        loop {
            let answer = self.ask(question)?;
            let answer = answer.trim();
            let mut chars = answer.chars();
            if let (Some(c), None) = (chars.next(), chars.next()) {
                let c = c.to_ascii_uppercase();
                if choices.contains(&c) {
                    return Ok(c);
                }
            }
            let options: Vec<String> = choices.iter().map(char::to_string).collect();
            self.invalid_choice(&format!("Invalid choice. Please enter {}.", options.join(", ")));
        }
    }

    /// Like `choose`, but an empty answer takes `default`.
    fn choose_or(&self, question: &str, choices: &[char], default: char) -> Result<char> {
        loop {
            let answer = self.ask(question)?;
            let answer = answer.trim();
            if answer.is_empty() {
                return Ok(default);
            }
            let mut chars = answer.chars();
            if let (Some(c), None) = (chars.next(), chars.next()) {
                let c = c.to_ascii_uppercase();
                if choices.contains(&c) {
                    return Ok(c);
                }
            }
            self.invalid_choice("Invalid choice.");
        }
    }

    /// Yes/no question; an empty answer takes `default`.
    fn confirm(&self, question: &str, default: bool) -> Result<bool> {
        loop {
            match self.ask(question)?.trim().to_uppercase().as_str() {
                "" => return Ok(default),
                "Y" | "YES" => return Ok(true),
                "N" | "NO" => return Ok(false),
                _ => self.invalid_choice("Please answer Y or N."),
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Background thread blocked on `read_key`. It reads one key per request,
/// so a countdown that elapses leaves it armed and the next prompt picks up
/// whatever key the user presses.
struct KeyListener {
    requests: Sender<()>,
    keys: Receiver<Key>,
    armed: bool,
}

impl KeyListener {
    fn spawn() -> Option<Self> {
        let (request_tx, request_rx) = mpsc::channel::<()>();
        let (key_tx, key_rx) = mpsc::channel::<Key>();

        let spawned = thread::Builder::new()
            .name("key-listener".to_string())
            .spawn(move || {
                let term = Term::stdout();
                while request_rx.recv().is_ok() {
                    match term.read_key() {
                        Ok(key) => {
                            if key_tx.send(key).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::debug!(error = %e, "key listener stopped");
                            break;
                        }
                    }
                }
            });

        match spawned {
            Ok(_) => Some(Self {
                requests: request_tx,
                keys: key_rx,
                armed: false,
            }),
            Err(e) => {
                tracing::warn!(error = %e, "could not start key listener");
                None
            }
        }
    }

    fn arm(&mut self) -> bool {
        if !self.armed {
            self.armed = self.requests.send(()).is_ok();
        }
        self.armed
    }
}

enum Pending {
    Key(Key),
    Nothing,
    Dead,
}

pub struct TerminalPrompter {
    term: Term,
    interactive: bool,
    listener: Mutex<Option<KeyListener>>,
}

impl TerminalPrompter {
    pub fn new() -> Self {
        let term = Term::stdout();
        let interactive = term.is_term();
        Self {
            term,
            interactive,
            listener: Mutex::new(None),
        }
    }

    fn write(&self, text: &str) {
        if let Err(e) = self.term.write_str(text) {
            tracing::debug!(error = %e, "terminal write failed");
        }
    }

    /// Takes the key an earlier countdown left pending, blocking for it.
    fn take_pending_key(&self) -> Pending {
        let mut guard = lock(&self.listener);
        let Some(listener) = guard.as_mut() else {
            return Pending::Nothing;
        };
        if !listener.armed {
            return Pending::Nothing;
        }
        listener.armed = false;
        match listener.keys.recv() {
            Ok(key) => Pending::Key(key),
            Err(_) => {
                *guard = None;
                Pending::Dead
            }
        }
    }

    fn read_line(&self) -> Result<String> {
        let mut line = String::new();
        let read = io::stdin().lock().read_line(&mut line)?;
        if read == 0 {
            return Err(KeyFinderError::Input {
                message: "input closed".to_string(),
            });
        }
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }
}

impl Default for TerminalPrompter {
    fn default() -> Self {
        Self::new()
    }
}

impl Prompter for TerminalPrompter {
    fn ask(&self, question: &str) -> Result<String> {
        self.write(question);
        match self.take_pending_key() {
            Pending::Key(Key::Enter) => {
                self.write("\n");
                Ok(String::new())
            }
            Pending::Key(Key::Char(c)) => {
                self.write(&c.to_string());
                Ok(format!("{}{}", c, self.read_line()?))
            }
            Pending::Key(_) | Pending::Nothing | Pending::Dead => self.read_line(),
        }
    }

    fn countdown(&self, seconds: u64, label: &str) -> Result<CountdownOutcome> {
        if !self.interactive {
            thread::sleep(Duration::from_secs(seconds));
            return Ok(CountdownOutcome::Elapsed);
        }

        let mut guard = lock(&self.listener);
        if guard.is_none() {
            *guard = KeyListener::spawn();
        }

        for remaining in (1..=seconds).rev() {
            self.write(&format!("\r{} {}s... (press any key) ", label, remaining));

            let armed = guard.as_mut().is_some_and(|l| l.arm());
            let Some(listener) = guard.as_mut().filter(|_| armed) else {
                thread::sleep(Duration::from_secs(1));
                continue;
            };
            match listener.keys.recv_timeout(Duration::from_secs(1)) {
                Ok(_) => {
                    listener.armed = false;
                    self.write("\n");
                    return Ok(CountdownOutcome::Interrupted);
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => *guard = None,
            }
        }

        self.write("\n");
        Ok(CountdownOutcome::Elapsed)
    }

    fn pause(&self, message: &str) -> Result<()> {
        self.write(message);
        match self.take_pending_key() {
            Pending::Key(_) => {
                self.write("\n");
                Ok(())
            }
            Pending::Nothing | Pending::Dead => match self.read_line() {
                Ok(_) => Ok(()),
                Err(KeyFinderError::Input { .. }) => Ok(()),
                Err(e) => Err(e),
            },
        }
    }

    fn invalid_choice(&self, message: &str) {
        self.write(&format!("{}\n", message));
    }
}

#[derive(Default)]
struct Script {
    answers: VecDeque<String>,
    countdowns: VecDeque<CountdownOutcome>,
    questions: Vec<String>,
    countdown_labels: Vec<String>,
    pauses: Vec<String>,
    invalid: usize,
}

/// Prompter fed from a fixed list of answers. Countdowns elapse unless an
/// outcome was queued. Running out of answers is an input error.
#[derive(Default)]
pub struct ScriptedPrompter {
    script: Mutex<Script>,
}

impl ScriptedPrompter {
    pub fn new<I, S>(answers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            script: Mutex::new(Script {
                answers: answers.into_iter().map(Into::into).collect(),
                ..Script::default()
            }),
        }
    }

    pub fn with_countdowns<I: IntoIterator<Item = CountdownOutcome>>(self, outcomes: I) -> Self {
        lock(&self.script).countdowns.extend(outcomes);
        self
    }

    pub fn questions(&self) -> Vec<String> {
        lock(&self.script).questions.clone()
    }

    pub fn countdowns(&self) -> Vec<String> {
        lock(&self.script).countdown_labels.clone()
    }

    pub fn pauses(&self) -> Vec<String> {
        lock(&self.script).pauses.clone()
    }

    pub fn invalid_choices(&self) -> usize {
        lock(&self.script).invalid
    }

    pub fn remaining_answers(&self) -> usize {
        lock(&self.script).answers.len()
    }
}

impl Prompter for ScriptedPrompter {
    fn ask(&self, question: &str) -> Result<String> {
        let mut script = lock(&self.script);
        script.questions.push(question.to_string());
        script.answers.pop_front().ok_or_else(|| KeyFinderError::Input {
            message: format!("no scripted answer for: {}", question.trim()),
        })
    }

    fn countdown(&self, _seconds: u64, label: &str) -> Result<CountdownOutcome> {
        let mut script = lock(&self.script);
        script.countdown_labels.push(label.to_string());
        Ok(script.countdowns.pop_front().unwrap_or(CountdownOutcome::Elapsed))
    }

    fn pause(&self, message: &str) -> Result<()> {
        lock(&self.script).pauses.push(message.to_string());
        Ok(())
    }

    fn invalid_choice(&self, _message: &str) {
        lock(&self.script).invalid += 1;
    }
}
