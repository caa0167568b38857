//! Job commands, task records and result records.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use void::Void;

use crate::converter::{build_commands, Param};
use crate::error::HoplaError;
use crate::serde::string_or_sequence;

/// Exit code recorded for a job that finished properly.
pub const EXIT_SUCCESS: &str = "0";

/// An executable path followed by its arguments. Never empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct JobCommand(Vec<String>);

impl JobCommand {
    pub fn new<I, S>(words: I) -> Result<Self, HoplaError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let words: Vec<String> = words.into_iter().map(Into::into).collect();
        if words.is_empty() {
            return Err(HoplaError::config("a job command needs at least an executable"));
        }
        Ok(Self(words))
    }

    pub fn program(&self) -> &str {
        &self.0[0]
    }

    pub fn args(&self) -> &[String] {
        &self.0[1..]
    }

    pub fn words(&self) -> &[String] {
        &self.0
    }

    /// Renders the command as one line a POSIX shell splits back into the same words.
    pub fn to_shell_line(&self) -> String {
        self.0.iter().map(|word| shell_quote(word)).join(" ")
    }

    /// Inverse of [`JobCommand::to_shell_line`].
    pub fn parse_shell_line(line: &str) -> Result<Self, HoplaError> {
        Self::new(split_shell_words(line))
    }
}

impl fmt::Display for JobCommand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.to_shell_line())
    }
}

/// Quotes one word for a POSIX shell. Plain words are left untouched.
pub fn shell_quote(word: &str) -> String {
    let plain = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./=:,+@%".contains(c));
    if plain {
        word.to_string()
    } else if word.chars().any(char::is_control) {
        ansi_c_quote(word)
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

/// `$'...'` quoting, which keeps control characters on a single line.
fn ansi_c_quote(word: &str) -> String {
    let mut quoted = String::from("$'");
    for c in word.chars() {
        match c {
            '\n' => quoted.push_str(r"\n"),
            '\t' => quoted.push_str(r"\t"),
            '\r' => quoted.push_str(r"\r"),
            '\\' => quoted.push_str(r"\\"),
            '\'' => quoted.push_str(r"\'"),
            c if c.is_control() && (c as u32) < 0x80 => {
                quoted.push_str(&format!("\\x{:02x}", c as u32))
            }
            c if c.is_control() => quoted.push_str(&format!("\\u{:04x}", c as u32)),
            c => quoted.push(c),
        }
    }
    quoted.push('\'');
    quoted
}

/// Reads the body of a `$'...'` word, the opening quote already consumed.
fn read_ansi_c(chars: &mut std::iter::Peekable<std::str::Chars>, current: &mut String) {
    while let Some(c) = chars.next() {
        match c {
            '\'' => break,
            '\\' => match chars.next() {
                Some('n') => current.push('\n'),
                Some('t') => current.push('\t'),
                Some('r') => current.push('\r'),
                Some(kind @ ('x' | 'u')) => {
                    let width = if kind == 'x' { 2 } else { 4 };
                    let mut digits = String::new();
                    while digits.len() < width {
                        match chars.peek() {
                            Some(d) if d.is_ascii_hexdigit() => {
                                digits.push(*d);
                                chars.next();
                            }
                            _ => break,
                        }
                    }
                    match u32::from_str_radix(&digits, 16).ok().and_then(char::from_u32) {
                        Some(decoded) => current.push(decoded),
                        None => {
                            current.push('\\');
                            current.push(kind);
                            current.push_str(&digits);
                        }
                    }
                }
                Some(other) => current.push(other),
                None => current.push('\\'),
            },
            c => current.push(c),
        }
    }
}

/// Splits a line into words following shell quoting rules: single quotes,
/// double quotes, `$'...'` and backslash escapes. An unterminated quote runs
/// to the end of the line.
pub fn split_shell_words(line: &str) -> Vec<String> {
    let mut words = vec![];
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '$' if chars.peek() == Some(&'\'') => {
                in_word = true;
                chars.next();
                read_ansi_c(&mut chars, &mut current);
            }
            '\'' => {
                in_word = true;
                for c in chars.by_ref() {
                    if c == '\'' {
                        break;
                    }
                    current.push(c);
                }
            }
            '"' => {
                in_word = true;
                while let Some(c) = chars.next() {
                    match c {
                        '"' => break,
                        '\\' => match chars.next() {
                            Some(next @ ('"' | '\\' | '$' | '`')) => current.push(next),
                            Some(next) => {
                                current.push('\\');
                                current.push(next);
                            }
                            None => current.push('\\'),
                        },
                        c => current.push(c),
                    }
                }
            }
            '\\' => {
                in_word = true;
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                in_word = true;
                current.push(c);
            }
        }
    }
    if in_word {
        words.push(current);
    }
    words
}

/// Name of the `index`-th job of a run.
pub fn job_name(index: usize) -> String {
    format!("job_{}", index)
}

/// A job queued for local execution.
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub name: String,
    pub command: JobCommand,
}

impl Task {
    pub fn new(name: impl Into<String>, command: JobCommand) -> Self {
        Self {
            name: name.into(),
            command,
        }
    }
}

/// Numbers the commands of one run as `job_0`, `job_1`, ...
pub fn into_tasks(commands: Vec<JobCommand>) -> Vec<Task> {
    commands
        .into_iter()
        .enumerate()
        .map(|(index, command)| Task::new(job_name(index), command))
        .collect()
}

/// Outcome of one job. `info` always carries `cmd` and `exitcode`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub job_name: String,
    pub info: BTreeMap<String, Value>,
    pub debug: BTreeMap<String, Value>,
}

impl JobResult {
    pub fn new(job_name: impl Into<String>, command: &JobCommand) -> Self {
        let mut info = BTreeMap::new();
        info.insert(
            "cmd".to_string(),
            Value::from(command.words().to_vec()),
        );
        Self {
            job_name: job_name.into(),
            info,
            debug: BTreeMap::new(),
        }
    }

    pub fn set_success(&mut self) {
        self.info
            .insert("exitcode".to_string(), Value::from(EXIT_SUCCESS));
    }

    pub fn set_failure(&mut self, diagnostic: impl fmt::Display) {
        self.info.insert(
            "exitcode".to_string(),
            Value::from(format!("1 - '{}'", diagnostic)),
        );
    }

    /// The recorded exit code, or an empty string if none was recorded yet.
    pub fn exitcode(&self) -> &str {
        self.info
            .get("exitcode")
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    pub fn succeeded(&self) -> bool {
        self.exitcode() == EXIT_SUCCESS
    }
}

/// Description of a batch, as read from a YAML job file.
///
/// ```yaml
/// commands:
///   - ls -la /tmp
///   - [echo, "hello world"]
/// script: ./list.sh
/// iterative: [d]
/// kwargs:
///   d: [/tmp, /var]
///   verbose: true
/// ```
#[derive(Debug, Default, Deserialize)]
pub struct JobFile {
    #[serde(default)]
    commands: Vec<CommandSpec>,
    #[serde(default)]
    script: Option<String>,
    #[serde(default)]
    iterative: Vec<String>,
    #[serde(default)]
    kwargs: serde_yaml::Mapping,
}

#[derive(Debug, Deserialize)]
struct CommandSpec(#[serde(deserialize_with = "string_or_sequence")] CommandWords);

#[derive(Debug, Deserialize)]
#[serde(transparent)]
struct CommandWords(Vec<String>);

impl FromStr for CommandWords {
    type Err = Void;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(split_shell_words(s)))
    }
}

impl FromStr for JobFile {
    type Err = HoplaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(serde_yaml::from_str(s)?)
    }
}

impl JobFile {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, HoplaError> {
        let file = std::fs::File::open(path.as_ref())?;
        Ok(serde_yaml::from_reader(file)?)
    }

    /// Raw commands first, then the commands generated from `script` and `kwargs`.
    pub fn into_commands(self) -> Result<Vec<JobCommand>, HoplaError> {
        let mut commands = self
            .commands
            .into_iter()
            .map(|CommandSpec(CommandWords(words))| JobCommand::new(words))
            .collect::<Result<Vec<_>, _>>()?;
        match self.script {
            Some(script) => {
                let mut kwargs = Vec::with_capacity(self.kwargs.len());
                for (key, value) in self.kwargs.iter() {
                    let name = key.as_str().ok_or_else(|| {
                        HoplaError::config(format!("parameter name {:?} is not a string", key))
                    })?;
                    kwargs.push((name.to_string(), Param::from_yaml(name, value)?));
                }
                commands.extend(build_commands(&script, &kwargs, &self.iterative)?);
            }
            None if !self.kwargs.is_empty() || !self.iterative.is_empty() => {
                return Err(HoplaError::config(
                    "'kwargs' and 'iterative' require a 'script'",
                ));
            }
            None => {}
        }
        Ok(commands)
    }
}
