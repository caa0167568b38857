//! Turns a script path and named parameters into job command vectors.
//!
//! Parameters listed as iterative must hold one value per job; every other
//! parameter is replicated into each job. One-character names become `-x`
//! options, longer names become `--name` options.

use serde_yaml::Value;

use crate::error::HoplaError;
use crate::job::JobCommand;

/// One parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum Param {
    /// `true` emits the bare option, `false` emits nothing.
    Flag(bool),
    Value(String),
    /// The option followed by every element.
    List(Vec<String>),
}

impl Param {
    pub fn value(value: impl ToString) -> Self {
        Self::Value(value.to_string())
    }

    pub fn list<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: ToString,
    {
        Self::List(values.into_iter().map(|v| v.to_string()).collect())
    }

    /// Converts a YAML value. Sequences of scalars become [`Param::List`].
    pub fn from_yaml(name: &str, value: &Value) -> Result<Self, HoplaError> {
        match value {
            Value::Bool(flag) => Ok(Self::Flag(*flag)),
            Value::Sequence(items) => items
                .iter()
                .map(|item| scalar_to_string(name, item))
                .collect::<Result<Vec<_>, _>>()
                .map(Self::List),
            other => scalar_to_string(name, other).map(Self::Value),
        }
    }

    fn push_onto(&self, option: &str, command: &mut Vec<String>) {
        match self {
            Self::Flag(true) => command.push(option.to_string()),
            Self::Flag(false) => {}
            Self::Value(value) => {
                command.push(option.to_string());
                command.push(value.clone());
            }
            Self::List(values) => {
                command.push(option.to_string());
                command.extend(values.iter().cloned());
            }
        }
    }
}

fn scalar_to_string(name: &str, value: &Value) -> Result<String, HoplaError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(HoplaError::config(format!(
            "parameter '{}' has an unsupported value {:?}",
            name, other
        ))),
    }
}

/// Command line option for a parameter name.
pub fn option_name(name: &str) -> String {
    if name.chars().count() > 1 {
        format!("--{}", name)
    } else {
        format!("-{}", name)
    }
}

/// Builds one command per iteration.
///
/// Iterative values are given as [`Param::List`], one scalar per job. Use
/// [`build_commands_nested`] to iterate over flags or lists.
pub fn build_commands(
    script: &str,
    kwargs: &[(String, Param)],
    iterative: &[String],
) -> Result<Vec<JobCommand>, HoplaError> {
    let mut expanded = Vec::with_capacity(kwargs.len());
    for (name, param) in kwargs {
        if iterative.contains(name) {
            match param {
                Param::List(values) => expanded.push((
                    name.as_str(),
                    Some(values.iter().map(|v| Param::Value(v.clone())).collect()),
                    param,
                )),
                _ => {
                    return Err(HoplaError::config(format!(
                        "all the iterative parameters must be lists: '{}' with value {:?} is not",
                        name, param
                    )))
                }
            }
        } else {
            expanded.push((name.as_str(), None, param));
        }
    }
    build_commands_nested(script, &expanded)
}

/// Same as [`build_commands`] but each iterative parameter carries its own
/// per-job [`Param`], which allows iterating over flags or lists.
pub fn build_commands_nested(
    script: &str,
    kwargs: &[(&str, Option<Vec<Param>>, &Param)],
) -> Result<Vec<JobCommand>, HoplaError> {
    let counts: Vec<usize> = kwargs
        .iter()
        .filter_map(|(_, values, _)| values.as_ref().map(Vec::len))
        .collect();
    let jobs = match counts.first() {
        Some(&first) => {
            if counts.iter().any(|&count| count != first) {
                return Err(HoplaError::config(
                    "all the iterative parameters must have the same number of values",
                ));
            }
            first
        }
        None => 1,
    };

    let mut commands = vec![vec![script.to_string()]; jobs];
    for (name, values, _) in kwargs {
        if let Some(values) = values {
            let option = option_name(name);
            for (command, value) in commands.iter_mut().zip(values) {
                value.push_onto(&option, command);
            }
        }
    }
    for (name, values, param) in kwargs {
        if values.is_none() {
            let option = option_name(name);
            for command in commands.iter_mut() {
                param.push_onto(&option, command);
            }
        }
    }
    commands.into_iter().map(JobCommand::new).collect()
}
