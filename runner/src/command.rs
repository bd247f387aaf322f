//! Structured command lines built from `{variable}` templates.
//!
//! Benchmarks are configured as an executable template plus a list of argument templates.
//! Every template expands to exactly one argument, so nothing ever passes through a shell.

use crate::config::ConfigErrors;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt,
    path::{Path, PathBuf},
    process::Command,
};

/// variables every run provides, axis variables only if the axis is configured
pub const BUILTIN_VARIABLES: [&str; 12] = [
    "benchmark",
    "backend",
    "input",
    "cores",
    "cores_minus_one",
    "points",
    "record_size",
    "write_percent",
    "threads",
    "crash_at",
    "run",
    "pwd",
];

pub type Vars = BTreeMap<String, String>;

/// executable and argument templates, as found in the config
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct CommandTemplate {
    pub exec: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandTemplate {
    pub fn expand(&self, vars: &Vars) -> Result<CommandLine, ConfigErrors> {
        let mut command = CommandLine::new(expand(&self.exec, vars)?);

        for arg in self.args.iter() {
            command.push(expand(arg, vars)?);
        }

        Ok(command)
    }
}

/// List the variables referenced by a template
pub fn template_variables(template: &str) -> Result<Vec<&str>, ConfigErrors> {
    let mut variables = Vec::new();
    let mut rest = template;

    while let Some(start) = rest.find('{') {
        let after = &rest[start + 1..];
        let end = after
            .find('}')
            .ok_or_else(|| ConfigErrors::UnterminatedVariable(template.to_owned()))?;

        variables.push(&after[..end]);
        rest = &after[end + 1..];
    }

    Ok(variables)
}

/// Replace every `{name}` in `template` with its value from `vars`
pub fn expand(template: &str, vars: &Vars) -> Result<String, ConfigErrors> {
    let mut expanded = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find('{') {
        expanded.push_str(&rest[..start]);

        let after = &rest[start + 1..];
        let end = after
            .find('}')
            .ok_or_else(|| ConfigErrors::UnterminatedVariable(template.to_owned()))?;
        let name = &after[..end];

        match vars.get(name) {
            Some(value) => expanded.push_str(value),
            None => {
                return Err(ConfigErrors::UnknownVariable {
                    variable: name.to_owned(),
                    template: template.to_owned(),
                })
            }
        }

        rest = &after[end + 1..];
    }

    expanded.push_str(rest);

    Ok(expanded)
}

/// A fully expanded invocation: executable, arguments, extra environment and working directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub exec: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub workdir: Option<PathBuf>,
}

impl CommandLine {
    pub fn new(exec: impl Into<PathBuf>) -> Self {
        Self {
            exec: exec.into(),
            args: Vec::new(),
            env: Vec::new(),
            workdir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.push(arg);
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn push(&mut self, arg: impl Into<String>) {
        self.args.push(arg.into());
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.workdir = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn to_command(&self) -> Command {
        let mut command = Command::new(&self.exec);
        command
            .args(self.args.iter())
            .envs(self.env.iter().map(|(key, value)| (key, value)));

        if let Some(dir) = &self.workdir {
            command.current_dir(dir);
        }

        command
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.exec.display())?;

        for arg in self.args.iter() {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, " {arg:?}")?;
            } else {
                write!(f, " {arg}")?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars() -> Vars {
        [("benchmark", "kmeans"), ("backend", "nvthread"), ("points", "1000000")]
            .into_iter()
            .map(|(k, v)| (k.to_owned(), v.to_owned()))
            .collect()
    }

    #[test]
    fn expands_every_occurrence() {
        assert_eq!(
            expand("tests/{benchmark}/{benchmark}-{backend}.out", &vars()).unwrap(),
            "tests/kmeans/kmeans-nvthread.out"
        );
        assert_eq!(expand("plain", &vars()).unwrap(), "plain");
    }

    #[test]
    fn rejects_unknown_and_unterminated() {
        assert!(matches!(
            expand("{missing}", &vars()),
            Err(ConfigErrors::UnknownVariable { variable, .. }) if variable == "missing"
        ));
        assert!(matches!(
            expand("-p {points", &vars()),
            Err(ConfigErrors::UnterminatedVariable(_))
        ));
    }

    #[test]
    fn lists_variables() {
        assert_eq!(
            template_variables("{a}-x-{b}").unwrap(),
            vec!["a", "b"]
        );
        assert!(template_variables("none").unwrap().is_empty());
    }

    #[test]
    fn template_keeps_arguments_apart() {
        let template = CommandTemplate {
            exec: "./{benchmark}-{backend}.o".to_owned(),
            args: vec!["-p".to_owned(), "{points}".to_owned(), "a b".to_owned()],
        };
        let command = template.expand(&vars()).unwrap();

        assert_eq!(command.exec, PathBuf::from("./kmeans-nvthread.o"));
        assert_eq!(command.args, ["-p", "1000000", "a b"]);
        assert_eq!(command.to_string(), "./kmeans-nvthread.o -p 1000000 \"a b\"");
    }
}
