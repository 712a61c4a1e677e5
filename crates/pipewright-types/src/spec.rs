//! ProcessSpec — what to run, where, with which environment.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// The executable part of a command vector.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Program {
    /// Looked up in PATH by the OS.
    Name(String),
    /// Explicit path, from a `file://` URL or a string containing `/`.
    Path(PathBuf),
}

impl Program {
    /// Parse the first element of a command vector.
    ///
    /// `file:///usr/bin/env` becomes `Path("/usr/bin/env")`; anything with a
    /// slash is a path; bare words are names.
    pub fn parse(s: &str) -> Self {
        if let Some(rest) = s.strip_prefix("file://") {
            Program::Path(PathBuf::from(rest))
        } else if s.contains('/') {
            Program::Path(PathBuf::from(s))
        } else {
            Program::Name(s.to_string())
        }
    }

    /// Display form used in command vectors and error messages.
    pub fn display_name(&self) -> String {
        match self {
            Program::Name(n) => n.clone(),
            Program::Path(p) => p.display().to_string(),
        }
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display_name())
    }
}

/// Description of a process to spawn. Immutable once spawned.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ProcessSpec {
    /// Executable.
    pub program: Program,
    /// Arguments after the executable.
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory (inherits the host's if None).
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    /// Environment overrides layered on the host environment.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl ProcessSpec {
    /// Create a spec for `program` with no arguments.
    pub fn new(program: impl AsRef<str>) -> Self {
        Self {
            program: Program::parse(program.as_ref()),
            args: Vec::new(),
            cwd: None,
            env: BTreeMap::new(),
        }
    }

    /// Build a spec from a full command vector.
    ///
    /// Returns None for an empty vector.
    pub fn from_argv<I, S>(argv: I) -> Option<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut iter = argv.into_iter();
        let first = iter.next()?;
        Some(Self::new(first).args(iter))
    }

    /// Append one argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.args.extend(args.into_iter().map(|s| s.as_ref().to_string()));
        self
    }

    /// Set the working directory.
    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Set one environment override.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// The full command vector, program first.
    pub fn argv(&self) -> Vec<String> {
        let mut argv = Vec::with_capacity(self.args.len() + 1);
        argv.push(self.program.display_name());
        argv.extend(self.args.iter().cloned());
        argv
    }
}

impl fmt::Display for ProcessSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.argv().join(" "))
    }
}
