//! Typed command construction.
//!
//! Capture options that carry compound values (headers, proxy URLs, codec
//! lists) are rendered as a single `--option=value` token, so a value with
//! spaces or `=` can never be split into a stray positional argument.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::proxy::Egress;

/// One argument of a capture invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arg {
    /// A bare switch such as `--force`.
    Flag(String),
    /// An option and its value fused into `option=value`.
    Joined { option: String, value: String },
    /// A positional argument (URL, quality).
    Positional(String),
}

impl Arg {
    pub fn flag(name: impl Into<String>) -> Self {
        Self::Flag(name.into())
    }

    pub fn joined(option: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Joined {
            option: option.into(),
            value: value.into(),
        }
    }

    pub fn positional(value: impl Into<String>) -> Self {
        Self::Positional(value.into())
    }

    pub fn render(&self) -> String {
        match self {
            Self::Flag(name) => name.clone(),
            Self::Joined { option, value } => format!("{option}={value}"),
            Self::Positional(value) => value.clone(),
        }
    }
}

/// A fully rendered invocation: program and argv.
#[derive(Clone, PartialEq, Eq)]
pub struct CommandSpec {
    program: String,
    args: Vec<String>,
    /// Arguments starting with one of these prefixes are masked in logs.
    redact: Vec<String>,
}

impl CommandSpec {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            redact: Vec::new(),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// The command line with secrets masked, for logs.
    pub fn display_line(&self) -> String {
        let mut out = self.program.clone();
        for arg in &self.args {
            out.push(' ');
            match self.redact.iter().find(|prefix| arg.starts_with(prefix.as_str())) {
                Some(prefix) => {
                    out.push_str(prefix);
                    out.push_str("=***");
                }
                None => out.push_str(arg),
            }
        }
        out
    }
}

impl fmt::Debug for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandSpec")
            .field("command", &self.display_line())
            .finish()
    }
}

/// Option names of the capture tool. Defaults match streamlink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureToolOptions {
    #[serde(default = "default_output_option")]
    pub output_option: String,
    #[serde(default = "default_proxy_option")]
    pub proxy_option: String,
    #[serde(default = "default_auth_option")]
    pub auth_option: String,
    /// `{credential}` is replaced by the source credential.
    #[serde(default = "default_auth_template")]
    pub auth_template: String,
    #[serde(default = "default_codecs_option")]
    pub codecs_option: String,
    /// Fixed options appended to every invocation.
    #[serde(default = "default_fixed_args")]
    pub fixed_args: Vec<String>,
}

fn default_output_option() -> String {
    "--output".to_string()
}

fn default_proxy_option() -> String {
    "--http-proxy".to_string()
}

fn default_auth_option() -> String {
    "--twitch-api-header".to_string()
}

fn default_auth_template() -> String {
    "Authorization=OAuth {credential}".to_string()
}

fn default_codecs_option() -> String {
    "--twitch-supported-codecs".to_string()
}

fn default_fixed_args() -> Vec<String> {
    vec!["--force".to_string()]
}

impl Default for CaptureToolOptions {
    fn default() -> Self {
        Self {
            output_option: default_output_option(),
            proxy_option: default_proxy_option(),
            auth_option: default_auth_option(),
            auth_template: default_auth_template(),
            codecs_option: default_codecs_option(),
            fixed_args: default_fixed_args(),
        }
    }
}

/// Builds capture invocations. Every option with a value goes through
/// [`Arg::joined`].
#[derive(Debug, Clone)]
pub struct CaptureCommandBuilder<'a> {
    program: String,
    options: &'a CaptureToolOptions,
    url: String,
    quality: String,
    output: Option<PathBuf>,
    args: Vec<Arg>,
    redact: Vec<String>,
}

impl<'a> CaptureCommandBuilder<'a> {
    pub fn new(
        program: impl Into<String>,
        options: &'a CaptureToolOptions,
        url: impl Into<String>,
        quality: impl Into<String>,
    ) -> Self {
        Self {
            program: program.into(),
            options,
            url: url.into(),
            quality: quality.into(),
            output: None,
            args: Vec::new(),
            redact: Vec::new(),
        }
    }

    pub fn output(mut self, path: &Path) -> Self {
        self.output = Some(path.to_path_buf());
        self
    }

    pub fn egress(mut self, egress: &Egress) -> Self {
        if let Egress::Proxy { url, .. } = egress {
            self.args
                .push(Arg::joined(&self.options.proxy_option, url.as_str()));
        }
        self
    }

    pub fn credential(mut self, credential: Option<&str>) -> Self {
        if let Some(credential) = credential.filter(|c| !c.is_empty()) {
            let value = self
                .options
                .auth_template
                .replace("{credential}", credential);
            self.args.push(Arg::joined(&self.options.auth_option, value));
            self.redact.push(self.options.auth_option.clone());
        }
        self
    }

    pub fn codecs(mut self, codecs: &[String]) -> Self {
        if !codecs.is_empty() {
            self.args
                .push(Arg::joined(&self.options.codecs_option, codecs.join(",")));
        }
        self
    }

    pub fn build(self) -> CommandSpec {
        let mut argv = vec![Arg::positional(self.url), Arg::positional(self.quality)];
        if let Some(output) = self.output {
            argv.push(Arg::joined(
                &self.options.output_option,
                output.to_string_lossy(),
            ));
        }
        argv.extend(self.args);
        argv.extend(self.options.fixed_args.iter().map(|a| Arg::flag(a.as_str())));

        CommandSpec {
            program: self.program,
            args: argv.iter().map(Arg::render).collect(),
            redact: self.redact,
        }
    }
}
