// Command-line parsing for the builder-listener binary, with environment
// fallback (SPB_BUILDER_INPUT_*).

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

use builder_common::constants::command_line;
use builder_sdk::StringUtil;

/// Environment variable prefix for command-line input overrides.
const ENV_PREFIX: &str = "SPB_BUILDER_INPUT_";

/// Parsed command settings.
///
/// Supports named arguments (`--key value`), boolean flags (`--flag`) and a
/// single top-level command. `run` is the default.
#[derive(Debug, Clone)]
pub struct CommandSettings {
    command: Option<String>,
    args: HashMap<String, String>,
    flags: HashMap<String, bool>,
}

impl CommandSettings {
    /// Parse the process arguments.
    pub fn parse() -> Self {
        let raw_args: Vec<String> = env::args().skip(1).collect();
        Self::parse_from(&raw_args)
    }

    pub fn parse_from(args: &[String]) -> Self {
        let mut command = None;
        let mut named_args = HashMap::new();
        let mut flags = HashMap::new();
        let mut i = 0;

        while i < args.len() {
            let arg = &args[i];

            if let Some(key) = arg.strip_prefix("--") {
                // `--key=value` and `--key value` are both accepted for named arguments.
                if let Some((key, value)) = key.split_once('=') {
                    named_args.insert(key.to_lowercase(), value.to_string());
                    i += 1;
                    continue;
                }
                let key = key.to_lowercase();
                if is_named_arg(&key) && i + 1 < args.len() {
                    named_args.insert(key, args[i + 1].clone());
                    i += 2;
                } else {
                    flags.insert(key, true);
                    i += 1;
                }
            } else if command.is_none() && !arg.starts_with('-') {
                command = Some(arg.to_lowercase());
                i += 1;
            } else {
                i += 1;
            }
        }

        Self {
            command,
            args: named_args,
            flags,
        }
    }

    /// The command, if it is not one this binary knows.
    pub fn unknown_command(&self) -> Option<&str> {
        self.command
            .as_deref()
            .filter(|c| *c != command_line::commands::RUN)
    }

    /// Named argument, falling back to `SPB_BUILDER_INPUT_<NAME>`.
    pub fn get_arg(&self, name: &str) -> Option<String> {
        let key = name.to_lowercase();
        if let Some(val) = self.args.get(&key) {
            return Some(val.clone());
        }

        let env_key = format!("{}{}", ENV_PREFIX, name.to_uppercase());
        env::var(env_key).ok().filter(|v| !v.is_empty())
    }

    /// Settings file location given with `--config`.
    pub fn get_config(&self) -> Option<PathBuf> {
        self.get_arg(command_line::args::CONFIG).map(PathBuf::from)
    }

    /// Packagebuilder home given with `--home`.
    pub fn get_home(&self) -> Option<PathBuf> {
        self.get_arg(command_line::args::HOME).map(PathBuf::from)
    }

    /// Flag, falling back to `SPB_BUILDER_INPUT_<NAME>`.
    pub fn get_flag(&self, name: &str) -> bool {
        let key = name.to_lowercase();
        if self.flags.get(&key) == Some(&true) {
            return true;
        }

        let env_key = format!("{}{}", ENV_PREFIX, name.to_uppercase());
        env::var(env_key)
            .ok()
            .and_then(|v| StringUtil::convert_to_bool(&v))
            .unwrap_or(false)
    }

    /// `--check`: validate settings and identity, then exit.
    pub fn is_check(&self) -> bool {
        self.get_flag(command_line::flags::CHECK)
    }

    pub fn is_help(&self) -> bool {
        self.get_flag(command_line::flags::HELP)
    }

    pub fn is_version(&self) -> bool {
        self.get_flag(command_line::flags::VERSION)
    }
}

fn is_named_arg(key: &str) -> bool {
    matches!(key, command_line::args::CONFIG | command_line::args::HOME)
}

pub fn usage() -> String {
    format!(
        "Usage: builder-listener [run] [--config <file>] [--home <dir>] [--check]\n\
         \n\
         Subscribes to the build job and keepalive topics and runs one build\n\
         program per accepted job.\n\
         \n\
         Options:\n\
         \x20 --config <file>  settings file (default: <install root>/.builder)\n\
         \x20 --home <dir>     packagebuilder home (overrides the settings file)\n\
         \x20 --check          validate settings and builder identity, then exit\n\
         \x20 --version        print the version\n\
         \x20 --help           print this help\n\
         \n\
         Every option can also be given as {ENV_PREFIX}<NAME>."
    )
}
