// Copyright The Uncloud Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License in the LICENSE file at the
// root of this repository, or online at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Command-line parsing conventions shared by `uncloudd` and `uncloud`.

/// A help template that omits the binary name header clap normally prints
/// above `USAGE`, matching the terser help output the rest of this codebase
/// expects.
const NO_VERSION_HELP_TEMPLATE: &str = "{about}

USAGE:
    {usage}

{all-args}";

/// Options controlling how [`parse_args`] builds a command's `clap::Command`
/// before parsing `std::env::args`.
#[derive(Debug, Clone, Copy)]
pub struct CliConfig {
    /// If set, included in the "unrecognized argument" error message to
    /// remind the caller which environment variable prefix this binary
    /// expects (e.g. `UNCLOUDD_`).
    pub env_prefix: Option<&'static str>,
    /// Whether to keep clap's automatic `--version` flag. Disabled by
    /// default so that version reporting goes through the explicit
    /// `--version` field most binaries here declare themselves, wired to a
    /// build-info string rather than `CARGO_PKG_VERSION`.
    pub enable_version_flag: bool,
}

impl Default for CliConfig {
    fn default() -> Self {
        CliConfig {
            env_prefix: None,
            enable_version_flag: false,
        }
    }
}

/// Parses command-line arguments according to a `clap::Parser` after
/// applying this codebase's conventions (no auto version flag, no binary
/// name in the help header).
pub fn parse_args<O>(config: CliConfig) -> O
where
    O: clap::Parser,
{
    let mut command = O::command().help_template(NO_VERSION_HELP_TEMPLATE);
    if !config.enable_version_flag {
        command = command.disable_version_flag(true);
    }
    let matches = command.try_get_matches().unwrap_or_else(|err| {
        if let Some(prefix) = config.env_prefix {
            eprintln!("(configuration may also be supplied via {prefix}* environment variables)");
        }
        err.exit()
    });
    match O::from_arg_matches(&matches) {
        Ok(args) => args,
        Err(err) => err.exit(),
    }
}
