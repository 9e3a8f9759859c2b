// Copyright 2025 Lablup Inc. and Jeongkyu Shin
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Remote command line composition.

use crate::model::CommandSpec;
use crate::shared::ConfigurationError;

/// Quote `value` for a POSIX shell.
///
/// The result is always single-quoted; embedded single quotes become `'\''`.
pub fn shell_escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len() + 2);
    escaped.push('\'');
    for ch in value.chars() {
        if ch == '\'' {
            escaped.push_str("'\\''");
        } else {
            escaped.push(ch);
        }
    }
    escaped.push('\'');
    escaped
}

/// Environment variable names must be plain shell identifiers.
fn is_shell_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Compose the line executed on every target.
///
/// Built inside out: the command, an `env` prefix, a non-interactive `sudo`
/// wrapper, then a `cd` prefix.
/// `cd '/tmp' && sudo -n env FOO='bar baz' ls`
pub fn build_command_line(spec: &CommandSpec) -> Result<String, ConfigurationError> {
    let mut line = spec.command.trim().to_string();
    if line.is_empty() {
        return Err(ConfigurationError::invalid("command", "must not be empty"));
    }

    if !spec.env.is_empty() {
        let mut assignments = Vec::with_capacity(spec.env.len());
        for (key, value) in &spec.env {
            if !is_shell_identifier(key) {
                return Err(ConfigurationError::invalid(
                    "environment variable name",
                    format!("'{key}' is not a valid shell identifier"),
                ));
            }
            assignments.push(format!("{key}={}", shell_escape(value)));
        }
        line = format!("env {} {line}", assignments.join(" "));
    }

    if spec.sudo {
        line = format!("sudo -n {line}");
    }

    if let Some(dir) = spec.working_directory.as_deref().filter(|d| !d.is_empty()) {
        line = format!("cd {} && {line}", shell_escape(dir));
    }

    Ok(line)
}
