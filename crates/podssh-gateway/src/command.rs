//! Command resolution
//!
//! Decides the argument vector executed inside the pod. The main command
//! comes from the client if it sent one, else from the pod's command
//! annotation, else from the service account's. A prefix command, looked
//! up the same way between pod and service account, is prepended
//! whenever present.

use podssh_core::config::AnnotationKeys;
use podssh_core::CommandError;

use crate::directory::ClusterObject;

/// Resolves commands from client input and object annotations
#[derive(Debug, Clone)]
pub struct CommandResolver {
    command_key: String,
    prefix_key: String,
}

impl CommandResolver {
    /// Create a resolver reading the configured annotation keys
    pub fn new(keys: &AnnotationKeys) -> Self {
        Self {
            command_key: keys.command.clone(),
            prefix_key: keys.prefix_command.clone(),
        }
    }

    /// Resolve the command for a session.
    ///
    /// An empty result is valid and leaves the choice of program to the
    /// exec API.
    pub fn resolve(
        &self,
        client_command: &[String],
        workload: &ClusterObject,
        principal: &ClusterObject,
    ) -> Result<Vec<String>, CommandError> {
        let main = if client_command.is_empty() {
            annotated_command(&self.command_key, workload, principal)?
        } else {
            client_command.to_vec()
        };

        let mut command = annotated_command(&self.prefix_key, workload, principal)?;
        if !command.is_empty() {
            tracing::debug!(prefix = ?command, "Prepending prefix command");
        }
        command.extend(main);
        Ok(command)
    }
}

/// Tokens of `key` on the workload, falling back to the principal
fn annotated_command(
    key: &str,
    workload: &ClusterObject,
    principal: &ClusterObject,
) -> Result<Vec<String>, CommandError> {
    for object in [workload, principal] {
        if let Some(value) = object.annotation(key) {
            let tokens = tokenize(&format!("{}/{}", object.namespace, object.name), value)?;
            if !tokens.is_empty() {
                return Ok(tokens);
            }
        }
    }

    Ok(Vec::new())
}

/// Split a string with POSIX shell quoting rules
pub fn tokenize(source_name: &str, value: &str) -> Result<Vec<String>, CommandError> {
    shlex::split(value).ok_or_else(|| CommandError::Tokenize {
        source_name: source_name.to_string(),
        value: value.to_string(),
    })
}

/// Tokenize the raw command of an SSH exec request.
///
/// Bytes that are not UTF-8 are refused rather than rewritten.
pub fn tokenize_exec(data: &[u8]) -> Result<Vec<String>, CommandError> {
    const SOURCE: &str = "exec request";

    let value = std::str::from_utf8(data).map_err(|_| CommandError::Encoding {
        source_name: SOURCE.to_string(),
    })?;
    tokenize(SOURCE, value)
}
