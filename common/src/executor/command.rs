// Structured command-line construction for task executions

use crate::errors::ExecutionError;
use std::collections::{BTreeMap, HashMap};

/// Shell metacharacters rejected outright. There is no shell between the
/// scheduler and the child process, so none of these can ever be legitimate
/// in a task command.
const FORBIDDEN_CHARS: &[char] = &[';', '&', '|', '$', '`', '<', '>', '(', ')'];

/// A fully-built argument vector ready to hand to the process spawner.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandLine {
    /// Build an argument vector from a whitespace-separated command and an
    /// optional parameter map. Parameters are appended as `--key`-style flags
    /// in key order so the same definition always produces the same argv.
    pub fn build(
        command: &str,
        parameters: Option<&HashMap<String, serde_json::Value>>,
    ) -> Result<Self, ExecutionError> {
        if let Some(character) = command.chars().find(|c| FORBIDDEN_CHARS.contains(c)) {
            return Err(ExecutionError::UnsafeCommand {
                command: command.to_string(),
                character,
            });
        }

        let mut parts = command.split_whitespace().map(String::from);
        let program = parts.next().ok_or(ExecutionError::EmptyCommand)?;
        let mut args: Vec<String> = parts.collect();

        if let Some(params) = parameters {
            let sorted: BTreeMap<&String, &serde_json::Value> = params.iter().collect();
            for (key, value) in sorted {
                match value {
                    serde_json::Value::Null => {}
                    serde_json::Value::Bool(true) => args.push(format!("--{}", key)),
                    serde_json::Value::Bool(false) => {}
                    serde_json::Value::Number(n) => args.push(format!("--{}={}", key, n)),
                    serde_json::Value::String(s) => args.push(format!("--{}={}", key, s)),
                    // Compound values travel as JSON and are decoded by the
                    // task itself.
                    other => args.push(format!("--{}={}", key, other)),
                }
            }
        }

        Ok(Self { program, args })
    }

    /// The full argv including the program, for logging.
    pub fn display(&self) -> String {
        let mut rendered = self.program.clone();
        for arg in &self.args {
            rendered.push(' ');
            rendered.push_str(arg);
        }
        rendered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(pairs: &[(&str, serde_json::Value)]) -> HashMap<String, serde_json::Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_build_splits_on_whitespace() {
        let line = CommandLine::build("python3 scripts/backup.py --full", None).unwrap();
        assert_eq!(line.program, "python3");
        assert_eq!(line.args, vec!["scripts/backup.py", "--full"]);
    }

    #[test]
    fn test_build_rejects_empty_command() {
        assert!(matches!(
            CommandLine::build("   ", None),
            Err(ExecutionError::EmptyCommand)
        ));
    }

    #[test]
    fn test_build_rejects_shell_metacharacters() {
        for cmd in [
            "ls; rm -rf /",
            "cat file | grep x",
            "echo $HOME",
            "sleep 10 & echo done",
            "echo `id`",
            "cat < input",
            "echo hi > out",
            "(subshell)",
        ] {
            let err = CommandLine::build(cmd, None).unwrap_err();
            assert!(
                matches!(err, ExecutionError::UnsafeCommand { .. }),
                "expected rejection for {:?}",
                cmd
            );
        }
    }

    #[test]
    fn test_parameters_append_as_flags_in_key_order() {
        let line = CommandLine::build(
            "run-job",
            Some(&params(&[
                ("verbose", json!(true)),
                ("dry-run", json!(false)),
                ("batch-size", json!(500)),
                ("mode", json!("full")),
            ])),
        )
        .unwrap();
        assert_eq!(
            line.args,
            vec!["--batch-size=500", "--mode=full", "--verbose"]
        );
    }

    #[test]
    fn test_compound_parameter_values_encode_as_json() {
        let line = CommandLine::build(
            "run-job",
            Some(&params(&[("targets", json!(["a", "b"]))])),
        )
        .unwrap();
        assert_eq!(line.args, vec![r#"--targets=["a","b"]"#]);
    }

    #[test]
    fn test_display_includes_program_and_args() {
        let line = CommandLine::build("echo hello world", None).unwrap();
        assert_eq!(line.display(), "echo hello world");
    }
}
