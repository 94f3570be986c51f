use std::io;
use std::path::Path;
use std::process::Command;

use anyhow::Context;
use clap::Args;

use crate::error::ExitError;
use crate::layout::AGENT_PROMPT_FILE;

#[derive(Debug, Args)]
pub struct PromptArgs {
    /// Print the agent prompt (default)
    #[arg(long, conflicts_with = "edit")]
    pub show: bool,

    /// Open the agent prompt in $EDITOR
    #[arg(long)]
    pub edit: bool,
}

impl PromptArgs {
    pub fn execute(&self) -> anyhow::Result<()> {
        let layout = super::current_project()?;
        let path = layout.agent_prompt();
        if self.edit {
            let editor = std::env::var("EDITOR").unwrap_or_default();
            return edit(&editor, &path);
        }

        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ExitError::Config(format!(
                    "{AGENT_PROMPT_FILE} not found (run 'metamorph init' first)"
                ))
                .into());
            }
            Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
        };
        print!("{text}");
        Ok(())
    }
}

/// `$EDITOR` may carry arguments (`code -w`); empty falls back to `vi`.
fn editor_command(editor: &str) -> (String, Vec<String>) {
    let mut words = editor.split_whitespace().map(ToString::to_string);
    let program = words.next().unwrap_or_else(|| "vi".to_string());
    (program, words.collect())
}

fn edit(editor: &str, path: &Path) -> anyhow::Result<()> {
    let (program, args) = editor_command(editor);
    let status = match Command::new(&program).args(&args).arg(path).status() {
        Ok(status) => status,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(ExitError::ToolNotFound { tool: program }.into());
        }
        Err(e) => return Err(e).with_context(|| format!("running {program}")),
    };
    if !status.success() {
        return Err(ExitError::ToolFailed {
            tool: program,
            code: status.code().unwrap_or(-1),
            message: format!("editing {}", path.display()),
        }
        .into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn editor_words_split_into_program_and_args() {
        assert_eq!(editor_command(""), ("vi".to_string(), Vec::new()));
        assert_eq!(editor_command("  "), ("vi".to_string(), Vec::new()));
        assert_eq!(
            editor_command("code -w"),
            ("code".to_string(), vec!["-w".to_string()])
        );
    }

    #[test]
    fn failing_editor_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(AGENT_PROMPT_FILE);
        std::fs::write(&path, "prompt\n").unwrap();

        edit("true", &path).unwrap();
        let err = edit("false", &path).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ExitError>(),
            Some(ExitError::ToolFailed { code: 1, .. })
        ));
        let err = edit("metamorph-no-such-editor", &path).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ExitError>(),
            Some(ExitError::ToolNotFound { .. })
        ));
    }
}
