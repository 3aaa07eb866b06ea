//! Rendering and persistence of a cycle's inner monologue.

use std::fmt::Write as _;
use std::fs::{File, create_dir_all};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::session::ConversationTurn;

const MERMAID_LABEL_CHARS: usize = 80;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonologueStep {
    pub index: usize,
    pub speaker: String,
    pub message: String,
}

/// Ordered intermediate agent messages of one cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Monologue {
    pub steps: Vec<MonologueStep>,
}

impl Monologue {
    pub fn from_turns(turns: &[ConversationTurn]) -> Self {
        let steps = turns
            .iter()
            .enumerate()
            .map(|(idx, turn)| MonologueStep {
                index: idx + 1,
                speaker: turn.role().to_string(),
                message: turn.content().to_string(),
            })
            .collect();
        Self { steps }
    }

    pub fn render_markdown(&self) -> String {
        if self.steps.is_empty() {
            return "No agent messages recorded.".to_string();
        }
        let mut output = String::from("### Inner monologue\n");
        for step in &self.steps {
            let _ = writeln!(output, "{}. **{}**: {}", step.index, step.speaker, step.message);
        }
        output
    }

    pub fn render_mermaid(&self) -> String {
        if self.steps.is_empty() {
            return "flowchart TD\n  %% no agent messages captured\n".to_string();
        }

        let mut output = String::from("flowchart TD\n");
        for step in &self.steps {
            let label = sanitize_mermaid(&format!(
                "{}: {}",
                step.speaker,
                truncate(&step.message, MERMAID_LABEL_CHARS)
            ));
            let _ = writeln!(output, "  step{}[\"{label}\"]", step.index);
        }
        for idx in 1..self.steps.len() {
            let _ = writeln!(output, "  step{idx} --> step{}", idx + 1);
        }
        output
    }
}

fn truncate(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

fn sanitize_mermaid(text: &str) -> String {
    text.replace('\\', "\\\\")
        .replace('"', "'")
        .replace('[', "(")
        .replace(']', ")")
        .replace('\n', "<br/>")
}

/// Write the monologue as pretty JSON to `<dir>/<session_id>.json`.
pub fn persist_monologue<P: AsRef<Path>>(
    dir: P,
    session_id: &str,
    turns: &[ConversationTurn],
) -> Result<PathBuf> {
    let dir = dir.as_ref();
    create_dir_all(dir)
        .with_context(|| format!("failed to create monologue directory {}", dir.display()))?;
    let path = dir.join(format!("{session_id}.json"));
    let payload = serde_json::to_vec_pretty(turns)?;
    let mut file = File::create(&path)
        .with_context(|| format!("failed to create monologue file {}", path.display()))?;
    file.write_all(&payload)
        .with_context(|| format!("failed to write monologue file {}", path.display()))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::TurnRole;
    use tempfile::TempDir;

    fn turns() -> Vec<ConversationTurn> {
        vec![
            ConversationTurn::new(TurnRole::Answerer, "Fabric is billed by capacity [F SKUs]."),
            ConversationTurn::new(TurnRole::Checker, "ANSWER CORRECT"),
            ConversationTurn::new(TurnRole::LinkChecker, "LINKS CORRECT"),
            ConversationTurn::new(TurnRole::Manager, "APPROVE"),
        ]
    }

    #[test]
    fn markdown_lists_each_speaker() {
        let markdown = Monologue::from_turns(&turns()).render_markdown();
        assert!(markdown.contains("1. **answerer**: Fabric is billed"));
        assert!(markdown.contains("4. **manager**: APPROVE"));
    }

    #[test]
    fn mermaid_chains_steps_and_escapes_brackets() {
        let mermaid = Monologue::from_turns(&turns()).render_mermaid();
        assert!(mermaid.starts_with("flowchart TD"));
        assert!(mermaid.contains("(F SKUs)"));
        assert!(mermaid.contains("step3 --> step4"));
        assert!(!mermaid.contains("step4 --> step5"));
    }

    #[test]
    fn empty_monologue_renders_placeholder() {
        let monologue = Monologue::from_turns(&[]);
        assert_eq!(monologue.render_markdown(), "No agent messages recorded.");
    }

    #[test]
    fn persisted_monologue_round_trips() -> Result<()> {
        let temp = TempDir::new()?;
        let path = persist_monologue(temp.path(), "session-42", &turns())?;
        assert!(path.ends_with("session-42.json"));
        let restored: Vec<ConversationTurn> = serde_json::from_slice(&std::fs::read(&path)?)?;
        let original = turns();
        assert_eq!(restored.len(), original.len());
        for (restored, original) in restored.iter().zip(&original) {
            assert_eq!(restored.role(), original.role());
            assert_eq!(restored.content(), original.content());
        }
        Ok(())
    }
}
