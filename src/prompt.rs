//! Operator interaction.
//!
//! The build remediation prompt, trusted key selection and the launch gates
//! all ask through a [`Prompter`], so the same code runs against a terminal
//! or a scripted conversation.

use anyhow::{Context, Result};
use std::collections::VecDeque;
use std::io::{self, BufRead, Write};

pub trait Prompter {
    /// Ask a question and return the raw answer line (without newline).
    fn ask(&mut self, question: &str) -> Result<String>;

    /// Show sensitive material to the operator. Callers show it once.
    fn reveal(&mut self, label: &str, secret: &str) -> Result<()>;
}

/// True only for an exact `yes`.
pub fn confirm(prompter: &mut dyn Prompter, question: &str) -> Result<bool> {
    let answer = prompter.ask(question)?;
    Ok(answer.trim() == "yes")
}

/// Prompter bound to stdin/stdout. End of input answers with an empty line.
pub struct TerminalPrompter;

impl Prompter for TerminalPrompter {
    fn ask(&mut self, question: &str) -> Result<String> {
        print!("{} ", question);
        io::stdout().flush().context("Failed to flush stdout")?;

        let mut line = String::new();
        io::stdin()
            .lock()
            .read_line(&mut line)
            .context("Failed to read answer from stdin")?;
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }

    fn reveal(&mut self, label: &str, secret: &str) -> Result<()> {
        println!();
        println!("===== {} (shown once, store it now) =====", label);
        println!("{}", secret.trim_end());
        println!("===== end of {} =====", label);
        println!();
        Ok(())
    }
}

/// Prompter answering from a fixed script and recording the conversation.
#[derive(Debug, Default)]
pub struct ScriptedPrompter {
    answers: VecDeque<String>,
    pub questions: Vec<String>,
    pub revealed: Vec<(String, String)>,
}

impl ScriptedPrompter {
    pub fn new<I, S>(answers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            answers: answers.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }
}

impl Prompter for ScriptedPrompter {
    fn ask(&mut self, question: &str) -> Result<String> {
        self.questions.push(question.to_string());
        // An exhausted script behaves like a closed stdin
        Ok(self.answers.pop_front().unwrap_or_default())
    }

    fn reveal(&mut self, label: &str, secret: &str) -> Result<()> {
        self.revealed.push((label.to_string(), secret.to_string()));
        Ok(())
    }
}
