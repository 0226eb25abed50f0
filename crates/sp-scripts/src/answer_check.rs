//! Workshop challenge answer checker.

use crate::registry::{HostServices, Script, ScriptError, ScriptResult};
use async_trait::async_trait;
use serde_json::Value;
use sp_connectors::{CommandArgs, CommandOutput, CommandResults, EntryFormat, EntryType};
use std::collections::HashMap;
use tracing::debug;

const GOOD_IMAGES: [&str; 1] = [
    "https://raw.githubusercontent.com/demisto/content/806a73315034eb4319d58b51d5bfe0ff56e0c3f9/Packs/ctf01/doc_files/until-next.gif",
];

const BAD_IMAGES: [&str; 5] = [
    "https://raw.githubusercontent.com/demisto/content/ctf/Packs/ctf01/doc_files/idola-idola-industries.gif",
    "https://raw.githubusercontent.com/demisto/content/ctf/Packs/ctf01/doc_files/it-doesnt-work-that-way-john-edward.gif",
    "https://raw.githubusercontent.com/demisto/content/ctf/Packs/ctf01/doc_files/lion-king.gif",
    "https://raw.githubusercontent.com/demisto/content/ctf/Packs/ctf01/doc_files/robert-downey-jr-maybe.gif",
    "https://raw.githubusercontent.com/demisto/content/ctf/Packs/ctf01/doc_files/the-rock-look-the-rock-meme.gif",
];

const DEFAULT_QUESTION: &str = "01";

/// Checks a `secret` against the accepted answers of a question.
pub struct AnswerCheck {
    answers: HashMap<String, Vec<String>>,
}

impl Default for AnswerCheck {
    fn default() -> Self {
        let mut answers = HashMap::new();
        answers.insert(
            DEFAULT_QUESTION.to_string(),
            ["nikesh arora", "nikesh", "arora", "ceo", "papa nikesh"]
                .map(String::from)
                .to_vec(),
        );
        Self { answers }
    }
}

impl AnswerCheck {
    /// A checker with a custom answer table; answers are compared lowercased.
    pub fn new(answers: HashMap<String, Vec<String>>) -> Self {
        let answers = answers
            .into_iter()
            .map(|(question, accepted)| {
                (question, accepted.into_iter().map(|a| a.to_lowercase()).collect())
            })
            .collect();
        Self { answers }
    }

    pub fn is_correct(&self, question_id: &str, secret: &str) -> bool {
        let secret = secret.trim().to_lowercase();
        self.answers
            .get(question_id)
            .is_some_and(|accepted| accepted.iter().any(|a| *a == secret))
    }
}

fn success_html() -> String {
    format!(
        "\n<img src=\"{}\" alt=\"Robot\">\n<div style='font-size:18px;'>\nWell Done!!!\n\n\
         Thank you for participating in our XSOAR's workshop. Hope that you have enjoyed the \
         challenge and also gained some knowledge.\nTill next time :)\n\n\n</div>\n",
        GOOD_IMAGES[0]
    )
}

fn failure_html(secret: &str) -> String {
    let image = BAD_IMAGES[secret.len() % BAD_IMAGES.len()];
    format!(
        "\n<img src=\"{}\" alt=\"Error\">\n<div style='font-size:18px;'>\nNope!!! Try again.\n\
         Remember to overwrite the \"secret\" argument when you are re-running the task. \
         To re-run the task - please click on the 'Run automation now' :)\n</div>\n",
        image
    )
}

#[async_trait]
impl Script for AnswerCheck {
    fn name(&self) -> &str {
        "AnswerCheck"
    }

    fn description(&self) -> &str {
        "Checks a workshop challenge answer"
    }

    async fn run(&self, args: &CommandArgs, _host: &dyn HostServices) -> ScriptResult<CommandOutput> {
        let secret = args.get_str("secret").ok_or_else(|| {
            ScriptError::Execution(
                "Please specify Secret and Question ID to proceed with the challenge".into(),
            )
        })?;
        let question_id = args.get_str_or("question_id", DEFAULT_QUESTION);

        let correct = self.is_correct(&question_id, &secret);
        debug!(question_id = %question_id, correct, "Checked answer");

        let result = if correct {
            CommandResults::new()
                .with_raw_response(Value::String(success_html()))
                .with_format(EntryFormat::Html)
        } else {
            CommandResults {
                raw_response: Some(Value::String(failure_html(&secret))),
                contents_format: EntryFormat::Html,
                entry_type: EntryType::Error,
                ..CommandResults::default()
            }
        };
        Ok(CommandOutput::single(result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockHost;

    async fn check(args: CommandArgs) -> ScriptResult<Value> {
        let output = AnswerCheck::default().run(&args, &MockHost::default()).await?;
        Ok(output.to_entries().remove(0))
    }

    #[tokio::test]
    async fn test_correct_answer_is_case_insensitive() {
        let entry = check(CommandArgs::new().with("secret", "Nikesh Arora")).await.unwrap();
        assert_eq!(entry["Type"], 1);
        assert_eq!(entry["ContentsFormat"], "html");
        assert!(entry["Contents"].as_str().unwrap().contains("Well Done!!!"));
    }

    #[tokio::test]
    async fn test_wrong_answer_is_html_error() {
        let entry = check(
            CommandArgs::new()
                .with("secret", "satya")
                .with("question_id", "01"),
        )
        .await
        .unwrap();
        assert_eq!(entry["Type"], 4);
        assert_eq!(entry["ContentsFormat"], "html");
        let contents = entry["Contents"].as_str().unwrap();
        assert!(contents.contains("Nope!!! Try again."));
        assert!(BAD_IMAGES.iter().any(|image| contents.contains(image)));
    }

    #[tokio::test]
    async fn test_unknown_question_is_wrong() {
        let entry = check(
            CommandArgs::new()
                .with("secret", "ceo")
                .with("question_id", "99"),
        )
        .await
        .unwrap();
        assert_eq!(entry["Type"], 4);
    }

    #[tokio::test]
    async fn test_missing_secret() {
        let err = check(CommandArgs::new()).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Please specify Secret and Question ID to proceed with the challenge"
        );
    }

    #[test]
    fn test_custom_answers_lowercased() {
        let mut answers = HashMap::new();
        answers.insert("02".to_string(), vec!["Cortex".to_string()]);
        let checker = AnswerCheck::new(answers);
        assert!(checker.is_correct("02", " CORTEX "));
        assert!(!checker.is_correct("01", "ceo"));
    }
}
