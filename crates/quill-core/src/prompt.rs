//! Prompt assembly.
//!
//! Templates use `{{name}}` placeholders:
//!
//! - `{{case_id}}`
//! - `{{classification.score}}`, `{{classification.level}}`,
//!   `{{classification.factors}}` (one bullet per contributing factor)
//! - any other name is looked up in the case record's fields
//!
//! Unknown fields render as `not provided` so a sparse case never leaves raw
//! placeholders in the prompt.

use lazy_static::lazy_static;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

use crate::case::CaseRecord;
use crate::types::Classification;

lazy_static! {
    static ref PLACEHOLDER: Regex = Regex::new(r"\{\{\s*([A-Za-z0-9_.]+)\s*\}\}").unwrap();
}

/// Appended when the profile expects a machine-readable result.
pub const STRUCTURED_OUTPUT_INSTRUCTIONS: &str = r#"
## Output Format
After the document, include a single JSON object containing these fields:
"#;

/// Prompt template declared by a domain profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PromptTemplate {
    /// Role and tone instructions
    #[serde(default)]
    pub system: String,

    /// Task body with placeholders
    pub body: String,
}

/// Builds instruction text from a template, a case and its classification.
#[derive(Debug, Clone)]
pub struct PromptAssembler {
    template: PromptTemplate,
    output_fields: Vec<String>,
}

impl PromptAssembler {
    pub fn new(template: PromptTemplate) -> Self {
        Self {
            template,
            output_fields: Vec::new(),
        }
    }

    /// Ask for a JSON block carrying `fields`.
    pub fn with_output_fields(mut self, fields: Vec<String>) -> Self {
        self.output_fields = fields;
        self
    }

    pub fn assemble(&self, case: &CaseRecord, classification: &Classification) -> String {
        let mut prompt = String::new();

        let system = self.template.system.trim();
        if !system.is_empty() {
            prompt.push_str(system);
            prompt.push_str("\n\n");
        }

        prompt.push_str(render(&self.template.body, case, classification).trim());

        if !self.output_fields.is_empty() {
            prompt.push('\n');
            prompt.push_str(STRUCTURED_OUTPUT_INSTRUCTIONS);
            for field in &self.output_fields {
                prompt.push_str(&format!("- \"{}\"\n", field));
            }
        }

        prompt
    }

    /// Append a revision request naming the failed checklist items.
    pub fn amend(prompt: &str, failed: &[String]) -> String {
        let mut amended = String::with_capacity(prompt.len() + 256);
        amended.push_str(prompt.trim_end());
        amended.push_str("\n\n## Revision Required\n");
        amended.push_str("A previous draft failed these checks. Address every item:\n");
        for item in failed {
            amended.push_str(&format!("- {}\n", item));
        }
        amended
    }
}

fn render(body: &str, case: &CaseRecord, classification: &Classification) -> String {
    PLACEHOLDER
        .replace_all(body, |caps: &Captures<'_>| {
            let name = &caps[1];
            match name {
                "case_id" => case.case_id().to_string(),
                "classification.score" => format!("{:.0}", classification.score),
                "classification.level" => classification.level.to_string(),
                "classification.factors" => render_factors(classification),
                field => case
                    .render(field)
                    .unwrap_or_else(|| "not provided".to_string()),
            }
        })
        .into_owned()
}

fn render_factors(classification: &Classification) -> String {
    if classification.contributing_factors.is_empty() {
        return "- none".to_string();
    }
    classification
        .contributing_factors
        .iter()
        .map(|f| format!("- [{}] {}: {}", f.severity, f.factor, f.detail))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ContributingFactor, Level};

    fn classification() -> Classification {
        Classification {
            score: 76.25,
            level: Level::Critical,
            contributing_factors: vec![ContributingFactor {
                factor: "Usage Decline".to_string(),
                severity: Level::Critical,
                weight: 25.0,
                detail: "Usage changed -60%".to_string(),
                recommendation: String::new(),
            }],
        }
    }

    #[test]
    fn test_placeholders_rendered() {
        let template = PromptTemplate {
            system: "You are a retention specialist.".to_string(),
            body: "Account {{case_id}} ({{ company }}) is {{classification.level}} \
                   risk, score {{classification.score}}.\n{{classification.factors}}"
                .to_string(),
        };
        let case = CaseRecord::new("ACME-1").with("company", "Acme Corp");

        let prompt = PromptAssembler::new(template).assemble(&case, &classification());

        assert!(prompt.starts_with("You are a retention specialist."));
        assert!(prompt.contains("Account ACME-1 (Acme Corp) is critical risk, score 76."));
        assert!(prompt.contains("- [critical] Usage Decline: Usage changed -60%"));
    }

    #[test]
    fn test_missing_field_placeholder() {
        let template = PromptTemplate {
            system: String::new(),
            body: "Contact: {{contact_name}}".to_string(),
        };
        let prompt = PromptAssembler::new(template)
            .assemble(&CaseRecord::new("X"), &classification());
        assert_eq!(prompt, "Contact: not provided");
    }

    #[test]
    fn test_output_fields_listed() {
        let template = PromptTemplate {
            system: String::new(),
            body: "Write it.".to_string(),
        };
        let prompt = PromptAssembler::new(template)
            .with_output_fields(vec!["subject".to_string()])
            .assemble(&CaseRecord::new("X"), &classification());
        assert!(prompt.contains("## Output Format"));
        assert!(prompt.contains("- \"subject\""));
    }

    #[test]
    fn test_amend_names_failed_checks() {
        let amended = PromptAssembler::amend(
            "Original prompt",
            &["contains_case_id: letter must cite the case".to_string()],
        );
        assert!(amended.starts_with("Original prompt"));
        assert!(amended.contains("## Revision Required"));
        assert!(amended.contains("- contains_case_id"));
    }
}
