use serde::{Deserialize, Serialize};

use super::{stream_json, PromptInfo, TokenSink};
use crate::errors::PipelineError;
use crate::models::{Domain, DomainAssignment, DomainSuggestionItem};
use crate::provider::{AiProvider, ChatRequest};

const SYSTEM_PROMPT: &str = r#"You classify documents of a translation bureau into knowledge domains.

Use only slugs from the list of known domains for documentDomains. If the
document covers a topic none of the known domains fits, propose it in
newDomainSuggestions instead. Write titles, reasons and questions in the
language of the document.

Respond with a single JSON object of this shape:
{
  "documentDomains": [
    {"primaryDomainSlug": "...", "secondaryDomainSlugs": ["..."], "confidence": 0.0, "reason": "..."}
  ],
  "newDomainSuggestions": [
    {"suggestedSlug": "...", "title": "...", "description": "...", "parentSlug": null, "confidence": 0.0, "reason": "..."}
  ],
  "questionsForHuman": ["..."]
}
Confidence values are between 0 and 1."#;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainClassification {
    pub document_domains: Vec<DomainAssignment>,
    #[serde(default)]
    pub new_domain_suggestions: Vec<DomainSuggestionItem>,
    #[serde(default)]
    pub questions_for_human: Vec<String>,
}

impl DomainClassification {
    /// Every slug named by the assignments, primary first, without repeats.
    pub fn assigned_slugs(&self) -> Vec<String> {
        let mut slugs: Vec<String> = Vec::new();
        for assignment in &self.document_domains {
            let names = std::iter::once(&assignment.primary_domain_slug)
                .chain(assignment.secondary_domain_slugs.iter());
            for slug in names {
                if !slug.is_empty() && !slugs.contains(slug) {
                    slugs.push(slug.clone());
                }
            }
        }
        slugs
    }
}

pub struct DomainClassifier<'a> {
    provider: &'a dyn AiProvider,
    raw_prefix_chars: usize,
}

impl<'a> DomainClassifier<'a> {
    pub fn new(provider: &'a dyn AiProvider, raw_prefix_chars: usize) -> Self {
        Self {
            provider,
            raw_prefix_chars,
        }
    }

    pub fn request(&self, text: &str, domains: &[Domain]) -> ChatRequest {
        let user = format!(
            "Known domains:\n{}\n\nDocument:\n{}",
            domain_tree(domains),
            text
        );
        ChatRequest::json(SYSTEM_PROMPT, user)
    }

    pub fn describe(&self, domains: &[Domain]) -> String {
        format!(
            "Определяем, к каким из {} известных доменов относится документ, и предлагаем новые домены, если подходящих нет.",
            domains.len()
        )
    }

    pub fn prompt(&self, text: &str, domains: &[Domain]) -> PromptInfo {
        PromptInfo::new(self.describe(domains), &self.request(text, domains))
    }

    pub async fn classify(
        &self,
        text: &str,
        domains: &[Domain],
        sink: &mut dyn TokenSink,
    ) -> Result<DomainClassification, PipelineError> {
        let request = self.request(text, domains);
        stream_json(self.provider, &request, sink, self.raw_prefix_chars).await
    }
}

/// One line per domain: `slug: title (parent: slug)`.
fn domain_tree(domains: &[Domain]) -> String {
    if domains.is_empty() {
        return "(none yet)".to_string();
    }
    domains
        .iter()
        .map(|d| {
            let parent = d
                .parent_id
                .as_ref()
                .and_then(|pid| domains.iter().find(|p| &p.id == pid))
                .map(|p| format!(" (parent: {})", p.slug))
                .unwrap_or_default();
            match &d.description {
                Some(desc) if !desc.is_empty() => {
                    format!("- {}: {}{} - {}", d.slug, d.title, parent, desc)
                }
                _ => format!("- {}: {}{}", d.slug, d.title, parent),
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}
