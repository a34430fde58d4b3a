use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::{stream_json, PromptInfo, TokenSink};
use crate::chunk::Chunker;
use crate::config::{ChunkingConfig, ExtractionConfig};
use crate::errors::PipelineError;
use crate::models::{
    format_rule_code, next_code_after, parse_rule_code, ExtractedQa, ExtractedRule, Uncertainty,
};
use crate::provider::{AiProvider, ChatRequest};

const SYSTEM_PROMPT: &str = r#"You extract business knowledge from documents of a translation bureau.

Extract:
- rules: atomic, verifiable business rules (prices, deadlines, requirements,
  procedures). Number them sequentially starting from the given code and
  never reuse a code from the list of used codes. Quote the exact source
  text in sourceSpan.quote.
- qaPairs: questions a client or manager would ask, answered from the text.
  Set linkedRuleCode when the answer follows from one rule.
- uncertainties: contradictions, gaps or ambiguities a human should resolve.

Keep all text in the language of the document. Respond with a single JSON
object of this shape:
{
  "rules": [
    {"ruleCode": "R-1", "title": "...", "body": "...", "confidence": 0.0,
     "sourceSpan": {"quote": "...", "locationHint": "..."}}
  ],
  "qaPairs": [{"question": "...", "answer": "...", "linkedRuleCode": null}],
  "uncertainties": [{"type": "...", "description": "...", "suggestedQuestion": "..."}]
}"#;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeExtraction {
    pub rules: Vec<ExtractedRule>,
    #[serde(default)]
    pub qa_pairs: Vec<ExtractedQa>,
    #[serde(default)]
    pub uncertainties: Vec<Uncertainty>,
}

impl KnowledgeExtraction {
    fn append(&mut self, other: KnowledgeExtraction) {
        self.rules.extend(other.rules);
        self.qa_pairs.extend(other.qa_pairs);
        self.uncertainties.extend(other.uncertainties);
    }
}

/// Code numbering state carried from one batch to the next.
#[derive(Debug, Clone, Default)]
pub struct CodeContext {
    pub next_code: u32,
    pub used_codes: Vec<String>,
}

impl CodeContext {
    pub fn new(next_code: u32, used_codes: Vec<String>) -> Self {
        Self {
            next_code: next_code.max(1),
            used_codes,
        }
    }

    /// Continue numbering after the highest of `used_codes`.
    pub fn from_used(used_codes: Vec<String>) -> Self {
        let next = next_code_after(used_codes.iter().map(String::as_str));
        Self::new(next, used_codes)
    }

    /// Make every rule code in `part` unique and sequential-after-used.
    ///
    /// Codes the model reused or mangled are replaced with the next free
    /// code, and Q&A links in the same batch are rewritten to match.
    fn assign(&mut self, part: &mut KnowledgeExtraction) {
        let mut renamed: HashMap<String, String> = HashMap::new();
        for rule in &mut part.rules {
            let original = rule.rule_code.trim().to_string();
            let keep = parse_rule_code(&original).is_some() && !self.used_codes.contains(&original);
            if !keep {
                while self.used_codes.contains(&format_rule_code(self.next_code)) {
                    self.next_code = self.next_code.saturating_add(1);
                }
                rule.rule_code = format_rule_code(self.next_code);
                renamed
                    .entry(original)
                    .or_insert_with(|| rule.rule_code.clone());
            } else {
                rule.rule_code = original;
            }
            if let Some(n) = parse_rule_code(&rule.rule_code) {
                self.next_code = self.next_code.max(n.saturating_add(1));
            }
            self.used_codes.push(rule.rule_code.clone());
        }

        for qa in &mut part.qa_pairs {
            if let Some(code) = qa.linked_rule_code.as_ref().map(|c| c.trim().to_string()) {
                qa.linked_rule_code = if code.is_empty() {
                    None
                } else {
                    Some(renamed.get(&code).cloned().unwrap_or(code))
                };
            }
        }
    }
}

pub struct KnowledgeExtractor<'a> {
    provider: &'a dyn AiProvider,
    batch_threshold: usize,
    batcher: Chunker,
    raw_prefix_chars: usize,
}

impl<'a> KnowledgeExtractor<'a> {
    pub fn new(provider: &'a dyn AiProvider, config: &ExtractionConfig) -> Self {
        let batcher = Chunker::new(&ChunkingConfig {
            chunk_size: config.batch_threshold,
            overlap: config.batch_overlap,
            min_chunk_chars: 0,
            search_window: config.batch_overlap / 2,
        });
        Self {
            provider,
            batch_threshold: config.batch_threshold,
            batcher,
            raw_prefix_chars: config.raw_prefix_chars,
        }
    }

    /// Text windows sent to the model, one request each.
    pub fn batches(&self, text: &str) -> Vec<String> {
        if text.chars().count() <= self.batch_threshold {
            return vec![text.to_string()];
        }
        self.batcher
            .split(text)
            .into_iter()
            .map(|c| c.content)
            .collect()
    }

    pub fn request(&self, text: &str, codes: &CodeContext, domain_slugs: &[String]) -> ChatRequest {
        let used = if codes.used_codes.is_empty() {
            "(none)".to_string()
        } else {
            codes.used_codes.join(", ")
        };
        let domains = if domain_slugs.is_empty() {
            "(unclassified)".to_string()
        } else {
            domain_slugs.join(", ")
        };
        let user = format!(
            "Start rule codes at: {}\nUsed rule codes: {}\nDocument domains: {}\n\nDocument:\n{}",
            format_rule_code(codes.next_code),
            used,
            domains,
            text
        );
        ChatRequest::json(SYSTEM_PROMPT, user)
    }

    pub fn describe(&self, text: &str) -> String {
        let batches = self.batches(text).len();
        if batches > 1 {
            format!(
                "Извлекаем правила, пары вопрос-ответ и неясности. Документ большой, обрабатываем его частями: {} шт. по порядку.",
                batches
            )
        } else {
            "Извлекаем правила, пары вопрос-ответ и неясности из текста документа.".to_string()
        }
    }

    /// Prompt shown to the user; for batched documents this is the first batch.
    pub fn prompt(&self, text: &str, codes: &CodeContext, domain_slugs: &[String]) -> PromptInfo {
        let first = self.batches(text).into_iter().next().unwrap_or_default();
        PromptInfo::new(self.describe(text), &self.request(&first, codes, domain_slugs))
    }

    /// Extract knowledge from `text`, batching it when it is long.
    ///
    /// Batches run one after another. Any failed batch fails the whole
    /// extraction and the results of earlier batches are dropped.
    pub async fn extract(
        &self,
        text: &str,
        mut codes: CodeContext,
        domain_slugs: &[String],
        sink: &mut dyn TokenSink,
    ) -> Result<KnowledgeExtraction, PipelineError> {
        let batches = self.batches(text);
        let total = batches.len();
        let mut merged = KnowledgeExtraction::default();

        for (i, batch) in batches.iter().enumerate() {
            let request = self.request(batch, &codes, domain_slugs);
            let mut part: KnowledgeExtraction =
                stream_json(self.provider, &request, sink, self.raw_prefix_chars).await?;
            codes.assign(&mut part);
            tracing::debug!(
                batch = i + 1,
                total,
                rules = part.rules.len(),
                next_code = codes.next_code,
                "knowledge batch extracted"
            );
            merged.append(part);
        }

        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(code: &str) -> ExtractedRule {
        ExtractedRule {
            rule_code: code.into(),
            title: "t".into(),
            body: "b".into(),
            confidence: 0.8,
            source_span: Default::default(),
        }
    }

    #[test]
    fn test_codes_continue_after_used() {
        let mut ctx = CodeContext::new(4, vec!["R-1".into(), "R-2".into(), "R-3".into()]);
        let mut part = KnowledgeExtraction {
            rules: vec![rule("R-4"), rule("R-5")],
            ..Default::default()
        };
        ctx.assign(&mut part);
        assert_eq!(ctx.next_code, 6);

        let mut second = KnowledgeExtraction {
            rules: vec![rule("R-6")],
            ..Default::default()
        };
        ctx.assign(&mut second);
        assert_eq!(second.rules[0].rule_code, "R-6");
        assert_eq!(ctx.next_code, 7);
    }

    #[test]
    fn test_colliding_codes_are_renumbered_with_links() {
        let mut ctx = CodeContext::new(3, vec!["R-1".into(), "R-2".into()]);
        let mut part = KnowledgeExtraction {
            rules: vec![rule("R-1"), rule("rule one")],
            qa_pairs: vec![ExtractedQa {
                question: "q".into(),
                answer: "a".into(),
                linked_rule_code: Some("R-1".into()),
            }],
            uncertainties: vec![],
        };
        ctx.assign(&mut part);
        assert_eq!(part.rules[0].rule_code, "R-3");
        assert_eq!(part.rules[1].rule_code, "R-4");
        assert_eq!(part.qa_pairs[0].linked_rule_code.as_deref(), Some("R-3"));
    }

    #[test]
    fn test_out_of_range_code_is_renumbered() {
        let mut ctx = CodeContext::from_used(vec!["R-4294967295".into()]);
        let mut part = KnowledgeExtraction {
            rules: vec![rule("R-4294967295"), rule("R-2")],
            qa_pairs: vec![ExtractedQa {
                question: "q".into(),
                answer: "a".into(),
                linked_rule_code: Some("R-4294967295".into()),
            }],
            uncertainties: vec![],
        };
        ctx.assign(&mut part);
        assert_eq!(part.rules[0].rule_code, "R-1");
        assert_eq!(part.rules[1].rule_code, "R-2");
        assert_eq!(part.qa_pairs[0].linked_rule_code.as_deref(), Some("R-1"));
        assert_eq!(ctx.next_code, 3);
    }

    #[test]
    fn test_short_text_is_single_batch() {
        let provider = crate::provider::DisabledProvider;
        let extractor = KnowledgeExtractor::new(&provider, &ExtractionConfig::default());
        assert_eq!(extractor.batches("Цена перевода 500 рублей").len(), 1);
        let long = "Абзац с правилом о сроках перевода. ".repeat(100);
        let batches = extractor.batches(&long);
        assert!(batches.len() > 3);
        assert!(batches.iter().all(|b| b.chars().count() <= 1100));
    }
}
