//! Context assembly under a token budget.

use crate::types::{AssembledPrompt, HistoryTurn, Passage, PassageRef};
use docrag_core::{estimate_tokens, AppError, AppResult};
use handlebars::Handlebars;
use serde::Serialize;

const TEMPLATE_NAME: &str = "user";

/// Built-in layout: sources, then the conversation, then the question.
pub const DEFAULT_TEMPLATE: &str = "\
{{#if passages}}Sources:
{{#each passages}}[{{tag}}] {{text}}
{{/each}}
{{/if}}{{#if history}}Conversation so far:
{{#each history}}{{role}}: {{text}}
{{/each}}
{{/if}}Question: {{query}}
";

const GROUNDED_SYSTEM: &str = "You answer questions using only the numbered sources provided. \
Cite each source you rely on by its tag, for example [S1]. \
If the sources do not contain the answer, say that you do not know.";

const PLAIN_SYSTEM: &str =
    "You are an assistant for questions about the organization's documents. Answer concisely.";

#[derive(Serialize)]
struct TaggedPassage<'a> {
    tag: String,
    document_id: &'a str,
    text: &'a str,
}

#[derive(Serialize)]
struct RenderedTurn<'a> {
    role: &'static str,
    text: &'a str,
}

#[derive(Serialize)]
struct PromptContext<'a> {
    query: &'a str,
    passages: Vec<TaggedPassage<'a>>,
    history: Vec<RenderedTurn<'a>>,
}

/// Packs the query, ranked passages and recent history into one prompt.
///
/// The query always goes in. Passages are added in rank order until the next
/// one would exceed the budget, then history turns from the most recent
/// backwards. Every candidate is measured on the fully rendered prompt, so
/// template text counts against the budget too.
pub struct ContextAssembler {
    handlebars: Handlebars<'static>,
}

impl ContextAssembler {
    /// Use `template` (Handlebars) for the user message, or the built-in one.
    pub fn new(template: Option<&str>) -> AppResult<Self> {
        let mut handlebars = Handlebars::new();

        // Plain text prompt, no HTML escaping
        handlebars.register_escape_fn(handlebars::no_escape);

        handlebars
            .register_template_string(TEMPLATE_NAME, template.unwrap_or(DEFAULT_TEMPLATE))
            .map_err(|e| AppError::Prompt(format!("Failed to register template: {}", e)))?;

        Ok(Self { handlebars })
    }

    fn render(&self, system: &str, ctx: &PromptContext<'_>) -> AppResult<(String, usize)> {
        let user = self
            .handlebars
            .render(TEMPLATE_NAME, ctx)
            .map_err(|e| AppError::Prompt(format!("Failed to render template: {}", e)))?;
        let tokens = estimate_tokens(system) + estimate_tokens(&user);
        Ok((user, tokens))
    }

    /// Build the prompt for `query`.
    ///
    /// `passages` are best first; `history` is oldest first.
    ///
    /// # Errors
    /// `AppError::Validation` when the query is empty or does not fit the
    /// budget on its own.
    pub fn assemble(
        &self,
        query: &str,
        passages: &[Passage],
        history: &[HistoryTurn],
        max_context_tokens: usize,
    ) -> AppResult<AssembledPrompt> {
        if query.trim().is_empty() {
            return Err(AppError::Validation("Query must not be empty".to_string()));
        }

        // Switches to the grounded prompt once a passage is actually packed.
        let mut system = PLAIN_SYSTEM;

        let mut ctx = PromptContext {
            query,
            passages: Vec::new(),
            history: Vec::new(),
        };

        let (mut user, mut tokens) = self.render(system, &ctx)?;
        if tokens > max_context_tokens {
            return Err(AppError::Validation(format!(
                "Query needs {} tokens with the prompt template, budget is {}",
                tokens, max_context_tokens
            )));
        }

        for (rank, passage) in passages.iter().enumerate() {
            ctx.passages.push(TaggedPassage {
                tag: format!("S{}", rank + 1),
                document_id: &passage.document_id,
                text: &passage.text,
            });
            let (candidate, candidate_tokens) = self.render(GROUNDED_SYSTEM, &ctx)?;
            if candidate_tokens > max_context_tokens {
                ctx.passages.pop();
                break;
            }
            system = GROUNDED_SYSTEM;
            user = candidate;
            tokens = candidate_tokens;
        }

        for turn in history.iter().rev() {
            ctx.history.insert(
                0,
                RenderedTurn {
                    role: turn.role.as_str(),
                    text: &turn.text,
                },
            );
            let (candidate, candidate_tokens) = self.render(system, &ctx)?;
            if candidate_tokens > max_context_tokens {
                ctx.history.remove(0);
                break;
            }
            user = candidate;
            tokens = candidate_tokens;
        }

        let references: Vec<PassageRef> = passages
            .iter()
            .zip(&ctx.passages)
            .map(|(passage, tagged)| PassageRef {
                tag: tagged.tag.clone(),
                chunk_id: passage.chunk_id.clone(),
                document_id: passage.document_id.clone(),
                score: passage.score,
            })
            .collect();

        tracing::debug!(
            passages = references.len(),
            dropped = passages.len() - references.len(),
            history = ctx.history.len(),
            tokens,
            budget = max_context_tokens,
            "Assembled prompt"
        );

        Ok(AssembledPrompt {
            system: system.to_string(),
            user,
            passages_dropped: passages.len() - references.len(),
            history_included: ctx.history.len(),
            references,
            estimated_tokens: tokens,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Role;

    fn passage(i: usize, text: &str) -> Passage {
        Passage {
            chunk_id: format!("chunk-{}", i),
            document_id: format!("doc-{}", i),
            text: text.to_string(),
            score: 1.0 - i as f32 * 0.1,
        }
    }

    fn history(n: usize) -> Vec<HistoryTurn> {
        (0..n)
            .map(|i| {
                let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
                HistoryTurn::new(role, format!("turn{} {}", i, "y".repeat(200)))
            })
            .collect()
    }

    #[test]
    fn test_tags_follow_rank_order() {
        let assembler = ContextAssembler::new(None).unwrap();
        let passages = vec![passage(0, "alpha"), passage(1, "beta")];
        let prompt = assembler
            .assemble("What is alpha?", &passages, &[], 2048)
            .unwrap();

        assert!(prompt.user.contains("[S1] alpha"));
        assert!(prompt.user.contains("[S2] beta"));
        assert!(prompt.user.contains("Question: What is alpha?"));
        assert_eq!(prompt.references[1].chunk_id, "chunk-1");
        assert_eq!(prompt.system, GROUNDED_SYSTEM);
    }

    #[test]
    fn test_lowest_ranked_passages_dropped_first() {
        let assembler = ContextAssembler::new(None).unwrap();
        let passages: Vec<Passage> = (0..3).map(|i| passage(i, &"x".repeat(400))).collect();

        let full = assembler.assemble("q?", &passages, &[], 10_000).unwrap();
        assert_eq!(full.references.len(), 3);

        let budget = full.estimated_tokens - 50;
        let trimmed = assembler.assemble("q?", &passages, &[], budget).unwrap();
        let tags: Vec<&str> = trimmed.references.iter().map(|r| r.tag.as_str()).collect();
        assert_eq!(tags, vec!["S1", "S2"]);
        assert_eq!(trimmed.passages_dropped, 1);
        assert!(trimmed.estimated_tokens <= budget);
    }

    #[test]
    fn test_oldest_history_dropped_first_and_rendered_in_order() {
        let assembler = ContextAssembler::new(None).unwrap();
        let turns = history(4);

        let full = assembler.assemble("q?", &[], &turns, 10_000).unwrap();
        assert_eq!(full.history_included, 4);

        let trimmed = assembler
            .assemble("q?", &[], &turns, full.estimated_tokens - 30)
            .unwrap();
        assert_eq!(trimmed.history_included, 3);
        assert!(!trimmed.user.contains("turn0"));

        let p1 = trimmed.user.find("turn1").unwrap();
        let p2 = trimmed.user.find("turn2").unwrap();
        let p3 = trimmed.user.find("turn3").unwrap();
        assert!(p1 < p2 && p2 < p3);
        assert!(trimmed.user.contains("assistant: turn1"));
    }

    #[test]
    fn test_passages_take_priority_over_history() {
        let assembler = ContextAssembler::new(None).unwrap();
        let passages = vec![passage(0, &"x".repeat(400))];
        let only_passage = assembler.assemble("q?", &passages, &[], 10_000).unwrap();

        let prompt = assembler
            .assemble("q?", &passages, &history(2), only_passage.estimated_tokens + 10)
            .unwrap();
        assert_eq!(prompt.references.len(), 1);
        assert_eq!(prompt.history_included, 0);
    }

    #[test]
    fn test_query_alone_over_budget_is_rejected() {
        let assembler = ContextAssembler::new(None).unwrap();
        let err = assembler
            .assemble(&"q".repeat(1000), &[passage(0, "a")], &[], 100)
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert!(assembler.assemble("  ", &[], &[], 100).is_err());
    }

    #[test]
    fn test_custom_template() {
        let assembler =
            ContextAssembler::new(Some("{{#each passages}}<{{tag}}:{{document_id}}>{{/each}} {{query}}"))
                .unwrap();
        let prompt = assembler
            .assemble("why?", &[passage(3, "text")], &[], 2048)
            .unwrap();
        assert_eq!(prompt.user, "<S1:doc-3> why?");
    }

    #[test]
    fn test_invalid_template_is_prompt_error() {
        let result = ContextAssembler::new(Some("{{#each passages}}unclosed"));
        assert!(matches!(result, Err(AppError::Prompt(_))));
    }

    #[test]
    fn test_plain_system_when_no_passage_fits() {
        let assembler = ContextAssembler::new(None).unwrap();
        let bare = assembler.assemble("hello", &[], &[], 2048).unwrap();

        let prompt = assembler
            .assemble("hello", &[passage(0, &"x".repeat(2000))], &[], bare.estimated_tokens + 5)
            .unwrap();
        assert!(prompt.references.is_empty());
        assert_eq!(prompt.passages_dropped, 1);
        assert_eq!(prompt.system, PLAIN_SYSTEM);
        assert!(prompt.estimated_tokens <= bare.estimated_tokens + 5);
    }

    #[test]
    fn test_no_passages_uses_plain_system() {
        let assembler = ContextAssembler::new(None).unwrap();
        let prompt = assembler.assemble("hello", &[], &[], 2048).unwrap();
        assert_eq!(prompt.system, PLAIN_SYSTEM);
        assert!(prompt.references.is_empty());
        assert!(!prompt.user.contains("Sources:"));
    }
}
