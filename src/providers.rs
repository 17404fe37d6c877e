//! External collaborator contracts.
//!
//! The pipeline only ever talks to the model, the validator and the image
//! service through the narrow traits below. The shipped implementations are
//! deliberately thin adapters; production deployments swap their own in.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

// ── Contract types ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl TokenUsage {
    /// Sum of two accounting records, used when a run spans the original
    /// generation and an auto-fix attempt.
    pub fn add(self, other: TokenUsage) -> TokenUsage {
        TokenUsage {
            prompt_tokens: self.prompt_tokens + other.prompt_tokens,
            completion_tokens: self.completion_tokens + other.completion_tokens,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GeneratorOutput {
    pub code: String,
    pub usage: TokenUsage,
}

#[derive(Debug, Clone, Default)]
pub struct Validation {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageAsset {
    pub url: String,
    pub alt: String,
}

/// Context assembled before generation. Currently the best-effort image set;
/// empty when imaging is skipped or failed.
#[derive(Debug, Clone, Default)]
pub struct GenerationContext {
    pub images: Vec<ImageAsset>,
}

/// Sink for partial code as the generator produces it.
pub type ChunkSink<'a> = &'a (dyn Fn(&str) + Send + Sync);

// ── Traits ────────────────────────────────────────────────────────────

/// Produces lesson code from an outline, streaming partial text through the
/// sink as it becomes available. Assumed to fail transiently; the pipeline's
/// retry policy exists to absorb that.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(
        &self,
        outline: &str,
        ctx: &GenerationContext,
        on_chunk: ChunkSink<'_>,
    ) -> Result<GeneratorOutput>;
}

/// Regenerates code given the invalid output and the validator's error list.
/// Invoked at most once per run.
#[async_trait]
pub trait CorrectiveGenerator: Send + Sync {
    async fn fix(
        &self,
        code: &str,
        errors: &[String],
        ctx: &GenerationContext,
    ) -> Result<GeneratorOutput>;
}

/// Language-level correctness check. Pure and synchronous.
pub trait Validator: Send + Sync {
    fn validate(&self, code: &str) -> Validation;
}

/// Best-effort illustration lookup. Failures are logged and swallowed by the
/// pipeline; imaging must never fail a job.
#[async_trait]
pub trait ImageProvider: Send + Sync {
    async fn fetch(&self, outline: &str) -> Result<Vec<ImageAsset>>;
}

// ── OpenAI-compatible adapter ─────────────────────────────────────────

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: String,
}

#[derive(Deserialize, Default)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

/// Adapter for any OpenAI-compatible chat-completions endpoint. Implements
/// both the primary and the corrective generator contracts.
pub struct OpenAiGenerator {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiGenerator {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }

    async fn complete(&self, system: &str, user: String) -> Result<GeneratorOutput> {
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system.to_string(),
                },
                ChatMessage {
                    role: "user",
                    content: user,
                },
            ],
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url.trim_end_matches('/')))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .context("Model request failed")?
            .error_for_status()
            .context("Model returned an error status")?
            .json::<ChatResponse>()
            .await
            .context("Failed to decode model response")?;

        let code = response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .context("Model response had no choices")?;
        let usage = response.usage.unwrap_or_default();

        Ok(GeneratorOutput {
            code,
            usage: TokenUsage {
                prompt_tokens: usage.prompt_tokens,
                completion_tokens: usage.completion_tokens,
            },
        })
    }

    fn image_context(ctx: &GenerationContext) -> String {
        if ctx.images.is_empty() {
            String::new()
        } else {
            let list: Vec<String> = ctx
                .images
                .iter()
                .map(|img| format!("- {} ({})", img.url, img.alt))
                .collect();
            format!("\n\nAvailable images:\n{}", list.join("\n"))
        }
    }
}

const GENERATE_SYSTEM: &str = "You write a single self-contained interactive \
lesson as runnable code. Respond with code only, no prose and no fences.";

const FIX_SYSTEM: &str = "You repair lesson code so it passes validation. \
Respond with the full corrected code only, no prose and no fences.";

#[async_trait]
impl Generator for OpenAiGenerator {
    async fn generate(
        &self,
        outline: &str,
        ctx: &GenerationContext,
        on_chunk: ChunkSink<'_>,
    ) -> Result<GeneratorOutput> {
        let prompt = format!("Lesson outline:\n{}{}", outline, Self::image_context(ctx));
        let output = self.complete(GENERATE_SYSTEM, prompt).await?;
        // Non-streaming endpoint: the whole buffer arrives as one chunk.
        on_chunk(&output.code);
        Ok(output)
    }
}

#[async_trait]
impl CorrectiveGenerator for OpenAiGenerator {
    async fn fix(
        &self,
        code: &str,
        errors: &[String],
        ctx: &GenerationContext,
    ) -> Result<GeneratorOutput> {
        let prompt = format!(
            "The following lesson code failed validation.\n\nErrors:\n{}\n\nCode:\n{}{}",
            errors.join("\n"),
            code,
            Self::image_context(ctx),
        );
        self.complete(FIX_SYSTEM, prompt).await
    }
}

// ── Structural validator ──────────────────────────────────────────────

/// Structural gate used as the default validator: non-empty output with
/// balanced brackets. The real language-level validator is an external
/// service behind the same trait.
#[derive(Default)]
pub struct DelimiterValidator;

impl Validator for DelimiterValidator {
    fn validate(&self, code: &str) -> Validation {
        let mut errors = Vec::new();
        if code.trim().is_empty() {
            errors.push("generated code is empty".to_string());
        }

        let mut stack: Vec<(char, usize)> = Vec::new();
        for (idx, ch) in code.char_indices() {
            match ch {
                '(' | '[' | '{' => stack.push((ch, idx)),
                ')' | ']' | '}' => {
                    let expected = match ch {
                        ')' => '(',
                        ']' => '[',
                        _ => '{',
                    };
                    match stack.pop() {
                        Some((open, _)) if open == expected => {}
                        Some((open, at)) => {
                            errors.push(format!(
                                "mismatched delimiter: '{}' opened at byte {} closed by '{}' at byte {}",
                                open, at, ch, idx
                            ));
                        }
                        None => {
                            errors.push(format!("unmatched '{}' at byte {}", ch, idx));
                        }
                    }
                }
                _ => {}
            }
        }
        for (open, at) in stack {
            errors.push(format!("unclosed '{}' opened at byte {}", open, at));
        }

        Validation {
            is_valid: errors.is_empty(),
            errors,
            warnings: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_sums_across_attempts() {
        let first = TokenUsage {
            prompt_tokens: 100,
            completion_tokens: 40,
        };
        let second = TokenUsage {
            prompt_tokens: 60,
            completion_tokens: 25,
        };
        let total = first.add(second);
        assert_eq!(total.prompt_tokens, 160);
        assert_eq!(total.completion_tokens, 65);
    }

    #[test]
    fn test_validator_accepts_balanced_code() {
        let validation = DelimiterValidator.validate("fn main() { let x = [1, 2]; }");
        assert!(validation.is_valid);
        assert!(validation.errors.is_empty());
    }

    #[test]
    fn test_validator_rejects_empty_code() {
        let validation = DelimiterValidator.validate("   \n");
        assert!(!validation.is_valid);
        assert_eq!(validation.errors.len(), 1);
        assert!(validation.errors[0].contains("empty"));
    }

    #[test]
    fn test_validator_reports_unclosed_delimiter() {
        let validation = DelimiterValidator.validate("fn main() {");
        assert!(!validation.is_valid);
        assert!(validation.errors[0].contains("unclosed '{'"));
    }

    #[test]
    fn test_validator_reports_mismatched_delimiter() {
        let validation = DelimiterValidator.validate("(]");
        assert!(!validation.is_valid);
        assert!(validation.errors[0].contains("mismatched"));
    }

    #[test]
    fn test_chat_response_decodes_with_missing_usage() {
        let json = r#"{"choices":[{"message":{"content":"let x = 1;"}}]}"#;
        let response: ChatResponse = serde_json::from_str(json).unwrap();
        assert_eq!(response.choices[0].message.content, "let x = 1;");
        assert!(response.usage.is_none());
    }
}
