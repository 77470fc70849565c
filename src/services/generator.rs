use log::{debug, error, info};
use std::time::Duration;
use thiserror::Error;

use crate::core::state::{StoryData, CHAPTER_COUNT};
use crate::services::llm::{GenerationRequest, LlmClient, LlmConfig, LlmError};
use crate::services::retry::{RetryError, RetryPolicy};
use crate::utils::text::strip_code_blocks;

const STORYTELLER_ROLE: &str = "You are a master storyteller. Reply with the chapter text only, \
    with no remarks about the writing process.";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GenerationError {
    #[error("Failed to generate story structure. Please try again.")]
    Structure { reason: String },
    #[error("Failed to generate Chapter {chapter} after {attempts} attempts due to rate limits. Please try again later.")]
    ChapterRateLimited { chapter: usize, attempts: u32 },
    #[error("Failed to generate Chapter {chapter}.")]
    Chapter { chapter: usize, reason: String },
}

/// Everything needed to write one chapter.
#[derive(Debug, Clone, Copy)]
pub struct ChapterRequest<'a> {
    /// 1-based.
    pub number: usize,
    pub outline: &'a [String],
    pub character_arcs: &'a str,
    pub previous_chapters: &'a [String],
}

pub struct StoryGenerator {
    llm: Box<dyn LlmClient>,
    structure_model: Option<String>,
    chapter_model: Option<String>,
    chapter_retry: RetryPolicy,
}

impl StoryGenerator {
    pub fn new(llm: Box<dyn LlmClient>, config: &LlmConfig) -> Self {
        Self {
            llm,
            structure_model: config.structure_model(),
            chapter_model: config.chapter_model(),
            chapter_retry: RetryPolicy::rate_limited(
                config.max_attempts,
                Duration::from_millis(config.retry_delay_ms),
            ),
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.chapter_retry = policy;
        self
    }

    pub async fn generate_structure(&self, premise: &str) -> Result<StoryData, GenerationError> {
        info!("Generating outline and character arcs");
        let request = GenerationRequest {
            model: self.structure_model.clone(),
            system: None,
            prompt: structure_prompt(premise),
            response_schema: Some(structure_schema()),
        };

        let fail = |reason: String| {
            error!("Error generating outline and arcs: {}", reason);
            GenerationError::Structure { reason }
        };

        let response = self
            .llm
            .generate(&request)
            .await
            .map_err(|e| fail(e.to_string()))?;

        let clean_json = strip_code_blocks(&response);
        let data: StoryData = serde_json::from_str(&clean_json)
            .map_err(|e| fail(format!("Failed to parse structure JSON: {}: {}", e, clean_json)))?;
        data.validate().map_err(|e| fail(e.to_string()))?;

        Ok(data)
    }

    pub async fn generate_chapter(
        &self,
        chapter: &ChapterRequest<'_>,
    ) -> Result<String, GenerationError> {
        let number = chapter.number;
        let request = GenerationRequest {
            model: self.chapter_model.clone(),
            system: Some(STORYTELLER_ROLE.to_string()),
            prompt: chapter_prompt(chapter),
            response_schema: None,
        };

        let result = self
            .chapter_retry
            .run(|attempt| {
                let request = &request;
                async move {
                    debug!("Chapter {} attempt {}", number, attempt);
                    let text = self.llm.generate(request).await?;
                    if text.trim().is_empty() {
                        return Err(LlmError::permanent("model returned an empty chapter"));
                    }
                    Ok(text)
                }
            })
            .await;

        result.map_err(|e| {
            error!("Error generating chapter {}: {}", number, e);
            match e {
                RetryError::Exhausted { attempts, .. } => GenerationError::ChapterRateLimited {
                    chapter: number,
                    attempts,
                },
                RetryError::Aborted { error, .. } => GenerationError::Chapter {
                    chapter: number,
                    reason: error.to_string(),
                },
            }
        })
    }
}

fn structure_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "outline": {
                "type": "array",
                "items": { "type": "string" },
                "description": format!(
                    "A {}-item array, where each item is a summary of a chapter.",
                    CHAPTER_COUNT
                ),
            },
            "characterArcs": {
                "type": "string",
                "description": "A detailed description of the character arcs.",
            },
        },
        "required": ["outline", "characterArcs"],
    })
}

fn structure_prompt(premise: &str) -> String {
    format!(
        "Based on the following story premise, produce a {count}-chapter outline and the arcs of the main characters.\n\
        Premise: \"{premise}\"\n\n\
        Respond in JSON with exactly two keys:\n\
        1. \"outline\": an array of {count} strings, each a concise summary of one chapter, in order.\n\
        2. \"characterArcs\": a string describing how the main characters change across the story.",
        count = CHAPTER_COUNT,
        premise = premise,
    )
}

fn numbered_outline(outline: &[String]) -> String {
    outline
        .iter()
        .enumerate()
        .map(|(i, item)| format!("{}. {}", i + 1, item))
        .collect::<Vec<_>>()
        .join("\n")
}

fn chapter_prompt(chapter: &ChapterRequest<'_>) -> String {
    let context = if chapter.previous_chapters.is_empty() {
        "This is the first chapter.".to_string()
    } else {
        chapter
            .previous_chapters
            .iter()
            .enumerate()
            .map(|(i, text)| format!("Chapter {}:\n{}", i + 1, text))
            .collect::<Vec<_>>()
            .join("\n\n---\n\n")
    };
    let focus = chapter
        .outline
        .get(chapter.number.saturating_sub(1))
        .map(String::as_str)
        .unwrap_or_default();

    format!(
        "You are writing Chapter {n} of a novel.\n\n\
        **Overall Story Outline:**\n{outline}\n\n\
        **Character Arcs to Follow:**\n{arcs}\n\n\
        **Previous Chapters:**\n{context}\n\n\
        **This Chapter's Focus (from the outline):**\n\"{focus}\"\n\n\
        Write the complete text of Chapter {n}. It must continue naturally from the previous chapters \
        and set up the rest of the outline.",
        n = chapter.number,
        outline = numbered_outline(chapter.outline),
        arcs = chapter.character_arcs,
        context = context,
        focus = focus,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::llm::LlmErrorKind;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Default)]
    struct ScriptedLlm {
        responses: Mutex<VecDeque<Result<String, LlmError>>>,
        requests: Arc<Mutex<Vec<GenerationRequest>>>,
    }

    impl ScriptedLlm {
        fn new(responses: Vec<Result<String, LlmError>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                requests: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    #[async_trait]
    impl LlmClient for ScriptedLlm {
        async fn generate(&self, request: &GenerationRequest) -> Result<String, LlmError> {
            self.requests.lock().unwrap().push(request.clone());
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(LlmError::permanent("no scripted response")))
        }
    }

    fn llm_config() -> LlmConfig {
        serde_yaml_ng::from_str("provider: gemini\ngemini:\n  api_key: test\n").unwrap()
    }

    fn generator(llm: ScriptedLlm) -> (StoryGenerator, Arc<Mutex<Vec<GenerationRequest>>>) {
        let requests = llm.requests.clone();
        (StoryGenerator::new(Box::new(llm), &llm_config()), requests)
    }

    fn structure_json() -> String {
        let outline: Vec<String> = (1..=10).map(|i| format!("Beat {}", i)).collect();
        serde_json::json!({ "outline": outline, "characterArcs": "Iris finds courage." }).to_string()
    }

    fn outline() -> Vec<String> {
        (1..=10).map(|i| format!("Beat {}", i)).collect()
    }

    #[tokio::test]
    async fn test_structure_parses_schema_response() {
        let (story_gen, requests) = generator(ScriptedLlm::new(vec![Ok(structure_json())]));

        let data = story_gen
            .generate_structure("A librarian discovers a hidden book")
            .await
            .unwrap();

        assert_eq!(data.outline.len(), 10);
        assert_eq!(data.outline[0], "Beat 1");
        assert_eq!(data.character_arcs, "Iris finds courage.");

        let requests = requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].prompt.contains("A librarian discovers a hidden book"));
        let schema = requests[0].response_schema.as_ref().unwrap();
        assert_eq!(schema["properties"]["outline"]["type"], "array");
        assert_eq!(schema["properties"]["characterArcs"]["type"], "string");
    }

    #[tokio::test]
    async fn test_structure_tolerates_code_fences() {
        let fenced = format!("```json\n{}\n```", structure_json());
        let (story_gen, _) = generator(ScriptedLlm::new(vec![Ok(fenced)]));

        assert!(story_gen.generate_structure("premise").await.is_ok());
    }

    #[tokio::test]
    async fn test_structure_rejects_wrong_outline_length() {
        let json = serde_json::json!({ "outline": ["only one"], "characterArcs": "x" }).to_string();
        let (story_gen, _) = generator(ScriptedLlm::new(vec![Ok(json)]));

        let err = story_gen.generate_structure("premise").await.unwrap_err();
        assert!(matches!(err, GenerationError::Structure { .. }));
        assert_eq!(
            err.to_string(),
            "Failed to generate story structure. Please try again."
        );
    }

    #[tokio::test]
    async fn test_structure_rejects_malformed_json() {
        let (story_gen, _) = generator(ScriptedLlm::new(vec![Ok("not json".to_string())]));

        let err = story_gen.generate_structure("premise").await.unwrap_err();
        match err {
            GenerationError::Structure { reason } => assert!(reason.contains("not json")),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_structure_never_retries_rate_limits() {
        let (story_gen, requests) = generator(ScriptedLlm::new(vec![
            Err(LlmError::rate_limited("429")),
            Ok(structure_json()),
        ]));

        let err = story_gen.generate_structure("premise").await.unwrap_err();
        assert!(matches!(err, GenerationError::Structure { .. }));
        assert_eq!(requests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_chapter_prompt_for_first_chapter() {
        let (story_gen, requests) = generator(ScriptedLlm::new(vec![Ok("It began.".to_string())]));
        let outline = outline();

        let text = story_gen
            .generate_chapter(&ChapterRequest {
                number: 1,
                outline: &outline,
                character_arcs: "Iris finds courage.",
                previous_chapters: &[],
            })
            .await
            .unwrap();

        assert_eq!(text, "It began.");
        let requests = requests.lock().unwrap();
        let request = &requests[0];
        assert_eq!(request.model.as_deref(), Some("gemini-2.5-pro"));
        assert!(request.response_schema.is_none());
        assert!(request
            .system
            .as_deref()
            .unwrap()
            .starts_with("You are a master storyteller."));
        assert!(request.prompt.contains("Chapter 1 of a novel"));
        assert!(request.prompt.contains("This is the first chapter."));
        assert!(request.prompt.contains("10. Beat 10"));
        assert!(request.prompt.contains("\"Beat 1\""));
    }

    #[tokio::test]
    async fn test_chapter_prompt_embeds_previous_chapters_in_order() {
        let (story_gen, requests) = generator(ScriptedLlm::new(vec![Ok("Third.".to_string())]));
        let outline = outline();
        let previous = vec!["First text.".to_string(), "Second text.".to_string()];

        story_gen.generate_chapter(&ChapterRequest {
            number: 3,
            outline: &outline,
            character_arcs: "arcs",
            previous_chapters: &previous,
        })
        .await
        .unwrap();

        let prompt = requests.lock().unwrap()[0].prompt.clone();
        let first = prompt.find("Chapter 1:\nFirst text.").unwrap();
        let second = prompt.find("Chapter 2:\nSecond text.").unwrap();
        assert!(first < second);
        assert!(prompt.contains("\"Beat 3\""));
        assert!(!prompt.contains("This is the first chapter."));
    }

    #[tokio::test(start_paused = true)]
    async fn test_chapter_retries_rate_limits_then_succeeds() {
        let (story_gen, requests) = generator(ScriptedLlm::new(vec![
            Err(LlmError::rate_limited("429 Too Many Requests")),
            Err(LlmError::rate_limited("RESOURCE_EXHAUSTED")),
            Ok("Finally.".to_string()),
        ]));
        let outline = outline();

        let text = story_gen
            .generate_chapter(&ChapterRequest {
                number: 4,
                outline: &outline,
                character_arcs: "arcs",
                previous_chapters: &[],
            })
            .await
            .unwrap();

        assert_eq!(text, "Finally.");
        assert_eq!(requests.lock().unwrap().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_chapter_rate_limit_exhaustion() {
        let (story_gen, requests) = generator(ScriptedLlm::new(vec![
            Err(LlmError::rate_limited("429")),
            Err(LlmError::rate_limited("429")),
            Err(LlmError::rate_limited("429")),
            Ok("never reached".to_string()),
        ]));
        let outline = outline();

        let err = story_gen
            .generate_chapter(&ChapterRequest {
                number: 5,
                outline: &outline,
                character_arcs: "arcs",
                previous_chapters: &[],
            })
            .await
            .unwrap_err();

        assert_eq!(
            err,
            GenerationError::ChapterRateLimited {
                chapter: 5,
                attempts: 3
            }
        );
        assert!(err.to_string().contains("Chapter 5"));
        assert!(err.to_string().contains("rate limits"));
        assert_eq!(requests.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_chapter_other_error_fails_without_retry() {
        let (story_gen, requests) = generator(ScriptedLlm::new(vec![
            Err(LlmError::new(LlmErrorKind::Permanent, "400 bad request")),
            Ok("never reached".to_string()),
        ]));
        let outline = outline();

        let err = story_gen
            .generate_chapter(&ChapterRequest {
                number: 2,
                outline: &outline,
                character_arcs: "arcs",
                previous_chapters: &[],
            })
            .await
            .unwrap_err();

        assert!(matches!(err, GenerationError::Chapter { chapter: 2, .. }));
        assert_eq!(err.to_string(), "Failed to generate Chapter 2.");
        assert_eq!(requests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_chapter_is_a_failure() {
        let (story_gen, _) = generator(ScriptedLlm::new(vec![Ok("   ".to_string())]));
        let outline = outline();

        let err = story_gen
            .generate_chapter(&ChapterRequest {
                number: 1,
                outline: &outline,
                character_arcs: "arcs",
                previous_chapters: &[],
            })
            .await
            .unwrap_err();

        assert!(matches!(err, GenerationError::Chapter { chapter: 1, .. }));
    }
}
