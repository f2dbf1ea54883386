//! Answer synthesis over retrieved nodes.
//!
//! Two modes are supported:
//!
//! - **Compact**: every retrieved chunk is packed into one context block, bounded by the context
//!   window, and answered with a single generation call.
//! - **Refine**: the first chunk produces an initial answer; each following chunk is folded in
//!   with a refine pass that may only add to the answer. When streaming, the earlier passes run
//!   to completion and only the last pass streams.
//!
//! Both the streaming and non-streaming paths build the final prompt through the same code, so
//! they agree on the answer text for the same node set.

pub mod prompts;

use std::sync::Arc;

use async_stream::stream;
use futures_util::StreamExt;
use tiktoken_rs::{CoreBPE, cl100k_base};
use tokio::sync::mpsc;

use crate::generation::{GenerationClient, GenerationError, TokenStream};
use crate::index::RetrievedNode;

use prompts::{NO_CONTEXT_ANSWER, NO_RESULTS_ACROSS_DOMAINS};

const STREAM_BUFFER: usize = 32;
const CHUNK_SEPARATOR: &str = "\n\n";

/// How retrieved nodes are turned into an answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SynthesisMode {
    /// One generation call over a single packed context block.
    Compact,
    /// One generation pass per node, each augmenting the previous answer.
    Refine,
}

impl SynthesisMode {
    /// Fixed answer used when there is nothing to synthesize from.
    pub fn empty_answer(self) -> &'static str {
        match self {
            Self::Compact => NO_CONTEXT_ANSWER,
            Self::Refine => NO_RESULTS_ACROSS_DOMAINS,
        }
    }
}

enum Tokenizer {
    Bpe(CoreBPE),
    Whitespace,
}

/// Token accounting for prompt context, using `cl100k_base` when available.
pub struct ContextBudget {
    max_tokens: usize,
    tokenizer: Tokenizer,
}

impl ContextBudget {
    /// Budget of `max_tokens` per prompt.
    pub fn new(max_tokens: usize) -> Self {
        let tokenizer = match cl100k_base() {
            Ok(bpe) => Tokenizer::Bpe(bpe),
            Err(error) => {
                tracing::warn!(
                    error = %error,
                    "Tokenizer unavailable; falling back to whitespace counting for context budget"
                );
                Tokenizer::Whitespace
            }
        };
        Self {
            max_tokens,
            tokenizer,
        }
    }

    /// Maximum tokens per prompt.
    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    /// Token count of `text`.
    pub fn count(&self, text: &str) -> usize {
        match &self.tokenizer {
            Tokenizer::Bpe(bpe) => bpe.encode_ordinary(text).len(),
            Tokenizer::Whitespace => text.split_whitespace().count(),
        }
    }

    /// Leading part of `text` that fits in `limit` tokens.
    pub fn truncate(&self, text: &str, limit: usize) -> String {
        match &self.tokenizer {
            Tokenizer::Bpe(bpe) => {
                let tokens = bpe.encode_ordinary(text);
                if tokens.len() <= limit {
                    return text.to_string();
                }
                bpe.decode(tokens[..limit].to_vec())
                    .unwrap_or_else(|_| truncate_words(text, limit))
            }
            Tokenizer::Whitespace => truncate_words(text, limit),
        }
    }

    /// Join `texts` in order into one block that fits in `limit` tokens.
    ///
    /// Whole texts are kept while they fit; a first text that alone exceeds the limit is cut.
    pub fn pack<'a>(&self, texts: impl IntoIterator<Item = &'a str>, limit: usize) -> String {
        let separator = self.count(CHUNK_SEPARATOR);
        let mut used = 0;
        let mut parts: Vec<String> = Vec::new();
        for text in texts {
            let cost = self.count(text) + if parts.is_empty() { 0 } else { separator };
            if used + cost <= limit {
                used += cost;
                parts.push(text.to_string());
            } else {
                if parts.is_empty() {
                    parts.push(self.truncate(text, limit));
                }
                break;
            }
        }
        parts.join(CHUNK_SEPARATOR)
    }
}

fn truncate_words(text: &str, limit: usize) -> String {
    text.split_whitespace()
        .take(limit)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Generates answers from retrieved nodes with an injected generation capability.
#[derive(Clone)]
pub struct Synthesizer {
    generator: Arc<dyn GenerationClient>,
    budget: Arc<ContextBudget>,
}

impl Synthesizer {
    /// Synthesizer generating through `generator` with prompts bounded by `context_window_tokens`.
    pub fn new(generator: Arc<dyn GenerationClient>, context_window_tokens: usize) -> Self {
        Self {
            generator,
            budget: Arc::new(ContextBudget::new(context_window_tokens)),
        }
    }

    /// Produce the complete answer for `question` over `nodes`.
    ///
    /// An empty node set yields the mode's fixed answer without calling the generator.
    pub async fn synthesize(
        &self,
        mode: SynthesisMode,
        question: &str,
        nodes: &[RetrievedNode],
    ) -> Result<String, GenerationError> {
        match self.final_prompt(mode, question, nodes).await? {
            Some(prompt) => self.generator.complete(&prompt).await,
            None => Ok(mode.empty_answer().to_string()),
        }
    }

    /// Produce the answer as a stream of text increments.
    ///
    /// Production runs on its own task and reaches the caller through a bounded channel. A
    /// generation failure is yielded as the last item; the stream always ends afterwards.
    pub fn stream(
        &self,
        mode: SynthesisMode,
        question: String,
        nodes: Vec<RetrievedNode>,
    ) -> TokenStream {
        let (sender, mut receiver) = mpsc::channel(STREAM_BUFFER);
        let synthesizer = self.clone();
        tokio::spawn(async move {
            synthesizer.produce(mode, &question, &nodes, sender).await;
        });

        Box::pin(stream! {
            while let Some(item) = receiver.recv().await {
                yield item;
            }
        })
    }

    async fn produce(
        &self,
        mode: SynthesisMode,
        question: &str,
        nodes: &[RetrievedNode],
        sender: mpsc::Sender<Result<String, GenerationError>>,
    ) {
        let prompt = match self.final_prompt(mode, question, nodes).await {
            Ok(Some(prompt)) => prompt,
            Ok(None) => {
                let _ = sender.send(Ok(mode.empty_answer().to_string())).await;
                return;
            }
            Err(error) => {
                let _ = sender.send(Err(error)).await;
                return;
            }
        };

        let mut tokens = match self.generator.stream(&prompt).await {
            Ok(tokens) => tokens,
            Err(error) => {
                let _ = sender.send(Err(error)).await;
                return;
            }
        };

        while let Some(item) = tokens.next().await {
            let failed = item.is_err();
            if sender.send(item).await.is_err() {
                tracing::debug!("Answer stream consumer went away; stopping generation");
                return;
            }
            if failed {
                return;
            }
        }
    }

    /// Prompt of the last generation pass, running any earlier refine passes to completion.
    ///
    /// Returns `None` when `nodes` is empty.
    pub async fn final_prompt(
        &self,
        mode: SynthesisMode,
        question: &str,
        nodes: &[RetrievedNode],
    ) -> Result<Option<String>, GenerationError> {
        let Some((first, rest)) = nodes.split_first() else {
            return Ok(None);
        };

        match mode {
            SynthesisMode::Compact => {
                let limit = self.context_limit(&prompts::compact_prompt(question, ""));
                let context = self
                    .budget
                    .pack(nodes.iter().map(|node| node.chunk.text.as_str()), limit);
                Ok(Some(prompts::compact_prompt(question, &context)))
            }
            SynthesisMode::Refine => {
                let limit = self.context_limit(&prompts::initial_prompt(question, ""));
                let mut prompt =
                    prompts::initial_prompt(question, &self.budget.truncate(&first.chunk.text, limit));
                for (pass, node) in rest.iter().enumerate() {
                    let answer = self.generator.complete(&prompt).await?;
                    tracing::debug!(pass = pass + 1, total = nodes.len(), "Refine pass completed");
                    let limit = self.context_limit(&prompts::refine_prompt(question, &answer, ""));
                    let context = self.budget.truncate(&node.chunk.text, limit);
                    prompt = prompts::refine_prompt(question, &answer, &context);
                }
                Ok(Some(prompt))
            }
        }
    }

    fn context_limit(&self, template: &str) -> usize {
        self.budget
            .max_tokens()
            .saturating_sub(self.budget.count(template))
            .max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::Chunk;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Answers every prompt with `answer-<n>` and records what it was asked.
    #[derive(Default)]
    struct ScriptedGenerator {
        prompts: Mutex<Vec<String>>,
        streamed: Mutex<Vec<String>>,
        fail_stream_after: Option<usize>,
    }

    impl ScriptedGenerator {
        fn answer_for(&self, prompt: &str) -> String {
            let mut prompts = self.prompts.lock().unwrap();
            prompts.push(prompt.to_string());
            format!("answer {} words", prompts.len())
        }

        fn calls(&self) -> usize {
            self.prompts.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl GenerationClient for ScriptedGenerator {
        async fn complete(&self, prompt: &str) -> Result<String, GenerationError> {
            Ok(self.answer_for(prompt))
        }

        async fn stream(&self, prompt: &str) -> Result<TokenStream, GenerationError> {
            self.streamed.lock().unwrap().push(prompt.to_string());
            let answer = self.answer_for(prompt);
            let mut pieces: Vec<Result<String, GenerationError>> = answer
                .split_inclusive(' ')
                .map(|piece| Ok(piece.to_string()))
                .collect();
            if let Some(limit) = self.fail_stream_after {
                pieces.truncate(limit);
                pieces.push(Err(GenerationError::GenerationFailed("model crashed".into())));
            }
            Ok(Box::pin(futures_util::stream::iter(pieces)))
        }
    }

    fn node(filename: &str, page: usize, text: &str) -> RetrievedNode {
        RetrievedNode {
            chunk: Chunk::new("docs", filename, page, text.to_string()),
            score: 0.5,
            source_domain: None,
        }
    }

    async fn collect(stream: TokenStream) -> (String, Option<GenerationError>) {
        let mut text = String::new();
        let mut stream = stream;
        while let Some(item) = stream.next().await {
            match item {
                Ok(piece) => text.push_str(&piece),
                Err(error) => return (text, Some(error)),
            }
        }
        (text, None)
    }

    #[tokio::test]
    async fn empty_nodes_skip_generation() {
        let generator = Arc::new(ScriptedGenerator::default());
        let synthesizer = Synthesizer::new(generator.clone(), 4096);

        let compact = synthesizer
            .synthesize(SynthesisMode::Compact, "q", &[])
            .await
            .expect("answer");
        let refine = synthesizer
            .synthesize(SynthesisMode::Refine, "q", &[])
            .await
            .expect("answer");
        let (streamed, error) = collect(synthesizer.stream(SynthesisMode::Refine, "q".into(), vec![])).await;

        assert_eq!(compact, NO_CONTEXT_ANSWER);
        assert_eq!(refine, NO_RESULTS_ACROSS_DOMAINS);
        assert_eq!(streamed, NO_RESULTS_ACROSS_DOMAINS);
        assert!(error.is_none());
        assert_eq!(generator.calls(), 0);
    }

    #[tokio::test]
    async fn compact_mode_issues_one_call_with_all_context() {
        let generator = Arc::new(ScriptedGenerator::default());
        let synthesizer = Synthesizer::new(generator.clone(), 4096);
        let nodes = vec![node("a.pdf", 0, "alpha facts"), node("b.pdf", 2, "beta facts")];

        let answer = synthesizer
            .synthesize(SynthesisMode::Compact, "what?", &nodes)
            .await
            .expect("answer");

        assert_eq!(answer, "answer 1 words");
        let prompts = generator.prompts.lock().unwrap();
        assert_eq!(prompts.len(), 1);
        assert!(prompts[0].contains("alpha facts\n\nbeta facts"));
    }

    #[tokio::test]
    async fn refine_mode_folds_each_node_into_previous_answer() {
        let generator = Arc::new(ScriptedGenerator::default());
        let synthesizer = Synthesizer::new(generator.clone(), 4096);
        let nodes = vec![
            node("a.pdf", 0, "first context"),
            node("b.pdf", 0, "second context"),
            node("c.pdf", 0, "third context"),
        ];

        let answer = synthesizer
            .synthesize(SynthesisMode::Refine, "what?", &nodes)
            .await
            .expect("answer");

        assert_eq!(answer, "answer 3 words");
        let prompts = generator.prompts.lock().unwrap();
        assert_eq!(prompts.len(), 3);
        assert!(prompts[0].contains("first context"));
        assert!(prompts[1].contains("answer 1 words") && prompts[1].contains("second context"));
        assert!(prompts[2].contains("answer 2 words") && prompts[2].contains("third context"));
    }

    #[tokio::test]
    async fn refine_stream_only_streams_the_last_pass() {
        let generator = Arc::new(ScriptedGenerator::default());
        let synthesizer = Synthesizer::new(generator.clone(), 4096);
        let nodes = vec![node("a.pdf", 0, "one"), node("b.pdf", 0, "two")];

        let (text, error) = collect(synthesizer.stream(SynthesisMode::Refine, "q".into(), nodes)).await;

        assert!(error.is_none());
        assert_eq!(text, "answer 2 words");
        let streamed = generator.streamed.lock().unwrap();
        assert_eq!(streamed.len(), 1);
        assert!(streamed[0].contains("answer 1 words") && streamed[0].contains("two"));
    }

    #[tokio::test]
    async fn streaming_and_complete_agree_on_answer_text() {
        let nodes = vec![node("a.pdf", 0, "alpha")];
        let batch = Synthesizer::new(Arc::new(ScriptedGenerator::default()), 4096)
            .synthesize(SynthesisMode::Compact, "q", &nodes)
            .await
            .expect("answer");
        let (streamed, _) = collect(
            Synthesizer::new(Arc::new(ScriptedGenerator::default()), 4096).stream(
                SynthesisMode::Compact,
                "q".into(),
                nodes,
            ),
        )
        .await;
        assert_eq!(batch, streamed);
    }

    #[tokio::test]
    async fn mid_stream_failure_is_yielded_then_stream_ends() {
        let generator = Arc::new(ScriptedGenerator {
            fail_stream_after: Some(1),
            ..ScriptedGenerator::default()
        });
        let synthesizer = Synthesizer::new(generator, 4096);
        let mut stream = synthesizer.stream(SynthesisMode::Compact, "q".into(), vec![node("a.pdf", 0, "x")]);

        assert_eq!(stream.next().await.expect("token").expect("ok"), "answer ");
        assert!(matches!(
            stream.next().await,
            Some(Err(GenerationError::GenerationFailed(_)))
        ));
        assert!(stream.next().await.is_none());
    }

    #[test]
    fn pack_keeps_whole_texts_within_budget() {
        let budget = ContextBudget {
            max_tokens: 100,
            tokenizer: Tokenizer::Whitespace,
        };
        let packed = budget.pack(["one two three", "four five", "six seven eight nine"], 6);
        assert_eq!(packed, "one two three\n\nfour five");
    }

    #[test]
    fn pack_cuts_an_oversized_first_text() {
        let budget = ContextBudget {
            max_tokens: 100,
            tokenizer: Tokenizer::Whitespace,
        };
        assert_eq!(budget.pack(["a b c d e f", "g"], 3), "a b c");
    }
}
