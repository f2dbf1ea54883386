//! Prompt templates for answer synthesis.

/// Answer returned for a single-domain question when retrieval finds nothing.
pub const NO_CONTEXT_ANSWER: &str = "No relevant content was found in this domain.";

/// Answer returned for a multi-domain question when every domain comes back empty.
pub const NO_RESULTS_ACROSS_DOMAINS: &str = "No results found across the selected domains.";

const CONTEXT_FENCE: &str = "---------------------";

/// Single-pass question-answering prompt over one domain's context block.
pub fn compact_prompt(question: &str, context: &str) -> String {
    format!(
        "You are a research assistant. Answer the question using the context below.\n\
         - Be specific: cite the numbers, names, and facts that appear in the context.\n\
         - When the context only partially covers the question, combine what is there into a full answer.\n\
         - If the context does not contain the answer, say so plainly.\n\
         - Answer directly without unnecessary hedging.\n\
         \n\
         Context:\n\
         {CONTEXT_FENCE}\n\
         {context}\n\
         {CONTEXT_FENCE}\n\
         \n\
         Question: {question}\n\
         \n\
         Answer:"
    )
}

/// Opening prompt of a refine chain over context drawn from several domains.
pub fn initial_prompt(question: &str, context: &str) -> String {
    format!(
        "You are a research assistant with access to several knowledge domains. \
         Answer the question using all of the context below.\n\
         - Be specific: cite the numbers, names, dates, and facts that appear in the context.\n\
         - Merge information from different sources into one coherent answer.\n\
         - If the context does not contain the answer, say so plainly.\n\
         - Answer directly and confidently.\n\
         \n\
         Context:\n\
         {CONTEXT_FENCE}\n\
         {context}\n\
         {CONTEXT_FENCE}\n\
         \n\
         Question: {question}\n\
         \n\
         Answer:"
    )
}

/// Follow-up prompt folding one more context block into an existing answer.
pub fn refine_prompt(question: &str, existing_answer: &str, context: &str) -> String {
    format!(
        "You are a research assistant refining an existing answer with additional context.\n\
         Add any relevant information from the new context so the answer becomes more complete and accurate.\n\
         Keep everything correct from the existing answer; only add or improve, never remove.\n\
         \n\
         Existing answer:\n\
         {existing_answer}\n\
         \n\
         Additional context:\n\
         {CONTEXT_FENCE}\n\
         {context}\n\
         {CONTEXT_FENCE}\n\
         \n\
         Question: {question}\n\
         \n\
         Refined answer:"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compact_prompt_embeds_question_and_context() {
        let prompt = compact_prompt("What is the leave policy?", "Employees get 25 days.");
        assert!(prompt.contains("Employees get 25 days."));
        assert!(prompt.contains("Question: What is the leave policy?"));
        assert!(prompt.ends_with("Answer:"));
    }

    #[test]
    fn refine_prompt_keeps_existing_answer() {
        let prompt = refine_prompt("q", "draft answer", "new facts");
        let existing = prompt.find("draft answer").expect("existing answer present");
        let context = prompt.find("new facts").expect("context present");
        assert!(existing < context);
        assert!(prompt.contains("never remove"));
    }
}
