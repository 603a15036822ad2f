//! Prompt assembly for the completion model

use crate::store::Chunk;

const GROUNDED_PREAMBLE: &str = "You are a helpful assistant that answers questions based EXCLUSIVELY on the provided context from uploaded documents.

CRITICAL INSTRUCTIONS:
1. You MUST answer the question using ONLY the information provided in the context below
2. The context comes from documents that the user has uploaded
3. If the answer can be found in the context, provide it directly from the context
4. Do NOT say the context is unrelated or not relevant - analyze it carefully
5. If the answer is truly not in the context, say \"Based on the provided context, I cannot find a direct answer to this question. However, from the context I can see: [summarize what IS in the context]\"
6. Do NOT make up information that isn't in the context
7. Quote or paraphrase specific parts of the context when answering";

const GENERAL_PREAMBLE: &str =
    "You are a helpful assistant. Answer the following question based on your knowledge.";

/// Build the completion prompt for `question`.
///
/// With context, each chunk is listed under a 1-based `[Chunk i]` label and
/// the model is told to answer only from it. Without context the prompt asks
/// for a general-knowledge answer.
pub fn build_prompt(context: &[Chunk], question: &str) -> String {
    if context.is_empty() {
        return general_prompt(question);
    }

    let context_text = context
        .iter()
        .enumerate()
        .map(|(i, chunk)| format!("[Chunk {}]\n{}", i + 1, chunk.text))
        .collect::<Vec<_>>()
        .join("\n\n");

    format!(
        "{GROUNDED_PREAMBLE}\n\nContext from uploaded documents:\n{context_text}\n\nQuestion: {question}\n\nAnswer (based ONLY on the context above):"
    )
    .trim()
    .to_string()
}

/// Prompt that asks for an answer from general knowledge
pub fn general_prompt(question: &str) -> String {
    format!("{GENERAL_PREAMBLE}\n\nQuestion: {question}\n\nAnswer:")
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(text: &str) -> Chunk {
        Chunk::new("doc.pdf", "all", "text", text)
    }

    #[test]
    fn test_grounded_prompt_labels_chunks_in_order() {
        let prompt = build_prompt(
            &[chunk("x is defined as y"), chunk("y is a letter")],
            "What is X?",
        );
        assert!(prompt.contains("[Chunk 1]\nx is defined as y\n\n[Chunk 2]\ny is a letter"));
        assert!(prompt.contains("ONLY the information provided in the context"));
        assert!(prompt.contains("I cannot find a direct answer"));
        assert!(prompt.ends_with("Question: What is X?\n\nAnswer (based ONLY on the context above):"));
    }

    #[test]
    fn test_empty_context_uses_general_template() {
        let prompt = build_prompt(&[], "What is the capital of France?");
        assert_eq!(
            prompt,
            "You are a helpful assistant. Answer the following question based on your knowledge.\n\nQuestion: What is the capital of France?\n\nAnswer:"
        );
        assert!(!prompt.contains("[Chunk"));
    }

    #[test]
    fn test_deterministic() {
        let context = [chunk("alpha")];
        assert_eq!(build_prompt(&context, "q"), build_prompt(&context, "q"));
    }
}
