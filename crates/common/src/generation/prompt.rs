//! Prompt assembly for reply generation

use crate::chat::Message;

/// Marker used when no reference text is available
pub const NO_CONTEXT: &str = "No additional context available";

/// Render prior turns, one `Label: content` line per message.
///
/// The last entry is the user message being answered and is left out;
/// it is placed in the prompt separately.
pub fn render_history(history: &[Message]) -> String {
    let prior = match history.split_last() {
        Some((_, prior)) => prior,
        None => return String::new(),
    };

    prior
        .iter()
        .map(|message| format!("{}: {}", message.role().label(), message.content()))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Build the single instruction sent to the language model
pub fn build_prompt(message: &str, history: &[Message], context: &str) -> String {
    let context = if context.trim().is_empty() { NO_CONTEXT } else { context };

    format!(
        "\nContext information: {}\n\n\
         Previous conversation:\n{}\n\n\
         Current user message: {}\n\n\
         Please provide a helpful response based on the above information.\n",
        context,
        render_history(history),
        message
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn history() -> Vec<Message> {
        vec![
            Message::system("I am an AI assistant that helps with property-related queries."),
            Message::user("Hi"),
            Message::assistant("Hello! How can I help?"),
            Message::user("What's the deposit policy?"),
        ]
    }

    #[test]
    fn test_history_excludes_current_message() {
        let rendered = render_history(&history());
        assert_eq!(
            rendered,
            "System: I am an AI assistant that helps with property-related queries.\n\
             User: Hi\n\
             Assistant: Hello! How can I help?"
        );
    }

    #[test]
    fn test_system_seed_is_not_labeled_assistant() {
        let rendered = render_history(&history());
        assert!(rendered.starts_with("System: "));
        assert!(!rendered.contains("Assistant: I am an AI assistant"));
    }

    #[test]
    fn test_empty_history() {
        assert_eq!(render_history(&[]), "");
        assert_eq!(render_history(&[Message::user("only")]), "");
    }

    #[test]
    fn test_prompt_layout() {
        let prompt = build_prompt("What's the deposit policy?", &history(), "Deposits are protected.");

        assert!(prompt.contains("Context information: Deposits are protected.\n"));
        assert!(prompt.contains("Previous conversation:\nSystem: "));
        assert!(prompt.contains("Current user message: What's the deposit policy?\n"));
        assert!(prompt.ends_with("based on the above information.\n"));
        // The current message appears once, not also in the history block
        assert_eq!(prompt.matches("What's the deposit policy?").count(), 1);
    }

    #[test]
    fn test_missing_context_marker() {
        let prompt = build_prompt("q", &[Message::user("q")], "  ");
        assert!(prompt.contains("Context information: No additional context available"));
    }
}
