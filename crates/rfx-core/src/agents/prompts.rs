use std::fmt::Write as _;

use crate::links::LinkReport;
use crate::session::Exchange;

use super::{Answer, CheckVerdict};

pub(crate) fn answerer_instruction(focus: &str) -> String {
    format!(
        "You answer questions from RFP, RFQ and RFI questionnaires on behalf of {focus}.\n\
         Answer from the perspective of {focus}.\n\
         Always call the web_search tool before answering and base every claim on what it returns; \
         do not rely on prior knowledge alone.\n\
         Cite the full URL of every page that supports the answer.\n\
         If the search finds nothing reliable on the topic, say that no information is available \
         on that topic instead of inventing an answer or a link."
    )
}

pub(crate) fn answer_checker_instruction(focus: &str) -> String {
    format!(
        "You verify answers about {focus}. Your reply always starts with the words \
         ANSWER CORRECT or ANSWER INCORRECT.\n\
         Judge only the most recent answer you are shown. Look for factual errors, outdated \
         information, misleading statements, missing details that matter to the question and \
         technical inaccuracies specific to {focus}.\n\
         If anything is wrong reply ANSWER INCORRECT followed by a precise explanation of what \
         must change. Otherwise reply ANSWER CORRECT."
    )
}

pub(crate) fn manager_instruction() -> String {
    "You are the manager who gives final sign-off on an answer before it is sent.\n\
     You are shown the question, the answer, the answer checker's verdict and the link check result.\n\
     Reply with the single word APPROVE only when the answer checker said ANSWER CORRECT, the link \
     check said LINKS CORRECT and the answer fully addresses the question.\n\
     Otherwise reply reject, followed by one short paragraph that combines the outstanding \
     objections into concrete revision instructions."
        .to_string()
}

/// The user message for the Answerer, including recent session history and revision feedback.
pub(crate) fn answerer_request(
    question: &str,
    history: &[Exchange<'_>],
    previous: Option<&Answer>,
    feedback: Option<&str>,
) -> String {
    let mut request = String::new();
    if !history.is_empty() {
        request.push_str("Earlier questions and answers in this questionnaire:\n");
        for (index, exchange) in history.iter().enumerate() {
            let _ = writeln!(
                request,
                "Q{n}: {q}\nA{n}: {a}",
                n = index + 1,
                q = exchange.question,
                a = exchange.answer
            );
        }
        request.push('\n');
    }
    let _ = write!(request, "Question: {question}");

    if let (Some(previous), Some(feedback)) = (previous, feedback) {
        let _ = write!(
            request,
            "\n\nYour previous answer was not accepted.\n\nPrevious answer:\n{}\n\nReviewer feedback:\n{feedback}\n\nWrite a revised answer that resolves every point of the feedback.",
            previous.text
        );
    } else if let Some(feedback) = feedback {
        let _ = write!(
            request,
            "\n\nThe previous attempt failed: {feedback}\nPlease answer the question again."
        );
    }
    request
}

pub(crate) fn answer_check_request(question: &str, answer: &Answer) -> String {
    format!("Question: {question}\n\nAnswer to verify:\n{}", answer.text)
}

pub(crate) fn manager_request(
    question: &str,
    answer: &Answer,
    answer_check: &CheckVerdict,
    links: &LinkReport,
) -> String {
    let check = if answer_check.approved {
        "ANSWER CORRECT".to_string()
    } else {
        format!("ANSWER INCORRECT {}", answer_check.feedback)
    };
    format!(
        "Question: {question}\n\nAnswer:\n{}\n\nAnswer checker: {check}\n\nLink checker: {}",
        answer.text,
        links.summary()
    )
}

pub(crate) fn search_feedback(error: &crate::error::SearchError) -> String {
    use crate::error::SearchError;
    match error {
        SearchError::NoResults => "No results were found for this query in the selected sources. \
             Try a different query, or state that no reliable source was found. Do not invent links."
            .to_string(),
        other => format!(
            "Web search failed ({other}). Answer only with information you can support, \
             state clearly that no reliable source was found, and do not invent links."
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instructions_carry_the_focus_phrase() {
        let text = answerer_instruction("Microsoft Fabric and Microsoft Copilot Studio");
        assert!(text.contains("on behalf of Microsoft Fabric and Microsoft Copilot Studio"));
        assert!(answer_checker_instruction("Microsoft Azure AI").starts_with("You verify answers about Microsoft Azure AI"));
    }

    #[test]
    fn revision_request_includes_previous_answer_and_feedback() {
        let previous = Answer::from_text("Fabric has 3 tiers. https://example.com/dead");
        let history = [Exchange {
            question: "What is Fabric?",
            answer: "An analytics platform.",
        }];
        let request = answerer_request(
            "How is it licensed?",
            &history,
            Some(&previous),
            Some("LINK INCORRECT - https://example.com/dead"),
        );
        assert!(request.contains("Q1: What is Fabric?\nA1: An analytics platform."));
        assert!(request.contains("Question: How is it licensed?"));
        assert!(request.contains("Previous answer:\nFabric has 3 tiers."));
        assert!(request.contains("https://example.com/dead"));
    }

    #[test]
    fn first_attempt_request_is_just_the_question() {
        assert_eq!(answerer_request("Q?", &[], None, None), "Question: Q?");
    }
}
