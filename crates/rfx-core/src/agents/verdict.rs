use serde::{Deserialize, Serialize};

/// Approve/reject judgment from the AnswerChecker or Manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckVerdict {
    pub approved: bool,
    pub feedback: String,
}

impl CheckVerdict {
    pub fn approve(feedback: impl Into<String>) -> Self {
        Self {
            approved: true,
            feedback: feedback.into(),
        }
    }

    pub fn reject(feedback: impl Into<String>) -> Self {
        Self {
            approved: false,
            feedback: feedback.into(),
        }
    }

    /// Fail-closed verdict for a reply that could not be interpreted.
    pub fn unparseable(reviewer: &str) -> Self {
        Self::reject(format!(
            "The {reviewer} did not return a usable verdict. Please retry: revise the answer and make sure every claim is supported by a cited source."
        ))
    }
}

/// Interpret an AnswerChecker reply: `ANSWER CORRECT` or `ANSWER INCORRECT` followed by an explanation.
pub fn parse_answer_check(reply: &str) -> CheckVerdict {
    let body = strip_decoration(reply);
    let upper = body.to_ascii_uppercase();

    if let Some(rest) = strip_keyword(body, &upper, "ANSWER INCORRECT") {
        let feedback = if rest.is_empty() {
            "The answer checker judged the answer incorrect without further detail.".to_string()
        } else {
            rest.to_string()
        };
        return CheckVerdict::reject(feedback);
    }
    if let Some(rest) = strip_keyword(body, &upper, "ANSWER CORRECT") {
        return CheckVerdict::approve(rest);
    }
    CheckVerdict::unparseable("answer checker")
}

/// Interpret a Manager reply whose first word is `APPROVE` or `reject`, in any case.
pub fn parse_manager_decision(reply: &str) -> CheckVerdict {
    let body = strip_decoration(reply);
    let word_end = body
        .find(|c: char| !c.is_ascii_alphabetic())
        .unwrap_or(body.len());
    let (word, rest) = body.split_at(word_end);
    let rest = trim_separator(rest);

    match word.to_ascii_uppercase().as_str() {
        "APPROVE" | "APPROVED" => CheckVerdict::approve(rest),
        "REJECT" | "REJECTED" => {
            let feedback = if rest.is_empty() {
                "The manager rejected the answer without further detail.".to_string()
            } else {
                rest.to_string()
            };
            CheckVerdict::reject(feedback)
        }
        _ => CheckVerdict::unparseable("manager"),
    }
}

fn strip_decoration(reply: &str) -> &str {
    reply.trim_start_matches(|c: char| c.is_whitespace() || matches!(c, '*' | '#' | '_' | '`' | '>'))
}

fn strip_keyword<'a>(body: &'a str, upper: &str, keyword: &str) -> Option<&'a str> {
    if !upper.starts_with(keyword) {
        return None;
    }
    let rest = &body[keyword.len()..];
    // "ANSWER CORRECTION" is not a verdict.
    if rest.starts_with(|c: char| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(trim_separator(rest))
}

fn trim_separator(rest: &str) -> &str {
    rest.trim_start_matches(|c: char| {
        c.is_whitespace() || matches!(c, '*' | '_' | '`' | ':' | '-' | '.' | ',' | '!')
    })
    .trim_end()
}
