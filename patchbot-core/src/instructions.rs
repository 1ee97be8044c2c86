use crate::feedback::{ReviewComment, ReviewFeedback};

/// Fixed preamble telling the agent how to behave in the checkout.
pub fn get_system_instructions() -> String {
    include_str!("../prompt.txt").to_string()
}

/// Build the full instruction text handed to the agent on stdin.
///
/// Only comments present in `feedback` are included, so callers remove
/// already-addressed comments before calling this.
pub fn build_instructions(feedback: &ReviewFeedback) -> String {
    let mut text = get_system_instructions();

    text.push_str(&format!(
        "\nPull request: {} \"{}\"\nBranch: {}\nReviewer: {} ({})\n",
        feedback.subject_id,
        feedback.subject_title,
        feedback.branch_name,
        feedback.reviewer_id,
        feedback.review_state
    ));

    if feedback.has_review_body() {
        text.push_str("\nREVIEW SUMMARY BEGINS:\n");
        text.push_str(feedback.review_body.as_deref().unwrap_or_default().trim());
        text.push_str("\nREVIEW SUMMARY ENDS\n");
    }

    let actionable: Vec<&ReviewComment> = feedback.actionable_comments().collect();
    if !actionable.is_empty() {
        text.push_str("\nCOMMENTS TO ADDRESS:\n");
        for (index, comment) in actionable.iter().enumerate() {
            push_comment(&mut text, index + 1, comment);
        }
    }

    let replies: Vec<&ReviewComment> = feedback.reply_comments().collect();
    if !replies.is_empty() {
        text.push_str("\nDISCUSSION REPLIES (context only, no separate action needed):\n");
        for reply in replies {
            text.push_str(&format!(
                "\n- {} on {}: {}\n",
                reply.author_id,
                location(reply),
                reply.body.trim()
            ));
        }
    }

    text
}

fn push_comment(text: &mut String, ordinal: usize, comment: &ReviewComment) {
    text.push_str(&format!(
        "\n=== Comment {} (id {}) at {} by {} ===\n",
        ordinal,
        comment.id,
        location(comment),
        comment.author_id
    ));
    if !comment.diff_context.trim().is_empty() {
        text.push_str("```diff\n");
        text.push_str(comment.diff_context.trim_end());
        text.push_str("\n```\n");
    }
    text.push_str(comment.body.trim());
    text.push('\n');
}

fn location(comment: &ReviewComment) -> String {
    match comment.line_number {
        Some(line) => format!("{}:{}", comment.file_path, line),
        None => comment.file_path.clone(),
    }
}
