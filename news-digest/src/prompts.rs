use crate::types::{Article, Result, SignUpEvent};

pub const DEFAULT_WELCOME_INTRO: &str =
    "Thanks for joining Signalist. You now have the tools to track markets and make smarter moves.";

pub const NEWS_SUMMARY_EMAIL_PROMPT: &str = r#"You are a financial news editor writing the body of a daily market summary email.

Summarize the following news articles for a retail investor. Group related stories, lead with the
most market-moving items, and keep each point to one or two plain sentences. Mention ticker symbols
where an article is about a specific company. Do not give investment advice.

Return clean HTML suitable for embedding in an email body: use <h3> for section headings, <p> for
paragraphs and <ul>/<li> for bullet points, and link each story to its url with <a>. Do not include
<html>, <head> or <body> tags, and do not wrap the output in a code block.

News data:
{{newsData}}"#;

pub const PERSONALIZED_WELCOME_EMAIL_PROMPT: &str = r#"Write a short personalized introduction for a welcome email from Signalist, a stock market
tracking app. Address what the new user cares about based on their profile, in a warm and
professional tone.

User profile:
{{userProfile}}

Requirements:
- One paragraph, at most 40 words
- Plain text only, no greeting line and no sign-off
- Do not promise returns or give investment advice"#;

/// Prompt for a subscriber's news summary, with the articles as pretty JSON.
pub fn news_summary_prompt(articles: &[Article]) -> Result<String> {
    let news_data = serde_json::to_string_pretty(articles)?;
    Ok(NEWS_SUMMARY_EMAIL_PROMPT.replace("{{newsData}}", &news_data))
}

pub fn user_profile(event: &SignUpEvent) -> String {
    let field = |value: &str| match value.trim() {
        "" => "Not provided".to_string(),
        value => value.to_string(),
    };
    format!(
        "- Country: {}\n- Investment goals: {}\n- Risk tolerance: {}\n- Preferred industry: {}",
        field(&event.country),
        field(&event.investment_goals),
        field(&event.risk_tolerance),
        field(&event.preferred_industry),
    )
}

pub fn welcome_prompt(event: &SignUpEvent) -> String {
    PERSONALIZED_WELCOME_EMAIL_PROMPT.replace("{{userProfile}}", &user_profile(event))
}
