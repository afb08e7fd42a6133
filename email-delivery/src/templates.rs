use interfaces::defs::OutgoingEmail;

pub const WELCOME_EMAIL_TEMPLATE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head><meta charset="UTF-8"><title>Welcome to Signalist</title></head>
<body style="margin:0;padding:0;background-color:#050505;font-family:Arial,sans-serif;color:#CCDADC;">
  <table role="presentation" width="100%" cellspacing="0" cellpadding="0" style="max-width:600px;margin:0 auto;padding:40px 24px;">
    <tr><td>
      <h1 style="color:#FDD458;font-size:24px;">Welcome aboard {{name}}</h1>
      <div style="font-size:16px;line-height:1.6;">{{intro}}</div>
      <p style="font-size:16px;line-height:1.6;">Here is what you can do right now:</p>
      <ul style="font-size:16px;line-height:1.6;">
        <li>Build your watchlist to keep track of your favourite stocks.</li>
        <li>Get a market summary in your inbox every day.</li>
      </ul>
      <p style="font-size:14px;color:#9ca3af;">You are receiving this email because you signed up for Signalist.</p>
    </td></tr>
  </table>
</body>
</html>
"#;

pub const NEWS_SUMMARY_EMAIL_TEMPLATE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head><meta charset="UTF-8"><title>Market News Summary Today</title></head>
<body style="margin:0;padding:0;background-color:#050505;font-family:Arial,sans-serif;color:#CCDADC;">
  <table role="presentation" width="100%" cellspacing="0" cellpadding="0" style="max-width:600px;margin:0 auto;padding:40px 24px;">
    <tr><td>
      <h1 style="color:#FDD458;font-size:24px;">Market News Summary Today</h1>
      <p style="font-size:14px;color:#9ca3af;">{{date}}</p>
      <div style="font-size:16px;line-height:1.6;">{{newsContent}}</div>
      <p style="font-size:14px;color:#9ca3af;">You are receiving this email because you subscribed to Signalist news updates.</p>
    </td></tr>
  </table>
</body>
</html>
"#;

const NO_NEWS_FALLBACK: &str = "No market news today.";

pub fn welcome_email(to: &str, name: &str, intro: &str) -> OutgoingEmail {
    let html_body = WELCOME_EMAIL_TEMPLATE
        .replace("{{name}}", &escape_html(name))
        .replace("{{intro}}", intro);

    OutgoingEmail {
        to: to.to_string(),
        subject: "Welcome to Signalist - your stock market toolkit is ready!".to_string(),
        html_body,
        text_body: "Thanks for joining Signalist".to_string(),
    }
}

/// `news_content` is HTML produced by the summarizer and is inserted as is.
pub fn news_summary_email(to: &str, date: &str, news_content: &str) -> OutgoingEmail {
    let content = if news_content.trim().is_empty() { NO_NEWS_FALLBACK } else { news_content };
    let html_body = NEWS_SUMMARY_EMAIL_TEMPLATE
        .replace("{{date}}", &escape_html(date))
        .replace("{{newsContent}}", content);

    OutgoingEmail {
        to: to.to_string(),
        subject: format!("Your Daily Market Summary — {}", date),
        html_body,
        text_body: "Today's market highlights from Signalist".to_string(),
    }
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}
