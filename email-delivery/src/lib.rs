pub mod mailer;
pub mod templates;

pub use mailer::{SmtpConfig, SmtpMailer, TlsMode};
pub use templates::{news_summary_email, welcome_email};
