use crate::prompts::{welcome_prompt, DEFAULT_WELCOME_INTRO};
use crate::step::StepExecutor;
use crate::types::{Mailer, Result, SignUpEvent, WelcomeOutcome};
use email_delivery::welcome_email;
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

pub const WELCOME_WORKFLOW: &str = "sign-up-email";

const INTRO_STEP: &str = "generate-welcome-intro";
const SEND_STEP: &str = "send-welcome-email";

/// Sends one personalized welcome email to a newly created user.
pub struct WelcomeWorkflow {
    executor: Arc<StepExecutor>,
    mailer: Arc<dyn Mailer>,
}

impl WelcomeWorkflow {
    pub fn new(executor: Arc<StepExecutor>, mailer: Arc<dyn Mailer>) -> Self {
        Self { executor, mailer }
    }

    pub async fn run(&self, run_id: Uuid, event: &SignUpEvent) -> Result<WelcomeOutcome> {
        let mut run = self.executor.begin_run(run_id, WELCOME_WORKFLOW).await?;

        let intro = self
            .executor
            .infer_ai(run_id, INTRO_STEP, &welcome_prompt(event))
            .await
            .unwrap_or_else(|| DEFAULT_WELCOME_INTRO.to_string());

        let email = welcome_email(&event.email, &event.name, &intro);
        let email = &email;
        let mailer = &self.mailer;
        let sent = self
            .executor
            .run(run_id, SEND_STEP, move || async move {
                mailer.send(email).await?;
                Ok::<_, anyhow::Error>(true)
            })
            .await;

        match sent {
            Ok(delivered) => {
                info!(%run_id, "Welcome email sent to {}", event.email);
                self.executor.finish_run(&mut run, None).await?;
                Ok(WelcomeOutcome { run, intro, delivered })
            }
            Err(e) => {
                error!(%run_id, "Welcome email to {} failed: {}", event.email, e);
                self.executor.finish_run(&mut run, Some(e.to_string())).await?;
                Ok(WelcomeOutcome {
                    run,
                    intro,
                    delivered: false,
                })
            }
        }
    }
}
