//! Outbound email. Delivery happens after the triggering transaction has
//! committed, so a failure here is logged and never undoes the change.

use crate::{config::Config, models::Invitation};
use lettre::{
    message::Mailbox, transport::smtp::authentication::Credentials, Address, AsyncSmtpTransport,
    AsyncTransport, Message, Tokio1Executor,
};
use uuid::Uuid;

#[derive(Clone)]
struct Smtp {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

/// Cheap to clone; shared through an axum `Extension`.
#[derive(Clone)]
pub struct Mailer {
    smtp: Option<Smtp>,
    frontend_host: String,
}

impl Mailer {
    /// Email is disabled when SMTP credentials are absent.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let frontend_host = config.frontend_host.trim_end_matches('/').to_string();
        let (Some(username), Some(password)) = (&config.email_username, &config.email_password) else {
            tracing::info!("EMAIL_USERNAME/EMAIL_PASSWORD not set, invitation emails are disabled");
            return Ok(Mailer::disabled(frontend_host));
        };

        let address = username
            .parse::<Address>()
            .map_err(|e| anyhow::anyhow!("EMAIL_USERNAME is not a valid address: {e}"))?;
        let transport = AsyncSmtpTransport::<Tokio1Executor>::relay(&config.smtp_relay)?
            .credentials(Credentials::new(username.clone(), password.clone()))
            .build();

        Ok(Mailer {
            smtp: Some(Smtp {
                transport,
                from: Mailbox::new(Some("Moto Club Hub".to_string()), address),
            }),
            frontend_host,
        })
    }

    pub fn disabled(frontend_host: impl Into<String>) -> Self {
        Mailer {
            smtp: None,
            frontend_host: frontend_host.into(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.smtp.is_some()
    }

    pub fn invitation_link(&self, token: Uuid) -> String {
        format!("{}/invitations/{token}", self.frontend_host)
    }

    /// Startup probe of the relay; only logs.
    pub async fn sanity_check(&self) {
        let Some(smtp) = &self.smtp else { return };
        match smtp.transport.test_connection().await {
            Ok(true) => tracing::debug!("smtp relay reachable"),
            Ok(false) | Err(_) => {
                tracing::warn!("smtp relay check failed, invitation emails may not be delivered")
            }
        }
    }

    fn invitation_message(
        &self,
        from: Mailbox,
        invitation: &Invitation,
        club_name: &str,
    ) -> anyhow::Result<Message> {
        let to = Mailbox::new(
            Some(invitation.first_name.clone()),
            invitation.email.parse::<Address>()?,
        );
        let mut body = format!(
            "Hi {},\n\nYou have been invited to join {club_name}.\n",
            invitation.first_name
        );
        if !invitation.message.trim().is_empty() {
            body.push_str(&format!("\n{}\n", invitation.message.trim()));
        }
        body.push_str(&format!(
            "\nAccept or decline here: {}\n\nThis invitation expires on {}.\n",
            self.invitation_link(invitation.token),
            invitation.expires_at.format("%Y-%m-%d"),
        ));

        Ok(Message::builder()
            .from(from.clone())
            .reply_to(from)
            .to(to)
            .subject(format!("You're invited to {club_name}"))
            .body(body)?)
    }

    /// Returns whether the message was handed to the relay.
    pub async fn send_invitation(&self, invitation: &Invitation, club_name: &str) -> bool {
        let Some(smtp) = &self.smtp else {
            tracing::info!(
                invitation_id = invitation.id,
                link = %self.invitation_link(invitation.token),
                "email disabled, invitation not sent"
            );
            return false;
        };

        let message = match self.invitation_message(smtp.from.clone(), invitation, club_name) {
            Ok(message) => message,
            Err(err) => {
                tracing::warn!(invitation_id = invitation.id, error = %err, "could not build invitation email");
                return false;
            }
        };
        match smtp.transport.send(message).await {
            Ok(_) => {
                tracing::info!(invitation_id = invitation.id, "invitation email sent");
                true
            }
            Err(err) => {
                tracing::warn!(invitation_id = invitation.id, error = %err, "failed to send invitation email");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{InvitationStatus, MemberRole};
    use chrono::Utc;

    fn invitation() -> Invitation {
        Invitation {
            id: 1,
            email: "rider@example.com".to_string(),
            first_name: "Ana".to_string(),
            last_name: None,
            club_id: 1,
            chapter_id: 1,
            role: MemberRole::Member,
            invited_by: Some(2),
            message: "See you at the Sunday ride".to_string(),
            token: Uuid::nil(),
            status: InvitationStatus::Pending,
            member_id: Some(3),
            created_at: Utc::now(),
            expires_at: Utc::now(),
            accepted_at: None,
        }
    }

    #[test]
    fn links_point_at_the_frontend() {
        let mailer = Mailer::disabled("https://clubs.example.com");
        assert_eq!(
            mailer.invitation_link(Uuid::nil()),
            "https://clubs.example.com/invitations/00000000-0000-0000-0000-000000000000"
        );
        assert!(!mailer.is_enabled());
    }

    #[test]
    fn message_carries_link_and_note() {
        let mailer = Mailer::disabled("https://clubs.example.com");
        let from = Mailbox::new(None, "hub@example.com".parse().unwrap());
        let message = mailer
            .invitation_message(from, &invitation(), "Desert Riders MC")
            .unwrap();
        let raw = String::from_utf8(message.formatted()).unwrap();
        assert!(raw.contains("Desert Riders MC"));
        assert!(raw.contains("/invitations/00000000-0000-0000-0000-000000000000"));
        assert!(raw.contains("Sunday ride"));
    }

    #[tokio::test]
    async fn disabled_mailer_does_not_send() {
        let mailer = Mailer::disabled("http://localhost:3000");
        assert!(!mailer.send_invitation(&invitation(), "Desert Riders MC").await);
    }
}
