use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::info;

use super::capabilities::Notifiable;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Welcome { username: String },
}

impl Notification {
    pub fn subject(&self) -> &'static str {
        match self {
            Notification::Welcome { .. } => "Welcome aboard",
        }
    }

    pub fn body(&self) -> String {
        match self {
            Notification::Welcome { username } => {
                format!("Hello {username}, your account is ready.")
            }
        }
    }
}

/// Delivers notifications to a mail address.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, to: &str, notification: &Notification) -> anyhow::Result<()>;

    async fn notify(
        &self,
        notifiable: &(dyn Notifiable + Sync),
        notification: Notification,
    ) -> anyhow::Result<()> {
        self.send(notifiable.route_notification_for_mail(), &notification)
            .await
    }
}

/// Logs notifications instead of delivering them.
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn send(&self, to: &str, notification: &Notification) -> anyhow::Result<()> {
        info!(to, subject = notification.subject(), "notification queued");
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryNotifier {
    sent: RwLock<Vec<(String, Notification)>>,
}

impl MemoryNotifier {
    pub async fn sent(&self) -> Vec<(String, Notification)> {
        self.sent.read().await.clone()
    }
}

#[async_trait]
impl Notifier for MemoryNotifier {
    async fn send(&self, to: &str, notification: &Notification) -> anyhow::Result<()> {
        self.sent
            .write()
            .await
            .push((to.to_owned(), notification.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::users::model::User;
    use uuid::Uuid;

    #[tokio::test]
    async fn notify_routes_to_the_user_email() {
        let mut user = User::new(Uuid::new_v4());
        user.email = "john@example.com".into();
        let notifier = MemoryNotifier::default();
        notifier
            .notify(&user, Notification::Welcome { username: "jdoe".into() })
            .await
            .unwrap();

        let sent = notifier.sent().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "john@example.com");
        assert!(sent[0].1.body().contains("jdoe"));
    }
}
