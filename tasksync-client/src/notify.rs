use tasksync_core::protocol::NotificationTemplate;
use tasksync_core::SyncResult;

/// Push-notification capability. Delivery is someone else's job; the engine
/// only hands over recipients and a template and logs failures.
pub trait Notifier: Send + Sync {
    fn notify(&self, recipients: &[String], template: &NotificationTemplate) -> SyncResult<()>;
}

/// Writes notifications to the log instead of delivering them.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, recipients: &[String], template: &NotificationTemplate) -> SyncResult<()> {
        tracing::info!(
            "NOTIFY: {} -> {} recipient(s) {:?}",
            template.kind,
            recipients.len(),
            template.data
        );
        Ok(())
    }
}
