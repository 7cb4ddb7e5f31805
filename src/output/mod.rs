pub mod formatters;
pub mod senders;

pub use formatters::{ConsoleFormatter, CsvFormatter, DataFormatter, JsonFormatter};
pub use senders::{ConsoleSender, DataSender, FileSender};

use log::{info, warn};

use crate::services::broadcaster::Subscription;

/// Pumps a subscription through `formatter` into every sender until the
/// subscription closes. Returns the number of events delivered.
pub async fn forward(
    mut subscription: Subscription,
    formatter: &dyn DataFormatter,
    senders: &[Box<dyn DataSender>],
) -> usize {
    let mut delivered = 0;

    let header = formatter.format_header();
    if !header.is_empty() {
        for sender in senders {
            if let Err(e) = sender.send(&header).await {
                warn!("⚠️  {} sender {} failed: {}", sender.sender_type(), sender.destination(), e);
            }
        }
    }

    while let Some(event) = subscription.recv().await {
        let line = formatter.format_event(&event);
        for sender in senders {
            if let Err(e) = sender.send(&line).await {
                warn!("⚠️  {} sender {} failed: {}", sender.sender_type(), sender.destination(), e);
            }
        }
        delivered += 1;
    }

    info!("📭 Event stream closed after {} event(s)", delivered);
    delivered
}
