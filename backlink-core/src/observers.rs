use std::fmt;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;

use backlink_common::{AgentId, EventHub};
use time::format_description::FormatItem;
use time::macros::format_description;
use time::OffsetDateTime;
use tracing::*;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::Connected => write!(f, "connected"),
            ConnectionStatus::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// Agent state transition published through the connection-state hub.
#[derive(Clone, Debug)]
pub struct ConnectionEvent {
    pub status: ConnectionStatus,
    pub id: AgentId,
    pub ip: String,
    pub host_name: String,
    pub version: String,
    pub timestamp: OffsetDateTime,
}

pub type ConnectionEvents = EventHub<ConnectionEvent>;

const WATCH_TIMESTAMP: &[FormatItem<'_>] =
    format_description!("[year]/[month]/[day] [hour]:[minute]:[second]");

pub fn format_watch_line(event: &ConnectionEvent) -> String {
    let arrow = match event.status {
        ConnectionStatus::Connected => "<-",
        ConnectionStatus::Disconnected => "->",
    };
    let timestamp = event
        .timestamp
        .format(WATCH_TIMESTAMP)
        .unwrap_or_else(|_| String::from("-"));
    format!(
        "{} {} {} ({} {}) {} {}\n",
        timestamp, arrow, event.host_name, event.ip, event.id, event.version, event.status
    )
}

/// Register the watch-log sink: one line per agent state transition,
/// appended with a fresh file handle per event.
pub async fn install_watch_log(events: &ConnectionEvents, path: PathBuf) {
    events
        .subscribe(move |event: &ConnectionEvent| {
            let line = format_watch_line(event);
            let result = std::fs::OpenOptions::new()
                .append(true)
                .create(true)
                .mode(0o600)
                .open(&path)
                .and_then(|mut f| f.write_all(line.as_bytes()));
            if let Err(error) = result {
                warn!(%error, path = %path.display(), "Unable to append to watch log");
            }
        })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(status: ConnectionStatus) -> ConnectionEvent {
        ConnectionEvent {
            status,
            id: uuid::Uuid::nil(),
            ip: "1.2.3.4:55000".into(),
            host_name: "bob".into(),
            version: "SSH-2.0-OpenSSH_9.0".into(),
            timestamp: OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap(),
        }
    }

    #[test]
    fn test_watch_line_format() {
        let line = format_watch_line(&event(ConnectionStatus::Connected));
        assert_eq!(
            line,
            "2023/11/14 22:13:20 <- bob (1.2.3.4:55000 00000000-0000-0000-0000-000000000000) SSH-2.0-OpenSSH_9.0 connected\n"
        );

        let line = format_watch_line(&event(ConnectionStatus::Disconnected));
        assert!(line.contains(" -> "));
        assert!(line.ends_with("disconnected\n"));
    }

    #[tokio::test]
    async fn test_watch_log_appends_per_event() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("watch.log");
        let events = ConnectionEvents::new();
        install_watch_log(&events, path.clone()).await;

        events.notify(&event(ConnectionStatus::Connected)).await;
        events.notify(&event(ConnectionStatus::Disconnected)).await;

        let content = std::fs::read_to_string(&path).unwrap();
        let lines = content.lines().collect::<Vec<_>>();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("<-"));
        assert!(lines[1].contains("->"));

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
