//! Replay of recorded browser events
//!
//! The event log is JSON lines, one [`BrowserEvent`] per line in the same
//! shape the extension sends (`{"type": "navigationAttempt", ...}`). Blank
//! lines and lines starting with `#` are ignored. The service clock follows
//! the event timestamps, so a replay of a whole day accrues and locks
//! exactly as the extension would have.

use std::fs;

use log::{debug, info};
use tb_core::{BrowserEvent, Clock, Message, Millis, Reply};

use crate::{block_on, open, print_overview, Context};

/// Parse an event log. Errors name the offending line.
pub fn parse_events(text: &str) -> Result<Vec<BrowserEvent>, String> {
    text.lines()
        .enumerate()
        .filter(|(_, line)| {
            let line = line.trim();
            !line.is_empty() && !line.starts_with('#')
        })
        .map(|(index, line)| {
            serde_json::from_str(line).map_err(|e| format!("line {}: {}", index + 1, e))
        })
        .collect()
}

pub fn run_replay(ctx: &Context, path: &str) -> Result<(), String> {
    let text = fs::read_to_string(path).map_err(|e| format!("Failed to read '{}': {}", path, e))?;
    let events = parse_events(&text)?;
    let Some(first) = events.first() else {
        return Err(format!("'{}' holds no events", path));
    };
    let start: Millis = first.timestamp();
    info!("Replaying {} events from {}", events.len(), path);

    let reply = block_on(async {
        let (service, clock) = open(ctx, Some(start)).await;
        for event in &events {
            // Time never runs backwards for the service
            if event.timestamp() > clock.now() {
                clock.set(event.timestamp());
                service.tick().await;
            }
            debug!("Event: {:?}", event);
            service.handle_event(event).await;
        }
        service.tick().await;
        let reply = service.handle_message(&Message::GetOverview).await;
        service.shutdown().await;
        reply
    })?;

    match reply {
        Reply::Overview { overview } => {
            print_overview(&overview);
            Ok(())
        }
        other => Err(format!("Unexpected reply: {:?}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_events_skips_comments_and_blanks() {
        let text = r#"
# morning
{"type": "tabNavigatedComplete", "tabId": 1, "hostname": "example.com", "timestamp": 1000}

{"type": "tabBecameActive", "tabId": 1, "timestamp": 1000}
"#;
        let events = parse_events(text).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].tab_id(), 1);
        assert_eq!(events[1].timestamp(), 1000);
    }

    #[test]
    fn test_parse_events_reports_line() {
        let text = "{\"type\": \"tabClosed\", \"tabId\": 1, \"timestamp\": 5}\n{\"type\": \"bogus\"}\n";
        let err = parse_events(text).unwrap_err();
        assert!(err.starts_with("line 2:"), "{}", err);
    }
}
