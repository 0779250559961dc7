//! Backend failure reporting with a per-(identity, endpoint) cool-down.

use crate::clock::Clock;
use crate::rate_limit_config::Rule;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Destination for operator-facing failure messages.
pub trait Notifier: Send + Sync {
    fn notify(&self, message: &str);
}

/// Writes notifications to the log.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, message: &str) {
        tracing::error!(target: "gatekeeper::notification", "{}", message);
    }
}

/// Forwards backend failures to a [`Notifier`], at most once per
/// (identity, endpoint) per cool-down.
pub struct ErrorNotifier {
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    cooldown: Duration,
    last_sent: Mutex<HashMap<String, i64>>,
}

impl ErrorNotifier {
    pub fn new(notifier: Arc<dyn Notifier>, clock: Arc<dyn Clock>, cooldown: Duration) -> Self {
        Self {
            notifier,
            clock,
            cooldown,
            last_sent: Mutex::new(HashMap::new()),
        }
    }

    /// Returns `true` if a message was sent.
    pub fn report(&self, error: &str, identity: &str, endpoint: &str, rule: &Rule) -> bool {
        let now = self.clock.now_millis();
        let cooldown_ms = self.cooldown.as_millis() as i64;
        let key = format!("{}:{}", identity, endpoint);

        {
            let Ok(mut last_sent) = self.last_sent.lock() else {
                return false;
            };

            if last_sent
                .get(&key)
                .is_some_and(|&sent| now - sent < cooldown_ms)
            {
                return false;
            }

            last_sent.retain(|_, sent| now - *sent < cooldown_ms);
            last_sent.insert(key, now);
        }

        let rule_json = serde_json::to_string(rule).unwrap_or_default();
        self.notifier.notify(&format!(
            "Error: {}, Identity: {}, Endpoint: {}, Rule: {}, Timestamp: {}",
            error, identity, endpoint, rule_json, now
        ));
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[derive(Default)]
    struct Recorder {
        messages: Mutex<Vec<String>>,
    }

    impl Notifier for Recorder {
        fn notify(&self, message: &str) {
            self.messages.lock().unwrap().push(message.to_string());
        }
    }

    #[test]
    fn test_cooldown_per_identity_and_endpoint() {
        let clock = ManualClock::new(0);
        let recorder = Arc::new(Recorder::default());
        let notifier = ErrorNotifier::new(
            recorder.clone(),
            Arc::new(clock.clone()),
            Duration::from_secs(30),
        );
        let rule = Rule::fixed_window("/x", 1, 1);

        assert!(notifier.report("boom", "a", "/x", &rule));
        assert!(!notifier.report("boom", "a", "/x", &rule));
        assert!(notifier.report("boom", "b", "/x", &rule));

        clock.advance(Duration::from_secs(30));
        assert!(notifier.report("boom", "a", "/x", &rule));

        let messages = recorder.messages.lock().unwrap();
        assert_eq!(messages.len(), 3);
        assert!(messages[0].contains("Endpoint: /x"));
    }
}
