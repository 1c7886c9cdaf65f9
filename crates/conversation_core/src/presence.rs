use std::{collections::HashMap, time::Duration};

use chrono::{DateTime, Utc};
use shared::domain::{Participant, TypingSignal, UserId};

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

/// Outbound side of the typing channel: throttles broadcasts while the user
/// types and reports when the idle self-timeout elapses.
#[derive(Debug, Clone)]
pub struct TypingBroadcaster {
    author: Participant,
    timeout: chrono::Duration,
    throttle: chrono::Duration,
    idle: chrono::Duration,
    last_sent: Option<DateTime<Utc>>,
    last_keystroke: Option<DateTime<Utc>>,
}

impl TypingBroadcaster {
    pub fn new(author: Participant, timeout: Duration, throttle: Duration, idle: Duration) -> Self {
        Self {
            author,
            timeout: to_chrono(timeout),
            throttle: to_chrono(throttle),
            idle: to_chrono(idle),
            last_sent: None,
            last_keystroke: None,
        }
    }

    pub fn is_typing(&self) -> bool {
        self.last_keystroke.is_some()
    }

    /// Returns the signal to broadcast, if the throttle allows one.
    pub fn on_keystroke(&mut self, now: DateTime<Utc>) -> Option<TypingSignal> {
        self.last_keystroke = Some(now);
        let due = self
            .last_sent
            .map_or(true, |sent| now - sent >= self.throttle);
        if !due {
            return None;
        }
        self.last_sent = Some(now);
        Some(TypingSignal {
            user_id: self.author.user_id.clone(),
            display_name: self.author.display_name.clone(),
            expires_at: now + self.timeout,
        })
    }

    /// True exactly once after the user stopped typing for the idle period.
    pub fn poll_idle(&mut self, now: DateTime<Utc>) -> bool {
        match self.last_keystroke {
            Some(last) if now - last >= self.idle => {
                self.reset();
                true
            }
            _ => false,
        }
    }

    /// Sending a message ends the typing burst; returns whether a stop should
    /// be broadcast.
    pub fn on_message_sent(&mut self) -> bool {
        let was_typing = self.is_typing();
        self.reset();
        was_typing
    }

    fn reset(&mut self) {
        self.last_keystroke = None;
        self.last_sent = None;
    }
}

/// Inbound side: remembers the latest signal per remote user. "Typing" means
/// `expires_at > now`, whether or not a stop was ever received.
///
/// A signal never outlives `timeout` from the moment it was received, so a
/// sender whose clock runs ahead cannot pin the indicator on.
#[derive(Debug, Clone)]
pub struct TypingRoster {
    self_id: UserId,
    timeout: chrono::Duration,
    signals: HashMap<UserId, TypingSignal>,
}

impl TypingRoster {
    pub fn new(self_id: UserId, timeout: Duration) -> Self {
        Self {
            self_id,
            timeout: to_chrono(timeout),
            signals: HashMap::new(),
        }
    }

    pub fn receive(&mut self, mut signal: TypingSignal, now: DateTime<Utc>) -> bool {
        if signal.user_id == self.self_id {
            return false;
        }
        if let Some(cap) = now.checked_add_signed(self.timeout) {
            signal.expires_at = signal.expires_at.min(cap);
        }
        match self.signals.get_mut(&signal.user_id) {
            Some(existing) if existing.expires_at >= signal.expires_at => false,
            Some(existing) => {
                *existing = signal;
                true
            }
            None => {
                self.signals.insert(signal.user_id.clone(), signal);
                true
            }
        }
    }

    pub fn receive_stop(&mut self, user_id: &UserId) -> bool {
        self.signals.remove(user_id).is_some()
    }

    pub fn is_typing(&self, user_id: &UserId, now: DateTime<Utc>) -> bool {
        self.signals
            .get(user_id)
            .is_some_and(|signal| signal.is_active(now))
    }

    pub fn typing_users(&self, now: DateTime<Utc>) -> Vec<&TypingSignal> {
        let mut active: Vec<&TypingSignal> = self
            .signals
            .values()
            .filter(|signal| signal.is_active(now))
            .collect();
        active.sort_by(|a, b| {
            a.display_name
                .cmp(&b.display_name)
                .then_with(|| a.user_id.cmp(&b.user_id))
        });
        active
    }

    pub fn prune(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.signals.len();
        self.signals.retain(|_, signal| signal.is_active(now));
        before - self.signals.len()
    }

    pub fn clear(&mut self) {
        self.signals.clear();
    }

    pub fn describe(&self, now: DateTime<Utc>) -> Option<String> {
        let names: Vec<&str> = self
            .typing_users(now)
            .into_iter()
            .map(|signal| signal.display_name.as_str())
            .collect();
        match names.as_slice() {
            [] => None,
            [one] => Some(format!("{one} is typing...")),
            [a, b] => Some(format!("{a} and {b} are typing...")),
            [first, rest @ ..] => Some(format!("{first} and {} others are typing...", rest.len())),
        }
    }
}
