use chrono::{DateTime, Utc};

/// Generates unique, time ordered child keys.
///
/// A key is 12 hex digits of milliseconds since the epoch followed by a 16 hex
/// digit counter. The counter starts at a random value and goes up by one per
/// key, so keys from one generator never repeat, and keys for the same
/// millisecond sort in the order they were handed out.
pub struct PushKeyGenerator {
    counter: u64,
}

impl PushKeyGenerator {
    pub fn new() -> Self {
        Self {
            // Top bit cleared so the counter cannot overflow in practice.
            counter: rand::random::<u64>() >> 1,
        }
    }

    pub fn next_key(&mut self) -> String {
        self.key_for(Utc::now())
    }

    /// Key for an entry stamped `timestamp`. An entry with a later timestamp
    /// always gets a key that sorts later, whatever order the keys are made in.
    pub fn key_for(&mut self, timestamp: DateTime<Utc>) -> String {
        let millis = u64::try_from(timestamp.timestamp_millis()).unwrap_or(0);
        self.counter = self.counter.wrapping_add(1);

        let mut key = format!("{:012x}", millis);
        key.push_str(&hex::encode(self.counter.to_be_bytes()));
        key
    }
}

impl Default for PushKeyGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[test]
fn keys_strictly_increase_within_a_millisecond() {
    let mut generator = PushKeyGenerator::new();
    let now = Utc::now();
    let mut previous = generator.key_for(now);
    for _ in 0..1000 {
        let key = generator.key_for(now);
        assert_eq!(key.len(), 28);
        assert!(key > previous, "{key} <= {previous}");
        previous = key;
    }
}

#[test]
fn keys_follow_timestamps_not_call_order() {
    let mut generator = PushKeyGenerator::new();
    let now = Utc::now();
    let later = generator.key_for(now);
    let earlier = generator.key_for(now - chrono::Duration::seconds(5));
    assert!(earlier < later);
    assert_ne!(earlier[..12], later[..12]);
}

#[test]
fn keys_from_separate_generators_differ() {
    let now = Utc::now();
    assert_ne!(PushKeyGenerator::new().key_for(now), PushKeyGenerator::new().key_for(now));
}
