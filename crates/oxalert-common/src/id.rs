use snowflake::SnowflakeIdBucket;
use std::sync::Mutex;

/// Snowflake id source for scheduled notifications.
///
/// Each process should use a distinct `(machine_id, node_id)` pair, each in
/// `0..=31`, so ids stay unique across a cluster sharing one store.
pub struct IdGenerator {
    bucket: Mutex<SnowflakeIdBucket>,
}

impl IdGenerator {
    pub fn new(machine_id: i32, node_id: i32) -> Self {
        Self {
            bucket: Mutex::new(SnowflakeIdBucket::new(
                machine_id.clamp(0, 31),
                node_id.clamp(0, 31),
            )),
        }
    }

    /// Next id rendered as a decimal string.
    pub fn next_id(&self) -> String {
        let mut bucket = self
            .bucket
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        bucket.get_id().to_string()
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new(1, 1)
    }
}
