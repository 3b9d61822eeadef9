pub const HISTORY_TABLE_NAME: &str = "HistoryEntries";
pub const NAMESPACE: &str = "namespace";
pub const ENTRY_KEY: &str = "entry_key";
pub const FIELDS: &str = "fields";
