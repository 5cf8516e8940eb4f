/// Explicit runtime configuration for the services layer.
///
/// Supplied by the host at construction time; nothing in here is read from
/// process-wide state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceConfig {
    /// Page size used when a caller supplies only a page number.
    pub default_page_size: u32,
    /// Days a soft-deleted node survives before the purge may remove it.
    pub deleted_retention_days: i64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            default_page_size: 20,
            deleted_retention_days: 30,
        }
    }
}
