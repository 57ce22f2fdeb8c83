//! Metric names shared across the bundler crates.
//!
//! Recorded through the `metrics` facade; nothing is exported unless the
//! host installs a recorder.

/// Upstream connection metrics
pub mod upstream {
    /// Connection attempts started, labelled by `alias`
    pub const CONNECTION_ATTEMPTS_TOTAL: &str = "mcp_bundler_upstream_connection_attempts_total";
    /// Connection attempts that failed, labelled by `alias`
    pub const CONNECTION_FAILURES_TOTAL: &str = "mcp_bundler_upstream_connection_failures_total";
    /// Background reconnects that succeeded, labelled by `alias`
    pub const RECONNECTS_TOTAL: &str = "mcp_bundler_upstream_reconnects_total";
}

/// Router metrics
pub mod router {
    /// Forwarded tool calls
    pub const TOOL_CALLS_TOTAL: &str = "mcp_bundler_tool_calls_total";
    /// Tool calls that ended in an error result
    pub const TOOL_CALL_ERRORS_TOTAL: &str = "mcp_bundler_tool_call_errors_total";
    /// Tool call duration in seconds
    pub const TOOL_CALL_DURATION_SECONDS: &str = "mcp_bundler_tool_call_duration_seconds";
    /// Forwarded `prompts/get` calls
    pub const PROMPT_FETCHES_TOTAL: &str = "mcp_bundler_prompt_fetches_total";
    /// Forwarded or local `resources/read` calls
    pub const RESOURCE_READS_TOTAL: &str = "mcp_bundler_resource_reads_total";
    /// Large responses written to a temp file
    pub const SPILL_FILES_TOTAL: &str = "mcp_bundler_spill_files_total";
    /// Calls retried after a stale-session error
    pub const STALE_SESSION_RETRIES_TOTAL: &str = "mcp_bundler_stale_session_retries_total";
}

/// Snapshot metrics
pub mod snapshot {
    /// Snapshot rebuilds
    pub const REBUILDS_TOTAL: &str = "mcp_bundler_snapshot_rebuilds_total";
    /// Integrity warnings raised while aggregating
    pub const INTEGRITY_WARNINGS_TOTAL: &str = "mcp_bundler_snapshot_integrity_warnings_total";
}
