//! Per-plugin log capture and the audit trail.

pub mod audit;
pub mod manager;
pub mod ring_buffer;

pub use audit::{default_audit_log_path, AuditAction, AuditEntry, AuditLogger, AuditResult};
pub use manager::LogManager;
pub use ring_buffer::LogRingBuffer;
