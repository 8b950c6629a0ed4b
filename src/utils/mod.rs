//! Utility modules.

pub mod file;
pub mod retry;
pub mod text;

pub use file::{calculate_checksum, detect_mime_type, is_text_file, read_file_content};
pub use retry::{RetryConfig, RetryResult, Retryable, with_retry};
pub use text::{estimate_tokens, sanitize_identifier, terms, word_count};
