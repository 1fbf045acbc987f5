//! Conversational tracker of worked time and earnings. Durations arrive as plain text,
//! quick-pick buttons or forwarded "timer stopped" notifications; forwarded batches are
//! debounced into a single confirmation before anything is committed to the ledger.
//!

pub mod bot;
pub mod cli;
pub mod storage;
pub mod utils;
