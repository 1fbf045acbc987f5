//!  Persistence is organized through [ledger::TimeLedgerImpl].
//!  The basic idea is:
//!   - There is an application directory holding everything.
//!   - User profiles (rate, goal, accumulated earnings) live in a single `profiles.json`.
//!   - Logged time is appended to a per-user record file as json lines.

pub mod entities;
pub mod ledger;
