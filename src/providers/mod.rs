//! External mail service integrations.
//!
//! - [`email`] - Gmail, Microsoft Graph, IMAP and SMTP adapters, OAuth and
//!   webhook handling

pub mod email;
