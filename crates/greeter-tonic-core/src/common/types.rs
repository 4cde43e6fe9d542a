//! # Greeting formatting rules
//!
//! Every reply produced by the service is derived from a name with a single
//! deterministic rule:
//!
//! ```text
//! format(name) = "Hello, " + name + "!"
//! ```
//!
//! Client-streaming calls apply the same rule to the comma-joined list of
//! names, and server-streaming calls append a 1-based sequence number.
//!
//! ## Functions
//!
//! - [`to_message`] - the base rule
//! - [`to_sequenced_message`] - the rule plus a `(sequence: i)` suffix
//! - [`join_names`] - joins accumulated names with `", "`
//! - [`build_reply`] - wraps a message into a [`GreetingReply`]

use crate::proto::GreetingReply;

/// Description attached to the `InvalidArgument` status returned for an empty
/// name.
pub const EMPTY_NAME_REASON: &str = "Name cannot be empty";

/// Separator used when joining names collected from a request stream.
pub const NAME_SEPARATOR: &str = ", ";

/// Formats the greeting for `name`.
pub fn to_message(name: &str) -> String {
    format!("Hello, {name}!")
}

/// Formats the greeting for `name` tagged with a 1-based `sequence` number.
pub fn to_sequenced_message(name: &str, sequence: u32) -> String {
    format!("{} (sequence: {sequence})", to_message(name))
}

/// Joins names in arrival order.
pub fn join_names<S: AsRef<str>>(names: &[S]) -> String {
    let mut joined = String::new();
    for (i, name) in names.iter().enumerate() {
        if i > 0 {
            joined.push_str(NAME_SEPARATOR);
        }
        joined.push_str(name.as_ref());
    }
    joined
}

/// Wraps an already formatted message into a reply.
pub fn build_reply(message: impl Into<String>) -> GreetingReply {
    GreetingReply {
        message: message.into(),
    }
}

/// Shorthand for `build_reply(to_message(name))`.
pub fn greeting_for(name: &str) -> GreetingReply {
    build_reply(to_message(name))
}
