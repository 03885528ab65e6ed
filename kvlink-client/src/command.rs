//! # Command Builder
//!
//! A command is an ordered list of byte-string arguments, verb first. Typed
//! values are coerced to text explicitly when they are pushed.

use std::fmt;

use bytes::{Bytes, BytesMut};

use crate::resp::encode_command;

/// One request, built per call and consumed by encoding.
#[derive(Clone, PartialEq, Eq)]
pub struct Command {
    args: Vec<Bytes>,
}

impl Command {
    /// Starts a command with its verb.
    pub fn new(verb: impl AsRef<[u8]>) -> Self {
        Command {
            args: vec![Bytes::copy_from_slice(verb.as_ref())],
        }
    }

    /// Appends a text or binary argument.
    pub fn arg(mut self, value: impl AsRef<[u8]>) -> Self {
        self.push(value);
        self
    }

    /// Appends an integer argument in decimal form.
    pub fn arg_int(mut self, value: i64) -> Self {
        self.push_int(value);
        self
    }

    /// Appends every item of a key or value list, in order.
    pub fn args<I>(mut self, values: I) -> Self
    where
        I: IntoIterator,
        I::Item: AsRef<[u8]>,
    {
        for value in values {
            self.push(value);
        }
        self
    }

    pub fn push(&mut self, value: impl AsRef<[u8]>) {
        self.args.push(Bytes::copy_from_slice(value.as_ref()));
    }

    pub fn push_int(&mut self, value: i64) {
        self.args.push(Bytes::from(value.to_string()));
    }

    /// Verb followed by its arguments.
    pub fn as_args(&self) -> &[Bytes] {
        &self.args
    }

    pub fn verb(&self) -> String {
        String::from_utf8_lossy(&self.args[0]).into_owned()
    }

    /// Appends the wire form of this command to `out`.
    pub fn encode(&self, out: &mut BytesMut) {
        encode_command(&self.args, out);
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_list();
        for arg in &self.args {
            list.entry(&String::from_utf8_lossy(arg));
        }
        list.finish()
    }
}
